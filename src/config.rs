// Contains types and constants restricting values related to the protocol
use crate::{Error, SciResult};
use derive_more;
use std::{ops::RangeInclusive, str::FromStr};

/// Frame start sentinel.
pub const STX: u8 = 0x02;
/// Frame end sentinel.
pub const ETX: u8 = 0x03;

/// Maximum number of values carried by one request or one response frame.
pub const MAX_VALUES: usize = 10;
/// Maximum number of digits rendered after the decimal point.
pub const FTOA_MAX_AFTERPOINT: usize = 5;
/// Number of debug hook slots selectable by the `Dbg<d>` trigger.
pub const NUM_DEBUG_HOOKS: usize = 10;

pub(crate) const DEFAULT_RX_PACKET_LENGTH: usize = 128;
pub(crate) const DEFAULT_TX_PACKET_LENGTH: usize = 128;
pub(crate) const PACKET_LENGTH_BOUNDS: RangeInclusive<usize> = 16..=4096;

/// Selects how the numeric id and the value list are rendered on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum ValueMode {
    /// Shrinking big-endian hex; values travel as raw `u32` bit patterns.
    #[default]
    Hex,
    /// Signed decimal via the float renderer; values travel as `f32`.
    Decimal,
}
impl FromStr for ValueMode {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            _ if s.eq_ignore_ascii_case("hex") => Ok(Self::Hex),
            _ if s.eq_ignore_ascii_case("decimal") => Ok(Self::Decimal),
            _ => Err(Error::InvalidConfig(format!(
                "Value mode is hex or decimal, got {}",
                s
            ))),
        }
    }
}

/// Selects how the transmit state machine hands bytes to the wire hook.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, derive_more::Display)]
pub enum TxMode {
    /// One blocking byte per `step()` tick.
    #[default]
    ByteByByte,
    /// Whole remaining payload per tick through the non-blocking hook,
    /// skipping ticks while the wire reports busy.
    Buffered,
}

/// Runtime configuration of one master instance, fixed at construction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MasterConfig {
    pub value_mode: ValueMode,
    pub tx_mode: TxMode,
    /// Capacity of the receive frame buffer in bytes.
    pub rx_capacity: usize,
    /// Capacity of the transmit frame buffer in bytes.
    pub tx_capacity: usize,
}
impl Default for MasterConfig {
    fn default() -> Self {
        Self {
            value_mode: ValueMode::default(),
            tx_mode: TxMode::default(),
            rx_capacity: DEFAULT_RX_PACKET_LENGTH,
            tx_capacity: DEFAULT_TX_PACKET_LENGTH,
        }
    }
}
impl MasterConfig {
    pub(crate) fn validate(&self) -> SciResult<()> {
        for (name, cap) in [("rx", self.rx_capacity), ("tx", self.tx_capacity)] {
            if !PACKET_LENGTH_BOUNDS.contains(&cap) {
                return Err(Error::InvalidConfig(format!(
                    "{} capacity out of range {}-{}, got {}",
                    name,
                    PACKET_LENGTH_BOUNDS.start(),
                    PACKET_LENGTH_BOUNDS.end(),
                    cap
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn value_mode_from_str() {
        assert_eq!(ValueMode::from_str("hex").unwrap(), ValueMode::Hex);
        assert_eq!(ValueMode::from_str("Decimal").unwrap(), ValueMode::Decimal);
        assert!(ValueMode::from_str("octal").is_err());
    }

    #[test]
    fn config_bounds() {
        assert!(MasterConfig::default().validate().is_ok());
        let cfg = MasterConfig {
            rx_capacity: 4,
            ..MasterConfig::default()
        };
        assert!(cfg.validate().is_err());
    }
}
