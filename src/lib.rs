//! Master side of an ASCII-framed serial command protocol for conversing
//! with an embedded device.
//!
//! The `sci_master` crate implements the full protocol stack: STX/ETX byte
//! framing with a byte-counted stream mode, the request/response dataframe
//! grammar, and the transfer controller that binds requests to responses,
//! reassembles fragmented command results and collects bulk upstreams. The
//! core is sans-IO: the host pushes received bytes in via
//! [`Master::receive`], drives the state machines with [`Master::step`] and
//! supplies the transmit path and the result callbacks at construction.
//!
//! # Example
//! This example wires a master to a blocking transmit hook and requests a
//! device variable; the decoded reply arrives through the [`ResultSink`].
//!
//! ```no_run
//! use sci_master::{Acknowledge, Master, ResultSink, SciResult, TransferAck, Value, WireTx};
//!
//! struct Uart;
//! impl WireTx for Uart {
//!     fn send_blocking(&mut self, data: &[u8]) -> SciResult<()> {
//!         // hand `data` to the UART driver
//!         Ok(())
//!     }
//! }
//!
//! struct App;
//! impl ResultSink for App {
//!     fn set_var(&mut self, _: Acknowledge, _: i16, _: u16) -> TransferAck {
//!         TransferAck::Success
//!     }
//!     fn get_var(&mut self, ack: Acknowledge, num: i16, value: Value, _: u16) -> TransferAck {
//!         println!("var {num}: {:#X} ({ack})", value.as_hex());
//!         TransferAck::Success
//!     }
//!     fn command(&mut self, _: Acknowledge, _: i16, _: &[Value], _: u16) -> TransferAck {
//!         TransferAck::Success
//!     }
//!     fn upstream(&mut self, _: i16, _: &[u8]) -> TransferAck {
//!         TransferAck::Success
//!     }
//! }
//!
//! # fn main() -> SciResult<()> {
//! let mut master = Master::builder().build(Box::new(App), Box::new(Uart))?;
//! master.request_get_var(1)?;
//! loop {
//!     master.step()?;
//!     // feed bytes from the device: master.receive(&buf[..n]);
//!     # break;
//! }
//! # Ok(())
//! # }
//! ```
//!
//! With the `sync` feature (default) the [`transport`] module supplies
//! ready-made serial and TCP adapters that own the poll loop; the `async`
//! feature mirrors them for tokio hosts.
use thiserror::Error;

pub(crate) mod ascii;
pub(crate) mod buffer;
pub mod config;
pub mod dataframe;
pub mod datalink;
pub mod master;
pub mod transfer;
#[cfg(any(feature = "sync", feature = "async"))]
pub mod transport;

pub use config::{MasterConfig, TxMode, ValueMode};
pub use dataframe::{Acknowledge, Request, RequestKind, Response, Value};
pub use datalink::{DebugHook, WireTx};
pub use master::{Master, MasterBuilder, ProtocolState};
pub use transfer::{ResultSink, TransferAck};

/// Errors surfaced by the protocol master.
#[derive(Error, Debug)]
pub enum Error {
    #[error("variable number is not representable on the wire")]
    VarNumberInvalid,
    #[error("value datatype does not match the requested view")]
    UnknownDatatype,
    #[error("no request identifier found in the response")]
    CommandIdentifierNotFound,
    #[error("identifier number conversion failed")]
    NumberConversionFailed,
    #[error("unknown acknowledge token")]
    AcknowledgeUnknown,
    #[error("response parameter conversion failed")]
    ParameterConversionFailed,
    #[error("device delivered more data than announced")]
    ExpectedDataLengthNotMet,
    #[error("rendered message exceeds the tx buffer capacity")]
    MessageExceedsTxBufferSize,
    #[error("feature is reserved but not implemented")]
    FeatureNotImplemented,
    #[error("protocol is not idle")]
    ProtocolBusy,
    #[error("transfer-scoped allocation failed")]
    TransferAllocationFailed,
    #[error("device did not reply within the deadline")]
    Timeout,
    #[error("{0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

pub type SciResult<T> = std::result::Result<T, Error>;
