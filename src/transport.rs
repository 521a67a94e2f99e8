/* Adapters that drive the sans-IO master over real serial and TCP links. */

use std::time::Duration;

/// Customary baud rate of the devices this protocol ships on.
pub const DEFAULT_BAUD: u32 = 115_200;

pub(crate) const READ_TIMEOUT: Duration = Duration::from_millis(50);
pub(crate) const READ_CHUNK_SIZE: usize = 64;
pub(crate) const DEFAULT_DEADLINE: Duration = Duration::from_secs(2);

#[cfg(feature = "sync")]
mod connection;
#[cfg(feature = "sync")]
pub use connection::{Connection, SharedPort};

#[cfg(feature = "async")]
mod connection_async;
#[cfg(feature = "async")]
pub use connection_async::{AsyncSharedPort, ConnectionAsync};
