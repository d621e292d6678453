//! Peer synchronization: wire messages and the process-local bus.

mod channel;
mod message;

pub use channel::{DEFAULT_CHANNEL, SyncBus, SyncChannel};
pub use message::{MessageBody, PeerId, SyncMessage, WireError};
