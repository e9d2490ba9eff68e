pub mod assemble;
pub mod chunks;
pub mod config;
pub mod connection;
pub mod discovery;
pub mod error;
pub mod protocol;
pub mod storage;
pub mod tls;
pub mod transfer;

pub use chunks::{ChunkStore, InboundChunkSet, OutboundChunkSet, TransferRecord};
pub use config::Config;
pub use connection::{ConnectionHandle, ManagerConfig, SessionSnapshot};
pub use discovery::{Broadcaster, Listener, PeerAnnouncement};
pub use error::TransferError;
pub use protocol::{FileDescriptor, MessageDecoder, WireMessage};
pub use storage::{FsStorage, Storage};
pub use transfer::{Action, FileKind, TransferState};

// Re-export commonly used types
pub use bytes;
pub use tokio;
