//! confsync-core: change detection and archive engine
//!
//! Provides the mtime-based file state tracker, the archive codec, the wire
//! protocol and configuration shared by the sync client and server.

pub mod archive;
pub mod config;
pub mod error;
pub mod path;
pub mod protocol;
pub mod tracker;

pub use archive::{Archive, ArchiveEntry, Compression, UnpackSummary, pack, unpack};
pub use config::{ClientConfig, ScanInterval, ServerConfig};
pub use error::{Error, Result};
pub use protocol::{
    ApplyReply, ApplyRequest, FetchReply, FetchRequest, Message, ProtocolReader, ProtocolWriter,
};
pub use tracker::{FileStateTracker, PendingScan, ScanResult, TrackerState};
