//! confsync-server: serves product subtrees to sync clients
//!
//! [`ConfigServer`] implements Fetch and Apply over a directory of product
//! subtrees and hands each applied change to a [`ChangeRecorder`].

pub mod recorder;
pub mod server;

pub use recorder::{ChangeRecorder, GitRecorder, NoopRecorder, RecordError};
pub use server::{ApplySummary, ConfigServer, ServerError};
