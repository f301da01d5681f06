//! confsync: mirror a local config directory to a confsync server
//!
//! [`SyncClient`] pulls a product subtree once or pushes local changes to it
//! on a fixed interval, over any [`confsync_transport::ConfigTransport`].

pub mod client;

pub use client::{ClientError, CycleOutcome, RetryPolicy, SyncClient};
