pub mod adapters;
pub mod auth;
pub mod filesync;
pub mod http;
pub mod segment;
pub mod session;
pub mod streamer;

pub use adapters::{ByteRange, FileWriter, ProbeInfo, RangedReader, Transport};
pub use filesync::FileSync;
pub use segment::{plan, Segment};
pub use session::Session;
pub use streamer::Streamer;

use std::io;
use std::path::PathBuf;
use std::time::Duration;

use reqwest::StatusCode;
use url::Url;

use crate::transfer::auth::Credentials;

pub const DEFAULT_PARTS: u32 = 4;
pub const DEFAULT_CONCURRENT: usize = 4;
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(20);

/// Everything a per-file coordinator needs to fetch one remote resource.
#[derive(Debug, Clone)]
pub struct TransferRequest {
    pub url: Url,
    pub path: PathBuf,
    pub auth: Option<Credentials>,
    pub verify_tls: bool,
    pub parts: u32,
    /// Aggregate cap in bytes per second; configuration default only when
    /// the transfer joins a session (the session's root limiter governs).
    pub speed_limit: Option<u64>,
    /// Inactivity budget before a stalled segment is abandoned; zero
    /// disables the gate.
    pub timeout: Duration,
    pub restart: bool,
    pub keep_remote_name: bool,
    pub persist_connection: bool,
}

impl TransferRequest {
    pub fn new(url: Url, path: PathBuf) -> Self {
        Self {
            url,
            path,
            auth: None,
            verify_tls: true,
            parts: DEFAULT_PARTS,
            speed_limit: None,
            timeout: DEFAULT_TIMEOUT,
            restart: false,
            keep_remote_name: false,
            persist_connection: true,
        }
    }
}

/// Errors that keep a transfer from being planned or a connection from
/// being opened. Streaming workers never surface these; they classify
/// failures internally and retry, so only coordinators report them.
#[derive(Debug, thiserror::Error)]
pub enum TransferError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error("server returned status {0}")]
    Status(StatusCode),

    #[error("insufficient disk space: {required} bytes required, {available} available")]
    InsufficientSpace { required: u64, available: u64 },

    #[error("{scheme} authentication is not supported")]
    UnsupportedAuth { scheme: String },
}
