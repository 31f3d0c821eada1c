//! Multi-part file-transfer accelerator.
//!
//! The engine fetches each remote file through several concurrent ranged
//! requests, writing the ranges into one preallocated sparse file. A
//! hierarchical [`limiter::SpeedLimiter`] caps aggregate throughput and a
//! hierarchical [`progress::ProgressTracker`] provides windowed rate and
//! ETA estimates across every level of the tree:
//!
//! ```text
//! Session -> [FileSync]* -> [Streamer]*
//! ```
//!
//! [`transfer::http::HttpSession`] is the batteries-included entry point;
//! the engine itself is generic over [`transfer::Transport`], so other
//! protocols can plug into the same scheduling, retry and accounting
//! machinery.

pub mod limiter;
pub mod progress;
pub mod transfer;
pub mod util;
