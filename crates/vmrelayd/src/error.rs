//! Daemon bootstrap errors.

use std::io;

use thiserror::Error;

/// Errors that prevent the daemon from starting.
///
/// These surface as a one-line diagnostic on stderr and a non-zero exit;
/// everything after bootstrap is handled per connection or per session.
#[derive(Error, Debug)]
pub enum DaemonError {
    /// Configuration problem: bad flags, missing or unusable activation fd.
    #[error("configuration error: {0}")]
    Config(String),

    /// Socket error while setting up or accepting on the listener.
    #[error("listener error: {0}")]
    Listener(#[from] io::Error),
}
