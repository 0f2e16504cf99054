//! Socket-activation bootstrap.
//!
//! The daemon expects its listening socket pre-bound by the service manager
//! (systemd-style: `LISTEN_PID` names this process, `LISTEN_FDS` counts the
//! descriptors handed over starting at fd 3). Exactly one socket is
//! accepted; more than one means the unit file is wrong and the daemon
//! refuses to guess. Without activation the caller falls back to binding a
//! path itself.

use std::{env, os::unix::net::UnixListener, process};

use crate::error::DaemonError;

/// First descriptor passed by the service manager.
const LISTEN_FDS_START: i32 = 3;

/// Adopt the activation socket, if one was passed to this process.
///
/// Returns `Ok(None)` when no activation environment is present or it names
/// a different process.
///
/// # Errors
///
/// `DaemonError::Config` if the environment is malformed or passes a number
/// of sockets other than one.
pub fn take_activation_listener() -> Result<Option<UnixListener>, DaemonError> {
    let Ok(listen_fds) = env::var("LISTEN_FDS") else {
        return Ok(None);
    };

    // LISTEN_PID guards against inheriting another service's sockets.
    if let Ok(pid) = env::var("LISTEN_PID") {
        if pid.parse::<u32>().ok() != Some(process::id()) {
            return Ok(None);
        }
    }

    let count: i32 = listen_fds
        .parse()
        .map_err(|_| DaemonError::Config(format!("invalid LISTEN_FDS value '{listen_fds}'")))?;
    if count != 1 {
        return Err(DaemonError::Config(format!("couldn't find activated socket ({count})")));
    }

    Ok(Some(adopt_fd(LISTEN_FDS_START)))
}

// SAFETY: the service manager owns fd 3 until exec, after which it belongs
// to this process exclusively; nothing else in the daemon touches raw fds
// at startup, so adopting it here transfers ownership exactly once.
#[allow(unsafe_code)]
fn adopt_fd(fd: i32) -> UnixListener {
    use std::os::fd::FromRawFd;

    unsafe { UnixListener::from_raw_fd(fd) }
}
