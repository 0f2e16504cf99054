//! vmrelay proxy daemon.
//!
//! `vmrelayd` sits between container tooling and one in-VM agent per
//! container. Runtimes and shims connect to a single listening socket and
//! speak newline-delimited JSON; the daemon lowers those requests onto
//! `vmrelay-core` sessions, which own the binary control and I/O sockets
//! to each agent. Shim byte streams are handed over as fds and multiplexed
//! onto the agent's I/O socket with sequence-number framing.
//!
//! The listening socket is expected from the service manager via socket
//! activation ([`take_activation_listener`]); binding a path directly is a
//! development fallback wired up in `main`.

mod activation;
mod adapter;
mod conn;
mod error;

use std::sync::{Arc, atomic::AtomicU64};

use tokio::net::UnixListener;
use vmrelay_core::Registry;

pub use crate::{activation::take_activation_listener, error::DaemonError};

/// Process-wide proxy state shared by every client connection.
#[derive(Debug, Default)]
pub struct Proxy {
    registry: Registry,
    next_client: AtomicU64,
}

impl Proxy {
    /// Create a proxy with an empty session registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// The session registry.
    #[must_use]
    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// Hand out a fresh client identity.
    pub(crate) fn next_client_id(&self) -> u64 {
        self.next_client.fetch_add(1, std::sync::atomic::Ordering::Relaxed)
    }

    /// Accept and serve client connections until the listener dies.
    ///
    /// Each accepted connection gets its own task; a failed accept is
    /// logged and retried, matching the do-not-die posture of a daemon
    /// that other components depend on.
    pub async fn run(self: Arc<Self>, listener: UnixListener) {
        loop {
            match listener.accept().await {
                Ok((stream, _)) => {
                    let proxy = Arc::clone(&self);
                    tokio::spawn(adapter::serve_client(proxy, stream));
                }
                Err(err) => {
                    tracing::error!(error = %err, "couldn't accept connection");
                }
            }
        }
    }
}
