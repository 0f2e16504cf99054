//! Per-VM session: the unit of ownership for one container VM.
//!
//! A session composes the agent channel and the I/O multiplexer for one
//! container identifier and carries the state machine:
//!
//! ```text
//! ┌─────────┐ connect ok ┌───────────┐ close / fault ┌─────────┐  joined  ┌────────┐
//! │ Created │───────────>│ Connected │──────────────>│ Closing │─────────>│ Closed │
//! └─────────┘            └───────────┘               └─────────┘          └────────┘
//!      │ connect fail                                                         ▲
//!      └──────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! External callers serialize on one session mutex; the only long waits
//! (agent calls) clone the channel out first so a slow agent never blocks
//! attach/detach bookkeeping. `close` is idempotent and joins every task
//! the session spawned, which is what makes fd accounting exact.

use std::{
    collections::HashSet,
    path::{Path, PathBuf},
    sync::Arc,
};

use bytes::Bytes;
use tokio::{net::UnixStream, sync::Mutex, task::JoinHandle};

use crate::{channel::AgentChannel, error::ProxyError, mux::IoMultiplexer};

/// Lifecycle state of a [`Session`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    /// Registered but not yet connected to the agent.
    Created,
    /// Both agent sockets are up and the `READY` handshake is done.
    Connected,
    /// Teardown in progress; new operations are rejected.
    Closing,
    /// Fully torn down; the registry entry is gone or about to be.
    Closed,
}

#[derive(Debug)]
struct Inner {
    state: SessionState,
    channel: Option<Arc<AgentChannel>>,
    mux: Option<Arc<IoMultiplexer>>,
    /// Join barrier: agent I/O reader plus one reader per shim.
    tasks: Vec<JoinHandle<()>>,
    /// Clients currently attached, by adapter-assigned id.
    attached: HashSet<u64>,
    /// The client whose `hello` created this session.
    creator: Option<u64>,
}

/// One container VM as seen by the proxy.
#[derive(Debug)]
pub struct Session {
    cid: String,
    ctl_path: PathBuf,
    io_path: PathBuf,
    inner: Mutex<Inner>,
}

impl Session {
    /// Create a session in [`SessionState::Created`].
    pub fn new(
        cid: impl Into<String>,
        ctl_path: impl Into<PathBuf>,
        io_path: impl Into<PathBuf>,
    ) -> Self {
        Self {
            cid: cid.into(),
            ctl_path: ctl_path.into(),
            io_path: io_path.into(),
            inner: Mutex::new(Inner {
                state: SessionState::Created,
                channel: None,
                mux: None,
                tasks: Vec::new(),
                attached: HashSet::new(),
                creator: None,
            }),
        }
    }

    /// Container identifier this session is registered under.
    #[must_use]
    pub fn cid(&self) -> &str {
        &self.cid
    }

    /// Path of the agent's control socket.
    #[must_use]
    pub fn ctl_path(&self) -> &Path {
        &self.ctl_path
    }

    /// Path of the agent's I/O socket.
    #[must_use]
    pub fn io_path(&self) -> &Path {
        &self.io_path
    }

    /// Current lifecycle state.
    pub async fn state(&self) -> SessionState {
        self.inner.lock().await.state
    }

    /// Dial the agent and start the I/O reader: `Created` → `Connected`.
    ///
    /// On failure the state stays `Created` and every socket opened along
    /// the way has been released; the caller is expected to deregister.
    ///
    /// # Errors
    ///
    /// - `ProxyError::SessionClosed` if the session left `Created`
    /// - errors from [`AgentChannel::connect`]
    pub async fn connect(&self) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Created {
            return Err(ProxyError::SessionClosed);
        }

        let channel = Arc::new(AgentChannel::connect(&self.ctl_path, &self.io_path).await?);
        let mux = Arc::new(IoMultiplexer::new(Arc::clone(&channel)));

        if let Some(reader) = channel.start_io_reader(Arc::clone(&mux)).await {
            inner.tasks.push(reader);
        }

        inner.channel = Some(channel);
        inner.mux = Some(mux);
        inner.state = SessionState::Connected;

        tracing::info!(cid = %self.cid, "session connected");
        Ok(())
    }

    /// Record a client as attached.
    ///
    /// The first attachment after `connect` is the creator; its departure
    /// tears the session down.
    ///
    /// # Errors
    ///
    /// `ProxyError::SessionClosed` unless the session is `Connected`.
    pub async fn attach(&self, client_id: u64) -> Result<(), ProxyError> {
        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(ProxyError::SessionClosed);
        }

        if inner.creator.is_none() {
            inner.creator = Some(client_id);
        }
        inner.attached.insert(client_id);
        Ok(())
    }

    /// Remove a client attachment.
    ///
    /// Returns `true` when the departure should tear the session down:
    /// the creator left, or nobody is attached any more. Unknown ids are
    /// ignored and never trigger teardown on their own.
    pub async fn detach(&self, client_id: u64) -> bool {
        let mut inner = self.inner.lock().await;
        if !inner.attached.remove(&client_id) {
            return false;
        }

        inner.creator == Some(client_id) || inner.attached.is_empty()
    }

    /// Reserve `n` consecutive I/O sequences for `shim`.
    ///
    /// Returns the base sequence of the range. The shim connection is owned
    /// by the multiplexer from here on and will be closed exactly once.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Malformed` if `n` is zero
    /// - `ProxyError::SessionClosed` unless the session is `Connected`
    pub async fn allocate_io(&self, n: u32, shim: UnixStream) -> Result<u64, ProxyError> {
        if n == 0 {
            return Err(ProxyError::Malformed("invalid number of streams".into()));
        }

        let mut inner = self.inner.lock().await;
        if inner.state != SessionState::Connected {
            return Err(ProxyError::SessionClosed);
        }

        let mux = inner.mux.clone().ok_or(ProxyError::SessionClosed)?;
        let (base, reader) = mux.allocate(n, shim).await;
        inner.tasks.push(reader);
        Ok(base)
    }

    /// Forward one control command to the agent and await its reply.
    ///
    /// The session mutex is released before the call so a slow agent does
    /// not block attach/detach bookkeeping; calls themselves serialize on
    /// the channel's control-socket mutex.
    ///
    /// # Errors
    ///
    /// - `ProxyError::SessionClosed` unless the session is `Connected`
    /// - errors from [`AgentChannel::call`]
    pub async fn send_agent(&self, code: u32, payload: Bytes) -> Result<Bytes, ProxyError> {
        let channel = {
            let inner = self.inner.lock().await;
            if inner.state != SessionState::Connected {
                return Err(ProxyError::SessionClosed);
            }
            inner.channel.clone().ok_or(ProxyError::SessionClosed)?
        };

        channel.call(code, payload).await
    }

    /// Number of I/O sequences currently subscribed by shims.
    ///
    /// Zero once every shim is gone or before any allocation; teardown and
    /// tests use this to observe cleanup progress.
    pub async fn io_session_count(&self) -> usize {
        let mux = { self.inner.lock().await.mux.clone() };
        match mux {
            Some(mux) => mux.subscription_count().await,
            None => 0,
        }
    }

    /// Tear the session down: `Closing` → `Closed`. Idempotent.
    ///
    /// Closes the agent sockets (which fails any in-flight call and stops
    /// the I/O reader), releases every subscribed shim, then joins all
    /// background tasks before reporting `Closed`.
    pub async fn close(&self) {
        let mut inner = self.inner.lock().await;
        if matches!(inner.state, SessionState::Closing | SessionState::Closed) {
            return;
        }
        inner.state = SessionState::Closing;

        let channel = inner.channel.take();
        let mux = inner.mux.take();
        let tasks = std::mem::take(&mut inner.tasks);
        inner.attached.clear();

        if let Some(channel) = &channel {
            channel.close_sockets().await;
        }
        if let Some(mux) = &mux {
            mux.clear().await;
        }
        for task in tasks {
            let _ = task.await;
        }

        inner.state = SessionState::Closed;
        tracing::info!(cid = %self.cid, "session closed");
    }
}
