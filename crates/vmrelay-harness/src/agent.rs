//! Mock in-VM agent.
//!
//! Speaks just enough of the agent protocol to exercise the proxy: sends
//! `READY` when the control socket is accepted, acknowledges every control
//! frame from the proxy with `NEXT` after its header and after its payload,
//! replies `ACK` (or a configured `ERROR`), and records decoded traffic on
//! both sockets. `NEXT` frames arriving from the proxy are its flow-control
//! acknowledgements of our own sends and are ignored.
//!
//! Each socket services a single accepted connection, mirroring the real
//! agent, which has exactly one proxy.

use std::{
    path::{Path, PathBuf},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use bytes::{Bytes, BytesMut};
use tempfile::TempDir;
use tokio::{
    io::AsyncWriteExt,
    net::{UnixListener, UnixStream},
    sync::{Mutex, mpsc},
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use vmrelay_proto::{AgentCommand, CtlMessage, IoMessage};

/// How long the wait helpers poll before giving up.
const WAIT_TIMEOUT: Duration = Duration::from_secs(5);

/// One control command the mock received from the proxy.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCommand {
    /// Command code.
    pub code: u32,
    /// Command payload.
    pub payload: Vec<u8>,
}

/// A fake agent listening on two temp-directory sockets.
pub struct MockAgent {
    _dir: TempDir,
    ctl_path: PathBuf,
    io_path: PathBuf,
    commands: Arc<Mutex<Vec<RecordedCommand>>>,
    io_frames: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    io_out: mpsc::UnboundedSender<IoMessage>,
    error_reply: Arc<Mutex<Option<String>>>,
    mute: Arc<AtomicBool>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl MockAgent {
    /// Bind both sockets and start serving.
    ///
    /// # Panics
    ///
    /// Panics on bind failure; this is test plumbing.
    #[allow(clippy::unwrap_used)]
    pub fn start() -> Self {
        let dir = TempDir::new().unwrap();
        let ctl_path = dir.path().join("agent-ctl.sock");
        let io_path = dir.path().join("agent-io.sock");

        let ctl_listener = UnixListener::bind(&ctl_path).unwrap();
        let io_listener = UnixListener::bind(&io_path).unwrap();

        let commands = Arc::new(Mutex::new(Vec::new()));
        let io_frames = Arc::new(Mutex::new(Vec::new()));
        let error_reply = Arc::new(Mutex::new(None));
        let mute = Arc::new(AtomicBool::new(false));
        let (io_out, io_out_rx) = mpsc::unbounded_channel();
        let shutdown = CancellationToken::new();

        let ctl_task = tokio::spawn(serve_ctl(
            ctl_listener,
            Arc::clone(&commands),
            Arc::clone(&error_reply),
            Arc::clone(&mute),
            shutdown.clone(),
        ));
        let io_task =
            tokio::spawn(serve_io(io_listener, Arc::clone(&io_frames), io_out_rx, shutdown.clone()));

        Self {
            _dir: dir,
            ctl_path,
            io_path,
            commands,
            io_frames,
            io_out,
            error_reply,
            mute,
            shutdown,
            tasks: vec![ctl_task, io_task],
        }
    }

    /// Paths of the control and I/O sockets, in that order.
    #[must_use]
    pub fn socket_paths(&self) -> (&Path, &Path) {
        (&self.ctl_path, &self.io_path)
    }

    /// Drain and return the control commands received so far.
    pub async fn take_commands(&self) -> Vec<RecordedCommand> {
        std::mem::take(&mut *self.commands.lock().await)
    }

    /// Drain and return the I/O frames received so far.
    pub async fn take_io_frames(&self) -> Vec<(u64, Vec<u8>)> {
        std::mem::take(&mut *self.io_frames.lock().await)
    }

    /// Poll until at least `n` control commands have been recorded, then
    /// drain and return them.
    ///
    /// # Panics
    ///
    /// Panics after five seconds without reaching `n`.
    #[allow(clippy::unwrap_used)]
    pub async fn wait_commands(&self, n: usize) -> Vec<RecordedCommand> {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if self.commands.lock().await.len() >= n {
                    return self.take_commands().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    /// Poll until at least `n` I/O frames have been recorded, then drain
    /// and return them.
    ///
    /// # Panics
    ///
    /// Panics after five seconds without reaching `n`.
    #[allow(clippy::unwrap_used)]
    pub async fn wait_io_frames(&self, n: usize) -> Vec<(u64, Vec<u8>)> {
        tokio::time::timeout(WAIT_TIMEOUT, async {
            loop {
                if self.io_frames.lock().await.len() >= n {
                    return self.take_io_frames().await;
                }
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .unwrap()
    }

    /// Emit one I/O frame to the proxy (queued until the proxy connects).
    pub fn send_io(&self, seq: u64, payload: impl Into<Bytes>) {
        let _ = self.io_out.send(IoMessage::new(seq, payload));
    }

    /// Emit the EOF marker for `seq`.
    pub fn send_io_eof(&self, seq: u64) {
        let _ = self.io_out.send(IoMessage::eof(seq));
    }

    /// Make the next control command fail with `ERROR` carrying `message`.
    pub async fn fail_next_command(&self, message: impl Into<String>) {
        *self.error_reply.lock().await = Some(message.into());
    }

    /// Stop replying to control commands (they are still recorded).
    ///
    /// Simulates a wedged agent so tests can observe calls stuck in flight.
    pub fn set_mute(&self, mute: bool) {
        self.mute.store(mute, Ordering::SeqCst);
    }

    /// Shut the mock down, closing every descriptor it owns.
    pub async fn stop(mut self) {
        self.shutdown.cancel();
        for task in self.tasks.drain(..) {
            let _ = task.await;
        }
    }
}

/// Accept the proxy's control connection and serve the ack discipline.
async fn serve_ctl(
    listener: UnixListener,
    commands: Arc<Mutex<Vec<RecordedCommand>>>,
    error_reply: Arc<Mutex<Option<String>>>,
    mute: Arc<AtomicBool>,
    shutdown: CancellationToken,
) {
    let mut stream = tokio::select! {
        () = shutdown.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(_) => return,
        },
    };

    // The agent announces itself before anything else happens.
    if send(&mut stream, AgentCommand::Ready.code(), Bytes::new()).await.is_err() {
        return;
    }

    loop {
        let msg = tokio::select! {
            () = shutdown.cancelled() => return,
            msg = CtlMessage::read_from(&mut stream) => match msg {
                Ok(msg) => msg,
                Err(_) => return,
            },
        };

        if msg.code == AgentCommand::Next.code() {
            // The proxy acknowledging our own frames.
            continue;
        }

        // Flow control: ack the header, then the payload if there was one.
        if ack(&mut stream, vmrelay_proto::CTL_HEADER_SIZE).await.is_err() {
            return;
        }
        if !msg.payload.is_empty() && ack(&mut stream, msg.payload.len()).await.is_err() {
            return;
        }

        commands
            .lock()
            .await
            .push(RecordedCommand { code: msg.code, payload: msg.payload.to_vec() });

        if mute.load(Ordering::SeqCst) {
            continue;
        }

        let reply = error_reply.lock().await.take();
        let result = match reply {
            Some(message) => {
                send(&mut stream, AgentCommand::Error.code(), Bytes::from(message)).await
            }
            None => send(&mut stream, AgentCommand::Ack.code(), Bytes::new()).await,
        };
        if result.is_err() {
            return;
        }
    }
}

/// Accept the proxy's I/O connection; record inbound frames, write queued
/// outbound ones.
async fn serve_io(
    listener: UnixListener,
    io_frames: Arc<Mutex<Vec<(u64, Vec<u8>)>>>,
    mut io_out: mpsc::UnboundedReceiver<IoMessage>,
    shutdown: CancellationToken,
) {
    let stream = tokio::select! {
        () = shutdown.cancelled() => return,
        accepted = listener.accept() => match accepted {
            Ok((stream, _)) => stream,
            Err(_) => return,
        },
    };

    let (mut read_half, mut write_half) = stream.into_split();

    // Reads and writes run independently; a select over both would drop a
    // half-read frame whenever the outbound queue fires mid-read.
    let writer_shutdown = shutdown.clone();
    let writer = tokio::spawn(async move {
        loop {
            let outbound = tokio::select! {
                () = writer_shutdown.cancelled() => return,
                outbound = io_out.recv() => outbound,
            };
            let Some(msg) = outbound else { return };

            let mut wire = BytesMut::with_capacity(msg.encoded_len());
            if msg.encode(&mut wire).is_err() || write_half.write_all(&wire).await.is_err() {
                return;
            }
        }
    });

    loop {
        let inbound = tokio::select! {
            () = shutdown.cancelled() => break,
            inbound = IoMessage::read_from(&mut read_half) => inbound,
        };
        match inbound {
            Ok(msg) => io_frames.lock().await.push((msg.seq, msg.payload.to_vec())),
            Err(_) => break,
        }
    }

    // The writer owns the write half; it unwinds on shutdown (or queue
    // close), and joining it here keeps fd accounting exact.
    let _ = writer.await;
}

/// Write one control frame.
async fn send(stream: &mut UnixStream, code: u32, payload: Bytes) -> std::io::Result<()> {
    let msg = CtlMessage::new(code, payload);
    let mut wire = BytesMut::with_capacity(msg.encoded_len());
    msg.encode(&mut wire).map_err(std::io::Error::other)?;
    stream.write_all(&wire).await
}

/// Write one `NEXT` frame acknowledging `consumed` bytes.
async fn ack(stream: &mut UnixStream, consumed: usize) -> std::io::Result<()> {
    send(
        stream,
        AgentCommand::Next.code(),
        Bytes::copy_from_slice(&(consumed as u32).to_be_bytes()),
    )
    .await
}
