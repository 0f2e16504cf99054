//! Agent channel: ownership of the two agent sockets.
//!
//! The channel owns the control socket and the I/O socket for one VM. The
//! control socket carries a strict request/response protocol: at most one
//! call is in flight at a time, and after the header and after the payload
//! of every frame the agent sends during a call, the proxy answers with a
//! `NEXT` frame counting the bytes it just consumed. Serializing callers
//! through one mutex is what makes that discipline hold; it also gives
//! back-pressure for free, since a slow agent simply keeps the mutex busy.
//!
//! Teardown is close-the-sockets: [`AgentChannel::close_sockets`] cancels
//! the shutdown token (failing any in-flight call with `ChannelClosed` and
//! stopping the I/O reader) and then drops both sockets.

use std::{path::Path, sync::Arc};

use bytes::{Bytes, BytesMut};
use tokio::{
    io::AsyncWriteExt,
    net::{
        UnixStream,
        unix::{OwnedReadHalf, OwnedWriteHalf},
    },
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use vmrelay_proto::{AgentCommand, CTL_HEADER_SIZE, CtlHeader, CtlMessage, IoMessage};

use crate::{error::ProxyError, mux::IoMultiplexer};

/// The two sockets connecting the proxy to one VM's agent.
#[derive(Debug)]
pub struct AgentChannel {
    /// Control socket. The mutex serializes whole call exchanges.
    ctl: Mutex<Option<UnixStream>>,
    /// Write half of the I/O socket, shared by every shim reader.
    io_writer: Mutex<Option<OwnedWriteHalf>>,
    /// Read half of the I/O socket, claimed once by [`Self::start_io_reader`].
    io_reader: Mutex<Option<OwnedReadHalf>>,
    /// Cancelled on teardown or on a fatal agent-socket fault.
    shutdown: CancellationToken,
}

impl AgentChannel {
    /// Dial both agent sockets and consume the `READY` handshake.
    ///
    /// The agent announces itself with a single `READY` control frame as
    /// soon as the control socket connects; anything else means we are not
    /// talking to an agent. On any failure the already-opened sockets are
    /// dropped before returning.
    ///
    /// # Errors
    ///
    /// - `ProxyError::Io` if either socket cannot be dialed
    /// - `ProxyError::Protocol` if the first frame is not an empty `READY`
    pub async fn connect(ctl_path: &Path, io_path: &Path) -> Result<Self, ProxyError> {
        let mut ctl = UnixStream::connect(ctl_path).await?;
        let io = UnixStream::connect(io_path).await?;

        let ready = CtlMessage::read_from(&mut ctl).await?;
        if ready.code != AgentCommand::Ready.code() || !ready.payload.is_empty() {
            return Err(ProxyError::Protocol(format!(
                "agent handshake: expected empty READY, got code {} with {} payload bytes",
                ready.code,
                ready.payload.len()
            )));
        }

        let (io_read, io_write) = io.into_split();

        Ok(Self {
            ctl: Mutex::new(Some(ctl)),
            io_writer: Mutex::new(Some(io_write)),
            io_reader: Mutex::new(Some(io_read)),
            shutdown: CancellationToken::new(),
        })
    }

    /// Token cancelled when the channel shuts down or faults.
    ///
    /// Children of this token drive the multiplexer's shim readers.
    #[must_use]
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Send one control request and await its terminating `ACK`/`ERROR`.
    ///
    /// Callers serialize on the control-socket mutex for the whole
    /// exchange. `NEXT` frames received from the agent are its flow-control
    /// acknowledgements of our own write and are skipped.
    ///
    /// # Errors
    ///
    /// - `ProxyError::ChannelClosed` if the channel is (or becomes) closed
    /// - `ProxyError::Agent` if the agent terminates the call with `ERROR`
    /// - `ProxyError::Protocol` on an unexpected terminating code
    /// - `ProxyError::Malformed` / `ProxyError::Io` on framing/socket faults
    pub async fn call(&self, code: u32, payload: Bytes) -> Result<Bytes, ProxyError> {
        let mut guard = self.ctl.lock().await;
        let stream = guard.as_mut().ok_or(ProxyError::ChannelClosed)?;

        let result = tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(ProxyError::ChannelClosed),
            result = Self::exchange(stream, code, payload) => result,
        };

        // An agent-reported error leaves the stream clean; anything else
        // broke the call discipline and poisons the channel.
        if let Err(err) = &result {
            if !matches!(err, ProxyError::Agent(_) | ProxyError::ChannelClosed) {
                tracing::warn!(error = %err, "control channel fault");
                self.shutdown.cancel();
            }
        }

        result
    }

    /// One write + read-until-ACK exchange on the control socket.
    async fn exchange(
        stream: &mut UnixStream,
        code: u32,
        payload: Bytes,
    ) -> Result<Bytes, ProxyError> {
        let request = CtlMessage::new(code, payload);
        let mut wire = BytesMut::with_capacity(request.encoded_len());
        request.encode(&mut wire)?;
        stream.write_all(&wire).await?;

        loop {
            let reply = Self::read_acked(stream).await?;

            match AgentCommand::from_code(reply.code) {
                Some(AgentCommand::Next) => {}
                Some(AgentCommand::Ack) => return Ok(reply.payload),
                Some(AgentCommand::Error) => {
                    return Err(ProxyError::Agent(
                        String::from_utf8_lossy(&reply.payload).into_owned(),
                    ));
                }
                _ => {
                    return Err(ProxyError::Protocol(format!(
                        "unexpected control code {} while awaiting ack",
                        reply.code
                    )));
                }
            }
        }
    }

    /// Read one agent frame, acknowledging header and payload separately.
    async fn read_acked(stream: &mut UnixStream) -> Result<CtlMessage, ProxyError> {
        let header = CtlHeader::read_from(stream).await?;
        Self::send_next(stream, CTL_HEADER_SIZE).await?;

        let payload = header.read_payload(stream).await?;
        if !payload.is_empty() {
            Self::send_next(stream, payload.len()).await?;
        }

        Ok(CtlMessage { code: header.code, payload })
    }

    /// Acknowledge `consumed` bytes with a `NEXT` frame.
    async fn send_next(stream: &mut UnixStream, consumed: usize) -> Result<(), ProxyError> {
        let ack = CtlMessage::new(
            AgentCommand::Next.code(),
            Bytes::copy_from_slice(&(consumed as u32).to_be_bytes()),
        );
        let mut wire = BytesMut::with_capacity(ack.encoded_len());
        ack.encode(&mut wire)?;
        stream.write_all(&wire).await?;
        Ok(())
    }

    /// Write one frame to the agent's I/O socket.
    ///
    /// Shim readers funnel through the writer mutex here, so frames from
    /// concurrent shims never interleave mid-frame.
    ///
    /// # Errors
    ///
    /// `ProxyError::ChannelClosed` once the channel is closed,
    /// `ProxyError::Io` on socket errors.
    pub async fn write_io(&self, msg: &IoMessage) -> Result<(), ProxyError> {
        tokio::select! {
            biased;
            () = self.shutdown.cancelled() => Err(ProxyError::ChannelClosed),
            result = self.write_io_inner(msg) => result,
        }
    }

    async fn write_io_inner(&self, msg: &IoMessage) -> Result<(), ProxyError> {
        let mut guard = self.io_writer.lock().await;
        let writer = guard.as_mut().ok_or(ProxyError::ChannelClosed)?;

        let mut wire = BytesMut::with_capacity(msg.encoded_len());
        msg.encode(&mut wire)?;
        writer.write_all(&wire).await?;
        Ok(())
    }

    /// Spawn the background reader draining the agent's I/O socket.
    ///
    /// Frames are handed to the multiplexer one at a time, which preserves
    /// the agent's emission order per sequence. A decode error or EOF is a
    /// session-level fault: the shutdown token is cancelled so pending and
    /// future calls fail fast.
    ///
    /// Returns `None` if the reader was already started (or the channel is
    /// closed); the caller joins the returned handle during teardown.
    pub async fn start_io_reader(&self, mux: Arc<IoMultiplexer>) -> Option<JoinHandle<()>> {
        let mut reader = self.io_reader.lock().await.take()?;
        let token = self.shutdown.clone();

        Some(tokio::spawn(async move {
            loop {
                tokio::select! {
                    biased;
                    () = token.cancelled() => break,
                    frame = IoMessage::read_from(&mut reader) => match frame {
                        Ok(msg) => mux.deliver(msg.seq, msg.payload).await,
                        Err(err) => {
                            tracing::debug!(error = %err, "agent I/O stream ended");
                            token.cancel();
                            break;
                        }
                    }
                }
            }
        }))
    }

    /// Idempotent close of both agent sockets.
    ///
    /// Cancels the shutdown token first so an in-flight call or a blocked
    /// I/O write lets go of its mutex, then drops whatever socket halves
    /// are still owned here. The I/O read half is dropped by the reader
    /// task as it unwinds.
    pub async fn close_sockets(&self) {
        self.shutdown.cancel();

        self.ctl.lock().await.take();
        self.io_writer.lock().await.take();
        self.io_reader.lock().await.take();
    }
}
