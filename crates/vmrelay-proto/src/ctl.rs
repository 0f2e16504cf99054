//! Agent control-channel framing.
//!
//! Control frames carry an 8-byte big-endian header: a `code` identifying
//! the command and a `length` counting the whole frame, header included.
//! The payload is opaque to the proxy; it forwards the bytes verbatim and
//! only interprets the handful of codes that drive the call discipline
//! (`READY`, `NEXT`, `ACK`, `ERROR`).

use bytes::{BufMut, Bytes};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::error::{ProtoError, Result};

/// Size of the control frame header: `code: u32` + `length: u32`.
pub const CTL_HEADER_SIZE: usize = 8;

/// Upper bound on a single control payload.
///
/// The wire format would allow lengths close to 4 GiB; nothing the agent
/// legitimately sends approaches that, so larger frames are rejected before
/// any allocation happens.
pub const MAX_CTL_PAYLOAD: usize = 16 * 1024 * 1024;

/// One control frame exchanged with the agent.
///
/// `code` stays a raw `u32` rather than [`AgentCommand`] so that codes the
/// proxy does not know about still round-trip untouched.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CtlMessage {
    /// Command code.
    pub code: u32,
    /// Opaque payload bytes (`length - 8` on the wire).
    pub payload: Bytes,
}

impl CtlMessage {
    /// Create a control message from a code and payload.
    pub fn new(code: u32, payload: impl Into<Bytes>) -> Self {
        Self { code, payload: payload.into() }
    }

    /// Total encoded size of this message.
    #[must_use]
    pub fn encoded_len(&self) -> usize {
        CTL_HEADER_SIZE + self.payload.len()
    }

    /// Encode into `dst`: `[code][length][payload]`, big-endian.
    ///
    /// # Errors
    ///
    /// `ProtoError::PayloadTooLarge` if the payload exceeds
    /// [`MAX_CTL_PAYLOAD`].
    pub fn encode(&self, dst: &mut impl BufMut) -> Result<()> {
        if self.payload.len() > MAX_CTL_PAYLOAD {
            return Err(ProtoError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_CTL_PAYLOAD,
            });
        }

        dst.put_u32(self.code);
        dst.put_u32(self.encoded_len() as u32);
        dst.put_slice(&self.payload);

        Ok(())
    }

    /// Decode one message from a buffer holding at least one whole frame.
    ///
    /// Trailing bytes beyond the frame are ignored. Intended for tests and
    /// peers that already have the frame in memory; streaming callers use
    /// [`CtlMessage::read_from`].
    ///
    /// # Errors
    ///
    /// - `ProtoError::ShortRead` if the buffer ends inside the frame
    /// - `ProtoError::MalformedFrame` if `length < 8`
    /// - `ProtoError::PayloadTooLarge` if the payload exceeds the cap
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let header: &[u8; CTL_HEADER_SIZE] =
            buf.first_chunk().ok_or(ProtoError::ShortRead)?;

        let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        let payload_len = payload_len(length)?;
        let payload = buf
            .get(CTL_HEADER_SIZE..CTL_HEADER_SIZE + payload_len)
            .ok_or(ProtoError::ShortRead)?;

        Ok(Self { code, payload: Bytes::copy_from_slice(payload) })
    }

    /// Read exactly one message from an async stream.
    ///
    /// # Errors
    ///
    /// - `ProtoError::ShortRead` on EOF inside a frame
    /// - `ProtoError::MalformedFrame` if `length < 8`
    /// - `ProtoError::PayloadTooLarge` if the payload exceeds the cap
    /// - `ProtoError::Io` for any other socket error
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let header = CtlHeader::read_from(reader).await?;
        let payload = header.read_payload(reader).await?;
        Ok(Self { code: header.code, payload })
    }
}

/// A decoded control frame header whose payload has not been read yet.
///
/// The agent's flow-control scheme wants an acknowledgement after the header
/// and another after the payload, so the channel layer needs to observe the
/// boundary between the two reads. [`CtlMessage::read_from`] is built on top
/// of this for callers that don't.
#[derive(Debug, Clone, Copy)]
pub struct CtlHeader {
    /// Command code.
    pub code: u32,
    payload_len: usize,
}

impl CtlHeader {
    /// Read and validate one 8-byte header.
    ///
    /// # Errors
    ///
    /// As [`CtlMessage::read_from`], header portion only.
    pub async fn read_from<R>(reader: &mut R) -> Result<Self>
    where
        R: AsyncRead + Unpin,
    {
        let mut header = [0u8; CTL_HEADER_SIZE];
        reader.read_exact(&mut header).await.map_err(ProtoError::from_read)?;

        let code = u32::from_be_bytes([header[0], header[1], header[2], header[3]]);
        let length = u32::from_be_bytes([header[4], header[5], header[6], header[7]]) as usize;

        Ok(Self { code, payload_len: payload_len(length)? })
    }

    /// Payload size announced by this header.
    #[must_use]
    pub fn payload_len(&self) -> usize {
        self.payload_len
    }

    /// Read the payload announced by this header.
    ///
    /// # Errors
    ///
    /// `ProtoError::ShortRead` on EOF inside the payload, `ProtoError::Io`
    /// otherwise.
    pub async fn read_payload<R>(&self, reader: &mut R) -> Result<Bytes>
    where
        R: AsyncRead + Unpin,
    {
        if self.payload_len == 0 {
            return Ok(Bytes::new());
        }

        let mut payload = vec![0u8; self.payload_len];
        reader.read_exact(&mut payload).await.map_err(ProtoError::from_read)?;
        Ok(payload.into())
    }
}

/// Validate the header `length` field and return the payload size.
fn payload_len(length: usize) -> Result<usize> {
    if length < CTL_HEADER_SIZE {
        return Err(ProtoError::MalformedFrame { length, header: CTL_HEADER_SIZE });
    }

    let payload_len = length - CTL_HEADER_SIZE;
    if payload_len > MAX_CTL_PAYLOAD {
        return Err(ProtoError::PayloadTooLarge { size: payload_len, max: MAX_CTL_PAYLOAD });
    }

    Ok(payload_len)
}

/// Commands understood by the agent.
///
/// The numeric values are the agent's wire codes. `hyper` requests name the
/// command as a string; [`AgentCommand::from_name`] is the only place that
/// mapping lives. Codes 3 (deprecated stop), 15 and 16 (file transfer) are
/// deliberately absent: the proxy does not accept them from clients.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum AgentCommand {
    /// Query the agent version.
    Version = 0,
    /// Start the pod sandbox.
    StartPod = 1,
    /// Query pod state.
    GetPod = 2,
    /// Tear the pod down.
    DestroyPod = 4,
    /// Restart a container.
    RestartContainer = 5,
    /// Execute a command in a container.
    ExecCmd = 6,
    /// Wait for a command to finish.
    FinishCmd = 7,
    /// Agent handshake: sent once when the control socket opens.
    Ready = 8,
    /// Successful completion of a request.
    Ack = 9,
    /// Failed completion of a request; payload is a message.
    Error = 10,
    /// Resize a terminal.
    WinSize = 11,
    /// Liveness probe.
    Ping = 12,
    /// Pod finished.
    FinishPod = 13,
    /// Flow control: payload is a 4-byte count of consumed bytes.
    Next = 14,
    /// Create a container in the pod.
    NewContainer = 17,
    /// Kill a container.
    KillContainer = 18,
    /// Online hotplugged CPUs/memory.
    OnlineCpuMem = 19,
    /// Configure a network interface.
    SetupInterface = 20,
    /// Configure a route.
    SetupRoute = 21,
}

impl AgentCommand {
    /// Wire code for this command.
    #[must_use]
    pub const fn code(self) -> u32 {
        self as u32
    }

    /// Look a command up by its wire code.
    #[must_use]
    pub fn from_code(code: u32) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.code() == code)
    }

    /// Look a command up by its `hyper` request name.
    #[must_use]
    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|cmd| cmd.name() == name)
    }

    /// The `hyper` request name for this command.
    #[must_use]
    pub const fn name(self) -> &'static str {
        match self {
            Self::Version => "version",
            Self::StartPod => "startpod",
            Self::GetPod => "getpod",
            Self::DestroyPod => "destroypod",
            Self::RestartContainer => "restartcontainer",
            Self::ExecCmd => "execcmd",
            Self::FinishCmd => "finishcmd",
            Self::Ready => "ready",
            Self::Ack => "ack",
            Self::Error => "error",
            Self::WinSize => "winsize",
            Self::Ping => "ping",
            Self::FinishPod => "finishpod",
            Self::Next => "next",
            Self::NewContainer => "newcontainer",
            Self::KillContainer => "killcontainer",
            Self::OnlineCpuMem => "onlinecpumem",
            Self::SetupInterface => "setupinterface",
            Self::SetupRoute => "setuproute",
        }
    }

    const ALL: [Self; 19] = [
        Self::Version,
        Self::StartPod,
        Self::GetPod,
        Self::DestroyPod,
        Self::RestartContainer,
        Self::ExecCmd,
        Self::FinishCmd,
        Self::Ready,
        Self::Ack,
        Self::Error,
        Self::WinSize,
        Self::Ping,
        Self::FinishPod,
        Self::Next,
        Self::NewContainer,
        Self::KillContainer,
        Self::OnlineCpuMem,
        Self::SetupInterface,
        Self::SetupRoute,
    ];
}
