//! Client connection framing.
//!
//! A client connection interleaves two things on one unix socket:
//! newline-delimited JSON requests, and shim fds passed as `SCM_RIGHTS`
//! ancillary data tagged with a single `'F'` byte. Both arrive through the
//! same `recvmsg` loop here. Ancillary data is only ever attached to the
//! first byte of the segment `recvmsg` returns, so whenever descriptors
//! show up, that first byte is the tag: it is verified, stripped from the
//! data stream, and the fds are queued for the next [`ClientConn::recv_fd`]
//! call. Pipelined requests before or after the tag byte are unaffected.

use std::{
    collections::VecDeque,
    io::{self, IoSliceMut},
    os::fd::{AsRawFd, OwnedFd, RawFd},
};

use bytes::BytesMut;
use nix::{
    cmsg_space,
    sys::socket::{ControlMessageOwned, MsgFlags, UnixAddr, recvmsg},
};
use tokio::{
    io::{AsyncWriteExt, Interest},
    net::UnixStream,
};
use vmrelay_core::ProxyError;
use vmrelay_proto::client::Response;

/// Largest request line the daemon will buffer for one client.
const MAX_LINE: usize = 1024 * 1024;

/// `recvmsg` chunk size.
const CHUNK: usize = 4096;

/// One accepted client connection.
#[derive(Debug)]
pub struct ClientConn {
    stream: UnixStream,
    buf: BytesMut,
    fds: VecDeque<OwnedFd>,
}

impl ClientConn {
    /// Wrap an accepted stream.
    #[must_use]
    pub fn new(stream: UnixStream) -> Self {
        Self { stream, buf: BytesMut::with_capacity(CHUNK), fds: VecDeque::new() }
    }

    /// Read the next request line, without its newline.
    ///
    /// Returns `Ok(None)` when the client disconnects at a line boundary.
    ///
    /// # Errors
    ///
    /// `ProxyError::Malformed` for an over-long or non-UTF-8 line, a bad fd
    /// tag, or a disconnect mid-line; `ProxyError::Io` for socket errors.
    pub async fn next_line(&mut self) -> Result<Option<String>, ProxyError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                let line = String::from_utf8(line.to_vec())
                    .map_err(|_| ProxyError::Malformed("request is not valid UTF-8".into()))?;
                return Ok(Some(line));
            }

            if self.buf.len() > MAX_LINE {
                return Err(ProxyError::Malformed("request line too long".into()));
            }

            if !self.recv_chunk().await? {
                if self.buf.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Malformed("client closed mid-request".into()));
            }
        }
    }

    /// Take the next fd passed by the client, receiving more data if none
    /// has arrived yet. Bytes received while waiting stay buffered for
    /// [`Self::next_line`].
    ///
    /// # Errors
    ///
    /// `ProxyError::Malformed` if the client disconnects first or violates
    /// the one-fd-per-message rule; `ProxyError::Io` for socket errors.
    pub async fn recv_fd(&mut self) -> Result<OwnedFd, ProxyError> {
        loop {
            if let Some(fd) = self.fds.pop_front() {
                return Ok(fd);
            }

            if !self.recv_chunk().await? {
                return Err(ProxyError::Malformed("client closed while passing an fd".into()));
            }
        }
    }

    /// Send one response line.
    ///
    /// # Errors
    ///
    /// `ProxyError::Io` on socket failure.
    pub async fn write_response(&mut self, response: &Response) -> Result<(), ProxyError> {
        let mut line = serde_json::to_vec(response)
            .map_err(|err| ProxyError::Protocol(format!("unencodable response: {err}")))?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        Ok(())
    }

    /// Pull one `recvmsg` worth of data and descriptors off the socket.
    ///
    /// Returns `false` on clean EOF.
    async fn recv_chunk(&mut self) -> Result<bool, ProxyError> {
        let mut chunk = [0u8; CHUNK];

        let (n, raw_fds) = self
            .stream
            .async_io(Interest::READABLE, || {
                let mut iov = [IoSliceMut::new(&mut chunk)];
                let mut space = cmsg_space!([RawFd; 2]);

                let msg = recvmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &mut iov,
                    Some(&mut space),
                    MsgFlags::MSG_CMSG_CLOEXEC,
                )
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))?;

                let mut fds: Vec<RawFd> = Vec::new();
                if let Ok(cmsgs) = msg.cmsgs() {
                    for cmsg in cmsgs {
                        if let ControlMessageOwned::ScmRights(received) = cmsg {
                            fds.extend_from_slice(&received);
                        }
                    }
                }

                Ok((msg.bytes, fds))
            })
            .await?;

        if raw_fds.is_empty() {
            if n == 0 {
                return Ok(false);
            }
            self.buf.extend_from_slice(&chunk[..n]);
            return Ok(true);
        }

        // Adopt the descriptors before any validation so an error path
        // still closes them when the queue is dropped.
        let count = raw_fds.len();
        adopt_fds(&raw_fds, &mut self.fds);

        if n == 0 || chunk[0] != b'F' {
            return Err(ProxyError::Malformed("couldn't read fd passing tag".into()));
        }
        if count != 1 {
            return Err(ProxyError::Malformed(format!("unexpected number of fds ({count})")));
        }

        self.buf.extend_from_slice(&chunk[1..n]);
        Ok(true)
    }
}

// SAFETY: the descriptors were just created for this process by the
// kernel's SCM_RIGHTS transfer; nobody else holds them, so wrapping each in
// an OwnedFd establishes the single owner that will close it.
#[allow(unsafe_code)]
fn adopt_fds(raw: &[RawFd], queue: &mut VecDeque<OwnedFd>) {
    use std::os::fd::FromRawFd;

    for &fd in raw {
        queue.push_back(unsafe { OwnedFd::from_raw_fd(fd) });
    }
}
