//! Client library for the vmrelay proxy protocol.
//!
//! Container runtimes and shims use [`Client`] instead of hand-rolling the
//! newline-delimited JSON protocol. One client maps to one proxy
//! connection; requests are strictly sequential (send one, read its
//! response), which is exactly the discipline the proxy enforces anyway.
//!
//! Shim connections are handed to the proxy out of band: a single `'F'` tag
//! byte with the fd in an `SCM_RIGHTS` control message, via
//! [`Client::send_shim_fd`].

use std::{
    io::{self, IoSlice},
    os::fd::{AsRawFd, BorrowedFd},
    path::Path,
};

use bytes::BytesMut;
use nix::sys::socket::{ControlMessage, MsgFlags, UnixAddr, sendmsg};
use serde_json::{Value, json};
use thiserror::Error;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt, Interest},
    net::UnixStream,
};
use vmrelay_proto::client::{Request, Response};

/// Largest response line the client will buffer.
const MAX_LINE: usize = 1024 * 1024;

/// Errors surfaced by [`Client`].
#[derive(Error, Debug)]
pub enum ClientError {
    /// The proxy reported a request failure; the string is its `error`
    /// field.
    #[error("{0}")]
    Rpc(String),

    /// The proxy answered with something that is not a valid response.
    #[error("invalid response: {0}")]
    InvalidResponse(String),

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

/// One connection to the proxy.
#[derive(Debug)]
pub struct Client {
    stream: UnixStream,
    buf: BytesMut,
}

impl Client {
    /// Connect to the proxy's listening socket at `path`.
    ///
    /// # Errors
    ///
    /// `ClientError::Io` on connect failure.
    pub async fn connect(path: impl AsRef<Path>) -> Result<Self, ClientError> {
        Ok(Self::from_stream(UnixStream::connect(path).await?))
    }

    /// Wrap an already-connected stream (tests use socketpairs).
    #[must_use]
    pub fn from_stream(stream: UnixStream) -> Self {
        Self { stream, buf: BytesMut::with_capacity(4096) }
    }

    /// Register a VM and connect the proxy to its agent.
    ///
    /// # Errors
    ///
    /// `ClientError::Rpc` with the proxy's message on failure.
    pub async fn hello(
        &mut self,
        container_id: &str,
        ctl_serial: &str,
        io_serial: &str,
    ) -> Result<(), ClientError> {
        let data = json!({
            "containerId": container_id,
            "ctlSerial": ctl_serial,
            "ioSerial": io_serial,
        });
        self.round_trip("hello", Some(data)).await.map(|_| ())
    }

    /// Attach this connection to an already-registered VM.
    ///
    /// # Errors
    ///
    /// `ClientError::Rpc` if the container is unknown.
    pub async fn attach(&mut self, container_id: &str) -> Result<(), ClientError> {
        let data = json!({ "containerId": container_id });
        self.round_trip("attach", Some(data)).await.map(|_| ())
    }

    /// Reserve `n_streams` I/O sequences, handing `shim` over to the proxy.
    ///
    /// Returns the base sequence of the reserved range. The fd is
    /// duplicated into the proxy by the kernel; the caller keeps (and
    /// should close) its own copy.
    ///
    /// # Errors
    ///
    /// `ClientError::Rpc` on proxy failure, `ClientError::InvalidResponse`
    /// if the response lacks `ioBase`.
    pub async fn allocate_io(
        &mut self,
        n_streams: u32,
        shim: BorrowedFd<'_>,
    ) -> Result<u64, ClientError> {
        self.send_request("allocateIO", Some(json!({ "nStreams": n_streams }))).await?;
        self.send_shim_fd(shim).await?;

        let response = self.read_response().await?;
        let data = response
            .data
            .as_ref()
            .and_then(|d| d.get("ioBase"))
            .and_then(Value::as_u64)
            .ok_or_else(|| ClientError::InvalidResponse("no ioBase in response".into()))?;
        Ok(data)
    }

    /// Forward one command to the agent.
    ///
    /// `data` is serialized verbatim as the agent payload.
    ///
    /// # Errors
    ///
    /// `ClientError::Rpc` carrying the agent's (or proxy's) message.
    pub async fn hyper(
        &mut self,
        hyper_name: &str,
        data: Option<Value>,
    ) -> Result<(), ClientError> {
        let mut payload = json!({ "hyperName": hyper_name });
        if let Some(data) = data {
            payload["data"] = data;
        }
        self.round_trip("hyper", Some(payload)).await.map(|_| ())
    }

    /// Detach from the VM; the creator's `bye` tears the session down.
    ///
    /// # Errors
    ///
    /// `ClientError::Rpc` if this connection was never associated.
    pub async fn bye(&mut self) -> Result<(), ClientError> {
        self.round_trip("bye", None).await.map(|_| ())
    }

    /// Pass a shim connection to the proxy out of band.
    ///
    /// Wire format: one data byte `'F'` carrying exactly one fd in an
    /// `SCM_RIGHTS` control message.
    ///
    /// # Errors
    ///
    /// `ClientError::Io` on socket failure.
    pub async fn send_shim_fd(&mut self, fd: BorrowedFd<'_>) -> Result<(), ClientError> {
        let raw = fd.as_raw_fd();

        self.stream
            .async_io(Interest::WRITABLE, || {
                let iov = [IoSlice::new(b"F")];
                let fds = [raw];
                let cmsgs = [ControlMessage::ScmRights(&fds)];
                sendmsg::<UnixAddr>(
                    self.stream.as_raw_fd(),
                    &iov,
                    &cmsgs,
                    MsgFlags::empty(),
                    None,
                )
                .map(|_| ())
                .map_err(|errno| io::Error::from_raw_os_error(errno as i32))
            })
            .await?;

        Ok(())
    }

    async fn round_trip(
        &mut self,
        id: &str,
        data: Option<Value>,
    ) -> Result<Response, ClientError> {
        self.send_request(id, data).await?;
        self.read_response().await
    }

    async fn send_request(&mut self, id: &str, data: Option<Value>) -> Result<(), ClientError> {
        let request = Request { id: id.to_owned(), data };
        let mut line = serde_json::to_vec(&request)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;
        line.push(b'\n');
        self.stream.write_all(&line).await?;
        Ok(())
    }

    async fn read_response(&mut self) -> Result<Response, ClientError> {
        let line = self.read_line().await?;
        let response: Response = serde_json::from_slice(&line)
            .map_err(|err| ClientError::InvalidResponse(err.to_string()))?;

        if response.success {
            Ok(response)
        } else {
            Err(ClientError::Rpc(
                response.error.unwrap_or_else(|| "unknown error".to_owned()),
            ))
        }
    }

    async fn read_line(&mut self) -> Result<Vec<u8>, ClientError> {
        loop {
            if let Some(pos) = self.buf.iter().position(|&b| b == b'\n') {
                let mut line = self.buf.split_to(pos + 1);
                line.truncate(pos);
                return Ok(line.to_vec());
            }

            if self.buf.len() > MAX_LINE {
                return Err(ClientError::InvalidResponse("response line too long".into()));
            }

            let read = self.stream.read_buf(&mut self.buf).await?;
            if read == 0 {
                return Err(ClientError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "proxy closed the connection",
                )));
            }
        }
    }
}
