//! Proxy error taxonomy.
//!
//! One enum covers every failure the session engine can produce. The
//! variants split along the recovery boundary: `Malformed` and the
//! association errors close (or fail) a single client interaction, while
//! `Protocol`, `ChannelClosed` and agent-socket `Io` errors are fatal to the
//! whole session.
//!
//! Several `Display` strings double as the client-visible `error` field of a
//! JSON response, so their wording is part of the client protocol.

use std::io;

use thiserror::Error;
use vmrelay_proto::ProtoError;

/// Errors produced by the session engine.
#[derive(Error, Debug)]
pub enum ProxyError {
    /// Malformed client request or malformed agent frame. Fatal to the
    /// offending connection only.
    #[error("{0}")]
    Malformed(String),

    /// Violation of the call/response discipline on the control socket.
    /// Fatal to the session.
    #[error("protocol violation: {0}")]
    Protocol(String),

    /// The agent answered a call with `ERROR`; the payload is its message.
    #[error("{0}")]
    Agent(String),

    /// A session already exists for this container identifier.
    #[error("container already registered")]
    AlreadyRegistered,

    /// No session exists for this container identifier.
    #[error("container not registered")]
    NotRegistered,

    /// The client issued an RPC that requires a prior `hello` or `attach`.
    #[error("client is not associated with a vm")]
    NotAssociated,

    /// The session has been torn down.
    #[error("session is closed")]
    SessionClosed,

    /// The agent channel has been torn down.
    #[error("agent channel is closed")]
    ChannelClosed,

    /// Underlying socket error.
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
}

impl From<ProtoError> for ProxyError {
    fn from(err: ProtoError) -> Self {
        match err {
            ProtoError::Io(inner) => Self::Io(inner),
            other => Self::Malformed(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn client_visible_strings_are_stable() {
        assert_eq!(ProxyError::AlreadyRegistered.to_string(), "container already registered");
        assert_eq!(
            ProxyError::Malformed("malformed hello command".into()).to_string(),
            "malformed hello command"
        );
        assert_eq!(ProxyError::Agent("exec failed".into()).to_string(), "exec failed");
    }

    #[test]
    fn proto_errors_map_to_malformed() {
        let err: ProxyError = ProtoError::ShortRead.into();
        assert!(matches!(err, ProxyError::Malformed(_)));

        let err: ProxyError = ProtoError::Io(io::Error::other("boom")).into();
        assert!(matches!(err, ProxyError::Io(_)));
    }
}
