//! Wire formats for the vmrelay proxy.
//!
//! Three protocols meet in the proxy and this crate defines all of them:
//!
//! - the agent **control** protocol: length-prefixed binary frames with an
//!   8-byte header ([`CtlMessage`]), flow-controlled with `NEXT` acks;
//! - the agent **I/O** protocol: sequence-tagged binary frames with a
//!   12-byte header ([`IoMessage`]) multiplexing process streams;
//! - the **client** protocol: newline-delimited JSON requests and responses
//!   ([`client`]).
//!
//! Everything here is pure framing. Socket ownership, call discipline and
//! session state live in `vmrelay-core`.

pub mod client;
mod ctl;
mod error;
mod io;

pub use ctl::{AgentCommand, CTL_HEADER_SIZE, CtlHeader, CtlMessage, MAX_CTL_PAYLOAD};
pub use error::{ProtoError, Result};
pub use io::{IO_HEADER_SIZE, IoMessage, MAX_IO_PAYLOAD};
