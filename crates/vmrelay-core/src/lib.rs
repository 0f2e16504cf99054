//! Session engine for the vmrelay proxy.
//!
//! The proxy sits between container tooling and one in-VM agent per
//! container. This crate owns the hard part: the per-VM session object that
//! holds both agent sockets, serializes control calls against the agent's
//! one-in-flight protocol, demultiplexes the I/O socket into per-shim byte
//! streams, and tears everything down without leaking a descriptor when any
//! participant disappears.
//!
//! # Components
//!
//! - [`AgentChannel`]: the two agent sockets; serialized `call` with
//!   NEXT-ack flow control; the I/O socket reader.
//! - [`IoMultiplexer`]: sequence-number routing between the I/O socket and
//!   subscribed shim connections.
//! - [`Session`]: the per-VM state machine composing the two, with a join
//!   barrier on close.
//! - [`Registry`]: process-wide `cid → session` map; registration precedes
//!   connect so concurrent `hello`s race deterministically.
//!
//! The JSON client protocol and the listening socket live in the `vmrelayd`
//! binary crate; this crate never parses client requests.

mod channel;
mod error;
mod mux;
mod registry;
mod session;

pub use channel::AgentChannel;
pub use error::ProxyError;
pub use mux::{FIRST_SEQ, IoMultiplexer};
pub use registry::Registry;
pub use session::{Session, SessionState};
