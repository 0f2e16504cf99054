//! Test collaborators for the vmrelay proxy.
//!
//! Nothing here ships in production. [`MockAgent`] stands in for the in-VM
//! agent: it listens on a control and an I/O socket in a temp directory,
//! performs the `READY` handshake, acknowledges control traffic with the
//! same `NEXT` discipline the real agent uses, and records everything it
//! sees so tests can assert on it. [`FdSnapshot`] captures the process's
//! open descriptors for leak checks around session lifecycles.

mod agent;
mod fdleak;

pub use agent::{MockAgent, RecordedCommand};
pub use fdleak::FdSnapshot;
