//! Client JSON protocol types.
//!
//! Runtimes and shims talk to the proxy over a unix socket carrying
//! newline-delimited JSON, one request per line:
//!
//! ```text
//! { "id": "hello", "data": { "containerId": "...", "ctlSerial": "...", "ioSerial": "..." } }
//! { "success": true }
//! ```
//!
//! Field names on the wire are camelCase. `hyper` payloads are raw JSON
//! forwarded to the agent verbatim, so `Hyper::data` stays a
//! [`serde_json::Value`].

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single client request.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Request {
    /// RPC name: `hello`, `attach`, `allocateIO`, `hyper` or `bye`.
    pub id: String,
    /// RPC-specific payload; absent for `bye`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

/// The proxy's reply to one [`Request`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Response {
    /// Whether the request succeeded.
    pub success: bool,
    /// Failure description when `success` is false.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// RPC-specific result, e.g. `ioBase` for `allocateIO`.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}

impl Response {
    /// A successful response with optional result data.
    #[must_use]
    pub fn ok(data: Option<Value>) -> Self {
        Self { success: true, error: None, data }
    }

    /// A failed response carrying `message`.
    pub fn fail(message: impl Into<String>) -> Self {
        Self { success: false, error: Some(message.into()), data: None }
    }
}

/// `hello` payload: register a VM and connect to its agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hello {
    /// Container identifier the session is registered under.
    pub container_id: String,
    /// Path to the agent's control socket.
    pub ctl_serial: String,
    /// Path to the agent's I/O socket.
    pub io_serial: String,
}

/// `attach` payload: join an already-registered VM.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Attach {
    /// Container identifier to attach to.
    pub container_id: String,
}

/// `allocateIO` payload: reserve I/O sequence numbers for a shim.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AllocateIo {
    /// Number of consecutive streams to reserve; must be positive.
    pub n_streams: u32,
}

/// `hyper` payload: forward one command to the agent.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Hyper {
    /// Agent command name, e.g. `ping` or `startpod`.
    pub hyper_name: String,
    /// Command payload, forwarded to the agent as serialized JSON.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
}
