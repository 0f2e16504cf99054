//! Client request dispatch.
//!
//! Requests parse into the tagged [`ClientRequest`] variant type rather
//! than going through a name→handler table: the set of RPCs is closed, and
//! the per-client state is passed to handlers explicitly instead of riding
//! along as untyped user data.
//!
//! Error handling distinguishes two tiers. Handler failures (unknown
//! container, malformed payload, agent errors) become `success=false`
//! responses and the connection lives on. Connection-level failures
//! (malformed JSON, a broken fd handoff, socket errors) kill the
//! connection. A client that disconnects while associated is treated
//! exactly like `bye`.

use std::{os::fd::OwnedFd, sync::Arc};

use serde::de::DeserializeOwned;
use serde_json::{Value, json};
use tokio::net::UnixStream;
use vmrelay_core::{ProxyError, Session};
use vmrelay_proto::{
    AgentCommand,
    client::{AllocateIo, Attach, Hello, Hyper, Response},
};

use crate::{Proxy, conn::ClientConn};

/// Per-connection client state, threaded through every handler.
#[derive(Debug)]
struct ClientState {
    /// Adapter-assigned identity, used for attach/detach bookkeeping.
    id: u64,
    /// The session this client is associated with, once `hello`/`attach`
    /// has succeeded.
    session: Option<Arc<Session>>,
}

/// One fully-parsed client request.
#[derive(Debug)]
enum ClientRequest {
    /// Register a VM and connect to its agent.
    Hello(Hello),
    /// Join an already-registered VM.
    Attach(Attach),
    /// Reserve I/O sequences; an fd follows on the wire.
    AllocateIo(AllocateIo),
    /// Forward a command to the agent.
    Hyper(Hyper),
    /// Detach from the VM.
    Bye,
}

/// How a dispatch failed.
#[derive(Debug)]
enum DispatchError {
    /// Report to the client and keep serving.
    Reply(ProxyError),
    /// Tear the connection down.
    Fatal(ProxyError),
}

/// Serve one accepted client connection until it goes away.
pub async fn serve_client(proxy: Arc<Proxy>, stream: UnixStream) {
    let mut conn = ClientConn::new(stream);
    let mut state = ClientState { id: proxy.next_client_id(), session: None };

    tracing::debug!(client = state.id, "client connected");

    loop {
        let line = match conn.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(err) => {
                tracing::debug!(client = state.id, error = %err, "client read failed");
                break;
            }
        };
        if line.trim().is_empty() {
            continue;
        }

        let request: Value = match serde_json::from_str(&line) {
            Ok(request) => request,
            Err(err) => {
                tracing::debug!(client = state.id, error = %err, "couldn't decode request");
                break;
            }
        };

        let Some(id) = request.get("id").and_then(Value::as_str).map(str::to_owned) else {
            if conn.write_response(&Response::fail("no 'id' field in request")).await.is_err() {
                break;
            }
            continue;
        };
        let data = request.get("data").cloned();

        let response = match dispatch(&proxy, &mut conn, &mut state, &id, data).await {
            Ok(data) => Response::ok(data),
            Err(DispatchError::Reply(err)) => {
                // A session-fatal error means the agent side is gone; don't
                // wait for a bye to clean the wreck up.
                if session_is_dead(&err) {
                    teardown_session(&proxy, &mut state).await;
                }
                Response::fail(err.to_string())
            }
            Err(DispatchError::Fatal(err)) => {
                tracing::debug!(client = state.id, error = %err, "fatal client error");
                break;
            }
        };

        if conn.write_response(&response).await.is_err() {
            break;
        }
    }

    // A vanished client is a `bye` from that client.
    release_session(&proxy, &mut state).await;
    tracing::debug!(client = state.id, "client disconnected");
}

/// Route one request to its handler.
async fn dispatch(
    proxy: &Proxy,
    conn: &mut ClientConn,
    state: &mut ClientState,
    id: &str,
    data: Option<Value>,
) -> Result<Option<Value>, DispatchError> {
    match parse_request(id, data)? {
        ClientRequest::Hello(hello) => {
            handle_hello(proxy, state, &hello).await.map_err(DispatchError::Reply)
        }
        ClientRequest::Attach(attach) => {
            handle_attach(proxy, state, &attach).await.map_err(DispatchError::Reply)
        }
        ClientRequest::AllocateIo(allocate) => {
            // The fd rides right behind the request; a failed handoff
            // desynchronizes the stream beyond recovery.
            let shim = conn.recv_fd().await.map_err(DispatchError::Fatal)?;
            handle_allocate_io(state, &allocate, shim).await.map_err(DispatchError::Reply)
        }
        ClientRequest::Hyper(hyper) => {
            handle_hyper(state, hyper).await.map_err(DispatchError::Reply)
        }
        ClientRequest::Bye => handle_bye(proxy, state).await.map_err(DispatchError::Reply),
    }
}

/// Lower the wire `id`/`data` pair into a [`ClientRequest`].
fn parse_request(id: &str, data: Option<Value>) -> Result<ClientRequest, DispatchError> {
    match id {
        "hello" => Ok(ClientRequest::Hello(parse_data(data, id)?)),
        "attach" => Ok(ClientRequest::Attach(parse_data(data, id)?)),
        "allocateIO" => Ok(ClientRequest::AllocateIo(parse_data(data, id)?)),
        "hyper" => Ok(ClientRequest::Hyper(parse_data(data, id)?)),
        "bye" => Ok(ClientRequest::Bye),
        other => Err(DispatchError::Reply(ProxyError::Malformed(format!(
            "no payload named '{other}'"
        )))),
    }
}

/// Deserialize the `data` field for RPC `id`.
fn parse_data<T: DeserializeOwned>(data: Option<Value>, id: &str) -> Result<T, DispatchError> {
    let data = data.ok_or_else(|| malformed(id))?;
    serde_json::from_value(data).map_err(|_| malformed(id))
}

fn malformed(id: &str) -> DispatchError {
    DispatchError::Reply(ProxyError::Malformed(format!("malformed {id} command")))
}

/// `hello`: register the VM, connect to its agent, associate the client.
async fn handle_hello(
    proxy: &Proxy,
    state: &mut ClientState,
    hello: &Hello,
) -> Result<Option<Value>, ProxyError> {
    if state.session.is_some() {
        return Err(ProxyError::Malformed("client already associated with a vm".into()));
    }
    if hello.container_id.is_empty() || hello.ctl_serial.is_empty() || hello.io_serial.is_empty() {
        return Err(ProxyError::Malformed("malformed hello command".into()));
    }

    // Registration precedes connect so concurrent hellos for one container
    // race on the registry slot, not on half-connected sessions.
    let session = proxy
        .registry()
        .register(
            &hello.container_id,
            std::path::Path::new(&hello.ctl_serial),
            std::path::Path::new(&hello.io_serial),
        )
        .await?;

    let connected = async {
        session.connect().await?;
        session.attach(state.id).await
    }
    .await;

    if let Err(err) = connected {
        proxy.registry().deregister_session(&session).await;
        session.close().await;
        return Err(err);
    }

    state.session = Some(session);
    Ok(None)
}

/// `attach`: associate the client with an existing session.
async fn handle_attach(
    proxy: &Proxy,
    state: &mut ClientState,
    attach: &Attach,
) -> Result<Option<Value>, ProxyError> {
    if state.session.is_some() {
        return Err(ProxyError::Malformed("client already associated with a vm".into()));
    }

    let session =
        proxy.registry().lookup(&attach.container_id).await.ok_or(ProxyError::NotRegistered)?;
    session.attach(state.id).await?;
    state.session = Some(session);
    Ok(None)
}

/// `allocateIO`: reserve sequences for the shim fd the client passed.
async fn handle_allocate_io(
    state: &mut ClientState,
    allocate: &AllocateIo,
    shim: OwnedFd,
) -> Result<Option<Value>, ProxyError> {
    let session = state.session.clone().ok_or(ProxyError::NotAssociated)?;
    if allocate.n_streams == 0 {
        return Err(ProxyError::Malformed("malformed allocateIO command".into()));
    }

    let shim = std::os::unix::net::UnixStream::from(shim);
    shim.set_nonblocking(true)?;
    let shim = UnixStream::from_std(shim)?;

    let base = session.allocate_io(allocate.n_streams, shim).await?;
    Ok(Some(json!({ "ioBase": base })))
}

/// `hyper`: lower the named command onto the agent channel.
async fn handle_hyper(state: &mut ClientState, hyper: Hyper) -> Result<Option<Value>, ProxyError> {
    let session = state.session.clone().ok_or(ProxyError::NotAssociated)?;

    let command = AgentCommand::from_name(&hyper.hyper_name).ok_or_else(|| {
        ProxyError::Malformed(format!("unknown hyper command '{}'", hyper.hyper_name))
    })?;

    let payload = match &hyper.data {
        Some(data) => serde_json::to_vec(data)
            .map_err(|err| ProxyError::Malformed(format!("malformed hyper data: {err}")))?
            .into(),
        None => bytes::Bytes::new(),
    };

    session.send_agent(command.code(), payload).await?;
    Ok(None)
}

/// `bye`: detach; the creator's departure (or the last one) tears down.
async fn handle_bye(proxy: &Proxy, state: &mut ClientState) -> Result<Option<Value>, ProxyError> {
    if state.session.is_none() {
        return Err(ProxyError::NotAssociated);
    }

    release_session(proxy, state).await;
    Ok(None)
}

/// Whether an error from a handler means the session itself is beyond use.
///
/// `Io` and `Malformed` stay out of the list: they also cover faults local
/// to one client (a dud shim fd, a bad payload). An agent-socket fault
/// poisons the channel, so it shows up here as `ChannelClosed` by the next
/// request at the latest.
fn session_is_dead(err: &ProxyError) -> bool {
    matches!(err, ProxyError::Protocol(_) | ProxyError::ChannelClosed)
}

/// Detach `state`'s session if any; tear it down when the detach says so.
async fn release_session(proxy: &Proxy, state: &mut ClientState) {
    let Some(session) = state.session.take() else {
        return;
    };

    if session.detach(state.id).await {
        proxy.registry().deregister_session(&session).await;
        session.close().await;
    }
}

/// Forcefully deregister and close `state`'s session after a fault.
async fn teardown_session(proxy: &Proxy, state: &mut ClientState) {
    let Some(session) = state.session.take() else {
        return;
    };

    tracing::warn!(cid = session.cid(), "tearing down faulted session");
    proxy.registry().deregister_session(&session).await;
    session.close().await;
}
