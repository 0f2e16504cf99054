//! End-to-end tests: JSON client protocol through the daemon to a mock
//! agent, fd passing included.

use std::{os::fd::AsFd, path::PathBuf, sync::Arc, time::Duration};

use serde_json::json;
use tempfile::TempDir;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::UnixListener,
    task::JoinHandle,
};
use vmrelay_client::{Client, ClientError};
use vmrelay_harness::MockAgent;
use vmrelay_proto::{AgentCommand, client::Response};
use vmrelayd::Proxy;

const PING: u32 = AgentCommand::Ping as u32;
const STARTPOD: u32 = AgentCommand::StartPod as u32;

struct Rig {
    agent: MockAgent,
    _dir: TempDir,
    socket_path: PathBuf,
    proxy_task: JoinHandle<()>,
}

impl Rig {
    async fn start() -> Self {
        let agent = MockAgent::start();
        let dir = TempDir::new().unwrap();
        let socket_path = dir.path().join("proxy.sock");

        let listener = std::os::unix::net::UnixListener::bind(&socket_path).unwrap();
        listener.set_nonblocking(true).unwrap();
        let listener = UnixListener::from_std(listener).unwrap();

        let proxy = Arc::new(Proxy::new());
        let proxy_task = tokio::spawn(proxy.run(listener));

        Self { agent, _dir: dir, socket_path, proxy_task }
    }

    async fn client(&self) -> Client {
        Client::connect(&self.socket_path).await.unwrap()
    }

    /// The mock agent's socket paths as strings for `hello`.
    fn agent_paths(&self) -> (String, String) {
        let (ctl, io) = self.agent.socket_paths();
        (ctl.to_string_lossy().into_owned(), io.to_string_lossy().into_owned())
    }

    async fn stop(self) {
        self.proxy_task.abort();
        self.agent.stop().await;
    }
}

fn paths_of(agent: &MockAgent) -> (String, String) {
    let (ctl, io) = agent.socket_paths();
    (ctl.to_string_lossy().into_owned(), io.to_string_lossy().into_owned())
}

#[tokio::test]
async fn hello_registers_exactly_once() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut first = rig.client().await;
    first.hello("C", &ctl, &io).await.unwrap();

    // A second hello for the same container fails deterministically and
    // never dials the agent.
    let mut second = rig.client().await;
    let err = second.hello("C", "fooCtl", "fooIo").await.unwrap_err();
    assert_eq!(err.to_string(), "container already registered");

    assert!(rig.agent.take_commands().await.is_empty());
    rig.stop().await;
}

#[tokio::test]
async fn malformed_hello_is_rejected() {
    let rig = Rig::start().await;
    let (_ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    let err = client.hello("C", "", &io).await.unwrap_err();
    assert_eq!(err.to_string(), "malformed hello command");

    rig.stop().await;
}

#[tokio::test]
async fn attach_joins_an_existing_session() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut creator = rig.client().await;
    creator.hello("C", &ctl, &io).await.unwrap();

    let mut attacher = rig.client().await;
    assert!(attacher.attach("nope").await.is_err());
    attacher.attach("C").await.unwrap();

    // A non-creator bye detaches without tearing the session down.
    attacher.bye().await.unwrap();
    creator.hyper("ping", None).await.unwrap();
    assert_eq!(rig.agent.wait_commands(1).await[0].code, PING);

    rig.stop().await;
}

#[tokio::test]
async fn hyper_ping_sends_one_empty_frame() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();
    client.hyper("ping", None).await.unwrap();

    let commands = rig.agent.wait_commands(1).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].code, PING);
    assert!(commands[0].payload.is_empty());

    rig.stop().await;
}

#[tokio::test]
async fn hyper_startpod_forwards_its_payload() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();
    client
        .hyper("startpod", Some(json!({ "hostname": "h", "shareDir": "rootfs" })))
        .await
        .unwrap();

    let commands = rig.agent.wait_commands(1).await;
    assert_eq!(commands[0].code, STARTPOD);

    let decoded: serde_json::Value = serde_json::from_slice(&commands[0].payload).unwrap();
    assert_eq!(decoded["hostname"], "h");
    assert_eq!(decoded["shareDir"], "rootfs");

    rig.stop().await;
}

#[tokio::test]
async fn unknown_hyper_name_is_a_client_error() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();

    let err = client.hyper("frobnicate", None).await.unwrap_err();
    assert!(matches!(err, ClientError::Rpc(_)));
    assert!(rig.agent.take_commands().await.is_empty());

    rig.stop().await;
}

#[tokio::test]
async fn agent_error_reaches_the_client() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();

    rig.agent.fail_next_command("pod exploded").await;
    let err = client.hyper("ping", None).await.unwrap_err();
    assert_eq!(err.to_string(), "pod exploded");

    rig.stop().await;
}

#[tokio::test]
async fn allocate_io_round_trip() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();

    let (shim_local, shim_remote) = std::os::unix::net::UnixStream::pair().unwrap();
    let base = client.allocate_io(1, shim_remote.as_fd()).await.unwrap();
    drop(shim_remote); // the proxy holds its own copy now

    assert!(base >= 1 << 32);

    shim_local.set_nonblocking(true).unwrap();
    let mut shim = tokio::net::UnixStream::from_std(shim_local).unwrap();

    // Shim → agent, framed with the allocated base sequence.
    shim.write_all(b"stdin bytes").await.unwrap();
    let frames = rig.agent.wait_io_frames(1).await;
    assert_eq!(frames, vec![(base, b"stdin bytes".to_vec())]);

    // Agent → shim.
    rig.agent.send_io(base, &b"stdout bytes"[..]);
    let mut buf = [0u8; 12];
    shim.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"stdout bytes");

    // Shim dies; a late frame for its sequence must not wedge the proxy.
    drop(shim);
    rig.agent.send_io(base, &b"too late"[..]);
    client.hyper("ping", None).await.unwrap();

    rig.stop().await;
}

#[tokio::test]
async fn second_allocation_is_contiguous() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut client = rig.client().await;
    client.hello("C", &ctl, &io).await.unwrap();

    let (_a_local, a_remote) = std::os::unix::net::UnixStream::pair().unwrap();
    let (_b_local, b_remote) = std::os::unix::net::UnixStream::pair().unwrap();

    let first = client.allocate_io(2, a_remote.as_fd()).await.unwrap();
    let second = client.allocate_io(1, b_remote.as_fd()).await.unwrap();
    assert_eq!(second, first + 2);

    rig.stop().await;
}

#[tokio::test]
async fn bye_from_creator_tears_down_and_frees_the_cid() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let mut creator = rig.client().await;
    creator.hello("D", &ctl, &io).await.unwrap();
    creator.bye().await.unwrap();

    // Bye while not associated is an error.
    assert!(creator.bye().await.is_err());

    // The session is gone from the registry...
    let mut other = rig.client().await;
    let err = other.attach("D").await.unwrap_err();
    assert_eq!(err.to_string(), "container not registered");

    // ...and the cid is reusable against a fresh agent.
    let second_agent = MockAgent::start();
    let (ctl2, io2) = paths_of(&second_agent);
    other.hello("D", &ctl2, &io2).await.unwrap();

    rig.stop().await;
    second_agent.stop().await;
}

#[tokio::test]
async fn creator_disconnect_acts_as_bye() {
    let rig = Rig::start().await;
    let (ctl, io) = rig.agent_paths();

    let creator = {
        let mut client = rig.client().await;
        client.hello("E", &ctl, &io).await.unwrap();
        client
    };
    drop(creator);

    // The registry entry disappears once the disconnect is processed.
    tokio::time::timeout(Duration::from_secs(5), async {
        loop {
            let mut probe = rig.client().await;
            match probe.attach("E").await {
                Err(err) if err.to_string() == "container not registered" => break,
                _ => tokio::time::sleep(Duration::from_millis(10)).await,
            }
        }
    })
    .await
    .expect("session was never deregistered");

    rig.stop().await;
}

#[tokio::test]
async fn protocol_level_errors() {
    let rig = Rig::start().await;

    let mut raw = tokio::net::UnixStream::connect(&rig.socket_path).await.unwrap();

    raw.write_all(b"{\"id\":\"frobnicate\"}\n").await.unwrap();
    let response = read_response(&mut raw).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("no payload named 'frobnicate'"));

    raw.write_all(b"{\"data\":{}}\n").await.unwrap();
    let response = read_response(&mut raw).await.unwrap();
    assert!(!response.success);
    assert_eq!(response.error.as_deref(), Some("no 'id' field in request"));

    // RPCs that need an association fail without one.
    raw.write_all(b"{\"id\":\"hyper\",\"data\":{\"hyperName\":\"ping\"}}\n").await.unwrap();
    let response = read_response(&mut raw).await.unwrap();
    assert!(!response.success);

    // Malformed JSON is fatal to the connection.
    raw.write_all(b"this is not json\n").await.unwrap();
    assert!(read_response(&mut raw).await.is_none(), "connection should be closed");

    rig.stop().await;
}

/// Read one newline-terminated response off a raw stream.
async fn read_response(stream: &mut tokio::net::UnixStream) -> Option<Response> {
    let mut line = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte).await {
            Ok(0) | Err(_) => return None,
            Ok(_) if byte[0] == b'\n' => break,
            Ok(_) => line.push(byte[0]),
        }
    }
    serde_json::from_slice(&line).ok()
}
