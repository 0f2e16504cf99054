//! Session behavior against a mock agent.
//!
//! These tests drive a real [`Session`] over real unix sockets: handshake,
//! serialized control calls, I/O allocation and routing, shim-disconnect
//! cleanup, and fd accounting across a full lifecycle.

use std::{sync::Arc, time::Duration};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixListener, UnixStream},
};
use vmrelay_core::{FIRST_SEQ, ProxyError, Session, SessionState};
use vmrelay_harness::{FdSnapshot, MockAgent};
use vmrelay_proto::{AgentCommand, CtlMessage};

const PING: u32 = AgentCommand::Ping as u32;

async fn connected_session(agent: &MockAgent) -> Session {
    let (ctl, io) = agent.socket_paths();
    let session = Session::new("testVM", ctl, io);
    session.connect().await.unwrap();
    session
}

/// Poll until every I/O subscription of `session` is gone.
async fn wait_for_no_subscriptions(session: &Session) {
    tokio::time::timeout(Duration::from_secs(5), async {
        while session.io_session_count().await != 0 {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await
    .expect("io sessions were not cleaned up in time");
}

#[tokio::test]
async fn connect_performs_ready_handshake() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    assert_eq!(session.state().await, SessionState::Connected);
    // The handshake itself sends nothing to the agent.
    assert!(agent.take_commands().await.is_empty());

    session.close().await;
    assert_eq!(session.state().await, SessionState::Closed);
    agent.stop().await;
}

#[tokio::test]
async fn connect_rejects_wrong_handshake() {
    let dir = tempfile::tempdir().unwrap();
    let ctl_path = dir.path().join("ctl.sock");
    let io_path = dir.path().join("io.sock");

    let ctl_listener = UnixListener::bind(&ctl_path).unwrap();
    let io_listener = UnixListener::bind(&io_path).unwrap();

    // An impostor agent that greets with ACK instead of READY.
    let greeter = tokio::spawn(async move {
        let (mut stream, _) = ctl_listener.accept().await.unwrap();
        let _io = io_listener.accept().await.unwrap();

        let msg = CtlMessage::new(AgentCommand::Ack as u32, Bytes::new());
        let mut wire = Vec::new();
        msg.encode(&mut wire).unwrap();
        stream.write_all(&wire).await.unwrap();
    });

    let session = Session::new("testVM", &ctl_path, &io_path);
    let err = session.connect().await.unwrap_err();
    assert!(matches!(err, ProxyError::Protocol(_)), "got {err:?}");
    assert_eq!(session.state().await, SessionState::Created);

    greeter.abort();
}

#[tokio::test]
async fn ping_reaches_agent_with_empty_payload() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let reply = session.send_agent(PING, Bytes::new()).await.unwrap();
    assert!(reply.is_empty());

    let commands = agent.wait_commands(1).await;
    assert_eq!(commands.len(), 1);
    assert_eq!(commands[0].code, PING);
    assert!(commands[0].payload.is_empty());

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn agent_error_surfaces_with_its_message() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    agent.fail_next_command("exec failed").await;
    let err = session.send_agent(PING, Bytes::new()).await.unwrap_err();
    assert!(matches!(&err, ProxyError::Agent(msg) if msg == "exec failed"), "got {err:?}");

    // The channel survives an agent-level error.
    session.send_agent(PING, Bytes::new()).await.unwrap();

    session.close().await;
    agent.stop().await;
}

#[tokio::test(flavor = "multi_thread")]
async fn concurrent_calls_are_serialized() {
    let agent = MockAgent::start();
    let session = Arc::new(connected_session(&agent).await);

    let mut callers = Vec::new();
    for i in 0..8u32 {
        let session = Arc::clone(&session);
        callers.push(tokio::spawn(async move {
            let payload = Bytes::copy_from_slice(&i.to_be_bytes());
            session.send_agent(PING, payload).await
        }));
    }
    for caller in callers {
        caller.await.unwrap().unwrap();
    }

    // Strict serialization means the mock decoded eight clean frames; any
    // interleaving would have corrupted the stream and killed its reader.
    let commands = agent.wait_commands(8).await;
    assert_eq!(commands.len(), 8);
    assert!(commands.iter().all(|c| c.code == PING && c.payload.len() == 4));

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn allocations_are_monotonic_and_contiguous() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let (_shim_a, proxy_a) = UnixStream::pair().unwrap();
    let (_shim_b, proxy_b) = UnixStream::pair().unwrap();

    let base_a = session.allocate_io(2, proxy_a).await.unwrap();
    let base_b = session.allocate_io(3, proxy_b).await.unwrap();

    assert_eq!(base_a, FIRST_SEQ);
    assert_eq!(base_b, base_a + 2, "ranges are contiguous and never reused");

    assert!(matches!(
        session.allocate_io(0, UnixStream::pair().unwrap().1).await,
        Err(ProxyError::Malformed(_))
    ));

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn io_round_trip_through_the_mux() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let (mut shim, proxy_end) = UnixStream::pair().unwrap();
    let base = session.allocate_io(1, proxy_end).await.unwrap();

    // Shim → agent: bytes arrive framed with the allocation's base seq.
    shim.write_all(b"to-agent").await.unwrap();
    let frames = agent.wait_io_frames(1).await;
    assert_eq!(frames, vec![(base, b"to-agent".to_vec())]);

    // Agent → shim: a frame for the seq lands on exactly this shim.
    agent.send_io(base, &b"to-shim"[..]);
    let mut buf = [0u8; 7];
    shim.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"to-shim");

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn shim_eof_is_forwarded_to_the_agent() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let (mut shim, proxy_end) = UnixStream::pair().unwrap();
    let base = session.allocate_io(1, proxy_end).await.unwrap();

    shim.write_all(b"last words").await.unwrap();
    shim.shutdown().await.unwrap();

    let frames = agent.wait_io_frames(2).await;
    assert_eq!(frames[0], (base, b"last words".to_vec()));
    assert_eq!(frames[1], (base, Vec::new()), "EOF marker follows the data");

    wait_for_no_subscriptions(&session).await;

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn shim_gone_cleanup() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let (shim, proxy_end) = UnixStream::pair().unwrap();
    let base = session.allocate_io(1, proxy_end).await.unwrap();

    // The shim dies without warning (SIGKILL'd, say).
    drop(shim);
    wait_for_no_subscriptions(&session).await;

    // The agent keeps emitting for the dead stream; the frames are dropped
    // without wedging the reader or the session.
    agent.send_io(base, &b"late"[..]);
    agent.send_io(base, &b"later"[..]);

    let reply = session.send_agent(PING, Bytes::new()).await.unwrap();
    assert!(reply.is_empty());

    session.close().await;
    agent.stop().await;
}

#[tokio::test]
async fn session_lifecycle_does_not_leak_fds() {
    let before = FdSnapshot::capture().unwrap();

    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    let (shim, proxy_end) = UnixStream::pair().unwrap();
    let _base = session.allocate_io(1, proxy_end).await.unwrap();

    drop(shim);
    wait_for_no_subscriptions(&session).await;

    session.close().await;
    drop(session);
    agent.stop().await;

    let after = FdSnapshot::capture().unwrap();
    let leaked = before.leaked_since(&after);
    assert!(leaked.is_empty(), "leaked fds: {leaked:?}");
}

#[tokio::test]
async fn agent_death_poisons_the_channel() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    agent.stop().await;

    // The first call trips over the dead sockets one way or another...
    assert!(session.send_agent(PING, Bytes::new()).await.is_err());

    // ...and from then on the channel reports itself closed.
    let second = session.send_agent(PING, Bytes::new()).await;
    assert!(matches!(second, Err(ProxyError::ChannelClosed)), "got {second:?}");

    session.close().await;
    assert_eq!(session.state().await, SessionState::Closed);
}

#[tokio::test]
async fn closed_session_rejects_operations() {
    let agent = MockAgent::start();
    let session = connected_session(&agent).await;

    session.close().await;

    assert!(matches!(
        session.send_agent(PING, Bytes::new()).await,
        Err(ProxyError::SessionClosed)
    ));
    assert!(matches!(
        session.allocate_io(1, UnixStream::pair().unwrap().0).await,
        Err(ProxyError::SessionClosed)
    ));
    assert!(matches!(session.attach(7).await, Err(ProxyError::SessionClosed)));

    agent.stop().await;
}

#[tokio::test]
async fn close_fails_inflight_call() {
    let agent = MockAgent::start();
    let session = Arc::new(connected_session(&agent).await);

    // Wedge the agent so the call stays in flight, then close under it.
    agent.set_mute(true);

    let caller = {
        let session = Arc::clone(&session);
        tokio::spawn(async move { session.send_agent(PING, Bytes::new()).await })
    };

    // Make sure the call reached the agent before pulling the rug.
    agent.wait_commands(1).await;
    session.close().await;

    let result = caller.await.unwrap();
    assert!(matches!(result, Err(ProxyError::ChannelClosed)), "got {result:?}");

    agent.stop().await;
}
