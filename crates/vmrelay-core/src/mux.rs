//! I/O multiplexer: sequence numbers to shim connections.
//!
//! Every process stream inside the VM is addressed by a 64-bit sequence
//! number on the agent's I/O socket. A shim reserves a contiguous range of
//! sequences with [`IoMultiplexer::allocate`] and hands over its connection;
//! from then on the multiplexer routes agent frames for those sequences to
//! the shim and wraps bytes read from the shim into frames tagged with the
//! range's base sequence.
//!
//! Each allocation owns a child cancellation token. Removing the allocation
//! cancels it, which unwinds the per-shim reader task; once the reader's
//! read half and the map's write half are both dropped, the shim fd is
//! closed, exactly once.

use std::{collections::HashMap, sync::Arc};

use bytes::Bytes;
use tokio::{
    io::{AsyncReadExt, AsyncWriteExt},
    net::{UnixStream, unix::OwnedWriteHalf},
    sync::Mutex,
    task::JoinHandle,
};
use tokio_util::sync::CancellationToken;
use vmrelay_proto::IoMessage;

use crate::channel::AgentChannel;

/// First sequence number handed out by a fresh session.
///
/// The low 32-bit space is left untouched; the agent uses small well-known
/// sequences internally and a proxy-allocated stream must never collide
/// with them.
pub const FIRST_SEQ: u64 = 1 << 32;

/// Read chunk size for shim connections.
const SHIM_READ_BUF: usize = 8 * 1024;

/// One shim's claim on a range of sequences.
///
/// Every sequence in the range maps to a clone of this record; the range is
/// anchored by `base`, the lowest (and frame-tagging) sequence.
#[derive(Debug, Clone)]
struct Subscriber {
    base: u64,
    count: u32,
    writer: Arc<Mutex<OwnedWriteHalf>>,
    cancel: CancellationToken,
}

#[derive(Debug, Default)]
struct MuxState {
    next_seq: u64,
    subscribers: HashMap<u64, Subscriber>,
}

/// Routes I/O frames between the agent socket and subscribed shims.
#[derive(Debug)]
pub struct IoMultiplexer {
    channel: Arc<AgentChannel>,
    /// Parent for per-allocation cancellation tokens.
    shutdown: CancellationToken,
    state: Mutex<MuxState>,
}

impl IoMultiplexer {
    /// Create a multiplexer forwarding through `channel`.
    #[must_use]
    pub fn new(channel: Arc<AgentChannel>) -> Self {
        let shutdown = channel.shutdown_token();
        Self {
            channel,
            shutdown,
            state: Mutex::new(MuxState { next_seq: FIRST_SEQ, subscribers: HashMap::new() }),
        }
    }

    /// Reserve `n` consecutive sequences for `shim` and start its reader.
    ///
    /// Returns the base sequence of the reserved range `[base, base + n)`
    /// and the reader task handle for the session's join barrier. Bytes the
    /// shim writes are framed with `base`; frames the agent emits for any
    /// sequence in the range are written back to the shim.
    pub async fn allocate(self: &Arc<Self>, n: u32, shim: UnixStream) -> (u64, JoinHandle<()>) {
        let (read_half, write_half) = shim.into_split();
        let cancel = self.shutdown.child_token();
        let writer = Arc::new(Mutex::new(write_half));

        let base = {
            let mut state = self.state.lock().await;
            let base = state.next_seq;
            state.next_seq += u64::from(n);

            let subscriber =
                Subscriber { base, count: n, writer: Arc::clone(&writer), cancel: cancel.clone() };
            for seq in base..base + u64::from(n) {
                state.subscribers.insert(seq, subscriber.clone());
            }
            base
        };

        tracing::debug!(base, n, "allocated I/O sequences");

        let mux = Arc::clone(self);
        let handle = tokio::spawn(async move {
            shim_reader(mux, base, read_half, cancel).await;
        });

        (base, handle)
    }

    /// Route one inbound agent frame to its subscriber.
    ///
    /// A frame for an unknown sequence is dropped. An empty payload is the
    /// agent's EOF marker and half-closes the shim's write side. A write
    /// failure removes the whole allocation; the shim is gone.
    pub async fn deliver(&self, seq: u64, payload: Bytes) {
        let subscriber = {
            let state = self.state.lock().await;
            state.subscribers.get(&seq).cloned()
        };

        let Some(subscriber) = subscriber else {
            tracing::debug!(seq, len = payload.len(), "dropping frame for unknown sequence");
            return;
        };

        // The cancel arm keeps teardown joinable: a shim that stopped
        // reading would otherwise park this writer forever.
        let result = tokio::select! {
            biased;
            () = subscriber.cancel.cancelled() => {
                Err(std::io::Error::other("subscription cancelled"))
            }
            result = async {
                let mut writer = subscriber.writer.lock().await;
                if payload.is_empty() {
                    writer.shutdown().await
                } else {
                    writer.write_all(&payload).await
                }
            } => result,
        };

        if let Err(err) = result {
            tracing::debug!(seq, error = %err, "shim write failed, removing allocation");
            self.remove_allocation(subscriber.base).await;
        }
    }

    /// Remove the allocation anchored at `base` and release its shim.
    ///
    /// Safe to call for an already-removed base. Cancelling the allocation
    /// token makes the shim reader unwind and drop the read half; dropping
    /// the map entries releases the write half.
    pub async fn remove_allocation(&self, base: u64) {
        let removed = {
            let mut state = self.state.lock().await;
            let Some(subscriber) = state.subscribers.get(&base).cloned() else {
                return;
            };
            for seq in subscriber.base..subscriber.base + u64::from(subscriber.count) {
                state.subscribers.remove(&seq);
            }
            subscriber
        };

        removed.cancel.cancel();
        tracing::debug!(base = removed.base, "removed I/O allocation");
    }

    /// Drop every remaining subscription. Used during session teardown,
    /// after the agent sockets are closed.
    pub async fn clear(&self) {
        let drained: Vec<Subscriber> = {
            let mut state = self.state.lock().await;
            state.subscribers.drain().map(|(_, sub)| sub).collect()
        };

        for subscriber in &drained {
            subscriber.cancel.cancel();
        }
    }

    /// Number of live subscribed sequences.
    pub async fn subscription_count(&self) -> usize {
        self.state.lock().await.subscribers.len()
    }
}

/// Per-shim reader: wrap shim bytes into I/O frames tagged with `base`.
///
/// Exits when the shim closes, when a forward to the agent fails, or when
/// the allocation token is cancelled. On clean shim EOF an EOF marker frame
/// is forwarded so the in-VM process sees its stdin close.
async fn shim_reader(
    mux: Arc<IoMultiplexer>,
    base: u64,
    mut read_half: tokio::net::unix::OwnedReadHalf,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; SHIM_READ_BUF];

    loop {
        tokio::select! {
            biased;
            () = cancel.cancelled() => return,
            read = read_half.read(&mut buf) => match read {
                Ok(0) => {
                    let _ = mux.channel.write_io(&IoMessage::eof(base)).await;
                    break;
                }
                Ok(n) => {
                    let msg = IoMessage::new(base, Bytes::copy_from_slice(&buf[..n]));
                    if mux.channel.write_io(&msg).await.is_err() {
                        break;
                    }
                }
                Err(err) => {
                    tracing::debug!(base, error = %err, "shim read failed");
                    break;
                }
            }
        }
    }

    mux.remove_allocation(base).await;
}
