//! Stub: the calling endpoint.
//!
//! [`Stub::invoke`] hands a call to the sender loop and parks the caller on
//! a oneshot reply slot. Two loops own the transport:
//!
//! ```text
//! invoke() ─► mpsc ─► Sender loop ──► write half ──► skel
//!    ▲                    │ insert(id)
//!    │                PendingCalls
//!    │                    │ complete(id)
//!    └── oneshot ◄── Receiver loop ◄── read half ◄── skel
//! ```
//!
//! The sender loop assigns correlation ids (1, 2, 3, ...) and records the
//! reply slot before the invocation is written, so a fast response always
//! finds its entry. Responses may arrive in any order; each wakes exactly
//! the caller whose id it echoes. Responses for unknown ids are discarded.
//!
//! When the read half ends, or [`Stub::close`] is called, the receiver loop
//! answers every waiting caller with [`RiiError::ConnectionClosed`] and
//! posts a quit message so the sender loop stops and shuts the write half.
//!
//! # Example
//!
//! ```ignore
//! use riiwire::Stub;
//!
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let stub = Stub::builder()
//!     .call_timeout(std::time::Duration::from_secs(5))
//!     .start_stream(client_io);
//!
//! let sum: i64 = stub.invoke(0, &(2, 7)).await?;
//! stub.close().await;
//! ```

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, oneshot};

use crate::codec::MsgPackCodec;
use crate::endpoint::{Lifecycle, LoopSignals};
use crate::error::{Result, RiiError};
use crate::pending::{PendingCalls, ReplySlot};
use crate::protocol::{
    Frame, FrameReader, Invocation, Response, ABSOLUTE_MAX_PAYLOAD_SIZE, DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::writer::FrameWriter;

/// Default capacity of the outbound request queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for a stub.
#[derive(Debug, Clone)]
pub struct StubConfig {
    /// Capacity of the queue between callers and the sender loop.
    pub channel_capacity: usize,
    /// Largest response payload accepted.
    pub max_payload_size: u32,
    /// Deadline applied to every call without an explicit one.
    pub call_timeout: Option<Duration>,
}

impl Default for StubConfig {
    fn default() -> Self {
        Self {
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
            call_timeout: None,
        }
    }
}

/// Builder for configuring and starting a [`Stub`].
#[derive(Debug, Clone, Default)]
pub struct StubBuilder {
    config: StubConfig,
}

impl StubBuilder {
    /// Create a builder with default configuration.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the default per-call deadline.
    ///
    /// Default: none, calls wait until answered or the connection closes.
    pub fn call_timeout(mut self, timeout: Duration) -> Self {
        self.config.call_timeout = Some(timeout);
        self
    }

    /// Set the outbound request queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Set the largest response payload accepted.
    ///
    /// Default: 64 MiB
    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.config.max_payload_size = limit.min(ABSOLUTE_MAX_PAYLOAD_SIZE);
        self
    }

    /// Start the stub on a read half and a write half.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<Rd, Wr>(self, reader: Rd, writer: Wr) -> Stub
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        Stub::spawn(self.config, reader, writer)
    }

    /// Start the stub on a bidirectional stream.
    pub fn start_stream<S>(self, stream: S) -> Stub
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer)
    }
}

/// Message from callers to the sender loop.
enum Outbound {
    Call(OutboundCall),
    /// Posted by the receiver loop on shutdown. Never written to the wire.
    Quit,
}

struct OutboundCall {
    function: u32,
    args: Bytes,
    reply: ReplySlot,
}

/// A running stub.
///
/// Calls may be issued concurrently from any number of tasks through a
/// shared reference. Dropping the stub stops both loops.
pub struct Stub {
    requests: mpsc::Sender<Outbound>,
    pending: Arc<PendingCalls>,
    lifecycle: Lifecycle,
    call_timeout: Option<Duration>,
}

impl Stub {
    /// Create a new stub builder.
    pub fn builder() -> StubBuilder {
        StubBuilder::new()
    }

    /// Start a stub with default configuration.
    pub fn new<Rd, Wr>(reader: Rd, writer: Wr) -> Self
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        StubBuilder::new().start(reader, writer)
    }

    fn spawn<Rd, Wr>(config: StubConfig, reader: Rd, writer: Wr) -> Self
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        let (requests_tx, requests_rx) = mpsc::channel(config.channel_capacity);
        let pending = Arc::new(PendingCalls::new());
        let (mut lifecycle, signals) = Lifecycle::new();

        let sender = tokio::spawn(sender_loop(
            requests_rx,
            FrameWriter::new(writer),
            pending.clone(),
            signals.clone(),
        ));
        let receiver = tokio::spawn(receiver_loop(
            FrameReader::new(reader, config.max_payload_size),
            pending.clone(),
            requests_tx.clone(),
            signals,
        ));
        lifecycle.attach("sender", sender);
        lifecycle.attach("receiver", receiver);

        tracing::debug!("Stub started");

        Self {
            requests: requests_tx,
            pending,
            lifecycle,
            call_timeout: config.call_timeout,
        }
    }

    /// Call remote function `function` with `args` and decode its results.
    ///
    /// `args` is the argument list; use a tuple for several arguments and
    /// `()` for none. The stub's default deadline applies, if any.
    pub async fn invoke<A, T>(&self, function: u32, args: &A) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let args = Bytes::from(MsgPackCodec::encode(args)?);
        let results = self.call(function, args, self.call_timeout).await?;
        MsgPackCodec::decode(&results)
    }

    /// Like [`invoke`](Self::invoke) with an explicit deadline.
    pub async fn invoke_timeout<A, T>(&self, function: u32, args: &A, timeout: Duration) -> Result<T>
    where
        A: Serialize + ?Sized,
        T: DeserializeOwned,
    {
        let args = Bytes::from(MsgPackCodec::encode(args)?);
        let results = self.call(function, args, Some(timeout)).await?;
        MsgPackCodec::decode(&results)
    }

    /// Call with an already encoded argument list; returns the raw results.
    pub async fn invoke_raw(&self, function: u32, args: Bytes) -> Result<Bytes> {
        self.call(function, args, self.call_timeout).await
    }

    async fn call(&self, function: u32, args: Bytes, timeout: Option<Duration>) -> Result<Bytes> {
        if !self.is_alive() {
            return Err(RiiError::ConnectionClosed);
        }

        let (reply, outcome) = oneshot::channel();
        let call = Outbound::Call(OutboundCall {
            function,
            args,
            reply,
        });

        // Queueing counts against the deadline too: a full queue must not
        // outlast it.
        let exchange = async {
            if self.requests.send(call).await.is_err() {
                return Err(RiiError::ConnectionClosed);
            }
            outcome.await.unwrap_or(Err(RiiError::ConnectionClosed))
        };

        let Some(after) = timeout else {
            return exchange.await;
        };

        match tokio::time::timeout(after, exchange).await {
            Ok(result) => result,
            Err(_) => {
                // The reply slot is gone now; forget its entry.
                self.pending.prune_abandoned();
                tracing::debug!("Call to function {} timed out after {:?}", function, after);
                Err(RiiError::Timeout { function, after })
            }
        }
    }

    /// Whether both loops are still running.
    pub fn is_alive(&self) -> bool {
        self.lifecycle.is_alive()
    }

    /// Number of calls waiting for a response.
    pub fn pending_calls(&self) -> usize {
        self.pending.len()
    }

    /// Close the stub and wait for both loops to stop.
    ///
    /// Every waiting caller is answered with `ConnectionClosed`. Safe to call
    /// more than once and from several tasks.
    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    /// Wait until both loops have stopped, e.g. because the skel went away.
    pub async fn closed(&self) {
        self.lifecycle.join().await;
    }
}

/// Writes invocations in queue order until the quit message arrives.
///
/// A close request stops the loop even in the middle of a write, so a peer
/// that stopped reading cannot keep `close()` waiting.
async fn sender_loop<W>(
    mut requests: mpsc::Receiver<Outbound>,
    mut writer: FrameWriter<W>,
    pending: Arc<PendingCalls>,
    mut signals: LoopSignals,
) where
    W: AsyncWrite + Unpin,
{
    let mut next_id: u64 = 0;
    let mut close_requested = false;

    loop {
        let outbound = tokio::select! {
            biased;
            _ = signals.shutdown_requested() => {
                close_requested = true;
                break;
            }
            outbound = requests.recv() => outbound,
        };

        let call = match outbound {
            Some(Outbound::Call(call)) => call,
            Some(Outbound::Quit) | None => {
                tracing::debug!("Sender loop received quit");
                break;
            }
        };

        if call.reply.is_closed() {
            tracing::debug!("Caller of function {} gave up before sending", call.function);
            continue;
        }

        next_id += 1;
        let id = next_id;
        let invocation = Invocation::new(id, call.function, call.args);

        let frame = match invocation.to_frame() {
            Ok(frame) => frame,
            Err(e) => {
                let _ = call.reply.send(Err(e));
                continue;
            }
        };

        if let Err(reply) = pending.insert(id, call.reply) {
            let _ = reply.send(Err(RiiError::ConnectionClosed));
            continue;
        }
        // The caller may have timed out between the check above and the insert.
        if pending.discard_abandoned(id) {
            tracing::debug!("Caller of call {} gave up before sending", id);
            continue;
        }

        let written = tokio::select! {
            biased;
            _ = signals.shutdown_requested() => {
                tracing::debug!("Sender loop: close requested while writing call {}", id);
                if let Some(reply) = pending.complete(id) {
                    let _ = reply.send(Err(RiiError::ConnectionClosed));
                }
                close_requested = true;
                break;
            }
            written = writer.write_frame(&frame) => written,
        };

        if let Err(e) = written {
            tracing::error!(
                "Failed to send invocation {} of function {}: {}",
                id,
                invocation.function,
                e
            );
            if let Some(reply) = pending.complete(id) {
                let _ = reply.send(Err(e));
            }
        }
    }

    requests.close();
    while let Ok(outbound) = requests.try_recv() {
        if let Outbound::Call(call) = outbound {
            let _ = call.reply.send(Err(RiiError::ConnectionClosed));
        }
    }

    if close_requested {
        // A half-written frame may be stuck in the writer; just let it go.
        drop(writer);
    } else if let Err(e) = writer.shutdown().await {
        tracing::debug!("Stub write half already closed: {}", e);
    }
    tracing::debug!("Sender loop stopped after {} invocations", next_id);
}

/// Routes responses to waiting callers until the stream ends or close is requested.
async fn receiver_loop<R>(
    mut frames: FrameReader<R>,
    pending: Arc<PendingCalls>,
    requests: mpsc::Sender<Outbound>,
    mut signals: LoopSignals,
) where
    R: AsyncRead + Unpin,
{
    loop {
        let next = tokio::select! {
            biased;
            _ = signals.shutdown_requested() => {
                tracing::debug!("Receiver loop: close requested");
                break;
            }
            next = frames.next_frame() => next,
        };

        match next {
            Ok(Some(frame)) => deliver(frame, &pending),
            Ok(None) => {
                tracing::debug!("Receiver loop: skel closed the connection");
                break;
            }
            Err(e) => {
                tracing::error!("Receiver loop read error: {}", e);
                break;
            }
        }
    }

    // Dropping the reader here releases the read half.
    drop(frames);
    signals.mark_stopped();

    let abandoned = pending.close_all(|| RiiError::ConnectionClosed);
    if abandoned > 0 {
        tracing::debug!("Answered {} pending calls with ConnectionClosed", abandoned);
    }

    let _ = requests.send(Outbound::Quit).await;
    tracing::debug!("Receiver loop stopped");
}

fn deliver(frame: Frame, pending: &PendingCalls) {
    let response = match Response::from_frame(frame) {
        Ok(response) => response,
        Err(RiiError::Malformed { id: Some(id), reason }) => {
            tracing::warn!("Malformed response for call {}: {}", id, reason);
            if let Some(reply) = pending.complete(id) {
                let _ = reply.send(Err(RiiError::Malformed {
                    id: Some(id),
                    reason,
                }));
            }
            return;
        }
        Err(e) => {
            tracing::warn!("Discarding undecodable response: {}", e);
            return;
        }
    };

    let id = response.id;
    match pending.complete(id) {
        Some(reply) => {
            if reply.send(response.into_result()).is_err() {
                tracing::debug!("Caller of call {} stopped waiting", id);
            }
        }
        None => tracing::warn!("Discarding response for unknown call {}", id),
    }
}
