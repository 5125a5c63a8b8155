//! Skel: the serving endpoint.
//!
//! A [`Skel`] owns a receiver object and a [`FunctionTable`]. Once started,
//! two loops own the transport:
//!
//! ```text
//!                          ┌─► execution task ─┐
//! read half ─► Dispatcher ─┼─► execution task ─┼─► mpsc ─► Replier ─► write half
//!                          └─► execution task ─┘
//! ```
//!
//! The dispatcher decodes invocations and spawns one execution task per
//! call, bounded by a semaphore. Execution tasks finish in any order and
//! hand their response to the replier, the only writer. A malformed frame
//! is answered with a fault and skipped; only end of stream, a read error
//! or an oversized frame stop the dispatcher.
//!
//! # Example
//!
//! ```ignore
//! use std::sync::Arc;
//! use riiwire::Skel;
//!
//! struct Calculator;
//!
//! let (client_io, server_io) = tokio::io::duplex(64 * 1024);
//! let skel = Skel::new(Calculator)
//!     .function(|_calc: Arc<Calculator>, (a, b): (i64, i64)| async move { Ok(a + b) });
//!
//! let handle = skel.start_stream(server_io);
//! // ...
//! handle.close().await;
//! ```

use std::any::Any;
use std::future::Future;
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::{mpsc, OwnedSemaphorePermit, Semaphore};
use tokio::task::JoinError;

use crate::endpoint::{Lifecycle, LoopSignals};
use crate::error::RiiError;
use crate::handler::{CallResult, FunctionTable, Outcome};
use crate::protocol::{
    Fault, FaultKind, FrameReader, Invocation, Response, ABSOLUTE_MAX_PAYLOAD_SIZE,
    DEFAULT_MAX_PAYLOAD_SIZE,
};
use crate::writer::{FrameWriter, OutboundFrame, MAX_BATCH_SIZE};

/// Default maximum concurrent execution tasks.
pub const DEFAULT_MAX_CONCURRENT_CALLS: usize = 256;

/// Default capacity of the response queue.
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Ids handed to faults for frames whose own id is unusable.
const FALLBACK_ID_BASE: u64 = 1 << 63;

/// Configuration for a skel.
#[derive(Debug, Clone)]
pub struct SkelConfig {
    /// Execution tasks allowed in flight before the dispatcher waits.
    pub max_concurrent_calls: usize,
    /// Capacity of the queue between execution tasks and the replier loop.
    pub channel_capacity: usize,
    /// Largest invocation payload accepted.
    pub max_payload_size: u32,
}

impl Default for SkelConfig {
    fn default() -> Self {
        Self {
            max_concurrent_calls: DEFAULT_MAX_CONCURRENT_CALLS,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            max_payload_size: DEFAULT_MAX_PAYLOAD_SIZE,
        }
    }
}

/// Message to the replier loop.
enum Reply {
    Send(Response),
    /// Posted by the dispatcher on shutdown. Never written to the wire.
    Quit,
}

/// A receiver object with its exported functions, ready to serve.
///
/// Functions are registered before the skel is started; `start` consumes
/// the skel, so the table is read-only while serving.
pub struct Skel<R> {
    receiver: Arc<R>,
    functions: FunctionTable<R>,
    config: SkelConfig,
}

impl<R: Send + Sync + 'static> Skel<R> {
    /// Create a skel around `receiver` with an empty function table.
    pub fn new(receiver: R) -> Self {
        Self::with_shared(Arc::new(receiver))
    }

    /// Create a skel around a receiver that is also used elsewhere.
    pub fn with_shared(receiver: Arc<R>) -> Self {
        Self {
            receiver,
            functions: FunctionTable::new(),
            config: SkelConfig::default(),
        }
    }

    /// Append a function and return its number.
    ///
    /// Numbers are assigned in registration order starting from 0, and a
    /// stub must use the same order.
    pub fn add<F, A, T, Fut>(&mut self, function: F) -> u32
    where
        F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
    {
        self.functions.add(function)
    }

    /// Append a function, builder style.
    pub fn function<F, A, T, Fut>(mut self, function: F) -> Self
    where
        F: Fn(Arc<R>, A) -> Fut + Send + Sync + 'static,
        A: DeserializeOwned + Send + 'static,
        T: Serialize + Send + 'static,
        Fut: Future<Output = CallResult<T>> + Send + 'static,
    {
        self.functions.add(function);
        self
    }

    /// Set the maximum number of concurrent execution tasks.
    ///
    /// When this limit is reached the dispatcher stops reading until a
    /// task finishes.
    /// Default: 256
    pub fn max_concurrent_calls(mut self, limit: usize) -> Self {
        self.config.max_concurrent_calls = limit.max(1);
        self
    }

    /// Set the response queue capacity.
    ///
    /// Default: 1024
    pub fn channel_capacity(mut self, capacity: usize) -> Self {
        self.config.channel_capacity = capacity.max(1);
        self
    }

    /// Set the largest invocation payload accepted.
    ///
    /// Default: 64 MiB
    pub fn max_payload_size(mut self, limit: u32) -> Self {
        self.config.max_payload_size = limit.min(ABSOLUTE_MAX_PAYLOAD_SIZE);
        self
    }

    /// Number of registered functions.
    pub fn function_count(&self) -> usize {
        self.functions.len()
    }

    /// Spawn the dispatcher and replier loops on a read and a write half.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn start<Rd, Wr>(self, reader: Rd, writer: Wr) -> SkelHandle
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        let Skel {
            receiver,
            functions,
            config,
        } = self;

        let (replies_tx, replies_rx) = mpsc::channel(config.channel_capacity);
        let (mut lifecycle, signals) = Lifecycle::new();
        let function_count = functions.len();

        let dispatcher = Dispatcher {
            functions: Arc::new(functions),
            receiver,
            replies: replies_tx,
            semaphore: Arc::new(Semaphore::new(config.max_concurrent_calls)),
        };

        let dispatch = tokio::spawn(dispatcher.run(
            FrameReader::new(reader, config.max_payload_size),
            signals.clone(),
        ));
        let reply = tokio::spawn(replier_loop(replies_rx, FrameWriter::new(writer), signals));
        lifecycle.attach("dispatcher", dispatch);
        lifecycle.attach("replier", reply);

        tracing::debug!("Skel started with {} functions", function_count);

        SkelHandle { lifecycle }
    }

    /// Start on a bidirectional stream.
    pub fn start_stream<S>(self, stream: S) -> SkelHandle
    where
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let (reader, writer) = tokio::io::split(stream);
        self.start(reader, writer)
    }

    /// Serve until the stub hangs up or the transport fails.
    pub async fn serve<Rd, Wr>(self, reader: Rd, writer: Wr)
    where
        Rd: AsyncRead + Unpin + Send + 'static,
        Wr: AsyncWrite + Unpin + Send + 'static,
    {
        self.start(reader, writer).closed().await;
    }
}

/// A running skel.
///
/// Dropping the handle stops the dispatcher, as `close` does.
pub struct SkelHandle {
    lifecycle: Lifecycle,
}

impl SkelHandle {
    /// Whether both loops are still running.
    pub fn is_alive(&self) -> bool {
        self.lifecycle.is_alive()
    }

    /// Stop reading invocations and wait for both loops to stop.
    ///
    /// Nothing is written after close is requested: queued responses and
    /// calls still executing are dropped. Safe to call more than once.
    pub async fn close(&self) {
        self.lifecycle.close().await;
    }

    /// Wait until both loops have stopped, e.g. because the stub went away.
    pub async fn closed(&self) {
        self.lifecycle.join().await;
    }
}

/// State shared by the dispatcher loop and the execution tasks it spawns.
struct Dispatcher<R> {
    functions: Arc<FunctionTable<R>>,
    receiver: Arc<R>,
    replies: mpsc::Sender<Reply>,
    semaphore: Arc<Semaphore>,
}

impl<R: Send + Sync + 'static> Dispatcher<R> {
    async fn run<Rd>(self, mut frames: FrameReader<Rd>, mut signals: LoopSignals)
    where
        Rd: AsyncRead + Unpin,
    {
        let mut fallback_id = FALLBACK_ID_BASE;
        let mut dispatched: u64 = 0;

        loop {
            let next = tokio::select! {
                biased;
                _ = signals.shutdown_requested() => {
                    tracing::debug!("Dispatcher loop: close requested");
                    break;
                }
                next = frames.next_frame() => next,
            };

            let frame = match next {
                Ok(Some(frame)) => frame,
                Ok(None) => {
                    tracing::debug!("Dispatcher loop: stub closed the connection");
                    break;
                }
                Err(e) => {
                    tracing::error!("Dispatcher loop read error: {}", e);
                    break;
                }
            };

            let function = frame.function();
            let invocation = match Invocation::from_frame(frame) {
                Ok(invocation) => invocation,
                Err(RiiError::Malformed { id, reason }) => {
                    let id = id.unwrap_or_else(|| {
                        fallback_id += 1;
                        fallback_id
                    });
                    tracing::warn!("Skipping malformed invocation {}: {}", id, reason);
                    let fault = Response::fault(id, function, FaultKind::Malformed, reason);
                    if self.replies.send(Reply::Send(fault)).await.is_err() {
                        break;
                    }
                    continue;
                }
                Err(e) => {
                    tracing::error!("Dispatcher loop cannot continue: {}", e);
                    break;
                }
            };

            let permit = tokio::select! {
                biased;
                _ = signals.shutdown_requested() => {
                    tracing::debug!("Dispatcher loop: close requested while at capacity");
                    break;
                }
                permit = self.semaphore.clone().acquire_owned() => match permit {
                    Ok(permit) => permit,
                    Err(_) => break,
                },
            };

            dispatched += 1;
            self.spawn_execution(invocation, permit);
        }

        drop(frames);
        signals.mark_stopped();

        let _ = self.replies.send(Reply::Quit).await;
        tracing::debug!("Dispatcher loop stopped after {} invocations", dispatched);
    }

    /// Run one invocation in its own task and hand the response to the replier.
    fn spawn_execution(&self, invocation: Invocation, permit: OwnedSemaphorePermit) {
        let functions = self.functions.clone();
        let receiver = self.receiver.clone();
        let replies = self.replies.clone();

        tokio::spawn(async move {
            let _permit = permit;
            let Invocation { id, function, args } = invocation;

            // Inner task so a panicking function only takes itself down.
            let call =
                tokio::spawn(async move { functions.execute(function, receiver, args).await });
            let outcome = join_outcome(call.await, id, function);

            let response = Response {
                id,
                function,
                outcome,
            };
            if replies.send(Reply::Send(response)).await.is_err() {
                tracing::debug!("Replier gone, dropping response to call {}", id);
            }
        });
    }
}

/// Turn the end of an execution task into the call's outcome.
fn join_outcome(joined: Result<Outcome, JoinError>, id: u64, function: u32) -> Outcome {
    match joined {
        Ok(outcome) => outcome,
        Err(e) if e.is_panic() => {
            let message = panic_message(e.into_panic());
            tracing::error!("Function {} panicked on call {}: {}", function, id, message);
            Err(Fault::new(FaultKind::Panicked, message))
        }
        Err(e) => {
            tracing::warn!("Function {} was cancelled on call {}", function, id);
            Err(Fault::new(FaultKind::Panicked, format!("call cancelled: {e}")))
        }
    }
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "function panicked".to_string()
    }
}

/// Writes responses in handoff order until the quit message arrives.
///
/// A close request stops the loop even in the middle of a write.
async fn replier_loop<W>(
    mut replies: mpsc::Receiver<Reply>,
    mut writer: FrameWriter<W>,
    mut signals: LoopSignals,
) where
    W: AsyncWrite + Unpin,
{
    let mut batch: Vec<Response> = Vec::with_capacity(MAX_BATCH_SIZE);
    let mut written: u64 = 0;
    let mut quit = false;
    let mut close_requested = false;

    while !quit {
        let next = tokio::select! {
            biased;
            _ = signals.shutdown_requested() => {
                close_requested = true;
                break;
            }
            next = replies.recv() => next,
        };
        match next {
            Some(Reply::Send(response)) => batch.push(response),
            Some(Reply::Quit) | None => break,
        }

        // Collect whatever else is ready to amortize the syscall.
        while batch.len() < MAX_BATCH_SIZE {
            match replies.try_recv() {
                Ok(Reply::Send(response)) => batch.push(response),
                Ok(Reply::Quit) => {
                    quit = true;
                    break;
                }
                Err(_) => break,
            }
        }

        let count = batch.len();
        tokio::select! {
            biased;
            _ = signals.shutdown_requested() => {
                tracing::debug!("Replier loop: close requested, dropping {} responses", count);
                close_requested = true;
                break;
            }
            _ = write_responses(&mut writer, &mut batch) => written += count as u64,
        }
    }

    tracing::debug!("Replier loop stopped after {} responses", written);
    if close_requested {
        // A half-written frame may be stuck in the writer; just let it go.
        drop(writer);
    } else if let Err(e) = writer.shutdown().await {
        tracing::debug!("Skel write half already closed: {}", e);
    }
}

async fn write_responses<W>(writer: &mut FrameWriter<W>, batch: &mut Vec<Response>)
where
    W: AsyncWrite + Unpin,
{
    let frames: Vec<OutboundFrame> = batch.iter().filter_map(encode_response).collect();

    if let Err(e) = writer.write_frames(&frames).await {
        tracing::error!("Failed to write {} responses: {}", frames.len(), e);

        // One best-effort fault per lost response.
        for response in batch.iter() {
            let fault = Response::fault(
                response.id,
                response.function,
                FaultKind::Encode,
                format!("response could not be written: {e}"),
            );
            let sent = match fault.to_frame() {
                Ok(frame) => writer.write_frame(&frame).await,
                Err(err) => Err(err),
            };
            if let Err(err) = sent {
                tracing::error!("Dropping response to call {}: {}", response.id, err);
            }
        }
    }

    batch.clear();
}

/// Encode a response, substituting an `Encode` fault if it cannot be framed.
fn encode_response(response: &Response) -> Option<OutboundFrame> {
    match response.to_frame() {
        Ok(frame) => Some(frame),
        Err(e) => {
            tracing::error!("Failed to encode response to call {}: {}", response.id, e);
            let fault = Response::fault(
                response.id,
                response.function,
                FaultKind::Encode,
                e.to_string(),
            );
            match fault.to_frame() {
                Ok(frame) => Some(frame),
                Err(err) => {
                    tracing::error!("Dropping response to call {}: {}", response.id, err);
                    None
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::MsgPackCodec;
    use crate::handler::AppError;
    use crate::protocol::{build_frame, kind, Header};
    use bytes::Bytes;
    use std::time::Duration;
    use tokio::io::{AsyncWriteExt, DuplexStream, ReadHalf, WriteHalf};

    struct Calculator;

    fn calculator() -> Skel<Calculator> {
        Skel::new(Calculator)
            .function(|_c: Arc<Calculator>, (a, b): (i64, i64)| async move { Ok(a + b) })
            .function(|_c: Arc<Calculator>, (a, b): (i64, i64)| async move {
                if b == 0 {
                    return Err(AppError::new("divide by zero"));
                }
                Ok(a / b)
            })
            .function(|_c: Arc<Calculator>, (): ()| async move {
                if true {
                    panic!("boom");
                }
                Ok(())
            })
    }

    struct RawStub {
        reader: FrameReader<ReadHalf<DuplexStream>>,
        writer: WriteHalf<DuplexStream>,
    }

    impl RawStub {
        fn new(stream: DuplexStream) -> Self {
            let (r, w) = tokio::io::split(stream);
            Self {
                reader: FrameReader::new(r, DEFAULT_MAX_PAYLOAD_SIZE),
                writer: w,
            }
        }

        async fn send(&mut self, id: u64, function: u32, args: impl Serialize) {
            let args = Bytes::from(MsgPackCodec::encode(&args).unwrap());
            let frame = Invocation::new(id, function, args).to_frame().unwrap();
            self.writer.write_all(&frame.header).await.unwrap();
            self.writer.write_all(&frame.payload).await.unwrap();
        }

        async fn recv(&mut self) -> Response {
            let frame = self.reader.next_frame().await.unwrap().unwrap();
            Response::from_frame(frame).unwrap()
        }
    }

    #[test]
    fn test_add_numbers_functions_from_zero() {
        let mut skel = Skel::new(Calculator);
        assert_eq!(skel.add(|_: Arc<Calculator>, (): ()| async { Ok(1) }), 0);
        assert_eq!(skel.add(|_: Arc<Calculator>, (): ()| async { Ok(2) }), 1);
        assert_eq!(skel.function_count(), 2);
    }

    #[tokio::test]
    async fn test_invocation_is_answered_with_its_id() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = calculator().start_stream(server);
        let mut stub = RawStub::new(client);

        stub.send(41, 0, (2, 7)).await;
        let response = stub.recv().await;

        assert_eq!(response.id, 41);
        assert_eq!(response.function, 0);
        let sum: i64 = MsgPackCodec::decode(&response.into_result().unwrap()).unwrap();
        assert_eq!(sum, 9);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_faults_are_typed() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = calculator().start_stream(server);
        let mut stub = RawStub::new(client);

        stub.send(1, 1, (1, 0)).await;
        assert_eq!(
            stub.recv().await.outcome.unwrap_err().kind,
            FaultKind::Application
        );

        stub.send(2, 7, ()).await;
        assert_eq!(
            stub.recv().await.outcome.unwrap_err().kind,
            FaultKind::NoSuchFunction
        );

        stub.send(3, 0, "not a pair").await;
        assert_eq!(
            stub.recv().await.outcome.unwrap_err().kind,
            FaultKind::BadArguments
        );

        stub.send(4, 2, ()).await;
        let fault = stub.recv().await.outcome.unwrap_err();
        assert_eq!(fault.kind, FaultKind::Panicked);
        assert_eq!(fault.message, "boom");

        // Still serving after all of the above.
        stub.send(5, 0, (1, 1)).await;
        assert!(!stub.recv().await.is_fault());
        assert!(handle.is_alive());
        handle.close().await;
    }

    #[tokio::test]
    async fn test_malformed_frame_is_skipped() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = calculator().start_stream(server);
        let mut stub = RawStub::new(client);

        let bogus = build_frame(&Header::new(0x7f, 0, 0, 8, 2), b"zz");
        stub.writer.write_all(&bogus).await.unwrap();
        let fault = stub.recv().await;
        assert_eq!(fault.id, 8);
        assert_eq!(fault.outcome.unwrap_err().kind, FaultKind::Malformed);

        let no_id = build_frame(&Header::new(kind::RESPONSE, 0, 0, 0, 0), b"");
        stub.writer.write_all(&no_id).await.unwrap();
        let fault = stub.recv().await;
        assert!(fault.id > FALLBACK_ID_BASE);

        stub.send(9, 0, (20, 22)).await;
        let sum: i64 = MsgPackCodec::decode(&stub.recv().await.into_result().unwrap()).unwrap();
        assert_eq!(sum, 42);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_completion_order_follows_execution_time() {
        struct Sleeper;
        let skel = Skel::new(Sleeper).function(|_s: Arc<Sleeper>, (ms,): (u64,)| async move {
            tokio::time::sleep(Duration::from_millis(ms)).await;
            Ok(ms)
        });

        let (client, server) = tokio::io::duplex(4096);
        let handle = skel.start_stream(server);
        let mut stub = RawStub::new(client);

        stub.send(1, 0, (150u64,)).await;
        stub.send(2, 0, (1u64,)).await;

        assert_eq!(stub.recv().await.id, 2);
        assert_eq!(stub.recv().await.id, 1);
        handle.close().await;
    }

    #[tokio::test]
    async fn test_stub_hangup_stops_both_loops() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = calculator().start_stream(server);
        drop(client);

        tokio::time::timeout(Duration::from_secs(1), handle.closed())
            .await
            .unwrap();
        assert!(!handle.is_alive());
    }

    #[tokio::test]
    async fn test_close_is_idempotent_and_ends_stream() {
        let (client, server) = tokio::io::duplex(4096);
        let handle = calculator().start_stream(server);
        let mut stub = RawStub::new(client);

        handle.close().await;
        handle.close().await;
        assert!(!handle.is_alive());
        assert!(stub.reader.next_frame().await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_cancelled_call_is_not_reported_as_a_panic() {
        let task = tokio::spawn(std::future::pending::<Outcome>());
        task.abort();
        let joined = task.await;
        assert!(joined.as_ref().is_err_and(JoinError::is_cancelled));

        let fault = join_outcome(joined, 3, 1).unwrap_err();
        assert_eq!(fault.kind, FaultKind::Panicked);
        assert!(fault.message.starts_with("call cancelled"));

        let panicked: Result<Outcome, JoinError> = tokio::spawn(async {
            if true {
                panic!("kaboom");
            }
            Ok(Bytes::new())
        })
        .await;
        let fault = join_outcome(panicked, 4, 1).unwrap_err();
        assert_eq!(fault.message, "kaboom");
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(Box::new("static")), "static");
        assert_eq!(panic_message(Box::new(String::from("owned"))), "owned");
        assert_eq!(panic_message(Box::new(3u8)), "function panicked");
    }
}
