//! Lifecycle shared by both endpoints: liveness flag, shutdown signal and
//! the two loop handles.
//!
//! ```text
//! Running ──(close() or end of stream)──► Draining ──(both loops joined)──► Stopped
//! ```
//!
//! The endpoint owns the loop handles. Loops only get the liveness flag
//! and a shutdown receiver, never a reference back to the endpoint.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::{watch, Mutex};
use tokio::task::JoinHandle;

/// Liveness flag and shutdown receiver handed to each loop.
#[derive(Clone)]
pub(crate) struct LoopSignals {
    pub(crate) alive: Arc<AtomicBool>,
    pub(crate) shutdown: watch::Receiver<bool>,
}

impl LoopSignals {
    /// Flip the liveness flag to false. Returns whether it was still true.
    pub(crate) fn mark_stopped(&self) -> bool {
        self.alive.swap(false, Ordering::AcqRel)
    }

    /// Resolves once close is requested or the owning endpoint is dropped.
    pub(crate) async fn shutdown_requested(&mut self) {
        loop {
            if *self.shutdown.borrow_and_update() {
                return;
            }
            if self.shutdown.changed().await.is_err() {
                return;
            }
        }
    }
}

/// Owner side of an endpoint's lifecycle.
pub(crate) struct Lifecycle {
    alive: Arc<AtomicBool>,
    shutdown: watch::Sender<bool>,
    loops: Mutex<Vec<(&'static str, JoinHandle<()>)>>,
}

impl Lifecycle {
    /// A running lifecycle and the signals its loops observe.
    pub(crate) fn new() -> (Self, LoopSignals) {
        let alive = Arc::new(AtomicBool::new(true));
        let (shutdown, shutdown_rx) = watch::channel(false);
        let signals = LoopSignals {
            alive: alive.clone(),
            shutdown: shutdown_rx,
        };
        let lifecycle = Self {
            alive,
            shutdown,
            loops: Mutex::new(Vec::with_capacity(2)),
        };
        (lifecycle, signals)
    }

    /// Register a spawned loop.
    pub(crate) fn attach(&mut self, name: &'static str, handle: JoinHandle<()>) {
        self.loops.get_mut().push((name, handle));
    }

    /// Whether neither loop has observed a stop condition yet.
    pub(crate) fn is_alive(&self) -> bool {
        self.alive.load(Ordering::Acquire)
    }

    /// Request shutdown and wait until both loops have exited. Idempotent.
    pub(crate) async fn close(&self) {
        self.alive.store(false, Ordering::Release);
        self.shutdown.send_replace(true);
        self.join().await;
    }

    /// Wait until both loops have exited, without requesting it.
    pub(crate) async fn join(&self) {
        let mut loops = self.loops.lock().await;
        for (name, handle) in loops.drain(..) {
            if let Err(e) = handle.await {
                tracing::error!(task = name, "Endpoint loop ended abnormally: {}", e);
            }
        }
    }
}
