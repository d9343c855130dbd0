//! One-shot completions handed to whoever queued a request.
//!
//! The scheduler keeps the [`Completion`] and resolves it exactly once. The
//! caller awaits the matching [`CompletionHandle`]. Resolving twice is a
//! no-op, and dropping an unresolved completion resolves the handle to `None`.

use std::future::Future;
use std::pin::Pin;
use std::task::{Context, Poll};

use tokio::sync::oneshot;

pub fn completion<T>() -> (Completion<T>, CompletionHandle<T>) {
    let (tx, rx) = oneshot::channel();
    (Completion { tx: Some(tx) }, CompletionHandle { rx })
}

#[derive(Debug)]
pub struct Completion<T> {
    tx: Option<oneshot::Sender<T>>,
}

impl<T> Completion<T> {
    /// A completion nobody waits on.
    pub fn detached() -> Self {
        Self { tx: None }
    }

    /// Resolve with `value`. Returns false if already resolved.
    pub fn resolve(&mut self, value: T) -> bool {
        match self.tx.take() {
            // receiver may be gone; the request still counts as resolved
            Some(tx) => {
                let _ = tx.send(value);
                true
            }
            None => false,
        }
    }

    pub fn is_resolved(&self) -> bool {
        self.tx.is_none()
    }

    /// True if somebody is still waiting for the result.
    pub fn is_awaited(&self) -> bool {
        self.tx.as_ref().is_some_and(|tx| !tx.is_closed())
    }
}

#[derive(Debug)]
pub struct CompletionHandle<T> {
    rx: oneshot::Receiver<T>,
}

impl<T> Future for CompletionHandle<T> {
    type Output = Option<T>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        Pin::new(&mut self.rx).poll(cx).map(Result::ok)
    }
}

// ── Queued requests ───────────────────────────────────────────────────────────

/// Lock or unlock of the movement system, waiting in a channel.
#[derive(Debug)]
pub struct QueuedLockRequest {
    pub is_lock: bool,
    /// Set once the lock request went out; it then waits for a Locked reply.
    pub sent: bool,
    pub completion: Completion<bool>,
}

impl QueuedLockRequest {
    pub fn lock() -> (Self, CompletionHandle<bool>) {
        let (completion, handle) = completion();
        (
            Self {
                is_lock: true,
                sent: false,
                completion,
            },
            handle,
        )
    }

    pub fn unlock() -> (Self, CompletionHandle<bool>) {
        let (completion, handle) = completion();
        (
            Self {
                is_lock: false,
                sent: false,
                completion,
            },
            handle,
        )
    }
}

/// Resolves true once every code queued before it has completed, or false
/// when the channel is invalidated first.
#[derive(Debug)]
pub struct QueuedFlushRequest {
    pub completion: Completion<bool>,
}

impl QueuedFlushRequest {
    pub fn new() -> (Self, CompletionHandle<bool>) {
        let (completion, handle) = completion();
        (Self { completion }, handle)
    }
}
