//! Cloneable handle that clients use to talk to the run loop.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use tokio::sync::RwLock;

use motionbus_core::status::LinkStatus;
use motionbus_core::{Code, CodeChannel, CodeResult};

use crate::queued_code::CodeError;
use crate::store::ChannelStore;

/// Requests that bypass the channels and are acted on by the run loop.
#[derive(Debug, Default)]
pub struct SpecialRequests {
    emergency_stop: AtomicBool,
    reset: AtomicBool,
}

impl SpecialRequests {
    pub fn request_emergency_stop(&self) {
        self.emergency_stop.store(true, Ordering::SeqCst);
    }

    pub fn request_reset(&self) {
        self.reset.store(true, Ordering::SeqCst);
    }

    pub fn take_emergency_stop(&self) -> bool {
        self.emergency_stop.swap(false, Ordering::SeqCst)
    }

    pub fn take_reset(&self) -> bool {
        self.reset.swap(false, Ordering::SeqCst)
    }
}

#[derive(Clone)]
pub struct ControlHandle {
    store: Arc<ChannelStore>,
    special: Arc<SpecialRequests>,
    status: Arc<RwLock<LinkStatus>>,
}

impl ControlHandle {
    pub fn new(store: Arc<ChannelStore>) -> Self {
        Self {
            store,
            special: Arc::new(SpecialRequests::default()),
            status: Arc::new(RwLock::new(LinkStatus::default())),
        }
    }

    pub fn store(&self) -> &Arc<ChannelStore> {
        &self.store
    }

    pub fn special(&self) -> &SpecialRequests {
        &self.special
    }

    /// Queue a code and wait for its result.
    pub async fn execute(&self, code: Code) -> Result<CodeResult, CodeError> {
        self.store
            .enqueue(code)
            .await
            .await
            .unwrap_or_else(|| Err(CodeError::Cancelled("channel dropped the code".into())))
    }

    pub async fn flush(&self, channel: CodeChannel) -> bool {
        self.store.flush(channel).await.await.unwrap_or(false)
    }

    pub async fn lock(&self, channel: CodeChannel) -> bool {
        self.store.lock(channel).await.await.unwrap_or(false)
    }

    pub async fn unlock(&self, channel: CodeChannel) -> bool {
        self.store.unlock(channel).await.await.unwrap_or(false)
    }

    pub fn request_emergency_stop(&self) {
        tracing::warn!("emergency stop requested");
        self.special.request_emergency_stop();
    }

    pub fn request_reset(&self) {
        tracing::info!("firmware reset requested");
        self.special.request_reset();
    }

    pub async fn status(&self) -> LinkStatus {
        self.status.read().await.clone()
    }

    pub async fn publish_status(&self, status: LinkStatus) {
        *self.status.write().await = status;
    }

    pub async fn diagnostics(&self) -> String {
        self.store.diagnostics().await
    }
}
