//! All channels of one firmware, each behind its own lock.
//!
//! Clients and the transport run loop reach the channels through a shared
//! [`ChannelStore`]. The run loop is the only writer of the bus, so it takes
//! the channel locks one at a time and never holds two at once.

use std::sync::Arc;

use tokio::sync::{Mutex, MutexGuard};

use motionbus_core::{Code, CodeChannel, Message, MessageTypeFlags};

use crate::channel::{ChannelInformation, SchedulerSettings};
use crate::completion::CompletionHandle;
use crate::executor::CodeExecutor;
use crate::macro_file::FileResolver;
use crate::queued_code::CodeOutcome;
use crate::sink::RequestSink;

pub struct ChannelStore {
    channels: Vec<Arc<Mutex<ChannelInformation>>>,
    resolver: FileResolver,
}

impl ChannelStore {
    pub fn new(settings: SchedulerSettings, executor: Arc<dyn CodeExecutor>, resolver: FileResolver) -> Self {
        let channels = CodeChannel::ALL
            .into_iter()
            .map(|channel| {
                Arc::new(Mutex::new(ChannelInformation::new(
                    channel,
                    settings,
                    executor.clone(),
                )))
            })
            .collect();
        Self { channels, resolver }
    }

    pub fn resolver(&self) -> &FileResolver {
        &self.resolver
    }

    pub async fn lock_channel(&self, channel: CodeChannel) -> MutexGuard<'_, ChannelInformation> {
        self.channels[channel.index()].lock().await
    }

    // ── Client operations ─────────────────────────────────────────────────────

    pub async fn enqueue(&self, code: Code) -> CompletionHandle<CodeOutcome> {
        self.lock_channel(code.channel).await.enqueue(code)
    }

    pub async fn enqueue_priority(&self, code: Code) -> CompletionHandle<CodeOutcome> {
        self.lock_channel(code.channel).await.enqueue_priority(code)
    }

    pub async fn flush(&self, channel: CodeChannel) -> CompletionHandle<bool> {
        self.lock_channel(channel).await.flush()
    }

    pub async fn lock(&self, channel: CodeChannel) -> CompletionHandle<bool> {
        self.lock_channel(channel).await.lock()
    }

    pub async fn unlock(&self, channel: CodeChannel) -> CompletionHandle<bool> {
        self.lock_channel(channel).await.unlock()
    }

    // ── Run loop operations ───────────────────────────────────────────────────

    /// Schedule every channel until none of them can make progress.
    /// Returns the number of actions performed.
    pub async fn process_all(&self, sink: &mut (dyn RequestSink + Send)) -> usize {
        let mut actions = 0;
        loop {
            let mut progress = false;
            for channel in &self.channels {
                if channel.lock().await.process_requests(sink).await {
                    progress = true;
                    actions += 1;
                }
            }
            if !progress {
                return actions;
            }
        }
    }

    /// Route a code reply to every channel named in `flags`.
    /// Returns false if no channel claimed it.
    pub async fn handle_code_reply(&self, flags: MessageTypeFlags, reply: &str) -> bool {
        let mut handled = false;
        for channel in flags.channels() {
            handled |= self.lock_channel(channel).await.handle_reply(flags, reply);
        }
        handled
    }

    pub async fn handle_macro_request(
        &self,
        channel: CodeChannel,
        filename: &str,
        report_missing: bool,
        from_code: bool,
        sink: &mut (dyn RequestSink + Send),
    ) {
        self.lock_channel(channel)
            .await
            .handle_macro_request(filename, report_missing, from_code, &self.resolver, sink)
            .await;
    }

    pub async fn handle_locked(&self, channel: CodeChannel) -> bool {
        self.lock_channel(channel).await.handle_locked()
    }

    pub async fn abort_file(&self, channel: CodeChannel, abort_all: bool) {
        self.lock_channel(channel).await.abort_file(abort_all);
    }

    pub async fn resolve_paused(&self, channel: CodeChannel, message: Message) -> usize {
        self.lock_channel(channel).await.resolve_paused(message)
    }

    /// Cancel everything on every channel. Returns, per channel, whether
    /// anything was cancelled.
    pub async fn invalidate_all(&self, reason: &str) -> Vec<(CodeChannel, bool)> {
        let mut results = Vec::with_capacity(self.channels.len());
        for channel in &self.channels {
            let mut channel = channel.lock().await;
            results.push((channel.channel(), channel.invalidate(reason)));
        }
        results
    }

    /// Called after every completed full transfer.
    pub async fn reset_blocked(&self) {
        for channel in &self.channels {
            channel.lock().await.reset_blocked();
        }
    }

    /// One line per channel with anything going on.
    pub async fn diagnostics(&self) -> String {
        let lines = futures::future::join_all(self.channels.iter().map(|channel| async move {
            let mut out = String::new();
            channel.lock().await.diagnostics(&mut out);
            out
        }))
        .await;
        lines.concat()
    }
}
