//! Per-channel code scheduler.
//!
//! Every firmware input channel gets one [`ChannelInformation`]. It owns the
//! codes waiting for that channel, the codes currently in flight, the stack
//! of running macro files and the codes suspended while those macros run.
//!
//! [`ChannelInformation::process_requests`] performs at most one action per
//! call, in this order:
//!
//! 1. lock/unlock requests; a lock waiting for `Locked` holds back the rest
//! 2. macro completions that could not be sent when a macro failed to start
//! 3. resuming suspended codes after a macro finished
//! 4. priority codes
//! 5. the innermost running macro (read ahead, retire, complete)
//! 6. regular pending codes
//! 7. flush requests, once nothing is in flight
//!
//! The in-flight budget is `bytes_buffered`, the sum of the wire sizes of the
//! codes in `buffered_codes`. A code is only written when it fits.

use std::collections::VecDeque;
use std::fmt::Write as _;
use std::sync::Arc;

use tokio::sync::oneshot::{self, error::TryRecvError};
use tokio::task::JoinHandle;

use motionbus_core::code::{CodeFlags, CodeType};
use motionbus_core::config::ChannelConfig;
use motionbus_core::{Code, CodeChannel, Message, MessageType, MessageTypeFlags};

use crate::completion::{CompletionHandle, QueuedFlushRequest, QueuedLockRequest};
use crate::executor::{CodeExecutor, Execution};
use crate::macro_file::{FileResolver, MacroError, MacroFile, Resolution};
use crate::queued_code::{CodeOutcome, CodeState, QueuedCode};
use crate::sink::RequestSink;

#[derive(Debug, Clone, Copy)]
pub struct SchedulerSettings {
    pub max_buffer_space: usize,
    pub buffered_macro_codes: usize,
}

impl From<&ChannelConfig> for SchedulerSettings {
    fn from(config: &ChannelConfig) -> Self {
        Self {
            max_buffer_space: config.max_buffer_space_per_channel,
            buffered_macro_codes: config.buffered_macro_codes.max(1),
        }
    }
}

impl Default for SchedulerSettings {
    fn default() -> Self {
        Self::from(&ChannelConfig::default())
    }
}

// ── Macro frames ──────────────────────────────────────────────────────────────

enum MacroCodeState {
    /// The executor is still working on it.
    Running {
        verdict: oneshot::Receiver<Execution>,
        task: JoinHandle<()>,
    },
    /// Forwarded by the executor, waiting for buffer space.
    Ready(QueuedCode),
}

struct MacroCode {
    name: String,
    state: MacroCodeState,
}

impl MacroCode {
    fn start(code: Code, executor: &Arc<dyn CodeExecutor>) -> Self {
        let name = code.short_name();
        let (tx, verdict) = oneshot::channel();
        let execution = executor.execute(code);
        let task = tokio::spawn(async move {
            let _ = tx.send(execution.await);
        });
        Self {
            name,
            state: MacroCodeState::Running { verdict, task },
        }
    }

    fn cancel(self, reason: &str) {
        match self.state {
            MacroCodeState::Running { task, .. } => task.abort(),
            MacroCodeState::Ready(mut code) => code.cancel(reason),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FrameState {
    Running,
    /// MacroCompleted went out; waiting for the reply that ends the frame.
    Completing,
}

struct MacroFrame {
    name: String,
    file: MacroFile,
    /// Buffered code whose execution started this macro. `None` for macros
    /// the firmware started on its own, e.g. triggers.
    start_code: Option<u64>,
    codes: VecDeque<MacroCode>,
    flush_requests: VecDeque<QueuedFlushRequest>,
    state: FrameState,
    had_error: bool,
}

impl MacroFrame {
    fn abort(&mut self, reason: &str) {
        self.file.abort();
        for code in self.codes.drain(..) {
            code.cancel(reason);
        }
        for mut flush in self.flush_requests.drain(..) {
            flush.completion.resolve(false);
        }
    }
}

enum Dispatch {
    Sent,
    NoSpace(QueuedCode),
    /// The code could not be serialized and was failed.
    Rejected,
}

// ── Channel ───────────────────────────────────────────────────────────────────

pub struct ChannelInformation {
    channel: CodeChannel,
    settings: SchedulerSettings,
    executor: Arc<dyn CodeExecutor>,

    pending_codes: VecDeque<QueuedCode>,
    priority_codes: VecDeque<QueuedCode>,
    buffered_codes: VecDeque<QueuedCode>,
    bytes_buffered: usize,

    macro_frames: Vec<MacroFrame>,
    /// One layer per macro frame, pushed when the frame starts.
    suspended_codes: Vec<VecDeque<QueuedCode>>,
    resuming: bool,
    failed_macro_completions: usize,

    lock_requests: VecDeque<QueuedLockRequest>,
    flush_requests: VecDeque<QueuedFlushRequest>,

    /// Set by suspension; cleared after the next full transfer.
    blocked: bool,
    partial_log: String,
    next_code_id: u64,
}

impl ChannelInformation {
    pub fn new(channel: CodeChannel, settings: SchedulerSettings, executor: Arc<dyn CodeExecutor>) -> Self {
        Self {
            channel,
            settings,
            executor,
            pending_codes: VecDeque::new(),
            priority_codes: VecDeque::new(),
            buffered_codes: VecDeque::new(),
            bytes_buffered: 0,
            macro_frames: Vec::new(),
            suspended_codes: Vec::new(),
            resuming: false,
            failed_macro_completions: 0,
            lock_requests: VecDeque::new(),
            flush_requests: VecDeque::new(),
            blocked: false,
            partial_log: String::new(),
            next_code_id: 1,
        }
    }

    pub fn channel(&self) -> CodeChannel {
        self.channel
    }

    pub fn bytes_buffered(&self) -> usize {
        self.bytes_buffered
    }

    pub fn buffered_len(&self) -> usize {
        self.buffered_codes.len()
    }

    pub fn macro_depth(&self) -> usize {
        self.macro_frames.len()
    }

    pub fn suspended_len(&self) -> usize {
        self.suspended_codes.iter().map(VecDeque::len).sum()
    }

    pub fn is_blocked(&self) -> bool {
        self.blocked
    }

    pub fn reset_blocked(&mut self) {
        self.blocked = false;
    }

    fn next_id(&mut self) -> u64 {
        let id = self.next_code_id;
        self.next_code_id += 1;
        id
    }

    // ── Requests from clients ─────────────────────────────────────────────────

    pub fn enqueue(&mut self, mut code: Code) -> CompletionHandle<CodeOutcome> {
        code.channel = self.channel;
        let (queued, handle) = QueuedCode::new(self.next_id(), code);
        self.pending_codes.push_back(queued);
        handle
    }

    /// Queue a code that overtakes everything not yet sent.
    pub fn enqueue_priority(&mut self, mut code: Code) -> CompletionHandle<CodeOutcome> {
        code.channel = self.channel;
        let (queued, handle) = QueuedCode::new(self.next_id(), code);
        self.priority_codes.push_back(queued);
        handle
    }

    /// Wait for all codes queued so far. Inside a macro this only waits for
    /// the codes of that macro.
    pub fn flush(&mut self) -> CompletionHandle<bool> {
        let (request, handle) = QueuedFlushRequest::new();
        match self.macro_frames.last_mut() {
            Some(frame) => frame.flush_requests.push_back(request),
            None => self.flush_requests.push_back(request),
        }
        handle
    }

    pub fn lock(&mut self) -> CompletionHandle<bool> {
        let (request, handle) = QueuedLockRequest::lock();
        self.lock_requests.push_back(request);
        handle
    }

    pub fn unlock(&mut self) -> CompletionHandle<bool> {
        let (request, handle) = QueuedLockRequest::unlock();
        self.lock_requests.push_back(request);
        handle
    }

    // ── Scheduling ────────────────────────────────────────────────────────────

    /// Perform at most one scheduling action. Returns true if anything moved.
    pub async fn process_requests(&mut self, sink: &mut (dyn RequestSink + Send)) -> bool {
        if self.blocked {
            return false;
        }

        if let Some(request) = self.lock_requests.front_mut() {
            if request.is_lock {
                if !request.sent {
                    if sink.write_lock_movement(self.channel) {
                        request.sent = true;
                        return true;
                    }
                    return false;
                }
                // nothing else moves until the firmware reports Locked
                return false;
            } else {
                if sink.write_unlock(self.channel) {
                    if let Some(mut request) = self.lock_requests.pop_front() {
                        request.completion.resolve(true);
                    }
                    return true;
                }
                return false;
            }
        }

        if self.failed_macro_completions > 0 {
            if sink.write_macro_completed(self.channel, true) {
                self.failed_macro_completions -= 1;
                self.resuming = true;
                return true;
            }
            return false;
        }

        if self.resuming {
            return self.resume_buffer(sink);
        }

        if let Some(code) = self.priority_codes.pop_front() {
            return match self.dispatch(code, sink) {
                Dispatch::NoSpace(code) => {
                    self.priority_codes.push_front(code);
                    false
                }
                Dispatch::Sent | Dispatch::Rejected => true,
            };
        }

        if !self.macro_frames.is_empty() {
            return self.process_macro(sink).await;
        }

        if let Some(code) = self.pending_codes.pop_front() {
            return match self.dispatch(code, sink) {
                Dispatch::NoSpace(code) => {
                    self.pending_codes.push_front(code);
                    false
                }
                Dispatch::Sent | Dispatch::Rejected => true,
            };
        }

        if self.buffered_codes.is_empty() && self.suspended_codes.is_empty() {
            if let Some(mut flush) = self.flush_requests.pop_front() {
                flush.completion.resolve(true);
                return true;
            }
        }

        false
    }

    /// Write one code if it fits into the channel budget and the sink.
    fn dispatch(&mut self, mut code: QueuedCode, sink: &mut (dyn RequestSink + Send)) -> Dispatch {
        let payload = match code.encode() {
            Ok(payload) => payload,
            Err(e) => {
                tracing::warn!(channel = %self.channel, code = %code.code, error = %e, "cannot send code");
                code.fail(e);
                return Dispatch::Rejected;
            }
        };

        if self.bytes_buffered + code.binary_size > self.settings.max_buffer_space
            || !sink.write_code(&payload)
        {
            return Dispatch::NoSpace(code);
        }

        self.bytes_buffered += code.binary_size;
        code.state = CodeState::Buffered;
        tracing::trace!(channel = %self.channel, code = %code.code, bytes = self.bytes_buffered, "code sent");
        self.buffered_codes.push_back(code);
        Dispatch::Sent
    }

    async fn process_macro(&mut self, sink: &mut (dyn RequestSink + Send)) -> bool {
        let channel = self.channel;
        let read_ahead = self.settings.buffered_macro_codes;
        let in_flight = self.buffered_codes.iter().any(|c| !c.doing_nested_macro);

        let Some(frame) = self.macro_frames.last_mut() else {
            return false;
        };
        if frame.state == FrameState::Completing {
            return false;
        }

        // keep the executor busy with the next few codes
        if !frame.file.is_finished() && frame.codes.len() < read_ahead {
            match frame.file.read_code().await {
                Ok(Some(mut code)) => {
                    code.channel = channel;
                    code.flags.insert(CodeFlags::FROM_MACRO);
                    frame.codes.push_back(MacroCode::start(code, &self.executor));
                }
                Ok(None) => {
                    tracing::debug!(channel = %channel, file = %frame.name, "finished reading macro");
                }
                Err(e) => {
                    tracing::error!(channel = %channel, error = %e, "macro aborted");
                    frame.had_error = true;
                }
            }
            return true;
        }

        let front_ready = matches!(
            frame.codes.front(),
            Some(MacroCode { state: MacroCodeState::Ready(_), .. })
        );
        if !in_flight && !front_ready {
            if let Some(mut flush) = frame.flush_requests.pop_front() {
                flush.completion.resolve(true);
                return true;
            }
        }

        if let Some(front) = frame.codes.front_mut() {
            if let MacroCodeState::Running { verdict, .. } = &mut front.state {
                match verdict.try_recv() {
                    Err(TryRecvError::Empty) => return false,
                    Err(TryRecvError::Closed) => {
                        tracing::error!(channel = %channel, code = %front.name, "macro code task ended without a result");
                        frame.codes.pop_front();
                        frame.had_error = true;
                        frame.file.abort();
                        return true;
                    }
                    Ok(Execution::Handled(result)) => {
                        tracing::debug!(channel = %channel, code = %front.name, result = %result, "macro code handled");
                        frame.codes.pop_front();
                        return true;
                    }
                    Ok(Execution::Failed(reason)) => {
                        tracing::error!(channel = %channel, code = %front.name, reason = %reason, "macro code failed");
                        frame.codes.pop_front();
                        frame.had_error = true;
                        frame.file.abort();
                        return true;
                    }
                    Ok(Execution::Forward(code)) => {
                        let id = self.next_code_id;
                        self.next_code_id += 1;
                        front.state = MacroCodeState::Ready(QueuedCode::internal(id, code));
                    }
                }
            }

            let Some(MacroCode {
                name,
                state: MacroCodeState::Ready(code),
            }) = frame.codes.pop_front()
            else {
                return false;
            };
            return match self.dispatch(code, sink) {
                Dispatch::NoSpace(code) => {
                    if let Some(frame) = self.macro_frames.last_mut() {
                        frame.codes.push_front(MacroCode {
                            name,
                            state: MacroCodeState::Ready(code),
                        });
                    }
                    false
                }
                Dispatch::Sent | Dispatch::Rejected => true,
            };
        }

        if frame.file.is_finished() && !in_flight {
            if !sink.write_macro_completed(channel, frame.had_error) {
                return false;
            }
            frame.state = FrameState::Completing;
            tracing::info!(channel = %channel, file = %frame.name, error = frame.had_error, "macro completed");
            if let Some(start) = frame.start_code {
                if let Some(code) = self.buffered_codes.iter_mut().find(|c| c.id == start) {
                    code.doing_nested_macro = false;
                }
            }
            return true;
        }

        false
    }

    // ── Suspension ────────────────────────────────────────────────────────────

    /// Move every in-flight code except `keep` and nested-macro starters into
    /// a new suspension layer. The firmware discarded them.
    fn suspend_buffer(&mut self, keep: Option<u64>) {
        let mut layer = VecDeque::new();
        let mut remaining = VecDeque::new();
        for mut code in self.buffered_codes.drain(..) {
            if Some(code.id) == keep || code.doing_nested_macro {
                remaining.push_back(code);
            } else {
                self.bytes_buffered -= code.binary_size;
                code.state = CodeState::Suspended;
                layer.push_back(code);
            }
        }
        self.buffered_codes = remaining;

        // an interrupted resume folds its remainder behind the new layer
        if self.resuming {
            if let Some(rest) = self.suspended_codes.pop() {
                layer.extend(rest);
            }
            self.resuming = false;
        }

        tracing::debug!(channel = %self.channel, count = layer.len(), "suspended codes");
        self.suspended_codes.push(layer);
        self.blocked = true;
    }

    /// Re-send the top suspension layer in order, stopping at the first code
    /// that does not fit.
    fn resume_buffer(&mut self, sink: &mut (dyn RequestSink + Send)) -> bool {
        let Some(mut layer) = self.suspended_codes.pop() else {
            self.resuming = false;
            return false;
        };

        let mut progress = false;
        while let Some(code) = layer.pop_front() {
            match self.dispatch(code, sink) {
                Dispatch::Sent | Dispatch::Rejected => progress = true,
                Dispatch::NoSpace(code) => {
                    layer.push_front(code);
                    break;
                }
            }
        }

        if layer.is_empty() {
            self.resuming = false;
            progress = true;
        } else {
            self.suspended_codes.push(layer);
        }
        progress
    }

    fn pop_frame(&mut self) {
        if let Some(mut frame) = self.macro_frames.pop() {
            frame.abort("macro finished");
            tracing::debug!(channel = %self.channel, file = %frame.name, "macro frame closed");
        }
        self.resuming = true;
    }

    // ── Requests from the firmware ────────────────────────────────────────────

    /// Route a reply fragment. Returns false if no code claimed it.
    pub fn handle_reply(&mut self, flags: MessageTypeFlags, text: &str) -> bool {
        if flags.contains(MessageTypeFlags::LOG) {
            self.partial_log.push_str(text);
            if !flags.is_push() {
                let line = std::mem::take(&mut self.partial_log);
                log_message(self.channel, flags.message_type(), line.trim_end());
            }
            return true;
        }

        let completing = self
            .macro_frames
            .last()
            .filter(|frame| frame.state == FrameState::Completing)
            .map(|frame| frame.start_code);
        match completing {
            Some(Some(start)) => {
                if let Some(pos) = self.buffered_codes.iter().position(|c| c.id == start) {
                    if self.buffered_codes[pos].handle_reply(flags, text) {
                        self.retire(pos);
                        self.pop_frame();
                    }
                    return true;
                }
                // the starting code is gone, nothing left to wait for
                self.pop_frame();
            }
            Some(None) => {
                if !text.is_empty() {
                    log_message(self.channel, flags.message_type(), text.trim_end());
                }
                if !flags.is_push() {
                    self.pop_frame();
                }
                return true;
            }
            None => {}
        }

        if let Some(pos) = self.buffered_codes.iter().position(|c| !c.doing_nested_macro) {
            if self.buffered_codes[pos].handle_reply(flags, text) {
                self.retire(pos);
            }
            return true;
        }

        if !text.is_empty() {
            match self.channel {
                CodeChannel::Trigger | CodeChannel::Daemon => {
                    tracing::debug!(channel = %self.channel, reply = %text, "dropping unmatched reply")
                }
                _ => tracing::warn!(channel = %self.channel, reply = %text, "reply without a matching code"),
            }
        }
        false
    }

    fn retire(&mut self, pos: usize) {
        if let Some(mut code) = self.buffered_codes.remove(pos) {
            self.bytes_buffered -= code.binary_size;
            code.finish();
        }
    }

    /// The firmware asks for a macro file to be executed on this channel.
    pub async fn handle_macro_request(
        &mut self,
        filename: &str,
        report_missing: bool,
        from_code: bool,
        resolver: &FileResolver,
        sink: &mut (dyn RequestSink + Send),
    ) {
        let start_code = if from_code { self.take_start_code() } else { None };
        if from_code && start_code.is_none() {
            tracing::warn!(channel = %self.channel, file = filename, "no code found that started this macro");
        }
        if let Some(start) = start_code {
            if let Some(code) = self.buffered_codes.iter_mut().find(|c| c.id == start) {
                code.doing_nested_macro = true;
            }
        }
        self.suspend_buffer(start_code);

        let opened = match resolver.resolve_macro(filename).await {
            Resolution::Found(path) => MacroFile::open(filename, path, self.channel).await,
            Resolution::Fallback { path, requested } => {
                tracing::warn!(
                    channel = %self.channel,
                    requested = %requested.display(),
                    using = %path.display(),
                    "macro file missing, using fallback"
                );
                MacroFile::open(filename, path, self.channel).await
            }
            Resolution::Missing(_) => Err(MacroError::NotFound(filename.to_string())),
        };

        match opened {
            Ok(file) => {
                tracing::info!(channel = %self.channel, file = filename, "executing macro");
                self.macro_frames.push(MacroFrame {
                    name: filename.to_string(),
                    file,
                    start_code,
                    codes: VecDeque::new(),
                    flush_requests: VecDeque::new(),
                    state: FrameState::Running,
                    had_error: false,
                });
            }
            Err(e) => {
                match &e {
                    MacroError::NotFound(_) if !report_missing => {
                        tracing::debug!(channel = %self.channel, file = filename, "optional macro not found")
                    }
                    _ => tracing::error!(channel = %self.channel, error = %e, "failed to start macro"),
                }
                let report = report_missing || !matches!(e, MacroError::NotFound(_));
                if let Some(start) = start_code {
                    if let Some(code) = self.buffered_codes.iter_mut().find(|c| c.id == start) {
                        code.doing_nested_macro = false;
                        // M98 reports a missing file on its own
                        let is_m98 = code.code.kind == CodeType::M && code.code.major == 98;
                        if report && !is_m98 {
                            let text = match &e {
                                MacroError::NotFound(_) => format!("Macro file {filename} not found"),
                                other => other.to_string(),
                            };
                            code.result.push(Message::error(text));
                        }
                    }
                }
                if sink.write_macro_completed(self.channel, true) {
                    self.resuming = true;
                } else {
                    self.failed_macro_completions += 1;
                }
            }
        }
    }

    /// Code that triggered a macro request: the starter of a just-completed
    /// frame (which is replaced), otherwise the oldest code in flight.
    fn take_start_code(&mut self) -> Option<u64> {
        let completed_start = self
            .macro_frames
            .last()
            .filter(|frame| frame.state == FrameState::Completing)
            .and_then(|frame| frame.start_code);
        if let Some(start) = completed_start {
            if let Some(mut frame) = self.macro_frames.pop() {
                frame.abort("macro replaced");
            }
            // its suspended codes carry over to the next frame
            self.resuming = true;
            return Some(start);
        }
        self.buffered_codes.iter().find(|c| !c.doing_nested_macro).map(|c| c.id)
    }

    /// The firmware confirmed a lock. Returns false if none was pending.
    pub fn handle_locked(&mut self) -> bool {
        match self.lock_requests.front() {
            Some(request) if request.is_lock && request.sent => {
                if let Some(mut request) = self.lock_requests.pop_front() {
                    request.completion.resolve(true);
                }
                true
            }
            _ => {
                tracing::warn!(channel = %self.channel, "unexpected lock confirmation");
                false
            }
        }
    }

    /// The firmware aborted the innermost macro, or every macro.
    pub fn abort_file(&mut self, abort_all: bool) {
        if self.macro_frames.is_empty() {
            tracing::debug!(channel = %self.channel, "abort requested but no macro is running");
            return;
        }

        let count = if abort_all { self.macro_frames.len() } else { 1 };
        for i in 0..count {
            if self.resuming {
                // codes of the frame being aborted that were still resuming
                self.cancel_top_layer("macro aborted");
                self.resuming = false;
            }

            let Some(mut frame) = self.macro_frames.pop() else {
                break;
            };
            tracing::info!(channel = %self.channel, file = %frame.name, "macro aborted by firmware");
            frame.abort("macro aborted");

            // in-flight codes of the aborted macro were dropped by the firmware
            let mut kept = VecDeque::new();
            for mut code in self.buffered_codes.drain(..) {
                if code.doing_nested_macro {
                    kept.push_back(code);
                } else {
                    self.bytes_buffered -= code.binary_size;
                    code.cancel("macro aborted");
                }
            }
            self.buffered_codes = kept;

            if let Some(start) = frame.start_code {
                if let Some(code) = self.buffered_codes.iter_mut().find(|c| c.id == start) {
                    code.doing_nested_macro = false;
                }
            }

            if i + 1 < count {
                self.cancel_top_layer("macro aborted");
            } else {
                self.resuming = true;
            }
        }
    }

    fn cancel_top_layer(&mut self, reason: &str) {
        if let Some(layer) = self.suspended_codes.pop() {
            for mut code in layer {
                code.cancel(reason);
            }
        }
    }

    /// The firmware paused the job on this channel. Everything still queued
    /// completes with `message`.
    pub fn resolve_paused(&mut self, message: Message) -> usize {
        let mut count = 0;
        let queues = self
            .buffered_codes
            .drain(..)
            .chain(self.pending_codes.drain(..))
            .chain(self.suspended_codes.drain(..).flatten());
        for mut code in queues {
            code.finish_with(message.clone());
            count += 1;
        }
        self.bytes_buffered = 0;
        self.resuming = false;
        for mut frame in self.macro_frames.drain(..) {
            frame.abort("job paused");
        }
        count
    }

    /// Cancel everything. Returns true if anything was cancelled.
    pub fn invalidate(&mut self, reason: &str) -> bool {
        let mut had_content = !self.macro_frames.is_empty();

        for mut frame in self.macro_frames.drain(..) {
            frame.abort(reason);
        }

        let codes = self
            .buffered_codes
            .drain(..)
            .chain(self.pending_codes.drain(..))
            .chain(self.priority_codes.drain(..))
            .chain(self.suspended_codes.drain(..).flatten());
        for mut code in codes {
            code.cancel(reason);
            had_content = true;
        }

        for mut request in self.lock_requests.drain(..) {
            request.completion.resolve(false);
            had_content = true;
        }
        for mut request in self.flush_requests.drain(..) {
            request.completion.resolve(false);
            had_content = true;
        }

        self.bytes_buffered = 0;
        self.resuming = false;
        self.failed_macro_completions = 0;
        self.partial_log.clear();
        // wait for a completed transfer before sending anything new
        self.blocked = true;

        if had_content {
            tracing::info!(channel = %self.channel, reason, "channel invalidated");
        }
        had_content
    }

    // ── Diagnostics ───────────────────────────────────────────────────────────

    pub fn diagnostics(&self, out: &mut String) {
        let mut line = String::new();
        if !self.pending_codes.is_empty() || !self.priority_codes.is_empty() {
            let _ = write!(
                line,
                " {} pending ({} priority),",
                self.pending_codes.len() + self.priority_codes.len(),
                self.priority_codes.len()
            );
        }
        if !self.buffered_codes.is_empty() {
            let names: Vec<String> = self.buffered_codes.iter().map(|c| c.code.short_name()).collect();
            let _ = write!(
                line,
                " {} buffered ({} bytes: {}),",
                self.buffered_codes.len(),
                self.bytes_buffered,
                names.join(", ")
            );
        }
        for frame in &self.macro_frames {
            let _ = write!(
                line,
                " macro {} ({} codes running{}),",
                frame.name,
                frame.codes.len(),
                if frame.state == FrameState::Completing { ", completing" } else { "" }
            );
        }
        if !self.suspended_codes.is_empty() {
            let _ = write!(line, " {} suspended,", self.suspended_len());
        }
        if !self.lock_requests.is_empty() {
            let _ = write!(line, " {} lock requests,", self.lock_requests.len());
        }
        if !self.flush_requests.is_empty() {
            let _ = write!(line, " {} flush requests,", self.flush_requests.len());
        }
        if self.blocked {
            line.push_str(" blocked,");
        }
        if !line.is_empty() {
            let _ = writeln!(out, "{}:{}", self.channel, line.trim_end_matches(','));
        }
    }
}

fn log_message(channel: CodeChannel, kind: MessageType, text: &str) {
    match kind {
        MessageType::Error => tracing::error!(channel = %channel, "{text}"),
        MessageType::Warning => tracing::warn!(channel = %channel, "{text}"),
        MessageType::Success => tracing::info!(channel = %channel, "{text}"),
    }
}
