//! The run loop. Owns the transport and drives the channel store.
//!
//! One cycle handles the packets of the previous transfer, lets every
//! channel queue what it can, asks for state and one object model module,
//! then performs the next full transfer. Nothing else touches the bus.

use std::time::Duration;

use tokio::sync::broadcast;

use motionbus_core::request::FirmwareMessage;
use motionbus_core::status::LinkStatus;
use motionbus_core::{CodeChannel, Message, MessageTypeFlags};
use motionbus_services::ControlHandle;

use crate::bus::Bus;
use crate::model::{MachineStatus, SharedModel, STATE_MODULE};
use crate::transport::{TransferOutcome, Transport, TransportError};

pub struct RunLoop<B> {
    transport: Transport<B>,
    control: ControlHandle,
    model: SharedModel,
    poll_delay: Duration,
    shutdown: broadcast::Receiver<()>,
    /// Generic firmware message being assembled from push fragments.
    partial_message: String,
    busy_channels: u32,
    last_module: u8,
}

impl<B: Bus> RunLoop<B> {
    pub fn new(
        transport: Transport<B>,
        control: ControlHandle,
        model: SharedModel,
        poll_delay: Duration,
        shutdown: broadcast::Receiver<()>,
    ) -> Self {
        Self {
            transport,
            control,
            model,
            poll_delay,
            shutdown,
            partial_message: String::new(),
            busy_channels: 0,
            last_module: STATE_MODULE,
        }
    }

    /// Run until shutdown. Only protocol-fatal errors end the loop early.
    pub async fn run(mut self) -> Result<(), TransportError> {
        loop {
            self.cycle().await?;
            tokio::select! {
                _ = self.shutdown.recv() => {
                    tracing::info!("run loop shutting down");
                    self.invalidate("daemon shutting down").await;
                    return Ok(());
                }
                _ = tokio::time::sleep(self.poll_delay) => {}
            }
        }
    }

    pub async fn cycle(&mut self) -> Result<TransferOutcome, TransportError> {
        self.process_packets().await?;

        if self.control.special().take_emergency_stop() {
            self.transport.write_emergency_stop();
            let outcome = self.transport.perform_full_transfer().await?;
            self.handle_outcome(outcome).await;
            self.invalidate("emergency stop").await;
        }
        if self.control.special().take_reset() {
            if !self.transport.write_reset() {
                tracing::warn!("no room for the reset request");
            }
            self.invalidate("firmware reset").await;
        }

        let store = self.control.store().clone();
        let actions = store.process_all(&mut self.transport).await;
        if actions > 0 {
            tracing::trace!(actions, "channels queued requests");
        }

        self.transport.write_get_state();
        let module = self.model.read().await.next_module(self.last_module);
        if self.transport.write_get_object_model(module) {
            self.last_module = module;
        }

        let outcome = self.transport.perform_full_transfer().await?;
        self.handle_outcome(outcome).await;
        self.publish_status().await;
        Ok(outcome)
    }

    async fn handle_outcome(&mut self, outcome: TransferOutcome) {
        match outcome {
            TransferOutcome::Completed => {
                if self.transport.take_reset() {
                    self.invalidate("controller has been reset").await;
                }
                {
                    let mut model = self.model.write().await;
                    if model.status() == MachineStatus::Off {
                        model.set_status(MachineStatus::Idle);
                    }
                }
                self.control.store().reset_blocked().await;
            }
            TransferOutcome::Disconnected => {
                self.invalidate("lost connection to firmware").await;
                self.model.write().await.set_status(MachineStatus::Off);
            }
            TransferOutcome::Failed | TransferOutcome::NotConnected => {}
        }
    }

    async fn invalidate(&mut self, reason: &str) {
        let results = self.control.store().invalidate_all(reason).await;
        let channels: Vec<CodeChannel> = results
            .into_iter()
            .filter_map(|(channel, had_content)| had_content.then_some(channel))
            .collect();
        if !channels.is_empty() {
            tracing::warn!(reason, ?channels, "cancelled pending work");
        }
        self.partial_message.clear();
    }

    // ── Firmware requests ─────────────────────────────────────────────────────

    async fn process_packets(&mut self) -> Result<(), TransportError> {
        let messages: Vec<FirmwareMessage> = self
            .transport
            .packets()
            .filter_map(|packet| match packet.and_then(|p| FirmwareMessage::decode(&p)) {
                Ok(message) => Some(message),
                Err(e) => {
                    tracing::error!(error = %e, "dropping malformed packet");
                    None
                }
            })
            .collect();

        for message in messages {
            tracing::trace!(?message, "firmware request");
            self.handle_message(message).await?;
        }
        Ok(())
    }

    async fn handle_message(&mut self, message: FirmwareMessage) -> Result<(), TransportError> {
        let store = self.control.store().clone();
        match message {
            FirmwareMessage::ResendPacket { packet_id } => {
                self.transport.resend_packet(packet_id)?;
            }
            FirmwareMessage::ReportState { busy_channels } => {
                self.busy_channels = busy_channels;
            }
            FirmwareMessage::ObjectModel { module, json } => {
                let update = self.model.write().await.update(module, &json);
                match update {
                    Ok(Some(MachineStatus::Halted)) => self.invalidate("firmware halted").await,
                    Ok(_) => {}
                    Err(e) => tracing::warn!(module, error = %e, "invalid object model"),
                }
            }
            FirmwareMessage::CodeReply { flags, reply } => {
                if flags.contains(MessageTypeFlags::BINARY_CODE_REPLY) {
                    store.handle_code_reply(flags, &reply).await;
                } else {
                    self.handle_generic_message(flags, &reply);
                }
            }
            FirmwareMessage::ExecuteMacro {
                channel,
                report_missing,
                from_code,
                filename,
            } => {
                store
                    .handle_macro_request(
                        channel,
                        &filename,
                        report_missing,
                        from_code,
                        &mut self.transport,
                    )
                    .await;
            }
            FirmwareMessage::AbortFile { channel, abort_all } => {
                store.abort_file(channel, abort_all).await;
            }
            FirmwareMessage::PrintPaused {
                file_position,
                reason,
            } => {
                tracing::info!(file_position, reason, "print paused");
                let message = Message::success(format!("Print paused at byte {file_position}"));
                let resolved = store.resolve_paused(CodeChannel::File, message).await;
                tracing::debug!(resolved, "resolved codes of paused file");
                self.model.write().await.set_status(MachineStatus::Paused);
            }
            FirmwareMessage::Locked { channel } => {
                if !store.handle_locked(channel).await {
                    tracing::warn!(%channel, "lock granted without a pending request");
                }
            }
        }
        Ok(())
    }

    /// Messages not tied to a code are logged once complete.
    fn handle_generic_message(&mut self, flags: MessageTypeFlags, text: &str) {
        self.partial_message.push_str(text);
        if flags.is_push() {
            return;
        }
        let message = std::mem::take(&mut self.partial_message);
        let message = message.trim_end();
        if message.is_empty() {
            return;
        }
        if flags.contains(MessageTypeFlags::ERROR) {
            tracing::error!(message, "firmware");
        } else if flags.contains(MessageTypeFlags::WARNING) {
            tracing::warn!(message, "firmware");
        } else {
            tracing::info!(message, "firmware");
        }
    }

    async fn publish_status(&self) {
        let status = LinkStatus {
            connected: self.transport.is_connected(),
            protocol_version: self.transport.protocol_version(),
            machine_status: self.model.read().await.status().to_string(),
            busy_channels: LinkStatus::busy_channels_from_bits(self.busy_channels),
            stats: self.transport.stats().clone(),
        };
        self.control.publish_status(status).await;
    }
}
