//! Transport engine: one reliable full transfer at a time.
//!
//! A full transfer is a header exchange, an optional data exchange and a
//! response after each. Checksum failures are retried inside the transfer;
//! anything else either restarts the transfer from the header or is fatal.
//! Outbound packets are written into a small pool of transmit buffers so the
//! buffer sent last is still around when the firmware asks for a resend.

use std::time::{Duration, Instant};

use zerocopy::FromBytes;

use motionbus_core::checksum::{checksum, image_crc32};
use motionbus_core::codec::{decode_header, encode_header, iterate_packets, PacketIter, PacketWriter};
use motionbus_core::config::MotionbusConfig;
use motionbus_core::request::{encode_channel, encode_macro_completed, encode_object_model_request};
use motionbus_core::status::TransferStats;
use motionbus_core::wire::{
    HostRequest, TransferHeader, TransferResponse, FORMAT_CODE, FORMAT_CODE_STANDALONE,
    IAP_SEGMENT_SIZE, PROTOCOL_VERSION,
};
use motionbus_core::CodeChannel;
use motionbus_services::RequestSink;

use crate::bus::{Bus, BusError};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    #[error("invalid format code 0x{0:02x}")]
    BadFormat(u8),

    #[error("firmware is running in standalone mode")]
    StandaloneMode,

    #[error("firmware speaks protocol version {0}, which is newer than ours")]
    UnsupportedProtocol(u16),

    #[error("firmware announced {0} bytes of data, more than the receive buffer holds")]
    DataTooLong(usize),

    #[error("firmware refused the transfer: {0:?}")]
    PeerRefused(TransferResponse),

    #[error("firmware requested resend of unknown packet #{0}")]
    InvalidResend(u16),

    #[error("firmware did not enter update mode")]
    IapNotStarted,

    #[error("firmware rejected the update image")]
    IapRejected,

    #[error(transparent)]
    Bus(#[from] BusError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferOutcome {
    Completed,
    /// Restarted after a bad response or too many retries.
    Failed,
    /// The ready line timed out on a link that was up.
    Disconnected,
    /// Still waiting for the firmware to answer.
    NotConnected,
}

// ── Settings ──────────────────────────────────────────────────────────────────

#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub max_retries: u32,
    pub tx_buffer_count: usize,
    pub buffer_size: usize,
    pub update_only: bool,
    pub first_connect_timeout: Duration,
    pub transfer_timeout: Duration,
    pub iap_timeout: Duration,
}

impl From<&MotionbusConfig> for TransportSettings {
    fn from(config: &MotionbusConfig) -> Self {
        Self {
            max_retries: config.transport.max_retries,
            tx_buffer_count: config.transport.tx_buffer_count,
            buffer_size: config.transport.buffer_size,
            update_only: config.transport.update_only,
            first_connect_timeout: config.bus.first_connect_timeout(),
            transfer_timeout: config.bus.transfer_timeout(),
            iap_timeout: config.bus.iap_timeout(),
        }
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        Self::from(&MotionbusConfig::default())
    }
}

// ── Link ──────────────────────────────────────────────────────────────────────

/// The bus plus the ready level expected before the next exchange.
struct Link<B> {
    bus: B,
    expected_ready: bool,
}

impl<B: Bus> Link<B> {
    async fn exchange(&mut self, tx: &[u8], rx: &mut [u8], timeout: Duration) -> Result<(), BusError> {
        self.bus.wait_ready(self.expected_ready, timeout).await?;
        self.expected_ready = !self.expected_ready;
        self.bus.transfer(tx, rx)
    }

    async fn exchange_response(
        &mut self,
        response: TransferResponse,
        timeout: Duration,
    ) -> Result<u32, BusError> {
        let tx = u32::from(response).to_le_bytes();
        let mut rx = [0u8; 4];
        self.exchange(&tx, &mut rx, timeout).await?;
        Ok(u32::from_le_bytes(rx))
    }
}

// ── Transport ─────────────────────────────────────────────────────────────────

pub struct Transport<B> {
    link: Link<B>,
    settings: TransportSettings,
    tx_pool: Vec<PacketWriter>,
    current: usize,
    tx_scratch: Vec<u8>,
    rx_buf: Vec<u8>,
    rx_header: TransferHeader,
    protocol_version: u16,
    sequence: u16,
    last_rx_sequence: Option<u16>,
    last_data_response: TransferResponse,
    connected: bool,
    updating: bool,
    had_reset: bool,
    stats: TransferStats,
    first_completed: Option<Instant>,
    last_completed: Option<Instant>,
}

impl<B: Bus> Transport<B> {
    pub fn new(bus: B, settings: TransportSettings) -> Self {
        assert!(
            settings.tx_buffer_count >= 2,
            "resends need at least two transmit buffers"
        );
        Self {
            link: Link {
                bus,
                expected_ready: true,
            },
            tx_pool: (0..settings.tx_buffer_count)
                .map(|_| PacketWriter::new(settings.buffer_size))
                .collect(),
            current: 0,
            tx_scratch: vec![0; settings.buffer_size],
            rx_buf: vec![0; settings.buffer_size],
            rx_header: TransferHeader::invalid(),
            protocol_version: PROTOCOL_VERSION,
            sequence: 0,
            last_rx_sequence: None,
            last_data_response: TransferResponse::Success,
            connected: false,
            updating: false,
            had_reset: false,
            stats: TransferStats::default(),
            first_completed: None,
            last_completed: None,
            settings,
        }
    }

    #[cfg(test)]
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.link.bus
    }

    pub fn is_connected(&self) -> bool {
        self.connected
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version
    }

    pub fn stats(&self) -> &TransferStats {
        &self.stats
    }

    /// Whether the last completed transfer revealed a firmware reset.
    /// Clears the flag.
    pub fn take_reset(&mut self) -> bool {
        std::mem::take(&mut self.had_reset)
    }

    /// Packets received in the last completed transfer. Empty after a
    /// failed one.
    pub fn packets(&self) -> PacketIter<'_> {
        let length = self.rx_header.data_length().min(self.rx_buf.len());
        iterate_packets(&self.rx_buf[..length], self.rx_header.num_packets as usize)
    }

    fn timeout(&self) -> Duration {
        if self.updating {
            self.settings.iap_timeout
        } else if self.connected {
            self.settings.transfer_timeout
        } else {
            self.settings.first_connect_timeout
        }
    }

    // ── Full transfer ─────────────────────────────────────────────────────────

    pub async fn perform_full_transfer(&mut self) -> Result<TransferOutcome, TransportError> {
        self.rx_header = TransferHeader::invalid();
        let result = match self.exchange_header().await {
            Ok(true) => self.exchange_data().await,
            other => other,
        };

        match result {
            Ok(true) => {
                self.finish_transfer();
                Ok(TransferOutcome::Completed)
            }
            Ok(false) => {
                self.rx_header = TransferHeader::invalid();
                Ok(TransferOutcome::Failed)
            }
            Err(TransportError::Bus(e)) if e.is_link_loss() => Ok(self.lose_link(&e)),
            Err(e) => {
                self.rx_header = TransferHeader::invalid();
                Err(e)
            }
        }
    }

    fn seal_tx_header(&self) -> [u8; TransferHeader::SIZE] {
        let tx = &self.tx_pool[self.current];
        let header = TransferHeader::new(
            tx.packet_count() as u8,
            self.protocol_version,
            self.sequence,
            tx.len() as u16,
            checksum(self.protocol_version, tx.as_bytes()),
        );
        encode_header(&header)
    }

    /// Returns false when the transfer has to start over.
    async fn exchange_header(&mut self) -> Result<bool, TransportError> {
        let timeout = self.timeout();
        for _ in 0..self.settings.max_retries {
            let tx = self.seal_tx_header();
            let mut rx = [0u8; TransferHeader::SIZE];
            self.link.exchange(&tx, &mut rx, timeout).await?;

            if read_u32(&rx) == u32::from(TransferResponse::BadResponse) {
                if self.connected {
                    // the firmware missed our last data response
                    self.link
                        .exchange_response(self.last_data_response, timeout)
                        .await?;
                }
                tracing::warn!("restarting transfer, firmware reported a bad response");
                return Ok(false);
            }

            let raw = TransferHeader::read_from(&rx[..]).ok_or(BusError::NotAvailable)?;
            match raw.format_code {
                FORMAT_CODE => {}
                0 | 0xFF => return Err(BusError::NotAvailable.into()),
                FORMAT_CODE_STANDALONE => {
                    self.link
                        .exchange_response(TransferResponse::BadFormat, timeout)
                        .await?;
                    return Err(TransportError::StandaloneMode);
                }
                other => {
                    self.link
                        .exchange_response(TransferResponse::BadFormat, timeout)
                        .await?;
                    return Err(TransportError::BadFormat(other));
                }
            }

            let peer_version = raw.protocol_version();
            if peer_version > PROTOCOL_VERSION && !self.settings.update_only {
                self.link
                    .exchange_response(TransferResponse::BadProtocolVersion, timeout)
                    .await?;
                return Err(TransportError::UnsupportedProtocol(peer_version));
            }
            let negotiated = peer_version.min(PROTOCOL_VERSION);
            if negotiated != self.protocol_version {
                tracing::info!(
                    from = self.protocol_version,
                    to = negotiated,
                    "negotiated protocol version"
                );
                self.protocol_version = negotiated;
            }

            let header = match decode_header(&rx) {
                Ok(header) => header,
                Err(e) => {
                    self.stats.header_checksum_errors += 1;
                    tracing::warn!(error = %e, raw = %hex::encode(rx), "bad header checksum");
                    self.link
                        .exchange_response(TransferResponse::BadHeaderChecksum, timeout)
                        .await?;
                    continue;
                }
            };

            if header.data_length() > self.rx_buf.len() {
                self.link
                    .exchange_response(TransferResponse::BadDataLength, timeout)
                    .await?;
                return Err(TransportError::DataTooLong(header.data_length()));
            }

            let response = self
                .link
                .exchange_response(TransferResponse::Success, timeout)
                .await?;
            match TransferResponse::try_from(response) {
                Ok(TransferResponse::Success) => {
                    self.rx_header = header;
                    return Ok(true);
                }
                Ok(TransferResponse::BadHeaderChecksum) => {
                    self.stats.header_checksum_errors += 1;
                    if self.connected {
                        tracing::warn!("firmware got a bad header checksum");
                    }
                }
                Ok(
                    refused @ (TransferResponse::BadFormat
                    | TransferResponse::BadProtocolVersion
                    | TransferResponse::BadDataLength),
                ) => return Err(TransportError::PeerRefused(refused)),
                Ok(TransferResponse::BadResponse) => {
                    tracing::warn!("restarting transfer, firmware got a bad header response");
                    return Ok(false);
                }
                _ if response == 0 || response == u32::MAX => {
                    return Err(BusError::NotAvailable.into());
                }
                _ => {
                    tracing::warn!(response, "restarting transfer, unexpected header response");
                    self.reset_transfer(timeout).await?;
                    return Ok(false);
                }
            }
        }

        tracing::warn!("restarting transfer, header retries exhausted");
        self.reset_transfer(timeout).await?;
        Ok(false)
    }

    async fn exchange_data(&mut self) -> Result<bool, TransportError> {
        let rx_length = self.rx_header.data_length();
        let tx_length = self.tx_pool[self.current].len();
        if rx_length == 0 && tx_length == 0 {
            return Ok(true);
        }

        let length = rx_length.max(tx_length);
        self.tx_scratch[..length].fill(0);
        self.tx_scratch[..tx_length].copy_from_slice(self.tx_pool[self.current].as_bytes());

        let timeout = self.timeout();
        for _ in 0..self.settings.max_retries {
            self.link
                .exchange(&self.tx_scratch[..length], &mut self.rx_buf[..length], timeout)
                .await?;

            if read_u32(&self.rx_buf) == u32::from(TransferResponse::BadResponse) {
                tracing::warn!("restarting transfer, firmware reported a bad response");
                return Ok(false);
            }

            let expected = self.rx_header.checksum_data();
            let actual = checksum(self.rx_header.protocol_version(), &self.rx_buf[..rx_length]);
            if expected != actual {
                self.stats.data_checksum_errors += 1;
                tracing::warn!(expected, actual, "bad data checksum");
                self.last_data_response = TransferResponse::BadDataChecksum;
                self.link
                    .exchange_response(TransferResponse::BadDataChecksum, timeout)
                    .await?;
                continue;
            }

            self.last_data_response = TransferResponse::Success;
            let response = self
                .link
                .exchange_response(TransferResponse::Success, timeout)
                .await?;
            match TransferResponse::try_from(response) {
                Ok(TransferResponse::Success) => return Ok(true),
                Ok(TransferResponse::BadDataChecksum) => {
                    self.stats.data_checksum_errors += 1;
                    tracing::warn!("firmware got a bad data checksum");
                }
                Ok(TransferResponse::BadResponse) => {
                    tracing::warn!("restarting transfer, firmware got a bad data response");
                    return Ok(false);
                }
                _ if response == 0 || response == u32::MAX => {
                    return Err(BusError::NotAvailable.into());
                }
                _ => {
                    tracing::warn!(response, "restarting transfer, unexpected data response");
                    self.reset_transfer(timeout).await?;
                    return Ok(false);
                }
            }
        }

        tracing::warn!("restarting transfer, data retries exhausted");
        self.reset_transfer(timeout).await?;
        Ok(false)
    }

    /// Tell the firmware to drop the transfer in progress.
    async fn reset_transfer(&mut self, timeout: Duration) -> Result<(), BusError> {
        self.link
            .exchange_response(TransferResponse::BadResponse, timeout)
            .await
            .map(|_| ())
    }

    fn finish_transfer(&mut self) {
        let now = Instant::now();
        let sequence = self.rx_header.sequence_number();
        if let Some(previous) = self.last_rx_sequence {
            if sequence != previous.wrapping_add(1) {
                tracing::warn!(previous, sequence, "firmware has been reset");
                self.had_reset = true;
                self.stats.resets += 1;
            }
        }
        self.last_rx_sequence = Some(sequence);
        self.sequence = self.sequence.wrapping_add(1);

        let sent = self.tx_pool[self.current].len();
        self.stats.full_transfers += 1;
        self.stats.max_rx_bytes = self.stats.max_rx_bytes.max(self.rx_header.data_length());
        self.stats.max_tx_bytes = self.stats.max_tx_bytes.max(sent);
        if let Some(last) = self.last_completed {
            let ms = now.duration_since(last).as_secs_f64() * 1000.0;
            self.stats.max_full_transfer_ms = self.stats.max_full_transfer_ms.max(ms);
        }
        self.last_completed = Some(now);
        let first = *self.first_completed.get_or_insert(now);
        let elapsed = now.duration_since(first).as_secs_f64();
        if elapsed > 0.0 {
            self.stats.transfers_per_second = self.stats.full_transfers as f64 / elapsed;
        }

        // an empty buffer stays current so the last one sent remains resendable
        if sent > 0 {
            self.current = (self.current + 1) % self.tx_pool.len();
            self.tx_pool[self.current].reset();
        }

        if !self.connected {
            tracing::info!(protocol_version = self.protocol_version, "connection to firmware established");
            self.connected = true;
        }
        self.updating = false;
    }

    fn lose_link(&mut self, error: &BusError) -> TransferOutcome {
        self.rx_header = TransferHeader::invalid();
        self.link.expected_ready = true;
        self.stats.timeouts += 1;
        if self.connected {
            tracing::warn!(error = %error, "lost connection to firmware");
            self.connected = false;
            TransferOutcome::Disconnected
        } else {
            tracing::debug!(error = %error, "firmware not responding");
            TransferOutcome::NotConnected
        }
    }

    // ── Outbound requests ─────────────────────────────────────────────────────

    fn write(&mut self, request: HostRequest, payload: &[u8]) -> bool {
        self.tx_pool[self.current]
            .write(request as u16, payload)
            .is_some()
    }

    /// Copy packet `packet_id` of the buffer sent last into the current one.
    /// Returns false when there is no room left.
    pub fn resend_packet(&mut self, packet_id: u16) -> Result<bool, TransportError> {
        let count = self.tx_pool.len();
        let previous = (self.current + count - 1) % count;
        let (current, previous) = split_pair(&mut self.tx_pool, self.current, previous);
        match current.copy_resend(previous, packet_id) {
            Ok(Some(id)) => {
                self.stats.resends += 1;
                tracing::debug!(packet_id, id, "resending packet");
                Ok(true)
            }
            Ok(None) => {
                tracing::warn!(packet_id, "no room to resend packet");
                Ok(false)
            }
            Err(()) => Err(TransportError::InvalidResend(packet_id)),
        }
    }

    /// Always fits: pending requests are discarded if the buffer is full.
    pub fn write_emergency_stop(&mut self) {
        if !self.write(HostRequest::EmergencyStop, &[]) {
            self.tx_pool[self.current].reset();
            self.write(HostRequest::EmergencyStop, &[]);
        }
    }

    pub fn write_reset(&mut self) -> bool {
        self.write(HostRequest::Reset, &[])
    }

    pub fn write_get_state(&mut self) -> bool {
        self.write(HostRequest::GetState, &[])
    }

    pub fn write_get_object_model(&mut self, module: u8) -> bool {
        self.write(HostRequest::GetObjectModel, &encode_object_model_request(module))
    }

    // ── Firmware update ───────────────────────────────────────────────────────

    /// Put the firmware into update mode and stream `image` to it.
    ///
    /// The firmware restarts afterwards, so the next transfer is treated like
    /// the first one.
    pub async fn flash_firmware(&mut self, image: &[u8]) -> Result<(), TransportError> {
        if !self.write(HostRequest::StartIap, &[]) {
            return Err(TransportError::IapNotStarted);
        }
        let mut started = false;
        for _ in 0..self.settings.max_retries {
            if self.perform_full_transfer().await? == TransferOutcome::Completed {
                started = true;
                break;
            }
        }
        if !started {
            return Err(TransportError::IapNotStarted);
        }

        self.updating = true;
        self.connected = false;
        let timeout = self.settings.iap_timeout;
        tracing::info!(bytes = image.len(), "streaming firmware image");

        let mut segment = vec![0u8; IAP_SEGMENT_SIZE];
        let mut scratch = vec![0u8; IAP_SEGMENT_SIZE];
        for chunk in image.chunks(IAP_SEGMENT_SIZE) {
            segment.fill(0xFF);
            segment[..chunk.len()].copy_from_slice(chunk);
            self.link.exchange(&segment, &mut scratch, timeout).await?;
        }

        let mut trailer = [0u8; 8];
        trailer[..4].copy_from_slice(&image_crc32(image).to_le_bytes());
        trailer[4..].copy_from_slice(&(image.len() as u32).to_le_bytes());
        let mut rx = [0u8; 8];
        self.link.exchange(&trailer, &mut rx, timeout).await?;
        let verdict = self
            .link
            .exchange_response(TransferResponse::Success, timeout)
            .await?;

        self.link.expected_ready = true;
        self.last_rx_sequence = None;
        self.sequence = 0;
        if verdict != u32::from(TransferResponse::Success) {
            tracing::error!(verdict, "firmware rejected the update image");
            return Err(TransportError::IapRejected);
        }
        tracing::info!("firmware image accepted, waiting for restart");
        Ok(())
    }
}

impl<B: Bus> RequestSink for Transport<B> {
    fn write_code(&mut self, payload: &[u8]) -> bool {
        self.write(HostRequest::Code, payload)
    }

    fn write_macro_completed(&mut self, channel: CodeChannel, error: bool) -> bool {
        self.write(
            HostRequest::MacroCompleted,
            &encode_macro_completed(channel, error),
        )
    }

    fn write_lock_movement(&mut self, channel: CodeChannel) -> bool {
        self.write(
            HostRequest::LockMovementAndWaitForStandstill,
            &encode_channel(channel),
        )
    }

    fn write_unlock(&mut self, channel: CodeChannel) -> bool {
        self.write(HostRequest::Unlock, &encode_channel(channel))
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

/// Borrow two distinct buffers of the pool, the first mutably.
fn split_pair(
    pool: &mut [PacketWriter],
    first: usize,
    second: usize,
) -> (&mut PacketWriter, &PacketWriter) {
    if first < second {
        let (head, tail) = pool.split_at_mut(second);
        (&mut head[first], &tail[0])
    } else {
        let (head, tail) = pool.split_at_mut(first);
        (&mut tail[0], &head[second])
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::simulated::SimulatedBus;
    use motionbus_core::request::{encode_code, FirmwareMessage};
    use motionbus_core::wire::PacketHeader;
    use motionbus_core::Code;

    fn transport() -> Transport<SimulatedBus> {
        Transport::new(SimulatedBus::new(), TransportSettings::default())
    }

    fn code_payload(text: &str) -> Vec<u8> {
        let code = Code::parse(text, CodeChannel::Http).unwrap().unwrap();
        encode_code(&code).unwrap()
    }

    fn received(transport: &Transport<SimulatedBus>) -> Vec<FirmwareMessage> {
        transport
            .packets()
            .map(|p| FirmwareMessage::decode(&p.unwrap()).unwrap())
            .collect()
    }

    const SUCCESS: u32 = TransferResponse::Success as u32;
    const BAD_HEADER: u32 = TransferResponse::BadHeaderChecksum as u32;
    const BAD_RESPONSE: u32 = TransferResponse::BadResponse as u32;

    #[tokio::test]
    async fn first_transfer_connects() {
        let mut t = transport();
        assert!(!t.is_connected());
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert!(t.is_connected());
        assert_eq!(t.stats().full_transfers, 1);
        assert_eq!(t.bus_mut().completed(), 1);
        assert!(!t.take_reset());
    }

    #[tokio::test]
    async fn codes_and_firmware_requests_cross_the_link() {
        let mut t = transport();
        let payload = code_payload("G1 X10 Y20");
        assert!(t.write_code(&payload));
        t.bus_mut().push(FirmwareMessage::ReportState { busy_channels: 5 });

        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(
            t.bus_mut().take_received(),
            vec![(HostRequest::Code, payload.clone())]
        );
        assert_eq!(received(&t), vec![FirmwareMessage::ReportState { busy_channels: 5 }]);
        assert_eq!(t.stats().max_tx_bytes, PacketHeader::SIZE + payload.len());
    }

    #[tokio::test]
    async fn corrupt_header_is_retried_within_the_transfer() {
        let mut t = transport();
        t.bus_mut().faults.corrupt_headers = 1;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(t.stats().header_checksum_errors, 1);
        assert_eq!(t.bus_mut().host_responses(), &[BAD_HEADER, SUCCESS]);
    }

    #[tokio::test]
    async fn refused_headers_fail_after_bounded_retries() {
        let mut t = transport();
        t.bus_mut().faults.reject_headers = 3;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Failed);
        assert_eq!(
            t.bus_mut().host_responses(),
            &[SUCCESS, SUCCESS, SUCCESS, BAD_RESPONSE]
        );
        assert_eq!(t.stats().header_checksum_errors, 3);

        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn corrupt_data_is_retried() {
        let mut t = transport();
        t.bus_mut().push(FirmwareMessage::Locked {
            channel: CodeChannel::Usb,
        });
        t.bus_mut().faults.corrupt_data = 1;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(t.stats().data_checksum_errors, 1);
        assert_eq!(
            received(&t),
            vec![FirmwareMessage::Locked {
                channel: CodeChannel::Usb
            }]
        );
    }

    #[tokio::test]
    async fn packets_are_gone_after_a_failed_transfer() {
        let mut t = transport();
        t.bus_mut().push(FirmwareMessage::ReportState { busy_channels: 1 });
        t.perform_full_transfer().await.unwrap();
        assert_eq!(t.packets().count(), 1);

        t.bus_mut().faults.reject_headers = 3;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Failed);
        assert_eq!(t.packets().count(), 0);
    }

    #[tokio::test]
    async fn sequence_gap_is_reported_as_reset() {
        let mut t = transport();
        t.perform_full_transfer().await.unwrap();
        t.bus_mut().faults.skip_sequence = true;
        t.perform_full_transfer().await.unwrap();
        assert!(!t.take_reset());

        t.perform_full_transfer().await.unwrap();
        assert!(t.take_reset());
        assert!(!t.take_reset());
        assert_eq!(t.stats().resets, 1);
    }

    #[tokio::test]
    async fn timeout_drops_and_restores_the_connection() {
        let mut t = transport();
        t.perform_full_transfer().await.unwrap();

        t.bus_mut().disconnect();
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Disconnected);
        assert!(!t.is_connected());
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::NotConnected);
        assert_eq!(t.stats().timeouts, 2);

        t.bus_mut().restart();
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert!(t.is_connected());
        assert!(t.take_reset());
    }

    #[tokio::test]
    async fn resend_copies_packet_from_last_sent_buffer() {
        let mut t = transport();
        let unaligned: Vec<u8> = (1..=10).collect();
        assert!(t.write_get_state());
        assert!(t.write_get_object_model(2));
        assert!(t.write_code(&unaligned));
        t.perform_full_transfer().await.unwrap();
        t.bus_mut().take_received();

        assert!(t.resend_packet(3).unwrap());
        let writer = &t.tx_pool[t.current];
        assert_eq!(writer.find(1), Some((HostRequest::Code as u16, &unaligned[..])));
        let bytes = writer.as_bytes();
        assert_eq!(bytes.len(), PacketHeader::SIZE + 12);
        assert_eq!(u16::from_le_bytes([bytes[6], bytes[7]]), 3);
        assert_eq!(&bytes[18..20], &[0, 0]);

        t.perform_full_transfer().await.unwrap();
        assert_eq!(
            t.bus_mut().take_received(),
            vec![(HostRequest::Code, unaligned)]
        );
    }

    #[tokio::test]
    async fn idle_transfer_keeps_buffer_resendable() {
        let mut t = transport();
        t.write_code(&code_payload("M115"));
        t.perform_full_transfer().await.unwrap();
        t.perform_full_transfer().await.unwrap();
        assert!(t.resend_packet(1).unwrap());
    }

    #[tokio::test]
    async fn unknown_resend_is_fatal() {
        let mut t = transport();
        t.write_get_state();
        t.perform_full_transfer().await.unwrap();
        assert!(matches!(
            t.resend_packet(9),
            Err(TransportError::InvalidResend(9))
        ));
    }

    #[tokio::test]
    async fn newer_protocol_is_fatal_unless_updating() {
        let mut t = transport();
        t.bus_mut().protocol_version = PROTOCOL_VERSION + 1;
        assert!(matches!(
            t.perform_full_transfer().await,
            Err(TransportError::UnsupportedProtocol(v)) if v == PROTOCOL_VERSION + 1
        ));

        let settings = TransportSettings {
            update_only: true,
            ..TransportSettings::default()
        };
        let mut bus = SimulatedBus::new();
        bus.protocol_version = PROTOCOL_VERSION + 1;
        let mut t = Transport::new(bus, settings);
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(t.protocol_version(), PROTOCOL_VERSION);
    }

    #[tokio::test]
    async fn older_protocol_is_negotiated_down() {
        let mut t = transport();
        t.bus_mut().protocol_version = 3;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(t.protocol_version(), 3);

        let payload = code_payload("G28");
        t.write_code(&payload);
        t.bus_mut().push(FirmwareMessage::ReportState { busy_channels: 0 });
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert_eq!(t.bus_mut().take_received(), vec![(HostRequest::Code, payload)]);
        assert_eq!(received(&t).len(), 1);
    }

    #[tokio::test]
    async fn standalone_firmware_is_refused() {
        let mut t = transport();
        t.bus_mut().format_code = FORMAT_CODE_STANDALONE;
        assert!(matches!(
            t.perform_full_transfer().await,
            Err(TransportError::StandaloneMode)
        ));
    }

    #[tokio::test]
    async fn oversized_data_is_refused() {
        let settings = TransportSettings {
            buffer_size: 64,
            ..TransportSettings::default()
        };
        let mut t = Transport::new(SimulatedBus::new(), settings);
        t.bus_mut().push(FirmwareMessage::ObjectModel {
            module: 2,
            json: "x".repeat(100),
        });
        assert!(matches!(
            t.perform_full_transfer().await,
            Err(TransportError::DataTooLong(_))
        ));
    }

    #[tokio::test]
    async fn bad_response_while_connected_repeats_last_response() {
        let mut t = transport();
        t.perform_full_transfer().await.unwrap();
        t.bus_mut().faults.bad_response = 1;
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Failed);
        assert_eq!(t.bus_mut().host_responses().last(), Some(&SUCCESS));
        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
    }

    #[tokio::test]
    async fn firmware_image_is_streamed_and_verified() {
        let mut t = transport();
        t.perform_full_transfer().await.unwrap();
        let image: Vec<u8> = (0..5000u32).map(|i| (i % 251) as u8).collect();

        t.flash_firmware(&image).await.unwrap();
        assert_eq!(t.bus_mut().flashed(), Some(&image[..]));
        assert!(!t.is_connected());

        assert_eq!(t.perform_full_transfer().await.unwrap(), TransferOutcome::Completed);
        assert!(!t.take_reset());
    }
}
