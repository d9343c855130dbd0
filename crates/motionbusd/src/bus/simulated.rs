//! A firmware peer in memory, for driving the transport in tests.
//!
//! The simulator follows the same exchange sequence as real firmware:
//! header, header response, data, data response. Its ready line toggles once
//! per exchange and starts high after every restart, so a transport that
//! waits for the wrong level times out just as it would on hardware.

use std::collections::VecDeque;
use std::future::Future;
use std::time::Duration;

use motionbus_core::checksum::{checksum, image_crc32};
use motionbus_core::codec::{decode_header, encode_header, encode_packet, iterate_packets};
use motionbus_core::request::FirmwareMessage;
use motionbus_core::wire::{
    HostRequest, TransferHeader, TransferResponse, IAP_SEGMENT_SIZE, PROTOCOL_VERSION,
};
use motionbus_core::{CodeChannel, MessageTypeFlags};

use super::{Bus, BusError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Header,
    HeaderResponse,
    Data,
    DataResponse,
    /// Sent BadResponse in place of a header; expecting the host to repeat
    /// its last response.
    Resync,
    Iap,
}

/// One-shot faults, consumed as they fire.
#[derive(Debug, Default)]
pub struct Faults {
    /// Corrupt the next N headers sent to the host.
    pub corrupt_headers: usize,
    /// Answer the next N host headers with BadHeaderChecksum.
    pub reject_headers: usize,
    /// Corrupt the next N data exchanges sent to the host.
    pub corrupt_data: usize,
    /// Send BadResponse instead of the next N headers.
    pub bad_response: usize,
    /// Skip one sequence number on the next completed transfer.
    pub skip_sequence: bool,
}

pub struct SimulatedBus {
    pub faults: Faults,
    pub format_code: u8,
    pub protocol_version: u16,
    /// Answer every code with an empty binary reply.
    pub auto_reply: bool,
    /// Status reported for object model module 2, if any.
    pub status: Option<&'static str>,
    ready: bool,
    unresponsive: bool,
    phase: Phase,
    sequence: u16,
    outgoing: VecDeque<FirmwareMessage>,
    tx_data: Option<(u8, Vec<u8>)>,
    host_header: Option<TransferHeader>,
    header_ok: bool,
    data_ok: bool,
    staged: Vec<(u16, Vec<u8>)>,
    received: Vec<(u16, Vec<u8>)>,
    host_responses: Vec<u32>,
    completed: u32,
    iap_image: Vec<u8>,
    iap_verdict: TransferResponse,
    flashed: Option<Vec<u8>>,
}

impl Default for SimulatedBus {
    fn default() -> Self {
        Self {
            faults: Faults::default(),
            format_code: motionbus_core::wire::FORMAT_CODE,
            protocol_version: PROTOCOL_VERSION,
            auto_reply: false,
            status: None,
            ready: true,
            unresponsive: false,
            phase: Phase::Header,
            sequence: 0,
            outgoing: VecDeque::new(),
            tx_data: None,
            host_header: None,
            header_ok: false,
            data_ok: false,
            staged: Vec::new(),
            received: Vec::new(),
            host_responses: Vec::new(),
            completed: 0,
            iap_image: Vec::new(),
            iap_verdict: TransferResponse::BadDataChecksum,
            flashed: None,
        }
    }
}

impl SimulatedBus {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a request for the next transfer that has not started yet.
    pub fn push(&mut self, message: FirmwareMessage) {
        self.outgoing.push_back(message);
    }

    /// Stop answering until `restart` is called.
    pub fn disconnect(&mut self) {
        self.unresponsive = true;
    }

    /// Come back as freshly booted firmware.
    pub fn restart(&mut self) {
        self.unresponsive = false;
        self.ready = true;
        self.phase = Phase::Header;
        self.sequence = 0;
        self.tx_data = None;
        self.outgoing.clear();
        self.staged.clear();
    }

    pub fn completed(&self) -> u32 {
        self.completed
    }

    pub fn sequence(&self) -> u16 {
        self.sequence
    }

    /// Every response code the host sent, oldest first.
    pub fn host_responses(&self) -> &[u32] {
        &self.host_responses
    }

    pub fn flashed(&self) -> Option<&[u8]> {
        self.flashed.as_deref()
    }

    /// Requests received in completed transfers since the last call.
    pub fn take_received(&mut self) -> Vec<(HostRequest, Vec<u8>)> {
        self.received
            .drain(..)
            .filter_map(|(request, payload)| {
                HostRequest::try_from(request).ok().map(|r| (r, payload))
            })
            .collect()
    }

    pub fn received_requests(&mut self) -> Vec<HostRequest> {
        self.take_received().into_iter().map(|(r, _)| r).collect()
    }

    // ── Exchanges ─────────────────────────────────────────────────────────────

    fn prepare_data(&mut self) -> (u8, usize) {
        if self.tx_data.is_none() {
            let mut bytes = Vec::new();
            let mut count = 0u8;
            while let Some(message) = self.outgoing.pop_front() {
                let (request, payload) = message.encode();
                count += 1;
                bytes.extend(encode_packet(
                    request as u16,
                    count as u16,
                    message.resend_packet_id(),
                    &payload,
                ));
            }
            self.tx_data = Some((count, bytes));
        }
        self.tx_data
            .as_ref()
            .map_or((0, 0), |(count, bytes)| (*count, bytes.len()))
    }

    fn exchange_header(&mut self, tx: &[u8], rx: &mut [u8]) {
        if self.faults.bad_response > 0 {
            self.faults.bad_response -= 1;
            rx.fill(0);
            write_response(rx, TransferResponse::BadResponse);
            self.phase = if self.completed > 0 { Phase::Resync } else { Phase::Header };
            return;
        }

        let (num_packets, data_length) = self.prepare_data();
        let data_checksum = self
            .tx_data
            .as_ref()
            .map_or(0, |(_, bytes)| checksum(self.protocol_version, bytes));
        let mut header = TransferHeader::new(
            num_packets,
            self.protocol_version,
            self.sequence,
            data_length as u16,
            data_checksum,
        );
        header.format_code = self.format_code;
        let mut bytes = encode_header(&header);
        if self.faults.corrupt_headers > 0 {
            self.faults.corrupt_headers -= 1;
            bytes[6] ^= 0x01;
        }
        rx.copy_from_slice(&bytes);

        match decode_header(tx) {
            Ok(host) => {
                self.header_ok = true;
                self.host_header = Some(host);
            }
            Err(_) => self.header_ok = false,
        }
        self.phase = Phase::HeaderResponse;
    }

    fn exchange_header_response(&mut self, tx: &[u8], rx: &mut [u8]) {
        let host = read_u32(tx);
        self.host_responses.push(host);

        let ours = if !self.header_ok {
            TransferResponse::BadHeaderChecksum
        } else if self.faults.reject_headers > 0 {
            self.faults.reject_headers -= 1;
            TransferResponse::BadHeaderChecksum
        } else {
            TransferResponse::Success
        };
        write_response(rx, ours);

        let success = u32::from(TransferResponse::Success);
        if host != success || ours != TransferResponse::Success {
            self.phase = Phase::Header;
            return;
        }

        let host_length = self.host_header.map_or(0, |h| h.data_length());
        let our_length = self.tx_data.as_ref().map_or(0, |(_, bytes)| bytes.len());
        if host_length == 0 && our_length == 0 {
            self.complete(false);
        } else {
            self.phase = Phase::Data;
        }
    }

    fn exchange_data(&mut self, tx: &[u8], rx: &mut [u8]) {
        rx.fill(0);
        if let Some((_, bytes)) = &self.tx_data {
            rx[..bytes.len()].copy_from_slice(bytes);
            if self.faults.corrupt_data > 0 && !bytes.is_empty() {
                self.faults.corrupt_data -= 1;
                rx[bytes.len() - 1] ^= 0x01;
            }
        }

        self.staged.clear();
        self.data_ok = match self.host_header {
            Some(header) if tx.len() >= header.data_length() => {
                let data = &tx[..header.data_length()];
                let ok = checksum(header.protocol_version(), data) == header.checksum_data();
                if ok {
                    self.staged = iterate_packets(data, header.num_packets as usize)
                        .filter_map(Result::ok)
                        .map(|p| (p.header.request(), p.payload.to_vec()))
                        .collect();
                }
                ok
            }
            _ => false,
        };
        self.phase = Phase::DataResponse;
    }

    fn exchange_data_response(&mut self, tx: &[u8], rx: &mut [u8]) {
        let host = read_u32(tx);
        self.host_responses.push(host);

        let ours = if self.data_ok {
            TransferResponse::Success
        } else {
            TransferResponse::BadDataChecksum
        };
        write_response(rx, ours);

        if host == u32::from(TransferResponse::Success) && ours == TransferResponse::Success {
            let staged = std::mem::take(&mut self.staged);
            let starts_iap = staged
                .iter()
                .any(|(request, _)| *request == HostRequest::StartIap as u16);
            for (request, payload) in &staged {
                self.react(*request, payload);
            }
            self.received.extend(staged);
            self.complete(starts_iap);
        } else {
            self.phase = Phase::Data;
        }
    }

    fn exchange_iap(&mut self, tx: &[u8], rx: &mut [u8]) {
        rx.fill(0);
        match tx.len() {
            IAP_SEGMENT_SIZE => self.iap_image.extend_from_slice(tx),
            8 => {
                let crc = read_u32(&tx[..4]);
                let length = read_u32(&tx[4..]) as usize;
                self.iap_image.truncate(length);
                self.iap_verdict = if image_crc32(&self.iap_image) == crc {
                    TransferResponse::Success
                } else {
                    TransferResponse::BadDataChecksum
                };
            }
            _ => {
                write_response(rx, self.iap_verdict);
                if self.iap_verdict == TransferResponse::Success {
                    self.flashed = Some(std::mem::take(&mut self.iap_image));
                }
                self.restart();
            }
        }
    }

    /// Answers produced by the firmware for requests it just received.
    fn react(&mut self, request: u16, payload: &[u8]) {
        match HostRequest::try_from(request) {
            Ok(HostRequest::Code) if self.auto_reply => {
                if let Ok(channel) = CodeChannel::try_from(payload[0]) {
                    self.outgoing.push_back(FirmwareMessage::CodeReply {
                        flags: MessageTypeFlags::BINARY_CODE_REPLY
                            | MessageTypeFlags::for_channel(channel),
                        reply: String::new(),
                    });
                }
            }
            Ok(HostRequest::GetObjectModel) if payload[0] == 2 => {
                if let Some(status) = self.status {
                    self.outgoing.push_back(FirmwareMessage::ObjectModel {
                        module: 2,
                        json: format!(r#"{{"state":{{"status":"{status}"}}}}"#),
                    });
                }
            }
            _ => {}
        }
    }

    fn complete(&mut self, starts_iap: bool) {
        self.completed += 1;
        let step = if std::mem::take(&mut self.faults.skip_sequence) { 2 } else { 1 };
        self.sequence = self.sequence.wrapping_add(step);
        self.tx_data = None;
        self.phase = Phase::Header;
        if starts_iap {
            self.iap_image.clear();
            self.phase = Phase::Iap;
        }
    }
}

impl Bus for SimulatedBus {
    fn wait_ready(
        &mut self,
        level: bool,
        _timeout: Duration,
    ) -> impl Future<Output = Result<(), BusError>> + Send {
        let result = if self.unresponsive || level != self.ready {
            Err(BusError::Timeout)
        } else {
            Ok(())
        };
        std::future::ready(result)
    }

    fn transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), BusError> {
        assert_eq!(tx.len(), rx.len(), "full-duplex exchange with uneven buffers");
        self.ready = !self.ready;

        if self.phase == Phase::Iap {
            self.exchange_iap(tx, rx);
            return Ok(());
        }
        if tx.len() == 4 && read_u32(tx) == u32::from(TransferResponse::BadResponse) {
            self.host_responses.push(read_u32(tx));
            self.phase = Phase::Header;
            return Ok(());
        }

        match self.phase {
            Phase::Resync if tx.len() == 4 => {
                self.host_responses.push(read_u32(tx));
                write_response(rx, TransferResponse::Success);
                self.phase = Phase::Header;
            }
            Phase::Header | Phase::Resync => self.exchange_header(tx, rx),
            Phase::HeaderResponse => self.exchange_header_response(tx, rx),
            Phase::Data => self.exchange_data(tx, rx),
            Phase::DataResponse => self.exchange_data_response(tx, rx),
            Phase::Iap => unreachable!(),
        }
        Ok(())
    }
}

fn read_u32(bytes: &[u8]) -> u32 {
    u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]])
}

fn write_response(rx: &mut [u8], response: TransferResponse) {
    rx[..4].copy_from_slice(&u32::from(response).to_le_bytes());
}
