//! Framing of transfer headers and packets.
//!
//! Outbound packets are appended to a [`PacketWriter`], one per transmit
//! buffer. Inbound data is walked with [`iterate_packets`], which borrows the
//! receive buffer so no packet view can outlive the next transfer.

use zerocopy::byteorder::{LittleEndian, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::checksum::checksum;
use crate::wire::{padded_len, PacketHeader, TransferHeader};

// ── Errors ────────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum CodecError {
    #[error("transfer header too short: {0} bytes")]
    MalformedHeader(usize),

    #[error("header checksum mismatch: expected 0x{expected:08x}, got 0x{actual:08x}")]
    HeaderChecksum { expected: u32, actual: u32 },

    #[error("malformed packet {index} at offset {offset}: {reason}\n{dump}")]
    MalformedPacket {
        index: usize,
        offset: usize,
        reason: &'static str,
        dump: String,
    },

    #[error("invalid payload for request {request}: {reason}")]
    InvalidPayload { request: u16, reason: &'static str },
}

// ── Transfer Headers ──────────────────────────────────────────────────────────

/// Serialize a header, filling in the header checksum for its protocol version.
pub fn encode_header(header: &TransferHeader) -> [u8; TransferHeader::SIZE] {
    let mut sealed = *header;
    sealed.checksum_header = U32::<LittleEndian>::new(header_checksum(header));
    let mut out = [0u8; TransferHeader::SIZE];
    out.copy_from_slice(sealed.as_bytes());
    out
}

/// Parse a header and verify its checksum. Format code and protocol version
/// are left to the caller.
pub fn decode_header(bytes: &[u8]) -> Result<TransferHeader, CodecError> {
    let header = TransferHeader::read_from_prefix(bytes)
        .ok_or(CodecError::MalformedHeader(bytes.len()))?;
    let expected = header_checksum(&header);
    if expected != header.checksum_header() {
        return Err(CodecError::HeaderChecksum {
            expected,
            actual: header.checksum_header(),
        });
    }
    Ok(header)
}

fn header_checksum(header: &TransferHeader) -> u32 {
    checksum(
        header.protocol_version(),
        &header.as_bytes()[..TransferHeader::CHECKSUMMED_SPAN],
    )
}

// ── Packets ───────────────────────────────────────────────────────────────────

/// Serialize one packet: header, payload, zero padding to 4 bytes.
pub fn encode_packet(request: u16, id: u16, resend_packet_id: u16, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(PacketHeader::SIZE + padded_len(payload.len()));
    let header = PacketHeader::new(request, id, payload.len() as u16, resend_packet_id);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(payload);
    out.resize(PacketHeader::SIZE + padded_len(payload.len()), 0);
    out
}

/// Bytes one packet with `payload_len` bytes of payload occupies on the wire.
pub const fn packet_size(payload_len: usize) -> usize {
    PacketHeader::SIZE + padded_len(payload_len)
}

/// Where a packet sits inside a transmit buffer.
#[derive(Debug, Clone, Copy)]
struct PacketSlot {
    id: u16,
    request: u16,
    offset: usize,
    length: usize,
}

/// One transmit buffer. Packet ids start at 1 and increase within a transfer.
#[derive(Debug)]
pub struct PacketWriter {
    buf: Vec<u8>,
    len: usize,
    next_id: u16,
    slots: Vec<PacketSlot>,
}

impl PacketWriter {
    pub fn new(capacity: usize) -> Self {
        Self {
            buf: vec![0; capacity],
            len: 0,
            next_id: 1,
            slots: Vec::new(),
        }
    }

    pub fn capacity(&self) -> usize {
        self.buf.len()
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn packet_count(&self) -> usize {
        self.slots.len()
    }

    /// The bytes to transmit.
    pub fn as_bytes(&self) -> &[u8] {
        &self.buf[..self.len]
    }

    pub fn can_write(&self, payload_len: usize) -> bool {
        self.slots.len() < u8::MAX as usize && self.len + packet_size(payload_len) <= self.buf.len()
    }

    /// Append a packet. Returns its id, or `None` when the buffer is full.
    pub fn write(&mut self, request: u16, payload: &[u8]) -> Option<u16> {
        self.write_with_resend(request, 0, payload)
    }

    fn write_with_resend(&mut self, request: u16, resend_id: u16, payload: &[u8]) -> Option<u16> {
        if !self.can_write(payload.len()) {
            return None;
        }
        let id = self.next_id;
        self.next_id = self.next_id.wrapping_add(1).max(1);

        let header = PacketHeader::new(request, id, payload.len() as u16, resend_id);
        let start = self.len;
        let payload_start = start + PacketHeader::SIZE;
        let end = start + packet_size(payload.len());
        self.buf[start..payload_start].copy_from_slice(header.as_bytes());
        self.buf[payload_start..payload_start + payload.len()].copy_from_slice(payload);
        self.buf[payload_start + payload.len()..end].fill(0);
        self.len = end;

        self.slots.push(PacketSlot {
            id,
            request,
            offset: payload_start,
            length: payload.len(),
        });
        Some(id)
    }

    /// Find a packet by id, scanning in ascending order.
    pub fn find(&self, id: u16) -> Option<(u16, &[u8])> {
        self.slots
            .iter()
            .find(|slot| slot.id == id)
            .map(|slot| (slot.request, &self.buf[slot.offset..slot.offset + slot.length]))
    }

    /// Copy packet `id` out of `previous` into this buffer under a fresh id.
    ///
    /// Returns `Ok(None)` when there is no room left, `Err(())` when
    /// `previous` holds no such packet.
    pub fn copy_resend(&mut self, previous: &PacketWriter, id: u16) -> Result<Option<u16>, ()> {
        let (request, payload) = previous.find(id).ok_or(())?;
        Ok(self.write_with_resend(request, id, payload))
    }

    /// Forget all packets and restart ids at 1.
    pub fn reset(&mut self) {
        self.len = 0;
        self.next_id = 1;
        self.slots.clear();
    }
}

/// A packet view into a receive buffer.
#[derive(Debug, Clone, Copy)]
pub struct Packet<'a> {
    pub header: PacketHeader,
    pub payload: &'a [u8],
}

/// Walk `declared_count` packets in `buffer`.
///
/// Ends after `declared_count` packets or when the data runs out, whichever
/// comes first. Yields an error and stops if a packet header or payload is cut
/// off by the end of the buffer. Trailing bytes after the last declared packet
/// are ignored.
pub fn iterate_packets(buffer: &[u8], declared_count: usize) -> PacketIter<'_> {
    PacketIter {
        buffer,
        offset: 0,
        index: 0,
        remaining: declared_count,
        failed: false,
    }
}

pub struct PacketIter<'a> {
    buffer: &'a [u8],
    offset: usize,
    index: usize,
    remaining: usize,
    failed: bool,
}

impl<'a> PacketIter<'a> {
    fn fail(&mut self, reason: &'static str) -> CodecError {
        self.failed = true;
        CodecError::MalformedPacket {
            index: self.index,
            offset: self.offset,
            reason,
            dump: dump_buffer(self.buffer),
        }
    }
}

impl<'a> Iterator for PacketIter<'a> {
    type Item = Result<Packet<'a>, CodecError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed || self.remaining == 0 || self.offset >= self.buffer.len() {
            return None;
        }

        let rest = &self.buffer[self.offset..];
        let Some(header) = PacketHeader::read_from_prefix(rest) else {
            return Some(Err(self.fail("truncated packet header")));
        };
        let total = packet_size(header.length());
        if total > rest.len() {
            return Some(Err(self.fail("payload exceeds data length")));
        }

        let payload_start = self.offset + PacketHeader::SIZE;
        let payload = &self.buffer[payload_start..payload_start + header.length()];
        self.offset += total;
        self.index += 1;
        self.remaining -= 1;
        Some(Ok(Packet { header, payload }))
    }
}

// ── Diagnostics ───────────────────────────────────────────────────────────────

/// Hex dump of a buffer, 16 bytes per line with an ASCII column.
pub fn dump_buffer(buf: &[u8]) -> String {
    let mut out = String::new();
    for (line, chunk) in buf.chunks(16).enumerate() {
        let ascii: String = chunk
            .iter()
            .map(|&b| if b.is_ascii_graphic() || b == b' ' { b as char } else { '.' })
            .collect();
        out.push_str(&format!("{:04x}: {:<32} {}\n", line * 16, hex::encode(chunk), ascii));
    }
    out
}
