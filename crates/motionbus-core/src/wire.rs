//! Motionbus wire format: on-wire types for every bus exchange.
//!
//! These types ARE the protocol. The firmware reads the same bytes through a
//! C struct, so every field, every size and every pad byte is part of the
//! format. Bump PROTOCOL_VERSION when anything here changes.
//!
//! All multi-byte fields are little-endian zerocopy byte-order types, which
//! keeps every struct `Unaligned` and lets us read headers straight out of a
//! receive buffer at any offset. There is no unsafe code in this module.

use static_assertions::assert_eq_size;
use zerocopy::byteorder::{LittleEndian, I32, U16, U32};
use zerocopy::{AsBytes, FromBytes, FromZeroes, Unaligned};

type LeU16 = U16<LittleEndian>;
type LeU32 = U32<LittleEndian>;
type LeI32 = I32<LittleEndian>;

// ── Constants ─────────────────────────────────────────────────────────────────

/// Format code of a transfer header sent by compatible firmware.
pub const FORMAT_CODE: u8 = 0x5F;

/// Format code sent by firmware that runs in standalone mode and will not
/// accept a host on the bus.
pub const FORMAT_CODE_STANDALONE: u8 = 0x60;

/// Placeholder written into the receive header before each exchange so a
/// transfer that never filled the buffer cannot pass as valid.
pub const INVALID_FORMAT_CODE: u8 = 0xC9;

/// Highest protocol version this host speaks.
pub const PROTOCOL_VERSION: u16 = 4;

/// First protocol version that uses 32-bit checksums.
/// Older peers get CRC-16 values zero-extended into the u32 slots.
pub const CHECKSUM32_VERSION: u16 = 4;

/// Default size of the transmit and receive data buffers.
pub const BUFFER_SIZE: usize = 8192;

/// Maximum size of one serialized code payload.
pub const MAX_CODE_BUFFER_SIZE: usize = 256;

/// Size of one firmware image segment streamed in IAP mode.
pub const IAP_SEGMENT_SIZE: usize = 2048;

/// Number of code channels known to the firmware.
pub const NUM_CODE_CHANNELS: usize = 12;

// ── Transfer Header ───────────────────────────────────────────────────────────

/// Header exchanged at the start of every full transfer.
///
/// Both sides send one simultaneously. The header checksum covers bytes
/// 0..12, i.e. every field except itself, so `checksum_data` must be filled
/// in before the header checksum is computed.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct TransferHeader {
    /// Must equal FORMAT_CODE for a compatible peer.
    pub format_code: u8,
    /// Number of packets in the data exchange.
    pub num_packets: u8,
    pub protocol_version: LeU16,
    /// Incremented once per full transfer, wraps at u16::MAX.
    pub sequence_number: LeU16,
    /// Length of the data exchange in bytes, padding included.
    pub data_length: LeU16,
    /// Checksum over the `data_length` payload bytes.
    pub checksum_data: LeU32,
    /// Checksum over bytes 0..12 of this header.
    pub checksum_header: LeU32,
}

assert_eq_size!(TransferHeader, [u8; 16]);

impl TransferHeader {
    pub const SIZE: usize = 16;

    /// Number of leading header bytes covered by the header checksum.
    pub const CHECKSUMMED_SPAN: usize = 12;

    /// An unsealed header. `encode_header` fills in the header checksum.
    pub fn new(
        num_packets: u8,
        protocol_version: u16,
        sequence_number: u16,
        data_length: u16,
        checksum_data: u32,
    ) -> Self {
        Self {
            format_code: FORMAT_CODE,
            num_packets,
            protocol_version: LeU16::new(protocol_version),
            sequence_number: LeU16::new(sequence_number),
            data_length: LeU16::new(data_length),
            checksum_data: LeU32::new(checksum_data),
            checksum_header: LeU32::new(0),
        }
    }

    /// A header that no peer would ever send. Used to reset the receive side.
    pub fn invalid() -> Self {
        let mut header = Self::new_zeroed();
        header.format_code = INVALID_FORMAT_CODE;
        header
    }

    pub fn protocol_version(&self) -> u16 {
        self.protocol_version.get()
    }

    pub fn sequence_number(&self) -> u16 {
        self.sequence_number.get()
    }

    pub fn data_length(&self) -> usize {
        self.data_length.get() as usize
    }

    pub fn checksum_data(&self) -> u32 {
        self.checksum_data.get()
    }

    pub fn checksum_header(&self) -> u32 {
        self.checksum_header.get()
    }
}

// ── Packet Header ─────────────────────────────────────────────────────────────

/// Sub-header that precedes every packet inside the data exchange.
///
/// The payload that follows is `length` bytes long and zero-padded to the next
/// 4-byte boundary. `resend_packet_id` is only non-zero on a resend request
/// issued by the firmware.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PacketHeader {
    pub request: LeU16,
    pub id: LeU16,
    pub length: LeU16,
    pub resend_packet_id: LeU16,
}

assert_eq_size!(PacketHeader, [u8; 8]);

impl PacketHeader {
    pub const SIZE: usize = 8;

    pub fn new(request: u16, id: u16, length: u16, resend_packet_id: u16) -> Self {
        Self {
            request: LeU16::new(request),
            id: LeU16::new(id),
            length: LeU16::new(length),
            resend_packet_id: LeU16::new(resend_packet_id),
        }
    }

    pub fn request(&self) -> u16 {
        self.request.get()
    }

    pub fn id(&self) -> u16 {
        self.id.get()
    }

    pub fn length(&self) -> usize {
        self.length.get() as usize
    }

    pub fn resend_packet_id(&self) -> u16 {
        self.resend_packet_id.get()
    }
}

/// Round a payload length up to the next 4-byte boundary.
pub const fn padded_len(length: usize) -> usize {
    (length + 3) & !3
}

// ── Transfer Responses ────────────────────────────────────────────────────────

/// Bare 32-bit value exchanged after the header and data phases.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u32)]
pub enum TransferResponse {
    Success = 1,
    BadFormat = 2,
    BadProtocolVersion = 3,
    BadDataLength = 4,
    BadHeaderChecksum = 5,
    BadDataChecksum = 6,
    BadResponse = 7,
}

impl TryFrom<u32> for TransferResponse {
    type Error = WireError;

    fn try_from(value: u32) -> Result<Self, Self::Error> {
        match value {
            1 => Ok(Self::Success),
            2 => Ok(Self::BadFormat),
            3 => Ok(Self::BadProtocolVersion),
            4 => Ok(Self::BadDataLength),
            5 => Ok(Self::BadHeaderChecksum),
            6 => Ok(Self::BadDataChecksum),
            7 => Ok(Self::BadResponse),
            other => Err(WireError::UnknownResponse(other)),
        }
    }
}

impl From<TransferResponse> for u32 {
    fn from(r: TransferResponse) -> u32 {
        r as u32
    }
}

// ── Request Codes ─────────────────────────────────────────────────────────────

/// Requests sent from the host to the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum HostRequest {
    EmergencyStop = 0,
    Reset = 1,
    Code = 2,
    GetObjectModel = 3,
    MacroCompleted = 4,
    LockMovementAndWaitForStandstill = 5,
    Unlock = 6,
    StartIap = 7,
    GetState = 8,
}

impl TryFrom<u16> for HostRequest {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::EmergencyStop),
            1 => Ok(Self::Reset),
            2 => Ok(Self::Code),
            3 => Ok(Self::GetObjectModel),
            4 => Ok(Self::MacroCompleted),
            5 => Ok(Self::LockMovementAndWaitForStandstill),
            6 => Ok(Self::Unlock),
            7 => Ok(Self::StartIap),
            8 => Ok(Self::GetState),
            other => Err(WireError::UnknownRequest(other)),
        }
    }
}

/// Requests sent from the firmware to the host.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
pub enum FirmwareRequest {
    ResendPacket = 0,
    ReportState = 1,
    ObjectModel = 2,
    CodeReply = 3,
    ExecuteMacro = 4,
    AbortFile = 5,
    PrintPaused = 6,
    Locked = 7,
}

impl TryFrom<u16> for FirmwareRequest {
    type Error = WireError;

    fn try_from(value: u16) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::ResendPacket),
            1 => Ok(Self::ReportState),
            2 => Ok(Self::ObjectModel),
            3 => Ok(Self::CodeReply),
            4 => Ok(Self::ExecuteMacro),
            5 => Ok(Self::AbortFile),
            6 => Ok(Self::PrintPaused),
            7 => Ok(Self::Locked),
            other => Err(WireError::UnknownRequest(other)),
        }
    }
}

// ── Host Request Payloads ─────────────────────────────────────────────────────

/// Leading record of a serialized code.
///
/// Wire size: 16 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CodeHeader {
    pub channel: u8,
    /// See `code::CodeFlags`.
    pub flags: u8,
    pub num_parameters: u8,
    /// ASCII letter: b'G', b'M' or b'T'.
    pub letter: u8,
    pub major: LeI32,
    /// -1 when the code has no minor number.
    pub minor: LeI32,
    /// u32::MAX when the code has no file position.
    pub file_position: LeU32,
}

assert_eq_size!(CodeHeader, [u8; 16]);

/// One parameter record. Strings and arrays store their length in `value`
/// and append their data after the last record.
///
/// Wire size: 8 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CodeParameterRecord {
    pub letter: u8,
    pub data_type: u8,
    pub padding: LeU16,
    pub value: LeI32,
}

assert_eq_size!(CodeParameterRecord, [u8; 8]);

/// Parameter data types as understood by the firmware.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum DataType {
    Int = 0,
    UInt = 1,
    Float = 2,
    IntArray = 3,
    UIntArray = 4,
    FloatArray = 5,
    String = 6,
    Expression = 7,
}

impl TryFrom<u8> for DataType {
    type Error = WireError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(Self::Int),
            1 => Ok(Self::UInt),
            2 => Ok(Self::Float),
            3 => Ok(Self::IntArray),
            4 => Ok(Self::UIntArray),
            5 => Ok(Self::FloatArray),
            6 => Ok(Self::String),
            7 => Ok(Self::Expression),
            other => Err(WireError::UnknownDataType(other)),
        }
    }
}

/// MacroCompleted payload.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct MacroCompleted {
    pub channel: u8,
    pub error: u8,
    pub padding: LeU16,
}

assert_eq_size!(MacroCompleted, [u8; 4]);

/// Payload of requests that only name a channel (lock, unlock, locked).
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ChannelRecord {
    pub channel: u8,
    pub padding: [u8; 3],
}

assert_eq_size!(ChannelRecord, [u8; 4]);

/// GetObjectModel payload.
///
/// Wire size: 4 bytes.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ObjectModelRequest {
    pub module: u8,
    pub padding: [u8; 3],
}

assert_eq_size!(ObjectModelRequest, [u8; 4]);

// ── Firmware Request Payloads ─────────────────────────────────────────────────

/// ReportState payload: one bit per busy code channel.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct StateReport {
    pub busy_channels: LeU32,
}

assert_eq_size!(StateReport, [u8; 4]);

/// ObjectModel payload header, followed by `length` bytes of UTF-8 JSON.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ObjectModelHeader {
    pub module: u8,
    pub padding: u8,
    pub length: LeU16,
}

assert_eq_size!(ObjectModelHeader, [u8; 4]);

/// CodeReply payload header, followed by `length` bytes of UTF-8 text.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct CodeReplyHeader {
    /// See `message::MessageTypeFlags`.
    pub message_type: LeU32,
    pub length: LeU16,
    pub padding: LeU16,
}

assert_eq_size!(CodeReplyHeader, [u8; 8]);

/// ExecuteMacro payload header, followed by `length` bytes of UTF-8 filename.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct ExecuteMacroHeader {
    pub channel: u8,
    pub report_missing: u8,
    pub from_code: u8,
    pub padding: u8,
    pub length: LeU16,
    pub padding2: LeU16,
}

assert_eq_size!(ExecuteMacroHeader, [u8; 8]);

/// AbortFile payload.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct AbortFileRecord {
    pub channel: u8,
    pub abort_all: u8,
    pub padding: LeU16,
}

assert_eq_size!(AbortFileRecord, [u8; 4]);

/// PrintPaused payload.
#[derive(Debug, Clone, Copy, AsBytes, FromBytes, FromZeroes, Unaligned)]
#[repr(C)]
pub struct PrintPausedRecord {
    pub file_position: LeU32,
    pub reason: u8,
    pub padding: [u8; 3],
}

assert_eq_size!(PrintPausedRecord, [u8; 8]);

// ── Errors ────────────────────────────────────────────────────────────────────

/// Errors that can arise when interpreting wire-format values.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("unknown transfer response: 0x{0:08x}")]
    UnknownResponse(u32),

    #[error("unknown request code: {0}")]
    UnknownRequest(u16),

    #[error("unknown code channel: {0}")]
    UnknownChannel(u8),

    #[error("unknown parameter data type: {0}")]
    UnknownDataType(u8),

    #[error("code needs {0} bytes but at most {} fit into a packet", MAX_CODE_BUFFER_SIZE)]
    CodeTooLong(usize),

    #[error("code has {0} parameters, at most 255 are supported")]
    TooManyParameters(usize),
}

// ── Tests ─────────────────────────────────────────────────────────────────────
