//! Payloads of host and firmware requests.
//!
//! Host requests are serialized straight into packet payloads. Firmware
//! requests are decoded from a borrowed [`Packet`] into an owned
//! [`FirmwareMessage`] so they can be handled after the receive buffer is
//! reused.

use zerocopy::byteorder::{I32, U16, U32};
use zerocopy::{AsBytes, FromBytes};

use crate::code::{Code, CodeChannel, CodeFlags, ParameterValue};
use crate::codec::{CodecError, Packet};
use crate::message::MessageTypeFlags;
use crate::wire::{
    padded_len, AbortFileRecord, ChannelRecord, CodeHeader, CodeParameterRecord, CodeReplyHeader,
    DataType, ExecuteMacroHeader, FirmwareRequest, MacroCompleted, ObjectModelHeader,
    ObjectModelRequest, PrintPausedRecord, StateReport, WireError, MAX_CODE_BUFFER_SIZE,
};

// ── Host Requests ─────────────────────────────────────────────────────────────

/// Serialize a code into a Code packet payload.
pub fn encode_code(code: &Code) -> Result<Vec<u8>, WireError> {
    if code.parameters.len() > u8::MAX as usize {
        return Err(WireError::TooManyParameters(code.parameters.len()));
    }

    let mut flags = code.flags;
    if code.file_position.is_some() {
        flags.insert(CodeFlags::HAS_FILE_POSITION);
    }
    let header = CodeHeader {
        channel: code.channel as u8,
        flags: flags.0,
        num_parameters: code.parameters.len() as u8,
        letter: code.kind.letter(),
        major: I32::new(code.major),
        minor: I32::new(code.minor.unwrap_or(-1)),
        file_position: U32::new(code.file_position.unwrap_or(u32::MAX)),
    };

    let mut records = Vec::with_capacity(code.parameters.len() * 8);
    let mut extra = Vec::new();
    for param in &code.parameters {
        let (data_type, value) = match &param.value {
            ParameterValue::Int(v) => (DataType::Int, *v),
            ParameterValue::UInt(v) => (DataType::UInt, *v as i32),
            ParameterValue::Float(v) => (DataType::Float, v.to_bits() as i32),
            ParameterValue::String(s) => (DataType::String, push_str(&mut extra, s)),
            ParameterValue::Expression(s) => (DataType::Expression, push_str(&mut extra, s)),
            ParameterValue::IntArray(v) => {
                v.iter().for_each(|x| extra.extend_from_slice(&x.to_le_bytes()));
                (DataType::IntArray, v.len() as i32)
            }
            ParameterValue::UIntArray(v) => {
                v.iter().for_each(|x| extra.extend_from_slice(&x.to_le_bytes()));
                (DataType::UIntArray, v.len() as i32)
            }
            ParameterValue::FloatArray(v) => {
                v.iter().for_each(|x| extra.extend_from_slice(&x.to_le_bytes()));
                (DataType::FloatArray, v.len() as i32)
            }
        };
        let record = CodeParameterRecord {
            letter: u8::try_from(param.letter).unwrap_or(b'?'),
            data_type: data_type as u8,
            padding: U16::new(0),
            value: I32::new(value),
        };
        records.extend_from_slice(record.as_bytes());
    }

    let total = std::mem::size_of::<CodeHeader>() + records.len() + extra.len();
    if total > MAX_CODE_BUFFER_SIZE {
        return Err(WireError::CodeTooLong(total));
    }

    let mut out = Vec::with_capacity(total);
    out.extend_from_slice(header.as_bytes());
    out.extend_from_slice(&records);
    out.extend_from_slice(&extra);
    Ok(out)
}

/// Append a string zero-padded to 4 bytes; returns its unpadded length.
fn push_str(extra: &mut Vec<u8>, s: &str) -> i32 {
    extra.extend_from_slice(s.as_bytes());
    extra.resize(padded_len(extra.len()), 0);
    s.len() as i32
}

pub fn encode_macro_completed(channel: CodeChannel, error: bool) -> [u8; 4] {
    let record = MacroCompleted {
        channel: channel as u8,
        error: error as u8,
        padding: U16::new(0),
    };
    to_array(record.as_bytes())
}

/// Payload for LockMovementAndWaitForStandstill and Unlock.
pub fn encode_channel(channel: CodeChannel) -> [u8; 4] {
    let record = ChannelRecord {
        channel: channel as u8,
        padding: [0; 3],
    };
    to_array(record.as_bytes())
}

pub fn encode_object_model_request(module: u8) -> [u8; 4] {
    let record = ObjectModelRequest {
        module,
        padding: [0; 3],
    };
    to_array(record.as_bytes())
}

fn to_array(bytes: &[u8]) -> [u8; 4] {
    let mut out = [0u8; 4];
    out.copy_from_slice(bytes);
    out
}

// ── Firmware Requests ─────────────────────────────────────────────────────────

/// A decoded firmware request.
#[derive(Debug, Clone, PartialEq)]
pub enum FirmwareMessage {
    /// The firmware lost packet `packet_id` of the previous transfer.
    ResendPacket { packet_id: u16 },
    ReportState { busy_channels: u32 },
    ObjectModel { module: u8, json: String },
    CodeReply { flags: MessageTypeFlags, reply: String },
    ExecuteMacro {
        channel: CodeChannel,
        report_missing: bool,
        from_code: bool,
        filename: String,
    },
    AbortFile { channel: CodeChannel, abort_all: bool },
    PrintPaused { file_position: u32, reason: u8 },
    Locked { channel: CodeChannel },
}

impl FirmwareMessage {
    /// Decode the request carried by `packet`.
    pub fn decode(packet: &Packet<'_>) -> Result<Self, CodecError> {
        let request_code = packet.header.request();
        let request = FirmwareRequest::try_from(request_code)
            .map_err(|_| invalid(request_code, "unknown request"))?;
        let payload = packet.payload;

        match request {
            FirmwareRequest::ResendPacket => Ok(Self::ResendPacket {
                packet_id: packet.header.resend_packet_id(),
            }),
            FirmwareRequest::ReportState => {
                let state = read::<StateReport>(request_code, payload)?;
                Ok(Self::ReportState {
                    busy_channels: state.busy_channels.get(),
                })
            }
            FirmwareRequest::ObjectModel => {
                let header = read::<ObjectModelHeader>(request_code, payload)?;
                let json = trailing_str(request_code, payload, 4, header.length.get())?;
                Ok(Self::ObjectModel {
                    module: header.module,
                    json,
                })
            }
            FirmwareRequest::CodeReply => {
                let header = read::<CodeReplyHeader>(request_code, payload)?;
                let reply = trailing_str(request_code, payload, 8, header.length.get())?;
                Ok(Self::CodeReply {
                    flags: MessageTypeFlags(header.message_type.get()),
                    reply,
                })
            }
            FirmwareRequest::ExecuteMacro => {
                let header = read::<ExecuteMacroHeader>(request_code, payload)?;
                let filename = trailing_str(request_code, payload, 8, header.length.get())?;
                Ok(Self::ExecuteMacro {
                    channel: channel(request_code, header.channel)?,
                    report_missing: header.report_missing != 0,
                    from_code: header.from_code != 0,
                    filename,
                })
            }
            FirmwareRequest::AbortFile => {
                let record = read::<AbortFileRecord>(request_code, payload)?;
                Ok(Self::AbortFile {
                    channel: channel(request_code, record.channel)?,
                    abort_all: record.abort_all != 0,
                })
            }
            FirmwareRequest::PrintPaused => {
                let record = read::<PrintPausedRecord>(request_code, payload)?;
                Ok(Self::PrintPaused {
                    file_position: record.file_position.get(),
                    reason: record.reason,
                })
            }
            FirmwareRequest::Locked => {
                let record = read::<ChannelRecord>(request_code, payload)?;
                Ok(Self::Locked {
                    channel: channel(request_code, record.channel)?,
                })
            }
        }
    }

    /// Serialize into a request code and payload, the way the firmware sends
    /// it. Used by bus simulators.
    pub fn encode(&self) -> (FirmwareRequest, Vec<u8>) {
        match self {
            Self::ResendPacket { .. } => (FirmwareRequest::ResendPacket, Vec::new()),
            Self::ReportState { busy_channels } => {
                let record = StateReport {
                    busy_channels: U32::new(*busy_channels),
                };
                (FirmwareRequest::ReportState, record.as_bytes().to_vec())
            }
            Self::ObjectModel { module, json } => {
                let header = ObjectModelHeader {
                    module: *module,
                    padding: 0,
                    length: U16::new(json.len() as u16),
                };
                (FirmwareRequest::ObjectModel, concat(header.as_bytes(), json))
            }
            Self::CodeReply { flags, reply } => {
                let header = CodeReplyHeader {
                    message_type: U32::new(flags.bits()),
                    length: U16::new(reply.len() as u16),
                    padding: U16::new(0),
                };
                (FirmwareRequest::CodeReply, concat(header.as_bytes(), reply))
            }
            Self::ExecuteMacro {
                channel,
                report_missing,
                from_code,
                filename,
            } => {
                let header = ExecuteMacroHeader {
                    channel: *channel as u8,
                    report_missing: *report_missing as u8,
                    from_code: *from_code as u8,
                    padding: 0,
                    length: U16::new(filename.len() as u16),
                    padding2: U16::new(0),
                };
                (FirmwareRequest::ExecuteMacro, concat(header.as_bytes(), filename))
            }
            Self::AbortFile { channel, abort_all } => {
                let record = AbortFileRecord {
                    channel: *channel as u8,
                    abort_all: *abort_all as u8,
                    padding: U16::new(0),
                };
                (FirmwareRequest::AbortFile, record.as_bytes().to_vec())
            }
            Self::PrintPaused {
                file_position,
                reason,
            } => {
                let record = PrintPausedRecord {
                    file_position: U32::new(*file_position),
                    reason: *reason,
                    padding: [0; 3],
                };
                (FirmwareRequest::PrintPaused, record.as_bytes().to_vec())
            }
            Self::Locked { channel } => (
                FirmwareRequest::Locked,
                encode_channel(*channel).to_vec(),
            ),
        }
    }

    /// Resend requests carry their argument in the packet header.
    pub fn resend_packet_id(&self) -> u16 {
        match self {
            Self::ResendPacket { packet_id } => *packet_id,
            _ => 0,
        }
    }
}

fn invalid(request: u16, reason: &'static str) -> CodecError {
    CodecError::InvalidPayload { request, reason }
}

fn read<T: FromBytes>(request: u16, payload: &[u8]) -> Result<T, CodecError> {
    T::read_from_prefix(payload).ok_or_else(|| invalid(request, "payload too short"))
}

fn channel(request: u16, value: u8) -> Result<CodeChannel, CodecError> {
    CodeChannel::try_from(value).map_err(|_| invalid(request, "unknown channel"))
}

fn trailing_str(request: u16, payload: &[u8], offset: usize, length: u16) -> Result<String, CodecError> {
    let end = offset + length as usize;
    let bytes = payload
        .get(offset..end)
        .ok_or_else(|| invalid(request, "string exceeds payload"))?;
    Ok(String::from_utf8_lossy(bytes).into_owned())
}

fn concat(header: &[u8], text: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(header.len() + text.len());
    out.extend_from_slice(header);
    out.extend_from_slice(text.as_bytes());
    out
}
