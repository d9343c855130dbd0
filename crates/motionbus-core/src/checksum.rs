//! Checksums over transfer headers and payloads.
//!
//! The algorithm depends on the protocol version the peer announced. Older
//! peers use CRC-16/IBM-3740 (CCITT-FALSE), zero-extended into the u32 header
//! slots. From CHECKSUM32_VERSION on both sides use CRC-32/ISO-HDLC.

use crc::{Crc, CRC_16_IBM_3740, CRC_32_ISO_HDLC};

use crate::wire::CHECKSUM32_VERSION;

const CRC16: Crc<u16> = Crc::<u16>::new(&CRC_16_IBM_3740);
const CRC32: Crc<u32> = Crc::<u32>::new(&CRC_32_ISO_HDLC);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChecksumKind {
    Crc16,
    Crc32,
}

impl ChecksumKind {
    pub fn for_version(protocol_version: u16) -> Self {
        if protocol_version >= CHECKSUM32_VERSION {
            Self::Crc32
        } else {
            Self::Crc16
        }
    }

    pub fn compute(self, data: &[u8]) -> u32 {
        match self {
            Self::Crc16 => CRC16.checksum(data) as u32,
            Self::Crc32 => CRC32.checksum(data),
        }
    }
}

/// Checksum of `data` as a peer speaking `protocol_version` computes it.
pub fn checksum(protocol_version: u16, data: &[u8]) -> u32 {
    ChecksumKind::for_version(protocol_version).compute(data)
}

/// CRC-32 over a whole firmware image, used to verify IAP uploads.
pub fn image_crc32(image: &[u8]) -> u32 {
    CRC32.checksum(image)
}
