//! Framing: fixed 10-byte little-endian header + payload, CRC-16/MODBUS over the payload.
//! Also the transfer session header sent once per job before its body.

use crate::integrity;
use crate::protocol::{PacketType, HEADER_SIZE, MAGIC, MAX_PAYLOAD_SIZE, PROTOCOL_VERSION};

/// Packet header exactly as it appears on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketHeader {
    pub magic: u16,
    pub version: u8,
    pub packet_type: PacketType,
    pub sequence: u16,
    pub length: u16,
    pub checksum: u16,
}

impl PacketHeader {
    pub fn to_bytes(&self) -> [u8; HEADER_SIZE] {
        let mut out = [0u8; HEADER_SIZE];
        out[0..2].copy_from_slice(&self.magic.to_le_bytes());
        out[2] = self.version;
        out[3] = self.packet_type.into();
        out[4..6].copy_from_slice(&self.sequence.to_le_bytes());
        out[6..8].copy_from_slice(&self.length.to_le_bytes());
        out[8..10].copy_from_slice(&self.checksum.to_le_bytes());
        out
    }

    /// Parse a header without checking magic or checksum.
    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < HEADER_SIZE {
            return Err(WireError::NeedMore);
        }
        let packet_type =
            PacketType::try_from(bytes[3]).map_err(WireError::UnknownPacketType)?;
        Ok(Self {
            magic: u16::from_le_bytes([bytes[0], bytes[1]]),
            version: bytes[2],
            packet_type,
            sequence: u16::from_le_bytes([bytes[4], bytes[5]]),
            length: u16::from_le_bytes([bytes[6], bytes[7]]),
            checksum: u16::from_le_bytes([bytes[8], bytes[9]]),
        })
    }
}

/// One framed unit of protocol traffic. Transient: built per send, parsed per receive.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    pub header: PacketHeader,
    pub payload: Vec<u8>,
}

impl Packet {
    /// Build a packet with the current magic/version and a checksum over `payload`.
    pub fn new(packet_type: PacketType, sequence: u16, payload: Vec<u8>) -> Result<Self, WireError> {
        if payload.len() > MAX_PAYLOAD_SIZE {
            return Err(WireError::PayloadTooLarge(payload.len()));
        }
        let header = PacketHeader {
            magic: MAGIC,
            version: PROTOCOL_VERSION,
            packet_type,
            sequence,
            length: payload.len() as u16,
            checksum: integrity::crc16_modbus(&payload),
        };
        Ok(Self { header, payload })
    }

    pub fn packet_type(&self) -> PacketType {
        self.header.packet_type
    }

    pub fn sequence(&self) -> u16 {
        self.header.sequence
    }

    /// Serialize header and payload into one buffer.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(HEADER_SIZE + self.payload.len());
        out.extend_from_slice(&self.header.to_bytes());
        out.extend_from_slice(&self.payload);
        out
    }
}

/// Decode one packet from the front of `bytes`. Returns the packet and the number of bytes consumed.
/// Call with a partial buffer; returns `NeedMore` until the whole frame is present.
pub fn decode_packet(bytes: &[u8]) -> Result<(Packet, usize), WireError> {
    if bytes.len() < 2 {
        return Err(WireError::NeedMore);
    }
    let magic = u16::from_le_bytes([bytes[0], bytes[1]]);
    if magic != MAGIC {
        return Err(WireError::BadMagic(magic));
    }
    let header = PacketHeader::parse(bytes)?;
    let len = header.length as usize;
    if len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(len));
    }
    if bytes.len() < HEADER_SIZE + len {
        return Err(WireError::NeedMore);
    }
    let payload = &bytes[HEADER_SIZE..HEADER_SIZE + len];
    if !integrity::verify_payload(payload, header.checksum) {
        return Err(WireError::ChecksumMismatch {
            expected: header.checksum,
            actual: integrity::crc16_modbus(payload),
            frame_len: HEADER_SIZE + len,
        });
    }
    Ok((
        Packet {
            header,
            payload: payload.to_vec(),
        },
        HEADER_SIZE + len,
    ))
}

/// Error decoding or building a packet.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum WireError {
    #[error("need more bytes")]
    NeedMore,
    #[error("bad magic 0x{0:04x}")]
    BadMagic(u16),
    #[error("unknown packet type 0x{0:02x}")]
    UnknownPacketType(u8),
    #[error("payload length {0} exceeds maximum {}", MAX_PAYLOAD_SIZE)]
    PayloadTooLarge(usize),
    #[error("checksum mismatch: header 0x{expected:04x}, payload 0x{actual:04x}")]
    ChecksumMismatch {
        expected: u16,
        actual: u16,
        frame_len: usize,
    },
}

/// Receive-side accumulator: turns an arbitrary byte stream back into packets.
///
/// Noise before a frame is skipped a byte at a time until a magic lines up.
/// A frame whose checksum does not match is dropped whole.
#[derive(Debug, Default)]
pub struct Deframer {
    buf: Vec<u8>,
    dropped: u64,
}

impl Deframer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, bytes: &[u8]) {
        self.buf.extend_from_slice(bytes);
    }

    /// Bytes discarded so far while resynchronizing or rejecting frames.
    pub fn dropped(&self) -> u64 {
        self.dropped
    }

    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    pub fn clear(&mut self) {
        self.buf.clear();
    }

    /// Next complete, valid packet, or None when more bytes are needed.
    pub fn next_packet(&mut self) -> Option<Packet> {
        loop {
            match decode_packet(&self.buf) {
                Ok((packet, used)) => {
                    self.buf.drain(..used);
                    return Some(packet);
                }
                Err(WireError::NeedMore) => return None,
                Err(WireError::ChecksumMismatch {
                    expected,
                    actual,
                    frame_len,
                }) => {
                    tracing::warn!(
                        expected = format_args!("0x{expected:04x}"),
                        actual = format_args!("0x{actual:04x}"),
                        "dropping frame with bad checksum"
                    );
                    self.discard(frame_len);
                }
                Err(e) => {
                    tracing::trace!(error = %e, "resync");
                    self.discard(1);
                }
            }
        }
    }

    fn discard(&mut self, n: usize) {
        let n = n.min(self.buf.len());
        self.buf.drain(..n);
        self.dropped += n as u64;
    }
}

// ── Transfer session header ──────────────────────────────────────────────────

/// Sentinel opening every transfer session ("SNRT" on the wire).
pub const TRANSFER_MAGIC: u32 = 0x5452_4E53;

/// Wire size of `TransferHeader`.
pub const TRANSFER_HEADER_SIZE: usize = 16;

/// Sent once per job before its body, followed by `name_length` raw name bytes.
/// The body then follows in `chunk_size` increments with no further framing.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransferHeader {
    pub magic: u32,
    pub total_size: u32,
    pub chunk_size: u32,
    pub name_length: u32,
}

impl TransferHeader {
    pub fn new(total_size: u32, chunk_size: u32, name_length: u32) -> Self {
        Self {
            magic: TRANSFER_MAGIC,
            total_size,
            chunk_size,
            name_length,
        }
    }

    pub fn to_bytes(&self) -> [u8; TRANSFER_HEADER_SIZE] {
        let mut out = [0u8; TRANSFER_HEADER_SIZE];
        out[0..4].copy_from_slice(&self.magic.to_le_bytes());
        out[4..8].copy_from_slice(&self.total_size.to_le_bytes());
        out[8..12].copy_from_slice(&self.chunk_size.to_le_bytes());
        out[12..16].copy_from_slice(&self.name_length.to_le_bytes());
        out
    }

    pub fn parse(bytes: &[u8]) -> Result<Self, WireError> {
        if bytes.len() < TRANSFER_HEADER_SIZE {
            return Err(WireError::NeedMore);
        }
        let word = |i: usize| u32::from_le_bytes([bytes[i], bytes[i + 1], bytes[i + 2], bytes[i + 3]]);
        Ok(Self {
            magic: word(0),
            total_size: word(4),
            chunk_size: word(8),
            name_length: word(12),
        })
    }
}
