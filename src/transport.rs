//! Inbound transport contract and its stdin framing.
//!
//! The capture core consumes [`TransportEvent`]s; it does not care which
//! chat platform produced them. Library consumers send events directly on
//! the session's channel. The `capture` subcommand instead reads the
//! little-endian binary framing below from stdin, so an external adapter
//! process can feed the pipeline.
//!
//! ## Frame layout (little-endian)
//!
//! | Offset | Size | Field |
//! |--------|------|-------|
//! | 0 | 4 | Magic: 0x50545256 ("VRTP") |
//! | 4 | 1 | Kind (0 packet, 1 join, 2 leave, 3 disconnect) |
//! | 5 | 8 | Participant id (u64) |
//! | 13 | 4 | Sequence number (u32) |
//! | 17 | 8 | Capture timestamp ms (i64) |
//! | 25 | 4 | Payload length in bytes (u32) |
//! | 29 | N | Payload: PCM samples, i16 little-endian |
//! | 29+N | 4 | CRC32 of bytes 4..29+N |

use std::io::Read;

use thiserror::Error;

pub type ParticipantId = u64;
pub type ChannelId = u64;

/// Magic number: "VRTP" in ASCII (little-endian)
pub const MAGIC: u32 = u32::from_le_bytes(*b"VRTP");

/// Fixed frame header size (magic through payload length)
pub const FRAME_HEADER_SIZE: usize = 29;

/// Upper bound on one frame's payload: 1 s of 48 kHz mono i16 PCM, far
/// above any real packet interval. Checked before allocating.
pub const MAX_PAYLOAD_SIZE: u32 = 48_000 * 2;

/// One participant's audio packet as delivered by the transport.
#[derive(Debug, Clone)]
pub struct AudioPacket {
    pub participant: ParticipantId,
    /// Per-participant monotonic sequence number, used for gap detection.
    pub sequence: u32,
    /// Capture timestamp reported by the transport.
    pub timestamp_ms: i64,
    /// Decoded mono PCM at the configured sample rate.
    pub pcm: Vec<i16>,
}

/// Everything the transport layer can tell us.
#[derive(Debug, Clone)]
pub enum TransportEvent {
    Packet(AudioPacket),
    Join(ParticipantId),
    Leave(ParticipantId),
    /// The underlying voice connection was lost. Unrecoverable for the
    /// session; triggers a best-effort final flush.
    Disconnected,
}

#[derive(Debug, Error)]
pub enum WireError {
    #[error("invalid magic: expected 0x{expected:08X}, got 0x{got:08X}")]
    InvalidMagic { expected: u32, got: u32 },
    #[error("unknown event kind {0}")]
    UnknownKind(u8),
    #[error("truncated frame: expected {expected} bytes, got {got}")]
    Truncated { expected: usize, got: usize },
    #[error("crc32 mismatch: expected 0x{expected:08X}, computed 0x{computed:08X}")]
    ChecksumMismatch { expected: u32, computed: u32 },
    #[error("payload length {0} is not a whole number of samples")]
    OddPayload(u32),
    #[error("payload length {0} exceeds the {MAX_PAYLOAD_SIZE} byte frame limit")]
    PayloadTooLarge(u32),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

const KIND_PACKET: u8 = 0;
const KIND_JOIN: u8 = 1;
const KIND_LEAVE: u8 = 2;
const KIND_DISCONNECT: u8 = 3;

/// Encode one event into its wire frame.
pub fn encode_event(event: &TransportEvent) -> Vec<u8> {
    let (kind, participant, sequence, timestamp_ms, pcm): (u8, u64, u32, i64, &[i16]) =
        match event {
            TransportEvent::Packet(p) => {
                (KIND_PACKET, p.participant, p.sequence, p.timestamp_ms, &p.pcm)
            }
            TransportEvent::Join(p) => (KIND_JOIN, *p, 0, 0, &[]),
            TransportEvent::Leave(p) => (KIND_LEAVE, *p, 0, 0, &[]),
            TransportEvent::Disconnected => (KIND_DISCONNECT, 0, 0, 0, &[]),
        };

    let payload_len = pcm.len() * 2;
    let mut buf = Vec::with_capacity(FRAME_HEADER_SIZE + payload_len + 4);
    buf.extend_from_slice(&MAGIC.to_le_bytes());
    buf.push(kind);
    buf.extend_from_slice(&participant.to_le_bytes());
    buf.extend_from_slice(&sequence.to_le_bytes());
    buf.extend_from_slice(&timestamp_ms.to_le_bytes());
    buf.extend_from_slice(&(payload_len as u32).to_le_bytes());
    for sample in pcm {
        buf.extend_from_slice(&sample.to_le_bytes());
    }

    // CRC covers everything after the magic
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&buf[4..]);
    buf.extend_from_slice(&hasher.finalize().to_le_bytes());

    buf
}

fn read_exact_or_eof(reader: &mut impl Read, buf: &mut [u8]) -> Result<usize, WireError> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(WireError::Io(e)),
        }
    }
    Ok(filled)
}

/// Read the next event frame. Returns `Ok(None)` on a clean end of stream
/// (EOF at a frame boundary).
pub fn read_event(reader: &mut impl Read) -> Result<Option<TransportEvent>, WireError> {
    let mut header = [0u8; FRAME_HEADER_SIZE];
    let got = read_exact_or_eof(reader, &mut header)?;
    if got == 0 {
        return Ok(None);
    }
    if got < FRAME_HEADER_SIZE {
        return Err(WireError::Truncated {
            expected: FRAME_HEADER_SIZE,
            got,
        });
    }

    let magic = u32::from_le_bytes(header[0..4].try_into().unwrap());
    if magic != MAGIC {
        return Err(WireError::InvalidMagic {
            expected: MAGIC,
            got: magic,
        });
    }

    let kind = header[4];
    let participant = u64::from_le_bytes(header[5..13].try_into().unwrap());
    let sequence = u32::from_le_bytes(header[13..17].try_into().unwrap());
    let timestamp_ms = i64::from_le_bytes(header[17..25].try_into().unwrap());
    let payload_len = u32::from_le_bytes(header[25..29].try_into().unwrap());
    if payload_len % 2 != 0 {
        return Err(WireError::OddPayload(payload_len));
    }
    if payload_len > MAX_PAYLOAD_SIZE {
        return Err(WireError::PayloadTooLarge(payload_len));
    }

    let mut payload = vec![0u8; payload_len as usize];
    let got = read_exact_or_eof(reader, &mut payload)?;
    if got < payload.len() {
        return Err(WireError::Truncated {
            expected: payload.len(),
            got,
        });
    }

    let mut crc_bytes = [0u8; 4];
    let got = read_exact_or_eof(reader, &mut crc_bytes)?;
    if got < 4 {
        return Err(WireError::Truncated { expected: 4, got });
    }
    let expected = u32::from_le_bytes(crc_bytes);

    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&header[4..]);
    hasher.update(&payload);
    let computed = hasher.finalize();
    if computed != expected {
        return Err(WireError::ChecksumMismatch { expected, computed });
    }

    let event = match kind {
        KIND_PACKET => {
            let pcm: Vec<i16> = payload
                .chunks_exact(2)
                .map(|b| i16::from_le_bytes([b[0], b[1]]))
                .collect();
            TransportEvent::Packet(AudioPacket {
                participant,
                sequence,
                timestamp_ms,
                pcm,
            })
        }
        KIND_JOIN => TransportEvent::Join(participant),
        KIND_LEAVE => TransportEvent::Leave(participant),
        KIND_DISCONNECT => TransportEvent::Disconnected,
        other => return Err(WireError::UnknownKind(other)),
    };

    Ok(Some(event))
}
