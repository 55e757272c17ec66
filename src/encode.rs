//! Encoding collaborator: turns a drained PCM batch into a self-contained
//! Ogg/Opus artifact.
//!
//! Every artifact carries its own Opus id and comment headers, so a
//! track's committed segments can be concatenated into one playable
//! chained Ogg stream at recall time.

use std::io::Cursor;
use std::sync::Arc;

use ogg::reading::PacketReader;
use ogg::writing::{PacketWriteEndInfo, PacketWriter};
use opus::{Application, Bitrate as OpusBitrate, Channels, Decoder as OpusDecoder,
    Encoder as OpusEncoder};
use rand::Rng;

use crate::config::CaptureConfig;
use crate::error::{CaptureError, Result};

/// The external encoding process, as seen by the segment writer. Object
/// safety lets tests substitute failure-injecting encoders.
pub trait SegmentEncoder: Send {
    /// Encode one contiguous mono PCM batch into a complete artifact.
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>>;
}

pub type EncoderFactory = Arc<dyn Fn() -> Box<dyn SegmentEncoder> + Send + Sync>;

/// Default factory producing [`OpusSegmentEncoder`]s.
pub fn opus_encoder_factory(config: &CaptureConfig) -> EncoderFactory {
    let sample_rate = config.sample_rate;
    let bitrate_kbps = config.bitrate_kbps;
    Arc::new(move || Box::new(OpusSegmentEncoder::new(sample_rate, bitrate_kbps)))
}

/// Create Opus identification header
pub fn create_opus_id_header(channels: u8, sample_rate: u32) -> Vec<u8> {
    let mut header = Vec::with_capacity(19);
    header.extend_from_slice(b"OpusHead");
    header.push(1); // Version
    header.push(channels); // Channel count
    header.extend_from_slice(&0u16.to_le_bytes()); // Pre-skip
    header.extend_from_slice(&sample_rate.to_le_bytes()); // Input sample rate
    header.extend_from_slice(&0i16.to_le_bytes()); // Output gain
    header.push(0); // Channel mapping family
    header
}

/// Create Opus comment header
pub fn create_opus_comment_header() -> Vec<u8> {
    let mut header = Vec::new();
    header.extend_from_slice(b"OpusTags");
    let vendor = b"voice_recall";
    header.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    header.extend_from_slice(vendor);
    header.extend_from_slice(&0u32.to_le_bytes()); // No user comments
    header
}

pub struct OpusSegmentEncoder {
    sample_rate: u32,
    bitrate_kbps: u32,
    /// 20 ms of samples, the Opus VoIP sweet spot.
    frame_size: usize,
}

impl OpusSegmentEncoder {
    pub fn new(sample_rate: u32, bitrate_kbps: u32) -> Self {
        Self {
            sample_rate,
            bitrate_kbps,
            frame_size: sample_rate as usize / 50,
        }
    }
}

impl SegmentEncoder for OpusSegmentEncoder {
    fn encode(&mut self, pcm: &[i16]) -> Result<Vec<u8>> {
        if pcm.is_empty() {
            return Err(CaptureError::EncodingFailure(
                "refusing to encode an empty batch".to_string(),
            ));
        }

        let mut encoder = OpusEncoder::new(self.sample_rate, Channels::Mono, Application::Voip)?;
        encoder.set_bitrate(OpusBitrate::Bits(self.bitrate_kbps as i32 * 1000))?;

        let mut writer = PacketWriter::new(Vec::new());
        let serial: u32 = rand::thread_rng().gen();

        writer
            .write_packet(
                create_opus_id_header(1, self.sample_rate),
                serial,
                PacketWriteEndInfo::EndPage,
                0,
            )
            .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;
        writer
            .write_packet(
                create_opus_comment_header(),
                serial,
                PacketWriteEndInfo::EndPage,
                0,
            )
            .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;

        let mut encode_output = vec![0u8; 8192];
        let mut granule: u64 = 0;
        let frame_count = pcm.len().div_ceil(self.frame_size);

        for (i, chunk) in pcm.chunks(self.frame_size).enumerate() {
            // Pad the final partial frame with silence
            let frame: Vec<i16> = if chunk.len() < self.frame_size {
                let mut padded = chunk.to_vec();
                padded.resize(self.frame_size, 0);
                padded
            } else {
                chunk.to_vec()
            };

            let len = encoder.encode(&frame, &mut encode_output)?;
            // Granule positions are always in 48 kHz units
            granule += self.frame_size as u64 * 48000 / self.sample_rate as u64;

            let end_info = if i + 1 == frame_count {
                PacketWriteEndInfo::EndStream
            } else {
                PacketWriteEndInfo::NormalPacket
            };
            writer
                .write_packet(encode_output[..len].to_vec(), serial, end_info, granule)
                .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?;
        }

        Ok(writer.into_inner())
    }
}

/// Decode an Ogg/Opus artifact back to mono PCM at the given rate. Used by
/// the recall export path for WAV output.
pub fn decode_artifact(data: &[u8], sample_rate: u32) -> Result<Vec<i16>> {
    let mut reader = PacketReader::new(Cursor::new(data));
    let mut decoder = OpusDecoder::new(sample_rate, Channels::Mono)?;
    // Worst case Opus frame is 120 ms
    let mut frame = vec![0i16; sample_rate as usize * 120 / 1000];
    let mut pcm = Vec::new();

    while let Some(packet) = reader
        .read_packet()
        .map_err(|e| CaptureError::EncodingFailure(e.to_string()))?
    {
        if packet.data.starts_with(b"OpusHead") || packet.data.starts_with(b"OpusTags") {
            continue;
        }
        let decoded = decoder.decode(&packet.data, &mut frame, false)?;
        pcm.extend_from_slice(&frame[..decoded]);
    }

    Ok(pcm)
}
