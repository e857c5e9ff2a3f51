//! Conversions between 16-bit PCM and the normalized float samples the
//! transcription server consumes.

use byteorder::{ByteOrder, LittleEndian};

/// Interpret `bytes` as signed 16-bit little-endian PCM and scale each
/// sample by 1/32768 into `[-1.0, 1.0]`. A trailing odd byte is dropped.
pub fn pcm16_to_f32(bytes: &[u8]) -> Vec<f32> {
    let usable = bytes.len() - bytes.len() % 2;
    let mut samples = vec![0i16; usable / 2];
    LittleEndian::read_i16_into(&bytes[..usable], &mut samples);

    samples.into_iter().map(|s| s as f32 / 32768.0).collect()
}

/// Scale normalized floats by 32767 with rounding back to 16-bit PCM.
/// Used only for debug capture.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<i16> {
    samples
        .iter()
        .map(|&s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i16)
        .collect()
}

/// Serialize float samples as little-endian bytes, the binary payload
/// format of the audio frames on the wire.
pub fn f32_to_le_bytes(samples: &[f32]) -> Vec<u8> {
    let mut bytes = vec![0u8; samples.len() * 4];
    LittleEndian::write_f32_into(samples, &mut bytes);
    bytes
}
