//! WAV decoding and encoding helpers.

use std::io::Cursor;

use audio_helper_core::error::{AudioHelperError, Result};

/// Size of a canonical PCM WAV header.
pub const WAV_HEADER_LEN: usize = 44;

/// Placeholder written into the RIFF and data size fields when the length is unknown.
pub const STREAMING_SIZE: u32 = u32::MAX;

/// Build a 16-bit PCM WAV header for `data_len` bytes of sample data.
pub fn wav_header(sample_rate: u32, channels: u16, data_len: u32) -> [u8; WAV_HEADER_LEN] {
    let bits_per_sample: u16 = 16;
    let byte_rate = sample_rate * channels as u32 * bits_per_sample as u32 / 8;
    let block_align = channels * bits_per_sample / 8;
    let riff_size = if data_len == STREAMING_SIZE {
        STREAMING_SIZE
    } else {
        36 + data_len
    };

    let mut header = [0u8; WAV_HEADER_LEN];
    let mut at = 0;
    let mut put = |bytes: &[u8]| {
        header[at..at + bytes.len()].copy_from_slice(bytes);
        at += bytes.len();
    };

    // RIFF header
    put(b"RIFF");
    put(&riff_size.to_le_bytes());
    put(b"WAVE");

    // fmt chunk
    put(b"fmt ");
    put(&16u32.to_le_bytes());
    put(&1u16.to_le_bytes()); // PCM format
    put(&channels.to_le_bytes());
    put(&sample_rate.to_le_bytes());
    put(&byte_rate.to_le_bytes());
    put(&block_align.to_le_bytes());
    put(&bits_per_sample.to_le_bytes());

    // data chunk
    put(b"data");
    put(&data_len.to_le_bytes());

    header
}

/// Convert float samples to 16-bit little-endian PCM.
pub fn f32_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut out = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        let clamped = if sample.is_finite() { sample.clamp(-1.0, 1.0) } else { 0.0 };
        out.extend_from_slice(&((clamped * i16::MAX as f32) as i16).to_le_bytes());
    }
    out
}

/// Wrap mono float samples in a complete 16-bit WAV file.
pub fn pcm_to_wav(samples: &[f32], sample_rate: u32) -> Vec<u8> {
    let data = f32_to_pcm16(samples);
    let mut wav = Vec::with_capacity(WAV_HEADER_LEN + data.len());
    wav.extend_from_slice(&wav_header(sample_rate, 1, data.len() as u32));
    wav.extend_from_slice(&data);
    wav
}

/// Decode a WAV file into mono float samples and its sample rate.
pub fn decode_wav_bytes(wav_bytes: &[u8]) -> Result<(Vec<f32>, u32)> {
    let mut reader = hound::WavReader::new(Cursor::new(wav_bytes))
        .map_err(|e| AudioHelperError::InvalidInput(format!("Failed to parse WAV: {e}")))?;

    let spec = reader.spec();
    let channels = spec.channels.max(1) as usize;

    let samples: Vec<f32> = match spec.sample_format {
        hound::SampleFormat::Int => {
            let bits = spec.bits_per_sample.max(1) as u32;
            let max_val = if bits > 1 {
                ((1i64 << (bits - 1)) - 1) as f32
            } else {
                1.0
            };
            reader
                .samples::<i32>()
                .map(|s| s.map(|s| (s as f32 / max_val).clamp(-1.0, 1.0)))
                .collect::<std::result::Result<_, _>>()
        }
        hound::SampleFormat::Float => reader.samples::<f32>().collect(),
    }
    .map_err(|e| AudioHelperError::InvalidInput(format!("Corrupt WAV samples: {e}")))?;

    let mut mono = downmix(&samples, channels);
    for sample in &mut mono {
        if !sample.is_finite() {
            *sample = 0.0;
        }
    }

    Ok((mono, spec.sample_rate))
}

/// Average interleaved frames into a single channel.
pub fn downmix(samples: &[f32], channels: usize) -> Vec<f32> {
    if channels <= 1 {
        return samples.to_vec();
    }
    samples
        .chunks(channels)
        .map(|frame| frame.iter().sum::<f32>() / frame.len() as f32)
        .collect()
}

/// Linear-interpolation resampler.
pub fn resample_linear(audio: &[f32], src_rate: u32, dst_rate: u32) -> Vec<f32> {
    if audio.is_empty() || src_rate == 0 || dst_rate == 0 || src_rate == dst_rate {
        return audio.to_vec();
    }

    let ratio = dst_rate as f64 / src_rate as f64;
    let out_len = ((audio.len() as f64) * ratio).round().max(1.0) as usize;
    let last = audio.len() - 1;

    (0..out_len)
        .map(|i| {
            let src_pos = i as f64 / ratio;
            let left = (src_pos.floor() as usize).min(last);
            let right = (left + 1).min(last);
            let frac = (src_pos - left as f64).clamp(0.0, 1.0) as f32;
            audio[left] * (1.0 - frac) + audio[right] * frac
        })
        .collect()
}

/// Decode an uploaded WAV file into mono samples at `target_rate`.
pub fn decode_to_mono(wav_bytes: &[u8], target_rate: u32) -> Result<Vec<f32>> {
    let (samples, rate) = decode_wav_bytes(wav_bytes)?;
    Ok(resample_linear(&samples, rate, target_rate))
}
