//! Incremental audio container writers.

use bytes::{Bytes, BytesMut};

use audio_helper_core::error::{AudioHelperError, Result};
use audio_helper_core::types::AudioFormat;

use crate::wav::{STREAMING_SIZE, WAV_HEADER_LEN, f32_to_pcm16, wav_header};

/// Turns chunks of mono float samples into encoded bytes.
///
/// A writer serves exactly one output stream: zero or more `write_chunk`
/// calls with `finalize = false`, one with `finalize = true`, then `close`.
pub trait AudioWriter: Send {
    /// Encode `samples`; with `finalize` set, also flush any trailer.
    fn write_chunk(&mut self, samples: &[f32], finalize: bool) -> anyhow::Result<Bytes>;

    /// Release the writer's resources.
    fn close(&mut self) -> anyhow::Result<()>;
}

impl<W: AudioWriter + ?Sized> AudioWriter for Box<W> {
    fn write_chunk(&mut self, samples: &[f32], finalize: bool) -> anyhow::Result<Bytes> {
        (**self).write_chunk(samples, finalize)
    }

    fn close(&mut self) -> anyhow::Result<()> {
        (**self).close()
    }
}

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
enum WriterState {
    #[default]
    Open,
    Finalized,
    Closed,
}

impl WriterState {
    fn check_writable(self) -> anyhow::Result<()> {
        match self {
            Self::Open => Ok(()),
            Self::Finalized => anyhow::bail!("writer already finalized"),
            Self::Closed => anyhow::bail!("writer already closed"),
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if *self == Self::Closed {
            anyhow::bail!("writer already closed");
        }
        *self = Self::Closed;
        Ok(())
    }
}

/// Raw 16-bit little-endian mono PCM.
#[derive(Debug, Default)]
pub struct PcmWriter {
    state: WriterState,
}

impl PcmWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl AudioWriter for PcmWriter {
    fn write_chunk(&mut self, samples: &[f32], finalize: bool) -> anyhow::Result<Bytes> {
        self.state.check_writable()?;
        if finalize {
            self.state = WriterState::Finalized;
        }
        Ok(Bytes::from(f32_to_pcm16(samples)))
    }

    fn close(&mut self) -> anyhow::Result<()> {
        self.state.close()
    }
}

/// 16-bit mono WAV.
///
/// A streaming writer sends the header with the first chunk; the total length
/// is unknown then, so the RIFF and data sizes carry the `0xFFFFFFFF`
/// placeholder. A whole-file writer holds the samples until finalize and
/// emits a header with the real sizes.
#[derive(Debug)]
pub struct WavWriter {
    sample_rate: u32,
    mode: WavMode,
    state: WriterState,
}

#[derive(Debug)]
enum WavMode {
    Streaming { header_sent: bool },
    Whole { data: BytesMut },
}

impl WavWriter {
    /// Writer for chunked responses.
    pub fn streaming(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            mode: WavMode::Streaming { header_sent: false },
            state: WriterState::Open,
        }
    }

    /// Writer for a complete file, emitted in one piece on finalize.
    pub fn whole(sample_rate: u32) -> Self {
        Self {
            sample_rate,
            mode: WavMode::Whole {
                data: BytesMut::new(),
            },
            state: WriterState::Open,
        }
    }
}

impl AudioWriter for WavWriter {
    fn write_chunk(&mut self, samples: &[f32], finalize: bool) -> anyhow::Result<Bytes> {
        self.state.check_writable()?;
        if finalize {
            self.state = WriterState::Finalized;
        }

        match &mut self.mode {
            WavMode::Streaming { header_sent } => {
                let mut out = BytesMut::with_capacity(samples.len() * 2 + WAV_HEADER_LEN);
                if !*header_sent {
                    out.extend_from_slice(&wav_header(self.sample_rate, 1, STREAMING_SIZE));
                    *header_sent = true;
                }
                out.extend_from_slice(&f32_to_pcm16(samples));
                Ok(out.freeze())
            }
            WavMode::Whole { data } => {
                data.extend_from_slice(&f32_to_pcm16(samples));
                if !finalize {
                    return Ok(Bytes::new());
                }
                let data_len = u32::try_from(data.len())
                    .ok()
                    .filter(|&len| len < STREAMING_SIZE - 36)
                    .ok_or_else(|| anyhow::anyhow!("WAV data too large: {} bytes", data.len()))?;
                let mut out = BytesMut::with_capacity(WAV_HEADER_LEN + data.len());
                out.extend_from_slice(&wav_header(self.sample_rate, 1, data_len));
                out.extend_from_slice(&data.split());
                Ok(out.freeze())
            }
        }
    }

    fn close(&mut self) -> anyhow::Result<()> {
        if let WavMode::Whole { data } = &mut self.mode {
            data.clear();
        }
        self.state.close()
    }
}

/// Writer for `format`, or `UnsupportedFormat` when no encoder is available.
///
/// `streaming` selects chunk-by-chunk output; otherwise the writer may hold
/// everything until finalize so container sizes are exact. Compressed
/// formats are recognised but have no encoder; rejecting them here keeps the
/// failure ahead of any response bytes.
pub fn writer_for(
    format: AudioFormat,
    sample_rate: u32,
    streaming: bool,
) -> Result<Box<dyn AudioWriter>> {
    match format {
        AudioFormat::Wav if streaming => Ok(Box::new(WavWriter::streaming(sample_rate))),
        AudioFormat::Wav => Ok(Box::new(WavWriter::whole(sample_rate))),
        AudioFormat::Pcm => Ok(Box::new(PcmWriter::new())),
        AudioFormat::Mp3 | AudioFormat::Opus | AudioFormat::Aac | AudioFormat::Flac => Err(
            AudioHelperError::UnsupportedFormat(format!("{format} output is not available")),
        ),
    }
}
