//! Engine seams for speech recognition and synthesis.
//!
//! Concrete engines live behind these traits so the HTTP layer, the model
//! cache, and the tests can swap a remote worker for an in-process mock.

use std::pin::Pin;

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use audio_helper_core::config::{BatchConfig, StreamingWindowConfig};

/// Sample rate every ASR engine expects its input in.
pub const ASR_SAMPLE_RATE: u32 = 16_000;

/// Rolling state threaded through the windows of one streaming transcription.
///
/// Engines decide what goes in here (typically the decoder cache returned by
/// the previous window). A fresh state is created for every request.
#[derive(Debug, Clone, Default)]
pub struct WindowState {
    entries: Map<String, Value>,
}

impl WindowState {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.entries.get(key)
    }

    pub fn insert(&mut self, key: impl Into<String>, value: Value) {
        self.entries.insert(key.into(), value);
    }

    pub fn remove(&mut self, key: &str) -> Option<Value> {
        self.entries.remove(key)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// Per-call window geometry handed to [`AsrEngine::generate_window`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WindowParams {
    pub chunk_size: [usize; 3],
    pub encoder_chunk_look_back: usize,
    pub decoder_chunk_look_back: usize,
    /// Samples per window.
    pub stride: usize,
}

impl From<&StreamingWindowConfig> for WindowParams {
    fn from(config: &StreamingWindowConfig) -> Self {
        Self {
            chunk_size: config.chunk_size,
            encoder_chunk_look_back: config.encoder_chunk_look_back,
            decoder_chunk_look_back: config.decoder_chunk_look_back,
            stride: config.stride(),
        }
    }
}

impl Default for WindowParams {
    fn default() -> Self {
        Self::from(&StreamingWindowConfig::default())
    }
}

/// Options for single-shot transcription.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BatchOptions {
    /// Language hint; "auto" lets the engine detect it.
    pub language: String,
    pub batch_size_s: u32,
    pub merge_vad: bool,
    pub merge_length_s: u32,
    pub use_itn: bool,
}

impl BatchOptions {
    pub fn new(language: impl Into<String>, batch: &BatchConfig) -> Self {
        Self {
            language: language.into(),
            batch_size_s: batch.batch_size_s,
            merge_vad: batch.merge_vad,
            merge_length_s: batch.merge_length_s,
            use_itn: batch.use_itn,
        }
    }
}

impl Default for BatchOptions {
    fn default() -> Self {
        Self::new("auto", &BatchConfig::default())
    }
}

/// A speech recognition engine for one model variant.
#[async_trait]
pub trait AsrEngine: Send + Sync {
    /// Variant key this engine was constructed for.
    fn variant(&self) -> &str;

    /// Transcribe one window of 16 kHz mono audio, updating `state` for the next window.
    async fn generate_window(
        &self,
        window: &[f32],
        state: &mut WindowState,
        params: &WindowParams,
        is_final: bool,
    ) -> anyhow::Result<String>;

    /// Transcribe a whole utterance of 16 kHz mono audio in one call.
    ///
    /// The returned text may still carry rich-transcription tags.
    async fn generate_batch(&self, audio: &[f32], options: &BatchOptions)
    -> anyhow::Result<String>;
}

/// Reference material for a registered voice.
#[derive(Debug, Clone, Default)]
pub struct VoiceReference {
    /// Mono reference recording.
    pub samples: Vec<f32>,
    pub sample_rate: u32,
    /// Precomputed speaker embedding, as stored on disk.
    pub embedding: Vec<u8>,
}

/// One synthesis request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeechRequest {
    pub text: String,
    /// Registered voice name.
    pub role: String,
}

/// Grapheme-to-phoneme output: phoneme ids and their tones.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct G2pOutput {
    pub ph_pred: Vec<i64>,
    pub tone_pred: Vec<i64>,
}

/// Chunks of mono float samples at the engine's sample rate.
pub type SampleStream = Pin<Box<dyn Stream<Item = anyhow::Result<Vec<f32>>> + Send>>;

/// A speech synthesis engine for one model variant.
#[async_trait]
pub trait TtsEngine: Send + Sync {
    fn variant(&self) -> &str;

    /// Output sample rate in Hz.
    fn sample_rate(&self) -> u32;

    /// Register (or replace) a named voice.
    async fn add_speaker(&self, name: &str, voice: VoiceReference) -> anyhow::Result<()>;

    /// Synthesize the whole utterance.
    async fn speak(&self, request: &SpeechRequest) -> anyhow::Result<Vec<f32>>;

    /// Synthesize incrementally. Fails before yielding if the role is unknown.
    async fn speak_stream(&self, request: &SpeechRequest) -> anyhow::Result<SampleStream>;

    async fn g2p(&self, _text: &str) -> anyhow::Result<G2pOutput> {
        anyhow::bail!("Engine '{}' does not expose grapheme-to-phoneme", self.variant())
    }

    /// Release engine-held resources. Called once when the TTS module stops.
    async fn shutdown(&self) -> anyhow::Result<()> {
        Ok(())
    }
}
