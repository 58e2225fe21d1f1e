//! Text-to-speech through an OpenAI-style speech endpoint streaming raw PCM.

use std::collections::HashMap;

use anyhow::Result;
use async_trait::async_trait;
use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use futures::StreamExt;
use tokio::sync::RwLock;
use tracing::{debug, info};

use audio_helper_core::config::EngineConfig;

use super::{WorkerClient, check_status};
use crate::engine::{G2pOutput, SampleStream, SpeechRequest, TtsEngine, VoiceReference};
use crate::wav::pcm_to_wav;

const SPEECH_PATH: &str = "/v1/audio/speech";
const G2P_PATH: &str = "/v1/g2p";
const DEFAULT_SAMPLE_RATE: u32 = 24_000;

/// Voice material in the form the worker expects it.
#[derive(Debug, Clone)]
struct RegisteredVoice {
    reference_audio: String,
    speaker_embedding: String,
}

/// TTS variant served by a remote inference worker.
///
/// Registered voices are kept locally and sent along with each request, so
/// the worker itself stays stateless.
pub struct RemoteTtsEngine {
    worker: WorkerClient,
    sample_rate: u32,
    voices: RwLock<HashMap<String, RegisteredVoice>>,
}

impl RemoteTtsEngine {
    pub async fn connect(variant: &str, config: EngineConfig) -> Result<Self> {
        let sample_rate = config.sample_rate.unwrap_or(DEFAULT_SAMPLE_RATE);
        let worker = WorkerClient::new(variant, config)?;
        worker.check_health().await?;
        Ok(Self {
            worker,
            sample_rate,
            voices: RwLock::new(HashMap::new()),
        })
    }

    async fn voice(&self, role: &str) -> Result<RegisteredVoice> {
        self.voices
            .read()
            .await
            .get(role)
            .cloned()
            .ok_or_else(|| anyhow::anyhow!("Unknown voice role '{role}'"))
    }

    async fn request(&self, request: &SpeechRequest, stream: bool) -> Result<reqwest::Response> {
        let voice = self.voice(&request.role).await?;

        debug!(
            variant = %self.worker.variant,
            role = %request.role,
            text_len = request.text.len(),
            stream,
            "Starting speech synthesis"
        );

        let resp = self
            .worker
            .post(SPEECH_PATH)
            .json(&serde_json::json!({
                "model": self.worker.model(),
                "input": request.text,
                "voice": request.role,
                "response_format": "pcm",
                "sample_rate": self.sample_rate,
                "stream": stream,
                "device": self.worker.config.device,
                "reference_audio": voice.reference_audio,
                "speaker_embedding": voice.speaker_embedding,
            }))
            .send()
            .await?;
        check_status(resp, "TTS API").await
    }
}

/// Decode 16-bit little-endian PCM, carrying a dangling odd byte to the next call.
#[derive(Debug, Default)]
struct PcmDecoder {
    carry: Option<u8>,
}

impl PcmDecoder {
    fn push(&mut self, bytes: &[u8]) -> Vec<f32> {
        let mut samples = Vec::with_capacity(bytes.len() / 2 + 1);
        let mut rest = bytes;
        if let Some(low) = self.carry.take() {
            match rest.split_first() {
                Some((&high, tail)) => {
                    samples.push(to_f32(i16::from_le_bytes([low, high])));
                    rest = tail;
                }
                None => {
                    self.carry = Some(low);
                    return samples;
                }
            }
        }
        let mut pairs = rest.chunks_exact(2);
        for pair in &mut pairs {
            samples.push(to_f32(i16::from_le_bytes([pair[0], pair[1]])));
        }
        self.carry = pairs.remainder().first().copied();
        samples
    }
}

fn to_f32(sample: i16) -> f32 {
    sample as f32 / i16::MAX as f32
}

#[async_trait]
impl TtsEngine for RemoteTtsEngine {
    fn variant(&self) -> &str {
        &self.worker.variant
    }

    fn sample_rate(&self) -> u32 {
        self.sample_rate
    }

    async fn add_speaker(&self, name: &str, voice: VoiceReference) -> Result<()> {
        let registered = RegisteredVoice {
            reference_audio: STANDARD.encode(pcm_to_wav(&voice.samples, voice.sample_rate)),
            speaker_embedding: STANDARD.encode(&voice.embedding),
        };
        let replaced = self
            .voices
            .write()
            .await
            .insert(name.to_string(), registered)
            .is_some();
        debug!(variant = %self.worker.variant, speaker = name, replaced, "Voice registered");
        Ok(())
    }

    async fn speak(&self, request: &SpeechRequest) -> Result<Vec<f32>> {
        let bytes = self.request(request, false).await?.bytes().await?;
        Ok(PcmDecoder::default().push(&bytes))
    }

    async fn speak_stream(&self, request: &SpeechRequest) -> Result<SampleStream> {
        let resp = self.request(request, true).await?;
        let mut decoder = PcmDecoder::default();
        let stream = resp
            .bytes_stream()
            .map(move |chunk| -> Result<Vec<f32>> {
                let bytes = chunk.map_err(|e| anyhow::anyhow!("TTS stream error: {e}"))?;
                Ok(decoder.push(&bytes))
            })
            .filter(|item| futures::future::ready(!matches!(item, Ok(s) if s.is_empty())));
        Ok(Box::pin(stream))
    }

    async fn g2p(&self, text: &str) -> Result<G2pOutput> {
        let resp = self
            .worker
            .post(G2P_PATH)
            .json(&serde_json::json!({ "model": self.worker.model(), "text": text }))
            .send()
            .await?;
        let resp = check_status(resp, "G2P API").await?;
        Ok(resp.json().await?)
    }

    async fn shutdown(&self) -> Result<()> {
        let mut voices = self.voices.write().await;
        info!(variant = %self.worker.variant, voices = voices.len(), "Releasing TTS engine");
        voices.clear();
        Ok(())
    }
}
