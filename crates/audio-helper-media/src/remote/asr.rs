//! Speech-to-text through an OpenAI-style transcription endpoint.

use anyhow::Result;
use async_trait::async_trait;
use serde::Deserialize;
use serde_json::Value;
use tracing::debug;

use audio_helper_core::config::EngineConfig;

use super::{WorkerClient, check_status};
use crate::engine::{ASR_SAMPLE_RATE, AsrEngine, BatchOptions, WindowParams, WindowState};
use crate::wav::pcm_to_wav;

const TRANSCRIPTIONS_PATH: &str = "/v1/audio/transcriptions";

/// Key under which the worker's decoder cache is kept between windows.
const CACHE_KEY: &str = "cache";

#[derive(Debug, Deserialize)]
struct TranscriptionReply {
    #[serde(default)]
    text: String,
    #[serde(default)]
    cache: Option<Value>,
}

/// ASR variant served by a remote inference worker.
///
/// Each window is uploaded as a small WAV file; the worker's decoder cache
/// travels back and forth through the [`WindowState`].
pub struct RemoteAsrEngine {
    worker: WorkerClient,
}

impl RemoteAsrEngine {
    pub async fn connect(variant: &str, config: EngineConfig) -> Result<Self> {
        let worker = WorkerClient::new(variant, config)?;
        worker.check_health().await?;
        Ok(Self { worker })
    }

    fn base_form(&self, audio: &[f32]) -> Result<reqwest::multipart::Form> {
        let wav_data = pcm_to_wav(audio, ASR_SAMPLE_RATE);
        let part = reqwest::multipart::Part::bytes(wav_data)
            .file_name("audio.wav")
            .mime_str("audio/wav")?;

        let mut form = reqwest::multipart::Form::new()
            .text("model", self.worker.model().to_string())
            .text("response_format", "json")
            .part("file", part);
        if let Some(device) = &self.worker.config.device {
            form = form.text("device", device.clone());
        }
        Ok(form)
    }

    async fn send(&self, form: reqwest::multipart::Form) -> Result<TranscriptionReply> {
        let resp = self
            .worker
            .post(TRANSCRIPTIONS_PATH)
            .multipart(form)
            .send()
            .await?;
        let resp = check_status(resp, "Transcription API").await?;
        Ok(resp.json().await?)
    }
}

#[async_trait]
impl AsrEngine for RemoteAsrEngine {
    fn variant(&self) -> &str {
        &self.worker.variant
    }

    async fn generate_window(
        &self,
        window: &[f32],
        state: &mut WindowState,
        params: &WindowParams,
        is_final: bool,
    ) -> Result<String> {
        let chunk_size = params
            .chunk_size
            .iter()
            .map(usize::to_string)
            .collect::<Vec<_>>()
            .join(",");

        let mut form = self
            .base_form(window)?
            .text("is_final", is_final.to_string())
            .text("chunk_size", chunk_size)
            .text(
                "encoder_chunk_look_back",
                params.encoder_chunk_look_back.to_string(),
            )
            .text(
                "decoder_chunk_look_back",
                params.decoder_chunk_look_back.to_string(),
            );
        if let Some(cache) = state.get(CACHE_KEY) {
            form = form.text(CACHE_KEY, cache.to_string());
        }

        debug!(
            variant = %self.worker.variant,
            samples = window.len(),
            is_final,
            "Sending window for transcription"
        );
        let reply = self.send(form).await?;

        match reply.cache {
            Some(cache) => state.insert(CACHE_KEY, cache),
            None => {
                state.remove(CACHE_KEY);
            }
        }
        Ok(reply.text)
    }

    async fn generate_batch(&self, audio: &[f32], options: &BatchOptions) -> Result<String> {
        let form = self
            .base_form(audio)?
            .text("language", options.language.clone())
            .text("use_itn", options.use_itn.to_string())
            .text("batch_size_s", options.batch_size_s.to_string())
            .text("merge_vad", options.merge_vad.to_string())
            .text("merge_length_s", options.merge_length_s.to_string());

        debug!(
            variant = %self.worker.variant,
            samples = audio.len(),
            language = %options.language,
            "Sending audio for transcription"
        );
        let reply = self.send(form).await?;
        Ok(reply.text.trim().to_string())
    }
}
