//! ASR feature module: the transcription endpoint and model warm-up.

use std::sync::Arc;

use anyhow::Context;
use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::{DefaultBodyLimit, Multipart, Query, State},
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use bytes::Bytes;
use futures::TryStreamExt;
use serde::Deserialize;
use serde_json::json;
use tracing::{debug, info, warn};

use audio_helper_core::types::ASR_STREAMING_VARIANT;
use audio_helper_media::engine::{ASR_SAMPLE_RATE, BatchOptions, WindowParams};
use audio_helper_media::transcribe::{check_window_params, transcribe_batch, window_fragments};
use audio_helper_media::wav::decode_to_mono;

use crate::error::ApiError;
use crate::modules::FeatureModule;
use crate::state::AppState;

/// Largest accepted upload.
const MAX_UPLOAD_BYTES: usize = 256 * 1024 * 1024;

pub struct AsrModule;

#[async_trait]
impl FeatureModule for AsrModule {
    fn key(&self) -> &str {
        "asr"
    }

    fn routes(&self) -> Router<Arc<AppState>> {
        Router::new()
            .route("/api/asr/transcribe/", post(transcribe))
            .route("/api/asr/transcribe", post(transcribe))
            .layer(DefaultBodyLimit::max(MAX_UPLOAD_BYTES))
    }

    async fn acquire(&self, state: &Arc<AppState>) -> anyhow::Result<()> {
        let models_dir = state.config.models_dir();
        tokio::fs::create_dir_all(&models_dir)
            .await
            .with_context(|| format!("Failed to create models dir {}", models_dir.display()))?;
        debug!(path = %models_dir.display(), "Models directory ready");

        for variant in &state.config.asr().preload {
            state.asr_models.get_or_create(variant).await?;
        }
        Ok(())
    }

    async fn release(&self, state: &Arc<AppState>) -> anyhow::Result<()> {
        let loaded: Vec<String> = state
            .asr_models
            .loaded()
            .into_iter()
            .map(|(variant, _)| variant)
            .collect();
        info!(variants = ?loaded, "Releasing ASR models");
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
pub struct TranscribeQuery {
    #[serde(default = "default_lang")]
    pub lang: String,
    /// Overrides the configured batch variant.
    #[serde(default)]
    pub model: Option<String>,
}

fn default_lang() -> String {
    "auto".into()
}

fn parse_form_bool(raw: &str) -> Result<bool, ApiError> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" | "" => Ok(false),
        other => Err(ApiError::bad_request(format!(
            "Invalid value for 'streaming': {other}"
        ))),
    }
}

/// `POST /api/asr/transcribe/`: multipart `audio_file` (WAV) plus optional `streaming`.
async fn transcribe(
    State(state): State<Arc<AppState>>,
    Query(query): Query<TranscribeQuery>,
    mut multipart: Multipart,
) -> Result<Response, ApiError> {
    let mut audio: Option<Bytes> = None;
    let mut streaming = false;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| ApiError::bad_request(format!("Invalid multipart body: {e}")))?
    {
        match field.name() {
            Some("audio_file") => {
                audio = Some(field.bytes().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed to read 'audio_file': {e}"))
                })?);
            }
            Some("streaming") => {
                let raw = field.text().await.map_err(|e| {
                    ApiError::bad_request(format!("Failed to read 'streaming': {e}"))
                })?;
                streaming = parse_form_bool(&raw)?;
            }
            other => debug!(field = ?other, "Ignoring multipart field"),
        }
    }

    let audio = audio.ok_or_else(|| ApiError::bad_request("Missing multipart field 'audio_file'"))?;
    let upload_bytes = audio.len();
    let samples = tokio::task::spawn_blocking(move || decode_to_mono(&audio, ASR_SAMPLE_RATE))
        .await
        .map_err(|e| ApiError::internal(format!("Audio decode task failed: {e}")))??;

    debug!(
        upload_bytes,
        samples = samples.len(),
        streaming,
        lang = %query.lang,
        "Transcription request"
    );

    if streaming {
        let engine = state.asr_models.get_or_create(ASR_STREAMING_VARIANT).await?;
        let params = WindowParams::from(&state.config.asr().streaming);
        check_window_params(samples.len(), &params)?;
        let fragments = window_fragments(engine, samples, params)
            .map_ok(Bytes::from)
            .inspect_err(|e| warn!(error = %e, "Streaming transcription aborted"));

        return Response::builder()
            .header(header::CONTENT_TYPE, "text/plain; charset=utf-8")
            .header(header::CACHE_CONTROL, "no-cache")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(fragments))
            .map_err(|e| ApiError::internal(e.to_string()));
    }

    let variant = query
        .model
        .unwrap_or_else(|| state.config.asr_batch_variant());
    let engine = state.asr_models.get_or_create(&variant).await?;
    let options = BatchOptions::new(query.lang, &state.config.asr().batch);
    let text = transcribe_batch(engine.as_ref(), &samples, &options).await?;

    Ok(Json(json!({ "status": "completed", "text": text })).into_response())
}
