//! TTS feature module: speech generation, G2P, and the speaker roster.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    Json, Router,
    body::Body,
    extract::State,
    http::header,
    response::{IntoResponse, Response},
    routing::post,
};
use futures::TryStreamExt;
use serde::Deserialize;
use tracing::{debug, error, info};

use audio_helper_core::error::AudioHelperError;
use audio_helper_core::types::AudioFormat;
use audio_helper_media::StreamingAudioFramer;
use audio_helper_media::SpeakerRoster;
use audio_helper_media::engine::{G2pOutput, SpeechRequest};
use audio_helper_media::writer::writer_for;

use crate::error::ApiError;
use crate::modules::FeatureModule;
use crate::state::AppState;

pub struct TtsModule;

#[async_trait]
impl FeatureModule for TtsModule {
    fn key(&self) -> &str {
        "tts"
    }

    fn routes(&self) -> Router<Arc<AppState>> {
        Router::new()
            .route("/api/tts/generate", post(generate))
            .route("/api/tts/g2p", post(g2p))
    }

    async fn acquire(&self, state: &Arc<AppState>) -> anyhow::Result<()> {
        let variant = state.config.tts_default_variant();
        let engine = state.tts_models.get_or_create(&variant).await?;

        let tts = state.config.tts();
        let roster = SpeakerRoster::from_file(&state.config.roster_path()).await?;
        roster.load(engine.as_ref(), tts.roster_policy).await?;
        Ok(())
    }

    async fn release(&self, state: &Arc<AppState>) -> anyhow::Result<()> {
        let mut failures = Vec::new();
        for (variant, engine) in state.tts_models.loaded() {
            info!(variant = %variant, "Shutting down TTS engine");
            if let Err(e) = engine.shutdown().await {
                failures.push(format!("{variant}: {e:#}"));
            }
        }
        if !failures.is_empty() {
            anyhow::bail!("TTS engine shutdown failed: {}", failures.join("; "));
        }
        Ok(())
    }
}

/// Body of `POST /api/tts/generate`, OpenAI speech request plus `role`.
#[derive(Debug, Deserialize)]
pub struct GenerateRequest {
    pub input: String,
    /// Registered voice name.
    pub role: String,
    #[serde(default)]
    pub response_format: Option<String>,
    #[serde(default)]
    pub stream: bool,
    /// TTS variant; the configured default when absent.
    #[serde(default)]
    pub model: Option<String>,
}

#[derive(Debug, Deserialize)]
pub struct G2pRequest {
    pub text: String,
}

fn inference_error(e: anyhow::Error) -> AudioHelperError {
    AudioHelperError::inference(format!("{e:#}"))
}

async fn generate(
    State(state): State<Arc<AppState>>,
    Json(req): Json<GenerateRequest>,
) -> Result<Response, ApiError> {
    let format = match req.response_format.as_deref() {
        Some(raw) => raw.parse::<AudioFormat>()?,
        None => AudioFormat::default(),
    };
    if req.input.trim().is_empty() {
        return Err(ApiError::bad_request("'input' must not be empty"));
    }

    let variant = req
        .model
        .unwrap_or_else(|| state.config.tts_default_variant());
    let engine = state.tts_models.get_or_create(&variant).await?;
    let framer = StreamingAudioFramer::new(writer_for(format, engine.sample_rate(), req.stream)?);
    let speech = SpeechRequest {
        text: req.input,
        role: req.role,
    };

    debug!(
        variant = %variant,
        role = %speech.role,
        format = %format,
        stream = req.stream,
        "Speech request"
    );

    if req.stream {
        let source = engine
            .speak_stream(&speech)
            .await
            .map_err(inference_error)?
            .map_err(inference_error);

        let body = framer.encode_stream(source).inspect_err(|e| {
            error!(error = %e, "Speech stream aborted");
        });

        return Response::builder()
            .header(header::CONTENT_TYPE, format.content_type())
            .header(header::CONTENT_DISPOSITION, format.attachment_disposition())
            .header(header::CACHE_CONTROL, "no-cache")
            .header(header::TRANSFER_ENCODING, "chunked")
            .header("X-Accel-Buffering", "no")
            .body(Body::from_stream(body))
            .map_err(|e| ApiError::internal(e.to_string()));
    }

    let samples = engine.speak(&speech).await.map_err(inference_error)?;
    let audio = framer.encode_all(&samples)?;

    Ok((
        [
            (header::CONTENT_TYPE, format.content_type().to_string()),
            (header::CONTENT_DISPOSITION, format.attachment_disposition()),
            (header::CACHE_CONTROL, "no-cache".to_string()),
        ],
        audio,
    )
        .into_response())
}

async fn g2p(
    State(state): State<Arc<AppState>>,
    Json(req): Json<G2pRequest>,
) -> Result<Json<G2pOutput>, ApiError> {
    let variant = state.config.tts_default_variant();
    let engine = state.tts_models.get_or_create(&variant).await?;
    let output = engine.g2p(&req.text).await.map_err(inference_error)?;
    Ok(Json(output))
}
