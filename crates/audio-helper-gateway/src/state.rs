//! Shared server state.

use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use audio_helper_core::config::{Config, EngineConfig};
use audio_helper_media::remote::{RemoteAsrEngine, RemoteTtsEngine};
use audio_helper_media::{AsrEngine, ModelCache, TtsEngine};

/// State shared by every handler and module hook.
pub struct AppState {
    pub config: Arc<Config>,
    pub asr_models: ModelCache<dyn AsrEngine>,
    pub tts_models: ModelCache<dyn TtsEngine>,
    /// Keys of the modules currently mounted, in activation order.
    pub modules: RwLock<Vec<String>>,
}

impl AppState {
    pub fn new(
        config: Arc<Config>,
        asr_models: ModelCache<dyn AsrEngine>,
        tts_models: ModelCache<dyn TtsEngine>,
    ) -> Self {
        Self {
            config,
            asr_models,
            tts_models,
            modules: RwLock::new(Vec::new()),
        }
    }

    /// State whose engines talk to the inference workers named in `config`.
    pub fn with_remote_engines(config: Arc<Config>) -> Self {
        let asr_variants = config.asr_variants();
        let asr_keys: Vec<String> = asr_variants.keys().cloned().collect();
        let asr_models = ModelCache::new("asr", asr_keys, {
            let variants = Arc::new(asr_variants);
            move |variant: String| {
                let settings = engine_settings(&variants, &variant);
                async move {
                    #[cfg(feature = "metrics")]
                    let started = std::time::Instant::now();
                    let engine = RemoteAsrEngine::connect(&variant, settings?).await?;
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_model_load("asr", &variant, started.elapsed().as_secs_f64());
                    anyhow::Ok(Arc::new(engine) as Arc<dyn AsrEngine>)
                }
            }
        });

        let tts_variants = config.tts_variants();
        let tts_keys: Vec<String> = tts_variants.keys().cloned().collect();
        let tts_models = ModelCache::new("tts", tts_keys, {
            let variants = Arc::new(tts_variants);
            move |variant: String| {
                let settings = engine_settings(&variants, &variant);
                async move {
                    #[cfg(feature = "metrics")]
                    let started = std::time::Instant::now();
                    let engine = RemoteTtsEngine::connect(&variant, settings?).await?;
                    #[cfg(feature = "metrics")]
                    crate::metrics::record_model_load("tts", &variant, started.elapsed().as_secs_f64());
                    anyhow::Ok(Arc::new(engine) as Arc<dyn TtsEngine>)
                }
            }
        });

        Self::new(config, asr_models, tts_models)
    }
}

fn engine_settings(
    variants: &BTreeMap<String, EngineConfig>,
    variant: &str,
) -> anyhow::Result<EngineConfig> {
    variants
        .get(variant)
        .cloned()
        .ok_or_else(|| anyhow::anyhow!("No engine settings for variant '{variant}'"))
}
