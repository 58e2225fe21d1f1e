//! Configuration loading, defaults, environment overrides, and validation.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::types::{ASR_DEFAULT_BATCH_VARIANT, ASR_STREAMING_VARIANT, TTS_DEFAULT_VARIANT};

/// Environment variable holding the comma-separated list of enabled modules.
pub const MODULES_ENV: &str = "AUDIO_HELPER_MODULES";

/// Top-level audio helper configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server: Option<ServerConfig>,

    /// Feature modules mounted at startup when `AUDIO_HELPER_MODULES` is unset.
    #[serde(default)]
    pub modules: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub asr: Option<AsrConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub tts: Option<TtsConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub registry: Option<RegistryConfig>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub logging: Option<LoggingConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServerConfig {
    /// Service name announced to the registry.
    #[serde(default = "default_service_name")]
    pub name: String,

    #[serde(default = "default_host")]
    pub host: String,

    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            name: default_service_name(),
            host: default_host(),
            port: default_port(),
        }
    }
}

fn default_service_name() -> String {
    "audio-helper-server".into()
}

fn default_host() -> String {
    "0.0.0.0".into()
}

fn default_port() -> u16 {
    7500
}

/// Connection settings for one inference engine variant.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    /// Base URL of the inference worker serving this variant.
    pub base_url: String,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,

    /// Accelerator the worker should pin this variant to (e.g. "cuda:0").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub device: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub api_key_env: Option<String>,

    /// Checked with GET during construction when set; a non-2xx answer fails construction.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub health_path: Option<String>,

    #[serde(default = "default_engine_timeout")]
    pub timeout_secs: u64,

    /// Output sample rate (TTS only).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sample_rate: Option<u32>,
}

fn default_engine_timeout() -> u64 {
    300
}

impl EngineConfig {
    fn local(model: &str, device: &str) -> Self {
        Self {
            base_url: "http://127.0.0.1:7600".into(),
            model: Some(model.into()),
            device: Some(device.into()),
            api_key: None,
            api_key_env: None,
            health_path: None,
            timeout_secs: default_engine_timeout(),
            sample_rate: None,
        }
    }

    pub fn resolve_api_key(&self) -> Option<String> {
        resolve_secret_field(&self.api_key, &self.api_key_env)
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AsrConfig {
    /// Local model cache directory; created on module startup.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub models_dir: Option<String>,

    /// Variant used for non-streaming requests (default: "sensevoice").
    #[serde(skip_serializing_if = "Option::is_none")]
    pub batch_variant: Option<String>,

    /// Variants constructed eagerly when the ASR module starts.
    #[serde(default)]
    pub preload: Vec<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, EngineConfig>>,

    #[serde(default)]
    pub streaming: StreamingWindowConfig,

    #[serde(default)]
    pub batch: BatchConfig,
}

/// Window geometry for streaming transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StreamingWindowConfig {
    /// `[look_back, window_frames, look_ahead]` in 60 ms frames.
    #[serde(default = "default_chunk_size")]
    pub chunk_size: [usize; 3],

    #[serde(default = "default_encoder_look_back")]
    pub encoder_chunk_look_back: usize,

    #[serde(default = "default_decoder_look_back")]
    pub decoder_chunk_look_back: usize,

    /// Samples per frame at 16 kHz.
    #[serde(default = "default_samples_per_frame")]
    pub samples_per_frame: usize,
}

impl Default for StreamingWindowConfig {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            encoder_chunk_look_back: default_encoder_look_back(),
            decoder_chunk_look_back: default_decoder_look_back(),
            samples_per_frame: default_samples_per_frame(),
        }
    }
}

impl StreamingWindowConfig {
    /// Number of samples in one window.
    pub fn stride(&self) -> usize {
        self.chunk_size[1] * self.samples_per_frame
    }
}

fn default_chunk_size() -> [usize; 3] {
    [0, 10, 5]
}

fn default_encoder_look_back() -> usize {
    4
}

fn default_decoder_look_back() -> usize {
    1
}

fn default_samples_per_frame() -> usize {
    960
}

/// Engine-side batching for single-shot transcription.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchConfig {
    #[serde(default = "default_batch_size_s")]
    pub batch_size_s: u32,

    #[serde(default = "default_true")]
    pub merge_vad: bool,

    #[serde(default = "default_merge_length_s")]
    pub merge_length_s: u32,

    /// Inverse text normalization (digits, punctuation).
    #[serde(default = "default_true")]
    pub use_itn: bool,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            batch_size_s: default_batch_size_s(),
            merge_vad: true,
            merge_length_s: default_merge_length_s(),
            use_itn: true,
        }
    }
}

fn default_batch_size_s() -> u32 {
    60
}

fn default_merge_length_s() -> u32 {
    15
}

fn default_true() -> bool {
    true
}

/// What to do when a speaker profile cannot be loaded at startup.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RosterPolicy {
    #[default]
    Abort,
    Skip,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct TtsConfig {
    /// Variant constructed at startup and used when a request names none.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_variant: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub variants: Option<BTreeMap<String, EngineConfig>>,

    /// Speaker roster file (default: `speakers.json` in the data directory).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub roster: Option<String>,

    #[serde(default)]
    pub roster_policy: RosterPolicy,
}

/// Nacos naming-service registration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RegistryConfig {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub server_address: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub namespace: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub username: Option<String>,

    #[serde(skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,

    /// Service name to register (default: the server name).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub service_name: Option<String>,

    /// Advertised address (default: the bind host).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ip: Option<String>,

    /// Advertised port (default: the bind port).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub port: Option<u16>,

    #[serde(default = "default_beat_interval")]
    pub beat_interval_secs: u64,
}

fn default_beat_interval() -> u64 {
    5
}

impl RegistryConfig {
    /// Overlay the `NACOS_*` environment variables on top of the file values.
    pub fn with_env_overrides(mut self) -> Self {
        let env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());
        if let Some(v) = env("NACOS_SERVER_ADDRESS") {
            self.server_address = Some(v);
        }
        if let Some(v) = env("NACOS_NAMESPACE_ID") {
            self.namespace = Some(v);
        }
        if let Some(v) = env("NACOS_USERNAME") {
            self.username = Some(v);
        }
        if let Some(v) = env("NACOS_PASSWORD") {
            self.password = Some(v);
        }
        if let Some(v) = env("NACOS_SERVER_NAME") {
            self.service_name = Some(v);
        }
        if let Some(v) = env("NACOS_SERVER_HOST") {
            self.ip = Some(v);
        }
        if let Some(port) = env("NACOS_SERVER_PORT").and_then(|v| v.parse().ok()) {
            self.port = Some(port);
        }
        self
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Log format: "plain" (default) or "json".
    #[serde(default = "default_log_format")]
    pub format: String,

    /// Log level override (trace/debug/info/warn/error).
    #[serde(skip_serializing_if = "Option::is_none")]
    pub level: Option<String>,

    /// Per-crate log level overrides (e.g. "audio_helper_gateway=debug").
    #[serde(default)]
    pub filters: Vec<String>,

    /// Output target: "stderr" (default) or "stdout".
    #[serde(default = "default_log_output")]
    pub output: String,
}

fn default_log_format() -> String {
    "plain".into()
}

fn default_log_output() -> String {
    "stderr".into()
}

/// Resolve a secret: check the direct value first, then the env-var reference.
pub fn resolve_secret_field(direct: &Option<String>, env_var: &Option<String>) -> Option<String> {
    if let Some(val) = direct {
        if !val.is_empty() {
            return Some(val.clone());
        }
    }
    if let Some(env) = env_var {
        if let Ok(val) = std::env::var(env) {
            if !val.is_empty() {
                return Some(val);
            }
        }
    }
    None
}

/// Substitute `${ENV_VAR}` patterns in a string with their environment variable values.
fn substitute_env_vars(input: &str) -> String {
    let re = regex::Regex::new(r"\$\{([^}]+)\}").expect("static regex");
    re.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        std::env::var(var_name).unwrap_or_default()
    })
    .into_owned()
}

/// Split a comma-separated module list, trimming blanks.
pub fn parse_module_list(raw: &str) -> Vec<String> {
    raw.split(',')
        .map(str::trim)
        .filter(|key| !key.is_empty())
        .map(str::to_string)
        .collect()
}

fn default_asr_variants() -> BTreeMap<String, EngineConfig> {
    BTreeMap::from([
        (
            ASR_DEFAULT_BATCH_VARIANT.to_string(),
            EngineConfig::local("iic/SenseVoiceSmall", "cuda:0"),
        ),
        (
            "paraformer".to_string(),
            EngineConfig::local("paraformer-zh", "cuda:1"),
        ),
        (
            ASR_STREAMING_VARIANT.to_string(),
            EngineConfig::local("paraformer-zh-streaming", "cuda:1"),
        ),
    ])
}

fn default_tts_variants() -> BTreeMap<String, EngineConfig> {
    let mut mega3 = EngineConfig::local("checkpoints", "cuda");
    mega3.sample_rate = Some(24_000);
    BTreeMap::from([(TTS_DEFAULT_VARIANT.to_string(), mega3)])
}

impl Config {
    /// Load config from a JSON5 file, substituting `${ENV_VAR}` references.
    pub fn load(path: &Path) -> crate::error::Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let raw = std::fs::read_to_string(path).map_err(crate::error::AudioHelperError::Io)?;

        // Substitute ${ENV_VAR} references before parsing
        let substituted = substitute_env_vars(&raw);

        let config: Config = json5::from_str(&substituted)
            .map_err(|e| crate::error::AudioHelperError::Config(e.to_string()))?;

        Ok(config)
    }

    /// Resolve the config file path.
    pub fn config_dir() -> PathBuf {
        data_dir().join("config.json")
    }

    pub fn server(&self) -> ServerConfig {
        self.server.clone().unwrap_or_default()
    }

    /// Enabled module keys: `AUDIO_HELPER_MODULES` wins over the file's `modules`.
    pub fn enabled_modules(&self) -> Vec<String> {
        match std::env::var(MODULES_ENV) {
            Ok(raw) => parse_module_list(&raw),
            Err(_) => self.modules.clone(),
        }
    }

    pub fn asr(&self) -> AsrConfig {
        self.asr.clone().unwrap_or_default()
    }

    pub fn tts(&self) -> TtsConfig {
        self.tts.clone().unwrap_or_default()
    }

    pub fn asr_variants(&self) -> BTreeMap<String, EngineConfig> {
        self.asr
            .as_ref()
            .and_then(|a| a.variants.clone())
            .unwrap_or_else(default_asr_variants)
    }

    pub fn tts_variants(&self) -> BTreeMap<String, EngineConfig> {
        self.tts
            .as_ref()
            .and_then(|t| t.variants.clone())
            .unwrap_or_else(default_tts_variants)
    }

    pub fn asr_batch_variant(&self) -> String {
        self.asr
            .as_ref()
            .and_then(|a| a.batch_variant.clone())
            .unwrap_or_else(|| ASR_DEFAULT_BATCH_VARIANT.to_string())
    }

    pub fn tts_default_variant(&self) -> String {
        self.tts
            .as_ref()
            .and_then(|t| t.default_variant.clone())
            .unwrap_or_else(|| TTS_DEFAULT_VARIANT.to_string())
    }

    pub fn models_dir(&self) -> PathBuf {
        self.asr
            .as_ref()
            .and_then(|a| a.models_dir.as_deref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("models"))
    }

    pub fn roster_path(&self) -> PathBuf {
        self.tts
            .as_ref()
            .and_then(|t| t.roster.as_deref())
            .map(PathBuf::from)
            .unwrap_or_else(|| data_dir().join("speakers.json"))
    }

    /// Registry settings with env overrides applied; `None` when no server address is known.
    pub fn registry_settings(&self) -> Option<RegistryConfig> {
        let settings = self.registry.clone().unwrap_or_default().with_env_overrides();
        settings.server_address.as_ref()?;
        Some(settings)
    }

    /// Validate config, returning (warnings, errors).
    pub fn validate(&self) -> (Vec<String>, Vec<String>) {
        let mut warnings = Vec::new();
        let mut errors = Vec::new();

        let asr_variants = self.asr_variants();
        let batch = self.asr_batch_variant();
        if !asr_variants.contains_key(&batch) {
            errors.push(format!("ASR batch variant '{batch}' is not configured"));
        }
        if !asr_variants.contains_key(ASR_STREAMING_VARIANT) {
            warnings.push(format!(
                "ASR variant '{ASR_STREAMING_VARIANT}' is not configured; streaming transcription will fail"
            ));
        }
        for preload in &self.asr().preload {
            if !asr_variants.contains_key(preload) {
                warnings.push(format!("Preloaded ASR variant '{preload}' is not configured"));
            }
        }
        if self.asr().streaming.stride() == 0 {
            errors.push("ASR streaming window stride cannot be 0".to_string());
        }

        let tts_default = self.tts_default_variant();
        if !self.tts_variants().contains_key(&tts_default) {
            errors.push(format!("TTS default variant '{tts_default}' is not configured"));
        }

        for (name, engine) in asr_variants.iter().chain(self.tts_variants().iter()) {
            if engine.base_url.is_empty() {
                errors.push(format!("Engine variant '{name}' has an empty base_url"));
            }
        }

        if let Some(server) = &self.server {
            if server.port == 0 {
                errors.push("Server port cannot be 0".to_string());
            }
        }

        (warnings, errors)
    }
}

/// Base directory for audio helper data: `~/.audio_helper/`
pub fn data_dir() -> PathBuf {
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".audio_helper")
}
