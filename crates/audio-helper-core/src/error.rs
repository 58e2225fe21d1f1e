use thiserror::Error;

/// Boxed cause attached to failures raised by writers and feature modules.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

#[derive(Debug, Error)]
pub enum AudioHelperError {
    #[error("Unknown model variant: {0}")]
    UnknownVariant(String),

    #[error("Unsupported format: {0}")]
    UnsupportedFormat(String),

    #[error("Invalid input: {0}")]
    InvalidInput(String),

    #[error("{}", inference_message(.window, .message))]
    InferenceFailure {
        window: Option<usize>,
        message: String,
    },

    #[error("An error occurred while writing the audio: {0}")]
    EncodingFailure(#[source] BoxError),

    #[error("Failed to load speaker profile '{profile}': {reason}")]
    ProfileLoadFailure { profile: String, reason: String },

    #[error("Module '{module}' failed to acquire its resources: {source}")]
    ModuleAcquisitionFailure {
        module: String,
        #[source]
        source: BoxError,
    },

    #[error("Module release failed: {}", .0.join("; "))]
    ModuleReleaseFailure(Vec<String>),

    #[error("Service registry announcement failed: {0}")]
    RegistryAnnouncementFailure(String),

    #[error("Config error: {0}")]
    Config(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

fn inference_message(window: &Option<usize>, message: &str) -> String {
    match window {
        Some(index) => format!("Inference failed at window {index}: {message}"),
        None => format!("Inference failed: {message}"),
    }
}

impl AudioHelperError {
    /// Engine failure outside of a windowed session.
    pub fn inference(message: impl Into<String>) -> Self {
        Self::InferenceFailure {
            window: None,
            message: message.into(),
        }
    }

    /// Engine failure for a specific transcription window.
    pub fn inference_at(window: usize, message: impl Into<String>) -> Self {
        Self::InferenceFailure {
            window: Some(window),
            message: message.into(),
        }
    }

    pub fn encoding(cause: impl Into<BoxError>) -> Self {
        Self::EncodingFailure(cause.into())
    }

    /// Whether the error was caused by the caller rather than the server.
    pub fn is_client_error(&self) -> bool {
        matches!(
            self,
            Self::UnknownVariant(_) | Self::UnsupportedFormat(_) | Self::InvalidInput(_)
        )
    }

    /// Short, stable label used for logs and metrics.
    pub fn kind(&self) -> &'static str {
        match self {
            Self::UnknownVariant(_) => "unknown_variant",
            Self::UnsupportedFormat(_) => "unsupported_format",
            Self::InvalidInput(_) => "invalid_input",
            Self::InferenceFailure { .. } => "inference_failure",
            Self::EncodingFailure(_) => "encoding_failure",
            Self::ProfileLoadFailure { .. } => "profile_load_failure",
            Self::ModuleAcquisitionFailure { .. } => "module_acquisition_failure",
            Self::ModuleReleaseFailure(_) => "module_release_failure",
            Self::RegistryAnnouncementFailure(_) => "registry_announcement_failure",
            Self::Config(_) => "config",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
            Self::Other(_) => "other",
        }
    }
}

pub type Result<T> = std::result::Result<T, AudioHelperError>;
