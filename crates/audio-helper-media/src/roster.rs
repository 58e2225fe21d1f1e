//! Speaker roster: named voices registered with the TTS engine at startup.

use std::path::{Path, PathBuf};

use serde::Deserialize;
use tracing::{debug, info, warn};

use audio_helper_core::config::RosterPolicy;
use audio_helper_core::error::{AudioHelperError, Result};
use audio_helper_core::types::SpeakerProfile;

use crate::engine::{TtsEngine, VoiceReference};
use crate::wav::decode_wav_bytes;

#[derive(Deserialize)]
#[serde(untagged)]
enum RosterFile {
    List(Vec<SpeakerProfile>),
    Wrapped { speakers: Vec<SpeakerProfile> },
}

/// Outcome of registering a roster.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct RosterReport {
    pub loaded: Vec<String>,
    pub skipped: Vec<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SpeakerRoster {
    profiles: Vec<SpeakerProfile>,
}

impl SpeakerRoster {
    pub fn new(profiles: Vec<SpeakerProfile>) -> Self {
        Self { profiles }
    }

    /// Read a JSON5 roster file. A missing file is an empty roster.
    ///
    /// Relative audio and embedding paths resolve against the file's directory.
    pub async fn from_file(path: &Path) -> Result<Self> {
        let raw = match tokio::fs::read_to_string(path).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "No speaker roster file, starting with no voices");
                return Ok(Self::default());
            }
            Err(e) => return Err(e.into()),
        };
        let parsed: RosterFile = json5::from_str(&raw).map_err(|e| {
            AudioHelperError::Config(format!("Invalid speaker roster {}: {e}", path.display()))
        })?;
        let profiles = match parsed {
            RosterFile::List(profiles) | RosterFile::Wrapped { speakers: profiles } => profiles,
        };

        let base = path.parent().unwrap_or(Path::new("."));
        let profiles = profiles
            .into_iter()
            .map(|p| SpeakerProfile {
                audio: resolve(base, p.audio),
                embedding: resolve(base, p.embedding),
                name: p.name,
            })
            .collect();

        Ok(Self { profiles })
    }

    pub fn profiles(&self) -> &[SpeakerProfile] {
        &self.profiles
    }

    pub fn is_empty(&self) -> bool {
        self.profiles.is_empty()
    }

    /// Register every profile with `engine`, in roster order.
    ///
    /// Under [`RosterPolicy::Abort`] the first failing profile fails the whole
    /// load; under [`RosterPolicy::Skip`] it is logged and left out.
    pub async fn load(&self, engine: &dyn TtsEngine, policy: RosterPolicy) -> Result<RosterReport> {
        let mut report = RosterReport::default();

        for profile in &self.profiles {
            match register(engine, profile).await {
                Ok(()) => {
                    debug!(speaker = %profile.name, "Speaker registered");
                    report.loaded.push(profile.name.clone());
                }
                Err(e) if policy == RosterPolicy::Skip => {
                    warn!(speaker = %profile.name, error = %e, "Skipping speaker profile");
                    report.skipped.push(profile.name.clone());
                }
                Err(e) => return Err(e),
            }
        }

        info!(
            variant = engine.variant(),
            loaded = report.loaded.len(),
            skipped = report.skipped.len(),
            "Speaker roster loaded"
        );
        Ok(report)
    }
}

fn resolve(base: &Path, path: PathBuf) -> PathBuf {
    if path.is_absolute() {
        path
    } else {
        base.join(path)
    }
}

async fn register(engine: &dyn TtsEngine, profile: &SpeakerProfile) -> Result<()> {
    let voice = read_voice(profile).await?;
    engine
        .add_speaker(&profile.name, voice)
        .await
        .map_err(|e| load_failure(profile, format!("{e:#}")))
}

async fn read_voice(profile: &SpeakerProfile) -> Result<VoiceReference> {
    let audio = tokio::fs::read(&profile.audio)
        .await
        .map_err(|e| load_failure(profile, format!("{}: {e}", profile.audio.display())))?;
    let embedding = tokio::fs::read(&profile.embedding)
        .await
        .map_err(|e| load_failure(profile, format!("{}: {e}", profile.embedding.display())))?;
    let (samples, sample_rate) =
        decode_wav_bytes(&audio).map_err(|e| load_failure(profile, e.to_string()))?;

    Ok(VoiceReference {
        samples,
        sample_rate,
        embedding,
    })
}

fn load_failure(profile: &SpeakerProfile, reason: String) -> AudioHelperError {
    AudioHelperError::ProfileLoadFailure {
        profile: profile.name.clone(),
        reason,
    }
}
