//! HTTP gateway for the audio helper.
//!
//! Hosts the feature modules (ASR, TTS) behind one axum router, drives their
//! resource acquisition and release around the server's lifetime, and
//! announces the instance to a service registry when one is configured.

pub mod asr;
pub mod error;
#[cfg(feature = "metrics")]
pub mod metrics;
pub mod modules;
pub mod registry;
pub mod server;
pub mod state;
pub mod tts;

pub use modules::{ActiveModules, FeatureModule, FeatureModuleRegistry};
pub use server::{build_router, start_server, start_server_with_shutdown};
pub use state::AppState;
