//! Media pipeline: engine cache, windowed transcription, audio framing,
//! speaker roster, and remote inference engines.

pub mod engine;
pub mod framer;
pub mod model_cache;
pub mod remote;
pub mod roster;
pub mod transcribe;
pub mod wav;
pub mod writer;

pub use engine::{AsrEngine, TtsEngine};
pub use framer::StreamingAudioFramer;
pub use model_cache::ModelCache;
pub use roster::SpeakerRoster;
