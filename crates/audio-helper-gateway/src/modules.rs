//! Feature modules: independently enableable route sets with their own
//! resource acquisition and release.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use axum::Router;
use tracing::{debug, error, info};

use audio_helper_core::error::{AudioHelperError, Result};

use crate::state::AppState;

/// A mountable unit of functionality.
#[async_trait]
pub trait FeatureModule: Send + Sync {
    /// Key used in the enabled-module list (e.g. "asr").
    fn key(&self) -> &str;

    /// Routes contributed to the server.
    fn routes(&self) -> Router<Arc<AppState>>;

    /// Acquire heavyweight resources before the server accepts requests.
    async fn acquire(&self, state: &Arc<AppState>) -> anyhow::Result<()>;

    /// Release what `acquire` took. Runs once, after the server stops.
    async fn release(&self, state: &Arc<AppState>) -> anyhow::Result<()>;
}

/// Static table of the modules this build knows about.
pub struct FeatureModuleRegistry {
    modules: Vec<Arc<dyn FeatureModule>>,
}

impl FeatureModuleRegistry {
    pub fn new() -> Self {
        Self {
            modules: Vec::new(),
        }
    }

    /// Registry holding the built-in `asr` and `tts` modules.
    pub fn builtin() -> Self {
        Self {
            modules: vec![Arc::new(crate::asr::AsrModule), Arc::new(crate::tts::TtsModule)],
        }
    }

    /// Add a module. Returns an error if its key is already taken.
    pub fn register(&mut self, module: Arc<dyn FeatureModule>) -> anyhow::Result<()> {
        if self.get(module.key()).is_some() {
            anyhow::bail!("Duplicate module key: {}", module.key());
        }
        debug!(module = module.key(), "Module registered");
        self.modules.push(module);
        Ok(())
    }

    pub fn get(&self, key: &str) -> Option<Arc<dyn FeatureModule>> {
        self.modules.iter().find(|m| m.key() == key).cloned()
    }

    pub fn keys(&self) -> Vec<&str> {
        self.modules.iter().map(|m| m.key()).collect()
    }

    /// Resolve `enabled` against the table: order kept, duplicates and unknown keys dropped.
    pub fn select(&self, enabled: &[String]) -> Vec<Arc<dyn FeatureModule>> {
        let mut seen = HashSet::new();
        let mut selected = Vec::new();
        for key in enabled {
            if !seen.insert(key.as_str()) {
                continue;
            }
            match self.get(key) {
                Some(module) => selected.push(module),
                None => debug!(module = %key, "Ignoring unknown module key"),
            }
        }
        selected
    }

    /// Mount and acquire the enabled modules in order.
    ///
    /// If one fails to acquire, the modules acquired before it are released
    /// in reverse order and the acquisition error is returned.
    pub async fn activate(&self, state: &Arc<AppState>, enabled: &[String]) -> Result<ActiveModules> {
        let mut router = Router::new();
        let mut acquired: Vec<Arc<dyn FeatureModule>> = Vec::new();

        for module in self.select(enabled) {
            router = router.merge(module.routes());
            info!(module = module.key(), "Acquiring module resources");
            if let Err(e) = module.acquire(state).await {
                error!(module = module.key(), error = %e, "Module acquisition failed, unwinding");
                if let Err(release_err) = release_all(&acquired, state).await {
                    error!(error = %release_err, "Unwinding after failed acquisition left errors");
                }
                return Err(AudioHelperError::ModuleAcquisitionFailure {
                    module: module.key().to_string(),
                    source: e.into(),
                });
            }
            acquired.push(module);
        }

        let active = ActiveModules {
            modules: acquired,
            router,
        };
        *state.modules.write().await = active.keys();
        info!(modules = ?active.keys(), "Modules active");
        Ok(active)
    }
}

impl Default for FeatureModuleRegistry {
    fn default() -> Self {
        Self::builtin()
    }
}

/// Modules that completed acquisition, in activation order.
pub struct ActiveModules {
    modules: Vec<Arc<dyn FeatureModule>>,
    router: Router<Arc<AppState>>,
}

impl ActiveModules {
    pub fn keys(&self) -> Vec<String> {
        self.modules.iter().map(|m| m.key().to_string()).collect()
    }

    /// Routes of every active module, merged.
    pub fn router(&self) -> Router<Arc<AppState>> {
        self.router.clone()
    }

    /// Release every module in reverse activation order.
    ///
    /// A failing release does not stop the others; all failures are reported together.
    pub async fn shutdown(self, state: &Arc<AppState>) -> Result<()> {
        let result = release_all(&self.modules, state).await;
        state.modules.write().await.clear();
        result
    }
}

async fn release_all(modules: &[Arc<dyn FeatureModule>], state: &Arc<AppState>) -> Result<()> {
    let mut failures = Vec::new();
    for module in modules.iter().rev() {
        info!(module = module.key(), "Releasing module resources");
        if let Err(e) = module.release(state).await {
            error!(module = module.key(), error = %e, "Module release failed");
            failures.push(format!("{}: {e:#}", module.key()));
        }
    }
    if failures.is_empty() {
        Ok(())
    } else {
        Err(AudioHelperError::ModuleReleaseFailure(failures))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex;

    use audio_helper_core::config::Config;
    use audio_helper_media::{AsrEngine, ModelCache, TtsEngine};
    use axum::routing::get;

    type Journal = Arc<Mutex<Vec<String>>>;

    struct RecordingModule {
        key: &'static str,
        journal: Journal,
        fail_acquire: bool,
        fail_release: bool,
    }

    impl RecordingModule {
        fn new(key: &'static str, journal: &Journal) -> Self {
            Self {
                key,
                journal: journal.clone(),
                fail_acquire: false,
                fail_release: false,
            }
        }
    }

    #[async_trait]
    impl FeatureModule for RecordingModule {
        fn key(&self) -> &str {
            self.key
        }

        fn routes(&self) -> Router<Arc<AppState>> {
            Router::new().route(&format!("/{}/ping", self.key), get(|| async { "pong" }))
        }

        async fn acquire(&self, _state: &Arc<AppState>) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("acquire:{}", self.key));
            if self.fail_acquire {
                anyhow::bail!("{} weights missing", self.key);
            }
            Ok(())
        }

        async fn release(&self, _state: &Arc<AppState>) -> anyhow::Result<()> {
            self.journal.lock().unwrap().push(format!("release:{}", self.key));
            if self.fail_release {
                anyhow::bail!("{} stuck", self.key);
            }
            Ok(())
        }
    }

    fn empty_state() -> Arc<AppState> {
        let asr: ModelCache<dyn AsrEngine> =
            ModelCache::new("asr", Vec::<String>::new(), |v: String| async move {
                Err::<Arc<dyn AsrEngine>, _>(anyhow::anyhow!("no engine for {v}"))
            });
        let tts: ModelCache<dyn TtsEngine> =
            ModelCache::new("tts", Vec::<String>::new(), |v: String| async move {
                Err::<Arc<dyn TtsEngine>, _>(anyhow::anyhow!("no engine for {v}"))
            });
        Arc::new(AppState::new(Arc::new(Config::default()), asr, tts))
    }

    fn registry(modules: Vec<RecordingModule>) -> FeatureModuleRegistry {
        let mut registry = FeatureModuleRegistry::new();
        for module in modules {
            registry.register(Arc::new(module)).unwrap();
        }
        registry
    }

    fn keys(list: &[&str]) -> Vec<String> {
        list.iter().map(|s| s.to_string()).collect()
    }

    #[tokio::test]
    async fn test_only_enabled_modules_run() {
        let journal = Journal::default();
        let registry = registry(vec![RecordingModule::new("asr", &journal), RecordingModule::new("tts", &journal)]);
        let state = empty_state();

        let active = registry.activate(&state, &keys(&["asr"])).await.unwrap();
        assert_eq!(active.keys(), vec!["asr"]);
        assert_eq!(*state.modules.read().await, vec!["asr"]);
        active.shutdown(&state).await.unwrap();

        assert_eq!(*journal.lock().unwrap(), vec!["acquire:asr", "release:asr"]);
        assert!(state.modules.read().await.is_empty());
    }

    #[tokio::test]
    async fn test_acquire_in_order_release_in_reverse() {
        let journal = Journal::default();
        let registry = registry(vec![RecordingModule::new("asr", &journal), RecordingModule::new("tts", &journal)]);
        let state = empty_state();

        let active = registry.activate(&state, &keys(&["tts", "asr"])).await.unwrap();
        active.shutdown(&state).await.unwrap();

        assert_eq!(
            *journal.lock().unwrap(),
            vec!["acquire:tts", "acquire:asr", "release:asr", "release:tts"]
        );
    }

    #[tokio::test]
    async fn test_unknown_and_duplicate_keys_dropped() {
        let journal = Journal::default();
        let registry = registry(vec![RecordingModule::new("asr", &journal)]);
        let state = empty_state();

        let active = registry
            .activate(&state, &keys(&["bogus", "asr", "asr"]))
            .await
            .unwrap();
        assert_eq!(active.keys(), vec!["asr"]);

        let none = registry.activate(&state, &keys(&["bogus"])).await.unwrap();
        assert!(none.keys().is_empty());
        assert_eq!(*journal.lock().unwrap(), vec!["acquire:asr"]);
    }

    #[tokio::test]
    async fn test_failed_acquisition_unwinds_prior_modules() {
        let journal = Journal::default();
        let mut tts = RecordingModule::new("tts", &journal);
        tts.fail_acquire = true;
        let registry = registry(vec![RecordingModule::new("asr", &journal), tts]);
        let state = empty_state();

        let err = registry
            .activate(&state, &keys(&["asr", "tts"]))
            .await
            .err()
            .unwrap();
        assert!(matches!(
            &err,
            AudioHelperError::ModuleAcquisitionFailure { module, .. } if module == "tts"
        ));
        assert_eq!(
            *journal.lock().unwrap(),
            vec!["acquire:asr", "acquire:tts", "release:asr"]
        );
    }

    #[tokio::test]
    async fn test_release_failures_aggregate() {
        let journal = Journal::default();
        let mut asr = RecordingModule::new("asr", &journal);
        asr.fail_release = true;
        let mut tts = RecordingModule::new("tts", &journal);
        tts.fail_release = true;
        let registry = registry(vec![asr, tts]);
        let state = empty_state();

        let active = registry.activate(&state, &keys(&["asr", "tts"])).await.unwrap();
        let err = active.shutdown(&state).await.unwrap_err();

        match err {
            AudioHelperError::ModuleReleaseFailure(failures) => {
                assert_eq!(failures.len(), 2);
                assert!(failures[0].starts_with("tts"));
                assert!(failures[1].starts_with("asr"));
            }
            other => panic!("unexpected error: {other}"),
        }
        assert_eq!(journal.lock().unwrap().len(), 4);
    }

    #[test]
    fn test_duplicate_registration_rejected() {
        let journal = Journal::default();
        let mut registry = registry(vec![RecordingModule::new("asr", &journal)]);
        let err = registry
            .register(Arc::new(RecordingModule::new("asr", &journal)))
            .unwrap_err();
        assert!(err.to_string().contains("Duplicate module key"));
        assert_eq!(FeatureModuleRegistry::builtin().keys(), vec!["asr", "tts"]);
    }
}
