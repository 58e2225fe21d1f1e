//! Lazily constructed, process-wide engine instances keyed by variant.

use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Instant;

use futures::future::BoxFuture;
use tokio::sync::OnceCell;
use tracing::{info, warn};

use audio_helper_core::error::{AudioHelperError, Result};

type EngineFactory<E> = Arc<dyn Fn(String) -> BoxFuture<'static, anyhow::Result<Arc<E>>> + Send + Sync>;

/// Holds at most one engine per known variant.
///
/// Construction of a variant runs at most once at a time; concurrent callers
/// for the same variant wait on it, callers for other variants do not. A
/// failed construction leaves the variant empty so the next call retries.
pub struct ModelCache<E: ?Sized> {
    kind: &'static str,
    cells: HashMap<String, Arc<OnceCell<Arc<E>>>>,
    factory: EngineFactory<E>,
}

impl<E: ?Sized + Send + Sync + 'static> ModelCache<E> {
    /// Create a cache for `variants`; `kind` labels log lines ("asr", "tts").
    pub fn new<I, S, F, Fut>(kind: &'static str, variants: I, factory: F) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
        F: Fn(String) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = anyhow::Result<Arc<E>>> + Send + 'static,
    {
        let cells = variants
            .into_iter()
            .map(|v| (v.into(), Arc::new(OnceCell::new())))
            .collect();
        Self {
            kind,
            cells,
            factory: Arc::new(move |variant| Box::pin(factory(variant))),
        }
    }

    /// Return the engine for `variant`, constructing it on first use.
    pub async fn get_or_create(&self, variant: &str) -> Result<Arc<E>> {
        let cell = self
            .cells
            .get(variant)
            .ok_or_else(|| AudioHelperError::UnknownVariant(variant.to_string()))?;

        if let Some(engine) = cell.get() {
            return Ok(engine.clone());
        }

        let engine = cell
            .get_or_try_init(|| {
                let factory = self.factory.clone();
                let variant = variant.to_string();
                let kind = self.kind;
                async move {
                    info!(kind, variant = %variant, "Loading model");
                    let started = Instant::now();
                    match factory(variant.clone()).await {
                        Ok(engine) => {
                            info!(
                                kind,
                                variant = %variant,
                                elapsed_ms = started.elapsed().as_millis() as u64,
                                "Model loaded"
                            );
                            Ok(engine)
                        }
                        Err(e) => {
                            warn!(kind, variant = %variant, error = %e, "Model load failed");
                            Err(AudioHelperError::inference(format!(
                                "Failed to load {kind} variant '{variant}': {e:#}"
                            )))
                        }
                    }
                }
            })
            .await?;

        Ok(engine.clone())
    }

    /// The engine for `variant` if it has already been constructed.
    pub fn get(&self, variant: &str) -> Option<Arc<E>> {
        self.cells.get(variant).and_then(|cell| cell.get().cloned())
    }

    /// All known variants, sorted.
    pub fn variants(&self) -> Vec<String> {
        let mut keys: Vec<String> = self.cells.keys().cloned().collect();
        keys.sort();
        keys
    }

    /// Variants whose engine has been constructed, sorted.
    pub fn loaded(&self) -> Vec<(String, Arc<E>)> {
        let mut loaded: Vec<(String, Arc<E>)> = self
            .cells
            .iter()
            .filter_map(|(k, cell)| cell.get().map(|e| (k.clone(), e.clone())))
            .collect();
        loaded.sort_by(|a, b| a.0.cmp(&b.0));
        loaded
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;
    use tokio::sync::Notify;

    #[derive(Debug)]
    struct Dummy {
        variant: String,
    }

    fn counting_cache(counter: Arc<AtomicUsize>, delay: Duration) -> ModelCache<Dummy> {
        ModelCache::new("asr", ["a", "b"], move |variant| {
            let counter = counter.clone();
            async move {
                counter.fetch_add(1, Ordering::SeqCst);
                tokio::time::sleep(delay).await;
                anyhow::Ok(Arc::new(Dummy { variant }))
            }
        })
    }

    #[tokio::test]
    async fn test_unknown_variant_rejected() {
        let cache = counting_cache(Arc::new(AtomicUsize::new(0)), Duration::ZERO);
        let err = cache.get_or_create("whisper").await.unwrap_err();
        assert!(matches!(err, AudioHelperError::UnknownVariant(v) if v == "whisper"));
    }

    #[tokio::test]
    async fn test_concurrent_callers_share_one_instance() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = Arc::new(counting_cache(counter.clone(), Duration::from_millis(50)));

        let mut handles = Vec::new();
        for _ in 0..16 {
            let cache = cache.clone();
            handles.push(tokio::spawn(async move { cache.get_or_create("a").await }));
        }
        let mut engines = Vec::new();
        for handle in handles {
            engines.push(handle.await.unwrap().unwrap());
        }

        assert_eq!(counter.load(Ordering::SeqCst), 1);
        assert!(engines.iter().all(|e| Arc::ptr_eq(e, &engines[0])));
        assert_eq!(engines[0].variant, "a");
    }

    #[tokio::test]
    async fn test_other_variants_not_blocked_by_slow_load() {
        let gate = Arc::new(Notify::new());
        let factory_gate = gate.clone();
        let cache = Arc::new(ModelCache::new("asr", ["slow", "fast"], move |variant| {
            let gate = factory_gate.clone();
            async move {
                if variant == "slow" {
                    gate.notified().await;
                }
                anyhow::Ok(Arc::new(Dummy { variant }))
            }
        }));

        let slow = tokio::spawn({
            let cache = cache.clone();
            async move { cache.get_or_create("slow").await }
        });
        tokio::task::yield_now().await;

        let fast = tokio::time::timeout(Duration::from_secs(1), cache.get_or_create("fast"))
            .await
            .expect("fast variant should not wait for the slow one")
            .unwrap();
        assert_eq!(fast.variant, "fast");

        gate.notify_one();
        let slow = slow.await.unwrap().unwrap();
        assert_eq!(slow.variant, "slow");
    }

    #[tokio::test]
    async fn test_failed_construction_is_retried() {
        let attempts = Arc::new(AtomicUsize::new(0));
        let factory_attempts = attempts.clone();
        let cache: ModelCache<Dummy> = ModelCache::new("tts", ["mega3"], move |variant| {
            let attempts = factory_attempts.clone();
            async move {
                if attempts.fetch_add(1, Ordering::SeqCst) == 0 {
                    anyhow::bail!("checkpoint missing");
                }
                anyhow::Ok(Arc::new(Dummy { variant }))
            }
        });

        let err = cache.get_or_create("mega3").await.unwrap_err();
        assert!(err.to_string().contains("checkpoint missing"));
        assert!(cache.get("mega3").is_none());

        let engine = cache.get_or_create("mega3").await.unwrap();
        assert_eq!(engine.variant, "mega3");
        assert_eq!(attempts.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_loaded_lists_constructed_variants() {
        let counter = Arc::new(AtomicUsize::new(0));
        let cache = counting_cache(counter.clone(), Duration::ZERO);
        assert_eq!(cache.variants(), vec!["a", "b"]);
        assert!(cache.loaded().is_empty());

        let first = cache.get_or_create("b").await.unwrap();
        let again = cache.get_or_create("b").await.unwrap();
        assert!(Arc::ptr_eq(&first, &again));

        let loaded = cache.loaded();
        assert_eq!(loaded.len(), 1);
        assert_eq!(loaded[0].0, "b");
        assert!(cache.get("a").is_none());
        assert_eq!(counter.load(Ordering::SeqCst), 1);
    }
}
