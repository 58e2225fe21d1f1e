//! Windowed and single-shot transcription over an [`AsrEngine`].

use std::sync::Arc;

use futures::future::{self, Either};
use futures::{Stream, TryStreamExt};
use tracing::{debug, warn};

use audio_helper_core::error::{AudioHelperError, Result};

use crate::engine::{AsrEngine, BatchOptions, WindowParams, WindowState};

/// Number of windows `len` samples are split into; the last may be short.
pub fn window_count(len: usize, stride: usize) -> usize {
    if stride == 0 { 0 } else { len.div_ceil(stride) }
}

/// Reject window geometry that cannot cover `len` samples.
pub fn check_window_params(len: usize, params: &WindowParams) -> Result<()> {
    if params.stride == 0 && len > 0 {
        return Err(AudioHelperError::InvalidInput(
            "Window stride must be greater than 0".into(),
        ));
    }
    Ok(())
}

struct WindowCursor {
    engine: Arc<dyn AsrEngine>,
    audio: Vec<f32>,
    params: WindowParams,
    state: WindowState,
    index: usize,
    total: usize,
}

/// Transcribe `audio` window by window, yielding each window's text in order.
///
/// One [`WindowState`] is threaded through every call and the last window is
/// flagged final. The first engine error is yielded with its window index and
/// ends the stream. Empty audio yields nothing; a zero stride over non-empty
/// audio yields a single `InvalidInput` error.
pub fn window_fragments(
    engine: Arc<dyn AsrEngine>,
    audio: Vec<f32>,
    params: WindowParams,
) -> impl Stream<Item = Result<String>> + Send + 'static {
    if let Err(e) = check_window_params(audio.len(), &params) {
        warn!(variant = engine.variant(), error = %e, "Rejecting windowed transcription");
        return Either::Left(futures::stream::once(future::ready(Err::<String, _>(e))));
    }

    let total = window_count(audio.len(), params.stride);
    debug!(
        variant = engine.variant(),
        samples = audio.len(),
        windows = total,
        "Starting windowed transcription"
    );
    let cursor = WindowCursor {
        engine,
        audio,
        params,
        state: WindowState::new(),
        index: 0,
        total,
    };

    Either::Right(futures::stream::unfold(Some(cursor), |cursor| async move {
        let mut cursor = cursor?;
        if cursor.index >= cursor.total {
            return None;
        }

        let index = cursor.index;
        let start = index * cursor.params.stride;
        let end = (start + cursor.params.stride).min(cursor.audio.len());
        let is_final = index + 1 == cursor.total;

        let result = cursor
            .engine
            .generate_window(
                &cursor.audio[start..end],
                &mut cursor.state,
                &cursor.params,
                is_final,
            )
            .await;

        match result {
            Ok(text) => {
                cursor.index += 1;
                Some((Ok(text), Some(cursor)))
            }
            Err(e) => {
                warn!(window = index, error = %e, "Window transcription failed");
                Some((Err(AudioHelperError::inference_at(index, format!("{e:#}"))), None))
            }
        }
    }))
}

/// Transcribe window by window and concatenate the fragments.
pub async fn transcribe_streaming(
    engine: Arc<dyn AsrEngine>,
    audio: Vec<f32>,
    params: WindowParams,
) -> Result<String> {
    window_fragments(engine, audio, params)
        .try_fold(String::new(), |mut text, fragment| async move {
            text.push_str(&fragment);
            Ok(text)
        })
        .await
}

/// Transcribe in one engine call and strip rich-transcription tags.
pub async fn transcribe_batch(
    engine: &dyn AsrEngine,
    audio: &[f32],
    options: &BatchOptions,
) -> Result<String> {
    if audio.is_empty() {
        return Ok(String::new());
    }
    let raw = engine
        .generate_batch(audio, options)
        .await
        .map_err(|e| AudioHelperError::inference(format!("{e:#}")))?;
    Ok(strip_rich_tags(&raw))
}

/// Remove `<|...|>` markers (language, emotion, event, ITN) from engine output.
pub fn strip_rich_tags(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    let mut rest = raw;
    while let Some(start) = rest.find("<|") {
        match rest[start + 2..].find("|>") {
            Some(len) => {
                out.push_str(&rest[..start]);
                rest = &rest[start + 2 + len + 2..];
            }
            None => break,
        }
    }
    out.push_str(rest);
    out.trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use futures::StreamExt;
    use std::sync::Mutex;

    /// Records each call and returns "w{index}" per window.
    #[derive(Default)]
    struct ScriptedEngine {
        calls: Mutex<Vec<(usize, bool, Option<u64>)>>,
        fail_at: Option<usize>,
        batch_reply: String,
    }

    #[async_trait]
    impl AsrEngine for ScriptedEngine {
        fn variant(&self) -> &str {
            "streaming"
        }

        async fn generate_window(
            &self,
            window: &[f32],
            state: &mut WindowState,
            _params: &WindowParams,
            is_final: bool,
        ) -> anyhow::Result<String> {
            let seen = state.get("step").and_then(|v| v.as_u64());
            let index = {
                let mut calls = self.calls.lock().unwrap();
                calls.push((window.len(), is_final, seen));
                calls.len() - 1
            };
            if self.fail_at == Some(index) {
                anyhow::bail!("decoder exploded");
            }
            state.insert("step", serde_json::json!(index as u64 + 1));
            Ok(format!("w{index}"))
        }

        async fn generate_batch(
            &self,
            _audio: &[f32],
            _options: &BatchOptions,
        ) -> anyhow::Result<String> {
            Ok(self.batch_reply.clone())
        }
    }

    fn params(stride: usize) -> WindowParams {
        WindowParams {
            stride,
            ..WindowParams::default()
        }
    }

    #[test]
    fn test_window_count() {
        assert_eq!(window_count(0, 9600), 0);
        assert_eq!(window_count(1, 9600), 1);
        assert_eq!(window_count(9600, 9600), 1);
        assert_eq!(window_count(9601, 9600), 2);
        assert_eq!(window_count(32000, 9600), 4);
    }

    #[tokio::test]
    async fn test_windows_share_state_and_flag_last() {
        let engine = Arc::new(ScriptedEngine::default());
        let text = transcribe_streaming(engine.clone(), vec![0.0; 25], params(10))
            .await
            .unwrap();

        assert_eq!(text, "w0w1w2");
        let calls = engine.calls.lock().unwrap();
        assert_eq!(
            *calls,
            vec![(10, false, None), (10, false, Some(1)), (5, true, Some(2))]
        );
    }

    #[tokio::test]
    async fn test_single_short_window_is_final() {
        let engine = Arc::new(ScriptedEngine::default());
        let text = transcribe_streaming(engine.clone(), vec![0.0; 3], params(10))
            .await
            .unwrap();
        assert_eq!(text, "w0");
        assert_eq!(*engine.calls.lock().unwrap(), vec![(3, true, None)]);
    }

    #[tokio::test]
    async fn test_empty_audio_yields_empty_text() {
        let engine = Arc::new(ScriptedEngine::default());
        let text = transcribe_streaming(engine.clone(), Vec::new(), params(10))
            .await
            .unwrap();
        assert!(text.is_empty());
        assert!(engine.calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_zero_stride_is_invalid_input() {
        let engine = Arc::new(ScriptedEngine::default());
        let err = transcribe_streaming(engine.clone(), vec![0.0; 5], params(0))
            .await
            .unwrap_err();
        assert!(matches!(err, AudioHelperError::InvalidInput(_)));
        assert!(engine.calls.lock().unwrap().is_empty());

        let text = transcribe_streaming(engine, Vec::new(), params(0)).await.unwrap();
        assert!(text.is_empty());
    }

    #[tokio::test]
    async fn test_failure_names_window_and_stops() {
        let engine = Arc::new(ScriptedEngine {
            fail_at: Some(1),
            ..Default::default()
        });
        let items: Vec<Result<String>> = window_fragments(engine.clone(), vec![0.0; 40], params(10))
            .collect()
            .await;

        assert_eq!(items.len(), 2);
        assert_eq!(items[0].as_ref().unwrap(), "w0");
        let err = items[1].as_ref().unwrap_err();
        assert!(matches!(err, AudioHelperError::InferenceFailure { window: Some(1), .. }));
        assert_eq!(engine.calls.lock().unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_batch_strips_tags() {
        let engine = ScriptedEngine {
            batch_reply: "<|zh|><|NEUTRAL|><|Speech|><|withitn|>你好，世界。".into(),
            ..Default::default()
        };
        let text = transcribe_batch(&engine, &[0.0; 16000], &BatchOptions::default())
            .await
            .unwrap();
        assert_eq!(text, "你好，世界。");
    }

    #[test]
    fn test_strip_rich_tags_edge_cases() {
        assert_eq!(strip_rich_tags("plain text"), "plain text");
        assert_eq!(strip_rich_tags("<|en|>hi <|HAPPY|>there"), "hi there");
        assert_eq!(strip_rich_tags("broken <|tag"), "broken <|tag");
        assert_eq!(strip_rich_tags(""), "");
    }
}
