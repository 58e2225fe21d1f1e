//! Encodes synthesized audio through an [`AudioWriter`], whole or as a stream.

use std::pin::Pin;
use std::task::{Context, Poll, ready};

use bytes::{Bytes, BytesMut};
use futures::Stream;
use pin_project_lite::pin_project;
use tracing::{debug, warn};

use audio_helper_core::error::{AudioHelperError, Result};

use crate::writer::AudioWriter;

/// Owns one writer for one output stream and guarantees it is closed once.
pub struct StreamingAudioFramer<W: AudioWriter> {
    writer: W,
}

impl<W: AudioWriter> StreamingAudioFramer<W> {
    pub fn new(writer: W) -> Self {
        Self { writer }
    }

    /// Encode a complete utterance into one buffer.
    pub fn encode_all(mut self, audio: &[f32]) -> Result<Bytes> {
        match write_whole(&mut self.writer, audio) {
            Ok(bytes) => {
                self.writer.close().map_err(AudioHelperError::encoding)?;
                Ok(bytes)
            }
            Err(e) => {
                close_quietly(&mut self.writer);
                Err(AudioHelperError::encoding(e))
            }
        }
    }

    /// Encode chunks as they arrive.
    ///
    /// Every source chunk yields one encoded chunk; the finalize trailer
    /// follows the last one. A source error is yielded as-is and ends the
    /// stream. Dropping the stream early still closes the writer.
    pub fn encode_stream<S>(self, source: S) -> FramedStream<S, W>
    where
        S: Stream<Item = Result<Vec<f32>>>,
    {
        FramedStream {
            source,
            guard: CloseGuard {
                writer: Some(self.writer),
            },
            phase: Phase::Streaming,
        }
    }
}

fn write_whole<W: AudioWriter>(writer: &mut W, audio: &[f32]) -> anyhow::Result<Bytes> {
    let mut out = BytesMut::from(writer.write_chunk(audio, false)?);
    out.extend_from_slice(&writer.write_chunk(&[], true)?);
    Ok(out.freeze())
}

fn close_quietly<W: AudioWriter>(writer: &mut W) {
    if let Err(e) = writer.close() {
        warn!(error = %e, "Audio writer failed to close after an earlier error");
    }
}

/// Closes the writer exactly once, including when the stream is dropped mid-way.
struct CloseGuard<W: AudioWriter> {
    writer: Option<W>,
}

impl<W: AudioWriter> CloseGuard<W> {
    fn close(&mut self) -> anyhow::Result<()> {
        match self.writer.take() {
            Some(mut writer) => writer.close(),
            None => Ok(()),
        }
    }

    fn close_quietly(&mut self) {
        if let Some(mut writer) = self.writer.take() {
            close_quietly(&mut writer);
        }
    }
}

impl<W: AudioWriter> Drop for CloseGuard<W> {
    fn drop(&mut self) {
        if self.writer.is_some() {
            debug!("Audio stream dropped before completion, closing writer");
            self.close_quietly();
        }
    }
}

enum Phase {
    Streaming,
    /// Trailer sent but closing failed; the error is yielded next.
    CloseFailed(anyhow::Error),
    Done,
}

pin_project! {
    /// Stream of encoded audio produced by [`StreamingAudioFramer::encode_stream`].
    pub struct FramedStream<S, W: AudioWriter> {
        #[pin]
        source: S,
        guard: CloseGuard<W>,
        phase: Phase,
    }
}

impl<S, W> Stream for FramedStream<S, W>
where
    S: Stream<Item = Result<Vec<f32>>>,
    W: AudioWriter,
{
    type Item = Result<Bytes>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();

        match std::mem::replace(this.phase, Phase::Done) {
            Phase::Done => return Poll::Ready(None),
            Phase::CloseFailed(e) => return Poll::Ready(Some(Err(AudioHelperError::encoding(e)))),
            Phase::Streaming => *this.phase = Phase::Streaming,
        }

        let Some(writer) = this.guard.writer.as_mut() else {
            *this.phase = Phase::Done;
            return Poll::Ready(None);
        };

        match ready!(this.source.poll_next(cx)) {
            Some(Ok(samples)) => match writer.write_chunk(&samples, false) {
                Ok(bytes) => Poll::Ready(Some(Ok(bytes))),
                Err(e) => {
                    *this.phase = Phase::Done;
                    this.guard.close_quietly();
                    Poll::Ready(Some(Err(AudioHelperError::encoding(e))))
                }
            },
            Some(Err(e)) => {
                *this.phase = Phase::Done;
                this.guard.close_quietly();
                Poll::Ready(Some(Err(e)))
            }
            None => match writer.write_chunk(&[], true) {
                Ok(trailer) => {
                    if let Err(e) = this.guard.close() {
                        *this.phase = Phase::CloseFailed(e);
                    } else {
                        *this.phase = Phase::Done;
                    }
                    Poll::Ready(Some(Ok(trailer)))
                }
                Err(e) => {
                    *this.phase = Phase::Done;
                    this.guard.close_quietly();
                    Poll::Ready(Some(Err(AudioHelperError::encoding(e))))
                }
            },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::StreamExt;
    use std::sync::{Arc, Mutex};

    use crate::wav::decode_wav_bytes;
    use crate::writer::WavWriter;

    #[derive(Debug, Default)]
    struct Log {
        writes: Vec<(usize, bool)>,
        closes: usize,
    }

    #[derive(Default)]
    struct MockWriter {
        log: Arc<Mutex<Log>>,
        fail_on_write: Option<usize>,
        fail_close: bool,
    }

    impl AudioWriter for MockWriter {
        fn write_chunk(&mut self, samples: &[f32], finalize: bool) -> anyhow::Result<Bytes> {
            let mut log = self.log.lock().unwrap();
            if self.fail_on_write == Some(log.writes.len()) {
                anyhow::bail!("disk full");
            }
            log.writes.push((samples.len(), finalize));
            let marker = if finalize { b'F' } else { b'C' };
            Ok(Bytes::from(vec![marker; samples.len().max(1)]))
        }

        fn close(&mut self) -> anyhow::Result<()> {
            self.log.lock().unwrap().closes += 1;
            if self.fail_close {
                anyhow::bail!("close failed");
            }
            Ok(())
        }
    }

    fn chunks(sizes: &[usize]) -> Vec<Result<Vec<f32>>> {
        sizes.iter().map(|&n| Ok(vec![0.1; n])).collect()
    }

    #[test]
    fn test_encode_all_single_write_then_finalize() {
        let writer = MockWriter::default();
        let log = writer.log.clone();
        let bytes = StreamingAudioFramer::new(writer).encode_all(&[0.0; 8]).unwrap();

        assert_eq!(bytes.len(), 9);
        let log = log.lock().unwrap();
        assert_eq!(log.writes, vec![(8, false), (0, true)]);
        assert_eq!(log.closes, 1);
    }

    #[test]
    fn test_encode_all_write_error_still_closes() {
        let writer = MockWriter {
            fail_on_write: Some(0),
            ..Default::default()
        };
        let log = writer.log.clone();
        let err = StreamingAudioFramer::new(writer).encode_all(&[0.0; 4]).unwrap_err();

        assert!(matches!(err, AudioHelperError::EncodingFailure(_)));
        assert!(err.to_string().starts_with("An error occurred while writing the audio"));
        assert_eq!(log.lock().unwrap().closes, 1);
    }

    #[test]
    fn test_encode_all_close_error_surfaces_after_success() {
        let writer = MockWriter {
            fail_close: true,
            ..Default::default()
        };
        let err = StreamingAudioFramer::new(writer).encode_all(&[0.0; 4]).unwrap_err();
        assert!(err.to_string().contains("close failed"));
    }

    #[tokio::test]
    async fn test_stream_emits_chunks_then_trailer() {
        let writer = MockWriter::default();
        let log = writer.log.clone();
        let source = futures::stream::iter(chunks(&[3, 5]));

        let out: Vec<Result<Bytes>> = StreamingAudioFramer::new(writer)
            .encode_stream(source)
            .collect()
            .await;

        assert_eq!(out.len(), 3);
        assert_eq!(out[2].as_ref().unwrap().as_ref(), b"F");
        let log = log.lock().unwrap();
        assert_eq!(log.writes, vec![(3, false), (5, false), (0, true)]);
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_stream_source_error_ends_stream_and_closes() {
        let writer = MockWriter::default();
        let log = writer.log.clone();
        let mut items = chunks(&[2, 2]);
        items.insert(1, Err(AudioHelperError::inference("gpu fell over")));
        let source = futures::stream::iter(items);

        let out: Vec<Result<Bytes>> = StreamingAudioFramer::new(writer)
            .encode_stream(source)
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(AudioHelperError::InferenceFailure { .. })));
        let log = log.lock().unwrap();
        assert!(log.writes.iter().all(|(_, finalize)| !finalize));
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_stream_close_error_is_trailing_item() {
        let writer = MockWriter {
            fail_close: true,
            ..Default::default()
        };
        let source = futures::stream::iter(chunks(&[1]));

        let out: Vec<Result<Bytes>> = StreamingAudioFramer::new(writer)
            .encode_stream(source)
            .collect()
            .await;

        assert_eq!(out.len(), 3);
        assert!(out[1].is_ok());
        assert!(matches!(out[2], Err(AudioHelperError::EncodingFailure(_))));
    }

    #[test]
    fn test_encode_all_wav_is_deterministic_and_decodable() {
        let audio: Vec<f32> = (0..1600).map(|i| ((i % 32) as f32 / 32.0) - 0.5).collect();
        let first = StreamingAudioFramer::new(WavWriter::whole(16000))
            .encode_all(&audio)
            .unwrap();
        let second = StreamingAudioFramer::new(WavWriter::whole(16000))
            .encode_all(&audio)
            .unwrap();

        assert_eq!(first.len(), 44 + 3200);
        assert_eq!(first, second);
        let (decoded, rate) = decode_wav_bytes(&first).unwrap();
        assert_eq!(rate, 16000);
        assert_eq!(decoded.len(), audio.len());
        assert!((decoded[7] - audio[7]).abs() < 1e-3);
    }

    #[tokio::test]
    async fn test_stream_writer_error_mid_stream_closes_and_ends() {
        let writer = MockWriter {
            fail_on_write: Some(1),
            ..Default::default()
        };
        let log = writer.log.clone();
        let source = futures::stream::iter(chunks(&[2, 2, 2]));

        let out: Vec<Result<Bytes>> = StreamingAudioFramer::new(writer)
            .encode_stream(source)
            .collect()
            .await;

        assert_eq!(out.len(), 2);
        assert!(out[0].is_ok());
        assert!(matches!(out[1], Err(AudioHelperError::EncodingFailure(_))));
        let log = log.lock().unwrap();
        assert_eq!(log.writes, vec![(2, false)]);
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_stream_trailer_error_closes_and_ends() {
        let writer = MockWriter {
            fail_on_write: Some(2),
            ..Default::default()
        };
        let log = writer.log.clone();
        let source = futures::stream::iter(chunks(&[3, 3]));

        let out: Vec<Result<Bytes>> = StreamingAudioFramer::new(writer)
            .encode_stream(source)
            .collect()
            .await;

        assert_eq!(out.len(), 3);
        assert!(out[0].is_ok() && out[1].is_ok());
        let err = out[2].as_ref().unwrap_err();
        assert!(err.to_string().contains("disk full"));
        let log = log.lock().unwrap();
        assert!(log.writes.iter().all(|(_, finalize)| !finalize));
        assert_eq!(log.closes, 1);
    }

    #[tokio::test]
    async fn test_dropped_stream_closes_writer_once() {
        let writer = MockWriter::default();
        let log = writer.log.clone();
        let source = futures::stream::iter(chunks(&[1, 1, 1, 1]));

        let mut stream = Box::pin(StreamingAudioFramer::new(writer).encode_stream(source));
        assert!(stream.next().await.unwrap().is_ok());
        drop(stream);

        let log = log.lock().unwrap();
        assert_eq!(log.writes.len(), 1);
        assert_eq!(log.closes, 1);
    }
}
