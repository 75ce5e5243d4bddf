//! Process-wide transcription engine
//!
//! Lifecycle: the engine is created by the first job that needs a transcript
//! and lives until the process exits; it is never torn down or reloaded.
//! A failed load is not cached, so the next job tries again.
//!
//! Concurrency: Whisper backends are not reentrant. Every call goes through a
//! single-engine gate, so concurrent jobs transcribe one at a time in the
//! order they reach the gate. A job cancelled while queued leaves the queue
//! without touching the engine.

use async_trait::async_trait;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::{watch, Mutex, OnceCell};
use tracing::{debug, info};

use super::whisper::WhisperEngine;
use super::{TranscriptSegment, TranscriptionEngine};
use crate::config::TranscriptionConfig;
use crate::error::StageFailure;
use crate::process::wait_for_cancel;

static SHARED_ENGINE: OnceCell<Arc<SharedEngine>> = OnceCell::const_new();

/// Get the process-wide engine, loading it on first use
pub async fn shared_engine(config: &TranscriptionConfig) -> Result<Arc<SharedEngine>, StageFailure> {
    SHARED_ENGINE
        .get_or_try_init(|| async {
            info!("🧠 Loading transcription engine (model: {})", config.model);
            let engine = WhisperEngine::load(config).await?;
            Ok::<_, StageFailure>(Arc::new(SharedEngine::new(Box::new(engine))))
        })
        .await
        .map(Arc::clone)
}

/// An engine behind the single-engine gate
pub struct SharedEngine {
    engine: Box<dyn TranscriptionEngine>,
    gate: Mutex<()>,
}

impl SharedEngine {
    pub fn new(engine: Box<dyn TranscriptionEngine>) -> Self {
        Self {
            engine,
            gate: Mutex::new(()),
        }
    }
}

#[async_trait]
impl TranscriptionEngine for SharedEngine {
    fn name(&self) -> &str {
        self.engine.name()
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<TranscriptSegment>, StageFailure> {
        let _turn = tokio::select! {
            guard = self.gate.lock() => guard,
            _ = wait_for_cancel(Some(&mut cancel_rx)) => return Err(StageFailure::Cancelled),
        };
        debug!("🎙️  {} acquired for {}", self.engine.name(), audio_path.display());

        self.engine.transcribe(audio_path, cancel_rx).await
    }
}

/// Handle used by the pipeline in production: defers model loading to the
/// first transcription, then delegates to the shared engine.
#[derive(Debug, Clone)]
pub struct LazySharedEngine {
    config: TranscriptionConfig,
}

impl LazySharedEngine {
    pub fn new(config: TranscriptionConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl TranscriptionEngine for LazySharedEngine {
    fn name(&self) -> &str {
        "whisper"
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<TranscriptSegment>, StageFailure> {
        let engine = shared_engine(&self.config).await?;
        engine.transcribe(audio_path, cancel_rx).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    /// Records the highest number of overlapping calls it has seen
    struct OverlapProbe {
        active: Arc<AtomicUsize>,
        peak: Arc<AtomicUsize>,
        segments: Vec<TranscriptSegment>,
    }

    #[async_trait]
    impl TranscriptionEngine for OverlapProbe {
        fn name(&self) -> &str {
            "probe"
        }

        async fn transcribe(
            &self,
            _audio_path: &Path,
            _cancel_rx: watch::Receiver<bool>,
        ) -> Result<Vec<TranscriptSegment>, StageFailure> {
            let now = self.active.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(Duration::from_millis(20)).await;
            self.active.fetch_sub(1, Ordering::SeqCst);
            Ok(self.segments.clone())
        }
    }

    fn probe(segments: Vec<TranscriptSegment>) -> OverlapProbe {
        OverlapProbe {
            active: Arc::new(AtomicUsize::new(0)),
            peak: Arc::new(AtomicUsize::new(0)),
            segments,
        }
    }

    #[tokio::test]
    async fn test_gate_serializes_calls() {
        let engine = probe(vec![]);
        let peak = Arc::clone(&engine.peak);
        let shared = Arc::new(SharedEngine::new(Box::new(engine)));
        let (_tx, rx) = watch::channel(false);

        let mut handles = Vec::new();
        for _ in 0..4 {
            let shared = Arc::clone(&shared);
            let rx = rx.clone();
            handles.push(tokio::spawn(async move {
                shared.transcribe(Path::new("a.wav"), rx).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert_eq!(shared.name(), "probe");
        assert_eq!(peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_cancelled_while_waiting_for_gate() {
        let shared = SharedEngine::new(Box::new(probe(vec![])));
        let _held = shared.gate.lock().await;

        let (tx, rx) = watch::channel(false);
        tx.send(true).unwrap();
        let err = shared.transcribe(Path::new("a.wav"), rx).await.unwrap_err();
        assert_eq!(err, StageFailure::Cancelled);
    }
}
