//! Fake pipeline stages for orchestrator tests

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::{HashSet, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tempfile::TempDir;
use tokio::sync::{watch, Notify};

use highlight_reel::process::wait_for_cancel;
use highlight_reel::{
    Config, ConfigBuilder, CutClip, CutReport, ExtractAudio, HighlightCandidate, JobId, JobState, JobStatus,
    Pipeline, PipelineStages, StageFailure, TempAudio, TranscriptSegment, TranscriptionEngine,
};

#[derive(Debug, Clone)]
pub enum Step<T> {
    Succeed(T),
    Fail(StageFailure),
    HangUntilCancelled,
}

/// Writes a fake WAV per attempt; scripted outcomes, then the fallback
pub struct FakeExtractor {
    dir: PathBuf,
    script: Mutex<VecDeque<Step<()>>>,
    fallback: Step<()>,
    pub attempts: AtomicUsize,
    pub created: Mutex<Vec<PathBuf>>,
    duration: Option<f64>,
    probe_hangs: bool,
}

impl FakeExtractor {
    pub fn new(dir: &Path) -> Self {
        Self {
            dir: dir.to_path_buf(),
            script: Mutex::new(VecDeque::new()),
            fallback: Step::Succeed(()),
            attempts: AtomicUsize::new(0),
            created: Mutex::new(Vec::new()),
            duration: None,
            probe_hangs: false,
        }
    }

    pub fn then(self, step: Step<()>) -> Self {
        self.script.lock().unwrap().push_back(step);
        self
    }

    pub fn always(mut self, step: Step<()>) -> Self {
        self.fallback = step;
        self
    }

    pub fn with_duration(mut self, duration: f64) -> Self {
        self.duration = Some(duration);
        self
    }

    /// Duration probing blocks until the job is cancelled
    pub fn with_hanging_probe(mut self) -> Self {
        self.probe_hangs = true;
        self
    }
}

#[async_trait]
impl ExtractAudio for FakeExtractor {
    async fn extract(
        &self,
        _video_path: &Path,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<TempAudio, StageFailure> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let step = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());

        let audio = TempAudio::create_in(Some(&self.dir)).unwrap();
        self.created.lock().unwrap().push(audio.path().to_path_buf());
        std::fs::write(audio.path(), vec![0u8; 1024]).unwrap();

        match step {
            Step::Succeed(()) => Ok(audio),
            Step::Fail(failure) => Err(failure),
            Step::HangUntilCancelled => {
                wait_for_cancel(Some(&mut cancel_rx)).await;
                Err(StageFailure::Cancelled)
            }
        }
    }

    async fn probe_duration(&self, _video_path: &Path, mut cancel_rx: watch::Receiver<bool>) -> Option<f64> {
        if self.probe_hangs {
            wait_for_cancel(Some(&mut cancel_rx)).await;
            return None;
        }
        self.duration
    }
}

pub struct FakeEngine {
    step: Step<Vec<TranscriptSegment>>,
    /// Whether the audio file existed when transcription ran
    pub audio_seen: Mutex<Vec<bool>>,
}

impl FakeEngine {
    pub fn new(step: Step<Vec<TranscriptSegment>>) -> Self {
        Self {
            step,
            audio_seen: Mutex::new(Vec::new()),
        }
    }

    pub fn segments(segments: Vec<TranscriptSegment>) -> Self {
        Self::new(Step::Succeed(segments))
    }
}

#[async_trait]
impl TranscriptionEngine for FakeEngine {
    fn name(&self) -> &str {
        "fake"
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<TranscriptSegment>, StageFailure> {
        self.audio_seen.lock().unwrap().push(audio_path.exists());
        match &self.step {
            Step::Succeed(segments) => Ok(segments.clone()),
            Step::Fail(failure) => Err(failure.clone()),
            Step::HangUntilCancelled => {
                wait_for_cancel(Some(&mut cancel_rx)).await;
                Err(StageFailure::Cancelled)
            }
        }
    }
}

/// Writes a small file per clip; fails the given 1-based ranks
pub struct FakeCutter {
    fail_ranks: HashSet<usize>,
    hang: bool,
    pause: Option<Arc<CutPause>>,
    pub calls: AtomicUsize,
}

/// Holds a finished cut until the test releases it
#[derive(Default)]
pub struct CutPause {
    pub written: Notify,
    pub release: Notify,
}

impl FakeCutter {
    pub fn new() -> Self {
        Self {
            fail_ranks: HashSet::new(),
            hang: false,
            pause: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Writes the clip, then waits for `release` before reporting success
    pub fn paused(pause: Arc<CutPause>) -> Self {
        Self {
            pause: Some(pause),
            ..Self::new()
        }
    }

    pub fn failing(ranks: &[usize]) -> Self {
        Self {
            fail_ranks: ranks.iter().copied().collect(),
            ..Self::new()
        }
    }

    pub fn hanging() -> Self {
        Self {
            hang: true,
            ..Self::new()
        }
    }
}

#[async_trait]
impl CutClip for FakeCutter {
    async fn cut(
        &self,
        _video_path: &Path,
        _candidate: &HighlightCandidate,
        output_path: &Path,
        mut cancel_rx: watch::Receiver<bool>,
    ) -> Result<CutReport, StageFailure> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hang {
            wait_for_cancel(Some(&mut cancel_rx)).await;
            return Err(StageFailure::Cancelled);
        }

        let name = output_path.file_name().unwrap().to_string_lossy().into_owned();
        if self.fail_ranks.iter().any(|rank| name.contains(&format!("_highlight_{}_", rank))) {
            return Err(StageFailure::clip_cut("ffmpeg exited with status Some(1)"));
        }
        if output_path.exists() {
            return Err(StageFailure::clip_cut("output already exists"));
        }
        tokio::fs::write(output_path, b"clip").await.unwrap();
        if let Some(pause) = &self.pause {
            pause.written.notify_one();
            pause.release.notified().await;
        }
        Ok(CutReport {
            exit_code: 0,
            size_bytes: 4,
        })
    }
}

/// Temp workspace: a source video, a temp audio dir and a clip dir
pub struct Workspace {
    pub root: TempDir,
    pub video: PathBuf,
}

impl Workspace {
    pub fn new() -> Self {
        let root = TempDir::new().unwrap();
        let video = root.path().join("source.mp4");
        std::fs::write(&video, b"not really a video").unwrap();
        std::fs::create_dir_all(root.path().join("audio")).unwrap();
        Self { root, video }
    }

    pub fn audio_dir(&self) -> PathBuf {
        self.root.path().join("audio")
    }

    pub fn clip_dir(&self) -> PathBuf {
        self.root.path().join("clips")
    }

    pub fn config(&self) -> Config {
        ConfigBuilder::new()
            .with_output_dir(self.clip_dir())
            .with_temp_dir(self.audio_dir())
            .with_extraction_retries(3, 1)
            .with_workers(2)
            .build()
    }

    /// Temporary audio files still on disk
    pub fn leftover_audio(&self) -> Vec<PathBuf> {
        std::fs::read_dir(self.audio_dir())
            .unwrap()
            .filter_map(|e| e.ok())
            .map(|e| e.path())
            .filter(|p| p.extension().map_or(false, |ext| ext == "wav"))
            .collect()
    }

    pub fn pipeline(&self, extractor: FakeExtractor, engine: FakeEngine, cutter: FakeCutter) -> Pipeline {
        self.pipeline_with(
            self.config(),
            PipelineStages {
                extractor: Arc::new(extractor),
                engine: Arc::new(engine),
                cutter: Arc::new(cutter),
            },
        )
    }

    pub fn pipeline_with(&self, config: Config, stages: PipelineStages) -> Pipeline {
        Pipeline::with_stages(config, stages).unwrap()
    }
}

pub fn seg(start: f64, end: f64, text: &str) -> TranscriptSegment {
    TranscriptSegment::new(start, end, text)
}

/// Three well-separated keyword hits, ranked 10-12s, 20-21s, 0-1s
pub fn three_highlights() -> Vec<TranscriptSegment> {
    vec![
        seg(0.0, 1.0, "goal"),
        seg(5.0, 8.0, "nothing much"),
        seg(10.0, 12.0, "goal goal goal"),
        seg(20.0, 21.0, "goal goal"),
    ]
}

pub async fn wait_for_state(pipeline: &Pipeline, job_id: JobId, state: JobState) -> JobStatus {
    for _ in 0..500 {
        let status = pipeline.get_status(job_id).await.unwrap();
        if status.state == state {
            return status;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("job {} never reached {}", job_id, state);
}

pub async fn run_to_end(pipeline: &Pipeline, video: &Path, detector: highlight_reel::DetectorConfig) -> JobStatus {
    let job_id = pipeline.submit(video, detector).await.unwrap();
    tokio::time::timeout(Duration::from_secs(10), pipeline.wait(job_id))
        .await
        .expect("job did not finish in time")
        .unwrap()
}
