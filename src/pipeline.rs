//! Pipeline orchestrator
//!
//! Drives each submitted job through
//! `Pending → ExtractingAudio → Transcribing → DetectingHighlights → CuttingClips`
//! into one of `Succeeded`, `PartiallyFailed` or `Failed`. Jobs run as
//! independent tasks; stages within a job run strictly in order. Stage
//! failures are recorded on the job, never returned to the submitter.

use futures::stream::{self, StreamExt};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{watch, Mutex, RwLock, Semaphore};
use tracing::{debug, error, info, warn};

use crate::audio::{ExtractAudio, FfmpegAudioExtractor, TempAudio};
use crate::clip::{output_path_for, CutClip, CutReport, FfmpegClipCutter};
use crate::config::Config;
use crate::error::{PipelineError, Result, StageFailure};
use crate::highlights::{DetectorConfig, HighlightCandidate, HighlightDetector};
use crate::job::{Clip, Job, JobId, JobState, JobStatus, StageError, TerminalReason};
use crate::process::wait_for_cancel;
use crate::transcription::{validate_transcript, LazySharedEngine, TranscriptSegment, TranscriptionEngine};

/// Slack on top of a tool's own timeout before the orchestrator gives up on a stage
const STAGE_TIMEOUT_GRACE: Duration = Duration::from_secs(5);

/// The three stage implementations; traits so tests can substitute fakes
#[derive(Clone)]
pub struct PipelineStages {
    pub extractor: Arc<dyn ExtractAudio>,
    pub engine: Arc<dyn TranscriptionEngine>,
    pub cutter: Arc<dyn CutClip>,
}

impl PipelineStages {
    /// ffmpeg extraction, the process-wide Whisper engine and ffmpeg cutting
    pub fn production(config: &Config) -> Self {
        Self {
            extractor: Arc::new(FfmpegAudioExtractor::new(config.audio.clone())),
            engine: Arc::new(LazySharedEngine::new(config.transcription.clone())),
            cutter: Arc::new(FfmpegClipCutter::new(config.clips.clone())),
        }
    }
}

struct JobEntry {
    job: Arc<Mutex<Job>>,
    cancel_tx: watch::Sender<bool>,
    state_rx: watch::Receiver<JobState>,
}

struct Inner {
    config: Config,
    stages: PipelineStages,
    jobs: RwLock<HashMap<JobId, JobEntry>>,
    job_slots: Arc<Semaphore>,
    clip_workers: Arc<Semaphore>,
}

/// Accepts jobs and runs them to completion in the background
#[derive(Clone)]
pub struct Pipeline {
    inner: Arc<Inner>,
}

impl Pipeline {
    pub fn new(config: Config) -> Result<Self> {
        let stages = PipelineStages::production(&config);
        Self::with_stages(config, stages)
    }

    pub fn with_stages(config: Config, stages: PipelineStages) -> Result<Self> {
        config
            .validate()
            .map_err(|e| PipelineError::InvalidConfig(e.to_string()))?;

        info!(
            "🔧 Initializing pipeline: {} concurrent jobs, {} clip workers",
            config.pipeline.max_concurrent_jobs, config.clips.workers
        );

        Ok(Self {
            inner: Arc::new(Inner {
                job_slots: Arc::new(Semaphore::new(config.pipeline.max_concurrent_jobs)),
                clip_workers: Arc::new(Semaphore::new(config.clips.workers)),
                jobs: RwLock::new(HashMap::new()),
                stages,
                config,
            }),
        })
    }

    pub fn config(&self) -> &Config {
        &self.inner.config
    }

    /// Accept a job and start it in the background
    pub async fn submit(&self, video_path: impl Into<PathBuf>, detector: DetectorConfig) -> Result<JobId> {
        let video_path = video_path.into();
        ensure_readable(&video_path).await?;
        detector.validate()?;

        let job = Job::new(video_path, detector);
        let job_id = job.id;
        let (cancel_tx, cancel_rx) = watch::channel(false);
        let (state_tx, state_rx) = watch::channel(JobState::Pending);
        let job = Arc::new(Mutex::new(job));

        self.inner.jobs.write().await.insert(
            job_id,
            JobEntry {
                job: Arc::clone(&job),
                cancel_tx,
                state_rx,
            },
        );

        info!("📥 Accepted job {}", job_id);
        let run = JobRun {
            inner: Arc::clone(&self.inner),
            job_id,
            job,
            state_tx,
            cancel_rx,
        };
        tokio::spawn(run.execute());

        Ok(job_id)
    }

    pub async fn get_status(&self, job_id: JobId) -> Result<JobStatus> {
        let job = {
            let jobs = self.inner.jobs.read().await;
            let entry = jobs
                .get(&job_id)
                .ok_or_else(|| PipelineError::NotFound(job_id.to_string()))?;
            Arc::clone(&entry.job)
        };
        let status = job.lock().await.status();
        Ok(status)
    }

    /// Request cancellation; in-flight tools are killed and the job ends
    /// `Failed` with reason `Cancelled`. No-op for finished jobs.
    pub async fn cancel(&self, job_id: JobId) -> Result<()> {
        let jobs = self.inner.jobs.read().await;
        let entry = jobs
            .get(&job_id)
            .ok_or_else(|| PipelineError::NotFound(job_id.to_string()))?;

        if entry.state_rx.borrow().is_terminal() {
            debug!("Job {} already finished, nothing to cancel", job_id);
            return Ok(());
        }

        info!("🛑 Cancelling job {}", job_id);
        let _ = entry.cancel_tx.send(true);
        Ok(())
    }

    /// Wait until the job reaches a terminal state
    pub async fn wait(&self, job_id: JobId) -> Result<JobStatus> {
        let mut state_rx = {
            let jobs = self.inner.jobs.read().await;
            let entry = jobs
                .get(&job_id)
                .ok_or_else(|| PipelineError::NotFound(job_id.to_string()))?;
            entry.state_rx.clone()
        };

        if state_rx.wait_for(|state| state.is_terminal()).await.is_err() {
            warn!("⚠️  Job {} task ended without reporting a terminal state", job_id);
        }
        self.get_status(job_id).await
    }

    /// Drop finished jobs from the registry, returning their final status
    pub async fn remove_finished(&self) -> Vec<JobStatus> {
        let mut jobs = self.inner.jobs.write().await;
        let finished: Vec<JobId> = jobs
            .iter()
            .filter(|(_, entry)| entry.state_rx.borrow().is_terminal())
            .map(|(id, _)| *id)
            .collect();

        let mut removed = Vec::with_capacity(finished.len());
        for id in finished {
            if let Some(entry) = jobs.remove(&id) {
                removed.push(entry.job.lock().await.status());
            }
        }
        removed
    }
}

async fn ensure_readable(video_path: &Path) -> Result<()> {
    let metadata = tokio::fs::metadata(video_path).await.map_err(|e| {
        PipelineError::InvalidInput(format!("cannot read video {}: {}", video_path.display(), e))
    })?;
    if !metadata.is_file() {
        return Err(PipelineError::InvalidInput(format!(
            "{} is not a regular file",
            video_path.display()
        )));
    }
    tokio::fs::File::open(video_path).await.map_err(|e| {
        PipelineError::InvalidInput(format!("cannot open video {}: {}", video_path.display(), e))
    })?;
    Ok(())
}

/// One job's background task
struct JobRun {
    inner: Arc<Inner>,
    job_id: JobId,
    job: Arc<Mutex<Job>>,
    state_tx: watch::Sender<JobState>,
    cancel_rx: watch::Receiver<bool>,
}

impl JobRun {
    async fn execute(mut self) {
        let slots = Arc::clone(&self.inner.job_slots);
        let permit = tokio::select! {
            permit = slots.acquire_owned() => permit.ok(),
            _ = wait_for_cancel(Some(&mut self.cancel_rx)) => None,
        };

        let reason = match permit {
            Some(_permit) => self.run_stages().await,
            None => self.fail(JobState::Pending, StageFailure::Cancelled).await,
        };
        self.finish(reason).await;
    }

    async fn run_stages(&mut self) -> TerminalReason {
        let (video_path, detector) = {
            let job = self.job.lock().await;
            (job.video_path.clone(), job.detector.clone())
        };
        info!("🎬 Starting job {}: {}", self.job_id, video_path.display());

        // Stage 1: audio extraction
        self.advance(JobState::ExtractingAudio).await;
        let source_duration = self
            .inner
            .stages
            .extractor
            .probe_duration(&video_path, self.cancel_rx.clone())
            .await;
        if self.is_cancelled() {
            return self.fail(JobState::ExtractingAudio, StageFailure::Cancelled).await;
        }
        self.job.lock().await.set_source_duration(source_duration);

        let audio = match self.extract_with_retry(&video_path).await {
            Ok(audio) => audio,
            Err(failure) => return self.fail(JobState::ExtractingAudio, failure).await,
        };

        // Stage 2: transcription; the audio is released before anything else happens
        if self.is_cancelled() {
            drop(audio);
            return self.fail(JobState::ExtractingAudio, StageFailure::Cancelled).await;
        }
        self.advance(JobState::Transcribing).await;
        let transcript = self.transcribe(audio.path()).await;
        if let Err(e) = audio.release() {
            warn!("⚠️  Failed to remove temporary audio for job {}: {}", self.job_id, e);
        }
        let transcript = match transcript {
            Ok(segments) => segments,
            Err(failure) => return self.fail(JobState::Transcribing, failure).await,
        };
        info!("📝 Job {}: {} transcript segments", self.job_id, transcript.len());

        // Stage 3: highlight detection
        if self.is_cancelled() {
            return self.fail(JobState::Transcribing, StageFailure::Cancelled).await;
        }
        self.advance(JobState::DetectingHighlights).await;
        let candidates = match HighlightDetector::new(detector) {
            Ok(detector) => detector.detect(&transcript, source_duration),
            Err(e) => return self.fail(JobState::DetectingHighlights, e.into()).await,
        };
        info!("✨ Job {}: {} highlight candidates", self.job_id, candidates.len());

        // Stage 4: clip cutting
        if self.is_cancelled() {
            return self.fail(JobState::DetectingHighlights, StageFailure::Cancelled).await;
        }
        self.advance(JobState::CuttingClips).await;
        if candidates.is_empty() {
            return TerminalReason::NoHighlightsFound;
        }
        self.cut_clips(&video_path, candidates).await
    }

    async fn extract_with_retry(&mut self, video_path: &Path) -> std::result::Result<TempAudio, StageFailure> {
        let audio_config = &self.inner.config.audio;
        let max_attempts = audio_config.max_attempts.max(1);
        let stage_timeout = audio_config.timeout() + STAGE_TIMEOUT_GRACE;
        let mut attempt = 0;

        loop {
            attempt += 1;
            self.job.lock().await.record_extraction_attempt();

            let result = tokio::time::timeout(
                stage_timeout,
                self.inner.stages.extractor.extract(video_path, self.cancel_rx.clone()),
            )
            .await
            .unwrap_or_else(|_| {
                Err(StageFailure::extraction(
                    format!("extraction timed out after {}s", stage_timeout.as_secs()),
                    true,
                ))
            });

            let failure = match result {
                Ok(audio) => return Ok(audio),
                Err(failure) => failure,
            };

            if !failure.is_transient() {
                return Err(failure);
            }
            if attempt >= max_attempts {
                return Err(with_attempts(failure, attempt));
            }

            let backoff = audio_config.backoff_after(attempt);
            warn!(
                "🔁 Job {}: extraction attempt {}/{} failed ({}), retrying in {}ms",
                self.job_id,
                attempt,
                max_attempts,
                failure,
                backoff.as_millis()
            );
            tokio::select! {
                _ = tokio::time::sleep(backoff) => {}
                _ = wait_for_cancel(Some(&mut self.cancel_rx)) => return Err(StageFailure::Cancelled),
            }
        }
    }

    async fn transcribe(&self, audio_path: &Path) -> std::result::Result<Vec<TranscriptSegment>, StageFailure> {
        // Queueing behind other jobs at the engine gate counts toward the deadline
        let config = &self.inner.config;
        let deadline = Duration::from_secs(
            config
                .transcription
                .timeout_secs
                .saturating_mul(config.pipeline.max_concurrent_jobs as u64),
        ) + STAGE_TIMEOUT_GRACE;

        let segments = tokio::time::timeout(
            deadline,
            self.inner.stages.engine.transcribe(audio_path, self.cancel_rx.clone()),
        )
        .await
        .unwrap_or_else(|_| {
            Err(StageFailure::transcription(format!(
                "transcription timed out after {}s",
                deadline.as_secs()
            )))
        })?;

        validate_transcript(&segments)
            .map_err(|e| StageFailure::transcription(format!("invalid transcript: {}", e)))?;
        Ok(segments)
    }

    async fn cut_clips(&self, video_path: &Path, candidates: Vec<HighlightCandidate>) -> TerminalReason {
        let clip_config = &self.inner.config.clips;
        let total = candidates.len();

        if let Err(e) = tokio::fs::create_dir_all(&clip_config.output_dir).await {
            let failure = StageFailure::clip_cut(format!(
                "cannot create output directory {}: {}",
                clip_config.output_dir.display(),
                e
            ));
            self.record_error(StageError::new(JobState::CuttingClips, &failure)).await;
            return TerminalReason::AllClipsFailed { total };
        }

        let job_id = self.job_id.to_string();
        let cut_timeout = clip_config.timeout() + STAGE_TIMEOUT_GRACE;
        let cuts = candidates.into_iter().enumerate().map(|(index, candidate)| {
            let rank = index + 1;
            let output_path = output_path_for(
                &clip_config.output_dir,
                &job_id,
                rank,
                &candidate,
                &clip_config.container,
            );
            let cutter = Arc::clone(&self.inner.stages.cutter);
            let workers = Arc::clone(&self.inner.clip_workers);
            let cancel_rx = self.cancel_rx.clone();
            let video_path = video_path.to_path_buf();

            async move {
                let result = match workers.acquire_owned().await {
                    Ok(_permit) => {
                        if *cancel_rx.borrow() {
                            Err(StageFailure::Cancelled)
                        } else {
                            tokio::time::timeout(
                                cut_timeout,
                                cutter.cut(&video_path, &candidate, &output_path, cancel_rx),
                            )
                            .await
                            .unwrap_or_else(|_| {
                                Err(StageFailure::clip_cut(format!(
                                    "cut timed out after {}s",
                                    cut_timeout.as_secs()
                                )))
                            })
                        }
                    }
                    Err(_) => Err(StageFailure::Cancelled),
                };
                (rank, candidate, output_path, result)
            }
        });

        let mut results = stream::iter(cuts).buffered(clip_config.workers.max(1));
        let mut failed = 0;
        let mut cancelled = false;

        while let Some((rank, candidate, path, result)) = results.next().await {
            match result {
                Ok(CutReport { exit_code, size_bytes }) => {
                    self.record_clip(Clip {
                        rank,
                        path,
                        candidate,
                        exit_status: exit_code,
                        size_bytes,
                    })
                    .await;
                }
                Err(StageFailure::Cancelled) => cancelled = true,
                Err(failure) => {
                    failed += 1;
                    warn!("❌ Job {}: clip #{} failed: {}", self.job_id, rank, failure);
                    self.record_error(StageError::new(JobState::CuttingClips, &failure).for_candidate(rank))
                        .await;
                }
            }
        }
        drop(results);

        // A cancel that lands after every cut already finished keeps the clips
        if cancelled {
            return self.fail(JobState::CuttingClips, StageFailure::Cancelled).await;
        }

        match failed {
            0 => TerminalReason::Completed,
            n if n == total => TerminalReason::AllClipsFailed { total },
            n => TerminalReason::SomeClipsFailed { failed: n, total },
        }
    }

    fn is_cancelled(&self) -> bool {
        *self.cancel_rx.borrow()
    }

    async fn advance(&self, stage: JobState) {
        let mut job = self.job.lock().await;
        match job.advance(stage) {
            Ok(()) => {
                debug!("Job {} -> {}", self.job_id, stage);
                let _ = self.state_tx.send(stage);
            }
            Err(e) => error!("Job {}: {}", self.job_id, e),
        }
    }

    /// Record a fatal stage failure and pick the matching terminal reason
    async fn fail(&self, stage: JobState, failure: StageFailure) -> TerminalReason {
        self.record_error(StageError::new(stage, &failure)).await;
        if failure.is_cancelled() {
            TerminalReason::Cancelled
        } else {
            TerminalReason::StageFailed {
                stage,
                kind: failure.kind(),
            }
        }
    }

    async fn record_error(&self, error: StageError) {
        if let Err(e) = self.job.lock().await.record_error(error) {
            error!("Job {}: {}", self.job_id, e);
        }
    }

    async fn record_clip(&self, clip: Clip) {
        if let Err(e) = self.job.lock().await.record_clip(clip) {
            error!("Job {}: {}", self.job_id, e);
        }
    }

    async fn finish(&self, reason: TerminalReason) {
        let mut job = self.job.lock().await;
        let description = reason.describe();
        match job.finish(reason) {
            Ok(()) => {
                let state = job.state();
                match state {
                    JobState::Succeeded => info!("✅ Job {} succeeded: {}", self.job_id, description),
                    JobState::PartiallyFailed => warn!("⚠️  Job {} partially failed: {}", self.job_id, description),
                    _ => warn!("❌ Job {} failed: {}", self.job_id, description),
                }
                let _ = self.state_tx.send(state);
            }
            Err(e) => error!("Job {}: {}", self.job_id, e),
        }
    }
}

fn with_attempts(failure: StageFailure, attempts: u32) -> StageFailure {
    match failure {
        StageFailure::ExtractionFailed { cause, transient } if attempts > 1 => StageFailure::ExtractionFailed {
            cause: format!("{} (after {} attempts)", cause, attempts),
            transient,
        },
        other => other,
    }
}
