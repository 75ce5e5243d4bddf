mod common;

use common::*;
use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use highlight_reel::{
    DetectorConfig, ErrorKind, JobId, JobState, PipelineError, PipelineStages, Selection, StageFailure,
    TerminalReason,
};

fn goal_detector() -> DetectorConfig {
    DetectorConfig::default()
        .with_keywords(["goal"])
        .with_min_gap(1.0)
        .with_confidence_weighting(false)
}

#[tokio::test]
async fn test_successful_job_produces_ranked_clips() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Completed));
    assert_eq!(status.clips.len(), 3);
    assert!(status.errors.is_empty());

    let starts: Vec<f64> = status.clips.iter().map(|c| c.candidate.start).collect();
    assert_eq!(starts, vec![10.0, 20.0, 0.0]);
    for (index, clip) in status.clips.iter().enumerate() {
        assert_eq!(clip.rank, index + 1);
        assert!(clip.path.exists());
        assert!(clip.path.starts_with(ws.clip_dir()));
        assert!(clip
            .path
            .to_string_lossy()
            .contains(&format!("{}_highlight_{}_", status.job_id, clip.rank)));
    }

    let stages: Vec<JobState> = status.timings.iter().map(|t| t.stage).collect();
    assert_eq!(
        stages,
        vec![
            JobState::ExtractingAudio,
            JobState::Transcribing,
            JobState::DetectingHighlights,
            JobState::CuttingClips,
        ]
    );
    assert!(status.timings.iter().all(|t| t.elapsed_ms.is_some()));
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_audio_exists_during_transcription_only() {
    let ws = Workspace::new();
    let engine = Arc::new(FakeEngine::segments(three_highlights()));
    let pipeline = ws.pipeline_with(
        ws.config(),
        PipelineStages {
            extractor: Arc::new(FakeExtractor::new(&ws.audio_dir())),
            engine: engine.clone(),
            cutter: Arc::new(FakeCutter::new()),
        },
    );

    run_to_end(&pipeline, &ws.video, goal_detector()).await;
    assert_eq!(*engine.audio_seen.lock().unwrap(), vec![true]);
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_fallback_when_no_keyword_matches() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(vec![seg(0.0, 5.0, "intro")]),
        FakeCutter::new(),
    );

    let detector = DetectorConfig::default().with_keywords(["highlight"]);
    let status = run_to_end(&pipeline, &ws.video, detector).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.clips.len(), 1);
    assert_eq!(status.clips[0].candidate.selection, Selection::LongestSegment);
    assert_eq!((status.clips[0].candidate.start, status.clips[0].candidate.end), (0.0, 5.0));
}

#[tokio::test]
async fn test_one_failed_cut_is_partial_failure() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::failing(&[2]),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::PartiallyFailed);
    assert_eq!(status.clips.len(), 2);
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].kind, ErrorKind::ClipCutFailed);
    assert_eq!(status.errors[0].candidate_rank, Some(2));
    assert_eq!(status.errors[0].stage, JobState::CuttingClips);
    assert_eq!(
        status.terminal_reason,
        Some(TerminalReason::SomeClipsFailed { failed: 1, total: 3 })
    );
    assert!(status.reason.unwrap().contains("1 of 3"));
}

#[tokio::test]
async fn test_all_cuts_failing_fails_the_job() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::failing(&[1, 2, 3]),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert!(status.clips.is_empty());
    assert_eq!(status.errors.len(), 3);
    assert_eq!(status.terminal_reason, Some(TerminalReason::AllClipsFailed { total: 3 }));
    assert_eq!(status.error_kind, Some(ErrorKind::ClipCutFailed));
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_empty_transcript_ends_with_no_highlights() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(vec![]),
        FakeCutter::new(),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::NoHighlightsFound));
    assert_eq!(status.error_kind, None);
    assert!(status.errors.is_empty());
    assert_eq!(status.timings.last().unwrap().stage, JobState::CuttingClips);
}

#[tokio::test]
async fn test_transient_extraction_failures_are_retried() {
    let ws = Workspace::new();
    let extractor = FakeExtractor::new(&ws.audio_dir())
        .then(Step::Fail(StageFailure::extraction("empty output", true)))
        .then(Step::Fail(StageFailure::extraction("empty output", true)));
    let pipeline = ws.pipeline(extractor, FakeEngine::segments(three_highlights()), FakeCutter::new());

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.extraction_attempts, 3);
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_retry_budget_exhausted() {
    let ws = Workspace::new();
    let extractor =
        FakeExtractor::new(&ws.audio_dir()).always(Step::Fail(StageFailure::extraction("empty output", true)));
    let pipeline = ws.pipeline(extractor, FakeEngine::segments(three_highlights()), FakeCutter::new());

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.extraction_attempts, 3);
    assert_eq!(status.error_kind, Some(ErrorKind::ExtractionFailed));
    assert_eq!(status.errors.len(), 1);
    assert!(status.errors[0].reason.contains("after 3 attempts"));
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_permanent_extraction_failure_is_not_retried() {
    let ws = Workspace::new();
    let extractor = FakeExtractor::new(&ws.audio_dir())
        .always(Step::Fail(StageFailure::extraction("Invalid data found when processing input", false)));
    let pipeline = ws.pipeline(extractor, FakeEngine::segments(three_highlights()), FakeCutter::new());

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.extraction_attempts, 1);
    assert_eq!(
        status.terminal_reason,
        Some(TerminalReason::StageFailed {
            stage: JobState::ExtractingAudio,
            kind: ErrorKind::ExtractionFailed,
        })
    );
}

#[tokio::test]
async fn test_transcription_failure_skips_remaining_stages() {
    let ws = Workspace::new();
    let cutter = Arc::new(FakeCutter::new());
    let pipeline = ws.pipeline_with(
        ws.config(),
        PipelineStages {
            extractor: Arc::new(FakeExtractor::new(&ws.audio_dir())),
            engine: Arc::new(FakeEngine::new(Step::Fail(StageFailure::transcription("model crashed")))),
            cutter: cutter.clone(),
        },
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error_kind, Some(ErrorKind::TranscriptionFailed));
    assert_eq!(status.errors[0].stage, JobState::Transcribing);
    assert!(status.errors[0].reason.contains("model crashed"));
    assert_eq!(cutter.calls.load(Ordering::SeqCst), 0);
    assert_eq!(status.extraction_attempts, 1);
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_unordered_transcript_fails_fast() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(vec![seg(10.0, 12.0, "goal"), seg(1.0, 2.0, "goal")]),
        FakeCutter::new(),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.error_kind, Some(ErrorKind::TranscriptionFailed));
    assert!(status.errors[0].reason.contains("invalid transcript"));
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_clamped_to_probed_duration() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()).with_duration(15.0),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

    assert_eq!(status.source_duration, Some(15.0));
    assert_eq!(status.clips.len(), 2);
    assert!(status.clips.iter().all(|c| c.candidate.end <= 15.0));
}

#[tokio::test]
async fn test_cancel_during_extraction() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()).always(Step::HangUntilCancelled),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let job_id = pipeline.submit(&ws.video, goal_detector()).await.unwrap();
    wait_for_state(&pipeline, job_id, JobState::ExtractingAudio).await;
    tokio::time::sleep(Duration::from_millis(20)).await;
    pipeline.cancel(job_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), pipeline.wait(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
    assert_eq!(status.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(status.extraction_attempts, 1);
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_cancel_while_probing_duration() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()).with_hanging_probe(),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let job_id = pipeline.submit(&ws.video, goal_detector()).await.unwrap();
    wait_for_state(&pipeline, job_id, JobState::ExtractingAudio).await;
    pipeline.cancel(job_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(2), pipeline.wait(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
    assert_eq!(status.extraction_attempts, 0);
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_cancel_during_transcription_releases_audio() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::new(Step::HangUntilCancelled),
        FakeCutter::new(),
    );

    let job_id = pipeline.submit(&ws.video, goal_detector()).await.unwrap();
    wait_for_state(&pipeline, job_id, JobState::Transcribing).await;
    assert_eq!(ws.leftover_audio().len(), 1);

    pipeline.cancel(job_id).await.unwrap();
    let status = pipeline.wait(job_id).await.unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
    assert!(ws.leftover_audio().is_empty());
}

#[tokio::test]
async fn test_cancel_during_cutting() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::hanging(),
    );

    let job_id = pipeline.submit(&ws.video, goal_detector()).await.unwrap();
    wait_for_state(&pipeline, job_id, JobState::CuttingClips).await;
    pipeline.cancel(job_id).await.unwrap();

    let status = tokio::time::timeout(Duration::from_secs(5), pipeline.wait(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
    assert!(status.clips.is_empty());
}

#[tokio::test]
async fn test_cancel_after_last_cut_keeps_success() {
    let ws = Workspace::new();
    let pause = Arc::new(CutPause::default());
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::paused(Arc::clone(&pause)),
    );

    let job_id = pipeline
        .submit(&ws.video, goal_detector().with_max_clips(1))
        .await
        .unwrap();
    tokio::time::timeout(Duration::from_secs(5), pause.written.notified())
        .await
        .unwrap();
    pipeline.cancel(job_id).await.unwrap();
    pause.release.notify_one();

    let status = tokio::time::timeout(Duration::from_secs(5), pipeline.wait(job_id))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(status.state, JobState::Succeeded);
    assert_eq!(status.terminal_reason, Some(TerminalReason::Completed));
    assert_eq!(status.clips.len(), 1);
}

#[tokio::test]
async fn test_hung_cut_hits_stage_deadline() {
    let ws = Workspace::new();
    let mut config = ws.config();
    config.clips.timeout_secs = 1;
    let pipeline = ws.pipeline_with(
        config,
        PipelineStages {
            extractor: Arc::new(FakeExtractor::new(&ws.audio_dir())),
            engine: Arc::new(FakeEngine::segments(three_highlights())),
            cutter: Arc::new(FakeCutter::hanging()),
        },
    );

    let job_id = pipeline
        .submit(&ws.video, goal_detector().with_max_clips(1))
        .await
        .unwrap();
    let status = tokio::time::timeout(Duration::from_secs(15), pipeline.wait(job_id))
        .await
        .unwrap()
        .unwrap();

    assert_eq!(status.state, JobState::Failed);
    assert_eq!(status.terminal_reason, Some(TerminalReason::AllClipsFailed { total: 1 }));
    assert_eq!(status.errors.len(), 1);
    assert_eq!(status.errors[0].kind, ErrorKind::ClipCutFailed);
    assert_eq!(status.errors[0].candidate_rank, Some(1));
    assert!(status.errors[0].reason.contains("timed out"));
}

#[tokio::test]
async fn test_cancel_finished_job_is_noop() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;
    pipeline.cancel(status.job_id).await.unwrap();

    let after = pipeline.get_status(status.job_id).await.unwrap();
    assert_eq!(after.state, JobState::Succeeded);
    assert_eq!(after.clips, status.clips);
}

#[tokio::test]
async fn test_unknown_job_is_not_found() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(vec![]),
        FakeCutter::new(),
    );

    let unknown = JobId::new();
    assert!(matches!(pipeline.get_status(unknown).await, Err(PipelineError::NotFound(_))));
    assert!(matches!(pipeline.cancel(unknown).await, Err(PipelineError::NotFound(_))));
    assert!(matches!(pipeline.wait(unknown).await, Err(PipelineError::NotFound(_))));
}

#[tokio::test]
async fn test_submit_rejects_bad_input() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(vec![]),
        FakeCutter::new(),
    );

    let missing = ws.root.path().join("missing.mp4");
    assert!(matches!(
        pipeline.submit(&missing, goal_detector()).await,
        Err(PipelineError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.submit(ws.root.path(), goal_detector()).await,
        Err(PipelineError::InvalidInput(_))
    ));
    assert!(matches!(
        pipeline.submit(&ws.video, goal_detector().with_max_clips(0)).await,
        Err(PipelineError::InvalidConfig(_))
    ));
}

#[tokio::test]
async fn test_concurrent_jobs_are_independent() {
    let ws = Workspace::new();
    let pipeline = ws.pipeline(
        FakeExtractor::new(&ws.audio_dir()),
        FakeEngine::segments(three_highlights()),
        FakeCutter::new(),
    );

    let mut ids = Vec::new();
    for _ in 0..4 {
        ids.push(pipeline.submit(&ws.video, goal_detector()).await.unwrap());
    }
    for id in &ids {
        let status = pipeline.wait(*id).await.unwrap();
        assert_eq!(status.state, JobState::Succeeded);
        assert_eq!(status.clips.len(), 3);
    }

    let removed = pipeline.remove_finished().await;
    assert_eq!(removed.len(), 4);
    assert!(matches!(pipeline.get_status(ids[0]).await, Err(PipelineError::NotFound(_))));
    assert!(ws.leftover_audio().is_empty());
}

#[cfg(unix)]
mod with_fake_ffmpeg {
    use super::*;
    use highlight_reel::FfmpegAudioExtractor;
    use std::os::unix::fs::PermissionsExt;

    /// ffmpeg stand-in that counts its runs and writes nothing useful
    fn zero_byte_ffmpeg(ws: &Workspace) -> (String, std::path::PathBuf) {
        let counter = ws.root.path().join("ffmpeg-runs");
        let script = ws.root.path().join("fake-ffmpeg");
        std::fs::write(
            &script,
            format!(
                "#!/bin/sh\necho run >> '{}'\nfor last; do :; done\n: > \"$last\"\n",
                counter.display()
            ),
        )
        .unwrap();
        std::fs::set_permissions(&script, std::fs::Permissions::from_mode(0o755)).unwrap();
        (script.to_string_lossy().into_owned(), counter)
    }

    #[tokio::test]
    async fn test_cancel_kills_slow_ffprobe() {
        let ws = Workspace::new();
        let ffprobe = ws.root.path().join("fake-ffprobe");
        std::fs::write(&ffprobe, "#!/bin/sh\nsleep 8\n").unwrap();
        std::fs::set_permissions(&ffprobe, std::fs::Permissions::from_mode(0o755)).unwrap();
        let mut config = ws.config();
        config.audio.ffprobe_path = ffprobe.to_string_lossy().into_owned();

        let pipeline = ws.pipeline_with(
            config.clone(),
            PipelineStages {
                extractor: Arc::new(FfmpegAudioExtractor::new(config.audio.clone())),
                engine: Arc::new(FakeEngine::segments(three_highlights())),
                cutter: Arc::new(FakeCutter::new()),
            },
        );

        let job_id = pipeline.submit(&ws.video, goal_detector()).await.unwrap();
        wait_for_state(&pipeline, job_id, JobState::ExtractingAudio).await;
        tokio::time::sleep(Duration::from_millis(100)).await;

        let start = std::time::Instant::now();
        pipeline.cancel(job_id).await.unwrap();
        let status = pipeline.wait(job_id).await.unwrap();

        assert!(start.elapsed() < Duration::from_secs(2));
        assert_eq!(status.terminal_reason, Some(TerminalReason::Cancelled));
        assert_eq!(status.extraction_attempts, 0);
    }

    #[tokio::test]
    async fn test_zero_byte_audio_exhausts_retries() {
        let ws = Workspace::new();
        let (ffmpeg, counter) = zero_byte_ffmpeg(&ws);
        let mut config = ws.config();
        config.audio.ffmpeg_path = ffmpeg;
        config.audio.ffprobe_path = "/nonexistent/ffprobe".to_string();

        let pipeline = ws.pipeline_with(
            config.clone(),
            PipelineStages {
                extractor: Arc::new(FfmpegAudioExtractor::new(config.audio.clone())),
                engine: Arc::new(FakeEngine::segments(three_highlights())),
                cutter: Arc::new(FakeCutter::new()),
            },
        );

        let status = run_to_end(&pipeline, &ws.video, goal_detector()).await;

        assert_eq!(status.state, JobState::Failed);
        assert_eq!(status.error_kind, Some(ErrorKind::ExtractionFailed));
        assert_eq!(status.extraction_attempts, 3);
        assert_eq!(std::fs::read_to_string(&counter).unwrap().lines().count(), 3);
        assert_eq!(status.source_duration, None);
        assert!(ws.leftover_audio().is_empty());
    }
}
