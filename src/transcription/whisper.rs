use async_trait::async_trait;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::watch;
use tracing::{debug, info, warn};

use super::{TranscriptSegment, TranscriptionEngine};
use crate::config::{TranscriptionConfig, WhisperBackend};
use crate::error::StageFailure;
use crate::process::{check_command_available, ProcessRunner};

/// A WAV file this small holds a header and no samples
const MIN_AUDIO_BYTES: u64 = 44;

/// Segments Whisper itself flags as probably-not-speech
const NO_SPEECH_THRESHOLD: f64 = 0.8;

/// Whisper invoked as an external command (whisper.cpp or OpenAI Whisper)
///
/// Backend detection and model resolution happen once in [`WhisperEngine::load`];
/// each transcription afterwards is a stateless command invocation.
#[derive(Debug, Clone)]
pub struct WhisperEngine {
    backend: WhisperBackend,
    model: String,
    model_path: Option<PathBuf>,
    language: Option<String>,
    threads: usize,
    timeout: Duration,
}

impl WhisperEngine {
    /// Resolve backend and model file
    pub async fn load(config: &TranscriptionConfig) -> Result<Self, StageFailure> {
        let backend = match config.backend {
            WhisperBackend::Auto => Self::detect_backend().await.ok_or_else(|| {
                StageFailure::transcription(
                    "no Whisper backend found, install whisper.cpp (whisper-cli) or openai-whisper",
                )
            })?,
            explicit => explicit,
        };

        let model_path = if backend.is_cpp() {
            let path = Self::resolve_model_file(config).ok_or_else(|| {
                StageFailure::transcription(format!(
                    "ggml model file for '{}' not found (looked in {})",
                    config.model,
                    config.model_dir.display()
                ))
            })?;
            info!("✅ Found model: {}", path.display());
            Some(path)
        } else {
            None
        };

        info!("🎤 Whisper engine ready: {} ({} model)", backend.program(), config.model);

        Ok(Self {
            backend,
            model: config.model.clone(),
            model_path,
            language: config.language.clone(),
            threads: config.threads.max(1),
            timeout: Duration::from_secs(config.timeout_secs),
        })
    }

    /// Try the faster C++ builds before the Python fallback
    async fn detect_backend() -> Option<WhisperBackend> {
        for backend in [
            WhisperBackend::WhisperCli,
            WhisperBackend::WhisperCpp,
            WhisperBackend::Python,
        ] {
            debug!("🔍 Checking for {} command...", backend.program());
            if check_command_available(backend.program()).await {
                return Some(backend);
            }
        }
        None
    }

    fn resolve_model_file(config: &TranscriptionConfig) -> Option<PathBuf> {
        let file_name = format!("ggml-{}.bin", config.model);
        [
            config.model_dir.join(&file_name),
            PathBuf::from("models").join(&file_name),
            PathBuf::from("/usr/local/share/whisper-cpp").join(&file_name),
            PathBuf::from("/opt/homebrew/share/whisper-cpp").join(&file_name),
        ]
        .into_iter()
        .find(|candidate| candidate.is_file())
    }

    fn build_args(&self, audio_path: &Path, output_dir: &Path) -> Vec<String> {
        let mut args: Vec<String> = Vec::new();

        if self.backend.is_cpp() {
            let stem = audio_path
                .file_stem()
                .map(|s| s.to_string_lossy().into_owned())
                .unwrap_or_else(|| "transcript".to_string());
            args.extend([
                "-f".to_string(),
                audio_path.to_string_lossy().into_owned(),
                "-oj".to_string(),
                "-of".to_string(),
                output_dir.join(stem).to_string_lossy().into_owned(),
                "-t".to_string(),
                self.threads.to_string(),
                "-np".to_string(),
            ]);
            if let Some(model_path) = &self.model_path {
                args.push("-m".to_string());
                args.push(model_path.to_string_lossy().into_owned());
            }
            if let Some(language) = &self.language {
                args.push("-l".to_string());
                args.push(language.clone());
            }
        } else {
            args.extend([
                audio_path.to_string_lossy().into_owned(),
                "--model".to_string(),
                self.model.clone(),
                "--output_dir".to_string(),
                output_dir.to_string_lossy().into_owned(),
                "--output_format".to_string(),
                "json".to_string(),
                "--verbose".to_string(),
                "False".to_string(),
                "--fp16".to_string(),
                "False".to_string(),
                "--threads".to_string(),
                self.threads.to_string(),
            ]);
            if let Some(language) = &self.language {
                args.push("--language".to_string());
                args.push(language.clone());
            }
        }

        args
    }
}

#[async_trait]
impl TranscriptionEngine for WhisperEngine {
    fn name(&self) -> &str {
        self.backend.program()
    }

    async fn transcribe(
        &self,
        audio_path: &Path,
        cancel_rx: watch::Receiver<bool>,
    ) -> Result<Vec<TranscriptSegment>, StageFailure> {
        let start_time = Instant::now();

        let metadata = tokio::fs::metadata(audio_path).await.map_err(|e| {
            StageFailure::transcription(format!("cannot read audio {}: {}", audio_path.display(), e))
        })?;
        if metadata.len() <= MIN_AUDIO_BYTES {
            return Err(StageFailure::transcription(format!(
                "audio file {} is empty ({} bytes)",
                audio_path.display(),
                metadata.len()
            )));
        }

        let work_dir = tempfile::Builder::new()
            .prefix("highlight-whisper-")
            .tempdir()
            .map_err(|e| StageFailure::transcription(format!("cannot create work directory: {}", e)))?;

        info!(
            "🚀 Running {}: {} model on {} ({:.1} MB)",
            self.backend.program(),
            self.model,
            audio_path.display(),
            metadata.len() as f64 / 1_000_000.0
        );

        ProcessRunner::new(self.backend.program())
            .with_timeout(self.timeout)
            .with_cancel(cancel_rx)
            .run(self.build_args(audio_path, work_dir.path()))
            .await
            .map_err(StageFailure::from_transcription_process)?;

        let json_path = find_json_output(work_dir.path()).await?;
        let content = tokio::fs::read_to_string(&json_path)
            .await
            .map_err(|e| StageFailure::transcription(format!("cannot read Whisper output: {}", e)))?;
        let segments = parse_whisper_json(&content).map_err(StageFailure::transcription)?;

        info!(
            "✅ Transcription completed in {:.1}s: {} segments",
            start_time.elapsed().as_secs_f64(),
            segments.len()
        );
        Ok(segments)
    }
}

async fn find_json_output(dir: &Path) -> Result<PathBuf, StageFailure> {
    let mut entries = tokio::fs::read_dir(dir)
        .await
        .map_err(|e| StageFailure::transcription(format!("cannot list Whisper output: {}", e)))?;

    while let Ok(Some(entry)) = entries.next_entry().await {
        let path = entry.path();
        if path.extension().map_or(false, |ext| ext == "json") {
            return Ok(path);
        }
    }

    warn!("❌ No Whisper JSON output found in: {}", dir.display());
    Err(StageFailure::transcription("Whisper produced no JSON output"))
}

/// Parse Whisper JSON output into transcript segments.
///
/// Understands the whisper.cpp layout (`transcription[]` with millisecond
/// offsets) and the OpenAI Whisper layout (`segments[]` in seconds, possibly
/// nested under `result`). Blank segments are dropped.
pub fn parse_whisper_json(content: &str) -> Result<Vec<TranscriptSegment>, String> {
    let output: WhisperOutput =
        serde_json::from_str(content).map_err(|e| format!("failed to parse Whisper JSON: {}", e))?;

    let segments: Vec<TranscriptSegment> = if !output.transcription.is_empty() {
        output
            .transcription
            .into_iter()
            .map(|seg| {
                TranscriptSegment::new(
                    seg.offsets.from as f64 / 1000.0,
                    seg.offsets.to as f64 / 1000.0,
                    seg.text.trim(),
                )
            })
            .collect()
    } else {
        let raw = match output.result {
            Some(result) if !result.segments.is_empty() => result.segments,
            _ => output.segments,
        };
        raw.into_iter()
            .map(|seg| {
                let confidence = match (seg.no_speech_prob, seg.avg_logprob) {
                    (Some(p), _) if p > NO_SPEECH_THRESHOLD => Some(0.0),
                    (_, Some(logprob)) => Some(logprob.exp().clamp(0.0, 1.0)),
                    _ => None,
                };
                TranscriptSegment::new(seg.start, seg.end, seg.text.trim()).with_confidence(confidence)
            })
            .collect()
    };

    Ok(segments.into_iter().filter(|s| !s.text.is_empty()).collect())
}

#[derive(Debug, Deserialize)]
struct WhisperOutput {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
    #[serde(default)]
    transcription: Vec<WhisperCppSegment>,
    #[serde(default)]
    result: Option<WhisperResult>,
}

#[derive(Debug, Deserialize)]
struct WhisperResult {
    #[serde(default)]
    segments: Vec<WhisperSegment>,
}

#[derive(Debug, Deserialize)]
struct WhisperCppSegment {
    offsets: WhisperOffsets,
    text: String,
}

/// Milliseconds from the start of the audio
#[derive(Debug, Deserialize)]
struct WhisperOffsets {
    from: u64,
    to: u64,
}

#[derive(Debug, Deserialize)]
struct WhisperSegment {
    start: f64,
    end: f64,
    text: String,
    #[serde(default)]
    avg_logprob: Option<f64>,
    #[serde(default)]
    no_speech_prob: Option<f64>,
}
