//! Cancellable, time-bounded runner for external tools (ffmpeg, ffprobe, whisper)

use std::ffi::OsStr;
use std::process::Stdio;
use std::time::{Duration, Instant};
use thiserror::Error;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Lines of stderr kept when a tool fails
const STDERR_TAIL_LINES: usize = 20;

#[derive(Error, Debug)]
pub enum ProcessError {
    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("{program} exited with status {code:?}: {stderr}")]
    Failed {
        program: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("{program} timed out after {secs:.1}s")]
    Timeout { program: String, secs: f64 },

    #[error("{program} was cancelled")]
    Cancelled { program: String },

    #[error("IO error while running {program}: {source}")]
    Io {
        program: String,
        #[source]
        source: std::io::Error,
    },
}

impl ProcessError {
    /// stderr captured from a non-zero exit, empty otherwise
    pub fn stderr(&self) -> &str {
        match self {
            ProcessError::Failed { stderr, .. } => stderr,
            _ => "",
        }
    }
}

enum Outcome {
    Exited(std::io::Result<std::process::ExitStatus>),
    TimedOut,
    Cancelled,
}

/// Output of a successful run
#[derive(Debug, Clone)]
pub struct ProcessOutput {
    pub exit_code: i32,
    pub stdout: String,
    pub stderr: String,
}

/// Runs one external program, killing it on timeout or cancellation
#[derive(Debug, Clone)]
pub struct ProcessRunner {
    program: String,
    timeout: Option<Duration>,
    cancel_rx: Option<watch::Receiver<bool>>,
}

impl ProcessRunner {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            timeout: None,
            cancel_rx: None,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Kill the process as soon as the job's cancel flag flips to `true`
    pub fn with_cancel(mut self, cancel_rx: watch::Receiver<bool>) -> Self {
        self.cancel_rx = Some(cancel_rx);
        self
    }

    pub async fn run<I, S>(&self, args: I) -> Result<ProcessOutput, ProcessError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        let mut cancel_rx = self.cancel_rx.clone();
        if cancel_rx.as_ref().map_or(false, |rx| *rx.borrow()) {
            return Err(ProcessError::Cancelled {
                program: self.program.clone(),
            });
        }

        let mut cmd = Command::new(&self.program);
        cmd.args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!("Executing command: {:?}", cmd);
        let start_time = Instant::now();

        let mut child = cmd.spawn().map_err(|source| ProcessError::Spawn {
            program: self.program.clone(),
            source,
        })?;

        // Drain both pipes concurrently so a chatty tool never blocks on a full pipe
        let stdout_task = child.stdout.take().map(|mut out| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = out.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });
        let stderr_task = child.stderr.take().map(|mut err| {
            tokio::spawn(async move {
                let mut buf = Vec::new();
                let _ = err.read_to_end(&mut buf).await;
                String::from_utf8_lossy(&buf).into_owned()
            })
        });

        let deadline = async {
            match self.timeout {
                Some(timeout) => tokio::time::sleep(timeout).await,
                None => std::future::pending::<()>().await,
            }
        };

        let outcome = tokio::select! {
            status = child.wait() => Outcome::Exited(status),
            _ = deadline => Outcome::TimedOut,
            _ = wait_for_cancel(cancel_rx.as_mut()) => Outcome::Cancelled,
        };

        let status = match outcome {
            Outcome::Exited(status) => status.map_err(|source| ProcessError::Io {
                program: self.program.clone(),
                source,
            })?,
            Outcome::TimedOut => {
                let secs = start_time.elapsed().as_secs_f64();
                warn!("⏰ {} timed out after {:.1}s, killing process", self.program, secs);
                let _ = child.kill().await;
                return Err(ProcessError::Timeout {
                    program: self.program.clone(),
                    secs,
                });
            }
            Outcome::Cancelled => {
                info!("🛑 {} cancelled, killing process", self.program);
                let _ = child.kill().await;
                return Err(ProcessError::Cancelled {
                    program: self.program.clone(),
                });
            }
        };

        let stdout = match stdout_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let stderr = match stderr_task {
            Some(task) => task.await.unwrap_or_default(),
            None => String::new(),
        };
        let elapsed = start_time.elapsed();

        if !status.success() {
            debug!("{} failed after {:.1}s: {}", self.program, elapsed.as_secs_f64(), stderr);
            return Err(ProcessError::Failed {
                program: self.program.clone(),
                code: status.code(),
                stderr: tail_lines(&stderr, STDERR_TAIL_LINES),
            });
        }

        debug!("{} completed in {:.1}s", self.program, elapsed.as_secs_f64());
        Ok(ProcessOutput {
            exit_code: status.code().unwrap_or(0),
            stdout,
            stderr,
        })
    }
}

/// Resolves once the cancel flag is `true`; never resolves without a receiver
/// or after the sender is gone.
pub async fn wait_for_cancel(cancel_rx: Option<&mut watch::Receiver<bool>>) {
    let Some(rx) = cancel_rx else {
        return std::future::pending().await;
    };
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            return std::future::pending().await;
        }
    }
}

/// Check whether a command can be executed at all
pub async fn check_command_available(cmd_name: &str) -> bool {
    Command::new(cmd_name)
        .arg("--help")
        .stdin(Stdio::null())
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .await
        .map(|status| status.success())
        .unwrap_or(false)
}

fn tail_lines(text: &str, max_lines: usize) -> String {
    let lines: Vec<&str> = text.lines().filter(|l| !l.trim().is_empty()).collect();
    let start = lines.len().saturating_sub(max_lines);
    lines[start..].join("\n")
}
