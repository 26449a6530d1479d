// src/sys/process.rs

use async_trait::async_trait;
use chrono::Utc;
use nix::errno::Errno;
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::{ExitStatus, Stdio};
use std::sync::Mutex;
use std::time::{Duration, Instant};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::signal::unix::{Signal as UnixSignal, SignalKind, signal as unix_signal};
use tokio::sync::mpsc;

use crate::error::{Result, VerifyError};
use crate::sys::traits::{ExecutionResult, OutputLine, OutputStream, ProcessRunner};

const SPAWN_BUSY_RETRIES: u32 = 5;
const SPAWN_BUSY_BACKOFF: Duration = Duration::from_millis(20);

pub struct SystemProcessRunner;

#[async_trait]
impl ProcessRunner for SystemProcessRunner {
    async fn run(
        &self,
        program: &Path,
        work_dir: &Path,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult> {
        // Listeners exist before the child does, so no signal slips past.
        let signals = ForwardedSignals::register().map_err(|source| VerifyError::Launch {
            program: program.to_path_buf(),
            source,
        })?;

        let started_at = Utc::now();
        let clock = Instant::now();

        let mut child = spawn_piped(program, work_dir)
            .await
            .map_err(|source| VerifyError::Launch {
                program: program.to_path_buf(),
                source,
            })?;

        let (Some(stdout), Some(stderr)) = (child.stdout.take(), child.stderr.take()) else {
            return Err(VerifyError::Launch {
                program: program.to_path_buf(),
                source: io::Error::other("subprocess pipes were not captured"),
            });
        };

        // One reader per pipe keeps each stream in order while both flow live.
        let stdout_task = tokio::spawn(pump(stdout, OutputStream::Stdout, output.clone()));
        let stderr_task = tokio::spawn(pump(stderr, OutputStream::Stderr, output));

        let status = signals
            .wait(&mut child)
            .await
            .map_err(|source| VerifyError::Launch {
                program: program.to_path_buf(),
                source,
            })?;

        // Drain whatever is still buffered before reporting the result.
        for task in [stdout_task, stderr_task] {
            if let Err(e) = task.await {
                tracing::warn!(error = %e, "Output reader task failed");
            }
        }

        let exit_code = exit_code_of(status);
        tracing::debug!(exit_code, program = %program.display(), "Subprocess exited");

        Ok(ExecutionResult {
            exit_code,
            duration: clock.elapsed(),
            started_at,
        })
    }

    fn check_executable(&self, program: &Path) -> Result<()> {
        let launch_error = |source: io::Error| VerifyError::Launch {
            program: program.to_path_buf(),
            source,
        };

        let resolved = resolve_program(program).ok_or_else(|| {
            launch_error(io::Error::new(io::ErrorKind::NotFound, "not found on PATH"))
        })?;
        let meta = std::fs::metadata(&resolved).map_err(launch_error)?;
        if !meta.is_file() || meta.permissions().mode() & 0o111 == 0 {
            return Err(launch_error(io::Error::new(
                io::ErrorKind::PermissionDenied,
                "not an executable file",
            )));
        }
        Ok(())
    }
}

/// Paths are taken as given; a bare name is searched on `PATH`.
fn resolve_program(program: &Path) -> Option<PathBuf> {
    if program.is_absolute() || program.components().count() > 1 {
        return Some(program.to_path_buf());
    }
    let search = std::env::var_os("PATH")?;
    std::env::split_paths(&search)
        .map(|dir| dir.join(program))
        .find(|candidate| candidate.is_file())
}

/// Spawns with piped output. ETXTBSY is retried briefly: a concurrent fork
/// elsewhere in this process can still hold the just-written script open.
async fn spawn_piped(program: &Path, work_dir: &Path) -> io::Result<Child> {
    let mut attempt = 0;
    loop {
        let spawned = Command::new(program)
            .current_dir(work_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn();
        match spawned {
            Err(e)
                if e.raw_os_error() == Some(Errno::ETXTBSY as i32)
                    && attempt < SPAWN_BUSY_RETRIES =>
            {
                attempt += 1;
                tokio::time::sleep(SPAWN_BUSY_BACKOFF).await;
            }
            other => return other,
        }
    }
}

/// Reads `reader` line by line and forwards each line. If the receiver goes
/// away the pipe is still drained so the child never blocks on a full pipe.
async fn pump<R>(reader: R, stream: OutputStream, tx: mpsc::Sender<OutputLine>)
where
    R: AsyncRead + Unpin,
{
    let mut segments = BufReader::new(reader).split(b'\n');
    let mut forwarding = true;
    loop {
        match segments.next_segment().await {
            Ok(Some(bytes)) => {
                if !forwarding {
                    continue;
                }
                let mut text = String::from_utf8_lossy(&bytes).into_owned();
                if text.ends_with('\r') {
                    text.pop();
                }
                if tx.send(OutputLine { stream, text }).await.is_err() {
                    forwarding = false;
                }
            }
            Ok(None) => break,
            Err(e) => {
                tracing::warn!(error = %e, ?stream, "Failed reading subprocess output");
                break;
            }
        }
    }
}

/// SIGINT/SIGTERM listeners for this process, relayed to the child.
struct ForwardedSignals {
    interrupt: UnixSignal,
    terminate: UnixSignal,
}

impl ForwardedSignals {
    fn register() -> io::Result<Self> {
        Ok(Self {
            interrupt: unix_signal(SignalKind::interrupt())?,
            terminate: unix_signal(SignalKind::terminate())?,
        })
    }

    async fn wait(mut self, child: &mut Child) -> io::Result<ExitStatus> {
        loop {
            tokio::select! {
                status = child.wait() => return status,
                Some(()) = self.interrupt.recv() => forward_signal(child, Signal::SIGINT),
                Some(()) = self.terminate.recv() => forward_signal(child, Signal::SIGTERM),
            }
        }
    }
}

fn forward_signal(child: &Child, sig: Signal) {
    let Some(pid) = child.id().and_then(|id| i32::try_from(id).ok()) else {
        return;
    };
    tracing::warn!(pid, signal = sig.as_str(), "Forwarding signal to remote run");
    if let Err(e) = signal::kill(Pid::from_raw(pid), sig) {
        tracing::warn!(pid, error = %e, "Failed to forward signal");
    }
}

/// Killed-by-signal follows the shell convention of `128 + signo`.
fn exit_code_of(status: ExitStatus) -> i32 {
    status
        .code()
        .or_else(|| status.signal().map(|signo| 128 + signo))
        .unwrap_or(-1)
}

// ==============================================================================
// Recording Fake (Tests)
// ==============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedInvocation {
    pub program: PathBuf,
    pub work_dir: PathBuf,
}

/// Records invocations instead of spawning. Emits the scripted lines, then
/// reports the scripted exit code.
pub struct RecordingProcessRunner {
    exit_code: i32,
    lines: Vec<OutputLine>,
    launch_failure: Option<io::ErrorKind>,
    program_missing: bool,
    invocations: Mutex<Vec<RecordedInvocation>>,
}

impl RecordingProcessRunner {
    pub fn exiting_with(exit_code: i32) -> Self {
        Self {
            exit_code,
            lines: Vec::new(),
            launch_failure: None,
            program_missing: false,
            invocations: Mutex::new(Vec::new()),
        }
    }

    pub fn failing_to_launch(kind: io::ErrorKind) -> Self {
        Self {
            launch_failure: Some(kind),
            ..Self::exiting_with(0)
        }
    }

    /// `check_executable` reports every program as not installed.
    pub fn with_missing_program(mut self) -> Self {
        self.program_missing = true;
        self
    }

    pub fn with_line(mut self, stream: OutputStream, text: &str) -> Self {
        self.lines.push(OutputLine {
            stream,
            text: text.to_owned(),
        });
        self
    }

    pub fn invocations(&self) -> Vec<RecordedInvocation> {
        self.invocations
            .lock()
            .map(|calls| calls.clone())
            .unwrap_or_else(|poisoned| poisoned.into_inner().clone())
    }
}

#[async_trait]
impl ProcessRunner for RecordingProcessRunner {
    async fn run(
        &self,
        program: &Path,
        work_dir: &Path,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult> {
        let invocation = RecordedInvocation {
            program: program.to_path_buf(),
            work_dir: work_dir.to_path_buf(),
        };
        match self.invocations.lock() {
            Ok(mut calls) => calls.push(invocation),
            Err(poisoned) => poisoned.into_inner().push(invocation),
        }

        if let Some(kind) = self.launch_failure {
            return Err(VerifyError::Launch {
                program: program.to_path_buf(),
                source: io::Error::from(kind),
            });
        }

        for line in &self.lines {
            // A closed receiver only means nobody is listening.
            let _ = output.send(line.clone()).await;
        }

        Ok(ExecutionResult {
            exit_code: self.exit_code,
            duration: Duration::ZERO,
            started_at: Utc::now(),
        })
    }

    fn check_executable(&self, program: &Path) -> Result<()> {
        if self.program_missing {
            return Err(VerifyError::Launch {
                program: program.to_path_buf(),
                source: io::Error::from(io::ErrorKind::NotFound),
            });
        }
        Ok(())
    }
}
