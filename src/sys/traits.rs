// src/sys/traits.rs

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Component, Path, PathBuf};
use std::time::Duration;
use tokio::sync::mpsc;

use crate::error::{Result, VerifyError};
use crate::sys::secrets::SecretBundle;

// ==============================================================================
// 1. Run Target (Explicit, Immutable)
// ==============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TargetOs {
    Linux,
    Windows,
}

impl TargetOs {
    pub fn parse(tag: &str) -> Result<Self> {
        match tag.trim().to_ascii_lowercase().as_str() {
            "linux" => Ok(Self::Linux),
            "windows" => Ok(Self::Windows),
            other => Err(VerifyError::invalid_target(format!(
                "unknown platform tag '{other}'"
            ))),
        }
    }
}

/// Where the checks come from and where they run.
///
/// `work_dir` is the pipeline-owned scratch directory; every artifact this
/// step writes lives under it. Construction rejects a scratch directory that
/// sits inside the repository checkout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RunTarget {
    repo_path: PathBuf,
    work_dir: PathBuf,
    remote_host: String,
    os: TargetOs,
}

impl RunTarget {
    pub fn new(
        repo_path: impl Into<PathBuf>,
        work_dir: impl Into<PathBuf>,
        remote_host: impl Into<String>,
        os: TargetOs,
    ) -> Result<Self> {
        let repo_path = repo_path.into();
        let work_dir = work_dir.into();

        for (path, what) in [
            (&repo_path, "repository path"),
            (&work_dir, "scratch directory"),
        ] {
            if !path.is_absolute() {
                return Err(VerifyError::invalid_target(format!(
                    "{what} {} is not absolute",
                    path.display()
                )));
            }
            if path.components().any(|c| c == Component::ParentDir) {
                return Err(VerifyError::invalid_target(format!(
                    "{what} {} must not contain '..'",
                    path.display()
                )));
            }
        }

        // 🛡️ Key material must never land inside the checkout, symlinks included.
        let inside = work_dir.starts_with(&repo_path)
            || resolve_existing_prefix(&work_dir)
                .starts_with(resolve_existing_prefix(&repo_path));
        if inside {
            return Err(VerifyError::invalid_target(format!(
                "scratch directory {} lies inside the repository checkout {}",
                work_dir.display(),
                repo_path.display()
            )));
        }

        Ok(Self {
            repo_path,
            work_dir,
            remote_host: remote_host.into(),
            os,
        })
    }

    pub fn repo_path(&self) -> &Path {
        &self.repo_path
    }

    pub fn work_dir(&self) -> &Path {
        &self.work_dir
    }

    pub fn remote_host(&self) -> &str {
        &self.remote_host
    }

    pub fn os(&self) -> TargetOs {
        self.os
    }
}

/// Canonicalizes the longest existing ancestor of `path` and re-appends the
/// rest. `path` is absolute and free of `..`, so the tail is literal.
fn resolve_existing_prefix(path: &Path) -> PathBuf {
    for ancestor in path.ancestors() {
        if let Ok(real) = ancestor.canonicalize() {
            return match path.strip_prefix(ancestor) {
                Ok(rest) if !rest.as_os_str().is_empty() => real.join(rest),
                _ => real,
            };
        }
    }
    path.to_path_buf()
}

// ==============================================================================
// 2. Ephemeral Artifacts
// ==============================================================================

/// A private key that has been written to disk. The bytes themselves are not
/// retained; the in-memory copy is zeroized once the write completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyMaterial {
    pub path: PathBuf,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvocationScript {
    pub path: PathBuf,
    pub command_line: String,
    pub mode: u32,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionResult {
    pub exit_code: i32,
    pub duration: Duration,
    pub started_at: DateTime<Utc>,
}

impl ExecutionResult {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// One line of subprocess output, without its trailing newline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

// ==============================================================================
// 3. Secrets Store (External Collaborator)
// ==============================================================================

#[async_trait]
pub trait SecretStore: Send + Sync {
    /// Returns the named bundle for the current project, or `None` when the
    /// project has no such bundle.
    async fn lookup(&self, bundle: &str) -> Result<Option<SecretBundle>>;
}

// ==============================================================================
// 4. Filesystem Capability (Fail-Closed Permissions)
// ==============================================================================

/// 🛡️ Synchronous on purpose: secret bytes handed to `write_file` must not be
/// held across an `.await`.
pub trait FileSystem: Send + Sync {
    /// Creates `path` and any missing parents with `mode`. Succeeds if the
    /// directory already exists, tightening it to `mode`.
    fn ensure_directory(&self, path: &Path, mode: u32) -> Result<()>;

    /// Replaces `path` with `contents`. The file is never visible with a mode
    /// looser than `mode`.
    fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()>;
}

// ==============================================================================
// 5. Process Execution (Telemetry-Aware)
// ==============================================================================

#[async_trait]
pub trait ProcessRunner: Send + Sync {
    /// Confirms `program` can be launched at all, before any secret is
    /// written. A bare name is looked up on `PATH`.
    fn check_executable(&self, program: &Path) -> Result<()>;

    /// Runs `program` inside `work_dir` and waits for it to exit.
    /// 🛡️ output: every stdout/stderr line is sent as soon as it is read.
    /// A non-zero exit is reported in the result, not as an error.
    async fn run(
        &self,
        program: &Path,
        work_dir: &Path,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult>;
}
