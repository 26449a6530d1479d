// src/sys/invoker.rs

use std::path::{Path, PathBuf};
use tokio::sync::mpsc;

use crate::error::{Result, VerifyError};
use crate::sys::identity::{shell_quote, validate_remote_host, validate_ssh_user};
use crate::sys::traits::{
    ExecutionResult, FileSystem, InvocationScript, KeyMaterial, OutputLine, ProcessRunner,
    RunTarget, TargetOs,
};

pub const DEFAULT_RUNNER_BINARY: &str = "/opt/chefdk/embedded/bin/inspec";
pub const RECIPES_DIR: &str = "test/recipes/";
/// rwx------
pub const SCRIPT_MODE: u32 = 0o700;

/// Builds and runs `<runner> exec <repo>/test/recipes/ -t ssh://<user>@<host> -i <key>`.
pub struct RemoteRunInvoker<'a> {
    fs: &'a dyn FileSystem,
    runner: &'a dyn ProcessRunner,
    binary: &'a Path,
}

impl<'a> RemoteRunInvoker<'a> {
    pub fn new(fs: &'a dyn FileSystem, runner: &'a dyn ProcessRunner, binary: &'a Path) -> Self {
        Self { fs, runner, binary }
    }

    /// `<scratch>/<runner>.sh`, e.g. `/cache/inspec.sh`.
    pub fn script_path(&self, target: &RunTarget) -> PathBuf {
        let stem = self
            .binary
            .file_stem()
            .and_then(|s| s.to_str())
            .filter(|s| !s.is_empty())
            .unwrap_or("inspec");
        target.work_dir().join(format!("{stem}.sh"))
    }

    /// Everything about the target and runner that can be checked before the
    /// private key touches disk.
    pub fn preflight(&self, target: &RunTarget) -> Result<()> {
        ensure_linux(target)?;
        validate_remote_host(target.remote_host())?;
        self.runner.check_executable(self.binary)
    }

    /// The exact command the script runs. Pure; values outside the shell-safe
    /// set are single-quoted.
    pub fn command_line(
        &self,
        target: &RunTarget,
        key: &KeyMaterial,
        ssh_user: &str,
    ) -> Result<String> {
        validate_ssh_user(ssh_user)?;
        validate_remote_host(target.remote_host())?;

        let binary = utf8(self.binary, "runner binary")?;
        let repo = utf8(target.repo_path(), "repository path")?.trim_end_matches('/');
        let key_path = utf8(&key.path, "key path")?;

        Ok(format!(
            "{} exec {} -t {} -i {}",
            shell_quote(binary),
            shell_quote(&format!("{repo}/{RECIPES_DIR}")),
            shell_quote(&format!("ssh://{ssh_user}@{}", target.remote_host())),
            shell_quote(key_path),
        ))
    }

    pub fn build_script(
        &self,
        target: &RunTarget,
        key: &KeyMaterial,
        ssh_user: &str,
    ) -> Result<InvocationScript> {
        ensure_linux(target)?;

        let command_line = self.command_line(target, key, ssh_user)?;
        let path = self.script_path(target);
        let body = format!("#!/bin/sh\nexec {command_line}\n");

        self.fs.write_file(&path, body.as_bytes(), SCRIPT_MODE)?;

        // Host and user are sensitive metadata; only the path is logged.
        tracing::info!(path = %path.display(), "Wrote remote run script");
        Ok(InvocationScript {
            path,
            command_line,
            mode: SCRIPT_MODE,
        })
    }

    /// Runs the script from the repository checkout. A non-zero exit is a
    /// `RemoteTestFailure`; it is never retried.
    pub async fn execute(
        &self,
        target: &RunTarget,
        script: &InvocationScript,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult> {
        tracing::info!(
            script = %script.path.display(),
            cwd = %target.repo_path().display(),
            "Starting remote run"
        );
        let result = self
            .runner
            .run(&script.path, target.repo_path(), output)
            .await?;

        if !result.success() {
            tracing::warn!(
                exit_code = result.exit_code,
                duration_ms = result.duration.as_millis() as u64,
                "Remote tests failed"
            );
            return Err(VerifyError::RemoteTestFailure {
                exit_code: result.exit_code,
            });
        }

        tracing::info!(duration_ms = result.duration.as_millis() as u64, "Remote tests passed");
        Ok(result)
    }

    pub async fn build_and_run(
        &self,
        target: &RunTarget,
        key: &KeyMaterial,
        ssh_user: &str,
        output: mpsc::Sender<OutputLine>,
    ) -> Result<ExecutionResult> {
        let script = self.build_script(target, key, ssh_user)?;
        self.execute(target, &script, output).await
    }
}

fn ensure_linux(target: &RunTarget) -> Result<()> {
    if target.os() != TargetOs::Linux {
        return Err(VerifyError::invalid_target(format!(
            "remote runs are only supported for Linux targets, not {:?}",
            target.os()
        )));
    }
    Ok(())
}

fn utf8<'p>(path: &'p Path, what: &str) -> Result<&'p str> {
    path.to_str()
        .ok_or_else(|| VerifyError::invalid_target(format!("{what} is not valid UTF-8")))
}
