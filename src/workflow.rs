// src/workflow.rs

use std::path::PathBuf;
use tokio::sync::mpsc;
use tracing::Instrument;

use crate::config::VerifyConfig;
use crate::error::Result;
use crate::sys::credentials::CredentialProvisioner;
use crate::sys::fs::LocalFileSystem;
use crate::sys::invoker::RemoteRunInvoker;
use crate::sys::process::SystemProcessRunner;
use crate::sys::secrets::{JsonFileSecretStore, SecretResolver};
use crate::sys::traits::{
    ExecutionResult, FileSystem, OutputLine, ProcessRunner, RunTarget, SecretStore,
};

/// One remote verification run: resolve secrets, write the key, write the
/// script, run it. Each step must succeed before the next one starts.
///
/// Precondition: the surrounding pipeline owns the scratch directory and
/// removes it (key included) once the step is over. Only one run may use a
/// given scratch directory at a time; the script name is fixed per runner.
pub struct InspecRun {
    target: RunTarget,
    runner_binary: PathBuf,
    secret_store: Box<dyn SecretStore>,
    fs: Box<dyn FileSystem>,
    process_runner: Box<dyn ProcessRunner>,
}

impl InspecRun {
    /// Production wiring from environment configuration.
    pub fn from_config(config: &VerifyConfig) -> Result<Self> {
        Ok(Self::new(
            config.run_target()?,
            config.runner_binary.clone(),
            Box::new(JsonFileSecretStore::new(config.secrets_file.clone())),
            Box::new(LocalFileSystem),
            Box::new(SystemProcessRunner),
        ))
    }

    pub fn new(
        target: RunTarget,
        runner_binary: PathBuf,
        secret_store: Box<dyn SecretStore>,
        fs: Box<dyn FileSystem>,
        process_runner: Box<dyn ProcessRunner>,
    ) -> Self {
        Self {
            target,
            runner_binary,
            secret_store,
            fs,
            process_runner,
        }
    }

    pub fn target(&self) -> &RunTarget {
        &self.target
    }

    pub async fn run(&self, output: mpsc::Sender<OutputLine>) -> Result<ExecutionResult> {
        let span = tracing::info_span!("inspec_run", host = %self.target.remote_host());
        self.run_steps(output).instrument(span).await
    }

    async fn run_steps(&self, output: mpsc::Sender<OutputLine>) -> Result<ExecutionResult> {
        // 1. Secrets (no side effects)
        let secrets = SecretResolver::new(self.secret_store.as_ref())
            .resolve_inspec()
            .await?;

        // 2. Target and runner checks (no side effects)
        let invoker = RemoteRunInvoker::new(
            self.fs.as_ref(),
            self.process_runner.as_ref(),
            &self.runner_binary,
        );
        invoker.preflight(&self.target)?;

        // 3. Key material
        let key = CredentialProvisioner::new(self.fs.as_ref())
            .materialize(&secrets, self.target.work_dir())?;

        // 4 + 5. Script, then the remote run itself
        let script = invoker.build_script(&self.target, &key, &secrets.ssh_user)?;
        // The key bytes are on disk; the in-memory copy can go.
        drop(secrets);

        let result = invoker.execute(&self.target, &script, output).await?;
        tracing::info!(
            started_at = %result.started_at.to_rfc3339(),
            duration_ms = result.duration.as_millis() as u64,
            "Remote verification complete"
        );
        Ok(result)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::VerifyError;
    use crate::sys::fs::{MemoryEntry, MemoryFileSystem};
    use crate::sys::process::RecordingProcessRunner;
    use crate::sys::secrets::MemorySecretStore;
    use crate::sys::traits::TargetOs;
    use std::path::Path;
    use std::sync::Arc;

    /// Lets the test keep a handle on a fake that the run owns.
    struct Shared<T>(Arc<T>);

    impl<T: FileSystem> FileSystem for Shared<T> {
        fn ensure_directory(&self, path: &Path, mode: u32) -> Result<()> {
            self.0.ensure_directory(path, mode)
        }
        fn write_file(&self, path: &Path, contents: &[u8], mode: u32) -> Result<()> {
            self.0.write_file(path, contents, mode)
        }
    }

    #[async_trait::async_trait]
    impl<T: ProcessRunner> ProcessRunner for Shared<T> {
        async fn run(
            &self,
            program: &Path,
            work_dir: &Path,
            output: mpsc::Sender<OutputLine>,
        ) -> Result<ExecutionResult> {
            self.0.run(program, work_dir, output).await
        }

        fn check_executable(&self, program: &Path) -> Result<()> {
            self.0.check_executable(program)
        }
    }

    fn store() -> MemorySecretStore {
        MemorySecretStore::new()
            .with_field("inspec", "ssh-user", "deploy")
            .with_field("ec2", "private_key", "-----BEGIN KEY-----")
    }

    type Fixture = (InspecRun, Arc<MemoryFileSystem>, Arc<RecordingProcessRunner>);

    fn build(store: MemorySecretStore, exit_code: i32) -> Fixture {
        build_with(
            store,
            RunTarget::new("/ws/repo", "/cache", "10.0.0.5", TargetOs::Linux).unwrap(),
            RecordingProcessRunner::exiting_with(exit_code),
        )
    }

    fn build_with(
        store: MemorySecretStore,
        target: RunTarget,
        runner: RecordingProcessRunner,
    ) -> Fixture {
        let fs = Arc::new(MemoryFileSystem::new());
        fs.ensure_directory(Path::new("/cache"), 0o700).unwrap();
        let runner = Arc::new(runner);
        let run = InspecRun::new(
            target,
            PathBuf::from("/opt/chefdk/embedded/bin/inspec"),
            Box::new(store),
            Box::new(Shared(fs.clone())),
            Box::new(Shared(runner.clone())),
        );
        (run, fs, runner)
    }

    #[tokio::test]
    async fn runs_every_step_in_order() {
        let (run, fs, runner) = build(store(), 0);
        let (tx, _rx) = mpsc::channel(8);

        let result = run.run(tx).await.unwrap();
        assert_eq!(result.exit_code, 0);

        assert!(matches!(
            fs.entry(Path::new("/cache/.ssh/deploy.pem")),
            Some(MemoryEntry::File { mode: 0o600, .. })
        ));
        let script = fs.entry(Path::new("/cache/inspec.sh"));
        let Some(MemoryEntry::File { mode, contents }) = script else {
            panic!("script missing");
        };
        assert_eq!(mode, 0o700);
        assert_eq!(
            String::from_utf8(contents).unwrap(),
            "#!/bin/sh\nexec /opt/chefdk/embedded/bin/inspec exec /ws/repo/test/recipes/ \
             -t ssh://deploy@10.0.0.5 -i /cache/.ssh/deploy.pem\n"
        );
        assert_eq!(runner.invocations().len(), 1);
        assert_eq!(runner.invocations()[0].work_dir, PathBuf::from("/ws/repo"));
    }

    #[tokio::test]
    async fn missing_secret_aborts_before_any_write_or_launch() {
        let store = MemorySecretStore::new().with_field("inspec", "ssh-user", "deploy");
        let (run, fs, runner) = build(store, 0);
        let (tx, _rx) = mpsc::channel(8);

        let err = run.run(tx).await.unwrap_err();
        assert!(matches!(err, VerifyError::MissingSecret { ref bundle, .. } if bundle == "ec2"));
        assert_eq!(fs.file_count(), 0);
        assert!(fs.entry(Path::new("/cache/.ssh")).is_none());
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn failing_checks_surface_exit_code() {
        let (run, _fs, runner) = build(store(), 2);
        let (tx, _rx) = mpsc::channel(8);

        let err = run.run(tx).await.unwrap_err();
        assert!(matches!(err, VerifyError::RemoteTestFailure { exit_code: 2 }));
        assert_eq!(runner.invocations().len(), 1);
    }

    fn assert_nothing_written(fs: &MemoryFileSystem, runner: &RecordingProcessRunner) {
        assert_eq!(fs.file_count(), 0);
        assert!(fs.entry(Path::new("/cache/.ssh")).is_none());
        assert!(runner.invocations().is_empty());
    }

    #[tokio::test]
    async fn unsupported_targets_are_rejected_before_the_key_is_written() {
        for target in [
            RunTarget::new("/ws/repo", "/cache", "10.0.0.5", TargetOs::Windows).unwrap(),
            RunTarget::new("/ws/repo", "/cache", "-oProxyCommand=x", TargetOs::Linux).unwrap(),
        ] {
            let (run, fs, runner) =
                build_with(store(), target, RecordingProcessRunner::exiting_with(0));
            let (tx, _rx) = mpsc::channel(8);

            let err = run.run(tx).await.unwrap_err();
            assert!(matches!(err, VerifyError::InvalidTarget(_)), "{err}");
            assert_nothing_written(&fs, &runner);
        }
    }

    #[tokio::test]
    async fn missing_runner_is_rejected_before_the_key_is_written() {
        let (run, fs, runner) = build_with(
            store(),
            RunTarget::new("/ws/repo", "/cache", "10.0.0.5", TargetOs::Linux).unwrap(),
            RecordingProcessRunner::exiting_with(0).with_missing_program(),
        );
        let (tx, _rx) = mpsc::channel(8);

        let err = run.run(tx).await.unwrap_err();
        assert!(matches!(err, VerifyError::Launch { .. }));
        assert_eq!(err.exit_code(), 127);
        assert_nothing_written(&fs, &runner);
    }
}
