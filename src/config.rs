// src/config.rs

use std::env;
use std::path::PathBuf;

use crate::error::{Result, VerifyError};
use crate::sys::invoker::DEFAULT_RUNNER_BINARY;
use crate::sys::traits::{RunTarget, TargetOs};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum LogFormat {
    #[default]
    Pretty,
    Json,
}

impl LogFormat {
    /// Unknown values fall back to human-readable output.
    pub fn parse(value: Option<&str>) -> Self {
        match value.map(|v| v.trim().to_ascii_lowercase()) {
            Some(v) if v == "json" => Self::Json,
            _ => Self::Pretty,
        }
    }

    pub fn from_env() -> Self {
        Self::parse(env::var("DELIVERY_LOG_FORMAT").ok().as_deref())
    }
}

#[derive(Clone, Debug)]
pub struct VerifyConfig {
    // 📂 Pipeline workspace
    pub repo_path: PathBuf,
    pub cache_dir: PathBuf,

    // 🎯 Remote target
    pub remote_host: String,
    pub target_os: TargetOs,
    pub runner_binary: PathBuf,

    // 🛡️ Project secrets (data bag item as JSON)
    pub secrets_file: PathBuf,

    pub log_format: LogFormat,
}

impl VerifyConfig {
    pub fn load() -> Result<Self> {
        Self::from_lookup(|key| env::var(key).ok())
    }

    /// Builds the config from any key lookup, so tests never touch the real
    /// process environment.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let required = |key: &str| {
            lookup(key)
                .filter(|v| !v.trim().is_empty())
                .ok_or_else(|| VerifyError::config(format!("{key} must be set")))
        };

        let repo_path = PathBuf::from(required("DELIVERY_REPO_PATH")?);
        let cache_dir = PathBuf::from(required("DELIVERY_CACHE_DIR")?);
        let remote_host = required("INSPEC_REMOTE_HOST")?.trim().to_owned();
        let secrets_file = PathBuf::from(required("DELIVERY_SECRETS_FILE")?);

        let target_os = TargetOs::parse(
            &lookup("INSPEC_TARGET_OS").unwrap_or_else(|| "linux".to_string()),
        )
        .map_err(|e| VerifyError::config(format!("INSPEC_TARGET_OS: {e}")))?;

        let runner_binary = PathBuf::from(
            lookup("INSPEC_BINARY").unwrap_or_else(|| DEFAULT_RUNNER_BINARY.to_string()),
        );

        let config = Self {
            repo_path,
            cache_dir,
            remote_host,
            target_os,
            runner_binary,
            secrets_file,
            log_format: LogFormat::parse(lookup("DELIVERY_LOG_FORMAT").as_deref()),
        };

        // Path rules are enforced up front rather than mid-run.
        config.run_target()?;
        Ok(config)
    }

    pub fn run_target(&self) -> Result<RunTarget> {
        RunTarget::new(
            self.repo_path.clone(),
            self.cache_dir.clone(),
            self.remote_host.clone(),
            self.target_os,
        )
        .map_err(|e| VerifyError::config(e.to_string()))
    }
}
