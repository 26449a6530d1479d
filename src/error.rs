// src/error.rs

//! Failure classification for the remote verification step.
//!
//! Every variant aborts the run. `RemoteTestFailure` is the only one that
//! describes a legitimate outcome (the remote checks ran and at least one
//! failed); the rest are configuration or environment defects.

use std::io;
use std::path::PathBuf;
use thiserror::Error;

/// sysexits.h EX_CONFIG
const EXIT_CONFIG: i32 = 78;
/// sysexits.h EX_CANTCREAT
const EXIT_CANT_CREATE: i32 = 73;
/// Shell convention for "command not found / not executable".
const EXIT_LAUNCH: i32 = 127;

#[derive(Error, Debug)]
pub enum VerifyError {
    /// A required secret bundle, or a required field inside it, is absent or empty.
    #[error("{}", describe_missing(.bundle, .field.as_deref()))]
    MissingSecret {
        bundle: String,
        field: Option<String>,
    },

    /// The secrets store itself could not be read or parsed.
    #[error("Secrets store error: {0}")]
    SecretStore(String),

    /// Directory or file creation, write, or permission change failed.
    #[error("Filesystem error at {}: {source}", .path.display())]
    Filesystem {
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote-run subprocess could not be started.
    #[error("Failed to launch {}: {source}", .program.display())]
    Launch {
        program: PathBuf,
        #[source]
        source: io::Error,
    },

    /// The remote test runner ran to completion and reported failure.
    #[error("Remote tests failed with exit code {exit_code}")]
    RemoteTestFailure { exit_code: i32 },

    /// Environment configuration is missing or malformed.
    #[error("Configuration error: {0}")]
    Config(String),

    /// A user, host, path or platform cannot be used to build the remote invocation.
    #[error("Invalid run target: {0}")]
    InvalidTarget(String),
}

pub type Result<T> = std::result::Result<T, VerifyError>;

fn describe_missing(bundle: &str, field: Option<&str>) -> String {
    match field {
        Some(field) => format!(
            "Could not find secret '{field}' in bundle '{bundle}' of the project secrets"
        ),
        None => format!("Could not find secrets for '{bundle}' in the project secrets"),
    }
}

impl VerifyError {
    pub fn missing_bundle(bundle: impl Into<String>) -> Self {
        Self::MissingSecret {
            bundle: bundle.into(),
            field: None,
        }
    }

    pub fn missing_field(bundle: impl Into<String>, field: impl Into<String>) -> Self {
        Self::MissingSecret {
            bundle: bundle.into(),
            field: Some(field.into()),
        }
    }

    pub fn filesystem(path: impl Into<PathBuf>, source: io::Error) -> Self {
        Self::Filesystem {
            path: path.into(),
            source,
        }
    }

    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }

    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::InvalidTarget(msg.into())
    }

    /// Process exit status the pipeline step reports for this failure.
    pub fn exit_code(&self) -> i32 {
        match self {
            Self::RemoteTestFailure { exit_code } => *exit_code,
            Self::Filesystem { .. } => EXIT_CANT_CREATE,
            Self::Launch { .. } => EXIT_LAUNCH,
            Self::MissingSecret { .. }
            | Self::SecretStore(_)
            | Self::Config(_)
            | Self::InvalidTarget(_) => EXIT_CONFIG,
        }
    }
}
