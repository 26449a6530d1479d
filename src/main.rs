// src/main.rs

use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

use delivery_inspec::config::LogFormat;
use delivery_inspec::sys::output;
use delivery_inspec::{InspecRun, VerifyConfig, VerifyError};

#[tokio::main]
async fn main() -> ExitCode {
    // ==============================================================================
    // 1. Telemetry
    // ==============================================================================

    // Logs go to stderr; stdout belongs to the remote runner.
    init_tracing(LogFormat::from_env());

    // ==============================================================================
    // 2. Configuration & Wiring
    // ==============================================================================

    let run = match VerifyConfig::load().and_then(|config| InspecRun::from_config(&config)) {
        Ok(run) => run,
        Err(e) => return fail(&e),
    };

    // ==============================================================================
    // 3. Remote Verification (Live Output)
    // ==============================================================================

    let target = run.target();
    tracing::info!(
        repo = %target.repo_path().display(),
        scratch = %target.work_dir().display(),
        os = ?target.os(),
        "🚀 Starting remote verification"
    );

    let (output_tx, output_rx) = output::channel();
    let forwarder = output::spawn_forwarder(output_rx);

    let outcome = run.run(output_tx).await;

    // All senders are gone once `run` returns; wait for the last lines to flush.
    if let Err(e) = forwarder.await {
        tracing::warn!(error = %e, "Output forwarder stopped unexpectedly");
    }

    match outcome {
        Ok(result) => {
            tracing::info!(exit_code = result.exit_code, "✅ Remote verification passed");
            ExitCode::SUCCESS
        }
        Err(e) => fail(&e),
    }
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);

    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Pretty => builder.init(),
    }
}

fn fail(err: &VerifyError) -> ExitCode {
    match err {
        VerifyError::RemoteTestFailure { .. } => {
            tracing::error!(error = %err, "❌ Remote verification failed")
        }
        _ => tracing::error!(error = %err, "Remote verification step aborted"),
    }
    ExitCode::from(u8::try_from(err.exit_code()).unwrap_or(1))
}
