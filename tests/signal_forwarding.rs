// tests/signal_forwarding.rs

// Kept in its own test binary: it signals the whole test process.

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::time::Duration;

use delivery_inspec::sys::process::SystemProcessRunner;
use delivery_inspec::sys::traits::{OutputStream, ProcessRunner};
use nix::sys::signal::{Signal, raise};
use tokio::sync::mpsc;

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn sigterm_is_forwarded_to_the_remote_run() {
    let dir = tempfile::tempdir().unwrap();
    let program = dir.path().join("inspec.sh");
    fs::write(
        &program,
        "#!/bin/sh\ntrap 'exit 42' TERM\necho ready\nwhile true; do sleep 0.1; done\n",
    )
    .unwrap();
    fs::set_permissions(&program, fs::Permissions::from_mode(0o700)).unwrap();

    let (tx, mut rx) = mpsc::channel(8);
    let handle = tokio::spawn({
        let program = program.clone();
        let work_dir = dir.path().to_path_buf();
        async move { SystemProcessRunner.run(&program, &work_dir, tx).await }
    });

    // The trap is installed once the script has printed.
    let ready = tokio::time::timeout(Duration::from_secs(10), rx.recv())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(ready.stream, OutputStream::Stdout);
    assert_eq!(ready.text, "ready");

    raise(Signal::SIGTERM).unwrap();

    let result = tokio::time::timeout(Duration::from_secs(10), handle)
        .await
        .expect("remote run did not stop after SIGTERM")
        .unwrap()
        .unwrap();
    assert_eq!(result.exit_code, 42);
}
