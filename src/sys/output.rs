// src/sys/output.rs

use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::sys::traits::{OutputLine, OutputStream};

/// Capacity of the channel between the pipe readers and the forwarder.
pub const OUTPUT_CHANNEL_CAPACITY: usize = 256;

pub fn channel() -> (mpsc::Sender<OutputLine>, mpsc::Receiver<OutputLine>) {
    mpsc::channel(OUTPUT_CHANNEL_CAPACITY)
}

/// Writes each line to `out` or `err` as soon as it arrives, flushing after
/// every line. Returns once every sender has been dropped.
pub async fn forward<O, E>(mut rx: mpsc::Receiver<OutputLine>, out: &mut O, err: &mut E)
where
    O: AsyncWrite + Unpin,
    E: AsyncWrite + Unpin,
{
    while let Some(line) = rx.recv().await {
        let written = match line.stream {
            OutputStream::Stdout => write_line(out, &line.text).await,
            OutputStream::Stderr => write_line(err, &line.text).await,
        };
        if let Err(e) = written {
            tracing::warn!(error = %e, stream = ?line.stream, "Failed to forward output line");
        }
    }
}

async fn write_line<W: AsyncWrite + Unpin>(writer: &mut W, text: &str) -> std::io::Result<()> {
    writer.write_all(text.as_bytes()).await?;
    writer.write_all(b"\n").await?;
    writer.flush().await
}

/// Forwards to this process's own stdout and stderr.
pub fn spawn_forwarder(rx: mpsc::Receiver<OutputLine>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        forward(rx, &mut stdout, &mut stderr).await;
    })
}
