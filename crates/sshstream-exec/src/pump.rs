//! Stream pumps moving bytes between session pipes and caller channels
//!
//! Each pump runs on its own tokio task and owns a notification channel
//! with room for a single error. A pump that finishes cleanly just drops
//! its sender; a failing pump sends one error first. Dropping a `Pump`
//! handle aborts its task.

use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

use crate::error::{ExecError, StreamKind};
use crate::transport::{PipeReader, PipeWriter};

/// Handle to a running pump
#[derive(Debug)]
pub struct Pump {
    stream: StreamKind,
    notifier: mpsc::Receiver<ExecError>,
    task: JoinHandle<()>,
}

impl Pump {
    /// Stream this pump is bound to
    #[must_use]
    pub fn stream(&self) -> StreamKind {
        self.stream
    }

    /// Wait for the pump to finish and collect every error it reported
    ///
    /// Blocks until the pump closes its notification channel, which for an
    /// output pump only happens once its pipe reaches end-of-stream.
    pub async fn drain(&mut self) -> Vec<ExecError> {
        let mut errors = Vec::new();
        while let Some(err) = self.notifier.recv().await {
            errors.push(err);
        }
        errors
    }

}

impl Drop for Pump {
    fn drop(&mut self) {
        // no-op for a pump that already finished
        self.task.abort();
    }
}

/// Start forwarding lines from `pipe` to `out`
///
/// Every chunk read is sent, including the empty or partial chunk read at
/// end-of-stream, so the receiver sees an empty string before the channel
/// closes. Chunks that are not valid UTF-8 are still forwarded (with
/// replacement characters), but the pump then reports a stream error.
pub fn spawn_output(stream: StreamKind, pipe: PipeReader, out: mpsc::Sender<String>) -> Pump {
    let (notify_tx, notifier) = mpsc::channel(1);
    let task = tokio::spawn(pump_output(stream, pipe, out, notify_tx));
    debug!(%stream, "output pump started");
    Pump {
        stream,
        notifier,
        task,
    }
}

/// Start writing strings received on `input` into `pipe`
///
/// Finishes when the caller drops its sender or a write fails. The pipe is
/// shut down either way.
pub fn spawn_input(input: mpsc::Receiver<String>, pipe: PipeWriter) -> Pump {
    let (notify_tx, notifier) = mpsc::channel(1);
    let task = tokio::spawn(pump_input(input, pipe, notify_tx));
    debug!(stream = %StreamKind::Stdin, "input pump started");
    Pump {
        stream: StreamKind::Stdin,
        notifier,
        task,
    }
}

async fn pump_output(
    stream: StreamKind,
    pipe: PipeReader,
    out: mpsc::Sender<String>,
    notifier: mpsc::Sender<ExecError>,
) {
    let mut reader = BufReader::new(pipe);
    let mut buf = Vec::new();
    let mut lines = 0usize;
    let mut invalid = None;

    let failure = loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(_) => {
                // read_until only stops short of a delimiter at end-of-stream
                let at_eof = buf.last() != Some(&b'\n');
                let line = decode(stream, &buf, lines, &mut invalid);
                if out.send(line).await.is_err() {
                    break Some(ExecError::stream(stream, "receiver dropped"));
                }
                if at_eof {
                    break None;
                }
                lines += 1;
            }
            Err(e) => {
                if !buf.is_empty() {
                    let _ = out.send(decode(stream, &buf, lines, &mut invalid)).await;
                }
                break Some(ExecError::stream(stream, e));
            }
        }
    };
    // a read failure outranks a decoding failure
    let failure = failure.or(invalid);

    // output channel closes before the notifier
    drop(out);

    match failure {
        Some(err) => {
            warn!(%stream, lines, error = %err, "output pump failed");
            let _ = notifier.send(err).await;
        }
        None => debug!(%stream, lines, "output pump reached end of stream"),
    }
}

/// Convert a chunk to text, remembering the first one that was not UTF-8
fn decode(stream: StreamKind, buf: &[u8], line: usize, invalid: &mut Option<ExecError>) -> String {
    match std::str::from_utf8(buf) {
        Ok(text) => text.to_owned(),
        Err(e) => {
            if invalid.is_none() {
                *invalid = Some(ExecError::stream(
                    stream,
                    format!("line {} is not valid UTF-8: {e}", line + 1),
                ));
            }
            String::from_utf8_lossy(buf).into_owned()
        }
    }
}

async fn pump_input(
    mut input: mpsc::Receiver<String>,
    mut pipe: PipeWriter,
    notifier: mpsc::Sender<ExecError>,
) {
    let mut failure = None;
    let mut written = 0usize;

    while let Some(chunk) = input.recv().await {
        let result = async {
            pipe.write_all(chunk.as_bytes()).await?;
            pipe.flush().await
        }
        .await;
        if let Err(e) = result {
            failure = Some(ExecError::stream(StreamKind::Stdin, e));
            break;
        }
        written += chunk.len();
    }

    if let Err(e) = pipe.shutdown().await {
        debug!(error = %e, "closing stdin pipe failed");
    }
    drop(pipe);

    match failure {
        Some(err) => {
            warn!(written, error = %err, "input pump failed");
            let _ = notifier.send(err).await;
        }
        None => debug!(written, "input pump finished"),
    }
}

#[cfg(test)]
mod tests {
    use std::io;

    use tokio_test::io::Builder;

    use super::*;

    async fn collect(mut rx: mpsc::Receiver<String>) -> Vec<String> {
        let mut lines = Vec::new();
        while let Some(line) = rx.recv().await {
            lines.push(line);
        }
        lines
    }

    #[tokio::test]
    async fn test_output_forwards_lines_then_empty() {
        let pipe = Builder::new().read(b"file1\n").read(b"file2\n").build();
        let (tx, rx) = mpsc::channel(16);

        let mut pump = spawn_output(StreamKind::Stdout, Box::new(pipe), tx);

        assert_eq!(collect(rx).await, vec!["file1\n", "file2\n", ""]);
        assert!(pump.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_output_partial_final_line() {
        let pipe = Builder::new().read(b"one\ntwo").build();
        let (tx, rx) = mpsc::channel(16);

        let mut pump = spawn_output(StreamKind::Stderr, Box::new(pipe), tx);

        assert_eq!(collect(rx).await, vec!["one\n", "two"]);
        assert!(pump.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_output_splits_chunks_into_lines() {
        let pipe = Builder::new().read(b"a\nb").read(b"c\n").build();
        let (tx, rx) = mpsc::channel(16);

        let mut pump = spawn_output(StreamKind::Stdout, Box::new(pipe), tx);

        assert_eq!(collect(rx).await, vec!["a\n", "bc\n", ""]);
        assert!(pump.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_output_invalid_utf8_reported() {
        let pipe = Builder::new().read(b"ok\n").read(b"caf\xe9\n").build();
        let (tx, rx) = mpsc::channel(16);

        let mut pump = spawn_output(StreamKind::Stdout, Box::new(pipe), tx);

        assert_eq!(collect(rx).await, vec!["ok\n", "caf\u{fffd}\n", ""]);
        let errors = pump.drain().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ExecError::Stream { stream: StreamKind::Stdout, message } if message.contains("line 2 is not valid UTF-8")
        ));
    }

    #[tokio::test]
    async fn test_dropping_pump_aborts_task() {
        let (reader, _writer) = tokio::io::duplex(64);
        let (tx, rx) = mpsc::channel(16);

        let pump = spawn_output(StreamKind::Stdout, Box::new(reader), tx);
        drop(pump);

        // the aborted task drops its sender without sending anything
        assert!(collect(rx).await.is_empty());
    }

    #[tokio::test]
    async fn test_output_read_error_reported() {
        let pipe = Builder::new()
            .read(b"file1\n")
            .read_error(io::Error::other("pipe exploded"))
            .build();
        let (tx, rx) = mpsc::channel(16);

        let mut pump = spawn_output(StreamKind::Stdout, Box::new(pipe), tx);

        assert_eq!(collect(rx).await, vec!["file1\n"]);
        let errors = pump.drain().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ExecError::Stream { stream: StreamKind::Stdout, message } if message.contains("pipe exploded")
        ));
    }

    #[tokio::test]
    async fn test_output_receiver_dropped() {
        let pipe = Builder::new().read(b"ignored\n").build();
        let (tx, rx) = mpsc::channel(1);
        drop(rx);

        let mut pump = spawn_output(StreamKind::Stdout, Box::new(pipe), tx);

        let errors = pump.drain().await;
        assert_eq!(errors.len(), 1);
        assert!(errors[0].to_string().contains("receiver dropped"));
    }

    #[tokio::test]
    async fn test_input_writes_in_order() {
        let pipe = Builder::new().write(b"a").write(b"b").build();
        let (tx, rx) = mpsc::channel(4);

        let mut pump = spawn_input(rx, Box::new(pipe));
        tx.send("a".to_string()).await.unwrap();
        tx.send("b".to_string()).await.unwrap();
        drop(tx);

        assert!(pump.drain().await.is_empty());
    }

    #[tokio::test]
    async fn test_input_write_error_reported() {
        let pipe = Builder::new()
            .write_error(io::Error::new(io::ErrorKind::BrokenPipe, "stdin closed"))
            .build();
        let (tx, rx) = mpsc::channel(4);

        let mut pump = spawn_input(rx, Box::new(pipe));
        tx.send("a".to_string()).await.unwrap();

        let errors = pump.drain().await;
        assert_eq!(errors.len(), 1);
        assert!(matches!(
            &errors[0],
            ExecError::Stream { stream: StreamKind::Stdin, message } if message.contains("stdin closed")
        ));
    }
}
