use anyhow::Context;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncWriteExt};
use tokio::task::JoinHandle;
use tokio_stream::StreamExt;
use tokio_util::bytes::BytesMut;
use tokio_util::codec::{Decoder, FramedRead};
use tracing::{debug, info, warn};

use crate::error::WardenError;

/// Returned by [`tail`] before any worker has produced a log file
pub const NO_ACTIVE_LOG: &str = "No active log file.";

/// Counters reported once the captured stream has closed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CaptureSummary {
    pub lines: u64,
    pub write_failures: u64,
}

/// Copies one worker lifetime's combined output into its log file.
///
/// The capture task owns the output stream; nothing else reads it. The task
/// ends when the stream reaches end-of-file, which happens once the worker
/// and every descendant holding the pipe have exited.
pub struct LogCapture {
    log_file: PathBuf,
    handle: JoinHandle<CaptureSummary>,
}

impl LogCapture {
    /// `file` is the already-created log at `log_file`
    pub fn spawn<R>(stream: R, file: File, log_file: PathBuf) -> Self
    where
        R: AsyncRead + Unpin + Send + 'static,
    {
        let path = log_file.clone();
        let handle = tokio::spawn(async move { pump(stream, file, &path).await });
        Self { log_file, handle }
    }

    pub fn log_file(&self) -> &Path {
        &self.log_file
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    /// Wait, bounded, for the stream to close and the file to be flushed.
    ///
    /// Returns `None` on timeout; the task keeps draining in the background.
    pub async fn join(self, timeout: Duration) -> Option<CaptureSummary> {
        match tokio::time::timeout(timeout, self.handle).await {
            Ok(Ok(summary)) => Some(summary),
            Ok(Err(e)) => {
                warn!(log_file = %self.log_file.display(), error = %e, "Log capture task failed");
                None
            }
            Err(_) => {
                warn!(
                    log_file = %self.log_file.display(),
                    timeout_ms = timeout.as_millis() as u64,
                    "Log capture did not finish in time; log may be incomplete"
                );
                None
            }
        }
    }
}

async fn pump<R: AsyncRead + Unpin>(stream: R, mut file: File, path: &Path) -> CaptureSummary {
    let mut summary = CaptureSummary::default();

    let mut frames = FramedRead::new(stream, LossyLineDecoder);
    while let Some(frame) = frames.next().await {
        match frame {
            Ok(line) => {
                summary.lines += 1;
                if let Err(e) = write_line(&mut file, &line).await {
                    summary.write_failures += 1;
                    let error = WardenError::LogWriteFailure(format!("{}: {e}", path.display()));
                    warn!(error = %error, "Dropped a line of worker output");
                }
            }
            Err(e) => {
                warn!(log_file = %path.display(), error = %e, "Worker output stream failed");
                break;
            }
        }
    }

    if let Err(e) = file.sync_all().await {
        debug!(log_file = %path.display(), error = %e, "Final log sync failed");
    }

    info!(
        log_file = %path.display(),
        lines = summary.lines,
        "Worker output stream closed"
    );
    summary
}

async fn write_line(file: &mut File, line: &str) -> std::io::Result<()> {
    file.write_all(line.as_bytes()).await?;
    file.flush().await
}

/// Splits a byte stream into newline-terminated lines, substituting invalid
/// UTF-8 sequences with U+FFFD. A trailing line without a newline is emitted
/// at end-of-stream.
struct LossyLineDecoder;

impl Decoder for LossyLineDecoder {
    type Item = String;
    type Error = std::io::Error;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        match src.iter().position(|b| *b == b'\n') {
            Some(pos) => {
                let line = src.split_to(pos + 1);
                Ok(Some(String::from_utf8_lossy(&line).into_owned()))
            }
            None => Ok(None),
        }
    }

    fn decode_eof(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if let Some(line) = self.decode(src)? {
            return Ok(Some(line));
        }
        if src.is_empty() {
            return Ok(None);
        }
        let rest = src.split();
        Ok(Some(String::from_utf8_lossy(&rest).into_owned()))
    }
}

/// Last `lines` lines of `log_file`, or [`NO_ACTIVE_LOG`] when there is none yet
pub async fn tail(log_file: Option<&Path>, lines: usize) -> Result<String, WardenError> {
    let Some(path) = log_file else {
        return Ok(NO_ACTIVE_LOG.to_string());
    };

    let bytes = match tokio::fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(NO_ACTIVE_LOG.to_string());
        }
        Err(e) => {
            return Err(e)
                .with_context(|| format!("Failed to read log file {}", path.display()))
                .map_err(WardenError::from);
        }
    };

    let text = String::from_utf8_lossy(&bytes);
    let all: Vec<&str> = text.split_inclusive('\n').collect();
    let start = all.len().saturating_sub(lines);
    Ok(all[start..].concat())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    fn scratch_file(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("warden-capture-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = std::fs::remove_file(&path);
        path
    }

    #[test]
    fn test_decoder_substitutes_invalid_utf8() {
        let mut decoder = LossyLineDecoder;
        let mut buf = BytesMut::from(&b"ok\nbad \xff\xfe byte\npartial"[..]);

        assert_eq!(decoder.decode(&mut buf).unwrap().as_deref(), Some("ok\n"));
        assert_eq!(
            decoder.decode(&mut buf).unwrap().as_deref(),
            Some("bad \u{FFFD}\u{FFFD} byte\n")
        );
        assert_eq!(decoder.decode(&mut buf).unwrap(), None);
        assert_eq!(
            decoder.decode_eof(&mut buf).unwrap().as_deref(),
            Some("partial")
        );
        assert_eq!(decoder.decode_eof(&mut buf).unwrap(), None);
    }

    #[tokio::test]
    async fn test_capture_writes_every_line_until_stream_closes() {
        let path = scratch_file("every-line.log");
        let (mut writer, reader) = tokio::io::duplex(64);

        let file = File::create(&path).await.unwrap();
        let capture = LogCapture::spawn(reader, file, path.clone());
        writer.write_all(b"first\nsecond\n").await.unwrap();
        writer.write_all(b"third").await.unwrap();
        assert!(!capture.is_finished());
        drop(writer);

        let summary = capture.join(Duration::from_secs(5)).await.unwrap();
        assert_eq!(summary.lines, 3);
        assert_eq!(summary.write_failures, 0);
        assert_eq!(
            std::fs::read_to_string(&path).unwrap(),
            "first\nsecond\nthird"
        );
    }

    #[tokio::test]
    async fn test_join_times_out_while_stream_is_open() {
        let path = scratch_file("still-open.log");
        let (_writer, reader) = tokio::io::duplex(64);

        let file = File::create(&path).await.unwrap();
        let capture = LogCapture::spawn(reader, file, path);
        assert!(capture.join(Duration::from_millis(50)).await.is_none());
    }

    #[tokio::test]
    async fn test_tail_placeholder_and_last_lines() {
        assert_eq!(tail(None, 200).await.unwrap(), NO_ACTIVE_LOG);

        let missing = scratch_file("never-written.log");
        assert_eq!(tail(Some(&missing), 200).await.unwrap(), NO_ACTIVE_LOG);

        let path = scratch_file("tail.log");
        let content: String = (1..=10).map(|i| format!("line {i}\n")).collect();
        std::fs::write(&path, content).unwrap();

        assert_eq!(
            tail(Some(&path), 3).await.unwrap(),
            "line 8\nline 9\nline 10\n"
        );
        assert_eq!(tail(Some(&path), 200).await.unwrap().lines().count(), 10);
    }
}
