//! Background readers that turn the worker's output pipes into lines

use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use super::diagnostics::{DiagnosticBuffer, PushOutcome};

/// Which worker pipe a reader is attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamSource {
    Stdout,
    Stderr,
}

impl StreamSource {
    pub fn name(self) -> &'static str {
        match self {
            StreamSource::Stdout => "stdout",
            StreamSource::Stderr => "stderr",
        }
    }
}

/// Destination for decoded lines. Each implementation carries its own
/// overflow policy.
pub trait LineSink: Send + 'static {
    fn push_line(&mut self, line: String) -> PushOutcome;
}

/// Primary (response) queue: never evicts, drops the newest line when full.
pub struct ResponseQueue {
    sender: mpsc::Sender<String>,
}

impl ResponseQueue {
    pub fn new(sender: mpsc::Sender<String>) -> Self {
        Self { sender }
    }
}

impl LineSink for ResponseQueue {
    fn push_line(&mut self, line: String) -> PushOutcome {
        match self.sender.try_send(line) {
            Ok(()) => PushOutcome::Queued,
            Err(mpsc::error::TrySendError::Full(line)) => {
                tracing::warn!(
                    "Worker response queue overflow, discarding message: {}",
                    preview(&line)
                );
                PushOutcome::DroppedNewest
            }
            Err(mpsc::error::TrySendError::Closed(_)) => PushOutcome::Closed,
        }
    }
}

impl LineSink for DiagnosticBuffer {
    fn push_line(&mut self, line: String) -> PushOutcome {
        self.push(line)
    }
}

/// Decode one raw line: lossy UTF-8, trailing whitespace removed.
/// Returns `None` for lines that are empty after trimming.
pub fn decode_line(raw: &[u8]) -> Option<String> {
    let decoded = String::from_utf8_lossy(raw);
    let trimmed = decoded.trim_end();
    if trimmed.is_empty() {
        None
    } else {
        Some(trimmed.to_string())
    }
}

/// First 100 characters of a line, for log messages.
pub fn preview(line: &str) -> String {
    match line.char_indices().nth(100) {
        Some((cut, _)) => format!("{}...", &line[..cut]),
        None => line.to_string(),
    }
}

/// Read `stream` to end-of-stream, pushing every non-empty line into `sink`.
///
/// Read errors are logged and end the reader like end-of-stream does.
/// Returns the number of lines handed to the sink.
pub async fn read_lines<R, S>(stream: R, source: StreamSource, mut sink: S) -> usize
where
    R: AsyncRead + Unpin,
    S: LineSink,
{
    let mut reader = BufReader::new(stream);
    let mut buf = Vec::new();
    let mut forwarded = 0;

    loop {
        buf.clear();
        match reader.read_until(b'\n', &mut buf).await {
            Ok(0) => break,
            Ok(_) => {
                let Some(line) = decode_line(&buf) else {
                    continue;
                };
                tracing::debug!("Worker {}: {}", source.name(), line);
                forwarded += 1;
                if sink.push_line(line) == PushOutcome::Closed {
                    tracing::debug!(
                        "Consumer for worker {} is gone, stopping reader",
                        source.name()
                    );
                    break;
                }
            }
            Err(e) => {
                tracing::error!("Error in reader for worker {}: {}", source.name(), e);
                break;
            }
        }
    }

    tracing::info!("Reader for worker {} finished", source.name());
    forwarded
}

/// Run [`read_lines`] on its own task. The task ends by itself when the
/// pipe reports end-of-stream.
pub fn spawn_reader<R, S>(stream: R, source: StreamSource, sink: S) -> JoinHandle<usize>
where
    R: AsyncRead + Unpin + Send + 'static,
    S: LineSink,
{
    tokio::spawn(read_lines(stream, source, sink))
}
