//! Background readers for the companion's output and error streams.
//!
//! One dedicated task owns the output stream end-to-end for the life of
//! the process: it blocks on read, decodes complete lines, and hands each
//! to whichever call is currently awaiting a response. Calls are strictly
//! serialized, so delivery degenerates to a single channel; when the
//! stream closes, the channel closes, which the caller observes as a
//! stream-closed failure.
//!
//! The error stream is drained concurrently into a tail-capped buffer.
//! Draining continuously matters twice over: stderr content is attached to
//! the next reported failure instead of being silently dropped, and the OS
//! pipe buffer can never fill up and stall a chatty companion.

use std::sync::Arc;

use parking_lot::Mutex;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;

/// Keep at most this much of the companion's stderr (the tail).
const STDERR_TAIL_CAP: usize = 16 * 1024;

/// Spawn the output reader task.
///
/// Returns the receiver the caller awaits responses on. The sender is
/// dropped on EOF or read error, closing the channel.
pub(crate) fn spawn_output_reader<R>(output: R) -> (mpsc::UnboundedReceiver<String>, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let (tx, rx) = mpsc::unbounded_channel();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(output).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => {
                    tracing::trace!(len = line.len(), "response line from companion");
                    if tx.send(line).is_err() {
                        // Receiver side torn down first.
                        break;
                    }
                }
                Ok(None) => {
                    tracing::debug!("companion output stream closed");
                    break;
                }
                Err(e) => {
                    tracing::warn!(error = %e, "error reading companion output");
                    break;
                }
            }
        }
    });

    (rx, task)
}

/// Tail-capped accumulator for the companion's error stream.
#[derive(Clone, Debug, Default)]
pub(crate) struct StderrBuffer(Arc<Mutex<String>>);

impl StderrBuffer {
    fn push_line(&self, line: &str) {
        let mut buf = self.0.lock();
        buf.push_str(line);
        buf.push('\n');

        if buf.len() > STDERR_TAIL_CAP {
            let mut cut = buf.len() - STDERR_TAIL_CAP;
            while !buf.is_char_boundary(cut) {
                cut += 1;
            }
            buf.drain(..cut);
        }
    }

    /// Take whatever has accumulated, or `None` if the companion wrote
    /// nothing. Each failure report consumes the buffer.
    pub(crate) fn take(&self) -> Option<String> {
        let mut buf = self.0.lock();
        if buf.is_empty() {
            None
        } else {
            Some(std::mem::take(&mut *buf).trim_end().to_string())
        }
    }
}

/// Spawn the error-stream drain task.
pub(crate) fn spawn_stderr_drain<R>(err: R) -> (StderrBuffer, JoinHandle<()>)
where
    R: AsyncRead + Unpin + Send + 'static,
{
    let buffer = StderrBuffer::default();
    let sink = buffer.clone();

    let task = tokio::spawn(async move {
        let mut lines = BufReader::new(err).lines();
        while let Ok(Some(line)) = lines.next_line().await {
            tracing::debug!(line = %line, "companion stderr");
            sink.push_line(&line);
        }
    });

    (buffer, task)
}
