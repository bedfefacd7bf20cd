//! Collection of the guest's stdout and stderr.

use crate::config::OutputOrder;
use std::collections::VecDeque;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tracing::warn;

const READ_CHUNK: usize = 8192;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stream {
    Stdout,
    Stderr,
}

/// One stream's bytes under a cap: the first `head_cap` bytes and a rolling
/// window over the last `tail_cap` bytes. Everything in between is counted.
#[derive(Debug)]
struct Spool {
    head: Vec<u8>,
    tail: VecDeque<u8>,
    head_cap: usize,
    tail_cap: usize,
    omitted: usize,
}

impl Spool {
    fn new(head_cap: usize, tail_cap: usize) -> Self {
        Self {
            head: Vec::new(),
            tail: VecDeque::new(),
            head_cap,
            tail_cap,
            omitted: 0,
        }
    }

    fn push(&mut self, chunk: &[u8]) {
        let take = self.head_cap.saturating_sub(self.head.len()).min(chunk.len());
        self.head.extend_from_slice(&chunk[..take]);
        let rest = &chunk[take..];
        if rest.is_empty() {
            return;
        }

        if rest.len() >= self.tail_cap {
            self.omitted += self.tail.len() + rest.len() - self.tail_cap;
            self.tail.clear();
            self.tail.extend(&rest[rest.len() - self.tail_cap..]);
        } else {
            self.tail.extend(rest);
            let excess = self.tail.len().saturating_sub(self.tail_cap);
            self.tail.drain(..excess);
            self.omitted += excess;
        }
    }

    fn len(&self) -> usize {
        self.head.len() + self.tail.len()
    }
}

/// Captured bytes of a single execution.
///
/// With a cap, stdout keeps its beginning and stderr keeps its end, so a
/// traceback printed after a flood of output survives truncation.
#[derive(Debug)]
pub struct CaptureBuffer {
    order: OutputOrder,
    limit: Option<usize>,
    stdout: Spool,
    stderr: Spool,
    merged: Spool,
}

impl CaptureBuffer {
    pub fn new(order: OutputOrder, limit: Option<usize>) -> Self {
        let (head, tail) = match limit {
            Some(limit) => (limit, limit),
            None => (usize::MAX, 0),
        };
        let merged = match limit {
            Some(limit) => Spool::new(limit - limit / 2, limit / 2),
            None => Spool::new(usize::MAX, 0),
        };
        Self {
            order,
            limit,
            stdout: Spool::new(head, 0),
            stderr: Spool::new(if limit.is_some() { 0 } else { head }, tail),
            merged,
        }
    }

    fn push(&mut self, stream: Stream, chunk: &[u8]) {
        let target = match (self.order, stream) {
            (OutputOrder::Interleaved, _) => &mut self.merged,
            (OutputOrder::Sequential, Stream::Stdout) => &mut self.stdout,
            (OutputOrder::Sequential, Stream::Stderr) => &mut self.stderr,
        };
        target.push(chunk);
    }

    /// Total bytes currently held
    pub fn len(&self) -> usize {
        self.stdout.len() + self.stderr.len() + self.merged.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Combine into one text, applying the size cap and the truncation marker.
    pub fn into_text(self) -> String {
        match self.order {
            OutputOrder::Interleaved => {
                let Spool {
                    head,
                    tail,
                    omitted,
                    ..
                } = self.merged;
                render(head, omitted, Vec::from(tail))
            }
            OutputOrder::Sequential => {
                let mut omitted = self.stdout.omitted + self.stderr.omitted;
                let mut out = self.stdout.head;
                let mut err = self.stderr.head;
                err.extend(self.stderr.tail);

                if let Some(limit) = self.limit {
                    if out.len() + err.len() > limit {
                        // stderr gets at least half the cap, more if stdout is short
                        let err_keep = err
                            .len()
                            .min(limit.saturating_sub(out.len()).max(limit / 2));
                        let out_keep = limit - err_keep;
                        omitted += out.len().saturating_sub(out_keep) + err.len() - err_keep;
                        out.truncate(out_keep);
                        err.drain(..err.len() - err_keep);
                    }
                }
                render(out, omitted, err)
            }
        }
    }
}

/// `first`, then the truncation marker if anything was dropped, then `last`
fn render(first: Vec<u8>, omitted: usize, last: Vec<u8>) -> String {
    let mut text = String::from_utf8_lossy(&first).into_owned();
    let needs_break = !text.is_empty() && !text.ends_with('\n');
    if omitted > 0 {
        if needs_break {
            text.push('\n');
        }
        text.push_str(&format!(
            "[... output truncated: {omitted} bytes omitted ...]\n"
        ));
    } else if needs_break && !last.is_empty() {
        text.push('\n');
    }
    text.push_str(&String::from_utf8_lossy(&last));
    text
}

/// Background task draining both pipes of a running child
pub struct OutputCapture {
    handle: JoinHandle<CaptureBuffer>,
    stop: oneshot::Sender<()>,
}

impl OutputCapture {
    /// Start draining `stdout` and `stderr` until both reach EOF or `finish` gives up.
    pub fn start<O, E>(stdout: O, stderr: E, order: OutputOrder, limit: Option<usize>) -> Self
    where
        O: AsyncRead + Unpin + Send + 'static,
        E: AsyncRead + Unpin + Send + 'static,
    {
        let (stop, stop_rx) = oneshot::channel();
        let buffer = CaptureBuffer::new(order, limit);
        let handle = tokio::spawn(drain(Some(stdout), Some(stderr), buffer, stop_rx));
        Self { handle, stop }
    }

    /// Wait up to `grace` for the pipes to close, then stop reading and
    /// return whatever was collected.
    pub async fn finish(self, grace: Duration) -> String {
        let OutputCapture { mut handle, stop } = self;

        let joined = match tokio::time::timeout(grace, &mut handle).await {
            Ok(joined) => joined,
            Err(_) => {
                // something outside the process group still holds the pipe
                warn!("[SANDBOX] Output pipes still open after {:?}, stopping capture", grace);
                let _ = stop.send(());
                handle.await
            }
        };

        match joined {
            Ok(buffer) => buffer.into_text(),
            Err(e) => {
                warn!("[SANDBOX] Output capture task failed: {}", e);
                String::new()
            }
        }
    }
}

async fn drain<O, E>(
    mut stdout: Option<O>,
    mut stderr: Option<E>,
    mut buffer: CaptureBuffer,
    mut stop: oneshot::Receiver<()>,
) -> CaptureBuffer
where
    O: AsyncRead + Unpin,
    E: AsyncRead + Unpin,
{
    let mut out_chunk = [0u8; READ_CHUNK];
    let mut err_chunk = [0u8; READ_CHUNK];

    while stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_chunk) => match read {
                Ok(0) | Err(_) => stdout = None,
                Ok(n) => buffer.push(Stream::Stdout, &out_chunk[..n]),
            },
            read = read_some(&mut stderr, &mut err_chunk) => match read {
                Ok(0) | Err(_) => stderr = None,
                Ok(n) => buffer.push(Stream::Stderr, &err_chunk[..n]),
            },
            _ = &mut stop => break,
        }
    }
    buffer
}

async fn read_some<R: AsyncRead + Unpin>(
    reader: &mut Option<R>,
    chunk: &mut [u8],
) -> std::io::Result<usize> {
    match reader {
        Some(r) => r.read(chunk).await,
        None => std::future::pending().await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::AsyncWriteExt;

    #[test]
    fn test_sequential_puts_stdout_first() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Sequential, None);
        buffer.push(Stream::Stderr, b"warning\n");
        buffer.push(Stream::Stdout, b"hello");
        assert_eq!(buffer.into_text(), "hello\nwarning\n");
    }

    #[test]
    fn test_interleaved_keeps_arrival_order() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Interleaved, None);
        buffer.push(Stream::Stdout, b"one\n");
        buffer.push(Stream::Stderr, b"two\n");
        buffer.push(Stream::Stdout, b"three\n");
        assert_eq!(buffer.into_text(), "one\ntwo\nthree\n");
    }

    #[test]
    fn test_truncation_marker() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Sequential, Some(4));
        buffer.push(Stream::Stdout, b"abcdefgh");
        let text = buffer.into_text();
        assert_eq!(text, "abcd\n[... output truncated: 4 bytes omitted ...]\n");
    }

    #[test]
    fn test_truncation_keeps_end_of_stderr() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Sequential, Some(80));
        buffer.push(Stream::Stdout, &[b'x'; 500]);
        buffer.push(Stream::Stderr, b"Traceback (most recent call last):\n");
        buffer.push(Stream::Stderr, b"ValueError: column price missing\n");
        let text = buffer.into_text();

        assert!(text.starts_with("xxxx"));
        assert!(text.contains("[... output truncated:"));
        assert!(text.ends_with("ValueError: column price missing\n"), "{text}");
    }

    #[test]
    fn test_short_stdout_leaves_room_for_stderr() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Sequential, Some(10));
        buffer.push(Stream::Stdout, b"ok\n");
        buffer.push(Stream::Stderr, b"0123456789");
        let text = buffer.into_text();
        assert!(text.starts_with("ok\n[... output truncated: 3 bytes omitted ...]\n"));
        assert!(text.ends_with("3456789"));
    }

    #[test]
    fn test_interleaved_truncation_keeps_head_and_tail() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Interleaved, Some(8));
        buffer.push(Stream::Stdout, b"head");
        buffer.push(Stream::Stdout, &[b'.'; 100]);
        buffer.push(Stream::Stderr, b"boom");
        assert_eq!(
            buffer.into_text(),
            "head\n[... output truncated: 100 bytes omitted ...]\nboom"
        );
    }

    #[test]
    fn test_invalid_utf8_is_replaced() {
        let mut buffer = CaptureBuffer::new(OutputOrder::Sequential, None);
        buffer.push(Stream::Stdout, &[b'o', b'k', 0xff]);
        assert_eq!(buffer.into_text(), "ok\u{fffd}");
    }

    #[tokio::test]
    async fn test_capture_reads_until_eof() {
        let capture = OutputCapture::start(
            &b"out\n"[..],
            &b"err\n"[..],
            OutputOrder::Sequential,
            None,
        );
        let text = capture.finish(Duration::from_secs(1)).await;
        assert_eq!(text, "out\nerr\n");
    }

    #[tokio::test]
    async fn test_capture_keeps_partial_output_when_pipe_stays_open() {
        let (mut writer, reader) = tokio::io::duplex(64);
        let capture =
            OutputCapture::start(reader, tokio::io::empty(), OutputOrder::Sequential, None);

        writer.write_all(b"partial").await.unwrap();
        writer.flush().await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;

        // writer is still alive, so only the grace period ends the capture
        let text = capture.finish(Duration::from_millis(100)).await;
        assert_eq!(text, "partial");
        drop(writer);
    }
}
