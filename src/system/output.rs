// src/system/output.rs

//! Concurrent, line-buffered capture of a child's stdout and stderr.
//!
//! Each stream gets its own reader task. Every decoded line is appended to the stream's
//! buffer and to the merged buffer under one lock, which gives arrival order within a stream
//! and best-effort order across streams. Lines can additionally be forwarded to a
//! subscriber channel for live display.

use crate::models::{OutputEncoding, OutputSnapshot};
use regex::Regex;
use std::borrow::Cow;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc::UnboundedSender;
use tokio::task::JoinHandle;

/// Which pipe a line came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    /// The child's standard output.
    Stdout,
    /// The child's standard error.
    Stderr,
}

/// One line delivered to a subscriber, without its line terminator.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub text: String,
}

/// Receiving end for live output.
pub type OutputSubscriber = UnboundedSender<OutputLine>;

/// The three growable buffers of one process.
#[derive(Debug, Default)]
pub struct OutputBuffers {
    pub stdout: String,
    pub stderr: String,
    pub merged: String,
}

impl OutputBuffers {
    /// Appends one decoded line to its stream and to the merged buffer.
    pub fn push_line(&mut self, stream: OutputStream, line: &str, terminated: bool) {
        let target = match stream {
            OutputStream::Stdout => &mut self.stdout,
            OutputStream::Stderr => &mut self.stderr,
        };
        target.push_str(line);
        self.merged.push_str(line);
        if terminated {
            target.push('\n');
            self.merged.push('\n');
        }
    }

    /// Copies the three buffers.
    pub fn snapshot(&self) -> OutputSnapshot {
        OutputSnapshot {
            stdout: self.stdout.clone(),
            stderr: self.stderr.clone(),
            merged: self.merged.clone(),
        }
    }

    pub fn clear(&mut self) {
        self.stdout.clear();
        self.stderr.clear();
        self.merged.clear();
    }

    /// Moves the contents out, leaving the buffers empty.
    pub fn take(&mut self) -> OutputSnapshot {
        OutputSnapshot {
            stdout: std::mem::take(&mut self.stdout),
            stderr: std::mem::take(&mut self.stderr),
            merged: std::mem::take(&mut self.merged),
        }
    }
}

/// Buffers shared between reader tasks and whoever consumes the output.
#[derive(Debug, Default, Clone)]
pub struct SharedBuffers(Arc<Mutex<OutputBuffers>>);

impl SharedBuffers {
    pub fn new() -> Self {
        Self::default()
    }

    /// Locks the buffers. A reader that panicked mid-append leaves them usable.
    pub fn lock(&self) -> MutexGuard<'_, OutputBuffers> {
        self.0.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Copies the buffers without clearing them.
    pub fn snapshot(&self) -> OutputSnapshot {
        self.lock().snapshot()
    }

    /// Reads the buffers and, if `clear` is set, truncates them under the same lock.
    pub fn read(&self, clear: bool) -> OutputSnapshot {
        let mut buffers = self.lock();
        if clear {
            buffers.take()
        } else {
            buffers.snapshot()
        }
    }

    /// Drops everything captured so far.
    pub fn clear(&self) {
        self.lock().clear();
    }
}

/// Options shared by both readers of one process.
#[derive(Debug, Clone, Default)]
pub struct ReaderOptions {
    pub encoding: OutputEncoding,
    pub subscriber: Option<OutputSubscriber>,
    /// Lines matching this pattern are buffered but never forwarded to the subscriber.
    pub hidden: Option<Regex>,
}

/// Spawns a task that reads `reader` line by line until EOF.
pub fn spawn_reader<R>(
    reader: R,
    stream: OutputStream,
    buffers: SharedBuffers,
    options: ReaderOptions,
) -> JoinHandle<std::io::Result<()>>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut raw = Vec::with_capacity(256);
        loop {
            raw.clear();
            let read = reader.read_until(b'\n', &mut raw).await?;
            if read == 0 {
                return Ok(());
            }

            let terminated = raw.last() == Some(&b'\n');
            let mut line = options.encoding.decode(&raw);
            while line.ends_with(['\n', '\r']) {
                line.pop();
            }

            buffers.lock().push_line(stream, &line, terminated);

            if let Some(subscriber) = &options.subscriber {
                let hidden = options.hidden.as_ref().is_some_and(|re| re.is_match(&line));
                if !hidden {
                    // A dropped receiver only ends live streaming, not capture.
                    let _ = subscriber.send(OutputLine {
                        stream,
                        text: line,
                    });
                }
            }
        }
    })
}

/// Handles of the two reader tasks of one process.
#[derive(Debug)]
pub struct CaptureHandles {
    pub stdout: Option<JoinHandle<std::io::Result<()>>>,
    pub stderr: Option<JoinHandle<std::io::Result<()>>>,
}

impl CaptureHandles {
    /// Waits up to `limit` for both readers to reach EOF, then aborts whatever is left.
    ///
    /// Pipes inherited by grandchildren can stay open after the child exits; the limit
    /// keeps such processes from hanging the caller. Returns false if a reader was aborted.
    pub async fn drain(self, limit: std::time::Duration) -> bool {
        let mut complete = true;
        for handle in [self.stdout, self.stderr].into_iter().flatten() {
            let abort = handle.abort_handle();
            match tokio::time::timeout(limit, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => log::warn!("Output reader failed: {}", e),
                Ok(Err(e)) if e.is_cancelled() => {}
                Ok(Err(e)) => log::warn!("Output reader task panicked: {}", e),
                Err(_) => {
                    log::debug!("Output reader still open after {:?}, aborting.", limit);
                    abort.abort();
                    complete = false;
                }
            }
        }
        complete
    }

    /// Aborts both readers immediately.
    pub fn abort(&self) {
        for handle in [&self.stdout, &self.stderr].into_iter().flatten() {
            handle.abort();
        }
    }
}

/// Attaches readers to whichever of the child's pipes are present.
pub fn capture_child(
    child: &mut tokio::process::Child,
    buffers: &SharedBuffers,
    options: &ReaderOptions,
) -> CaptureHandles {
    CaptureHandles {
        stdout: child.stdout.take().map(|out| {
            spawn_reader(out, OutputStream::Stdout, buffers.clone(), options.clone())
        }),
        stderr: child.stderr.take().map(|err| {
            spawn_reader(err, OutputStream::Stderr, buffers.clone(), options.clone())
        }),
    }
}

/// Removes protocol lines matching `marker` from `text`.
///
/// A marker line is removed entirely unless it carries other content in front of the marker,
/// in which case only the marker and its exit code are cut. With `drop_separator`, the empty
/// line each wrapper prints right before its marker is removed too. Every other line keeps
/// its relative order.
pub fn strip_marker_lines(text: &str, marker: &Regex, drop_separator: bool) -> String {
    let mut kept: Vec<Cow<'_, str>> = Vec::new();

    for line in text.lines() {
        let Some(found) = marker.find(line) else {
            kept.push(Cow::Borrowed(line));
            continue;
        };
        if drop_separator && kept.last().is_some_and(|l| l.trim_end_matches('\r').is_empty()) {
            kept.pop();
        }
        let before = line.get(..found.start()).unwrap_or_default();
        let after = line.get(found.end()..).unwrap_or_default().trim();
        if !before.is_empty() || !after.is_empty() {
            kept.push(Cow::Owned(format!("{}{}", before, after)));
        }
    }

    let mut out = kept.join("\n");
    if text.ends_with('\n') && !kept.is_empty() {
        out.push('\n');
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::system::dialect::marker_regex;

    #[test]
    fn test_strip_removes_exactly_marker_lines_in_order() {
        let re = marker_regex("__M__");
        let text = "a\n__M__0\nb\nc\n__M__ 12\nd\n__M__-1\n";
        let stripped = strip_marker_lines(text, &re, false);
        assert_eq!(stripped, "a\nb\nc\nd\n");
        assert_eq!(stripped.lines().count(), text.lines().count() - 3);
    }

    #[test]
    fn test_strip_keeps_content_before_marker() {
        let re = marker_regex("__M__");
        assert_eq!(strip_marker_lines("partial__M__3\n", &re, false), "partial\n");
    }

    #[test]
    fn test_strip_drops_only_the_injected_separator() {
        let re = marker_regex("__M__");
        // Output "hello\n" + separator + marker.
        assert_eq!(strip_marker_lines("hello\n\n__M__0\n", &re, true), "hello\n");
        // Output that itself ends with a blank line keeps it.
        assert_eq!(strip_marker_lines("hello\n\n\n__M__0\n", &re, true), "hello\n\n");
        // Unterminated output was completed by the separator newline.
        assert_eq!(strip_marker_lines("hi\n__M__0\n", &re, true), "hi\n");
        // Nothing but protocol.
        assert_eq!(strip_marker_lines("\n__M__0\n", &re, true), "");
    }

    #[test]
    fn test_read_with_clear_truncates_atomically() {
        let buffers = SharedBuffers::new();
        buffers.lock().push_line(OutputStream::Stdout, "one", true);
        buffers.lock().push_line(OutputStream::Stderr, "two", true);

        let first = buffers.read(true);
        assert_eq!(first.stdout, "one\n");
        assert_eq!(first.stderr, "two\n");
        assert_eq!(first.merged, "one\ntwo\n");
        assert_eq!(buffers.read(false), OutputSnapshot::default());
    }

    #[tokio::test]
    async fn test_reader_buffers_and_forwards_visible_lines() {
        let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
        let buffers = SharedBuffers::new();
        let options = ReaderOptions {
            encoding: OutputEncoding::Utf8,
            subscriber: Some(tx),
            hidden: Some(marker_regex("__M__")),
        };
        let input: &[u8] = b"first\r\nsecond\n__M__0\ntail";

        spawn_reader(input, OutputStream::Stdout, buffers.clone(), options)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(buffers.snapshot().stdout, "first\nsecond\n__M__0\ntail");
        let mut forwarded = Vec::new();
        while let Ok(line) = rx.try_recv() {
            forwarded.push(line.text);
        }
        assert_eq!(forwarded, vec!["first", "second", "tail"]);
    }
}
