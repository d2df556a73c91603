//! Background readers for the emulator's output streams
//!
//! The stdout reader reads one line at a time, strips escape sequences and
//! appends the result to the shared [`OutputBuffer`]. Lines that are not
//! valid UTF-8 are dropped. `\r\n` and lone `\r` both end a line and come
//! out as `\n`.

use std::borrow::Cow;
use std::collections::VecDeque;
use std::io::{self, BufRead, BufReader, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, info, warn};

use super::buffer::OutputBuffer;
use super::filter::strip_escapes;

/// Lines kept by [`StderrTail`]
const TAIL_LINES: usize = 8;

/// Most recent error stream lines, for reporting a failed launch
#[derive(Debug, Clone, Default)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl StderrTail {
    fn push(&self, line: &str) {
        let line = line.trim_end_matches('\n');
        if line.is_empty() {
            return;
        }
        let mut lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        if lines.len() == TAIL_LINES {
            lines.pop_front();
        }
        lines.push_back(line.to_string());
    }

    /// Kept lines joined by newlines
    pub fn text(&self) -> String {
        let lines = self.lines.lock().unwrap_or_else(|p| p.into_inner());
        Vec::from(lines.clone()).join("\n")
    }
}

/// Rewrite `\r\n` and lone `\r` as `\n`
fn normalize_newlines(text: &str) -> Cow<'_, str> {
    if text.contains('\r') {
        Cow::Owned(text.replace("\r\n", "\n").replace('\r', "\n"))
    } else {
        Cow::Borrowed(text)
    }
}

/// Spawn the stdout reader thread
pub fn spawn_output_reader<R>(
    stream: R,
    buffer: Arc<OutputBuffer>,
    idle: Duration,
    running: Arc<AtomicBool>,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        let lines = read_lines(BufReader::new(stream), &buffer, idle);
        running.store(false, Ordering::SeqCst);
        info!("Output stream closed after {} lines", lines);
    })
}

/// Read lines from `reader` into `buffer` until end of stream.
///
/// Returns the number of lines appended.
pub fn read_lines<R: BufRead>(reader: R, buffer: &OutputBuffer, idle: Duration) -> usize {
    for_each_line(reader, idle, |line| buffer.append(line))
}

fn for_each_line<R, F>(mut reader: R, idle: Duration, mut on_line: F) -> usize
where
    R: BufRead,
    F: FnMut(String),
{
    let mut raw = Vec::with_capacity(256);
    let mut appended = 0;

    loop {
        raw.clear();
        match reader.read_until(b'\n', &mut raw) {
            Ok(0) => break,
            Ok(_) => match std::str::from_utf8(&raw) {
                Ok(text) => {
                    for line in normalize_newlines(text).split_inclusive('\n') {
                        on_line(strip_escapes(line));
                        appended += 1;
                    }
                }
                Err(e) => {
                    debug!("Dropped undecodable line ({} bytes): {}", raw.len(), e);
                }
            },
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => {
                warn!("Output read failed: {}", e);
                break;
            }
        }

        if !idle.is_zero() {
            thread::sleep(idle);
        }
    }

    appended
}

/// Spawn a thread that drains stderr into the log
pub fn spawn_stderr_logger<R>(stream: R, tail: StderrTail) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for line in BufReader::new(stream).split(b'\n') {
            match line {
                Ok(bytes) => {
                    let text = String::from_utf8_lossy(&bytes);
                    for part in normalize_newlines(&text).split('\n') {
                        let part = strip_escapes(part);
                        if !part.is_empty() {
                            warn!(target: "emulator_stderr", "{}", part);
                            tail.push(&part);
                        }
                    }
                }
                Err(e) => {
                    debug!("Error stream read failed: {}", e);
                    break;
                }
            }
        }
    })
}

/// Spawn a thread that drains stderr into the output buffer
pub fn spawn_stderr_merger<R>(
    stream: R,
    buffer: Arc<OutputBuffer>,
    tail: StderrTail,
) -> JoinHandle<()>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || {
        for_each_line(BufReader::new(stream), Duration::ZERO, |line| {
            tail.push(&line);
            buffer.append(line);
        });
    })
}
