//! Output relay: drains the service's stdout/stderr line by line into
//! `tracing` and a bounded console buffer.
//!
//! Readers never pause on the subprocess; they run until the stream closes.

use std::collections::VecDeque;
use std::io::ErrorKind;
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use regex::Regex;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;

use super::process::OutputPipes;

/// Default maximum number of console lines to keep.
pub const DEFAULT_CONSOLE_LINES: usize = 10_000;

// ─── Console Types ───────────────────────────────────────────

/// A single line of console output.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct LogLine {
    /// Sequential ID for polling
    pub id: u64,
    /// Unix timestamp (seconds)
    pub timestamp: u64,
    pub source: LogSource,
    pub content: String,
    pub level: LogLevel,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogSource {
    Stdout,
    Stderr,
    /// Lifecycle messages from the supervisor itself
    System,
}

impl LogSource {
    pub fn as_str(self) -> &'static str {
        match self {
            LogSource::Stdout => "stdout",
            LogSource::Stderr => "stderr",
            LogSource::System => "system",
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Info,
    Warn,
    Error,
    Debug,
}

// ─── Console Buffer ──────────────────────────────────────────

/// Ring buffer of recent console lines with sequential IDs.
/// IDs start at 1 and keep increasing across service restarts, so
/// `since(0)` returns everything still buffered.
pub struct ConsoleBuffer {
    lines: VecDeque<LogLine>,
    next_id: u64,
    max_size: usize,
}

impl Default for ConsoleBuffer {
    fn default() -> Self {
        Self::with_capacity(DEFAULT_CONSOLE_LINES)
    }
}

impl ConsoleBuffer {
    pub fn with_capacity(max_size: usize) -> Self {
        let max_size = max_size.max(1);
        Self {
            lines: VecDeque::with_capacity(max_size.min(1024)),
            next_id: 1,
            max_size,
        }
    }

    pub fn push(&mut self, source: LogSource, content: String, level: LogLevel) -> LogLine {
        let line = LogLine {
            id: self.next_id,
            timestamp: current_timestamp(),
            source,
            content,
            level,
        };
        self.next_id += 1;

        if self.lines.len() >= self.max_size {
            self.lines.pop_front();
        }
        self.lines.push_back(line.clone());
        line
    }

    /// All lines with id > `since_id`.
    pub fn since(&self, since_id: u64) -> Vec<LogLine> {
        self.lines.iter().filter(|l| l.id > since_id).cloned().collect()
    }

    /// The most recent `count` lines, oldest first.
    pub fn recent(&self, count: usize) -> Vec<LogLine> {
        self.lines.iter().rev().take(count).rev().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.lines.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lines.is_empty()
    }
}

pub type SharedConsole = Arc<Mutex<ConsoleBuffer>>;

// ─── Relay ───────────────────────────────────────────────────

/// Compile the optional level pattern; an invalid one is logged and ignored.
pub fn compile_level_pattern(pattern: Option<&str>) -> Option<Arc<Regex>> {
    pattern.and_then(|pat| match Regex::new(pat) {
        Ok(re) => Some(Arc::new(re)),
        Err(e) => {
            tracing::warn!("Invalid log_pattern '{}': {}, falling back to default", pat, e);
            None
        }
    })
}

/// Start one relay task per available pipe.
pub fn attach(pipes: OutputPipes, pid: u32, console: SharedConsole, pattern: Option<Arc<Regex>>) -> Vec<JoinHandle<()>> {
    let mut handles = Vec::with_capacity(2);
    if let Some(stdout) = pipes.stdout {
        handles.push(spawn_relay(stdout, LogSource::Stdout, pid, console.clone(), pattern.clone()));
    }
    if let Some(stderr) = pipes.stderr {
        handles.push(spawn_relay(stderr, LogSource::Stderr, pid, console, pattern));
    }
    handles
}

/// Drain `reader` line by line until EOF or the stream fails.
///
/// Lines are split on raw bytes and decoded lossily; a non-UTF-8 line must
/// not stop the reader, or the child dies of SIGPIPE on its next write.
pub fn spawn_relay<R>(
    reader: R,
    source: LogSource,
    pid: u32,
    console: SharedConsole,
    pattern: Option<Arc<Regex>>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);
        loop {
            buf.clear();
            match reader.read_until(b'\n', &mut buf).await {
                Ok(0) => break,
                Ok(_) => {
                    let line = decode_line(&buf);
                    let level = parse_log_level(&line, pattern.as_deref());
                    forward(source, pid, level, &line);
                    console.lock().await.push(source, line, level);
                }
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => {
                    tracing::debug!(pid, stream = source.as_str(), "Output relay read error: {}", e);
                    break;
                }
            }
        }
        tracing::trace!(pid, stream = source.as_str(), "Output relay finished");
    })
}

/// Strip the line terminator and replace invalid UTF-8.
fn decode_line(raw: &[u8]) -> String {
    let raw = raw.strip_suffix(b"\n").unwrap_or(raw);
    let raw = raw.strip_suffix(b"\r").unwrap_or(raw);
    String::from_utf8_lossy(raw).into_owned()
}

fn forward(source: LogSource, pid: u32, level: LogLevel, line: &str) {
    let stream = source.as_str();
    match level {
        LogLevel::Error => tracing::error!(target: "llama_sidecar::output", pid, stream, "{}", line),
        LogLevel::Warn => tracing::warn!(target: "llama_sidecar::output", pid, stream, "{}", line),
        LogLevel::Debug => tracing::debug!(target: "llama_sidecar::output", pid, stream, "{}", line),
        LogLevel::Info => tracing::info!(target: "llama_sidecar::output", pid, stream, "{}", line),
    }
}

/// Parse the level of a server log line using an optional pattern with a
/// named `level` group. Without a pattern (or a match) the line is Info.
///
/// Example: `(?P<level>INFO|WARN|ERROR|DEBUG)` or llama.cpp's single-letter
/// `^(?P<level>[IWED]) `.
pub fn parse_log_level(line: &str, pattern: Option<&Regex>) -> LogLevel {
    let Some(caps) = pattern.and_then(|re| re.captures(line)) else {
        return LogLevel::Info;
    };
    match caps.name("level").map(|m| m.as_str().to_uppercase()).as_deref() {
        Some("ERROR" | "FATAL" | "E") => LogLevel::Error,
        Some("WARN" | "WARNING" | "W") => LogLevel::Warn,
        Some("DEBUG" | "TRACE" | "D") => LogLevel::Debug,
        _ => LogLevel::Info,
    }
}

fn current_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}
