// Log Router
// Line-buffers FFmpeg diagnostic output, classifies it, and forwards it

use std::collections::VecDeque;
use std::process::ExitStatus;
use std::sync::{Arc, Mutex, OnceLock};
use regex::Regex;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncRead, BufReader};
use tokio::task::JoinHandle;

use crate::services::events::{LogSeverity, PipelineEventSink};
use crate::services::launch_args::redact_arg;

/// Lines kept per process for exit diagnostics
pub const TAIL_CAPACITY: usize = 40;

/// Longest line forwarded; the rest of an overlong line is dropped
const MAX_LINE_BYTES: usize = 8 * 1024;

const FAILURE_KEYWORDS: &[&str] = &[
    "error",
    "failed",
    "invalid",
    "could not",
    "unable to",
    "connection refused",
    "broken pipe",
    "no such file",
    "not found",
];

fn progress_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^\s*(frame=\s*\d+|size=\s*\S+\s+time=|.*\btime=\d+:\d+:\d+.*\bbitrate=.*\bspeed=)")
            .unwrap_or_else(|e| panic!("progress pattern is invalid: {e}"))
    })
}

/// Severity for one line of FFmpeg output
pub fn classify_line(line: &str) -> LogSeverity {
    if progress_pattern().is_match(line) {
        return LogSeverity::Debug;
    }
    let lower = line.to_ascii_lowercase();
    if FAILURE_KEYWORDS.iter().any(|kw| lower.contains(kw)) {
        LogSeverity::Error
    } else {
        LogSeverity::Info
    }
}

/// Rolling buffer of the most recent non-progress output lines
#[derive(Clone, Default)]
pub struct OutputTail {
    lines: Arc<Mutex<VecDeque<String>>>,
}

impl OutputTail {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&self, line: String) {
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == TAIL_CAPACITY {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    pub fn snapshot(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }
}

/// Friendly explanation for the most recent recognizable failure line
pub fn exit_hint(lines: &[String]) -> Option<String> {
    for line in lines.iter().rev() {
        if line.contains("error code: -5") || line.contains("code -5") || line.contains("Input/output error") {
            return Some("I/O error (-5 - EIO): network connection lost".to_string());
        }
        if line.contains("Connection refused") {
            return Some("Server refused connection".to_string());
        }
        if line.contains("Connection timed out") {
            return Some("Connection timed out".to_string());
        }
        if line.contains("Connection reset by peer") {
            return Some("Connection reset by remote server".to_string());
        }
        if line.contains("error muxing packet") || line.contains("Broken pipe") {
            return Some("Failed to send packet to server (possible network issue)".to_string());
        }
        if line.contains("No such file or directory") {
            return Some("Input file or stream not found".to_string());
        }
        if line.contains("Server returned 4") {
            return Some("Audio source rejected the request".to_string());
        }
        if line.contains("No such filter") {
            return Some("FFmpeg build is missing a required filter".to_string());
        }
    }
    None
}

/// Exit reason recorded as the pipeline's last error
pub fn describe_exit(tag: &str, status: &std::io::Result<ExitStatus>, tail: &[String]) -> String {
    let base = match status {
        Ok(status) => match status.code() {
            Some(code) => format!("{tag} exited with code {code}"),
            None => {
                #[cfg(unix)]
                {
                    use std::os::unix::process::ExitStatusExt;
                    match status.signal() {
                        Some(signal) => format!("{tag} terminated by signal {signal}"),
                        None => format!("{tag} exited"),
                    }
                }
                #[cfg(not(unix))]
                {
                    format!("{tag} exited")
                }
            }
        },
        Err(e) => format!("Failed to wait for {tag}: {e}"),
    };

    match exit_hint(tail) {
        Some(hint) => format!("{base}: {hint}"),
        None => base,
    }
}

/// Read the next `\n`- or `\r`-terminated line
///
/// FFmpeg rewrites its progress line with `\r`, so both terminators end a line.
async fn next_line<R: AsyncBufRead + Unpin>(reader: &mut R, buf: &mut Vec<u8>) -> std::io::Result<Option<String>> {
    buf.clear();
    loop {
        let available = reader.fill_buf().await?;
        if available.is_empty() {
            if buf.is_empty() {
                return Ok(None);
            }
            return Ok(Some(String::from_utf8_lossy(buf).into_owned()));
        }

        match available.iter().position(|b| *b == b'\n' || *b == b'\r') {
            Some(pos) => {
                let room = MAX_LINE_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&available[..pos.min(room)]);
                reader.consume(pos + 1);
                if buf.is_empty() {
                    // "\r\n" or blank line
                    continue;
                }
                return Ok(Some(String::from_utf8_lossy(buf).into_owned()));
            }
            None => {
                let len = available.len();
                let room = MAX_LINE_BYTES.saturating_sub(buf.len());
                buf.extend_from_slice(&available[..len.min(room)]);
                reader.consume(len);
            }
        }
    }
}

/// Forward one output stream until EOF
pub fn spawn_output_pump<R>(
    reader: R,
    station_id: String,
    source_tag: &'static str,
    tail: OutputTail,
    events: Arc<dyn PipelineEventSink>,
) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut reader = BufReader::new(reader);
        let mut buf = Vec::with_capacity(256);

        loop {
            let line = match next_line(&mut reader, &mut buf).await {
                Ok(Some(line)) => line,
                Ok(None) => break,
                Err(e) => {
                    log::debug!("[{station_id}] {source_tag} output closed: {e}");
                    break;
                }
            };

            let line = redact_arg(line.trim_end());
            if line.trim().is_empty() {
                continue;
            }

            let severity = classify_line(&line);
            match severity {
                LogSeverity::Debug => log::trace!(target: "pipeline", "[{station_id}] {source_tag}: {line}"),
                LogSeverity::Error => {
                    log::error!(target: "pipeline", "[{station_id}] {source_tag}: {line}");
                    tail.push(line.clone());
                }
                _ => {
                    log::debug!(target: "pipeline", "[{station_id}] {source_tag}: {line}");
                    tail.push(line.clone());
                }
            }
            events.on_log(&station_id, severity, source_tag, &line);
        }
    })
}
