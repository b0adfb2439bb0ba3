//! Terminal capture: shell history tailing and hook reports
//!
//! ```text
//! ~/.zsh_history ──poll──→ HistoryTail::read_new ──→ parse_history ──┐
//!                                                                    ├─→ Recorder::record_terminal
//! shell hook ──POST /api/terminal/commands──→ HookReport ────────────┘
//! ```
//!
//! The tail starts at the end of the file; history written before boot is
//! not replayed. A file that shrinks (rotation, `history -c`) restarts the
//! tail at its new end.

use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use super::Recorder;
use crate::error::{Error, Result};
use crate::model::{json, TerminalCommand};

/// One command parsed from a history file
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryLine {
    pub command: String,
    pub timestamp: Option<DateTime<Utc>>,
    pub duration_ms: Option<i64>,
}

/// Parse complete history lines. Understands zsh extended history
/// (`: <epoch>:<duration>;<cmd>`, with `\` continuations) and bash
/// `#<epoch>` timestamp comments; anything else is a bare command.
pub fn parse_history(text: &str) -> Vec<HistoryLine> {
    let mut out = Vec::new();
    let mut bash_ts: Option<DateTime<Utc>> = None;
    let mut lines = text.lines();

    while let Some(raw) = lines.next() {
        let mut line = raw.to_string();
        while line.ends_with('\\') {
            line.pop();
            match lines.next() {
                Some(next) => {
                    line.push('\n');
                    line.push_str(next);
                }
                None => break,
            }
        }
        if line.trim().is_empty() {
            continue;
        }

        if let Some(rest) = line.strip_prefix('#') {
            if let Ok(epoch) = rest.trim().parse::<i64>() {
                bash_ts = DateTime::from_timestamp(epoch, 0);
                continue;
            }
        }

        if let Some(parsed) = parse_zsh_extended(&line) {
            out.push(parsed);
            continue;
        }

        out.push(HistoryLine {
            command: line.trim().to_string(),
            timestamp: bash_ts.take(),
            duration_ms: None,
        });
    }
    out
}

fn parse_zsh_extended(line: &str) -> Option<HistoryLine> {
    let rest = line.strip_prefix(": ")?;
    let (meta, command) = rest.split_once(';')?;
    let (epoch, duration) = meta.split_once(':')?;
    let epoch: i64 = epoch.trim().parse().ok()?;
    let duration: i64 = duration.trim().parse().ok()?;
    Some(HistoryLine {
        command: command.trim().to_string(),
        timestamp: DateTime::from_timestamp(epoch, 0),
        duration_ms: Some(duration * 1000),
    })
}

/// Default history file: `$HISTFILE`, then `~/.zsh_history`, then `~/.bash_history`
pub fn default_history_file() -> Option<PathBuf> {
    if let Some(path) = std::env::var_os("HISTFILE").map(PathBuf::from) {
        if path.is_file() {
            return Some(path);
        }
    }
    let home = dirs::home_dir()?;
    [".zsh_history", ".bash_history"]
        .iter()
        .map(|name| home.join(name))
        .find(|p| p.is_file())
}

fn shell_for(path: &Path) -> Option<String> {
    let name = path.file_name()?.to_string_lossy();
    if name.contains("zsh") {
        Some("zsh".to_string())
    } else if name.contains("bash") {
        Some("bash".to_string())
    } else if name.contains("fish") {
        Some("fish".to_string())
    } else {
        None
    }
}

/// Byte-offset tail over a history file
pub struct HistoryTail {
    path: PathBuf,
    offset: u64,
    /// Bytes after the last newline, held until the line completes
    partial: Vec<u8>,
}

impl HistoryTail {
    /// Start at the current end of the file
    pub fn at_end(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let offset = std::fs::metadata(&path)?.len();
        Ok(Self {
            path,
            offset,
            partial: Vec::new(),
        })
    }

    /// Text of complete lines appended since the last call
    pub fn read_new(&mut self) -> Result<String> {
        let len = std::fs::metadata(&self.path)?.len();
        if len < self.offset {
            tracing::debug!(path = %self.path.display(), "history file shrank, restarting tail");
            self.offset = len;
            self.partial.clear();
            return Ok(String::new());
        }
        if len == self.offset {
            return Ok(String::new());
        }
        let mut file = File::open(&self.path)?;
        file.seek(SeekFrom::Start(self.offset))?;
        let mut buf = std::mem::take(&mut self.partial);
        let read = file.take(len - self.offset).read_to_end(&mut buf)?;
        self.offset += read as u64;

        let complete = match buf.iter().rposition(|&b| b == b'\n') {
            Some(pos) => {
                self.partial = buf.split_off(pos + 1);
                buf
            }
            None => {
                self.partial = buf;
                return Ok(String::new());
            }
        };
        // zsh metafies some bytes; keep what decodes
        Ok(String::from_utf8_lossy(&complete).into_owned())
    }
}

fn record_lines(recorder: &Recorder, lines: Vec<HistoryLine>, shell: Option<&str>) -> usize {
    let mut recorded = 0;
    for line in lines {
        let mut cmd = TerminalCommand::new(line.command, "history");
        if let Some(ts) = line.timestamp {
            cmd.timestamp = ts;
        }
        cmd.duration_ms = line.duration_ms;
        cmd.shell = shell.map(str::to_string);
        match recorder.record_terminal(cmd) {
            Ok(_) => recorded += 1,
            Err(e) => tracing::warn!(error = %e, "history command not recorded"),
        }
    }
    recorded
}

/// Poll `path` until cancelled
pub fn spawn_tail(
    recorder: Recorder,
    path: PathBuf,
    poll_interval: Duration,
    cancel: CancellationToken,
) -> Result<JoinHandle<()>> {
    let mut tail = HistoryTail::at_end(&path)?;
    let shell = shell_for(&path);
    tracing::info!(path = %path.display(), "terminal history tail started");
    Ok(tokio::task::spawn_blocking(move || {
        while !cancel.is_cancelled() {
            std::thread::sleep(poll_interval);
            match tail.read_new() {
                Ok(text) if text.is_empty() => {}
                Ok(text) => {
                    let n = record_lines(&recorder, parse_history(&text), shell.as_deref());
                    tracing::trace!(recorded = n, "history lines recorded");
                }
                Err(e) => tracing::debug!(error = %e, "history read failed"),
            }
        }
        tracing::debug!("terminal history tail stopped");
    }))
}

/// Body of `POST /api/terminal/commands`
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct HookReport {
    pub command: String,
    #[serde(alias = "exitCode", deserialize_with = "json::int_opt")]
    pub exit_code: Option<i64>,
    #[serde(alias = "durationMs", alias = "duration", deserialize_with = "json::int_opt")]
    pub duration_ms: Option<i64>,
    pub output: Option<String>,
    pub error: Option<String>,
    pub shell: Option<String>,
    #[serde(alias = "cwd")]
    pub workspace: Option<String>,
    pub session_id: Option<String>,
    #[serde(with = "json::timestamp_opt")]
    pub timestamp: Option<DateTime<Utc>>,
}

impl HookReport {
    pub fn into_command(self) -> Result<TerminalCommand> {
        let command = self.command.trim();
        if command.is_empty() {
            return Err(Error::invalid("command is empty"));
        }
        if self.duration_ms.is_some_and(|d| d < 0) {
            return Err(Error::invalid("duration_ms is negative"));
        }
        let mut cmd = TerminalCommand::new(command, "hook");
        if let Some(ts) = self.timestamp {
            cmd.timestamp = ts;
        }
        cmd.exit_code = self.exit_code;
        cmd.duration_ms = self.duration_ms;
        cmd.output = self.output;
        cmd.error = self.error;
        cmd.shell = self.shell;
        cmd.workspace = self.workspace;
        cmd.session_id = self.session_id;
        Ok(cmd)
    }
}

pub fn record_hook(recorder: &Recorder, report: HookReport) -> Result<(TerminalCommand, u64)> {
    let cmd = report.into_command().inspect_err(|e| {
        tracing::warn!(error = %e, "terminal hook report dropped");
    })?;
    recorder.record_terminal(cmd)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capture::testing;
    use crate::model::MAX_OUTPUT_BYTES;
    use std::io::Write;
    use tempfile::TempDir;

    #[test]
    fn test_parse_zsh_extended() {
        let lines = parse_history(": 1700000000:3;cargo test\n: 1700000010:0;git status\n");
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].command, "cargo test");
        assert_eq!(lines[0].duration_ms, Some(3000));
        assert_eq!(lines[0].timestamp.unwrap().timestamp(), 1_700_000_000);
    }

    #[test]
    fn test_parse_continuation_and_bash_timestamps() {
        let text = ": 1700000000:0;echo a \\\n  && echo b\n#1700000100\nls -la\nplain\n";
        let lines = parse_history(text);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0].command, "echo a \n  && echo b");
        assert_eq!(lines[1].command, "ls -la");
        assert_eq!(lines[1].timestamp.unwrap().timestamp(), 1_700_000_100);
        assert_eq!(lines[2].timestamp, None);
    }

    #[test]
    fn test_tail_reads_only_appended_complete_lines() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join(".zsh_history");
        std::fs::write(&path, ": 1:0;old command\n").unwrap();
        let mut tail = HistoryTail::at_end(&path).unwrap();
        assert_eq!(tail.read_new().unwrap(), "");

        let mut f = std::fs::OpenOptions::new().append(true).open(&path).unwrap();
        write!(f, ": 2:0;new command\n: 3:0;half").unwrap();
        assert_eq!(tail.read_new().unwrap(), ": 2:0;new command\n");
        write!(f, " done\n").unwrap();
        assert_eq!(tail.read_new().unwrap(), ": 3:0;half done\n");

        std::fs::write(&path, "").unwrap();
        assert_eq!(tail.read_new().unwrap(), "");
    }

    #[test]
    fn test_hook_report_truncates_output() {
        let (_db, rec) = testing::recorder();
        let report: HookReport = serde_json::from_value(serde_json::json!({
            "command": "cargo build",
            "exitCode": 101,
            "duration_ms": 5400,
            "cwd": "/w",
            "output": "x".repeat(MAX_OUTPUT_BYTES + 50)
        }))
        .unwrap();
        let (cmd, _) = record_hook(&rec, report).unwrap();
        assert_eq!(cmd.exit_code, Some(101));
        assert_eq!(cmd.workspace.as_deref(), Some("/w"));
        assert_eq!(cmd.output.unwrap().len(), MAX_OUTPUT_BYTES);
        assert_eq!(cmd.source, "hook");
    }

    #[test]
    fn test_hook_report_rejects_empty_command() {
        let (_db, rec) = testing::recorder();
        let err = record_hook(&rec, HookReport::default()).unwrap_err();
        assert!(matches!(err, Error::InvalidInput(_)));
        assert_eq!(rec.queue().latest(), 0);
    }

    #[test]
    fn test_record_lines() {
        let (_db, rec) = testing::recorder();
        let n = record_lines(&rec, parse_history(": 1700000000:2;make\n"), Some("zsh"));
        assert_eq!(n, 1);
        let item = &rec.queue().since(0).events[0];
        assert_eq!(item.item_type, "terminal_command");
    }
}
