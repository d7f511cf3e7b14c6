use std::io::{self, IsTerminal, Write};

use crossterm::style::Stylize;
use serde::Serialize;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::filter::LevelFilter;

use crate::app::{EventKind, ProgressEvent, ProgressSink, RunResult, StatusResult};
use crate::checkpoint::CheckpointState;

/// Log filter for the binary. Warnings are shown unless `directives`
/// (normally `RUST_LOG`) says otherwise.
pub fn log_filter(directives: &str) -> EnvFilter {
    EnvFilter::builder()
        .with_default_directive(LevelFilter::WARN.into())
        .parse_lossy(directives)
}

#[derive(Debug, Clone, Copy)]
pub enum OutputMode {
    Console,
    Json,
}

/// Machine-readable output: progress is suppressed, the final result is one JSON document.
pub struct JsonOutput;

impl JsonOutput {
    pub fn print_run(result: &RunResult) -> io::Result<()> {
        Self::print_json(result)
    }

    pub fn print_status(result: &StatusResult) -> io::Result<()> {
        Self::print_json(result)
    }

    fn print_json<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Line-oriented console output. Colors are used only when stdout is a terminal.
pub struct ConsoleOutput {
    color: bool,
}

impl Default for ConsoleOutput {
    fn default() -> Self {
        Self::new()
    }
}

impl ConsoleOutput {
    pub fn new() -> Self {
        Self {
            color: io::stdout().is_terminal(),
        }
    }

    pub fn plain() -> Self {
        Self { color: false }
    }

    pub fn format_event(&self, event: &ProgressEvent) -> String {
        let elapsed = event
            .elapsed
            .map(|value| format!(" ({:.1}s)", value.as_secs_f64()))
            .unwrap_or_default();
        match event.kind {
            EventKind::Success => {
                let tag = self.paint("[SUCCESS]", Tone::Good);
                format!("{tag} {}{elapsed}", event.message)
            }
            EventKind::Failure => {
                let tag = self.paint("[FAILURE]", Tone::Bad);
                format!("{tag} {}{elapsed}", event.message)
            }
            EventKind::Phase => self.paint(&format!("==> {}", event.message), Tone::Accent),
            EventKind::Info => format!("    {}", event.message),
        }
    }

    pub fn format_run(&self, result: &RunResult) -> Vec<String> {
        let mut lines = vec![self.paint("earthdata-sync summary", Tone::Accent)];
        lines.push(format!("collection: {}", result.collection));
        lines.push(format!("window:     {}", result.window.describe()));
        lines.push(format!(
            "granules:   {} hits, {} records",
            result.hits, result.record_count
        ));
        if result.truncated {
            lines.push(self.paint(
                "warning:    search results were truncated",
                Tone::Warn,
            ));
        }
        if result.dry_run {
            lines.push(format!(
                "dry run:    {} files would be downloaded",
                result.candidates.len()
            ));
            return lines;
        }
        lines.push(self.paint(
            &format!("downloaded: {}", result.success_count),
            Tone::Good,
        ));
        let failed = format!("failed:     {}", result.failure_count);
        lines.push(if result.failure_count > 0 {
            self.paint(&failed, Tone::Bad)
        } else {
            failed
        });
        for url in &result.failed_urls {
            lines.push(format!("  - {url}"));
        }
        lines.push(if result.checkpoint_advanced {
            format!("checkpoint: advanced to {}", result.search_time)
        } else {
            match result.previous_checkpoint {
                Some(previous) => format!("checkpoint: unchanged ({previous})"),
                None => "checkpoint: unchanged".to_string(),
            }
        });
        lines
    }

    pub fn format_status(&self, result: &StatusResult) -> Vec<String> {
        let checkpoint = match &result.checkpoint {
            CheckpointState::Absent => format!(
                "none, first run looks back {} minutes",
                result.lookback_minutes
            ),
            CheckpointState::Valid(ts) => ts.to_string(),
            CheckpointState::Unreadable(reason) => {
                self.paint(&format!("unreadable ({reason})"), Tone::Warn)
            }
            CheckpointState::Corrupt(content) => {
                self.paint(&format!("corrupt ({content:?})"), Tone::Bad)
            }
        };
        let mut lines = vec![
            format!("data dir:   {}", result.data_dir),
            format!(
                "exists:     {}",
                if result.data_dir_exists { "yes" } else { "no" }
            ),
            format!("marker:     {}", result.marker_path),
            format!("checkpoint: {checkpoint}"),
        ];
        if let Some(since) = result.data_since {
            lines.push(format!("data since: {since} (range mode)"));
        }
        lines
    }

    pub fn print_run(&self, result: &RunResult) {
        for line in self.format_run(result) {
            println!("{line}");
        }
    }

    pub fn print_status(&self, result: &StatusResult) {
        for line in self.format_status(result) {
            println!("{line}");
        }
    }

    fn paint(&self, text: &str, tone: Tone) -> String {
        if !self.color {
            return text.to_string();
        }
        match tone {
            Tone::Good => text.green().to_string(),
            Tone::Bad => text.red().to_string(),
            Tone::Warn => text.yellow().to_string(),
            Tone::Accent => text.cyan().to_string(),
        }
    }
}

impl ProgressSink for ConsoleOutput {
    fn event(&self, event: ProgressEvent) {
        println!("{}", self.format_event(&event));
    }
}

#[derive(Clone, Copy)]
enum Tone {
    Good,
    Bad,
    Warn,
    Accent,
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[test]
    fn success_and_failure_lines_are_tagged() {
        let console = ConsoleOutput::plain();
        let ok = console.format_event(&ProgressEvent {
            kind: EventKind::Success,
            message: "https://x/a.nc".to_string(),
            elapsed: Some(Duration::from_millis(1500)),
        });
        assert_eq!(ok, "[SUCCESS] https://x/a.nc (1.5s)");
        let failed = console.format_event(&ProgressEvent {
            kind: EventKind::Failure,
            message: "https://x/b.nc".to_string(),
            elapsed: None,
        });
        assert_eq!(failed, "[FAILURE] https://x/b.nc");
    }

    #[test]
    fn warnings_are_logged_without_rust_log() {
        assert_eq!(log_filter("").max_level_hint(), Some(LevelFilter::WARN));
        assert_eq!(log_filter("debug").max_level_hint(), Some(LevelFilter::DEBUG));
    }

    #[test]
    fn status_reports_corrupt_marker() {
        let console = ConsoleOutput::plain();
        let lines = console.format_status(&StatusResult {
            data_dir: "/data".to_string(),
            marker_path: "/data/.update".to_string(),
            data_dir_exists: true,
            checkpoint: CheckpointState::Corrupt("garbage".to_string()),
            lookback_minutes: 60,
            data_since: None,
        });
        assert!(lines.iter().any(|line| line == "checkpoint: corrupt (\"garbage\")"));
    }
}
