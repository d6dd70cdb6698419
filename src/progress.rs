//! Sync progress reporting.
//!
//! Reports what each source pass is doing so users can follow a long
//! `catsync sync all`. Progress is emitted on **stderr** so stdout remains
//! parseable for scripts. Reporters are shared by concurrent source passes.

use std::io::Write;

use crate::models::ContentSource;

/// A single progress event for one source pass.
#[derive(Clone, Debug)]
pub enum SyncProgressEvent {
    /// Adapter is fetching listings and detail pages. Total unknown.
    Fetching { source: ContentSource },
    /// Selected items are being upserted: n of total.
    Upserting {
        source: ContentSource,
        n: u64,
        total: u64,
    },
    /// The pass ended with the given status label.
    Finished {
        source: ContentSource,
        status: &'static str,
    },
}

/// Reports sync progress. Implementations write to stderr (human or JSON).
pub trait SyncProgressReporter: Send + Sync {
    fn report(&self, event: SyncProgressEvent);
}

/// Human-friendly progress on stderr: "sync scraped_catalog  upserting  120 / 1,500 items".
pub struct StderrProgress;

impl SyncProgressReporter for StderrProgress {
    fn report(&self, event: SyncProgressEvent) {
        let line = match &event {
            SyncProgressEvent::Fetching { source } => {
                format!("sync {}  fetching...\n", source)
            }
            SyncProgressEvent::Upserting { source, n, total } => format!(
                "sync {}  upserting  {} / {} items\n",
                source,
                format_number(*n),
                format_number(*total)
            ),
            SyncProgressEvent::Finished { source, status } => {
                format!("sync {}  {}\n", source, status)
            }
        };
        let mut stderr = std::io::stderr().lock();
        let _ = stderr.write_all(line.as_bytes());
        let _ = stderr.flush();
    }
}

/// Machine-readable progress: one JSON object per line on stderr.
pub struct JsonProgress;

impl SyncProgressReporter for JsonProgress {
    fn report(&self, event: SyncProgressEvent) {
        let obj = match &event {
            SyncProgressEvent::Fetching { source } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "fetching"
            }),
            SyncProgressEvent::Upserting { source, n, total } => serde_json::json!({
                "event": "progress",
                "source": source,
                "phase": "upserting",
                "n": n,
                "total": total
            }),
            SyncProgressEvent::Finished { source, status } => serde_json::json!({
                "event": "finished",
                "source": source,
                "status": status
            }),
        };
        if let Ok(line) = serde_json::to_string(&obj) {
            let mut stderr = std::io::stderr().lock();
            let _ = writeln!(stderr, "{}", line);
            let _ = stderr.flush();
        }
    }
}

/// No-op reporter when progress is disabled.
pub struct NoProgress;

impl SyncProgressReporter for NoProgress {
    fn report(&self, _event: SyncProgressEvent) {}
}

fn format_number(n: u64) -> String {
    let s = n.to_string();
    let mut result = String::with_capacity(s.len() + (s.len() - 1) / 3);
    for (i, c) in s.chars().rev().enumerate() {
        if i > 0 && i % 3 == 0 {
            result.push(',');
        }
        result.push(c);
    }
    result.chars().rev().collect()
}

/// Progress mode for the CLI: off, human (stderr), or JSON (stderr).
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum ProgressMode {
    Off,
    Human,
    Json,
}

impl ProgressMode {
    /// Default: human progress when stderr is a TTY, otherwise off.
    pub fn default_for_tty() -> Self {
        if atty::is(atty::Stream::Stderr) {
            ProgressMode::Human
        } else {
            ProgressMode::Off
        }
    }

    pub fn reporter(&self) -> std::sync::Arc<dyn SyncProgressReporter> {
        match self {
            ProgressMode::Off => std::sync::Arc::new(NoProgress),
            ProgressMode::Human => std::sync::Arc::new(StderrProgress),
            ProgressMode::Json => std::sync::Arc::new(JsonProgress),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn format_number_comma() {
        assert_eq!(format_number(0), "0");
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1000), "1,000");
        assert_eq!(format_number(1_234_567), "1,234,567");
    }

    #[test]
    fn off_mode_is_silent() {
        ProgressMode::Off.reporter().report(SyncProgressEvent::Finished {
            source: ContentSource::ScrapedCatalog,
            status: "completed",
        });
    }
}
