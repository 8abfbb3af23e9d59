//! Run summary
//!
//! An append-only, thread-safe event log keyed by source id. The summary
//! never drives control flow; it is a pure sink that workers record into
//! and the orchestrator reduces once at the end of the run.

use std::collections::BTreeMap;
use std::sync::Mutex;
use std::time::Instant;

use tracing::info;

/// Pipeline phase an event belongs to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Download,
    Stage,
}

impl Phase {
    pub fn as_str(&self) -> &'static str {
        match self {
            Phase::Download => "download",
            Phase::Stage => "stage",
        }
    }
}

/// Event status
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Status {
    Ok,
    Skipped,
    Failed,
}

impl Status {
    pub fn as_str(&self) -> &'static str {
        match self {
            Status::Ok => "ok",
            Status::Skipped => "skipped",
            Status::Failed => "failed",
        }
    }
}

/// Terminal classification of one source
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceState {
    Ok,
    Partial,
    Skipped,
    SkippedCancelled,
    Failed,
}

impl SourceState {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceState::Ok => "ok",
            SourceState::Partial => "partial",
            SourceState::Skipped => "skipped",
            SourceState::SkippedCancelled => "skipped-cancelled",
            SourceState::Failed => "failed",
        }
    }
}

/// One recorded event
#[derive(Debug, Clone)]
pub struct Event {
    pub phase: Phase,
    pub status: Status,
    pub detail: String,
}

#[derive(Debug, Default)]
struct SourceLog {
    events: Vec<Event>,
    terminal: Option<(SourceState, String)>,
}

#[derive(Debug, Default)]
struct Inner {
    sources: BTreeMap<String, SourceLog>,
}

/// Aggregated totals over the whole run
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Totals {
    pub downloaded: u64,
    pub staged: u64,
    pub skipped: u64,
    pub failed: u64,
    pub partial: u64,
}

/// Per-source section of the final report
#[derive(Debug, Clone)]
pub struct SourceReport {
    pub source_id: String,
    pub state: SourceState,
    pub cause: String,
    pub events: Vec<Event>,
}

/// Final reduced report
#[derive(Debug, Clone)]
pub struct RunReport {
    pub per_source: Vec<SourceReport>,
    pub totals: Totals,
    pub wall_seconds: f64,
}

impl RunReport {
    /// Sources that terminated in `Failed`
    pub fn failed_sources(&self) -> u64 {
        self.per_source
            .iter()
            .filter(|s| s.state == SourceState::Failed)
            .count() as u64
    }

    /// Write the closing summary block to the log
    pub fn log(&self) {
        info!(
            downloaded = self.totals.downloaded,
            staged = self.totals.staged,
            skipped = self.totals.skipped,
            failed = self.totals.failed,
            partial = self.totals.partial,
            wall_seconds = format!("{:.1}", self.wall_seconds),
            "Run summary"
        );
        for source in &self.per_source {
            info!(
                source = %source.source_id,
                state = source.state.as_str(),
                cause = %source.cause,
                "Source result"
            );
        }
    }
}

/// Thread-safe run summary accumulator
pub struct RunSummary {
    inner: Mutex<Inner>,
    started: Instant,
}

impl Default for RunSummary {
    fn default() -> Self {
        Self::new()
    }
}

impl RunSummary {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            started: Instant::now(),
        }
    }

    /// Append one phase event for a source
    pub fn record(&self, source_id: &str, phase: Phase, status: Status, detail: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        inner
            .sources
            .entry(source_id.to_string())
            .or_default()
            .events
            .push(Event {
                phase,
                status,
                detail: detail.into(),
            });
    }

    /// Record the terminal state of a source. Only the first terminal
    /// record per source is kept.
    pub fn record_terminal(&self, source_id: &str, state: SourceState, cause: impl Into<String>) {
        let mut inner = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        let log = inner.sources.entry(source_id.to_string()).or_default();
        if log.terminal.is_none() {
            log.terminal = Some((state, cause.into()));
        }
    }

    /// Reduce the event log to per-source states and totals
    pub fn finalize(self) -> RunReport {
        let inner = self.inner.into_inner().unwrap_or_else(|e| e.into_inner());
        let mut totals = Totals::default();
        let mut per_source = Vec::with_capacity(inner.sources.len());

        for (source_id, log) in inner.sources {
            for event in &log.events {
                match (event.phase, event.status) {
                    (Phase::Download, Status::Ok) => totals.downloaded += 1,
                    (Phase::Stage, Status::Ok) => totals.staged += 1,
                    (_, Status::Skipped) => totals.skipped += 1,
                    (_, Status::Failed) => totals.failed += 1,
                }
            }
            let (state, cause) = log
                .terminal
                .unwrap_or((SourceState::Skipped, "no work performed".to_string()));
            if state == SourceState::Partial {
                totals.partial += 1;
            }
            per_source.push(SourceReport {
                source_id,
                state,
                cause,
                events: log.events,
            });
        }

        RunReport {
            per_source,
            totals,
            wall_seconds: self.started.elapsed().as_secs_f64(),
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_empty_summary() {
        let report = RunSummary::new().finalize();
        assert!(report.per_source.is_empty());
        assert_eq!(report.totals, Totals::default());
    }

    #[test]
    fn test_counts_reduce() {
        let summary = RunSummary::new();
        summary.record("a", Phase::Download, Status::Ok, "u1");
        summary.record("a", Phase::Download, Status::Skipped, "duplicate link");
        summary.record("a", Phase::Stage, Status::Ok, "a_x");
        summary.record("b", Phase::Download, Status::Failed, "HTTP 503");
        summary.record_terminal("a", SourceState::Ok, "2 artifacts");
        summary.record_terminal("b", SourceState::Failed, "HTTP 503");

        let report = summary.finalize();
        assert_eq!(report.totals.downloaded, 1);
        assert_eq!(report.totals.staged, 1);
        assert_eq!(report.totals.skipped, 1);
        assert_eq!(report.totals.failed, 1);
        assert_eq!(report.failed_sources(), 1);
    }

    #[test]
    fn test_single_terminal_record_per_source() {
        let summary = RunSummary::new();
        summary.record_terminal("a", SourceState::Failed, "first");
        summary.record_terminal("a", SourceState::Ok, "second");
        let report = summary.finalize();
        assert_eq!(report.per_source.len(), 1);
        assert_eq!(report.per_source[0].state, SourceState::Failed);
        assert_eq!(report.per_source[0].cause, "first");
    }

    #[test]
    fn test_partial_counted_in_totals() {
        let summary = RunSummary::new();
        summary.record_terminal("a", SourceState::Partial, "1 ok, 1 failed");
        let report = summary.finalize();
        assert_eq!(report.totals.partial, 1);
    }
}
