//! Per-track pipeline states and fan-out result reporting.

use std::path::PathBuf;

use tracing::info;

use crate::catalog::TrackRef;

/// Pipeline position of one track acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TrackState {
    Waiting,
    Processing,
    Parsing,
    Downloading,
    Decrypting,
    Saving,
    Done,
    AlreadyExists,
    Failed,
}

impl TrackState {
    pub fn as_str(self) -> &'static str {
        match self {
            TrackState::Waiting => "waiting",
            TrackState::Processing => "processing",
            TrackState::Parsing => "parsing",
            TrackState::Downloading => "downloading",
            TrackState::Decrypting => "decrypting",
            TrackState::Saving => "saving",
            TrackState::Done => "done",
            TrackState::AlreadyExists => "already-exists",
            TrackState::Failed => "failed",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            TrackState::Done | TrackState::AlreadyExists | TrackState::Failed
        )
    }
}

impl std::fmt::Display for TrackState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Terminal outcome of one track's acquisition.
#[derive(Debug)]
pub struct TrackReport {
    pub track: TrackRef,
    pub state: TrackState,
    pub path: Option<PathBuf>,
    pub error: Option<String>,
}

impl TrackReport {
    pub fn done(track: TrackRef, path: PathBuf) -> Self {
        Self {
            track,
            state: TrackState::Done,
            path: Some(path),
            error: None,
        }
    }

    pub fn already_exists(track: TrackRef, path: PathBuf) -> Self {
        Self {
            track,
            state: TrackState::AlreadyExists,
            path: Some(path),
            error: None,
        }
    }

    pub fn failed(track: TrackRef, error: String) -> Self {
        Self {
            track,
            state: TrackState::Failed,
            path: None,
            error: Some(error),
        }
    }
}

/// Aggregate outcome of a collection fan-out. Individual failures stay
/// visible; the parent is complete only once every child reported.
#[derive(Debug, Default)]
pub struct CollectionReport {
    pub reports: Vec<TrackReport>,
}

impl CollectionReport {
    pub fn push(&mut self, report: TrackReport) {
        self.reports.push(report);
    }

    pub fn count(&self, state: TrackState) -> usize {
        self.reports.iter().filter(|r| r.state == state).count()
    }

    pub fn all_succeeded(&self) -> bool {
        self.count(TrackState::Failed) == 0
    }

    pub fn log_summary(&self) {
        info!(
            total = self.reports.len(),
            done = self.count(TrackState::Done),
            already_exists = self.count(TrackState::AlreadyExists),
            failed = self.count(TrackState::Failed),
            "collection finished"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn terminal_states() {
        assert!(TrackState::Done.is_terminal());
        assert!(TrackState::AlreadyExists.is_terminal());
        assert!(TrackState::Failed.is_terminal());
        assert!(!TrackState::Decrypting.is_terminal());
    }

    #[test]
    fn report_counts_by_state() {
        let mut report = CollectionReport::default();
        report.push(TrackReport::done(
            TrackRef::new("1", "us"),
            PathBuf::from("/m/a.m4a"),
        ));
        report.push(TrackReport::failed(
            TrackRef::new("2", "us"),
            "decrypt failed".to_string(),
        ));
        report.push(TrackReport::already_exists(
            TrackRef::new("3", "us"),
            PathBuf::from("/m/b.m4a"),
        ));
        assert_eq!(report.count(TrackState::Done), 1);
        assert_eq!(report.count(TrackState::Failed), 1);
        assert!(!report.all_succeeded());
    }
}
