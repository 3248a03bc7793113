use crate::import::types::{ImportPhase, ImportProgress};
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use tokio::sync::mpsc;
use tracing::debug;

/// Publishes batch progress without ever blocking the pipeline.
///
/// Updates go out with `try_send`; when the caller is slow and the channel
/// is full the update is dropped. Later updates carry cumulative values,
/// so nothing is lost but granularity.
pub struct ProgressReporter {
    tx: Option<mpsc::Sender<ImportProgress>>,
    total_files: AtomicUsize,
    dropped: AtomicU64,
}

impl ProgressReporter {
    pub fn new(tx: mpsc::Sender<ImportProgress>) -> Self {
        ProgressReporter {
            tx: Some(tx),
            total_files: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    /// Reporter for callers that do not listen
    pub fn disabled() -> Self {
        ProgressReporter {
            tx: None,
            total_files: AtomicUsize::new(0),
            dropped: AtomicU64::new(0),
        }
    }

    pub fn set_total_files(&self, total: usize) {
        self.total_files.store(total, Ordering::Relaxed);
    }

    pub fn total_files(&self) -> usize {
        self.total_files.load(Ordering::Relaxed)
    }

    /// Updates discarded because the channel was full
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// `fraction` is how far through `phase` the batch is, 0.0 to 1.0
    pub fn report(
        &self,
        phase: ImportPhase,
        fraction: f64,
        current_file: Option<&str>,
        files_processed: usize,
    ) {
        let Some(tx) = &self.tx else {
            return;
        };

        let update = ImportProgress {
            percent: overall_percent(phase, fraction),
            phase,
            current_file: current_file.map(str::to_string),
            files_processed,
            total_files: self.total_files(),
        };

        match tx.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                self.dropped.fetch_add(1, Ordering::Relaxed);
            }
            Err(mpsc::error::TrySendError::Closed(_)) => {
                debug!("Progress receiver dropped");
            }
        }
    }

    /// Report progress measured in files
    pub fn report_files(
        &self,
        phase: ImportPhase,
        done: usize,
        total: usize,
        current_file: Option<&str>,
    ) {
        self.report(phase, ratio(done as u64, total as u64), current_file, done);
    }
}

/// Map a position inside one phase onto the 0-100 batch scale
pub fn overall_percent(phase: ImportPhase, fraction: f64) -> u8 {
    let (start, end) = phase.percent_span();
    let fraction = if fraction.is_finite() {
        fraction.clamp(0.0, 1.0)
    } else {
        0.0
    };
    let span = f64::from(end - start);
    (f64::from(start) + span * fraction).round().min(100.0) as u8
}

/// `done / total`, treating an empty phase as complete
pub fn ratio(done: u64, total: u64) -> f64 {
    if total == 0 {
        1.0
    } else {
        done as f64 / total as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overall_percent_uses_phase_span() {
        assert_eq!(overall_percent(ImportPhase::Scan, 0.0), 0);
        assert_eq!(overall_percent(ImportPhase::Hash, 0.0), 5);
        assert_eq!(overall_percent(ImportPhase::Hash, 1.0), 40);
        assert_eq!(overall_percent(ImportPhase::Copy, 0.5), 60);
        assert_eq!(overall_percent(ImportPhase::Finalize, 1.0), 100);
        assert_eq!(overall_percent(ImportPhase::Validate, 7.0), 95);
        assert_eq!(overall_percent(ImportPhase::Validate, f64::NAN), 80);
    }

    #[test]
    fn test_ratio_of_empty_phase_is_complete() {
        assert_eq!(ratio(0, 0), 1.0);
        assert_eq!(ratio(1, 4), 0.25);
    }

    #[tokio::test]
    async fn test_full_channel_drops_instead_of_blocking() {
        let (tx, mut rx) = mpsc::channel(1);
        let reporter = ProgressReporter::new(tx);
        reporter.set_total_files(3);

        reporter.report_files(ImportPhase::Hash, 1, 3, Some("a.jpg"));
        reporter.report_files(ImportPhase::Hash, 2, 3, Some("b.jpg"));
        assert_eq!(reporter.dropped(), 1);

        let first = rx.recv().await.unwrap();
        assert_eq!(first.files_processed, 1);
        assert_eq!(first.total_files, 3);
        assert_eq!(first.current_file.as_deref(), Some("a.jpg"));
    }
}
