use tracing::debug;

use crate::error::UploadErrorKind;
use crate::host::{DoneSummary, UploadNotifier};
use crate::record::{Destination, ExecutionContext, UploadRecord};

/// Per-batch notification state. A batch ends when the queue drains.
#[derive(Debug)]
pub struct NotificationTracker {
    context: ExecutionContext,
    uploaded: usize,
    failed: usize,
    last_uploaded: Option<(String, Destination)>,
    paused_sent: bool,
}

impl NotificationTracker {
    pub fn new(context: ExecutionContext) -> Self {
        Self {
            context,
            uploaded: 0,
            failed: 0,
            last_uploaded: None,
            paused_sent: false,
        }
    }

    /// Counts a finished record into the current batch.
    pub fn record_outcome(&mut self, record: &UploadRecord, error: Option<UploadErrorKind>) {
        if record.owner != self.context {
            return;
        }
        match error {
            None => {
                self.uploaded += 1;
                self.last_uploaded = Some((record.name.clone(), record.destination));
            }
            Some(kind) if kind.is_failure() => self.failed += 1,
            Some(_) => {}
        }
    }

    pub fn uploaded(&self) -> usize {
        self.uploaded
    }

    pub fn failed(&self) -> usize {
        self.failed
    }

    /// Emits one summary for the batch and starts a new one.
    pub fn drained(&mut self, notifier: &dyn UploadNotifier) {
        let total = self.uploaded + self.failed;
        if self.failed > 0 {
            debug!(failed = self.failed, total, "upload batch finished with failures");
            notifier.uploads_failed(self.failed, total);
        } else if self.uploaded == 1 {
            if let Some((name, destination)) = self.last_uploaded.take() {
                notifier.upload_done(DoneSummary::Single { name, destination });
            }
        } else if self.uploaded > 1 {
            notifier.upload_done(DoneSummary::Many {
                count: self.uploaded,
            });
        }
        self.uploaded = 0;
        self.failed = 0;
        self.last_uploaded = None;
        self.paused_sent = false;
    }

    /// Sends the paused notice at most once per batch.
    pub fn paused(&mut self, notifier: &dyn UploadNotifier) -> bool {
        if self.paused_sent {
            return false;
        }
        self.paused_sent = true;
        notifier.upload_paused();
        true
    }

    pub fn rearm_paused(&mut self) {
        self.paused_sent = false;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{RecordingNotifier, record};

    #[test]
    fn single_upload_names_the_file() {
        let notifier = RecordingNotifier::default();
        let mut tracker = NotificationTracker::new(ExecutionContext::App);

        tracker.record_outcome(&record("a", 42), None);
        tracker.drained(&notifier);

        assert_eq!(notifier.events(), vec!["done:a.bin".to_string()]);
        assert_eq!(tracker.uploaded(), 0);
    }

    #[test]
    fn failures_win_over_successes_and_skip_non_failures() {
        let notifier = RecordingNotifier::default();
        let mut tracker = NotificationTracker::new(ExecutionContext::App);

        tracker.record_outcome(&record("a", 42), None);
        tracker.record_outcome(&record("b", 42), Some(UploadErrorKind::QuotaExceeded));
        tracker.record_outcome(&record("c", 42), Some(UploadErrorKind::TaskCancelled));
        tracker.record_outcome(&record("d", 42), Some(UploadErrorKind::TaskRescheduled));
        tracker.record_outcome(
            &record("e", 42).with_owner(ExecutionContext::Extension),
            Some(UploadErrorKind::Lock),
        );
        tracker.drained(&notifier);

        assert_eq!(notifier.events(), vec!["failed:1/2".to_string()]);
    }

    #[test]
    fn paused_is_sent_once_per_batch() {
        let notifier = RecordingNotifier::default();
        let mut tracker = NotificationTracker::new(ExecutionContext::App);

        assert!(tracker.paused(&notifier));
        assert!(!tracker.paused(&notifier));
        tracker.drained(&notifier);
        assert!(tracker.paused(&notifier));

        assert_eq!(notifier.events(), vec!["paused", "paused"]);
    }
}
