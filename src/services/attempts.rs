use std::sync::Arc;

use time::{Duration, PrimitiveDateTime};

use crate::repositories::submissions::{StoreError, SubmissionStore};

/// Rolling-window attempt budget for one (assignment, student) pair.
/// Reading usage never consumes an attempt; only the orchestrator's
/// new-artifact path acts on `can_submit`.
#[derive(Clone)]
pub(crate) struct AttemptLimiter {
    store: Arc<dyn SubmissionStore>,
    max_attempts: u32,
    window: Duration,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct AttemptUsage {
    pub(crate) used: u32,
    pub(crate) remaining: u32,
    pub(crate) can_submit: bool,
}

impl AttemptLimiter {
    pub(crate) fn new(
        store: Arc<dyn SubmissionStore>,
        max_attempts: u32,
        window_hours: i64,
    ) -> Self {
        Self { store, max_attempts, window: Duration::hours(window_hours) }
    }

    pub(crate) fn max_attempts(&self) -> u32 {
        self.max_attempts
    }

    pub(crate) async fn usage(
        &self,
        assignment_id: &str,
        student_id: &str,
        now: PrimitiveDateTime,
    ) -> Result<AttemptUsage, StoreError> {
        let cutoff = now - self.window;
        let used = self.store.count_attempts_since(assignment_id, student_id, cutoff).await?;

        Ok(AttemptUsage {
            used,
            remaining: self.max_attempts.saturating_sub(used),
            can_submit: used < self.max_attempts,
        })
    }
}

pub(crate) fn usage_message(usage: &AttemptUsage, max_attempts: u32) -> String {
    if usage.remaining == 0 {
        "No grading attempts remaining in the current 24-hour window. The limit resets as \
         older attempts fall out of the window."
            .to_string()
    } else {
        format!(
            "{} of {} grading attempts remaining in the current 24-hour window.",
            usage.remaining, max_attempts
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn usage_message_reports_remaining() {
        let usage = AttemptUsage { used: 1, remaining: 2, can_submit: true };
        assert_eq!(
            usage_message(&usage, 3),
            "2 of 3 grading attempts remaining in the current 24-hour window."
        );
    }

    #[test]
    fn usage_message_reports_exhaustion_without_error() {
        let usage = AttemptUsage { used: 3, remaining: 0, can_submit: false };
        assert!(usage_message(&usage, 3).starts_with("No grading attempts remaining"));
    }
}
