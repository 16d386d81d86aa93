//! Video-loss detection per tuple
//!
//! Loss is declared `margin` before the configured duration elapses. The pump
//! may sit in its idle wait when the deadline passes; the margin keeps a lightly
//! loaded client from reporting loss a full cycle late.

use std::time::{Duration, Instant};

#[derive(Debug, Clone)]
pub struct LossDetector {
    last_frame: Instant,
    reported: bool,
}

impl LossDetector {
    pub fn new(now: Instant) -> Self {
        Self {
            last_frame: now,
            reported: false,
        }
    }

    /// A real frame arrived; the outage, if any, is over.
    pub fn frame_received(&mut self, now: Instant) {
        self.last_frame = now;
        self.reported = false;
    }

    /// Whether a loss header is due at `now`.
    pub fn is_due(&self, now: Instant, pre_loss: Duration, margin: Duration) -> bool {
        !self.reported && now.saturating_duration_since(self.last_frame) + margin >= pre_loss
    }

    /// Record that the loss header for this outage went out.
    pub fn mark_reported(&mut self, now: Instant) {
        self.last_frame = now;
        self.reported = true;
    }

    pub fn reported(&self) -> bool {
        self.reported
    }

    /// When the next loss header becomes due, if one can.
    pub fn deadline(&self, pre_loss: Duration, margin: Duration) -> Option<Instant> {
        if self.reported {
            return None;
        }
        Some(self.last_frame + pre_loss.saturating_sub(margin))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PRE_LOSS: Duration = Duration::from_secs(10);
    const MARGIN: Duration = Duration::from_millis(200);

    #[test]
    fn due_at_pre_loss_minus_margin() {
        let start = Instant::now();
        let detector = LossDetector::new(start);

        assert!(!detector.is_due(start + Duration::from_millis(9_700), PRE_LOSS, MARGIN));
        assert!(detector.is_due(start + Duration::from_millis(9_800), PRE_LOSS, MARGIN));
        assert_eq!(
            detector.deadline(PRE_LOSS, MARGIN),
            Some(start + Duration::from_millis(9_800))
        );
    }

    #[test]
    fn one_report_per_outage() {
        let start = Instant::now();
        let mut detector = LossDetector::new(start);

        let first = start + Duration::from_secs(10);
        assert!(detector.is_due(first, PRE_LOSS, MARGIN));
        detector.mark_reported(first);

        // Still silent, long after: no second report
        assert!(!detector.is_due(first + Duration::from_secs(60), PRE_LOSS, MARGIN));
        assert_eq!(detector.deadline(PRE_LOSS, MARGIN), None);
        assert!(detector.reported());
    }

    #[test]
    fn frame_rearms_detection() {
        let start = Instant::now();
        let mut detector = LossDetector::new(start);
        detector.mark_reported(start + Duration::from_secs(10));

        let resumed = start + Duration::from_secs(12);
        detector.frame_received(resumed);
        assert!(!detector.reported());
        assert!(!detector.is_due(resumed + Duration::from_secs(5), PRE_LOSS, MARGIN));
        assert!(detector.is_due(resumed + Duration::from_millis(9_800), PRE_LOSS, MARGIN));
    }

    #[test]
    fn steady_frames_never_trigger() {
        let start = Instant::now();
        let mut detector = LossDetector::new(start);
        for i in 1..=100 {
            let now = start + Duration::from_millis(i * 40);
            assert!(!detector.is_due(now, PRE_LOSS, MARGIN));
            detector.frame_received(now);
        }
    }
}
