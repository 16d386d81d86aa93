//! Process-wide cap on concurrently active live streams
//!
//! Every admitted stream holds an [`AdmissionPermit`]. Dropping the permit
//! returns the slot, so each successful acquire is matched by exactly one
//! release on every exit path of the pump.

use std::sync::{Arc, Mutex};

use tracing::debug;

/// Global admission counter shared by all client pumps.
#[derive(Debug)]
pub struct Admission {
    count: Mutex<usize>,
    ceiling: usize,
}

impl Admission {
    /// Ceiling is `streams_per_camera * camera_count`.
    pub fn new(streams_per_camera: usize, camera_count: usize) -> Arc<Self> {
        Arc::new(Self {
            count: Mutex::new(0),
            ceiling: streams_per_camera.saturating_mul(camera_count),
        })
    }

    pub fn ceiling(&self) -> usize {
        self.ceiling
    }

    /// Streams currently admitted.
    pub fn active(&self) -> usize {
        *self.count.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Take one slot, or `None` (and no state change) at the ceiling.
    pub fn try_acquire(self: &Arc<Self>) -> Option<AdmissionPermit> {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        if *count >= self.ceiling {
            debug!(active = *count, ceiling = self.ceiling, "Admission refused");
            return None;
        }
        *count += 1;
        Some(AdmissionPermit {
            admission: Arc::clone(self),
        })
    }

    fn release(&self) {
        let mut count = self.count.lock().unwrap_or_else(|e| e.into_inner());
        *count = count.saturating_sub(1);
    }
}

/// One admitted live stream. Releases its slot when dropped.
#[derive(Debug)]
pub struct AdmissionPermit {
    admission: Arc<Admission>,
}

impl Drop for AdmissionPermit {
    fn drop(&mut self) {
        self.admission.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn ceiling_is_per_camera_multiple() {
        let admission = Admission::new(4, 2);
        assert_eq!(admission.ceiling(), 8);
        assert_eq!(admission.active(), 0);
    }

    #[test]
    fn acquire_fails_at_ceiling_without_state_change() {
        let admission = Admission::new(1, 2);
        let a = admission.try_acquire().unwrap();
        let b = admission.try_acquire().unwrap();
        assert_eq!(admission.active(), 2);

        assert!(admission.try_acquire().is_none());
        assert_eq!(admission.active(), 2);

        drop(a);
        assert_eq!(admission.active(), 1);
        let _c = admission.try_acquire().expect("slot freed by drop");
        drop(b);
        assert_eq!(admission.active(), 1);
    }

    #[test]
    fn concurrent_acquire_never_exceeds_ceiling() {
        let admission = Admission::new(4, 2);
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let admission = Arc::clone(&admission);
                std::thread::spawn(move || admission.try_acquire())
            })
            .collect();

        let permits: Vec<_> = handles
            .into_iter()
            .filter_map(|h| h.join().unwrap())
            .collect();
        assert_eq!(permits.len(), 8);
        assert_eq!(admission.active(), 8);

        drop(permits);
        assert_eq!(admission.active(), 0);
    }
}
