//! Per-camera motion flags
//!
//! Written by the motion detection side through
//! [`LiveStreamer::notify_camera_motion`](crate::LiveStreamer::notify_camera_motion),
//! read by the pumps when applying motion-adaptive filters.

use std::sync::atomic::{AtomicBool, Ordering};

#[derive(Debug)]
pub struct MotionState {
    cameras: Vec<AtomicBool>,
}

impl MotionState {
    pub fn new(camera_count: usize) -> Self {
        Self {
            cameras: (0..camera_count).map(|_| AtomicBool::new(false)).collect(),
        }
    }

    pub fn set(&self, camera: usize, active: bool) {
        if let Some(flag) = self.cameras.get(camera) {
            flag.store(active, Ordering::Relaxed);
        }
    }

    /// Unknown cameras report no motion.
    pub fn is_active(&self, camera: usize) -> bool {
        self.cameras
            .get(camera)
            .map(|flag| flag.load(Ordering::Relaxed))
            .unwrap_or(false)
    }
}
