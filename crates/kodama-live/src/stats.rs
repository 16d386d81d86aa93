//! Live streaming statistics

use std::sync::atomic::{AtomicU64, Ordering};

use serde::{Deserialize, Serialize};

/// Statistics snapshot (returned from atomic counters)
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LiveStats {
    /// Streams holding an admission slot
    pub active_streams: usize,
    /// Admission ceiling
    pub stream_limit: usize,
    /// Clients with a running pump
    pub active_clients: usize,
    pub frames_sent: u64,
    /// Frames withheld by the selection policy or the audio switch
    pub frames_filtered: u64,
    /// Frames dropped for exceeding the maximum frame size
    pub frames_oversized: u64,
    pub video_loss_headers: u64,
    pub send_failures: u64,
}

/// Lock-free counters shared by all pumps
#[derive(Debug, Default)]
pub(crate) struct LiveCounters {
    pub frames_sent: AtomicU64,
    pub frames_filtered: AtomicU64,
    pub frames_oversized: AtomicU64,
    pub video_loss_headers: AtomicU64,
    pub send_failures: AtomicU64,
}

impl LiveCounters {
    pub fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    /// Counter part of a snapshot; the caller fills in the gauges.
    pub fn snapshot(&self) -> LiveStats {
        LiveStats {
            frames_sent: self.frames_sent.load(Ordering::Relaxed),
            frames_filtered: self.frames_filtered.load(Ordering::Relaxed),
            frames_oversized: self.frames_oversized.load(Ordering::Relaxed),
            video_loss_headers: self.video_loss_headers.load(Ordering::Relaxed),
            send_failures: self.send_failures.load(Ordering::Relaxed),
            ..Default::default()
        }
    }
}
