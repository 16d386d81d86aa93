//! Runtime configuration for the live streamer

use std::time::Duration;

use anyhow::Result;

use crate::protocol::{
    DEFAULT_MAX_CLIENTS, DEFAULT_QUEUE_CAPACITY, FRAME_HEADER_SIZE, IDLE_WAIT, LOSS_EARLY_MARGIN,
    MAX_LIVE_FRAME_SIZE, PRE_VIDEO_LOSS, SEND_TIMEOUT, SLICE_BUDGET, STREAMS_PER_CAMERA,
};

/// Live streamer configuration
#[derive(Debug, Clone)]
pub struct LiveConfig {
    /// Number of client sessions pre-allocated at init
    pub max_clients: usize,
    /// Control triggers a client may have pending
    pub queue_capacity: usize,
    /// Admission multiplier: the global cap is this times the camera count
    pub streams_per_camera: usize,
    /// Silence after which a tuple is reported as video loss
    pub pre_video_loss: Duration,
    /// How much earlier than `pre_video_loss` loss is declared
    pub loss_early_margin: Duration,
    /// Longest condvar wait of an idle pump
    pub idle_wait: Duration,
    /// Per-frame transmit timeout
    pub send_timeout: Duration,
    /// Servicing work per slice before the pump yields
    pub slice_budget: Duration,
    /// Largest header + payload forwarded
    pub max_frame_size: usize,
}

impl Default for LiveConfig {
    fn default() -> Self {
        Self {
            max_clients: DEFAULT_MAX_CLIENTS,
            queue_capacity: DEFAULT_QUEUE_CAPACITY,
            streams_per_camera: STREAMS_PER_CAMERA,
            pre_video_loss: PRE_VIDEO_LOSS,
            loss_early_margin: LOSS_EARLY_MARGIN,
            idle_wait: IDLE_WAIT,
            send_timeout: SEND_TIMEOUT,
            slice_budget: SLICE_BUDGET,
            max_frame_size: MAX_LIVE_FRAME_SIZE,
        }
    }
}

impl LiveConfig {
    /// Build from `KODAMA_LIVE_*` environment variables, falling back to defaults.
    ///
    /// | Variable | Unit |
    /// |---|---|
    /// | `KODAMA_LIVE_MAX_CLIENTS` | count |
    /// | `KODAMA_LIVE_QUEUE_CAPACITY` | count |
    /// | `KODAMA_LIVE_STREAMS_PER_CAMERA` | count |
    /// | `KODAMA_LIVE_PRE_VIDEO_LOSS_SECS` | seconds |
    /// | `KODAMA_LIVE_LOSS_MARGIN_MS` | milliseconds |
    /// | `KODAMA_LIVE_IDLE_WAIT_SECS` | seconds |
    /// | `KODAMA_LIVE_SEND_TIMEOUT_SECS` | seconds |
    /// | `KODAMA_LIVE_SLICE_BUDGET_MS` | milliseconds |
    /// | `KODAMA_LIVE_MAX_FRAME_BYTES` | bytes |
    pub fn from_env() -> Result<Self> {
        let defaults = Self::default();

        let config = Self {
            max_clients: env_parse("KODAMA_LIVE_MAX_CLIENTS").unwrap_or(defaults.max_clients),
            queue_capacity: env_parse("KODAMA_LIVE_QUEUE_CAPACITY")
                .unwrap_or(defaults.queue_capacity),
            streams_per_camera: env_parse("KODAMA_LIVE_STREAMS_PER_CAMERA")
                .unwrap_or(defaults.streams_per_camera),
            pre_video_loss: env_parse("KODAMA_LIVE_PRE_VIDEO_LOSS_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.pre_video_loss),
            loss_early_margin: env_parse("KODAMA_LIVE_LOSS_MARGIN_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.loss_early_margin),
            idle_wait: env_parse("KODAMA_LIVE_IDLE_WAIT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.idle_wait),
            send_timeout: env_parse("KODAMA_LIVE_SEND_TIMEOUT_SECS")
                .map(Duration::from_secs)
                .unwrap_or(defaults.send_timeout),
            slice_budget: env_parse("KODAMA_LIVE_SLICE_BUDGET_MS")
                .map(Duration::from_millis)
                .unwrap_or(defaults.slice_budget),
            max_frame_size: env_parse("KODAMA_LIVE_MAX_FRAME_BYTES")
                .unwrap_or(defaults.max_frame_size),
        };

        config.validate()?;
        Ok(config)
    }

    /// Reject settings the pump cannot run with.
    pub fn validate(&self) -> Result<()> {
        if self.max_clients == 0 {
            anyhow::bail!("max_clients must be at least 1");
        }
        if self.queue_capacity == 0 {
            anyhow::bail!("queue_capacity must be at least 1");
        }
        if self.streams_per_camera == 0 {
            anyhow::bail!("streams_per_camera must be at least 1");
        }
        if self.loss_early_margin >= self.pre_video_loss {
            anyhow::bail!(
                "loss_early_margin ({:?}) must be smaller than pre_video_loss ({:?})",
                self.loss_early_margin,
                self.pre_video_loss
            );
        }
        if self.idle_wait.is_zero() || self.slice_budget.is_zero() {
            anyhow::bail!("idle_wait and slice_budget must be non-zero");
        }
        if self.max_frame_size < FRAME_HEADER_SIZE {
            anyhow::bail!(
                "max_frame_size must hold at least a frame header ({} bytes)",
                FRAME_HEADER_SIZE
            );
        }
        Ok(())
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.trim().parse().ok())
}
