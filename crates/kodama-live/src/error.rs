use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::transport::TransportKind;

/// Synchronous failures of the public live stream API.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum LiveError {
    #[error("camera index {camera} is not configured (max {max})")]
    MaxCameraConfigured { camera: usize, max: usize },

    #[error("client index {0} is out of range")]
    InvalidClient(usize),

    #[error("no transport registered for {0:?} clients")]
    InvalidTransport(TransportKind),

    #[error("resource limit reached: {0}")]
    ResourceLimit(&'static str),

    #[error("client {0} has no active live session")]
    Refused(usize),

    #[error("control queue of client {0} is full")]
    QueueFull(usize),
}

/// Status reported to a client through [`Transport::respond`](crate::Transport::respond).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StreamStatus {
    Success,
    /// Global live stream cap reached
    MaxStreamLimit,
    CodecNotSupported,
    ResourceLimit,
    /// Camera pipeline refused to start the stream
    StartFailed,
    StreamClosed,
}

impl StreamStatus {
    pub fn as_u8(&self) -> u8 {
        match self {
            StreamStatus::Success => 0,
            StreamStatus::MaxStreamLimit => 1,
            StreamStatus::CodecNotSupported => 2,
            StreamStatus::ResourceLimit => 3,
            StreamStatus::StartFailed => 4,
            StreamStatus::StreamClosed => 5,
        }
    }

    pub fn is_success(&self) -> bool {
        *self == StreamStatus::Success
    }
}

impl std::fmt::Display for StreamStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            StreamStatus::Success => "SUCCESS",
            StreamStatus::MaxStreamLimit => "MAX_STREAM_LIMIT",
            StreamStatus::CodecNotSupported => "CODEC_NOT_SUPPORTED",
            StreamStatus::ResourceLimit => "RESOURCE_LIMIT",
            StreamStatus::StartFailed => "START_FAILED",
            StreamStatus::StreamClosed => "STREAM_CLOSED",
        };
        f.write_str(name)
    }
}
