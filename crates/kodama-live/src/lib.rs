//! Kodama Live - live view streaming multiplexer
//!
//! Serves live video/audio from many cameras to many clients. Each client
//! gets one pump thread that runs a small state machine per
//! (camera, stream kind) tuple and forwards frames from the camera pipeline
//! through its transport.
//!
//! - **Lifecycle API**: [`LiveStreamer`] (add / remove / change stream, audio, motion)
//! - **Pipeline boundary**: [`CameraInterface`], [`StreamEvents`], [`SyntheticCamera`]
//! - **Transports**: [`Transport`], [`TcpTransport`], [`MemoryTransport`]
//! - **Wire format**: [`FrameHeader`], [`HeaderTemplate`], [`encode_frame`]
//! - **Frame selection**: [`FrameRequest`], [`FrameSelector`]

// Core types
mod config;
mod error;
mod frame;
mod protocol;

pub use config::LiveConfig;
pub use error::{LiveError, StreamStatus};
pub use frame::{Codec, FrameKind, MediaFrame, MediaStatus, Resolution, StreamKind};
pub use protocol::*;

// Building blocks
mod admission;
mod motion;
mod policy;
mod queue;
mod stats;
mod video_loss;
mod wire;

pub use admission::{Admission, AdmissionPermit};
pub use motion::MotionState;
pub use policy::{FrameRequest, FrameSelector, MjpegFilter, SelectionInput, VideoFilter};
pub use queue::{CommandQueue, ControlTrigger};
pub use stats::LiveStats;
pub use video_loss::LossDetector;
pub use wire::{channel_for_camera, encode_frame, FrameHeader, HeaderTemplate};

// Pipeline and client boundaries
mod camera;
mod synthetic;
mod transport;

pub use camera::{CameraInterface, ConnectionId, StreamEvents, StreamId};
pub use synthetic::{synthetic_frame, CameraCall, SyntheticCamera, DEFAULT_FPS, DEFAULT_GOP};
pub use transport::{
    MemoryTransport, TcpTransport, Transport, TransportEvent, TransportKind, TransportTable,
};

// Pumps and the public API
mod pump;
mod session;
mod streamer;
mod tuple;

pub use streamer::LiveStreamer;
pub use tuple::TuplePhase;
