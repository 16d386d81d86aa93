//! Camera pipeline boundary
//!
//! The decode/encode and ring-buffer pipeline lives outside this crate. The
//! pump reaches it through [`CameraInterface`]; the pipeline reaches back
//! through the [`StreamEvents`] handle it receives on `start_stream`.

use std::sync::Arc;

use anyhow::Result;
use tracing::warn;

use crate::error::StreamStatus;
use crate::frame::{MediaFrame, StreamKind};
use crate::policy::FrameRequest;
use crate::queue::ControlTrigger;
use crate::session::ClientSession;

/// Opaque handle of a client connection owned by a transport.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ConnectionId(pub u64);

impl std::fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "conn#{}", self.0)
    }
}

/// Pipeline-side stream index.
///
/// Main streams occupy `0..camera_count`, sub streams follow them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct StreamId(pub usize);

impl StreamId {
    pub fn new(camera: usize, kind: StreamKind, camera_count: usize) -> Self {
        match kind {
            StreamKind::Main => Self(camera),
            StreamKind::Sub => Self(camera + camera_count),
        }
    }
}

impl std::fmt::Display for StreamId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "stream#{}", self.0)
    }
}

/// Functions the live streamer consumes from the camera pipeline.
///
/// `client` is the reader tag: each client has its own read position in the
/// pipeline's ring buffers.
pub trait CameraInterface: Send + Sync {
    /// Cameras configured for the current product variant.
    fn camera_count(&self) -> usize;

    /// Prepare a reader for `client` on `stream`.
    fn init_stream_session(
        &self,
        stream: StreamId,
        client: usize,
        request: FrameRequest,
    ) -> Result<(), StreamStatus>;

    /// Start delivering `stream` to `client`. Frame availability, the start
    /// acknowledgement and forced closure are reported through `events`.
    fn start_stream(
        &self,
        stream: StreamId,
        client: usize,
        events: StreamEvents,
    ) -> Result<(), StreamStatus>;

    fn stop_stream(&self, stream: StreamId, client: usize);

    /// Next frame for `client`, or `None` if nothing is buffered.
    ///
    /// With `want_key_frame` set the pipeline skips ahead to the next I-frame.
    fn next_frame(
        &self,
        stream: StreamId,
        client: usize,
        want_key_frame: bool,
    ) -> Result<Option<MediaFrame>>;

    /// Configured frame rate and GOP length.
    fn fps_gop(&self, camera: usize, kind: StreamKind) -> (u8, u8);
}

/// Callback handle given to the pipeline for one stream activation.
///
/// All methods are non-blocking: they touch shared state under the session
/// mutex and signal the pump, never perform I/O.
#[derive(Clone)]
pub struct StreamEvents {
    session: Arc<ClientSession>,
    camera: usize,
    kind: StreamKind,
    generation: u64,
}

impl StreamEvents {
    pub(crate) fn new(
        session: Arc<ClientSession>,
        camera: usize,
        kind: StreamKind,
        generation: u64,
    ) -> Self {
        Self {
            session,
            camera,
            kind,
            generation,
        }
    }

    pub fn client(&self) -> usize {
        self.session.client()
    }

    pub fn camera(&self) -> usize {
        self.camera
    }

    pub fn kind(&self) -> StreamKind {
        self.kind
    }

    /// Activation counter; events of a superseded activation are ignored.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// New data is buffered for this stream.
    pub fn frame_available(&self) {
        self.session.set_frame_available(self.camera, self.kind);
    }

    /// The stream produced its first frame (or failed to).
    pub fn started(&self, status: StreamStatus) {
        self.post(ControlTrigger::ack(self, status));
    }

    /// The pipeline closed the stream on its own.
    pub fn force_stop(&self) {
        self.post(ControlTrigger::ForceStop {
            camera: self.camera,
            kind: self.kind,
            generation: self.generation,
        });
    }

    fn post(&self, trigger: ControlTrigger) {
        if let Err(trigger) = self.session.post_if_running(trigger) {
            warn!(
                client = self.client(),
                camera = self.camera,
                stream = %self.kind,
                ?trigger,
                "Dropping pipeline event: session inactive or queue full"
            );
        }
    }
}

impl std::fmt::Debug for StreamEvents {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("StreamEvents")
            .field("client", &self.client())
            .field("camera", &self.camera)
            .field("kind", &self.kind)
            .field("generation", &self.generation)
            .finish()
    }
}
