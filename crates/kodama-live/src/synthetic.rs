//! In-process camera pipeline
//!
//! Buffers pushed frames per reader and reports availability through the
//! event handles it was given, the way the real pipeline's ring buffers do.
//! Used by the simulator and the tests.

use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;

use anyhow::Result;
use bytes::Bytes;
use tracing::debug;

use crate::camera::{CameraInterface, StreamEvents, StreamId};
use crate::error::StreamStatus;
use crate::frame::{Codec, FrameKind, MediaFrame, StreamKind};
use crate::policy::FrameRequest;

/// Default encoder settings reported by [`CameraInterface::fps_gop`].
pub const DEFAULT_FPS: u8 = 30;
pub const DEFAULT_GOP: u8 = 30;

/// A call the live streamer made into the pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CameraCall {
    Init { stream: StreamId, client: usize },
    Start { stream: StreamId, client: usize },
    Stop { stream: StreamId, client: usize },
}

struct Reader {
    events: StreamEvents,
    frames: VecDeque<MediaFrame>,
}

#[derive(Default)]
struct SyntheticState {
    readers: HashMap<(StreamId, usize), Reader>,
    fps_gop: HashMap<(usize, StreamKind), (u8, u8)>,
    failing: HashMap<StreamId, StreamStatus>,
    calls: Vec<CameraCall>,
}

/// Scriptable [`CameraInterface`].
pub struct SyntheticCamera {
    camera_count: usize,
    auto_ack: bool,
    state: Mutex<SyntheticState>,
}

impl SyntheticCamera {
    pub fn new(camera_count: usize) -> Self {
        Self {
            camera_count,
            auto_ack: false,
            state: Mutex::new(SyntheticState::default()),
        }
    }

    /// Acknowledge every stream as soon as it starts.
    pub fn with_auto_ack(mut self, auto_ack: bool) -> Self {
        self.auto_ack = auto_ack;
        self
    }

    pub fn set_fps_gop(&self, camera: usize, kind: StreamKind, fps: u8, gop: u8) {
        self.lock().fps_gop.insert((camera, kind), (fps, gop));
    }

    /// Make later starts of this stream fail with `status`.
    pub fn fail_start(&self, camera: usize, kind: StreamKind, status: StreamStatus) {
        let stream = self.stream(camera, kind);
        self.lock().failing.insert(stream, status);
    }

    /// Buffer `frame` for every reader of the stream and flag it available.
    ///
    /// Returns the number of readers reached.
    pub fn push_frame(&self, camera: usize, kind: StreamKind, frame: MediaFrame) -> usize {
        let events = {
            let mut state = self.lock();
            let stream = self.stream(camera, kind);
            state
                .readers
                .iter_mut()
                .filter(|((s, _), _)| *s == stream)
                .map(|(_, reader)| {
                    reader.frames.push_back(frame.clone());
                    reader.events.clone()
                })
                .collect::<Vec<_>>()
        };
        // Callbacks take the session lock; never hold ours across them
        for handle in &events {
            handle.frame_available();
        }
        events.len()
    }

    /// Report the first-frame outcome to every reader of the stream.
    pub fn ack(&self, camera: usize, kind: StreamKind, status: StreamStatus) {
        for events in self.events_for(camera, kind) {
            events.started(status);
        }
    }

    /// Close the stream underneath every reader.
    pub fn force_stop(&self, camera: usize, kind: StreamKind) {
        for events in self.events_for(camera, kind) {
            events.force_stop();
        }
    }

    /// Started readers of a stream.
    pub fn readers(&self, camera: usize, kind: StreamKind) -> usize {
        let stream = self.stream(camera, kind);
        self.lock()
            .readers
            .keys()
            .filter(|(s, _)| *s == stream)
            .count()
    }

    /// Frames still buffered for one reader.
    pub fn pending(&self, camera: usize, kind: StreamKind, client: usize) -> usize {
        let stream = self.stream(camera, kind);
        self.lock()
            .readers
            .get(&(stream, client))
            .map_or(0, |reader| reader.frames.len())
    }

    pub fn calls(&self) -> Vec<CameraCall> {
        self.lock().calls.clone()
    }

    fn stream(&self, camera: usize, kind: StreamKind) -> StreamId {
        StreamId::new(camera, kind, self.camera_count)
    }

    fn events_for(&self, camera: usize, kind: StreamKind) -> Vec<StreamEvents> {
        let stream = self.stream(camera, kind);
        self.lock()
            .readers
            .iter()
            .filter(|((s, _), _)| *s == stream)
            .map(|(_, reader)| reader.events.clone())
            .collect()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, SyntheticState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl CameraInterface for SyntheticCamera {
    fn camera_count(&self) -> usize {
        self.camera_count
    }

    fn init_stream_session(
        &self,
        stream: StreamId,
        client: usize,
        _request: FrameRequest,
    ) -> Result<(), StreamStatus> {
        self.lock().calls.push(CameraCall::Init { stream, client });
        Ok(())
    }

    fn start_stream(
        &self,
        stream: StreamId,
        client: usize,
        events: StreamEvents,
    ) -> Result<(), StreamStatus> {
        {
            let mut state = self.lock();
            state.calls.push(CameraCall::Start { stream, client });
            if let Some(status) = state.failing.get(&stream) {
                return Err(*status);
            }
            state.readers.insert(
                (stream, client),
                Reader {
                    events: events.clone(),
                    frames: VecDeque::new(),
                },
            );
        }
        debug!(%stream, client, "Synthetic stream started");
        if self.auto_ack {
            events.started(StreamStatus::Success);
        }
        Ok(())
    }

    fn stop_stream(&self, stream: StreamId, client: usize) {
        let mut state = self.lock();
        state.calls.push(CameraCall::Stop { stream, client });
        state.readers.remove(&(stream, client));
    }

    fn next_frame(
        &self,
        stream: StreamId,
        client: usize,
        want_key_frame: bool,
    ) -> Result<Option<MediaFrame>> {
        let mut state = self.lock();
        let Some(reader) = state.readers.get_mut(&(stream, client)) else {
            return Ok(None);
        };
        if want_key_frame {
            while reader.frames.front().is_some_and(|f| !f.is_key_frame()) {
                reader.frames.pop_front();
            }
        }
        Ok(reader.frames.pop_front())
    }

    fn fps_gop(&self, camera: usize, kind: StreamKind) -> (u8, u8) {
        self.lock()
            .fps_gop
            .get(&(camera, kind))
            .copied()
            .unwrap_or((DEFAULT_FPS, DEFAULT_GOP))
    }
}

/// Frame `seq` of a GOP-structured video stream.
///
/// Every `gop`-th frame is an I-frame; the payload is `payload_len` bytes of
/// the low byte of `seq`.
pub fn synthetic_frame(codec: Codec, seq: u64, gop: u8, payload_len: usize) -> MediaFrame {
    let kind = if seq % u64::from(gop.max(1)) == 0 {
        FrameKind::I
    } else {
        FrameKind::P
    };
    MediaFrame::video(codec, kind, Bytes::from(vec![seq as u8; payload_len]))
        .with_timestamp(seq * 1000 / u64::from(DEFAULT_FPS))
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::session::ClientSession;

    fn started(camera: &SyntheticCamera, session: &Arc<ClientSession>, kind: StreamKind) {
        let stream = StreamId::new(0, kind, camera.camera_count());
        let events = StreamEvents::new(Arc::clone(session), 0, kind, 1);
        camera.start_stream(stream, session.client(), events).unwrap();
    }

    #[test]
    fn push_buffers_per_reader_and_flags_availability() {
        let camera = SyntheticCamera::new(1);
        let session = Arc::new(ClientSession::new(2, 1, 4));
        started(&camera, &session, StreamKind::Main);

        assert_eq!(camera.push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 8)), 1);
        assert_eq!(camera.push_frame(0, StreamKind::Sub, synthetic_frame(Codec::H264, 0, 30, 8)), 0);
        assert!(session.lock().frame_available[0][StreamKind::Main.index()]);
        assert_eq!(camera.pending(0, StreamKind::Main, 2), 1);

        let frame = camera.next_frame(StreamId(0), 2, false).unwrap().unwrap();
        assert!(frame.is_key_frame());
        assert!(camera.next_frame(StreamId(0), 2, false).unwrap().is_none());
    }

    #[test]
    fn want_key_frame_skips_to_next_i_frame() {
        let camera = SyntheticCamera::new(1);
        let session = Arc::new(ClientSession::new(0, 1, 4));
        started(&camera, &session, StreamKind::Main);

        for seq in 1..=4 {
            camera.push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, seq, 3, 4));
        }
        // seq 1, 2 are P-frames, 3 is the I-frame
        let frame = camera.next_frame(StreamId(0), 0, true).unwrap().unwrap();
        assert_eq!(frame.payload[0], 3);
        assert_eq!(camera.pending(0, StreamKind::Main, 0), 1);
    }

    #[test]
    fn scripted_start_failure() {
        let camera = SyntheticCamera::new(2);
        camera.fail_start(1, StreamKind::Sub, StreamStatus::StartFailed);
        let session = Arc::new(ClientSession::new(0, 2, 4));
        let events = StreamEvents::new(Arc::clone(&session), 1, StreamKind::Sub, 1);

        let stream = StreamId::new(1, StreamKind::Sub, 2);
        assert_eq!(
            camera.start_stream(stream, 0, events),
            Err(StreamStatus::StartFailed)
        );
        assert_eq!(camera.readers(1, StreamKind::Sub), 0);
    }

    #[test]
    fn stop_removes_reader_and_is_logged() {
        let camera = SyntheticCamera::new(1);
        let session = Arc::new(ClientSession::new(0, 1, 4));
        started(&camera, &session, StreamKind::Sub);
        assert_eq!(camera.readers(0, StreamKind::Sub), 1);

        let stream = StreamId::new(0, StreamKind::Sub, 1);
        camera.stop_stream(stream, 0);
        assert_eq!(camera.readers(0, StreamKind::Sub), 0);
        assert_eq!(
            camera.calls(),
            vec![
                CameraCall::Start { stream, client: 0 },
                CameraCall::Stop { stream, client: 0 },
            ]
        );
    }

    #[test]
    fn fps_gop_defaults_and_overrides() {
        let camera = SyntheticCamera::new(1);
        assert_eq!(camera.fps_gop(0, StreamKind::Main), (30, 30));
        camera.set_fps_gop(0, StreamKind::Main, 15, 60);
        assert_eq!(camera.fps_gop(0, StreamKind::Main), (15, 60));
    }

    #[test]
    fn frame_pattern() {
        let frames: Vec<_> = (0..4).map(|seq| synthetic_frame(Codec::H265, seq, 2, 1)).collect();
        let kinds: Vec<_> = frames.iter().map(|f| f.kind).collect();
        assert_eq!(kinds, vec![FrameKind::I, FrameKind::P, FrameKind::I, FrameKind::P]);
        assert!(frames.windows(2).all(|w| w[0].timestamp_ms < w[1].timestamp_ms));
    }
}
