//! Adaptive frame selection
//!
//! Decides per frame whether a tuple forwards it, based on the requested
//! filter, the camera frame rate and the camera motion flag. The only state
//! is the MJPEG skip counter, owned by the tuple.

use serde::{Deserialize, Serialize};

use crate::frame::{Codec, FrameKind};

/// Requested filter for H.264/H.265/MPEG-4 streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum VideoFilter {
    #[default]
    All,
    KeyFrameOnly,
    /// Everything while the camera reports motion, nothing otherwise
    MotionAdaptive,
}

/// Requested filter for MJPEG streams.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum MjpegFilter {
    #[default]
    All,
    /// Throttle to roughly this many frames per second
    ParticularFps(u8),
    MotionAdaptive,
}

/// What a client asked for when starting or switching a stream.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct FrameRequest {
    pub video: VideoFilter,
    pub mjpeg: MjpegFilter,
}

impl FrameRequest {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn new(video: VideoFilter, mjpeg: MjpegFilter) -> Self {
        Self { video, mjpeg }
    }
}

/// Inputs to one selection decision.
#[derive(Debug, Clone, Copy)]
pub struct SelectionInput {
    /// Codec of the tuple's video stream (audio frames are judged by it too)
    pub stream_codec: Codec,
    pub frame_kind: FrameKind,
    /// Configured camera frame rate, 0 if unknown
    pub camera_fps: u8,
    pub motion: bool,
    /// A video I-frame has been forwarded in this activation
    pub first_iframe_sent: bool,
}

/// Per-tuple frame selector.
#[derive(Debug, Clone)]
pub struct FrameSelector {
    request: FrameRequest,
    skip_counter: u32,
}

impl FrameSelector {
    pub fn new(request: FrameRequest) -> Self {
        Self {
            request,
            skip_counter: 0,
        }
    }

    /// Restart fps throttling from the beginning of a cycle.
    pub fn reset(&mut self) {
        self.skip_counter = 0;
    }

    /// Camera rate is only consulted for MJPEG particular-fps mode.
    pub fn needs_camera_fps(&self, stream_codec: Codec) -> bool {
        stream_codec == Codec::Mjpeg && matches!(self.request.mjpeg, MjpegFilter::ParticularFps(_))
    }

    pub fn should_send(&mut self, input: SelectionInput) -> bool {
        if input.stream_codec == Codec::Mjpeg {
            self.should_send_mjpeg(input)
        } else {
            self.should_send_video(input)
        }
    }

    fn should_send_mjpeg(&mut self, input: SelectionInput) -> bool {
        // MJPEG streams have no audio path
        if input.frame_kind == FrameKind::Audio {
            return false;
        }

        match self.request.mjpeg {
            MjpegFilter::All => {
                self.skip_counter = 0;
                true
            }
            MjpegFilter::MotionAdaptive => input.motion,
            MjpegFilter::ParticularFps(target) => self.throttle(input.camera_fps, target),
        }
    }

    fn throttle(&mut self, camera_fps: u8, target_fps: u8) -> bool {
        let camera_fps = camera_fps as u32;
        let target_fps = target_fps as u32;

        if target_fps == 0 || camera_fps <= target_fps {
            return true;
        }

        if target_fps > 10 {
            // Close to the camera rate: send `skip` frames, drop one
            let skip = camera_fps / (camera_fps - target_fps);
            if self.skip_counter < skip {
                self.skip_counter += 1;
                true
            } else {
                self.skip_counter = 0;
                false
            }
        } else {
            // Far below the camera rate: drop `skip - 1` frames, send one
            let skip = camera_fps / target_fps;
            self.skip_counter += 1;
            if self.skip_counter >= skip {
                self.skip_counter = 0;
                true
            } else {
                false
            }
        }
    }

    fn should_send_video(&self, input: SelectionInput) -> bool {
        match self.request.video {
            VideoFilter::All => true,
            VideoFilter::MotionAdaptive => input.frame_kind != FrameKind::Audio && input.motion,
            VideoFilter::KeyFrameOnly => match input.frame_kind {
                FrameKind::I => true,
                FrameKind::P => false,
                FrameKind::Audio => input.first_iframe_sent,
            },
        }
    }
}
