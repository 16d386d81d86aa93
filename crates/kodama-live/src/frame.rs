//! Media types handed over by the camera pipeline

use bytes::Bytes;
use serde::{Deserialize, Serialize};

/// Which encoder output of a camera a tuple is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum StreamKind {
    /// Full resolution stream
    Main,
    /// Reduced resolution stream
    Sub,
}

impl StreamKind {
    /// Both kinds, in slot order.
    pub const ALL: [StreamKind; 2] = [StreamKind::Main, StreamKind::Sub];

    /// Slot index within a camera row (main = 0, sub = 1).
    pub fn index(self) -> usize {
        match self {
            StreamKind::Main => 0,
            StreamKind::Sub => 1,
        }
    }

    /// The other kind of the same camera.
    pub fn other(self) -> StreamKind {
        match self {
            StreamKind::Main => StreamKind::Sub,
            StreamKind::Sub => StreamKind::Main,
        }
    }

    pub fn from_index(index: usize) -> Option<StreamKind> {
        match index {
            0 => Some(StreamKind::Main),
            1 => Some(StreamKind::Sub),
            _ => None,
        }
    }
}

impl std::fmt::Display for StreamKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StreamKind::Main => write!(f, "main"),
            StreamKind::Sub => write!(f, "sub"),
        }
    }
}

/// Codec of a frame.
///
/// `Unknown` keeps frames from newer pipelines flowing instead of failing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Codec {
    H264,
    H265,
    Mpeg4,
    Mjpeg,
    G711Ulaw,
    G711Alaw,
    Aac,
    Unknown(u8),
}

impl Codec {
    /// Convert to the wire-format byte value.
    pub fn as_u8(&self) -> u8 {
        match self {
            Codec::H264 => 1,
            Codec::H265 => 2,
            Codec::Mpeg4 => 3,
            Codec::Mjpeg => 4,
            Codec::G711Ulaw => 5,
            Codec::G711Alaw => 6,
            Codec::Aac => 7,
            Codec::Unknown(v) => *v,
        }
    }

    pub fn is_audio(&self) -> bool {
        matches!(self, Codec::G711Ulaw | Codec::G711Alaw | Codec::Aac)
    }
}

impl From<u8> for Codec {
    fn from(value: u8) -> Self {
        match value {
            1 => Codec::H264,
            2 => Codec::H265,
            3 => Codec::Mpeg4,
            4 => Codec::Mjpeg,
            5 => Codec::G711Ulaw,
            6 => Codec::G711Alaw,
            7 => Codec::Aac,
            v => Codec::Unknown(v),
        }
    }
}

/// Encoded resolution class.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Resolution {
    Qcif,
    Cif,
    D1,
    Hd720,
    Hd1080,
    Qhd,
    Uhd4k,
    Unknown(u8),
}

impl Resolution {
    pub fn as_u8(&self) -> u8 {
        match self {
            Resolution::Qcif => 1,
            Resolution::Cif => 2,
            Resolution::D1 => 3,
            Resolution::Hd720 => 4,
            Resolution::Hd1080 => 5,
            Resolution::Qhd => 6,
            Resolution::Uhd4k => 7,
            Resolution::Unknown(v) => *v,
        }
    }
}

impl From<u8> for Resolution {
    fn from(value: u8) -> Self {
        match value {
            1 => Resolution::Qcif,
            2 => Resolution::Cif,
            3 => Resolution::D1,
            4 => Resolution::Hd720,
            5 => Resolution::Hd1080,
            6 => Resolution::Qhd,
            7 => Resolution::Uhd4k,
            v => Resolution::Unknown(v),
        }
    }
}

/// Frame type within a stream.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum FrameKind {
    /// Self-contained key frame
    I,
    /// Predicted frame, depends on earlier frames
    P,
    /// Audio packet
    Audio,
}

impl FrameKind {
    pub fn as_u8(&self) -> u8 {
        match self {
            FrameKind::I => 0,
            FrameKind::P => 1,
            FrameKind::Audio => 2,
        }
    }
}

impl TryFrom<u8> for FrameKind {
    type Error = u8;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        match value {
            0 => Ok(FrameKind::I),
            1 => Ok(FrameKind::P),
            2 => Ok(FrameKind::Audio),
            v => Err(v),
        }
    }
}

/// Stream condition reported in every header.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MediaStatus {
    #[default]
    Normal,
    /// Encoder parameters changed; the client must reinitialise its decoder
    ConfigChange,
    /// Stream ended by the camera side
    StreamClosed,
    Unknown(u8),
}

impl MediaStatus {
    pub fn as_u8(&self) -> u8 {
        match self {
            MediaStatus::Normal => 0,
            MediaStatus::ConfigChange => 1,
            MediaStatus::StreamClosed => 2,
            MediaStatus::Unknown(v) => *v,
        }
    }
}

impl From<u8> for MediaStatus {
    fn from(value: u8) -> Self {
        match value {
            0 => MediaStatus::Normal,
            1 => MediaStatus::ConfigChange,
            2 => MediaStatus::StreamClosed,
            v => MediaStatus::Unknown(v),
        }
    }
}

/// A frame pulled from the camera pipeline for live delivery.
#[derive(Debug, Clone)]
pub struct MediaFrame {
    pub codec: Codec,
    pub resolution: Resolution,
    pub kind: FrameKind,
    /// Encoder frame rate at the time of capture
    pub fps: u8,
    /// Reference frames the decoder must keep
    pub ref_frame_count: u8,
    /// Capture time, milliseconds since the Unix epoch
    pub timestamp_ms: u64,
    pub status: MediaStatus,
    pub payload: Bytes,
}

impl MediaFrame {
    /// Create a video frame
    pub fn video(codec: Codec, kind: FrameKind, payload: Bytes) -> Self {
        Self {
            codec,
            resolution: Resolution::Hd1080,
            kind,
            fps: 30,
            ref_frame_count: 1,
            timestamp_ms: 0, // Caller should set
            status: MediaStatus::Normal,
            payload,
        }
    }

    /// Create an audio frame
    pub fn audio(codec: Codec, payload: Bytes) -> Self {
        Self {
            codec,
            resolution: Resolution::Unknown(0),
            kind: FrameKind::Audio,
            fps: 0,
            ref_frame_count: 0,
            timestamp_ms: 0,
            status: MediaStatus::Normal,
            payload,
        }
    }

    /// Set the timestamp and return self (builder pattern)
    pub fn with_timestamp(mut self, timestamp_ms: u64) -> Self {
        self.timestamp_ms = timestamp_ms;
        self
    }

    pub fn with_resolution(mut self, resolution: Resolution) -> Self {
        self.resolution = resolution;
        self
    }

    pub fn with_fps(mut self, fps: u8) -> Self {
        self.fps = fps;
        self
    }

    pub fn is_audio(&self) -> bool {
        self.kind == FrameKind::Audio
    }

    pub fn is_key_frame(&self) -> bool {
        self.kind == FrameKind::I
    }
}
