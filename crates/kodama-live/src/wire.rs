//! Wire format for live frames
//!
//! Each frame is sent as one buffer: a fixed header immediately followed by
//! the payload. All multi-byte fields are big-endian.
//!
//! ```text
//! ┌───────┬─────┬─────────┬─────────┬───────┬────────────┬──────┬─────┬──────┐
//! │ magic │ ver │ product │ channel │ codec │ resolution │ kind │ fps │ refs │
//! │  (4)  │ (1) │   (1)   │   (1)   │  (1)  │    (1)     │ (1)  │ (1) │ (1)  │
//! ├───────┴─────┴────┬────┴─────────┴─┬─────┴──────┬─────┴──────┴─┬───┴──────┤
//! │ timestamp ms (8) │ media status(1)│ vid loss(1)│ reserved (2)  │ total(4) │
//! └──────────────────┴────────────────┴────────────┴───────────────┴──────────┘
//! ```
//!
//! `total` is header + payload length. A video-loss or config-change header
//! carries no payload, so its total equals [`FRAME_HEADER_SIZE`].

use anyhow::Result;
use bytes::{Buf, BufMut, Bytes, BytesMut};

use crate::frame::{Codec, FrameKind, MediaFrame, MediaStatus, Resolution};
use crate::protocol::{FRAME_HEADER_SIZE, FRAME_MAGIC, HEADER_VERSION, PRODUCT_TYPE};

/// Decoded or to-be-encoded live frame header.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FrameHeader {
    pub version: u8,
    pub product_type: u8,
    /// One-based camera channel
    pub channel: u8,
    pub codec: Codec,
    pub resolution: Resolution,
    pub kind: FrameKind,
    pub fps: u8,
    pub ref_frame_count: u8,
    pub timestamp_ms: u64,
    pub media_status: MediaStatus,
    pub video_loss: bool,
    /// Header plus payload length
    pub total_len: u32,
}

/// Per-tuple header fields that survive between frames.
///
/// Refreshed from every video frame so synthetic headers (video loss, config
/// change) describe the stream the client last saw.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeaderTemplate {
    pub channel: u8,
    pub codec: Codec,
    pub resolution: Resolution,
    pub fps: u8,
    pub ref_frame_count: u8,
}

impl HeaderTemplate {
    pub fn new(camera: usize) -> Self {
        Self {
            channel: channel_for_camera(camera),
            codec: Codec::Unknown(0),
            resolution: Resolution::Unknown(0),
            fps: 0,
            ref_frame_count: 0,
        }
    }

    /// Take the stream parameters of a video frame.
    pub fn refresh(&mut self, frame: &MediaFrame) {
        if frame.is_audio() {
            return;
        }
        self.codec = frame.codec;
        self.resolution = frame.resolution;
        self.fps = frame.fps;
        self.ref_frame_count = frame.ref_frame_count;
    }

    /// Header for a real frame.
    pub fn header_for(&self, frame: &MediaFrame) -> FrameHeader {
        let resolution = if frame.is_audio() {
            self.resolution
        } else {
            frame.resolution
        };
        FrameHeader {
            version: HEADER_VERSION,
            product_type: PRODUCT_TYPE,
            channel: self.channel,
            codec: frame.codec,
            resolution,
            kind: frame.kind,
            fps: frame.fps,
            ref_frame_count: frame.ref_frame_count,
            timestamp_ms: frame.timestamp_ms,
            media_status: frame.status,
            video_loss: false,
            total_len: (FRAME_HEADER_SIZE + frame.payload.len()) as u32,
        }
    }

    /// Payload-less header announcing video loss.
    pub fn video_loss(&self, timestamp_ms: u64) -> FrameHeader {
        self.header_only(timestamp_ms, MediaStatus::Normal, true)
    }

    /// Payload-less header telling the client the stream configuration changed.
    pub fn config_change(&self, timestamp_ms: u64) -> FrameHeader {
        self.header_only(timestamp_ms, MediaStatus::ConfigChange, false)
    }

    fn header_only(&self, timestamp_ms: u64, media_status: MediaStatus, video_loss: bool) -> FrameHeader {
        FrameHeader {
            version: HEADER_VERSION,
            product_type: PRODUCT_TYPE,
            channel: self.channel,
            codec: self.codec,
            resolution: self.resolution,
            kind: FrameKind::I,
            fps: self.fps,
            ref_frame_count: self.ref_frame_count,
            timestamp_ms,
            media_status,
            video_loss,
            total_len: FRAME_HEADER_SIZE as u32,
        }
    }
}

/// One-based channel number shown to clients for a zero-based camera index.
pub fn channel_for_camera(camera: usize) -> u8 {
    (camera + 1).min(u8::MAX as usize) as u8
}

impl FrameHeader {
    /// Append the header to `buf`.
    pub fn encode(&self, buf: &mut BytesMut) {
        buf.put_u32(FRAME_MAGIC);
        buf.put_u8(self.version);
        buf.put_u8(self.product_type);
        buf.put_u8(self.channel);
        buf.put_u8(self.codec.as_u8());
        buf.put_u8(self.resolution.as_u8());
        buf.put_u8(self.kind.as_u8());
        buf.put_u8(self.fps);
        buf.put_u8(self.ref_frame_count);
        buf.put_u64(self.timestamp_ms);
        buf.put_u8(self.media_status.as_u8());
        buf.put_u8(self.video_loss as u8);
        buf.put_u16(0);
        buf.put_u32(self.total_len);
    }

    /// Parse a header from the front of `buf`.
    pub fn decode(mut buf: &[u8]) -> Result<Self> {
        if buf.len() < FRAME_HEADER_SIZE {
            anyhow::bail!(
                "Buffer too small for frame header: {} < {}",
                buf.len(),
                FRAME_HEADER_SIZE
            );
        }

        let magic = buf.get_u32();
        if magic != FRAME_MAGIC {
            anyhow::bail!("Bad frame magic: {:#010x}", magic);
        }

        let version = buf.get_u8();
        let product_type = buf.get_u8();
        let channel = buf.get_u8();
        let codec = Codec::from(buf.get_u8());
        let resolution = Resolution::from(buf.get_u8());
        let kind = FrameKind::try_from(buf.get_u8())
            .map_err(|v| anyhow::anyhow!("Unknown frame kind {}", v))?;
        let fps = buf.get_u8();
        let ref_frame_count = buf.get_u8();
        let timestamp_ms = buf.get_u64();
        let media_status = MediaStatus::from(buf.get_u8());
        let video_loss = buf.get_u8() != 0;
        let _reserved = buf.get_u16();
        let total_len = buf.get_u32();

        if (total_len as usize) < FRAME_HEADER_SIZE {
            anyhow::bail!("Total length smaller than header: {}", total_len);
        }

        Ok(Self {
            version,
            product_type,
            channel,
            codec,
            resolution,
            kind,
            fps,
            ref_frame_count,
            timestamp_ms,
            media_status,
            video_loss,
            total_len,
        })
    }
}

/// Build the outgoing buffer for a header and its payload.
///
/// Fails if the total would exceed `max_len`; nothing is truncated.
pub fn encode_frame(header: &FrameHeader, payload: &[u8], max_len: usize) -> Result<Bytes> {
    let total = FRAME_HEADER_SIZE + payload.len();
    if total > max_len {
        anyhow::bail!("Frame too large: {} > {}", total, max_len);
    }

    let mut buf = BytesMut::with_capacity(total);
    header.encode(&mut buf);
    buf.put_slice(payload);
    Ok(buf.freeze())
}
