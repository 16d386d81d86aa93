//! Protocol constants for live view delivery

use std::time::Duration;

/// Marker at the start of every live frame header.
pub const FRAME_MAGIC: u32 = 0x4B4C_5646; // "KLVF"

/// Header layout version.
pub const HEADER_VERSION: u8 = 1;

/// Product type advertised to clients.
pub const PRODUCT_TYPE: u8 = 0x21;

/// Frame header size in bytes.
///
/// magic(4) + version(1) + product(1) + channel(1) + codec(1) + resolution(1)
/// + frame kind(1) + fps(1) + ref frames(1) + timestamp(8) + media status(1)
/// + video loss(1) + reserved(2) + total length(4)
pub const FRAME_HEADER_SIZE: usize = 4 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 1 + 8 + 1 + 1 + 2 + 4; // 28 bytes

/// Default upper bound on header + payload for one live frame (2 MB).
pub const MAX_LIVE_FRAME_SIZE: usize = 2 * 1024 * 1024;

/// Live streams admitted per camera before the global cap refuses more.
pub const STREAMS_PER_CAMERA: usize = 4;

/// Default number of client sessions.
pub const DEFAULT_MAX_CLIENTS: usize = 16;

/// Default control queue depth per client.
pub const DEFAULT_QUEUE_CAPACITY: usize = 16;

/// Longest idle wait of a pump before it re-evaluates video loss.
pub const IDLE_WAIT: Duration = Duration::from_secs(10);

/// Per-frame transmit timeout.
pub const SEND_TIMEOUT: Duration = Duration::from_secs(5);

/// Work one pump does in a servicing slice before yielding.
pub const SLICE_BUDGET: Duration = Duration::from_secs(1);

/// Default silence after which a camera is reported as lost.
pub const PRE_VIDEO_LOSS: Duration = Duration::from_secs(10);

/// Loss is declared this much early (two 100 ms ticks) to absorb idle-wait lag.
pub const LOSS_EARLY_MARGIN: Duration = Duration::from_millis(200);
