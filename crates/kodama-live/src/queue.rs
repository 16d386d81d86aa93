//! Per-client control queue
//!
//! A fixed ring of slots. Producers write at the tail only if that slot is
//! empty; a full ring refuses the insert instead of overwriting. The pump
//! consumes from the head.

use crate::camera::{ConnectionId, StreamEvents};
use crate::error::StreamStatus;
use crate::frame::StreamKind;
use crate::policy::FrameRequest;
use crate::transport::TransportKind;

/// A state change requested of a client's pump.
#[derive(Debug)]
pub enum ControlTrigger {
    /// Begin (or restart) live view of a tuple on a connection
    Start {
        camera: usize,
        kind: StreamKind,
        conn: ConnectionId,
        transport: TransportKind,
        request: FrameRequest,
    },
    /// The camera pipeline delivered the first frame (or failed to)
    FirstFrameAck {
        camera: usize,
        kind: StreamKind,
        generation: u64,
        status: StreamStatus,
    },
    Stop {
        camera: usize,
        kind: StreamKind,
    },
    /// Move the camera's active stream to `kind`
    ChangeStream {
        camera: usize,
        kind: StreamKind,
        request: FrameRequest,
    },
    AudioState {
        camera: usize,
        kind: StreamKind,
        enabled: bool,
    },
    /// Raised by the camera pipeline when it closes the stream underneath us
    ForceStop {
        camera: usize,
        kind: StreamKind,
        generation: u64,
    },
}

impl ControlTrigger {
    pub fn camera(&self) -> usize {
        match self {
            ControlTrigger::Start { camera, .. }
            | ControlTrigger::FirstFrameAck { camera, .. }
            | ControlTrigger::Stop { camera, .. }
            | ControlTrigger::ChangeStream { camera, .. }
            | ControlTrigger::AudioState { camera, .. }
            | ControlTrigger::ForceStop { camera, .. } => *camera,
        }
    }

    pub fn kind(&self) -> StreamKind {
        match self {
            ControlTrigger::Start { kind, .. }
            | ControlTrigger::FirstFrameAck { kind, .. }
            | ControlTrigger::Stop { kind, .. }
            | ControlTrigger::ChangeStream { kind, .. }
            | ControlTrigger::AudioState { kind, .. }
            | ControlTrigger::ForceStop { kind, .. } => *kind,
        }
    }

    /// Build the acknowledgement trigger for an event handle.
    pub(crate) fn ack(events: &StreamEvents, status: StreamStatus) -> Self {
        ControlTrigger::FirstFrameAck {
            camera: events.camera(),
            kind: events.kind(),
            generation: events.generation(),
            status,
        }
    }
}

/// Bounded ring of control triggers.
#[derive(Debug)]
pub struct CommandQueue {
    slots: Vec<Option<ControlTrigger>>,
    head: usize,
    tail: usize,
}

impl CommandQueue {
    pub fn new(capacity: usize) -> Self {
        let mut slots = Vec::with_capacity(capacity);
        slots.resize_with(capacity.max(1), || None);
        Self {
            slots,
            head: 0,
            tail: 0,
        }
    }

    pub fn capacity(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots[self.head].is_none()
    }

    pub fn len(&self) -> usize {
        self.slots.iter().filter(|s| s.is_some()).count()
    }

    /// Insert at the tail. Gives the trigger back if the slot is occupied.
    pub fn push(&mut self, trigger: ControlTrigger) -> Result<(), ControlTrigger> {
        let slot = &mut self.slots[self.tail];
        if slot.is_some() {
            return Err(trigger);
        }
        *slot = Some(trigger);
        self.tail = (self.tail + 1) % self.slots.len();
        Ok(())
    }

    pub fn pop(&mut self) -> Option<ControlTrigger> {
        let trigger = self.slots[self.head].take()?;
        self.head = (self.head + 1) % self.slots.len();
        Some(trigger)
    }

    /// Undo the most recent `push` (used when the pump could not be started).
    pub fn retract_last(&mut self) -> Option<ControlTrigger> {
        let last = (self.tail + self.slots.len() - 1) % self.slots.len();
        let trigger = self.slots[last].take()?;
        self.tail = last;
        Some(trigger)
    }

    pub fn clear(&mut self) {
        self.slots.iter_mut().for_each(|s| *s = None);
        self.head = 0;
        self.tail = 0;
    }
}
