//! Per-tuple private state of a pump
//!
//! Owned and touched only by the client's pump thread, so none of it is
//! locked.

use std::sync::Arc;
use std::time::Instant;

use crate::admission::AdmissionPermit;
use crate::camera::ConnectionId;
use crate::policy::{FrameRequest, FrameSelector};
use crate::transport::Transport;
use crate::video_loss::LossDetector;
use crate::wire::HeaderTemplate;

/// Observable phase of a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TuplePhase {
    Idle,
    /// Pipeline started, client not yet acknowledged
    Starting,
    Streaming,
    /// Took over a connection from the other stream kind, waiting for the
    /// pipeline's first frame on the new stream
    SwitchPending,
}

pub(crate) enum TupleState {
    Idle,
    Active(ActiveTuple),
}

impl TupleState {
    pub fn phase(&self) -> TuplePhase {
        match self {
            TupleState::Idle => TuplePhase::Idle,
            TupleState::Active(active) if !active.first_callback_given => TuplePhase::Starting,
            TupleState::Active(active) if active.stream_switch => TuplePhase::SwitchPending,
            TupleState::Active(_) => TuplePhase::Streaming,
        }
    }

    pub fn active(&self) -> Option<&ActiveTuple> {
        match self {
            TupleState::Active(active) => Some(active),
            TupleState::Idle => None,
        }
    }

    pub fn active_mut(&mut self) -> Option<&mut ActiveTuple> {
        match self {
            TupleState::Active(active) => Some(active),
            TupleState::Idle => None,
        }
    }

    /// Leave `Idle` behind and hand back whatever was active.
    pub fn take(&mut self) -> Option<ActiveTuple> {
        match std::mem::replace(self, TupleState::Idle) {
            TupleState::Active(active) => Some(active),
            TupleState::Idle => None,
        }
    }
}

/// A tuple with a valid connection.
pub(crate) struct ActiveTuple {
    pub conn: ConnectionId,
    pub transport: Arc<dyn Transport>,
    /// Activation counter matching the pipeline's event handle
    pub generation: u64,
    pub audio: bool,
    pub loss: LossDetector,
    pub header: HeaderTemplate,
    pub selector: FrameSelector,
    pub first_iframe_sent: bool,
    pub first_callback_given: bool,
    pub stream_switch: bool,
    /// Held for as long as the tuple is active
    pub permit: AdmissionPermit,
}

impl ActiveTuple {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        camera: usize,
        conn: ConnectionId,
        transport: Arc<dyn Transport>,
        generation: u64,
        request: FrameRequest,
        permit: AdmissionPermit,
        now: Instant,
    ) -> Self {
        Self {
            conn,
            transport,
            generation,
            audio: false,
            loss: LossDetector::new(now),
            header: HeaderTemplate::new(camera),
            selector: FrameSelector::new(request),
            first_iframe_sent: false,
            first_callback_given: false,
            stream_switch: false,
            permit,
        }
    }

    /// Carry a live connection over to the other stream kind of the camera.
    ///
    /// Connection, transport, audio switch, loss timing and admission slot move
    /// with it; the client has already been answered, so the new tuple starts
    /// acknowledged and marked as switching.
    pub fn switch_to(self, camera: usize, generation: u64, request: FrameRequest) -> Self {
        Self {
            conn: self.conn,
            transport: self.transport,
            generation,
            audio: self.audio,
            loss: self.loss,
            header: HeaderTemplate::new(camera),
            selector: FrameSelector::new(request),
            first_iframe_sent: false,
            first_callback_given: true,
            stream_switch: true,
            permit: self.permit,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::admission::Admission;
    use crate::transport::MemoryTransport;

    fn active(admission: &Arc<Admission>) -> ActiveTuple {
        ActiveTuple::new(
            0,
            ConnectionId(1),
            MemoryTransport::new(),
            1,
            FrameRequest::all(),
            admission.try_acquire().unwrap(),
            Instant::now(),
        )
    }

    #[test]
    fn phases() {
        let admission = Admission::new(4, 1);
        let mut state = TupleState::Idle;
        assert_eq!(state.phase(), TuplePhase::Idle);

        state = TupleState::Active(active(&admission));
        assert_eq!(state.phase(), TuplePhase::Starting);

        state.active_mut().unwrap().first_callback_given = true;
        assert_eq!(state.phase(), TuplePhase::Streaming);

        state.active_mut().unwrap().stream_switch = true;
        assert_eq!(state.phase(), TuplePhase::SwitchPending);
    }

    #[test]
    fn take_leaves_idle_and_keeps_permit_until_dropped() {
        let admission = Admission::new(4, 1);
        let mut state = TupleState::Active(active(&admission));
        assert_eq!(admission.active(), 1);

        let taken = state.take().unwrap();
        assert_eq!(state.phase(), TuplePhase::Idle);
        assert_eq!(admission.active(), 1);
        drop(taken);
        assert_eq!(admission.active(), 0);
        assert!(state.take().is_none());
    }

    #[test]
    fn switch_moves_connection_and_permit() {
        let admission = Admission::new(4, 1);
        let mut old = active(&admission);
        old.audio = true;
        old.first_iframe_sent = true;

        let new = old.switch_to(0, 7, FrameRequest::all());
        assert_eq!(new.conn, ConnectionId(1));
        assert_eq!(new.generation, 7);
        assert!(new.audio);
        assert!(new.first_callback_given);
        assert!(new.stream_switch);
        assert!(!new.first_iframe_sent);
        assert_eq!(admission.active(), 1);
    }
}
