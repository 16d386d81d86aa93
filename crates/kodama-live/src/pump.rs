//! Per-client stream pump
//!
//! One pump thread serves every (camera, stream) tuple of one client. Each
//! pass it:
//!
//! 1. Drains the control queue, applying Start / Ack / Stop / ChangeStream /
//!    AudioState / ForceStop transitions
//! 2. Exits once no tuple holds a connection and nothing is queued
//! 3. Emits video-loss headers for tuples that have gone silent
//! 4. Waits on the session condvar for triggers or frames
//! 5. Forwards buffered frames through the selection policy, starting at the
//!    tuple where the previous slice ran out of budget
//!
//! The wait in step 4 is bounded by the idle wait and by the earliest
//! pending loss deadline. It doubles as the loss detector's clock, so it must
//! stay a timed wait even when there is nothing to forward.
//!
//! Every teardown goes through [`Pump::cleanup`], which stops the pipeline,
//! closes the connection and returns the admission slot.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use anyhow::Result;
use tracing::{debug, error, info, warn};

use crate::admission::Admission;
use crate::camera::{CameraInterface, ConnectionId, StreamEvents, StreamId};
use crate::config::LiveConfig;
use crate::error::StreamStatus;
use crate::frame::StreamKind;
use crate::motion::MotionState;
use crate::policy::{FrameRequest, SelectionInput};
use crate::queue::ControlTrigger;
use crate::session::ClientSession;
use crate::stats::LiveCounters;
use crate::transport::{Transport, TransportKind, TransportTable};
use crate::tuple::{ActiveTuple, TuplePhase, TupleState};
use crate::video_loss::LossDetector;
use crate::wire::{encode_frame, FrameHeader};

/// State shared by every pump of a streamer.
pub(crate) struct PumpContext {
    pub config: LiveConfig,
    pub camera: Arc<dyn CameraInterface>,
    pub transports: TransportTable,
    pub admission: Arc<Admission>,
    pub motion: MotionState,
    pub counters: LiveCounters,
    camera_count: usize,
    generation: AtomicU64,
}

impl PumpContext {
    pub fn new(
        config: LiveConfig,
        camera: Arc<dyn CameraInterface>,
        transports: TransportTable,
    ) -> Self {
        let camera_count = camera.camera_count();
        Self {
            admission: Admission::new(config.streams_per_camera, camera_count),
            motion: MotionState::new(camera_count),
            counters: LiveCounters::default(),
            config,
            camera,
            transports,
            camera_count,
            generation: AtomicU64::new(0),
        }
    }

    pub fn camera_count(&self) -> usize {
        self.camera_count
    }

    fn next_generation(&self) -> u64 {
        self.generation.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Flow {
    Continue,
    Exit,
}

/// Result of pulling one frame for a tuple.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pull {
    Forwarded,
    /// Pulled but withheld (policy, audio switch, size)
    Withheld,
    /// Nothing buffered, or the tuple cannot forward yet
    Empty,
    /// The tuple was torn down
    Closed,
}

/// One client's pump. Owns the private per-tuple state.
pub(crate) struct Pump {
    ctx: Arc<PumpContext>,
    session: Arc<ClientSession>,
    /// `[camera][stream kind]`
    tuples: Vec<[TupleState; 2]>,
    /// Tuples holding a connection
    total_camera: usize,
    /// Slot where the next servicing slice starts
    cursor: usize,
}

impl Pump {
    pub fn new(ctx: Arc<PumpContext>, session: Arc<ClientSession>) -> Self {
        let tuples = (0..ctx.camera_count())
            .map(|_| [TupleState::Idle, TupleState::Idle])
            .collect();
        Self {
            ctx,
            session,
            tuples,
            total_camera: 0,
            cursor: 0,
        }
    }

    /// Thread body. Returns once the session has been released.
    pub fn run(mut self) {
        let client = self.session.client();
        info!(client, "Live pump started");
        while self.step() == Flow::Continue {}
        info!(client, "Live pump exited");
    }

    fn step(&mut self) -> Flow {
        if self.drain() == Flow::Exit {
            self.teardown_all();
            return Flow::Exit;
        }

        {
            let mut state = self.session.lock();
            if state.shutdown {
                drop(state);
                self.teardown_all();
                return Flow::Exit;
            }
            // Decided under the lock so a concurrent post either lands before
            // we look or sees the session inactive and starts a new pump.
            if self.total_camera == 0 && state.queue.is_empty() {
                state.running = false;
                state.take_available();
                return Flow::Exit;
            }
        }

        self.check_video_loss(Instant::now());

        if let Some(available) = self.wait_for_work() {
            self.service(&available);
        }
        Flow::Continue
    }

    /// Apply queued triggers, at most one queue's worth per pass.
    fn drain(&mut self) -> Flow {
        let capacity = self.session.lock().queue.capacity();
        for _ in 0..capacity {
            let trigger = {
                let mut state = self.session.lock();
                if state.shutdown {
                    return Flow::Exit;
                }
                match state.queue.pop() {
                    Some(trigger) => trigger,
                    None => return Flow::Continue,
                }
            };
            self.apply(trigger, Instant::now());
        }
        Flow::Continue
    }

    fn wait_for_work(&mut self) -> Option<Vec<[bool; 2]>> {
        let timeout = self.wait_timeout(Instant::now());
        let mut state = self.session.lock();
        if state.queue.is_empty() && !state.any_available() && !state.shutdown {
            state = self.session.wait(state, timeout);
        }
        if state.any_available() {
            Some(state.take_available())
        } else {
            None
        }
    }

    /// Idle wait, shortened to the earliest pending loss deadline.
    fn wait_timeout(&self, now: Instant) -> Duration {
        let pre_loss = self.ctx.config.pre_video_loss;
        let margin = self.ctx.config.loss_early_margin;
        self.tuples
            .iter()
            .flatten()
            .filter_map(TupleState::active)
            .filter(|active| active.first_callback_given)
            .filter_map(|active| active.loss.deadline(pre_loss, margin))
            .map(|deadline| deadline.saturating_duration_since(now))
            .fold(self.ctx.config.idle_wait, Duration::min)
    }

    // ========== Transitions ==========

    fn apply(&mut self, trigger: ControlTrigger, now: Instant) {
        if trigger.camera() >= self.tuples.len() {
            warn!(
                client = self.session.client(),
                camera = trigger.camera(),
                stream = %trigger.kind(),
                "Ignoring trigger for unconfigured camera"
            );
            return;
        }

        match trigger {
            ControlTrigger::Start {
                camera,
                kind,
                conn,
                transport,
                request,
            } => self.on_start(camera, kind, conn, transport, request, now),
            ControlTrigger::FirstFrameAck {
                camera,
                kind,
                generation,
                status,
            } => self.on_first_frame_ack(camera, kind, generation, status, now),
            ControlTrigger::Stop { camera, kind } => self.on_stop(camera, kind),
            ControlTrigger::ChangeStream {
                camera,
                kind,
                request,
            } => self.on_change_stream(camera, kind, request),
            ControlTrigger::AudioState {
                camera,
                kind,
                enabled,
            } => self.on_audio_state(camera, kind, enabled),
            ControlTrigger::ForceStop {
                camera,
                kind,
                generation,
            } => self.on_force_stop(camera, kind, generation),
        }
    }

    fn on_start(
        &mut self,
        camera: usize,
        kind: StreamKind,
        conn: ConnectionId,
        transport_kind: TransportKind,
        request: FrameRequest,
        now: Instant,
    ) {
        let client = self.session.client();

        let phase = self.tuples[camera][kind.index()].phase();
        if phase != TuplePhase::Idle {
            info!(client, camera, stream = %kind, ?phase, "Restarting live stream");
            self.cleanup(camera, kind);
        }

        let Some(transport) = self.ctx.transports.get(transport_kind).cloned() else {
            warn!(client, camera, %conn, ?transport_kind, "No transport registered");
            return;
        };

        let Some(permit) = self.ctx.admission.try_acquire() else {
            warn!(
                client,
                camera,
                stream = %kind,
                limit = self.ctx.admission.ceiling(),
                "Live stream limit reached"
            );
            respond(&*transport, StreamStatus::MaxStreamLimit, conn, true, client);
            return;
        };

        let generation = self.ctx.next_generation();
        if let Err(status) = self.start_pipeline(camera, kind, request, generation) {
            warn!(client, camera, stream = %kind, %status, "Camera pipeline refused stream");
            respond(&*transport, status, conn, true, client);
            return;
        }

        self.tuples[camera][kind.index()] = TupleState::Active(ActiveTuple::new(
            camera, conn, transport, generation, request, permit, now,
        ));
        self.total_camera += 1;
        info!(client, camera, stream = %kind, %conn, generation, "Live stream starting");
    }

    fn on_first_frame_ack(
        &mut self,
        camera: usize,
        kind: StreamKind,
        generation: u64,
        status: StreamStatus,
        now: Instant,
    ) {
        let client = self.session.client();
        let Some(active) = self.tuples[camera][kind.index()].active_mut() else {
            debug!(client, camera, stream = %kind, "Acknowledgement for idle stream");
            return;
        };
        if active.generation != generation {
            debug!(client, camera, stream = %kind, generation, "Ignoring stale acknowledgement");
            return;
        }

        if !status.is_success() {
            warn!(client, camera, stream = %kind, %status, "Camera pipeline failed to start stream");
            respond(&*active.transport, status, active.conn, false, client);
            self.cleanup(camera, kind);
            return;
        }

        if active.stream_switch {
            // Client was answered when the switch was requested
            active.stream_switch = false;
            debug!(client, camera, stream = %kind, "Switched stream running");
        } else if active.first_callback_given {
            debug!(client, camera, stream = %kind, "Duplicate acknowledgement");
            return;
        } else {
            respond(&*active.transport, StreamStatus::Success, active.conn, false, client);
            active.first_callback_given = true;
            active.loss = LossDetector::new(now);
            info!(client, camera, stream = %kind, conn = %active.conn, "Live stream started");
        }

        // Frames buffered while waiting for the ack
        self.session.set_frame_available(camera, kind);
    }

    fn on_stop(&mut self, camera: usize, kind: StreamKind) {
        if self.tuples[camera][kind.index()].active().is_some() {
            self.cleanup(camera, kind);
        } else {
            debug!(
                client = self.session.client(),
                camera,
                stream = %kind,
                "Stop for idle stream"
            );
        }
    }

    fn on_change_stream(&mut self, camera: usize, kind: StreamKind, request: FrameRequest) {
        let client = self.session.client();
        let from = kind.other();

        let Some(previous) = self.tuples[camera][from.index()].take() else {
            warn!(client, camera, stream = %kind, "Stream change without an active stream");
            return;
        };

        let refusal = if !previous.first_callback_given {
            Some("previous stream not acknowledged yet")
        } else if self.tuples[camera][kind.index()].active().is_some() {
            Some("target stream already active")
        } else {
            None
        };
        if let Some(reason) = refusal {
            warn!(client, camera, from = %from, to = %kind, "Stream change refused: {}", reason);
            respond(&*previous.transport, StreamStatus::ResourceLimit, previous.conn, false, client);
            self.tuples[camera][from.index()] = TupleState::Active(previous);
            return;
        }

        let generation = self.ctx.next_generation();
        if let Err(status) = self.start_pipeline(camera, kind, request, generation) {
            warn!(client, camera, from = %from, to = %kind, %status, "Camera pipeline refused stream change");
            respond(&*previous.transport, status, previous.conn, false, client);
            self.tuples[camera][from.index()] = TupleState::Active(previous);
            return;
        }

        respond(&*previous.transport, StreamStatus::Success, previous.conn, false, client);
        let conn = previous.conn;
        self.tuples[camera][kind.index()] =
            TupleState::Active(previous.switch_to(camera, generation, request));
        self.ctx
            .camera
            .stop_stream(self.stream_id(camera, from), client);
        self.session.clear_frame_available(camera, from);
        info!(client, camera, from = %from, to = %kind, %conn, generation, "Live stream switched");
    }

    fn on_audio_state(&mut self, camera: usize, kind: StreamKind, enabled: bool) {
        let client = self.session.client();
        match self.tuples[camera][kind.index()].active_mut() {
            Some(active) => {
                active.audio = enabled;
                debug!(client, camera, stream = %kind, enabled, "Audio state changed");
            }
            None => debug!(client, camera, stream = %kind, "Audio state for idle stream"),
        }
    }

    fn on_force_stop(&mut self, camera: usize, kind: StreamKind, generation: u64) {
        let client = self.session.client();
        let Some(active) = self.tuples[camera][kind.index()].active() else {
            return;
        };
        if active.generation != generation {
            debug!(client, camera, stream = %kind, generation, "Ignoring stale force stop");
            return;
        }

        if !active.first_callback_given {
            respond(&*active.transport, StreamStatus::CodecNotSupported, active.conn, false, client);
        }
        let header = active.header.config_change(unix_millis());
        if let Err(e) = send_header(active, &header, &self.ctx.config) {
            warn!(client, camera, stream = %kind, "Failed to send config change: {:#}", e);
        }
        info!(client, camera, stream = %kind, "Camera pipeline closed live stream");
        self.cleanup(camera, kind);
    }

    fn start_pipeline(
        &self,
        camera: usize,
        kind: StreamKind,
        request: FrameRequest,
        generation: u64,
    ) -> Result<(), StreamStatus> {
        let stream = self.stream_id(camera, kind);
        let client = self.session.client();
        let events = StreamEvents::new(Arc::clone(&self.session), camera, kind, generation);
        self.ctx.camera.init_stream_session(stream, client, request)?;
        self.ctx.camera.start_stream(stream, client, events)
    }

    /// Tear one tuple down. The only path that ends an activation.
    fn cleanup(&mut self, camera: usize, kind: StreamKind) {
        let Some(active) = self.tuples[camera][kind.index()].take() else {
            return;
        };
        let client = self.session.client();

        self.ctx
            .camera
            .stop_stream(self.stream_id(camera, kind), client);
        if let Err(e) = active.transport.close(active.conn) {
            debug!(client, conn = %active.conn, "Close failed: {:#}", e);
        }
        self.total_camera = self.total_camera.saturating_sub(1);
        self.session.clear_frame_available(camera, kind);
        info!(client, camera, stream = %kind, conn = %active.conn, "Live stream stopped");
        // Dropping the tuple returns its admission slot
        drop(active);
    }

    fn teardown_all(&mut self) {
        let client = self.session.client();
        for camera in 0..self.tuples.len() {
            for kind in StreamKind::ALL {
                if let Some(active) = self.tuples[camera][kind.index()].active() {
                    respond(&*active.transport, StreamStatus::StreamClosed, active.conn, false, client);
                    self.cleanup(camera, kind);
                }
            }
        }

        let mut state = self.session.lock();
        state.queue.clear();
        state.take_available();
        state.running = false;
    }

    // ========== Forwarding ==========

    /// Forward buffered frames of the flagged tuples until the slice budget
    /// runs out. Unfinished tuples are re-flagged for the next slice.
    fn service(&mut self, available: &[[bool; 2]]) {
        let slots = self.tuples.len() * 2;
        if slots == 0 {
            return;
        }
        let start = self.cursor % slots;
        let begun = Instant::now();
        let flagged = |slot: usize| {
            available
                .get(slot / 2)
                .is_some_and(|row| row[slot % 2])
        };

        for step in 0..slots {
            let slot = (start + step) % slots;
            if !flagged(slot) {
                continue;
            }
            let (camera, kind) = (slot / 2, StreamKind::ALL[slot % 2]);

            loop {
                match self.forward_next(camera, kind, Instant::now()) {
                    Pull::Forwarded | Pull::Withheld => {}
                    Pull::Empty | Pull::Closed => break,
                }
                if begun.elapsed() >= self.ctx.config.slice_budget {
                    self.cursor = slot;
                    for rest in step..slots {
                        let slot = (start + rest) % slots;
                        if flagged(slot) {
                            self.session
                                .set_frame_available(slot / 2, StreamKind::ALL[slot % 2]);
                        }
                    }
                    return;
                }
            }
        }
    }

    fn forward_next(&mut self, camera: usize, kind: StreamKind, now: Instant) -> Pull {
        let client = self.session.client();
        let stream = self.stream_id(camera, kind);
        let Some(active) = self.tuples[camera][kind.index()].active_mut() else {
            return Pull::Empty;
        };
        // Frames stay buffered in the pipeline until the client has its ack
        if !active.first_callback_given {
            return Pull::Empty;
        }

        let frame = match self
            .ctx
            .camera
            .next_frame(stream, client, !active.first_iframe_sent)
        {
            Ok(Some(frame)) => frame,
            Ok(None) => return Pull::Empty,
            Err(e) => {
                warn!(client, camera, stream = %kind, "Failed to read frame: {:#}", e);
                return Pull::Empty;
            }
        };

        // Audio alone does not end a video outage
        if !frame.is_audio() {
            active.loss.frame_received(now);
        }
        active.header.refresh(&frame);

        if frame.is_audio() && !active.audio {
            LiveCounters::bump(&self.ctx.counters.frames_filtered);
            return Pull::Withheld;
        }

        let stream_codec = active.header.codec;
        let camera_fps = if active.selector.needs_camera_fps(stream_codec) {
            self.ctx.camera.fps_gop(camera, kind).0
        } else {
            0
        };
        let send = active.selector.should_send(SelectionInput {
            stream_codec,
            frame_kind: frame.kind,
            camera_fps,
            motion: self.ctx.motion.is_active(camera),
            first_iframe_sent: active.first_iframe_sent,
        });
        if !send {
            LiveCounters::bump(&self.ctx.counters.frames_filtered);
            return Pull::Withheld;
        }

        let header = active.header.header_for(&frame);
        let buf = match encode_frame(&header, &frame.payload, self.ctx.config.max_frame_size) {
            Ok(buf) => buf,
            Err(e) => {
                error!(client, camera, stream = %kind, "Dropping live frame: {:#}", e);
                LiveCounters::bump(&self.ctx.counters.frames_oversized);
                return Pull::Withheld;
            }
        };

        if let Err(e) = active
            .transport
            .send(active.conn, &buf, self.ctx.config.send_timeout)
        {
            warn!(client, camera, stream = %kind, conn = %active.conn, "Live send failed: {:#}", e);
            LiveCounters::bump(&self.ctx.counters.send_failures);
            self.cleanup(camera, kind);
            return Pull::Closed;
        }

        if frame.is_key_frame() {
            active.first_iframe_sent = true;
        }
        LiveCounters::bump(&self.ctx.counters.frames_sent);
        debug!(client, camera, stream = %kind, kind = ?frame.kind, len = buf.len(), "Forwarded frame");
        Pull::Forwarded
    }

    fn check_video_loss(&mut self, now: Instant) {
        let client = self.session.client();
        let pre_loss = self.ctx.config.pre_video_loss;
        let margin = self.ctx.config.loss_early_margin;

        for camera in 0..self.tuples.len() {
            for kind in StreamKind::ALL {
                let Some(active) = self.tuples[camera][kind.index()].active_mut() else {
                    continue;
                };
                if !active.first_callback_given || !active.loss.is_due(now, pre_loss, margin) {
                    continue;
                }

                active.loss.mark_reported(now);
                active.selector.reset();
                active.first_iframe_sent = false;
                let header = active.header.video_loss(unix_millis());

                match send_header(active, &header, &self.ctx.config) {
                    Ok(()) => {
                        LiveCounters::bump(&self.ctx.counters.video_loss_headers);
                        info!(client, camera, stream = %kind, "Video loss");
                    }
                    Err(e) => {
                        warn!(client, camera, stream = %kind, "Failed to send video loss: {:#}", e);
                        LiveCounters::bump(&self.ctx.counters.send_failures);
                        self.cleanup(camera, kind);
                    }
                }
            }
        }
    }

    fn stream_id(&self, camera: usize, kind: StreamKind) -> StreamId {
        StreamId::new(camera, kind, self.ctx.camera_count())
    }

    #[cfg(test)]
    fn phase(&self, camera: usize, kind: StreamKind) -> TuplePhase {
        self.tuples[camera][kind.index()].phase()
    }
}

fn send_header(active: &ActiveTuple, header: &FrameHeader, config: &LiveConfig) -> Result<()> {
    let buf = encode_frame(header, &[], config.max_frame_size)?;
    active.transport.send(active.conn, &buf, config.send_timeout)
}

fn respond(
    transport: &dyn Transport,
    status: StreamStatus,
    conn: ConnectionId,
    close_after: bool,
    client: usize,
) {
    if let Err(e) = transport.respond(status, conn, close_after) {
        warn!(client, %conn, %status, "Failed to respond: {:#}", e);
    }
}

fn unix_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::frame::{Codec, FrameKind, MediaFrame, MediaStatus};
    use crate::protocol::FRAME_HEADER_SIZE;
    use crate::synthetic::{synthetic_frame, CameraCall, SyntheticCamera};
    use crate::transport::{MemoryTransport, TransportEvent};

    const CONN: ConnectionId = ConnectionId(1);

    struct Fixture {
        camera: Arc<SyntheticCamera>,
        transport: Arc<MemoryTransport>,
        ctx: Arc<PumpContext>,
        session: Arc<ClientSession>,
        pump: Pump,
    }

    fn test_config() -> LiveConfig {
        LiveConfig {
            idle_wait: Duration::from_millis(10),
            ..Default::default()
        }
    }

    fn fixture_with(camera_count: usize, config: LiveConfig) -> Fixture {
        let camera = Arc::new(SyntheticCamera::new(camera_count));
        let transport = MemoryTransport::new();
        let transports = TransportTable::new().with(TransportKind::Native, transport.clone());
        let ctx = Arc::new(PumpContext::new(config, camera.clone(), transports));
        let session = Arc::new(ClientSession::new(0, camera_count, 8));
        session.lock().running = true;
        let pump = Pump::new(Arc::clone(&ctx), Arc::clone(&session));
        Fixture {
            camera,
            transport,
            ctx,
            session,
            pump,
        }
    }

    fn fixture(camera_count: usize) -> Fixture {
        fixture_with(camera_count, test_config())
    }

    impl Fixture {
        fn start(&mut self, camera: usize, kind: StreamKind, conn: ConnectionId) {
            self.session
                .post(ControlTrigger::Start {
                    camera,
                    kind,
                    conn,
                    transport: TransportKind::Native,
                    request: FrameRequest::all(),
                })
                .unwrap();
            self.pump.step();
        }

        fn start_acked(&mut self, camera: usize, kind: StreamKind, conn: ConnectionId) {
            self.start(camera, kind, conn);
            self.camera.ack(camera, kind, StreamStatus::Success);
            self.pump.step();
        }

        fn post(&self, trigger: ControlTrigger) {
            self.session.post(trigger).unwrap();
        }

        fn headers(&self, conn: ConnectionId) -> Vec<FrameHeader> {
            self.transport
                .sent(conn)
                .iter()
                .map(|buf| FrameHeader::decode(buf).unwrap())
                .collect()
        }
    }

    #[test]
    fn ack_precedes_first_data_frame() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        assert_eq!(f.pump.phase(0, StreamKind::Main), TuplePhase::Starting);

        for seq in 0..3 {
            f.camera
                .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, seq, 30, 16));
        }
        f.pump.step();
        assert!(f.transport.sent(CONN).is_empty());

        f.camera.ack(0, StreamKind::Main, StreamStatus::Success);
        f.pump.step();
        assert_eq!(f.pump.phase(0, StreamKind::Main), TuplePhase::Streaming);

        let events = f.transport.events_for(CONN);
        assert_eq!(events.len(), 4);
        assert!(matches!(
            events[0],
            TransportEvent::Responded {
                status: StreamStatus::Success,
                close_after: false,
                ..
            }
        ));
        assert!(events[1..]
            .iter()
            .all(|e| matches!(e, TransportEvent::Sent { .. })));
    }

    #[test]
    fn admission_refusal_closes_connection() {
        let config = LiveConfig {
            streams_per_camera: 1,
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start(0, StreamKind::Main, CONN);
        f.start(0, StreamKind::Sub, ConnectionId(2));

        assert_eq!(f.transport.responses(ConnectionId(2)), vec![StreamStatus::MaxStreamLimit]);
        assert!(f.transport.is_closed(ConnectionId(2)));
        assert_eq!(f.pump.phase(0, StreamKind::Sub), TuplePhase::Idle);
        assert_eq!(f.pump.total_camera, 1);
        assert_eq!(f.ctx.admission.active(), 1);
    }

    #[test]
    fn duplicate_start_restarts_tuple() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        f.start(0, StreamKind::Main, ConnectionId(2));

        assert!(f.transport.is_closed(CONN));
        assert!(!f.transport.is_closed(ConnectionId(2)));
        assert_eq!(f.pump.total_camera, 1);
        assert_eq!(f.ctx.admission.active(), 1);
        let stops = f
            .camera
            .calls()
            .into_iter()
            .filter(|c| matches!(c, CameraCall::Stop { .. }))
            .count();
        assert_eq!(stops, 1);
    }

    #[test]
    fn pipeline_start_failure_releases_everything() {
        let mut f = fixture(1);
        f.camera
            .fail_start(0, StreamKind::Main, StreamStatus::StartFailed);
        f.session
            .post(ControlTrigger::Start {
                camera: 0,
                kind: StreamKind::Main,
                conn: CONN,
                transport: TransportKind::Native,
                request: FrameRequest::all(),
            })
            .unwrap();

        assert_eq!(f.pump.step(), Flow::Exit);
        assert_eq!(f.transport.responses(CONN), vec![StreamStatus::StartFailed]);
        assert!(f.transport.is_closed(CONN));
        assert_eq!(f.ctx.admission.active(), 0);
        assert!(!f.session.is_running());
    }

    #[test]
    fn failed_ack_tears_down() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        f.camera
            .ack(0, StreamKind::Main, StreamStatus::CodecNotSupported);
        f.pump.step();

        assert_eq!(f.transport.responses(CONN), vec![StreamStatus::CodecNotSupported]);
        assert!(f.transport.is_closed(CONN));
        assert_eq!(f.ctx.admission.active(), 0);
        assert_eq!(f.pump.total_camera, 0);
    }

    #[test]
    fn stale_ack_is_ignored() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        f.post(ControlTrigger::FirstFrameAck {
            camera: 0,
            kind: StreamKind::Main,
            generation: 999,
            status: StreamStatus::Success,
        });
        f.pump.step();
        assert_eq!(f.pump.phase(0, StreamKind::Main), TuplePhase::Starting);
        assert!(f.transport.responses(CONN).is_empty());
    }

    #[test]
    fn change_stream_refused_before_ack() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        f.post(ControlTrigger::ChangeStream {
            camera: 0,
            kind: StreamKind::Sub,
            request: FrameRequest::all(),
        });
        f.pump.step();

        assert_eq!(f.transport.responses(CONN), vec![StreamStatus::ResourceLimit]);
        assert_eq!(f.pump.phase(0, StreamKind::Main), TuplePhase::Starting);
        assert_eq!(f.pump.phase(0, StreamKind::Sub), TuplePhase::Idle);
    }

    #[test]
    fn change_stream_moves_connection() {
        let mut f = fixture(1);
        f.start_acked(0, StreamKind::Main, CONN);
        f.post(ControlTrigger::AudioState {
            camera: 0,
            kind: StreamKind::Main,
            enabled: true,
        });
        f.post(ControlTrigger::ChangeStream {
            camera: 0,
            kind: StreamKind::Sub,
            request: FrameRequest::all(),
        });
        f.pump.step();

        assert_eq!(f.pump.phase(0, StreamKind::Main), TuplePhase::Idle);
        assert_eq!(f.pump.phase(0, StreamKind::Sub), TuplePhase::SwitchPending);
        assert_eq!(f.pump.total_camera, 1);
        assert_eq!(f.ctx.admission.active(), 1);
        assert_eq!(
            f.transport.responses(CONN),
            vec![StreamStatus::Success, StreamStatus::Success]
        );
        assert!(!f.transport.is_closed(CONN));
        assert_eq!(f.camera.readers(0, StreamKind::Main), 0);
        assert!(f.tuple_audio(0, StreamKind::Sub));

        // The new stream's ack is not reported to the client again
        f.camera.ack(0, StreamKind::Sub, StreamStatus::Success);
        f.pump.step();
        assert_eq!(f.pump.phase(0, StreamKind::Sub), TuplePhase::Streaming);
        assert_eq!(f.transport.responses(CONN).len(), 2);

        f.camera
            .push_frame(0, StreamKind::Sub, synthetic_frame(Codec::H264, 0, 30, 8));
        f.pump.step();
        assert_eq!(f.transport.sent(CONN).len(), 1);
    }

    impl Fixture {
        fn tuple_audio(&self, camera: usize, kind: StreamKind) -> bool {
            self.pump.tuples[camera][kind.index()]
                .active()
                .is_some_and(|a| a.audio)
        }
    }

    #[test]
    fn force_stop_before_ack_reports_codec() {
        let mut f = fixture(1);
        f.start(0, StreamKind::Main, CONN);
        f.camera.force_stop(0, StreamKind::Main);
        f.pump.step();

        assert_eq!(f.transport.responses(CONN), vec![StreamStatus::CodecNotSupported]);
        let headers = f.headers(CONN);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].media_status, MediaStatus::ConfigChange);
        assert_eq!(headers[0].total_len as usize, FRAME_HEADER_SIZE);
        assert!(f.transport.is_closed(CONN));
        assert_eq!(f.ctx.admission.active(), 0);
    }

    #[test]
    fn force_stop_after_ack_skips_status() {
        let mut f = fixture(1);
        f.start_acked(0, StreamKind::Main, CONN);
        f.camera.force_stop(0, StreamKind::Main);
        f.pump.step();

        assert_eq!(f.transport.responses(CONN), vec![StreamStatus::Success]);
        assert_eq!(f.headers(CONN).len(), 1);
        assert!(f.transport.is_closed(CONN));
    }

    #[test]
    fn send_failure_runs_cleanup() {
        let mut f = fixture(1);
        f.start_acked(0, StreamKind::Main, CONN);
        f.transport.fail_sends(CONN);
        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 8));
        f.pump.step();

        assert!(f.transport.is_closed(CONN));
        assert_eq!(f.pump.total_camera, 0);
        assert_eq!(f.ctx.admission.active(), 0);
        assert_eq!(f.ctx.counters.snapshot().send_failures, 1);
        assert_eq!(f.pump.step(), Flow::Exit);
    }

    #[test]
    fn audio_follows_switch() {
        let mut f = fixture(1);
        f.start_acked(0, StreamKind::Main, CONN);
        let audio = || MediaFrame::audio(Codec::Aac, Bytes::from_static(b"pcm"));

        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 8));
        f.camera.push_frame(0, StreamKind::Main, audio());
        f.pump.step();
        assert_eq!(f.transport.sent(CONN).len(), 1);

        f.post(ControlTrigger::AudioState {
            camera: 0,
            kind: StreamKind::Main,
            enabled: true,
        });
        f.pump.step();
        f.camera.push_frame(0, StreamKind::Main, audio());
        f.pump.step();

        let headers = f.headers(CONN);
        assert_eq!(headers.len(), 2);
        assert_eq!(headers[1].kind, FrameKind::Audio);
        assert_eq!(headers[1].codec, Codec::Aac);
        assert_eq!(f.ctx.counters.snapshot().frames_filtered, 1);
    }

    #[test]
    fn oversized_frame_is_dropped_not_fatal() {
        let config = LiveConfig {
            max_frame_size: FRAME_HEADER_SIZE + 16,
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start_acked(0, StreamKind::Main, CONN);

        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 64));
        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 30, 30, 16));
        f.pump.step();

        let headers = f.headers(CONN);
        assert_eq!(headers.len(), 1);
        assert_eq!(headers[0].total_len as usize, FRAME_HEADER_SIZE + 16);
        assert_eq!(f.ctx.counters.snapshot().frames_oversized, 1);
        assert!(!f.transport.is_closed(CONN));
    }

    #[test]
    fn one_loss_header_per_outage() {
        let config = LiveConfig {
            pre_video_loss: Duration::from_millis(120),
            loss_early_margin: Duration::from_millis(20),
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start_acked(0, StreamKind::Main, CONN);

        std::thread::sleep(Duration::from_millis(110));
        f.pump.step();
        std::thread::sleep(Duration::from_millis(150));
        f.pump.step();

        let headers = f.headers(CONN);
        assert_eq!(headers.len(), 1);
        assert!(headers[0].video_loss);
        assert_eq!(headers[0].kind, FrameKind::I);
        assert_eq!(headers[0].media_status, MediaStatus::Normal);
        assert_eq!(headers[0].total_len as usize, FRAME_HEADER_SIZE);

        // Forwarding resumes without another loss header
        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 8));
        f.pump.step();
        let headers = f.headers(CONN);
        assert_eq!(headers.len(), 2);
        assert!(!headers[1].video_loss);
        assert_eq!(f.ctx.counters.snapshot().video_loss_headers, 1);
    }

    #[test]
    fn audio_does_not_mask_video_loss() {
        let config = LiveConfig {
            pre_video_loss: Duration::from_millis(120),
            loss_early_margin: Duration::from_millis(20),
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start_acked(0, StreamKind::Main, CONN);
        f.post(ControlTrigger::AudioState {
            camera: 0,
            kind: StreamKind::Main,
            enabled: true,
        });
        f.camera
            .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, 0, 30, 8));
        f.pump.step();

        let silence = Instant::now();
        while silence.elapsed() < Duration::from_millis(600) {
            f.camera.push_frame(
                0,
                StreamKind::Main,
                MediaFrame::audio(Codec::Aac, Bytes::from_static(b"pcm")),
            );
            f.pump.step();
            std::thread::sleep(Duration::from_millis(20));
        }

        let headers = f.headers(CONN);
        assert_eq!(headers.iter().filter(|h| h.video_loss).count(), 1);
        assert_eq!(f.ctx.counters.snapshot().video_loss_headers, 1);
        // Audio was being forwarded when the loss was declared
        let loss_at = headers.iter().position(|h| h.video_loss).unwrap();
        assert_eq!(headers[0].kind, FrameKind::I);
        assert!(headers[1..loss_at].iter().all(|h| h.kind == FrameKind::Audio));
        assert!(loss_at >= 2);
    }

    #[test]
    fn no_loss_before_ack() {
        let config = LiveConfig {
            pre_video_loss: Duration::from_millis(50),
            loss_early_margin: Duration::from_millis(10),
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start(0, StreamKind::Main, CONN);
        std::thread::sleep(Duration::from_millis(80));
        f.pump.step();
        assert!(f.transport.sent(CONN).is_empty());
    }

    #[test]
    fn wait_timeout_tracks_loss_deadline() {
        let config = LiveConfig {
            idle_wait: Duration::from_secs(10),
            pre_video_loss: Duration::from_secs(2),
            loss_early_margin: Duration::from_millis(200),
            ..Default::default()
        };
        let mut f = fixture_with(1, config);
        let now = Instant::now();
        assert_eq!(f.pump.wait_timeout(now), Duration::from_secs(10));

        // Drive the transitions directly; a full step would sit in the 10 s wait
        f.post(ControlTrigger::Start {
            camera: 0,
            kind: StreamKind::Main,
            conn: CONN,
            transport: TransportKind::Native,
            request: FrameRequest::all(),
        });
        f.pump.drain();
        assert_eq!(f.pump.wait_timeout(Instant::now()), Duration::from_secs(10));

        f.camera.ack(0, StreamKind::Main, StreamStatus::Success);
        f.pump.drain();
        let timeout = f.pump.wait_timeout(Instant::now());
        assert!(timeout <= Duration::from_millis(1800));
        assert!(timeout > Duration::from_millis(1000));
    }

    #[test]
    fn slice_budget_resumes_where_it_stopped() {
        let config = LiveConfig {
            slice_budget: Duration::from_nanos(1),
            ..test_config()
        };
        let mut f = fixture_with(1, config);
        f.start_acked(0, StreamKind::Main, CONN);
        // The ack's own servicing pass found nothing to send
        for seq in 0..3 {
            f.camera
                .push_frame(0, StreamKind::Main, synthetic_frame(Codec::H264, seq, 30, 8));
        }

        f.pump.step();
        assert_eq!(f.transport.sent(CONN).len(), 1);
        assert!(f.session.lock().any_available());
        f.pump.step();
        f.pump.step();
        assert_eq!(f.transport.sent(CONN).len(), 3);
        assert_eq!(f.camera.pending(0, StreamKind::Main, 0), 0);
    }

    #[test]
    fn shutdown_tears_down_every_tuple() {
        let mut f = fixture(2);
        f.start_acked(0, StreamKind::Main, CONN);
        f.start(1, StreamKind::Sub, ConnectionId(2));
        assert_eq!(f.ctx.admission.active(), 2);

        f.session.lock().shutdown = true;
        assert_eq!(f.pump.step(), Flow::Exit);

        assert_eq!(f.ctx.admission.active(), 0);
        assert!(f.transport.is_closed(CONN));
        assert!(f.transport.is_closed(ConnectionId(2)));
        assert_eq!(
            f.transport.responses(ConnectionId(2)),
            vec![StreamStatus::StreamClosed]
        );
        assert!(!f.session.is_running());
        assert_eq!(f.camera.readers(0, StreamKind::Main), 0);
    }

    #[test]
    fn stop_then_exit_when_idle() {
        let mut f = fixture(1);
        f.start_acked(0, StreamKind::Main, CONN);
        f.post(ControlTrigger::Stop {
            camera: 0,
            kind: StreamKind::Main,
        });
        assert_eq!(f.pump.step(), Flow::Exit);
        assert!(f.transport.is_closed(CONN));
        assert!(!f.session.is_running());
        assert_eq!(f.ctx.admission.active(), 0);
    }
}
