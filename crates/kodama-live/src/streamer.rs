//! Public lifecycle API
//!
//! Every call validates its indices, queues a [`ControlTrigger`] on the
//! client's session and wakes the pump. The first trigger for an inactive
//! session starts that client's pump thread.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

use anyhow::Result;
use tracing::{error, info};

use crate::camera::{CameraInterface, ConnectionId};
use crate::config::LiveConfig;
use crate::error::LiveError;
use crate::frame::StreamKind;
use crate::policy::FrameRequest;
use crate::pump::{Pump, PumpContext};
use crate::queue::ControlTrigger;
use crate::session::{ClientSession, SessionTable};
use crate::stats::LiveStats;
use crate::transport::{TransportKind, TransportTable};

/// Live view multiplexer.
///
/// Dropping the streamer shuts every pump down.
pub struct LiveStreamer {
    ctx: Arc<PumpContext>,
    sessions: SessionTable,
    closed: AtomicBool,
}

impl LiveStreamer {
    /// Allocate every client session and size admission for the pipeline's
    /// camera count.
    pub fn new(
        config: LiveConfig,
        camera: Arc<dyn CameraInterface>,
        transports: TransportTable,
    ) -> Result<Self> {
        config.validate()?;
        let camera_count = camera.camera_count();
        if camera_count == 0 {
            anyhow::bail!("Camera pipeline reports no cameras");
        }

        let sessions = SessionTable::new(config.max_clients, camera_count, config.queue_capacity);
        let ctx = Arc::new(PumpContext::new(config, camera, transports));
        info!(
            cameras = camera_count,
            clients = sessions.len(),
            stream_limit = ctx.admission.ceiling(),
            transports = ?ctx.transports,
            "Live streamer initialised"
        );

        Ok(Self {
            ctx,
            sessions,
            closed: AtomicBool::new(false),
        })
    }

    pub fn config(&self) -> &LiveConfig {
        &self.ctx.config
    }

    pub fn camera_count(&self) -> usize {
        self.ctx.camera_count()
    }

    /// Start live view of `camera`/`kind` for `client` on `conn`.
    ///
    /// The outcome reaches the client through `transport`: a success status
    /// once the pipeline delivers, or a failure status followed by close.
    pub fn add_live_stream(
        &self,
        camera: usize,
        kind: StreamKind,
        client: usize,
        conn: ConnectionId,
        transport: TransportKind,
        request: FrameRequest,
    ) -> Result<(), LiveError> {
        self.check_camera(camera)?;
        let session = self.sessions.get(client)?;
        if self.ctx.transports.get(transport).is_none() {
            return Err(LiveError::InvalidTransport(transport));
        }
        if self.closed.load(Ordering::Acquire) {
            return Err(LiveError::ResourceLimit("live streamer is shut down"));
        }

        let trigger = ControlTrigger::Start {
            camera,
            kind,
            conn,
            transport,
            request,
        };

        let mut state = session.lock();
        state
            .queue
            .push(trigger)
            .map_err(|_| LiveError::QueueFull(client))?;
        if state.running {
            drop(state);
            session.notify();
            return Ok(());
        }

        // Spawned under the session lock: the pump blocks on it until the
        // session is marked running, and no other caller can see the session
        // inactive before the handle is stored.
        match self.spawn_pump(session) {
            Ok(handle) => {
                state.running = true;
                state.install_pump(handle);
                Ok(())
            }
            Err(e) => {
                error!(client, "Failed to spawn live pump: {}", e);
                state.queue.retract_last();
                Err(LiveError::ResourceLimit("pump thread"))
            }
        }
    }

    pub fn remove_live_stream(
        &self,
        camera: usize,
        kind: StreamKind,
        client: usize,
    ) -> Result<(), LiveError> {
        self.post(client, camera, ControlTrigger::Stop { camera, kind })
    }

    pub fn change_live_audio_state(
        &self,
        camera: usize,
        kind: StreamKind,
        client: usize,
        enabled: bool,
    ) -> Result<(), LiveError> {
        self.post(
            client,
            camera,
            ControlTrigger::AudioState {
                camera,
                kind,
                enabled,
            },
        )
    }

    /// Move the client's view of `camera` to stream `kind`, keeping the
    /// connection of the other stream kind.
    pub fn change_live_stream(
        &self,
        camera: usize,
        kind: StreamKind,
        client: usize,
        request: FrameRequest,
    ) -> Result<(), LiveError> {
        self.post(
            client,
            camera,
            ControlTrigger::ChangeStream {
                camera,
                kind,
                request,
            },
        )
    }

    /// Streams currently holding an admission slot, across all clients.
    pub fn live_stream_count(&self) -> usize {
        self.ctx.admission.active()
    }

    /// Record the motion state of a camera. Unknown cameras are ignored.
    pub fn notify_camera_motion(&self, camera: usize, active: bool) {
        self.ctx.motion.set(camera, active);
    }

    pub fn is_client_active(&self, client: usize) -> bool {
        self.sessions
            .get(client)
            .map(|session| session.is_running())
            .unwrap_or(false)
    }

    pub fn stats(&self) -> LiveStats {
        LiveStats {
            active_streams: self.ctx.admission.active(),
            stream_limit: self.ctx.admission.ceiling(),
            active_clients: self.sessions.running(),
            ..self.ctx.counters.snapshot()
        }
    }

    /// Tear down every stream and join the pump threads.
    ///
    /// Later `add_live_stream` calls fail. Safe to call more than once.
    pub fn shutdown(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }

        for session in self.sessions.iter() {
            session.lock().shutdown = true;
            session.notify();
        }
        for session in self.sessions.iter() {
            for handle in session.take_pumps() {
                if handle.join().is_err() {
                    error!(client = session.client(), "Live pump panicked");
                }
            }
        }
        info!(remaining = self.live_stream_count(), "Live streamer shut down");
    }

    fn spawn_pump(&self, session: &Arc<ClientSession>) -> std::io::Result<thread::JoinHandle<()>> {
        let pump = Pump::new(Arc::clone(&self.ctx), Arc::clone(session));
        thread::Builder::new()
            .name(format!("live-pump-{}", session.client()))
            .spawn(move || pump.run())
    }

    fn post(&self, client: usize, camera: usize, trigger: ControlTrigger) -> Result<(), LiveError> {
        self.check_camera(camera)?;
        self.sessions.get(client)?.post(trigger)
    }

    fn check_camera(&self, camera: usize) -> Result<(), LiveError> {
        let max = self.ctx.camera_count();
        if camera >= max {
            return Err(LiveError::MaxCameraConfigured { camera, max });
        }
        Ok(())
    }
}

impl Drop for LiveStreamer {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for LiveStreamer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LiveStreamer")
            .field("cameras", &self.ctx.camera_count())
            .field("clients", &self.sessions.len())
            .field("active_streams", &self.ctx.admission.active())
            .finish()
    }
}
