//! Client sessions shared between the public API, the pipeline callbacks and
//! the pump threads
//!
//! Each session pairs one mutex with one condvar. The condvar is the pump's
//! only wait primitive and serves two purposes: it wakes the pump when a
//! trigger or frame arrives, and its timeout bounds how long the pump can go
//! without evaluating video loss.

use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::JoinHandle;
use std::time::Duration;

use crate::error::LiveError;
use crate::frame::StreamKind;
use crate::queue::{CommandQueue, ControlTrigger};

/// Mutex-protected part of a session.
#[derive(Debug)]
pub(crate) struct SessionState {
    /// A pump thread owns this session
    pub running: bool,
    /// Pump must tear everything down and exit
    pub shutdown: bool,
    /// `[camera][stream kind]` data-available flags
    pub frame_available: Vec<[bool; 2]>,
    pub queue: CommandQueue,
    /// Handle of the pump that owns the session
    pump: Option<JoinHandle<()>>,
    /// Earlier pumps that had not finished exiting when replaced
    retired: Vec<JoinHandle<()>>,
}

impl SessionState {
    pub fn any_available(&self) -> bool {
        self.frame_available.iter().any(|row| row[0] || row[1])
    }

    /// Copy out and clear all availability flags.
    pub fn take_available(&mut self) -> Vec<[bool; 2]> {
        let cleared = vec![[false; 2]; self.frame_available.len()];
        std::mem::replace(&mut self.frame_available, cleared)
    }

    /// Record a newly spawned pump. Must be called under the same lock
    /// acquisition that marked the session running.
    ///
    /// The replaced pump has already released the session but may still be
    /// unwinding; it is kept until it finishes instead of being joined here.
    pub fn install_pump(&mut self, handle: JoinHandle<()>) {
        if let Some(previous) = self.pump.replace(handle) {
            self.retired.push(previous);
        }
        let (finished, pending): (Vec<_>, Vec<_>) =
            self.retired.drain(..).partition(|h| h.is_finished());
        self.retired = pending;
        for handle in finished {
            let _ = handle.join();
        }
    }

    /// Every pump handle still held, current one first.
    pub fn take_pumps(&mut self) -> Vec<JoinHandle<()>> {
        self.pump.take().into_iter().chain(self.retired.drain(..)).collect()
    }
}

/// One client's shared session.
#[derive(Debug)]
pub struct ClientSession {
    client: usize,
    state: Mutex<SessionState>,
    wake: Condvar,
}

impl ClientSession {
    pub(crate) fn new(client: usize, camera_count: usize, queue_capacity: usize) -> Self {
        Self {
            client,
            state: Mutex::new(SessionState {
                running: false,
                shutdown: false,
                frame_available: vec![[false; 2]; camera_count],
                queue: CommandQueue::new(queue_capacity),
                pump: None,
                retired: Vec::new(),
            }),
            wake: Condvar::new(),
        }
    }

    pub fn client(&self) -> usize {
        self.client
    }

    pub fn is_running(&self) -> bool {
        self.lock().running
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, SessionState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub(crate) fn notify(&self) {
        self.wake.notify_one();
    }

    /// Block until notified or `timeout` passes.
    pub(crate) fn wait<'a>(
        &self,
        guard: MutexGuard<'a, SessionState>,
        timeout: Duration,
    ) -> MutexGuard<'a, SessionState> {
        match self.wake.wait_timeout(guard, timeout) {
            Ok((guard, _)) => guard,
            Err(poisoned) => poisoned.into_inner().0,
        }
    }

    pub(crate) fn set_frame_available(&self, camera: usize, kind: StreamKind) {
        let mut state = self.lock();
        if let Some(row) = state.frame_available.get_mut(camera) {
            row[kind.index()] = true;
        }
        drop(state);
        self.notify();
    }

    pub(crate) fn clear_frame_available(&self, camera: usize, kind: StreamKind) {
        if let Some(row) = self.lock().frame_available.get_mut(camera) {
            row[kind.index()] = false;
        }
    }

    /// Queue a trigger for a running pump.
    pub(crate) fn post(&self, trigger: ControlTrigger) -> Result<(), LiveError> {
        let mut state = self.lock();
        if !state.running {
            return Err(LiveError::Refused(self.client));
        }
        state
            .queue
            .push(trigger)
            .map_err(|_| LiveError::QueueFull(self.client))?;
        drop(state);
        self.notify();
        Ok(())
    }

    /// Like [`post`](Self::post) but hands the trigger back on failure.
    pub(crate) fn post_if_running(&self, trigger: ControlTrigger) -> Result<(), ControlTrigger> {
        let mut state = self.lock();
        if !state.running {
            return Err(trigger);
        }
        state.queue.push(trigger)?;
        drop(state);
        self.notify();
        Ok(())
    }

    /// Pump handles to join at shutdown. Taken under the lock, joined outside it.
    pub(crate) fn take_pumps(&self) -> Vec<JoinHandle<()>> {
        self.lock().take_pumps()
    }
}

/// Pre-allocated sessions for every client index.
#[derive(Debug)]
pub struct SessionTable {
    sessions: Vec<Arc<ClientSession>>,
}

impl SessionTable {
    pub fn new(max_clients: usize, camera_count: usize, queue_capacity: usize) -> Self {
        Self {
            sessions: (0..max_clients)
                .map(|client| Arc::new(ClientSession::new(client, camera_count, queue_capacity)))
                .collect(),
        }
    }

    /// Bounds-checked access.
    pub fn get(&self, client: usize) -> Result<&Arc<ClientSession>, LiveError> {
        self.sessions
            .get(client)
            .ok_or(LiveError::InvalidClient(client))
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Arc<ClientSession>> {
        self.sessions.iter()
    }

    /// Sessions with a live pump.
    pub fn running(&self) -> usize {
        self.sessions.iter().filter(|s| s.is_running()).count()
    }
}
