//! Session State Machine
//!
//! One instance per tenant. Owns the live protocol connection and reacts to
//! its events in order:
//!
//! ```text
//! Connecting -> AwaitingAuthentication -> Connected
//!      \               |                     |
//!       \              v                     v
//!        +-------> Reconnecting <------------+
//!                      |
//!                      v
//!                 Disconnected (terminal)
//! ```
//!
//! The snapshot lives in a watch channel, so reads never block. Connection
//! and timer slots are short-lived `parking_lot` locks never held across an
//! await. Credential I/O is serialised per session so a purge always runs
//! after any load or save already in flight.

use log::{debug, error, info, warn};
use parking_lot::Mutex;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;

use super::error::{SessionError, SessionResult};
use super::events::{SessionEvent, TerminationCause};
use super::reconnect::ReconnectDecision;
use super::registry::RegistryShared;
use super::state::{SessionSnapshot, SessionStatus};
use crate::protocol::{
    identity_from_user, normalize_recipient, CloseReason, ConnectRequest, Connection, ConnectionEvent,
};

/// Current connection plus a generation counter. Events from a connection
/// whose generation is no longer current are dropped.
#[derive(Default)]
struct LinkSlot {
    generation: u64,
    connection: Option<Arc<dyn Connection>>,
}

/// A tenant's managed connection
pub struct Session {
    id: String,
    snapshot: watch::Sender<SessionSnapshot>,
    link: Mutex<LinkSlot>,
    reconnect: Mutex<Option<JoinHandle<()>>>,
    store_lock: tokio::sync::Mutex<()>,
    /// Outcome of the first connect; `None` while it is in flight
    startup: watch::Sender<Option<Result<(), String>>>,
    shared: Weak<RegistryShared>,
}

impl Session {
    pub(crate) fn new(id: String, shared: Weak<RegistryShared>) -> Arc<Self> {
        let (snapshot, _) = watch::channel(SessionSnapshot::new(&id));
        Arc::new(Self {
            id,
            snapshot,
            link: Mutex::new(LinkSlot::default()),
            reconnect: Mutex::new(None),
            store_lock: tokio::sync::Mutex::new(()),
            startup: watch::channel(None).0,
            shared,
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    /// Current state; never blocks on I/O
    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn status(&self) -> SessionStatus {
        self.snapshot.borrow().status
    }

    pub fn is_terminal(&self) -> bool {
        self.snapshot.borrow().is_terminal()
    }

    /// Watch snapshot changes
    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.subscribe()
    }

    /// Whether a reconnection timer is armed and has not fired yet
    pub fn has_pending_reconnect(&self) -> bool {
        self.reconnect
            .lock()
            .as_ref()
            .map(|timer| !timer.is_finished())
            .unwrap_or(false)
    }

    /// Wait until the session has left `Connecting` (or `timeout` elapses)
    pub async fn wait_until_settled(&self, timeout: Duration) -> SessionSnapshot {
        let mut rx = self.watch();
        let _ = tokio::time::timeout(
            timeout,
            rx.wait_for(|s| s.status != SessionStatus::Connecting),
        )
        .await;
        self.snapshot()
    }

    /// Record how the first connect went and wake anyone waiting on it
    pub(crate) fn finish_startup(&self, outcome: &SessionResult<()>) {
        let outcome = match outcome {
            Ok(()) => Ok(()),
            Err(e) => Err(e.to_string()),
        };
        self.startup.send_replace(Some(outcome));
    }

    /// Wait for the first connect started by another caller
    pub(crate) async fn wait_for_startup(&self) -> SessionResult<()> {
        let mut rx = self.startup.subscribe();
        let outcome = match rx.wait_for(|outcome| outcome.is_some()).await {
            Ok(outcome) => outcome.clone(),
            Err(_) => return Err(SessionError::Shutdown),
        };
        match outcome {
            Some(Err(message)) => Err(SessionError::StartFailed(message)),
            _ => Ok(()),
        }
    }

    fn shared(&self) -> SessionResult<Arc<RegistryShared>> {
        self.shared.upgrade().ok_or(SessionError::Shutdown)
    }

    fn emit(&self, event: SessionEvent) {
        if let Some(shared) = self.shared.upgrade() {
            let _ = shared.event_tx.send(event);
        }
    }

    /// Apply a snapshot change and announce the status move, if any.
    /// `Disconnected` is absorbing: a terminal snapshot is never modified.
    fn transition(&self, apply: impl FnOnce(&mut SessionSnapshot)) -> bool {
        let mut change = None;
        let applied = self.snapshot.send_if_modified(|s| {
            if s.is_terminal() {
                return false;
            }
            let old_status = s.status;
            apply(s);
            if old_status != s.status {
                change = Some((old_status, s.status));
            }
            true
        });

        if let Some((old_status, new_status)) = change {
            self.emit(SessionEvent::StatusChanged {
                session_id: self.id.clone(),
                old_status,
                new_status,
            });
        }
        applied
    }

    fn is_current(&self, generation: u64) -> bool {
        self.link.lock().generation == generation && !self.is_terminal()
    }

    /// Open a connection (resuming from stored credentials) and start
    /// consuming its events.
    pub(crate) async fn establish(self: &Arc<Self>) -> SessionResult<()> {
        let shared = self.shared()?;

        let credentials = {
            let _io = self.store_lock.lock().await;
            if self.is_terminal() {
                debug!("Session {} terminated before connecting", self.id);
                return Ok(());
            }
            shared.store.prepare(&self.id).await?;
            shared.store.load(&self.id).await?
        };
        let resuming = !credentials.is_empty();

        let link = shared
            .connector
            .connect(ConnectRequest {
                session_id: self.id.clone(),
                credentials,
                client_name: shared.client_name.clone(),
            })
            .await?;
        let connection: Arc<dyn Connection> = Arc::from(link.connection);

        let installed = {
            let mut slot = self.link.lock();
            if self.is_terminal() {
                None
            } else {
                slot.generation += 1;
                let previous = slot.connection.replace(connection.clone());
                Some((slot.generation, previous))
            }
        };

        let Some((generation, previous)) = installed else {
            // Torn down while we were connecting
            debug!("Session {} terminated during connect; closing new connection", self.id);
            let _ = connection.close().await;
            return Ok(());
        };

        if let Some(previous) = previous {
            let _ = previous.close().await;
        }

        debug!(
            "Session {} opened connection via {} (generation {}, resuming: {})",
            self.id,
            shared.connector.connector_type(),
            generation,
            resuming
        );

        self.spawn_pump(generation, link.events);
        Ok(())
    }

    /// Deliver one connection's events strictly in order
    fn spawn_pump(self: &Arc<Self>, generation: u64, mut events: mpsc::UnboundedReceiver<ConnectionEvent>) {
        let session = self.clone();
        tokio::spawn(async move {
            while let Some(event) = events.recv().await {
                if !session.is_current(generation) {
                    debug!(
                        "Ignoring {} event from retired connection of {}",
                        event.kind(),
                        session.id
                    );
                    break;
                }
                session.handle_event(generation, event).await;
            }
            debug!("Event stream ended for {} (generation {})", session.id, generation);
        });
    }

    async fn handle_event(self: &Arc<Self>, generation: u64, event: ConnectionEvent) {
        let Ok(shared) = self.shared() else {
            return;
        };

        match event {
            ConnectionEvent::Challenge { payload } => {
                let code = match shared.renderer.render(&payload) {
                    Ok(code) => code,
                    Err(e) => {
                        error!("Failed to render authentication code for {}: {}", self.id, e);
                        return;
                    }
                };
                if !self.transition(|s| s.set_challenge(code)) {
                    return;
                }
                self.emit(SessionEvent::AuthCodeIssued {
                    session_id: self.id.clone(),
                });
                info!("Authentication code ready for session {}", self.id);
            }

            ConnectionEvent::Open { user } => {
                let identity = identity_from_user(&user);
                if !self.transition(|s| s.set_connected(identity.clone())) {
                    return;
                }
                info!(
                    "Session {} connected as {}",
                    self.id,
                    identity.as_deref().unwrap_or("<unknown>")
                );
                self.emit(SessionEvent::Connected {
                    session_id: self.id.clone(),
                    identity,
                });
            }

            ConnectionEvent::Closed { reason } => {
                self.on_closed(reason).await;
            }

            ConnectionEvent::CredentialsUpdated(update) => {
                let _io = self.store_lock.lock().await;
                if self.is_terminal() {
                    debug!("Dropping credential update for terminated session {}", self.id);
                    return;
                }
                if let Err(e) = shared.store.save(&self.id, &update).await {
                    error!("Failed to persist credentials for {}: {}", self.id, e);
                } else {
                    debug!("Persisted credentials for {} (generation {})", self.id, generation);
                }
            }
        }
    }

    async fn on_closed(self: &Arc<Self>, reason: CloseReason) {
        if self.is_terminal() {
            debug!("Ignoring {} close of terminated session {}", reason, self.id);
            return;
        }
        let Ok(shared) = self.shared() else {
            return;
        };
        let attempt = self.snapshot.borrow().reconnect_attempts + 1;

        match shared.policy.decide(reason, attempt) {
            ReconnectDecision::Retry(delay) => {
                self.release_connection();
                self.schedule_reconnect(attempt, delay);
            }
            ReconnectDecision::Terminate => {
                let cause = if reason.is_logged_out() {
                    info!("Session {} was logged out", self.id);
                    TerminationCause::LoggedOut
                } else {
                    warn!("Session {} gave up after {} reconnection attempts", self.id, attempt - 1);
                    TerminationCause::GaveUp
                };
                if let Err(e) = self.terminate(cause).await {
                    error!("Error terminating session {}: {}", self.id, e);
                }
            }
        }
    }

    /// Drop the current connection; its remaining events become stale
    fn release_connection(&self) {
        let connection = {
            let mut slot = self.link.lock();
            slot.generation += 1;
            slot.connection.take()
        };
        if let Some(connection) = connection {
            tokio::spawn(async move {
                let _ = connection.close().await;
            });
        }
    }

    /// Arm the reconnection timer, replacing any pending one
    pub(crate) fn schedule_reconnect(self: &Arc<Self>, attempt: u32, delay: Duration) {
        let moved = self.transition(|s| {
            s.set_reconnecting();
            s.reconnect_attempts = attempt;
        });
        if !moved {
            debug!("Not rescheduling terminated session {}", self.id);
            return;
        }

        {
            let mut timer = self.reconnect.lock();
            // terminate() marks the snapshot before clearing this slot
            if self.is_terminal() {
                return;
            }
            if let Some(previous) = timer.take() {
                previous.abort();
            }
            let session = Arc::downgrade(self);
            *timer = Some(tokio::spawn(async move {
                tokio::time::sleep(delay).await;
                if let Some(session) = session.upgrade() {
                    session.reconnect_now().await;
                }
            }));
        }

        warn!(
            "Session {} disconnected; reconnecting in {:?} (attempt {})",
            self.id, delay, attempt
        );
        self.emit(SessionEvent::ReconnectScheduled {
            session_id: self.id.clone(),
            attempt,
            delay_ms: delay.as_millis() as u64,
        });
    }

    async fn reconnect_now(self: &Arc<Self>) {
        // Fired: no longer pending
        self.reconnect.lock().take();

        if self.is_terminal() {
            return;
        }

        info!("Reconnecting session {}", self.id);
        if let Err(e) = self.establish().await {
            warn!("Reconnection of {} failed: {}", self.id, e);
            self.on_closed(CloseReason::Transient(None)).await;
        }
    }

    /// Send a text message. Only valid while connected.
    pub async fn send_text(&self, to: &str, text: &str) -> SessionResult<String> {
        if !self.snapshot.borrow().is_connected() {
            return Err(SessionError::NotConnected(self.id.clone()));
        }
        let connection = self
            .link
            .lock()
            .connection
            .clone()
            .ok_or_else(|| SessionError::NotConnected(self.id.clone()))?;

        let address = normalize_recipient(to);
        connection.send_text(&address, text).await?;
        debug!("Session {} sent message to {}", self.id, address);
        Ok(address)
    }

    /// Log out, then tear down unconditionally. A logout failure is
    /// reported after the teardown has completed.
    pub async fn disconnect(self: &Arc<Self>) -> SessionResult<()> {
        let connection = self.link.lock().connection.clone();

        let logout = match connection {
            Some(connection) => connection.logout().await.map_err(SessionError::from),
            None => Ok(()),
        };
        if let Err(e) = &logout {
            warn!("Logout failed for session {}: {}", self.id, e);
        }

        let teardown = self.terminate(TerminationCause::Logout).await;
        logout.and(teardown)
    }

    /// Terminal transition: cancel the timer, release the connection, leave
    /// the registry and purge credentials. Safe to call repeatedly; every
    /// caller returns only once the credentials are gone.
    pub(crate) async fn terminate(self: &Arc<Self>, cause: TerminationCause) -> SessionResult<()> {
        let mut old_status = None;
        self.snapshot.send_if_modified(|s| {
            if s.is_terminal() {
                false
            } else {
                old_status = Some(s.status);
                s.set_disconnected();
                true
            }
        });

        if let Some(timer) = self.reconnect.lock().take() {
            timer.abort();
        }

        let connection = {
            let mut slot = self.link.lock();
            slot.generation += 1;
            slot.connection.take()
        };

        let shared = self.shared.upgrade();
        if let Some(shared) = &shared {
            shared.sessions.remove_if(&self.id, |_, s| Arc::ptr_eq(s, self));
        }

        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("Error closing connection for {}: {}", self.id, e);
            }
        }

        let purged = match &shared {
            Some(shared) => {
                let _io = self.store_lock.lock().await;
                shared.store.purge(&self.id).await.map_err(SessionError::from)
            }
            None => Ok(()),
        };

        if let Some(old_status) = old_status {
            self.emit(SessionEvent::StatusChanged {
                session_id: self.id.clone(),
                old_status,
                new_status: SessionStatus::Disconnected,
            });
            self.emit(SessionEvent::Terminated {
                session_id: self.id.clone(),
                cause,
            });
            info!("Session {} terminated ({:?})", self.id, cause);
        }

        purged
    }

    /// Give up on a session whose first connect failed. Stored credentials
    /// are kept so a later attempt can still resume.
    pub(crate) fn abandon(self: &Arc<Self>) {
        self.transition(|s| s.set_disconnected());
        if let Some(shared) = self.shared.upgrade() {
            shared.sessions.remove_if(&self.id, |_, s| Arc::ptr_eq(s, self));
        }
    }

    /// Close the connection without logging out and keep credentials.
    /// Used on process shutdown so sessions can resume on restart.
    pub(crate) async fn shutdown(&self) {
        self.transition(|s| s.set_disconnected());

        if let Some(timer) = self.reconnect.lock().take() {
            timer.abort();
        }

        let connection = {
            let mut slot = self.link.lock();
            slot.generation += 1;
            slot.connection.take()
        };
        if let Some(connection) = connection {
            if let Err(e) = connection.close().await {
                warn!("Error closing connection for {}: {}", self.id, e);
            }
        }
    }
}
