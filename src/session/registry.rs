//! Session Registry
//!
//! Process-wide map from session id to its state machine. The single
//! source of truth for whether a session exists.

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use futures::future::join_all;
use log::{debug, error, info, warn};
use std::sync::Arc;
use tokio::sync::broadcast;

use super::error::{SessionError, SessionResult};
use super::events::{SessionEvent, TerminationCause};
use super::machine::Session;
use super::reconnect::ReconnectPolicy;
use super::state::SessionSnapshot;
use super::validate_session_id;
use crate::credentials::CredentialStore;
use crate::protocol::Connector;
use crate::render::{CodeRenderer, QrDataUrlRenderer};

/// State shared between the registry handle and its sessions
pub(crate) struct RegistryShared {
    pub(crate) sessions: DashMap<String, Arc<Session>>,
    pub(crate) connector: Arc<dyn Connector>,
    pub(crate) store: Arc<dyn CredentialStore>,
    pub(crate) renderer: Arc<dyn CodeRenderer>,
    pub(crate) policy: ReconnectPolicy,
    pub(crate) client_name: String,
    pub(crate) event_tx: broadcast::Sender<SessionEvent>,
}

/// Session Registry - cheap to clone handle over the shared map
#[derive(Clone)]
pub struct SessionRegistry {
    shared: Arc<RegistryShared>,
}

impl SessionRegistry {
    /// Create a registry with the default renderer and reconnection policy
    pub fn new(connector: Arc<dyn Connector>, store: Arc<dyn CredentialStore>) -> Self {
        Self::with_settings(
            connector,
            store,
            Arc::new(QrDataUrlRenderer::default()),
            ReconnectPolicy::default(),
            "wagate",
        )
    }

    /// Create with custom settings
    pub fn with_settings(
        connector: Arc<dyn Connector>,
        store: Arc<dyn CredentialStore>,
        renderer: Arc<dyn CodeRenderer>,
        policy: ReconnectPolicy,
        client_name: impl Into<String>,
    ) -> Self {
        let (event_tx, _) = broadcast::channel(256);
        Self {
            shared: Arc::new(RegistryShared {
                sessions: DashMap::new(),
                connector,
                store,
                renderer,
                policy,
                client_name: client_name.into(),
                event_tx,
            }),
        }
    }

    /// Subscribe to session events
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.shared.event_tx.subscribe()
    }

    /// Return the live session for `id`, or create and connect one.
    ///
    /// Check-and-insert happens under the map's entry lock, so concurrent
    /// callers for the same id share one session and one connection. Later
    /// callers wait for the first connect and share its outcome.
    pub async fn get_or_create(&self, id: &str) -> SessionResult<Arc<Session>> {
        validate_session_id(id)?;

        let (session, created) = match self.shared.sessions.entry(id.to_string()) {
            Entry::Occupied(entry) => (entry.get().clone(), false),
            Entry::Vacant(entry) => {
                let session = Session::new(id.to_string(), Arc::downgrade(&self.shared));
                entry.insert(session.clone());
                (session, true)
            }
        };

        if !created {
            debug!("Reusing session: {}", id);
            session.wait_for_startup().await?;
            return Ok(session);
        }

        info!("Created session: {}", id);

        let outcome = session.establish().await;
        if let Err(e) = &outcome {
            error!("Failed to connect session {}: {}", id, e);
            session.abandon();
        }
        session.finish_startup(&outcome);
        outcome.map(|()| session)
    }

    /// Lookup only
    pub fn get(&self, id: &str) -> Option<Arc<Session>> {
        self.shared.sessions.get(id).map(|s| s.clone())
    }

    /// Snapshot for `id`; an absent session reads as disconnected
    pub fn snapshot(&self, id: &str) -> SessionSnapshot {
        self.get(id)
            .map(|s| s.snapshot())
            .unwrap_or_else(|| SessionSnapshot::absent(id))
    }

    /// Send a text message through a connected session
    pub async fn send_text(&self, id: &str, to: &str, text: &str) -> SessionResult<String> {
        let session = self
            .get(id)
            .ok_or_else(|| SessionError::NotConnected(id.to_string()))?;
        session.send_text(to, text).await
    }

    /// Log out and tear down. Absent sessions are a no-op.
    pub async fn disconnect(&self, id: &str) -> SessionResult<()> {
        match self.get(id) {
            Some(session) => {
                info!("Disconnecting session: {}", id);
                session.disconnect().await
            }
            None => {
                debug!("Disconnect of absent session {} ignored", id);
                Ok(())
            }
        }
    }

    /// Deregister `id`, release its connection and delete its credentials.
    /// Idempotent.
    pub async fn remove(&self, id: &str) -> SessionResult<()> {
        match self.shared.sessions.remove(id) {
            Some((_, session)) => session.terminate(TerminationCause::Removed).await,
            None => Ok(()),
        }
    }

    /// Snapshots of all registered sessions
    pub fn list(&self) -> Vec<SessionSnapshot> {
        let mut sessions: Vec<SessionSnapshot> =
            self.shared.sessions.iter().map(|s| s.snapshot()).collect();
        sessions.sort_by(|a, b| a.id.cmp(&b.id));
        sessions
    }

    /// Get total session count
    pub fn len(&self) -> usize {
        self.shared.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.shared.sessions.is_empty()
    }

    /// Check if a session exists
    pub fn contains(&self, id: &str) -> bool {
        self.shared.sessions.contains_key(id)
    }

    /// Resume every session that has stored credentials. Directories left
    /// empty by a session that never linked are skipped.
    pub async fn restore_persisted(&self) -> SessionResult<usize> {
        let ids = self.shared.store.list().await?;
        let mut restored = 0;

        for id in ids {
            if validate_session_id(&id).is_err() {
                warn!("Skipping credential directory with invalid id: {}", id);
                continue;
            }
            match self.shared.store.load(&id).await {
                Ok(credentials) if credentials.is_empty() => {
                    debug!("Skipping session {} with no stored credentials", id);
                    continue;
                }
                Ok(_) => {}
                Err(e) => {
                    error!("Failed to read credentials of {}: {}", id, e);
                    continue;
                }
            }
            match self.get_or_create(&id).await {
                Ok(_) => restored += 1,
                Err(e) => error!("Failed to restore session {}: {}", id, e),
            }
        }

        info!("Restored {} persisted sessions", restored);
        Ok(restored)
    }

    /// Close every connection without logging out. Credentials stay on disk.
    pub async fn shutdown_all(&self) {
        info!("Shutting down all sessions...");

        let sessions: Vec<Arc<Session>> = self.shared.sessions.iter().map(|s| s.clone()).collect();
        self.shared.sessions.clear();

        join_all(sessions.iter().map(|s| s.shutdown())).await;

        info!("All sessions shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::FileCredentialStore;
    use crate::protocol::fake::FakeConnector;
    use crate::protocol::{CloseReason, ConnectionEvent};
    use crate::session::state::SessionStatus;
    use std::collections::BTreeMap;
    use std::time::Duration;

    const WAIT: Duration = Duration::from_secs(2);

    struct Harness {
        registry: SessionRegistry,
        connector: Arc<FakeConnector>,
        store: Arc<FileCredentialStore>,
        _dir: tempfile::TempDir,
    }

    fn harness(policy: ReconnectPolicy) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let connector = FakeConnector::new();
        let store = Arc::new(FileCredentialStore::new(dir.path()));
        let registry = SessionRegistry::with_settings(
            connector.clone(),
            store.clone(),
            Arc::new(QrDataUrlRenderer::default()),
            policy,
            "test",
        );
        Harness {
            registry,
            connector,
            store,
            _dir: dir,
        }
    }

    async fn wait_status(session: &Session, status: SessionStatus) -> SessionSnapshot {
        let mut rx = session.watch();
        let snapshot = tokio::time::timeout(WAIT, rx.wait_for(|s| s.status == status))
            .await
            .expect("timed out waiting for status")
            .expect("session dropped")
            .clone();
        snapshot
    }

    async fn wait_until(mut check: impl FnMut() -> bool) {
        tokio::time::timeout(WAIT, async {
            while !check() {
                tokio::time::sleep(Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("condition not reached");
    }

    fn creds(name: &str) -> ConnectionEvent {
        let mut update = BTreeMap::new();
        update.insert(name.to_string(), Some(b"{}".to_vec()));
        ConnectionEvent::CredentialsUpdated(update)
    }

    async fn connected(h: &Harness, id: &str) -> Arc<Session> {
        let session = h.registry.get_or_create(id).await.unwrap();
        let link = h.connector.last_link();
        link.emit(creds("creds.json"));
        link.emit(ConnectionEvent::Open {
            user: "5511999999999:7@s.whatsapp.net".to_string(),
        });
        wait_status(&session, SessionStatus::Connected).await;
        session
    }

    #[tokio::test]
    async fn test_challenge_then_connected() {
        let h = harness(ReconnectPolicy::default());
        let session = h.registry.get_or_create("u1").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);

        let link = h.connector.last_link();
        link.emit(ConnectionEvent::Challenge {
            payload: "2@abc,def,ghi".to_string(),
        });
        let snap = wait_status(&session, SessionStatus::AwaitingAuthentication).await;
        assert!(snap.auth_code.as_deref().unwrap().starts_with("data:image/png;base64,"));
        assert!(snap.identity.is_none());

        link.emit(ConnectionEvent::Open {
            user: "5511999999999:12@s.whatsapp.net".to_string(),
        });
        let snap = wait_status(&session, SessionStatus::Connected).await;
        assert_eq!(snap.identity.as_deref(), Some("5511999999999"));
        assert!(snap.auth_code.is_none());
    }

    #[tokio::test]
    async fn test_concurrent_create_single_connection() {
        let h = harness(ReconnectPolicy::default());
        h.connector.set_delay(Duration::from_millis(50));

        let (a, b) = tokio::join!(
            h.registry.get_or_create("u1"),
            h.registry.get_or_create("u1")
        );
        let (a, b) = (a.unwrap(), b.unwrap());

        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(h.registry.len(), 1);
        wait_until(|| h.connector.connect_count() == 1).await;
        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_create_shares_connect_failure() {
        let h = harness(ReconnectPolicy::default());
        h.connector.set_delay(Duration::from_millis(50));
        h.connector.fail_next(1);

        let (a, b) = tokio::join!(
            h.registry.get_or_create("u1"),
            h.registry.get_or_create("u1")
        );

        assert!(matches!(a, Err(SessionError::Protocol(_))));
        assert!(matches!(b, Err(SessionError::StartFailed(_))));
        assert!(!h.registry.contains("u1"));
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_send_rejected_unless_connected() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_secs(60)));

        // Never created
        let err = h.registry.send_text("ghost", "1", "hi").await.unwrap_err();
        assert!(matches!(err, SessionError::NotConnected(_)));

        // Connecting
        let session = h.registry.get_or_create("u1").await.unwrap();
        assert!(matches!(
            session.send_text("1", "hi").await,
            Err(SessionError::NotConnected(_))
        ));

        // Awaiting authentication
        let link = h.connector.last_link();
        link.emit(ConnectionEvent::Challenge {
            payload: "ref".to_string(),
        });
        wait_status(&session, SessionStatus::AwaitingAuthentication).await;
        assert!(matches!(
            session.send_text("1", "hi").await,
            Err(SessionError::NotConnected(_))
        ));

        // Reconnecting
        link.emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(Some(428)),
        });
        wait_status(&session, SessionStatus::Reconnecting).await;
        assert!(matches!(
            session.send_text("1", "hi").await,
            Err(SessionError::NotConnected(_))
        ));
        assert!(link.sent().is_empty());
    }

    #[tokio::test]
    async fn test_send_normalizes_address() {
        let h = harness(ReconnectPolicy::default());
        connected(&h, "u1").await;

        let address = h.registry.send_text("u1", "5511888888888", "hi").await.unwrap();
        assert_eq!(address, "5511888888888@s.whatsapp.net");
        assert_eq!(
            h.connector.last_link().sent(),
            vec![("5511888888888@s.whatsapp.net".to_string(), "hi".to_string())]
        );
    }

    #[tokio::test]
    async fn test_logged_out_close_is_terminal() {
        let h = harness(ReconnectPolicy::default());
        let session = connected(&h, "u1").await;
        wait_until(|| h.store.session_dir("u1").join("creds.json").exists()).await;

        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::LoggedOut,
        });
        wait_status(&session, SessionStatus::Disconnected).await;
        wait_until(|| !h.store.session_dir("u1").exists()).await;

        assert!(!h.registry.contains("u1"));
        assert!(session.snapshot().identity.is_none());
        assert_eq!(h.registry.snapshot("u1").status, SessionStatus::Disconnected);
    }

    #[tokio::test]
    async fn test_logged_out_from_awaiting_auth() {
        let h = harness(ReconnectPolicy::default());
        let session = h.registry.get_or_create("u1").await.unwrap();
        let link = h.connector.last_link();
        link.emit(ConnectionEvent::Challenge {
            payload: "ref".to_string(),
        });
        link.emit(ConnectionEvent::Closed {
            reason: CloseReason::LoggedOut,
        });

        wait_status(&session, SessionStatus::Disconnected).await;
        wait_until(|| !h.store.session_dir("u1").exists()).await;
        assert!(!h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_logged_out_while_connecting() {
        let h = harness(ReconnectPolicy::default());
        let session = h.registry.get_or_create("u1").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Connecting);
        assert!(h.store.session_dir("u1").exists());

        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::LoggedOut,
        });

        wait_status(&session, SessionStatus::Disconnected).await;
        wait_until(|| !h.store.session_dir("u1").exists()).await;
        assert!(!h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_logged_out_while_reconnecting() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(20)));
        let session = connected(&h, "u1").await;
        wait_until(|| h.store.session_dir("u1").join("creds.json").exists()).await;

        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });
        wait_until(|| h.connector.connect_count() == 2).await;
        assert_eq!(session.status(), SessionStatus::Reconnecting);

        // The fresh link is rejected outright
        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::LoggedOut,
        });

        wait_status(&session, SessionStatus::Disconnected).await;
        wait_until(|| !h.store.session_dir("u1").exists()).await;
        assert!(!h.registry.contains("u1"));
        assert!(!session.has_pending_reconnect());
        assert!(session.snapshot().identity.is_none());
    }

    #[tokio::test]
    async fn test_transient_close_schedules_single_reconnect() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(150)));
        let session = connected(&h, "u1").await;
        let first = h.connector.last_link();

        first.emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(Some(408)),
        });
        let snap = wait_status(&session, SessionStatus::Reconnecting).await;
        assert_eq!(snap.identity.as_deref(), Some("5511999999999"));
        assert!(snap.auth_code.is_none());
        assert!(h.registry.contains("u1"));
        assert!(session.has_pending_reconnect());

        // A second transient close before the timer fires replaces it
        session.schedule_reconnect(1, Duration::from_millis(150));
        assert!(session.has_pending_reconnect());

        wait_until(|| h.connector.connect_count() == 2).await;
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert_eq!(h.connector.connect_count(), 2);
        assert!(!session.has_pending_reconnect());

        // The retry resumes from stored credentials
        let second = h.connector.last_link();
        assert!(second.credentials.contains_key("creds.json"));
        assert!(first.closed.load(std::sync::atomic::Ordering::SeqCst));

        second.emit(ConnectionEvent::Open {
            user: "5511999999999@s.whatsapp.net".to_string(),
        });
        let snap = wait_status(&session, SessionStatus::Connected).await;
        assert_eq!(snap.reconnect_attempts, 0);
    }

    #[tokio::test]
    async fn test_events_from_retired_connection_ignored() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_secs(60)));
        let session = connected(&h, "u1").await;
        let first = h.connector.last_link();

        first.emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });
        wait_status(&session, SessionStatus::Reconnecting).await;

        // Late events from the dropped connection change nothing
        first.emit(ConnectionEvent::Closed {
            reason: CloseReason::LoggedOut,
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        assert_eq!(session.status(), SessionStatus::Reconnecting);
        assert!(h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_failed_reconnect_retries() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(20)));
        let session = connected(&h, "u1").await;

        h.connector.fail_next(2);
        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });

        wait_until(|| h.connector.connect_count() == 2).await;
        assert_eq!(session.status(), SessionStatus::Reconnecting);
        assert!(h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_attempt_cap_terminates() {
        let policy = ReconnectPolicy {
            initial_delay_ms: 10,
            max_delay_ms: 10,
            max_attempts: Some(1),
            ..ReconnectPolicy::default()
        };
        let h = harness(policy);
        let session = connected(&h, "u1").await;

        h.connector.fail_next(1);
        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });

        wait_status(&session, SessionStatus::Disconnected).await;
        assert!(!h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_disconnect_logs_out_and_purges() {
        let h = harness(ReconnectPolicy::default());
        let session = connected(&h, "u1").await;
        let link = h.connector.last_link();
        wait_until(|| h.store.session_dir("u1").join("creds.json").exists()).await;

        h.registry.disconnect("u1").await.unwrap();

        assert!(link.logged_out.load(std::sync::atomic::Ordering::SeqCst));
        assert!(!h.registry.contains("u1"));
        assert!(!h.store.session_dir("u1").exists());
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(h.registry.snapshot("u1").status, SessionStatus::Disconnected);

        // Absent: no-op success
        h.registry.disconnect("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_disconnect_tears_down_even_if_logout_fails() {
        let h = harness(ReconnectPolicy::default());
        connected(&h, "u1").await;
        h.connector
            .last_link()
            .fail_logout
            .store(true, std::sync::atomic::Ordering::SeqCst);

        let result = h.registry.disconnect("u1").await;
        assert!(matches!(result, Err(SessionError::Protocol(_))));
        assert!(!h.registry.contains("u1"));
        assert!(!h.store.session_dir("u1").exists());
    }

    #[tokio::test]
    async fn test_disconnect_cancels_pending_reconnect() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(100)));
        let session = connected(&h, "u1").await;

        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });
        wait_status(&session, SessionStatus::Reconnecting).await;

        h.registry.disconnect("u1").await.unwrap();
        assert!(!session.has_pending_reconnect());

        tokio::time::sleep(Duration::from_millis(250)).await;
        assert_eq!(h.connector.connect_count(), 1);
        assert!(!h.registry.contains("u1"));
    }

    #[tokio::test]
    async fn test_disconnect_during_failing_reconnect_stays_terminal() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(20)));
        let session = connected(&h, "u1").await;
        wait_until(|| h.store.session_dir("u1").join("creds.json").exists()).await;

        // The retry's connect is still in flight when the disconnect lands
        h.connector.set_delay(Duration::from_millis(200));
        h.connector.fail_next(1);
        h.connector.last_link().emit(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });
        tokio::time::sleep(Duration::from_millis(60)).await;

        h.registry.disconnect("u1").await.unwrap();
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(!h.store.session_dir("u1").exists());

        tokio::time::sleep(Duration::from_millis(700)).await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert!(!session.has_pending_reconnect());
        assert!(!h.registry.contains("u1"));
        assert_eq!(h.connector.connect_count(), 1);
        assert!(!h.store.session_dir("u1").exists());
    }

    #[tokio::test]
    async fn test_terminal_snapshot_is_absorbing() {
        let h = harness(ReconnectPolicy::fixed(Duration::from_millis(20)));
        let session = connected(&h, "u1").await;
        h.registry.disconnect("u1").await.unwrap();

        session.schedule_reconnect(1, Duration::from_millis(10));
        assert!(!session.has_pending_reconnect());

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(session.status(), SessionStatus::Disconnected);
        assert_eq!(h.connector.connect_count(), 1);
        assert!(!h.store.session_dir("u1").exists());
    }

    #[tokio::test]
    async fn test_remove_is_idempotent() {
        let h = harness(ReconnectPolicy::default());
        connected(&h, "u1").await;

        h.registry.remove("u1").await.unwrap();
        assert!(!h.registry.contains("u1"));
        assert!(!h.store.session_dir("u1").exists());
        assert!(!h.connector.last_link().logged_out.load(std::sync::atomic::Ordering::SeqCst));

        h.registry.remove("u1").await.unwrap();
    }

    #[tokio::test]
    async fn test_initial_connect_failure_evicts() {
        let h = harness(ReconnectPolicy::default());
        h.connector.fail_next(1);

        let result = h.registry.get_or_create("u1").await;
        assert!(matches!(result, Err(SessionError::Protocol(_))));
        assert!(!h.registry.contains("u1"));

        // Next attempt starts fresh
        h.registry.get_or_create("u1").await.unwrap();
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_invalid_id_rejected() {
        let h = harness(ReconnectPolicy::default());
        for id in ["", "..", "a/b", "../etc"] {
            assert!(matches!(
                h.registry.get_or_create(id).await,
                Err(SessionError::Validation(_))
            ));
        }
        assert_eq!(h.connector.connect_count(), 0);
    }

    #[tokio::test]
    async fn test_shutdown_keeps_credentials() {
        let h = harness(ReconnectPolicy::default());
        connected(&h, "u1").await;
        wait_until(|| h.store.session_dir("u1").join("creds.json").exists()).await;

        h.registry.shutdown_all().await;
        assert!(h.registry.is_empty());
        assert!(h.store.session_dir("u1").join("creds.json").exists());
        assert!(!h.connector.last_link().logged_out.load(std::sync::atomic::Ordering::SeqCst));

        // And a restore picks it back up
        let restored = h.registry.restore_persisted().await.unwrap();
        assert_eq!(restored, 1);
        assert!(h.connector.last_link().credentials.contains_key("creds.json"));
    }

    #[tokio::test]
    async fn test_restore_skips_sessions_that_never_linked() {
        let h = harness(ReconnectPolicy::default());
        h.connector.fail_next(1);
        assert!(h.registry.get_or_create("never").await.is_err());
        assert!(h.store.session_dir("never").exists());

        let mut update = BTreeMap::new();
        update.insert("creds.json".to_string(), Some(b"{}".to_vec()));
        h.store.save("linked", &update).await.unwrap();

        let restored = h.registry.restore_persisted().await.unwrap();
        assert_eq!(restored, 1);
        assert!(h.registry.contains("linked"));
        assert!(!h.registry.contains("never"));
        assert_eq!(h.connector.connect_count(), 1);
    }

    #[tokio::test]
    async fn test_events_published() {
        let h = harness(ReconnectPolicy::default());
        let mut rx = h.registry.subscribe();
        connected(&h, "u1").await;

        let identity = tokio::time::timeout(WAIT, async {
            loop {
                match rx.recv().await {
                    Ok(SessionEvent::Connected { identity, .. }) => break identity,
                    Ok(_) => continue,
                    Err(e) => panic!("event channel failed: {}", e),
                }
            }
        })
        .await
        .expect("no connected event");
        assert_eq!(identity.as_deref(), Some("5511999999999"));
    }
}
