//! Scripted in-memory connector for tests.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

use super::connection::{ConnectRequest, Connection, ConnectionEvent, Connector, Link};
use super::error::{ProtocolError, ProtocolResult};
use crate::credentials::CredentialBlob;

/// One opened connection, observable from the test
pub(crate) struct FakeLink {
    pub session_id: String,
    pub credentials: CredentialBlob,
    event_tx: Mutex<Option<mpsc::UnboundedSender<ConnectionEvent>>>,
    pub sent: Mutex<Vec<(String, String)>>,
    pub logged_out: AtomicBool,
    pub closed: AtomicBool,
    pub fail_send: AtomicBool,
    pub fail_logout: AtomicBool,
}

impl FakeLink {
    /// Push an event as if the network produced it
    pub fn emit(&self, event: ConnectionEvent) -> bool {
        match self.event_tx.lock().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub fn sent(&self) -> Vec<(String, String)> {
        self.sent.lock().clone()
    }
}

struct FakeConnection(Arc<FakeLink>);

#[async_trait]
impl Connection for FakeConnection {
    async fn send_text(&self, to: &str, text: &str) -> ProtocolResult<()> {
        if self.0.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }
        if self.0.fail_send.load(Ordering::SeqCst) {
            return Err(ProtocolError::SendFailed("scripted failure".to_string()));
        }
        self.0.sent.lock().push((to.to_string(), text.to_string()));
        Ok(())
    }

    async fn logout(&self) -> ProtocolResult<()> {
        if self.0.fail_logout.load(Ordering::SeqCst) {
            return Err(ProtocolError::LogoutFailed("scripted failure".to_string()));
        }
        self.0.logged_out.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) -> ProtocolResult<()> {
        self.0.closed.store(true, Ordering::SeqCst);
        self.0.event_tx.lock().take();
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct FakeConnector {
    links: Mutex<Vec<Arc<FakeLink>>>,
    /// Events every new connection emits straight away
    on_connect: Mutex<Vec<ConnectionEvent>>,
    /// Number of upcoming connect calls that fail
    failures: AtomicUsize,
    delay: Mutex<Option<Duration>>,
}

impl FakeConnector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn emit_on_connect(&self, event: ConnectionEvent) {
        self.on_connect.lock().push(event);
    }

    pub fn fail_next(&self, count: usize) {
        self.failures.store(count, Ordering::SeqCst);
    }

    pub fn set_delay(&self, delay: Duration) {
        *self.delay.lock() = Some(delay);
    }

    pub fn connect_count(&self) -> usize {
        self.links.lock().len()
    }

    pub fn last_link(&self) -> Arc<FakeLink> {
        self.links
            .lock()
            .last()
            .cloned()
            .expect("no connection opened yet")
    }
}

#[async_trait]
impl Connector for FakeConnector {
    async fn connect(&self, request: ConnectRequest) -> ProtocolResult<Link> {
        let delay = *self.delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }

        let should_fail = self
            .failures
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if should_fail {
            return Err(ProtocolError::ConnectionFailed("scripted failure".to_string()));
        }

        let (event_tx, events) = mpsc::unbounded_channel();
        for event in self.on_connect.lock().iter() {
            let _ = event_tx.send(event.clone());
        }

        let link = Arc::new(FakeLink {
            session_id: request.session_id,
            credentials: request.credentials,
            event_tx: Mutex::new(Some(event_tx)),
            sent: Mutex::new(Vec::new()),
            logged_out: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            fail_send: AtomicBool::new(false),
            fail_logout: AtomicBool::new(false),
        });
        self.links.lock().push(link.clone());

        Ok(Link {
            connection: Box::new(FakeConnection(link)),
            events,
        })
    }

    fn connector_type(&self) -> &'static str {
        "fake"
    }
}
