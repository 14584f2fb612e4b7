//! Process Bridge Connector
//!
//! Runs the messaging-network library as a child process, one per
//! connection, and talks to it over newline-delimited JSON on stdin/stdout.
//!
//! Gateway -> bridge:
//! `{"op":"start","session":..,"credentials":{name: base64},"clientName":..}`,
//! `{"op":"send","id":n,"to":..,"text":..}`, `{"op":"logout","id":n}`
//!
//! Bridge -> gateway:
//! `{"event":"qr","code":..}`, `{"event":"open","user":..}`,
//! `{"event":"close","statusCode":n}`, `{"event":"creds","files":{name: base64|null}}`,
//! `{"event":"result","id":n,"ok":bool,"error":..}`, `{"event":"log","level":..,"message":..}`

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use dashmap::DashMap;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::process::Stdio;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{Child, ChildStdin, ChildStdout, Command};
use tokio::sync::{mpsc, oneshot, Mutex};

use super::connection::{CloseReason, ConnectRequest, Connection, ConnectionEvent, Connector, Link};
use super::error::{ProtocolError, ProtocolResult};
use crate::config::BridgeConfig;
use crate::credentials::CredentialUpdate;

type PendingMap = DashMap<u64, oneshot::Sender<Result<(), String>>>;

/// Commands written to the bridge
#[derive(Debug, Serialize)]
#[serde(tag = "op", rename_all = "camelCase")]
enum BridgeCommand {
    #[serde(rename_all = "camelCase")]
    Start {
        session: String,
        credentials: BTreeMap<String, String>,
        client_name: String,
    },
    Send { id: u64, to: String, text: String },
    Logout { id: u64 },
}

/// Messages read from the bridge
#[derive(Debug, Deserialize)]
#[serde(tag = "event", rename_all = "camelCase")]
enum BridgeMessage {
    Qr {
        code: String,
    },
    Open {
        user: String,
    },
    #[serde(rename_all = "camelCase")]
    Close {
        #[serde(default)]
        status_code: Option<u16>,
    },
    Creds {
        files: BTreeMap<String, Option<String>>,
    },
    Result {
        id: u64,
        ok: bool,
        #[serde(default)]
        error: Option<String>,
    },
    Log {
        #[serde(default)]
        level: Option<String>,
        message: String,
    },
}

fn decode_files(files: BTreeMap<String, Option<String>>) -> ProtocolResult<CredentialUpdate> {
    files
        .into_iter()
        .map(|(name, data)| -> ProtocolResult<(String, Option<Vec<u8>>)> {
            let bytes = data
                .map(|d| BASE64.decode(d.as_bytes()))
                .transpose()
                .map_err(|e| ProtocolError::MalformedMessage(format!("creds file {}: {}", name, e)))?;
            Ok((name, bytes))
        })
        .collect()
}

/// Connector that spawns the configured bridge program per connection
pub struct BridgeConnector {
    config: BridgeConfig,
}

impl BridgeConnector {
    pub fn new(config: BridgeConfig) -> Self {
        Self { config }
    }
}

#[async_trait]
impl Connector for BridgeConnector {
    async fn connect(&self, request: ConnectRequest) -> ProtocolResult<Link> {
        let mut child = Command::new(&self.config.program)
            .args(&self.config.args)
            .env("WAGATE_SESSION_ID", &request.session_id)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                ProtocolError::ConnectionFailed(format!(
                    "failed to spawn bridge '{}': {}",
                    self.config.program, e
                ))
            })?;

        let pid = child.id().unwrap_or(0);
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| ProtocolError::Bridge("bridge stdin unavailable".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| ProtocolError::Bridge("bridge stdout unavailable".to_string()))?;

        let (event_tx, events) = mpsc::unbounded_channel();
        let pending: Arc<PendingMap> = Arc::new(DashMap::new());

        let reader = tokio::spawn(read_bridge_output(
            request.session_id.clone(),
            stdout,
            event_tx,
            pending.clone(),
        ));

        let connection = BridgeConnection {
            session_id: request.session_id.clone(),
            stdin: Mutex::new(Some(stdin)),
            process: Mutex::new(Some(BridgeProcess {
                child,
                pid,
                reader: Some(reader),
            })),
            pending,
            next_id: AtomicU64::new(1),
            closed: AtomicBool::new(false),
            request_timeout: Duration::from_millis(self.config.request_timeout_ms),
            shutdown_timeout: Duration::from_millis(self.config.shutdown_timeout_ms),
        };

        let credentials = request
            .credentials
            .iter()
            .map(|(name, data)| (name.clone(), BASE64.encode(data)))
            .collect();
        connection
            .write_command(&BridgeCommand::Start {
                session: request.session_id.clone(),
                credentials,
                client_name: request.client_name.clone(),
            })
            .await?;

        info!("Started bridge process {} for session {}", pid, request.session_id);

        Ok(Link {
            connection: Box::new(connection),
            events,
        })
    }

    fn connector_type(&self) -> &'static str {
        "bridge"
    }
}

/// Read bridge stdout until EOF, routing events and request results
async fn read_bridge_output(
    session_id: String,
    stdout: ChildStdout,
    event_tx: mpsc::UnboundedSender<ConnectionEvent>,
    pending: Arc<PendingMap>,
) {
    let mut lines = BufReader::new(stdout).lines();
    let mut close_seen = false;

    loop {
        let line = match lines.next_line().await {
            Ok(Some(line)) => line,
            Ok(None) => break,
            Err(e) => {
                error!("Error reading bridge output for {}: {}", session_id, e);
                break;
            }
        };

        let line = line.trim();
        if line.is_empty() {
            continue;
        }

        let message: BridgeMessage = match serde_json::from_str(line) {
            Ok(message) => message,
            Err(e) => {
                warn!("Ignoring malformed bridge line for {}: {}", session_id, e);
                continue;
            }
        };

        let event = match message {
            BridgeMessage::Qr { code } => ConnectionEvent::Challenge { payload: code },
            BridgeMessage::Open { user } => ConnectionEvent::Open { user },
            BridgeMessage::Close { status_code } => {
                close_seen = true;
                ConnectionEvent::Closed {
                    reason: CloseReason::from_status_code(status_code),
                }
            }
            BridgeMessage::Creds { files } => match decode_files(files) {
                Ok(update) => ConnectionEvent::CredentialsUpdated(update),
                Err(e) => {
                    error!("Dropping credential update for {}: {}", session_id, e);
                    continue;
                }
            },
            BridgeMessage::Result { id, ok, error } => {
                if let Some((_, tx)) = pending.remove(&id) {
                    let outcome = if ok {
                        Ok(())
                    } else {
                        Err(error.unwrap_or_else(|| "unknown error".to_string()))
                    };
                    let _ = tx.send(outcome);
                } else {
                    debug!("Result for unknown request {} on {}", id, session_id);
                }
                continue;
            }
            BridgeMessage::Log { level, message } => {
                match level.as_deref() {
                    Some("error") => error!("[bridge {}] {}", session_id, message),
                    Some("warn") => warn!("[bridge {}] {}", session_id, message),
                    _ => debug!("[bridge {}] {}", session_id, message),
                }
                continue;
            }
        };

        if event_tx.send(event).is_err() {
            debug!("Event receiver dropped for {}", session_id);
        }
    }

    // Fail anything still waiting on a reply
    let ids: Vec<u64> = pending.iter().map(|e| *e.key()).collect();
    for id in ids {
        if let Some((_, tx)) = pending.remove(&id) {
            let _ = tx.send(Err("bridge exited".to_string()));
        }
    }

    if !close_seen {
        let _ = event_tx.send(ConnectionEvent::Closed {
            reason: CloseReason::Transient(None),
        });
    }

    debug!("Bridge output closed for {}", session_id);
}

/// Child process plus its stdout reader
struct BridgeProcess {
    child: Child,
    pid: u32,
    reader: Option<tokio::task::JoinHandle<()>>,
}

impl BridgeProcess {
    /// Wait for the process to exit on its own, then force kill
    async fn shutdown(&mut self, timeout: Duration) -> Result<(), std::io::Error> {
        match tokio::time::timeout(timeout, self.child.wait()).await {
            Ok(Ok(_)) => {
                debug!("Bridge process {} exited", self.pid);
            }
            _ => {
                warn!("Force killing bridge process {}", self.pid);
                self.child.kill().await?;
            }
        }

        // The reader finishes on its own at EOF; it still owns the event
        // sender, so let it flush rather than aborting.
        self.reader.take();
        Ok(())
    }
}

/// Live connection backed by a bridge process
pub struct BridgeConnection {
    session_id: String,
    stdin: Mutex<Option<ChildStdin>>,
    process: Mutex<Option<BridgeProcess>>,
    pending: Arc<PendingMap>,
    next_id: AtomicU64,
    closed: AtomicBool,
    request_timeout: Duration,
    shutdown_timeout: Duration,
}

impl BridgeConnection {
    async fn write_command(&self, command: &BridgeCommand) -> ProtocolResult<()> {
        let mut line = serde_json::to_vec(command)?;
        line.push(b'\n');

        let mut guard = self.stdin.lock().await;
        let stdin = guard.as_mut().ok_or(ProtocolError::NotConnected)?;
        stdin.write_all(&line).await?;
        stdin.flush().await?;
        Ok(())
    }

    /// Send a request and wait for the bridge's result line
    async fn request(&self, build: impl FnOnce(u64) -> BridgeCommand) -> ProtocolResult<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(ProtocolError::NotConnected);
        }

        let id = self.next_id.fetch_add(1, Ordering::SeqCst);
        let (tx, rx) = oneshot::channel();
        self.pending.insert(id, tx);

        if let Err(e) = self.write_command(&build(id)).await {
            self.pending.remove(&id);
            return Err(e);
        }

        match tokio::time::timeout(self.request_timeout, rx).await {
            Ok(Ok(Ok(()))) => Ok(()),
            Ok(Ok(Err(message))) => Err(ProtocolError::Rejected(message)),
            Ok(Err(_)) => Err(ProtocolError::NotConnected),
            Err(_) => {
                self.pending.remove(&id);
                Err(ProtocolError::Timeout(self.request_timeout.as_millis() as u64))
            }
        }
    }
}

#[async_trait]
impl Connection for BridgeConnection {
    async fn send_text(&self, to: &str, text: &str) -> ProtocolResult<()> {
        let (to, text) = (to.to_string(), text.to_string());
        self.request(move |id| BridgeCommand::Send { id, to, text })
            .await
            .map_err(|e| match e {
                ProtocolError::Rejected(msg) => ProtocolError::SendFailed(msg),
                other => other,
            })
    }

    async fn logout(&self) -> ProtocolResult<()> {
        self.request(|id| BridgeCommand::Logout { id })
            .await
            .map_err(|e| match e {
                ProtocolError::Rejected(msg) => ProtocolError::LogoutFailed(msg),
                other => other,
            })
    }

    async fn close(&self) -> ProtocolResult<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }

        // Closing stdin asks the bridge to exit
        self.stdin.lock().await.take();

        if let Some(mut process) = self.process.lock().await.take() {
            process.shutdown(self.shutdown_timeout).await?;
            info!("Closed bridge for session {}", self.session_id);
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::credentials::CredentialBlob;

    fn script_config(script: &str) -> BridgeConfig {
        BridgeConfig {
            program: "sh".to_string(),
            args: vec!["-c".to_string(), script.to_string()],
            request_timeout_ms: 2000,
            shutdown_timeout_ms: 500,
            ..BridgeConfig::default()
        }
    }

    fn request() -> ConnectRequest {
        let mut credentials = CredentialBlob::new();
        credentials.insert("creds.json".to_string(), b"{}".to_vec());
        ConnectRequest {
            session_id: "u1".to_string(),
            credentials,
            client_name: "wagate".to_string(),
        }
    }

    #[test]
    fn test_parse_bridge_messages() {
        let msg: BridgeMessage = serde_json::from_str(r#"{"event":"close","statusCode":401}"#).unwrap();
        assert!(matches!(msg, BridgeMessage::Close { status_code: Some(401) }));

        let msg: BridgeMessage = serde_json::from_str(r#"{"event":"close"}"#).unwrap();
        assert!(matches!(msg, BridgeMessage::Close { status_code: None }));

        let msg: BridgeMessage =
            serde_json::from_str(r#"{"event":"result","id":3,"ok":false,"error":"nope"}"#).unwrap();
        assert!(matches!(msg, BridgeMessage::Result { id: 3, ok: false, .. }));
    }

    #[test]
    fn test_start_command_shape() {
        let cmd = BridgeCommand::Start {
            session: "u1".to_string(),
            credentials: BTreeMap::new(),
            client_name: "wagate".to_string(),
        };
        let json = serde_json::to_value(&cmd).unwrap();
        assert_eq!(json["op"], "start");
        assert_eq!(json["clientName"], "wagate");
    }

    #[test]
    fn test_decode_files() {
        let mut files = BTreeMap::new();
        files.insert("creds.json".to_string(), Some("e30=".to_string()));
        files.insert("old-key.json".to_string(), None);

        let update = decode_files(files).unwrap();
        assert_eq!(update["creds.json"], Some(b"{}".to_vec()));
        assert_eq!(update["old-key.json"], None);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_bridge_events() {
        let script = r#"read start
echo '{"event":"qr","code":"challenge-1"}'
echo '{"event":"creds","files":{"creds.json":"e30="}}'
echo '{"event":"close","statusCode":401}'"#;
        let connector = BridgeConnector::new(script_config(script));
        let mut link = connector.connect(request()).await.unwrap();

        match link.events.recv().await {
            Some(ConnectionEvent::Challenge { payload }) => assert_eq!(payload, "challenge-1"),
            other => panic!("unexpected event: {:?}", other),
        }
        assert!(matches!(
            link.events.recv().await,
            Some(ConnectionEvent::CredentialsUpdated(_))
        ));
        match link.events.recv().await {
            Some(ConnectionEvent::Closed { reason }) => assert!(reason.is_logged_out()),
            other => panic!("unexpected event: {:?}", other),
        }

        link.connection.close().await.unwrap();
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_scripted_bridge_send_and_exit() {
        let script = r#"read start
read cmd
echo '{"event":"result","id":1,"ok":true}'
read cmd
echo '{"event":"result","id":2,"ok":false,"error":"bad jid"}'"#;
        let connector = BridgeConnector::new(script_config(script));
        let mut link = connector.connect(request()).await.unwrap();

        link.connection.send_text("1@s.whatsapp.net", "hi").await.unwrap();
        let err = link.connection.send_text("x", "hi").await.unwrap_err();
        assert!(matches!(err, ProtocolError::SendFailed(ref m) if m == "bad jid"));

        // Script exits without a close line: reported as transient
        match link.events.recv().await {
            Some(ConnectionEvent::Closed { reason }) => assert!(!reason.is_logged_out()),
            other => panic!("unexpected event: {:?}", other),
        }
        link.connection.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_missing_program_fails_to_connect() {
        let connector = BridgeConnector::new(BridgeConfig {
            program: "/nonexistent/wagate-bridge".to_string(),
            ..BridgeConfig::default()
        });
        let result = connector.connect(request()).await;
        assert!(matches!(result, Err(ProtocolError::ConnectionFailed(_))));
    }
}
