//! Radio side: forwards characteristic operations to the verifier over one
//! persistent WebSocket, reconnecting on a fixed backoff. Requests are never
//! queued across a disconnect; callers get `TransportUnavailable` and the
//! client retries the whole read/write cycle.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

use super::protocol::{Inbound, Notice, RelayAction, RelayRequest, RelayResponse};
use crate::error::{Error, Result};
use crate::transport::{AttError, GattHandler};

#[derive(Debug, Clone)]
pub struct RelayClientConfig {
    /// e.g. `ws://192.168.64.2:3100`
    pub url: String,
    pub reconnect_backoff: Duration,
    pub request_timeout: Duration,
    /// Authentication waits for the unlock sequence on the far side, which
    /// takes several seconds on its own.
    pub auth_timeout: Duration,
}

impl RelayClientConfig {
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            reconnect_backoff: Duration::from_secs(3),
            request_timeout: Duration::from_secs(5),
            auth_timeout: Duration::from_secs(15),
        }
    }
}

type Pending = HashMap<u64, oneshot::Sender<RelayResponse>>;

pub struct RelayClient {
    config: RelayClientConfig,
    link: Mutex<Option<mpsc::UnboundedSender<String>>>,
    pending: Mutex<Pending>,
    next_id: AtomicU64,
    connected: watch::Sender<bool>,
    registration_mode: AtomicBool,
}

impl RelayClient {
    pub fn new(config: RelayClientConfig) -> Arc<Self> {
        let (connected, _) = watch::channel(false);
        Arc::new(Self {
            config,
            link: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connected,
            registration_mode: AtomicBool::new(false),
        })
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    /// Last registration state announced by the verifier.
    pub fn registration_mode(&self) -> bool {
        self.registration_mode.load(Ordering::Relaxed)
    }

    pub async fn wait_connected(&self, limit: Duration) -> bool {
        let mut rx = self.connected.subscribe();
        let connected = matches!(
            tokio::time::timeout(limit, rx.wait_for(|c| *c)).await,
            Ok(Ok(_))
        );
        connected
    }

    /// Runs the connect / reconnect loop until the handle is aborted.
    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let this = self.clone();
        tokio::spawn(async move {
            loop {
                match this.connect_once().await {
                    Ok(()) => warn!("verifier closed the connection"),
                    Err(e) => warn!("verifier connection lost: {e}"),
                }
                info!(
                    "reconnecting in {}s",
                    this.config.reconnect_backoff.as_secs_f32()
                );
                tokio::time::sleep(this.config.reconnect_backoff).await;
            }
        })
    }

    async fn connect_once(&self) -> anyhow::Result<()> {
        let (ws, _) = tokio::time::timeout(
            self.config.request_timeout,
            connect_async(self.config.url.as_str()),
        )
        .await??;
        info!(url = %self.config.url, "connected to verifier");

        let (mut sink, mut stream) = ws.split();
        let (tx, mut rx) = mpsc::unbounded_channel::<String>();
        *self.link.lock() = Some(tx);
        self.connected.send_replace(true);

        let writer = async {
            while let Some(text) = rx.recv().await {
                sink.send(Message::Text(text)).await?;
            }
            Ok::<_, tokio_tungstenite::tungstenite::Error>(())
        };
        let reader = async {
            while let Some(msg) = stream.next().await {
                match msg? {
                    Message::Text(text) => self.on_message(&text),
                    Message::Binary(bytes) => self.on_message(&String::from_utf8_lossy(&bytes)),
                    Message::Close(_) => break,
                    _ => {}
                }
            }
            Ok::<_, tokio_tungstenite::tungstenite::Error>(())
        };

        let result = tokio::select! {
            r = writer => r,
            r = reader => r,
        };

        *self.link.lock() = None;
        self.connected.send_replace(false);
        // dropping the senders wakes every waiter with a disconnect
        let dropped = std::mem::take(&mut *self.pending.lock()).len();
        if dropped > 0 {
            warn!(dropped, "in-flight relay requests abandoned");
        }
        result.map_err(Into::into)
    }

    fn on_message(&self, text: &str) {
        match serde_json::from_str::<Inbound>(text) {
            Ok(Inbound::Notice(Notice::Connected { message })) => {
                info!("verifier ready: {}", message.unwrap_or_default());
            }
            Ok(Inbound::Notice(Notice::RegistrationMode { enabled })) => {
                self.registration_mode.store(enabled, Ordering::Relaxed);
                info!(enabled, "verifier registration mode");
            }
            Ok(Inbound::Response(resp)) => {
                let Some(id) = resp.id.as_u64() else {
                    warn!("relay response without id dropped");
                    return;
                };
                match self.pending.lock().remove(&id) {
                    Some(waiter) => {
                        let _ = waiter.send(resp);
                    }
                    None => debug!(id, "late relay response dropped"),
                }
            }
            Err(e) => warn!("unparseable verifier message: {e}"),
        }
    }

    pub async fn request(&self, action: RelayAction, data: Value) -> Result<RelayResponse> {
        let link = self
            .link
            .lock()
            .clone()
            .ok_or_else(|| Error::TransportUnavailable("verifier not connected".into()))?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let text = serde_json::to_string(&RelayRequest {
            id: json!(id),
            action: action.as_str().to_string(),
            data,
        })?;

        let (tx, rx) = oneshot::channel();
        self.pending.lock().insert(id, tx);
        if link.send(text).is_err() {
            self.pending.lock().remove(&id);
            return Err(Error::TransportUnavailable("verifier link closed".into()));
        }

        let limit = match action {
            RelayAction::Authenticate => self.config.auth_timeout,
            _ => self.config.request_timeout,
        };
        match tokio::time::timeout(limit, rx).await {
            Ok(Ok(resp)) => Ok(resp),
            Ok(Err(_)) => Err(Error::TransportUnavailable("verifier disconnected".into())),
            Err(_) => {
                self.pending.lock().remove(&id);
                Err(Error::TransportUnavailable(format!(
                    "{} timed out after {limit:?}",
                    action.as_str()
                )))
            }
        }
    }

    async fn forward_write(&self, action: RelayAction, data: &[u8]) -> Result<(), AttError> {
        let body: Value = serde_json::from_slice(data).map_err(|e| {
            warn!("unparseable {} write: {e}", action.as_str());
            AttError::UnlikelyError
        })?;
        match self.request(action, body).await {
            Ok(resp) if resp.success => {
                info!("{} succeeded", action.as_str());
                Ok(())
            }
            Ok(resp) => {
                warn!("{} failed: {}", action.as_str(), resp.error.unwrap_or_default());
                Err(AttError::UnlikelyError)
            }
            Err(e) => {
                error!("{} error: {e}", action.as_str());
                Err(AttError::UnlikelyError)
            }
        }
    }
}

#[async_trait]
impl GattHandler for RelayClient {
    async fn read_challenge(&self) -> Result<Vec<u8>, AttError> {
        debug!("challenge read request");
        let resp = self
            .request(RelayAction::GetChallenge, json!({}))
            .await
            .map_err(|e| {
                error!("challenge error: {e}");
                AttError::UnlikelyError
            })?;
        let challenge = resp
            .challenge
            .filter(|_| resp.success)
            .ok_or(AttError::UnlikelyError)?;
        serde_json::to_vec(&challenge).map_err(|_| AttError::UnlikelyError)
    }

    async fn write_auth(&self, data: &[u8]) -> Result<(), AttError> {
        self.forward_write(RelayAction::Authenticate, data).await
    }

    async fn write_register(&self, data: &[u8]) -> Result<(), AttError> {
        self.forward_write(RelayAction::Register, data).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wait_connected_reports_link_state() {
        let client = RelayClient::new(RelayClientConfig::new("ws://unused"));
        assert!(!client.wait_connected(Duration::from_millis(20)).await);
        client.connected.send_replace(true);
        assert!(client.wait_connected(Duration::from_millis(20)).await);
    }

    #[tokio::test]
    async fn requests_fail_fast_when_disconnected() {
        let client = RelayClient::new(RelayClientConfig::new("ws://127.0.0.1:9"));
        let err = client
            .request(RelayAction::Ping, json!({}))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::TransportUnavailable(_)));
        assert_eq!(client.read_challenge().await, Err(AttError::UnlikelyError));
    }

    #[test]
    fn responses_are_routed_by_id() {
        let client = RelayClient::new(RelayClientConfig::new("ws://unused"));
        let (tx, mut rx) = oneshot::channel();
        client.pending.lock().insert(7, tx);
        client.on_message(r#"{"id":7,"success":true,"pong":true}"#);
        let resp = rx.try_recv().unwrap();
        assert_eq!(resp.pong, Some(true));
        assert!(client.pending.lock().is_empty());
    }

    #[test]
    fn registration_notice_is_recorded() {
        let client = RelayClient::new(RelayClientConfig::new("ws://unused"));
        client.on_message(r#"{"type":"registrationMode","enabled":true}"#);
        assert!(client.registration_mode());
    }
}
