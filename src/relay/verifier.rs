//! Verifier side: accepts the radio host's WebSocket and answers its
//! requests. One radio peer at a time; a new connection replaces the old one.

use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::Response;
use axum::routing::get;
use axum::{Json, Router};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde_json::{json, Value};
use tokio::net::TcpListener;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use super::protocol::{Notice, RelayAction, RelayRequest, RelayResponse};
use crate::context::ServerContext;
use crate::error::Error;
use crate::types::{AuthRequest, RegisterRequest};

struct Peer {
    id: u64,
    tx: mpsc::UnboundedSender<String>,
    /// Dropping this tells the connection task to hang up.
    _kick: oneshot::Sender<()>,
}

pub struct RelayHub {
    ctx: Arc<ServerContext>,
    peer: Mutex<Option<Peer>>,
    next_peer: AtomicU64,
}

impl RelayHub {
    pub fn new(ctx: Arc<ServerContext>) -> Arc<Self> {
        Arc::new(Self {
            ctx,
            peer: Mutex::new(None),
            next_peer: AtomicU64::new(1),
        })
    }

    pub fn is_connected(&self) -> bool {
        self.peer.lock().is_some()
    }

    fn attach(&self, tx: mpsc::UnboundedSender<String>) -> (u64, oneshot::Receiver<()>) {
        let id = self.next_peer.fetch_add(1, Ordering::Relaxed);
        let (kick, kicked) = oneshot::channel();
        if let Some(old) = self.peer.lock().replace(Peer { id, tx, _kick: kick }) {
            info!(old = old.id, new = id, "replacing existing proxy connection");
        }
        (id, kicked)
    }

    fn detach(&self, id: u64) {
        let mut peer = self.peer.lock();
        if peer.as_ref().is_some_and(|p| p.id == id) {
            *peer = None;
        }
    }

    /// Hangs up on the current radio peer, if any.
    pub fn disconnect_peer(&self) {
        self.peer.lock().take();
    }

    fn notify(&self, notice: &Notice) {
        let Ok(text) = serde_json::to_string(notice) else { return };
        if let Some(peer) = self.peer.lock().as_ref() {
            let _ = peer.tx.send(text);
        }
    }

    /// Pushes registration window changes to whoever is connected.
    pub fn spawn_notifier(self: &Arc<Self>) -> JoinHandle<()> {
        let hub: Weak<Self> = Arc::downgrade(self);
        let mut changes = self.ctx.registration.subscribe();
        tokio::spawn(async move {
            while changes.changed().await.is_ok() {
                let enabled = changes.borrow_and_update().active;
                let Some(hub) = hub.upgrade() else { break };
                info!(enabled, "registration mode changed");
                hub.notify(&Notice::RegistrationMode { enabled });
            }
        })
    }

    pub async fn handle_text(&self, text: &str) -> RelayResponse {
        let req: RelayRequest = match serde_json::from_str(text) {
            Ok(r) => r,
            Err(e) => {
                warn!("bad relay message: {e}");
                return RelayResponse::failure("Invalid message");
            }
        };
        let id = req.id.clone();
        let resp = match RelayAction::parse(&req.action) {
            Some(RelayAction::GetChallenge) => {
                let mut r = RelayResponse::ok();
                r.challenge = Some(self.ctx.challenge());
                r
            }
            Some(RelayAction::Authenticate) => self.authenticate(req.data).await,
            Some(RelayAction::Register) => self.register(req.data).await,
            Some(RelayAction::Ping) => {
                let mut r = RelayResponse::ok();
                r.pong = Some(true);
                r
            }
            None => RelayResponse::failure("Unknown action"),
        };
        resp.with_id(id)
    }

    async fn authenticate(&self, data: Value) -> RelayResponse {
        let Ok(req) = serde_json::from_value::<AuthRequest>(data) else {
            return RelayResponse::failure("Authentication failed");
        };
        match self.ctx.authenticate(&req).await {
            Ok(outcome) => match outcome.unlock {
                Ok(()) => RelayResponse {
                    device_name: Some(outcome.device_label),
                    ..RelayResponse::ok()
                },
                Err(_) => RelayResponse::failure("Unlock failed"),
            },
            Err(_) => RelayResponse::failure("Authentication failed"),
        }
    }

    async fn register(&self, data: Value) -> RelayResponse {
        let Ok(req) = serde_json::from_value::<RegisterRequest>(data) else {
            return RelayResponse::failure("Invalid registration");
        };
        match self.ctx.register(&req).await {
            Ok(_) => RelayResponse::ok(),
            Err(Error::RegistrationModeDisabled) => {
                RelayResponse::failure("Registration mode not enabled")
            }
            Err(_) => RelayResponse::failure("Registration failed"),
        }
    }
}

pub fn router(hub: Arc<RelayHub>) -> Router {
    Router::new()
        .route("/", get(upgrade))
        .route("/health", get(health))
        .with_state(hub)
        .layer(TraceLayer::new_for_http())
}

/// Serves the relay until the listener fails.
pub async fn serve(listener: TcpListener, hub: Arc<RelayHub>) -> anyhow::Result<()> {
    info!("relay verifier listening on {}", listener.local_addr()?);
    let notifier = hub.spawn_notifier();
    let app = router(hub);
    let result = axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await;
    notifier.abort();
    result.map_err(Into::into)
}

async fn health(State(hub): State<Arc<RelayHub>>) -> Json<Value> {
    Json(json!({ "ok": true, "proxyConnected": hub.is_connected() }))
}

async fn upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(hub): State<Arc<RelayHub>>,
) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, addr, hub))
}

async fn handle_socket(socket: WebSocket, addr: SocketAddr, hub: Arc<RelayHub>) {
    info!("proxy connected from {addr}");
    let (mut sink, mut stream) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();
    let (peer_id, mut kicked) = hub.attach(tx.clone());

    let writer = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if sink.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
        let _ = sink.close().await;
    });

    let hello = [
        Notice::Connected {
            message: Some("Server ready".into()),
        },
        Notice::RegistrationMode {
            enabled: hub.ctx.registration.is_active(),
        },
    ];
    for notice in &hello {
        if let Ok(text) = serde_json::to_string(notice) {
            let _ = tx.send(text);
        }
    }

    loop {
        tokio::select! {
            _ = &mut kicked => {
                info!("proxy connection superseded");
                break;
            }
            msg = stream.next() => match msg {
                Some(Ok(Message::Text(text))) => spawn_request(&hub, &tx, text),
                Some(Ok(Message::Binary(bytes))) => match String::from_utf8(bytes) {
                    Ok(text) => spawn_request(&hub, &tx, text),
                    Err(_) => warn!("non-utf8 relay frame dropped"),
                },
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(e)) => {
                    error!("websocket error: {e}");
                    break;
                }
            },
        }
    }

    hub.detach(peer_id);
    drop(tx);
    writer.abort();
    info!("proxy disconnected");
}

/// Requests run concurrently so a slow unlock does not hold up pings.
fn spawn_request(hub: &Arc<RelayHub>, tx: &mpsc::UnboundedSender<String>, text: String) {
    let hub = hub.clone();
    let tx = tx.clone();
    tokio::spawn(async move {
        let resp = hub.handle_text(&text).await;
        match serde_json::to_string(&resp) {
            Ok(out) => {
                let _ = tx.send(out);
            }
            Err(e) => error!("failed to encode relay response: {e}"),
        }
    });
}
