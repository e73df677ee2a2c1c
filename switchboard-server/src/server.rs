//! The relay: validated intros, channel placement, opaque MSG forwarding.
//!
//! Clients are trusted with nothing. The first frame must be a
//! [`ClientIntro`] whose signature is a self-signed witness over the public
//! key and whose id is the SHA-1 of that key; anything else gets a `"dc"`
//! and the door. After admission a client sits in at most one placement
//! (swarm channel or host bucket) and may relay `MSG` packets, whose `from`
//! field is always overwritten with the authenticated sender id so a client
//! cannot impersonate another.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use axum::Router;
use axum::extract::ws::{Message as WsMessage, WebSocket, WebSocketUpgrade};
use axum::extract::{ConnectInfo, State};
use axum::response::IntoResponse;
use axum::routing::get;
use ed25519_dalek::{Signature, Verifier, VerifyingKey};
use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use tokio::sync::{mpsc, watch};

use switchboard_sdk::identity::{make_full_id, make_short_id};
use switchboard_sdk::sps::{ClientIntro, JoinData, SpsPacket};

use crate::config::ServerConfig;

/// Grace period for the intro frame.
const INTRO_TIMEOUT: Duration = Duration::from_secs(15);

struct Client {
    full_id: String,
    short_id: String,
    hosting: bool,
    channels: Mutex<Vec<String>>,
    tx: mpsc::UnboundedSender<WsMessage>,
    last_seen: Mutex<Instant>,
    kill: watch::Sender<bool>,
}

impl Client {
    fn send_json(&self, packet: &SpsPacket) {
        if let Ok(json) = serde_json::to_string(packet) {
            let _ = self.tx.send(WsMessage::Text(json.into()));
        }
    }
}

pub struct SharedState {
    cfg: ServerConfig,
    /// FullID → client.
    clients: Mutex<HashMap<String, Arc<Client>>>,
    /// ShortID → FullID.
    aliases: Mutex<HashMap<String, String>>,
    /// Channel key → member FullIDs.
    channels: Mutex<HashMap<String, HashSet<String>>>,
}

impl SharedState {
    fn resolve(&self, id: &str) -> Option<Arc<Client>> {
        let clients = self.clients.lock();
        if let Some(client) = clients.get(id) {
            return Some(client.clone());
        }
        let full = self.aliases.lock().get(id).cloned()?;
        clients.get(&full).cloned()
    }

    pub fn client_count(&self) -> usize {
        self.clients.lock().len()
    }

    pub fn channel_count(&self) -> usize {
        self.channels.lock().len()
    }
}

/// Reject reasons for an intro; the client only ever sees `"dc"`.
fn validate_intro(cfg: &ServerConfig, intro: &ClientIntro) -> Result<(), &'static str> {
    if let Some(required) = &cfg.pass
        && intro.pass_code.as_deref() != Some(required.as_str())
    {
        return Err("passcode mismatch");
    }
    let key: [u8; 32] = intro
        .pub_key
        .as_slice()
        .try_into()
        .map_err(|_| "public key is not 32 bytes")?;
    let verifying = VerifyingKey::from_bytes(&key).map_err(|_| "unusable public key")?;
    let sig: [u8; 64] = intro
        .signature
        .as_slice()
        .try_into()
        .map_err(|_| "signature is not 64 bytes")?;
    verifying
        .verify(&intro.pub_key, &Signature::from_bytes(&sig))
        .map_err(|_| "witness signature invalid")?;
    if make_full_id(&intro.pub_key) != intro.id {
        return Err("id does not match public key");
    }
    Ok(())
}

pub struct Server {
    state: Arc<SharedState>,
}

impl Server {
    pub fn new(cfg: ServerConfig) -> Self {
        Self {
            state: Arc::new(SharedState {
                cfg,
                clients: Mutex::new(HashMap::new()),
                aliases: Mutex::new(HashMap::new()),
                channels: Mutex::new(HashMap::new()),
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(ws_handler))
            .with_state(self.state.clone())
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = format!("{}:{}", self.state.cfg.host, self.state.cfg.port);
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .with_context(|| format!("binding {addr}"))?;
        tracing::info!("SPS relay listening on {addr}");
        self.serve(listener).await
    }

    pub async fn serve(self, listener: tokio::net::TcpListener) -> anyhow::Result<()> {
        if self.state.cfg.stat_freq > 0 {
            let state = self.state.clone();
            tokio::spawn(async move {
                let every = Duration::from_secs(state.cfg.stat_freq);
                loop {
                    tokio::time::sleep(every).await;
                    tracing::info!(
                        clients = state.client_count(),
                        channels = state.channel_count(),
                        "relay stats"
                    );
                }
            });
        }
        let router = self
            .router()
            .into_make_service_with_connect_info::<SocketAddr>();
        axum::serve(listener, router).await.map_err(Into::into)
    }
}

async fn ws_handler(
    State(state): State<Arc<SharedState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(state, socket, addr))
}

async fn handle_socket(state: Arc<SharedState>, socket: WebSocket, addr: SocketAddr) {
    let (mut sender, mut receiver) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<WsMessage>();

    let writer = tokio::spawn(async move {
        while let Some(message) = rx.recv().await {
            if sender.send(message).await.is_err() {
                break;
            }
        }
        let _ = sender.send(WsMessage::Close(None)).await;
    });

    // The intro has 15 seconds to arrive and to hold up.
    let intro = match tokio::time::timeout(INTRO_TIMEOUT, receiver.next()).await {
        Ok(Some(Ok(WsMessage::Text(text)))) => {
            serde_json::from_str::<ClientIntro>(text.as_str()).ok()
        }
        _ => None,
    };
    let Some(intro) = intro else {
        let _ = tx.send(WsMessage::Text("dc".into()));
        writer.abort();
        return;
    };
    if let Err(reason) = validate_intro(&state.cfg, &intro) {
        if !state.cfg.quiet {
            tracing::warn!(%addr, reason, "rejecting client");
        }
        let _ = tx.send(WsMessage::Text("dc".into()));
        // Give the writer a moment to flush the rejection.
        tokio::time::sleep(Duration::from_millis(10)).await;
        writer.abort();
        return;
    }

    let (kill, mut kill_rx) = watch::channel(false);
    let client = Arc::new(Client {
        full_id: intro.id.clone(),
        short_id: make_short_id(&intro.id),
        hosting: intro.hosting,
        channels: Mutex::new(Vec::new()),
        tx: tx.clone(),
        last_seen: Mutex::new(Instant::now()),
        kill,
    });

    // A reconnecting client replaces its old registration.
    if let Some(previous) = state.resolve(&client.full_id) {
        let _ = previous.kill.send(true);
    }
    state
        .clients
        .lock()
        .insert(client.full_id.clone(), client.clone());
    state
        .aliases
        .lock()
        .insert(client.short_id.clone(), client.full_id.clone());
    if !state.cfg.quiet {
        tracing::info!(%addr, id = %client.short_id, hosting = client.hosting, "client admitted");
    }

    place_client(&state, &client, &intro);

    let pinger = tokio::spawn(keepalive(state.clone(), client.clone()));

    // Main read loop: every inbound frame proves liveness.
    loop {
        tokio::select! {
            frame = receiver.next() => {
                let message = match frame {
                    Some(Ok(message)) => message,
                    _ => break,
                };
                *client.last_seen.lock() = Instant::now();
                match message {
                    WsMessage::Text(text) => match text.as_str() {
                        "ping" => {
                            let _ = client.tx.send(WsMessage::Text("pong".into()));
                        }
                        "pong" => {}
                        other => handle_packet(&state, &client, other),
                    },
                    WsMessage::Ping(payload) => {
                        let _ = client.tx.send(WsMessage::Pong(payload));
                    }
                    WsMessage::Pong(_) | WsMessage::Binary(_) => {}
                    WsMessage::Close(_) => break,
                }
            }
            _ = kill_rx.changed() => break,
        }
    }

    remove_client(&state, &client);
    pinger.abort();
    writer.abort();
    if !state.cfg.quiet {
        tracing::info!(id = %client.short_id, "client gone");
    }
}

/// Drop a client into its one placement and wake up whoever was waiting.
fn place_client(state: &Arc<SharedState>, client: &Arc<Client>, intro: &ClientIntro) {
    if let Some(swarm) = &intro.swarm_channel {
        let key = format!("#{swarm}");
        broadcast_join(state, &key, &client.full_id);
        subscribe(state, client, key);
    } else if let Some(target) = &intro.host_target {
        let key = format!("host-{target}");
        subscribe(state, client, key);
        if let Some(host) = state.resolve(target)
            && host.hosting
        {
            client.send_json(&SpsPacket::Join {
                data: JoinData {
                    id: host.full_id.clone(),
                },
            });
        }
    } else if client.hosting {
        // Joiners may know us by either spelling; own both buckets and
        // announce ourselves to anyone already waiting in them.
        for key in [
            format!("host-{}", client.short_id),
            format!("host-{}", client.full_id),
        ] {
            broadcast_join(state, &key, &client.full_id);
            subscribe(state, client, key);
        }
    }
}

fn subscribe(state: &Arc<SharedState>, client: &Arc<Client>, key: String) {
    state
        .channels
        .lock()
        .entry(key.clone())
        .or_default()
        .insert(client.full_id.clone());
    client.channels.lock().push(key);
}

/// Tell everyone already in `key` that `joiner_id` arrived.
fn broadcast_join(state: &Arc<SharedState>, key: &str, joiner_id: &str) {
    let members: Vec<String> = state
        .channels
        .lock()
        .get(key)
        .map(|members| members.iter().cloned().collect())
        .unwrap_or_default();
    let packet = SpsPacket::Join {
        data: JoinData {
            id: joiner_id.to_string(),
        },
    };
    for member in members {
        if member == joiner_id {
            continue;
        }
        if let Some(client) = state.resolve(&member) {
            client.send_json(&packet);
        }
    }
}

/// Relay a MSG to its target with `from` overwritten to the authenticated
/// sender. Unknown targets are dropped silently.
fn handle_packet(state: &Arc<SharedState>, client: &Arc<Client>, text: &str) {
    let packet: SpsPacket = match serde_json::from_str(text) {
        Ok(packet) => packet,
        Err(err) => {
            tracing::debug!(id = %client.short_id, "unparseable frame: {err}");
            return;
        }
    };
    match packet {
        SpsPacket::Msg {
            target_client: Some(target),
            data,
            ..
        } => {
            if let Some(dest) = state.resolve(&target) {
                dest.send_json(&SpsPacket::Msg {
                    from: client.full_id.clone(),
                    target_client: None,
                    data,
                });
            }
        }
        SpsPacket::Msg { .. } | SpsPacket::Join { .. } => {
            // MSG without a target has nowhere to go; JOIN is server-issued.
        }
    }
}

/// Ping on the configured cadence; two missed rounds terminate the client.
async fn keepalive(state: Arc<SharedState>, client: Arc<Client>) {
    let every = Duration::from_secs(state.cfg.ping_freq.max(1));
    loop {
        tokio::time::sleep(every).await;
        if client.last_seen.lock().elapsed() > every * 2 {
            if !state.cfg.quiet {
                tracing::info!(id = %client.short_id, "client missed two pings");
            }
            let _ = client.kill.send(true);
            return;
        }
        let ping = if state.cfg.ping_text {
            WsMessage::Text("ping".into())
        } else {
            WsMessage::Ping(Default::default())
        };
        if client.tx.send(ping).is_err() {
            return;
        }
    }
}

fn remove_client(state: &Arc<SharedState>, client: &Arc<Client>) {
    let current = state.clients.lock().get(&client.full_id).cloned();
    // A newer connection may have replaced us already; only unregister if
    // the maps still point at this client.
    if current.is_some_and(|c| Arc::ptr_eq(&c, client)) {
        state.clients.lock().remove(&client.full_id);
        state.aliases.lock().remove(&client.short_id);
    }
    let keys: Vec<String> = client.channels.lock().drain(..).collect();
    let mut channels = state.channels.lock();
    for key in keys {
        if let Some(members) = channels.get_mut(&key) {
            members.remove(&client.full_id);
            if members.is_empty() {
                channels.remove(&key);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use switchboard_sdk::Identity;

    fn intro_for(identity: &Identity, pass: Option<&str>) -> ClientIntro {
        ClientIntro {
            id: identity.full_id().to_string(),
            pub_key: identity.public_key_bytes().to_vec(),
            signature: identity.self_witness().to_bytes().to_vec(),
            hosting: false,
            swarm_channel: None,
            host_target: None,
            pass_code: pass.map(str::to_string),
        }
    }

    #[test]
    fn valid_intro_passes() {
        let identity = Identity::generate();
        let cfg = ServerConfig::default();
        assert!(validate_intro(&cfg, &intro_for(&identity, None)).is_ok());
    }

    #[test]
    fn passcode_is_enforced() {
        let identity = Identity::generate();
        let cfg = ServerConfig {
            pass: Some("sesame".into()),
            ..ServerConfig::default()
        };
        assert!(validate_intro(&cfg, &intro_for(&identity, None)).is_err());
        assert!(validate_intro(&cfg, &intro_for(&identity, Some("wrong"))).is_err());
        assert!(validate_intro(&cfg, &intro_for(&identity, Some("sesame"))).is_ok());
    }

    #[test]
    fn forged_witness_is_rejected() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let cfg = ServerConfig::default();

        let mut intro = intro_for(&identity, None);
        intro.signature = other.self_witness().to_bytes().to_vec();
        assert!(validate_intro(&cfg, &intro).is_err());
    }

    #[test]
    fn id_must_match_public_key() {
        let identity = Identity::generate();
        let other = Identity::generate();
        let cfg = ServerConfig::default();

        let mut intro = intro_for(&identity, None);
        intro.id = other.full_id().to_string();
        assert!(validate_intro(&cfg, &intro).is_err());
    }

    #[test]
    fn truncated_key_is_rejected() {
        let identity = Identity::generate();
        let cfg = ServerConfig::default();
        let mut intro = intro_for(&identity, None);
        intro.pub_key.truncate(16);
        assert!(validate_intro(&cfg, &intro).is_err());
    }
}
