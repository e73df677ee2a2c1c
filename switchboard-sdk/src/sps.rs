//! The SPS direct-relay dialect, client side.
//!
//! A narrower protocol for self-hostable relays: one JSON intro proves the
//! client's identity (a self-signed witness over its public key), after
//! which the relay forwards opaque `MSG` packets between clients and
//! announces arrivals with `JOIN`. Keepalive is plain text `"ping"`/`"pong"`;
//! `"dc"` means the relay rejected our credentials and there is no point
//! reconnecting.

use std::collections::HashMap;
use std::sync::Arc;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::config::ConnectionMode;
use crate::connector::{ConnectorContext, ConnectorEvent, backoff_delay};
use crate::error::SwitchboardError;
use crate::event::Subscribable;
use crate::peer::{PeerEvent, PeerSession};

/// First frame from every client: identity plus placement.
///
/// The signature is over the public key itself, a self-signed witness the
/// relay verifies before admitting the client.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClientIntro {
    /// FullID: hex SHA-1 of `pub_key`.
    pub id: String,
    pub pub_key: Vec<u8>,
    pub signature: Vec<u8>,
    pub hosting: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub swarm_channel: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub host_target: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pass_code: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JoinData {
    pub id: String,
}

/// Relay packets, both directions.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum SpsPacket {
    #[serde(rename = "JOIN")]
    Join { data: JoinData },
    #[serde(rename = "MSG")]
    Msg {
        from: String,
        #[serde(rename = "targetClient", skip_serializing_if = "Option::is_none")]
        target_client: Option<String>,
        data: Value,
    },
}

enum SessionEnd {
    Disconnected,
    Fatal(SwitchboardError),
    Killed,
}

struct SpsState {
    open: bool,
    killed: bool,
    did_connect: bool,
    connect_tries: u32,
    /// Peers mid-handshake, keyed by the id the relay knows them under.
    sessions: HashMap<String, PeerSession>,
    task: Option<JoinHandle<()>>,
}

struct SpsInner {
    uri: String,
    ctx: ConnectorContext,
    events: Subscribable<ConnectorEvent>,
    state: Mutex<SpsState>,
    kill_tx: watch::Sender<bool>,
}

/// One SPS relay connection.
#[derive(Clone)]
pub struct SpsConnector {
    inner: Arc<SpsInner>,
}

impl SpsConnector {
    pub fn spawn(uri: impl Into<String>, ctx: ConnectorContext) -> Self {
        let (kill_tx, _) = watch::channel(false);
        let inner = Arc::new(SpsInner {
            uri: uri.into(),
            ctx,
            events: Subscribable::new(),
            state: Mutex::new(SpsState {
                open: false,
                killed: false,
                did_connect: false,
                connect_tries: 0,
                sessions: HashMap::new(),
                task: None,
            }),
            kill_tx,
        });
        let task = tokio::spawn(run(inner.clone()));
        inner.state.lock().task = Some(task);
        Self { inner }
    }

    pub fn events(&self) -> &Subscribable<ConnectorEvent> {
        &self.inner.events
    }

    pub fn uri(&self) -> &str {
        &self.inner.uri
    }

    pub fn is_open(&self) -> bool {
        self.inner.state.lock().open
    }

    /// Stop the connector and destroy every unmatched session. Idempotent.
    pub fn kill(&self) {
        self.inner.shutdown();
    }
}

async fn run(inner: Arc<SpsInner>) {
    let mut kill_rx = inner.kill_tx.subscribe();
    loop {
        if inner.state.lock().killed {
            return;
        }
        let connected = tokio::select! {
            result = tokio_tungstenite::connect_async(inner.uri.as_str()) => result,
            _ = kill_rx.changed() => return,
        };
        match connected {
            Ok((ws, _)) => {
                {
                    let mut state = inner.state.lock();
                    state.did_connect = true;
                    state.connect_tries = 0;
                    state.open = true;
                }
                inner.events.emit(ConnectorEvent::Open);
                let end = inner.run_session(ws, &mut kill_rx).await;
                inner.state.lock().open = false;
                inner.destroy_sessions();
                match end {
                    SessionEnd::Killed => return,
                    SessionEnd::Fatal(err) => {
                        inner.fail(err);
                        return;
                    }
                    SessionEnd::Disconnected => {
                        inner.events.emit(ConnectorEvent::Disconnect);
                    }
                }
            }
            Err(err) => {
                let did_connect = inner.state.lock().did_connect;
                if !did_connect {
                    inner.fail(SwitchboardError::ConnectionFailed(format!(
                        "{}: {err}",
                        inner.uri
                    )));
                    return;
                }
                inner
                    .events
                    .emit(ConnectorEvent::Warn(format!("{}: {err}", inner.uri)));
            }
        }

        let tries = {
            let mut state = inner.state.lock();
            state.connect_tries += 1;
            state.connect_tries
        };
        if tries > inner.ctx.cfg.max_reconnect_attempts {
            inner.fail(SwitchboardError::ConnectionFailed(format!(
                "{}: reconnect attempts exhausted",
                inner.uri
            )));
            return;
        }
        tokio::select! {
            _ = tokio::time::sleep(backoff_delay(tries)) => {}
            _ = kill_rx.changed() => return,
        }
    }
}

impl SpsInner {
    fn build_intro(&self) -> ClientIntro {
        let (hosting, swarm_channel, host_target) = match &self.ctx.mode {
            ConnectionMode::Host { .. } => (true, None, None),
            ConnectionMode::JoinHost { target_id } => (false, None, Some(target_id.clone())),
            ConnectionMode::Swarm { group_id, .. } => (false, Some(group_id.clone()), None),
        };
        ClientIntro {
            id: self.ctx.identity.full_id().to_string(),
            pub_key: self.ctx.identity.public_key_bytes().to_vec(),
            signature: self.ctx.identity.self_witness().to_bytes().to_vec(),
            hosting,
            swarm_channel,
            host_target,
            pass_code: self.ctx.cfg.pass_code.clone(),
        }
    }

    async fn run_session(
        self: &Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        kill_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        let intro = match serde_json::to_string(&self.build_intro()) {
            Ok(json) => json,
            Err(err) => return SessionEnd::Fatal(SwitchboardError::PeerFatal(err.to_string())),
        };
        if sink.send(Message::Text(intro.into())).await.is_err() {
            return SessionEnd::Disconnected;
        }

        // Sessions push their handshake payloads here; the select loop owns
        // the sink.
        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();

        loop {
            tokio::select! {
                frame = stream.next() => {
                    let text = match frame {
                        Some(Ok(Message::Text(text))) => text,
                        Some(Ok(Message::Ping(payload))) => {
                            let _ = sink.send(Message::Pong(payload)).await;
                            continue;
                        }
                        Some(Ok(Message::Close(_))) | None => return SessionEnd::Disconnected,
                        Some(Ok(_)) => continue,
                        Some(Err(err)) => {
                            tracing::debug!(uri = %self.uri, "socket error: {err}");
                            return SessionEnd::Disconnected;
                        }
                    };
                    match text.as_str() {
                        "ping" => {
                            if sink.send(Message::Text("pong".into())).await.is_err() {
                                return SessionEnd::Disconnected;
                            }
                        }
                        "pong" => {}
                        "dc" => {
                            return SessionEnd::Fatal(SwitchboardError::ProtocolFailure(
                                "Invalid server credentials".into(),
                            ));
                        }
                        _ => self.handle_packet(&text, &out_tx).await,
                    }
                }
                Some(outbound) = out_rx.recv() => {
                    if sink.send(Message::Text(outbound.into())).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }
                _ = kill_rx.changed() => return SessionEnd::Killed,
            }
        }
    }

    async fn handle_packet(self: &Arc<Self>, text: &str, out_tx: &mpsc::UnboundedSender<String>) {
        let packet: SpsPacket = match serde_json::from_str(text) {
            Ok(packet) => packet,
            Err(err) => {
                tracing::debug!(uri = %self.uri, "unparseable relay frame: {err}");
                return;
            }
        };
        match packet {
            SpsPacket::Join { data } => {
                self.events
                    .emit(ConnectorEvent::PeerSeen(data.id.clone()));
                if self.ctx.blocked(&data.id) {
                    tracing::debug!(peer = %data.id, "gate rejected joiner");
                    return;
                }
                if self.state.lock().sessions.contains_key(&data.id) {
                    return;
                }
                let Some(session) = self.open_session(&data.id, true, out_tx) else {
                    return;
                };
                if let Err(err) = session.handshake(None).await {
                    self.events.emit(ConnectorEvent::Warn(err.to_string()));
                }
            }
            SpsPacket::Msg { from, data, .. } => {
                let existing = self.state.lock().sessions.get(&from).cloned();
                let session = match existing {
                    Some(session) => session,
                    None => {
                        self.events.emit(ConnectorEvent::PeerSeen(from.clone()));
                        if self.ctx.blocked(&from) {
                            return;
                        }
                        match self.open_session(&from, false, out_tx) {
                            Some(session) => session,
                            None => return,
                        }
                    }
                };
                if let Err(err) = session.handshake(Some(&data.to_string())).await {
                    self.events.emit(ConnectorEvent::Warn(err.to_string()));
                }
            }
        }
    }

    /// Create a session for `peer_id`, relay its handshake payloads out as
    /// MSG packets, and wire graduation.
    fn open_session(
        self: &Arc<Self>,
        peer_id: &str,
        initiator: bool,
        out_tx: &mpsc::UnboundedSender<String>,
    ) -> Option<PeerSession> {
        let session =
            match PeerSession::connect(self.ctx.rtc.as_ref(), self.ctx.session_config(initiator)) {
                Ok(session) => session,
                Err(err) => {
                    self.events.emit(ConnectorEvent::Warn(err.to_string()));
                    return None;
                }
            };
        session.set_remote_id(peer_id);
        self.state
            .lock()
            .sessions
            .insert(peer_id.to_string(), session.clone());

        let from = self.ctx.identity.full_id().to_string();
        let target = peer_id.to_string();
        let relay = out_tx.clone();
        session.on("handshake", move |event| {
            if let PeerEvent::Handshake(payload) = event {
                let data: Value = serde_json::from_str(payload)
                    .unwrap_or_else(|_| Value::String(payload.clone()));
                let packet = SpsPacket::Msg {
                    from: from.clone(),
                    target_client: Some(target.clone()),
                    data,
                };
                if let Ok(json) = serde_json::to_string(&packet) {
                    let _ = relay.send(json);
                }
            }
        });

        let weak = Arc::downgrade(self);
        let id = peer_id.to_string();
        session.once("connect", move |_| {
            if let Some(inner) = weak.upgrade() {
                let session = inner.state.lock().sessions.remove(&id);
                if let Some(session) = session {
                    inner.events.emit(ConnectorEvent::Peer(session));
                }
            }
        });
        let weak = Arc::downgrade(self);
        let id = peer_id.to_string();
        session.events().permanent("close", move |_: &PeerEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.state.lock().sessions.remove(&id);
            }
        });

        Some(session)
    }

    fn destroy_sessions(&self) {
        let sessions: Vec<PeerSession> = {
            let mut state = self.state.lock();
            state.sessions.drain().map(|(_, s)| s).collect()
        };
        for session in sessions {
            session.close(true);
        }
    }

    fn fail(&self, err: SwitchboardError) {
        if std::mem::replace(&mut self.state.lock().killed, true) {
            return;
        }
        self.destroy_sessions();
        let _ = self.kill_tx.send(true);
        self.events.emit(ConnectorEvent::Kill(err));
    }

    fn shutdown(&self) {
        let task = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.killed, true) {
                return;
            }
            state.open = false;
            state.task.take()
        };
        let _ = self.kill_tx.send(true);
        self.destroy_sessions();
        self.events.emit(ConnectorEvent::Disconnect);
        if let Some(task) = task {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::SwitchboardConfig;
    use crate::identity::{Identity, info_hash, make_full_id};
    use crate::rtc::testing::FakeFactory;
    use ed25519_dalek::{Signature, Verifier, VerifyingKey};
    use std::time::Duration;
    use tokio::net::TcpListener;

    fn test_context(mode: ConnectionMode) -> ConnectorContext {
        let cfg = SwitchboardConfig::default();
        let identity = Identity::generate();
        ConnectorContext {
            info_hash: info_hash(&cfg.realm, &cfg.user_key),
            identity,
            cfg,
            rtc: Arc::new(FakeFactory::default()),
            gate: Arc::new(|_: &str| false),
            mode,
        }
    }

    async fn next_text(
        ws: &mut tokio_tungstenite::WebSocketStream<tokio::net::TcpStream>,
    ) -> String {
        loop {
            let frame = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for a frame")
                .expect("socket closed")
                .expect("socket error");
            if let Message::Text(text) = frame {
                return text.to_string();
            }
        }
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn intro_join_and_relay_flow() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();

            let intro: ClientIntro = serde_json::from_str(&next_text(&mut ws).await).unwrap();
            assert!(!intro.hosting);
            assert_eq!(intro.swarm_channel.as_deref(), Some("games"));
            assert_eq!(intro.id, make_full_id(&intro.pub_key));
            let key: [u8; 32] = intro.pub_key.clone().try_into().unwrap();
            let verifying = VerifyingKey::from_bytes(&key).unwrap();
            let sig: [u8; 64] = intro.signature.clone().try_into().unwrap();
            verifying
                .verify(&intro.pub_key, &Signature::from_bytes(&sig))
                .unwrap();

            // Keepalive round-trips.
            ws.send(Message::Text("ping".into())).await.unwrap();
            assert_eq!(next_text(&mut ws).await, "pong");

            // A peer joined: the client must initiate toward it.
            let join = serde_json::to_string(&SpsPacket::Join {
                data: JoinData {
                    id: "a".repeat(40),
                },
            })
            .unwrap();
            ws.send(Message::Text(join.into())).await.unwrap();

            let relayed: SpsPacket = serde_json::from_str(&next_text(&mut ws).await).unwrap();
            let SpsPacket::Msg {
                from,
                target_client,
                data,
            } = relayed
            else {
                panic!("expected MSG relay");
            };
            assert_eq!(from, intro.id);
            assert_eq!(target_client.as_deref(), Some("a".repeat(40).as_str()));
            assert_eq!(data["type"], "offer");
        });

        let ctx = test_context(ConnectionMode::Swarm {
            group_id: "games".into(),
            max_peers: 8,
        });
        let connector = SpsConnector::spawn(format!("ws://{addr}"), ctx);
        server.await.unwrap();
        connector.kill();
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn dc_is_fatal_and_never_reconnects() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _intro = next_text(&mut ws).await;
            ws.send(Message::Text("dc".into())).await.unwrap();
            tokio::time::sleep(Duration::from_secs(1)).await;
        });

        let ctx = test_context(ConnectionMode::Host { max_peers: 8 });
        let connector = SpsConnector::spawn(format!("ws://{addr}"), ctx);

        let (tx, mut rx) = mpsc::unbounded_channel();
        connector.events().on("kill", move |event| {
            if let ConnectorEvent::Kill(err) = event {
                let _ = tx.send(err.clone());
            }
        });
        let err = tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            err,
            SwitchboardError::ProtocolFailure("Invalid server credentials".into())
        );
        assert!(!connector.is_open());
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn inbound_msg_spawns_answering_session() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = tokio_tungstenite::accept_async(stream).await.unwrap();
            let _intro = next_text(&mut ws).await;

            // A remote offer relayed through the server.
            let offer = serde_json::to_string(&SpsPacket::Msg {
                from: "b".repeat(40),
                target_client: None,
                data: serde_json::json!({"type": "offer", "sdp": "v=0\r\ns=x"}),
            })
            .unwrap();
            ws.send(Message::Text(offer.into())).await.unwrap();

            // The client answers through the relay.
            let relayed: SpsPacket = serde_json::from_str(&next_text(&mut ws).await).unwrap();
            let SpsPacket::Msg {
                target_client,
                data,
                ..
            } = relayed
            else {
                panic!("expected MSG relay");
            };
            assert_eq!(target_client.as_deref(), Some("b".repeat(40).as_str()));
            assert_eq!(data["type"], "answer");
        });

        let ctx = test_context(ConnectionMode::Host { max_peers: 8 });
        let connector = SpsConnector::spawn(format!("ws://{addr}"), ctx);
        server.await.unwrap();
        connector.kill();
    }
}
