//! The BT-style WebSocket tracker dialect.
//!
//! Speaks the WebTorrent tracker protocol: JSON text frames carrying
//! announces, batched WebRTC offers, and relayed answers. The tracker never
//! sees anything but opaque SDP envelopes; identity is established end to
//! end after the session connects.
//!
//! The 40-hex InfoHash travels as its 20 raw bytes reinterpreted as a
//! Latin-1 string, matching the historical WebTorrent encoding bit for bit.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use futures_util::{SinkExt, StreamExt};
use parking_lot::Mutex;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::Message;

use crate::connector::{ConnectorContext, ConnectorEvent, backoff_delay};
use crate::error::SwitchboardError;
use crate::event::Subscribable;
use crate::identity::info_hash_wire;
use crate::peer::{PeerEvent, PeerSession};

/// Announce cadence used until the tracker dictates one.
const DEFAULT_CADENCE: Duration = Duration::from_secs(50);

#[derive(Debug, Clone, Serialize)]
struct OfferEntry {
    offer: Value,
    offer_id: String,
}

#[derive(Debug, Serialize)]
struct Announce<'a> {
    action: &'static str,
    info_hash: &'a str,
    peer_id: &'a str,
    downloaded: u32,
    left: u32,
    numwant: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    event: Option<&'static str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offers: Option<&'a [OfferEntry]>,
    #[serde(skip_serializing_if = "Option::is_none")]
    answer: Option<&'a Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    offer_id: Option<&'a str>,
    #[serde(skip_serializing_if = "Option::is_none")]
    to_peer_id: Option<&'a str>,
    #[serde(rename = "trackerID", skip_serializing_if = "Option::is_none")]
    tracker_id: Option<&'a str>,
}

#[derive(Debug, Deserialize)]
struct TrackerMessage {
    #[serde(rename = "failure reason")]
    failure_reason: Option<String>,
    interval: Option<u64>,
    #[serde(rename = "min interval")]
    min_interval: Option<u64>,
    #[serde(rename = "tracker id")]
    tracker_id: Option<String>,
    peer_id: Option<String>,
    offer_id: Option<String>,
    offer: Option<Value>,
    answer: Option<Value>,
}

fn random_offer_id() -> String {
    let mut bytes = [0u8; 20];
    rand::thread_rng().fill_bytes(&mut bytes);
    hex::encode(bytes)
}

enum SessionEnd {
    Disconnected,
    Fatal(SwitchboardError),
    Killed,
}

struct TrackerState {
    open: bool,
    killed: bool,
    did_connect: bool,
    connect_tries: u32,
    cadence: Duration,
    tracker_id: Option<String>,
    /// Every unmatched session this connector still owns, offerers and
    /// answerers alike.
    sessions: HashMap<u64, PeerSession>,
    /// The announce offer table: `(offer_id, session key)`, FIFO-evicted at
    /// twice the invite batch size.
    offers: VecDeque<(String, u64)>,
    next_key: u64,
    task: Option<JoinHandle<()>>,
}

struct TrackerInner {
    uri: String,
    ctx: ConnectorContext,
    wire_info_hash: String,
    events: Subscribable<ConnectorEvent>,
    state: Mutex<TrackerState>,
    kill_tx: watch::Sender<bool>,
}

/// One tracker connection with its reconnect loop and offer table.
#[derive(Clone)]
pub struct TrackerConnector {
    inner: Arc<TrackerInner>,
}

impl TrackerConnector {
    pub fn spawn(uri: impl Into<String>, ctx: ConnectorContext) -> crate::error::Result<Self> {
        let uri = uri.into();
        let wire_info_hash = info_hash_wire(&ctx.info_hash)?;
        let (kill_tx, _) = watch::channel(false);
        let inner = Arc::new(TrackerInner {
            uri,
            ctx,
            wire_info_hash,
            events: Subscribable::new(),
            state: Mutex::new(TrackerState {
                open: false,
                killed: false,
                did_connect: false,
                connect_tries: 0,
                cadence: DEFAULT_CADENCE,
                tracker_id: None,
                sessions: HashMap::new(),
                offers: VecDeque::new(),
                next_key: 0,
                task: None,
            }),
            kill_tx,
        });
        let task = tokio::spawn(run(inner.clone()));
        inner.state.lock().task = Some(task);
        Ok(Self { inner })
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

    pub fn open_offer_count(&self) -> usize {
        self.inner.state.lock().offers.len()
    }

    /// Stop the connector and destroy every unmatched session. Idempotent.
    pub fn kill(&self) {
        self.inner.shutdown();
    }
}

async fn run(inner: Arc<TrackerInner>) {
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

impl TrackerInner {
    async fn run_session(
        self: &Arc<Self>,
        ws: tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
        kill_rx: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let (mut sink, mut stream) = ws.split();

        // Intro announce: no offers yet, just presence.
        if self.send_announce(&mut sink, Some("completed"), &[]).await.is_err() {
            tracing::debug!(uri = %self.uri, "intro announce failed");
            return SessionEnd::Disconnected;
        }

        let mut sent_started = false;
        let mut cadence = self.state.lock().cadence;
        let mut next_announce = Box::pin(tokio::time::sleep(cadence));

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
                    match self.handle_message(&text, &mut sink, &mut sent_started).await {
                        Ok(()) => {
                            let current = self.state.lock().cadence;
                            if current != cadence {
                                cadence = current;
                                next_announce = Box::pin(tokio::time::sleep(cadence));
                            }
                        }
                        Err(err) => return SessionEnd::Fatal(err),
                    }
                }
                _ = &mut next_announce => {
                    let batch = self.make_offer_batch().await;
                    if self.send_announce(&mut sink, None, &batch).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    next_announce = Box::pin(tokio::time::sleep(cadence));
                }
                _ = kill_rx.changed() => return SessionEnd::Killed,
            }
        }
    }

    async fn handle_message<S>(
        self: &Arc<Self>,
        text: &str,
        sink: &mut S,
        sent_started: &mut bool,
    ) -> crate::error::Result<()>
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let msg: TrackerMessage = match serde_json::from_str(text) {
            Ok(msg) => msg,
            Err(err) => {
                tracing::debug!(uri = %self.uri, "unparseable tracker frame: {err}");
                return Ok(());
            }
        };

        if let Some(reason) = msg.failure_reason {
            return Err(SwitchboardError::ProtocolFailure(reason));
        }

        {
            let mut state = self.state.lock();
            if let Some(id) = msg.tracker_id {
                state.tracker_id = Some(id);
            }
            if let Some(secs) = msg.interval.or(msg.min_interval) {
                let cadence = Duration::from_secs(secs.max(1));
                if cadence != state.cadence {
                    state.cadence = cadence;
                }
            }
        }

        // The first reply completes the intro; advertise ourselves with a
        // fresh offer batch.
        if !*sent_started {
            *sent_started = true;
            let batch = self.make_offer_batch().await;
            self.send_announce(sink, Some("started"), &batch)
                .await
                .map_err(|_| {
                    SwitchboardError::ConnectionFailed(format!("{}: write failed", self.uri))
                })?;
        }

        match (msg.offer, msg.answer, msg.peer_id, msg.offer_id) {
            (Some(offer), _, Some(peer_id), Some(offer_id)) => {
                self.handle_remote_offer(sink, offer, &peer_id, &offer_id)
                    .await;
            }
            (_, Some(answer), Some(peer_id), Some(offer_id)) => {
                self.handle_remote_answer(answer, &peer_id, &offer_id).await;
            }
            _ => {}
        }
        Ok(())
    }

    /// Somebody out there wants to talk: answer their offer and relay it
    /// back through the tracker.
    async fn handle_remote_offer<S>(
        self: &Arc<Self>,
        sink: &mut S,
        offer: Value,
        peer_id: &str,
        offer_id: &str,
    ) where
        S: futures_util::Sink<Message> + Unpin,
    {
        self.events
            .emit(ConnectorEvent::PeerSeen(peer_id.to_string()));
        if self.ctx.blocked(peer_id) {
            tracing::debug!(peer_id, "gate rejected inbound offer");
            return;
        }
        let session = match PeerSession::connect(
            self.ctx.rtc.as_ref(),
            self.ctx.session_config(false),
        ) {
            Ok(session) => session,
            Err(err) => {
                self.events.emit(ConnectorEvent::Warn(err.to_string()));
                return;
            }
        };
        session.set_remote_id(peer_id);
        self.adopt(&session);

        let payload = offer.to_string();
        let answer = match session.handshake(Some(&payload)).await {
            Ok(Some(answer)) => answer,
            Ok(None) => {
                session.close(true);
                return;
            }
            Err(err) => {
                self.events.emit(ConnectorEvent::Warn(err.to_string()));
                return;
            }
        };
        let answer: Value = match serde_json::from_str(&answer) {
            Ok(value) => value,
            Err(_) => return,
        };

        let (wire, peer, tracker_id) = {
            let state = self.state.lock();
            (
                self.wire_info_hash.clone(),
                self.ctx.identity.short_id().to_string(),
                state.tracker_id.clone(),
            )
        };
        let announce = Announce {
            action: "announce",
            info_hash: &wire,
            peer_id: &peer,
            downloaded: 0,
            left: 0,
            numwant: self.ctx.cfg.numwant,
            event: None,
            offers: None,
            answer: Some(&answer),
            offer_id: Some(offer_id),
            to_peer_id: Some(peer_id),
            tracker_id: tracker_id.as_deref(),
        };
        if let Ok(json) = serde_json::to_string(&announce) {
            let _ = sink.send(Message::Text(json.into())).await;
        }
    }

    /// An answer came back for one of our open offers; the session finishes
    /// its handshake and graduates on `connect`.
    async fn handle_remote_answer(self: &Arc<Self>, answer: Value, peer_id: &str, offer_id: &str) {
        let session = {
            let mut state = self.state.lock();
            let Some(pos) = state.offers.iter().position(|(id, _)| id == offer_id) else {
                tracing::debug!(offer_id, "answer for unknown offer");
                return;
            };
            // Out of the table, but not destroyed: the session is
            // mid-handshake and self-graduates on connect.
            let (_, key) = state.offers.remove(pos).expect("position just found");
            state.sessions.get(&key).cloned()
        };
        let Some(session) = session else {
            return;
        };
        self.events
            .emit(ConnectorEvent::PeerSeen(peer_id.to_string()));
        session.set_remote_id(peer_id);
        if let Err(err) = session.handshake(Some(&answer.to_string())).await {
            self.events.emit(ConnectorEvent::Warn(err.to_string()));
        }
    }

    /// Pre-generate a batch of offers, each with its own half-open session,
    /// and record them in the offer table (FIFO-evicting beyond the cap).
    async fn make_offer_batch(self: &Arc<Self>) -> Vec<OfferEntry> {
        let mut batch = Vec::with_capacity(self.ctx.cfg.invites);
        for _ in 0..self.ctx.cfg.invites {
            let session = match PeerSession::connect(
                self.ctx.rtc.as_ref(),
                self.ctx.session_config(true),
            ) {
                Ok(session) => session,
                Err(err) => {
                    self.events.emit(ConnectorEvent::Warn(err.to_string()));
                    continue;
                }
            };
            let offer = match session.handshake(None).await {
                Ok(Some(payload)) => payload,
                _ => {
                    session.close(true);
                    continue;
                }
            };
            let Ok(offer) = serde_json::from_str::<Value>(&offer) else {
                session.close(true);
                continue;
            };
            let offer_id = random_offer_id();
            let key = self.adopt(&session);
            let evicted: Vec<PeerSession> = {
                let mut state = self.state.lock();
                state.offers.push_back((offer_id.clone(), key));
                let mut evicted = Vec::new();
                while state.offers.len() > self.ctx.cfg.max_open_offers() {
                    let (_, old_key) = state.offers.pop_front().expect("len checked");
                    if let Some(old) = state.sessions.remove(&old_key) {
                        evicted.push(old);
                    }
                }
                evicted
            };
            for old in evicted {
                old.close(true);
            }
            batch.push(OfferEntry { offer, offer_id });
        }
        batch
    }

    /// Track an unmatched session and wire its graduation: `connect` hands
    /// it upward, `close` cleans it out.
    fn adopt(self: &Arc<Self>, session: &PeerSession) -> u64 {
        let key = {
            let mut state = self.state.lock();
            let key = state.next_key;
            state.next_key += 1;
            state.sessions.insert(key, session.clone());
            key
        };
        let weak = Arc::downgrade(self);
        session.once("connect", move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.graduate(key);
            }
        });
        let weak = Arc::downgrade(self);
        session.events().permanent("close", move |_: &PeerEvent| {
            if let Some(inner) = weak.upgrade() {
                inner.forget(key);
            }
        });
        key
    }

    fn graduate(&self, key: u64) {
        let session = {
            let mut state = self.state.lock();
            state.offers.retain(|(_, k)| *k != key);
            state.sessions.remove(&key)
        };
        if let Some(session) = session {
            self.events.emit(ConnectorEvent::Peer(session));
        }
    }

    fn forget(&self, key: u64) {
        let mut state = self.state.lock();
        state.offers.retain(|(_, k)| *k != key);
        state.sessions.remove(&key);
    }

    async fn send_announce<S>(
        &self,
        sink: &mut S,
        event: Option<&'static str>,
        offers: &[OfferEntry],
    ) -> Result<(), ()>
    where
        S: futures_util::Sink<Message> + Unpin,
    {
        let (peer, tracker_id) = {
            let state = self.state.lock();
            (
                self.ctx.identity.short_id().to_string(),
                state.tracker_id.clone(),
            )
        };
        let announce = Announce {
            action: "announce",
            info_hash: &self.wire_info_hash,
            peer_id: &peer,
            downloaded: 0,
            left: 0,
            numwant: self.ctx.cfg.numwant,
            event,
            offers: (!offers.is_empty()).then_some(offers),
            answer: None,
            offer_id: None,
            to_peer_id: None,
            tracker_id: tracker_id.as_deref(),
        };
        let json = serde_json::to_string(&announce).map_err(|_| ())?;
        sink.send(Message::Text(json.into())).await.map_err(|_| ())
    }

    fn destroy_sessions(&self) {
        let sessions: Vec<PeerSession> = {
            let mut state = self.state.lock();
            state.offers.clear();
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
