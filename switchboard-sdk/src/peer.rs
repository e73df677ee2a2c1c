//! One WebRTC session from candidate to authenticated peer.
//!
//! The session wraps a single UA peer connection and two reserved data
//! channels, pre-negotiated at fixed ids so they open without any signaling
//! round-trip:
//!
//! - id 0, label `_meta`: control channel for in-band renegotiation;
//! - id 1, label `default`: the application channel, surfaced through the
//!   `message` and `data` events.
//!
//! The initial offer/answer exchange runs out-of-band through a rendezvous
//! (the `handshake` event carries the payloads to relay). Everything after
//! that, like adding media or extra data channels, renegotiates over `_meta`
//! and never touches the rendezvous again.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Notify, mpsc};
use tokio::task::JoinHandle;

use crate::error::{Result, SwitchboardError};
use crate::event::{EventName, Subscribable, Subscription};
use crate::rtc::{
    ChannelEvent, ChannelInit, ChannelState, IceCandidate, MediaStreamId, MediaTrack,
    RtcChannel, RtcConnection, RtcConnector, RtcEvent, SdpKind, SessionDescription,
    SignalingState,
};

/// Reserved control channel, id 0.
pub const META_CHANNEL: &str = "_meta";

/// Reserved application channel, id 1.
pub const DEFAULT_CHANNEL: &str = "default";

/// Per-session knobs; the supervisor constructs every session non-trickle.
#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Whether we open the initial connection. Also decides who yields in a
    /// renegotiation glare.
    pub initiator: bool,
    /// Emit every ICE candidate as its own `handshake` event instead of one
    /// complete description.
    pub trickle_ice: bool,
    /// Non-trickle mode gives up waiting for the end of gathering this long
    /// after construction and ships the description as-is.
    pub trickle_timeout: Duration,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            initiator: false,
            trickle_ice: false,
            trickle_timeout: Duration::from_millis(2000),
        }
    }
}

/// Session lifecycle events.
#[derive(Debug, Clone)]
pub enum PeerEvent {
    /// A signaling payload to relay to the peer out-of-band.
    Handshake(String),
    /// First stabilization; at most once per session.
    Connect,
    /// Fires on every stabilization: `_meta` opening, and after each
    /// successful renegotiation.
    Ready,
    /// Payload on the default channel.
    Message(Vec<u8>),
    /// Payload on any channel, with the channel name.
    Data { channel: String, data: Vec<u8> },
    /// A data channel (beyond the reserved pair) opened.
    DataChannel(String),
    /// A remote media stream arrived.
    Stream(MediaStreamId),
    /// A local ICE candidate was gathered (observability).
    IceEvent(IceCandidate),
    /// Local ICE gathering finished.
    IceFinished,
    Error(SwitchboardError),
    /// Exactly once, however the session ends.
    Close,
    /// Additionally, when the closure was not intentional.
    Disconnect,
}

impl EventName for PeerEvent {
    fn name(&self) -> &'static str {
        match self {
            PeerEvent::Handshake(_) => "handshake",
            PeerEvent::Connect => "connect",
            PeerEvent::Ready => "ready",
            PeerEvent::Message(_) => "message",
            PeerEvent::Data { .. } => "data",
            PeerEvent::DataChannel(_) => "dataChannel",
            PeerEvent::Stream(_) => "stream",
            PeerEvent::IceEvent(_) => "iceEvent",
            PeerEvent::IceFinished => "iceFinished",
            PeerEvent::Error(_) => "error",
            PeerEvent::Close => "close",
            PeerEvent::Disconnect => "disconnect",
        }
    }
}

/// Out-of-band signaling payload: either a complete description or a single
/// trickle candidate.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HandshakePayload {
    Description(SessionDescription),
    Candidate(IceCandidate),
}

/// In-band `_meta` frame.
#[derive(Debug, Clone, Serialize, Deserialize)]
struct MetaMessage {
    description: SessionDescription,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    New,
    Offering,
    Answering,
    IceGathering,
    SignalStable,
    Authenticating,
    Open,
    Closed,
}

enum Internal {
    Rtc(RtcEvent),
    Channel(String, ChannelEvent),
}

struct State {
    phase: Phase,
    channels: HashMap<String, Arc<dyn RtcChannel>>,
    /// Send-before-open queues, one FIFO per channel name.
    queued: HashMap<String, VecDeque<Vec<u8>>>,
    buffered_candidates: Vec<IceCandidate>,
    have_remote: bool,
    ice_finished: bool,
    connect_emitted: bool,
    remote_id: Option<String>,
    verified_id: Option<String>,
    streams: HashSet<MediaStreamId>,
    tasks: Vec<JoinHandle<()>>,
}

struct Inner {
    cfg: SessionConfig,
    conn: Arc<dyn RtcConnection>,
    events: Subscribable<PeerEvent>,
    state: Mutex<State>,
    ice_done: Notify,
    created: tokio::time::Instant,
    internal_tx: mpsc::UnboundedSender<Internal>,
}

/// Handle to a running session. Cheap to clone; ownership semantics live
/// with the connector or supervisor that created it.
#[derive(Clone)]
pub struct PeerSession {
    inner: Arc<Inner>,
}

impl std::fmt::Debug for PeerSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("PeerSession")
            .field("phase", &state.phase)
            .field("remote_id", &state.remote_id)
            .finish_non_exhaustive()
    }
}

impl PeerSession {
    /// Open a fresh UA connection and the reserved channel pair.
    pub fn connect(rtc: &dyn RtcConnector, cfg: SessionConfig) -> Result<Self> {
        let (rtc_tx, mut rtc_rx) = mpsc::unbounded_channel();
        let conn = rtc.connect(rtc_tx)?;
        let (internal_tx, internal_rx) = mpsc::unbounded_channel();

        let inner = Arc::new(Inner {
            cfg,
            conn: conn.clone(),
            events: Subscribable::new(),
            state: Mutex::new(State {
                phase: Phase::New,
                channels: HashMap::new(),
                queued: HashMap::new(),
                buffered_candidates: Vec::new(),
                have_remote: false,
                ice_finished: false,
                connect_emitted: false,
                remote_id: None,
                verified_id: None,
                streams: HashSet::new(),
                tasks: Vec::new(),
            }),
            ice_done: Notify::new(),
            created: tokio::time::Instant::now(),
            internal_tx: internal_tx.clone(),
        });

        inner.register_channel(conn.create_data_channel(META_CHANNEL, ChannelInit::negotiated(0))?);
        inner.register_channel(
            conn.create_data_channel(DEFAULT_CHANNEL, ChannelInit::negotiated(1))?,
        );

        let forward = tokio::spawn(async move {
            while let Some(event) = rtc_rx.recv().await {
                if internal_tx.send(Internal::Rtc(event)).is_err() {
                    break;
                }
            }
        });
        let driver = tokio::spawn(run_driver(inner.clone(), internal_rx));
        {
            let mut state = inner.state.lock();
            state.tasks.push(forward);
            state.tasks.push(driver);
        }

        Ok(Self { inner })
    }

    pub fn events(&self) -> &Subscribable<PeerEvent> {
        &self.inner.events
    }

    pub fn on(&self, event: &'static str, cb: impl Fn(&PeerEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.on(event, cb)
    }

    pub fn once(&self, event: &'static str, cb: impl Fn(&PeerEvent) + Send + Sync + 'static) -> Subscription {
        self.inner.events.once(event, cb)
    }

    /// Drive the out-of-band handshake.
    ///
    /// With no payload (initiator side) this generates the local offer and
    /// returns it after the ICE policy is satisfied. With a payload it
    /// applies the remote description or candidate, and returns the answer
    /// payload when one was generated. Every returned payload is also
    /// emitted as a `handshake` event.
    pub async fn handshake(&self, payload: Option<&str>) -> Result<Option<String>> {
        self.inner.handshake(payload).await
    }

    /// Queue `data` on the default channel; delivery is deferred until the
    /// channel opens.
    pub fn send(&self, data: impl AsRef<[u8]>) -> Result<()> {
        self.send_on(DEFAULT_CHANNEL, data)
    }

    /// Queue `data` on a named channel.
    pub fn send_on(&self, channel: &str, data: impl AsRef<[u8]>) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        self.inner.enqueue_or_send(channel, data.as_ref().to_vec())
    }

    /// Open an additional data channel; renegotiation happens in-band.
    pub fn add_data_channel(&self, name: &str, init: ChannelInit) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        if name == META_CHANNEL || name == DEFAULT_CHANNEL {
            tracing::debug!(name, "refusing to shadow a reserved channel");
            return Ok(());
        }
        let channel = self.inner.conn.create_data_channel(name, init)?;
        self.inner.register_channel(channel);
        Ok(())
    }

    /// Close and forget a previously added channel.
    pub fn remove_data_channel(&self, name: &str) {
        if name == META_CHANNEL || name == DEFAULT_CHANNEL {
            return;
        }
        let channel = {
            let mut state = self.inner.state.lock();
            state.queued.remove(name);
            state.channels.remove(name)
        };
        if let Some(channel) = channel {
            channel.close();
        }
    }

    /// Attach media tracks; the UA responds with `negotiationneeded` and the
    /// session renegotiates over `_meta`, never the rendezvous.
    pub fn add_media(
        &self,
        tracks: impl IntoIterator<Item = MediaTrack>,
        stream: MediaStreamId,
    ) -> Result<()> {
        if self.is_closed() {
            return Ok(());
        }
        for track in tracks {
            self.inner.conn.add_track(track, &stream)?;
        }
        Ok(())
    }

    /// Tear the session down. `intentional` suppresses the `disconnect`
    /// event. Closing twice is a no-op.
    pub fn close(&self, intentional: bool) {
        self.inner.close(intentional);
    }

    /// Kill the session with an error; emits `error`, then closes as
    /// unintentional.
    pub fn fatal_error(&self, err: SwitchboardError) {
        self.inner.fatal(err);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.state.lock().phase == Phase::Closed
    }

    /// Whether two handles refer to the same underlying session.
    pub fn ptr_eq(&self, other: &PeerSession) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    pub fn phase(&self) -> Phase {
        self.inner.state.lock().phase
    }

    /// Local SDP text, once a local description exists.
    pub fn local_sdp(&self) -> Option<String> {
        self.inner.conn.local_description().map(|d| d.sdp)
    }

    /// Remote SDP text as we observed it; what the peer must have signed.
    pub fn remote_sdp(&self) -> Option<String> {
        self.inner.conn.remote_description().map(|d| d.sdp)
    }

    /// ID learned from signaling, before authentication.
    pub fn remote_id(&self) -> Option<String> {
        self.inner.state.lock().remote_id.clone()
    }

    pub fn set_remote_id(&self, id: &str) {
        self.inner.state.lock().remote_id = Some(id.to_string());
    }

    /// Cryptographically verified FullID, present after authentication.
    pub fn verified_full_id(&self) -> Option<String> {
        self.inner.state.lock().verified_id.clone()
    }

    pub fn set_verified_full_id(&self, id: &str) {
        let mut state = self.inner.state.lock();
        state.verified_id = Some(id.to_string());
        if state.phase == Phase::Authenticating {
            state.phase = Phase::Open;
        }
    }

    pub fn mark_authenticating(&self) {
        let mut state = self.inner.state.lock();
        if state.phase == Phase::SignalStable {
            state.phase = Phase::Authenticating;
        }
    }

    /// Streams received from the peer so far.
    pub fn streams(&self) -> Vec<MediaStreamId> {
        self.inner.state.lock().streams.iter().cloned().collect()
    }
}

async fn run_driver(inner: Arc<Inner>, mut rx: mpsc::UnboundedReceiver<Internal>) {
    while let Some(event) = rx.recv().await {
        if inner.is_closed() {
            break;
        }
        match event {
            Internal::Rtc(RtcEvent::IceCandidate(Some(candidate))) => {
                inner.on_ice_candidate(candidate);
            }
            Internal::Rtc(RtcEvent::IceCandidate(None)) => inner.on_ice_finished(),
            Internal::Rtc(RtcEvent::NegotiationNeeded) => inner.on_negotiation_needed().await,
            Internal::Rtc(RtcEvent::DataChannel(channel)) => inner.register_channel(channel),
            Internal::Rtc(RtcEvent::Track(stream)) => inner.on_track(stream),
            Internal::Rtc(RtcEvent::SignalingChange(_)) => {}
            Internal::Rtc(RtcEvent::Failed(reason)) => {
                inner.fatal(SwitchboardError::PeerFatal(reason));
            }
            Internal::Channel(label, event) => inner.on_channel_event(&label, event).await,
        }
    }
}

impl Inner {
    fn is_closed(&self) -> bool {
        self.state.lock().phase == Phase::Closed
    }

    fn register_channel(&self, channel: Arc<dyn RtcChannel>) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let label = channel.label().to_string();
        channel.set_event_sink(tx);
        let internal = self.internal_tx.clone();
        let forward_label = label.clone();
        let task = tokio::spawn(async move {
            while let Some(event) = rx.recv().await {
                if internal
                    .send(Internal::Channel(forward_label.clone(), event))
                    .is_err()
                {
                    break;
                }
            }
        });
        let mut state = self.state.lock();
        state.channels.insert(label, channel);
        state.tasks.push(task);
    }

    async fn handshake(&self, payload: Option<&str>) -> Result<Option<String>> {
        if self.is_closed() {
            return Ok(None);
        }
        let Some(text) = payload else {
            self.state.lock().phase = Phase::Offering;
            let offer = self.conn.create_offer().await?;
            self.conn.set_local_description(offer).await?;
            return self.emit_local_description().await;
        };

        match serde_json::from_str::<HandshakePayload>(text) {
            Ok(HandshakePayload::Description(desc)) if desc.kind != SdpKind::Rollback => {
                let is_offer = desc.kind == SdpKind::Offer;
                {
                    let mut state = self.state.lock();
                    if is_offer && state.phase == Phase::New {
                        state.phase = Phase::Answering;
                    }
                }
                self.conn.set_remote_description(desc).await?;
                let buffered: Vec<IceCandidate> = {
                    let mut state = self.state.lock();
                    state.have_remote = true;
                    std::mem::take(&mut state.buffered_candidates)
                };
                for candidate in buffered {
                    self.conn.add_ice_candidate(candidate).await?;
                }
                if is_offer {
                    let answer = self.conn.create_answer().await?;
                    self.conn.set_local_description(answer).await?;
                    return self.emit_local_description().await;
                }
                Ok(None)
            }
            Ok(HandshakePayload::Candidate(candidate)) => {
                let have_remote = self.state.lock().have_remote;
                if have_remote {
                    self.conn.add_ice_candidate(candidate).await?;
                } else {
                    self.state.lock().buffered_candidates.push(candidate);
                }
                Ok(None)
            }
            _ => {
                let err = SwitchboardError::PeerFatal(
                    "handshake payload carries neither SDP nor candidate".into(),
                );
                self.fatal(err.clone());
                Err(err)
            }
        }
    }

    /// Apply the ICE policy, then emit the local description as a
    /// `handshake` payload.
    async fn emit_local_description(&self) -> Result<Option<String>> {
        {
            let mut state = self.state.lock();
            if matches!(state.phase, Phase::Offering | Phase::Answering) {
                state.phase = Phase::IceGathering;
            }
        }
        self.wait_ice().await;
        if self.is_closed() {
            return Ok(None);
        }
        let desc = self
            .conn
            .local_description()
            .ok_or_else(|| SwitchboardError::PeerFatal("no local description".into()))?;
        let json = serde_json::to_string(&desc)
            .map_err(|e| SwitchboardError::PeerFatal(e.to_string()))?;
        self.events.emit(PeerEvent::Handshake(json.clone()));
        Ok(Some(json))
    }

    /// Non-trickle: wait until gathering finishes or `trickle_timeout` has
    /// elapsed since construction, whichever comes first. Late candidates
    /// are dropped on purpose; most rendezvous relays cannot forward them.
    async fn wait_ice(&self) {
        if self.cfg.trickle_ice {
            return;
        }
        let deadline = self.created + self.cfg.trickle_timeout;
        loop {
            let notified = self.ice_done.notified();
            if self.state.lock().ice_finished {
                return;
            }
            if tokio::time::timeout_at(deadline, notified).await.is_err() {
                return;
            }
        }
    }

    fn on_ice_candidate(&self, candidate: IceCandidate) {
        self.events.emit(PeerEvent::IceEvent(candidate.clone()));
        if self.cfg.trickle_ice
            && let Ok(json) = serde_json::to_string(&candidate)
        {
            self.events.emit(PeerEvent::Handshake(json));
        }
    }

    fn on_ice_finished(&self) {
        self.state.lock().ice_finished = true;
        self.ice_done.notify_waiters();
        self.events.emit(PeerEvent::IceFinished);
    }

    /// The UA wants to renegotiate; run the exchange over `_meta` if it is
    /// open. Before `_meta` exists this is the initial negotiation, already
    /// handled by `handshake`.
    async fn on_negotiation_needed(&self) {
        if !self.channel_open(META_CHANNEL) {
            return;
        }
        let result: Result<()> = async {
            let offer = self.conn.create_offer().await?;
            self.conn.set_local_description(offer.clone()).await?;
            self.send_meta(&MetaMessage { description: offer })
        }
        .await;
        if let Err(err) = result {
            self.fatal(err);
        }
    }

    fn channel_open(&self, label: &str) -> bool {
        self.state
            .lock()
            .channels
            .get(label)
            .is_some_and(|c| c.ready_state() == ChannelState::Open)
    }

    fn send_meta(&self, message: &MetaMessage) -> Result<()> {
        let bytes = serde_json::to_vec(message)
            .map_err(|e| SwitchboardError::PeerFatal(e.to_string()))?;
        self.enqueue_or_send(META_CHANNEL, bytes)
    }

    /// Deliver now if the channel is open and nothing is queued ahead;
    /// otherwise append to the channel's FIFO for the open-event flush.
    fn enqueue_or_send(&self, label: &str, data: Vec<u8>) -> Result<()> {
        let ready = {
            let state = self.state.lock();
            state
                .channels
                .get(label)
                .is_some_and(|c| c.ready_state() == ChannelState::Open)
                && state.queued.get(label).is_none_or(|q| q.is_empty())
        };
        if ready {
            let channel = self.state.lock().channels.get(label).cloned();
            if let Some(channel) = channel {
                return channel.send(&data);
            }
        }
        self.state
            .lock()
            .queued
            .entry(label.to_string())
            .or_default()
            .push_back(data);
        Ok(())
    }

    fn flush_queued(&self, label: &str) {
        loop {
            let (channel, data) = {
                let mut state = self.state.lock();
                let Some(channel) = state.channels.get(label).cloned() else {
                    return;
                };
                let Some(data) = state.queued.get_mut(label).and_then(|q| q.pop_front()) else {
                    return;
                };
                (channel, data)
            };
            if let Err(err) = channel.send(&data) {
                self.fatal(err);
                return;
            }
        }
    }

    async fn on_channel_event(&self, label: &str, event: ChannelEvent) {
        match event {
            ChannelEvent::Open => {
                self.flush_queued(label);
                if label == META_CHANNEL {
                    let first = {
                        let mut state = self.state.lock();
                        state.phase = Phase::SignalStable;
                        !std::mem::replace(&mut state.connect_emitted, true)
                    };
                    self.events.emit(PeerEvent::Ready);
                    if first {
                        self.events.emit(PeerEvent::Connect);
                    }
                } else if label != DEFAULT_CHANNEL {
                    self.events.emit(PeerEvent::DataChannel(label.to_string()));
                }
            }
            ChannelEvent::Message(data) => match label {
                META_CHANNEL => self.on_meta_message(&data).await,
                DEFAULT_CHANNEL => {
                    self.events.emit(PeerEvent::Message(data.clone()));
                    self.events.emit(PeerEvent::Data {
                        channel: DEFAULT_CHANNEL.to_string(),
                        data,
                    });
                }
                _ => {
                    self.events.emit(PeerEvent::Data {
                        channel: label.to_string(),
                        data,
                    });
                }
            },
            ChannelEvent::Close => {
                if label == META_CHANNEL {
                    if !self.is_closed() {
                        self.fatal(SwitchboardError::PeerFatal(
                            "control channel closed mid-session".into(),
                        ));
                    }
                } else {
                    let mut state = self.state.lock();
                    state.channels.remove(label);
                    state.queued.remove(label);
                }
            }
            ChannelEvent::Error(reason) => {
                self.fatal(SwitchboardError::PeerFatal(reason));
            }
        }
    }

    async fn on_meta_message(&self, data: &[u8]) {
        let Ok(message) = serde_json::from_slice::<MetaMessage>(data) else {
            self.fatal(SwitchboardError::PeerFatal("malformed control payload".into()));
            return;
        };
        if let Err(err) = self.apply_remote_description(message.description).await {
            self.fatal(err);
        }
    }

    /// In-band renegotiation, including glare resolution: when both sides
    /// offered at once, the initial initiator's offer wins. The initiator
    /// ignores the colliding offer; the non-initiator rolls its own offer
    /// back and accepts.
    async fn apply_remote_description(&self, desc: SessionDescription) -> Result<()> {
        let is_offer = desc.kind == SdpKind::Offer;
        let glare = is_offer && self.conn.signaling_state() != SignalingState::Stable;
        if glare {
            if self.cfg.initiator {
                return Ok(());
            }
            self.conn
                .set_local_description(SessionDescription::rollback())
                .await?;
        }
        self.conn.set_remote_description(desc).await?;
        if is_offer {
            let answer = self.conn.create_answer().await?;
            self.conn.set_local_description(answer.clone()).await?;
            self.send_meta(&MetaMessage {
                description: answer,
            })?;
        }
        self.events.emit(PeerEvent::Ready);
        Ok(())
    }

    fn on_track(&self, stream: MediaStreamId) {
        self.state.lock().streams.insert(stream.clone());
        self.events.emit(PeerEvent::Stream(stream));
    }

    fn fatal(&self, err: SwitchboardError) {
        if self.is_closed() {
            return;
        }
        self.events.emit(PeerEvent::Error(err));
        self.close(false);
    }

    fn close(&self, intentional: bool) {
        let (channels, tasks) = {
            let mut state = self.state.lock();
            if state.phase == Phase::Closed {
                return;
            }
            state.phase = Phase::Closed;
            state.queued.clear();
            (
                state.channels.drain().map(|(_, c)| c).collect::<Vec<_>>(),
                std::mem::take(&mut state.tasks),
            )
        };
        for channel in &channels {
            channel.close();
        }
        self.conn.close();
        self.events.emit(PeerEvent::Close);
        if !intentional {
            self.events.emit(PeerEvent::Disconnect);
        }
        for task in tasks {
            task.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rtc::testing::fake_pair;
    use std::future::Future;
    use std::sync::atomic::{AtomicUsize, Ordering};

    fn pair() -> (PeerSession, PeerSession) {
        let (ca, cb) = fake_pair();
        let a = PeerSession::connect(
            ca.as_ref(),
            SessionConfig {
                initiator: true,
                ..Default::default()
            },
        )
        .unwrap();
        let b = PeerSession::connect(cb.as_ref(), SessionConfig::default()).unwrap();
        (a, b)
    }

    /// Subscribes immediately; the returned future resolves when the event
    /// fires (or already fired since subscription).
    fn expect_event(
        session: &PeerSession,
        name: &'static str,
    ) -> impl Future<Output = ()> + use<> {
        let (tx, mut rx) = mpsc::unbounded_channel();
        session.once(name, move |_| {
            let _ = tx.send(());
        });
        async move {
            tokio::time::timeout(Duration::from_secs(1), rx.recv())
                .await
                .unwrap_or_else(|_| panic!("timed out waiting for {name}"));
        }
    }

    async fn establish(a: &PeerSession, b: &PeerSession) {
        let connect_a = expect_event(a, "connect");
        let connect_b = expect_event(b, "connect");
        let offer = a.handshake(None).await.unwrap().unwrap();
        let answer = b.handshake(Some(&offer)).await.unwrap().unwrap();
        a.handshake(Some(&answer)).await.unwrap();
        connect_a.await;
        connect_b.await;
    }

    fn counter(session: &PeerSession, name: &'static str) -> Arc<AtomicUsize> {
        let count = Arc::new(AtomicUsize::new(0));
        let c2 = count.clone();
        session.on(name, move |_| {
            c2.fetch_add(1, Ordering::SeqCst);
        });
        count
    }

    #[tokio::test]
    async fn offer_answer_establishes_both_sides() {
        let (a, b) = pair();
        establish(&a, &b).await;
        assert_eq!(a.phase(), Phase::SignalStable);
        assert_eq!(b.phase(), Phase::SignalStable);
        assert!(a.local_sdp().is_some());
        assert_eq!(a.remote_sdp(), b.local_sdp());
    }

    #[tokio::test]
    async fn send_before_open_is_buffered_in_order() {
        let (a, b) = pair();
        a.send(b"first").unwrap();
        a.send(b"second").unwrap();

        let received = Arc::new(Mutex::new(Vec::new()));
        let sink = received.clone();
        b.on("message", move |event| {
            if let PeerEvent::Message(data) = event {
                sink.lock().push(data.clone());
            }
        });

        establish(&a, &b).await;
        // Messages flush when the default channel opens; give the drivers a
        // turn to deliver.
        tokio::time::timeout(Duration::from_secs(1), async {
            loop {
                if received.lock().len() == 2 {
                    break;
                }
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
        assert_eq!(*received.lock(), vec![b"first".to_vec(), b"second".to_vec()]);
    }

    #[tokio::test]
    async fn open_channel_delivers_immediately() {
        let (a, b) = pair();
        establish(&a, &b).await;

        let got = Arc::new(AtomicUsize::new(0));
        let g2 = got.clone();
        b.on("data", move |event| {
            if let PeerEvent::Data { channel, data } = event
                && channel == "default"
                && data == b"hello"
            {
                g2.fetch_add(1, Ordering::SeqCst);
            }
        });
        a.send(b"hello").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while got.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }

    #[tokio::test]
    async fn glare_resolves_without_errors() {
        let (a, b) = pair();
        establish(&a, &b).await;

        let ready_a = counter(&a, "ready");
        let ready_b = counter(&b, "ready");
        let errors_a = counter(&a, "error");
        let errors_b = counter(&b, "error");

        let stream_a = expect_event(&a, "stream");
        let stream_b = expect_event(&b, "stream");

        // Both sides renegotiate at once.
        a.add_media(
            [MediaTrack {
                id: "cam-a".into(),
                kind: "video".into(),
            }],
            MediaStreamId("stream-a".into()),
        )
        .unwrap();
        b.add_media(
            [MediaTrack {
                id: "cam-b".into(),
                kind: "video".into(),
            }],
            MediaStreamId("stream-b".into()),
        )
        .unwrap();

        stream_a.await;
        stream_b.await;
        assert_eq!(ready_a.load(Ordering::SeqCst), 1);
        assert_eq!(ready_b.load(Ordering::SeqCst), 1);
        assert_eq!(errors_a.load(Ordering::SeqCst), 0);
        assert_eq!(errors_b.load(Ordering::SeqCst), 0);
        assert_eq!(a.streams(), vec![MediaStreamId("stream-b".into())]);
    }

    #[tokio::test]
    async fn malformed_handshake_payload_is_fatal() {
        let (_a, b) = pair();
        let closed = counter(&b, "close");
        let result = b.handshake(Some("{\"nonsense\":true}")).await;
        assert!(matches!(result, Err(SwitchboardError::PeerFatal(_))));
        assert!(b.is_closed());
        assert_eq!(closed.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_intentional_skips_disconnect() {
        let (a, b) = pair();
        let closes = counter(&a, "close");
        let disconnects = counter(&a, "disconnect");
        a.close(true);
        a.close(true);
        assert_eq!(closes.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects.load(Ordering::SeqCst), 0);

        let closes_b = counter(&b, "close");
        let disconnects_b = counter(&b, "disconnect");
        b.close(false);
        assert_eq!(closes_b.load(Ordering::SeqCst), 1);
        assert_eq!(disconnects_b.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn ua_failure_is_fatal() {
        let (ca, cb) = fake_pair();
        let a = PeerSession::connect(
            ca.as_ref(),
            SessionConfig {
                initiator: true,
                ..Default::default()
            },
        )
        .unwrap();
        let _b = PeerSession::connect(cb.as_ref(), SessionConfig::default()).unwrap();

        let errored = expect_event(&a, "error");
        let closed = expect_event(&a, "close");
        ca.connection().fail("transport died");
        errored.await;
        closed.await;
        assert!(a.is_closed());
    }

    #[tokio::test]
    async fn non_trickle_emits_description_on_timeout() {
        let (ca, _cb) = fake_pair();
        ca.connection().stall_ice();
        let a = PeerSession::connect(
            ca.as_ref(),
            SessionConfig {
                initiator: true,
                trickle_ice: false,
                trickle_timeout: Duration::from_millis(30),
            },
        )
        .unwrap();
        let offer = a.handshake(None).await.unwrap();
        assert!(offer.unwrap().contains("\"type\":\"offer\""));
    }

    #[tokio::test]
    async fn added_data_channel_reaches_the_peer() {
        let (a, b) = pair();
        establish(&a, &b).await;

        let announced = expect_event(&b, "dataChannel");
        a.add_data_channel("chat", ChannelInit::default()).unwrap();
        announced.await;

        let got = Arc::new(AtomicUsize::new(0));
        let g2 = got.clone();
        b.on("data", move |event| {
            if let PeerEvent::Data { channel, data } = event
                && channel == "chat"
                && data == b"over chat"
            {
                g2.fetch_add(1, Ordering::SeqCst);
            }
        });
        a.send_on("chat", b"over chat").unwrap();
        tokio::time::timeout(Duration::from_secs(1), async {
            while got.load(Ordering::SeqCst) == 0 {
                tokio::task::yield_now().await;
            }
        })
        .await
        .unwrap();
    }
}
