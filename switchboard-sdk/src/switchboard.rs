//! The supervisor: many untrusted rendezvous, one authenticated peer set.
//!
//! A `Switchboard` owns one connector per configured rendezvous and gates
//! every candidate session those connectors produce through the signed
//! SDP-binding handshake. A peer surfaces to the caller only after its
//! Ed25519 key has been verified against both its advertised id and the
//! exact session we negotiated, so no rendezvous has to be trusted with
//! anything but opaque envelopes.
//!
//! The supervisor is single-shot: one of `host`, `find_host` or `swarm`
//! starts it, and `kill` is terminal.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::task::JoinHandle;

use crate::auth::{make_sig_packet, verify_packet};
use crate::config::{
    BlacklistDuration, ConnectionMode, DEFAULT_TRACKERS, SwitchboardConfig, TrackerOption,
};
use crate::connector::{ConnectorContext, ConnectorEvent, Gate};
use crate::error::{Result, SwitchboardError};
use crate::event::{EventName, Subscribable, Subscription};
use crate::identity::{Identity, ids_match, info_hash, make_short_id};
use crate::peer::{PeerEvent, PeerSession};
use crate::rtc::RtcConnector;
use crate::sps::SpsConnector;
use crate::tracker::TrackerConnector;

/// Peer cap applied when `host`/`swarm` are called without one.
const DEFAULT_MAX_PEERS: usize = 20;

/// How long the tracker-list fetch may take before it is abandoned.
const TRACKER_LIST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub enum SwitchboardEvent {
    /// Every currently-tracked connector reports open. Fires once.
    Connected,
    /// An authenticated peer. The session's `verified_full_id` is set.
    Peer(PeerSession),
    /// A peer id surfaced in rendezvous traffic (observability).
    PeerSeen(String),
    /// A peer crossed the failure threshold.
    PeerBlacklisted(String),
    Warn(String),
    /// Terminal. `None` for a caller-requested shutdown.
    Kill(Option<SwitchboardError>),
}

impl EventName for SwitchboardEvent {
    fn name(&self) -> &'static str {
        match self {
            SwitchboardEvent::Connected => "connected",
            SwitchboardEvent::Peer(_) => "peer",
            SwitchboardEvent::PeerSeen(_) => "peer-seen",
            SwitchboardEvent::PeerBlacklisted(_) => "peer-blacklisted",
            SwitchboardEvent::Warn(_) => "warn",
            SwitchboardEvent::Kill(_) => "kill",
        }
    }
}

enum Connector {
    Tracker(TrackerConnector),
    Sps(SpsConnector),
}

impl Connector {
    fn uri(&self) -> &str {
        match self {
            Connector::Tracker(c) => c.uri(),
            Connector::Sps(c) => c.uri(),
        }
    }

    fn is_open(&self) -> bool {
        match self {
            Connector::Tracker(c) => c.is_open(),
            Connector::Sps(c) => c.is_open(),
        }
    }

    fn events(&self) -> &Subscribable<ConnectorEvent> {
        match self {
            Connector::Tracker(c) => c.events(),
            Connector::Sps(c) => c.events(),
        }
    }

    fn kill(&self) {
        match self {
            Connector::Tracker(c) => c.kill(),
            Connector::Sps(c) => c.kill(),
        }
    }
}

struct SbState {
    connectors: Vec<(Connector, bool)>,
    /// ShortID → authenticated session. First wins.
    connected: HashMap<String, PeerSession>,
    /// id → failure count; suppressed beyond `client_max_retries`.
    blacklist: HashMap<String, u32>,
    /// Candidates between ICE completion and auth verdict.
    candidates: HashMap<u64, PeerSession>,
    next_candidate: u64,
    wanted_peer_count: usize,
    wanted_specific_id: Option<String>,
    mode: Option<ConnectionMode>,
    started: bool,
    killed: bool,
    connected_emitted: bool,
    tasks: Vec<JoinHandle<()>>,
}

struct SbInner {
    cfg: SwitchboardConfig,
    identity: Identity,
    info_hash: String,
    rtc: Arc<dyn RtcConnector>,
    events: Subscribable<SwitchboardEvent>,
    state: Mutex<SbState>,
}

/// Peer-to-peer matchmaking over untrusted rendezvous services.
#[derive(Clone)]
pub struct Switchboard {
    inner: Arc<SbInner>,
}

impl Switchboard {
    pub fn new(rtc: Arc<dyn RtcConnector>, cfg: SwitchboardConfig) -> Result<Self> {
        let identity = match cfg.seed {
            Some(seed) => Identity::from_seed(seed),
            None => Identity::generate(),
        };
        let info_hash = info_hash(&cfg.realm, &cfg.user_key);
        Ok(Self {
            inner: Arc::new(SbInner {
                cfg,
                identity,
                info_hash,
                rtc,
                events: Subscribable::new(),
                state: Mutex::new(SbState {
                    connectors: Vec::new(),
                    connected: HashMap::new(),
                    blacklist: HashMap::new(),
                    candidates: HashMap::new(),
                    next_candidate: 0,
                    wanted_peer_count: DEFAULT_MAX_PEERS,
                    wanted_specific_id: None,
                    mode: None,
                    started: false,
                    killed: false,
                    connected_emitted: false,
                    tasks: Vec::new(),
                }),
            }),
        })
    }

    pub fn events(&self) -> &Subscribable<SwitchboardEvent> {
        &self.inner.events
    }

    pub fn on(
        &self,
        event: &'static str,
        cb: impl Fn(&SwitchboardEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.on(event, cb)
    }

    pub fn once(
        &self,
        event: &'static str,
        cb: impl Fn(&SwitchboardEvent) + Send + Sync + 'static,
    ) -> Subscription {
        self.inner.events.once(event, cb)
    }

    /// Advertise as a host that peers can find by our id.
    pub async fn host(&self, max_peers: Option<usize>) -> Result<()> {
        self.set_goal(
            ConnectionMode::Host {
                max_peers: max_peers.unwrap_or(DEFAULT_MAX_PEERS),
            },
            max_peers.unwrap_or(DEFAULT_MAX_PEERS),
            None,
        )?;
        self.start().await
    }

    /// Look for one specific host, by ShortID or FullID.
    pub async fn find_host(&self, host_id: &str) -> Result<()> {
        self.set_goal(
            ConnectionMode::JoinHost {
                target_id: host_id.to_string(),
            },
            1,
            Some(host_id.to_string()),
        )?;
        self.start().await
    }

    /// Join a named swarm; every member connects to every other.
    pub async fn swarm(&self, swarm_id: &str, max_peers: Option<usize>) -> Result<()> {
        self.set_goal(
            ConnectionMode::Swarm {
                group_id: swarm_id.to_string(),
                max_peers: max_peers.unwrap_or(DEFAULT_MAX_PEERS),
            },
            max_peers.unwrap_or(DEFAULT_MAX_PEERS),
            None,
        )?;
        self.start().await
    }

    /// Terminal shutdown; optionally closes authenticated peers too.
    pub fn kill(&self, err: Option<SwitchboardError>, kill_peers: bool) {
        self.inner.kill(err, kill_peers);
    }

    /// Record `inc` failures (all of them, when `None`) against a peer id.
    pub fn add_peer_failure(&self, id: &str, inc: Option<u32>) {
        self.inner.add_peer_failure(id, inc);
    }

    pub fn is_black_listed(&self, id: &str) -> bool {
        self.inner.is_black_listed(id)
    }

    /// The admission gate connectors consult before spending resources.
    pub fn should_block_connection(&self, peer_id: &str) -> bool {
        self.inner.should_block(peer_id)
    }

    /// ShortID, as announced to trackers.
    pub fn peer_id(&self) -> &str {
        self.inner.identity.short_id()
    }

    pub fn short_id(&self) -> &str {
        self.inner.identity.short_id()
    }

    pub fn full_id(&self) -> &str {
        self.inner.identity.full_id()
    }

    /// Base58 seed for persisting this identity.
    pub fn secret_seed(&self) -> String {
        self.inner.identity.seed_base58()
    }

    pub fn info_hash(&self) -> &str {
        &self.inner.info_hash
    }

    /// Live connector count.
    pub fn tracker_count(&self) -> usize {
        self.inner.state.lock().connectors.len()
    }

    pub fn connected_peers(&self) -> Vec<PeerSession> {
        self.inner.state.lock().connected.values().cloned().collect()
    }

    fn set_goal(
        &self,
        mode: ConnectionMode,
        wanted: usize,
        specific: Option<String>,
    ) -> Result<()> {
        let mut state = self.inner.state.lock();
        if state.killed {
            return Err(SwitchboardError::ConnectionFailed(
                "switchboard was killed".into(),
            ));
        }
        if state.started {
            return Err(SwitchboardError::ConnectionFailed(
                "switchboard already started".into(),
            ));
        }
        state.started = true;
        state.mode = Some(mode);
        state.wanted_peer_count = wanted;
        state.wanted_specific_id = specific;
        Ok(())
    }

    async fn start(&self) -> Result<()> {
        let options = self.inner.resolve_trackers().await;
        if options.is_empty() {
            let err = SwitchboardError::ConnectionFailed("no rendezvous configured".into());
            self.inner.kill(Some(err.clone()), false);
            return Err(err);
        }
        for option in options {
            self.inner.spawn_connector(option)?;
        }
        Ok(())
    }

    #[cfg(test)]
    pub(crate) fn set_goal_for_test(
        &self,
        mode: ConnectionMode,
        wanted: usize,
        specific: Option<String>,
    ) {
        self.set_goal(mode, wanted, specific).unwrap();
    }

    #[cfg(test)]
    pub(crate) fn admit_for_test(&self, session: PeerSession) {
        self.inner.admit_candidate(session);
    }
}

impl SbInner {
    /// Resolve the rendezvous set: the configured list verbatim, or the
    /// defaults plus (unless skipped) the fetched extra list. Deduped by
    /// URI.
    async fn resolve_trackers(&self) -> Vec<TrackerOption> {
        let explicit = !self.cfg.trackers.is_empty();
        let mut options: Vec<TrackerOption> = if explicit {
            self.cfg.trackers.clone()
        } else {
            DEFAULT_TRACKERS
                .iter()
                .map(|uri| TrackerOption::tracker(*uri))
                .collect()
        };

        if !explicit && !self.cfg.skip_extra_trackers {
            match self.fetch_tracker_list().await {
                Ok(extra) => options.extend(extra.into_iter().map(TrackerOption::tracker)),
                Err(err) => {
                    // Never fatal; the defaults stand on their own.
                    self.events.emit(SwitchboardEvent::Warn(format!(
                        "tracker list fetch failed: {err}"
                    )));
                }
            }
        }

        let mut seen = std::collections::HashSet::new();
        options.retain(|option| seen.insert(option.uri.clone()));
        options
    }

    async fn fetch_tracker_list(&self) -> anyhow::Result<Vec<String>> {
        let client = reqwest::Client::builder()
            .timeout(TRACKER_LIST_TIMEOUT)
            .build()?;
        let body = client
            .get(&self.cfg.tracker_list_url)
            .send()
            .await?
            .error_for_status()?
            .text()
            .await?;
        Ok(body
            .lines()
            .map(str::trim)
            .filter(|line| line.starts_with("wss://"))
            .map(str::to_string)
            .collect())
    }

    fn connector_context(self: &Arc<Self>) -> ConnectorContext {
        let weak = Arc::downgrade(self);
        let gate: Gate = Arc::new(move |peer_id: &str| {
            weak.upgrade().is_none_or(|inner| inner.should_block(peer_id))
        });
        let mode = self
            .state
            .lock()
            .mode
            .clone()
            .unwrap_or(ConnectionMode::Host {
                max_peers: DEFAULT_MAX_PEERS,
            });
        ConnectorContext {
            identity: self.identity.clone(),
            info_hash: self.info_hash.clone(),
            cfg: self.cfg.clone(),
            rtc: self.rtc.clone(),
            gate,
            mode,
        }
    }

    fn spawn_connector(self: &Arc<Self>, option: TrackerOption) -> Result<()> {
        let ctx = self.connector_context();
        let connector = if option.is_native_server {
            Connector::Sps(SpsConnector::spawn(option.uri.clone(), ctx))
        } else {
            Connector::Tracker(TrackerConnector::spawn(option.uri.clone(), ctx)?)
        };

        let events = connector.events();
        let weak = Arc::downgrade(self);
        events.permanent("open", move |_| {
            if let Some(inner) = weak.upgrade() {
                inner.check_all_open();
            }
        });
        let weak = Arc::downgrade(self);
        events.permanent("peer", move |event| {
            if let (ConnectorEvent::Peer(session), Some(inner)) = (event, weak.upgrade()) {
                inner.admit_candidate(session.clone());
            }
        });
        let weak = Arc::downgrade(self);
        events.permanent("peer-seen", move |event| {
            if let (ConnectorEvent::PeerSeen(id), Some(inner)) = (event, weak.upgrade()) {
                inner
                    .events
                    .emit(SwitchboardEvent::PeerSeen(id.clone()));
            }
        });
        let weak = Arc::downgrade(self);
        events.permanent("warn", move |event| {
            if let (ConnectorEvent::Warn(msg), Some(inner)) = (event, weak.upgrade()) {
                inner.events.emit(SwitchboardEvent::Warn(msg.clone()));
            }
        });
        let weak = Arc::downgrade(self);
        let uri = option.uri.clone();
        let required = option.is_required;
        events.permanent("kill", move |event| {
            if let (ConnectorEvent::Kill(err), Some(inner)) = (event, weak.upgrade()) {
                inner.on_connector_killed(&uri, required, err.clone());
            }
        });

        self.state.lock().connectors.push((connector, option.is_required));
        Ok(())
    }

    fn check_all_open(&self) {
        let fire = {
            let mut state = self.state.lock();
            let all_open =
                !state.connectors.is_empty() && state.connectors.iter().all(|(c, _)| c.is_open());
            all_open && !std::mem::replace(&mut state.connected_emitted, true)
        };
        if fire {
            self.events.emit(SwitchboardEvent::Connected);
        }
    }

    /// A dead rendezvous is survivable while others remain, unless it was
    /// marked required.
    fn on_connector_killed(&self, uri: &str, required: bool, err: SwitchboardError) {
        let none_left = {
            let mut state = self.state.lock();
            state.connectors.retain(|(c, _)| c.uri() != uri);
            state.connectors.is_empty()
        };
        if none_left || required {
            self.kill(
                Some(SwitchboardError::ConnectionFailed(format!(
                    "rendezvous exhausted ({uri}: {err})"
                ))),
                false,
            );
        } else {
            self.events.emit(SwitchboardEvent::Warn(format!(
                "rendezvous lost, continuing: {uri}: {err}"
            )));
        }
    }

    /// The admission gate: cheap rejections before any handshake spend.
    fn should_block(&self, peer_id: &str) -> bool {
        let state = self.state.lock();
        if self.is_black_listed_locked(&state, peer_id) {
            return true;
        }
        if let Some(wanted) = &state.wanted_specific_id
            && !ids_match(peer_id, wanted)
        {
            return true;
        }
        if state.connected.keys().any(|known| ids_match(known, peer_id)) {
            return true;
        }
        if state.connected.len() >= state.wanted_peer_count {
            return true;
        }
        state.blacklist.len() >= state.wanted_peer_count
    }

    fn is_black_listed(&self, id: &str) -> bool {
        self.is_black_listed_locked(&self.state.lock(), id)
    }

    fn is_black_listed_locked(&self, state: &SbState, id: &str) -> bool {
        state
            .blacklist
            .iter()
            .any(|(known, count)| *count > self.cfg.client_max_retries && ids_match(known, id))
    }

    fn add_peer_failure(self: &Arc<Self>, id: &str, inc: Option<u32>) {
        let duration = match self.cfg.client_blacklist_duration {
            BlacklistDuration::Disabled => return,
            duration => duration,
        };
        let crossed = {
            let mut state = self.state.lock();
            let counter = state.blacklist.entry(id.to_string()).or_insert(0);
            let before = *counter;
            *counter = match inc {
                Some(n) => counter.saturating_add(n),
                None => u32::MAX,
            };
            before <= self.cfg.client_max_retries && *counter > self.cfg.client_max_retries
        };
        if crossed && let BlacklistDuration::Timed(expiry) = duration {
            self.events
                .emit(SwitchboardEvent::PeerBlacklisted(id.to_string()));
            let weak = Arc::downgrade(self);
            let id = id.to_string();
            let task = tokio::spawn(async move {
                tokio::time::sleep(expiry).await;
                if let Some(inner) = weak.upgrade() {
                    inner.state.lock().blacklist.remove(&id);
                }
            });
            self.state.lock().tasks.push(task);
        }
    }

    /// A connector handed us a candidate at `SignalStable`: run the signed
    /// intro exchange and only surface the peer on success.
    fn admit_candidate(self: &Arc<Self>, session: PeerSession) {
        if self.state.lock().killed {
            session.close(true);
            return;
        }
        session.mark_authenticating();
        let key = {
            let mut state = self.state.lock();
            let key = state.next_candidate;
            state.next_candidate += 1;
            state.candidates.insert(key, session.clone());
            key
        };

        // Cleanup and error forwarding survive any remove_all_listeners the
        // caller might do on the session.
        let weak = Arc::downgrade(self);
        let cleanup_session = session.clone();
        session.events().permanent("close", move |_: &PeerEvent| {
            if let Some(inner) = weak.upgrade() {
                let mut state = inner.state.lock();
                state.candidates.remove(&key);
                state
                    .connected
                    .retain(|_, known| !known.ptr_eq(&cleanup_session));
            }
        });
        let weak = Arc::downgrade(self);
        session.events().permanent("error", move |event: &PeerEvent| {
            if let (PeerEvent::Error(err), Some(inner)) = (event, weak.upgrade()) {
                inner
                    .events
                    .emit(SwitchboardEvent::Warn(format!("peer error: {err}")));
            }
        });

        // Unauthenticated candidates do not get to linger.
        let weak = Arc::downgrade(self);
        let timed_session = session.clone();
        let timeout = self.cfg.client_timeout;
        let timer = tokio::spawn(async move {
            tokio::time::sleep(timeout).await;
            let Some(inner) = weak.upgrade() else {
                return;
            };
            if inner.state.lock().candidates.contains_key(&key) {
                if let Some(id) = timed_session.remote_id() {
                    inner.add_peer_failure(&id, Some(1));
                }
                timed_session.close(false);
            }
        });
        self.state.lock().tasks.push(timer);

        let weak = Arc::downgrade(self);
        let auth_session = session.clone();
        session.once("message", move |event| {
            if let (PeerEvent::Message(packet), Some(inner)) = (event, weak.upgrade()) {
                inner.on_auth_packet(key, &auth_session, packet);
            }
        });

        let local_sdp = session.local_sdp().unwrap_or_default();
        let intro = make_sig_packet(&self.identity, &local_sdp);
        if let Err(err) = session.send(intro) {
            self.events
                .emit(SwitchboardEvent::Warn(format!("intro send failed: {err}")));
            session.close(false);
        }
    }

    fn on_auth_packet(self: &Arc<Self>, key: u64, session: &PeerSession, packet: &[u8]) {
        if self.state.lock().candidates.remove(&key).is_none() {
            // Already timed out or closed.
            return;
        }
        let remote_sdp = session.remote_sdp().unwrap_or_default();
        let known_id = session.remote_id();
        let wanted = self.state.lock().wanted_specific_id.clone();

        match verify_packet(packet, &remote_sdp, known_id.as_deref(), wanted.as_deref()) {
            Ok(intro) => {
                let short = make_short_id(&intro.full_id);
                let duplicate = {
                    let mut state = self.state.lock();
                    state.blacklist.remove(&intro.full_id);
                    state.connected.contains_key(&short)
                };
                if duplicate {
                    // First-wins per ShortID; the newcomer is closed.
                    self.events.emit(SwitchboardEvent::Warn(format!(
                        "duplicate session for {short}, closing"
                    )));
                    session.close(true);
                    return;
                }
                session.set_verified_full_id(&intro.full_id);
                self.state
                    .lock()
                    .connected
                    .insert(short, session.clone());
                self.events.emit(SwitchboardEvent::Peer(session.clone()));
            }
            Err(err) => {
                if let Some(id) = known_id {
                    self.add_peer_failure(&id, Some(1));
                }
                self.events.emit(SwitchboardEvent::Warn(format!(
                    "handshake rejected: {err}"
                )));
                session.close(false);
            }
        }
    }

    fn kill(&self, err: Option<SwitchboardError>, kill_peers: bool) {
        let (connectors, candidates, peers, tasks) = {
            let mut state = self.state.lock();
            if std::mem::replace(&mut state.killed, true) {
                return;
            }
            (
                std::mem::take(&mut state.connectors),
                std::mem::take(&mut state.candidates),
                std::mem::take(&mut state.connected),
                std::mem::take(&mut state.tasks),
            )
        };
        for task in &tasks {
            task.abort();
        }
        for (connector, _) in &connectors {
            connector.kill();
        }
        for (_, candidate) in candidates {
            candidate.close(true);
        }
        if kill_peers {
            for (_, peer) in peers {
                peer.close(true);
            }
        }
        self.events.emit(SwitchboardEvent::Kill(err));
    }
}
