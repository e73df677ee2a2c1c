//! Supervisor and connector configuration.

use std::time::Duration;

/// Rendezvous servers consulted when the caller does not supply a list.
pub const DEFAULT_TRACKERS: &[&str] = &[
    "wss://tracker.openwebtorrent.com",
    "wss://tracker.btorrent.xyz",
    "wss://tracker.webtorrent.dev",
    "wss://tracker.files.fm:7073/announce",
];

/// Plain-text list of extra `wss://` trackers fetched at startup, one URL
/// per line. Fetch failure is never fatal.
pub const DEFAULT_TRACKER_LIST_URL: &str =
    "https://raw.githubusercontent.com/ngosang/trackerslist/master/trackers_best_ws.txt";

/// One rendezvous endpoint.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackerOption {
    pub uri: String,
    /// Speaks the SPS direct-relay dialect rather than the BT tracker one.
    pub is_native_server: bool,
    /// Losing this connector kills the whole supervisor.
    pub is_required: bool,
}

impl TrackerOption {
    pub fn tracker(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            is_native_server: false,
            is_required: false,
        }
    }

    pub fn native(uri: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            is_native_server: true,
            is_required: false,
        }
    }
}

/// How long a peer stays blacklisted once it crosses the failure threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlacklistDuration {
    /// Failures are not tracked at all.
    Disabled,
    Timed(Duration),
    /// For the lifetime of the process.
    Permanent,
}

/// What the supervisor is advertising.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionMode {
    Host { max_peers: usize },
    JoinHost { target_id: String },
    Swarm { group_id: String, max_peers: usize },
}

#[derive(Debug, Clone)]
pub struct SwitchboardConfig {
    /// Application namespace; different realms never match even when the
    /// user key collides.
    pub realm: String,
    /// Caller-chosen rendezvous key, hashed with the realm into the
    /// InfoHash.
    pub user_key: String,
    /// 32-byte identity seed; generated when absent.
    pub seed: Option<[u8; 32]>,
    /// Explicit rendezvous list. Empty means the defaults (plus the fetched
    /// extras unless `skip_extra_trackers`).
    pub trackers: Vec<TrackerOption>,
    pub skip_extra_trackers: bool,
    pub tracker_list_url: String,
    /// Pre-generated offers per tracker announce.
    pub invites: usize,
    pub numwant: u32,
    pub trickle_ice: bool,
    pub trickle_timeout: Duration,
    /// How long a candidate may sit unauthenticated before it is failed.
    pub client_timeout: Duration,
    /// Failure count beyond which a peer is considered blacklisted.
    pub client_max_retries: u32,
    pub client_blacklist_duration: BlacklistDuration,
    pub max_reconnect_attempts: u32,
    /// Shared secret for SPS relays that require one.
    pub pass_code: Option<String>,
}

impl SwitchboardConfig {
    pub fn new(realm: impl Into<String>, user_key: impl Into<String>) -> Self {
        Self {
            realm: realm.into(),
            user_key: user_key.into(),
            ..Self::default()
        }
    }

    /// FIFO cap on the per-tracker offer table.
    pub fn max_open_offers(&self) -> usize {
        self.invites * 2
    }
}

impl Default for SwitchboardConfig {
    fn default() -> Self {
        Self {
            realm: "switchboard".to_string(),
            user_key: "lobby".to_string(),
            seed: None,
            trackers: Vec::new(),
            skip_extra_trackers: false,
            tracker_list_url: DEFAULT_TRACKER_LIST_URL.to_string(),
            invites: 10,
            numwant: 50,
            trickle_ice: false,
            trickle_timeout: Duration::from_millis(2000),
            client_timeout: Duration::from_secs(150),
            client_max_retries: 2,
            client_blacklist_duration: BlacklistDuration::Permanent,
            max_reconnect_attempts: 10,
            pass_code: None,
        }
    }
}
