//! Plumbing shared by the rendezvous connectors.
//!
//! Both dialects (the BT-style tracker and the SPS direct relay) hold one
//! WebSocket with the same reconnect policy: a failure before the first
//! successful connect is fatal for the connector, a disconnect afterwards
//! schedules a capped, linearly backed-off reconnect.

use std::sync::Arc;
use std::time::Duration;

use crate::config::{ConnectionMode, SwitchboardConfig};
use crate::error::SwitchboardError;
use crate::event::EventName;
use crate::identity::Identity;
use crate::peer::{PeerSession, SessionConfig};
use crate::rtc::RtcConnector;

/// Admission gate supplied by the supervisor; `true` means "do not spend
/// resources on this peer".
pub type Gate = Arc<dyn Fn(&str) -> bool + Send + Sync>;

/// Everything a connector needs from its supervisor.
#[derive(Clone)]
pub struct ConnectorContext {
    pub identity: Identity,
    /// 40-hex rendezvous key.
    pub info_hash: String,
    pub cfg: SwitchboardConfig,
    pub rtc: Arc<dyn RtcConnector>,
    pub gate: Gate,
    pub mode: ConnectionMode,
}

impl ConnectorContext {
    pub fn session_config(&self, initiator: bool) -> SessionConfig {
        SessionConfig {
            initiator,
            trickle_ice: self.cfg.trickle_ice,
            trickle_timeout: self.cfg.trickle_timeout,
        }
    }

    pub fn blocked(&self, peer_id: &str) -> bool {
        (self.gate)(peer_id)
    }
}

/// Events a connector reports to the supervisor.
#[derive(Debug, Clone)]
pub enum ConnectorEvent {
    /// The socket is up (fires on every successful connect).
    Open,
    /// A candidate session completed ICE; ownership transfers upward.
    Peer(PeerSession),
    /// A peer id showed up in the dialect traffic (observability).
    PeerSeen(String),
    Warn(String),
    /// The socket dropped; a reconnect is scheduled.
    Disconnect,
    /// The connector is gone for good.
    Kill(SwitchboardError),
}

impl EventName for ConnectorEvent {
    fn name(&self) -> &'static str {
        match self {
            ConnectorEvent::Open => "open",
            ConnectorEvent::Peer(_) => "peer",
            ConnectorEvent::PeerSeen(_) => "peer-seen",
            ConnectorEvent::Warn(_) => "warn",
            ConnectorEvent::Disconnect => "disconnect",
            ConnectorEvent::Kill(_) => "kill",
        }
    }
}

/// Reconnect backoff: `min(tries, 10) × 2000 ms`.
pub fn backoff_delay(connect_tries: u32) -> Duration {
    Duration::from_millis(2000) * connect_tries.clamp(1, 10)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_is_linear_and_capped() {
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(5), Duration::from_secs(10));
        assert_eq!(backoff_delay(10), Duration::from_secs(20));
        assert_eq!(backoff_delay(40), Duration::from_secs(20));
        // Defensive: a zero count still waits one unit.
        assert_eq!(backoff_delay(0), Duration::from_secs(2));
    }
}
