//! Error taxonomy for the matchmaking engine.
//!
//! Local recovery (reconnect, drop the peer, drop the offer) is always
//! preferred; recoverable trouble surfaces as a `warn` event on the owning
//! component. `kill` is the only terminal error at the supervisor level, and
//! errors raised inside user callbacks are caught by the event bus, never
//! propagated through `emit`.

use thiserror::Error;

/// Everything that can go wrong inside the engine.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SwitchboardError {
    /// A rendezvous could not be reached or kept. Fatal at the supervisor
    /// only once every remaining option is exhausted.
    #[error("rendezvous connection failed: {0}")]
    ConnectionFailed(String),

    /// A handshake invariant was violated: bad signature, ID mismatch, or
    /// SDP-hash mismatch.
    #[error("peer authentication failed: {0}")]
    ClientAuth(String),

    /// WebRTC transport failure, in-band control channel death, or a
    /// malformed in-band payload.
    #[error("peer transport failure: {0}")]
    PeerFatal(String),

    /// The remote service reported failure: `failure reason` on a tracker,
    /// or `"dc"` from an SPS relay.
    #[error("protocol failure: {0}")]
    ProtocolFailure(String),

    /// Identity material (seed, key bytes) could not be decoded.
    #[error("invalid identity material: {0}")]
    InvalidSeed(String),
}

pub type Result<T> = std::result::Result<T, SwitchboardError>;
