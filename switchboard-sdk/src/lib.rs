//! Peer-to-peer matchmaking and authenticated WebRTC signaling.
//!
//! Switchboard lets endpoints with no server of their own discover each
//! other through untrusted rendezvous services and establish WebRTC
//! sessions whose identity is bound to a long-lived Ed25519 key, not to any
//! rendezvous. The supervisor keeps parallel connections to many rendezvous
//! of two dialects (BT-style WebSocket trackers and self-hosted SPS
//! relays), dedupes sightings across them, and tolerates arbitrary subsets
//! being unreachable.
//!
//! ## Quick tour
//!
//! ```no_run
//! use std::sync::Arc;
//! use switchboard_sdk::{Switchboard, SwitchboardConfig, SwitchboardEvent};
//! # async fn demo(rtc: Arc<dyn switchboard_sdk::rtc::RtcConnector>) -> switchboard_sdk::Result<()> {
//! let board = Switchboard::new(rtc, SwitchboardConfig::new("my-app", "lobby"))?;
//! board.on("peer", |event| {
//!     if let SwitchboardEvent::Peer(peer) = event {
//!         println!("authenticated: {:?}", peer.verified_full_id());
//!     }
//! });
//! board.swarm("demo-room", None).await?;
//! # Ok(())
//! # }
//! ```
//!
//! The UA WebRTC stack (peer connections, data channels, ICE) is an
//! external collaborator consumed through the traits in [`rtc`]; plug in a
//! browser backend, a native one, or a test double.

pub mod auth;
pub mod config;
pub mod connector;
pub mod error;
pub mod event;
pub mod identity;
pub mod peer;
pub mod rtc;
pub mod sps;
pub mod switchboard;
pub mod tracker;

pub use config::{BlacklistDuration, ConnectionMode, SwitchboardConfig, TrackerOption};
pub use error::{Result, SwitchboardError};
pub use event::{EventName, Subscribable, Subscription};
pub use identity::Identity;
pub use peer::{PeerEvent, PeerSession, SessionConfig};
pub use switchboard::{Switchboard, SwitchboardEvent};
