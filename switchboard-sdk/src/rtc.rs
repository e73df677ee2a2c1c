//! Interface to the UA-provided WebRTC stack.
//!
//! The engine never talks to a concrete WebRTC implementation; it drives
//! these traits. A browser/wasm backend, a native `webrtc-rs` backend, or the
//! in-process fake under [`testing`] all plug in the same way: the engine
//! hands the connection an event sink at construction and the backend feeds
//! UA callbacks ([`RtcEvent`], [`ChannelEvent`]) into it.
//!
//! State enums mirror the UA's own vocabulary so a backend is a thin
//! translation layer.

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SdpKind {
    Offer,
    Answer,
    Rollback,
}

/// An SDP blob plus its type, the unit exchanged during signaling.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionDescription {
    #[serde(rename = "type")]
    pub kind: SdpKind,
    pub sdp: String,
}

impl SessionDescription {
    pub fn rollback() -> Self {
        Self {
            kind: SdpKind::Rollback,
            sdp: String::new(),
        }
    }
}

/// A trickle ICE candidate, in the UA's JSON field naming.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct IceCandidate {
    pub candidate: String,
    #[serde(rename = "sdpMid", skip_serializing_if = "Option::is_none")]
    pub sdp_mid: Option<String>,
    #[serde(rename = "sdpMLineIndex", skip_serializing_if = "Option::is_none")]
    pub sdp_mline_index: Option<u16>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SignalingState {
    Stable,
    HaveLocalOffer,
    HaveRemoteOffer,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChannelState {
    Connecting,
    Open,
    Closing,
    Closed,
}

/// Options for data channel creation. Reserved channels are negotiated
/// out-of-band at fixed ids so no signaling round-trip is needed.
#[derive(Debug, Clone, Default)]
pub struct ChannelInit {
    pub negotiated: bool,
    pub id: Option<u16>,
    pub ordered: bool,
}

impl ChannelInit {
    pub fn negotiated(id: u16) -> Self {
        Self {
            negotiated: true,
            id: Some(id),
            ordered: true,
        }
    }
}

/// Opaque handle to a UA media stream.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MediaStreamId(pub String);

/// Opaque handle to a UA media track.
#[derive(Debug, Clone)]
pub struct MediaTrack {
    pub id: String,
    pub kind: String,
}

/// Callbacks from the UA peer connection.
#[derive(Clone)]
pub enum RtcEvent {
    /// A gathered candidate; `None` means gathering finished.
    IceCandidate(Option<IceCandidate>),
    /// The UA wants a renegotiation (e.g. after a track was added).
    NegotiationNeeded,
    /// The remote side opened a data channel.
    DataChannel(Arc<dyn RtcChannel>),
    /// A remote media stream arrived.
    Track(MediaStreamId),
    SignalingChange(SignalingState),
    /// The transport failed; the session must die.
    Failed(String),
}

impl std::fmt::Debug for RtcEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RtcEvent::IceCandidate(c) => f.debug_tuple("IceCandidate").field(c).finish(),
            RtcEvent::NegotiationNeeded => write!(f, "NegotiationNeeded"),
            RtcEvent::DataChannel(ch) => write!(f, "DataChannel({})", ch.label()),
            RtcEvent::Track(id) => f.debug_tuple("Track").field(id).finish(),
            RtcEvent::SignalingChange(s) => f.debug_tuple("SignalingChange").field(s).finish(),
            RtcEvent::Failed(e) => f.debug_tuple("Failed").field(e).finish(),
        }
    }
}

/// Callbacks from a single UA data channel.
#[derive(Debug, Clone)]
pub enum ChannelEvent {
    Open,
    Message(Vec<u8>),
    Close,
    Error(String),
}

/// Factory for UA peer connections. One [`RtcConnector`] is shared per
/// Switchboard; each candidate session gets its own connection wired to its
/// own event sink.
pub trait RtcConnector: Send + Sync {
    fn connect(&self, events: mpsc::UnboundedSender<RtcEvent>) -> Result<Arc<dyn RtcConnection>>;
}

/// A single UA peer connection.
#[async_trait]
pub trait RtcConnection: Send + Sync {
    async fn create_offer(&self) -> Result<SessionDescription>;
    async fn create_answer(&self) -> Result<SessionDescription>;
    async fn set_local_description(&self, desc: SessionDescription) -> Result<()>;
    async fn set_remote_description(&self, desc: SessionDescription) -> Result<()>;
    async fn add_ice_candidate(&self, candidate: IceCandidate) -> Result<()>;
    fn local_description(&self) -> Option<SessionDescription>;
    fn remote_description(&self) -> Option<SessionDescription>;
    fn signaling_state(&self) -> SignalingState;
    fn create_data_channel(&self, label: &str, init: ChannelInit) -> Result<Arc<dyn RtcChannel>>;
    fn add_track(&self, track: MediaTrack, stream: &MediaStreamId) -> Result<()>;
    fn close(&self);
}

/// A single UA data channel.
pub trait RtcChannel: Send + Sync {
    fn label(&self) -> &str;
    fn ready_state(&self) -> ChannelState;
    fn send(&self, data: &[u8]) -> Result<()>;
    /// Register the engine's sink. Events raised before registration are
    /// buffered and flushed here.
    fn set_event_sink(&self, sink: mpsc::UnboundedSender<ChannelEvent>);
    fn close(&self);
}
