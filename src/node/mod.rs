//! # Node Module
//!
//! Network-side view of the external audio node (a Lavalink v4 server).
//!
//! The node runs as its own process and is only ever reached over the
//! network:
//!
//! - [`rest`] - HTTP calls: track resolution and player updates
//! - [`socket`] - websocket handshake and the event stream reader
//! - [`events`] - decoding of the messages the node pushes to us
//! - [`model`] - tracks, load results and ids shared by every layer
//!
//! Everything outside the supervisor only holds an `Arc<dyn NodeClient>`,
//! never the process itself.

pub mod events;
pub mod model;
pub mod rest;
pub mod socket;

use async_trait::async_trait;
use std::time::Duration;
use thiserror::Error;

pub use events::{EndReason, PlayerEvent};
pub use model::{ChannelId, LoadResult, RoomId, Track, TrackExtras, TrackInfo, VoiceState};
pub use rest::RestNodeClient;
pub use socket::{ConnectError, ConnectParams, NodeConnector, NodeSession, WsConnector};

#[derive(Debug, Error)]
pub enum NodeError {
    #[error("HTTP error talking to the node: {0}")]
    Http(#[from] reqwest::Error),

    #[error("node answered {status}: {message}")]
    Status { status: u16, message: String },

    #[error("websocket error: {0}")]
    Socket(#[from] tokio_tungstenite::tungstenite::Error),

    #[error("invalid node message: {0}")]
    Decode(#[from] serde_json::Error),

    #[error("invalid node address: {0}")]
    Url(#[from] url::ParseError),

    #[error("invalid handshake header: {0}")]
    Header(String),

    #[error("node closed the connection before it was ready")]
    Closed,
}

/// Operations the rest of the crate may perform against the node.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait NodeClient: Send + Sync {
    /// Health check, returns the node's version string.
    async fn version(&self) -> Result<String, NodeError>;

    /// Resolves a search query or URL into tracks.
    async fn load_tracks(&self, identifier: &str) -> Result<LoadResult, NodeError>;

    /// Starts `track` in `room`, replacing whatever is playing.
    async fn play(&self, room: RoomId, track: &Track, volume: u16) -> Result<(), NodeError>;

    async fn stop(&self, room: RoomId) -> Result<(), NodeError>;

    async fn set_paused(&self, room: RoomId, paused: bool) -> Result<(), NodeError>;

    async fn seek(&self, room: RoomId, position: Duration) -> Result<(), NodeError>;

    async fn set_volume(&self, room: RoomId, volume: u16) -> Result<(), NodeError>;

    async fn update_voice(&self, room: RoomId, voice: &VoiceState) -> Result<(), NodeError>;

    /// Removes the player for `room` from the node.
    async fn destroy(&self, room: RoomId) -> Result<(), NodeError>;
}
