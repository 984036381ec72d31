use serde::Deserialize;
use std::time::Duration;
use tracing::{debug, warn};

use super::model::{LoadException, RoomId, Track};

/// Messages pushed by the node over the websocket, keyed by `op`.
#[derive(Debug, Deserialize)]
#[serde(tag = "op", rename_all = "camelCase")]
pub enum NodeMessage {
    #[serde(rename_all = "camelCase")]
    Ready {
        #[serde(default)]
        resumed: bool,
        session_id: String,
    },
    #[serde(rename_all = "camelCase")]
    PlayerUpdate {
        guild_id: RoomId,
        state: PlayerUpdateState,
    },
    #[serde(rename_all = "camelCase")]
    Stats {
        #[serde(default)]
        players: u32,
        #[serde(default)]
        playing_players: u32,
    },
    Event(NodeEvent),
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerUpdateState {
    #[serde(default)]
    pub time: i64,
    #[serde(default)]
    pub position: u64,
    #[serde(default)]
    pub connected: bool,
    #[serde(default)]
    pub ping: i64,
}

#[derive(Debug, Deserialize)]
#[serde(tag = "type")]
pub enum NodeEvent {
    #[serde(rename = "TrackStartEvent", rename_all = "camelCase")]
    TrackStart { guild_id: RoomId, track: Track },
    #[serde(rename = "TrackEndEvent", rename_all = "camelCase")]
    TrackEnd {
        guild_id: RoomId,
        track: Track,
        reason: EndReason,
    },
    #[serde(rename = "TrackExceptionEvent", rename_all = "camelCase")]
    TrackException {
        guild_id: RoomId,
        track: Track,
        exception: LoadException,
    },
    #[serde(rename = "TrackStuckEvent", rename_all = "camelCase")]
    TrackStuck {
        guild_id: RoomId,
        track: Track,
        threshold_ms: u64,
    },
    #[serde(rename = "WebSocketClosedEvent", rename_all = "camelCase")]
    WebSocketClosed {
        guild_id: RoomId,
        code: u16,
        #[serde(default)]
        reason: String,
        #[serde(default)]
        by_remote: bool,
    },
    #[serde(other)]
    Unknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum EndReason {
    Finished,
    LoadFailed,
    Stopped,
    Replaced,
    Cleanup,
}

impl EndReason {
    /// Only a natural end moves the queue forward; failures are advanced by
    /// the exception handler and stop/replace come from our own calls.
    pub fn advances_queue(self) -> bool {
        matches!(self, EndReason::Finished)
    }

    /// Whether the node player is left empty. A replaced track already has
    /// its successor playing.
    pub fn releases_player(self) -> bool {
        !matches!(self, EndReason::Replaced)
    }
}

/// What the reactor consumes. Node events plus the queue-end signal the host
/// raises itself when there is nothing left to play.
#[derive(Debug, Clone, PartialEq)]
pub enum PlayerEvent {
    TrackStart {
        room: RoomId,
        track: Track,
    },
    TrackEnd {
        room: RoomId,
        track: Track,
        reason: EndReason,
    },
    TrackException {
        room: RoomId,
        track: Track,
        message: String,
    },
    TrackStuck {
        room: RoomId,
        track: Track,
        threshold: Duration,
    },
    QueueEnd {
        room: RoomId,
    },
}

impl PlayerEvent {
    pub fn room(&self) -> RoomId {
        match self {
            PlayerEvent::TrackStart { room, .. }
            | PlayerEvent::TrackEnd { room, .. }
            | PlayerEvent::TrackException { room, .. }
            | PlayerEvent::TrackStuck { room, .. }
            | PlayerEvent::QueueEnd { room } => *room,
        }
    }
}

impl NodeEvent {
    pub fn into_player_event(self) -> Option<PlayerEvent> {
        match self {
            NodeEvent::TrackStart { guild_id, track } => Some(PlayerEvent::TrackStart {
                room: guild_id,
                track,
            }),
            NodeEvent::TrackEnd {
                guild_id,
                track,
                reason,
            } => Some(PlayerEvent::TrackEnd {
                room: guild_id,
                track,
                reason,
            }),
            NodeEvent::TrackException {
                guild_id,
                track,
                exception,
            } => Some(PlayerEvent::TrackException {
                room: guild_id,
                track,
                message: exception
                    .message
                    .unwrap_or(exception.cause)
                    .replace('\n', " "),
            }),
            NodeEvent::TrackStuck {
                guild_id,
                track,
                threshold_ms,
            } => Some(PlayerEvent::TrackStuck {
                room: guild_id,
                track,
                threshold: Duration::from_millis(threshold_ms),
            }),
            NodeEvent::WebSocketClosed {
                guild_id,
                code,
                reason,
                by_remote,
            } => {
                warn!(
                    "🔌 Voz cerrada en sala {} (código {}, remoto: {}): {}",
                    guild_id, code, by_remote, reason
                );
                None
            }
            NodeEvent::Unknown => {
                debug!("Evento desconocido del nodo ignorado");
                None
            }
        }
    }
}
