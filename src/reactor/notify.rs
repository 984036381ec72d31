use async_trait::async_trait;
use std::fmt;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, info, warn};

use crate::node::{ChannelId, RoomId, Track};

/// Something worth telling the people in a room.
#[derive(Debug, Clone, PartialEq)]
pub enum Notice {
    NowPlaying { track: Track },
    QueueEnded,
    AutoplayFailed { reason: String },
    TrackError { track: Track, message: String },
    TrackStuck { track: Track, threshold: Duration },
    /// Too many failures in a row; the room was disconnected.
    MultipleErrors,
    Disconnected,
}

impl fmt::Display for Notice {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Notice::NowPlaying { track } => write!(f, "Now playing: {}", track.description()),
            Notice::QueueEnded => f.write_str("Queue ended."),
            Notice::AutoplayFailed { reason } => write!(f, "Unable to get a track: {reason}"),
            Notice::TrackError { track, message } => {
                write!(f, "Track error on {}: {message}. Skipping...", track.title())
            }
            Notice::TrackStuck { track, threshold } => write!(
                f,
                "Track {} got stuck for {}. Skipping...",
                track.title(),
                humantime::format_duration(*threshold)
            ),
            Notice::MultipleErrors => {
                f.write_str("Multiple errors detected. Closing the audio player to protect the bot.")
            }
            Notice::Disconnected => f.write_str("Disconnected."),
        }
    }
}

/// Bot-wide presence line, recomputed on track start and queue end.
#[derive(Debug, Clone, PartialEq)]
pub struct StatusUpdate {
    pub active_rooms: usize,
    /// Title of the only playing track, when exactly one room is playing.
    pub title: Option<String>,
}

impl fmt::Display for StatusUpdate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match (&self.title, self.active_rooms) {
            (_, 0) => f.write_str("idle"),
            (Some(title), 1) => write!(f, "{title}"),
            (_, n) => write!(f, "music in {n} rooms"),
        }
    }
}

/// Delivery side of notices. The command layer owns formatting.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn notify(&self, room: RoomId, channel: ChannelId, notice: Notice);
    async fn status(&self, update: StatusUpdate);
}

/// What [`ChannelNotifier`] hands to its consumer.
#[derive(Debug, Clone, PartialEq)]
pub enum Notification {
    Notice {
        room: RoomId,
        channel: ChannelId,
        notice: Notice,
    },
    Status(StatusUpdate),
}

/// Forwards every notice into a channel drained by the chat layer.
#[derive(Debug, Clone)]
pub struct ChannelNotifier {
    tx: UnboundedSender<Notification>,
}

impl ChannelNotifier {
    pub fn new(tx: UnboundedSender<Notification>) -> Self {
        Self { tx }
    }

    fn forward(&self, notification: Notification) {
        if self.tx.send(notification).is_err() {
            debug!("Nadie escucha las notificaciones, descartada");
        }
    }
}

#[async_trait]
impl Notifier for ChannelNotifier {
    async fn notify(&self, room: RoomId, channel: ChannelId, notice: Notice) {
        self.forward(Notification::Notice {
            room,
            channel,
            notice,
        });
    }

    async fn status(&self, update: StatusUpdate) {
        self.forward(Notification::Status(update));
    }
}

/// Writes notices to the log only. Used when no chat layer is attached.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogNotifier;

#[async_trait]
impl Notifier for LogNotifier {
    async fn notify(&self, room: RoomId, channel: ChannelId, notice: Notice) {
        match notice {
            Notice::MultipleErrors | Notice::AutoplayFailed { .. } => {
                warn!("📢 [{} → #{}] {}", room, channel, notice)
            }
            _ => info!("📢 [{} → #{}] {}", room, channel, notice),
        }
    }

    async fn status(&self, update: StatusUpdate) {
        info!("🎧 Estado: {}", update);
    }
}
