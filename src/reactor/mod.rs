//! # Reactor Module
//!
//! Single consumer of [`PlayerEvent`]s. Events are handled one at a time, in
//! the order the node emitted them, so per-room transitions never interleave.
//!
//! ## Architecture
//!
//! | Event | Effect |
//! |---|---|
//! | track start | reset errors and skip votes, mark played, "now playing" |
//! | track end | remember previous track, `finished` advances the queue |
//! | queue end | drop persisted rows, autoplay or notify / disconnect |
//! | exception / stuck | drop the track, count the failure, skip or tear down |
//!
//! Delivery of notices goes through [`notify::Notifier`].

pub mod notify;

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::node::{ChannelId, EndReason, PlayerEvent, RoomId, Track};
use crate::player::{AudioError, FailureVerdict, PlayerHost};

pub use notify::{ChannelNotifier, LogNotifier, Notice, Notification, Notifier, StatusUpdate};

/// Thresholds the reactor applies to every room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReactorPolicy {
    /// Failures in a row that tear a room down.
    pub max_consecutive_errors: u32,
    /// Quiet time after which old failures are forgotten.
    pub error_window: Duration,
    pub status_updates: bool,
}

impl ReactorPolicy {
    pub fn from_config(config: &Config) -> Self {
        Self {
            max_consecutive_errors: config.max_consecutive_errors.max(1),
            error_window: Duration::from_secs(config.error_window_secs),
            status_updates: config.status_updates,
        }
    }
}

impl Default for ReactorPolicy {
    fn default() -> Self {
        Self {
            max_consecutive_errors: 5,
            error_window: Duration::from_secs(10),
            status_updates: false,
        }
    }
}

pub struct Reactor {
    host: Arc<PlayerHost>,
    notifier: Arc<dyn Notifier>,
    policy: ReactorPolicy,
}

impl Reactor {
    pub fn new(host: Arc<PlayerHost>, notifier: Arc<dyn Notifier>, policy: ReactorPolicy) -> Self {
        Self {
            host,
            notifier,
            policy,
        }
    }

    /// Drains `events` until the channel closes or `shutdown` fires.
    pub async fn run(self, mut events: UnboundedReceiver<PlayerEvent>, shutdown: CancellationToken) {
        info!("⚡ Reactor de eventos iniciado");
        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => self.handle(event).await,
                    None => break,
                },
            }
        }
        info!("⚡ Reactor de eventos detenido");
    }

    pub async fn handle(&self, event: PlayerEvent) {
        let room = event.room();
        let now = self.host.clock().now();
        let window = self.policy.error_window;
        if self
            .host
            .rooms()
            .update(room, |state| state.errors.decay(now, window))
            .is_none()
        {
            debug!("Evento para sala desconocida {} ignorado", room);
            return;
        }

        match event {
            PlayerEvent::TrackStart { room, track } => self.on_track_start(room, track).await,
            PlayerEvent::TrackEnd { room, track, reason } => self.on_track_end(room, track, reason).await,
            PlayerEvent::QueueEnd { room } => self.on_queue_end(room).await,
            PlayerEvent::TrackException { room, track, message } => {
                let notice = Notice::TrackError {
                    track: track.clone(),
                    message,
                };
                self.on_track_failure(room, track, notice).await
            }
            PlayerEvent::TrackStuck { room, track, threshold } => {
                let notice = Notice::TrackStuck {
                    track: track.clone(),
                    threshold,
                };
                self.on_track_failure(room, track, notice).await
            }
        }
    }

    async fn on_track_start(&self, room: RoomId, track: Track) {
        self.host.rooms().update(room, |state| {
            state.errors.reset();
            state.skip_votes.clear();
            state.autoplaying = track.user_data.autoplay;
        });
        self.host.persist().mark_played(room, track.id()).await;

        if self.host.settings().get(room).await.notify {
            self.send(room, Notice::NowPlaying { track }).await;
        }
        self.update_status().await;
    }

    async fn on_track_end(&self, room: RoomId, track: Track, reason: EndReason) {
        self.host.rooms().update(room, |state| {
            let ended_current = state.queue.current().is_some_and(|c| c.same_as(&track));
            if reason.advances_queue() || (ended_current && reason.releases_player()) {
                state.queue.clear_current();
            }
            state.prev_track = Some(track);
        });

        if reason.advances_queue() {
            if let Err(e) = self.host.play_next(room).await {
                warn!("No se pudo avanzar la cola de {}: {}", room, e);
            }
        }
    }

    async fn on_queue_end(&self, room: RoomId) {
        // Algo se encoló desde que se emitió el evento
        let busy = self
            .host
            .rooms()
            .read(room, |state| state.queue.current().is_some() || !state.queue.is_empty())
            .unwrap_or(true);
        if busy {
            debug!("Fin de cola obsoleto en {}, la sala vuelve a tener pistas", room);
            return;
        }

        self.host.persist().drop_room(room).await;
        let settings = self.host.settings().get(room).await;

        if settings.auto_play {
            match self.host.autoplay(room).await {
                Ok(track) => debug!("Autoplay encoló {} en {}", track.id(), room),
                Err(AudioError::RoomNotFound(_)) => {}
                Err(e) => {
                    warn!("🔁 Autoplay falló en {}: {}", room, e);
                    self.send(room, Notice::AutoplayFailed { reason: e.to_string() })
                        .await;
                }
            }
            return;
        }

        self.host.rooms().update(room, |state| state.autoplaying = false);
        if settings.notify {
            self.send(room, Notice::QueueEnded).await;
        }
        if settings.disconnect_on_queue_end {
            if settings.notify {
                self.send(room, Notice::Disconnected).await;
            }
            self.disconnect(room).await;
        }
        self.update_status().await;
    }

    async fn on_track_failure(&self, room: RoomId, track: Track, notice: Notice) {
        let now = self.host.clock().now();
        let threshold = self.policy.max_consecutive_errors;
        let verdict = self.host.rooms().update(room, |state| {
            state.queue.remove_track(&track);
            let is_current = state.queue.current().is_some_and(|c| c.same_as(&track));
            (state.errors.record_failure(now, threshold), is_current)
        });

        match verdict {
            None | Some((FailureVerdict::AlreadyEscalated, _)) => {
                debug!("Fallo de pista en {} ignorado, sala ya cerrándose", room);
            }
            Some((FailureVerdict::TooMany, _)) => {
                error!("💥 Demasiados errores seguidos en {}, desconectando", room);
                let channel = self.target(room);
                self.disconnect(room).await;
                if let Some(channel) = channel {
                    self.notifier.notify(room, channel, Notice::MultipleErrors).await;
                }
            }
            Some((FailureVerdict::SkipAndContinue, is_current)) => {
                warn!("⚠️ Pista fallida en {}: {}", room, notice);
                self.send(room, notice).await;
                if is_current {
                    if let Err(e) = self.host.play_next(room).await {
                        warn!("No se pudo saltar la pista fallida en {}: {}", room, e);
                    }
                }
            }
        }
    }

    async fn disconnect(&self, room: RoomId) {
        match self.host.disconnect(room).await {
            Ok(()) | Err(AudioError::RoomNotFound(_)) => {}
            Err(e) => warn!("Error desconectando la sala {}: {}", room, e),
        }
    }

    /// Where notices for `room` go: its notify channel, else its voice channel.
    fn target(&self, room: RoomId) -> Option<ChannelId> {
        self.host
            .rooms()
            .read(room, |state| state.notify_channel.unwrap_or(state.channel))
    }

    async fn send(&self, room: RoomId, notice: Notice) {
        if let Some(channel) = self.target(room) {
            self.notifier.notify(room, channel, notice).await;
        }
    }

    async fn update_status(&self) {
        if !self.policy.status_updates {
            return;
        }

        let rooms = self.host.rooms();
        let ids = self.host.active_rooms();
        let playing: Vec<String> = ids
            .iter()
            .filter_map(|room| {
                rooms
                    .read(*room, |state| state.queue.current().map(|t| t.title().to_string()))
                    .flatten()
            })
            .collect();

        let update = StatusUpdate {
            active_rooms: playing.len(),
            title: match playing.as_slice() {
                [only] => Some(only.clone()),
                _ => None,
            },
        };
        self.notifier.status(update).await;
    }
}
