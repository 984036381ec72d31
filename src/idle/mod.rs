//! Periodic sweep over active rooms that pauses or disconnects rooms nobody
//! is listening to.
//!
//! A room is "empty" when every listener present in its channel is a bot.
//! The sweep starts an idle clock on the first empty tick and acts once the
//! room's `emptypause_timer` / `emptydc_timer` has passed. A human coming
//! back resumes a room this timer paused, never one a user paused.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::node::{ChannelId, RoomId};
use crate::player::{AudioError, PlayerHost};

pub const TICK_INTERVAL: Duration = Duration::from_secs(5);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Listener {
    pub user_id: u64,
    pub is_human: bool,
}

/// Who is currently in a room's channel. Backed by the chat gateway.
#[cfg_attr(test, mockall::automock)]
#[async_trait]
pub trait PresenceSource: Send + Sync {
    /// `None` when the room or channel no longer exists.
    async fn listeners(&self, room: RoomId, channel: ChannelId) -> Option<Vec<Listener>>;
}

/// Presence for a process with no chat gateway attached: every room looks
/// empty.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoPresence;

#[async_trait]
impl PresenceSource for NoPresence {
    async fn listeners(&self, _room: RoomId, _channel: ChannelId) -> Option<Vec<Listener>> {
        Some(Vec::new())
    }
}

/// What a tick did to one room.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IdleAction {
    Nothing,
    Paused,
    Resumed,
    Disconnected,
}

pub struct IdleTimer {
    host: Arc<PlayerHost>,
    presence: Arc<dyn PresenceSource>,
}

impl IdleTimer {
    pub fn new(host: Arc<PlayerHost>, presence: Arc<dyn PresenceSource>) -> Self {
        Self { host, presence }
    }

    pub async fn run(self, shutdown: CancellationToken) {
        let mut interval = tokio::time::interval(TICK_INTERVAL);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        info!("⏱️ Temporizador de inactividad iniciado");

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = interval.tick() => {
                    let now = self.host.clock().now();
                    self.tick(now).await;
                }
            }
        }
        info!("⏱️ Temporizador de inactividad detenido");
    }

    pub async fn tick(&self, now: DateTime<Utc>) -> Vec<(RoomId, IdleAction)> {
        let mut actions = Vec::new();
        for room in self.host.active_rooms() {
            let action = self.check_room(room, now).await;
            if action != IdleAction::Nothing {
                actions.push((room, action));
            }
        }
        actions
    }

    async fn check_room(&self, room: RoomId, now: DateTime<Utc>) -> IdleAction {
        let Some(channel) = self.host.rooms().read(room, |state| state.channel) else {
            return IdleAction::Nothing;
        };

        let Some(listeners) = self.presence.listeners(room, channel).await else {
            debug!("La sala {} ya no existe, limpiando", room);
            return self.disconnect(room).await;
        };

        if listeners.iter().any(|l| l.is_human) {
            return self.on_human_present(room).await;
        }

        let settings = self.host.settings().get(room).await;
        let Some(empty_for) = self.host.rooms().update(room, |state| {
            let since = *state.idle.empty_since.get_or_insert(now);
            now.signed_duration_since(since).to_std().unwrap_or_default()
        }) else {
            return IdleAction::Nothing;
        };

        if settings.emptydc_enabled && empty_for >= Duration::from_secs(settings.emptydc_timer) {
            info!(
                "💤 Sala {} vacía durante {}, desconectando",
                room,
                humantime::format_duration(empty_for)
            );
            return self.disconnect(room).await;
        }

        let playing = self
            .host
            .rooms()
            .read(room, |state| state.is_playing() && !state.idle.paused_for_no_humans)
            .unwrap_or(false);
        if settings.emptypause_enabled
            && playing
            && empty_for >= Duration::from_secs(settings.emptypause_timer)
        {
            return match self.host.pause(room, true).await {
                Ok(()) => {
                    self.host
                        .rooms()
                        .update(room, |state| state.idle.paused_for_no_humans = true);
                    info!("⏸️ Sala {} pausada, no quedan oyentes", room);
                    IdleAction::Paused
                }
                Err(e) => {
                    warn!("No se pudo pausar la sala {}: {}", room, e);
                    IdleAction::Nothing
                }
            };
        }

        IdleAction::Nothing
    }

    async fn on_human_present(&self, room: RoomId) -> IdleAction {
        let resume = self
            .host
            .rooms()
            .update(room, |state| {
                state.idle.empty_since = None;
                std::mem::take(&mut state.idle.paused_for_no_humans)
            })
            .unwrap_or(false);

        if !resume {
            return IdleAction::Nothing;
        }
        match self.host.pause(room, false).await {
            Ok(()) => {
                info!("▶️ Sala {} reanudada, hay oyentes de nuevo", room);
                IdleAction::Resumed
            }
            Err(e) => {
                warn!("No se pudo reanudar la sala {}: {}", room, e);
                IdleAction::Nothing
            }
        }
    }

    async fn disconnect(&self, room: RoomId) -> IdleAction {
        match self.host.disconnect(room).await {
            Ok(()) => IdleAction::Disconnected,
            // Otro camino ya la limpió
            Err(AudioError::RoomNotFound(_)) => IdleAction::Nothing,
            Err(e) => {
                warn!("Error desconectando la sala inactiva {}: {}", room, e);
                IdleAction::Nothing
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::Clock;
    use crate::node::MockNodeClient;
    use crate::player::testing::{host_with, track};
    use crate::settings::RoomSettings;
    use pretty_assertions::assert_eq;

    const ROOM: RoomId = RoomId(3);
    const CHANNEL: ChannelId = ChannelId(30);

    fn bots_only() -> Option<Vec<Listener>> {
        Some(vec![Listener {
            user_id: 1,
            is_human: false,
        }])
    }

    fn with_human() -> Option<Vec<Listener>> {
        Some(vec![
            Listener {
                user_id: 1,
                is_human: false,
            },
            Listener {
                user_id: 2,
                is_human: true,
            },
        ])
    }

    #[tokio::test]
    async fn empty_room_disconnects_exactly_once() {
        let mut node = MockNodeClient::new();
        node.expect_destroy().times(1).returning(|_| Ok(()));

        let mut presence = MockPresenceSource::new();
        presence.expect_listeners().returning(|_, _| bots_only());

        let settings = RoomSettings {
            emptydc_enabled: true,
            emptydc_timer: 60,
            ..RoomSettings::default()
        };
        let t = host_with(node, settings).await;
        t.host.connect_room(ROOM, CHANNEL, None).await.unwrap();
        let timer = IdleTimer::new(t.host.clone(), Arc::new(presence));

        assert!(timer.tick(t.clock.now()).await.is_empty());
        t.clock.advance(chrono::Duration::seconds(61));
        assert_eq!(
            timer.tick(t.clock.now()).await,
            vec![(ROOM, IdleAction::Disconnected)]
        );

        t.clock.advance(chrono::Duration::seconds(5));
        assert!(timer.tick(t.clock.now()).await.is_empty());
    }

    #[tokio::test]
    async fn returning_human_cancels_the_clock() {
        let mut presence = MockPresenceSource::new();
        let mut seq = mockall::Sequence::new();
        presence
            .expect_listeners()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| bots_only());
        presence
            .expect_listeners()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| with_human());
        presence
            .expect_listeners()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| bots_only());

        let settings = RoomSettings {
            emptydc_enabled: true,
            emptydc_timer: 60,
            ..RoomSettings::default()
        };
        let t = host_with(MockNodeClient::new(), settings).await;
        t.host.connect_room(ROOM, CHANNEL, None).await.unwrap();
        let timer = IdleTimer::new(t.host.clone(), Arc::new(presence));

        timer.tick(t.clock.now()).await;
        t.clock.advance(chrono::Duration::seconds(50));
        timer.tick(t.clock.now()).await;
        t.clock.advance(chrono::Duration::seconds(50));

        // El reloj volvió a empezar cuando apareció el humano
        assert!(timer.tick(t.clock.now()).await.is_empty());
        assert!(t.host.rooms().contains(ROOM));
    }

    #[tokio::test]
    async fn pauses_then_resumes_for_humans() {
        let mut node = MockNodeClient::new();
        node.expect_play().returning(|_, _, _| Ok(()));
        node.expect_set_paused()
            .withf(|_, paused| *paused)
            .times(1)
            .returning(|_, _| Ok(()));
        node.expect_set_paused()
            .withf(|_, paused| !*paused)
            .times(1)
            .returning(|_, _| Ok(()));

        let mut presence = MockPresenceSource::new();
        let mut seq = mockall::Sequence::new();
        presence
            .expect_listeners()
            .times(2)
            .in_sequence(&mut seq)
            .returning(|_, _| bots_only());
        presence
            .expect_listeners()
            .times(1)
            .in_sequence(&mut seq)
            .returning(|_, _| with_human());

        let settings = RoomSettings {
            emptypause_enabled: true,
            emptypause_timer: 10,
            ..RoomSettings::default()
        };
        let t = host_with(node, settings).await;
        t.host.connect_room(ROOM, CHANNEL, None).await.unwrap();
        t.host.enqueue_tracks(ROOM, vec![track("a")]).await.unwrap();
        let timer = IdleTimer::new(t.host.clone(), Arc::new(presence));

        timer.tick(t.clock.now()).await;
        t.clock.advance(chrono::Duration::seconds(10));
        assert_eq!(timer.tick(t.clock.now()).await, vec![(ROOM, IdleAction::Paused)]);
        assert_eq!(timer.tick(t.clock.now()).await, vec![(ROOM, IdleAction::Resumed)]);
    }

    #[tokio::test]
    async fn vanished_room_is_cleaned_up_quietly() {
        let mut node = MockNodeClient::new();
        node.expect_destroy().times(1).returning(|_| Ok(()));

        let mut presence = MockPresenceSource::new();
        presence.expect_listeners().returning(|_, _| None);

        let t = host_with(node, RoomSettings::default()).await;
        t.host.connect_room(ROOM, CHANNEL, None).await.unwrap();
        let timer = IdleTimer::new(t.host.clone(), Arc::new(presence));

        assert_eq!(
            timer.tick(t.clock.now()).await,
            vec![(ROOM, IdleAction::Disconnected)]
        );
        assert!(timer.tick(t.clock.now()).await.is_empty());
    }
}
