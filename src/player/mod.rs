//! # Player Module
//!
//! The upstream contract of the audio subsystem. The command layer calls into
//! [`PlayerHost`] and gets plain data or an [`AudioError`] back; it never sees
//! storage or the node process.
//!
//! ## Architecture
//!
//! ### [`rooms`] - Room State
//! - One [`rooms::RoomState`] per room inside a single [`rooms::RoomManager`]
//! - Queue, error counter, skip votes and idle clocks live together
//!
//! ### [`queue`] - Queue Management
//! - Strict FIFO per room with a size limit
//!
//! ### [`resolve`] - Query Resolution
//! - Local cache first, node `loadtracks` last
//!
//! Every enqueue is written to the persistent queue before it reaches the
//! in-memory queue, so a crash never loses a track the user already saw
//! accepted.

pub mod queue;
pub mod resolve;
pub mod rooms;

use parking_lot::RwLock;
use rand::seq::SliceRandom;
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;
use tokio::sync::{mpsc::UnboundedSender, watch};
use tracing::{debug, info, warn};

use crate::clock::Clock;
use crate::node::{
    ChannelId, LoadResult, NodeClient, NodeError, PlayerEvent, RoomId, Track, VoiceState,
};
use crate::settings::RoomSettingsStore;
use crate::storage::{PersistentQueue, QueueRecord};
use crate::supervisor::NodeStatus;

pub use queue::{QueueSnapshot, RoomQueue};
pub use resolve::QueryResolver;
pub use rooms::{ErrorCounter, FailureVerdict, RoomManager, RoomState};

/// How far back autoplay looks for recently played cache entries.
pub const AUTOPLAY_WINDOW: Duration = Duration::from_secs(24 * 60 * 60);

#[derive(Debug, Error)]
pub enum AudioError {
    #[error("audio unavailable: {0}")]
    Unavailable(String),

    #[error("room {0} is not connected")]
    RoomNotFound(RoomId),

    #[error("queue is full ({0} tracks)")]
    QueueFull(usize),

    #[error("no results for '{0}'")]
    NoResults(String),

    #[error("track failed to load: {0}")]
    LoadFailed(String),

    #[error("nothing is playing")]
    NothingPlaying,

    #[error("the current track cannot be seeked")]
    NotSeekable,

    #[error(transparent)]
    Node(#[from] NodeError),
}

/// Result of an enqueue: what was accepted and what started playing, if the
/// room was idle. `started` stays `None` when the node refused to play; the
/// tracks remain queued for the next attempt.
#[derive(Debug, Clone, PartialEq)]
pub struct EnqueueOutcome {
    pub added: Vec<Track>,
    pub started: Option<Track>,
}

pub struct PlayerHost {
    node: RwLock<Option<Arc<dyn NodeClient>>>,
    status: watch::Receiver<NodeStatus>,
    rooms: RoomManager,
    resolver: QueryResolver,
    persist: PersistentQueue,
    settings: Arc<RoomSettingsStore>,
    events: UnboundedSender<PlayerEvent>,
    clock: Arc<dyn Clock>,
    autoplay_fallback: String,
}

impl PlayerHost {
    pub fn new(
        resolver: QueryResolver,
        persist: PersistentQueue,
        settings: Arc<RoomSettingsStore>,
        status: watch::Receiver<NodeStatus>,
        events: UnboundedSender<PlayerEvent>,
        clock: Arc<dyn Clock>,
        autoplay_fallback: String,
    ) -> Self {
        Self {
            node: RwLock::new(None),
            status,
            rooms: RoomManager::new(),
            resolver,
            persist,
            settings,
            events,
            clock,
            autoplay_fallback,
        }
    }

    pub fn attach_node(&self, client: Arc<dyn NodeClient>) {
        *self.node.write() = Some(client);
        info!("🎼 Nodo de audio disponible para el reproductor");
    }

    pub fn detach_node(&self) {
        if self.node.write().take().is_some() {
            warn!("🔌 Nodo de audio desconectado del reproductor");
        }
    }

    /// The node handle, or why audio is unavailable right now.
    pub fn node(&self) -> Result<Arc<dyn NodeClient>, AudioError> {
        if let NodeStatus::Unavailable(reason) = &*self.status.borrow() {
            return Err(AudioError::Unavailable(reason.clone()));
        }
        self.node
            .read()
            .clone()
            .ok_or_else(|| AudioError::Unavailable("no node session".to_string()))
    }

    pub fn rooms(&self) -> &RoomManager {
        &self.rooms
    }

    pub fn persist(&self) -> &PersistentQueue {
        &self.persist
    }

    pub fn settings(&self) -> &RoomSettingsStore {
        &self.settings
    }

    pub fn resolver(&self) -> &QueryResolver {
        &self.resolver
    }

    pub fn clock(&self) -> &dyn Clock {
        self.clock.as_ref()
    }

    pub fn active_rooms(&self) -> Vec<RoomId> {
        self.rooms.ids()
    }

    /// Registers a room playing in `channel`. Reconnecting an existing room
    /// only moves it.
    pub async fn connect_room(
        &self,
        room: RoomId,
        channel: ChannelId,
        notify_channel: Option<ChannelId>,
    ) -> Result<(), AudioError> {
        self.node()?;
        let settings = self.settings.get(room).await;

        let mut state = RoomState::new(room, channel, settings.volume, settings.max_queue_size);
        state.notify_channel = notify_channel;
        if self.rooms.insert_if_absent(state) {
            info!("🔊 Sala {} conectada al canal {}", room, channel);
        } else {
            self.rooms.update(room, |state| {
                state.channel = channel;
                if notify_channel.is_some() {
                    state.notify_channel = notify_channel;
                }
            });
        }
        Ok(())
    }

    pub async fn update_voice(&self, room: RoomId, voice: &VoiceState) -> Result<(), AudioError> {
        let node = self.node()?;
        node.update_voice(room, voice).await?;
        Ok(())
    }

    /// Resolves `query` and queues the result. Searches queue their top hit,
    /// playlists queue every track that fits.
    pub async fn enqueue(&self, room: RoomId, requester: u64, query: &str) -> Result<EnqueueOutcome, AudioError> {
        let node = self.node()?;
        if !self.rooms.contains(room) {
            return Err(AudioError::RoomNotFound(room));
        }

        let result = self.resolver.resolve(node.as_ref(), query).await?;
        let tracks: Vec<Track> = match &result {
            LoadResult::Playlist(_) => result.tracks(),
            _ => result.first().into_iter().collect(),
        };
        if tracks.is_empty() {
            return Err(AudioError::NoResults(query.to_string()));
        }

        let tracks = tracks
            .into_iter()
            .map(|mut track| {
                track.user_data.requester = requester;
                track.user_data.enqueue_time = 0;
                track.user_data.autoplay = false;
                track
            })
            .collect();
        self.enqueue_tracks(room, tracks).await
    }

    /// Queues already resolved tracks and starts playback if the room is idle.
    pub async fn enqueue_tracks(&self, room: RoomId, tracks: Vec<Track>) -> Result<EnqueueOutcome, AudioError> {
        let (channel, max_size) = self
            .rooms
            .read(room, |state| (state.channel, state.queue.max_size()))
            .ok_or(AudioError::RoomNotFound(room))?;
        let settings = self.settings.get(room).await;

        let mut added = Vec::with_capacity(tracks.len());
        for track in tracks {
            if self.rooms.read(room, |s| s.queue.is_full()).unwrap_or(true) {
                break;
            }

            let track = if settings.persist_queue {
                self.persist.enqueue(channel, room, &track).await
            } else {
                self.stamp(track)
            };

            let pushed = self
                .rooms
                .update(room, |state| state.queue.push(track.clone()))
                .ok_or(AudioError::RoomNotFound(room))?;
            if !pushed {
                self.persist.mark_played(room, track.id()).await;
                break;
            }
            added.push(track);
        }

        if added.is_empty() {
            return Err(AudioError::QueueFull(max_size));
        }
        debug!("➕ {} pistas encoladas en la sala {}", added.len(), room);

        let idle = self
            .rooms
            .read(room, |state| state.queue.current().is_none())
            .unwrap_or(false);
        let started = if idle {
            match self.play_next(room).await {
                Ok(started) => started,
                Err(e) => {
                    warn!("⚠️ Pistas encoladas en {} pero no arrancó la reproducción: {}", room, e);
                    None
                }
            }
        } else {
            None
        };

        Ok(EnqueueOutcome { added, started })
    }

    fn stamp(&self, mut track: Track) -> Track {
        if track.user_data.enqueue_time == 0 {
            track.user_data.enqueue_time = self.clock.now().timestamp_millis();
        }
        track
    }

    /// Starts the next queued track. With nothing left, stops whatever is
    /// still playing and raises [`PlayerEvent::QueueEnd`].
    pub async fn play_next(&self, room: RoomId) -> Result<Option<Track>, AudioError> {
        let node = self.node()?;
        let (was_playing, next, volume) = self
            .rooms
            .update(room, |state| {
                let was_playing = state.queue.current().is_some();
                state.paused = false;
                (was_playing, state.queue.advance(), state.volume)
            })
            .ok_or(AudioError::RoomNotFound(room))?;

        match next {
            Some(track) => {
                if let Err(e) = node.play(room, &track, volume).await {
                    self.rooms.update(room, |state| {
                        if state.queue.current().is_some_and(|c| c.same_as(&track)) {
                            state.queue.requeue_current();
                        }
                    });
                    return Err(e.into());
                }
                info!("🎵 Reproduciendo en {}: {}", room, track.description());
                Ok(Some(track))
            }
            None => {
                if was_playing {
                    node.stop(room).await?;
                }
                if self.events.send(PlayerEvent::QueueEnd { room }).is_err() {
                    debug!("Reactor detenido, fin de cola de {} descartado", room);
                }
                Ok(None)
            }
        }
    }

    pub async fn skip(&self, room: RoomId) -> Result<Option<Track>, AudioError> {
        self.rooms
            .update(room, |state| state.skip_votes.clear())
            .ok_or(AudioError::RoomNotFound(room))?;
        self.play_next(room).await
    }

    pub async fn seek(&self, room: RoomId, position: Duration) -> Result<(), AudioError> {
        let node = self.node()?;
        let seekable = self
            .rooms
            .read(room, |state| state.queue.current().map(|t| t.info.is_seekable))
            .ok_or(AudioError::RoomNotFound(room))?;

        match seekable {
            None => Err(AudioError::NothingPlaying),
            Some(false) => Err(AudioError::NotSeekable),
            Some(true) => Ok(node.seek(room, position).await?),
        }
    }

    /// Sets and remembers the room volume. Returns the applied value.
    pub async fn set_volume(&self, room: RoomId, volume: u16) -> Result<u16, AudioError> {
        let node = self.node()?;
        let volume = volume.min(1000);
        if !self.rooms.contains(room) {
            return Err(AudioError::RoomNotFound(room));
        }

        node.set_volume(room, volume).await?;
        self.rooms.update(room, |state| state.volume = volume);
        if let Err(e) = self.settings.update(room, |s| s.volume = volume).await {
            warn!("No se pudo guardar el volumen de {}: {}", room, e);
        }
        Ok(volume)
    }

    pub async fn pause(&self, room: RoomId, paused: bool) -> Result<(), AudioError> {
        let node = self.node()?;
        if !self.rooms.contains(room) {
            return Err(AudioError::RoomNotFound(room));
        }

        node.set_paused(room, paused).await?;
        self.rooms.update(room, |state| state.paused = paused);
        Ok(())
    }

    /// Stops playback and clears the queue, keeping the room connected.
    pub async fn stop(&self, room: RoomId) -> Result<(), AudioError> {
        let node = self.node()?;
        self.rooms
            .update(room, |state| {
                state.queue.clear();
                state.paused = false;
                state.autoplaying = false;
            })
            .ok_or(AudioError::RoomNotFound(room))?;

        self.persist.drop_room(room).await;
        node.stop(room).await?;
        Ok(())
    }

    /// Forgets the room, its queue and its node player.
    pub async fn disconnect(&self, room: RoomId) -> Result<(), AudioError> {
        let state = self.rooms.remove(room).ok_or(AudioError::RoomNotFound(room))?;
        self.persist.drop_room(room).await;

        // Sin nodo no hay jugador que destruir
        if let Ok(node) = self.node() {
            node.destroy(room).await?;
        }
        info!(
            "👋 Sala {} desconectada ({} pistas descartadas)",
            room,
            state.queue.len()
        );
        Ok(())
    }

    pub fn get_queue(&self, room: RoomId) -> Result<QueueSnapshot, AudioError> {
        self.rooms
            .read(room, |state| state.queue.snapshot())
            .ok_or(AudioError::RoomNotFound(room))
    }

    /// Picks a continuation track and queues it: a recently played cache
    /// entry if there is one, the fallback query otherwise.
    pub async fn autoplay(&self, room: RoomId) -> Result<Track, AudioError> {
        let node = self.node()?;
        let previous = self
            .rooms
            .read(room, |state| state.prev_track.clone())
            .ok_or(AudioError::RoomNotFound(room))?;

        let pick = |result: LoadResult| -> Option<Track> {
            let candidates: Vec<Track> = result
                .tracks()
                .into_iter()
                .filter(|t| !previous.as_ref().is_some_and(|p| p.same_as(t)))
                .collect();
            candidates.choose(&mut rand::thread_rng()).cloned()
        };

        let cached = self
            .resolver
            .cache()
            .node
            .fetch_random(AUTOPLAY_WINDOW)
            .await
            .and_then(pick);

        let mut track = match cached {
            Some(track) => track,
            None => {
                debug!("Sin candidatos en caché, usando la consulta de respaldo");
                let result = self
                    .resolver
                    .resolve(node.as_ref(), &self.autoplay_fallback)
                    .await?;
                pick(result).ok_or_else(|| AudioError::NoResults(self.autoplay_fallback.clone()))?
            }
        };

        track.user_data.requester = 0;
        track.user_data.enqueue_time = 0;
        track.user_data.autoplay = true;
        self.rooms.update(room, |state| state.autoplaying = true);

        let outcome = self.enqueue_tracks(room, vec![track]).await?;
        let track = outcome
            .added
            .into_iter()
            .next()
            .ok_or(AudioError::QueueFull(0))?;
        info!("🔁 Autoplay en {}: {}", room, track.description());
        Ok(track)
    }

    /// Rebuilds queues from persisted rows, in their original order. Rooms
    /// whose settings disable persistence drop their rows instead.
    pub async fn restore(&self, records: Vec<QueueRecord>) -> usize {
        let mut order: Vec<RoomId> = Vec::new();
        let mut groups: HashMap<RoomId, (ChannelId, Vec<Track>)> = HashMap::new();
        for record in records {
            let group = groups.entry(record.player_id).or_insert_with(|| {
                order.push(record.player_id);
                (record.room_id, Vec::new())
            });
            group.1.push(record.track);
        }

        let mut restored = 0;
        for room in order {
            let Some((channel, tracks)) = groups.remove(&room) else {
                continue;
            };
            let settings = self.settings.get(room).await;
            if !settings.persist_queue {
                self.persist.drop_room(room).await;
                continue;
            }

            self.rooms.insert_if_absent(RoomState::new(
                room,
                channel,
                settings.volume,
                settings.max_queue_size,
            ));
            let count = self
                .rooms
                .update(room, |state| tracks.into_iter().filter(|t| state.queue.push(t.clone())).count())
                .unwrap_or(0);
            restored += count;
            info!("♻️ Restauradas {} pistas en la sala {}", count, room);

            let idle = self
                .rooms
                .read(room, |state| state.queue.current().is_none())
                .unwrap_or(false);
            if idle {
                if let Err(e) = self.play_next(room).await {
                    warn!("No se pudo reanudar la sala {}: {}", room, e);
                }
            }
        }
        restored
    }
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::clock::ManualClock;
    use crate::node::{MockNodeClient, TrackExtras, TrackInfo};
    use crate::settings::RoomSettings;
    use crate::storage::{CacheLevel, Database, LocalCache};
    use chrono::{TimeZone, Utc};
    use tempfile::TempDir;
    use tokio::sync::mpsc::{self, UnboundedReceiver};

    pub(crate) struct TestHost {
        pub host: Arc<PlayerHost>,
        pub events: UnboundedReceiver<PlayerEvent>,
        pub clock: Arc<ManualClock>,
        pub status: watch::Sender<NodeStatus>,
        _dir: TempDir,
    }

    pub(crate) async fn host_with(node: MockNodeClient, defaults: RoomSettings) -> TestHost {
        let dir = tempfile::tempdir().unwrap();
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 3, 1, 0, 0, 0).unwrap()));
        let db = Database::in_memory().await.unwrap();
        let cache = Arc::new(LocalCache::new(
            &db,
            clock.clone(),
            Duration::from_secs(365 * 86_400),
            CacheLevel::all(),
        ));
        let settings = Arc::new(
            RoomSettingsStore::new(dir.path().to_path_buf(), defaults)
                .await
                .unwrap(),
        );
        let (status, status_rx) = watch::channel(NodeStatus::Ready);
        let (events_tx, events) = mpsc::unbounded_channel();

        let host = PlayerHost::new(
            QueryResolver::new(cache),
            PersistentQueue::new(&db, clock.clone()),
            settings,
            status_rx,
            events_tx,
            clock.clone(),
            "fallback".to_string(),
        );
        host.attach_node(Arc::new(node));

        TestHost {
            host: Arc::new(host),
            events,
            clock,
            status,
            _dir: dir,
        }
    }

    pub(crate) fn track(id: &str) -> Track {
        Track {
            encoded: format!("enc-{id}"),
            info: TrackInfo {
                identifier: id.to_string(),
                is_seekable: true,
                author: "Band".to_string(),
                length: 180_000,
                is_stream: false,
                position: 0,
                title: id.to_string(),
                uri: Some(format!("https://youtu.be/{id}")),
                artwork_url: None,
                isrc: None,
                source_name: "youtube".to_string(),
            },
            user_data: TrackExtras::default(),
        }
    }
}
