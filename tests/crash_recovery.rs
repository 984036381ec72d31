//! A process dies with queued tracks; the next one rebuilds the queue in the
//! order it was built.

use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use parking_lot::Mutex;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};

use open_music_audio::clock::ManualClock;
use open_music_audio::node::{
    ChannelId, LoadResult, NodeClient, NodeError, RoomId, Track, TrackExtras, TrackInfo, VoiceState,
};
use open_music_audio::player::{PlayerHost, QueryResolver};
use open_music_audio::settings::{RoomSettings, RoomSettingsStore};
use open_music_audio::storage::{CacheLevel, Database, LocalCache, PersistentQueue};
use open_music_audio::supervisor::NodeStatus;

const ROOM: RoomId = RoomId(77);
const CHANNEL: ChannelId = ChannelId(700);

/// Node stand-in that records what it was asked to play.
#[derive(Default)]
struct RecordingNode {
    played: Mutex<Vec<String>>,
}

#[async_trait]
impl NodeClient for RecordingNode {
    async fn version(&self) -> Result<String, NodeError> {
        Ok("4.0.8".to_string())
    }
    async fn load_tracks(&self, _identifier: &str) -> Result<LoadResult, NodeError> {
        Ok(LoadResult::Empty {})
    }
    async fn play(&self, _room: RoomId, track: &Track, _volume: u16) -> Result<(), NodeError> {
        self.played.lock().push(track.info.identifier.clone());
        Ok(())
    }
    async fn stop(&self, _room: RoomId) -> Result<(), NodeError> {
        Ok(())
    }
    async fn set_paused(&self, _room: RoomId, _paused: bool) -> Result<(), NodeError> {
        Ok(())
    }
    async fn seek(&self, _room: RoomId, _position: Duration) -> Result<(), NodeError> {
        Ok(())
    }
    async fn set_volume(&self, _room: RoomId, _volume: u16) -> Result<(), NodeError> {
        Ok(())
    }
    async fn update_voice(&self, _room: RoomId, _voice: &VoiceState) -> Result<(), NodeError> {
        Ok(())
    }
    async fn destroy(&self, _room: RoomId) -> Result<(), NodeError> {
        Ok(())
    }
}

fn track(id: &str) -> Track {
    Track {
        encoded: format!("enc-{id}"),
        info: TrackInfo {
            identifier: id.to_string(),
            is_seekable: true,
            author: "Band".to_string(),
            length: 200_000,
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

async fn host(db: &Database, dir: &std::path::Path, clock: Arc<ManualClock>) -> (PlayerHost, Arc<RecordingNode>) {
    let cache = LocalCache::new(db, clock.clone(), Duration::from_secs(86_400), CacheLevel::all());
    let settings = RoomSettingsStore::new(dir.to_path_buf(), RoomSettings::default())
        .await
        .unwrap();
    let (_status_tx, status) = watch::channel(NodeStatus::Ready);
    let (events, _events_rx) = mpsc::unbounded_channel();

    let host = PlayerHost::new(
        QueryResolver::new(Arc::new(cache)),
        PersistentQueue::new(db, clock.clone()),
        Arc::new(settings),
        status,
        events,
        clock,
        "fallback".to_string(),
    );
    let node = Arc::new(RecordingNode::default());
    host.attach_node(node.clone());
    (host, node)
}

#[tokio::test]
async fn queue_survives_a_restart_in_order() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("Audio.db");
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()));

    // Primer proceso: A suena, B y C esperan
    {
        let db = Database::open(&path, 2).await.unwrap();
        let (host, node) = host(&db, dir.path(), clock.clone()).await;
        host.connect_room(ROOM, CHANNEL, None).await.unwrap();
        for id in ["a", "b", "c"] {
            host.enqueue_tracks(ROOM, vec![track(id)]).await.unwrap();
            clock.advance(chrono::Duration::seconds(1));
        }
        host.persist().mark_played(ROOM, "a").await;
        assert_eq!(*node.played.lock(), vec!["a".to_string()]);
        db.close().await;
    }

    // Segundo proceso: limpieza de arranque y restauración
    let db = Database::open(&path, 2).await.unwrap();
    let (host, node) = host(&db, dir.path(), clock.clone()).await;
    assert_eq!(host.persist().reap().await, 1);

    let pending = host.persist().fetch_pending().await;
    let order: Vec<_> = pending.iter().map(|r| r.track_id.clone()).collect();
    assert_eq!(order, vec!["b", "c"]);
    assert!(pending.iter().all(|r| r.room_id == CHANNEL && r.player_id == ROOM));

    assert_eq!(host.restore(pending).await, 2);
    assert_eq!(*node.played.lock(), vec!["b".to_string()]);

    let snapshot = host.get_queue(ROOM).unwrap();
    assert_eq!(snapshot.current.map(|t| t.info.identifier), Some("b".to_string()));
    assert_eq!(snapshot.items.len(), 1);
    assert_eq!(snapshot.total_duration, Duration::from_secs(400));
}

#[tokio::test]
async fn rooms_without_persistence_drop_their_rows() {
    let dir = tempfile::tempdir().unwrap();
    let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 5, 1, 20, 0, 0).unwrap()));
    let db = Database::open(&dir.path().join("Audio.db"), 1).await.unwrap();
    let (host, node) = host(&db, dir.path(), clock.clone()).await;

    host.persist().enqueue(CHANNEL, ROOM, &track("a")).await;
    host.settings()
        .update(ROOM, |s| s.persist_queue = false)
        .await
        .unwrap();

    let pending = host.persist().fetch_pending().await;
    assert_eq!(host.restore(pending).await, 0);
    assert!(node.played.lock().is_empty());
    assert!(host.persist().fetch_pending().await.is_empty());
    assert!(!host.rooms().contains(ROOM));
}
