//! # Lookup Cache
//!
//! Three tables, one per provider kind, sharing the same access pattern:
//!
//! | kind      | key          | payload        |
//! |-----------|--------------|----------------|
//! | `node`    | `query`      | load result    |
//! | `youtube` | `track_info` | `youtube_url`  |
//! | `spotify` | `uri`        | `track_info`   |
//!
//! `last_updated` is the last refresh from the source and decides staleness.
//! `last_fetched` is the last local read and only biases random sampling.
//!
//! Every public operation is infallible from the caller's point of view: a
//! failed read is a miss and a failed write is logged and dropped.

use rand::seq::SliceRandom;
use serde::{Deserialize, Serialize};
use sqlx::query::Query;
use sqlx::sqlite::{Sqlite, SqliteArguments, SqlitePool};
use sqlx::Row;
use std::marker::PhantomData;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

use super::{Database, Result};
use crate::clock::Clock;
use crate::node::LoadResult;

/// Upper bound of rows considered by [`CacheTable::fetch_random`].
pub const RANDOM_CANDIDATES: i64 = 100;

type SqliteQuery<'q> = Query<'q, Sqlite, SqliteArguments<'q>>;

/// Bit set of enabled provider kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CacheLevel(u8);

impl CacheLevel {
    pub const NODE: CacheLevel = CacheLevel(1);
    pub const YOUTUBE: CacheLevel = CacheLevel(2);
    pub const SPOTIFY: CacheLevel = CacheLevel(4);

    pub const fn none() -> Self {
        CacheLevel(0)
    }

    pub const fn all() -> Self {
        CacheLevel(Self::NODE.0 | Self::YOUTUBE.0 | Self::SPOTIFY.0)
    }

    /// Unknown bits are ignored.
    pub const fn from_bits(bits: u8) -> Self {
        CacheLevel(bits & Self::all().0)
    }

    pub const fn bits(self) -> u8 {
        self.0
    }

    pub const fn contains(self, other: CacheLevel) -> bool {
        self.0 & other.0 == other.0
    }
}

impl std::ops::BitOr for CacheLevel {
    type Output = CacheLevel;

    fn bitor(self, rhs: CacheLevel) -> CacheLevel {
        CacheLevel(self.0 | rhs.0)
    }
}

/// SQL for one cache table. Every statement aliases its payload column to
/// `payload` so rows decode the same way for every kind.
#[derive(Debug)]
pub struct TableStatements {
    pub name: &'static str,
    pub upsert: &'static str,
    pub fetch_one: &'static str,
    pub fetch_random: &'static str,
    pub touch: &'static str,
    pub evict: &'static str,
}

/// A row type that can live in one of the cache tables.
pub trait CacheRecord: Send + Sync {
    type Payload: Send;

    const STATEMENTS: &'static TableStatements;
    const LEVEL: CacheLevel;

    /// Binds the natural key and data columns in `upsert` order. The two
    /// timestamps are bound by the table afterwards.
    fn bind_upsert<'q>(&'q self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>>;

    fn decode_payload(raw: String) -> Result<Self::Payload>;
}

/// Identifier sent to the node mapped to what it answered.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeQueryRecord {
    pub query: String,
    pub data: LoadResult,
}

/// "artist - title" mapped to a playable youtube URL.
#[derive(Debug, Clone, PartialEq)]
pub struct YouTubeRecord {
    pub track_info: String,
    pub youtube_url: String,
}

/// Spotify metadata mapped to the "artist - title" string used for searching.
#[derive(Debug, Clone, PartialEq)]
pub struct SpotifyRecord {
    pub id: String,
    pub kind: String,
    pub uri: String,
    pub track_name: Option<String>,
    pub artist_name: Option<String>,
    pub song_url: Option<String>,
    pub track_info: String,
}

const NODE_STATEMENTS: TableStatements = TableStatements {
    name: "cache_node",
    upsert: "INSERT INTO cache_node (query, data, last_updated, last_fetched)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (query) DO UPDATE SET
                 data = excluded.data,
                 last_updated = excluded.last_updated",
    fetch_one: "SELECT data AS payload, last_updated FROM cache_node
                WHERE query = ? AND last_updated > ?",
    fetch_random: "SELECT data AS payload FROM cache_node
                   WHERE last_fetched > ? AND last_updated > ?
                   ORDER BY RANDOM() LIMIT ?",
    touch: "UPDATE cache_node SET last_fetched = ? WHERE query = ?",
    evict: "DELETE FROM cache_node WHERE last_updated < ?",
};

const YOUTUBE_STATEMENTS: TableStatements = TableStatements {
    name: "cache_youtube",
    upsert: "INSERT INTO cache_youtube (track_info, youtube_url, last_updated, last_fetched)
             VALUES (?, ?, ?, ?)
             ON CONFLICT (track_info) DO UPDATE SET
                 youtube_url = excluded.youtube_url,
                 last_updated = excluded.last_updated",
    fetch_one: "SELECT youtube_url AS payload, last_updated FROM cache_youtube
                WHERE track_info = ? AND last_updated > ?",
    fetch_random: "SELECT youtube_url AS payload FROM cache_youtube
                   WHERE last_fetched > ? AND last_updated > ?
                   ORDER BY RANDOM() LIMIT ?",
    touch: "UPDATE cache_youtube SET last_fetched = ? WHERE track_info = ?",
    evict: "DELETE FROM cache_youtube WHERE last_updated < ?",
};

const SPOTIFY_STATEMENTS: TableStatements = TableStatements {
    name: "cache_spotify",
    upsert: "INSERT INTO cache_spotify
                 (id, type, uri, track_name, artist_name, song_url, track_info, last_updated, last_fetched)
             VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)
             ON CONFLICT (uri) DO UPDATE SET
                 id = excluded.id,
                 type = excluded.type,
                 track_name = excluded.track_name,
                 artist_name = excluded.artist_name,
                 song_url = excluded.song_url,
                 track_info = excluded.track_info,
                 last_updated = excluded.last_updated",
    fetch_one: "SELECT track_info AS payload, last_updated FROM cache_spotify
                WHERE uri = ? AND last_updated > ?",
    fetch_random: "SELECT track_info AS payload FROM cache_spotify
                   WHERE last_fetched > ? AND last_updated > ?
                   ORDER BY RANDOM() LIMIT ?",
    touch: "UPDATE cache_spotify SET last_fetched = ? WHERE uri = ?",
    evict: "DELETE FROM cache_spotify WHERE last_updated < ?",
};

impl CacheRecord for NodeQueryRecord {
    type Payload = LoadResult;

    const STATEMENTS: &'static TableStatements = &NODE_STATEMENTS;
    const LEVEL: CacheLevel = CacheLevel::NODE;

    fn bind_upsert<'q>(&'q self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>> {
        let data = serde_json::to_string(&self.data)?;
        Ok(query.bind(self.query.as_str()).bind(data))
    }

    fn decode_payload(raw: String) -> Result<LoadResult> {
        Ok(serde_json::from_str(&raw)?)
    }
}

impl CacheRecord for YouTubeRecord {
    type Payload = String;

    const STATEMENTS: &'static TableStatements = &YOUTUBE_STATEMENTS;
    const LEVEL: CacheLevel = CacheLevel::YOUTUBE;

    fn bind_upsert<'q>(&'q self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>> {
        Ok(query
            .bind(self.track_info.as_str())
            .bind(self.youtube_url.as_str()))
    }

    fn decode_payload(raw: String) -> Result<String> {
        Ok(raw)
    }
}

impl CacheRecord for SpotifyRecord {
    type Payload = String;

    const STATEMENTS: &'static TableStatements = &SPOTIFY_STATEMENTS;
    const LEVEL: CacheLevel = CacheLevel::SPOTIFY;

    fn bind_upsert<'q>(&'q self, query: SqliteQuery<'q>) -> Result<SqliteQuery<'q>> {
        Ok(query
            .bind(self.id.as_str())
            .bind(self.kind.as_str())
            .bind(self.uri.as_str())
            .bind(self.track_name.as_deref())
            .bind(self.artist_name.as_deref())
            .bind(self.song_url.as_deref())
            .bind(self.track_info.as_str()))
    }

    fn decode_payload(raw: String) -> Result<String> {
        Ok(raw)
    }
}

/// A fresh cache row.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit<P> {
    pub payload: P,
    /// Unix seconds of the last refresh from the source.
    pub last_updated: i64,
}

/// Typed access to one cache table.
#[derive(Debug)]
pub struct CacheTable<R> {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
    max_age: Duration,
    enabled: bool,
    _record: PhantomData<fn() -> R>,
}

impl<R: CacheRecord> CacheTable<R> {
    pub fn new(db: &Database, clock: Arc<dyn Clock>, max_age: Duration, enabled: bool) -> Self {
        Self {
            pool: db.pool().clone(),
            clock,
            max_age,
            enabled,
            _record: PhantomData,
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    fn now(&self) -> i64 {
        self.clock.now().timestamp()
    }

    /// Unix seconds `age` ago.
    fn cutoff(&self, age: Duration) -> i64 {
        let secs = i64::try_from(age.as_secs()).unwrap_or(i64::MAX);
        self.now().saturating_sub(secs)
    }

    /// Fresh row for `key` using the configured maximum age.
    pub async fn fetch_one(&self, key: &str) -> Option<CacheHit<R::Payload>> {
        self.fetch_one_within(key, self.max_age).await
    }

    /// Fresh row for `key`; rows refreshed `max_age` or longer ago are a miss.
    pub async fn fetch_one_within(&self, key: &str, max_age: Duration) -> Option<CacheHit<R::Payload>> {
        if !self.enabled {
            return None;
        }
        match self.try_fetch_one(key, max_age).await {
            Ok(hit) => hit,
            Err(e) => {
                warn!("⚠️ Lectura de {} falló para '{}': {}", R::STATEMENTS.name, key, e);
                None
            }
        }
    }

    async fn try_fetch_one(&self, key: &str, max_age: Duration) -> Result<Option<CacheHit<R::Payload>>> {
        let row = sqlx::query(R::STATEMENTS.fetch_one)
            .bind(key)
            .bind(self.cutoff(max_age))
            .fetch_optional(&self.pool)
            .await?;

        match row {
            Some(row) => Ok(Some(CacheHit {
                payload: R::decode_payload(row.try_get("payload")?)?,
                last_updated: row.try_get("last_updated")?,
            })),
            None => Ok(None),
        }
    }

    /// Uniform pick among fresh rows read within `window`.
    pub async fn fetch_random(&self, window: Duration) -> Option<R::Payload> {
        if !self.enabled {
            return None;
        }
        match self.try_fetch_random(window).await {
            Ok(payload) => payload,
            Err(e) => {
                warn!("⚠️ Lectura aleatoria de {} falló: {}", R::STATEMENTS.name, e);
                None
            }
        }
    }

    async fn try_fetch_random(&self, window: Duration) -> Result<Option<R::Payload>> {
        let rows = sqlx::query(R::STATEMENTS.fetch_random)
            .bind(self.cutoff(window))
            .bind(self.cutoff(self.max_age))
            .bind(RANDOM_CANDIDATES)
            .fetch_all(&self.pool)
            .await?;

        let picked = rows
            .choose(&mut rand::thread_rng())
            .map(|row| row.try_get::<String, _>("payload"))
            .transpose()?;
        picked.map(R::decode_payload).transpose()
    }

    /// Upserts every record in one transaction. `last_fetched` of existing
    /// rows is left alone.
    pub async fn insert_or_update(&self, records: &[R]) {
        if !self.enabled || records.is_empty() {
            return;
        }
        if let Err(e) = self.try_insert_or_update(records).await {
            warn!("⚠️ Escritura en {} descartada: {}", R::STATEMENTS.name, e);
        }
    }

    async fn try_insert_or_update(&self, records: &[R]) -> Result<()> {
        let now = self.now();
        let mut tx = self.pool.begin().await?;
        for record in records {
            record
                .bind_upsert(sqlx::query(R::STATEMENTS.upsert))?
                .bind(now)
                .bind(now)
                .execute(&mut *tx)
                .await?;
        }
        tx.commit().await?;

        debug!("💾 {} filas escritas en {}", records.len(), R::STATEMENTS.name);
        Ok(())
    }

    /// Marks `key` as read now without touching anything else.
    pub async fn touch_fetched(&self, key: &str) {
        if !self.enabled {
            return;
        }
        let result = sqlx::query(R::STATEMENTS.touch)
            .bind(self.now())
            .bind(key)
            .execute(&self.pool)
            .await;
        if let Err(e) = result {
            warn!("⚠️ No se pudo marcar lectura en {}: {}", R::STATEMENTS.name, e);
        }
    }

    /// Deletes rows refreshed longer than `max_age` ago. Returns the count.
    pub async fn evict_older_than(&self, max_age: Duration) -> u64 {
        match sqlx::query(R::STATEMENTS.evict)
            .bind(self.cutoff(max_age))
            .execute(&self.pool)
            .await
        {
            Ok(done) => done.rows_affected(),
            Err(e) => {
                warn!("⚠️ Limpieza de {} falló: {}", R::STATEMENTS.name, e);
                0
            }
        }
    }
}

/// The three provider tables behind one handle.
#[derive(Debug)]
pub struct LocalCache {
    pub node: CacheTable<NodeQueryRecord>,
    pub youtube: CacheTable<YouTubeRecord>,
    pub spotify: CacheTable<SpotifyRecord>,
    max_age: Duration,
}

impl LocalCache {
    pub fn new(db: &Database, clock: Arc<dyn Clock>, max_age: Duration, level: CacheLevel) -> Self {
        Self {
            node: CacheTable::new(db, clock.clone(), max_age, level.contains(NodeQueryRecord::LEVEL)),
            youtube: CacheTable::new(db, clock.clone(), max_age, level.contains(YouTubeRecord::LEVEL)),
            spotify: CacheTable::new(db, clock, max_age, level.contains(SpotifyRecord::LEVEL)),
            max_age,
        }
    }

    /// Startup sweep of stale rows. Staleness is also enforced on every read,
    /// so this only reclaims space.
    pub async fn evict_expired(&self) -> u64 {
        let removed = self.node.evict_older_than(self.max_age).await
            + self.youtube.evict_older_than(self.max_age).await
            + self.spotify.evict_older_than(self.max_age).await;

        if removed > 0 {
            info!("🧹 {} entradas de caché caducadas eliminadas", removed);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::node::{Track, TrackExtras, TrackInfo};
    use chrono::{Duration as ChronoDuration, TimeZone, Utc};
    use pretty_assertions::assert_eq;

    const DAY: Duration = Duration::from_secs(86_400);

    fn track(id: &str) -> Track {
        Track {
            encoded: format!("enc-{id}"),
            info: TrackInfo {
                identifier: id.to_string(),
                is_seekable: true,
                author: "Band".to_string(),
                length: 1000,
                is_stream: false,
                position: 0,
                title: id.to_string(),
                uri: None,
                artwork_url: None,
                isrc: None,
                source_name: "youtube".to_string(),
            },
            user_data: TrackExtras::default(),
        }
    }

    async fn setup(level: CacheLevel) -> (Arc<ManualClock>, Database, LocalCache) {
        let clock = Arc::new(ManualClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()));
        let db = Database::in_memory().await.unwrap();
        let cache = LocalCache::new(&db, clock.clone(), 365 * DAY, level);
        (clock, db, cache)
    }

    async fn timestamps(db: &Database, table: &str, key_col: &str, key: &str) -> (i64, i64) {
        let row = sqlx::query(&format!(
            "SELECT last_updated, last_fetched FROM {table} WHERE {key_col} = ?"
        ))
        .bind(key)
        .fetch_one(db.pool())
        .await
        .unwrap();
        (row.get(0), row.get(1))
    }

    #[tokio::test]
    async fn every_kind_honours_max_age() {
        let (clock, _db, cache) = setup(CacheLevel::all()).await;

        cache
            .node
            .insert_or_update(&[NodeQueryRecord {
                query: "ytsearch:song".to_string(),
                data: LoadResult::Search(vec![track("a")]),
            }])
            .await;
        cache
            .youtube
            .insert_or_update(&[YouTubeRecord {
                track_info: "Band - a".to_string(),
                youtube_url: "https://youtu.be/a".to_string(),
            }])
            .await;
        cache
            .spotify
            .insert_or_update(&[SpotifyRecord {
                id: "sp1".to_string(),
                kind: "track".to_string(),
                uri: "spotify:track:sp1".to_string(),
                track_name: Some("a".to_string()),
                artist_name: Some("Band".to_string()),
                song_url: None,
                track_info: "Band - a".to_string(),
            }])
            .await;

        clock.advance(ChronoDuration::hours(1));

        let node = cache.node.fetch_one_within("ytsearch:song", DAY).await.unwrap();
        assert_eq!(node.payload.first().unwrap().id(), "a");
        assert_eq!(
            cache.youtube.fetch_one_within("Band - a", DAY).await.unwrap().payload,
            "https://youtu.be/a"
        );
        assert_eq!(
            cache
                .spotify
                .fetch_one_within("spotify:track:sp1", DAY)
                .await
                .unwrap()
                .payload,
            "Band - a"
        );

        assert!(cache.node.fetch_one_within("ytsearch:song", Duration::ZERO).await.is_none());
        assert!(cache.youtube.fetch_one_within("Band - a", Duration::ZERO).await.is_none());
        assert!(cache
            .spotify
            .fetch_one_within("spotify:track:sp1", Duration::ZERO)
            .await
            .is_none());
    }

    #[tokio::test]
    async fn touch_only_moves_last_fetched() {
        let (clock, db, cache) = setup(CacheLevel::all()).await;
        let record = YouTubeRecord {
            track_info: "Band - a".to_string(),
            youtube_url: "https://youtu.be/a".to_string(),
        };
        cache.youtube.insert_or_update(&[record]).await;
        let (updated_before, fetched_before) =
            timestamps(&db, "cache_youtube", "track_info", "Band - a").await;

        clock.advance(ChronoDuration::minutes(10));
        cache.youtube.touch_fetched("Band - a").await;

        let (updated_after, fetched_after) =
            timestamps(&db, "cache_youtube", "track_info", "Band - a").await;
        assert_eq!(updated_after, updated_before);
        assert_eq!(fetched_after, fetched_before + 600);
        assert_eq!(
            cache.youtube.fetch_one("Band - a").await.unwrap().payload,
            "https://youtu.be/a"
        );
    }

    #[tokio::test]
    async fn upsert_keeps_last_fetched() {
        let (clock, db, cache) = setup(CacheLevel::all()).await;
        let record = |url: &str| YouTubeRecord {
            track_info: "Band - a".to_string(),
            youtube_url: url.to_string(),
        };
        cache.youtube.insert_or_update(&[record("https://old")]).await;
        let (_, fetched) = timestamps(&db, "cache_youtube", "track_info", "Band - a").await;

        clock.advance(ChronoDuration::days(3));
        cache.youtube.insert_or_update(&[record("https://new")]).await;

        let (updated, fetched_now) = timestamps(&db, "cache_youtube", "track_info", "Band - a").await;
        assert_eq!(fetched_now, fetched);
        assert_eq!(updated, fetched + 3 * 86_400);
        assert_eq!(
            cache.youtube.fetch_one("Band - a").await.unwrap().payload,
            "https://new"
        );
    }

    #[tokio::test]
    async fn random_pick_respects_fetch_window() {
        let (clock, _db, cache) = setup(CacheLevel::all()).await;
        cache
            .node
            .insert_or_update(&[NodeQueryRecord {
                query: "old".to_string(),
                data: LoadResult::Track(track("old")),
            }])
            .await;

        clock.advance(ChronoDuration::days(2));
        assert!(cache.node.fetch_random(DAY).await.is_none());

        cache.node.touch_fetched("old").await;
        let picked = cache.node.fetch_random(DAY).await.unwrap();
        assert_eq!(picked.first().unwrap().id(), "old");
    }

    #[tokio::test]
    async fn disabled_kind_is_a_permanent_miss() {
        let (_clock, _db, cache) = setup(CacheLevel::NODE | CacheLevel::SPOTIFY).await;
        assert!(!cache.youtube.is_enabled());

        cache
            .youtube
            .insert_or_update(&[YouTubeRecord {
                track_info: "k".to_string(),
                youtube_url: "v".to_string(),
            }])
            .await;
        assert!(cache.youtube.fetch_one("k").await.is_none());
    }

    #[tokio::test]
    async fn startup_eviction_drops_only_stale_rows() {
        let (clock, _db, cache) = setup(CacheLevel::all()).await;
        let record = |key: &str| YouTubeRecord {
            track_info: key.to_string(),
            youtube_url: format!("https://{key}"),
        };
        cache.youtube.insert_or_update(&[record("stale")]).await;
        clock.advance(ChronoDuration::days(400));
        cache.youtube.insert_or_update(&[record("fresh")]).await;

        assert_eq!(cache.evict_expired().await, 1);
        assert!(cache.youtube.fetch_one("fresh").await.is_some());
        assert!(cache.youtube.fetch_one("stale").await.is_none());
    }

    #[test]
    fn cache_level_bits() {
        assert_eq!(CacheLevel::from_bits(0xFF), CacheLevel::all());
        assert!(CacheLevel::from_bits(5).contains(CacheLevel::SPOTIFY));
        assert!(!CacheLevel::from_bits(5).contains(CacheLevel::YOUTUBE));
        assert_eq!(CacheLevel::none().bits(), 0);
    }
}
