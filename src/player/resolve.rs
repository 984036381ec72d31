use std::sync::Arc;
use tracing::{debug, info};
use url::Url;

use super::AudioError;
use crate::node::{LoadResult, NodeClient};
use crate::storage::cache::{LocalCache, NodeQueryRecord, SpotifyRecord, YouTubeRecord};

/// Prefix the node understands as "search youtube for this text".
pub const SEARCH_PREFIX: &str = "ytsearch:";

/// Turns a user query into node tracks, asking the local cache before the
/// node:
///
/// spotify uri → `cache_spotify` → `cache_youtube` → `cache_node` → node
#[derive(Debug, Clone)]
pub struct QueryResolver {
    cache: Arc<LocalCache>,
}

/// Where a query ends up before it reaches the node.
#[derive(Debug, Clone, PartialEq, Eq)]
enum Lookup {
    /// Free text, searched as "artist - title".
    Text(String),
    /// Anything the node can load directly.
    Identifier(String),
}

impl QueryResolver {
    pub fn new(cache: Arc<LocalCache>) -> Self {
        Self { cache }
    }

    pub fn cache(&self) -> &LocalCache {
        &self.cache
    }

    pub async fn resolve(&self, node: &dyn NodeClient, query: &str) -> Result<LoadResult, AudioError> {
        let query = query.trim();
        if query.is_empty() {
            return Err(AudioError::NoResults(String::new()));
        }

        let lookup = match spotify_uri(query) {
            Some(uri) => self.lookup_spotify(uri).await,
            None if looks_like_url(query) => Lookup::Identifier(query.to_string()),
            None => Lookup::Text(query.to_string()),
        };

        let (identifier, search_text) = match lookup {
            Lookup::Identifier(id) => (id, None),
            Lookup::Text(text) => match self.cache.youtube.fetch_one(&text).await {
                Some(hit) => {
                    self.cache.youtube.touch_fetched(&text).await;
                    debug!("Caché youtube: '{}' → {}", text, hit.payload);
                    (hit.payload, None)
                }
                None => (format!("{SEARCH_PREFIX}{text}"), Some(text)),
            },
        };

        if let Some(hit) = self.cache.node.fetch_one(&identifier).await {
            self.cache.node.touch_fetched(&identifier).await;
            debug!("Caché del nodo: '{}'", identifier);
            return Ok(hit.payload);
        }

        let result = node.load_tracks(&identifier).await?;
        match &result {
            LoadResult::Error(exception) => {
                return Err(AudioError::LoadFailed(
                    exception
                        .message
                        .clone()
                        .unwrap_or_else(|| exception.cause.clone()),
                ));
            }
            LoadResult::Empty {} => return Err(AudioError::NoResults(query.to_string())),
            _ => {}
        }

        if result.is_cacheable() {
            self.cache
                .node
                .insert_or_update(&[NodeQueryRecord {
                    query: identifier.clone(),
                    data: result.clone(),
                }])
                .await;

            // Recordar qué URL resolvió la búsqueda de texto
            if let (Some(text), Some(uri)) = (search_text, result.first().and_then(|t| t.info.uri)) {
                self.cache
                    .youtube
                    .insert_or_update(&[YouTubeRecord {
                        track_info: text,
                        youtube_url: uri,
                    }])
                    .await;
            }
        }

        info!("🔎 '{}' resuelto por el nodo ({} pistas)", identifier, result.tracks().len());
        Ok(result)
    }

    /// Stores spotify metadata gathered by the command layer so later lookups
    /// of the same uri skip the remote API.
    pub async fn remember_spotify(&self, records: &[SpotifyRecord]) {
        self.cache.spotify.insert_or_update(records).await;
    }

    async fn lookup_spotify(&self, uri: String) -> Lookup {
        match self.cache.spotify.fetch_one(&uri).await {
            Some(hit) => {
                self.cache.spotify.touch_fetched(&uri).await;
                Lookup::Text(hit.payload)
            }
            // Sin metadatos locales; el nodo puede tener un plugin que lo entienda
            None => Lookup::Identifier(uri),
        }
    }
}

fn looks_like_url(query: &str) -> bool {
    Url::parse(query).is_ok_and(|url| matches!(url.scheme(), "http" | "https"))
        || query.contains(':') && !query.contains(' ')
}

/// Normalises spotify links and uris to `spotify:<kind>:<id>`.
fn spotify_uri(query: &str) -> Option<String> {
    if let Some(rest) = query.strip_prefix("spotify:") {
        let mut parts = rest.split(':');
        let kind = parts.next()?;
        let id = parts.next()?;
        return Some(format!("spotify:{kind}:{id}"));
    }

    let url = Url::parse(query).ok()?;
    if url.host_str()? != "open.spotify.com" {
        return None;
    }
    let mut segments = url.path_segments()?.filter(|s| !s.is_empty() && !s.starts_with("intl-"));
    let kind = segments.next()?;
    let id = segments.next()?;
    Some(format!("spotify:{kind}:{id}"))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::node::{MockNodeClient, Track, TrackExtras, TrackInfo};
    use crate::storage::{CacheLevel, Database};
    use std::time::Duration;

    fn track(id: &str, uri: &str) -> Track {
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
                uri: Some(uri.to_string()),
                artwork_url: None,
                isrc: None,
                source_name: "youtube".to_string(),
            },
            user_data: TrackExtras::default(),
        }
    }

    async fn resolver() -> QueryResolver {
        let db = Database::in_memory().await.unwrap();
        let clock = Arc::new(ManualClock::default());
        let cache = LocalCache::new(&db, clock, Duration::from_secs(86_400), CacheLevel::all());
        QueryResolver::new(Arc::new(cache))
    }

    #[test]
    fn normalises_spotify_links() {
        assert_eq!(
            spotify_uri("https://open.spotify.com/track/abc123?si=xyz").as_deref(),
            Some("spotify:track:abc123")
        );
        assert_eq!(
            spotify_uri("https://open.spotify.com/intl-es/track/abc123").as_deref(),
            Some("spotify:track:abc123")
        );
        assert_eq!(spotify_uri("spotify:track:abc123").as_deref(), Some("spotify:track:abc123"));
        assert_eq!(spotify_uri("https://youtube.com/watch?v=1"), None);
        assert!(looks_like_url("https://youtube.com/watch?v=1"));
        assert!(!looks_like_url("never gonna give you up"));
    }

    #[tokio::test]
    async fn second_lookup_is_served_from_cache() {
        let resolver = resolver().await;
        let mut node = MockNodeClient::new();
        node.expect_load_tracks()
            .withf(|id| id == "ytsearch:Band - a")
            .times(1)
            .returning(|_| Ok(LoadResult::Search(vec![track("a", "https://youtu.be/a")])));
        node.expect_load_tracks()
            .withf(|id| id == "https://youtu.be/a")
            .times(1)
            .returning(|_| Ok(LoadResult::Track(track("a", "https://youtu.be/a"))));

        let first = resolver.resolve(&node, "Band - a").await.unwrap();
        assert_eq!(first.first().unwrap().id(), "a");

        // El texto ya está en la caché youtube, así que se carga la URL directa
        let second = resolver.resolve(&node, "Band - a").await.unwrap();
        assert_eq!(second.first().unwrap().id(), "a");

        // Y la URL ya está en la caché del nodo
        let third = resolver.resolve(&node, "Band - a").await.unwrap();
        assert_eq!(third, second);
    }

    #[tokio::test]
    async fn spotify_hit_goes_through_youtube_search() {
        let resolver = resolver().await;
        resolver
            .remember_spotify(&[SpotifyRecord {
                id: "abc".to_string(),
                kind: "track".to_string(),
                uri: "spotify:track:abc".to_string(),
                track_name: Some("a".to_string()),
                artist_name: Some("Band".to_string()),
                song_url: None,
                track_info: "Band - a".to_string(),
            }])
            .await;

        let mut node = MockNodeClient::new();
        node.expect_load_tracks()
            .withf(|id| id == "ytsearch:Band - a")
            .times(1)
            .returning(|_| Ok(LoadResult::Search(vec![track("a", "https://youtu.be/a")])));

        let result = resolver
            .resolve(&node, "https://open.spotify.com/track/abc")
            .await
            .unwrap();
        assert_eq!(result.first().unwrap().id(), "a");
    }

    #[tokio::test]
    async fn empty_results_are_not_cached() {
        let resolver = resolver().await;
        let mut node = MockNodeClient::new();
        node.expect_load_tracks()
            .times(2)
            .returning(|_| Ok(LoadResult::Empty {}));

        for _ in 0..2 {
            let err = resolver.resolve(&node, "nothing here").await.unwrap_err();
            assert!(matches!(err, AudioError::NoResults(_)));
        }
    }
}
