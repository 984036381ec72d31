use serde::{Deserialize, Deserializer, Serialize};
use std::fmt;
use std::time::Duration;

/// Playback session key. One room has one queue, one player on the node and
/// one set of settings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize)]
pub struct RoomId(pub u64);

/// Voice channel a room is playing in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChannelId(pub u64);

impl fmt::Display for RoomId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ChannelId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

// El nodo envía los ids de guild como string
impl<'de> Deserialize<'de> for RoomId {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        #[derive(Deserialize)]
        #[serde(untagged)]
        enum Raw {
            Num(u64),
            Str(String),
        }

        match Raw::deserialize(deserializer)? {
            Raw::Num(id) => Ok(RoomId(id)),
            Raw::Str(s) => s.parse().map(RoomId).map_err(serde::de::Error::custom),
        }
    }
}

/// A playable track as returned by the node. `encoded` is opaque to us and
/// is what the node needs to play it back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Track {
    pub encoded: String,
    pub info: TrackInfo,
    #[serde(default)]
    pub user_data: TrackExtras,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackInfo {
    pub identifier: String,
    #[serde(default)]
    pub is_seekable: bool,
    #[serde(default)]
    pub author: String,
    /// Duración en milisegundos
    #[serde(default)]
    pub length: u64,
    #[serde(default)]
    pub is_stream: bool,
    #[serde(default)]
    pub position: u64,
    pub title: String,
    #[serde(default)]
    pub uri: Option<String>,
    #[serde(default)]
    pub artwork_url: Option<String>,
    #[serde(default)]
    pub isrc: Option<String>,
    #[serde(default)]
    pub source_name: String,
}

/// Our own bookkeeping, stored in the node's `userData` so it survives the
/// round trip through the node and the persistent queue.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct TrackExtras {
    pub requester: u64,
    /// Milisegundos desde epoch; 0 = todavía no encolado
    pub enqueue_time: i64,
    pub autoplay: bool,
}

impl Track {
    pub fn id(&self) -> &str {
        &self.info.identifier
    }

    pub fn title(&self) -> &str {
        &self.info.title
    }

    pub fn duration(&self) -> Option<Duration> {
        if self.info.is_stream {
            None
        } else {
            Some(Duration::from_millis(self.info.length))
        }
    }

    /// "Artist - Title", used as the lookup key for the youtube table.
    pub fn description(&self) -> String {
        if self.info.author.is_empty() {
            self.info.title.clone()
        } else {
            format!("{} - {}", self.info.author, self.info.title)
        }
    }

    /// Two tracks are the same song when the node gives them the same payload.
    pub fn same_as(&self, other: &Track) -> bool {
        self.encoded == other.encoded
    }
}

/// Result of `GET /v4/loadtracks`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "loadType", content = "data", rename_all = "lowercase")]
pub enum LoadResult {
    Track(Track),
    Playlist(PlaylistData),
    Search(Vec<Track>),
    Empty {},
    Error(LoadException),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaylistData {
    pub info: PlaylistInfo,
    pub tracks: Vec<Track>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlaylistInfo {
    pub name: String,
    #[serde(default = "no_selection")]
    pub selected_track: i64,
}

fn no_selection() -> i64 {
    -1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoadException {
    #[serde(default)]
    pub message: Option<String>,
    #[serde(default)]
    pub severity: String,
    #[serde(default)]
    pub cause: String,
}

impl LoadResult {
    /// Only real hits are worth caching; empty and error results are not.
    pub fn is_cacheable(&self) -> bool {
        match self {
            LoadResult::Track(_) => true,
            LoadResult::Playlist(data) => !data.tracks.is_empty(),
            LoadResult::Search(tracks) => !tracks.is_empty(),
            LoadResult::Empty {} | LoadResult::Error(_) => false,
        }
    }

    pub fn tracks(&self) -> Vec<Track> {
        match self {
            LoadResult::Track(track) => vec![track.clone()],
            LoadResult::Playlist(data) => data.tracks.clone(),
            LoadResult::Search(tracks) => tracks.clone(),
            LoadResult::Empty {} | LoadResult::Error(_) => Vec::new(),
        }
    }

    /// First track to play: the selected one for playlists, the top hit for
    /// searches.
    pub fn first(&self) -> Option<Track> {
        match self {
            LoadResult::Track(track) => Some(track.clone()),
            LoadResult::Playlist(data) => {
                let selected = usize::try_from(data.info.selected_track).ok();
                selected
                    .and_then(|i| data.tracks.get(i))
                    .or_else(|| data.tracks.first())
                    .cloned()
            }
            LoadResult::Search(tracks) => tracks.first().cloned(),
            LoadResult::Empty {} | LoadResult::Error(_) => None,
        }
    }
}

/// Voice connection details forwarded by the chat layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct VoiceState {
    pub token: String,
    pub endpoint: String,
    pub session_id: String,
}
