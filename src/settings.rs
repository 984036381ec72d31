use anyhow::Result;
use dashmap::DashMap;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::fs;
use tracing::{info, warn};

use crate::config::Config;
use crate::node::RoomId;

/// Preferencias de una sala almacenadas en JSON
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoomSettings {
    pub auto_play: bool,
    pub notify: bool,
    pub disconnect_on_queue_end: bool,
    pub emptydc_enabled: bool,
    pub emptydc_timer: u64, // seconds
    pub emptypause_enabled: bool,
    pub emptypause_timer: u64, // seconds
    pub persist_queue: bool,
    pub volume: u16,
    pub max_queue_size: usize,
}

impl Default for RoomSettings {
    fn default() -> Self {
        Self {
            auto_play: false,
            notify: false,
            disconnect_on_queue_end: false,
            emptydc_enabled: false,
            emptydc_timer: 0,
            emptypause_enabled: false,
            emptypause_timer: 0,
            persist_queue: true,
            volume: 100,
            max_queue_size: 1000,
        }
    }
}

impl RoomSettings {
    pub fn from_config(config: &Config) -> Self {
        Self {
            auto_play: config.auto_play,
            notify: config.notify,
            disconnect_on_queue_end: config.disconnect_on_queue_end,
            emptydc_enabled: config.emptydc_enabled,
            emptydc_timer: config.emptydc_timer,
            emptypause_enabled: config.emptypause_enabled,
            emptypause_timer: config.emptypause_timer,
            persist_queue: true,
            volume: config.default_volume,
            max_queue_size: config.max_queue_size,
        }
    }
}

/// Per-room settings, one JSON file per room under `rooms/`, cached in memory.
///
/// Rooms without a file get the defaults; nothing is written until a setting
/// actually changes.
pub struct RoomSettingsStore {
    rooms_dir: PathBuf,
    defaults: RoomSettings,
    cache: DashMap<RoomId, RoomSettings>,
}

impl RoomSettingsStore {
    pub async fn new(data_dir: PathBuf, defaults: RoomSettings) -> Result<Self> {
        let rooms_dir = data_dir.join("rooms");
        fs::create_dir_all(&rooms_dir).await?;

        let store = Self {
            rooms_dir,
            defaults,
            cache: DashMap::new(),
        };
        store.load_all().await?;

        info!("📁 Ajustes de salas en: {}", store.rooms_dir.display());
        Ok(store)
    }

    /// Returns the settings for `room`, falling back to the defaults.
    pub async fn get(&self, room: RoomId) -> RoomSettings {
        if let Some(settings) = self.cache.get(&room) {
            return settings.clone();
        }

        match self.load(room).await {
            Ok(Some(settings)) => {
                self.cache.insert(room, settings.clone());
                settings
            }
            Ok(None) => self.defaults.clone(),
            Err(e) => {
                warn!("Error cargando ajustes de la sala {}: {}", room, e);
                self.defaults.clone()
            }
        }
    }

    /// Applies `change` to the room's settings and writes them back.
    pub async fn update<F>(&self, room: RoomId, change: F) -> Result<RoomSettings>
    where
        F: FnOnce(&mut RoomSettings),
    {
        let mut settings = self.get(room).await;
        change(&mut settings);
        settings.volume = settings.volume.min(1000);

        self.save(room, &settings).await?;
        self.cache.insert(room, settings.clone());

        info!("💾 Ajustes actualizados para la sala {}", room);
        Ok(settings)
    }

    pub async fn remove(&self, room: RoomId) -> Result<()> {
        self.cache.remove(&room);
        match fs::remove_file(self.file_path(room)).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    pub fn known_rooms(&self) -> Vec<RoomId> {
        self.cache.iter().map(|entry| *entry.key()).collect()
    }

    // Métodos privados

    async fn load(&self, room: RoomId) -> Result<Option<RoomSettings>> {
        let content = match fs::read_to_string(self.file_path(room)).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Ok(Some(serde_json::from_str(&content)?))
    }

    async fn save(&self, room: RoomId, settings: &RoomSettings) -> Result<()> {
        let content = serde_json::to_string_pretty(settings)?;
        // Escribir primero a un temporal para no dejar JSON a medias
        let tmp = self.file_path(room).with_extension("json.tmp");
        fs::write(&tmp, content).await?;
        fs::rename(&tmp, self.file_path(room)).await?;
        Ok(())
    }

    async fn load_all(&self) -> Result<()> {
        let mut files = fs::read_dir(&self.rooms_dir).await?;
        let mut loaded = 0;

        while let Some(entry) = files.next_entry().await? {
            let path = entry.path();
            if path.extension().map_or(true, |ext| ext != "json") {
                continue;
            }

            let room = path
                .file_stem()
                .and_then(|n| n.to_str())
                .and_then(|n| n.strip_prefix("room_"))
                .and_then(|id| id.parse::<u64>().ok())
                .map(RoomId);

            if let Some(room) = room {
                match self.load(room).await {
                    Ok(Some(settings)) => {
                        self.cache.insert(room, settings);
                        loaded += 1;
                    }
                    Ok(None) => {}
                    Err(e) => warn!("Error cargando ajustes de la sala {}: {}", room, e),
                }
            }
        }

        if loaded > 0 {
            info!("📂 Cargados ajustes de {} salas", loaded);
        }
        Ok(())
    }

    fn file_path(&self, room: RoomId) -> PathBuf {
        self.rooms_dir.join(format!("room_{}.json", room))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[tokio::test]
    async fn unknown_room_gets_defaults_without_writing() {
        let dir = tempfile::tempdir().unwrap();
        let defaults = RoomSettings {
            auto_play: true,
            ..RoomSettings::default()
        };
        let store = RoomSettingsStore::new(dir.path().to_path_buf(), defaults.clone())
            .await
            .unwrap();

        assert_eq!(store.get(RoomId(1)).await, defaults);
        assert!(!dir.path().join("rooms/room_1.json").exists());
    }

    #[tokio::test]
    async fn updates_survive_reload() {
        let dir = tempfile::tempdir().unwrap();
        let store = RoomSettingsStore::new(dir.path().to_path_buf(), RoomSettings::default())
            .await
            .unwrap();

        store
            .update(RoomId(5), |s| {
                s.emptydc_enabled = true;
                s.emptydc_timer = 30;
                s.volume = 5000;
            })
            .await
            .unwrap();

        let reopened = RoomSettingsStore::new(dir.path().to_path_buf(), RoomSettings::default())
            .await
            .unwrap();
        let settings = reopened.get(RoomId(5)).await;
        assert!(settings.emptydc_enabled);
        assert_eq!(settings.emptydc_timer, 30);
        assert_eq!(settings.volume, 1000);
        assert_eq!(reopened.known_rooms(), vec![RoomId(5)]);
    }
}
