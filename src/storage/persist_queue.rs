//! Write-ahead record of enqueued tracks so a restart can rebuild every
//! room's queue in the order it was built.
//!
//! Played rows stay in the table until [`PersistentQueue::reap`] runs at
//! startup, so a crash mid-track never loses the rows that follow it.

use sqlx::sqlite::{SqlitePool, SqliteRow};
use sqlx::Row;
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::{Database, Result};
use crate::clock::Clock;
use crate::node::{ChannelId, RoomId, Track};

/// One row of `persist_queue`.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueRecord {
    pub room_id: ChannelId,
    pub player_id: RoomId,
    pub track_id: String,
    pub track: Track,
    pub played: bool,
    /// Milliseconds since epoch of the first enqueue.
    pub enqueue_time: i64,
}

#[derive(Debug, Clone)]
pub struct PersistentQueue {
    pool: SqlitePool,
    clock: Arc<dyn Clock>,
}

impl PersistentQueue {
    pub fn new(db: &Database, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: db.pool().clone(),
            clock,
        }
    }

    /// Stamps `track` with its enqueue time if it does not carry one yet and
    /// records it as pending. Returns the stamped track.
    pub async fn enqueue(&self, room: ChannelId, player: RoomId, track: &Track) -> Track {
        let mut stamped = track.clone();
        if stamped.user_data.enqueue_time == 0 {
            stamped.user_data.enqueue_time = self.clock.now().timestamp_millis();
        }

        if let Err(e) = self.try_enqueue(room, player, &stamped).await {
            warn!("⚠️ No se pudo persistir '{}' en la sala {}: {}", stamped.title(), player, e);
        }
        stamped
    }

    async fn try_enqueue(&self, room: ChannelId, player: RoomId, track: &Track) -> Result<()> {
        let payload = serde_json::to_string(track)?;
        sqlx::query(
            "INSERT INTO persist_queue (player_id, room_id, track_id, track, played, enqueue_time)
             VALUES (?, ?, ?, ?, 0, ?)
             ON CONFLICT (player_id, room_id, track_id) DO UPDATE SET
                 track = excluded.track,
                 played = 0,
                 enqueue_time = excluded.enqueue_time",
        )
        .bind(player.0 as i64)
        .bind(room.0 as i64)
        .bind(track.id())
        .bind(payload)
        .bind(track.user_data.enqueue_time)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    pub async fn mark_played(&self, player: RoomId, track_id: &str) {
        let result = sqlx::query(
            "UPDATE persist_queue SET played = 1 WHERE player_id = ? AND track_id = ?",
        )
        .bind(player.0 as i64)
        .bind(track_id)
        .execute(&self.pool)
        .await;

        if let Err(e) = result {
            warn!("⚠️ No se pudo marcar como reproducida {} en {}: {}", track_id, player, e);
        }
    }

    /// Flips every row of `player` to played.
    pub async fn drop_room(&self, player: RoomId) {
        let result = sqlx::query("UPDATE persist_queue SET played = 1 WHERE player_id = ?")
            .bind(player.0 as i64)
            .execute(&self.pool)
            .await;

        match result {
            Ok(done) => debug!("Cola persistente de {} descartada ({} filas)", player, done.rows_affected()),
            Err(e) => warn!("⚠️ No se pudo descartar la cola de {}: {}", player, e),
        }
    }

    /// Every unplayed row, oldest enqueue first. Insertion order breaks ties.
    pub async fn fetch_pending(&self) -> Vec<QueueRecord> {
        match self
            .try_fetch("SELECT * FROM persist_queue WHERE played = 0 ORDER BY enqueue_time ASC, rowid ASC")
            .await
        {
            Ok(records) => records,
            Err(e) => {
                warn!("⚠️ No se pudo leer la cola persistente: {}", e);
                Vec::new()
            }
        }
    }

    /// Raw view of the table, played rows included.
    pub async fn scan_all(&self) -> Result<Vec<QueueRecord>> {
        self.try_fetch("SELECT * FROM persist_queue ORDER BY enqueue_time ASC, rowid ASC")
            .await
    }

    async fn try_fetch(&self, sql: &str) -> Result<Vec<QueueRecord>> {
        let rows = sqlx::query(sql).fetch_all(&self.pool).await?;
        let mut records = Vec::with_capacity(rows.len());
        for row in &rows {
            match decode(row) {
                Ok(record) => records.push(record),
                // Una fila corrupta no debe impedir restaurar el resto
                Err(e) => warn!("Fila de cola persistente ilegible ignorada: {}", e),
            }
        }
        Ok(records)
    }

    /// Deletes played rows. Run once at startup.
    pub async fn reap(&self) -> u64 {
        match sqlx::query("DELETE FROM persist_queue WHERE played = 1")
            .execute(&self.pool)
            .await
        {
            Ok(done) => {
                if done.rows_affected() > 0 {
                    info!("🧹 {} pistas reproducidas eliminadas de la cola persistente", done.rows_affected());
                }
                done.rows_affected()
            }
            Err(e) => {
                warn!("⚠️ Limpieza de la cola persistente falló: {}", e);
                0
            }
        }
    }

    /// Deletes every row, pending ones included.
    pub async fn full_wipe(&self) -> Result<u64> {
        let done = sqlx::query("DELETE FROM persist_queue")
            .execute(&self.pool)
            .await?;
        info!("🧹 Cola persistente vaciada ({} filas)", done.rows_affected());
        Ok(done.rows_affected())
    }
}

fn decode(row: &SqliteRow) -> Result<QueueRecord> {
    let raw: String = row.try_get("track")?;
    Ok(QueueRecord {
        room_id: ChannelId(row.try_get::<i64, _>("room_id")? as u64),
        player_id: RoomId(row.try_get::<i64, _>("player_id")? as u64),
        track_id: row.try_get("track_id")?,
        track: serde_json::from_str(&raw)?,
        played: row.try_get("played")?,
        enqueue_time: row.try_get("enqueue_time")?,
    })
}
