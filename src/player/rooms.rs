use chrono::{DateTime, Utc};
use dashmap::DashMap;
use std::collections::HashSet;
use std::time::Duration;

use super::queue::RoomQueue;
use crate::node::{ChannelId, RoomId, Track};

/// Consecutive track failures of one room.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ErrorCounter {
    count: u32,
    last_error_at: Option<DateTime<Utc>>,
    too_many: bool,
}

/// What to do about a failed track.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FailureVerdict {
    /// Notify and move on to the next track.
    SkipAndContinue,
    /// Threshold reached: disconnect the room and clear its queue.
    TooMany,
    /// The room is already being torn down; nothing more to do.
    AlreadyEscalated,
}

impl ErrorCounter {
    pub fn count(&self) -> u32 {
        self.count
    }

    pub fn is_escalated(&self) -> bool {
        self.too_many
    }

    pub fn reset(&mut self) {
        *self = Self::default();
    }

    /// Forgets old failures once `window` has passed without a new one.
    pub fn decay(&mut self, now: DateTime<Utc>, window: Duration) {
        if self.too_many {
            return;
        }
        let expired = self.last_error_at.is_some_and(|last| {
            now.signed_duration_since(last).to_std().unwrap_or_default() > window
        });
        if expired {
            self.count = 0;
            self.last_error_at = None;
        }
    }

    pub fn record_failure(&mut self, now: DateTime<Utc>, threshold: u32) -> FailureVerdict {
        if self.too_many {
            return FailureVerdict::AlreadyEscalated;
        }

        self.count += 1;
        self.last_error_at = Some(now);
        if self.count >= threshold {
            self.too_many = true;
            FailureVerdict::TooMany
        } else {
            FailureVerdict::SkipAndContinue
        }
    }
}

/// When the room lost its last human listener and what we did about it.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct IdleClock {
    pub empty_since: Option<DateTime<Utc>>,
    pub paused_for_no_humans: bool,
}

/// Everything the subsystem tracks about one room.
#[derive(Debug, Clone)]
pub struct RoomState {
    pub room: RoomId,
    pub channel: ChannelId,
    pub notify_channel: Option<ChannelId>,
    pub queue: RoomQueue,
    pub prev_track: Option<Track>,
    pub errors: ErrorCounter,
    pub skip_votes: HashSet<u64>,
    pub idle: IdleClock,
    pub paused: bool,
    pub volume: u16,
    pub autoplaying: bool,
}

impl RoomState {
    pub fn new(room: RoomId, channel: ChannelId, volume: u16, max_queue_size: usize) -> Self {
        Self {
            room,
            channel,
            notify_channel: None,
            queue: RoomQueue::new(max_queue_size),
            prev_track: None,
            errors: ErrorCounter::default(),
            skip_votes: HashSet::new(),
            idle: IdleClock::default(),
            paused: false,
            volume,
            autoplaying: false,
        }
    }

    pub fn is_playing(&self) -> bool {
        self.queue.current().is_some() && !self.paused
    }
}

/// Owner of every [`RoomState`]. Closures run under the map's shard lock, so
/// they must stay short and never await.
#[derive(Debug, Default)]
pub struct RoomManager {
    rooms: DashMap<RoomId, RoomState>,
}

impl RoomManager {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn contains(&self, room: RoomId) -> bool {
        self.rooms.contains_key(&room)
    }

    /// Inserts `state` unless the room already exists. Returns whether it was
    /// inserted.
    pub fn insert_if_absent(&self, state: RoomState) -> bool {
        match self.rooms.entry(state.room) {
            dashmap::mapref::entry::Entry::Occupied(_) => false,
            dashmap::mapref::entry::Entry::Vacant(slot) => {
                slot.insert(state);
                true
            }
        }
    }

    pub fn remove(&self, room: RoomId) -> Option<RoomState> {
        self.rooms.remove(&room).map(|(_, state)| state)
    }

    pub fn update<R>(&self, room: RoomId, f: impl FnOnce(&mut RoomState) -> R) -> Option<R> {
        self.rooms.get_mut(&room).map(|mut state| f(&mut state))
    }

    pub fn read<R>(&self, room: RoomId, f: impl FnOnce(&RoomState) -> R) -> Option<R> {
        self.rooms.get(&room).map(|state| f(&state))
    }

    pub fn ids(&self) -> Vec<RoomId> {
        let mut ids: Vec<_> = self.rooms.iter().map(|entry| *entry.key()).collect();
        ids.sort();
        ids
    }

    pub fn len(&self) -> usize {
        self.rooms.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rooms.is_empty()
    }

    pub fn playing_count(&self) -> usize {
        self.rooms.iter().filter(|entry| entry.is_playing()).count()
    }
}
