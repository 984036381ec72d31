use std::collections::VecDeque;
use std::time::Duration;
use tracing::{debug, info};

use crate::node::Track;

/// In-memory play order of one room. Strict FIFO.
#[derive(Debug, Clone)]
pub struct RoomQueue {
    items: VecDeque<Track>,
    current: Option<Track>,
    max_size: usize,
}

/// Plain-data view handed to the command layer.
#[derive(Debug, Clone, PartialEq)]
pub struct QueueSnapshot {
    pub current: Option<Track>,
    pub items: Vec<Track>,
    pub total_duration: Duration,
    /// Any stream in the queue makes the total open-ended.
    pub has_streams: bool,
}

impl RoomQueue {
    pub fn new(max_size: usize) -> Self {
        Self {
            items: VecDeque::new(),
            current: None,
            max_size: max_size.max(1),
        }
    }

    pub fn set_max_size(&mut self, max_size: usize) {
        self.max_size = max_size.max(1);
    }

    pub fn max_size(&self) -> usize {
        self.max_size
    }

    pub fn is_full(&self) -> bool {
        self.items.len() >= self.max_size
    }

    /// Agrega un track a la cola; devuelve false si está llena
    pub fn push(&mut self, track: Track) -> bool {
        if self.is_full() {
            return false;
        }
        debug!("➕ Agregado a la cola: {}", track.title());
        self.items.push_back(track);
        true
    }

    /// Pops the next track into `current`. The previous current is discarded.
    pub fn advance(&mut self) -> Option<Track> {
        self.current = self.items.pop_front();
        match &self.current {
            Some(track) => info!("➡️ Siguiente en cola: {}", track.title()),
            None => debug!("📭 Cola vacía, no hay siguiente track"),
        }
        self.current.clone()
    }

    pub fn current(&self) -> Option<&Track> {
        self.current.as_ref()
    }

    pub fn clear_current(&mut self) {
        self.current = None;
    }

    /// Puts `current` back at the head of the queue, as if it never started.
    pub fn requeue_current(&mut self) {
        if let Some(track) = self.current.take() {
            self.items.push_front(track);
        }
    }

    /// Removes every queued copy of `track`. Returns how many were removed.
    pub fn remove_track(&mut self, track: &Track) -> usize {
        let before = self.items.len();
        self.items.retain(|item| !item.same_as(track));
        before - self.items.len()
    }

    /// Limpia la cola y el track actual
    pub fn clear(&mut self) {
        self.items.clear();
        self.current = None;
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    pub fn snapshot(&self) -> QueueSnapshot {
        let all = self.current.iter().chain(self.items.iter());
        let mut total_duration = Duration::ZERO;
        let mut has_streams = false;
        for track in all {
            match track.duration() {
                Some(duration) => total_duration += duration,
                None => has_streams = true,
            }
        }

        QueueSnapshot {
            current: self.current.clone(),
            items: self.items.iter().cloned().collect(),
            total_duration,
            has_streams,
        }
    }
}
