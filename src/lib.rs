//! Audio playback infrastructure for Open Music.
//!
//! Supervises an external audio node, caches remote lookups, persists queues
//! for crash recovery and reacts to playback events. The chat layer drives it
//! through [`player::PlayerHost`] and hears back through
//! [`reactor::Notifier`].

pub mod clock;
pub mod config;
pub mod idle;
pub mod node;
pub mod player;
pub mod reactor;
pub mod settings;
pub mod storage;
pub mod subsystem;
pub mod supervisor;

pub use config::Config;
pub use player::{AudioError, PlayerHost};
pub use subsystem::AudioSubsystem;
