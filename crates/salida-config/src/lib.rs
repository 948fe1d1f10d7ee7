//! Salida Config - renderer settings
//!
//! A serde-backed settings record ([`Settings`]) with TOML persistence and
//! a shared, serial-versioned store ([`SettingsStore`]) the renderer and UI
//! layers both talk to. Consumers cache [`SettingsStore::serial`] and
//! reconfigure when it moves, so settings changes propagate without
//! callbacks into the audio path.
//!
//! ```rust
//! use salida_config::{CrossfeedSettings, SettingsStore};
//!
//! let store = SettingsStore::default();
//! let before = store.serial();
//!
//! store.update(|s| s.crossfeed = CrossfeedSettings::jmeier(true));
//! assert!(store.serial() > before);
//! ```

mod error;
mod settings;

pub use error::{ConfigError, Result};
pub use settings::{
    CrossfeedSettings, OutputDeviceSettings, Settings, SettingsStore, BUFFER_MS_RANGE,
    CROSSFEED_CUTOFF_RANGE, CROSSFEED_LEVEL_RANGE, DEFAULT_BUFFER_MS,
};
