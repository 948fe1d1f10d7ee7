//! The settings record and the serial-versioned store.

use std::path::Path;
use std::sync::atomic::{AtomicU32, Ordering};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::{ConfigError, Result};

/// Default device buffer duration in milliseconds.
pub const DEFAULT_BUFFER_MS: u32 = 200;

/// Accepted device buffer range in milliseconds.
pub const BUFFER_MS_RANGE: (u32, u32) = (20, 1000);

/// Accepted crossfeed cutoff range in Hz.
pub const CROSSFEED_CUTOFF_RANGE: (u32, u32) = (300, 2000);

/// Accepted crossfeed level range, in tenths of a dB.
pub const CROSSFEED_LEVEL_RANGE: (u32, u32) = (10, 150);

/// Output endpoint selection.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct OutputDeviceSettings {
    /// Endpoint id, or `None` for the system default render endpoint.
    pub endpoint_id: Option<String>,
    /// Open the endpoint exclusively.
    pub exclusive: bool,
    /// Target device buffer duration in milliseconds.
    pub buffer_ms: u32,
}

impl Default for OutputDeviceSettings {
    fn default() -> OutputDeviceSettings {
        OutputDeviceSettings {
            endpoint_id: None,
            exclusive: false,
            buffer_ms: DEFAULT_BUFFER_MS,
        }
    }
}

/// Crossfeed configuration.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CrossfeedSettings {
    /// Whether the crossfeed stage runs at all.
    pub enabled: bool,
    /// Lowpass cutoff of the cross path in Hz.
    pub cutoff_hz: u32,
    /// Feed level in tenths of a dB.
    pub level: u32,
}

impl Default for CrossfeedSettings {
    fn default() -> CrossfeedSettings {
        CrossfeedSettings::cmoy(false)
    }
}

impl CrossfeedSettings {
    /// The Chu Moy preset: 700 Hz cutoff, 6 dB feed.
    pub fn cmoy(enabled: bool) -> CrossfeedSettings {
        CrossfeedSettings {
            enabled,
            cutoff_hz: 700,
            level: 60,
        }
    }

    /// The Jan Meier preset: 650 Hz cutoff, 9.5 dB feed.
    pub fn jmeier(enabled: bool) -> CrossfeedSettings {
        CrossfeedSettings {
            enabled,
            cutoff_hz: 650,
            level: 95,
        }
    }
}

/// The full renderer settings record.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct Settings {
    /// Output endpoint selection.
    pub device: OutputDeviceSettings,
    /// Allow passing compressed bitstreams straight to the endpoint.
    pub allow_bitstreaming: bool,
    /// Crossfeed configuration.
    pub crossfeed: CrossfeedSettings,
    /// Run the peak limiter in shared mode (0.98 headroom limit).
    pub peak_limiter_shared_mode: bool,
}

impl Default for Settings {
    fn default() -> Settings {
        Settings {
            device: OutputDeviceSettings::default(),
            allow_bitstreaming: false,
            crossfeed: CrossfeedSettings::default(),
            peak_limiter_shared_mode: true,
        }
    }
}

fn clamp_range(value: u32, range: (u32, u32)) -> u32 {
    value.clamp(range.0, range.1)
}

impl Settings {
    /// Clamp every field into its accepted range.
    pub fn validate(&mut self) {
        if self.device.buffer_ms == 0 {
            self.device.buffer_ms = DEFAULT_BUFFER_MS;
        }
        self.device.buffer_ms = clamp_range(self.device.buffer_ms, BUFFER_MS_RANGE);
        self.crossfeed.cutoff_hz = clamp_range(self.crossfeed.cutoff_hz, CROSSFEED_CUTOFF_RANGE);
        self.crossfeed.level = clamp_range(self.crossfeed.level, CROSSFEED_LEVEL_RANGE);
    }

    /// Parse settings from TOML, clamping out-of-range values.
    pub fn from_toml(text: &str) -> Result<Settings> {
        let mut settings: Settings = toml::from_str(text)?;
        settings.validate();
        Ok(settings)
    }

    /// Serialize settings to TOML.
    pub fn to_toml(&self) -> Result<String> {
        Ok(toml::to_string_pretty(self)?)
    }

    /// Load settings from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Settings> {
        let path = path.as_ref();
        let text = std::fs::read_to_string(path).map_err(|source| ConfigError::ReadFile {
            path: path.to_path_buf(),
            source,
        })?;
        Settings::from_toml(&text)
    }

    /// Save settings to a TOML file.
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();
        std::fs::write(path, self.to_toml()?).map_err(|source| ConfigError::WriteFile {
            path: path.to_path_buf(),
            source,
        })
    }
}

/// Shared, serial-versioned settings store.
///
/// The renderer and its DSP stages cache the serial and re-read their
/// configuration when it moves; every mutation through
/// [`update`](SettingsStore::update) bumps it.
pub struct SettingsStore {
    inner: RwLock<Settings>,
    serial: AtomicU32,
}

impl Default for SettingsStore {
    fn default() -> SettingsStore {
        SettingsStore::new(Settings::default())
    }
}

impl SettingsStore {
    /// Create a store, clamping the initial record into range.
    pub fn new(mut settings: Settings) -> SettingsStore {
        settings.validate();
        SettingsStore {
            inner: RwLock::new(settings),
            serial: AtomicU32::new(1),
        }
    }

    /// Current mutation serial; increases on every update.
    pub fn serial(&self) -> u32 {
        self.serial.load(Ordering::Acquire)
    }

    /// A copy of the full record.
    pub fn snapshot(&self) -> Settings {
        self.inner.read().clone()
    }

    /// Mutate the record, clamp it, and bump the serial.
    pub fn update(&self, mutate: impl FnOnce(&mut Settings)) {
        let mut guard = self.inner.write();
        mutate(&mut guard);
        guard.validate();
        self.serial.fetch_add(1, Ordering::AcqRel);
    }

    /// Output device selection: `(endpoint id, exclusive, buffer ms)`.
    pub fn output_device(&self) -> (Option<String>, bool, u32) {
        let guard = self.inner.read();
        (
            guard.device.endpoint_id.clone(),
            guard.device.exclusive,
            guard.device.buffer_ms,
        )
    }

    /// Whether compressed bitstreams may pass through.
    pub fn allow_bitstreaming(&self) -> bool {
        self.inner.read().allow_bitstreaming
    }

    /// Crossfeed configuration.
    pub fn crossfeed(&self) -> CrossfeedSettings {
        self.inner.read().crossfeed
    }

    /// Whether the peak limiter runs in shared mode.
    pub fn peak_limiter_shared_mode(&self) -> bool {
        self.inner.read().peak_limiter_shared_mode
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = Settings::default();
        assert_eq!(settings.device.buffer_ms, 200);
        assert!(!settings.device.exclusive);
        assert!(!settings.allow_bitstreaming);
        assert!(!settings.crossfeed.enabled);
        assert_eq!(settings.crossfeed.cutoff_hz, 700);
        assert_eq!(settings.crossfeed.level, 60);
        assert!(settings.peak_limiter_shared_mode);
    }

    #[test]
    fn test_presets() {
        let cmoy = CrossfeedSettings::cmoy(true);
        assert_eq!((cmoy.cutoff_hz, cmoy.level), (700, 60));
        let jmeier = CrossfeedSettings::jmeier(true);
        assert_eq!((jmeier.cutoff_hz, jmeier.level), (650, 95));
    }

    #[test]
    fn test_validation_clamps() {
        let mut settings = Settings::default();
        settings.crossfeed.cutoff_hz = 10_000;
        settings.crossfeed.level = 1;
        settings.device.buffer_ms = 0;
        settings.validate();
        assert_eq!(settings.crossfeed.cutoff_hz, 2000);
        assert_eq!(settings.crossfeed.level, 10);
        assert_eq!(settings.device.buffer_ms, 200);
    }

    #[test]
    fn test_serial_bumps_on_update() {
        let store = SettingsStore::default();
        let before = store.serial();
        store.update(|s| s.crossfeed.enabled = true);
        assert!(store.serial() > before);
        assert!(store.crossfeed().enabled);
    }

    #[test]
    fn test_toml_round_trip() {
        let mut settings = Settings::default();
        settings.device.endpoint_id = Some("speakers-1".to_string());
        settings.device.exclusive = true;
        settings.crossfeed = CrossfeedSettings::jmeier(true);

        let text = settings.to_toml().unwrap();
        let parsed = Settings::from_toml(&text).unwrap();
        assert_eq!(parsed, settings);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed = Settings::from_toml("allow_bitstreaming = true\n").unwrap();
        assert!(parsed.allow_bitstreaming);
        assert_eq!(parsed.device.buffer_ms, DEFAULT_BUFFER_MS);
    }

    #[test]
    fn test_load_save_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("salida.toml");

        let mut settings = Settings::default();
        settings.device.buffer_ms = 100;
        settings.save(&path).unwrap();

        let loaded = Settings::load(&path).unwrap();
        assert_eq!(loaded.device.buffer_ms, 100);
    }
}
