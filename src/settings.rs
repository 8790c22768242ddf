use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::audio::{default_output_dir, Rounding, DEFAULT_ROUNDING};
use crate::capture::{BackendKind, SimulatedConfig};

const SETTINGS_FILE_NAME: &str = "settings.json";
const APP_DIR_NAME: &str = "multichannel-recorder";

/// Overrides the settings file location.
pub const SETTINGS_PATH_ENV: &str = "RECORDER_SETTINGS";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AppSettings {
    /// Which capture backend to use.
    pub backend: BackendKind,

    /// Device used when a request names none. Also checked at startup.
    pub default_device: Option<String>,

    /// Capture rate for requests that don't name one.
    pub sample_rate: u32,

    /// Frames per capture block (the device period).
    pub block_frames: u32,

    /// Where channel files are written. Defaults to the XDG data dir.
    pub output_dir: Option<PathBuf>,

    /// JSON command store. Defaults to `<data dir>/multichannel-recorder/commands.json`.
    pub store_path: Option<PathBuf>,

    /// How long the supervisor waits between store polls.
    pub poll_interval_ms: u64,

    /// Float to 24-bit conversion. `truncate` reproduces files written by the
    /// legacy recorder bit for bit.
    pub rounding: Rounding,

    /// Binary run by the `arecord` backend.
    pub arecord_command: String,

    /// Device emulated by the `simulated` backend.
    pub simulated: SimulatedConfig,
}

impl Default for AppSettings {
    fn default() -> Self {
        Self {
            backend: BackendKind::default(),
            default_device: None,
            sample_rate: 48_000,
            block_frames: 1024,
            output_dir: None,
            store_path: None,
            poll_interval_ms: 1000,
            rounding: DEFAULT_ROUNDING,
            arecord_command: "arecord".to_string(),
            simulated: SimulatedConfig::default(),
        }
    }
}

impl AppSettings {
    pub fn output_dir(&self) -> PathBuf {
        self.output_dir.clone().unwrap_or_else(default_output_dir)
    }

    pub fn store_path(&self) -> PathBuf {
        self.store_path.clone().unwrap_or_else(|| {
            dirs::data_local_dir()
                .unwrap_or_else(|| PathBuf::from("."))
                .join(APP_DIR_NAME)
                .join("commands.json")
        })
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms.max(1))
    }
}

/// `$RECORDER_SETTINGS`, else `<config dir>/multichannel-recorder/settings.json`.
pub fn settings_path() -> Result<PathBuf, String> {
    if let Some(path) = std::env::var_os(SETTINGS_PATH_ENV) {
        return Ok(PathBuf::from(path));
    }
    let dir =
        dirs::config_dir().ok_or_else(|| "Could not determine config directory".to_string())?;
    Ok(dir.join(APP_DIR_NAME).join(SETTINGS_FILE_NAME))
}

pub fn load_settings() -> AppSettings {
    match settings_path() {
        Ok(path) => load_settings_from(&path),
        Err(e) => {
            log::warn!("Settings: {}", e);
            AppSettings::default()
        }
    }
}

pub fn load_settings_from(path: &Path) -> AppSettings {
    match std::fs::read_to_string(path) {
        Ok(contents) => match serde_json::from_str::<AppSettings>(&contents) {
            Ok(settings) => {
                log::info!("Settings: loaded {:?}", path);
                settings
            }
            Err(e) => {
                log::warn!("Settings: failed to parse {:?}: {}", path, e);
                AppSettings::default()
            }
        },
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            log::info!("Settings: {:?} not found, using defaults", path);
            AppSettings::default()
        }
        Err(e) => {
            log::warn!("Settings: failed to read {:?}: {}", path, e);
            AppSettings::default()
        }
    }
}
