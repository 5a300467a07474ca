//! Service configuration.
//!
//! Ports come from a JSON settings file shared with the rest of the spatial
//! system; every field is defaulted so a missing or partial file still yields
//! a working configuration.

use serde::Deserialize;
use std::path::{Path, PathBuf};

pub const DEFAULT_SERVER_PORT: u16 = 6345;
pub const DEFAULT_HELPER_PORT: u16 = 6346;

#[derive(Debug, Clone, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct HelperConfig {
    /// Port the orientation manager serves on; probed by the supervisor.
    pub server_port: u16,
    /// Port the coordination service listens on for OSC.
    pub helper_port: u16,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            server_port: DEFAULT_SERVER_PORT,
            helper_port: DEFAULT_HELPER_PORT,
        }
    }
}

impl HelperConfig {
    /// Load from a settings file. A missing file is normal (defaults apply);
    /// an unreadable or malformed file is logged and also falls back.
    pub fn load(path: &Path) -> Self {
        match std::fs::read_to_string(path) {
            Ok(raw) => match serde_json::from_str(&raw) {
                Ok(config) => config,
                Err(err) => {
                    tracing::warn!(path = %path.display(), %err, "malformed settings file, using defaults");
                    Self::default()
                }
            },
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                tracing::info!(path = %path.display(), "no settings file, using default ports");
                Self::default()
            }
            Err(err) => {
                tracing::warn!(path = %path.display(), %err, "could not read settings file, using defaults");
                Self::default()
            }
        }
    }

    /// Platform location of the shared settings file.
    pub fn default_path() -> PathBuf {
        #[cfg(target_os = "macos")]
        {
            PathBuf::from("/Library/Application Support/Mach1/settings.json")
        }

        #[cfg(target_os = "windows")]
        {
            let base = std::env::var("PROGRAMDATA").unwrap_or_else(|_| "C:\\ProgramData".into());
            PathBuf::from(base).join("Mach1").join("settings.json")
        }

        #[cfg(not(any(target_os = "macos", target_os = "windows")))]
        {
            PathBuf::from("/opt/Mach1/settings.json")
        }
    }
}
