use std::path::{Path, PathBuf};
use std::{fs, io};

use serde::{Deserialize, Serialize};

/// Persisted command-line defaults.
#[derive(Debug, Serialize, Deserialize, Clone)]
pub struct Settings {
    pub port: Option<String>,
    pub handshake_baud: u32,
    pub transfer_baud: u32,
}

impl Default for Settings {
    fn default() -> Self {
        Self {
            port: None,
            handshake_baud: 2400,
            transfer_baud: 115_200,
        }
    }
}

impl Settings {
    /// `~/.config/stcflash/config.toml`
    pub fn path() -> Option<PathBuf> {
        home::home_dir().map(|dir| dir.join(".config").join("stcflash").join("config.toml"))
    }

    /// Load the settings file, falling back to defaults when it is
    /// missing or unreadable.
    pub fn load() -> Self {
        Self::path()
            .map(|path| Self::load_from(&path))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        fs::read_to_string(path)
            .ok()
            .and_then(|content| toml::from_str(&content).ok())
            .unwrap_or_default()
    }

    pub fn save(&self) -> io::Result<()> {
        let path = Self::path().ok_or_else(|| {
            io::Error::new(io::ErrorKind::NotFound, "no home directory")
        })?;
        self.save_to(&path)
    }

    pub fn save_to(&self, path: &Path) -> io::Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let content = toml::to_string_pretty(self)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
        fs::write(path, content)
    }
}

#[cfg(test)]
mod tests {
    use super::Settings;

    #[test]
    fn settings_round_trip_through_toml() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let path = dir.path().join("config.toml");

        let settings = Settings {
            port: Some("/dev/ttyUSB0".to_string()),
            handshake_baud: 1200,
            transfer_baud: 57_600,
        };
        settings.save_to(&path).expect("save settings");

        let loaded = Settings::load_from(&path);
        assert_eq!(loaded.port.as_deref(), Some("/dev/ttyUSB0"));
        assert_eq!(loaded.handshake_baud, 1200);
        assert_eq!(loaded.transfer_baud, 57_600);
    }

    #[test]
    fn missing_file_falls_back_to_defaults() {
        let dir = tempfile::tempdir().expect("create temp dir");
        let loaded = Settings::load_from(&dir.path().join("nope.toml"));
        assert_eq!(loaded.port, None);
        assert_eq!(loaded.handshake_baud, 2400);
        assert_eq!(loaded.transfer_baud, 115_200);
    }
}
