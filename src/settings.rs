//! Last-used farm, queue and conda channel, kept in the user's home directory.

use crate::model::DEFAULT_CONDA_CHANNEL;
use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

pub const SETTINGS_FILE_NAME: &str = ".deadline_software_viewer.json";

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Settings {
    #[serde(default)]
    pub farm_id: Option<String>,
    #[serde(default)]
    pub queue_id: Option<String>,
    #[serde(default)]
    pub conda_channel: Option<String>,
}

impl Settings {
    pub fn default_path() -> Option<PathBuf> {
        dirs::home_dir().map(|home| home.join(SETTINGS_FILE_NAME))
    }

    /// Load from the default location. A missing or unreadable file gives defaults.
    pub fn load() -> Self {
        Self::default_path()
            .map(|p| Self::load_from(&p))
            .unwrap_or_default()
    }

    pub fn load_from(path: &Path) -> Self {
        let Ok(raw) = std::fs::read_to_string(path) else {
            return Self::default();
        };
        match serde_json::from_str::<Settings>(&raw) {
            Ok(s) => s.normalized(),
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable settings file");
                Self::default()
            }
        }
    }

    pub fn save(&self) -> Result<PathBuf> {
        let path = Self::default_path().context("could not determine home directory")?;
        self.save_to(&path)?;
        Ok(path)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        let json = serde_json::to_string_pretty(self)?;
        std::fs::write(path, json).with_context(|| format!("write {}", path.display()))?;
        Ok(())
    }

    pub fn conda_channel_or_default(&self) -> &str {
        self.conda_channel.as_deref().unwrap_or(DEFAULT_CONDA_CHANNEL)
    }

    // Older files store blanks instead of omitting keys.
    fn normalized(self) -> Self {
        fn clean(v: Option<String>) -> Option<String> {
            v.map(|s| s.trim().to_string()).filter(|s| !s.is_empty())
        }
        Self {
            farm_id: clean(self.farm_id),
            queue_id: clean(self.queue_id),
            conda_channel: clean(self.conda_channel),
        }
    }
}

/// Recover the id from combo-box display text such as `Main Farm (farm-0123)`.
///
/// Plain ids pass through unchanged.
pub fn id_from_display(value: &str) -> &str {
    let value = value.trim();
    match value.strip_suffix(')').and_then(|v| v.rsplit_once(" (")) {
        Some((_, id)) if !id.trim().is_empty() => id.trim(),
        _ => value,
    }
}
