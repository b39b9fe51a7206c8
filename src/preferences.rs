use crate::config::config_dir;
use crate::error::BackupError;
use crate::Result;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use tracing::warn;

const ON: &str = "on";
const OFF: &str = "off";

/// On-disk shape of `preferences.json`
#[derive(Debug, Serialize, Deserialize)]
struct PreferenceFile {
    #[serde(default = "default_name_on")]
    default_name: String,
}

fn default_name_on() -> String {
    ON.to_string()
}

/// The persisted auto-naming switch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Preferences {
    use_auto_naming: bool,
}

impl Default for Preferences {
    fn default() -> Self {
        Self {
            use_auto_naming: true,
        }
    }
}

impl Preferences {
    pub fn use_auto_naming(&self) -> bool {
        self.use_auto_naming
    }

    pub fn set_use_auto_naming(&mut self, enabled: bool) {
        self.use_auto_naming = enabled;
    }

    /// Default location, `<config dir>/preferences.json`
    pub fn default_path() -> Result<PathBuf> {
        Ok(config_dir()?.join("preferences.json"))
    }

    /// Read preferences; a missing or malformed file means auto naming stays on.
    pub fn load_from(path: &Path) -> Self {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Self::default(),
            Err(e) => {
                warn!("Could not read preferences {}: {}", path.display(), e);
                return Self::default();
            }
        };

        match serde_json::from_str::<PreferenceFile>(&content) {
            Ok(file) => Self {
                use_auto_naming: file.default_name != OFF,
            },
            Err(e) => {
                warn!("Ignoring malformed preferences {}: {}", path.display(), e);
                Self::default()
            }
        }
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let file = PreferenceFile {
            default_name: if self.use_auto_naming { ON } else { OFF }.to_string(),
        };
        let json = serde_json::to_string(&file)
            .map_err(|e| BackupError::config(format!("Could not encode preferences: {e}")))?;
        fs::write(path, json)?;
        Ok(())
    }
}
