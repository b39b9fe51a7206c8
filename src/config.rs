use crate::error::BackupError;
use crate::Result;
use configparser::ini::Ini;
use std::path::{Path, PathBuf};
use std::time::Duration;

const SECTION: &str = "localvc";

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Config {
    pub poll_interval_ms: u64,
    pub mirror_threads: u32,
    pub mirror_retries: u32,
    pub mirror_retry_wait: u32,
    pub robocopy_path: String,
    pub rsync_path: String,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            poll_interval_ms: 200,
            mirror_threads: 8,
            mirror_retries: 2,
            mirror_retry_wait: 5,
            robocopy_path: "robocopy".to_string(),
            rsync_path: "rsync".to_string(),
        }
    }
}

impl Config {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Get default configuration
pub fn default_config() -> Config {
    Config::default()
}

/// Load configuration from the per-user config file, falling back to defaults
pub fn load_config() -> Result<Config> {
    let config_path = config_dir()?.join("config.ini");
    load_config_from(&config_path)
}

/// Load configuration from an explicit INI file
pub fn load_config_from(config_path: &Path) -> Result<Config> {
    if !config_path.exists() {
        return Ok(default_config());
    }

    let mut conf = Ini::new();
    conf.load(config_path)
        .map_err(|e| BackupError::config(format!("Failed to parse config file: {e}")))?;

    let mut config = default_config();

    if let Some(value) = conf.get(SECTION, "robocopy_path") {
        config.robocopy_path = value;
    }
    if let Some(value) = conf.get(SECTION, "rsync_path") {
        config.rsync_path = value;
    }

    if let Some(value) = conf.get(SECTION, "poll_interval_ms") {
        config.poll_interval_ms = parse_number(&value, "poll_interval_ms")?;
    }
    if let Some(value) = conf.get(SECTION, "mirror_threads") {
        config.mirror_threads = parse_number(&value, "mirror_threads")?;
    }
    if let Some(value) = conf.get(SECTION, "mirror_retries") {
        config.mirror_retries = parse_number(&value, "mirror_retries")?;
    }
    if let Some(value) = conf.get(SECTION, "mirror_retry_wait") {
        config.mirror_retry_wait = parse_number(&value, "mirror_retry_wait")?;
    }

    if config.poll_interval_ms == 0 {
        return Err(BackupError::config("poll_interval_ms must be greater than 0"));
    }
    if config.mirror_threads == 0 {
        return Err(BackupError::config("mirror_threads must be greater than 0"));
    }

    Ok(config)
}

/// Per-user directory holding `config.ini` and `preferences.json`
pub fn config_dir() -> Result<PathBuf> {
    #[cfg(target_os = "windows")]
    {
        if let Some(appdata) = std::env::var_os("APPDATA") {
            return Ok(PathBuf::from(appdata).join("localvc"));
        }
    }

    if let Some(config_dir) = std::env::var_os("XDG_CONFIG_HOME") {
        Ok(PathBuf::from(config_dir).join("localvc"))
    } else if let Some(home) = std::env::var_os("HOME") {
        Ok(PathBuf::from(home).join(".config").join("localvc"))
    } else {
        Err(BackupError::config("Could not determine config directory"))
    }
}

fn parse_number<T: std::str::FromStr>(value: &str, key: &str) -> Result<T> {
    value
        .trim()
        .parse()
        .map_err(|_| BackupError::config(format!("Invalid {key}: {value}")))
}

/// Create a sample configuration file
pub fn create_sample_config() -> String {
    r#"[localvc]
# How often the destination size is measured while the mirror tool runs
poll_interval_ms = 200

# Mirror tool (Windows) transfer threads, retries and wait between retries in seconds
mirror_threads = 8
mirror_retries = 2
mirror_retry_wait = 5

# Copy tool executables
robocopy_path = robocopy
rsync_path = rsync
"#
    .to_string()
}

/// Display the current configuration in a user-friendly format
pub fn dump_config(config: &Config) -> Result<()> {
    let dir = config_dir()?;
    let config_path = dir.join("config.ini");
    let preferences_path = dir.join("preferences.json");

    println!("localvc Configuration");
    println!("=====================");
    println!();

    if config_path.exists() {
        println!("Config file:      {} (found)", config_path.display());
    } else {
        println!(
            "Config file:      {} (not found, using defaults)",
            config_path.display()
        );
    }
    println!("Preferences file: {}", preferences_path.display());
    println!();

    println!("Current Settings:");
    println!("----------------");
    println!("poll_interval_ms  = {}", config.poll_interval_ms);
    println!("mirror_threads    = {}", config.mirror_threads);
    println!("mirror_retries    = {}", config.mirror_retries);
    println!("mirror_retry_wait = {}", config.mirror_retry_wait);
    println!("robocopy_path     = {}", config.robocopy_path);
    println!("rsync_path        = {}", config.rsync_path);
    println!();

    if !config_path.exists() {
        println!("Sample config.ini:");
        println!("------------------");
        print!("{}", create_sample_config());
    }

    Ok(())
}
