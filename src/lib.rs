pub mod backup;
pub mod config;
pub mod engine;
pub mod error;
pub mod monitor;
pub mod naming;
pub mod preferences;
pub mod progress;
pub mod signal;
pub mod utils;

pub use backup::{
    always_overwrite, never_overwrite, run_backup, BackupOutcome, BackupReport, BackupRequest,
    BackupRun, Orchestrator,
};
pub use config::{default_config, dump_config, load_config, load_config_from, Config};
pub use engine::{CopyHandle, CopyStatus, CopyStrategy, ProgressSource};
pub use error::BackupError;
pub use monitor::{parse_percentage, Phase, ProgressEvent};
pub use naming::{allocate, next_version_name, BackupPlan, ConfirmOverwrite, NamingMode};
pub use preferences::Preferences;
pub use progress::{BackupProgress, ProgressConfig};
pub use signal::BackupContext;
pub use utils::{estimate_size, format_size};

/// Main library result type
pub type Result<T> = std::result::Result<T, BackupError>;
