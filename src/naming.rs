use crate::error::BackupError;
use crate::Result;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// How the backup folder inside the destination root gets its name
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum NamingMode {
    /// First free `v<N>` for N = 1, 2, ...
    Auto,
    /// A user-supplied folder name
    Custom(String),
}

/// Resolved target of one backup run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BackupPlan {
    pub folder_name: String,
    pub destination: PathBuf,
}

/// Asked before an existing folder is replaced; returning false cancels the run.
pub trait ConfirmOverwrite: Send + Sync {
    fn confirm_overwrite(&self, folder_name: &str, path: &Path) -> bool;
}

impl<F> ConfirmOverwrite for F
where
    F: Fn(&str, &Path) -> bool + Send + Sync,
{
    fn confirm_overwrite(&self, folder_name: &str, path: &Path) -> bool {
        self(folder_name, path)
    }
}

/// Resolve the backup folder for `mode` and create it empty.
///
/// A declined overwrite yields `BackupError::Cancelled` and leaves the
/// existing folder untouched.
pub fn allocate(
    destination_root: &Path,
    mode: &NamingMode,
    confirm: &dyn ConfirmOverwrite,
) -> Result<BackupPlan> {
    let folder_name = match mode {
        NamingMode::Auto => next_version_name(destination_root),
        NamingMode::Custom(name) => {
            let name = validate_custom_name(name)?;
            let existing = destination_root.join(&name);
            if path_is_taken(&existing) {
                if !confirm.confirm_overwrite(&name, &existing) {
                    info!("Replacing '{}' declined", name);
                    return Err(BackupError::Cancelled);
                }
                remove_existing(&existing)?;
            }
            name
        }
    };

    let destination = destination_root.join(&folder_name);
    fs::create_dir_all(&destination).map_err(|e| BackupError::DirectoryCreateFailed {
        path: destination.clone(),
        detail: e.to_string(),
    })?;

    debug!("Allocated backup folder {}", destination.display());
    Ok(BackupPlan {
        folder_name,
        destination,
    })
}

/// Smallest `v<N>` (N >= 1) not present under `destination_root`
pub fn next_version_name(destination_root: &Path) -> String {
    let mut version: u64 = 1;
    loop {
        let candidate = format!("v{version}");
        if !path_is_taken(&destination_root.join(&candidate)) {
            return candidate;
        }
        version += 1;
    }
}

/// Trim a custom name and reject names that would escape the destination root
fn validate_custom_name(name: &str) -> Result<String> {
    let trimmed = name.trim();
    if trimmed.is_empty() {
        return Err(BackupError::EmptyName);
    }

    if trimmed == "." || trimmed == ".." {
        return Err(BackupError::validation(format!(
            "Invalid backup name: {trimmed}"
        )));
    }

    if trimmed.contains(['/', '\\']) || trimmed.chars().any(|c| c.is_control()) {
        return Err(BackupError::validation(format!(
            "Backup name must be a single folder name: {trimmed}"
        )));
    }

    Ok(trimmed.to_string())
}

/// Anything at `path` counts, including a dangling symlink
fn path_is_taken(path: &Path) -> bool {
    fs::symlink_metadata(path).is_ok()
}

fn remove_existing(path: &Path) -> Result<()> {
    let is_dir = fs::symlink_metadata(path)
        .map(|meta| meta.is_dir())
        .unwrap_or(false);
    let result = if is_dir {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    result.map_err(|e| BackupError::RemovalFailed {
        path: path.to_path_buf(),
        detail: e.to_string(),
    })?;

    info!("Removed existing backup {}", path.display());
    Ok(())
}
