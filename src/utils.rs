use crate::error::BackupError;
use crate::Result;
use std::fs;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use walkdir::WalkDir;

/// Validate that a backup source exists and is a readable directory
pub fn validate_source(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(BackupError::validation(format!(
            "Source is not a directory: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::validation(
            format!("Source folder not found: {}", path.display()),
        )),
        Err(e) => Err(BackupError::Io(e)),
    }
}

/// Validate that the destination root exists and is a directory
pub fn validate_destination_root(path: &Path) -> Result<()> {
    match fs::metadata(path) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(BackupError::validation(format!(
            "Destination is not a directory: {}",
            path.display()
        ))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(BackupError::validation(
            format!("Destination folder not found: {}", path.display()),
        )),
        Err(e) => Err(BackupError::Io(e)),
    }
}

/// Sum the sizes of all regular files below `path`.
///
/// Symlinks are neither followed nor counted, entries that cannot be read
/// contribute nothing, and a missing root yields 0.
pub fn estimate_size(path: &Path) -> u64 {
    let never = AtomicBool::new(false);
    estimate_size_until(path, &never).unwrap_or(0)
}

/// Like [`estimate_size`], but gives up with `None` once `cancel` is set.
pub fn estimate_size_until(path: &Path, cancel: &AtomicBool) -> Option<u64> {
    let mut total = 0u64;

    for entry in WalkDir::new(path).follow_links(false) {
        if cancel.load(Ordering::SeqCst) {
            return None;
        }

        let entry = match entry {
            Ok(entry) => entry,
            Err(_) => continue,
        };

        if !entry.file_type().is_file() {
            continue;
        }

        if let Ok(metadata) = entry.metadata() {
            total = total.saturating_add(metadata.len());
        }
    }

    Some(total)
}

/// Format byte size in human-readable format
pub fn format_size(bytes: u64) -> String {
    const UNITS: &[&str] = &["B", "KB", "MB", "GB", "TB"];
    const THRESHOLD: u64 = 1024;

    if bytes < THRESHOLD {
        return format!("{bytes} B");
    }

    let mut size = bytes as f64;
    let mut unit_index = 0;

    while size >= THRESHOLD as f64 && unit_index < UNITS.len() - 1 {
        size /= THRESHOLD as f64;
        unit_index += 1;
    }

    format!("{:.1} {}", size, UNITS[unit_index])
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_validate_source() {
        let dir = tempdir().unwrap();
        assert!(validate_source(dir.path()).is_ok());

        let missing = dir.path().join("missing");
        assert!(matches!(
            validate_source(&missing),
            Err(BackupError::Validation { .. })
        ));

        let file = dir.path().join("file.txt");
        fs::write(&file, "content").unwrap();
        assert!(matches!(
            validate_source(&file),
            Err(BackupError::Validation { .. })
        ));
    }

    #[test]
    fn test_validate_destination_root() {
        let dir = tempdir().unwrap();
        assert!(validate_destination_root(dir.path()).is_ok());
        assert!(validate_destination_root(&dir.path().join("nope")).is_err());
    }

    #[test]
    fn test_estimate_size_nonexistent() {
        let dir = tempdir().unwrap();
        assert_eq!(estimate_size(&dir.path().join("does-not-exist")), 0);
    }

    #[test]
    fn test_estimate_size_nested() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), vec![0u8; 10]).unwrap();
        fs::create_dir_all(dir.path().join("sub/deeper")).unwrap();
        fs::write(dir.path().join("sub/b.txt"), vec![0u8; 5]).unwrap();
        fs::write(dir.path().join("sub/deeper/c.txt"), vec![0u8; 7]).unwrap();

        assert_eq!(estimate_size(dir.path()), 22);
    }

    #[test]
    fn test_estimate_size_empty_directory() {
        let dir = tempdir().unwrap();
        assert_eq!(estimate_size(dir.path()), 0);
    }

    #[cfg(unix)]
    #[test]
    fn test_estimate_size_with_unreadable_file() {
        use std::os::unix::fs::PermissionsExt;

        if unsafe { libc::geteuid() } == 0 {
            eprintln!("running as root, permissions are not enforced; skipping");
            return;
        }

        let dir = tempdir().unwrap();
        fs::write(dir.path().join("data.bin"), vec![1u8; 100]).unwrap();
        let locked = dir.path().join("locked");
        fs::create_dir(&locked).unwrap();
        fs::write(locked.join("hidden.bin"), vec![2u8; 50]).unwrap();
        // Names stay listable but nothing inside can be stat-ed
        fs::set_permissions(&locked, fs::Permissions::from_mode(0o600)).unwrap();
        assert!(fs::metadata(locked.join("hidden.bin")).is_err());

        let total = estimate_size(dir.path());

        fs::set_permissions(&locked, fs::Permissions::from_mode(0o755)).unwrap();
        assert_eq!(total, 100);
    }

    #[cfg(unix)]
    #[test]
    fn test_estimate_size_skips_symlinks() {
        use std::os::unix::fs::symlink;

        let dir = tempdir().unwrap();
        let outside = tempdir().unwrap();
        fs::write(outside.path().join("big.bin"), vec![0u8; 4096]).unwrap();
        fs::write(dir.path().join("small.txt"), vec![0u8; 3]).unwrap();
        symlink(outside.path().join("big.bin"), dir.path().join("link.bin")).unwrap();
        symlink(outside.path(), dir.path().join("linked-dir")).unwrap();

        assert_eq!(estimate_size(dir.path()), 3);
    }

    #[test]
    fn test_estimate_size_until_cancelled() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "abc").unwrap();

        let cancel = AtomicBool::new(true);
        assert_eq!(estimate_size_until(dir.path(), &cancel), None);

        let cancel = AtomicBool::new(false);
        assert_eq!(estimate_size_until(dir.path(), &cancel), Some(3));
    }

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(0), "0 B");
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(1024), "1.0 KB");
        assert_eq!(format_size(1536), "1.5 KB");
        assert_eq!(format_size(1024 * 1024), "1.0 MB");
        assert_eq!(format_size(1024 * 1024 * 1024), "1.0 GB");
    }
}
