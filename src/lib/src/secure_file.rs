//! Secure file operations for offline key material
//!
//! Credential archives hold private keys, so they are created with
//! restrictive permissions (0600 on Unix) and are only ever replaced
//! atomically: the new content goes to a `.tmp` sibling which is then
//! renamed over the original. A leftover `.tmp` sibling means an earlier
//! write was interrupted; it may hold the only copy of freshly generated
//! keys, so it is never silently overwritten.
//!
//! # Example
//!
//! ```no_run
//! use tufroot::secure_file;
//! use std::path::Path;
//!
//! let archive = Path::new("/path/to/offline-creds.tgz");
//! secure_file::assert_writable(archive)?;
//! let backup = secure_file::backup(archive)?;
//! secure_file::write_atomic(archive, b"new archive bytes")?;
//! # let _ = backup;
//! # Ok::<(), tufroot::TufError>(())
//! ```

use crate::error::TufError;
use std::ffi::OsString;
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

/// The restrictive permission mode for sensitive files (owner read/write only)
#[cfg(unix)]
pub const SECURE_FILE_MODE: u32 = 0o600;

/// Check if file permissions are secure (Unix only)
///
/// Logs a warning when group or others have any access; never fails on that alone.
#[cfg(unix)]
pub fn check_permissions(path: &Path) -> Result<(), TufError> {
    use std::os::unix::fs::PermissionsExt;

    let metadata = fs::metadata(path)?;
    let perm_bits = metadata.permissions().mode() & 0o777;

    if perm_bits & 0o077 != 0 {
        log::warn!(
            "SECURITY WARNING: '{}' holds private keys but has mode {:o}. \
             Consider running: chmod 600 '{}'",
            path.display(),
            perm_bits,
            path.display()
        );
    }

    Ok(())
}

#[cfg(not(unix))]
pub fn check_permissions(path: &Path) -> Result<(), TufError> {
    log::debug!(
        "Permission check skipped for '{}': not supported on this platform",
        path.display()
    );
    Ok(())
}

/// Create a new file with secure permissions from the start.
///
/// Fails if the file already exists.
#[cfg(unix)]
pub fn create_secure_file(path: &Path) -> Result<File, TufError> {
    use std::os::unix::fs::OpenOptionsExt;

    let file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(SECURE_FILE_MODE)
        .open(path)?;

    Ok(file)
}

#[cfg(not(unix))]
pub fn create_secure_file(path: &Path) -> Result<File, TufError> {
    log::warn!(
        "Creating '{}' without restrictive permissions: not supported on this platform",
        path.display()
    );

    let file = OpenOptions::new().write(true).create_new(true).open(path)?;
    Ok(file)
}

/// Read a file after checking its permissions.
pub fn read_secure(path: &Path) -> Result<Vec<u8>, TufError> {
    check_permissions(path)?;

    let mut file = File::open(path)?;
    let mut contents = Vec::new();
    file.read_to_end(&mut contents)?;

    Ok(contents)
}

/// Path of the temporary sibling used while replacing `path`.
pub fn tmp_path(path: &Path) -> PathBuf {
    sibling(path, ".tmp")
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let mut name: OsString = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Fail if an interrupted write left a temporary sibling behind.
pub fn check_no_stale_tmp(path: &Path) -> Result<(), TufError> {
    let tmp = tmp_path(path);
    if tmp.exists() {
        return Err(TufError::ArchiveError(format!(
            "'{}' exists, probably left by an interrupted key rotation. \
             It may contain newly generated keys: inspect it, move it aside, then retry",
            tmp.display()
        )));
    }
    Ok(())
}

/// Pre-flight check run before any command that will rewrite `path`.
///
/// The file must exist, be writable by us, and have no stale temporary sibling.
pub fn assert_writable(path: &Path) -> Result<(), TufError> {
    check_no_stale_tmp(path)?;

    OpenOptions::new()
        .append(true)
        .open(path)
        .map_err(|e| {
            TufError::ArchiveError(format!("'{}' is not writable: {}", path.display(), e))
        })?;

    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let meta = fs::metadata(dir)?;
    if meta.permissions().readonly() {
        return Err(TufError::ArchiveError(format!(
            "Directory '{}' is read-only; the archive cannot be replaced atomically",
            dir.display()
        )));
    }

    Ok(())
}

/// Copy `path` to a timestamped `.bak` sibling and return the backup path.
pub fn backup(path: &Path) -> Result<PathBuf, TufError> {
    let stamp = chrono::Utc::now().format("%Y%m%dT%H%M%S");
    let mut candidate = sibling(path, &format!(".{}.bak", stamp));
    let mut n = 1;
    while candidate.exists() {
        candidate = sibling(path, &format!(".{}-{}.bak", stamp, n));
        n += 1;
    }

    let data = fs::read(path)?;
    let mut file = create_secure_file(&candidate)?;
    file.write_all(&data)?;
    file.sync_all()?;

    Ok(candidate)
}

/// Atomically replace `path` with `data`.
///
/// Writes to the `.tmp` sibling (created 0600, refusing to reuse a stale one),
/// syncs it and renames it over `path`. On failure the temporary file is removed.
pub fn write_atomic(path: &Path, data: &[u8]) -> Result<(), TufError> {
    check_no_stale_tmp(path)?;
    let tmp = tmp_path(path);

    let mut file = create_secure_file(&tmp)?;
    let res: Result<(), TufError> = (|| {
        file.write_all(data)?;
        file.flush()?;
        file.sync_all()?;
        fs::rename(&tmp, path)?;
        Ok(())
    })();

    if res.is_err() {
        let _ = fs::remove_file(&tmp);
    }
    res
}
