//! Utilities for secret-file handling.
//!
//! Session keys, OAuth client secrets, and the issuer signing key are all
//! read from files referenced by the settings. The helpers here read those
//! files, reject obviously misconfigured ones, and harden the permissions of
//! files the server itself creates so they are restricted to the current
//! user only.

use anyhow::{Context, Result};
use std::path::Path;

#[cfg(unix)]
use std::{fs, os::unix::fs::PermissionsExt};

/// Read a secret from a file, trimming a single trailing newline.
///
/// Returns an error when the file is missing, unreadable, or empty after
/// trimming, so misconfiguration surfaces at startup rather than on first
/// use.
pub fn read_secret_file(path: &Path) -> Result<String> {
    let raw = fs_read_to_string(path)
        .with_context(|| format!("reading secret file {}", path.display()))?;
    let secret = raw.trim_end_matches(['\r', '\n']).to_string();
    if secret.is_empty() {
        anyhow::bail!("secret file {} is empty", path.display());
    }
    Ok(secret)
}

fn fs_read_to_string(path: &Path) -> std::io::Result<String> {
    std::fs::read_to_string(path)
}

/// Ensure the file at `file_path` is readable and writable only by the
/// current user.
///
/// On Unix this sets the mode to 0o600 (rw-------). On other platforms this
/// is a no-op. Returns an error if the file does not exist or the permission
/// change fails.
pub fn set_secure_file_permissions(file_path: &Path) -> Result<()> {
    if !file_path.exists() {
        return Err(anyhow::anyhow!(
            "file does not exist: {}",
            file_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(file_path)
            .with_context(|| format!("reading metadata for {}", file_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o600);
        fs::set_permissions(file_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", file_path.display()))?;
        tracing::debug!(
            "Set file permissions to 0600 (rw-------) for: {}",
            file_path.display()
        );
    }

    Ok(())
}

/// Ensure the directory at `dir_path` is accessible only by the current
/// user.
///
/// On Unix this sets the mode to 0o700 (rwx------). On other platforms this
/// is a no-op.
pub fn set_secure_dir_permissions(dir_path: &Path) -> Result<()> {
    if !dir_path.exists() {
        return Err(anyhow::anyhow!(
            "directory does not exist: {}",
            dir_path.display()
        ));
    }

    #[cfg(unix)]
    {
        let metadata = fs::metadata(dir_path)
            .with_context(|| format!("reading metadata for {}", dir_path.display()))?;
        let mut permissions = metadata.permissions();
        permissions.set_mode(0o700);
        fs::set_permissions(dir_path, permissions)
            .with_context(|| format!("setting unix permissions on {}", dir_path.display()))?;
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn secret_file_trims_trailing_newline() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"s3kr1t\n").expect("write");
        let secret = read_secret_file(file.path()).expect("read secret");
        assert_eq!(secret, "s3kr1t");
    }

    #[test]
    fn empty_secret_file_is_rejected() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        file.write_all(b"\n").expect("write");
        assert!(read_secret_file(file.path()).is_err());
    }
}
