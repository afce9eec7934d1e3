//! Best-effort PID file handling for process lifecycle.
//!
//! Failures here are reportable, never fatal: the caller logs and keeps serving.

use std::path::{Path, PathBuf};

use crate::error::{SwebError, SwebResult};

/// Default PID file location: the working directory, falling back to the temp directory.
#[must_use]
pub fn default_pid_path() -> PathBuf {
    std::env::current_dir()
        .unwrap_or_else(|_| std::env::temp_dir())
        .join("sweb.pid")
}

/// Writes the current process id to `path`.
///
/// # Errors
///
/// Returns `SwebError::Io` when the file cannot be written.
pub fn save_pid(path: &Path) -> SwebResult<()> {
    std::fs::write(path, std::process::id().to_string())
        .map_err(|error| SwebError::Io(format!("write pid file {} failed: {error}", path.display())))
}

/// Removes a previously written PID file.
///
/// # Errors
///
/// Returns `SwebError::Io` when the file exists but cannot be removed.
pub fn remove_pid(path: &Path) -> SwebResult<()> {
    match std::fs::remove_file(path) {
        Ok(()) => Ok(()),
        Err(error) if error.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(error) => Err(SwebError::Io(format!(
            "remove pid file {} failed: {error}",
            path.display()
        ))),
    }
}
