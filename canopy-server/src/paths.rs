//! Filesystem layout for the daemon's durable state.

use std::io;
use std::path::{Path, PathBuf};

/// Root directory for supervisor state (`~/.canopy` unless overridden).
pub fn canopy_home() -> io::Result<PathBuf> {
    dirs::home_dir()
        .map(|home| home.join(".canopy"))
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve home directory"))
}

pub fn default_socket_path() -> io::Result<PathBuf> {
    Ok(canopy_home()?.join("canopyd.sock"))
}

pub fn state_db_path(data_dir: &Path) -> PathBuf {
    data_dir.join("state.sqlite3")
}

pub fn log_dir(data_dir: &Path) -> PathBuf {
    data_dir.join("logs")
}

/// Capture file for a server's stdout, keyed by its path-derived id.
pub fn stdout_log_path(data_dir: &Path, id: &str) -> PathBuf {
    log_dir(data_dir).join(format!("{id}.out.log"))
}

/// Capture file for a server's stderr.
pub fn stderr_log_path(data_dir: &Path, id: &str) -> PathBuf {
    log_dir(data_dir).join(format!("{id}.err.log"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn log_paths_are_keyed_by_id() {
        let data = Path::new("/tmp/canopy-data");
        assert_eq!(
            stdout_log_path(data, "abc"),
            PathBuf::from("/tmp/canopy-data/logs/abc.out.log")
        );
        assert_eq!(
            stderr_log_path(data, "abc"),
            PathBuf::from("/tmp/canopy-data/logs/abc.err.log")
        );
    }

    #[test]
    fn state_db_lives_in_data_dir() {
        assert_eq!(
            state_db_path(Path::new("/data")),
            PathBuf::from("/data/state.sqlite3")
        );
    }
}
