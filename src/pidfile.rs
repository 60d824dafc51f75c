//! Pid file handling
//!
//! One bridge per slot: an exclusively-locked pid file is created on startup
//! and removed when the owning guard drops. The flock guards against a stale
//! file left behind by a crashed process whose path still exists.

use crate::errors::{BridgeError, BridgeResult};
use std::fs::{File, OpenOptions, Permissions};
use std::io::Write;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::io::AsRawFd;
use std::path::{Path, PathBuf};
use tracing::debug;

pub struct PidFile {
    path: PathBuf,
    // Held open for the lifetime of the process so the lock stays held.
    _file: File,
}

impl PidFile {
    /// Creates `/tmp/wal2kafka_<slot>.pid` for this process.
    pub fn create(slot_name: &str) -> BridgeResult<Self> {
        Self::create_in(Path::new("/tmp"), slot_name)
    }

    pub fn create_in(dir: &Path, slot_name: &str) -> BridgeResult<Self> {
        let path = dir.join(format!("wal2kafka_{slot_name}.pid"));

        let mut file = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&path)
            .map_err(|e| {
                BridgeError::config(format!(
                    "cannot create pid file {} (is another instance running?): {e}",
                    path.display()
                ))
            })?;

        if unsafe { libc::flock(file.as_raw_fd(), libc::LOCK_EX | libc::LOCK_NB) } != 0 {
            let _ = std::fs::remove_file(&path);
            return Err(BridgeError::config(format!(
                "cannot lock pid file {}",
                path.display()
            )));
        }

        write!(file, "{}", std::process::id())?;
        file.flush()?;
        // world readable
        std::fs::set_permissions(&path, Permissions::from_mode(0o644))?;

        debug!("created pid file {}", path.display());
        Ok(Self { path, _file: file })
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_dir(tag: &str) -> PathBuf {
        let dir = std::env::temp_dir().join(format!("wal2kafka-test-{tag}-{}", std::process::id()));
        let _ = std::fs::remove_dir_all(&dir);
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn test_create_writes_pid_and_removes_on_drop() {
        let dir = test_dir("create");
        let path = dir.join("wal2kafka_slot.pid");

        {
            let _pidfile = PidFile::create_in(&dir, "slot").unwrap();
            let contents = std::fs::read_to_string(&path).unwrap();
            assert_eq!(contents, std::process::id().to_string());
        }
        assert!(!path.exists());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_second_instance_is_rejected() {
        let dir = test_dir("exclusive");

        let _first = PidFile::create_in(&dir, "slot").unwrap();
        assert!(PidFile::create_in(&dir, "slot").is_err());
        // a different slot gets its own file
        let _other = PidFile::create_in(&dir, "other").unwrap();

        drop(_first);
        drop(_other);
        std::fs::remove_dir_all(&dir).unwrap();
    }
}
