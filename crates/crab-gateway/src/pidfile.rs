//! PID-file discipline: refuse to start while another daemon instance is
//! alive, clean up on every shutdown path.

use std::fs;
use std::path::{Path, PathBuf};

use tracing::warn;

use crab_core::{CrabError, Result};

/// Guard for the daemon PID file. Dropping it removes the file, so fatal
/// error paths clean up along with normal shutdown.
pub struct PidFile {
    path: PathBuf,
}

impl PidFile {
    /// Write our PID, refusing when the file names a live process. A stale
    /// file (dead process) is replaced with a warning.
    pub fn acquire(path: PathBuf) -> Result<Self> {
        if let Ok(existing) = fs::read_to_string(&path) {
            match existing.trim().parse::<u32>() {
                Ok(pid) if pid_alive(pid) => {
                    return Err(CrabError::Config(format!(
                        "daemon already running with pid {pid} ({})",
                        path.display()
                    )));
                }
                Ok(pid) => {
                    warn!(pid, path = %path.display(), "removing stale PID file");
                }
                Err(_) => {
                    warn!(path = %path.display(), "removing unreadable PID file");
                }
            }
        }

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| CrabError::Config(format!("cannot create {}: {e}", parent.display())))?;
        }
        fs::write(&path, format!("{}\n", std::process::id()))
            .map_err(|e| CrabError::Config(format!("cannot write {}: {e}", path.display())))?;
        Ok(PidFile { path })
    }

    /// Explicit removal for the normal shutdown path.
    pub fn release(self) {
        // Drop does the work.
    }
}

impl Drop for PidFile {
    fn drop(&mut self) {
        if let Err(e) = fs::remove_file(&self.path) {
            warn!(path = %self.path.display(), "could not remove PID file: {e}");
        }
    }
}

/// Liveness check via the proc filesystem; the daemon's design point is a
/// single Unix host.
pub fn pid_alive(pid: u32) -> bool {
    Path::new(&format!("/proc/{pid}")).exists()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn acquire_refuses_while_owner_is_alive() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crabd.pid");

        let guard = PidFile::acquire(path.clone()).expect("first acquire");
        // Our own PID is alive, so a second acquire must refuse.
        assert!(PidFile::acquire(path.clone()).is_err());

        guard.release();
        assert!(!path.exists());
    }

    #[test]
    fn stale_pid_file_is_replaced() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("crabd.pid");
        // A PID that is certainly dead on Linux (pid_max is far lower).
        fs::write(&path, "99999999\n").unwrap();

        let guard = PidFile::acquire(path.clone()).expect("stale file replaced");
        let written = fs::read_to_string(&path).unwrap();
        assert_eq!(written.trim().parse::<u32>().unwrap(), std::process::id());
        drop(guard);
    }
}
