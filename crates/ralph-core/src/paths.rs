//! Supervisor-level path layout.
//!
//! All user-scoped paths are resolved here once and passed into constructors
//! (registry, RPC server, backends) rather than read ad hoc. Layout:
//!
//! - `~/.local/share/ralph/sessions.db` -- the session registry
//! - `~/.local/share/ralph/sockets/<task>.sock` -- per-loop RPC endpoints (0700 dir, 0600 files)
//! - `~/.local/share/ralph/signals/<task>.signal` -- idle signal files for server backends
//! - `~/.local/state/ralph/<task>-worker.log` -- background worker logs
//! - `~/.config/ralph/prompt.md` -- user-scoped default prompt template

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};

use crate::error::{RalphError, RalphResult};

/// Resolved supervisor paths.
#[derive(Debug, Clone)]
pub struct RalphPaths {
    data_dir: PathBuf,
    state_dir: PathBuf,
    config_dir: PathBuf,
}

impl RalphPaths {
    /// Resolve from the user's home-relative XDG locations.
    pub fn resolve() -> RalphResult<Self> {
        let data = dirs::data_dir()
            .ok_or_else(|| RalphError::Config("cannot resolve user data directory".into()))?;
        let state = dirs::state_dir()
            .or_else(dirs::data_dir)
            .ok_or_else(|| RalphError::Config("cannot resolve user state directory".into()))?;
        let config = dirs::config_dir()
            .ok_or_else(|| RalphError::Config("cannot resolve user config directory".into()))?;
        Ok(Self {
            data_dir: data.join("ralph"),
            state_dir: state.join("ralph"),
            config_dir: config.join("ralph"),
        })
    }

    /// Root all paths under `base`; used by tests and by sandboxed runs.
    pub fn rooted_at(base: &Path) -> Self {
        Self {
            data_dir: base.join("share"),
            state_dir: base.join("state"),
            config_dir: base.join("config"),
        }
    }

    pub fn registry_db(&self) -> PathBuf {
        self.data_dir.join("sessions.db")
    }

    /// Socket directory, created with owner-only permissions.
    pub fn socket_dir(&self) -> RalphResult<PathBuf> {
        let dir = self.data_dir.join("sockets");
        fs::create_dir_all(&dir)?;
        fs::set_permissions(&dir, fs::Permissions::from_mode(0o700))?;
        Ok(dir)
    }

    pub fn socket_path(&self, task_name: &str) -> RalphResult<PathBuf> {
        Ok(self.socket_dir()?.join(format!("{task_name}.sock")))
    }

    pub fn signal_path(&self, task_name: &str) -> RalphResult<PathBuf> {
        let dir = self.data_dir.join("signals");
        fs::create_dir_all(&dir)?;
        Ok(dir.join(format!("{task_name}.signal")))
    }

    pub fn worker_log(&self, task_name: &str) -> RalphResult<PathBuf> {
        fs::create_dir_all(&self.state_dir)?;
        Ok(self.state_dir.join(format!("{task_name}-worker.log")))
    }

    /// User-scoped default prompt template location.
    pub fn default_prompt(&self) -> PathBuf {
        self.config_dir.join("prompt.md")
    }

    pub fn config_dir(&self) -> &Path {
        &self.config_dir
    }

    pub fn data_dir(&self) -> &Path {
        &self.data_dir
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rooted_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RalphPaths::rooted_at(tmp.path());

        assert_eq!(paths.registry_db(), tmp.path().join("share/sessions.db"));
        let sock = paths.socket_path("my-task").unwrap();
        assert!(sock.ends_with("sockets/my-task.sock"));

        let mode = fs::metadata(sock.parent().unwrap())
            .unwrap()
            .permissions()
            .mode();
        assert_eq!(mode & 0o777, 0o700);
    }

    #[test]
    fn signal_and_log_paths() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = RalphPaths::rooted_at(tmp.path());
        assert!(paths
            .signal_path("t")
            .unwrap()
            .ends_with("signals/t.signal"));
        assert!(paths.worker_log("t").unwrap().ends_with("t-worker.log"));
    }
}
