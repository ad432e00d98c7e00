//! Town root discovery and the fixed runtime path layout.
//!
//! One town per host. Everything the scheduler and daemon persist lives
//! under the town root:
//!
//! ```text
//! <root>/town.toml                        configuration
//! <root>/.runtime/scheduler-dispatch.lock dispatch exclusion lock
//! <root>/state/scheduler.json             scheduler state
//! <root>/events/<channel>/*.event         event channels
//! <root>/daemon/daemon.log                daemon log
//! <root>/daemon/daemon.pid                daemon pid + lock file
//! ```

use std::path::{Path, PathBuf};

use anyhow::{bail, Result};

/// Config file name that marks a directory as a town root.
pub const TOWN_CONFIG_FILE: &str = "town.toml";

/// Locate the town root.
///
/// `GT_ROOT` overrides discovery. Otherwise walk upward from `start`
/// looking for `town.toml`.
pub fn discover_root(start: &Path) -> Result<PathBuf> {
    if let Ok(root) = std::env::var("GT_ROOT") {
        let root = PathBuf::from(root);
        if !root.is_dir() {
            bail!("GT_ROOT points at a non-directory: {}", root.display());
        }
        return Ok(root);
    }

    let mut dir = start.to_path_buf();
    loop {
        if dir.join(TOWN_CONFIG_FILE).is_file() {
            return Ok(dir);
        }
        if !dir.pop() {
            bail!(
                "no town root found above {} (missing {}; set GT_ROOT to override)",
                start.display(),
                TOWN_CONFIG_FILE
            );
        }
    }
}

/// Path helpers over a resolved town root.
#[derive(Debug, Clone)]
pub struct TownPaths {
    root: PathBuf,
}

impl TownPaths {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn config_file(&self) -> PathBuf {
        self.root.join(TOWN_CONFIG_FILE)
    }

    pub fn dispatch_lock(&self) -> PathBuf {
        self.root.join(".runtime").join("scheduler-dispatch.lock")
    }

    pub fn scheduler_state(&self) -> PathBuf {
        self.root.join("state").join("scheduler.json")
    }

    pub fn events_dir(&self, channel: &str) -> PathBuf {
        self.root.join("events").join(channel)
    }

    pub fn daemon_log(&self) -> PathBuf {
        self.root.join("daemon").join("daemon.log")
    }

    pub fn daemon_pid(&self) -> PathBuf {
        self.root.join("daemon").join("daemon.pid")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_discover_walks_upward() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join(TOWN_CONFIG_FILE), "").unwrap();
        let nested = tmp.path().join("rigs/gastown/src");
        std::fs::create_dir_all(&nested).unwrap();

        let root = discover_root(&nested).unwrap();
        assert_eq!(root.canonicalize().unwrap(), tmp.path().canonicalize().unwrap());
    }

    #[test]
    fn test_discover_fails_without_marker() {
        let tmp = tempfile::tempdir().unwrap();
        assert!(discover_root(tmp.path()).is_err());
    }

    #[test]
    fn test_runtime_paths() {
        let paths = TownPaths::new("/town");
        assert_eq!(
            paths.dispatch_lock(),
            PathBuf::from("/town/.runtime/scheduler-dispatch.lock")
        );
        assert_eq!(paths.scheduler_state(), PathBuf::from("/town/state/scheduler.json"));
        assert_eq!(paths.events_dir("scheduler"), PathBuf::from("/town/events/scheduler"));
    }
}
