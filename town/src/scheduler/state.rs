//! Persisted scheduler state.
//!
//! A single JSON file at `<root>/state/scheduler.json`. Writers re-read
//! immediately before saving so a dispatch tick cannot clobber a
//! concurrent pause.

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::paths::TownPaths;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerState {
    pub paused: bool,
    pub paused_by: String,
    pub last_dispatch_at: Option<DateTime<Utc>>,
    pub last_dispatch_count: u64,
}

impl SchedulerState {
    pub fn load(paths: &TownPaths) -> Result<Self> {
        let path = paths.scheduler_state();
        if !path.is_file() {
            return Ok(Self::default());
        }
        let body = std::fs::read(&path)
            .with_context(|| format!("failed to read {}", path.display()))?;
        serde_json::from_slice(&body)
            .with_context(|| format!("failed to parse {}", path.display()))
    }

    pub fn save(&self, paths: &TownPaths) -> Result<()> {
        let path = paths.scheduler_state();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let body = serde_json::to_vec_pretty(self)?;
        std::fs::write(&path, body)
            .with_context(|| format!("failed to write {}", path.display()))
    }
}

/// Read-modify-write: reload fresh state, apply `mutate`, save.
pub fn update_state(
    paths: &TownPaths,
    mutate: impl FnOnce(&mut SchedulerState),
) -> Result<SchedulerState> {
    let mut state = SchedulerState::load(paths)?;
    mutate(&mut state);
    state.save(paths)?;
    Ok(state)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_missing_file_is_default() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TownPaths::new(tmp.path());
        let state = SchedulerState::load(&paths).unwrap();
        assert!(!state.paused);
        assert_eq!(state.last_dispatch_count, 0);
    }

    #[test]
    fn test_round_trip_and_update() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TownPaths::new(tmp.path());

        update_state(&paths, |s| {
            s.paused = true;
            s.paused_by = "mayor".into();
        })
        .unwrap();

        // A later read-modify-write sees the pause.
        let state = update_state(&paths, |s| {
            s.last_dispatch_count = 3;
            s.last_dispatch_at = Some(Utc::now());
        })
        .unwrap();
        assert!(state.paused);
        assert_eq!(state.paused_by, "mayor");
        assert_eq!(state.last_dispatch_count, 3);

        let reloaded = SchedulerState::load(&paths).unwrap();
        assert!(reloaded.paused);
        assert!(reloaded.last_dispatch_at.is_some());
    }
}
