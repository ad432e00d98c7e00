//! Town configuration: `town.toml` plus environment overrides.
//!
//! The file is the source of record; env vars override individual knobs so
//! a dispatch tick can be tuned without editing the town config.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};

/// Per-rig configuration. A rig is a repository with its own issue-store
/// partition, addressed by bead-id prefix.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RigConfig {
    /// Bead-id prefix routed to this rig (e.g. `gt` for `gt-1234`).
    pub prefix: String,
    /// Path to the rig's checkout, relative to the town root unless absolute.
    pub path: PathBuf,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TownConfig {
    /// Global polecat concurrency limit. `<= 0` means direct dispatch:
    /// sling runs inline and nothing is queued.
    pub max_polecats: i64,
    /// Maximum items dispatched per scheduler tick.
    pub batch_size: usize,
    /// Delay between consecutive dispatches within one tick, to avoid
    /// hammering the issue store.
    pub spawn_delay_ms: u64,
    /// Daemon heartbeat interval.
    pub heartbeat_interval_secs: u64,
    /// Rigs by name.
    pub rigs: BTreeMap<String, RigConfig>,
}

impl Default for TownConfig {
    fn default() -> Self {
        Self {
            max_polecats: 0,
            batch_size: 4,
            spawn_delay_ms: 2000,
            heartbeat_interval_secs: 180,
            rigs: BTreeMap::new(),
        }
    }
}

impl TownConfig {
    /// Load from `town.toml` under `root`, then apply env overrides.
    /// A missing file yields the defaults (still env-overridable).
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(crate::paths::TOWN_CONFIG_FILE);
        let mut config = if path.is_file() {
            let text = std::fs::read_to_string(&path)
                .with_context(|| format!("failed to read {}", path.display()))?;
            toml::from_str(&text)
                .with_context(|| format!("failed to parse {}", path.display()))?
        } else {
            Self::default()
        };
        config.apply_env();
        Ok(config)
    }

    fn apply_env(&mut self) {
        if let Some(v) = env_parse::<i64>("GT_MAX_POLECATS") {
            self.max_polecats = v;
        }
        if let Some(v) = env_parse::<usize>("GT_BATCH_SIZE") {
            self.batch_size = v;
        }
        if let Some(v) = env_parse::<u64>("GT_SPAWN_DELAY_MS") {
            self.spawn_delay_ms = v;
        }
        if let Some(v) = env_parse::<u64>("GT_HEARTBEAT_SECS") {
            self.heartbeat_interval_secs = v;
        }
    }

    /// Whether sling should defer to the scheduler queue instead of
    /// dispatching inline.
    pub fn deferred_dispatch(&self) -> bool {
        self.max_polecats > 0
    }

    /// Resolve a bead id to its rig via the prefix routing table.
    pub fn rig_for_bead(&self, bead_id: &str) -> Option<&str> {
        let prefix = bead_id.split('-').next()?;
        self.rigs
            .iter()
            .find(|(_, rig)| rig.prefix == prefix)
            .map(|(name, _)| name.as_str())
    }

    /// Whether `name` is a configured rig.
    pub fn is_rig(&self, name: &str) -> bool {
        self.rigs.contains_key(name)
    }

    /// Absolute path of a rig's checkout.
    pub fn rig_path(&self, root: &Path, name: &str) -> Option<PathBuf> {
        self.rigs.get(name).map(|rig| {
            if rig.path.is_absolute() {
                rig.path.clone()
            } else {
                root.join(&rig.path)
            }
        })
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok().and_then(|s| s.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = TownConfig::default();
        assert_eq!(config.max_polecats, 0);
        assert_eq!(config.batch_size, 4);
        assert!(!config.deferred_dispatch());
    }

    #[test]
    fn test_load_toml_and_routing() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(
            tmp.path().join("town.toml"),
            r#"
max_polecats = 6
batch_size = 2

[rigs.gastown]
prefix = "gt"
path = "rigs/gastown"

[rigs.beads]
prefix = "bd"
path = "/abs/beads"
"#,
        )
        .unwrap();

        let config = TownConfig::load(tmp.path()).unwrap();
        assert_eq!(config.max_polecats, 6);
        assert!(config.deferred_dispatch());
        assert_eq!(config.rig_for_bead("gt-1234"), Some("gastown"));
        assert_eq!(config.rig_for_bead("bd-9"), Some("beads"));
        assert_eq!(config.rig_for_bead("zz-1"), None);
        assert!(config.is_rig("gastown"));
        assert_eq!(
            config.rig_path(tmp.path(), "gastown").unwrap(),
            tmp.path().join("rigs/gastown")
        );
        assert_eq!(
            config.rig_path(tmp.path(), "beads").unwrap(),
            PathBuf::from("/abs/beads")
        );
    }

    #[test]
    fn test_missing_file_defaults() {
        let tmp = tempfile::tempdir().unwrap();
        let config = TownConfig::load(tmp.path()).unwrap();
        assert_eq!(config.batch_size, 4);
    }
}
