//! File-based event channels.
//!
//! Events are small JSON documents under `<root>/events/<channel>/`, one
//! file per event, named by timestamp so a consumer reading in filename
//! order sees them oldest first. Producers and consumers share nothing
//! but the directory.

use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};

use anyhow::{Context, Result};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::paths::TownPaths;

/// Channel consumed by the scheduler's observers.
pub const CHANNEL_SCHEDULER: &str = "scheduler";
/// Channel consumed by the deacon / daemon.
pub const CHANNEL_DAEMON: &str = "daemon";

static SEQ: AtomicU64 = AtomicU64::new(0);

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Event {
    pub kind: String,
    pub ts: String,
    #[serde(default)]
    pub payload: Value,
}

impl Event {
    pub fn new(kind: &str, payload: Value) -> Self {
        Self {
            kind: kind.to_string(),
            ts: Utc::now().to_rfc3339(),
            payload,
        }
    }
}

/// Append an event to a channel. Failures here are the caller's to
/// downgrade; most emitters treat them as warnings.
pub fn emit(paths: &TownPaths, channel: &str, event: &Event) -> Result<()> {
    let dir = paths.events_dir(channel);
    std::fs::create_dir_all(&dir)
        .with_context(|| format!("failed to create {}", dir.display()))?;

    // Nanosecond timestamp plus a process-local counter keeps names
    // unique and sortable even within one tick.
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let name = format!(
        "{}-{:06}.event",
        Utc::now().format("%Y%m%dT%H%M%S%.9f"),
        seq
    );
    let path = dir.join(name);
    let body = serde_json::to_vec_pretty(event)?;
    std::fs::write(&path, body).with_context(|| format!("failed to write {}", path.display()))?;
    Ok(())
}

/// Read a channel's events oldest-first, optionally deleting them.
pub fn drain(paths: &TownPaths, channel: &str, delete: bool) -> Result<Vec<Event>> {
    let dir = paths.events_dir(channel);
    if !dir.is_dir() {
        return Ok(Vec::new());
    }

    let mut files: Vec<_> = std::fs::read_dir(&dir)?
        .filter_map(|e| e.ok())
        .map(|e| e.path())
        .filter(|p| p.extension().map(|x| x == "event").unwrap_or(false))
        .collect();
    files.sort();

    let mut events = Vec::with_capacity(files.len());
    for path in files {
        let event = read_event(&path)?;
        events.push(event);
        if delete {
            let _ = std::fs::remove_file(&path);
        }
    }
    Ok(events)
}

fn read_event(path: &Path) -> Result<Event> {
    let body = std::fs::read(path).with_context(|| format!("failed to read {}", path.display()))?;
    serde_json::from_slice(&body).with_context(|| format!("failed to parse {}", path.display()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_emit_and_drain_in_order() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TownPaths::new(tmp.path());

        for i in 0..3 {
            emit(
                &paths,
                CHANNEL_SCHEDULER,
                &Event::new("scheduler.dispatch", json!({ "bead": format!("gt-{i}") })),
            )
            .unwrap();
        }

        let events = drain(&paths, CHANNEL_SCHEDULER, false).unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0].payload["bead"], "gt-0");
        assert_eq!(events[2].payload["bead"], "gt-2");

        // Draining with delete empties the channel.
        let events = drain(&paths, CHANNEL_SCHEDULER, true).unwrap();
        assert_eq!(events.len(), 3);
        assert!(drain(&paths, CHANNEL_SCHEDULER, false).unwrap().is_empty());
    }

    #[test]
    fn test_missing_channel_is_empty() {
        let tmp = tempfile::tempdir().unwrap();
        let paths = TownPaths::new(tmp.path());
        assert!(drain(&paths, "nope", false).unwrap().is_empty());
    }
}
