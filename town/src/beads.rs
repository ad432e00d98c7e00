//! Bridge to the beads issue database (`bd`).
//!
//! The store is the single source of persistent shared state in a town:
//! work items, convoys, and agent records are all beads. `bd` is a
//! binary-only tool, so we shell out; the binary name is read from the
//! `GT_BD_BIN` env var, defaulting to `"bd"`. Commands run from the
//! store's working directory so `bd` can discover its prefix routing
//! file — never with a per-command store-path override, which would
//! defeat routing.
//!
//! `MemStore` is the in-memory stub used by tests and by `GT_TEST_STORE=mem`
//! runs. It supports fault injection to model the eventually-consistent
//! store: dropped writes (accepted but not applied) and failed writes.

use std::collections::{BTreeMap, BTreeSet};
use std::path::PathBuf;
use std::process::Command;
use std::sync::Mutex;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Env var selecting the in-memory store stub.
pub const TEST_STORE_ENV: &str = "GT_TEST_STORE";

/// Label marking an item as queued for deferred dispatch.
pub const LABEL_QUEUED: &str = "gt:queued";
/// Label applied after a successful dispatch.
pub const LABEL_DISPATCHED: &str = "gt:queue-dispatched";
/// Label applied when the circuit breaker trips.
pub const LABEL_DISPATCH_FAILED: &str = "gt:dispatch-failed";

/// Prefix of the `tracks:` relation labels carried by convoy beads.
pub const TRACKS_LABEL_PREFIX: &str = "tracks:";

/// Bead status. Work items move open → hooked → closed; convoys also use
/// the staged states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    Hooked,
    Pinned,
    Closed,
    StagedReady,
    StagedWarnings,
}

impl BeadStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::Hooked => "hooked",
            BeadStatus::Pinned => "pinned",
            BeadStatus::Closed => "closed",
            BeadStatus::StagedReady => "staged_ready",
            BeadStatus::StagedWarnings => "staged_warnings",
        }
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadType {
    Task,
    Epic,
    Convoy,
    Agent,
}

impl std::fmt::Display for BeadType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            BeadType::Task => "task",
            BeadType::Epic => "epic",
            BeadType::Convoy => "convoy",
            BeadType::Agent => "agent",
        };
        f.write_str(s)
    }
}

/// A bead as returned by `bd show --json` / `bd list --json`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub title: String,
    pub status: BeadStatus,
    #[serde(default)]
    pub assignee: String,
    #[serde(default)]
    pub labels: BTreeSet<String>,
    #[serde(default)]
    pub parent: Option<String>,
    /// Work-item ids this bead blocks on.
    #[serde(default)]
    pub blocked_by: Vec<String>,
    #[serde(rename = "type")]
    pub bead_type: BeadType,
    #[serde(default)]
    pub description: String,
}

impl Bead {
    pub fn is_closed(&self) -> bool {
        self.status == BeadStatus::Closed
    }

    /// Bead ids this convoy tracks via `tracks:` labels.
    pub fn tracked_ids(&self) -> Vec<String> {
        self.labels
            .iter()
            .filter_map(|l| l.strip_prefix(TRACKS_LABEL_PREFIX))
            .map(String::from)
            .collect()
    }
}

/// Whether an id names a convoy bead (`hq-cv-<suffix>`).
pub fn is_convoy_id(id: &str) -> bool {
    id.starts_with("hq-cv-")
}

/// Partial update applied by `bd update`.
#[derive(Debug, Clone, Default)]
pub struct BeadDelta {
    pub status: Option<BeadStatus>,
    /// `Some("")` clears the assignee.
    pub assignee: Option<String>,
    pub description: Option<String>,
    pub add_labels: Vec<String>,
    pub remove_labels: Vec<String>,
}

impl BeadDelta {
    pub fn status(status: BeadStatus) -> Self {
        Self { status: Some(status), ..Default::default() }
    }

    pub fn is_empty(&self) -> bool {
        self.status.is_none()
            && self.assignee.is_none()
            && self.description.is_none()
            && self.add_labels.is_empty()
            && self.remove_labels.is_empty()
    }
}

/// Query filter for `bd list`.
#[derive(Debug, Clone, Default)]
pub struct BeadFilter {
    pub status: Option<BeadStatus>,
    pub label: Option<String>,
    pub assignee: Option<String>,
    pub parent: Option<String>,
    pub bead_type: Option<BeadType>,
    pub limit: Option<usize>,
}

/// Creation request for `bd create`.
#[derive(Debug, Clone, Default)]
pub struct NewBead {
    /// Explicit id; the store mints one when absent.
    pub id: Option<String>,
    pub title: String,
    pub bead_type: Option<BeadType>,
    pub parent: Option<String>,
    pub labels: Vec<String>,
    pub description: String,
}

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("bead not found: {0}")]
    NotFound(String),
    #[error("bd {verb} failed: {stderr}")]
    Command { verb: String, stderr: String },
    #[error("failed to parse bd output for {verb}: {source}")]
    Parse {
        verb: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("failed to run bd: {0}")]
    Io(#[from] std::io::Error),
    #[error("injected store failure")]
    Injected,
}

pub type StoreResult<T> = Result<T, StoreError>;

/// Abstraction over the beads database.
///
/// `BdStore` implements this against the real `bd` CLI; `MemStore` is the
/// test stub. All coordination state flows through this trait.
pub trait BeadStore: Send + Sync {
    fn show(&self, id: &str) -> StoreResult<Bead>;
    fn update(&self, id: &str, delta: &BeadDelta) -> StoreResult<()>;
    fn list(&self, filter: &BeadFilter) -> StoreResult<Vec<Bead>>;
    /// Unblocked beads carrying `label`, across every partition the store
    /// routes to.
    fn ready(&self, label: &str, limit: usize) -> StoreResult<Vec<Bead>>;
    fn close(&self, id: &str, reason: &str) -> StoreResult<()>;
    fn slot_get(&self, id: &str, slot: &str) -> StoreResult<Option<String>>;
    fn slot_set(&self, id: &str, slot: &str, value: &str) -> StoreResult<()>;
    fn create(&self, spec: &NewBead) -> StoreResult<String>;

    /// Materialize a formula template. Opaque to the core.
    fn cook(&self, formula: &str) -> StoreResult<()>;
    /// Instantiate an ephemeral workflow (wisp) from a cooked formula.
    fn wisp(&self, formula: &str, vars: &BTreeMap<String, String>) -> StoreResult<String>;
    /// Bond a wisp to a work item, creating a compound root.
    fn bond(&self, wisp_id: &str, bead_id: &str) -> StoreResult<()>;
}

// ---------------------------------------------------------------------------
// BdStore: the real CLI bridge
// ---------------------------------------------------------------------------

/// Bridge to the `bd` binary, rooted at a working directory.
pub struct BdStore {
    bin: String,
    cwd: PathBuf,
}

impl BdStore {
    pub fn new(cwd: impl Into<PathBuf>) -> Self {
        Self {
            bin: std::env::var("GT_BD_BIN").unwrap_or_else(|_| "bd".into()),
            cwd: cwd.into(),
        }
    }

    /// A store routed through a different working directory (per-rig
    /// partitions during the dispatch tick).
    pub fn at(&self, cwd: impl Into<PathBuf>) -> Self {
        Self { bin: self.bin.clone(), cwd: cwd.into() }
    }

    fn run(&self, verb: &str, args: &[String]) -> StoreResult<Vec<u8>> {
        let mut cmd = Command::new(&self.bin);
        cmd.arg(verb).args(args).current_dir(&self.cwd);
        let output =
            crate::session::run_with_timeout(cmd, crate::session::SUBPROCESS_TIMEOUT)
                .map_err(|e| StoreError::Command {
                    verb: verb.to_string(),
                    stderr: format!("{e:#}"),
                })?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            if stderr.contains("not found") {
                // bd prints "issue not found: <id>" for unknown ids
                let id = args.first().cloned().unwrap_or_default();
                return Err(StoreError::NotFound(id));
            }
            return Err(StoreError::Command { verb: verb.to_string(), stderr });
        }
        Ok(output.stdout)
    }

    fn run_json<T: for<'de> Deserialize<'de>>(&self, verb: &str, args: &[String]) -> StoreResult<T> {
        let stdout = self.run(verb, args)?;
        serde_json::from_slice(&stdout).map_err(|source| StoreError::Parse {
            verb: verb.to_string(),
            source,
        })
    }
}

impl BeadStore for BdStore {
    fn show(&self, id: &str) -> StoreResult<Bead> {
        self.run_json("show", &[id.to_string(), "--json".to_string()])
    }

    fn update(&self, id: &str, delta: &BeadDelta) -> StoreResult<()> {
        if delta.is_empty() {
            return Ok(());
        }
        let mut args = vec![id.to_string()];
        if let Some(status) = delta.status {
            args.push(format!("--status={status}"));
        }
        if let Some(assignee) = &delta.assignee {
            args.push(format!("--assignee={assignee}"));
        }
        if let Some(description) = &delta.description {
            args.push(format!("--description={description}"));
        }
        for label in &delta.add_labels {
            args.push(format!("--add-label={label}"));
        }
        for label in &delta.remove_labels {
            args.push(format!("--remove-label={label}"));
        }
        self.run("update", &args).map(|_| ())
    }

    fn list(&self, filter: &BeadFilter) -> StoreResult<Vec<Bead>> {
        let mut args = vec!["--json".to_string()];
        if let Some(status) = filter.status {
            args.push(format!("--status={status}"));
        }
        if let Some(label) = &filter.label {
            args.push(format!("--label={label}"));
        }
        if let Some(assignee) = &filter.assignee {
            args.push(format!("--assignee={assignee}"));
        }
        if let Some(parent) = &filter.parent {
            args.push(format!("--parent={parent}"));
        }
        if let Some(t) = filter.bead_type {
            args.push(format!("--type={t}"));
        }
        if let Some(limit) = filter.limit {
            args.push(format!("--limit={limit}"));
        }
        self.run_json("list", &args)
    }

    fn ready(&self, label: &str, limit: usize) -> StoreResult<Vec<Bead>> {
        self.run_json(
            "ready",
            &[
                "--json".to_string(),
                format!("--label={label}"),
                format!("--limit={limit}"),
            ],
        )
    }

    fn close(&self, id: &str, reason: &str) -> StoreResult<()> {
        self.run("close", &[id.to_string(), format!("--reason={reason}")])
            .map(|_| ())
    }

    fn slot_get(&self, id: &str, slot: &str) -> StoreResult<Option<String>> {
        let stdout = self.run("slot", &["get".to_string(), id.to_string(), slot.to_string()])?;
        let value = String::from_utf8_lossy(&stdout).trim().to_string();
        Ok(if value.is_empty() { None } else { Some(value) })
    }

    fn slot_set(&self, id: &str, slot: &str, value: &str) -> StoreResult<()> {
        self.run(
            "slot",
            &["set".to_string(), id.to_string(), slot.to_string(), value.to_string()],
        )
        .map(|_| ())
    }

    fn create(&self, spec: &NewBead) -> StoreResult<String> {
        let mut args = vec![format!("--title={}", spec.title)];
        if let Some(id) = &spec.id {
            args.push(format!("--id={id}"));
        }
        if let Some(t) = spec.bead_type {
            args.push(format!("--type={t}"));
        }
        if let Some(parent) = &spec.parent {
            args.push(format!("--parent={parent}"));
        }
        for label in &spec.labels {
            args.push(format!("--add-label={label}"));
        }
        if !spec.description.is_empty() {
            args.push(format!("--description={}", spec.description));
        }
        let stdout = self.run("create", &args)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    fn cook(&self, formula: &str) -> StoreResult<()> {
        self.run("mol", &["cook".to_string(), formula.to_string()])
            .map(|_| ())
    }

    fn wisp(&self, formula: &str, vars: &BTreeMap<String, String>) -> StoreResult<String> {
        let mut args = vec!["wisp".to_string(), formula.to_string()];
        for (k, v) in vars {
            args.push(format!("--var={k}={v}"));
        }
        let stdout = self.run("mol", &args)?;
        Ok(String::from_utf8_lossy(&stdout).trim().to_string())
    }

    fn bond(&self, wisp_id: &str, bead_id: &str) -> StoreResult<()> {
        self.run("mol", &["bond".to_string(), wisp_id.to_string(), bead_id.to_string()])
            .map(|_| ())
    }
}

// ---------------------------------------------------------------------------
// MemStore: in-memory stub with fault injection
// ---------------------------------------------------------------------------

#[derive(Default)]
struct MemInner {
    beads: BTreeMap<String, Bead>,
    slots: BTreeMap<(String, String), String>,
    cooked: BTreeSet<String>,
    bonds: Vec<(String, String)>,
    next_id: u64,
    /// Updates to silently drop (accepted, not applied) — models lost
    /// writes under concurrency.
    drop_updates: u32,
    /// Updates to fail outright, after `skip_before_fail` successes.
    fail_updates: u32,
    skip_before_fail: u32,
}

/// In-memory `BeadStore` for tests and `GT_TEST_STORE=mem` runs.
pub struct MemStore {
    inner: Mutex<MemInner>,
}

impl Default for MemStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemStore {
    pub fn new() -> Self {
        Self { inner: Mutex::new(MemInner::default()) }
    }

    /// Seed a bead directly.
    pub fn put(&self, bead: Bead) {
        self.inner.lock().unwrap().beads.insert(bead.id.clone(), bead);
    }

    /// Accept but silently drop the next `n` updates.
    pub fn drop_next_updates(&self, n: u32) {
        self.inner.lock().unwrap().drop_updates = n;
    }

    /// Fail the next `n` updates with an error.
    pub fn fail_next_updates(&self, n: u32) {
        self.fail_after_updates(0, n);
    }

    /// Let `skip` updates through, then fail the following `n`.
    pub fn fail_after_updates(&self, skip: u32, n: u32) {
        let mut inner = self.inner.lock().unwrap();
        inner.skip_before_fail = skip;
        inner.fail_updates = n;
    }

    /// Wisps bonded to `bead_id`.
    pub fn bonds_for(&self, bead_id: &str) -> Vec<String> {
        self.inner
            .lock()
            .unwrap()
            .bonds
            .iter()
            .filter(|(_, b)| b == bead_id)
            .map(|(w, _)| w.clone())
            .collect()
    }

    fn matches(bead: &Bead, filter: &BeadFilter) -> bool {
        if let Some(status) = filter.status {
            if bead.status != status {
                return false;
            }
        }
        if let Some(label) = &filter.label {
            if !bead.labels.contains(label) {
                return false;
            }
        }
        if let Some(assignee) = &filter.assignee {
            if &bead.assignee != assignee {
                return false;
            }
        }
        if let Some(parent) = &filter.parent {
            if bead.parent.as_deref() != Some(parent.as_str()) {
                return false;
            }
        }
        if let Some(t) = filter.bead_type {
            if bead.bead_type != t {
                return false;
            }
        }
        true
    }
}

impl BeadStore for MemStore {
    fn show(&self, id: &str) -> StoreResult<Bead> {
        self.inner
            .lock()
            .unwrap()
            .beads
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    fn update(&self, id: &str, delta: &BeadDelta) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.skip_before_fail > 0 {
            inner.skip_before_fail -= 1;
        } else if inner.fail_updates > 0 {
            inner.fail_updates -= 1;
            return Err(StoreError::Injected);
        }
        if inner.drop_updates > 0 {
            inner.drop_updates -= 1;
            return Ok(());
        }
        let bead = inner
            .beads
            .get_mut(id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if let Some(status) = delta.status {
            bead.status = status;
        }
        if let Some(assignee) = &delta.assignee {
            bead.assignee = assignee.clone();
        }
        if let Some(description) = &delta.description {
            bead.description = description.clone();
        }
        for label in &delta.add_labels {
            bead.labels.insert(label.clone());
        }
        for label in &delta.remove_labels {
            bead.labels.remove(label);
        }
        Ok(())
    }

    fn list(&self, filter: &BeadFilter) -> StoreResult<Vec<Bead>> {
        let inner = self.inner.lock().unwrap();
        let mut out: Vec<Bead> = inner
            .beads
            .values()
            .filter(|b| Self::matches(b, filter))
            .cloned()
            .collect();
        if let Some(limit) = filter.limit {
            out.truncate(limit);
        }
        Ok(out)
    }

    fn ready(&self, label: &str, limit: usize) -> StoreResult<Vec<Bead>> {
        let inner = self.inner.lock().unwrap();
        let unblocked = |bead: &Bead| {
            bead.blocked_by.iter().all(|dep| {
                inner
                    .beads
                    .get(dep)
                    .map(|d| d.status == BeadStatus::Closed)
                    .unwrap_or(true)
            })
        };
        let mut out: Vec<Bead> = inner
            .beads
            .values()
            .filter(|b| b.status == BeadStatus::Open && b.labels.contains(label) && unblocked(b))
            .cloned()
            .collect();
        out.truncate(limit);
        Ok(out)
    }

    fn close(&self, id: &str, _reason: &str) -> StoreResult<()> {
        self.update(id, &BeadDelta::status(BeadStatus::Closed))
    }

    fn slot_get(&self, id: &str, slot: &str) -> StoreResult<Option<String>> {
        let inner = self.inner.lock().unwrap();
        if !inner.beads.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        Ok(inner
            .slots
            .get(&(id.to_string(), slot.to_string()))
            .filter(|v| !v.is_empty())
            .cloned())
    }

    fn slot_set(&self, id: &str, slot: &str, value: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.beads.contains_key(id) {
            return Err(StoreError::NotFound(id.to_string()));
        }
        inner
            .slots
            .insert((id.to_string(), slot.to_string()), value.to_string());
        Ok(())
    }

    fn create(&self, spec: &NewBead) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        let id = match &spec.id {
            Some(id) => id.clone(),
            None => {
                inner.next_id += 1;
                match spec.bead_type {
                    Some(BeadType::Convoy) => format!("hq-cv-{}", inner.next_id),
                    _ => format!("mem-{}", inner.next_id),
                }
            }
        };
        let bead = Bead {
            id: id.clone(),
            title: spec.title.clone(),
            status: BeadStatus::Open,
            assignee: String::new(),
            labels: spec.labels.iter().cloned().collect(),
            parent: spec.parent.clone(),
            blocked_by: Vec::new(),
            bead_type: spec.bead_type.unwrap_or(BeadType::Task),
            description: spec.description.clone(),
        };
        inner.beads.insert(id.clone(), bead);
        Ok(id)
    }

    fn cook(&self, formula: &str) -> StoreResult<()> {
        self.inner.lock().unwrap().cooked.insert(formula.to_string());
        Ok(())
    }

    fn wisp(&self, formula: &str, _vars: &BTreeMap<String, String>) -> StoreResult<String> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.cooked.contains(formula) {
            return Err(StoreError::Command {
                verb: "mol wisp".to_string(),
                stderr: format!("formula not cooked: {formula}"),
            });
        }
        inner.next_id += 1;
        let id = format!("wisp-{}", inner.next_id);
        let bead = Bead {
            id: id.clone(),
            title: format!("wisp of {formula}"),
            status: BeadStatus::Open,
            assignee: String::new(),
            labels: BTreeSet::new(),
            parent: None,
            blocked_by: Vec::new(),
            bead_type: BeadType::Task,
            description: String::new(),
        };
        inner.beads.insert(id.clone(), bead);
        Ok(id)
    }

    fn bond(&self, wisp_id: &str, bead_id: &str) -> StoreResult<()> {
        let mut inner = self.inner.lock().unwrap();
        if !inner.beads.contains_key(wisp_id) {
            return Err(StoreError::NotFound(wisp_id.to_string()));
        }
        inner.bonds.push((wisp_id.to_string(), bead_id.to_string()));
        Ok(())
    }
}

/// Build a task bead for tests and seeding.
pub fn task(id: &str, title: &str) -> Bead {
    Bead {
        id: id.to_string(),
        title: title.to_string(),
        status: BeadStatus::Open,
        assignee: String::new(),
        labels: BTreeSet::new(),
        parent: None,
        blocked_by: Vec::new(),
        bead_type: BeadType::Task,
        description: String::new(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_status_wire_strings() {
        assert_eq!(BeadStatus::StagedReady.as_str(), "staged_ready");
        let parsed: BeadStatus = serde_json::from_str("\"staged_warnings\"").unwrap();
        assert_eq!(parsed, BeadStatus::StagedWarnings);
    }

    #[test]
    fn test_mem_store_crud() {
        let store = MemStore::new();
        store.put(task("gt-1", "first"));

        let bead = store.show("gt-1").unwrap();
        assert_eq!(bead.title, "first");
        assert!(matches!(store.show("gt-404"), Err(StoreError::NotFound(_))));

        store
            .update(
                "gt-1",
                &BeadDelta {
                    status: Some(BeadStatus::Hooked),
                    assignee: Some("gastown/polecats/nux".into()),
                    ..Default::default()
                },
            )
            .unwrap();
        let bead = store.show("gt-1").unwrap();
        assert_eq!(bead.status, BeadStatus::Hooked);
        assert_eq!(bead.assignee, "gastown/polecats/nux");
    }

    #[test]
    fn test_mem_store_drops_updates_silently() {
        let store = MemStore::new();
        store.put(task("gt-1", "first"));
        store.drop_next_updates(1);

        store.update("gt-1", &BeadDelta::status(BeadStatus::Hooked)).unwrap();
        assert_eq!(store.show("gt-1").unwrap().status, BeadStatus::Open);

        store.update("gt-1", &BeadDelta::status(BeadStatus::Hooked)).unwrap();
        assert_eq!(store.show("gt-1").unwrap().status, BeadStatus::Hooked);
    }

    #[test]
    fn test_mem_store_ready_respects_blockers() {
        let store = MemStore::new();
        let mut a = task("gt-a", "a");
        a.labels.insert(LABEL_QUEUED.into());
        let mut b = task("gt-b", "b");
        b.labels.insert(LABEL_QUEUED.into());
        b.blocked_by.push("gt-a".into());
        store.put(a);
        store.put(b);

        let ready = store.ready(LABEL_QUEUED, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "gt-a");

        store.close("gt-a", "done").unwrap();
        let ready = store.ready(LABEL_QUEUED, 10).unwrap();
        assert_eq!(ready.len(), 1);
        assert_eq!(ready[0].id, "gt-b");
    }

    #[test]
    fn test_slots() {
        let store = MemStore::new();
        store.put(task("hq-agent-mayor", "mayor record"));
        assert_eq!(store.slot_get("hq-agent-mayor", "hook").unwrap(), None);
        store.slot_set("hq-agent-mayor", "hook", "gt-1").unwrap();
        assert_eq!(
            store.slot_get("hq-agent-mayor", "hook").unwrap(),
            Some("gt-1".to_string())
        );
        // Empty value reads back as no hook.
        store.slot_set("hq-agent-mayor", "hook", "").unwrap();
        assert_eq!(store.slot_get("hq-agent-mayor", "hook").unwrap(), None);
    }

    #[test]
    fn test_wisp_requires_cook() {
        let store = MemStore::new();
        assert!(store.wisp("mol-polecat-work", &BTreeMap::new()).is_err());
        store.cook("mol-polecat-work").unwrap();
        let wisp = store.wisp("mol-polecat-work", &BTreeMap::new()).unwrap();
        assert!(wisp.starts_with("wisp-"));
    }

    #[test]
    fn test_tracked_ids() {
        let mut convoy = task("hq-cv-1", "Work: things");
        convoy.bead_type = BeadType::Convoy;
        convoy.labels.insert(format!("{TRACKS_LABEL_PREFIX}gt-1"));
        convoy.labels.insert(format!("{TRACKS_LABEL_PREFIX}gt-2"));
        convoy.labels.insert("unrelated".into());
        let mut tracked = convoy.tracked_ids();
        tracked.sort();
        assert_eq!(tracked, vec!["gt-1", "gt-2"]);
        assert!(is_convoy_id("hq-cv-1"));
        assert!(!is_convoy_id("gt-1"));
    }
}
