//! The hook slot protocol.
//!
//! Each agent owns at most one active work item — its hook. The
//! authoritative record is the `hook` slot on the agent's record bead;
//! the work item's assignee field is a secondary index that can go stale
//! when agent names are recycled. Every read consults the agent record
//! first, and every attach/detach goes through this module.

use std::fmt;

use anyhow::{Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use crate::beads::{
    Bead, BeadDelta, BeadFilter, BeadStatus, BeadStore, BeadType, NewBead, StoreError,
};
use crate::identity::Address;
use crate::meta::DispatchRecord;
use crate::session::Multiplexer;
use crate::verify::verified_update;

/// Name of the hook slot on agent record beads.
pub const HOOK_SLOT: &str = "hook";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HookPolicy {
    /// Fail if the agent already holds a different, incomplete hook.
    Default,
    /// Skip (no-op) if the agent holds any hook.
    IfEmpty,
    /// Replace an existing hook, re-opening the previous work item.
    Upsert,
    /// Like upsert, plus a shutdown kick to the previous assignee.
    Force,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HookOutcome {
    Hooked,
    Skipped { current: String },
    Replaced { previous: String },
}

impl fmt::Display for HookOutcome {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            HookOutcome::Hooked => write!(f, "hooked"),
            HookOutcome::Skipped { current } => {
                write!(f, "skipped (hook_occupied, current={current})")
            }
            HookOutcome::Replaced { previous } => write!(f, "replaced (previous={previous})"),
        }
    }
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{agent} already holds {current}; use --upsert or --force to replace it")]
    Occupied { agent: String, current: String },
    #[error("cannot hook closed work item {0}")]
    Closed(String),
}

/// Fetch the agent's record bead, creating (or reopening) it if needed.
pub fn ensure_agent_bead(store: &dyn BeadStore, addr: &Address) -> Result<Bead> {
    let id = addr.agent_bead_id();
    match store.show(&id) {
        Ok(bead) if bead.is_closed() => {
            store.update(&id, &BeadDelta::status(BeadStatus::Open))?;
            Ok(store.show(&id)?)
        }
        Ok(bead) => Ok(bead),
        Err(StoreError::NotFound(_)) => {
            store.create(&NewBead {
                id: Some(id.clone()),
                title: format!("Agent {addr}"),
                bead_type: Some(BeadType::Agent),
                ..Default::default()
            })?;
            Ok(store.show(&id)?)
        }
        Err(e) => Err(e.into()),
    }
}

/// The agent's current hook: agent record first, assignee scan as the
/// compatibility fallback.
pub fn get_hook(store: &dyn BeadStore, addr: &Address) -> Result<Option<String>> {
    match store.slot_get(&addr.agent_bead_id(), HOOK_SLOT) {
        Ok(Some(hook)) => return Ok(Some(hook)),
        Ok(None) => {}
        Err(StoreError::NotFound(_)) => {}
        Err(e) => return Err(e.into()),
    }

    // Fallback can be stale once agent names are recycled; the agent
    // record above is the tiebreaker.
    let assigned = store.list(&BeadFilter {
        status: Some(BeadStatus::Hooked),
        assignee: Some(addr.to_string()),
        ..Default::default()
    })?;
    Ok(assigned.into_iter().next().map(|b| b.id))
}

/// Count of work items currently hooked to `addr` by assignee scan.
/// Used for the workload advisory only.
pub fn active_hook_count(store: &dyn BeadStore, addr: &Address) -> Result<usize> {
    Ok(store
        .list(&BeadFilter {
            status: Some(BeadStatus::Hooked),
            assignee: Some(addr.to_string()),
            ..Default::default()
        })?
        .len())
}

/// Whether the molecule attached to `bead` has run to completion (all
/// steps closed). Beads without a molecule are never complete.
fn molecule_complete(store: &dyn BeadStore, bead: &Bead) -> Result<bool> {
    let Some(record) = DispatchRecord::parse(&bead.description) else {
        return Ok(false);
    };
    let Some(wisp_id) = record.attached_molecule else {
        return Ok(false);
    };
    let steps = store.list(&BeadFilter {
        parent: Some(wisp_id.clone()),
        ..Default::default()
    })?;
    if steps.is_empty() {
        return Ok(match store.show(&wisp_id) {
            Ok(wisp) => wisp.is_closed(),
            Err(StoreError::NotFound(_)) => false,
            Err(e) => return Err(e.into()),
        });
    }
    Ok(steps.iter().all(Bead::is_closed))
}

/// Attach `work` as `addr`'s hook under `policy`.
///
/// On success the work item is `hooked`/assigned (verified write) and the
/// agent record's hook slot names it. Dry-run performs no writes and
/// reports the outcome the live run would produce.
pub fn hook(
    store: &dyn BeadStore,
    mux: &dyn Multiplexer,
    addr: &Address,
    work: &str,
    policy: HookPolicy,
    dry_run: bool,
) -> Result<HookOutcome> {
    let work_bead = store.show(work)?;
    if work_bead.is_closed() {
        return Err(HookError::Closed(work.to_string()).into());
    }

    let current = if dry_run {
        // Don't create the agent record during a dry run.
        match store.slot_get(&addr.agent_bead_id(), HOOK_SLOT) {
            Ok(v) => v,
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        }
    } else {
        let agent = ensure_agent_bead(store, addr)?;
        store.slot_get(&agent.id, HOOK_SLOT)?
    };

    let mut replaced = None;
    if let Some(previous) = current {
        if previous == work {
            // Idempotent self-hook.
            return Ok(HookOutcome::Hooked);
        }

        let prev_bead = match store.show(&previous) {
            Ok(b) => Some(b),
            Err(StoreError::NotFound(_)) => None,
            Err(e) => return Err(e.into()),
        };
        let prev_done = match &prev_bead {
            Some(b) => b.is_closed() || molecule_complete(store, b)?,
            None => true,
        };

        if prev_done {
            // Auto-replace: the previous hook finished its molecule but
            // was never closed out.
            if let Some(b) = &prev_bead {
                if !b.is_closed() && !dry_run {
                    store.close(&previous, "molecule complete")?;
                }
            }
            info!(agent = %addr, previous = %previous, "auto-replacing completed hook");
        } else {
            match policy {
                HookPolicy::IfEmpty => {
                    return Ok(HookOutcome::Skipped { current: previous });
                }
                HookPolicy::Default => {
                    return Err(HookError::Occupied {
                        agent: addr.to_string(),
                        current: previous,
                    }
                    .into());
                }
                HookPolicy::Upsert | HookPolicy::Force => {
                    if !dry_run {
                        release_work(store, &previous)?;
                        if policy == HookPolicy::Force {
                            kick_previous_assignee(mux, prev_bead.as_ref());
                        }
                    }
                    replaced = Some(previous);
                }
            }
        }
    }

    if dry_run {
        info!(agent = %addr, work, "dry-run: would hook");
        return Ok(match replaced {
            Some(previous) => HookOutcome::Replaced { previous },
            None => HookOutcome::Hooked,
        });
    }

    let assignee = addr.to_string();
    verified_update(
        store,
        work,
        &BeadDelta {
            status: Some(BeadStatus::Hooked),
            assignee: Some(assignee.clone()),
            ..Default::default()
        },
        |b| b.status == BeadStatus::Hooked && b.assignee == assignee,
    )
    .with_context(|| format!("hook write for {work} did not stick"))?;

    store.slot_set(&addr.agent_bead_id(), HOOK_SLOT, work)?;

    Ok(match replaced {
        Some(previous) => HookOutcome::Replaced { previous },
        None => HookOutcome::Hooked,
    })
}

/// Clear `addr`'s hook. With `expect`, only clears when the current hook
/// matches. Returns the work item that was released, if any.
pub fn unhook(
    store: &dyn BeadStore,
    addr: &Address,
    expect: Option<&str>,
    dry_run: bool,
) -> Result<Option<String>> {
    let current = get_hook(store, addr)?;
    let Some(work) = current else {
        return Ok(None);
    };
    if let Some(expected) = expect {
        if expected != work {
            anyhow::bail!("{addr} holds {work}, not {expected}; refusing to unhook");
        }
    }

    if dry_run {
        info!(agent = %addr, work, "dry-run: would unhook");
        return Ok(Some(work));
    }

    store.slot_set(&addr.agent_bead_id(), HOOK_SLOT, "")?;
    release_work(store, &work)?;
    Ok(Some(work))
}

/// Re-open a work item after its hook is released.
fn release_work(store: &dyn BeadStore, work: &str) -> Result<()> {
    match store.show(work) {
        Ok(bead) if !bead.is_closed() => verified_update(
            store,
            work,
            &BeadDelta {
                status: Some(BeadStatus::Open),
                assignee: Some(String::new()),
                ..Default::default()
            },
            |b| b.status == BeadStatus::Open && b.assignee.is_empty(),
        ),
        Ok(_) => Ok(()),
        Err(StoreError::NotFound(_)) => {
            warn!(work, "released hook points at a missing bead");
            Ok(())
        }
        Err(e) => Err(e.into()),
    }
}

/// Best-effort shutdown kick to the previous assignee's session.
fn kick_previous_assignee(mux: &dyn Multiplexer, prev: Option<&Bead>) {
    let Some(bead) = prev else { return };
    if bead.assignee.is_empty() {
        return;
    }
    let Ok(addr) = bead.assignee.parse::<Address>() else {
        warn!(assignee = %bead.assignee, "cannot parse previous assignee for shutdown kick");
        return;
    };
    let session = addr.session_name();
    if let Err(e) = mux.send_interrupt(&session) {
        warn!(session = %session, "shutdown kick failed: {e}");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::beads::{task, MemStore};
    use crate::session::StubMux;

    fn addr() -> Address {
        Address::polecat("gastown", "nux")
    }

    #[test]
    fn test_hook_sets_item_and_slot() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "work"));

        let outcome = hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();
        assert_eq!(outcome, HookOutcome::Hooked);

        let bead = store.show("gt-1").unwrap();
        assert_eq!(bead.status, BeadStatus::Hooked);
        assert_eq!(bead.assignee, "gastown/polecats/nux");
        assert_eq!(get_hook(&store, &addr()).unwrap(), Some("gt-1".to_string()));
    }

    #[test]
    fn test_if_empty_is_idempotent_and_skips_when_occupied() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "one"));
        store.put(task("gt-2", "two"));

        // Empty → hooks.
        let first = hook(&store, &mux, &addr(), "gt-1", HookPolicy::IfEmpty, false).unwrap();
        assert_eq!(first, HookOutcome::Hooked);
        // Occupied by the same item → still hooked (idempotent self).
        let again = hook(&store, &mux, &addr(), "gt-1", HookPolicy::IfEmpty, false).unwrap();
        assert_eq!(again, HookOutcome::Hooked);
        // Occupied by a different item → skipped, nothing mutated.
        let other = hook(&store, &mux, &addr(), "gt-2", HookPolicy::IfEmpty, false).unwrap();
        assert_eq!(other, HookOutcome::Skipped { current: "gt-1".to_string() });
        assert_eq!(store.show("gt-2").unwrap().status, BeadStatus::Open);
    }

    #[test]
    fn test_default_policy_fails_when_occupied() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "one"));
        store.put(task("gt-2", "two"));

        hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();
        let err = hook(&store, &mux, &addr(), "gt-2", HookPolicy::Default, false).unwrap_err();
        assert!(err.to_string().contains("already holds gt-1"));
    }

    #[test]
    fn test_upsert_replaces_and_reopens_previous() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "one"));
        store.put(task("gt-2", "two"));

        hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();
        let outcome = hook(&store, &mux, &addr(), "gt-2", HookPolicy::Upsert, false).unwrap();
        assert_eq!(outcome, HookOutcome::Replaced { previous: "gt-1".to_string() });

        let prev = store.show("gt-1").unwrap();
        assert_eq!(prev.status, BeadStatus::Open);
        assert!(prev.assignee.is_empty());
        assert_eq!(store.show("gt-2").unwrap().status, BeadStatus::Hooked);
        assert_eq!(get_hook(&store, &addr()).unwrap(), Some("gt-2".to_string()));
    }

    #[test]
    fn test_force_kicks_previous_assignee() {
        let store = MemStore::new();
        let mux = StubMux::new().with_session("gt-gastown-polecats-nux");
        store.put(task("gt-1", "one"));
        store.put(task("gt-2", "two"));

        hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();
        hook(&store, &mux, &addr(), "gt-2", HookPolicy::Force, false).unwrap();
        assert!(mux
            .sent()
            .contains(&("gt-gastown-polecats-nux".to_string(), "<C-c>".to_string())));
    }

    #[test]
    fn test_auto_replace_when_molecule_complete() {
        let store = MemStore::new();
        let mux = StubMux::new();

        let mut prev = task("gt-1", "one");
        prev.description = DispatchRecord {
            attached_molecule: Some("wisp-1".into()),
            ..Default::default()
        }
        .append_to("");
        store.put(prev);
        let mut wisp = task("wisp-1", "wisp");
        wisp.status = BeadStatus::Closed;
        store.put(wisp);
        store.put(task("gt-2", "two"));

        hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();
        // gt-1's molecule is complete, so even the default policy replaces.
        let outcome = hook(&store, &mux, &addr(), "gt-2", HookPolicy::Default, false).unwrap();
        assert_eq!(outcome, HookOutcome::Hooked);
        assert!(store.show("gt-1").unwrap().is_closed());
    }

    #[test]
    fn test_unhook_conditional() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "one"));
        hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap();

        // Wrong expectation refuses.
        assert!(unhook(&store, &addr(), Some("gt-9"), false).is_err());
        // Matching expectation releases.
        let released = unhook(&store, &addr(), Some("gt-1"), false).unwrap();
        assert_eq!(released, Some("gt-1".to_string()));
        assert_eq!(store.show("gt-1").unwrap().status, BeadStatus::Open);
        assert_eq!(get_hook(&store, &addr()).unwrap(), None);
    }

    #[test]
    fn test_dry_run_never_mutates() {
        let store = MemStore::new();
        let mux = StubMux::new();
        store.put(task("gt-1", "one"));

        let outcome = hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, true).unwrap();
        assert_eq!(outcome, HookOutcome::Hooked);
        assert_eq!(store.show("gt-1").unwrap().status, BeadStatus::Open);
        // No agent record was created.
        assert!(matches!(
            store.show(&addr().agent_bead_id()),
            Err(StoreError::NotFound(_))
        ));
    }

    #[test]
    fn test_get_hook_falls_back_to_assignee_scan() {
        let store = MemStore::new();
        let mut orphan = task("gt-7", "orphan");
        orphan.status = BeadStatus::Hooked;
        orphan.assignee = addr().to_string();
        store.put(orphan);

        assert_eq!(get_hook(&store, &addr()).unwrap(), Some("gt-7".to_string()));
    }

    #[test]
    fn test_closed_work_rejected() {
        let store = MemStore::new();
        let mux = StubMux::new();
        let mut closed = task("gt-1", "done");
        closed.status = BeadStatus::Closed;
        store.put(closed);

        let err = hook(&store, &mux, &addr(), "gt-1", HookPolicy::Default, false).unwrap_err();
        assert!(err.to_string().contains("closed"));
    }
}
