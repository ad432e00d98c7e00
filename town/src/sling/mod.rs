//! Sling: the atomic "attach work W to agent A" operation.
//!
//! One pipeline, invoked inline (direct mode), from the scheduler's
//! dispatch tick, and from convoy launches. Order matters: everything
//! that can fail — work validation, convoy bookkeeping, formula
//! instantiation — happens before any agent session is created, so a
//! failed sling never leaves an orphan session. After the hook write the
//! work is considered attached; remaining steps downgrade to warnings.

pub mod target;

use std::collections::BTreeMap;

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::beads::{
    Bead, BeadDelta, BeadFilter, BeadStatus, BeadStore, BeadType, NewBead, StoreError,
    TRACKS_LABEL_PREFIX,
};
use crate::hook::{self, HookPolicy};
use crate::identity::{self, Address, Role};
use crate::meta::DispatchRecord;
use crate::scheduler::queue::{schedule_bead, EnqueueOptions};
use crate::session::{wait_for_agent_ready, Multiplexer, AGENT_START_TIMEOUT};
use crate::spawn::{spawn_agent, SpawnOptions};
use crate::verify::verified_update;
use crate::Town;

pub use target::{mint_polecat_name, resolve_target, ResolvedTarget};

/// Formula implicitly attached to polecat targets.
pub const DEFAULT_POLECAT_FORMULA: &str = "mol-polecat-work";

/// Active-hook count at which the batching advisory fires.
const WORKLOAD_ADVISORY: usize = 3;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WorkSource {
    /// An existing work item.
    Bead(String),
    /// A formula; the instantiated wisp root becomes the work.
    Formula(String),
}

#[derive(Debug, Clone, Default)]
pub struct SlingOptions {
    pub force: bool,
    pub dry_run: bool,
    /// Raw extra args recorded on the work item and passed to the agent.
    pub args: Vec<String>,
    pub subject: Option<String>,
    /// Agent command override for spawned sessions.
    pub agent_type: Option<String>,
    pub account: Option<String>,
    /// Explicit convoy; suppresses auto-convoy creation.
    pub convoy: Option<String>,
    pub no_convoy: bool,
    /// Formula to instantiate on the bead (`--on`).
    pub formula: Option<String>,
    /// Hook the bare bead even on polecat targets (no default formula).
    pub raw_hook: bool,
    pub merge_strategy: Option<String>,
    pub no_merge: bool,
    pub owned: bool,
    pub vars: BTreeMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct SlingRequest {
    pub work: WorkSource,
    pub target: Option<String>,
    pub opts: SlingOptions,
}

#[derive(Debug)]
pub struct SlingOutcome {
    pub bead: String,
    /// `None` when the work was queued rather than dispatched.
    pub target: Option<Address>,
    pub convoy: Option<String>,
    pub wisp: Option<String>,
    pub spawned: bool,
    pub queued: bool,
    /// Step plan; populated on dry runs.
    pub plan: Vec<String>,
}

/// Entry point: queues in deferred mode, dispatches inline otherwise.
pub fn run(town: &Town, req: &SlingRequest) -> Result<SlingOutcome> {
    guard_polecat()?;

    if town.config.deferred_dispatch() && !req.opts.dry_run {
        if let WorkSource::Bead(id) = &req.work {
            let rig = rig_for_request(town, req, id)?;
            schedule_bead(
                town,
                id,
                &EnqueueOptions {
                    rig,
                    formula: req.opts.formula.clone(),
                    args: req.opts.args.clone(),
                    vars: req.opts.vars.clone(),
                    merge_strategy: req.opts.merge_strategy.clone(),
                    owned: req.opts.owned,
                    force: req.opts.force,
                    convoy: req.opts.convoy.clone(),
                    no_convoy: req.opts.no_convoy,
                },
            )?;
            return Ok(SlingOutcome {
                bead: id.clone(),
                target: None,
                convoy: req.opts.convoy.clone(),
                wisp: None,
                spawned: false,
                queued: true,
                plan: Vec::new(),
            });
        }
    }

    run_direct(town, req)
}

fn rig_for_request(town: &Town, req: &SlingRequest, bead_id: &str) -> Result<String> {
    if let Some(raw) = req.target.as_deref() {
        if town.config.is_rig(raw) {
            return Ok(raw.to_string());
        }
        if let Ok(addr) = raw.parse::<Address>() {
            if let Some(rig) = addr.rig {
                return Ok(rig);
            }
        }
    }
    town.config
        .rig_for_bead(bead_id)
        .map(String::from)
        .with_context(|| format!("no rig resolves {bead_id}; name one explicitly"))
}

/// The full inline pipeline; used by the dispatch tick and direct mode.
pub fn run_direct(town: &Town, req: &SlingRequest) -> Result<SlingOutcome> {
    guard_polecat()?;
    let store = town.store.as_ref();
    let opts = &req.opts;
    let mut plan: Vec<String> = Vec::new();

    // -- Pre-checks on the work item (before any state change) ----------
    let (work_id, work_bead, from_formula) = match &req.work {
        WorkSource::Bead(id) => {
            let bead = store.show(id)?;
            if bead.is_closed() {
                bail!("work item {id} is closed");
            }
            if matches!(bead.status, BeadStatus::Hooked | BeadStatus::Pinned) && !opts.force {
                bail!(
                    "work item {id} is {} to {}; pass --force to take it",
                    bead.status,
                    if bead.assignee.is_empty() { "someone" } else { bead.assignee.as_str() }
                );
            }
            (id.clone(), Some(bead), false)
        }
        WorkSource::Formula(_) => (String::new(), None, true),
    };

    if let Some(bead) = &work_bead {
        if matches!(bead.status, BeadStatus::Hooked | BeadStatus::Pinned) && opts.force {
            if opts.dry_run {
                plan.push(format!("would take {} from {}", bead.id, bead.assignee));
            } else {
                take_from_current_assignee(town, bead);
            }
        }
    }

    // -- Target resolution ---------------------------------------------
    let resolved = resolve_target(town, req.target.as_deref())?;
    let addr = resolved.address().clone();
    plan.push(format!("target {addr}"));

    // -- Workload advisory (never blocks) ------------------------------
    if matches!(resolved, ResolvedTarget::Existing(_)) && opts.convoy.is_none() {
        if let Ok(count) = hook::active_hook_count(store, &addr) {
            if count >= WORKLOAD_ADVISORY {
                warn!(
                    target = %addr,
                    count,
                    "target already carries {count} hooked items; consider batching into a convoy"
                );
            }
        }
    }

    // -- Auto-convoy (best-effort, skipped for formula work) -----------
    let convoy = if from_formula || opts.no_convoy {
        None
    } else if let Some(explicit) = &opts.convoy {
        Some(explicit.clone())
    } else if opts.dry_run {
        plan.push(format!("would ensure a convoy tracks {work_id}"));
        None
    } else {
        ensure_convoy(store, work_bead.as_ref().map(|b| (b.id.as_str(), b.title.as_str())))
    };

    // -- Formula instantiation (before any spawn) ----------------------
    let is_polecat_target = addr.role == Role::Polecat;
    let formula = match &req.work {
        WorkSource::Formula(f) => Some(f.clone()),
        WorkSource::Bead(_) => opts.formula.clone().or_else(|| {
            (is_polecat_target && !opts.raw_hook).then(|| DEFAULT_POLECAT_FORMULA.to_string())
        }),
    };

    let mut wisp = None;
    let work_id = if let Some(formula) = &formula {
        if opts.dry_run {
            plan.push(format!("would cook {formula} and bond a wisp"));
            work_id
        } else {
            store.cook(formula).with_context(|| format!("cooking {formula}"))?;
            let mut vars = opts.vars.clone();
            match &work_bead {
                Some(bead) => {
                    vars.entry("feature".into()).or_insert_with(|| bead.title.clone());
                    vars.entry("issue".into()).or_insert_with(|| bead.id.clone());
                }
                None => {
                    let feature = opts.subject.clone().unwrap_or_else(|| formula.clone());
                    vars.entry("feature".into()).or_insert(feature);
                }
            }
            let wisp_id = store
                .wisp(formula, &vars)
                .with_context(|| format!("instantiating {formula}"))?;
            if let Some(bead) = &work_bead {
                // The base bead stays the hook target; the wisp rides along.
                store
                    .bond(&wisp_id, &bead.id)
                    .with_context(|| format!("bonding {wisp_id} to {}", bead.id))?;
                record_molecule(store, &bead.id, &wisp_id);
                wisp = Some(wisp_id);
                work_id
            } else {
                // Formula-only sling: hook the wisp root itself.
                wisp = Some(wisp_id.clone());
                wisp_id
            }
        }
    } else {
        work_id
    };

    // -- Deferred spawn (only now that everything validated) -----------
    let mut spawned = false;
    let mut prestamped = false;
    if resolved.needs_spawn() {
        if opts.dry_run {
            plan.push(format!("would spawn session {}", addr.session_name()));
        } else {
            let hook_bead = matches!(resolved, ResolvedTarget::SpawnPolecat(_))
                .then_some(work_id.as_str());
            spawn_agent(
                town,
                &addr,
                &SpawnOptions {
                    hook_bead,
                    agent_type: opts.agent_type.as_deref(),
                    account: opts.account.as_deref(),
                },
            )?;
            spawned = true;
            prestamped = hook_bead.is_some();
        }
    }

    // -- Hook write (verified) -----------------------------------------
    if opts.dry_run {
        let shown = if work_id.is_empty() { "<wisp>" } else { work_id.as_str() };
        plan.push(format!("would hook {shown} to {addr}"));
        plan.push(format!("would nudge {}", addr.session_name()));
        info!(work = %work_id, target = %addr, "dry-run sling");
        return Ok(SlingOutcome {
            bead: work_id,
            target: Some(addr),
            convoy,
            wisp,
            spawned: false,
            queued: false,
            plan,
        });
    }

    if prestamped {
        // The agent record was stamped at spawn; write the work item.
        let assignee = addr.to_string();
        verified_update(
            store,
            &work_id,
            &BeadDelta {
                status: Some(BeadStatus::Hooked),
                assignee: Some(assignee.clone()),
                ..Default::default()
            },
            |b| b.status == BeadStatus::Hooked && b.assignee == assignee,
        )?;
    } else {
        let policy = if opts.force { HookPolicy::Force } else { HookPolicy::Default };
        hook::hook(store, town.mux.as_ref(), &addr, &work_id, policy, false)?;
    }

    // -- Side records (warn-only from here on) -------------------------
    write_side_records(store, &work_id, opts, wisp.as_deref());

    // -- Nudge ---------------------------------------------------------
    if let Err(e) = nudge(town, &addr, &work_id, opts.agent_type.as_deref()) {
        warn!(target = %addr, work = %work_id, "nudge failed (agent will self-discover): {e:#}");
    }

    info!(work = %work_id, target = %addr, spawned, "slung");
    Ok(SlingOutcome {
        bead: work_id,
        target: Some(addr),
        convoy,
        wisp,
        spawned,
        queued: false,
        plan,
    })
}

fn guard_polecat() -> Result<()> {
    if identity::is_polecat() {
        bail!("polecats may not sling; ask the mayor or your witness");
    }
    Ok(())
}

/// Force-take a hooked item: best-effort shutdown kick, then clear the
/// current assignee's hook.
fn take_from_current_assignee(town: &Town, bead: &Bead) {
    if bead.assignee.is_empty() {
        return;
    }
    let Ok(prev) = bead.assignee.parse::<Address>() else {
        warn!(assignee = %bead.assignee, "cannot parse current assignee; leaving its hook");
        return;
    };
    if let Err(e) = town.mux.send_interrupt(&prev.session_name()) {
        warn!(session = %prev.session_name(), "shutdown kick failed: {e}");
    }
    if let Err(e) = hook::unhook(town.store.as_ref(), &prev, Some(&bead.id), false) {
        warn!(agent = %prev, "failed to clear previous hook: {e:#}");
    }
}

/// Convenience for callers that only have the bead id (the enqueue
/// path). Same best-effort semantics as the inline pipeline.
pub fn ensure_convoy_for(store: &dyn BeadStore, bead_id: &str) -> Option<String> {
    let bead = store.show(bead_id).ok()?;
    ensure_convoy(store, Some((bead.id.as_str(), bead.title.as_str())))
}

/// Make sure some convoy tracks `work`. Conflict-tolerant and
/// best-effort: a failure here never aborts the sling.
fn ensure_convoy(store: &dyn BeadStore, work: Option<(&str, &str)>) -> Option<String> {
    let (id, title) = work?;
    let tracks = format!("{TRACKS_LABEL_PREFIX}{id}");
    let find = |store: &dyn BeadStore| -> Option<String> {
        store
            .list(&BeadFilter {
                bead_type: Some(BeadType::Convoy),
                label: Some(tracks.clone()),
                ..Default::default()
            })
            .ok()?
            .into_iter()
            .next()
            .map(|b| b.id)
    };

    if let Some(existing) = find(store) {
        info!(work = %id, convoy = %existing, "already tracked by a convoy");
        return Some(existing);
    }

    match store.create(&NewBead {
        title: format!("Work: {title}"),
        bead_type: Some(BeadType::Convoy),
        labels: vec![tracks.clone()],
        ..Default::default()
    }) {
        Ok(convoy) => {
            info!(work = %id, convoy = %convoy, "created auto-convoy");
            Some(convoy)
        }
        Err(e) => {
            // Concurrent enqueue may have won the race; accept theirs.
            if let Some(existing) = find(store) {
                return Some(existing);
            }
            warn!(work = %id, "auto-convoy creation failed: {e}");
            None
        }
    }
}

fn record_molecule(store: &dyn BeadStore, work: &str, wisp: &str) {
    let record_write = (|| -> Result<(), StoreError> {
        let bead = store.show(work)?;
        let mut record = DispatchRecord::parse(&bead.description).unwrap_or_default();
        record.attached_molecule = Some(wisp.to_string());
        store.update(
            work,
            &BeadDelta {
                description: Some(record.append_to(&bead.description)),
                ..Default::default()
            },
        )
    })();
    if let Err(e) = record_write {
        warn!(work, wisp, "failed to record attached molecule: {e}");
    }
}

fn write_side_records(store: &dyn BeadStore, work: &str, opts: &SlingOptions, wisp: Option<&str>) {
    let write = (|| -> Result<(), StoreError> {
        let bead = store.show(work)?;
        let mut record = DispatchRecord::parse(&bead.description).unwrap_or_default();
        record.dispatcher = Some(identity::self_address().to_string());
        if !opts.args.is_empty() {
            record.raw_args =
                Some(shlex::try_join(opts.args.iter().map(String::as_str)).unwrap_or_default());
        }
        record.no_merge = opts.no_merge;
        record.merge_strategy = opts.merge_strategy.clone();
        record.owned = opts.owned;
        if let Some(wisp) = wisp {
            record.attached_molecule = Some(wisp.to_string());
        }
        store.update(
            work,
            &BeadDelta {
                description: Some(record.append_to(&bead.description)),
                ..Default::default()
            },
        )
    })();
    if let Err(e) = write {
        warn!(work, "side-record write failed: {e}");
    }
}

/// Wake the agent and hand it the work: wait out the shell → agent
/// transition, settle, then a two-phase send (literal text, then Enter).
fn nudge(town: &Town, addr: &Address, work: &str, agent_type: Option<&str>) -> Result<()> {
    let session = addr.session_name();
    if !town.mux.has_session(&session)? {
        bail!("no session {session}");
    }
    wait_for_agent_ready(town.mux.as_ref(), &session, AGENT_START_TIMEOUT)?;

    // Default agent fronts a permission prompt on first start.
    if agent_type.is_none() {
        let _ = town.mux.send_enter(&session);
    }

    let settle = std::env::var("GT_NUDGE_SETTLE_MS")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(2000u64);
    std::thread::sleep(std::time::Duration::from_millis(settle));

    let title = town
        .store
        .show(work)
        .map(|b| b.title)
        .unwrap_or_default();
    let prompt = format!("You are {addr}. Your hook is {work}: {title}. Run `gt hook` for details and begin.");
    town.mux.send_keys(&session, &prompt)?;
    town.mux.send_enter(&session)?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct BatchReport {
    pub succeeded: Vec<SlingOutcome>,
    pub failed: Vec<(String, String)>,
}

/// Batch mode: each work item gets its own spawn; per-item failures do
/// not stop the rest.
pub fn run_batch(
    town: &Town,
    beads: &[String],
    target: Option<&str>,
    opts: &SlingOptions,
) -> BatchReport {
    let mut report = BatchReport::default();
    for bead in beads {
        let req = SlingRequest {
            work: WorkSource::Bead(bead.clone()),
            target: target.map(String::from),
            opts: opts.clone(),
        };
        match run(town, &req) {
            Ok(outcome) => report.succeeded.push(outcome),
            Err(e) => {
                warn!(bead = %bead, "batch sling failed: {e:#}");
                report.failed.push((bead.clone(), format!("{e:#}")));
            }
        }
    }
    report
}
