//! The dispatch tick: drain `gt:queued` work into the sling pipeline
//! under the global polecat capacity.
//!
//! One tick at a time, town-wide: an exclusive file lock on
//! `.runtime/scheduler-dispatch.lock` guards the whole tick, and a
//! concurrent invocation simply reports zero work done. Per-item
//! failures never stop the tick; three strikes trips the circuit
//! breaker and the item leaves the queue under `gt:dispatch-failed`.

use std::collections::BTreeSet;
use std::fs::OpenOptions;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::Utc;
use fs2::FileExt;
use serde_json::json;
use tracing::{info, warn};

use crate::beads::{
    Bead, BeadDelta, BeadFilter, BeadStore, LABEL_DISPATCHED, LABEL_DISPATCH_FAILED, LABEL_QUEUED,
};
use crate::events::{self, Event, CHANNEL_SCHEDULER};
use crate::meta::SchedMeta;
use crate::scheduler::plan::{plan_dispatch, PlanReason};
use crate::scheduler::state::{update_state, SchedulerState};
use crate::session::Multiplexer;
use crate::sling::{self, SlingOptions, SlingRequest, WorkSource};
use crate::Town;

/// Dispatch failures after which the circuit breaker trips.
pub const MAX_DISPATCH_FAILURES: u32 = 3;

/// Upper bound on ready items considered per tick.
const READY_LIMIT: usize = 50;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TickSource {
    Heartbeat,
    Manual,
}

/// Why a tick did no work at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TickBlocked {
    /// Another dispatcher holds the lock.
    Locked,
    Paused { by: String },
    /// Direct-dispatch mode; `stranded` counts leftover queued items.
    DirectMode { stranded: usize },
}

#[derive(Debug, Default)]
pub struct TickOutcome {
    pub planned: Vec<String>,
    pub dispatched: Vec<String>,
    pub failed: Vec<(String, String)>,
    pub reason: Option<PlanReason>,
    pub blocked: Option<TickBlocked>,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TickOptions {
    /// Batch-size override; `None` (and CLI `0`) means config default.
    pub batch: Option<usize>,
    pub dry_run: bool,
}

/// Run one dispatch tick.
pub fn dispatch_scheduled_work(
    town: &Town,
    source: TickSource,
    opts: TickOptions,
) -> Result<TickOutcome> {
    // Cross-process exclusion for the whole tick.
    let lock_path = town.paths.dispatch_lock();
    if let Some(parent) = lock_path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let lock_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(false)
        .open(&lock_path)
        .with_context(|| format!("failed to open {}", lock_path.display()))?;
    if lock_file.try_lock_exclusive().is_err() {
        info!("dispatch lock held elsewhere; skipping tick");
        return Ok(TickOutcome { blocked: Some(TickBlocked::Locked), ..Default::default() });
    }
    // Lock released when lock_file drops at end of tick.
    let outcome = locked_tick(town, source, opts);
    drop(lock_file);
    outcome
}

fn locked_tick(town: &Town, source: TickSource, opts: TickOptions) -> Result<TickOutcome> {
    let store = town.store.as_ref();

    // Pause is checked once, at tick start; in-flight dispatches finish.
    let state = SchedulerState::load(&town.paths)?;
    if state.paused {
        info!(paused_by = %state.paused_by, "scheduler paused; skipping tick");
        return Ok(TickOutcome {
            blocked: Some(TickBlocked::Paused { by: state.paused_by }),
            ..Default::default()
        });
    }

    let max = town.config.max_polecats;
    let batch = match opts.batch {
        Some(n) if n > 0 => n,
        _ => town.config.batch_size,
    };

    if max <= 0 {
        let stranded = store
            .list(&BeadFilter { label: Some(LABEL_QUEUED.into()), ..Default::default() })?
            .len();
        if source == TickSource::Manual && stranded > 0 {
            warn!(
                stranded,
                "direct-dispatch mode but {stranded} item(s) carry {LABEL_QUEUED}; \
                 run `gt scheduler clear` or raise max_polecats"
            );
        }
        return Ok(TickOutcome {
            blocked: Some(TickBlocked::DirectMode { stranded }),
            ..Default::default()
        });
    }

    let active = count_active_polecats(town)?;
    let ready = ready_scheduled(town, opts.dry_run)?;
    let ready_ids: Vec<String> = ready.iter().map(|(b, _)| b.id.clone()).collect();

    let plan = plan_dispatch(max, batch, active, &ready_ids);
    info!(
        max,
        batch,
        active,
        ready = ready_ids.len(),
        planned = plan.to_dispatch.len(),
        reason = ?plan.reason,
        "dispatch plan"
    );

    let mut outcome = TickOutcome {
        planned: plan.to_dispatch.clone(),
        reason: Some(plan.reason),
        ..Default::default()
    };

    if opts.dry_run {
        return Ok(outcome);
    }

    let by_id: std::collections::BTreeMap<&str, &SchedMeta> =
        ready.iter().map(|(b, m)| (b.id.as_str(), m)).collect();
    let mut touched_rigs: BTreeSet<String> = BTreeSet::new();
    let planned_count = plan.to_dispatch.len();

    for (index, bead_id) in plan.to_dispatch.iter().enumerate() {
        let meta = match by_id.get(bead_id.as_str()) {
            Some(m) => (*m).clone(),
            None => continue,
        };

        let request = SlingRequest {
            work: WorkSource::Bead(bead_id.clone()),
            target: Some(meta.target_rig.clone()),
            opts: SlingOptions {
                formula: meta.formula.clone(),
                args: meta.args.clone(),
                vars: meta.vars.clone(),
                merge_strategy: meta.merge_strategy.clone(),
                owned: meta.owned,
                // The queue already ensured convoy tracking.
                no_convoy: true,
                ..Default::default()
            },
        };

        match sling::run_direct(town, &request) {
            Ok(_) => {
                finish_dispatched(town, bead_id)?;
                touched_rigs.insert(meta.target_rig.clone());
                outcome.dispatched.push(bead_id.clone());
            }
            Err(e) => {
                warn!(bead = %bead_id, "dispatch failed: {e:#}");
                record_dispatch_failure(town, bead_id, &format!("{e:#}"));
                outcome.failed.push((bead_id.clone(), format!("{e:#}")));
            }
        }

        // Space out spawns so the store and tmux get air.
        if index + 1 < planned_count && town.config.spawn_delay_ms > 0 {
            std::thread::sleep(Duration::from_millis(town.config.spawn_delay_ms));
        }
    }

    let dispatched = outcome.dispatched.len() as u64;
    if dispatched > 0 {
        update_state(&town.paths, |s| {
            s.last_dispatch_at = Some(Utc::now());
            s.last_dispatch_count = dispatched;
        })?;
    }

    wake_witnesses(town, &touched_rigs);
    Ok(outcome)
}

/// Active agents = live sessions whose role segment is `polecats`.
fn count_active_polecats(town: &Town) -> Result<usize> {
    Ok(town
        .mux
        .list_sessions()?
        .iter()
        .filter(|name| name.starts_with("gt-") && name.contains("-polecats-"))
        .count())
}

/// Ready queued items with parsed metadata, deduplicated across the
/// per-rig store partitions. Items past the failure limit are moved to
/// `gt:dispatch-failed` here (unless dry-run) and excluded.
fn ready_scheduled(town: &Town, dry_run: bool) -> Result<Vec<(Bead, SchedMeta)>> {
    let mut seen: BTreeSet<String> = BTreeSet::new();
    let mut out: Vec<(Bead, SchedMeta)> = Vec::new();

    for store in town.dispatch_stores() {
        for bead in store.ready(LABEL_QUEUED, READY_LIMIT)? {
            if !seen.insert(bead.id.clone()) {
                continue;
            }
            let Some(meta) = SchedMeta::parse(&bead.description) else {
                warn!(bead = %bead.id, "queued item has no scheduler metadata; skipping");
                continue;
            };
            if meta.dispatch_failures >= MAX_DISPATCH_FAILURES {
                if !dry_run {
                    trip_breaker(town.store.as_ref(), &bead.id);
                }
                continue;
            }
            out.push((bead, meta));
        }
    }
    Ok(out)
}

/// Swap `gt:queued` for `gt:dispatch-failed`.
fn trip_breaker(store: &dyn BeadStore, bead_id: &str) {
    warn!(bead = %bead_id, "circuit breaker: {MAX_DISPATCH_FAILURES} dispatch failures");
    if let Err(e) = store.update(
        bead_id,
        &BeadDelta {
            add_labels: vec![LABEL_DISPATCH_FAILED.to_string()],
            remove_labels: vec![LABEL_QUEUED.to_string()],
            ..Default::default()
        },
    ) {
        warn!(bead = %bead_id, "failed to mark dispatch-failed: {e}");
    }
}

/// Bump the failure count in metadata; trip the breaker at the limit.
fn record_dispatch_failure(town: &Town, bead_id: &str, reason: &str) {
    let store = town.store.as_ref();
    let result = (|| -> Result<u32> {
        let bead = store.show(bead_id)?;
        let mut meta = SchedMeta::parse(&bead.description)
            .unwrap_or_else(|| SchedMeta::for_rig(""));
        meta.dispatch_failures += 1;
        meta.last_failure = Some(reason.to_string());
        store.update(
            bead_id,
            &BeadDelta {
                description: Some(meta.append_to(&bead.description)),
                ..Default::default()
            },
        )?;
        Ok(meta.dispatch_failures)
    })();

    match result {
        Ok(failures) => {
            if failures >= MAX_DISPATCH_FAILURES {
                trip_breaker(store, bead_id);
            }
            if let Err(e) = events::emit(
                &town.paths,
                CHANNEL_SCHEDULER,
                &Event::new(
                    "scheduler.dispatch_failed",
                    json!({ "bead": bead_id, "failures": failures, "reason": reason }),
                ),
            ) {
                warn!("dispatch_failed event emit failed: {e:#}");
            }
        }
        Err(e) => warn!(bead = %bead_id, "could not record dispatch failure: {e:#}"),
    }
}

/// Post-dispatch bookkeeping: strip metadata, then swap
/// `gt:queued → gt:queue-dispatched`. The swap gets one retry; a second
/// failure force-strips `gt:queued` — preventing double dispatch matters
/// more than recording the dispatched state — and complains loudly.
fn finish_dispatched(town: &Town, bead_id: &str) -> Result<()> {
    let store = town.store.as_ref();

    match store.show(bead_id) {
        Ok(bead) => {
            let stripped = SchedMeta::strip(&bead.description);
            if stripped != bead.description {
                if let Err(e) = store.update(
                    bead_id,
                    &BeadDelta { description: Some(stripped), ..Default::default() },
                ) {
                    warn!(bead = %bead_id, "metadata strip failed: {e}");
                }
            }
        }
        Err(e) => warn!(bead = %bead_id, "metadata strip read failed: {e}"),
    }

    let swap = BeadDelta {
        add_labels: vec![LABEL_DISPATCHED.to_string()],
        remove_labels: vec![LABEL_QUEUED.to_string()],
        ..Default::default()
    };
    for attempt in 1..=2 {
        match store.update(bead_id, &swap) {
            Ok(()) => {
                if let Err(e) = events::emit(
                    &town.paths,
                    CHANNEL_SCHEDULER,
                    &Event::new("scheduler.dispatch", json!({ "bead": bead_id })),
                ) {
                    warn!("dispatch event emit failed: {e:#}");
                }
                return Ok(());
            }
            Err(e) if attempt == 1 => {
                warn!(bead = %bead_id, "label swap failed, retrying: {e}");
            }
            Err(e) => {
                warn!(
                    bead = %bead_id,
                    "label swap failed twice; force-stripping {LABEL_QUEUED} \
                     (item loses its {LABEL_DISPATCHED} marker): {e}"
                );
                if let Err(strip_err) = store.update(
                    bead_id,
                    &BeadDelta {
                        remove_labels: vec![LABEL_QUEUED.to_string()],
                        ..Default::default()
                    },
                ) {
                    warn!(bead = %bead_id, "force strip also failed: {strip_err}");
                }
                if let Err(emit_err) = events::emit(
                    &town.paths,
                    CHANNEL_SCHEDULER,
                    &Event::new(
                        "scheduler.dispatch_label_failed",
                        json!({ "bead": bead_id, "error": e.to_string() }),
                    ),
                ) {
                    warn!("dispatch_label_failed event emit failed: {emit_err:#}");
                }
                return Ok(());
            }
        }
    }
    Ok(())
}

/// Poke each rig's witness so it patrols the fresh work.
fn wake_witnesses(town: &Town, rigs: &BTreeSet<String>) {
    for rig in rigs {
        let session = format!("gt-{rig}-witness");
        match town.mux.has_session(&session) {
            Ok(true) => {
                let _ = town.mux.send_keys(&session, "New work dispatched; patrol when ready.");
                let _ = town.mux.send_enter(&session);
            }
            Ok(false) => {}
            Err(e) => warn!(session = %session, "witness wake failed: {e}"),
        }
    }
}
