//! Staging and launch: validate a convoy's plan without dispatching,
//! then dispatch Wave 1 from the staged record.
//!
//! Staging computes the DAG, partitions waves, and persists the layering
//! in the convoy bead's `waves` slot. Launch is deliberately dumb: it
//! transitions the convoy and dispatches the persisted Wave 1 without
//! re-listing children or re-planning — the staged record is
//! authoritative.

use anyhow::{bail, Context, Result};
use thiserror::Error;
use tracing::{info, warn};

use super::dag::{collect, ConvoyDag};
use super::waves::compute_waves;
use crate::beads::{
    BeadDelta, BeadFilter, BeadStatus, BeadStore, BeadType, NewBead, StoreError, LABEL_QUEUED,
    TRACKS_LABEL_PREFIX,
};
use crate::scheduler::queue::{schedule_bead, EnqueueOptions};
use crate::sling::{SlingOptions, SlingRequest, WorkSource};
use crate::verify::verified_update;
use crate::Town;

/// Slot holding the persisted wave layering (JSON `[[id, ...], ...]`).
pub const WAVES_SLOT: &str = "waves";
/// Slot holding staging warnings (JSON `[string, ...]`).
pub const WARNINGS_SLOT: &str = "stage_warnings";

/// Bound on concurrent sling operations during a wave dispatch.
pub const CONCURRENT_STARTS: usize = 8;

#[derive(Debug, Error)]
#[error("convoy cannot move {from} → {to}")]
pub struct TransitionError {
    pub from: BeadStatus,
    pub to: BeadStatus,
}

/// Validate a convoy status transition.
///
/// ```text
/// staged_ready ↔ staged_warnings        (re-stage)
/// staged_*     → open | closed          (launch / cancel)
/// open         ↔ closed
/// x            → x                      (identity)
/// open|closed  → staged_*               forbidden
/// ```
pub fn validate_transition(from: BeadStatus, to: BeadStatus) -> Result<(), TransitionError> {
    use BeadStatus::*;
    if from == to {
        return Ok(());
    }
    let ok = matches!(
        (from, to),
        (StagedReady, StagedWarnings)
            | (StagedWarnings, StagedReady)
            | (StagedReady, Open)
            | (StagedWarnings, Open)
            | (StagedReady, Closed)
            | (StagedWarnings, Closed)
            | (Open, Closed)
            | (Closed, Open)
    );
    if ok {
        Ok(())
    } else {
        Err(TransitionError { from, to })
    }
}

#[derive(Debug)]
pub struct StageOutcome {
    pub convoy_id: String,
    pub status: BeadStatus,
    pub waves: Vec<Vec<String>>,
    pub warnings: Vec<String>,
}

/// Stage a plan: compute the DAG and waves for `inputs`, validate, and
/// persist the layering on the convoy bead.
///
/// A single convoy-id input re-stages that convoy; any other input set
/// gets a convoy created for it. `force` downgrades unresolved rigs from
/// a hard failure to a warning.
pub fn stage(town: &Town, inputs: &[String], force: bool) -> Result<StageOutcome> {
    let store = town.store.as_ref();
    let report = collect(store, &town.config, inputs)?;

    let mut warnings = report.warnings;
    if !report.unresolved_rigs.is_empty() {
        let msg = format!(
            "no rig resolves: {}",
            report.unresolved_rigs.join(", ")
        );
        if force {
            warnings.push(msg);
        } else {
            bail!("{msg} (re-run with --force to stage anyway)");
        }
    }

    let waves = compute_waves(&report.dag)?;

    let (convoy_id, existing_status) = resolve_convoy(store, inputs, &report.dag)?;
    if let Some(from) = existing_status {
        let to = if warnings.is_empty() {
            BeadStatus::StagedReady
        } else {
            BeadStatus::StagedWarnings
        };
        validate_transition(from, to)?;
    }

    let status = if warnings.is_empty() {
        BeadStatus::StagedReady
    } else {
        BeadStatus::StagedWarnings
    };
    store.update(&convoy_id, &BeadDelta::status(status))?;
    store.slot_set(&convoy_id, WAVES_SLOT, &serde_json::to_string(&waves)?)?;
    store.slot_set(&convoy_id, WARNINGS_SLOT, &serde_json::to_string(&warnings)?)?;

    info!(
        convoy = %convoy_id,
        waves = waves.len(),
        items = waves.iter().map(Vec::len).sum::<usize>(),
        %status,
        "staged"
    );
    Ok(StageOutcome { convoy_id, status, waves, warnings })
}

/// Find or create the convoy bead for a staging run.
fn resolve_convoy(
    store: &dyn BeadStore,
    inputs: &[String],
    dag: &ConvoyDag,
) -> Result<(String, Option<BeadStatus>)> {
    if let [single] = inputs {
        let bead = store.show(single)?;
        if bead.bead_type == BeadType::Convoy {
            return Ok((bead.id, Some(bead.status)));
        }
    }

    let title = match dag.nodes.values().next() {
        Some(node) if dag.nodes.len() == 1 => format!("Work: {}", node.title),
        _ => format!("Convoy of {} items", dag.nodes.len()),
    };
    let labels = dag
        .ids()
        .into_iter()
        .map(|id| format!("{TRACKS_LABEL_PREFIX}{id}"))
        .collect();
    let convoy_id = store.create(&NewBead {
        title,
        bead_type: Some(BeadType::Convoy),
        labels,
        ..Default::default()
    })?;
    // Freshly created; no transition to validate.
    Ok((convoy_id, None))
}

#[derive(Debug, Default)]
pub struct WaveReport {
    pub dispatched: Vec<String>,
    pub queued: Vec<String>,
    pub failed: Vec<(String, String)>,
}

#[derive(Debug)]
pub struct LaunchOutcome {
    pub convoy_id: String,
    pub wave: WaveReport,
}

/// Launch a staged convoy: transition to open and dispatch the persisted
/// Wave 1. Never re-plans.
pub async fn launch(town: &Town, convoy_id: &str, force: bool) -> Result<LaunchOutcome> {
    let store = town.store.as_ref();
    let convoy = store.show(convoy_id)?;
    if convoy.bead_type != BeadType::Convoy {
        bail!("{convoy_id} is not a convoy");
    }

    match convoy.status {
        BeadStatus::Open => bail!("convoy {convoy_id} is already launched"),
        BeadStatus::Closed => bail!("convoy {convoy_id} is closed"),
        BeadStatus::StagedWarnings if !force => {
            let warnings = load_warnings(store, convoy_id)?;
            bail!(
                "convoy {convoy_id} staged with warnings ({}); pass --force to launch",
                warnings.join("; ")
            );
        }
        BeadStatus::StagedReady | BeadStatus::StagedWarnings => {}
        other => bail!("convoy {convoy_id} has unexpected status {other}"),
    }
    validate_transition(convoy.status, BeadStatus::Open)?;

    let waves = load_waves(store, convoy_id)?
        .with_context(|| format!("convoy {convoy_id} has no staged waves; re-run stage"))?;

    verified_update(store, convoy_id, &BeadDelta::status(BeadStatus::Open), |b| {
        b.status == BeadStatus::Open
    })?;

    let first = waves.first().cloned().unwrap_or_default();
    let wave = dispatch_wave(town, convoy_id, &first).await;
    info!(
        convoy = %convoy_id,
        dispatched = wave.dispatched.len(),
        queued = wave.queued.len(),
        failed = wave.failed.len(),
        "launched"
    );
    Ok(LaunchOutcome { convoy_id: convoy_id.to_string(), wave })
}

pub fn load_waves(store: &dyn BeadStore, convoy_id: &str) -> Result<Option<Vec<Vec<String>>>> {
    match store.slot_get(convoy_id, WAVES_SLOT)? {
        Some(raw) => Ok(Some(
            serde_json::from_str(&raw).context("corrupt waves slot")?,
        )),
        None => Ok(None),
    }
}

fn load_warnings(store: &dyn BeadStore, convoy_id: &str) -> Result<Vec<String>> {
    match store.slot_get(convoy_id, WARNINGS_SLOT)? {
        Some(raw) => Ok(serde_json::from_str(&raw).unwrap_or_default()),
        None => Ok(Vec::new()),
    }
}

/// Dispatch one wave of items. Direct mode slings in parallel, bounded
/// by [`CONCURRENT_STARTS`]; scheduler mode enqueues serially (cheap).
/// Per-item failures never abort the wave.
pub async fn dispatch_wave(town: &Town, convoy_id: &str, items: &[String]) -> WaveReport {
    let mut report = WaveReport::default();

    if town.config.deferred_dispatch() {
        for id in items {
            match enqueue_item(town, convoy_id, id) {
                Ok(()) => report.queued.push(id.clone()),
                Err(e) => {
                    warn!(bead = %id, "enqueue failed: {e:#}");
                    report.failed.push((id.clone(), format!("{e:#}")));
                }
            }
        }
        return report;
    }

    use futures::StreamExt;

    let bound = CONCURRENT_STARTS.min(items.len().max(1));
    let results: Vec<(String, Result<()>)> =
        futures::stream::iter(items.iter().cloned().map(|id| {
            let town = town.clone();
            let convoy = convoy_id.to_string();
            async move {
                let work = id.clone();
                let joined = tokio::task::spawn_blocking(move || {
                    let rig = town
                        .config
                        .rig_for_bead(&work)
                        .map(String::from)
                        .with_context(|| format!("no rig resolves {work}"))?;
                    crate::sling::run(
                        &town,
                        &SlingRequest {
                            work: WorkSource::Bead(work.clone()),
                            target: Some(rig),
                            opts: SlingOptions {
                                convoy: Some(convoy),
                                ..Default::default()
                            },
                        },
                    )
                    .map(|_| ())
                })
                .await;
                let result = match joined {
                    Ok(inner) => inner,
                    Err(join) => Err(anyhow::anyhow!("dispatch task panicked: {join}")),
                };
                (id, result)
            }
        }))
        .buffer_unordered(bound)
        .collect()
        .await;

    // Report in wave (sorted) order regardless of completion order.
    let mut failures: std::collections::BTreeMap<String, String> = Default::default();
    for (id, result) in results {
        if let Err(e) = result {
            warn!(bead = %id, "wave dispatch failure: {e:#}");
            failures.insert(id, format!("{e:#}"));
        }
    }
    for id in items {
        match failures.remove(id) {
            Some(reason) => report.failed.push((id.clone(), reason)),
            None => report.dispatched.push(id.clone()),
        }
    }
    report
}

fn enqueue_item(town: &Town, convoy_id: &str, id: &str) -> Result<()> {
    let rig = town
        .config
        .rig_for_bead(id)
        .map(String::from)
        .with_context(|| format!("no rig resolves {id}"))?;
    schedule_bead(
        town,
        id,
        &EnqueueOptions {
            rig,
            convoy: Some(convoy_id.to_string()),
            ..Default::default()
        },
    )?;
    Ok(())
}

#[derive(Debug, Default)]
pub struct AdvanceReport {
    pub advanced: Vec<(String, WaveReport)>,
    pub closed: Vec<String>,
}

/// Move open convoys forward: dispatch the next wave once the previous
/// one has fully closed, and close convoys whose tracked work is done.
/// Called from the daemon tick.
pub async fn advance_convoys(town: &Town) -> Result<AdvanceReport> {
    let store = town.store.as_ref();
    let mut report = AdvanceReport::default();

    let convoys = store.list(&BeadFilter {
        status: Some(BeadStatus::Open),
        bead_type: Some(BeadType::Convoy),
        ..Default::default()
    })?;

    for convoy in convoys {
        let Some(waves) = load_waves(store, &convoy.id)? else {
            continue;
        };

        let mut pending: Option<Vec<String>> = None;
        let mut all_closed = true;
        'waves: for wave in &waves {
            for id in wave {
                let closed = match store.show(id) {
                    Ok(b) => b.is_closed(),
                    Err(StoreError::NotFound(_)) => true,
                    Err(e) => return Err(e.into()),
                };
                if !closed {
                    all_closed = false;
                    pending = Some(wave.clone());
                    break 'waves;
                }
            }
        }

        if all_closed {
            store.close(&convoy.id, "all tracked work closed")?;
            info!(convoy = %convoy.id, "closed: all tracked work done");
            report.closed.push(convoy.id.clone());
            continue;
        }

        let Some(wave) = pending else { continue };
        // Dispatch only items nobody has picked up yet.
        let mut todo = Vec::new();
        for id in &wave {
            match store.show(id) {
                Ok(b)
                    if b.status == BeadStatus::Open
                        && b.assignee.is_empty()
                        && !b.labels.contains(LABEL_QUEUED) =>
                {
                    todo.push(id.clone())
                }
                Ok(_) => {}
                Err(StoreError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        if todo.is_empty() {
            continue;
        }
        let wave_report = dispatch_wave(town, &convoy.id, &todo).await;
        report.advanced.push((convoy.id.clone(), wave_report));
    }

    Ok(report)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transition_matrix() {
        use BeadStatus::*;
        assert!(validate_transition(StagedReady, Open).is_ok());
        assert!(validate_transition(StagedWarnings, Open).is_ok());
        assert!(validate_transition(StagedReady, StagedWarnings).is_ok());
        assert!(validate_transition(StagedWarnings, StagedReady).is_ok());
        assert!(validate_transition(StagedReady, Closed).is_ok());
        assert!(validate_transition(Open, Closed).is_ok());
        assert!(validate_transition(Closed, Open).is_ok());
        assert!(validate_transition(Open, Open).is_ok());

        assert!(validate_transition(Open, StagedReady).is_err());
        assert!(validate_transition(Open, StagedWarnings).is_err());
        assert!(validate_transition(Closed, StagedReady).is_err());
    }
}
