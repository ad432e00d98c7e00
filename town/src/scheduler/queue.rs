//! Enqueue: park a work item in the scheduler queue.
//!
//! Queued items carry the `gt:queued` label plus a metadata block in the
//! description. Metadata is written before the label so anything
//! filtering by label only ever sees items whose metadata is present; if
//! the label write fails the description is rolled back.

use anyhow::{bail, Result};
use serde_json::json;
use tracing::{info, warn};

use crate::beads::{BeadDelta, BeadStatus, BeadStore, LABEL_QUEUED};
use crate::events::{self, Event, CHANNEL_SCHEDULER};
use crate::meta::SchedMeta;
use crate::Town;

#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    pub rig: String,
    pub formula: Option<String>,
    pub args: Vec<String>,
    pub vars: std::collections::BTreeMap<String, String>,
    pub merge_strategy: Option<String>,
    pub owned: bool,
    /// Enqueue even when the item is actively hooked.
    pub force: bool,
    /// Explicit convoy; suppresses auto-convoy creation.
    pub convoy: Option<String>,
    pub no_convoy: bool,
}

/// Add `bead_id` to the dispatch queue. Idempotent: re-enqueueing an
/// already-queued open item is a no-op (returns `false`).
pub fn schedule_bead(town: &Town, bead_id: &str, opts: &EnqueueOptions) -> Result<bool> {
    let store = town.store.as_ref();
    let bead = store.show(bead_id)?;

    if bead.is_closed() {
        bail!("cannot queue closed work item {bead_id}");
    }
    if bead.status == BeadStatus::Hooked && !opts.force {
        bail!(
            "work item {bead_id} is actively hooked to {}; pass --force to queue anyway",
            bead.assignee
        );
    }
    if !town.config.is_rig(&opts.rig) {
        bail!("unknown target rig {:?}", opts.rig);
    }

    // Idempotence: already queued and still open means nothing to do.
    if bead.labels.contains(LABEL_QUEUED) && bead.status == BeadStatus::Open {
        info!(bead = %bead_id, "already queued");
        return Ok(false);
    }

    if let Some(formula) = &opts.formula {
        // Fail early: a bad formula should bounce at enqueue, not at
        // dispatch three retries later.
        store.cook(formula)?;
    }

    let mut meta = SchedMeta::for_rig(&opts.rig);
    meta.formula = opts.formula.clone();
    meta.args = opts.args.clone();
    meta.vars = opts.vars.clone();
    meta.merge_strategy = opts.merge_strategy.clone();
    meta.owned = opts.owned;

    let original_description = bead.description.clone();
    let described = meta.append_to(&bead.description);
    store.update(
        bead_id,
        &BeadDelta { description: Some(described), ..Default::default() },
    )?;

    // Metadata first, then label; observers filtering by label never see
    // a metadata-less item. Roll the description back if the label write
    // fails.
    if let Err(e) = store.update(
        bead_id,
        &BeadDelta { add_labels: vec![LABEL_QUEUED.to_string()], ..Default::default() },
    ) {
        warn!(bead = %bead_id, "label write failed; rolling back metadata: {e}");
        if let Err(rollback) = store.update(
            bead_id,
            &BeadDelta { description: Some(original_description), ..Default::default() },
        ) {
            warn!(bead = %bead_id, "metadata rollback also failed: {rollback}");
        }
        return Err(e.into());
    }

    if !opts.no_convoy && opts.convoy.is_none() {
        crate::sling::ensure_convoy_for(store, bead_id);
    }

    if let Err(e) = events::emit(
        &town.paths,
        CHANNEL_SCHEDULER,
        &Event::new("scheduler.enqueue", json!({ "bead": bead_id, "rig": opts.rig })),
    ) {
        warn!("enqueue event emit failed: {e:#}");
    }

    info!(bead = %bead_id, rig = %opts.rig, "queued");
    Ok(true)
}
