use anyhow::Result;
use clap::Subcommand;

use town::beads::{BeadDelta, BeadFilter, BeadStore, LABEL_DISPATCH_FAILED, LABEL_QUEUED};
use town::identity;
use town::meta::SchedMeta;
use town::scheduler::{
    dispatch_scheduled_work, update_state, SchedulerState, TickBlocked, TickOptions, TickSource,
};
use town::Town;

#[derive(Subcommand)]
pub enum SchedulerCmd {
    /// Pause/queue/dispatch summary.
    Status,
    /// Queued items with their metadata.
    List,
    /// Stop dispatching town-wide (in-flight work finishes).
    Pause,
    Resume,
    /// Drop queue markers and metadata from items.
    Clear {
        /// Clear just this bead; default clears every queued or
        /// dispatch-failed item.
        #[arg(long)]
        bead: Option<String>,
    },
    /// Run one dispatch tick now.
    Run {
        /// Items this tick; 0 means the config default.
        #[arg(long, default_value_t = 0)]
        batch: usize,
        #[arg(long)]
        dry_run: bool,
    },
}

pub fn run(town: &Town, command: SchedulerCmd) -> Result<()> {
    match command {
        SchedulerCmd::Status => status(town),
        SchedulerCmd::List => list(town),
        SchedulerCmd::Pause => {
            let me = identity::self_address().to_string();
            update_state(&town.paths, |s| {
                s.paused = true;
                s.paused_by = me.clone();
            })?;
            println!("scheduler paused");
            Ok(())
        }
        SchedulerCmd::Resume => {
            update_state(&town.paths, |s| {
                s.paused = false;
                s.paused_by.clear();
            })?;
            println!("scheduler resumed");
            Ok(())
        }
        SchedulerCmd::Clear { bead } => clear(town, bead.as_deref()),
        SchedulerCmd::Run { batch, dry_run } => {
            let outcome = dispatch_scheduled_work(
                town,
                TickSource::Manual,
                TickOptions { batch: (batch > 0).then_some(batch), dry_run },
            )?;
            match outcome.blocked {
                Some(TickBlocked::Locked) => println!("another dispatcher holds the lock"),
                Some(TickBlocked::Paused { by }) => println!("paused by {by}"),
                Some(TickBlocked::DirectMode { stranded }) => println!(
                    "direct-dispatch mode; {stranded} stranded queued item(s)"
                ),
                None => {
                    if dry_run {
                        println!("would dispatch: {}", outcome.planned.join(", "));
                    } else {
                        println!(
                            "dispatched {} item(s), {} failed",
                            outcome.dispatched.len(),
                            outcome.failed.len()
                        );
                    }
                }
            }
            Ok(())
        }
    }
}

fn status(town: &Town) -> Result<()> {
    let state = SchedulerState::load(&town.paths)?;
    let queued = town
        .store
        .list(&BeadFilter { label: Some(LABEL_QUEUED.into()), ..Default::default() })?
        .len();
    let failed = town
        .store
        .list(&BeadFilter { label: Some(LABEL_DISPATCH_FAILED.into()), ..Default::default() })?
        .len();

    if state.paused {
        println!("paused by {}", state.paused_by);
    } else {
        println!("running");
    }
    println!("max_polecats: {}", town.config.max_polecats);
    println!("queued: {queued}  dispatch-failed: {failed}");
    match state.last_dispatch_at {
        Some(at) => println!(
            "last dispatch: {} ({} item(s))",
            at.to_rfc3339(),
            state.last_dispatch_count
        ),
        None => println!("last dispatch: never"),
    }
    Ok(())
}

fn list(town: &Town) -> Result<()> {
    let queued = town
        .store
        .list(&BeadFilter { label: Some(LABEL_QUEUED.into()), ..Default::default() })?;
    for bead in queued {
        let meta = SchedMeta::parse(&bead.description).unwrap_or_default();
        println!(
            "{}\trig={}\tfailures={}\t{}",
            bead.id, meta.target_rig, meta.dispatch_failures, bead.title
        );
    }
    Ok(())
}

fn clear(town: &Town, bead: Option<&str>) -> Result<()> {
    let store = town.store.as_ref();
    let targets: Vec<String> = match bead {
        Some(id) => vec![id.to_string()],
        None => {
            let mut ids: Vec<String> = store
                .list(&BeadFilter { label: Some(LABEL_QUEUED.into()), ..Default::default() })?
                .into_iter()
                .map(|b| b.id)
                .collect();
            ids.extend(
                store
                    .list(&BeadFilter {
                        label: Some(LABEL_DISPATCH_FAILED.into()),
                        ..Default::default()
                    })?
                    .into_iter()
                    .map(|b| b.id),
            );
            ids.sort();
            ids.dedup();
            ids
        }
    };

    for id in &targets {
        let current = store.show(id)?;
        store.update(
            id,
            &BeadDelta {
                description: Some(SchedMeta::strip(&current.description)),
                remove_labels: vec![LABEL_QUEUED.to_string(), LABEL_DISPATCH_FAILED.to_string()],
                ..Default::default()
            },
        )?;
        println!("cleared {id}");
    }
    if targets.is_empty() {
        println!("nothing to clear");
    }
    Ok(())
}
