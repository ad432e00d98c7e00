use anyhow::Result;
use clap::{Args, Subcommand};
use serde_json::json;

use town::beads::{BeadFilter, BeadStore, BeadType};
use town::hook::{self, HookPolicy, HOOK_SLOT};
use town::identity::{self, Address};
use town::Town;

#[derive(Args)]
#[command(args_conflicts_with_subcommands = true)]
pub struct HookArgs {
    #[command(subcommand)]
    command: Option<HookCmd>,

    /// Work item to hook; omit to show your current hook.
    work: Option<String>,

    /// No-op if you already hold a hook.
    #[arg(long, conflicts_with_all = ["upsert", "force"])]
    if_empty: bool,

    /// Replace an existing hook (previous work re-opens).
    #[arg(long)]
    upsert: bool,

    /// Replace and kick the previous assignee.
    #[arg(long)]
    force: bool,

    /// Clear your hook instead of setting one.
    #[arg(long, conflicts_with_all = ["if_empty", "upsert", "force"])]
    clear: bool,

    #[arg(long)]
    dry_run: bool,

    #[arg(long)]
    json: bool,
}

#[derive(Subcommand)]
pub enum HookCmd {
    /// Current hook of an agent (default: self).
    Status { target: Option<String> },
    /// Hook slots across agents.
    Show {
        agent: Option<String>,
        /// Every agent record, not just the addressed one.
        #[arg(long)]
        all: bool,
    },
}

pub fn run(town: &Town, args: HookArgs) -> Result<()> {
    if let Some(command) = args.command {
        return match command {
            HookCmd::Status { target } => status(town, target.as_deref()),
            HookCmd::Show { agent, all } => show(town, agent.as_deref(), all),
        };
    }

    let addr = identity::self_address();
    let store = town.store.as_ref();

    if args.clear {
        let released = hook::unhook(store, &addr, args.work.as_deref(), args.dry_run)?;
        match released {
            Some(work) if args.json => println!("{}", json!({ "cleared": work })),
            Some(work) => println!("unhooked {work}"),
            None if args.json => println!("{}", json!({ "cleared": null })),
            None => println!("no hook to clear"),
        }
        return Ok(());
    }

    let Some(work) = args.work else {
        return status(town, None);
    };

    let policy = if args.force {
        HookPolicy::Force
    } else if args.upsert {
        HookPolicy::Upsert
    } else if args.if_empty {
        HookPolicy::IfEmpty
    } else {
        HookPolicy::Default
    };

    let outcome = hook::hook(store, town.mux.as_ref(), &addr, &work, policy, args.dry_run)?;
    if args.json {
        let value = match &outcome {
            hook::HookOutcome::Hooked => json!({ "outcome": "hooked", "work": work }),
            hook::HookOutcome::Skipped { current } => {
                json!({ "outcome": "skipped", "reason": "hook_occupied", "current": current })
            }
            hook::HookOutcome::Replaced { previous } => {
                json!({ "outcome": "replaced", "previous": previous, "work": work })
            }
        };
        println!("{value}");
    } else {
        println!("{outcome}");
    }
    Ok(())
}

fn status(town: &Town, target: Option<&str>) -> Result<()> {
    let addr = match target {
        Some(raw) => raw
            .parse::<Address>()
            .map_err(|e| anyhow::anyhow!("bad target {raw:?}: {e}"))?,
        None => identity::self_address(),
    };
    match hook::get_hook(town.store.as_ref(), &addr)? {
        Some(work) => {
            let title = town
                .store
                .show(&work)
                .map(|b| b.title)
                .unwrap_or_else(|_| "<missing>".into());
            println!("{addr}: {work} — {title}");
        }
        None => println!("{addr}: no hook"),
    }
    Ok(())
}

fn show(town: &Town, agent: Option<&str>, all: bool) -> Result<()> {
    let store = town.store.as_ref();
    if all {
        let agents = store.list(&BeadFilter {
            bead_type: Some(BeadType::Agent),
            ..Default::default()
        })?;
        for bead in agents {
            let hook = store.slot_get(&bead.id, HOOK_SLOT)?.unwrap_or_else(|| "-".into());
            println!("{}\t{hook}", bead.id);
        }
        return Ok(());
    }
    status(town, agent)
}

#[derive(Args)]
pub struct UnhookArgs {
    /// Only unhook if the current hook matches this work item.
    work: Option<String>,
    /// Agent to release (default: self).
    target: Option<String>,
    #[arg(long)]
    dry_run: bool,
}

pub fn run_unhook(town: &Town, args: UnhookArgs) -> Result<()> {
    let addr = match args.target.as_deref() {
        Some(raw) => raw
            .parse::<Address>()
            .map_err(|e| anyhow::anyhow!("bad target {raw:?}: {e}"))?,
        None => identity::self_address(),
    };
    match hook::unhook(town.store.as_ref(), &addr, args.work.as_deref(), args.dry_run)? {
        Some(work) => println!("unhooked {work} from {addr}"),
        None => println!("{addr} holds no hook"),
    }
    Ok(())
}
