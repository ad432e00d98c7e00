use std::collections::BTreeMap;

use anyhow::{bail, Result};
use clap::Args;

use town::identity::Address;
use town::sling::{self, SlingOptions, SlingRequest, WorkSource};
use town::Town;

#[derive(Args)]
pub struct SlingArgs {
    /// Work item id(s) or a formula name, optionally followed by a
    /// target (`.`, a rig, or an agent address).
    #[arg(required = true)]
    inputs: Vec<String>,

    /// Take the work even if it is already hooked or pinned.
    #[arg(long)]
    force: bool,

    /// Print the step plan without mutating anything.
    #[arg(long)]
    dry_run: bool,

    /// Extra args recorded on the work item for the agent.
    #[arg(long = "args", num_args = 1.., allow_hyphen_values = true)]
    args: Vec<String>,

    /// Subject for formula-only slings.
    #[arg(long)]
    subject: Option<String>,

    /// Agent command override for spawned sessions.
    #[arg(long = "agent")]
    agent_type: Option<String>,

    #[arg(long)]
    account: Option<String>,

    /// Track under this convoy instead of auto-creating one.
    #[arg(long)]
    convoy: Option<String>,

    /// Skip convoy tracking entirely.
    #[arg(long, conflicts_with = "convoy")]
    no_convoy: bool,

    /// Instantiate this formula on the bead.
    #[arg(long = "on")]
    formula: Option<String>,

    /// Hook the bare bead; skip the default polecat formula.
    #[arg(long)]
    raw_hook: bool,

    #[arg(long = "merge")]
    merge_strategy: Option<String>,

    #[arg(long, conflicts_with = "merge_strategy")]
    no_merge: bool,

    /// Mark the work as owned (the agent keeps the branch).
    #[arg(long)]
    owned: bool,

    /// Formula variables, `key=value`.
    #[arg(long = "var", value_parser = parse_var)]
    vars: Vec<(String, String)>,
}

fn parse_var(raw: &str) -> Result<(String, String), String> {
    raw.split_once('=')
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .ok_or_else(|| format!("expected key=value, got {raw:?}"))
}

/// Split positionals into work inputs and an optional trailing target.
fn split_inputs(town: &Town, inputs: &[String]) -> (Vec<String>, Option<String>) {
    if inputs.len() < 2 {
        return (inputs.to_vec(), None);
    }
    let last = inputs.last().unwrap();
    let is_target =
        last == "." || town.config.is_rig(last) || last.parse::<Address>().is_ok();
    if is_target {
        (inputs[..inputs.len() - 1].to_vec(), Some(last.clone()))
    } else {
        (inputs.to_vec(), None)
    }
}

pub fn run(town: &Town, args: SlingArgs) -> Result<()> {
    let (works, target) = split_inputs(town, &args.inputs);
    let opts = SlingOptions {
        force: args.force,
        dry_run: args.dry_run,
        args: args.args,
        subject: args.subject,
        agent_type: args.agent_type,
        account: args.account,
        convoy: args.convoy,
        no_convoy: args.no_convoy,
        formula: args.formula,
        raw_hook: args.raw_hook,
        merge_strategy: args.merge_strategy,
        no_merge: args.no_merge,
        owned: args.owned,
        vars: args.vars.into_iter().collect::<BTreeMap<_, _>>(),
    };

    if works.len() > 1 {
        let report = sling::run_batch(town, &works, target.as_deref(), &opts);
        for outcome in &report.succeeded {
            print_outcome(outcome);
        }
        for (bead, reason) in &report.failed {
            eprintln!("failed {bead}: {reason}");
        }
        if !report.failed.is_empty() {
            bail!(
                "{} of {} slings failed",
                report.failed.len(),
                report.failed.len() + report.succeeded.len()
            );
        }
        return Ok(());
    }

    let work = works.into_iter().next().expect("clap requires an input");
    // Formula templates are `mol-*`; anything else is a bead id.
    let source = if work.starts_with("mol-") {
        WorkSource::Formula(work)
    } else {
        WorkSource::Bead(work)
    };
    let outcome = sling::run(town, &SlingRequest { work: source, target, opts })?;
    print_outcome(&outcome);
    Ok(())
}

fn print_outcome(outcome: &sling::SlingOutcome) {
    if !outcome.plan.is_empty() {
        for step in &outcome.plan {
            println!("dry-run: {step}");
        }
        return;
    }
    if outcome.queued {
        println!("{} queued for dispatch", outcome.bead);
        return;
    }
    let target = outcome
        .target
        .as_ref()
        .map(|a| a.to_string())
        .unwrap_or_default();
    println!(
        "{} → {}{}{}",
        outcome.bead,
        target,
        if outcome.spawned { " (spawned)" } else { "" },
        outcome
            .convoy
            .as_deref()
            .map(|c| format!(" [convoy {c}]"))
            .unwrap_or_default()
    );
}
