use anyhow::Result;
use clap::Args;

use town::recover::{self, RecoverMode};
use town::Town;

#[derive(Args)]
pub struct RecoverArgs {
    /// Agent address to recover.
    target: String,

    /// Poke the pane with an interrupt (the default).
    #[arg(long, conflicts_with_all = ["soft", "force"])]
    interrupt: bool,

    /// Interrupt, then re-nudge the current hook.
    #[arg(long, conflicts_with = "force")]
    soft: bool,

    /// Kill the session and respawn with the hook preserved.
    #[arg(long)]
    force: bool,
}

pub fn run(town: &Town, args: RecoverArgs) -> Result<()> {
    let mode = if args.force {
        RecoverMode::Force
    } else if args.soft {
        RecoverMode::Soft
    } else {
        RecoverMode::Interrupt
    };

    let report = recover::recover(town, &args.target, mode)?;
    match report.mode {
        RecoverMode::Interrupt => println!("{}: interrupted", report.target),
        RecoverMode::Soft => println!("{}: reset", report.target),
        RecoverMode::Force => println!(
            "{}: respawned{}",
            report.target,
            report
                .hook
                .as_deref()
                .map(|h| format!(" (hook {h} preserved)"))
                .unwrap_or_default()
        ),
    }
    Ok(())
}
