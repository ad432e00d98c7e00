mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};

use commands::{convoy, daemon, hook, recover, scheduler, sling};

#[derive(Parser)]
#[command(name = "gt", version, about = "Gas Town: sling work at agents")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Attach work to an agent (the primary dispatch).
    Sling(sling::SlingArgs),
    /// Inspect or set your hook.
    Hook(hook::HookArgs),
    /// Release a hook.
    #[command(alias = "unsling")]
    Unhook(hook::UnhookArgs),
    /// Stage, launch, and inspect convoys.
    Convoy {
        #[command(subcommand)]
        command: convoy::ConvoyCmd,
    },
    /// Queue management and the dispatch tick.
    Scheduler {
        #[command(subcommand)]
        command: scheduler::SchedulerCmd,
    },
    /// The heartbeat daemon.
    Daemon {
        #[command(subcommand)]
        command: daemon::DaemonCmd,
    },
    /// Escalating agent recovery.
    Recover(recover::RecoverArgs),
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let town = town::Town::discover()?;

    match cli.command {
        Command::Sling(args) => sling::run(&town, args),
        Command::Hook(args) => hook::run(&town, args),
        Command::Unhook(args) => hook::run_unhook(&town, args),
        Command::Convoy { command } => convoy::run(&town, command).await,
        Command::Scheduler { command } => scheduler::run(&town, command),
        Command::Daemon { command } => daemon::run(&town, command).await,
        Command::Recover(args) => recover::run(&town, args),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parses() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_essential_surface() {
        for argv in [
            vec!["gt", "sling", "gt-1", "gastown"],
            vec!["gt", "sling", "gt-1", "gt-2", "gastown", "--force"],
            vec!["gt", "hook"],
            vec!["gt", "hook", "gt-1", "--if-empty", "--json"],
            vec!["gt", "hook", "status"],
            vec!["gt", "hook", "show", "--all"],
            vec!["gt", "unhook", "gt-1"],
            vec!["gt", "unsling", "gt-1", "gastown/polecats/nux"],
            vec!["gt", "convoy", "stage", "gt-1", "gt-2"],
            vec!["gt", "convoy", "launch", "hq-cv-1", "--force"],
            vec!["gt", "convoy", "status", "hq-cv-1"],
            vec!["gt", "convoy", "list"],
            vec!["gt", "scheduler", "status"],
            vec!["gt", "scheduler", "run", "--batch", "2", "--dry-run"],
            vec!["gt", "scheduler", "clear", "--bead", "gt-1"],
            vec!["gt", "scheduler", "pause"],
            vec!["gt", "daemon", "status"],
            vec!["gt", "daemon", "logs", "-n", "20"],
            vec!["gt", "recover", "gastown/polecats/nux", "--soft"],
        ] {
            Cli::try_parse_from(&argv).unwrap_or_else(|e| panic!("{argv:?}: {e}"));
        }
    }

    #[test]
    fn test_conflicting_hook_flags_rejected() {
        assert!(Cli::try_parse_from(["gt", "hook", "gt-1", "--if-empty", "--upsert"]).is_err());
        assert!(Cli::try_parse_from(["gt", "hook", "gt-1", "--if-empty", "--force"]).is_err());
    }
}
