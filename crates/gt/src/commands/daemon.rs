use anyhow::Result;
use clap::Subcommand;

use town::daemon;
use town::Town;

#[derive(Subcommand)]
pub enum DaemonCmd {
    /// Start the daemon in the background.
    Start,
    Stop,
    Status,
    /// Tail the daemon log.
    Logs {
        #[arg(short = 'n', long, default_value_t = 50)]
        lines: usize,
    },
    Restart,
    /// Foreground daemon loop (what `start` spawns).
    Run,
}

pub async fn run(town: &Town, command: DaemonCmd) -> Result<()> {
    match command {
        DaemonCmd::Start => daemon::start(town),
        DaemonCmd::Stop => daemon::stop(town),
        DaemonCmd::Status => {
            match daemon::running_pid(town) {
                Some(pid) => println!("running (pid {pid})"),
                None => println!("not running"),
            }
            Ok(())
        }
        DaemonCmd::Logs { lines } => {
            let tail = daemon::tail_log(town, lines)?;
            if !tail.is_empty() {
                println!("{tail}");
            }
            Ok(())
        }
        DaemonCmd::Restart => {
            daemon::stop(town)?;
            daemon::start(town)
        }
        DaemonCmd::Run => daemon::run(town).await,
    }
}
