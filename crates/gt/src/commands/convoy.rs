use anyhow::Result;
use clap::Subcommand;

use town::beads::{BeadFilter, BeadStore, BeadType};
use town::convoy::{self, stage::load_waves};
use town::Town;

#[derive(Subcommand)]
pub enum ConvoyCmd {
    /// Plan a set of inputs into waves without dispatching.
    Stage {
        #[arg(required = true)]
        inputs: Vec<String>,
        /// Downgrade unresolved-rig failures to warnings.
        #[arg(long)]
        force: bool,
    },
    /// Launch a staged convoy (or stage-and-launch a bare input):
    /// open it and dispatch Wave 1.
    Launch {
        input: String,
        /// Launch despite staging warnings.
        #[arg(long)]
        force: bool,
    },
    /// Wave-by-wave progress of a convoy.
    Status { convoy: String },
    /// All convoys.
    List,
}

pub async fn run(town: &Town, command: ConvoyCmd) -> Result<()> {
    match command {
        ConvoyCmd::Stage { inputs, force } => {
            let outcome = convoy::stage(town, &inputs, force)?;
            println!("{} staged ({})", outcome.convoy_id, outcome.status);
            for (index, wave) in outcome.waves.iter().enumerate() {
                println!("  wave {}: {}", index + 1, wave.join(", "));
            }
            for warning in &outcome.warnings {
                println!("  warning: {warning}");
            }
            Ok(())
        }
        ConvoyCmd::Launch { input, force } => {
            // A non-convoy input gets staged on the spot.
            let convoy_id = match town.store.show(&input)? {
                bead if bead.bead_type == BeadType::Convoy => bead.id,
                _ => {
                    let staged = convoy::stage(town, &[input], force)?;
                    println!("{} staged ({})", staged.convoy_id, staged.status);
                    staged.convoy_id
                }
            };
            let outcome = convoy::launch(town, &convoy_id, force).await?;
            println!(
                "{} launched: {} dispatched, {} queued, {} failed",
                outcome.convoy_id,
                outcome.wave.dispatched.len(),
                outcome.wave.queued.len(),
                outcome.wave.failed.len()
            );
            for (bead, reason) in &outcome.wave.failed {
                eprintln!("  failed {bead}: {reason}");
            }
            Ok(())
        }
        ConvoyCmd::Status { convoy } => status(town, &convoy),
        ConvoyCmd::List => {
            let convoys = town.store.list(&BeadFilter {
                bead_type: Some(BeadType::Convoy),
                ..Default::default()
            })?;
            for bead in convoys {
                println!("{}\t{}\t{}", bead.id, bead.status, bead.title);
            }
            Ok(())
        }
    }
}

fn status(town: &Town, convoy_id: &str) -> Result<()> {
    let store = town.store.as_ref();
    let bead = store.show(convoy_id)?;
    println!("{} ({}) — {}", bead.id, bead.status, bead.title);

    let Some(waves) = load_waves(store, convoy_id)? else {
        println!("  not staged");
        return Ok(());
    };
    for (index, wave) in waves.iter().enumerate() {
        println!("  wave {}:", index + 1);
        for id in wave {
            match store.show(id) {
                Ok(item) => println!("    {id}\t{}\t{}", item.status, item.title),
                Err(_) => println!("    {id}\t<missing>"),
            }
        }
    }
    Ok(())
}
