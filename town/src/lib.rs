//! Gas Town coordination core.
//!
//! This crate is the work-dispatch engine behind the `gt` CLI:
//!
//! - `convoy`: DAG planning, wave partitioning, staging and launch
//! - `scheduler`: capacity-bounded queue with a periodic dispatch tick
//! - `sling`: the atomic "attach work to an agent" pipeline
//! - `hook`: the one-active-work-item-per-agent slot protocol
//! - `beads` / `session`: bridges to the `bd` issue store and tmux
//!
//! Everything persistent lives in the beads store or under the town
//! root; the crate itself holds no long-lived state beyond the daemon
//! loop.

#![allow(clippy::uninlined_format_args)]

use std::sync::Arc;

use anyhow::Result;

pub mod beads;
pub mod config;
pub mod convoy;
pub mod daemon;
pub mod events;
pub mod hook;
pub mod identity;
pub mod meta;
pub mod paths;
pub mod recover;
pub mod scheduler;
pub mod session;
pub mod sling;
pub mod spawn;
pub mod testing;
pub mod verify;

use beads::{BdStore, BeadStore, MemStore, TEST_STORE_ENV};
use config::TownConfig;
use paths::TownPaths;
use session::{Multiplexer, StubMux, TmuxBackend, TEST_MUX_ENV};

/// Everything an operation needs: resolved root, config, and the two
/// external bridges. Cheap to clone (the bridges are shared).
#[derive(Clone)]
pub struct Town {
    pub paths: TownPaths,
    pub config: TownConfig,
    pub store: Arc<dyn BeadStore>,
    pub mux: Arc<dyn Multiplexer>,
    /// Per-rig store partitions, used by the dispatch tick's ready scan.
    pub rig_stores: Vec<Arc<dyn BeadStore>>,
}

impl Town {
    /// Build a town from the current directory: discover the root, load
    /// config, and wire the bridges (or their `GT_TEST_*` stubs).
    pub fn discover() -> Result<Self> {
        let cwd = std::env::current_dir()?;
        let root = paths::discover_root(&cwd)?;
        let config = TownConfig::load(&root)?;
        let town_paths = TownPaths::new(&root);

        let test_store = std::env::var(TEST_STORE_ENV).map(|v| v == "mem").unwrap_or(false);
        let (store, rig_stores): (Arc<dyn BeadStore>, Vec<Arc<dyn BeadStore>>) = if test_store {
            (Arc::new(MemStore::new()), Vec::new())
        } else {
            let base = BdStore::new(&root);
            let rig_stores = config
                .rigs
                .keys()
                .filter_map(|rig| config.rig_path(&root, rig))
                .filter(|path| path.is_dir())
                .map(|path| Arc::new(base.at(path)) as Arc<dyn BeadStore>)
                .collect();
            (Arc::new(base), rig_stores)
        };

        let test_mux = std::env::var(TEST_MUX_ENV).map(|v| v == "stub").unwrap_or(false);
        let mux: Arc<dyn Multiplexer> = if test_mux {
            Arc::new(StubMux::new())
        } else {
            Arc::new(TmuxBackend)
        };

        Ok(Self { paths: town_paths, config, store, mux, rig_stores })
    }

    /// Stores the dispatch tick scans for ready work: the town store
    /// plus every rig partition.
    pub fn dispatch_stores(&self) -> impl Iterator<Item = &dyn BeadStore> {
        std::iter::once(self.store.as_ref())
            .chain(self.rig_stores.iter().map(|s| s.as_ref()))
    }
}
