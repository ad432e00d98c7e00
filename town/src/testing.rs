//! In-process test fixtures.
//!
//! The same stubs back `GT_TEST_STORE=mem` / `GT_TEST_MUX=stub` runs, so
//! they live in the library proper rather than behind `cfg(test)`.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::beads::MemStore;
use crate::config::{RigConfig, TownConfig};
use crate::paths::TownPaths;
use crate::session::StubMux;
use crate::Town;

static SEQ: AtomicU64 = AtomicU64::new(0);

/// Handles to the stubs behind a test [`Town`], plus the temp root
/// (removed on drop).
pub struct TestHarness {
    pub store: Arc<MemStore>,
    pub mux: Arc<StubMux>,
    root: PathBuf,
}

impl Drop for TestHarness {
    fn drop(&mut self) {
        let _ = std::fs::remove_dir_all(&self.root);
    }
}

/// A town rooted in a unique temp directory, backed by `MemStore` and
/// `StubMux`, with one rig (`gastown`, prefix `gt`) configured.
pub fn test_town() -> (Town, TestHarness) {
    let seq = SEQ.fetch_add(1, Ordering::Relaxed);
    let root = std::env::temp_dir().join(format!("gt-test-{}-{seq}", std::process::id()));
    std::fs::create_dir_all(root.join("rigs/gastown")).expect("create test town root");

    let mut config = TownConfig::default();
    config.spawn_delay_ms = 0;
    config.rigs.insert(
        "gastown".into(),
        RigConfig { prefix: "gt".into(), path: "rigs/gastown".into() },
    );

    let store = Arc::new(MemStore::new());
    let mux = Arc::new(StubMux::new());
    let town = Town {
        paths: TownPaths::new(&root),
        config,
        store: store.clone(),
        mux: mux.clone(),
        rig_stores: Vec::new(),
    };
    (town, TestHarness { store, mux, root })
}
