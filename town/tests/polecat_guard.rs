//! Polecats may not sling. Isolated in its own binary because the guard
//! reads process-global environment.

use town::beads::{task, BeadStore};
use town::sling::{self, SlingOptions, SlingRequest, WorkSource};
use town::testing::test_town;

#[test]
fn test_polecats_cannot_sling() {
    std::env::set_var("GT_NUDGE_SETTLE_MS", "0");
    std::env::set_var("GT_POLECAT", "1");

    let (town, h) = test_town();
    h.store.put(task("gt-1", "forbidden"));

    let err = sling::run(
        &town,
        &SlingRequest {
            work: WorkSource::Bead("gt-1".into()),
            target: Some("gastown".into()),
            opts: SlingOptions::default(),
        },
    )
    .unwrap_err();
    assert!(err.to_string().contains("polecats may not sling"));

    // Nothing moved.
    assert_eq!(h.store.show("gt-1").unwrap().status, town::beads::BeadStatus::Open);
    assert!(h.mux.live_sessions().is_empty());
}
