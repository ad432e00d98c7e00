//! Staging, launch, and wave progression end to end.

use town::beads::{task, BeadDelta, BeadStatus, BeadStore, TRACKS_LABEL_PREFIX};
use town::convoy;
use town::testing::test_town;

fn fast() {
    std::env::set_var("GT_NUDGE_SETTLE_MS", "0");
}

/// A blocks B; C independent.
fn seed_chain(h: &town::testing::TestHarness) {
    h.store.put(task("gt-a", "a"));
    let mut b = task("gt-b", "b");
    b.blocked_by.push("gt-a".into());
    h.store.put(b);
    h.store.put(task("gt-c", "c"));
}

#[tokio::test]
async fn test_stage_then_launch_dispatches_wave_one_only() {
    fast();
    let (town, h) = test_town();
    seed_chain(&h);

    let staged = convoy::stage(
        &town,
        &["gt-a".into(), "gt-b".into(), "gt-c".into()],
        false,
    )
    .unwrap();
    assert_eq!(staged.status, BeadStatus::StagedReady);
    assert_eq!(staged.waves, vec![vec!["gt-a", "gt-c"], vec!["gt-b"]]);

    let outcome = convoy::launch(&town, &staged.convoy_id, false).await.unwrap();
    let mut dispatched = outcome.wave.dispatched.clone();
    dispatched.sort();
    assert_eq!(dispatched, vec!["gt-a", "gt-c"]);

    assert_eq!(h.store.show("gt-a").unwrap().status, BeadStatus::Hooked);
    assert_eq!(h.store.show("gt-c").unwrap().status, BeadStatus::Hooked);
    // Wave 2 untouched.
    assert_eq!(h.store.show("gt-b").unwrap().status, BeadStatus::Open);
    assert_eq!(h.store.show(&staged.convoy_id).unwrap().status, BeadStatus::Open);
}

#[tokio::test]
async fn test_launch_uses_staged_record_not_a_replan() {
    fast();
    let (town, h) = test_town();
    seed_chain(&h);
    let staged = convoy::stage(&town, &["gt-a".into(), "gt-c".into()], false).unwrap();

    // Work added after staging must not ride along: launch reads the
    // staged waves slot, never re-listing the convoy's tracked set.
    h.store.put(task("gt-late", "added after staging"));
    h.store
        .update(
            &staged.convoy_id,
            &BeadDelta {
                add_labels: vec![format!("{TRACKS_LABEL_PREFIX}gt-late")],
                ..Default::default()
            },
        )
        .unwrap();

    let outcome = convoy::launch(&town, &staged.convoy_id, false).await.unwrap();
    let mut dispatched = outcome.wave.dispatched.clone();
    dispatched.sort();
    assert_eq!(dispatched, vec!["gt-a", "gt-c"]);
    assert_eq!(h.store.show("gt-late").unwrap().status, BeadStatus::Open);
}

#[tokio::test]
async fn test_launch_rejects_already_open_convoy() {
    fast();
    let (town, h) = test_town();
    seed_chain(&h);
    let staged = convoy::stage(&town, &["gt-a".into()], false).unwrap();
    convoy::launch(&town, &staged.convoy_id, false).await.unwrap();

    let err = convoy::launch(&town, &staged.convoy_id, false).await.unwrap_err();
    assert!(err.to_string().contains("already launched"));
    assert_eq!(h.store.show(&staged.convoy_id).unwrap().status, BeadStatus::Open);
}

#[tokio::test]
async fn test_staged_warnings_requires_force() {
    fast();
    let (town, h) = test_town();
    h.store.put(task("gt-a", "a"));
    let mut done = task("gt-z", "already done");
    done.status = BeadStatus::Closed;
    h.store.put(done);

    // The closed seed produces a warning stage.
    let staged = convoy::stage(&town, &["gt-a".into(), "gt-z".into()], false).unwrap();
    assert_eq!(staged.status, BeadStatus::StagedWarnings);

    let err = convoy::launch(&town, &staged.convoy_id, false).await.unwrap_err();
    let message = err.to_string();
    assert!(message.contains("warnings"));
    assert!(message.contains("--force"));
    assert_eq!(
        h.store.show(&staged.convoy_id).unwrap().status,
        BeadStatus::StagedWarnings
    );

    let outcome = convoy::launch(&town, &staged.convoy_id, true).await.unwrap();
    assert_eq!(outcome.wave.dispatched, vec!["gt-a"]);
    assert_eq!(h.store.show(&staged.convoy_id).unwrap().status, BeadStatus::Open);
}

#[tokio::test]
async fn test_wave_dispatch_isolates_failures() {
    fast();
    let (town, h) = test_town();
    h.store.put(task("gt-a", "fine"));
    // gt-missing does not exist; its dispatch fails alone.

    let report =
        convoy::dispatch_wave(&town, "hq-cv-x", &["gt-a".into(), "gt-missing".into()]).await;
    assert_eq!(report.dispatched, vec!["gt-a"]);
    assert_eq!(report.failed.len(), 1);
    assert_eq!(report.failed[0].0, "gt-missing");
    assert_eq!(h.store.show("gt-a").unwrap().status, BeadStatus::Hooked);
}

#[tokio::test]
async fn test_unresolved_rig_blocks_staging_unless_forced() {
    fast();
    let (town, h) = test_town();
    h.store.put(task("zz-1", "unroutable"));

    let err = convoy::stage(&town, &["zz-1".into()], false).unwrap_err();
    assert!(err.to_string().contains("no rig resolves"));

    let staged = convoy::stage(&town, &["zz-1".into()], true).unwrap();
    assert_eq!(staged.status, BeadStatus::StagedWarnings);
}

#[tokio::test]
async fn test_cycle_refuses_to_stage() {
    fast();
    let (town, h) = test_town();
    let mut a = task("gt-a", "a");
    a.blocked_by.push("gt-b".into());
    let mut b = task("gt-b", "b");
    b.blocked_by.push("gt-a".into());
    h.store.put(a);
    h.store.put(b);

    let err = convoy::stage(&town, &["gt-a".into(), "gt-b".into()], false).unwrap_err();
    assert!(err.to_string().contains("cycle detected"));
}

#[tokio::test]
async fn test_empty_plan_launches_zero_items() {
    fast();
    let (town, h) = test_town();
    // An epic with no children stages to an empty plan.
    let mut epic = task("gt-epic", "empty epic");
    epic.bead_type = town::beads::BeadType::Epic;
    h.store.put(epic);

    let staged = convoy::stage(&town, &["gt-epic".into()], false).unwrap();
    assert!(staged.waves.is_empty());

    let outcome = convoy::launch(&town, &staged.convoy_id, false).await.unwrap();
    assert!(outcome.wave.dispatched.is_empty());
    assert!(outcome.wave.failed.is_empty());
}

#[tokio::test]
async fn test_daemon_advancement_dispatches_next_wave_and_closes() {
    fast();
    let (town, h) = test_town();
    seed_chain(&h);
    let staged = convoy::stage(
        &town,
        &["gt-a".into(), "gt-b".into(), "gt-c".into()],
        false,
    )
    .unwrap();
    convoy::launch(&town, &staged.convoy_id, false).await.unwrap();

    // Nothing advances while wave 1 is in flight.
    let report = convoy::advance_convoys(&town).await.unwrap();
    assert!(report.advanced.is_empty());
    assert!(report.closed.is_empty());
    assert_eq!(h.store.show("gt-b").unwrap().status, BeadStatus::Open);

    // Wave 1 closes → wave 2 dispatches.
    h.store.close("gt-a", "done").unwrap();
    h.store.close("gt-c", "done").unwrap();
    let report = convoy::advance_convoys(&town).await.unwrap();
    assert_eq!(report.advanced.len(), 1);
    assert_eq!(h.store.show("gt-b").unwrap().status, BeadStatus::Hooked);

    // Everything closes → convoy closes.
    h.store.close("gt-b", "done").unwrap();
    let report = convoy::advance_convoys(&town).await.unwrap();
    assert_eq!(report.closed, vec![staged.convoy_id.clone()]);
    assert!(h.store.show(&staged.convoy_id).unwrap().is_closed());
}
