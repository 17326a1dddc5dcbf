mod support;

use pipestance_runtime::{
    CycleOutcome, PipestanceError, PipestanceState, RunOutcome, runtime_event_channel,
    PipestanceEvent, RuntimeEventKind, RuntimeEventSink,
};
use std::sync::Arc;
use support::{FakeScheduler, drive, factory, store, two_stage_outs, two_stage_source};

#[tokio::test(flavor = "current_thread")]
async fn invoke_runs_two_stage_pipeline_to_completion_and_unlocks() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    let pipestance = factory(&store, &scheduler)
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");

    assert!(path.join("_invocation").is_file());
    assert!(path.join("_lock").is_file());
    assert_eq!(
        std::fs::read_to_string(path.join("_jobmode")).expect("jobmode should read"),
        "local"
    );

    assert_eq!(drive(&pipestance, 50).await, CycleOutcome::Complete);
    assert_eq!(pipestance.state().await, PipestanceState::Complete);
    assert!(!path.join("_lock").exists(), "lock should be released on completion");
    assert!(path.join("_finalstate").is_file());
    assert_eq!(
        scheduler.submitted(),
        vec![
            "ID.ps.PIPE.MAKE.fork0.chunk0".to_string(),
            "ID.ps.PIPE.USE.fork0.chunk0".to_string(),
        ]
    );

    let outs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(path.join("PIPE/fork0/_outs")).expect("pipeline outs should read"),
    )
    .expect("pipeline outs should parse");
    assert_eq!(outs["result"], "done");
}

#[tokio::test(flavor = "current_thread")]
async fn reattach_to_fully_complete_pipestance_steps_nothing() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let first = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    let pipestance = factory(&store, &first)
        .invoke(&two_stage_source(false, true), "ps", &path)
        .await
        .expect("invoke should succeed");
    assert_eq!(drive(&pipestance, 50).await, CycleOutcome::Complete);
    drop(pipestance);

    let second = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let reattached = factory(&store, &second)
        .reattach("ps", &path)
        .await
        .expect("reattach should succeed");
    assert_eq!(reattached.state().await, PipestanceState::Complete);
    assert_eq!(
        reattached.cycle().await.expect("cycle should run"),
        CycleOutcome::Complete
    );
    assert!(second.requests().is_empty(), "no unit should be restepped");

    let tree = reattached.serialize_state().await;
    let make = &tree.children[0];
    assert_eq!(make.name, "MAKE");
    let chunks = make.forks[0]
        .units
        .iter()
        .filter(|unit| unit.role == "chunk")
        .count();
    assert_eq!(chunks, 2, "chunks should be restored from split metadata");
}

#[tokio::test(flavor = "current_thread")]
async fn invoke_with_different_source_is_mismatch_and_leaves_first_untouched() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let factory = factory(&store, &scheduler);
    let _first = factory
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("first invoke should succeed");
    let invocation_before =
        std::fs::read_to_string(path.join("_invocation")).expect("invocation should read");
    let lock_before = std::fs::read_to_string(path.join("_lock")).expect("lock should read");

    let err = factory
        .invoke(&two_stage_source(true, false), "ps", &path)
        .await
        .err()
        .expect("second invoke should fail");
    assert!(matches!(err, PipestanceError::InvocationMismatch { .. }));
    assert_eq!(
        std::fs::read_to_string(path.join("_invocation")).expect("invocation should read"),
        invocation_before
    );
    assert_eq!(
        std::fs::read_to_string(path.join("_lock")).expect("lock should read"),
        lock_before
    );
}

#[tokio::test(flavor = "current_thread")]
async fn reattach_refuses_live_lock_and_succeeds_after_unlock() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let factory = factory(&store, &scheduler);
    let first = factory
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");

    let err = factory
        .reattach("ps", &path)
        .await
        .err()
        .expect("reattach should be refused while locked");
    assert!(matches!(err, PipestanceError::Locked { .. }));

    first.unlock().await.expect("unlock should succeed");
    factory
        .reattach("ps", &path)
        .await
        .expect("reattach should succeed after unlock");
}

#[tokio::test(flavor = "current_thread")]
async fn construction_errors_are_reported_synchronously() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let factory = factory(&store, &scheduler);

    let err = factory
        .invoke(&two_stage_source(false, false), "bad id", &tmp.path().join("a"))
        .await
        .err()
        .expect("invalid psid should fail");
    assert!(matches!(err, PipestanceError::InvalidPsid(_)));

    let err = factory
        .invoke("{not json", "ps", &tmp.path().join("b"))
        .await
        .err()
        .expect("bad source should fail");
    assert!(matches!(err, PipestanceError::Compile(_)));

    let occupied = tmp.path().join("occupied");
    std::fs::create_dir_all(&occupied).expect("dir should create");
    std::fs::write(occupied.join("notes.txt"), "hello").expect("file should write");
    let err = factory
        .invoke(&two_stage_source(false, false), "ps", &occupied)
        .await
        .err()
        .expect("occupied dir should fail");
    assert!(matches!(err, PipestanceError::AlreadyExists { .. }));

    let err = factory
        .reattach("ps", &tmp.path().join("missing"))
        .await
        .err()
        .expect("reattach to nothing should fail");
    assert!(matches!(err, PipestanceError::NotPipestance { .. }));
}

#[tokio::test(flavor = "current_thread")]
async fn reattach_in_different_job_mode_is_refused() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let factory = factory(&store, &scheduler);
    let first = factory
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");
    first.unlock().await.expect("unlock should succeed");
    std::fs::write(path.join("_jobmode"), "sge").expect("jobmode should write");

    let err = factory
        .reattach("ps", &path)
        .await
        .err()
        .expect("job mode change should be refused");
    match err {
        PipestanceError::JobModeMismatch {
            recorded,
            requested,
        } => {
            assert_eq!(recorded, "sge");
            assert_eq!(requested, "local");
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[tokio::test(flavor = "current_thread")]
async fn kill_stops_run_loop_and_releases_lock() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    scheduler.hold("MAKE");
    let pipestance = factory(&store, &scheduler)
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");
    drive(&pipestance, 5).await;

    pipestance.kill("operator request").await.expect("kill should succeed");
    assert_eq!(scheduler.killed().as_deref(), Some("operator request"));
    assert!(!path.join("_lock").exists());
    assert_eq!(
        pipestance.run().await.expect("run should return"),
        RunOutcome::Killed
    );
}

#[tokio::test(flavor = "current_thread")]
async fn events_report_lifecycle_in_sequence() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    let (sender, mut receiver) = runtime_event_channel();
    let pipestance = factory(&store, &scheduler)
        .with_events(RuntimeEventSink::with_sender(sender))
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");
    assert_eq!(
        pipestance.run().await.expect("run should finish"),
        RunOutcome::Complete
    );

    let mut events = Vec::new();
    while let Ok(event) = receiver.try_recv() {
        events.push(event);
    }
    assert!(
        events
            .windows(2)
            .all(|pair| pair[0].sequence_no < pair[1].sequence_no)
    );
    assert!(matches!(
        events.first().map(|event| &event.kind),
        Some(RuntimeEventKind::Pipestance(PipestanceEvent::Started { .. }))
    ));
    assert!(matches!(
        events.last().map(|event| &event.kind),
        Some(RuntimeEventKind::Pipestance(PipestanceEvent::Completed { .. }))
    ));
    let submitted = events
        .iter()
        .filter(|event| {
            matches!(
                event.kind,
                RuntimeEventKind::Unit(pipestance_runtime::UnitEvent::Submitted { .. })
            )
        })
        .count();
    assert_eq!(submitted, 2);
}

#[tokio::test(flavor = "current_thread")]
async fn reset_after_failed_run_takes_the_lock_back() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    scheduler.fail("MAKE", pipestance_store::FailureKind::Assert, 1);
    let pipestance = factory(&store, &scheduler)
        .invoke(&two_stage_source(false, false), "ps", &path)
        .await
        .expect("invoke should succeed");

    assert!(matches!(
        pipestance.run().await.expect("run should finish"),
        RunOutcome::Failed(_)
    ));
    assert!(!path.join("_lock").exists());
    assert!(!pipestance.holds_lock());

    assert!(pipestance.reset().await.expect("reset should succeed") >= 1);
    assert!(path.join("_lock").is_file(), "reset should re-take the lock");
    assert!(pipestance.holds_lock());

    let other_scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)));
    let err = factory(&store, &other_scheduler)
        .reattach("ps", &path)
        .await
        .err()
        .expect("second engine should be refused while the reset instance holds the lock");
    assert!(matches!(err, PipestanceError::Locked { .. }));

    assert_eq!(
        pipestance.run().await.expect("run should finish"),
        RunOutcome::Complete
    );
    assert!(!path.join("_lock").exists());
    assert!(!pipestance.holds_lock());
}
