mod support;

use pipestance_runtime::{CycleOutcome, EngineConfig, VdrMode};
use serde_json::json;
use std::sync::Arc;
use support::{
    FakeScheduler, config, drive, factory, factory_with, store, two_stage_outs, two_stage_source,
};

#[tokio::test(flavor = "current_thread")]
async fn volatile_output_survives_until_its_consumer_completes() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    scheduler.hold("USE");
    let pipestance = factory(&store, &scheduler)
        .invoke(&two_stage_source(true, false), "ps", &path)
        .await
        .expect("invoke should succeed");
    let produced = path.join("PIPE/MAKE/fork0/files/main.dat");

    assert_eq!(drive(&pipestance, 12).await, CycleOutcome::Running);
    assert!(
        scheduler
            .submitted()
            .contains(&"ID.ps.PIPE.USE.fork0.chunk0".to_string())
    );
    assert!(produced.is_file(), "output must stay while USE is unfinished");
    assert_eq!(
        pipestance.vdr_report().await.expect("report should read").count,
        0
    );

    let chunk = path.join("PIPE/USE/fork0/chunk0");
    std::fs::write(chunk.join("_outs"), r#"{"result": "done"}"#).expect("outs should write");
    std::fs::write(chunk.join("_complete"), "").expect("complete should write");
    assert_eq!(drive(&pipestance, 20).await, CycleOutcome::Complete);

    assert!(!produced.exists(), "output should be reclaimed once USE is complete");
    assert!(path.join("PIPE/MAKE/fork0/_outs").is_file());
    assert!(path.join("PIPE/MAKE/fork0/_vdrkill").is_file());
    let report = pipestance.vdr_report().await.expect("report should read");
    assert_eq!(report.count, 1);
    assert_eq!(report.size, 64);
}

#[tokio::test(flavor = "current_thread")]
async fn split_stage_keeps_chunk_files_its_outputs_point_into() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(
        FakeScheduler::new(Arc::clone(&store)).with_outs(|request, _| {
            let fork = request
                .unit
                .path
                .parent()
                .expect("unit should live under a fork")
                .to_path_buf();
            json!({
                "out": fork.join("chunk0/files/main.dat").display().to_string(),
                "result": "done",
            })
        }),
    );
    let pipestance = factory(&store, &scheduler)
        .invoke(&two_stage_source(false, true), "ps", &path)
        .await
        .expect("invoke should succeed");
    assert_eq!(drive(&pipestance, 50).await, CycleOutcome::Complete);

    assert!(path.join("PIPE/MAKE/fork0/chunk0/files/main.dat").is_file());
    assert!(!path.join("PIPE/MAKE/fork0/chunk1/files/main.dat").exists());
    assert!(path.join("PIPE/USE/fork0/files/main.dat").is_file());
}

#[tokio::test(flavor = "current_thread")]
async fn disabled_vdr_leaves_volatile_outputs_in_place() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let path = tmp.path().join("ps");
    let store = store();
    let scheduler = Arc::new(FakeScheduler::new(Arc::clone(&store)).with_outs(two_stage_outs));
    let config = EngineConfig {
        vdr_mode: VdrMode::Disable,
        ..config()
    };
    let pipestance = factory_with(config, &store, &scheduler)
        .invoke(&two_stage_source(true, false), "ps", &path)
        .await
        .expect("invoke should succeed");
    assert_eq!(drive(&pipestance, 50).await, CycleOutcome::Complete);

    assert!(path.join("PIPE/MAKE/fork0/files/main.dat").is_file());
    assert!(!path.join("PIPE/MAKE/fork0/_vdrkill").exists());
}
