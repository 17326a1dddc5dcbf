#![cfg(unix)]

use pipestance_runtime::{EngineConfig, PipestanceFactory, PipestanceState, RunOutcome};
use pipestance_sched::LocalSchedulerConfig;
use serde_json::json;
use std::path::Path;
use std::time::Duration;

/// Single shell stage that writes a greeting through the exec contract.
fn greet_source(dir: &Path) -> String {
    let script = dir.join("greet.sh");
    std::fs::write(
        &script,
        "printf '{\"greeting\": \"hello\"}' > \"$2/_outs\"\n: > \"$2/_complete\"\n",
    )
    .expect("script should write");
    json!({
        "stages": [{
            "id": "GREET",
            "outputs": [{"name": "greeting", "type": "string"}],
            "src": {"lang": "shell", "path": script.display().to_string()}
        }],
        "call": {"id": "GREET", "callable": "GREET"}
    })
    .to_string()
}

fn two_core_config() -> EngineConfig {
    EngineConfig {
        step_interval_ms: 5,
        local: LocalSchedulerConfig {
            max_cores: Some(2),
            max_mem_gb: Some(2),
            heartbeat_interval_ms: 50,
            ..LocalSchedulerConfig::default()
        },
        ..EngineConfig::default()
    }
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn single_stage_runs_through_local_scheduler() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let source = greet_source(tmp.path());
    let path = tmp.path().join("ps");
    let pipestance = PipestanceFactory::new(two_core_config())
        .invoke(&source, "greet", &path)
        .await
        .expect("invoke should succeed");

    let outcome = tokio::time::timeout(Duration::from_secs(30), pipestance.run())
        .await
        .expect("run should finish in time")
        .expect("run should not error");
    assert_eq!(outcome, RunOutcome::Complete);
    assert_eq!(pipestance.state().await, PipestanceState::Complete);

    let outs: serde_json::Value = serde_json::from_str(
        &std::fs::read_to_string(path.join("GREET/fork0/_outs")).expect("fork outs should read"),
    )
    .expect("fork outs should parse");
    assert_eq!(outs["greeting"], "hello");
    assert!(path.join("GREET/fork0/chunk0/_jobinfo").is_file());
    assert!(!path.join("_lock").exists());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn pipestances_of_one_factory_draw_from_the_same_local_pool() {
    let tmp = tempfile::tempdir().expect("temp dir should create");
    let source = greet_source(tmp.path());
    let factory = PipestanceFactory::new(two_core_config());
    let first = factory
        .invoke(&source, "first", &tmp.path().join("first"))
        .await
        .expect("first invoke should succeed");
    let second = factory
        .invoke(&source, "second", &tmp.path().join("second"))
        .await
        .expect("second invoke should succeed");

    let pool = factory
        .local_pool()
        .expect("local pool should exist once a pipestance uses it");
    let lease = pool
        .acquire(2, 2)
        .await
        .expect("whole pool should be free before any job runs");

    for _ in 0..20 {
        first.cycle().await.expect("first cycle should succeed");
        second.cycle().await.expect("second cycle should succeed");
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    for name in ["first", "second"] {
        assert!(
            !tmp.path().join(name).join("GREET/fork0/chunk0/_jobinfo").exists(),
            "{name} should wait for cores held elsewhere in the factory"
        );
    }

    drop(lease);
    for pipestance in [&first, &second] {
        let outcome = tokio::time::timeout(Duration::from_secs(30), pipestance.run())
            .await
            .expect("run should finish in time")
            .expect("run should not error");
        assert_eq!(outcome, RunOutcome::Complete);
    }
}
