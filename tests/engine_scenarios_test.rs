//! End-to-end scenarios through the engine façade: template interpolation,
//! throw policy, timeouts, and mock-backed flows.

use uxec::{
    AdapterSelector, Command, Engine, EngineConfig, EngineOverrides, ExecutionError,
};

#[tokio::test]
async fn hello_world_round_trip() {
    uxec::logging::init_test_logging();
    let engine = Engine::with_defaults();
    let result = engine.run(&["echo \"Hello, World!\""], &[]).await.unwrap();
    assert_eq!(result.stdout, "Hello, World!\n");
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn interpolated_filename_with_spaces() {
    let engine = Engine::with_defaults();
    let filename = "my file.txt";
    let result = engine
        .run(&["echo ", ""], &[filename.into()])
        .await
        .unwrap();
    assert_eq!(result.text(), filename);
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn throw_on_nonzero_raises_command_failed() {
    let config = EngineConfig {
        throw_on_nonzero: true,
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let err = engine.sh("exit 1").await.unwrap_err();
    assert_eq!(err.code(), "COMMAND_FAILED");
    match err {
        ExecutionError::CommandFailed { command, result } => {
            assert!(command.contains("exit 1"));
            assert_eq!(result.exit_code, 1);
        }
        other => panic!("unexpected error: {other:?}"),
    }
}

#[tokio::test]
async fn sleep_times_out_within_budget() {
    let engine = Engine::with_defaults();
    let started = std::time::Instant::now();
    let err = engine
        .execute(Command::script("sleep 10").timeout_ms(100))
        .await
        .unwrap_err();
    match err {
        ExecutionError::Timeout { limit_ms, .. } => assert_eq!(limit_ms, 100),
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(started.elapsed() < std::time::Duration::from_millis(500));
}

#[tokio::test]
async fn mock_registry_answers_and_records() {
    let engine = Engine::with_defaults();
    let mock = engine.with_mock();
    mock.mock("git pull", "Already up to date.");
    mock.mock("npm install", "added 150 packages");

    let mocked = engine.with(EngineOverrides {
        selector: Some(AdapterSelector::Named("mock".into())),
        ..EngineOverrides::default()
    });

    let pull = mocked.sh("git pull").await.unwrap();
    let install = mocked.sh("npm install").await.unwrap();

    assert_eq!(pull.stdout, "Already up to date.");
    assert_eq!(install.stdout, "added 150 packages");
    assert_eq!(
        mock.executed_commands(),
        vec!["git pull", "npm install"]
    );
}

#[tokio::test]
async fn dangerous_interpolation_has_no_side_effects() {
    let engine = Engine::with_defaults();
    let dangerous = "'; rm -rf /; echo '";
    let result = engine
        .run(&["echo ", ""], &[dangerous.into()])
        .await
        .unwrap();
    assert_eq!(result.text(), dangerous);
    assert_eq!(result.exit_code, 0);
}

#[tokio::test]
async fn empty_array_interpolation_contributes_nothing() {
    let engine = Engine::with_defaults();
    let empty: Vec<&str> = Vec::new();
    let result = engine
        .run(&["echo start", " end"], &[empty.into()])
        .await
        .unwrap();
    assert_eq!(result.text(), "start end");
}

#[tokio::test]
async fn empty_env_values_pass_through() {
    let engine = Engine::with_defaults();
    let result = engine
        .execute(
            Command::script("echo \"[${UXEC_EMPTY_TEST-unset}]\"").env("UXEC_EMPTY_TEST", ""),
        )
        .await
        .unwrap();
    // The variable exists (empty), so the fallback must not trigger.
    assert_eq!(result.text(), "[]");
}

#[tokio::test]
async fn dispose_can_run_many_times() {
    let engine = Engine::with_defaults();
    engine.dispose().await;
    engine.dispose().await;
    engine.dispose().await;
    // Still usable for local work after disposal released pooled state.
    let result = engine.sh("echo still-alive").await.unwrap();
    assert_eq!(result.text(), "still-alive");
}

#[tokio::test]
async fn stderr_is_captured_separately() {
    let engine = Engine::with_defaults();
    let result = engine
        .sh("echo to-out; echo to-err 1>&2")
        .await
        .unwrap();
    assert_eq!(result.stdout, "to-out\n");
    assert_eq!(result.stderr, "to-err\n");
}

#[tokio::test]
async fn result_metadata_is_populated() {
    let engine = Engine::with_defaults();
    let result = engine.sh("sleep 0.05").await.unwrap();
    assert_eq!(result.adapter, "local");
    assert!(result.duration_ms >= 40);
    let wall = result
        .finished_at
        .duration_since(result.started_at)
        .unwrap();
    let delta = wall.as_millis().abs_diff(u128::from(result.duration_ms));
    assert!(delta < 100, "duration should track the timestamps");
}
