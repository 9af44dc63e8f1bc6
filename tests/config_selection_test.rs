//! Engine construction, adapter selection, and the environment settings
//! layer.

use std::collections::HashMap;

use uxec::{
    AdapterSelector, Command, DockerOptions, Engine, EngineConfig, ExecutionError, SshAuth,
    SshOptions,
};

#[tokio::test]
async fn bad_encoding_fails_construction() {
    let config = EngineConfig {
        encoding: "utf-32".into(),
        ..EngineConfig::default()
    };
    let err = Engine::new(config).unwrap_err();
    assert_eq!(err.code(), "CONFIG_INVALID");
}

#[tokio::test]
async fn latin1_decoding_is_selectable() {
    let config = EngineConfig {
        encoding: "latin1".into(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let result = engine
        .execute(Command::script("printf '\\351'"))
        .await
        .unwrap();
    assert_eq!(result.stdout, "\u{e9}");
}

#[tokio::test]
async fn options_tag_routes_without_explicit_selector() {
    // Docker options imply the docker adapter; with no daemon around, the
    // resolution fails inside the docker adapter, proving the routing.
    let engine = Engine::new(EngineConfig {
        docker: Some(uxec::DockerAdapterConfig {
            binary: "definitely-not-docker-uxec".into(),
        }),
        ..EngineConfig::default()
    })
    .unwrap();
    let err = engine
        .execute(Command::script("true").in_docker(DockerOptions::container("missing")))
        .await
        .unwrap_err();
    match err {
        ExecutionError::AdapterUnavailable { adapter, .. } => assert_eq!(adapter, "docker"),
        ExecutionError::ContainerOp { .. } => {}
        other => panic!("expected a docker-side failure, got: {other:?}"),
    }
}

#[tokio::test]
async fn ssh_options_route_to_the_ssh_adapter() {
    let engine = Engine::with_defaults();
    let target = SshOptions::new("127.0.0.1", "nobody", SshAuth::Agent).port(1);
    let err = engine
        .execute(Command::script("true").via_ssh(target))
        .await
        .unwrap_err();
    match err {
        ExecutionError::Connection { host, .. } => assert_eq!(host, "127.0.0.1"),
        other => panic!("expected a connection failure, got: {other:?}"),
    }
}

#[tokio::test]
async fn explicit_selector_beats_auto_routing() {
    let engine = Engine::with_defaults();
    // Explicit local selector wins even though docker options are present.
    let result = engine
        .execute(
            Command::script("echo local-anyway")
                .in_docker(DockerOptions::container("ignored"))
                .on_adapter(AdapterSelector::Local),
        )
        .await
        .unwrap();
    assert_eq!(result.text(), "local-anyway");
    assert_eq!(result.adapter, "local");
}

#[tokio::test]
async fn chained_env_and_cwd_apply_together() {
    let engine = Engine::with_defaults()
        .cd("/")
        .env(HashMap::from([(
            "UXEC_CHAIN_TEST".to_string(),
            "linked".to_string(),
        )]));
    let result = engine.sh("echo $UXEC_CHAIN_TEST @ $(pwd)").await.unwrap();
    assert_eq!(result.text(), "linked @ /");
}

#[test]
fn env_settings_duration_grammar_is_enforced() {
    use uxec::settings::EnvSettings;

    let good = [
        ("UXEC_TIMEOUT".to_string(), "90s".to_string()),
        ("UXEC_QUIET".to_string(), "1".to_string()),
    ];
    let settings = EnvSettings::from_vars(good).unwrap();
    assert_eq!(settings.timeout_ms, Some(90_000));
    assert_eq!(settings.quiet, Some(true));

    let bad = [("UXEC_TIMEOUT".to_string(), "ninety".to_string())];
    let err = EnvSettings::from_vars(bad).unwrap_err();
    assert_eq!(err.code(), "CONFIG_INVALID");
}

#[test]
fn env_settings_overlay_config() {
    use uxec::settings::EnvSettings;

    let vars = [
        ("UXEC_TIMEOUT".to_string(), "2m".to_string()),
        ("UXEC_TIMEOUT_SIGNAL".to_string(), "SIGINT".to_string()),
        ("UXEC_PREFIX".to_string(), "set -e; ".to_string()),
    ];
    let mut config = EngineConfig::default();
    EnvSettings::from_vars(vars).unwrap().apply(&mut config);
    assert_eq!(config.default_timeout_ms, 120_000);
    assert_eq!(config.timeout_signal, "SIGINT");
    assert_eq!(config.prefix, "set -e; ");
}

#[tokio::test]
async fn prefix_wraps_shell_commands() {
    let config = EngineConfig {
        prefix: "echo before && ".to_string(),
        ..EngineConfig::default()
    };
    let engine = Engine::new(config).unwrap();
    let result = engine.sh("echo after").await.unwrap();
    assert_eq!(result.lines(), vec!["before", "after"]);
}

#[test]
fn sync_execution_goes_through_the_engine() {
    let engine = Engine::with_defaults();
    let result = engine
        .execute_sync(Command::script("printf sync-path"))
        .unwrap();
    assert_eq!(result.stdout, "sync-path");
}

#[tokio::test]
async fn cwd_override_wins_over_the_chained_directory() -> anyhow::Result<()> {
    uxec::logging::init_test_logging();
    let scratch = tempfile::TempDir::new()?;
    let engine = Engine::with_defaults().cd("/");
    let result = engine
        .execute(Command::script("pwd").cwd(scratch.path()))
        .await?;
    assert_eq!(
        std::path::Path::new(&result.text()).canonicalize()?,
        scratch.path().canonicalize()?
    );
    Ok(())
}
