//! Runs against a real Docker-compatible daemon: `cargo test -- --ignored`.

use kiln_box::{ContainerRuntime, DockerCli, Engine, RunOptions};
use kiln_core::{ErrorKind, KilnConfig, NoopRegistry, ServiceMetadata, ServiceStatus};
use std::sync::Arc;
use std::time::Duration;

fn engine(base_dir: &std::path::Path) -> Engine {
    let mut config = KilnConfig::defaults().unwrap();
    config.sandbox.base_dir = base_dir.to_path_buf();
    Engine::detect(config, Arc::new(NoopRegistry)).expect("docker or podman on PATH")
}

#[tokio::test]
#[ignore]
async fn daemon_answers() {
    let cli = DockerCli::detect(None).unwrap();
    let (available, message) = cli.available().await;
    assert!(available, "{}", message);
}

#[tokio::test]
#[ignore]
async fn runs_snippet_with_fixed_import() {
    let tmp = tempfile::tempdir().unwrap();
    let result = engine(tmp.path()).execution().run("print(math.sqrt(16))\n").await;

    assert!(result.success, "{}", result);
    assert_eq!(result.stdout.trim(), "4.0");
    assert_eq!(result.repaired_imports, vec!["math".to_string()]);
}

#[tokio::test]
#[ignore]
async fn infinite_loop_times_out() {
    let tmp = tempfile::tempdir().unwrap();
    let result = engine(tmp.path())
        .execution()
        .run_with("while True:\n    pass\n", RunOptions::with_timeout(Duration::from_secs(3)))
        .await;

    assert!(result.timed_out, "{}", result);
    assert_eq!(result.error_kind, ErrorKind::ExecutionTimeout);
}

#[tokio::test]
#[ignore]
async fn network_is_disabled_for_runs() {
    let tmp = tempfile::tempdir().unwrap();
    let code = "import urllib.request\nurllib.request.urlopen('http://example.com', timeout=3)\n";
    let result = engine(tmp.path()).execution().run(code).await;

    assert!(!result.success, "{}", result);
}

#[tokio::test]
#[ignore]
async fn service_round_trip() {
    let tmp = tempfile::tempdir().unwrap();
    let mut service = engine(tmp.path()).service().await.unwrap();
    let code = "@endpoint('/add', 'POST')\ndef add(a: int, b: int):\n    return {'sum': a + b}\n";

    let metadata = ServiceMetadata {
        name: "Test".to_string(),
        ..ServiceMetadata::default()
    };
    let handle = service.build_and_run(code, metadata).await;
    assert_eq!(handle.status, ServiceStatus::Running, "{:?}", handle.error);

    let docs = service.get_api_docs().await.unwrap();
    assert_eq!(docs.name, "Test");
    assert_eq!(docs.endpoints[0].path, "/add");

    let sum: serde_json::Value = reqwest::Client::new()
        .post(format!("{}/add", handle.base_url))
        .json(&serde_json::json!({"a": 2, "b": 3}))
        .send()
        .await
        .unwrap()
        .json()
        .await
        .unwrap();
    assert_eq!(sum["sum"], 5);

    service.cleanup().await;
    assert_eq!(service.status(), Some(ServiceStatus::Stopped));
}
