//! 設定ファイルから読み込んだイメージでのランナー統合テスト

use harpoon_container::testing::{EngineCall, FakeEngine};
use harpoon_container::{ContainerError, NoIntervention, RunOptions, Runner};
use harpoon_core::{LoadOptions, load_config_str};
use std::path::Path;
use std::sync::Arc;

const CONFIG: &str = r#"
images:
  db:
    commands: ["FROM postgres:16"]
    wait_condition:
      timeout: 1
      command: ["exit 1"]
  srv:
    commands: ["FROM alpine:3.20"]
    links: ["db:database"]
  web:
    commands: ["FROM alpine:3.20"]
    links: ["srv"]
"#;

fn runner(engine: &Arc<FakeEngine>) -> Runner {
    Runner::new(engine.clone(), Arc::new(NoIntervention))
}

#[tokio::test]
async fn test_dependency_timeout_stops_run_before_target() {
    let config = load_config_str(CONFIG, Path::new("/project"), &LoadOptions::default()).unwrap();
    let engine = Arc::new(FakeEngine::new());
    engine.set_exec_exit_code("exit 1", 1);

    let err = runner(&engine)
        .run_until("srv", &config.images, &RunOptions::default(), std::future::pending())
        .await
        .unwrap_err();
    assert!(matches!(err, ContainerError::DependencyTimedout { ref image, .. } if image == "db"));

    let calls = engine.calls();
    let created: Vec<&String> = calls
        .iter()
        .filter_map(|call| match call {
            EngineCall::Create { image, .. } => Some(image),
            _ => None,
        })
        .collect();
    assert_eq!(created, vec!["db"]);
    assert!(engine.containers().is_empty());
}

#[tokio::test]
async fn test_transitive_links_each_get_a_network() {
    let mut config =
        load_config_str(CONFIG, Path::new("/project"), &LoadOptions::default()).unwrap();
    config.images.get_mut("db").unwrap().wait_condition = None;
    let engine = Arc::new(FakeEngine::new());

    let code = runner(&engine)
        .run_until("web", &config.images, &RunOptions::default(), std::future::pending())
        .await
        .unwrap();
    assert_eq!(code, 0);

    let networks = engine
        .calls()
        .iter()
        .filter(|call| matches!(call, EngineCall::CreateNetwork { .. }))
        .count();
    assert_eq!(networks, 2);
    assert!(engine.networks().is_empty());
    assert!(engine.containers().is_empty());
}
