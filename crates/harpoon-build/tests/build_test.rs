//! 設定ファイルから読み込んだイメージでのビルド統合テスト

use harpoon_build::{BuildError, BuildSettings, ImageBuilder};
use harpoon_container::NoIntervention;
use harpoon_container::testing::{EngineCall, FakeEngine};
use harpoon_core::{HarpoonError, LoadOptions, load_config_str, ordered_keys};
use std::collections::BTreeMap;
use std::io::Read;
use std::sync::Arc;

fn builder(engine: &Arc<FakeEngine>) -> ImageBuilder {
    ImageBuilder::new(engine.clone(), Arc::new(NoIntervention), BuildSettings::default())
}

fn builds(engine: &FakeEngine) -> Vec<String> {
    engine
        .calls()
        .into_iter()
        .filter_map(|call| match call {
            EngineCall::Build { tag } => Some(tag),
            _ => None,
        })
        .collect()
}

fn tar_entries(data: &[u8]) -> BTreeMap<String, Vec<u8>> {
    let mut archive = tar::Archive::new(flate2::read::GzDecoder::new(data));
    archive
        .entries()
        .unwrap()
        .map(|entry| {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            (name, content)
        })
        .collect()
}

#[tokio::test]
async fn test_layered_build_of_three_images() {
    let root = tempfile::tempdir().unwrap();
    let config = load_config_str(
        r#"
images:
  a:
    context: false
    commands: ["FROM scratch"]
  b:
    context: false
    commands: ["FROM a"]
  c:
    context: false
    commands:
      - FROM b
      - [ADD, {content: hi, dest: /x}]
"#,
        root.path(),
        &LoadOptions::default(),
    )
    .unwrap();

    let engine = Arc::new(FakeEngine::new());
    let builder = builder(&engine);
    let mut memo = Default::default();
    for key in ordered_keys(&config.images, None).unwrap() {
        builder
            .build_image(&key, &config.images, &mut Vec::new(), &mut memo, true)
            .await
            .unwrap();
    }
    assert_eq!(builds(&engine), vec!["a", "b", "c"]);

    let contexts = engine.build_contexts();
    let (tag, data) = &contexts[2];
    assert_eq!(tag, "c");
    let entries = tar_entries(data);

    let (name, content) = entries
        .iter()
        .find(|(name, _)| name.ends_with("-x"))
        .expect("synthesized file");
    let hash = name.trim_end_matches("-x");
    assert_eq!(hash.len(), 64);
    assert!(hash.chars().all(|c| c.is_ascii_hexdigit()));
    assert_eq!(content, b"hi");

    let dockerfile = String::from_utf8(entries["Dockerfile"].clone()).unwrap();
    assert!(dockerfile.contains(&format!("ADD {} /x", name)));
    assert!(dockerfile.starts_with("FROM b\n"));
}

#[tokio::test]
async fn test_cycle_detection() {
    let root = tempfile::tempdir().unwrap();
    let config = load_config_str(
        r#"
images:
  a:
    commands: ["FROM b"]
  b:
    commands: ["FROM a"]
"#,
        root.path(),
        &LoadOptions::default(),
    )
    .unwrap();

    let engine = Arc::new(FakeEngine::new());
    let err = builder(&engine).make("a", &config.images).await.unwrap_err();
    match err {
        BuildError::Config(HarpoonError::DependencyCycle { chain }) => {
            assert_eq!(chain, vec!["a", "b", "a"])
        }
        other => panic!("unexpected error: {other:?}"),
    }
    assert!(builds(&engine).is_empty());
}

#[tokio::test]
async fn test_content_from_another_image() {
    let root = tempfile::tempdir().unwrap();
    let config = load_config_str(
        r#"
images:
  tools:
    context: false
    commands: ["FROM scratch"]
  app:
    context: false
    commands:
      - FROM scratch
      - [ADD, {content: {image: tools, path: /opt/tool}, dest: /usr/bin/}]
"#,
        root.path(),
        &LoadOptions::default(),
    )
    .unwrap();

    let engine = Arc::new(FakeEngine::new());
    engine.set_download("/opt/tool", b"tool-archive".to_vec());

    builder(&engine).make("app", &config.images).await.unwrap();
    assert_eq!(builds(&engine), vec!["tools", "app"]);

    let contexts = engine.build_contexts();
    let entries = tar_entries(&contexts[1].1);
    let (_, content) = entries
        .iter()
        .find(|(name, _)| name.ends_with("-usr-bin.tar"))
        .expect("extracted archive");
    assert_eq!(content, b"tool-archive");
    // 取り出し用のコンテナは残らない
    assert!(engine.containers().is_empty());
}

#[tokio::test]
async fn test_build_context_from_config_root() {
    let root = tempfile::tempdir().unwrap();
    std::fs::write(root.path().join("app.py"), "print('hi')").unwrap();
    std::fs::write(root.path().join("notes.md"), "").unwrap();
    let config = load_config_str(
        r#"
images:
  app:
    context:
      exclude: ["*.md"]
    commands: ["FROM python:3", "ADD app.py /app/"]
"#,
        root.path(),
        &LoadOptions::default(),
    )
    .unwrap();

    let engine = Arc::new(FakeEngine::new());
    builder(&engine).make("app", &config.images).await.unwrap();

    let contexts = engine.build_contexts();
    let entries = tar_entries(&contexts[0].1);
    assert_eq!(
        entries.keys().collect::<Vec<_>>(),
        vec!["Dockerfile", "app.py"]
    );
}
