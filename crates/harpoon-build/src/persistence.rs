//! 永続化ビルド
//!
//! `persistence` を持つイメージは次の派生イメージを使ってビルドする。
//!
//! - tester (`<image_name>-tester`): イメージ本来の命令。キャッシュだけで
//!   ビルドできればソースに変更はない
//! - provider (`<image_name>-provider`): 保存したフォルダを
//!   `/harpoon/persist` のボリュームとして持つ
//!
//! tester から作ったコンテナで provider のボリュームを使って `action` を実行し、
//! その結果を本来のタグとしてコミットする。

use crate::builder::ImageBuilder;
use crate::error::{BuildError, BuildResult};
use harpoon_container::{SpecRequest, container_spec, split_reference};
use harpoon_core::{ContextSpec, Image, ImageSet, PERSIST_VOLUME, Persistence, render};
use tracing::{debug, info};

/// `<image_name>-<suffix>[:tag]`
pub fn derived_tag(image: &Image, suffix: &str) -> String {
    match &image.tag {
        Some(tag) => format!("{}-{}:{}", image.image_name, suffix, tag),
        None => format!("{}-{}", image.image_name, suffix),
    }
}

/// 永続化ビルドの手順
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PersistStep {
    BuildTester,
    /// tester がキャッシュだった
    CheckFinalTag,
    /// 最終タグだけがないので provider から復元する
    RestoreFromProvider,
    BuildIntermediateProvider,
    RunBuilder,
    BuildFinalProvider,
    Done { cached: bool },
}

pub(crate) async fn build(
    builder: &ImageBuilder,
    image: &Image,
    images: &ImageSet,
    persistence: &Persistence,
) -> BuildResult<bool> {
    let engine = builder.engine();
    let main = image.image_tag();
    let tester = derived_tag(image, "tester");
    let provider = derived_tag(image, "provider");
    let no_context = ContextSpec::disabled(&image.context.root_dir);

    let mut step = PersistStep::BuildTester;
    loop {
        debug!(?step, image = %image.key, "Persistence step");
        step = match step {
            PersistStep::BuildTester => {
                let rendered = render(image, images)?;
                let extras = builder.resolve_extras(image, &rendered.extras).await?;
                let cached = builder
                    .build_with(image, &tester, image.context.clone(), extras, &rendered.dockerfile)
                    .await?;
                if cached {
                    PersistStep::CheckFinalTag
                } else if engine.image_id(&provider).await?.is_some() {
                    PersistStep::RunBuilder
                } else {
                    PersistStep::BuildIntermediateProvider
                }
            }
            PersistStep::CheckFinalTag => {
                if engine.image_id(&main).await?.is_some() {
                    info!(image = %main, "Persisted image is up to date");
                    PersistStep::Done { cached: true }
                } else {
                    PersistStep::RestoreFromProvider
                }
            }
            PersistStep::RestoreFromProvider => {
                if engine.image_id(&provider).await?.is_some() {
                    let command = persistence.restore_command();
                    run_and_commit(builder, image, &tester, &provider, command).await?;
                } else {
                    let (repo, tag) = split_reference(&main);
                    engine.tag_image(&tester, &repo, &tag).await?;
                }
                PersistStep::Done { cached: false }
            }
            PersistStep::BuildIntermediateProvider => {
                let dockerfile = format!(
                    "FROM {tester}\nRUN mkdir -p {volume}\nVOLUME {volume}\n",
                    tester = tester,
                    volume = PERSIST_VOLUME
                );
                builder
                    .build_with(image, &provider, no_context.clone(), Vec::new(), &dockerfile)
                    .await?;
                PersistStep::RunBuilder
            }
            PersistStep::RunBuilder => {
                let command = persistence.builder_command();
                run_and_commit(builder, image, &tester, &provider, command).await?;
                if persistence.no_provider {
                    PersistStep::Done { cached: false }
                } else {
                    PersistStep::BuildFinalProvider
                }
            }
            PersistStep::BuildFinalProvider => {
                let save = persistence.save_script();
                let save = if save.is_empty() { "true".to_string() } else { save };
                let dockerfile = format!(
                    "FROM {main}\nRUN {save}\nVOLUME {volume}\n",
                    main = main,
                    save = save,
                    volume = PERSIST_VOLUME
                );
                builder
                    .build_with(image, &provider, no_context.clone(), Vec::new(), &dockerfile)
                    .await?;
                PersistStep::Done { cached: false }
            }
            PersistStep::Done { cached } => return Ok(cached),
        };
    }
}

/// provider のボリュームを借りて tester で `command` を実行し、最終タグとしてコミット
async fn run_and_commit(
    builder: &ImageBuilder,
    image: &Image,
    tester: &str,
    provider: &str,
    command: Vec<String>,
) -> BuildResult<()> {
    let engine = builder.engine();
    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let provider_name = image.container_name_with(&format!("provider-{}", &suffix[..12]));
    let builder_name = image.container_name_with(&format!("builder-{}", &suffix[..12]));

    let provider_spec = harpoon_container::ContainerSpec {
        name: provider_name.clone(),
        image: provider.to_string(),
        cmd: Some(vec!["true".to_string()]),
        ..Default::default()
    };
    let provider_id = engine.create_container(&provider_spec).await?;

    let result = run_builder(builder, image, tester, &builder_name, &provider_name, command).await;
    builder.remove_container(&provider_id).await;
    result
}

async fn run_builder(
    builder: &ImageBuilder,
    image: &Image,
    tester: &str,
    name: &str,
    provider_name: &str,
    command: Vec<String>,
) -> BuildResult<()> {
    let engine = builder.engine();
    let main = image.image_tag();

    let mut spec = container_spec(
        image,
        SpecRequest {
            name: name.to_string(),
            command: Some(command),
            volumes_from: vec![provider_name.to_string()],
            ports: Some(&[]),
            ..Default::default()
        },
    )?;
    spec.image = tester.to_string();
    let id = engine.create_container(&spec).await?;

    let result: BuildResult<()> = async {
        info!(image = %image.key, "Running persistence action");
        let exit_code = engine.start_attached(&id, false).await?;
        if exit_code != 0 {
            builder.offer_intervention(&id, &image.key).await;
            return Err(BuildError::BuildFailed {
                image: image.key.clone(),
                message: format!("永続化アクションが終了コード {} で失敗しました", exit_code),
            });
        }

        let old_id = engine.image_id(&main).await?;
        engine.commit_container(&id, &main, commit_cmd(image)).await?;
        builder.remove_replaced(&main, old_id).await;
        Ok(())
    }
    .await;

    builder.remove_container(&id).await;
    result
}

/// コミット後のイメージに残す CMD
fn commit_cmd(image: &Image) -> Option<Vec<String>> {
    let cmd = image.last_cmd()?;
    let cmd = cmd.trim();
    if cmd.starts_with('[') {
        serde_json::from_str(cmd).ok()
    } else {
        Some(vec!["/bin/sh".to_string(), "-c".to_string(), cmd.to_string()])
    }
}
