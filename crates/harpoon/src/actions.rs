//! 組み込みタスクの実装

use crate::tasks::{Builtin, Invocation};
use anyhow::Context;
use colored::Colorize;
use harpoon_build::{BuildMemo, BuildSettings, ImageBuilder, RegistryAuth, Syncer, extract_from_image};
use harpoon_container::{Engine, Intervener, RunOptions, Runner};
use harpoon_core::{
    HarpoonConfig, HarpoonError, HarpoonOptions, external_dependencies, layered, ordered_keys,
    render, run_order, split_command,
};
use harpoon_manager::ContainerManager;
use std::io::IsTerminal;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{info, warn};

/// container-manager のデフォルトの待ち受けアドレス
pub const DEFAULT_MANAGER_ADDRESS: &str = "127.0.0.1:0";

/// 設定ファイル以外から渡される値
#[derive(Debug, Clone, Default)]
pub struct Settings {
    /// container-manager が待ち受けアドレスを書き出すファイル
    pub port_file: Option<PathBuf>,
    /// retrieve の出力先（`FILENAME`）
    pub output_file: Option<PathBuf>,
}

pub struct Harpoon {
    config: HarpoonConfig,
    engine: Arc<dyn Engine>,
    builder: ImageBuilder,
    syncer: Syncer,
    runner: Runner,
    settings: Settings,
}

impl Harpoon {
    pub fn new(
        config: HarpoonConfig,
        engine: Arc<dyn Engine>,
        intervener: Arc<dyn Intervener>,
        auth: RegistryAuth,
        settings: Settings,
    ) -> Self {
        let build_settings = BuildSettings::from(&config.harpoon);
        Self {
            builder: ImageBuilder::new(engine.clone(), intervener.clone(), build_settings),
            syncer: Syncer::new(engine.clone(), auth),
            runner: Runner::new(engine.clone(), intervener),
            engine,
            config,
            settings,
        }
    }

    fn options(&self) -> &HarpoonOptions {
        &self.config.harpoon
    }

    /// タスクを実行し、プロセスの終了コードを返す
    pub async fn execute(&self, invocation: &Invocation) -> anyhow::Result<i32> {
        info!(task = %invocation.name, image = ?invocation.image, "Running task");
        let image = invocation.image.as_deref();

        match invocation.builtin {
            Builtin::Make => self.make(invocation.require_image()?).await?,
            Builtin::MakeAll => self.make_all(None).await?,
            Builtin::MakePushable => {
                let pushable = self.pushable_keys()?;
                self.make_all(Some(pushable)).await?
            }
            Builtin::Push => self.push(invocation.require_image()?).await?,
            Builtin::PushAll => self.push_all().await?,
            Builtin::Pull => self.pull(invocation.require_image()?).await?,
            Builtin::PullAll => self.pull_all().await?,
            Builtin::PullAllExternal => self.pull_all_external().await?,
            Builtin::Run => return self.run(invocation.require_image()?).await,
            Builtin::Show => self.show()?,
            Builtin::ShowPushable => self.show_pushable()?,
            Builtin::DeleteUntagged => self.delete_untagged().await?,
            Builtin::PrintDockerfile => self.print_dockerfile(invocation.require_image()?)?,
            Builtin::PrintAllDockerfiles => self.print_all_dockerfiles()?,
            Builtin::Tag => self.tag(invocation.require_image()?).await?,
            Builtin::Untag => self.untag(invocation.require_image()?).await?,
            Builtin::Retrieve => self.retrieve(invocation.require_image()?).await?,
            Builtin::ContainerManager => {
                self.container_manager(image.unwrap_or(DEFAULT_MANAGER_ADDRESS))
                    .await?
            }
            Builtin::ListTasks => self.list_tasks(),
        }
        Ok(0)
    }

    async fn make(&self, key: &str) -> anyhow::Result<()> {
        let cached = self.builder.make(key, &self.config.images).await?;
        print_built(key, cached);
        Ok(())
    }

    /// 層の順にビルドし、`do_push` なら push 可能なものを push する
    async fn make_all(&self, only: Option<Vec<String>>) -> anyhow::Result<()> {
        let images = &self.config.images;
        let layers = layered(images, only.as_deref())?;
        let mut memo = BuildMemo::new();

        for (depth, layer) in layers.iter().enumerate() {
            println!("{}", format!("Layer {}", depth).bold());
            for (key, image) in layer {
                let cached = self
                    .builder
                    .build_image(key, images, &mut Vec::new(), &mut memo, true)
                    .await?;
                print_built(key, cached);
                if self.options().do_push && image.is_pushable() {
                    self.syncer.push(image).await?;
                }
            }
        }
        Ok(())
    }

    fn pushable_keys(&self) -> anyhow::Result<Vec<String>> {
        Ok(ordered_keys(&self.config.images, None)?
            .into_iter()
            .filter(|key| {
                self.config
                    .images
                    .get(key)
                    .is_some_and(|image| image.is_pushable())
            })
            .collect())
    }

    async fn push(&self, key: &str) -> anyhow::Result<()> {
        let image = self.config.images.require(key)?;
        self.syncer.push(image).await?;
        Ok(())
    }

    async fn push_all(&self) -> anyhow::Result<()> {
        for key in self.pushable_keys()? {
            self.push(&key).await?;
        }
        Ok(())
    }

    async fn pull(&self, key: &str) -> anyhow::Result<()> {
        let image = self.config.images.require(key)?;
        self.syncer.pull(image, self.options().ignore_missing).await?;
        Ok(())
    }

    async fn pull_all(&self) -> anyhow::Result<()> {
        for key in self.pushable_keys()? {
            self.pull(&key).await?;
        }
        Ok(())
    }

    async fn pull_all_external(&self) -> anyhow::Result<()> {
        let mut externals: Vec<String> = Vec::new();
        for key in ordered_keys(&self.config.images, None)? {
            for external in external_dependencies(self.config.images.require(&key)?) {
                if !externals.contains(&external) {
                    externals.push(external);
                }
            }
        }
        for external in externals {
            self.syncer
                .pull_reference(&external, self.options().ignore_missing)
                .await?;
        }
        Ok(())
    }

    /// 対象と実行時の依存をビルドしてから実行する
    async fn run(&self, key: &str) -> anyhow::Result<i32> {
        let images = &self.config.images;
        let options = self.options();

        let order = if options.flat {
            vec![key.to_string()]
        } else {
            run_order(images, key)?
        };
        let mut memo = BuildMemo::new();
        for image in &order {
            self.builder
                .build_image(image, images, &mut Vec::new(), &mut memo, false)
                .await?;
        }

        let run_options = RunOptions {
            detach: false,
            tty: options.interactive && std::io::stdin().is_terminal(),
            intervene: options.intervention_enabled(),
            flat: options.flat,
            env: options.env.clone(),
            ports: None,
            command: command_override(options),
            remove_volumes: !options.no_cleanup,
        };
        let exit_code = self.runner.run(key, images, &run_options).await?;
        Ok(i32::try_from(exit_code).unwrap_or(1))
    }

    fn show(&self) -> anyhow::Result<()> {
        for (depth, layer) in layered(&self.config.images, None)?.iter().enumerate() {
            println!("{}", format!("Layer {}", depth).bold());
            for (key, image) in layer {
                println!("  {} ({})", key.cyan(), image.image_tag());
            }
        }
        Ok(())
    }

    fn show_pushable(&self) -> anyhow::Result<()> {
        for key in self.pushable_keys()? {
            let image = self.config.images.require(&key)?;
            println!("{} {}", key.cyan(), image.image_tag());
        }
        Ok(())
    }

    async fn delete_untagged(&self) -> anyhow::Result<()> {
        let dangling = self.engine.dangling_images().await?;
        let mut removed = 0;
        for id in &dangling {
            match self.engine.remove_image(id, false).await {
                Ok(()) => {
                    removed += 1;
                    println!("  ✓ {}", id);
                }
                Err(e) => {
                    warn!(image = %id, "Failed to remove untagged image: {}", e);
                    println!("{}", format!("⚠ {} を削除できませんでした: {}", id, e).yellow());
                }
            }
        }
        println!(
            "{}",
            format!("✓ タグのないイメージを {} 件削除しました", removed).green()
        );
        Ok(())
    }

    fn print_dockerfile(&self, key: &str) -> anyhow::Result<()> {
        let image = self.config.images.require(key)?;
        print!("{}", render(image, &self.config.images)?.dockerfile);
        Ok(())
    }

    fn print_all_dockerfiles(&self) -> anyhow::Result<()> {
        for key in ordered_keys(&self.config.images, None)? {
            println!("{}", format!("# {}", key).bold());
            self.print_dockerfile(&key)?;
            println!();
        }
        Ok(())
    }

    fn required_tag(&self) -> anyhow::Result<&str> {
        self.options()
            .tag
            .as_deref()
            .ok_or_else(|| HarpoonError::bad_config("このタスクには --tag が必要です").into())
    }

    async fn tag(&self, key: &str) -> anyhow::Result<()> {
        let image = self.config.images.require(key)?;
        let tag = self.required_tag()?;
        let source = format!("{}:latest", image.image_name);
        self.engine.tag_image(&source, &image.image_name, tag).await?;
        println!("{} {} -> {}:{}", "✓".green(), source, image.image_name, tag);
        Ok(())
    }

    async fn untag(&self, key: &str) -> anyhow::Result<()> {
        let image = self.config.images.require(key)?;
        let reference = format!("{}:{}", image.image_name, self.required_tag()?);
        self.engine.remove_image(&reference, false).await?;
        println!("{} {} を削除しました", "✓".green(), reference);
        Ok(())
    }

    async fn retrieve(&self, key: &str) -> anyhow::Result<()> {
        let artifact = self
            .options()
            .artifact
            .as_deref()
            .ok_or_else(|| HarpoonError::bad_config("retrieve には --artifact が必要です"))?;

        self.make(key).await?;
        let image = self.config.images.require(key)?;
        let data = extract_from_image(self.engine.as_ref(), &image.image_tag(), artifact).await?;

        let output = self
            .settings
            .output_file
            .clone()
            .unwrap_or_else(|| default_retrieve_path(artifact));
        std::fs::write(&output, data)
            .with_context(|| format!("{} に書き込めません", output.display()))?;
        println!(
            "{} {} を {} に取り出しました",
            "✓".green(),
            artifact,
            output.display().to_string().cyan()
        );
        Ok(())
    }

    async fn container_manager(&self, address: &str) -> anyhow::Result<()> {
        let manager = Arc::new(ContainerManager::new(
            self.engine.clone(),
            self.config.images.clone(),
            BuildSettings::from(self.options()),
            RegistryAuth::new(self.config.authentication.clone()),
        ));

        let listener = harpoon_manager::bind(address).await?;
        let bound = listener
            .local_addr()
            .with_context(|| format!("{} のアドレスを取得できません", address))?;
        println!(
            "{} コンテナマネージャー: {}",
            "✓".green(),
            format!("http://{}", bound).cyan()
        );
        if let Some(port_file) = &self.settings.port_file {
            std::fs::write(port_file, bound.to_string())
                .with_context(|| format!("{} に書き込めません", port_file.display()))?;
        }

        let server = harpoon_manager::serve(listener, manager.clone());
        tokio::pin!(server);
        tokio::select! {
            result = &mut server => result?,
            _ = tokio::signal::ctrl_c() => {
                println!();
                println!("{}", "⚠ 中断しました。コンテナを片付けています...".yellow());
                manager.shutdown().await;
                (&mut server).await?;
            }
        }
        Ok(())
    }

    fn list_tasks(&self) {
        println!("{}", "組み込みタスク:".bold());
        for builtin in Builtin::ALL {
            let usage = if builtin.needs_image() {
                format!("{} IMAGE", builtin.name())
            } else {
                builtin.name().to_string()
            };
            println!("  {:<28} {}", usage.cyan(), builtin.description());
        }

        if self.config.tasks.is_empty() {
            return;
        }
        println!();
        println!("{}", "設定ファイルのタスク:".bold());
        for (name, task) in &self.config.tasks {
            let target = match &task.image {
                Some(image) => format!("{} {}", task.action, image),
                None => task.action.clone(),
            };
            println!(
                "  {:<28} {} {}",
                name.cyan(),
                task.description.as_deref().unwrap_or_default(),
                format!("({})", target).dimmed()
            );
        }
    }
}

fn print_built(key: &str, cached: bool) {
    if cached {
        println!("{} {} {}", "✓".green(), key, "(キャッシュ)".dimmed());
    } else {
        println!("{} {} をビルドしました", "✓".green(), key);
    }
}

/// `--command` / `--bash` による実行コマンドの上書き
fn command_override(options: &HarpoonOptions) -> Option<Vec<String>> {
    if let Some(bash) = &options.bash {
        return Some(vec!["/bin/bash".into(), "-c".into(), bash.clone()]);
    }
    options.command.as_deref().map(split_command)
}

/// アーティファクトのファイル名 + `.tar`
fn default_retrieve_path(artifact: &str) -> PathBuf {
    let name = Path::new(artifact.trim_end_matches('/'))
        .file_name()
        .map(|name| name.to_string_lossy().into_owned())
        .unwrap_or_else(|| "artifact".to_string());
    PathBuf::from(format!("{}.tar", name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tasks::resolve;
    use harpoon_container::testing::{EngineCall, FakeEngine};
    use harpoon_container::{ContainerError, NoIntervention};
    use harpoon_core::{LoadOptions, load_config_str};

    const CONFIG: &str = r#"
images:
  a:
    context: false
    commands: ["FROM scratch"]
  b:
    context: false
    image_index: registry.example.com/
    commands: ["FROM a"]
  c:
    context: false
    commands:
      - FROM b
      - [ADD, {content: hi, dest: /x}]
  db:
    context: false
    commands: ["FROM postgres:16"]
    wait_condition:
      timeout: 1
      command: ["exit 1"]
  srv:
    context: false
    commands: ["FROM alpine:3.20"]
    links: ["db"]
"#;

    fn harpoon(engine: &Arc<FakeEngine>, options: impl FnOnce(&mut HarpoonOptions)) -> Harpoon {
        harpoon_with(engine, options, Settings::default())
    }

    fn harpoon_with(
        engine: &Arc<FakeEngine>,
        options: impl FnOnce(&mut HarpoonOptions),
        settings: Settings,
    ) -> Harpoon {
        let mut config = load_config_str(
            CONFIG,
            Path::new("/project"),
            &LoadOptions {
                tag: Some("v1".into()),
                ..Default::default()
            },
        )
        .unwrap();
        config.harpoon.interactive = false;
        options(&mut config.harpoon);
        Harpoon::new(
            config,
            engine.clone(),
            Arc::new(NoIntervention),
            RegistryAuth::with_config_path("/nonexistent/config.json".into(), Default::default()),
            settings,
        )
    }

    async fn execute(harpoon: &Harpoon, task: &str, image: Option<&str>) -> anyhow::Result<i32> {
        let invocation = resolve(task, image.map(String::from), &harpoon.config.tasks)?;
        harpoon.execute(&invocation).await
    }

    fn built(engine: &FakeEngine) -> Vec<String> {
        engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Build { tag } => Some(tag),
                _ => None,
            })
            .collect()
    }

    #[test]
    fn test_command_override() {
        let options = HarpoonOptions {
            command: Some("python -m http.server 'a b'".into()),
            ..Default::default()
        };
        assert_eq!(
            command_override(&options),
            Some(vec![
                "python".to_string(),
                "-m".to_string(),
                "http.server".to_string(),
                "a b".to_string()
            ])
        );

        let options = HarpoonOptions {
            bash: Some("echo $HOME".into()),
            ..Default::default()
        };
        assert_eq!(command_override(&options).unwrap()[0], "/bin/bash");
        assert_eq!(command_override(&HarpoonOptions::default()), None);
    }

    #[test]
    fn test_default_retrieve_path() {
        assert_eq!(default_retrieve_path("/app/dist/"), PathBuf::from("dist.tar"));
        assert_eq!(default_retrieve_path("/app/out.bin"), PathBuf::from("out.bin.tar"));
    }

    #[tokio::test]
    async fn test_make_builds_dependencies_first() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |_| {});

        execute(&harpoon, "make", Some("c")).await.unwrap();
        assert_eq!(
            built(&engine),
            vec!["a:v1", "registry.example.com/b:v1", "c:v1"]
        );
    }

    #[tokio::test]
    async fn test_make_all_with_push() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |options| options.do_push = true);

        execute(&harpoon, "make-all", None).await.unwrap();
        let built = built(&engine);
        assert_eq!(built.len(), 5);
        let position = |tag: &str| built.iter().position(|t| t == tag).unwrap();
        assert!(position("a:v1") < position("registry.example.com/b:v1"));
        assert!(position("registry.example.com/b:v1") < position("c:v1"));

        let pushed: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Push { reference } => Some(reference),
                _ => None,
            })
            .collect();
        assert_eq!(pushed, vec!["registry.example.com/b:v1"]);
    }

    #[tokio::test]
    async fn test_make_pushable_builds_only_what_is_needed() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |_| {});

        execute(&harpoon, "make-pushable", None).await.unwrap();
        assert_eq!(built(&engine), vec!["a:v1", "registry.example.com/b:v1"]);
    }

    #[tokio::test]
    async fn test_run_fails_on_dependency_timeout() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_exit_code("exit 1", 1);
        let harpoon = harpoon(&engine, |_| {});

        let err = execute(&harpoon, "run", Some("srv")).await.unwrap_err();
        let err = err.downcast_ref::<ContainerError>().unwrap();
        assert!(matches!(err, ContainerError::DependencyTimedout { image, .. } if image == "db"));
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_run_returns_exit_code() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_attached_exit_code("a:v1", 3);
        let harpoon = harpoon(&engine, |_| {});

        assert_eq!(execute(&harpoon, "run", Some("a")).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn test_tag_and_untag() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("a:latest");
        let harpoon = harpoon(&engine, |_| {});

        execute(&harpoon, "tag", Some("a")).await.unwrap();
        assert!(engine.has_image("a:v1"));

        execute(&harpoon, "untag", Some("a")).await.unwrap();
        assert!(!engine.has_image("a:v1"));
        assert!(engine.has_image("a:latest"));
    }

    #[tokio::test]
    async fn test_tag_requires_tag_option() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |options| options.tag = None);

        let err = execute(&harpoon, "tag", Some("a")).await.unwrap_err();
        assert!(matches!(
            err.downcast_ref::<HarpoonError>(),
            Some(HarpoonError::BadConfiguration { .. })
        ));
    }

    #[tokio::test]
    async fn test_retrieve_writes_artifact() {
        let dir = tempfile::tempdir().unwrap();
        let output = dir.path().join("out.tar");
        let engine = Arc::new(FakeEngine::new());
        engine.set_download("/app/dist", b"archive".to_vec());
        let harpoon = harpoon_with(
            &engine,
            |options| options.artifact = Some("/app/dist".into()),
            Settings {
                port_file: None,
                output_file: Some(output.clone()),
            },
        );

        execute(&harpoon, "retrieve", Some("a")).await.unwrap();
        assert_eq!(std::fs::read(&output).unwrap(), b"archive");
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_pull_all_external() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |_| {});

        execute(&harpoon, "pull-all-external", None).await.unwrap();
        let mut pulled: Vec<String> = engine
            .calls()
            .into_iter()
            .filter_map(|call| match call {
                EngineCall::Pull { reference } => Some(reference),
                _ => None,
            })
            .collect();
        pulled.sort();
        assert_eq!(pulled, vec!["alpine:3.20", "postgres:16"]);
    }

    #[tokio::test]
    async fn test_delete_untagged() {
        let engine = Arc::new(FakeEngine::new());
        let harpoon = harpoon(&engine, |_| {});
        execute(&harpoon, "delete-untagged", None).await.unwrap();
    }
}
