//! イメージのビルド
//!
//! 依存イメージを先にビルドし、生成した Dockerfile とコンテキストをエンジンに送る。
//! ビルド出力から中間コンテナとキャッシュの有無を読み取り、失敗時は介入を、
//! 成功時は置き換えられた古いイメージの削除を行う。

use crate::context::{ContextBuilder, ExtraBlob};
use crate::error::{BuildError, BuildResult};
use crate::persistence;
use crate::progress::BuildProgress;
use colored::Colorize;
use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use harpoon_container::{BuildMessage, BuildOptions, ContainerSpec, Engine, Intervener};
use harpoon_core::{
    ContextSpec, ExtraContext, ExtraSource, HarpoonError, HarpoonOptions, Image, ImageSet,
    dependency_keys, render,
};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::{debug, info, warn};

const RUNNING_IN: &str = "---> Running in ";
const USING_CACHE: &str = "---> Using cache";

/// ビルドの設定
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildSettings {
    /// 出力の代わりにスピナーを表示
    pub silent_build: bool,
    /// 置き換えられた古いイメージを残す
    pub keep_replaced: bool,
    /// 失敗した中間コンテナで介入シェルを開く
    pub intervene: bool,
    pub no_cache: bool,
    pub pull: bool,
}

impl From<&HarpoonOptions> for BuildSettings {
    fn from(options: &HarpoonOptions) -> Self {
        Self {
            silent_build: options.silent_build,
            keep_replaced: options.keep_replaced,
            intervene: options.intervention_enabled(),
            no_cache: false,
            pull: false,
        }
    }
}

/// ビルド済みイメージ（キー -> キャッシュされたか）
pub type BuildMemo = BTreeMap<String, bool>;

/// ビルド出力の解釈
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BuildOutput {
    /// 最後に実行された中間コンテナ
    pub intermediate: Option<String>,
    pub ran_steps: usize,
    pub cached_steps: usize,
    pub error: Option<String>,
}

impl BuildOutput {
    pub fn observe(&mut self, message: &BuildMessage) {
        if let Some(stream) = &message.stream {
            for line in stream.lines() {
                self.observe_line(line.trim());
            }
        }
        if let Some(error) = &message.error {
            self.error.get_or_insert_with(|| error.trim().to_string());
        }
    }

    fn observe_line(&mut self, line: &str) {
        if let Some(hash) = line.strip_prefix(RUNNING_IN) {
            self.intermediate = Some(hash.trim().to_string());
            self.ran_steps += 1;
        } else if line == USING_CACHE {
            self.cached_steps += 1;
        }
    }

    /// どのステップも実行されなかった
    pub fn cached(&self) -> bool {
        self.ran_steps == 0
    }
}

/// イメージビルダー
pub struct ImageBuilder {
    engine: Arc<dyn Engine>,
    intervener: Arc<dyn Intervener>,
    settings: BuildSettings,
}

impl ImageBuilder {
    pub fn new(
        engine: Arc<dyn Engine>,
        intervener: Arc<dyn Intervener>,
        settings: BuildSettings,
    ) -> Self {
        Self {
            engine,
            intervener,
            settings,
        }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    pub fn settings(&self) -> &BuildSettings {
        &self.settings
    }

    /// 依存を含めて1つのイメージをビルド
    pub async fn make(&self, key: &str, images: &ImageSet) -> BuildResult<bool> {
        let mut memo = BuildMemo::new();
        self.build_image(key, images, &mut Vec::new(), &mut memo, false)
            .await
    }

    /// イメージをビルドし、キャッシュだけで済んだかを返す
    ///
    /// `chain` はビルド中のキーで、循環の検出に使う。`memo` にあるイメージは
    /// ビルドし直さない。
    pub fn build_image<'a>(
        &'a self,
        key: &'a str,
        images: &'a ImageSet,
        chain: &'a mut Vec<String>,
        memo: &'a mut BuildMemo,
        ignore_deps: bool,
    ) -> BoxFuture<'a, BuildResult<bool>> {
        async move {
            if let Some(position) = chain.iter().position(|k| k == key) {
                let mut cycle = chain[position..].to_vec();
                cycle.push(key.to_string());
                return Err(HarpoonError::DependencyCycle { chain: cycle }.into());
            }
            if let Some(cached) = memo.get(key) {
                return Ok(*cached);
            }

            let image = images.require(key)?;
            if !ignore_deps {
                chain.push(key.to_string());
                for dep in dependency_keys(image) {
                    self.build_image(&dep, images, chain, memo, false).await?;
                }
                chain.pop();
            }

            let cached = match &image.persistence {
                Some(settings) => persistence::build(self, image, images, settings).await?,
                None => self.build_one(image, images).await?,
            };
            memo.insert(key.to_string(), cached);
            Ok(cached)
        }
        .boxed()
    }

    async fn build_one(&self, image: &Image, images: &ImageSet) -> BuildResult<bool> {
        let rendered = render(image, images)?;
        let extras = self.resolve_extras(image, &rendered.extras).await?;
        self.build_with(
            image,
            &image.image_tag(),
            image.context.clone(),
            extras,
            &rendered.dockerfile,
        )
        .await
    }

    /// 追加ファイルの中身を用意する
    pub(crate) async fn resolve_extras(
        &self,
        image: &Image,
        extras: &[ExtraContext],
    ) -> BuildResult<Vec<ExtraBlob>> {
        let mut blobs = Vec::with_capacity(extras.len());
        for extra in extras {
            let data = match &extra.source {
                ExtraSource::Bytes(bytes) => bytes.clone(),
                ExtraSource::ImagePath { image_tag, path } => {
                    extract_from_image(self.engine.as_ref(), image_tag, path).await?
                }
                ExtraSource::Context(spec) => {
                    let spec = spec.clone();
                    blocking(&image.key, move || ContextBuilder::archive(&spec)).await?
                }
            };
            blobs.push(ExtraBlob {
                name: extra.name.clone(),
                data,
            });
        }
        Ok(blobs)
    }

    /// 指定したタグと Dockerfile でビルド
    pub(crate) async fn build_with(
        &self,
        image: &Image,
        tag: &str,
        context: ContextSpec,
        extras: Vec<ExtraBlob>,
        dockerfile: &str,
    ) -> BuildResult<bool> {
        info!(image = %image.key, tag = %tag, "Building image");
        println!("{} {}", "→".cyan(), format!("{} をビルド中...", tag).bold());

        let dockerfile_owned = dockerfile.to_string();
        let data = blocking(&image.key, move || {
            ContextBuilder::build_context(&context, &extras, &dockerfile_owned)
        })
        .await?;

        let old_id = self.engine.image_id(tag).await?;
        let options = BuildOptions {
            no_cache: self.settings.no_cache,
            pull: self.settings.pull,
            ..Default::default()
        };
        let progress = self.settings.silent_build.then(|| BuildProgress::new(tag));

        let mut output = BuildOutput::default();
        {
            let mut stream = self.engine.build_image(data, tag, &options);
            while let Some(message) = stream.next().await {
                match message {
                    Ok(message) => {
                        self.display(&message, progress.as_ref());
                        output.observe(&message);
                        if output.error.is_some() {
                            break;
                        }
                    }
                    Err(e) => {
                        output.error.get_or_insert(e.to_string());
                        break;
                    }
                }
            }
        }

        if let Some(message) = output.error.clone() {
            if let Some(progress) = &progress {
                progress.finish_error(&message);
            }
            warn!(image = %image.key, "Build failed: {}", message);
            if let Some(container) = &output.intermediate {
                self.offer_intervention(container, &image.key).await;
                self.remove_container(container).await;
            }
            return Err(BuildError::BuildFailed {
                image: image.key.clone(),
                message,
            });
        }

        let cached = output.cached();
        if let Some(progress) = &progress {
            progress.finish_success(cached);
        }
        debug!(
            ran = output.ran_steps,
            cached = output.cached_steps,
            "Build steps"
        );
        self.remove_replaced(tag, old_id).await;

        if cached {
            println!("{} {} (キャッシュ)", "✓".green(), tag);
        } else {
            println!("{} {}", "✓".green(), tag);
        }
        Ok(cached)
    }

    fn display(&self, message: &BuildMessage, progress: Option<&BuildProgress>) {
        if let Some(stream) = &message.stream {
            match progress {
                Some(progress) => progress.set_step(stream),
                None => print!("{}", stream),
            }
        }
        if let Some(status) = &message.status
            && progress.is_none()
        {
            println!("{}", status.cyan());
        }
    }

    /// 介入が有効なら失敗したコンテナでシェルを開く
    pub(crate) async fn offer_intervention(&self, container: &str, label: &str) {
        if !self.settings.intervene {
            return;
        }
        if let Err(e) = self
            .intervener
            .intervene(self.engine.as_ref(), container, label)
            .await
        {
            warn!(container = %container, "Intervention failed: {}", e);
        }
    }

    pub(crate) async fn remove_container(&self, id: &str) {
        match self.engine.remove_container(id, true).await {
            Ok(()) => debug!(container = %id, "Removed container"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(container = %id, "Failed to remove container: {}", e),
        }
    }

    /// 古いイメージがタグを失っていれば削除する
    pub(crate) async fn remove_replaced(&self, tag: &str, old_id: Option<String>) {
        if self.settings.keep_replaced {
            return;
        }
        let Some(old_id) = old_id else {
            return;
        };
        let dangling = match self.engine.image_tags(&old_id).await {
            Ok(Some(tags)) => tags.iter().all(|t| t == "<none>:<none>"),
            Ok(None) => false,
            Err(e) => {
                debug!(image = %old_id, "Failed to inspect replaced image: {}", e);
                false
            }
        };
        if !dangling {
            return;
        }

        info!(image = %old_id, tag = %tag, "Removing replaced image");
        if let Err(e) = self.engine.remove_image(&old_id, false).await {
            warn!(image = %old_id, "Failed to remove replaced image: {}", e);
        }
    }
}

/// 一時コンテナを作り、イメージ内のパスを tar で取り出す
///
/// イメージがなければ先に pull する。
pub async fn extract_from_image(
    engine: &dyn Engine,
    image_tag: &str,
    path: &str,
) -> BuildResult<Vec<u8>> {
    if engine.image_id(image_tag).await?.is_none() {
        crate::syncer::drain_pull(engine, image_tag, None).await?;
    }

    let suffix = uuid::Uuid::new_v4().simple().to_string();
    let spec = ContainerSpec {
        name: format!("harpoon-extract-{}", &suffix[..12]),
        image: image_tag.to_string(),
        cmd: Some(vec!["true".to_string()]),
        ..Default::default()
    };
    let id = engine.create_container(&spec).await?;
    debug!(container = %id, path = %path, "Extracting path from image");

    let result = engine.download(&id, path).await;
    if let Err(e) = engine.remove_container(&id, true).await {
        warn!(container = %id, "Failed to remove extraction container: {}", e);
    }
    Ok(result?)
}

async fn blocking<T, F>(image: &str, f: F) -> BuildResult<T>
where
    F: FnOnce() -> BuildResult<T> + Send + 'static,
    T: Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| BuildError::BuildFailed {
            image: image.to_string(),
            message: e.to_string(),
        })?
}
