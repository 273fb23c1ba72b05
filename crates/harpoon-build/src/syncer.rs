//! イメージの push / pull
//!
//! エンジンの進捗を1行に上書き表示し、エラー行を `PushFailed` / `PullFailed`
//! に変換する。

use crate::auth::{Access, RegistryAuth};
use crate::error::{BuildError, BuildResult};
use colored::Colorize;
use futures_util::StreamExt;
use harpoon_container::{Credentials, Engine, ProgressMessage, normalize_reference};
use harpoon_core::{HarpoonError, Image};
use std::io::Write;
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info, warn};

/// 他のクライアントが同じイメージを pull 中の場合のリトライ回数
const PULL_RETRIES: u32 = 5;
const PULL_RETRY_DELAY: Duration = Duration::from_millis(500);
const CONCURRENT_PULL_MESSAGE: &str = "already being pulled by another client";

pub struct Syncer {
    engine: Arc<dyn Engine>,
    auth: RegistryAuth,
}

impl Syncer {
    pub fn new(engine: Arc<dyn Engine>, auth: RegistryAuth) -> Self {
        Self { engine, auth }
    }

    /// イメージをレジストリに push
    pub async fn push(&self, image: &Image) -> BuildResult<()> {
        if !image.is_pushable() {
            return Err(HarpoonError::bad_config(format!(
                "イメージ '{}' には image_index がないため push できません",
                image.key
            ))
            .into());
        }
        self.push_reference(&image.image_tag()).await
    }

    pub async fn push_reference(&self, reference: &str) -> BuildResult<()> {
        let reference = normalize_reference(reference);
        if let Some((_, tag)) = reference.rsplit_once(':') {
            validate_tag(tag).map_err(|message| BuildError::PushFailed {
                image: reference.clone(),
                message,
            })?;
        }
        let credentials = self.auth.get_credentials(&reference, Access::Writing)?;

        println!("  → {}", reference.cyan());
        info!(image = %reference, "Pushing image");

        let mut stream = self.engine.push_image(&reference, credentials);
        let mut printer = ProgressPrinter::new("↑");
        let mut failure = None;
        while let Some(message) = stream.next().await {
            match message {
                Ok(message) => {
                    if let Some(error) = message.error {
                        failure = Some(error);
                        break;
                    }
                    printer.show(&message);
                }
                Err(e) => {
                    failure = Some(e.to_string());
                    break;
                }
            }
        }
        printer.finish();

        match failure {
            Some(message) => Err(BuildError::PushFailed {
                image: reference.clone(),
                message,
            }),
            None => {
                println!("{} {} を push しました", "✓".green(), reference);
                Ok(())
            }
        }
    }

    /// イメージを pull
    ///
    /// `ignore_missing` なら失敗は警告に留める。
    pub async fn pull(&self, image: &Image, ignore_missing: bool) -> BuildResult<()> {
        self.pull_reference(&image.image_tag(), ignore_missing).await
    }

    pub async fn pull_reference(&self, reference: &str, ignore_missing: bool) -> BuildResult<()> {
        let reference = normalize_reference(reference);
        let credentials = self.auth.get_credentials(&reference, Access::Reading)?;

        println!("  {} {}", "↓".cyan(), reference);
        info!(image = %reference, "Pulling image");

        let mut attempt = 0;
        loop {
            match drain_pull(self.engine.as_ref(), &reference, credentials.clone()).await {
                Ok(()) => {
                    println!("{} {} を pull しました", "✓".green(), reference);
                    return Ok(());
                }
                Err(BuildError::PullFailed { message, .. })
                    if message.contains(CONCURRENT_PULL_MESSAGE) && attempt < PULL_RETRIES =>
                {
                    attempt += 1;
                    debug!(image = %reference, attempt, "Image is being pulled by another client, retrying");
                    tokio::time::sleep(PULL_RETRY_DELAY * attempt).await;
                }
                Err(BuildError::PullFailed { image, message }) if ignore_missing => {
                    warn!(image = %image, "Ignoring pull failure: {}", message);
                    println!(
                        "{}",
                        format!("⚠ {} を pull できませんでした（無視します）: {}", image, message)
                            .yellow()
                    );
                    return Ok(());
                }
                Err(e) => return Err(e),
            }
        }
    }
}

/// pull のストリームを最後まで読む
pub(crate) async fn drain_pull(
    engine: &dyn Engine,
    reference: &str,
    credentials: Option<Credentials>,
) -> BuildResult<()> {
    let mut stream = engine.pull_image(reference, credentials);
    let mut printer = ProgressPrinter::new("↓");
    let mut failure = None;
    while let Some(message) = stream.next().await {
        match message {
            Ok(message) => {
                if let Some(error) = message.error {
                    failure = Some(error);
                    break;
                }
                printer.show(&message);
            }
            Err(e) => {
                failure = Some(e.to_string());
                break;
            }
        }
    }
    printer.finish();

    match failure {
        Some(message) => Err(BuildError::PullFailed {
            image: reference.to_string(),
            message,
        }),
        None => Ok(()),
    }
}

/// タグのバリデーション
///
/// 128文字以下、英数字とピリオド、ハイフン、アンダースコアのみ、
/// 先頭はピリオドまたはハイフンではない。
pub fn validate_tag(tag: &str) -> Result<(), String> {
    if tag.is_empty() {
        return Err("タグが空です".to_string());
    }
    if tag.len() > 128 {
        return Err(format!("タグが長すぎます（{}文字、最大128文字）", tag.len()));
    }
    if tag.starts_with('.') || tag.starts_with('-') {
        return Err(format!("タグの先頭にピリオドやハイフンは使えません: {}", tag));
    }
    if let Some(c) = tag
        .chars()
        .find(|c| !c.is_ascii_alphanumeric() && *c != '.' && *c != '-' && *c != '_')
    {
        return Err(format!("タグに使えない文字 '{}' が含まれています: {}", c, tag));
    }
    Ok(())
}

/// 進捗行の表示
struct ProgressPrinter {
    arrow: &'static str,
    last_status: String,
    in_progress: bool,
}

impl ProgressPrinter {
    fn new(arrow: &'static str) -> Self {
        Self {
            arrow,
            last_status: String::new(),
            in_progress: false,
        }
    }

    fn show(&mut self, message: &ProgressMessage) {
        let Some(status) = &message.status else {
            return;
        };

        if let Some(progress) = message.progress.as_deref().filter(|p| !p.is_empty()) {
            // 同じ行を上書きする
            print!("\r  {} {} {}     ", self.arrow, status, progress);
            std::io::stdout().flush().ok();
            self.in_progress = true;
            return;
        }

        match status.as_str() {
            "Preparing" | "Waiting" | "Pulling fs layer" | "Verifying Checksum" => {}
            "Pushed" | "Layer already exists" | "Pull complete" | "Already exists" => {
                self.clear_line();
                println!("  {} {}", "✓".green(), status);
            }
            _ => {
                if *status != self.last_status {
                    self.clear_line();
                    println!("  ℹ {}", status);
                    self.last_status = status.clone();
                }
            }
        }
    }

    fn clear_line(&mut self) {
        if self.in_progress {
            println!();
            self.in_progress = false;
        }
    }

    fn finish(&mut self) {
        self.clear_line();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use harpoon_container::testing::{EngineCall, FakeEngine};
    use harpoon_core::ContextSpec;

    fn syncer(engine: &Arc<FakeEngine>) -> Syncer {
        Syncer::new(
            engine.clone(),
            RegistryAuth::with_config_path("/nonexistent/config.json".into(), Default::default()),
        )
    }

    fn pushable(key: &str) -> Image {
        let mut image = Image::new(key, ContextSpec::disabled("."));
        image.image_index = Some("registry.example.com/".into());
        image.image_name = format!("registry.example.com/{}", key);
        image
    }

    #[test]
    fn test_validate_tag() {
        assert!(validate_tag("v1.0.0").is_ok());
        assert!(validate_tag("latest").is_ok());
        assert!(validate_tag("").is_err());
        assert!(validate_tag("-bad").is_err());
        assert!(validate_tag("with/slash").is_err());
        assert!(validate_tag(&"a".repeat(129)).is_err());
    }

    #[tokio::test]
    async fn test_push() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("registry.example.com/app");

        syncer(&engine).push(&pushable("app")).await.unwrap();
        assert!(engine.calls().contains(&EngineCall::Push {
            reference: "registry.example.com/app:latest".into()
        }));
    }

    #[tokio::test]
    async fn test_push_requires_image_index() {
        let engine = Arc::new(FakeEngine::new());
        let image = Image::new("app", ContextSpec::disabled("."));
        let err = syncer(&engine).push(&image).await.unwrap_err();
        assert!(matches!(err, BuildError::Config(HarpoonError::BadConfiguration { .. })));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_push_error_line_fails() {
        let engine = Arc::new(FakeEngine::new());
        engine.add_image("registry.example.com/app");
        engine.fail_push("registry.example.com/app", "denied: requested access is denied");

        let err = syncer(&engine).push(&pushable("app")).await.unwrap_err();
        assert!(matches!(err, BuildError::PushFailed { ref message, .. } if message.contains("denied")));
    }

    #[tokio::test]
    async fn test_pull_ignore_missing() {
        let engine = Arc::new(FakeEngine::new());
        engine.fail_pull("missing/image", "manifest unknown");
        let syncer = syncer(&engine);

        let err = syncer.pull_reference("missing/image", false).await.unwrap_err();
        assert!(matches!(err, BuildError::PullFailed { .. }));
        syncer.pull_reference("missing/image", true).await.unwrap();
    }

    #[tokio::test]
    async fn test_pull() {
        let engine = Arc::new(FakeEngine::new());
        syncer(&engine).pull_reference("python:3", false).await.unwrap();
        assert!(engine.has_image("python:3"));
    }
}
