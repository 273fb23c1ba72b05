//! 失敗したコンテナへの介入
//!
//! 失敗したコンテナをイメージとしてコミットし、そこからシェルを起動して
//! 調査できるようにする。終了後はコンテナと一時イメージを片付ける。

use crate::engine::{ContainerSpec, Engine};
use crate::error::Result;
use async_trait::async_trait;
use colored::Colorize;
use tracing::{debug, info, warn};

/// 介入用シェル
pub const INTERVENTION_SHELL: &str = "/bin/bash";

/// 介入の手順
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InterventionStep {
    Commit,
    Create,
    Start,
    Stop,
    RemoveImage,
    Done,
}

#[async_trait]
pub trait Intervener: Send + Sync {
    /// 失敗したコンテナ（またはビルドの中間コンテナ）で調査用シェルを開く
    async fn intervene(&self, engine: &dyn Engine, container_id: &str, label: &str) -> Result<()>;
}

/// 何もしない
#[derive(Debug, Clone, Copy, Default)]
pub struct NoIntervention;

#[async_trait]
impl Intervener for NoIntervention {
    async fn intervene(&self, _engine: &dyn Engine, container_id: &str, _label: &str) -> Result<()> {
        debug!(container = container_id, "Intervention disabled");
        Ok(())
    }
}

/// 確認してからシェルを開く
#[derive(Debug, Clone)]
pub struct ShellIntervener {
    pub shell: String,
    /// 確認せずに開く
    pub assume_yes: bool,
}

impl Default for ShellIntervener {
    fn default() -> Self {
        Self {
            shell: INTERVENTION_SHELL.to_string(),
            assume_yes: false,
        }
    }
}

impl ShellIntervener {
    async fn confirm(&self, label: &str) -> bool {
        if self.assume_yes {
            return true;
        }
        println!(
            "{}",
            format!("⚠ {} が失敗しました。コンテナ内で調査しますか？ [y/N]", label).yellow()
        );
        let answer = tokio::task::spawn_blocking(|| {
            let mut line = String::new();
            std::io::stdin().read_line(&mut line).map(|_| line)
        })
        .await;
        matches!(answer, Ok(Ok(line)) if matches!(line.trim(), "y" | "Y" | "yes"))
    }
}

#[async_trait]
impl Intervener for ShellIntervener {
    async fn intervene(&self, engine: &dyn Engine, container_id: &str, label: &str) -> Result<()> {
        if !self.confirm(label).await {
            return Ok(());
        }

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let image = format!("harpoon-intervention:{}", &suffix[..12]);
        let mut shell_container: Option<String> = None;
        let mut step = InterventionStep::Commit;
        let mut failure = None;

        // 途中で失敗しても後片付けの手順は必ず通る
        while step != InterventionStep::Done {
            debug!(?step, container = container_id, "Intervention step");
            let result = match step {
                InterventionStep::Commit => engine
                    .commit_container(container_id, &image, None)
                    .await
                    .map(|_| InterventionStep::Create),
                InterventionStep::Create => {
                    let spec = ContainerSpec {
                        name: format!("harpoon-intervention-{}", &suffix[..12]),
                        image: image.clone(),
                        cmd: Some(vec![self.shell.clone()]),
                        tty: true,
                        open_stdin: true,
                        ..Default::default()
                    };
                    engine.create_container(&spec).await.map(|id| {
                        shell_container = Some(id);
                        InterventionStep::Start
                    })
                }
                InterventionStep::Start => match &shell_container {
                    Some(id) => {
                        info!(container = %id, "Starting intervention shell");
                        engine.start_attached(id, true).await.map(|_| InterventionStep::Stop)
                    }
                    None => Ok(InterventionStep::Stop),
                },
                InterventionStep::Stop => {
                    if let Some(id) = shell_container.take() {
                        let _ = engine.stop_container(&id, 5).await;
                        if let Err(e) = engine.remove_container(&id, true).await {
                            warn!(container = %id, "Failed to remove intervention container: {}", e);
                        }
                    }
                    Ok(InterventionStep::RemoveImage)
                }
                InterventionStep::RemoveImage => {
                    if let Err(e) = engine.remove_image(&image, true).await
                        && !e.is_not_found()
                    {
                        warn!(image = %image, "Failed to remove intervention image: {}", e);
                    }
                    Ok(InterventionStep::Done)
                }
                InterventionStep::Done => Ok(InterventionStep::Done),
            };

            step = match result {
                Ok(next) => next,
                Err(e) => {
                    warn!(?step, "Intervention failed: {}", e);
                    failure.get_or_insert(e);
                    match step {
                        InterventionStep::Commit => InterventionStep::Done,
                        InterventionStep::Create | InterventionStep::Start => InterventionStep::Stop,
                        _ => InterventionStep::RemoveImage,
                    }
                }
            };
        }

        match failure {
            Some(e) => Err(e.into()),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::{EngineCall, FakeEngine};

    #[tokio::test]
    async fn test_intervention_cleans_up() {
        let engine = FakeEngine::new();
        engine.add_image("app");
        let failed = engine
            .create_container(&ContainerSpec {
                name: "app-1".into(),
                image: "app".into(),
                ..Default::default()
            })
            .await
            .unwrap();

        let intervener = ShellIntervener {
            assume_yes: true,
            ..Default::default()
        };
        intervener.intervene(&engine, &failed, "app").await.unwrap();

        let calls = engine.calls();
        assert!(matches!(calls[1], EngineCall::Commit { .. }));
        assert!(calls.iter().any(|c| matches!(c, EngineCall::StartAttached { .. })));
        assert!(matches!(calls.last(), Some(EngineCall::RemoveImage { .. })));
        // 失敗したコンテナだけが残る
        assert_eq!(engine.containers().len(), 1);
        assert!(!engine.has_image("harpoon-intervention"));
    }

    #[tokio::test]
    async fn test_commit_failure_skips_cleanup() {
        let engine = FakeEngine::new();
        let intervener = ShellIntervener {
            assume_yes: true,
            ..Default::default()
        };
        assert!(intervener.intervene(&engine, "missing", "app").await.is_err());
        assert_eq!(engine.calls().len(), 1);
    }
}
