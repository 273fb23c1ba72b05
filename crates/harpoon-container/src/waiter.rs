//! 依存コンテナの準備完了待機
//!
//! コンテナが起動していることを確認した上で、待機条件のプローブを
//! コンテナ内で実行し、すべて成功するまで一定間隔で繰り返す。

use crate::engine::Engine;
use crate::error::{ContainerError, Result};
use crate::runner::TRANSIENT_RETRIES;
use harpoon_core::WaitCondition;
use std::time::Duration;
use tokio::time::{Instant, sleep, timeout};
use tracing::{debug, info, warn};

/// 停止したコンテナについて表示するログの行数
const EXITED_LOG_LINES: usize = 20;

/// 待機条件がないときの確認間隔
const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 再確認までの最短の間隔
const MIN_PAUSE: Duration = Duration::from_millis(10);

/// 1回の確認結果
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WaitOutcome {
    Pass,
    KeepWaiting,
    Timedout,
}

/// 1回だけ確認する
///
/// コンテナが停止していれば `DependencyExited`。
pub async fn check_once(
    engine: &dyn Engine,
    image: &str,
    container_id: &str,
    condition: Option<&WaitCondition>,
    started: Instant,
) -> Result<WaitOutcome> {
    match check(engine, image, container_id, condition, started).await {
        // 一時的なエラーは待機を続ける
        Err(ContainerError::Engine(e)) if e.is_transient() => {
            debug!(container = container_id, "Transient engine error: {}", e);
            Ok(WaitOutcome::KeepWaiting)
        }
        result => result,
    }
}

async fn check(
    engine: &dyn Engine,
    image: &str,
    container_id: &str,
    condition: Option<&WaitCondition>,
    started: Instant,
) -> Result<WaitOutcome> {
    if let Some(condition) = condition
        && started.elapsed() > condition.timeout
    {
        return Ok(WaitOutcome::Timedout);
    }

    let Some(status) = engine.inspect_container(container_id).await? else {
        return Err(ContainerError::DependencyExited {
            image: image.to_string(),
            container: container_id.to_string(),
            exit_code: None,
        });
    };
    if !status.running {
        print_exited_logs(engine, container_id).await;
        return Err(ContainerError::DependencyExited {
            image: image.to_string(),
            container: container_id.to_string(),
            exit_code: status.exit_code,
        });
    }

    let Some(condition) = condition else {
        return Ok(WaitOutcome::Pass);
    };

    for probe in &condition.probes {
        let remaining = condition.timeout.saturating_sub(started.elapsed());
        let cmd = vec!["/bin/sh".to_string(), "-c".to_string(), probe.clone()];
        // 返ってこないコマンドも期限で打ち切る
        let Ok(result) = timeout(remaining, engine.exec(container_id, cmd)).await else {
            debug!(
                container = container_id,
                probe = %probe,
                "Probe did not finish before the deadline"
            );
            return Ok(WaitOutcome::Timedout);
        };
        match result {
            Ok(0) => {}
            Ok(code) => {
                debug!(container = container_id, probe = %probe, code, "Probe failed");
                return Ok(WaitOutcome::KeepWaiting);
            }
            Err(e) => {
                debug!(container = container_id, probe = %probe, "Probe errored: {}", e);
                return Ok(WaitOutcome::KeepWaiting);
            }
        }
    }
    Ok(WaitOutcome::Pass)
}

/// 準備完了まで待機
///
/// タイムアウトした場合はコンテナを強制停止して `DependencyTimedout` を返す。
/// 待機条件がない場合、一時的なエラーは `TRANSIENT_RETRIES` 回まで再試行する。
pub async fn wait_for_ready(
    engine: &dyn Engine,
    image: &str,
    container_id: &str,
    condition: Option<&WaitCondition>,
) -> Result<()> {
    let started = Instant::now();
    if let Some(condition) = condition {
        info!(
            image,
            container = container_id,
            timeout = ?condition.timeout,
            "Waiting for dependency"
        );
    }

    let mut transient_failures = 0;
    loop {
        let outcome = match check(engine, image, container_id, condition, started).await {
            Err(ContainerError::Engine(e)) if e.is_transient() => {
                transient_failures += 1;
                if condition.is_none() && transient_failures >= TRANSIENT_RETRIES {
                    return Err(e.into());
                }
                debug!(
                    container = container_id,
                    attempt = transient_failures,
                    "Transient engine error: {}",
                    e
                );
                WaitOutcome::KeepWaiting
            }
            result => result?,
        };
        match outcome {
            WaitOutcome::Pass => {
                debug!(image, container = container_id, "Dependency is ready");
                return Ok(());
            }
            WaitOutcome::Timedout => {
                warn!(image, container = container_id, "Timed out waiting for dependency");
                if let Err(e) = engine.kill_container(container_id).await {
                    warn!(container = container_id, "Failed to kill container: {}", e);
                }
                return Err(ContainerError::DependencyTimedout {
                    image: image.to_string(),
                    container: container_id.to_string(),
                });
            }
            WaitOutcome::KeepWaiting => {}
        }

        // 期限を越えて眠らない
        let pause = match condition {
            Some(condition) => {
                let remaining = condition.timeout.saturating_sub(started.elapsed());
                condition.wait_between_attempts.min(remaining)
            }
            None => POLL_INTERVAL,
        };
        sleep(pause.max(MIN_PAUSE)).await;
    }
}

async fn print_exited_logs(engine: &dyn Engine, container_id: &str) {
    match engine.logs(container_id, EXITED_LOG_LINES).await {
        Ok(lines) => {
            for line in lines {
                println!("  | {}", line);
            }
        }
        Err(e) => debug!(container = container_id, "Failed to read logs: {}", e),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerSpec;
    use crate::error::EngineError;
    use crate::testing::FakeEngine;

    async fn running(engine: &FakeEngine, image: &str) -> String {
        let id = engine
            .create_container(&ContainerSpec {
                name: format!("{image}-1"),
                image: image.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
        engine.start_container(&id).await.unwrap();
        id
    }

    #[tokio::test]
    async fn test_passes_when_all_probes_succeed() {
        let engine = FakeEngine::new();
        let id = running(&engine, "db").await;
        let condition = WaitCondition::new(vec!["true".into(), "test -f /ready".into()]);

        wait_for_ready(&engine, "db", &id, Some(&condition)).await.unwrap();
        assert_eq!(engine.exec_count(&id), 2);
    }

    #[tokio::test]
    async fn test_times_out_and_kills_container() {
        let engine = FakeEngine::new();
        engine.set_exec_exit_code("exit 1", 1);
        let id = running(&engine, "db").await;
        let condition = WaitCondition::new(vec!["exit 1".into()])
            .with_timeout(0.3)
            .with_wait_between_attempts(0.1);

        let err = wait_for_ready(&engine, "db", &id, Some(&condition))
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::DependencyTimedout { .. }));
        assert!(!engine.container(&id).unwrap().running);
    }

    #[tokio::test]
    async fn test_exited_container_fails_immediately() {
        let engine = FakeEngine::new();
        engine.exit_immediately("db", 3);
        let id = running(&engine, "db").await;

        let err = wait_for_ready(&engine, "db", &id, None).await.unwrap_err();
        match err {
            ContainerError::DependencyExited { exit_code, .. } => assert_eq!(exit_code, Some(3)),
            other => panic!("unexpected error: {other}"),
        }
    }

    #[tokio::test]
    async fn test_hanging_probe_times_out() {
        let engine = FakeEngine::new();
        engine.hang_exec("curl http://hang");
        let id = running(&engine, "db").await;
        let condition = WaitCondition::new(vec!["curl http://hang".into()]).with_timeout(0.5);

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            wait_for_ready(&engine, "db", &id, Some(&condition)),
        )
        .await
        .expect("wait should end at its own deadline");
        assert!(matches!(
            result,
            Err(ContainerError::DependencyTimedout { .. })
        ));
        assert!(!engine.container(&id).unwrap().running);
    }

    #[tokio::test]
    async fn test_transient_errors_without_condition_are_bounded() {
        let engine = FakeEngine::new();
        let id = running(&engine, "db").await;
        engine.fail_inspect(EngineError::Transient("connection closed".into()));

        let result = tokio::time::timeout(
            Duration::from_secs(3),
            wait_for_ready(&engine, "db", &id, None),
        )
        .await
        .expect("wait should give up on repeated transient errors");
        assert!(matches!(
            result,
            Err(ContainerError::Engine(EngineError::Transient(_)))
        ));
        assert_eq!(engine.inspect_count(), TRANSIENT_RETRIES as usize);
    }

    #[tokio::test]
    async fn test_check_once_treats_transient_error_as_keep_waiting() {
        let engine = FakeEngine::new();
        let id = running(&engine, "db").await;
        engine.fail_inspect(EngineError::Transient("connection closed".into()));

        let outcome = check_once(&engine, "db", &id, None, Instant::now())
            .await
            .unwrap();
        assert_eq!(outcome, WaitOutcome::KeepWaiting);
    }
}
