//! 待機条件定義

use serde::Serialize;
use std::time::Duration;

/// デフォルトのタイムアウト（秒）
pub const DEFAULT_WAIT_TIMEOUT: f64 = 300.0;

/// デフォルトの試行間隔（秒）
pub const DEFAULT_WAIT_BETWEEN_ATTEMPTS: f64 = 5.0;

/// 試行間隔の下限（秒）
pub const MIN_WAIT_BETWEEN_ATTEMPTS: f64 = 0.1;

/// 依存コンテナの準備完了を判定する条件
///
/// 各プローブはコンテナ内で `/bin/sh -c` として実行され、
/// すべてが 0 で終了すれば準備完了とみなす。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WaitCondition {
    pub timeout: Duration,
    pub wait_between_attempts: Duration,
    pub probes: Vec<String>,
}

impl WaitCondition {
    pub fn new(probes: Vec<String>) -> Self {
        Self {
            timeout: Duration::from_secs_f64(DEFAULT_WAIT_TIMEOUT),
            wait_between_attempts: Duration::from_secs_f64(DEFAULT_WAIT_BETWEEN_ATTEMPTS),
            probes,
        }
    }

    pub fn with_timeout(mut self, seconds: f64) -> Self {
        self.timeout = Duration::from_secs_f64(seconds.max(0.0));
        self
    }

    /// 下限未満の値は下限に丸める
    pub fn with_wait_between_attempts(mut self, seconds: f64) -> Self {
        self.wait_between_attempts =
            Duration::from_secs_f64(seconds.max(MIN_WAIT_BETWEEN_ATTEMPTS));
        self
    }
}

/// シェル文字列用のシングルクォート
pub fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wait_between_attempts_is_clamped() {
        let condition = WaitCondition::new(vec!["true".into()]).with_wait_between_attempts(0.0);
        assert_eq!(condition.wait_between_attempts, Duration::from_millis(100));
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }
}
