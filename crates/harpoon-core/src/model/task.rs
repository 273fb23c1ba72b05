//! タスク定義

use super::EnvSpec;
use serde::Serialize;

/// タスク実行時の上書きオプション
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct TaskOverrides {
    pub command: Option<String>,
    pub bash: Option<String>,
    pub env: Vec<EnvSpec>,
}

/// 設定ファイルで定義されたタスク
///
/// `images.<key>.tasks` ではイメージが暗黙に決まり、
/// トップレベルの `tasks` では `image` で指定する。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ImageTask {
    pub name: String,
    /// 組み込みタスク名（デフォルト: `run`）
    pub action: String,
    pub image: Option<String>,
    pub description: Option<String>,
    pub overrides: TaskOverrides,
}
