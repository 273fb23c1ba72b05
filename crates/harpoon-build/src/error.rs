use harpoon_container::{ContainerError, EngineError};
use harpoon_core::{ErrorDetails, HarpoonError};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum BuildError {
    #[error(transparent)]
    Config(#[from] HarpoonError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error("イメージ '{image}' のビルドに失敗しました: {message}")]
    BuildFailed { image: String, message: String },

    #[error("イメージ '{image}' のプッシュに失敗しました: {message}")]
    PushFailed { image: String, message: String },

    #[error("イメージ '{image}' のプルに失敗しました: {message}")]
    PullFailed { image: String, message: String },

    #[error("gitリポジトリとして扱えません: {}\n理由: {message}", root.display())]
    VcsUnavailable { root: PathBuf, message: String },

    #[error(
        "shallow clone ではコミット時刻を取得できません: {}\n\nヒント:\n  • git fetch --unshallow を実行してください",
        root.display()
    )]
    ShallowRepo { root: PathBuf },

    #[error("glob パターンが不正です: {pattern}\n理由: {message}")]
    BadGlob { pattern: String, message: String },

    #[error("レジストリ '{registry}' の認証情報を取得できません: {message}")]
    AuthFailed { registry: String, message: String },

    #[error("ファイル操作エラー: {}\n理由: {message}", path.display())]
    Io { path: PathBuf, message: String },
}

impl BuildError {
    pub fn io(path: impl Into<PathBuf>, err: impl std::fmt::Display) -> Self {
        BuildError::Io {
            path: path.into(),
            message: err.to_string(),
        }
    }

    /// ユーザーの中断によるものか
    pub fn is_user_quit(&self) -> bool {
        matches!(self, BuildError::Container(ContainerError::UserQuit))
    }

    /// ユーザーフレンドリーなエラーメッセージを生成
    pub fn user_message(&self) -> String {
        match self {
            BuildError::BuildFailed { image, message } => format!(
                "イメージ '{}' のビルドに失敗しました\n\n{}\n\nヒント:\n  • --silent-build を外して出力を確認してください\n  • コマンドの記述を確認してください",
                image, message
            ),
            BuildError::PullFailed { image, message } => format!(
                "イメージ '{}' のプルに失敗しました\n\n{}\n\nヒント:\n  • イメージ名とタグを確認してください\n  • 存在しないイメージを無視するには --ignore-missing を指定してください",
                image, message
            ),
            _ => self.to_string(),
        }
    }
}

impl ErrorDetails for BuildError {
    fn error_code(&self) -> &'static str {
        match self {
            BuildError::Config(e) => e.error_code(),
            BuildError::Container(e) => e.error_code(),
            BuildError::Engine(EngineError::Transient(_)) => "EngineUnavailable",
            BuildError::Engine(_) => "EngineError",
            BuildError::BuildFailed { .. } => "BuildFailed",
            BuildError::PushFailed { .. } => "PushFailed",
            BuildError::PullFailed { .. } => "PullFailed",
            BuildError::VcsUnavailable { .. } => "VCSUnavailable",
            BuildError::ShallowRepo { .. } => "ShallowRepo",
            BuildError::BadGlob { .. } => "BadGlob",
            BuildError::AuthFailed { .. } => "BadConfiguration",
            BuildError::Io { .. } => "BadConfiguration",
        }
    }

    fn details(&self) -> Map<String, Value> {
        let value = match self {
            BuildError::Config(e) => return e.details(),
            BuildError::Container(e) => return e.details(),
            BuildError::Engine(e) => {
                json!({ "message": "Container engine failed", "reason": e.to_string() })
            }
            BuildError::BuildFailed { image, message } => {
                json!({ "message": "Failed to build an image", "image": image, "reason": message })
            }
            BuildError::PushFailed { image, message } => {
                json!({ "message": "Failed to push an image", "image": image, "reason": message })
            }
            BuildError::PullFailed { image, message } => {
                json!({ "message": "Failed to pull an image", "image": image, "reason": message })
            }
            BuildError::VcsUnavailable { root, message } => json!({
                "message": "Context requires git but the directory is not a repository",
                "root": root.display().to_string(),
                "reason": message,
            }),
            BuildError::ShallowRepo { root } => json!({
                "message": "Can't get commit times from a shallow clone",
                "root": root.display().to_string(),
            }),
            BuildError::BadGlob { pattern, message } => {
                json!({ "message": "Invalid glob", "pattern": pattern, "reason": message })
            }
            BuildError::AuthFailed { registry, message } => json!({
                "message": "Failed to get registry credentials",
                "registry": registry,
                "reason": message,
            }),
            BuildError::Io { path, message } => json!({
                "message": "File operation failed",
                "path": path.display().to_string(),
                "reason": message,
            }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

pub type BuildResult<T> = std::result::Result<T, BuildError>;
