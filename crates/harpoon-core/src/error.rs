use serde_json::{Map, Value, json};
use std::path::PathBuf;
use thiserror::Error;

/// エラー種別と付随する key-value を公開するためのトレイト
///
/// コンテナマネージャーは `{error: {...}, error_code: ...}` 形式の JSON を返すため、
/// すべてのクレートのエラーはこのトレイトを実装する。
pub trait ErrorDetails: std::error::Error {
    /// エラー種別名（例: `DependencyCycle`）
    fn error_code(&self) -> &'static str;

    /// エラーに付随する key-value（`message` を必ず含む）
    fn details(&self) -> Map<String, Value>;
}

#[derive(Error, Debug)]
pub enum HarpoonError {
    #[error("設定が不正です: {message}")]
    BadConfiguration { message: String },

    #[error("不正な値です: {path}\n理由: {message}")]
    BadSpecValue { path: String, message: String },

    #[error("イメージ '{image}' のコマンドが不正です: {message}")]
    BadInstruction { image: String, message: String },

    #[error("循環依存が検出されました: {}", chain.join(" -> "))]
    DependencyCycle { chain: Vec<String> },

    #[error("イメージ '{image}' が見つかりません\n利用可能なイメージ: {}", available.join(", "))]
    NoSuchImage {
        image: String,
        available: Vec<String>,
    },

    #[error("タスク '{task}' が見つかりません\n利用可能なタスク: {}", available.join(", "))]
    NoSuchTask {
        task: String,
        available: Vec<String>,
    },

    #[error("タスク '{task}' にはイメージの指定が必要です")]
    MissingImage { task: String },

    #[error("環境変数 '{name}' が設定されておらず、デフォルト値もありません")]
    MissingEnv { name: String },

    #[error("ファイル読み込みエラー: {path}\n理由: {message}")]
    Io { path: PathBuf, message: String },

    #[error("YAMLパースエラー: {0}")]
    Yaml(#[from] serde_yaml::Error),
}

impl HarpoonError {
    pub fn bad_config(message: impl Into<String>) -> Self {
        HarpoonError::BadConfiguration {
            message: message.into(),
        }
    }

    pub fn bad_value(path: impl Into<String>, message: impl Into<String>) -> Self {
        HarpoonError::BadSpecValue {
            path: path.into(),
            message: message.into(),
        }
    }

    pub fn bad_instruction(image: impl Into<String>, message: impl Into<String>) -> Self {
        HarpoonError::BadInstruction {
            image: image.into(),
            message: message.into(),
        }
    }
}

impl ErrorDetails for HarpoonError {
    fn error_code(&self) -> &'static str {
        match self {
            HarpoonError::BadConfiguration { .. } => "BadConfiguration",
            HarpoonError::BadSpecValue { .. } => "BadSpecValue",
            HarpoonError::BadInstruction { .. } => "BadInstruction",
            HarpoonError::DependencyCycle { .. } => "DependencyCycle",
            HarpoonError::NoSuchImage { .. } => "NoSuchImage",
            HarpoonError::NoSuchTask { .. } => "NoSuchTask",
            HarpoonError::MissingImage { .. } => "MissingImage",
            HarpoonError::MissingEnv { .. } => "MissingEnv",
            HarpoonError::Io { .. } => "BadConfiguration",
            HarpoonError::Yaml(_) => "BadConfiguration",
        }
    }

    fn details(&self) -> Map<String, Value> {
        let value = match self {
            HarpoonError::BadConfiguration { message } => {
                json!({ "message": "Bad configuration", "reason": message })
            }
            HarpoonError::BadSpecValue { path, message } => {
                json!({ "message": "Bad value", "meta": path, "reason": message })
            }
            HarpoonError::BadInstruction { image, message } => {
                json!({ "message": "Bad instruction", "image": image, "reason": message })
            }
            HarpoonError::DependencyCycle { chain } => {
                json!({ "message": "Found a dependency cycle", "chain": chain })
            }
            HarpoonError::NoSuchImage { image, available } => {
                json!({ "message": "No such image", "image": image, "available": available })
            }
            HarpoonError::NoSuchTask { task, available } => {
                json!({ "message": "No such task", "task": task, "available": available })
            }
            HarpoonError::MissingImage { task } => {
                json!({ "message": "Task requires an image", "task": task })
            }
            HarpoonError::MissingEnv { name } => {
                json!({ "message": "Environment variable not set and has no default", "name": name })
            }
            HarpoonError::Io { path, message } => {
                json!({ "message": "Failed to read file", "path": path.display().to_string(), "reason": message })
            }
            HarpoonError::Yaml(e) => json!({ "message": "Failed to parse yaml", "reason": e.to_string() }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, HarpoonError>;
