use harpoon_core::{ErrorDetails, HarpoonError};
use serde_json::{Map, Value, json};
use std::path::PathBuf;
use thiserror::Error;

/// コンテナエンジンとのやりとりで起きたエラー
#[derive(Error, Debug, Clone, PartialEq)]
pub enum EngineError {
    #[error("見つかりません: {0}")]
    NotFound(String),

    #[error("競合しています: {0}")]
    Conflict(String),

    /// 接続断など、リトライで回復しうるもの
    #[error(
        "Dockerに接続できません: {0}\n\nヒント:\n  • Dockerが起動しているか確認してください\n  • DOCKER_HOST の設定を確認してください"
    )]
    Transient(String),

    #[error("Docker APIエラー: {0}")]
    Api(String),

    #[error("ストリームエラー: {0}")]
    Stream(String),
}

impl EngineError {
    pub fn is_not_found(&self) -> bool {
        matches!(self, EngineError::NotFound(_))
    }

    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Transient(_))
    }
}

impl From<bollard::errors::Error> for EngineError {
    fn from(err: bollard::errors::Error) -> Self {
        match &err {
            bollard::errors::Error::DockerResponseServerError {
                status_code: 404,
                message,
            } => EngineError::NotFound(message.clone()),
            bollard::errors::Error::DockerResponseServerError {
                status_code: 409,
                message,
            } => EngineError::Conflict(message.clone()),
            bollard::errors::Error::DockerStreamError { error } => {
                EngineError::Stream(error.clone())
            }
            _ => {
                // 接続エラーの可能性をチェック
                let err_str = err.to_string();
                if err_str.contains("Connection refused")
                    || err_str.contains("No such file or directory")
                    || err_str.contains("connection closed")
                    || err_str.contains("timed out")
                {
                    EngineError::Transient(err_str)
                } else {
                    EngineError::Api(err_str)
                }
            }
        }
    }
}

pub type EngineResult<T> = std::result::Result<T, EngineError>;

#[derive(Error, Debug)]
pub enum ContainerError {
    #[error(transparent)]
    Config(#[from] HarpoonError),

    #[error(transparent)]
    Engine(#[from] EngineError),

    #[error(
        "ホスト側のポートが既に使用されています: {}\n\nヒント:\n  • 別のポート番号を使用してください\n  • 既存のコンテナを停止してください",
        ports.join(", ")
    )]
    PortsBound { ports: Vec<String> },

    #[error("マウント元ディレクトリを作成できません: {}\n理由: {message}", path.display())]
    BindDirMissing { path: PathBuf, message: String },

    #[error(
        "依存イメージ '{image}' の準備完了を待機中にタイムアウトしました（コンテナ {container}）\n\nヒント:\n  • wait_condition の timeout を増やしてみてください"
    )]
    DependencyTimedout { image: String, container: String },

    #[error("依存イメージ '{image}' のコンテナ {container} が終了しました（終了コード: {}）", exit_code.map(|c| c.to_string()).unwrap_or_else(|| "不明".into()))]
    DependencyExited {
        image: String,
        container: String,
        exit_code: Option<i64>,
    },

    #[error("ユーザーにより中断されました")]
    UserQuit,
}

impl ErrorDetails for ContainerError {
    fn error_code(&self) -> &'static str {
        match self {
            ContainerError::Config(e) => e.error_code(),
            ContainerError::Engine(EngineError::Transient(_)) => "EngineUnavailable",
            ContainerError::Engine(_) => "EngineError",
            ContainerError::PortsBound { .. } => "PortsBound",
            ContainerError::BindDirMissing { .. } => "BindDirMissing",
            ContainerError::DependencyTimedout { .. } => "DependencyTimedout",
            ContainerError::DependencyExited { .. } => "DependencyExited",
            ContainerError::UserQuit => "UserQuit",
        }
    }

    fn details(&self) -> Map<String, Value> {
        let value = match self {
            ContainerError::Config(e) => return e.details(),
            ContainerError::Engine(e) => {
                json!({ "message": "Container engine failed", "reason": e.to_string() })
            }
            ContainerError::PortsBound { ports } => {
                json!({ "message": "Ports are already bound", "ports": ports })
            }
            ContainerError::BindDirMissing { path, message } => json!({
                "message": "Failed to create bind directory",
                "path": path.display().to_string(),
                "reason": message,
            }),
            ContainerError::DependencyTimedout { image, container } => json!({
                "message": "Timed out waiting for dependency",
                "image": image,
                "container": container,
            }),
            ContainerError::DependencyExited {
                image,
                container,
                exit_code,
            } => json!({
                "message": "Dependency exited before becoming ready",
                "image": image,
                "container": container,
                "exit_code": exit_code,
            }),
            ContainerError::UserQuit => json!({ "message": "User quit" }),
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

pub type Result<T> = std::result::Result<T, ContainerError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bollard_status_codes_are_classified() {
        let not_found = bollard::errors::Error::DockerResponseServerError {
            status_code: 404,
            message: "No such container: abc".into(),
        };
        assert_eq!(
            EngineError::from(not_found),
            EngineError::NotFound("No such container: abc".into())
        );

        let conflict = bollard::errors::Error::DockerResponseServerError {
            status_code: 409,
            message: "in use".into(),
        };
        assert!(matches!(EngineError::from(conflict), EngineError::Conflict(_)));
    }

    #[test]
    fn test_config_errors_keep_their_code() {
        let err = ContainerError::from(HarpoonError::bad_value("<request>.image", "missing"));
        assert_eq!(err.error_code(), "BadSpecValue");
        assert_eq!(err.details()["meta"], "<request>.image");
    }

    #[test]
    fn test_ports_bound_lists_ports() {
        let err = ContainerError::PortsBound {
            ports: vec!["8080".into(), "9000/udp".into()],
        };
        assert!(err.to_string().contains("8080, 9000/udp"));
        assert_eq!(err.details()["ports"][1], "9000/udp");
    }
}
