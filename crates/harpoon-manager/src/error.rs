use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use harpoon_build::BuildError;
use harpoon_container::ContainerError;
use harpoon_core::{ErrorDetails, HarpoonError};
use serde_json::{Map, Value, json};
use thiserror::Error;
use tracing::warn;

#[derive(Error, Debug)]
pub enum ManagerError {
    #[error(transparent)]
    Config(#[from] HarpoonError),

    #[error(transparent)]
    Container(#[from] ContainerError),

    #[error(transparent)]
    Build(#[from] BuildError),

    #[error("リクエストが不正です: {message}")]
    BadRequest { message: String },

    #[error("コンテナマネージャーはシャットダウン中です")]
    ShuttingDown,

    #[error("アドレス {address} で待ち受けできません\n理由: {message}")]
    Bind { address: String, message: String },
}

impl ManagerError {
    pub fn bad_request(message: impl Into<String>) -> Self {
        ManagerError::BadRequest {
            message: message.into(),
        }
    }
}

impl ErrorDetails for ManagerError {
    fn error_code(&self) -> &'static str {
        match self {
            ManagerError::Config(e) => e.error_code(),
            ManagerError::Container(e) => e.error_code(),
            ManagerError::Build(e) => e.error_code(),
            ManagerError::BadRequest { .. } => "BadRequest",
            ManagerError::ShuttingDown => "ShuttingDown",
            ManagerError::Bind { .. } => "BindFailed",
        }
    }

    fn details(&self) -> Map<String, Value> {
        let value = match self {
            ManagerError::Config(e) => return e.details(),
            ManagerError::Container(e) => return e.details(),
            ManagerError::Build(e) => return e.details(),
            ManagerError::BadRequest { message } => {
                json!({ "message": "Bad request", "reason": message })
            }
            ManagerError::ShuttingDown => json!({ "message": "Container manager is shutting down" }),
            ManagerError::Bind { address, message } => {
                json!({ "message": "Failed to bind", "address": address, "reason": message })
            }
        };
        match value {
            Value::Object(map) => map,
            _ => Map::new(),
        }
    }
}

/// 失敗したリクエストはすべて 500 と `{error, error_code}` で返す
impl IntoResponse for ManagerError {
    fn into_response(self) -> Response {
        warn!(error_code = self.error_code(), "Request failed: {}", self);
        let body = json!({
            "error": self.details(),
            "error_code": self.error_code(),
        });
        (StatusCode::INTERNAL_SERVER_ERROR, Json(body)).into_response()
    }
}

pub type Result<T> = std::result::Result<T, ManagerError>;
