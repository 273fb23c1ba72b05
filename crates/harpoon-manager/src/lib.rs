//! harpoon のコンテナマネージャー
//!
//! 外部からの JSON リクエストで設定済みイメージのコンテナを起動・停止する
//! HTTP サービスです。

pub mod error;
pub mod manager;
pub mod request;
pub mod server;

pub use error::{ManagerError, Result};
pub use manager::{ContainerManager, StartResponse};
pub use request::{StartRequest, StopRequest};
pub use server::{bind, router, serve, wait_for_server};
