//! モデル定義
//!
//! harpoon で使用されるデータモデルを定義します。
//! 設定ファイルは読み込み時に正規化され、ここで定義する型付きレコードになります。

mod command;
mod config;
mod context;
mod image;
mod options;
mod persistence;
mod runtime;
mod task;
mod wait;

// Re-exports
pub use command::*;
pub use config::*;
pub use context::*;
pub use image::*;
pub use options::*;
pub use persistence::*;
pub use runtime::*;
pub use task::*;
pub use wait::*;
