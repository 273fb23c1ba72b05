//! harpoon のビルド機能
//!
//! ビルドコンテキストの組み立て、イメージのビルド、レジストリとの同期を提供します。

pub mod auth;
pub mod builder;
pub mod context;
pub mod error;
pub mod mtime_cache;
pub mod persistence;
pub mod progress;
pub mod syncer;
pub mod vcs;

pub use auth::{Access, RegistryAuth, extract_registry};
pub use builder::{BuildMemo, BuildOutput, BuildSettings, ImageBuilder, extract_from_image};
pub use context::{ContextBuilder, ContextFile, ExtraBlob};
pub use error::{BuildError, BuildResult};
pub use persistence::derived_tag;
pub use progress::BuildProgress;
pub use syncer::{Syncer, validate_tag};
pub use vcs::Repository;
