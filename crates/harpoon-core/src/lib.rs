//! harpoon のコア
//!
//! イメージモデル、設定の読み込み、ビルド命令の解析、依存レイヤーの解決を提供します。

pub mod error;
pub mod instruction;
pub mod loader;
pub mod model;
pub mod parser;
pub mod resolver;
pub mod template;

pub use error::{ErrorDetails, HarpoonError, Result};
pub use instruction::{
    ExtraContext, ExtraSource, RenderedInstructions, dependency_keys, dependent_images,
    external_dependencies, render,
};
pub use loader::{CONFIG_ENV, LoadOptions, find_config_file, load_config, load_config_str};
pub use model::*;
pub use resolver::{Layer, layered, ordered_keys, run_order};
