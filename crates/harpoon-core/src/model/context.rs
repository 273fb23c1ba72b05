//! ビルドコンテキスト定義

use serde::Serialize;
use std::path::PathBuf;

/// ビルドコンテキストの設定
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ContextSpec {
    /// `false` の場合は Dockerfile と追加ファイルだけを送る
    pub enabled: bool,
    pub root_dir: PathBuf,
    pub include: Vec<String>,
    pub exclude: Vec<String>,
    /// git の管理対象ファイルだけを含める
    pub use_vcs: bool,
    /// git の ignore 設定に従って除外する
    pub use_vcs_ignore: bool,
    pub use_vcs_mtimes: MtimeMode,
}

/// mtime をコミット時刻から決めるかどうか
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub enum MtimeMode {
    #[default]
    Off,
    All,
    /// glob に一致するパスだけ
    Only(Vec<String>),
}

impl MtimeMode {
    pub fn is_enabled(&self) -> bool {
        !matches!(self, MtimeMode::Off)
    }
}

impl ContextSpec {
    /// 指定ディレクトリを丸ごと使うコンテキスト
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: true,
            root_dir: root_dir.into(),
            include: Vec::new(),
            exclude: Vec::new(),
            use_vcs: false,
            use_vcs_ignore: false,
            use_vcs_mtimes: MtimeMode::Off,
        }
    }

    pub fn disabled(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            enabled: false,
            ..Self::new(root_dir)
        }
    }

    /// git を参照する必要があるか
    pub fn needs_vcs(&self) -> bool {
        self.enabled && (self.use_vcs || self.use_vcs_ignore || self.use_vcs_mtimes.is_enabled())
    }
}
