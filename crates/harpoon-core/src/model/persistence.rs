//! 永続化ビルド設定

use serde::Serialize;

/// プロバイダーボリュームのマウント先
pub const PERSIST_VOLUME: &str = "/harpoon/persist";

/// デフォルトのシェル
pub const DEFAULT_PERSIST_SHELL: &str = "/bin/bash";

/// 永続化ビルド設定
///
/// `action` を実行した結果のフォルダを provider イメージのボリュームに保存し、
/// 次回のビルドで復元する。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Persistence {
    pub action: String,
    pub folders: Vec<String>,
    pub shell: String,
    /// 最終 provider を作らない
    pub no_provider: bool,
}

impl Persistence {
    /// 保存されたフォルダを元の場所へ戻すシェル
    pub fn restore_script(&self) -> String {
        self.folders
            .iter()
            .map(|folder| {
                let stored = stored_path(folder);
                format!(
                    "if [ -d {stored} ]; then mkdir -p {folder} && cp -a {stored}/. {folder}/; fi",
                    stored = stored,
                    folder = folder
                )
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// フォルダを provider ボリュームへ保存するシェル
    pub fn save_script(&self) -> String {
        self.folders
            .iter()
            .map(|folder| {
                let stored = stored_path(folder);
                format!(
                    "mkdir -p {stored} && cp -a {folder}/. {stored}/",
                    stored = stored,
                    folder = folder
                )
            })
            .collect::<Vec<_>>()
            .join(" && ")
    }

    /// restore してから action を実行するコマンド
    pub fn builder_command(&self) -> Vec<String> {
        let restore = self.restore_script();
        let script = if restore.is_empty() {
            self.action.clone()
        } else {
            format!("{} && {}", restore, self.action)
        };
        vec![self.shell.clone(), "-c".to_string(), script]
    }

    /// restore だけを行うコマンド
    pub fn restore_command(&self) -> Vec<String> {
        let restore = self.restore_script();
        let script = if restore.is_empty() {
            "true".to_string()
        } else {
            restore
        };
        vec![self.shell.clone(), "-c".to_string(), script]
    }
}

/// ボリューム内での保存先
pub fn stored_path(folder: &str) -> String {
    format!(
        "{}/{}",
        PERSIST_VOLUME,
        folder.trim_matches('/').replace('/', "__")
    )
}
