//! グローバルオプション（設定ファイルの `harpoon` セクション + CLI フラグ）

use super::EnvSpec;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct HarpoonOptions {
    /// 端末がない場合は false
    pub interactive: bool,
    pub no_intervention: bool,
    /// ビルド出力を表示しない
    pub silent_build: bool,
    /// 置き換えられた古いイメージを削除しない
    pub keep_replaced: bool,
    /// `--tag` による上書き
    pub tag: Option<String>,
    pub image_name_prefix: Option<String>,
    /// `--` 以降の引数
    pub extra: String,
    /// pull 失敗を警告に留める
    pub ignore_missing: bool,
    /// make-all の後に push する
    pub do_push: bool,
    /// 依存を辿らない
    pub flat: bool,
    pub artifact: Option<String>,
    pub command: Option<String>,
    pub bash: Option<String>,
    /// `--env` で追加された環境変数
    pub env: Vec<EnvSpec>,
    /// 終了したコンテナを削除しない
    pub no_cleanup: bool,
}

impl Default for HarpoonOptions {
    fn default() -> Self {
        Self {
            interactive: true,
            no_intervention: false,
            silent_build: false,
            keep_replaced: false,
            tag: None,
            image_name_prefix: None,
            extra: String::new(),
            ignore_missing: false,
            do_push: false,
            flat: false,
            artifact: None,
            command: None,
            bash: None,
            env: Vec::new(),
            no_cleanup: false,
        }
    }
}

impl HarpoonOptions {
    /// 介入シェルを起動してよいか
    pub fn intervention_enabled(&self) -> bool {
        self.interactive && !self.no_intervention
    }
}
