//! ビルド命令の定義

use super::ContextSpec;
use serde::Serialize;

/// ビルド命令
///
/// `action` は大文字化済み（`FROM`, `ADD`, ...）。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Command {
    pub action: String,
    pub body: CommandBody,
}

/// 命令の中身
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum CommandBody {
    /// そのまま出力する文字列
    Text(String),

    /// 他のイメージへの参照（FROM / COPY --from=）
    ///
    /// ビルド時に `before + <参照先の image_tag> + after` へ展開される。
    ImageRef {
        key: String,
        before: String,
        after: String,
    },

    /// インラインの内容を ADD する
    InlineContent { content: String, dest: String },

    /// 他のイメージ（またはタグ）の中のパスを ADD する
    ImageContent {
        source: ImageSource,
        path: String,
        dest: String,
    },

    /// ディレクトリの tar を ADD する
    Context { context: Box<ContextSpec>, dest: String },
}

/// 命令が参照するイメージ
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub enum ImageSource {
    /// 設定内のイメージキー
    Key(String),
    /// 外部イメージのタグ
    External(String),
}

impl Command {
    pub fn text(action: impl Into<String>, body: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            body: CommandBody::Text(body.into()),
        }
    }

    pub fn is_from(&self) -> bool {
        self.action == "FROM"
    }
}
