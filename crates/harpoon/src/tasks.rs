//! タスクの登録と解決
//!
//! 組み込みタスクと、設定ファイルの `tasks` / `images.<key>.tasks` で
//! 定義されたタスクを名前で引く。

use harpoon_core::{HarpoonError, HarpoonOptions, ImageTask, TaskOverrides};
use std::collections::BTreeMap;

/// 組み込みタスク
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Builtin {
    Make,
    MakeAll,
    MakePushable,
    Push,
    PushAll,
    Pull,
    PullAll,
    PullAllExternal,
    Run,
    Show,
    ShowPushable,
    DeleteUntagged,
    PrintDockerfile,
    PrintAllDockerfiles,
    Tag,
    Untag,
    Retrieve,
    ContainerManager,
    ListTasks,
}

impl Builtin {
    pub const ALL: &'static [Builtin] = &[
        Builtin::Make,
        Builtin::MakeAll,
        Builtin::MakePushable,
        Builtin::Push,
        Builtin::PushAll,
        Builtin::Pull,
        Builtin::PullAll,
        Builtin::PullAllExternal,
        Builtin::Run,
        Builtin::Show,
        Builtin::ShowPushable,
        Builtin::DeleteUntagged,
        Builtin::PrintDockerfile,
        Builtin::PrintAllDockerfiles,
        Builtin::Tag,
        Builtin::Untag,
        Builtin::Retrieve,
        Builtin::ContainerManager,
        Builtin::ListTasks,
    ];

    pub fn name(self) -> &'static str {
        match self {
            Builtin::Make => "make",
            Builtin::MakeAll => "make-all",
            Builtin::MakePushable => "make-pushable",
            Builtin::Push => "push",
            Builtin::PushAll => "push-all",
            Builtin::Pull => "pull",
            Builtin::PullAll => "pull-all",
            Builtin::PullAllExternal => "pull-all-external",
            Builtin::Run => "run",
            Builtin::Show => "show",
            Builtin::ShowPushable => "show-pushable",
            Builtin::DeleteUntagged => "delete-untagged",
            Builtin::PrintDockerfile => "print-dockerfile",
            Builtin::PrintAllDockerfiles => "print-all-dockerfiles",
            Builtin::Tag => "tag",
            Builtin::Untag => "untag",
            Builtin::Retrieve => "retrieve",
            Builtin::ContainerManager => "container-manager",
            Builtin::ListTasks => "list-tasks",
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|b| b.name() == name)
    }

    /// イメージ引数が必須か
    pub fn needs_image(self) -> bool {
        matches!(
            self,
            Builtin::Make
                | Builtin::Push
                | Builtin::Pull
                | Builtin::Run
                | Builtin::PrintDockerfile
                | Builtin::Tag
                | Builtin::Untag
                | Builtin::Retrieve
        )
    }

    /// コンテナエンジンに接続する必要があるか
    pub fn needs_engine(self) -> bool {
        !matches!(
            self,
            Builtin::Show
                | Builtin::ShowPushable
                | Builtin::PrintDockerfile
                | Builtin::PrintAllDockerfiles
                | Builtin::ListTasks
        )
    }

    pub fn description(self) -> &'static str {
        match self {
            Builtin::Make => "イメージをビルド",
            Builtin::MakeAll => "すべてのイメージを依存順にビルド",
            Builtin::MakePushable => "push 可能なイメージとその依存をビルド",
            Builtin::Push => "イメージを push",
            Builtin::PushAll => "push 可能なイメージをすべて push",
            Builtin::Pull => "イメージを pull",
            Builtin::PullAll => "push 可能なイメージをすべて pull",
            Builtin::PullAllExternal => "外部イメージ（FROM / ADD の参照先）をすべて pull",
            Builtin::Run => "依存コンテナを起動してからイメージを実行",
            Builtin::Show => "イメージを層ごとに表示",
            Builtin::ShowPushable => "push 可能なイメージを表示",
            Builtin::DeleteUntagged => "タグのないイメージを削除",
            Builtin::PrintDockerfile => "生成される Dockerfile を表示",
            Builtin::PrintAllDockerfiles => "すべてのイメージの Dockerfile を表示",
            Builtin::Tag => "<image_name>:latest に --tag のタグを付ける",
            Builtin::Untag => "<image_name>:<--tag> を削除",
            Builtin::Retrieve => "イメージから --artifact のパスを取り出す",
            Builtin::ContainerManager => "コンテナマネージャーを起動 [address]",
            Builtin::ListTasks => "タスクの一覧を表示",
        }
    }
}

/// 実行するタスク
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
    /// 呼び出された名前
    pub name: String,
    pub builtin: Builtin,
    /// イメージキー（container-manager ではアドレス）
    pub image: Option<String>,
    pub overrides: TaskOverrides,
}

impl Invocation {
    /// タスクの上書きをオプションに反映する
    pub fn apply(&self, options: &mut HarpoonOptions) {
        if let Some(command) = &self.overrides.command {
            options.command = Some(command.clone());
            options.bash = None;
        }
        if let Some(bash) = &self.overrides.bash {
            options.bash = Some(bash.clone());
            options.command = None;
        }
        options.env.extend(self.overrides.env.iter().cloned());
    }

    /// イメージ引数を取り出す
    pub fn require_image(&self) -> Result<&str, HarpoonError> {
        self.image
            .as_deref()
            .ok_or_else(|| HarpoonError::MissingImage {
                task: self.name.clone(),
            })
    }
}

/// タスク名と引数から実行内容を決める
///
/// 組み込みタスクが優先され、次に設定ファイルのタスクを探す。
pub fn resolve(
    task: &str,
    image: Option<String>,
    configured: &BTreeMap<String, ImageTask>,
) -> Result<Invocation, HarpoonError> {
    let invocation = if let Some(builtin) = Builtin::from_name(task) {
        Invocation {
            name: task.to_string(),
            builtin,
            image,
            overrides: TaskOverrides::default(),
        }
    } else if let Some(defined) = configured.get(task) {
        let builtin = Builtin::from_name(&defined.action).ok_or_else(|| {
            HarpoonError::bad_config(format!(
                "タスク '{}' のアクション '{}' は組み込みタスクではありません",
                task, defined.action
            ))
        })?;
        Invocation {
            name: task.to_string(),
            builtin,
            image: defined.image.clone().or(image),
            overrides: defined.overrides.clone(),
        }
    } else {
        return Err(HarpoonError::NoSuchTask {
            task: task.to_string(),
            available: available(configured),
        });
    };

    if invocation.builtin.needs_image() {
        invocation.require_image()?;
    }
    Ok(invocation)
}

/// 実行できるタスク名
pub fn available(configured: &BTreeMap<String, ImageTask>) -> Vec<String> {
    Builtin::ALL
        .iter()
        .map(|b| b.name().to_string())
        .chain(configured.keys().cloned())
        .collect()
}
