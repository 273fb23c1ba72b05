//! イメージ定義

use super::{
    Command, ContextSpec, DependencyOptions, EnvSpec, Link, NetworkSpec, Persistence, PortSpec,
    ResourceLimits, VolumesSpec, WaitCondition,
};
use serde::Serialize;
use std::collections::BTreeMap;

/// 実行時のコマンド上書き
#[derive(Debug, Clone, PartialEq, Serialize)]
pub enum RunCommand {
    /// 空白区切り（クォート可）の文字列
    Shell(String),
    Exec(Vec<String>),
}

/// イメージ定義
///
/// 読み込み時に一度だけ作られ、その後は `container_id` / `container_name`
/// だけが更新される。
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Image {
    pub key: String,
    /// `[index/][prefix-]name`
    pub image_name: String,
    pub tag: Option<String>,
    pub image_index: Option<String>,
    pub commands: Vec<Command>,
    pub context: ContextSpec,
    pub volumes: VolumesSpec,
    pub links: Vec<Link>,
    pub env: Vec<EnvSpec>,
    pub ports: Vec<PortSpec>,
    pub network: NetworkSpec,
    pub resources: ResourceLimits,
    pub privileged: bool,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub dependency_options: BTreeMap<String, DependencyOptions>,
    pub wait_condition: Option<WaitCondition>,
    pub persistence: Option<Persistence>,
    pub command: Option<RunCommand>,
    pub bash: Option<String>,
    pub container_id: Option<String>,
    pub container_name: Option<String>,
}

impl Image {
    /// 最小構成のイメージ（主にテスト用）
    pub fn new(key: impl Into<String>, context: ContextSpec) -> Self {
        let key = key.into();
        Self {
            image_name: key.clone(),
            key,
            tag: None,
            image_index: None,
            commands: Vec::new(),
            context,
            volumes: VolumesSpec::default(),
            links: Vec::new(),
            env: Vec::new(),
            ports: Vec::new(),
            network: NetworkSpec::default(),
            resources: ResourceLimits::default(),
            privileged: false,
            user: None,
            working_dir: None,
            dependency_options: BTreeMap::new(),
            wait_condition: None,
            persistence: None,
            command: None,
            bash: None,
            container_id: None,
            container_name: None,
        }
    }

    /// `image_name[:tag]`
    pub fn image_tag(&self) -> String {
        match &self.tag {
            Some(tag) => format!("{}:{}", self.image_name, tag),
            None => self.image_name.clone(),
        }
    }

    /// レジストリを持つ（push 可能な）イメージか
    pub fn is_pushable(&self) -> bool {
        self.image_index.is_some()
    }

    /// 実行時に先に起動しておくイメージ（links と share_with）
    pub fn run_dependencies(&self) -> Vec<String> {
        let mut deps: Vec<String> = Vec::new();
        for key in self
            .links
            .iter()
            .map(|link| &link.image)
            .chain(self.volumes.share_with.iter())
        {
            if !deps.contains(key) {
                deps.push(key.clone());
            }
        }
        deps
    }

    pub fn dependency_options_for(&self, dep: &str) -> DependencyOptions {
        self.dependency_options.get(dep).cloned().unwrap_or_default()
    }

    /// 依存として起動する際の待機条件（親の上書きが優先）
    pub fn wait_condition_for<'a>(&'a self, dep: &'a Image) -> Option<&'a WaitCondition> {
        self.dependency_options
            .get(&dep.key)
            .and_then(|options| options.wait_condition.as_ref())
            .or(dep.wait_condition.as_ref())
    }

    /// コンテナ名（`/` → `--`, `:` → `---`）
    pub fn container_name_with(&self, suffix: &str) -> String {
        format!(
            "{}-{}",
            self.image_tag().replace('/', "--").replace(':', "---"),
            suffix
        )
    }

    /// 実行するコマンド
    ///
    /// `bash` は `/bin/bash -c` で包む。どちらもなければイメージの CMD を使う。
    pub fn formatted_command(&self) -> Option<Vec<String>> {
        if let Some(bash) = &self.bash {
            return Some(vec!["/bin/bash".into(), "-c".into(), bash.clone()]);
        }
        match &self.command {
            Some(RunCommand::Exec(args)) => Some(args.clone()),
            Some(RunCommand::Shell(line)) => Some(split_command(line)),
            None => None,
        }
    }

    /// 最後の CMD 命令（コミット時の復元用）
    pub fn last_cmd(&self) -> Option<String> {
        self.commands
            .iter()
            .rev()
            .find(|command| command.action == "CMD")
            .and_then(|command| match &command.body {
                super::CommandBody::Text(text) => Some(text.clone()),
                _ => None,
            })
    }
}

/// 空白で分割する（シングル/ダブルクォートとバックスラッシュに対応）
pub fn split_command(line: &str) -> Vec<String> {
    let mut args = Vec::new();
    let mut current = String::new();
    let mut in_word = false;
    let mut quote: Option<char> = None;
    let mut chars = line.chars();

    while let Some(c) = chars.next() {
        match (quote, c) {
            (Some(q), c) if c == q => quote = None,
            (Some('"'), '\\') | (None, '\\') => {
                if let Some(next) = chars.next() {
                    current.push(next);
                }
                in_word = true;
            }
            (Some(_), c) => current.push(c),
            (None, '\'') | (None, '"') => {
                quote = Some(c);
                in_word = true;
            }
            (None, c) if c.is_whitespace() => {
                if in_word {
                    args.push(std::mem::take(&mut current));
                    in_word = false;
                }
            }
            (None, c) => {
                current.push(c);
                in_word = true;
            }
        }
    }
    if in_word {
        args.push(current);
    }
    args
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_image_tag_and_container_name() {
        let mut image = Image::new("web", ContextSpec::new("/tmp"));
        image.image_name = "registry.example.com/team-web".into();
        image.tag = Some("1.0".into());

        assert_eq!(image.image_tag(), "registry.example.com/team-web:1.0");
        assert_eq!(
            image.container_name_with("abc"),
            "registry.example.com--team-web---1.0-abc"
        );
    }

    #[test]
    fn test_formatted_command() {
        let mut image = Image::new("web", ContextSpec::new("/tmp"));
        assert_eq!(image.formatted_command(), None);

        image.command = Some(RunCommand::Shell("echo 'hello world'".into()));
        assert_eq!(
            image.formatted_command().unwrap(),
            vec!["echo", "hello world"]
        );

        image.bash = Some("ls | wc -l".into());
        assert_eq!(
            image.formatted_command().unwrap(),
            vec!["/bin/bash", "-c", "ls | wc -l"]
        );
    }

    #[test]
    fn test_split_command() {
        assert_eq!(split_command("  a  b\\ c \"d e\" ''"), vec!["a", "b c", "d e", ""]);
    }

    #[test]
    fn test_run_dependencies_deduplicated() {
        let mut image = Image::new("web", ContextSpec::new("/tmp"));
        image.links = vec![
            Link {
                image: "db".into(),
                alias: "database".into(),
            },
            Link {
                image: "cache".into(),
                alias: "cache".into(),
            },
        ];
        image.volumes.share_with = vec!["db".into(), "data".into()];

        assert_eq!(image.run_dependencies(), vec!["db", "cache", "data"]);
    }
}
