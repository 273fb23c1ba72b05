//! コンテナエンジンの抽象
//!
//! ビルダー、ランナー、コンテナマネージャーはこのトレイト越しにだけ
//! エンジンを操作する。本番では [`crate::DockerEngine`]、テストでは
//! `FakeEngine`（`test-utils` フィーチャー）を使う。

use crate::error::EngineResult;
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use harpoon_core::Transport;
use serde::Serialize;
use std::collections::BTreeMap;

/// ビルドオプション（`rm=true`, `forcerm=false` は固定）
#[derive(Debug, Clone, PartialEq)]
pub struct BuildOptions {
    pub dockerfile: String,
    /// ベースイメージを常に pull する
    pub pull: bool,
    pub no_cache: bool,
}

impl Default for BuildOptions {
    fn default() -> Self {
        Self {
            dockerfile: "Dockerfile".to_string(),
            pull: false,
            no_cache: false,
        }
    }
}

/// ビルド出力の1メッセージ
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BuildMessage {
    pub stream: Option<String>,
    pub status: Option<String>,
    pub error: Option<String>,
}

impl BuildMessage {
    pub fn stream(line: impl Into<String>) -> Self {
        Self {
            stream: Some(line.into()),
            ..Default::default()
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        Self {
            error: Some(message.into()),
            ..Default::default()
        }
    }
}

/// pull / push の進捗
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ProgressMessage {
    pub id: Option<String>,
    pub status: Option<String>,
    pub progress: Option<String>,
    pub error: Option<String>,
}

/// レジストリの認証情報
#[derive(Debug, Clone, PartialEq)]
pub struct Credentials {
    pub username: String,
    pub password: String,
    pub server_address: String,
}

/// ポート公開
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PortPublish {
    pub host_ip: Option<String>,
    /// `None` ならエンジンに割り当てを任せる
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub transport: Transport,
}

impl PortPublish {
    /// `8080/tcp`
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.transport)
    }
}

/// 作成時に接続するネットワーク
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct NetworkAttachment {
    pub name: String,
    pub aliases: Vec<String>,
}

/// コンテナ作成の指定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerSpec {
    pub name: String,
    pub image: String,
    pub cmd: Option<Vec<String>>,
    /// `KEY=VALUE`
    pub env: Vec<String>,
    pub ports: Vec<PortPublish>,
    /// `host:container[:ro]`
    pub binds: Vec<String>,
    /// ボリュームを共有するコンテナ名
    pub volumes_from: Vec<String>,
    pub network: Option<NetworkAttachment>,
    pub network_mode: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub publish_all_ports: bool,
    pub network_disabled: bool,
    pub tty: bool,
    pub open_stdin: bool,
    pub user: Option<String>,
    pub working_dir: Option<String>,
    pub privileged: bool,
    pub cpu_shares: Option<i64>,
    pub cpuset_cpus: Option<String>,
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    /// (名前, soft, hard)
    pub ulimits: Vec<(String, i64, i64)>,
    pub labels: BTreeMap<String, String>,
}

/// コンテナの状態
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ContainerStatus {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub status: String,
    /// `8080/tcp` -> 割り当てられたホストポート
    pub host_ports: BTreeMap<String, u16>,
}

/// コンテナエンジン
///
/// ストリームを返すメソッドは呼び出し中の `&self` を借用する。
/// タスクをまたいで読む場合は `Arc<dyn Engine>` を clone して持ち込むこと。
#[async_trait]
pub trait Engine: Send + Sync {
    // --- イメージ ---

    /// gzip 済み tar のコンテキストからビルド
    fn build_image<'a>(
        &'a self,
        context: Vec<u8>,
        tag: &'a str,
        options: &'a BuildOptions,
    ) -> BoxStream<'a, EngineResult<BuildMessage>>;

    /// イメージ ID（存在しなければ `None`）
    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>>;

    /// イメージに付いているタグ（イメージが存在しなければ `None`）
    async fn image_tags(&self, reference: &str) -> EngineResult<Option<Vec<String>>>;

    async fn remove_image(&self, reference: &str, force: bool) -> EngineResult<()>;

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> EngineResult<()>;

    /// タグのないイメージの ID
    async fn dangling_images(&self) -> EngineResult<Vec<String>>;

    fn pull_image<'a>(
        &'a self,
        reference: &'a str,
        credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>>;

    fn push_image<'a>(
        &'a self,
        reference: &'a str,
        credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>>;

    // --- コンテナ ---

    /// コンテナを作成して ID を返す
    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String>;

    async fn start_container(&self, id: &str) -> EngineResult<()>;

    /// 端末にアタッチして起動し、終了コードを返す
    async fn start_attached(&self, id: &str, tty: bool) -> EngineResult<i64>;

    /// コンテナの状態（存在しなければ `None`）
    async fn inspect_container(&self, id: &str) -> EngineResult<Option<ContainerStatus>>;

    async fn stop_container(&self, id: &str, timeout_secs: i32) -> EngineResult<()>;

    async fn kill_container(&self, id: &str) -> EngineResult<()>;

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()>;

    /// 終了まで待って終了コードを返す
    async fn wait_container(&self, id: &str) -> EngineResult<i64>;

    /// コンテナ内でコマンドを実行して終了コードを返す
    async fn exec(&self, id: &str, cmd: Vec<String>) -> EngineResult<i64>;

    /// 末尾 `tail` 行のログ
    async fn logs(&self, id: &str, tail: usize) -> EngineResult<Vec<String>>;

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, EngineResult<String>>;

    /// コンテナをイメージとしてコミット
    async fn commit_container(
        &self,
        id: &str,
        reference: &str,
        cmd: Option<Vec<String>>,
    ) -> EngineResult<()>;

    /// コンテナ内のパスを tar で取り出す
    async fn download(&self, id: &str, path: &str) -> EngineResult<Vec<u8>>;

    // --- ネットワーク ---

    async fn create_network(&self, name: &str) -> EngineResult<()>;

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()>;

    async fn remove_network(&self, name: &str) -> EngineResult<()>;
}

/// 参照にタグがなければ `latest` を補う
pub fn normalize_reference(reference: &str) -> String {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains(':') || last.contains('@') {
        reference.to_string()
    } else {
        format!("{}:latest", reference)
    }
}

/// `repo:tag` を分割（タグがなければ `latest`）
///
/// `repo@sha256:...` はダイジェストをそのままタグ側に返す。
pub fn split_reference(reference: &str) -> (String, String) {
    let last = reference.rsplit('/').next().unwrap_or(reference);
    if last.contains('@')
        && let Some((repo, digest)) = reference.rsplit_once('@')
    {
        return (repo.to_string(), digest.to_string());
    }
    let normalized = normalize_reference(reference);
    match normalized.rsplit_once(':') {
        Some((repo, tag)) if !tag.contains('/') => (repo.to_string(), tag.to_string()),
        _ => (normalized, "latest".to_string()),
    }
}
