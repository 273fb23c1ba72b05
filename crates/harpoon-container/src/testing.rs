//! テスト用のインメモリエンジン
//!
//! Docker なしでビルダー、ランナー、コンテナマネージャーを検証するために、
//! イメージ、コンテナ、ネットワークの状態をメモリ上で管理し、呼び出しを記録する。

use crate::engine::{
    BuildMessage, BuildOptions, ContainerSpec, ContainerStatus, Credentials, Engine,
    ProgressMessage, normalize_reference,
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use futures_util::stream::{self, BoxStream, StreamExt};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Mutex, MutexGuard};
use std::time::Duration;

/// 記録された呼び出し
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EngineCall {
    Build { tag: String },
    Pull { reference: String },
    Push { reference: String },
    RemoveImage { reference: String },
    Tag { source: String, target: String },
    Create { name: String, image: String },
    Start { id: String },
    StartAttached { id: String },
    Stop { id: String },
    Kill { id: String },
    Remove { id: String },
    Exec { id: String, cmd: Vec<String> },
    Commit { id: String, reference: String },
    CreateNetwork { name: String },
    ConnectNetwork { network: String, container: String, aliases: Vec<String> },
    RemoveNetwork { name: String },
}

/// メモリ上のコンテナ
#[derive(Debug, Clone, PartialEq)]
pub struct FakeContainer {
    pub id: String,
    pub spec: ContainerSpec,
    pub running: bool,
    pub exit_code: Option<i64>,
    pub host_ports: BTreeMap<String, u16>,
    pub networks: BTreeSet<String>,
}

#[derive(Debug, Default)]
struct FakeState {
    calls: Vec<EngineCall>,
    /// 正規化した参照 -> イメージ ID
    tags: BTreeMap<String, String>,
    image_ids: BTreeSet<String>,
    containers: BTreeMap<String, FakeContainer>,
    networks: BTreeMap<String, BTreeSet<String>>,
    contexts: Vec<(String, Vec<u8>)>,
    scripted_builds: BTreeMap<String, Vec<BuildMessage>>,
    cached_builds: BTreeSet<String>,
    exec_codes: Vec<(String, i64)>,
    exit_immediately: BTreeMap<String, i64>,
    attached_exit_codes: BTreeMap<String, i64>,
    pull_errors: BTreeMap<String, String>,
    push_errors: BTreeMap<String, String>,
    downloads: BTreeMap<String, Vec<u8>>,
    hanging_execs: Vec<String>,
    inspect_error: Option<EngineError>,
    inspections: usize,
    create_delay: Option<Duration>,
    next_id: u64,
    next_port: u16,
}

impl FakeState {
    fn new_id(&mut self, prefix: &str) -> String {
        self.next_id += 1;
        format!("{}{:012x}", prefix, self.next_id)
    }

    fn resolve_container(&self, id_or_name: &str) -> Option<String> {
        if self.containers.contains_key(id_or_name) {
            return Some(id_or_name.to_string());
        }
        self.containers
            .values()
            .find(|c| c.spec.name == id_or_name)
            .map(|c| c.id.clone())
    }

    fn image_for(&self, reference: &str) -> Option<String> {
        if self.image_ids.contains(reference) {
            return Some(reference.to_string());
        }
        self.tags.get(&normalize_reference(reference)).cloned()
    }
}

/// インメモリのエンジン
#[derive(Debug)]
pub struct FakeEngine {
    state: Mutex<FakeState>,
}

impl Default for FakeEngine {
    fn default() -> Self {
        Self::new()
    }
}

impl FakeEngine {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FakeState {
                next_port: 32768,
                ..Default::default()
            }),
        }
    }

    fn state(&self) -> MutexGuard<'_, FakeState> {
        // テスト中のパニックで汚染されても状態は読める
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    // --- 振る舞いの設定 ---

    /// イメージを用意する
    pub fn add_image(&self, reference: &str) -> String {
        let mut state = self.state();
        let id = state.new_id("sha256:");
        state.image_ids.insert(id.clone());
        state.tags.insert(normalize_reference(reference), id.clone());
        id
    }

    /// ビルド出力を差し替える
    pub fn script_build(&self, tag: &str, messages: Vec<BuildMessage>) {
        self.state().scripted_builds.insert(tag.to_string(), messages);
    }

    /// キャッシュヒットとして扱うビルド
    pub fn cache_build(&self, tag: &str) {
        self.state().cached_builds.insert(tag.to_string());
    }

    /// コマンドにこの文字列を含む exec の終了コード
    pub fn set_exec_exit_code(&self, needle: &str, code: i64) {
        self.state().exec_codes.push((needle.to_string(), code));
    }

    /// このイメージのコンテナは起動直後に終了する
    pub fn exit_immediately(&self, image: &str, code: i64) {
        self.state().exit_immediately.insert(image.to_string(), code);
    }

    /// アタッチ実行したときの終了コード
    pub fn set_attached_exit_code(&self, image: &str, code: i64) {
        self.state().attached_exit_codes.insert(image.to_string(), code);
    }

    pub fn fail_pull(&self, reference: &str, message: &str) {
        self.state()
            .pull_errors
            .insert(normalize_reference(reference), message.to_string());
    }

    pub fn fail_push(&self, reference: &str, message: &str) {
        self.state()
            .push_errors
            .insert(normalize_reference(reference), message.to_string());
    }

    /// `download` が返すデータ（パスごと）
    pub fn set_download(&self, path: &str, data: Vec<u8>) {
        self.state().downloads.insert(path.to_string(), data);
    }

    /// コマンドにこの文字列を含む exec は終了しない
    pub fn hang_exec(&self, needle: &str) {
        self.state().hanging_execs.push(needle.to_string());
    }

    /// `inspect_container` が常にこのエラーを返す
    pub fn fail_inspect(&self, error: EngineError) {
        self.state().inspect_error = Some(error);
    }

    /// コンテナを作成してから応答を返すまでの遅延
    pub fn delay_create(&self, delay: Duration) {
        self.state().create_delay = Some(delay);
    }

    // --- 状態の参照 ---

    pub fn inspect_count(&self) -> usize {
        self.state().inspections
    }

    pub fn calls(&self) -> Vec<EngineCall> {
        self.state().calls.clone()
    }

    /// ビルドしたタグと送られたコンテキスト
    pub fn build_contexts(&self) -> Vec<(String, Vec<u8>)> {
        self.state().contexts.clone()
    }

    pub fn container(&self, id_or_name: &str) -> Option<FakeContainer> {
        let state = self.state();
        let id = state.resolve_container(id_or_name)?;
        state.containers.get(&id).cloned()
    }

    pub fn containers(&self) -> Vec<FakeContainer> {
        self.state().containers.values().cloned().collect()
    }

    pub fn networks(&self) -> Vec<String> {
        self.state().networks.keys().cloned().collect()
    }

    pub fn has_image(&self, reference: &str) -> bool {
        self.state().image_for(reference).is_some()
    }

    pub fn exec_count(&self, id: &str) -> usize {
        self.state()
            .calls
            .iter()
            .filter(|call| matches!(call, EngineCall::Exec { id: exec_id, .. } if exec_id == id))
            .count()
    }

    fn record(&self, call: EngineCall) {
        self.state().calls.push(call);
    }

    fn require_container(state: &FakeState, id: &str) -> EngineResult<String> {
        state
            .resolve_container(id)
            .ok_or_else(|| EngineError::NotFound(format!("No such container: {}", id)))
    }
}

#[async_trait]
impl Engine for FakeEngine {
    fn build_image<'a>(
        &'a self,
        context: Vec<u8>,
        tag: &'a str,
        _options: &'a BuildOptions,
    ) -> BoxStream<'a, EngineResult<BuildMessage>> {
        let mut state = self.state();
        state.calls.push(EngineCall::Build {
            tag: tag.to_string(),
        });
        state.contexts.push((tag.to_string(), context));

        let messages = match state.scripted_builds.get(tag).cloned() {
            Some(messages) => messages,
            None if state.cached_builds.contains(tag) => vec![
                BuildMessage::stream("Step 1/2 : FROM scratch\n"),
                BuildMessage::stream(" ---> Using cache\n"),
            ],
            None => {
                let container = state.new_id("");
                vec![
                    BuildMessage::stream("Step 1/2 : FROM scratch\n"),
                    BuildMessage::stream(format!(" ---> Running in {}\n", container)),
                ]
            }
        };

        let failed = messages.iter().any(|m| m.error.is_some());
        if !failed {
            let key = normalize_reference(tag);
            let keep = state.cached_builds.contains(tag) && state.tags.contains_key(&key);
            if !keep {
                let id = state.new_id("sha256:");
                state.image_ids.insert(id.clone());
                state.tags.insert(key, id);
            }
        }

        stream::iter(messages.into_iter().map(Ok)).boxed()
    }

    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>> {
        Ok(self.state().image_for(reference))
    }

    async fn image_tags(&self, reference: &str) -> EngineResult<Option<Vec<String>>> {
        let state = self.state();
        let Some(id) = state.image_for(reference) else {
            return Ok(None);
        };
        Ok(Some(
            state
                .tags
                .iter()
                .filter(|(_, image_id)| **image_id == id)
                .map(|(tag, _)| tag.clone())
                .collect(),
        ))
    }

    async fn remove_image(&self, reference: &str, _force: bool) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::RemoveImage {
            reference: reference.to_string(),
        });
        if state.image_ids.remove(reference) {
            state.tags.retain(|_, id| id != reference);
            return Ok(());
        }
        match state.tags.remove(&normalize_reference(reference)) {
            Some(id) => {
                if !state.tags.values().any(|other| *other == id) {
                    state.image_ids.remove(&id);
                }
                Ok(())
            }
            None => Err(EngineError::NotFound(format!("No such image: {}", reference))),
        }
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> EngineResult<()> {
        let mut state = self.state();
        let target = format!("{}:{}", repo, tag);
        state.calls.push(EngineCall::Tag {
            source: source.to_string(),
            target: target.clone(),
        });
        let id = state
            .image_for(source)
            .ok_or_else(|| EngineError::NotFound(format!("No such image: {}", source)))?;
        state.tags.insert(target, id);
        Ok(())
    }

    async fn dangling_images(&self) -> EngineResult<Vec<String>> {
        let state = self.state();
        Ok(state
            .image_ids
            .iter()
            .filter(|id| !state.tags.values().any(|tagged| tagged == *id))
            .cloned()
            .collect())
    }

    fn pull_image<'a>(
        &'a self,
        reference: &'a str,
        _credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>> {
        let mut state = self.state();
        state.calls.push(EngineCall::Pull {
            reference: reference.to_string(),
        });
        let key = normalize_reference(reference);
        if let Some(error) = state.pull_errors.get(&key).cloned() {
            return stream::iter(vec![Ok(ProgressMessage {
                error: Some(error),
                ..Default::default()
            })])
            .boxed();
        }
        if !state.tags.contains_key(&key) {
            let id = state.new_id("sha256:");
            state.image_ids.insert(id.clone());
            state.tags.insert(key, id);
        }
        stream::iter(vec![Ok(ProgressMessage {
            status: Some(format!("Status: Downloaded newer image for {}", reference)),
            ..Default::default()
        })])
        .boxed()
    }

    fn push_image<'a>(
        &'a self,
        reference: &'a str,
        _credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>> {
        let mut state = self.state();
        state.calls.push(EngineCall::Push {
            reference: reference.to_string(),
        });
        let key = normalize_reference(reference);
        let message = match state.push_errors.get(&key) {
            Some(error) => ProgressMessage {
                error: Some(error.clone()),
                ..Default::default()
            },
            None if !state.tags.contains_key(&key) => ProgressMessage {
                error: Some(format!("An image does not exist locally with the tag: {}", reference)),
                ..Default::default()
            },
            None => ProgressMessage {
                status: Some("Pushed".to_string()),
                ..Default::default()
            },
        };
        stream::iter(vec![Ok(message)]).boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let (id, delay) = {
            let mut state = self.state();
            state.calls.push(EngineCall::Create {
                name: spec.name.clone(),
                image: spec.image.clone(),
            });
            if state.resolve_container(&spec.name).is_some() {
                return Err(EngineError::Conflict(format!(
                    "The container name \"/{}\" is already in use",
                    spec.name
                )));
            }

            let mut host_ports = BTreeMap::new();
            for port in &spec.ports {
                let host_port = match port.host_port {
                    Some(port) => port,
                    None => {
                        state.next_port += 1;
                        state.next_port
                    }
                };
                host_ports.insert(port.container_key(), host_port);
            }

            let mut networks = BTreeSet::new();
            if let Some(network) = &spec.network {
                if !state.networks.contains_key(&network.name) {
                    return Err(EngineError::NotFound(format!(
                        "network {} not found",
                        network.name
                    )));
                }
                networks.insert(network.name.clone());
            }

            let id = state.new_id("c");
            if let Some(network) = &spec.network
                && let Some(members) = state.networks.get_mut(&network.name)
            {
                members.insert(id.clone());
            }
            state.containers.insert(
                id.clone(),
                FakeContainer {
                    id: id.clone(),
                    spec: spec.clone(),
                    running: false,
                    exit_code: None,
                    host_ports,
                    networks,
                },
            );
            (id, state.create_delay)
        };
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        Ok(id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::Start { id: id.to_string() });
        let id = Self::require_container(&state, id)?;
        let exit_immediately = state.exit_immediately.clone();
        if let Some(container) = state.containers.get_mut(&id) {
            match exit_immediately.get(&container.spec.image) {
                Some(code) => {
                    container.running = false;
                    container.exit_code = Some(*code);
                }
                None => {
                    container.running = true;
                    container.exit_code = None;
                }
            }
        }
        Ok(())
    }

    async fn start_attached(&self, id: &str, _tty: bool) -> EngineResult<i64> {
        let mut state = self.state();
        state.calls.push(EngineCall::StartAttached { id: id.to_string() });
        let id = Self::require_container(&state, id)?;
        let codes = state.attached_exit_codes.clone();
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        let code = codes.get(&container.spec.image).copied().unwrap_or(0);
        container.running = false;
        container.exit_code = Some(code);
        Ok(code)
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Option<ContainerStatus>> {
        let mut state = self.state();
        state.inspections += 1;
        if let Some(error) = &state.inspect_error {
            return Err(error.clone());
        }
        let Some(id) = state.resolve_container(id) else {
            return Ok(None);
        };
        Ok(state.containers.get(&id).map(|c| ContainerStatus {
            id: c.id.clone(),
            name: c.spec.name.clone(),
            running: c.running,
            exit_code: c.exit_code,
            status: if c.running { "running" } else { "exited" }.to_string(),
            host_ports: c.host_ports.clone(),
        }))
    }

    async fn stop_container(&self, id: &str, _timeout_secs: i32) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::Stop { id: id.to_string() });
        let id = Self::require_container(&state, id)?;
        if let Some(container) = state.containers.get_mut(&id)
            && container.running
        {
            container.running = false;
            container.exit_code = Some(0);
        }
        Ok(())
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::Kill { id: id.to_string() });
        let id = Self::require_container(&state, id)?;
        if let Some(container) = state.containers.get_mut(&id)
            && container.running
        {
            container.running = false;
            container.exit_code = Some(137);
        }
        Ok(())
    }

    async fn remove_container(&self, id: &str, _remove_volumes: bool) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::Remove { id: id.to_string() });
        let id = Self::require_container(&state, id)?;
        state.containers.remove(&id);
        for members in state.networks.values_mut() {
            members.remove(&id);
        }
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let mut state = self.state();
        let id = Self::require_container(&state, id)?;
        let container = state
            .containers
            .get_mut(&id)
            .ok_or_else(|| EngineError::NotFound(id.clone()))?;
        container.running = false;
        Ok(*container.exit_code.get_or_insert(0))
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> EngineResult<i64> {
        let code = {
            let mut state = self.state();
            state.calls.push(EngineCall::Exec {
                id: id.to_string(),
                cmd: cmd.clone(),
            });
            let resolved = Self::require_container(&state, id)?;
            if !state.containers.get(&resolved).is_some_and(|c| c.running) {
                return Err(EngineError::Conflict(format!("Container {} is not running", id)));
            }
            let line = cmd.join(" ");
            if state.hanging_execs.iter().any(|needle| line.contains(needle.as_str())) {
                None
            } else {
                Some(
                    state
                        .exec_codes
                        .iter()
                        .find(|(needle, _)| line.contains(needle.as_str()))
                        .map(|(_, code)| *code)
                        .unwrap_or(0),
                )
            }
        };
        match code {
            Some(code) => Ok(code),
            None => std::future::pending().await,
        }
    }

    async fn logs(&self, id: &str, _tail: usize) -> EngineResult<Vec<String>> {
        let state = self.state();
        let id = Self::require_container(&state, id)?;
        Ok(vec![format!("logs of {}", id)])
    }

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, EngineResult<String>> {
        stream::iter(vec![Ok(format!("logs of {}\n", id))]).boxed()
    }

    async fn commit_container(
        &self,
        id: &str,
        reference: &str,
        _cmd: Option<Vec<String>>,
    ) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::Commit {
            id: id.to_string(),
            reference: reference.to_string(),
        });
        Self::require_container(&state, id)?;
        let image_id = state.new_id("sha256:");
        state.image_ids.insert(image_id.clone());
        state.tags.insert(normalize_reference(reference), image_id);
        Ok(())
    }

    async fn download(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let state = self.state();
        Self::require_container(&state, id)?;
        state
            .downloads
            .get(path)
            .cloned()
            .ok_or_else(|| EngineError::NotFound(format!("Could not find the file {}", path)))
    }

    async fn create_network(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::CreateNetwork {
            name: name.to_string(),
        });
        if state.networks.contains_key(name) {
            return Err(EngineError::Conflict(format!("network with name {} already exists", name)));
        }
        state.networks.insert(name.to_string(), BTreeSet::new());
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::ConnectNetwork {
            network: network.to_string(),
            container: container.to_string(),
            aliases: aliases.to_vec(),
        });
        let id = Self::require_container(&state, container)?;
        let members = state
            .networks
            .get_mut(network)
            .ok_or_else(|| EngineError::NotFound(format!("network {} not found", network)))?;
        members.insert(id.clone());
        if let Some(container) = state.containers.get_mut(&id) {
            container.networks.insert(network.to_string());
        }
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        let mut state = self.state();
        state.calls.push(EngineCall::RemoveNetwork {
            name: name.to_string(),
        });
        match state.networks.remove(name) {
            Some(_) => Ok(()),
            None => Err(EngineError::NotFound(format!("network {} not found", name))),
        }
    }
}
