//! 依存関係を考慮したコンテナの実行
//!
//! 以下の順序で処理する:
//! 1. 依存グラフの展開とホストポートの事前確認
//! 2. 依存コンテナの起動と準備完了待機（深さ優先、依存が先）
//! 3. 対象コンテナの作成と起動（アタッチまたはデタッチ）
//! 4. 起動と逆順での停止、削除、ネットワークの片付け

use crate::converter::{SpecRequest, container_spec, ensure_bind_dirs};
use crate::engine::{Engine, NetworkAttachment};
use crate::error::{ContainerError, EngineResult, Result};
use crate::intervention::Intervener;
use crate::network::NetworkManager;
use crate::port::check_ports_available;
use crate::waiter::wait_for_ready;
use colored::Colorize;
use futures_util::StreamExt;
use harpoon_core::{EnvSpec, HarpoonError, Image, ImageSet, PortSpec};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio::time::{Instant, sleep};
use tracing::{debug, info, instrument, warn};

/// 停止を待つ上限
const STOP_GRACE: Duration = Duration::from_secs(10);

/// 停止確認の間隔
const STOP_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// 一時的なエラーのリトライ回数
pub(crate) const TRANSIENT_RETRIES: u32 = 3;

/// 実行時の上書き
#[derive(Debug, Clone, Default)]
pub struct RunOptions {
    /// 対象をデタッチで起動する
    pub detach: bool,
    /// 端末を割り当てる
    pub tty: bool,
    /// 失敗時に介入する
    pub intervene: bool,
    /// 依存コンテナを起動しない
    pub flat: bool,
    pub env: Vec<EnvSpec>,
    /// 対象のポートを置き換える
    pub ports: Option<Vec<PortSpec>>,
    pub command: Option<Vec<String>>,
    /// 片付け時に匿名ボリュームも削除する
    pub remove_volumes: bool,
}

/// 起動したコンテナ
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RunningContainer {
    pub image: String,
    pub id: String,
    pub name: String,
    /// `8080/tcp` -> ホストポート
    pub host_ports: BTreeMap<String, u16>,
}

/// 1回の実行で起動したもの
///
/// `containers` は起動順。最後が対象コンテナ。
#[derive(Debug, Default)]
pub struct RunSession {
    pub containers: Vec<RunningContainer>,
    networks: NetworkManager,
    log_tasks: Vec<JoinHandle<()>>,
}

impl RunSession {
    pub fn target(&self) -> Option<&RunningContainer> {
        self.containers.last()
    }

    pub fn networks(&self) -> Vec<String> {
        self.networks.networks()
    }
}

type SharedSession = Mutex<RunSession>;

fn lock(session: &SharedSession) -> MutexGuard<'_, RunSession> {
    session.lock().unwrap_or_else(|e| e.into_inner())
}

/// 起動する依存（起動順）と、それを参照した親
fn plan(target: &Image, images: &ImageSet) -> Result<Vec<(String, String)>> {
    fn visit(
        image: &Image,
        images: &ImageSet,
        stack: &mut Vec<String>,
        seen: &mut BTreeSet<String>,
        order: &mut Vec<(String, String)>,
    ) -> Result<()> {
        stack.push(image.key.clone());
        for dep in image.run_dependencies() {
            if let Some(position) = stack.iter().position(|k| *k == dep) {
                let mut chain = stack[position..].to_vec();
                chain.push(dep);
                return Err(HarpoonError::DependencyCycle { chain }.into());
            }
            if seen.contains(&dep) {
                continue;
            }
            let dep_image = images.require(&dep)?;
            visit(dep_image, images, stack, seen, order)?;
            seen.insert(dep.clone());
            order.push((dep, image.key.clone()));
        }
        stack.pop();
        Ok(())
    }

    let mut order = Vec::new();
    visit(
        target,
        images,
        &mut Vec::new(),
        &mut BTreeSet::new(),
        &mut order,
    )?;
    Ok(order)
}

/// 作成時の上書き
struct CreateRequest<'a> {
    env: &'a [EnvSpec],
    ports: Option<&'a [PortSpec]>,
    command: Option<Vec<String>>,
    tty: bool,
    link: bool,
}

/// コンテナランナー
#[derive(Clone)]
pub struct Runner {
    engine: Arc<dyn Engine>,
    intervener: Arc<dyn Intervener>,
}

impl Runner {
    pub fn new(engine: Arc<dyn Engine>, intervener: Arc<dyn Intervener>) -> Self {
        Self { engine, intervener }
    }

    pub fn engine(&self) -> &Arc<dyn Engine> {
        &self.engine
    }

    /// 依存を起動してから対象を実行し、終了後にすべて片付ける
    ///
    /// Ctrl-C で中断した場合も片付けてから `UserQuit` を返す。
    pub async fn run(&self, key: &str, images: &ImageSet, options: &RunOptions) -> Result<i64> {
        let interrupted = async {
            if tokio::signal::ctrl_c().await.is_err() {
                // シグナルを受け取れない環境では中断しない
                std::future::pending::<()>().await;
            }
        };
        self.run_until(key, images, options, interrupted).await
    }

    /// `cancel` が完了したら中断する `run`
    #[instrument(skip(self, images, options, cancel))]
    pub async fn run_until(
        &self,
        key: &str,
        images: &ImageSet,
        options: &RunOptions,
        cancel: impl Future<Output = ()>,
    ) -> Result<i64> {
        let session = Mutex::new(RunSession::default());

        let result = tokio::select! {
            result = self.start_tree(key, images, options, &session) => result,
            _ = cancel => {
                println!();
                println!("{}", "⚠ 中断しました。コンテナを片付けています...".yellow());
                Err(ContainerError::UserQuit)
            }
        };

        let session = std::mem::take(&mut *lock(&session));
        self.teardown(session, options.remove_volumes).await;
        result
    }

    /// 対象をデタッチで起動し、片付けずにセッションを返す
    ///
    /// 失敗した場合は起動途中のものを片付けてからエラーを返す。
    pub async fn run_and_keep_detached(
        &self,
        key: &str,
        images: &ImageSet,
        options: &RunOptions,
    ) -> Result<RunSession> {
        let options = RunOptions {
            detach: true,
            tty: false,
            intervene: false,
            ..options.clone()
        };
        let session = Mutex::new(RunSession::default());
        let result = self.start_tree(key, images, &options, &session).await;
        let session = std::mem::take(&mut *lock(&session));
        match result {
            Ok(_) => Ok(session),
            Err(e) => {
                self.teardown(session, options.remove_volumes).await;
                Err(e)
            }
        }
    }

    async fn start_tree(
        &self,
        key: &str,
        images: &ImageSet,
        options: &RunOptions,
        session: &SharedSession,
    ) -> Result<i64> {
        let target = images.require(key)?;

        // 1. 依存グラフとポートの事前確認
        debug!("Step 1: Planning dependencies");
        let deps = if options.flat {
            Vec::new()
        } else {
            plan(target, images)?
        };
        let mut ports: Vec<&PortSpec> = Vec::new();
        for (dep, _) in &deps {
            ports.extend(images.require(dep)?.ports.iter());
        }
        ports.extend(options.ports.as_deref().unwrap_or(&target.ports).iter());
        check_ports_available(ports)?;

        // 2. 依存の起動
        debug!("Step 2: Starting {} dependencies", deps.len());
        let mut started: BTreeMap<String, RunningContainer> = BTreeMap::new();
        for (dep, parent) in &deps {
            let dep_image = images.require(dep)?;
            let parent_image = images.require(parent)?;
            let running = self
                .start_dependency(dep_image, parent_image, &started, session)
                .await?;
            started.insert(dep.clone(), running);
        }

        // 3. 対象の起動
        debug!("Step 3: Starting {}", key);
        let request = CreateRequest {
            env: &options.env,
            ports: options.ports.as_deref(),
            command: options.command.clone(),
            tty: options.tty && !options.detach,
            link: !options.flat,
        };
        let running = self.create(target, request, &started, session).await?;

        if options.detach {
            self.engine.start_container(&running.id).await?;
            self.refresh_ports(&running.id, session).await;
            println!("  ✓ コンテナ起動: {} ({})", running.name.cyan(), key);
            return Ok(0);
        }

        let exit_code = self.engine.start_attached(&running.id, options.tty).await?;
        info!(image = key, exit_code, "Container exited");
        if exit_code != 0 {
            println!(
                "{}",
                format!("✗ {} が終了コード {} で終了しました", key, exit_code).red()
            );
            if options.intervene {
                self.intervener
                    .intervene(self.engine.as_ref(), &running.id, key)
                    .await?;
            }
        }
        Ok(exit_code)
    }

    async fn start_dependency(
        &self,
        image: &Image,
        parent: &Image,
        started: &BTreeMap<String, RunningContainer>,
        session: &SharedSession,
    ) -> Result<RunningContainer> {
        let request = CreateRequest {
            env: &[],
            ports: None,
            command: None,
            tty: false,
            link: true,
        };
        let running = self.create(image, request, started, session).await?;
        self.engine.start_container(&running.id).await?;
        println!("  ✓ 依存コンテナ起動: {} ({})", running.name.cyan(), image.key);

        if parent.dependency_options_for(&image.key).attached {
            self.attach_logs(&image.key, &running.id, session);
        }

        wait_for_ready(
            self.engine.as_ref(),
            &image.key,
            &running.id,
            parent.wait_condition_for(image),
        )
        .await?;

        Ok(self.refresh_ports(&running.id, session).await.unwrap_or(running))
    }

    /// コンテナを作成してセッションに記録する
    async fn create(
        &self,
        image: &Image,
        request: CreateRequest<'_>,
        started: &BTreeMap<String, RunningContainer>,
        session: &SharedSession,
    ) -> Result<RunningContainer> {
        ensure_bind_dirs(image)?;

        let suffix = uuid::Uuid::new_v4().simple().to_string();
        let name = image.container_name_with(&suffix[..12]);
        let volumes_from = image
            .volumes
            .share_with
            .iter()
            .filter_map(|key| started.get(key).map(|c| c.name.clone()))
            .collect();

        let networks = lock(session).networks.clone();
        let network = if request.link && !image.links.is_empty() {
            Some(networks.create(self.engine.as_ref()).await?)
        } else {
            None
        };

        let spec = container_spec(
            image,
            SpecRequest {
                name: name.clone(),
                env: request.env,
                ports: request.ports,
                command: request.command,
                volumes_from,
                network: network.as_ref().map(|network| NetworkAttachment {
                    name: network.clone(),
                    aliases: Vec::new(),
                }),
                tty: request.tty,
            },
        );
        // 作成中に中断されても名前で片付けられるよう先に記録する
        lock(session).containers.push(RunningContainer {
            image: image.key.clone(),
            id: name.clone(),
            name: name.clone(),
            host_ports: BTreeMap::new(),
        });
        let created = match spec {
            Ok(spec) => self.engine.create_container(&spec).await.map_err(ContainerError::from),
            Err(e) => Err(e),
        };
        let id = match created {
            Ok(id) => id,
            Err(e) => {
                lock(session).containers.retain(|c| c.name != name);
                if let Some(network) = &network {
                    networks.discard(self.engine.as_ref(), network).await;
                }
                return Err(e);
            }
        };
        debug!(image = %image.key, container = %id, "Created container");

        let running = RunningContainer {
            image: image.key.clone(),
            id: id.clone(),
            name,
            host_ports: BTreeMap::new(),
        };
        if let Some(entry) = lock(session)
            .containers
            .iter_mut()
            .find(|c| c.name == running.name)
        {
            *entry = running.clone();
        }

        if let Some(network) = &network {
            networks.register(network, &id);
            for link in &image.links {
                if let Some(dep) = started.get(&link.image) {
                    networks
                        .connect(self.engine.as_ref(), network, &dep.id, &link.alias)
                        .await?;
                }
            }
        }

        Ok(running)
    }

    /// 割り当てられたホストポートを記録する
    async fn refresh_ports(&self, id: &str, session: &SharedSession) -> Option<RunningContainer> {
        let status = match self.engine.inspect_container(id).await {
            Ok(Some(status)) => status,
            Ok(None) => return None,
            Err(e) => {
                debug!(container = id, "Failed to inspect container: {}", e);
                return None;
            }
        };
        let mut session = lock(session);
        let running = session.containers.iter_mut().find(|c| c.id == id)?;
        running.host_ports = status.host_ports;
        Some(running.clone())
    }

    fn attach_logs(&self, image: &str, id: &str, session: &SharedSession) {
        let engine = self.engine.clone();
        let id = id.to_string();
        let prefix = format!("{} |", image).dimmed().to_string();
        let handle = tokio::spawn(async move {
            let mut logs = engine.follow_logs(&id);
            while let Some(line) = logs.next().await {
                match line {
                    Ok(line) => print!("{} {}", prefix, line),
                    Err(e) => {
                        debug!(container = %id, "Log stream ended: {}", e);
                        break;
                    }
                }
            }
        });
        lock(session).log_tasks.push(handle);
    }

    /// 起動と逆順で停止して削除する
    ///
    /// 個々の失敗はログに残して続行する。
    pub async fn teardown(&self, session: RunSession, remove_volumes: bool) {
        let RunSession {
            containers,
            networks,
            log_tasks,
        } = session;
        for task in log_tasks {
            task.abort();
        }

        for container in containers.iter().rev() {
            debug!(container = %container.id, image = %container.image, "Tearing down container");
            self.stop(&container.id).await;

            let removed = retry_transient(|| {
                self.engine.remove_container(&container.id, remove_volumes)
            })
            .await;
            match removed {
                Ok(()) => println!("  ✓ コンテナ削除: {}", container.name),
                Err(e) if e.is_not_found() => {}
                Err(e) => warn!(container = %container.id, "Failed to remove container: {}", e),
            }
            networks.release(self.engine.as_ref(), &container.id).await;
        }
        networks.remove_all(self.engine.as_ref()).await;
    }

    /// 停止を要求し、止まらなければ強制終了する
    async fn stop(&self, id: &str) {
        let grace = STOP_GRACE.as_secs() as i32;
        if let Err(e) = retry_transient(|| self.engine.stop_container(id, grace)).await
            && !e.is_not_found()
        {
            warn!(container = id, "Failed to stop container: {}", e);
        }

        let deadline = Instant::now() + STOP_GRACE;
        loop {
            match self.engine.inspect_container(id).await {
                Ok(Some(status)) if status.running => {}
                Ok(_) => return,
                Err(e) => {
                    debug!(container = id, "Failed to inspect container: {}", e);
                    return;
                }
            }
            if Instant::now() >= deadline {
                warn!(container = id, "Container did not stop in time, killing it");
                if let Err(e) = self.engine.kill_container(id).await {
                    warn!(container = id, "Failed to kill container: {}", e);
                }
                return;
            }
            sleep(STOP_POLL_INTERVAL).await;
        }
    }
}

/// 一時的なエラーだけをリトライする
async fn retry_transient<F, Fut>(mut op: F) -> EngineResult<()>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = EngineResult<()>>,
{
    let mut attempt = 0;
    loop {
        match op().await {
            Err(e) if e.is_transient() && attempt + 1 < TRANSIENT_RETRIES => {
                attempt += 1;
                let delay = Duration::from_millis(200 * 2u64.pow(attempt));
                debug!(attempt, "Retrying after transient error: {}", e);
                sleep(delay).await;
            }
            result => return result,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::intervention::NoIntervention;
    use crate::testing::{EngineCall, FakeEngine};
    use harpoon_core::{ContextSpec, DependencyOptions, Link, WaitCondition};

    fn image(key: &str) -> Image {
        Image::new(key, ContextSpec::disabled("/project"))
    }

    fn runner(engine: &Arc<FakeEngine>) -> Runner {
        Runner::new(engine.clone(), Arc::new(NoIntervention))
    }

    fn linked_images() -> ImageSet {
        let mut images = ImageSet::new();
        images.insert(image("db"));
        images.insert(image("cache"));
        let mut app = image("app");
        app.links = vec![
            Link {
                image: "db".into(),
                alias: "database".into(),
            },
            Link {
                image: "cache".into(),
                alias: "cache".into(),
            },
        ];
        images.insert(app);
        images
    }

    fn created_images(calls: &[EngineCall]) -> Vec<String> {
        calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Create { image, .. } => Some(image.clone()),
                _ => None,
            })
            .collect()
    }

    #[tokio::test]
    async fn test_dependencies_start_first_and_are_linked() {
        let engine = Arc::new(FakeEngine::new());
        let images = linked_images();

        let code = runner(&engine)
            .run_until("app", &images, &RunOptions::default(), std::future::pending())
            .await
            .unwrap();
        assert_eq!(code, 0);

        let calls = engine.calls();
        assert_eq!(created_images(&calls), vec!["db", "cache", "app"]);
        let aliases: Vec<Vec<String>> = calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::ConnectNetwork { aliases, .. } => Some(aliases.clone()),
                _ => None,
            })
            .collect();
        assert_eq!(aliases, vec![vec!["database".to_string()], vec!["cache".to_string()]]);

        // すべて片付いている
        assert!(engine.containers().is_empty());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_teardown_is_reverse_of_start() {
        let engine = Arc::new(FakeEngine::new());
        let images = linked_images();
        runner(&engine)
            .run_until("app", &images, &RunOptions::default(), std::future::pending())
            .await
            .unwrap();

        let calls = engine.calls();
        let started: Vec<String> = calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Start { id } | EngineCall::StartAttached { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        let mut removed: Vec<String> = calls
            .iter()
            .filter_map(|call| match call {
                EngineCall::Remove { id } => Some(id.clone()),
                _ => None,
            })
            .collect();
        removed.reverse();
        assert_eq!(started, removed);
    }

    #[tokio::test]
    async fn test_timed_out_dependency_prevents_target() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_exit_code("exit 1", 1);

        let mut images = ImageSet::new();
        let mut db = image("db");
        db.wait_condition = Some(WaitCondition::new(vec!["exit 1".into()]).with_timeout(1.0));
        images.insert(db);
        let mut srv = image("srv");
        srv.links = vec![Link {
            image: "db".into(),
            alias: "db".into(),
        }];
        images.insert(srv);

        let err = runner(&engine)
            .run_until("srv", &images, &RunOptions::default(), std::future::pending())
            .await
            .unwrap_err();
        match err {
            ContainerError::DependencyTimedout { image, .. } => assert_eq!(image, "db"),
            other => panic!("unexpected error: {other}"),
        }

        let calls = engine.calls();
        assert_eq!(created_images(&calls), vec!["db"]);
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_parent_wait_condition_overrides_dependency() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_exit_code("never-ready", 1);

        let mut images = ImageSet::new();
        let mut db = image("db");
        db.wait_condition = Some(WaitCondition::new(vec!["never-ready".into()]).with_timeout(0.2));
        images.insert(db);
        let mut app = image("app");
        app.volumes.share_with = vec!["db".into()];
        app.dependency_options.insert(
            "db".into(),
            DependencyOptions {
                attached: false,
                wait_condition: Some(WaitCondition::new(vec!["true".into()])),
            },
        );
        images.insert(app);

        runner(&engine)
            .run_until("app", &images, &RunOptions::default(), std::future::pending())
            .await
            .unwrap();

        let app_spec = engine
            .calls()
            .iter()
            .any(|call| matches!(call, EngineCall::Create { image, .. } if image == "app"));
        assert!(app_spec);
    }

    #[tokio::test]
    async fn test_cancel_tears_down_and_reports_user_quit() {
        let engine = Arc::new(FakeEngine::new());
        engine.set_exec_exit_code("sleep-forever", 1);

        let mut images = ImageSet::new();
        let mut db = image("db");
        db.wait_condition = Some(WaitCondition::new(vec!["sleep-forever".into()]));
        images.insert(db);
        let mut app = image("app");
        app.volumes.share_with = vec!["db".into()];
        images.insert(app);

        let cancel = sleep(Duration::from_millis(200));
        let err = runner(&engine)
            .run_until("app", &images, &RunOptions::default(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::UserQuit));
        assert!(engine.containers().is_empty());
    }

    #[tokio::test]
    async fn test_cancel_during_create_removes_container_and_network() {
        let engine = Arc::new(FakeEngine::new());
        engine.delay_create(Duration::from_millis(300));

        let mut images = ImageSet::new();
        images.insert(image("db"));
        let mut app = image("app");
        app.links = vec![Link {
            image: "db".into(),
            alias: "database".into(),
        }];
        images.insert(app);

        // app の作成応答を待っている間に中断する
        let cancel = sleep(Duration::from_millis(450));
        let err = runner(&engine)
            .run_until("app", &images, &RunOptions::default(), cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, ContainerError::UserQuit));
        assert_eq!(created_images(&engine.calls()), vec!["db", "app"]);
        assert!(engine.containers().is_empty());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_cycle_is_detected_before_starting() {
        let engine = Arc::new(FakeEngine::new());
        let mut images = ImageSet::new();
        let mut a = image("a");
        a.volumes.share_with = vec!["b".into()];
        let mut b = image("b");
        b.volumes.share_with = vec!["a".into()];
        images.insert(a);
        images.insert(b);

        let err = runner(&engine)
            .run_until("a", &images, &RunOptions::default(), std::future::pending())
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            ContainerError::Config(HarpoonError::DependencyCycle { .. })
        ));
        assert!(engine.calls().is_empty());
    }

    #[tokio::test]
    async fn test_keep_detached_returns_session_with_ports() {
        let engine = Arc::new(FakeEngine::new());
        let images = linked_images();
        let options = RunOptions {
            ports: Some(vec![PortSpec::new(None, 4545)]),
            ..Default::default()
        };

        let runner = runner(&engine);
        let session = runner
            .run_and_keep_detached("app", &images, &options)
            .await
            .unwrap();
        let target = session.target().unwrap().clone();
        assert_eq!(target.image, "app");
        assert!(target.host_ports["4545/tcp"] > 0);
        assert_eq!(session.networks().len(), 1);
        assert_eq!(engine.containers().len(), 3);

        runner.teardown(session, false).await;
        assert!(engine.containers().is_empty());
        assert!(engine.networks().is_empty());
    }

    #[tokio::test]
    async fn test_flat_run_skips_dependencies() {
        let engine = Arc::new(FakeEngine::new());
        let images = linked_images();
        let options = RunOptions {
            flat: true,
            ..Default::default()
        };
        runner(&engine)
            .run_until("app", &images, &options, std::future::pending())
            .await
            .unwrap();
        assert_eq!(created_images(&engine.calls()), vec!["app"]);
    }
}
