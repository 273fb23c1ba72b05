//! 起動中コンテナの管理
//!
//! イメージキーごとに1つのスロット（`tokio::sync::Mutex`）を持つ。スロットを
//! 取った側だけが起動処理を行い、同じキーへの同時リクエストはスロットが
//! 空くのを待ってから起動済みのコンテナを受け取る。

use crate::error::{ManagerError, Result};
use crate::request::{StartRequest, StopRequest};
use colored::Colorize;
use harpoon_build::{BuildMemo, BuildSettings, ImageBuilder, RegistryAuth, Syncer};
use harpoon_container::{
    Engine, Intervener, NoIntervention, RunOptions, RunSession, Runner, allocate_port,
};
use harpoon_core::{ImageSet, PortSpec, external_dependencies, ordered_keys, run_order};
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use tokio::sync::{Mutex as AsyncMutex, watch};
use tracing::{debug, info, instrument};

/// `POST /start_container` の応答
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StartResponse {
    /// コンテナポート -> ホストポート
    pub ports: BTreeMap<String, u16>,
    pub container_id: String,
    pub just_created: bool,
}

/// マネージャーが起動したコンテナ
struct LiveContainer {
    session: RunSession,
    container_id: String,
    ports: BTreeMap<String, u16>,
}

type Slot = Arc<AsyncMutex<Option<LiveContainer>>>;

pub struct ContainerManager {
    images: ImageSet,
    builder: ImageBuilder,
    syncer: Syncer,
    runner: Runner,
    live: Mutex<BTreeMap<String, Slot>>,
    /// このプロセスで pull 済みの外部イメージ
    pulled_externals: AsyncMutex<BTreeSet<String>>,
    shutting_down: AtomicBool,
    shutdown: watch::Sender<bool>,
}

impl ContainerManager {
    pub fn new(
        engine: Arc<dyn Engine>,
        images: ImageSet,
        settings: BuildSettings,
        auth: RegistryAuth,
    ) -> Self {
        // 端末のないサービスなので介入はしない
        let intervener: Arc<dyn Intervener> = Arc::new(NoIntervention);
        let settings = BuildSettings {
            intervene: false,
            ..settings
        };
        let (shutdown, _) = watch::channel(false);
        Self {
            images,
            builder: ImageBuilder::new(engine.clone(), intervener.clone(), settings),
            syncer: Syncer::new(engine.clone(), auth),
            runner: Runner::new(engine, intervener),
            live: Mutex::new(BTreeMap::new()),
            pulled_externals: AsyncMutex::new(BTreeSet::new()),
            shutting_down: AtomicBool::new(false),
            shutdown,
        }
    }

    pub fn version() -> &'static str {
        env!("CARGO_PKG_VERSION")
    }

    pub fn is_shutting_down(&self) -> bool {
        self.shutting_down.load(Ordering::SeqCst)
    }

    fn slots(&self) -> MutexGuard<'_, BTreeMap<String, Slot>> {
        self.live.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, key: &str) -> Slot {
        self.slots().entry(key.to_string()).or_default().clone()
    }

    /// 起動中のコンテナ（キー -> コンテナ ID）
    pub async fn live_containers(&self) -> BTreeMap<String, String> {
        let slots: Vec<(String, Slot)> = self
            .slots()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();

        let mut live = BTreeMap::new();
        for (key, slot) in slots {
            if let Some(container) = slot.lock().await.as_ref() {
                live.insert(key, container.container_id.clone());
            }
        }
        live
    }

    /// コンテナを起動する。起動済みならそのコンテナを返す
    #[instrument(skip(self, request), fields(image = %request.image))]
    pub async fn start(&self, request: StartRequest) -> Result<StartResponse> {
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }
        self.images.require(&request.image)?;

        let slot = self.slot(&request.image);
        let mut live = slot.lock().await;
        if let Some(existing) = live.as_ref() {
            debug!(container = %existing.container_id, "Container is already running");
            return Ok(StartResponse {
                ports: existing.ports.clone(),
                container_id: existing.container_id.clone(),
                just_created: false,
            });
        }
        if self.is_shutting_down() {
            return Err(ManagerError::ShuttingDown);
        }

        let started = self.start_new(&request).await?;
        if self.is_shutting_down() {
            self.runner.teardown(started.session, true).await;
            return Err(ManagerError::ShuttingDown);
        }

        info!(container = %started.container_id, "Started container");
        println!(
            "{} {} を起動しました ({})",
            "✓".green(),
            request.image.cyan(),
            started.container_id
        );
        let response = StartResponse {
            ports: started.ports.clone(),
            container_id: started.container_id.clone(),
            just_created: true,
        };
        *live = Some(started);
        Ok(response)
    }

    async fn start_new(&self, request: &StartRequest) -> Result<LiveContainer> {
        let key = &request.image;
        let order = run_order(&self.images, key)?;

        self.pull_externals(&order).await?;

        let mut memo = BuildMemo::new();
        for image in &order {
            self.builder
                .build_image(image, &self.images, &mut Vec::new(), &mut memo, false)
                .await?;
        }

        let ports = request
            .ports
            .iter()
            .map(|&(host, container)| {
                let host = if host == 0 {
                    allocate_port().map_err(|e| ManagerError::Bind {
                        address: "127.0.0.1:0".to_string(),
                        message: e.to_string(),
                    })?
                } else {
                    host
                };
                Ok(PortSpec::new(Some(host), container))
            })
            .collect::<Result<Vec<_>>>()?;

        let options = RunOptions {
            ports: (!ports.is_empty()).then_some(ports),
            remove_volumes: true,
            ..Default::default()
        };
        let session = self
            .runner
            .run_and_keep_detached(key, &self.images, &options)
            .await?;

        let Some(target) = session.target().cloned() else {
            self.runner.teardown(session, true).await;
            return Err(ManagerError::bad_request(format!("'{}' was not started", key)));
        };
        Ok(LiveContainer {
            container_id: target.id,
            ports: published_ports(&target.host_ports),
            session,
        })
    }

    /// 外部イメージをプロセス中に1度だけ pull する
    async fn pull_externals(&self, keys: &[String]) -> Result<()> {
        let mut externals: Vec<String> = Vec::new();
        for key in ordered_keys(&self.images, Some(keys))? {
            for external in external_dependencies(self.images.require(&key)?) {
                if !externals.contains(&external) {
                    externals.push(external);
                }
            }
        }

        let mut pulled = self.pulled_externals.lock().await;
        for external in externals {
            if pulled.contains(&external) {
                continue;
            }
            self.syncer.pull_reference(&external, true).await?;
            pulled.insert(external);
        }
        Ok(())
    }

    /// 起動中なら停止して削除する。起動していなくても成功
    #[instrument(skip(self, request), fields(image = %request.image))]
    pub async fn stop(&self, request: StopRequest) -> Result<()> {
        let slot = self.slots().get(&request.image).cloned();
        let Some(slot) = slot else {
            debug!("Container is not running");
            return Ok(());
        };

        let taken = slot.lock().await.take();
        if let Some(live) = taken {
            info!(container = %live.container_id, "Stopping container");
            self.runner.teardown(live.session, true).await;
            println!("{} {} を停止しました", "✓".green(), request.image.cyan());
        }
        Ok(())
    }

    /// 起動中のコンテナをすべて停止し、サーバーに終了を通知する
    ///
    /// 2回目以降の呼び出しは何もしない。
    pub async fn shutdown(&self) {
        if self.shutting_down.swap(true, Ordering::SeqCst) {
            debug!("Shutdown already in progress");
            return;
        }
        info!("Shutting down container manager");

        let slots: Vec<(String, Slot)> = self
            .slots()
            .iter()
            .map(|(key, slot)| (key.clone(), slot.clone()))
            .collect();
        for (key, slot) in slots {
            let taken = slot.lock().await.take();
            if let Some(live) = taken {
                debug!(image = %key, container = %live.container_id, "Stopping container");
                self.runner.teardown(live.session, true).await;
            }
        }

        self.shutdown.send_replace(true);
        println!("{}", "✓ コンテナマネージャーを停止しました".green());
    }

    /// `shutdown` が完了するまで待つ
    pub async fn wait_for_shutdown(&self) {
        let mut receiver = self.shutdown.subscribe();
        // 送信側は self が持っているので閉じることはない
        let _ = receiver.wait_for(|done| *done).await;
    }
}

/// `4545/tcp` -> `4545`。UDP はそのまま残す
fn published_ports(host_ports: &BTreeMap<String, u16>) -> BTreeMap<String, u16> {
    host_ports
        .iter()
        .map(|(key, port)| {
            let key = key.strip_suffix("/tcp").unwrap_or(key);
            (key.to_string(), *port)
        })
        .collect()
}
