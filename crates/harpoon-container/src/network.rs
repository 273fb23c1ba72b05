//! 実行ごとのネットワーク管理
//!
//! リンクを持つイメージを起動するたびに UUID 名のブリッジネットワークを作り、
//! 最後のメンバーが取り除かれたら削除する。

use crate::engine::Engine;
use crate::error::Result;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};

/// 作成したネットワークとそのメンバー
#[derive(Debug, Clone, Default)]
pub struct NetworkManager {
    members: Arc<Mutex<BTreeMap<String, BTreeSet<String>>>>,
}

impl NetworkManager {
    pub fn new() -> Self {
        Self::default()
    }

    fn with_members<T>(&self, f: impl FnOnce(&mut BTreeMap<String, BTreeSet<String>>) -> T) -> T {
        let mut members = self.members.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut members)
    }

    /// 新しいネットワークを作る
    pub async fn create(&self, engine: &dyn Engine) -> Result<String> {
        let name = uuid::Uuid::new_v4().to_string();
        // 作成中に中断されても片付けられるよう先に記録する
        self.with_members(|members| members.insert(name.clone(), BTreeSet::new()));
        if let Err(e) = engine.create_network(&name).await {
            self.with_members(|members| members.remove(&name));
            return Err(e.into());
        }
        debug!(network = %name, "Created network");
        Ok(name)
    }

    /// メンバーとして記録する
    pub fn register(&self, network: &str, container: &str) {
        self.with_members(|members| {
            members
                .entry(network.to_string())
                .or_default()
                .insert(container.to_string());
        });
    }

    /// エイリアス付きで接続して記録する
    pub async fn connect(
        &self,
        engine: &dyn Engine,
        network: &str,
        container: &str,
        alias: &str,
    ) -> Result<()> {
        engine
            .connect_network(network, container, &[alias.to_string()])
            .await?;
        self.register(network, container);
        Ok(())
    }

    /// コンテナを外し、空になったネットワークを削除する
    pub async fn release(&self, engine: &dyn Engine, container: &str) {
        let emptied: Vec<String> = self.with_members(|members| {
            for set in members.values_mut() {
                set.remove(container);
            }
            let emptied: Vec<String> = members
                .iter()
                .filter(|(_, set)| set.is_empty())
                .map(|(name, _)| name.clone())
                .collect();
            for name in &emptied {
                members.remove(name);
            }
            emptied
        });
        for name in emptied {
            self.remove(engine, &name).await;
        }
    }

    /// メンバーを持たないまま使わなくなったネットワークを削除する
    pub async fn discard(&self, engine: &dyn Engine, network: &str) {
        let removed = self.with_members(|members| {
            if members.get(network).is_some_and(|set| set.is_empty()) {
                members.remove(network);
                true
            } else {
                false
            }
        });
        if removed {
            self.remove(engine, network).await;
        }
    }

    /// 残っているネットワークをすべて削除する
    pub async fn remove_all(&self, engine: &dyn Engine) {
        let names: Vec<String> =
            self.with_members(|members| std::mem::take(members).into_keys().collect());
        for name in names {
            self.remove(engine, &name).await;
        }
    }

    async fn remove(&self, engine: &dyn Engine, name: &str) {
        match engine.remove_network(name).await {
            Ok(()) => debug!(network = %name, "Removed network"),
            Err(e) if e.is_not_found() => {}
            Err(e) => warn!(network = %name, "Failed to remove network: {}", e),
        }
    }

    pub fn networks(&self) -> Vec<String> {
        self.with_members(|members| members.keys().cloned().collect())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::engine::ContainerSpec;
    use crate::testing::FakeEngine;

    async fn container(engine: &FakeEngine, name: &str) -> String {
        engine
            .create_container(&ContainerSpec {
                name: name.into(),
                image: name.into(),
                ..Default::default()
            })
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_network_removed_with_last_member() {
        let engine = FakeEngine::new();
        let manager = NetworkManager::new();
        let network = manager.create(&engine).await.unwrap();

        let app = container(&engine, "app").await;
        let db = container(&engine, "db").await;
        manager.register(&network, &app);
        manager.connect(&engine, &network, &db, "database").await.unwrap();

        manager.release(&engine, &app).await;
        assert_eq!(engine.networks(), vec![network.clone()]);

        manager.release(&engine, &db).await;
        assert!(engine.networks().is_empty());
        assert!(manager.networks().is_empty());
    }
}
