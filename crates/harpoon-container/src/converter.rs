//! イメージ定義からコンテナ作成パラメータへの変換

// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::engine::{ContainerSpec, NetworkAttachment, PortPublish};
use crate::error::{ContainerError, Result};
use bollard::container::{Config, CreateContainerOptions, NetworkingConfig};
use bollard::models::{EndpointSettings, HostConfig, PortBinding, ResourcesUlimits};
use harpoon_core::{EnvSpec, Image, PortSpec, resolve_env};
use std::collections::{BTreeMap, HashMap};

/// イメージを示すラベル
pub const IMAGE_LABEL: &str = "harpoon.image";

/// コンテナ作成時の上書き
#[derive(Debug, Clone, Default)]
pub struct SpecRequest<'a> {
    pub name: String,
    /// イメージの env の後に適用（同名は後勝ち）
    pub env: &'a [EnvSpec],
    /// 指定すればイメージの ports を置き換える
    pub ports: Option<&'a [PortSpec]>,
    /// 指定すればイメージのコマンドを置き換える
    pub command: Option<Vec<String>>,
    pub volumes_from: Vec<String>,
    pub network: Option<NetworkAttachment>,
    pub tty: bool,
}

impl From<&PortSpec> for PortPublish {
    fn from(port: &PortSpec) -> Self {
        PortPublish {
            host_ip: port.host_ip.clone(),
            host_port: port.host_port.filter(|p| *p != 0),
            container_port: port.container_port,
            transport: port.transport,
        }
    }
}

/// イメージ定義をコンテナ作成パラメータに変換
pub fn container_spec(image: &Image, request: SpecRequest<'_>) -> Result<ContainerSpec> {
    let specs: Vec<EnvSpec> = image.env.iter().chain(request.env.iter()).cloned().collect();
    let env = resolve_env(&specs)?;

    let ports = request
        .ports
        .unwrap_or(&image.ports)
        .iter()
        .map(PortPublish::from)
        .collect();

    let mut labels = BTreeMap::new();
    labels.insert(IMAGE_LABEL.to_string(), image.key.clone());

    Ok(ContainerSpec {
        name: request.name,
        image: image.image_tag(),
        cmd: request.command.or_else(|| image.formatted_command()),
        env,
        ports,
        binds: image.volumes.mounts.iter().map(|m| m.bind_string()).collect(),
        volumes_from: request.volumes_from,
        network: request.network,
        network_mode: image.network.mode.clone(),
        hostname: image.network.hostname.clone(),
        domainname: image.network.domainname.clone(),
        dns: image.network.dns.clone(),
        dns_search: image.network.dns_search.clone(),
        extra_hosts: image.network.extra_hosts.clone(),
        publish_all_ports: image.network.publish_all,
        network_disabled: image.network.disabled,
        tty: request.tty,
        open_stdin: request.tty,
        user: image.user.clone(),
        working_dir: image.working_dir.clone(),
        privileged: image.privileged,
        cpu_shares: image.resources.cpu_shares,
        cpuset_cpus: image.resources.cpuset_cpus.clone(),
        memory: image.resources.memory,
        memory_swap: image.resources.memory_swap,
        ulimits: image
            .resources
            .ulimits
            .iter()
            .map(|u| (u.name.clone(), u.soft, u.hard))
            .collect(),
        labels,
    })
}

/// マウント元のディレクトリがなければ作る
pub fn ensure_bind_dirs(image: &Image) -> Result<()> {
    for mount in &image.volumes.mounts {
        if mount.host.exists() {
            continue;
        }
        std::fs::create_dir_all(&mount.host).map_err(|e| ContainerError::BindDirMissing {
            path: mount.host.clone(),
            message: e.to_string(),
        })?;
    }
    Ok(())
}

/// Docker API のコンテナ設定に変換
pub fn to_docker_config(spec: &ContainerSpec) -> (Config<String>, CreateContainerOptions<String>) {
    // ポートバインディングの設定
    let mut port_bindings = HashMap::new();
    let mut exposed_ports = HashMap::new();
    for port in &spec.ports {
        let container_port = port.container_key();
        exposed_ports.insert(container_port.clone(), HashMap::new());
        port_bindings.insert(
            container_port,
            Some(vec![PortBinding {
                host_ip: Some(port.host_ip.clone().unwrap_or_else(|| "0.0.0.0".to_string())),
                // 空文字列ならエンジンが割り当てる
                host_port: Some(port.host_port.map(|p| p.to_string()).unwrap_or_default()),
            }]),
        );
    }

    let non_empty = |values: &Vec<String>| (!values.is_empty()).then(|| values.clone());

    let host_config = Some(HostConfig {
        port_bindings: Some(port_bindings),
        binds: non_empty(&spec.binds),
        volumes_from: non_empty(&spec.volumes_from),
        network_mode: spec
            .network_mode
            .clone()
            .or_else(|| spec.network.as_ref().map(|n| n.name.clone())),
        dns: non_empty(&spec.dns),
        dns_search: non_empty(&spec.dns_search),
        extra_hosts: non_empty(&spec.extra_hosts),
        publish_all_ports: Some(spec.publish_all_ports),
        privileged: Some(spec.privileged),
        cpu_shares: spec.cpu_shares,
        cpuset_cpus: spec.cpuset_cpus.clone(),
        memory: spec.memory,
        memory_swap: spec.memory_swap,
        ulimits: (!spec.ulimits.is_empty()).then(|| {
            spec.ulimits
                .iter()
                .map(|(name, soft, hard)| ResourcesUlimits {
                    name: Some(name.clone()),
                    soft: Some(*soft),
                    hard: Some(*hard),
                })
                .collect()
        }),
        ..Default::default()
    });

    // リンクのエイリアスで名前解決できるようにする
    let networking_config = spec.network.as_ref().map(|network| {
        let mut endpoints = HashMap::new();
        endpoints.insert(
            network.name.clone(),
            EndpointSettings {
                aliases: non_empty(&network.aliases),
                ..Default::default()
            },
        );
        NetworkingConfig {
            endpoints_config: endpoints,
        }
    });

    let config = Config {
        image: Some(spec.image.clone()),
        cmd: spec.cmd.clone(),
        env: Some(spec.env.clone()),
        exposed_ports: Some(exposed_ports),
        hostname: spec.hostname.clone(),
        domainname: spec.domainname.clone(),
        user: spec.user.clone(),
        working_dir: spec.working_dir.clone(),
        network_disabled: Some(spec.network_disabled),
        tty: Some(spec.tty),
        open_stdin: Some(spec.open_stdin),
        stdin_once: Some(spec.open_stdin),
        attach_stdin: Some(spec.open_stdin),
        attach_stdout: Some(true),
        attach_stderr: Some(true),
        labels: Some(spec.labels.clone().into_iter().collect()),
        host_config,
        networking_config,
        ..Default::default()
    };

    let options = CreateContainerOptions {
        name: spec.name.clone(),
        platform: None,
    };

    (config, options)
}
