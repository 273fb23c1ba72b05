//! 実行時オプション（ボリューム、リンク、環境変数、ポート、ネットワーク、リソース）

use super::WaitCondition;
use crate::error::{HarpoonError, Result};
use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

/// ボリューム設定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct VolumesSpec {
    pub mounts: Vec<Mount>,
    /// volumes_from で共有するイメージキー
    pub share_with: Vec<String>,
}

/// バインドマウント
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Mount {
    pub host: PathBuf,
    pub container: String,
    pub read_only: bool,
}

impl Mount {
    /// `host:container[:ro]` 形式
    pub fn bind_string(&self) -> String {
        let mut bind = format!("{}:{}", self.host.display(), self.container);
        if self.read_only {
            bind.push_str(":ro");
        }
        bind
    }
}

/// リンク（依存イメージとネットワークエイリアス）
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Link {
    pub image: String,
    pub alias: String,
}

/// 環境変数定義
///
/// - `NAME` はプロセスの環境変数から取得
/// - `NAME=literal` は固定値
/// - `NAME:default` は環境変数がなければデフォルト値
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct EnvSpec {
    pub name: String,
    pub default: Option<String>,
    pub literal: Option<String>,
}

impl EnvSpec {
    pub fn parse(spec: &str) -> Self {
        // 先に出てくる区切り文字で判定する
        match spec.find(['=', ':']) {
            Some(pos) if spec[pos..].starts_with('=') => Self {
                name: spec[..pos].to_string(),
                default: None,
                literal: Some(spec[pos + 1..].to_string()),
            },
            Some(pos) => Self {
                name: spec[..pos].to_string(),
                default: Some(spec[pos + 1..].to_string()),
                literal: None,
            },
            None => Self {
                name: spec.to_string(),
                default: None,
                literal: None,
            },
        }
    }

    /// `name=value` 形式に解決
    ///
    /// 固定値 → プロセスの環境変数 → デフォルト値の順に探す。
    pub fn resolve(&self) -> Result<String> {
        if let Some(literal) = &self.literal {
            return Ok(format!("{}={}", self.name, literal));
        }
        if let Ok(value) = std::env::var(&self.name) {
            return Ok(format!("{}={}", self.name, value));
        }
        if let Some(default) = &self.default {
            return Ok(format!("{}={}", self.name, default));
        }
        Err(HarpoonError::MissingEnv {
            name: self.name.clone(),
        })
    }
}

/// 環境変数リストを解決する
///
/// 後に出てきた同名の定義（`--env` など）が優先される。
pub fn resolve_env(specs: &[EnvSpec]) -> Result<Vec<String>> {
    let mut order: Vec<&str> = Vec::new();
    let mut latest: BTreeMap<&str, &EnvSpec> = BTreeMap::new();
    for spec in specs {
        if latest.insert(spec.name.as_str(), spec).is_none() {
            order.push(spec.name.as_str());
        }
    }

    order
        .into_iter()
        .filter_map(|name| latest.get(name))
        .map(|spec| spec.resolve())
        .collect()
}

/// トランスポート種別
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize)]
pub enum Transport {
    #[default]
    Tcp,
    Udp,
}

impl fmt::Display for Transport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Transport::Tcp => write!(f, "tcp"),
            Transport::Udp => write!(f, "udp"),
        }
    }
}

/// ポート公開設定
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PortSpec {
    pub host_ip: Option<String>,
    /// `None` または 0 はエンジンに任せる
    pub host_port: Option<u16>,
    pub container_port: u16,
    pub transport: Transport,
}

impl PortSpec {
    pub fn new(host_port: Option<u16>, container_port: u16) -> Self {
        Self {
            host_ip: None,
            host_port,
            container_port,
            transport: Transport::Tcp,
        }
    }

    /// `8080`, `80:8080`, `127.0.0.1:80:8080`（末尾に `/udp` 可）
    pub fn parse(spec: &str) -> std::result::Result<Self, String> {
        let (ports, transport) = match spec.rsplit_once('/') {
            Some((ports, "tcp")) => (ports, Transport::Tcp),
            Some((ports, "udp")) => (ports, Transport::Udp),
            Some((_, other)) => return Err(format!("Unknown transport '{}'", other)),
            None => (spec, Transport::Tcp),
        };

        let parse_port = |value: &str| {
            value
                .trim()
                .parse::<u16>()
                .map_err(|_| format!("'{}' is not a valid port number", value))
        };

        let parts: Vec<&str> = ports.split(':').collect();
        let (host_ip, host_port, container_port) = match parts.as_slice() {
            [container] => (None, None, parse_port(container)?),
            [host, container] => (None, Some(parse_port(host)?), parse_port(container)?),
            [ip, host, container] => (
                Some(ip.to_string()),
                if host.is_empty() {
                    None
                } else {
                    Some(parse_port(host)?)
                },
                parse_port(container)?,
            ),
            _ => return Err(format!("Port specification '{}' has too many parts", spec)),
        };

        Ok(Self {
            host_ip,
            host_port,
            container_port,
            transport,
        })
    }

    /// `8080/tcp` 形式のキー
    pub fn container_key(&self) -> String {
        format!("{}/{}", self.container_port, self.transport)
    }
}

/// ネットワーク設定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct NetworkSpec {
    pub mode: Option<String>,
    pub hostname: Option<String>,
    pub domainname: Option<String>,
    pub dns: Vec<String>,
    pub dns_search: Vec<String>,
    pub extra_hosts: Vec<String>,
    pub publish_all: bool,
    pub disabled: bool,
}

/// リソース制限
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ResourceLimits {
    pub cpu_shares: Option<i64>,
    pub cpuset_cpus: Option<String>,
    /// バイト数
    pub memory: Option<i64>,
    pub memory_swap: Option<i64>,
    pub ulimits: Vec<Ulimit>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Ulimit {
    pub name: String,
    pub soft: i64,
    pub hard: i64,
}

/// `512m`, `2g`, `1024` などをバイト数に変換
pub fn parse_byte_size(value: &str) -> Option<i64> {
    let value = value.trim().to_lowercase();
    let (digits, multiplier) = match value.chars().last()? {
        'k' => (&value[..value.len() - 1], 1024),
        'm' => (&value[..value.len() - 1], 1024 * 1024),
        'g' => (&value[..value.len() - 1], 1024 * 1024 * 1024),
        'b' => (&value[..value.len() - 1], 1),
        _ => (value.as_str(), 1),
    };
    digits.trim().parse::<i64>().ok().map(|n| n * multiplier)
}

/// 依存ごとの上書き設定
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct DependencyOptions {
    /// ログをアタッチして表示する
    pub attached: bool,
    pub wait_condition: Option<WaitCondition>,
}
