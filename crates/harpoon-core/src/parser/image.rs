//! イメージ定義のパース

use super::{bad_value_from, resolve_host_path};
use crate::error::{HarpoonError, Result};
use crate::instruction::{self, ParseContext};
use crate::model::{
    DependencyOptions, EnvSpec, Image, ImageTask, Link, Mount, NetworkSpec, Persistence, PortSpec,
    ResourceLimits, RunCommand, TaskOverrides, Ulimit, VolumesSpec, WaitCondition,
    DEFAULT_PERSIST_SHELL, DEFAULT_WAIT_BETWEEN_ATTEMPTS, DEFAULT_WAIT_TIMEOUT, parse_byte_size,
    shell_quote,
};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;

/// イメージ名の決定に使うフィールドだけを先に読む
#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub(crate) struct RawNaming {
    pub image_index: Option<String>,
    pub image_name: Option<String>,
    pub image_name_prefix: Option<String>,
    pub tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawImage {
    commands: Vec<Value>,
    context: Option<Value>,
    links: Vec<String>,
    volumes: RawVolumes,
    env: Vec<String>,
    ports: Vec<Value>,
    dependency_options: BTreeMap<String, RawDependencyOptions>,
    network: RawNetwork,
    cpu: RawCpu,
    memory: Option<Value>,
    memswap: Option<Value>,
    ulimits: Vec<RawUlimit>,
    privileged: bool,
    user: Option<String>,
    working_dir: Option<String>,
    persistence: Option<RawPersistence>,
    wait_condition: Option<RawWaitCondition>,
    tasks: BTreeMap<String, RawTask>,
    command: Option<Value>,
    bash: Option<String>,
    image_index: Option<String>,
    image_name: Option<String>,
    image_name_prefix: Option<String>,
    tag: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawVolumes {
    /// `{host: container}` または `["host:container[:ro]"]`
    mount: Option<Value>,
    share_with: Vec<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawNetwork {
    mode: Option<String>,
    hostname: Option<String>,
    domainname: Option<String>,
    dns: Vec<String>,
    dns_search: Vec<String>,
    extra_hosts: Vec<String>,
    publish_all: bool,
    disabled: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawCpu {
    cpu_shares: Option<i64>,
    cpuset_cpus: Option<String>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawUlimit {
    name: String,
    soft: i64,
    hard: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawPersistence {
    action: String,
    #[serde(default)]
    folders: Vec<String>,
    shell: Option<String>,
    #[serde(default)]
    no_provider: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RawWaitCondition {
    timeout: Option<f64>,
    wait_between_attempts: Option<f64>,
    command: Vec<String>,
    port_open: Vec<u16>,
    file_exists: Vec<String>,
    greps: BTreeMap<String, String>,
    file_value: BTreeMap<String, String>,
    curl_result: BTreeMap<String, String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawDependencyOptions {
    attached: bool,
    wait_condition: Option<RawWaitCondition>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RawTask {
    pub action: Option<String>,
    pub image: Option<String>,
    pub description: Option<String>,
    pub options: RawTaskOptions,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub(crate) struct RawTaskOptions {
    pub command: Option<String>,
    pub bash: Option<String>,
    pub env: Vec<String>,
}

impl RawWaitCondition {
    /// 各条件をシェルのプローブに変換
    pub(crate) fn compile(self) -> WaitCondition {
        let mut probes = self.command;
        probes.extend(
            self.port_open
                .iter()
                .map(|port| format!("nc -z 127.0.0.1 {}", port)),
        );
        probes.extend(
            self.file_exists
                .iter()
                .map(|file| format!("test -f {}", shell_quote(file))),
        );
        probes.extend(self.greps.iter().map(|(file, regex)| {
            format!("grep -qE {} {}", shell_quote(regex), shell_quote(file))
        }));
        probes.extend(self.file_value.iter().map(|(file, value)| {
            format!("test \"$(cat {})\" = {}", shell_quote(file), shell_quote(value))
        }));
        probes.extend(self.curl_result.iter().map(|(url, expected)| {
            format!(
                "test \"$(curl -s {})\" = {}",
                shell_quote(url),
                shell_quote(expected)
            )
        }));

        WaitCondition::new(probes)
            .with_timeout(self.timeout.unwrap_or(DEFAULT_WAIT_TIMEOUT))
            .with_wait_between_attempts(
                self.wait_between_attempts
                    .unwrap_or(DEFAULT_WAIT_BETWEEN_ATTEMPTS),
            )
    }
}

impl RawTask {
    pub(crate) fn into_task(
        self,
        name: &str,
        default_image: Option<&str>,
        path: &str,
    ) -> Result<ImageTask> {
        if self.options.command.is_some() && self.options.bash.is_some() {
            return Err(HarpoonError::bad_value(
                path,
                "Only one of command and bash may be specified",
            ));
        }
        Ok(ImageTask {
            name: name.to_string(),
            action: self.action.unwrap_or_else(|| "run".to_string()),
            image: self.image.or_else(|| default_image.map(str::to_string)),
            description: self.description,
            overrides: TaskOverrides {
                command: self.options.command,
                bash: self.options.bash,
                env: self.options.env.iter().map(|e| EnvSpec::parse(e)).collect(),
            },
        })
    }
}

/// イメージの最終的な名前とタグ
pub(crate) struct ImageNaming {
    pub image_name: String,
    pub image_index: Option<String>,
    pub tag: Option<String>,
}

impl RawNaming {
    pub(crate) fn resolve(
        self,
        key: &str,
        default_prefix: Option<&str>,
        tag_override: Option<&str>,
    ) -> ImageNaming {
        let image_index = self
            .image_index
            .filter(|index| !index.is_empty())
            .map(|index| {
                if index.ends_with('/') {
                    index
                } else {
                    format!("{}/", index)
                }
            });
        let prefix = self
            .image_name_prefix
            .or_else(|| default_prefix.map(str::to_string))
            .filter(|prefix| !prefix.is_empty());
        let name = self.image_name.unwrap_or_else(|| key.to_string());

        let image_name = match prefix {
            Some(prefix) => format!(
                "{}{}-{}",
                image_index.as_deref().unwrap_or(""),
                prefix,
                name
            ),
            None => format!("{}{}", image_index.as_deref().unwrap_or(""), name),
        };

        ImageNaming {
            image_name,
            image_index,
            tag: tag_override.map(str::to_string).or(self.tag),
        }
    }
}

/// 型付きのイメージ定義に変換
pub(crate) fn parse_image(
    key: &str,
    value: Value,
    naming: ImageNaming,
    known: &BTreeSet<String>,
    config_root: &Path,
) -> Result<(Image, Vec<ImageTask>)> {
    let path = format!("images.{}", key);
    let raw: RawImage = serde_yaml::from_value(value).map_err(|e| bad_value_from(&path, e))?;

    let commands = instruction::parse(
        &raw.commands,
        &ParseContext {
            image: key,
            known,
            config_root,
        },
    )?;

    let context = super::parse_context_spec(raw.context.as_ref(), &format!("{}.context", path), config_root)?;

    let require_known = |dep: &str, field: &str| -> Result<()> {
        if known.contains(dep) {
            Ok(())
        } else {
            Err(HarpoonError::bad_value(
                format!("{}.{}", path, field),
                format!("'{}' is not an image in the configuration", dep),
            ))
        }
    };

    let mut links = Vec::with_capacity(raw.links.len());
    for link in &raw.links {
        let (image, alias) = match link.split_once(':') {
            Some((image, alias)) => (image, alias),
            None => (link.as_str(), link.as_str()),
        };
        require_known(image, "links")?;
        links.push(Link {
            image: image.to_string(),
            alias: alias.to_string(),
        });
    }

    for dep in &raw.volumes.share_with {
        require_known(dep, "volumes.share_with")?;
    }
    let volumes = VolumesSpec {
        mounts: parse_mounts(raw.volumes.mount.as_ref(), &path, config_root)?,
        share_with: raw.volumes.share_with,
    };

    let mut ports = Vec::with_capacity(raw.ports.len());
    for (index, port) in raw.ports.iter().enumerate() {
        let spec = match port {
            Value::Number(n) => n.to_string(),
            Value::String(s) => s.clone(),
            _ => {
                return Err(HarpoonError::bad_value(
                    format!("{}.ports[{}]", path, index),
                    "Expected a port number or string",
                ));
            }
        };
        ports.push(
            PortSpec::parse(&spec)
                .map_err(|message| HarpoonError::bad_value(format!("{}.ports[{}]", path, index), message))?,
        );
    }

    let mut dependency_options = BTreeMap::new();
    for (dep, options) in raw.dependency_options {
        require_known(&dep, "dependency_options")?;
        dependency_options.insert(
            dep,
            DependencyOptions {
                attached: options.attached,
                wait_condition: options.wait_condition.map(RawWaitCondition::compile),
            },
        );
    }

    let resources = ResourceLimits {
        cpu_shares: raw.cpu.cpu_shares,
        cpuset_cpus: raw.cpu.cpuset_cpus,
        memory: parse_size_value(raw.memory.as_ref(), &format!("{}.memory", path))?,
        memory_swap: parse_size_value(raw.memswap.as_ref(), &format!("{}.memswap", path))?,
        ulimits: raw
            .ulimits
            .into_iter()
            .map(|u| Ulimit {
                hard: u.hard.unwrap_or(u.soft),
                name: u.name,
                soft: u.soft,
            })
            .collect(),
    };

    let command = match raw.command {
        None => None,
        Some(Value::String(line)) => Some(RunCommand::Shell(line)),
        Some(value @ Value::Sequence(_)) => Some(RunCommand::Exec(
            serde_yaml::from_value(value)
                .map_err(|e| bad_value_from(&format!("{}.command", path), e))?,
        )),
        Some(_) => {
            return Err(HarpoonError::bad_value(
                format!("{}.command", path),
                "Expected a string or a list of strings",
            ));
        }
    };
    if command.is_some() && raw.bash.is_some() {
        return Err(HarpoonError::bad_value(
            &path,
            "Only one of command and bash may be specified",
        ));
    }

    let persistence = raw.persistence.map(|p| Persistence {
        action: p.action,
        folders: p.folders,
        shell: p.shell.unwrap_or_else(|| DEFAULT_PERSIST_SHELL.to_string()),
        no_provider: p.no_provider,
    });

    let mut tasks = Vec::with_capacity(raw.tasks.len());
    for (name, task) in raw.tasks {
        let task_path = format!("{}.tasks.{}", path, name);
        tasks.push(task.into_task(&name, Some(key), &task_path)?);
    }

    let image = Image {
        key: key.to_string(),
        image_name: naming.image_name,
        tag: naming.tag,
        image_index: naming.image_index,
        commands,
        context,
        volumes,
        links,
        env: raw.env.iter().map(|e| EnvSpec::parse(e)).collect(),
        ports,
        network: NetworkSpec {
            mode: raw.network.mode,
            hostname: raw.network.hostname,
            domainname: raw.network.domainname,
            dns: raw.network.dns,
            dns_search: raw.network.dns_search,
            extra_hosts: raw.network.extra_hosts,
            publish_all: raw.network.publish_all,
            disabled: raw.network.disabled,
        },
        resources,
        privileged: raw.privileged,
        user: raw.user,
        working_dir: raw.working_dir,
        dependency_options,
        wait_condition: raw.wait_condition.map(RawWaitCondition::compile),
        persistence,
        command,
        bash: raw.bash,
        container_id: None,
        container_name: None,
    };

    Ok((image, tasks))
}

fn parse_mounts(value: Option<&Value>, path: &str, config_root: &Path) -> Result<Vec<Mount>> {
    let path = format!("{}.volumes.mount", path);
    let mut mounts = Vec::new();
    let mut push = |host: &str, target: &str| -> Result<()> {
        let (container, read_only) = match target.rsplit_once(':') {
            Some((container, "ro")) => (container, true),
            Some((container, "rw")) => (container, false),
            _ => (target, false),
        };
        if container.is_empty() || host.is_empty() {
            return Err(HarpoonError::bad_value(
                &path,
                format!("'{}:{}' is not a valid mount", host, target),
            ));
        }
        mounts.push(Mount {
            host: resolve_host_path(host, config_root),
            container: container.to_string(),
            read_only,
        });
        Ok(())
    };

    match value {
        None | Some(Value::Null) => {}
        Some(Value::Mapping(mapping)) => {
            for (host, target) in mapping {
                match (host.as_str(), target.as_str()) {
                    (Some(host), Some(target)) => push(host, target)?,
                    _ => return Err(HarpoonError::bad_value(&path, "Expected host: container strings")),
                }
            }
        }
        Some(Value::Sequence(items)) => {
            for item in items {
                let Some((host, target)) = item.as_str().and_then(|s| s.split_once(':')) else {
                    return Err(HarpoonError::bad_value(&path, "Expected 'host:container[:ro]' strings"));
                };
                push(host, target)?;
            }
        }
        Some(_) => return Err(HarpoonError::bad_value(&path, "Expected a mapping or a list")),
    }
    Ok(mounts)
}

fn parse_size_value(value: Option<&Value>, path: &str) -> Result<Option<i64>> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(Value::Number(n)) => n
            .as_i64()
            .map(Some)
            .ok_or_else(|| HarpoonError::bad_value(path, "Expected an integer byte count")),
        Some(Value::String(s)) => parse_byte_size(s)
            .map(Some)
            .ok_or_else(|| HarpoonError::bad_value(path, format!("'{}' is not a valid size", s))),
        Some(_) => Err(HarpoonError::bad_value(path, "Expected a size such as 512m")),
    }
}
