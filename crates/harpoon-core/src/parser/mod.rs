//! 設定ツリーのパース
//!
//! マージ済みの YAML を型付きの `HarpoonConfig` に正規化します。

mod image;

#[cfg(test)]
mod tests;

use crate::error::{HarpoonError, Result};
use crate::loader::LoadOptions;
use crate::model::{
    AuthMethod, Authentication, ContextSpec, HarpoonConfig, HarpoonOptions, ImageSet, ImageTask,
    MtimeMode,
};
use crate::template::{ImageNames, TemplateProcessor};
use image::{RawNaming, RawTask, parse_image};
use serde::Deserialize;
use serde_yaml::Value;
use std::collections::{BTreeMap, BTreeSet};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

pub(crate) fn bad_value_from(path: &str, e: serde_yaml::Error) -> HarpoonError {
    HarpoonError::bad_value(path, e.to_string())
}

/// `~` と相対パスを解決
pub(crate) fn resolve_host_path(path: &str, config_root: &Path) -> PathBuf {
    if let Some(rest) = path.strip_prefix("~/")
        && let Some(home) = dirs::home_dir()
    {
        return home.join(rest);
    }
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        config_root.join(path)
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawContext {
    enabled: Option<bool>,
    #[serde(alias = "parent_dir")]
    root_dir: Option<String>,
    include: Vec<String>,
    exclude: Vec<String>,
    #[serde(alias = "use_git")]
    use_vcs: bool,
    #[serde(alias = "use_gitignores")]
    use_vcs_ignore: bool,
    #[serde(alias = "use_git_timestamps")]
    use_vcs_mtimes: Option<Value>,
}

/// コンテキスト設定をパース
///
/// 省略時は設定ファイルのディレクトリ全体、`false` で無効。
pub fn parse_context_spec(value: Option<&Value>, path: &str, config_root: &Path) -> Result<ContextSpec> {
    let raw = match value {
        None | Some(Value::Null) | Some(Value::Bool(true)) => return Ok(ContextSpec::new(config_root)),
        Some(Value::Bool(false)) => return Ok(ContextSpec::disabled(config_root)),
        Some(value @ Value::Mapping(_)) => serde_yaml::from_value::<RawContext>(value.clone())
            .map_err(|e| bad_value_from(path, e))?,
        Some(_) => {
            return Err(HarpoonError::bad_value(
                path,
                "Expected a boolean or a mapping",
            ));
        }
    };

    let use_vcs_mtimes = match raw.use_vcs_mtimes {
        None | Some(Value::Bool(false)) => MtimeMode::Off,
        Some(Value::Bool(true)) => MtimeMode::All,
        Some(value @ Value::Sequence(_)) => MtimeMode::Only(
            serde_yaml::from_value(value)
                .map_err(|e| bad_value_from(&format!("{}.use_vcs_mtimes", path), e))?,
        ),
        Some(_) => {
            return Err(HarpoonError::bad_value(
                format!("{}.use_vcs_mtimes", path),
                "Expected a boolean or a list of globs",
            ));
        }
    };

    Ok(ContextSpec {
        enabled: raw.enabled.unwrap_or(true),
        root_dir: raw
            .root_dir
            .map(|dir| resolve_host_path(&dir, config_root))
            .unwrap_or_else(|| config_root.to_path_buf()),
        include: raw.include,
        exclude: raw.exclude,
        use_vcs: raw.use_vcs,
        use_vcs_ignore: raw.use_vcs_ignore,
        use_vcs_mtimes,
    })
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct RawHarpoon {
    interactive: Option<bool>,
    no_intervention: bool,
    silent_build: bool,
    keep_replaced: bool,
    tag: Option<String>,
    image_name_prefix: Option<String>,
    ignore_missing: bool,
    flat: bool,
    no_cleanup: bool,
    #[serde(flatten)]
    unknown: BTreeMap<String, Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default, deny_unknown_fields)]
struct RawAuthentication {
    reading: Option<RawAuthMethod>,
    writing: Option<RawAuthMethod>,
}

#[derive(Debug, Deserialize)]
#[serde(deny_unknown_fields)]
struct RawAuthMethod {
    #[serde(rename = "use")]
    method: String,
    username: Option<String>,
    password: Option<String>,
    username_env: Option<String>,
    password_env: Option<String>,
}

impl RawAuthMethod {
    fn into_method(self, path: &str) -> Result<AuthMethod> {
        let missing = |field: &str| HarpoonError::bad_value(path, format!("'{}' is required", field));
        match self.method.as_str() {
            "plain" => Ok(AuthMethod::Plain {
                username: self.username.ok_or_else(|| missing("username"))?,
                password: self.password.ok_or_else(|| missing("password"))?,
            }),
            "environment" => Ok(AuthMethod::Environment {
                username_env: self.username_env.ok_or_else(|| missing("username_env"))?,
                password_env: self.password_env.ok_or_else(|| missing("password_env"))?,
            }),
            other => Err(HarpoonError::bad_value(
                format!("{}.use", path),
                format!("Unknown authentication method '{}' (expected plain or environment)", other),
            )),
        }
    }
}

fn mapping_entries(value: Option<&Value>, path: &str) -> Result<Vec<(String, Value)>> {
    match value {
        None | Some(Value::Null) => Ok(Vec::new()),
        Some(Value::Mapping(mapping)) => mapping
            .iter()
            .map(|(key, value)| match key.as_str() {
                Some(key) => Ok((key.to_string(), value.clone())),
                None => Err(HarpoonError::bad_value(path, "Keys must be strings")),
            })
            .collect(),
        Some(_) => Err(HarpoonError::bad_value(path, "Expected a mapping")),
    }
}

/// マージ済みの設定ツリーを型付きの設定に変換
pub fn parse_config(root: Value, config_root: &Path, options: &LoadOptions) -> Result<HarpoonConfig> {
    let Value::Mapping(_) = &root else {
        return Err(HarpoonError::bad_config("The configuration must be a mapping"));
    };

    for key in root.as_mapping().into_iter().flat_map(|m| m.keys()) {
        match key.as_str() {
            Some("images" | "harpoon" | "authentication" | "tasks") => {}
            Some(other) => warn!(key = other, "Ignoring unknown top level configuration key"),
            None => return Err(HarpoonError::bad_config("Top level keys must be strings")),
        }
    }

    // harpoon セクション
    let raw_harpoon: RawHarpoon = match root.get("harpoon") {
        None | Some(Value::Null) => RawHarpoon::default(),
        Some(value) => serde_yaml::from_value(value.clone()).map_err(|e| bad_value_from("harpoon", e))?,
    };
    for key in raw_harpoon.unknown.keys() {
        warn!(key = %key, "Ignoring unknown harpoon option");
    }
    let harpoon = HarpoonOptions {
        interactive: raw_harpoon.interactive.unwrap_or(true),
        no_intervention: raw_harpoon.no_intervention,
        silent_build: raw_harpoon.silent_build,
        keep_replaced: raw_harpoon.keep_replaced,
        tag: options.tag.clone().or(raw_harpoon.tag),
        image_name_prefix: raw_harpoon.image_name_prefix,
        extra: options.extra.clone(),
        ignore_missing: raw_harpoon.ignore_missing,
        flat: raw_harpoon.flat,
        no_cleanup: raw_harpoon.no_cleanup,
        ..HarpoonOptions::default()
    };

    // イメージ名を決めてからテンプレートを展開する
    let raw_images = mapping_entries(root.get("images"), "images")?;
    let known: BTreeSet<String> = raw_images.iter().map(|(key, _)| key.clone()).collect();
    for key in &known {
        if key.contains('.') {
            return Err(HarpoonError::bad_value(
                format!("images.{}", key),
                "Image keys may not contain '.'",
            ));
        }
    }

    let mut processor = TemplateProcessor::new(config_root, options.extra.clone());
    let mut namings = BTreeMap::new();
    for (key, value) in &raw_images {
        let naming: RawNaming = serde_yaml::from_value(value.clone())
            .map_err(|e| bad_value_from(&format!("images.{}", key), e))?;
        let naming = naming.resolve(
            key,
            harpoon.image_name_prefix.as_deref(),
            harpoon.tag.as_deref(),
        );
        processor.add_image(
            key.clone(),
            ImageNames {
                image_name: naming.image_name.clone(),
                tag: naming.tag.clone(),
            },
        );
        namings.insert(key.clone(), naming);
    }

    let mut images = ImageSet::new();
    let mut tasks: BTreeMap<String, ImageTask> = BTreeMap::new();
    for (key, mut value) in raw_images {
        processor.render_value(&mut value)?;
        let Some(naming) = namings.remove(&key) else {
            continue;
        };
        let (image, image_tasks) = parse_image(&key, value, naming, &known, config_root)?;
        debug!(image = %key, tag = %image.image_tag(), commands = image.commands.len(), "Parsed image");
        for task in image_tasks {
            if tasks.contains_key(&task.name) {
                return Err(HarpoonError::bad_config(format!(
                    "Task '{}' is defined more than once",
                    task.name
                )));
            }
            tasks.insert(task.name.clone(), task);
        }
        images.insert(image);
    }

    for (name, mut value) in mapping_entries(root.get("tasks"), "tasks")? {
        processor.render_value(&mut value)?;
        let path = format!("tasks.{}", name);
        let raw: RawTask = serde_yaml::from_value(value).map_err(|e| bad_value_from(&path, e))?;
        let task = raw.into_task(&name, None, &path)?;
        if let Some(image) = &task.image
            && !images.contains(image)
        {
            return Err(HarpoonError::bad_value(
                format!("{}.image", path),
                format!("'{}' is not an image in the configuration", image),
            ));
        }
        if tasks.insert(name.clone(), task).is_some() {
            return Err(HarpoonError::bad_config(format!(
                "Task '{}' is defined more than once",
                name
            )));
        }
    }

    let mut authentication = BTreeMap::new();
    for (registry, value) in mapping_entries(root.get("authentication"), "authentication")? {
        let path = format!("authentication.{}", registry);
        let raw: RawAuthentication = serde_yaml::from_value(value).map_err(|e| bad_value_from(&path, e))?;
        authentication.insert(
            registry,
            Authentication {
                reading: raw
                    .reading
                    .map(|m| m.into_method(&format!("{}.reading", path)))
                    .transpose()?,
                writing: raw
                    .writing
                    .map(|m| m.into_method(&format!("{}.writing", path)))
                    .transpose()?,
            },
        );
    }

    Ok(HarpoonConfig {
        config_root: config_root.to_path_buf(),
        harpoon,
        images,
        authentication,
        tasks,
    })
}
