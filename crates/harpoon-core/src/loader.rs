//! 設定ローダー
//!
//! ファイル読み込み、ホーム設定とのマージ、`__images_from__` の展開、パースを統合

use crate::error::{HarpoonError, Result};
use crate::model::HarpoonConfig;
use crate::parser::parse_config;
use serde_yaml::{Mapping, Value};
use std::path::{Path, PathBuf};
use tracing::{debug, info, instrument};

/// 設定ファイルを指定する環境変数
pub const CONFIG_ENV: &str = "HARPOON_CONFIG";

/// ホームディレクトリのユーザー設定ファイル名
pub const HOME_CONFIG_NAME: &str = ".harpoonrc.yml";

/// カレントディレクトリで探すファイル名
const DEFAULT_CONFIG_NAMES: &[&str] = &["harpoon.yml", "harpoon.yaml"];

/// `images` の下で別ディレクトリのイメージを取り込む特殊キー
const IMAGES_FROM: &str = "__images_from__";

/// 読み込み時の上書き
#[derive(Debug, Clone, Default)]
pub struct LoadOptions {
    /// `--` 以降の引数（`{$@}`）
    pub extra: String,
    /// `--tag`
    pub tag: Option<String>,
    /// 下敷きにするユーザー設定
    pub home_config: Option<PathBuf>,
}

impl LoadOptions {
    /// `~/.harpoonrc.yml` があれば使う
    pub fn with_home_config(mut self) -> Self {
        self.home_config = dirs::home_dir()
            .map(|home| home.join(HOME_CONFIG_NAME))
            .filter(|path| path.is_file());
        self
    }
}

/// 設定ファイルを探す
///
/// 以下の優先順位:
/// 1. 明示的な指定（`--harpoon-config` / `HARPOON_CONFIG`）
/// 2. カレントディレクトリの harpoon.yml, harpoon.yaml
pub fn find_config_file(explicit: Option<&Path>) -> Result<PathBuf> {
    if let Some(path) = explicit {
        if path.is_file() {
            return Ok(path.to_path_buf());
        }
        return Err(HarpoonError::bad_config(format!(
            "Configuration file {} does not exist",
            path.display()
        )));
    }

    let current_dir = std::env::current_dir().map_err(|e| HarpoonError::Io {
        path: PathBuf::from("."),
        message: e.to_string(),
    })?;
    for name in DEFAULT_CONFIG_NAMES {
        let path = current_dir.join(name);
        if path.is_file() {
            return Ok(path);
        }
    }

    Err(HarpoonError::bad_config(format!(
        "No configuration file was given; use --harpoon-config or set {}",
        CONFIG_ENV
    )))
}

/// 設定ファイルを読み込んで型付きの設定を生成
///
/// 以下の処理を実行:
/// 1. YAML の読み込み
/// 2. ホーム設定を下敷きにマージ
/// 3. `__images_from__` の展開
/// 4. テンプレート展開とパース
#[instrument(skip(options), fields(path = %path.display()))]
pub fn load_config(path: &Path, options: &LoadOptions) -> Result<HarpoonConfig> {
    info!("Loading configuration");

    // 1. 読み込み
    debug!("Step 1: Reading file");
    let mut root = read_yaml(path)?;

    let config_root = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("."));
    let config_root = config_root.canonicalize().unwrap_or(config_root);

    // 2. ホーム設定
    if let Some(home) = &options.home_config {
        debug!(home = %home.display(), "Step 2: Merging home configuration");
        let base = read_yaml(home)?;
        root = deep_merge(base, root);
    }

    // 3. __images_from__
    debug!("Step 3: Expanding {}", IMAGES_FROM);
    expand_images_from(&mut root, &config_root)?;

    // 4. パース
    debug!("Step 4: Parsing");
    let config = parse_config(root, &config_root, options)?;
    info!(
        images = config.images.len(),
        tasks = config.tasks.len(),
        "Configuration loaded successfully"
    );
    Ok(config)
}

/// 文字列から読み込む（テスト用）
pub fn load_config_str(yaml: &str, config_root: &Path, options: &LoadOptions) -> Result<HarpoonConfig> {
    let mut root: Value = serde_yaml::from_str(yaml)?;
    expand_images_from(&mut root, config_root)?;
    parse_config(root, config_root, options)
}

fn read_yaml(path: &Path) -> Result<Value> {
    let content = std::fs::read_to_string(path).map_err(|e| HarpoonError::Io {
        path: path.to_path_buf(),
        message: e.to_string(),
    })?;
    if content.trim().is_empty() {
        return Ok(Value::Mapping(Mapping::new()));
    }
    Ok(serde_yaml::from_str(&content)?)
}

/// マップは再帰的にマージし、それ以外は上書き側を採用
pub fn deep_merge(base: Value, overlay: Value) -> Value {
    match (base, overlay) {
        (Value::Mapping(mut base), Value::Mapping(overlay)) => {
            for (key, value) in overlay {
                let merged = match base.remove(&key) {
                    Some(existing) => deep_merge(existing, value),
                    None => value,
                };
                base.insert(key, merged);
            }
            Value::Mapping(base)
        }
        (_, overlay) => overlay,
    }
}

/// `images.__images_from__` のディレクトリから `.yml` / `.yaml` を取り込む
///
/// ファイル名（拡張子なし）がイメージキーになる。設定ファイル側の定義が優先。
fn expand_images_from(root: &mut Value, config_root: &Path) -> Result<()> {
    let Some(Value::Mapping(images)) = root.get_mut("images") else {
        return Ok(());
    };
    let Some(spec) = images.remove(IMAGES_FROM) else {
        return Ok(());
    };

    let dirs: Vec<String> = match spec {
        Value::String(dir) => vec![dir],
        Value::Sequence(_) => serde_yaml::from_value(spec)
            .map_err(|e| HarpoonError::bad_value(format!("images.{}", IMAGES_FROM), e.to_string()))?,
        _ => {
            return Err(HarpoonError::bad_value(
                format!("images.{}", IMAGES_FROM),
                "Expected a path or a list of paths",
            ));
        }
    };

    for dir in dirs {
        let dir = crate::parser::resolve_host_path(&dir, config_root);
        let entries = std::fs::read_dir(&dir).map_err(|e| HarpoonError::Io {
            path: dir.clone(),
            message: e.to_string(),
        })?;

        let mut files: Vec<PathBuf> = entries
            .filter_map(|entry| entry.ok().map(|e| e.path()))
            .filter(|path| {
                path.is_file()
                    && matches!(
                        path.extension().and_then(|e| e.to_str()),
                        Some("yml") | Some("yaml")
                    )
            })
            .collect();
        files.sort();

        for file in files {
            let Some(key) = file.file_stem().and_then(|s| s.to_str()) else {
                continue;
            };
            debug!(image = key, file = %file.display(), "Importing image definition");
            let imported = read_yaml(&file)?;
            let key = Value::String(key.to_string());
            let merged = match images.remove(&key) {
                Some(existing) => deep_merge(imported, existing),
                None => imported,
            };
            images.insert(key, merged);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serial_test::serial;
    use std::fs;
    use tempfile::TempDir;

    #[test]
    fn test_deep_merge() {
        let base: Value = serde_yaml::from_str("a: {x: 1, y: 2}\nb: [1]").unwrap();
        let overlay: Value = serde_yaml::from_str("a: {y: 3}\nb: [2]").unwrap();
        let merged = deep_merge(base, overlay);

        assert_eq!(merged["a"]["x"], Value::from(1));
        assert_eq!(merged["a"]["y"], Value::from(3));
        assert_eq!(merged["b"], serde_yaml::from_str::<Value>("[2]").unwrap());
    }

    #[test]
    fn test_images_from_directory() {
        let temp = TempDir::new().unwrap();
        let images_dir = temp.path().join("images");
        fs::create_dir(&images_dir).unwrap();
        fs::write(images_dir.join("db.yml"), "commands: ['FROM postgres:16']").unwrap();
        fs::write(images_dir.join("notes.txt"), "ignored").unwrap();

        let config_path = temp.path().join("harpoon.yml");
        fs::write(
            &config_path,
            "images:\n  __images_from__: images\n  app:\n    commands: ['FROM db']\n",
        )
        .unwrap();

        let config = load_config(&config_path, &LoadOptions::default()).unwrap();
        assert_eq!(config.images.keys(), vec!["app", "db"]);
    }

    #[test]
    fn test_home_config_is_merged_underneath() {
        let temp = TempDir::new().unwrap();
        let home = temp.path().join("home.yml");
        fs::write(&home, "harpoon:\n  image_name_prefix: mine\n  keep_replaced: true\n").unwrap();

        let config_path = temp.path().join("harpoon.yml");
        fs::write(
            &config_path,
            "harpoon:\n  keep_replaced: false\nimages:\n  app:\n    commands: ['FROM scratch']\n",
        )
        .unwrap();

        let options = LoadOptions {
            home_config: Some(home),
            ..Default::default()
        };
        let config = load_config(&config_path, &options).unwrap();
        assert!(!config.harpoon.keep_replaced);
        assert_eq!(config.images.require("app").unwrap().image_name, "mine-app");
    }

    #[test]
    #[serial]
    fn test_find_config_file_in_current_dir() {
        let temp = TempDir::new().unwrap();
        let original_dir = std::env::current_dir().unwrap();

        std::env::set_current_dir(temp.path()).unwrap();
        assert!(find_config_file(None).is_err());

        fs::write(temp.path().join("harpoon.yml"), "images: {}").unwrap();
        let found = find_config_file(None);
        std::env::set_current_dir(original_dir).unwrap();

        assert!(found.unwrap().ends_with("harpoon.yml"));
    }

    #[test]
    fn test_missing_explicit_file() {
        let err = find_config_file(Some(Path::new("/nonexistent/harpoon.yml"))).unwrap_err();
        assert!(matches!(err, HarpoonError::BadConfiguration { .. }));
    }
}
