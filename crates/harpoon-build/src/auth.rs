//! レジストリ認証処理
//!
//! 設定ファイルの `authentication` セクションを優先し、なければ
//! Docker config.json から認証情報を取得します。

use crate::error::{BuildError, BuildResult};
use base64::Engine as _;
use harpoon_container::Credentials;
use harpoon_core::{AuthMethod, Authentication};
use serde::Deserialize;
use std::collections::{BTreeMap, HashMap};
use std::io::Write;
use std::path::PathBuf;
use std::process::{Command, Stdio};

/// 認証情報の用途
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Access {
    /// pull
    Reading,
    /// push
    Writing,
}

/// Docker config.json の構造
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct DockerConfig {
    /// 認証情報 (レジストリ -> AuthEntry)
    #[serde(default)]
    auths: HashMap<String, AuthEntry>,
    /// credential helper 名 (例: "osxkeychain", "desktop")
    #[serde(default)]
    creds_store: Option<String>,
}

/// 認証エントリ
#[derive(Debug, Deserialize)]
struct AuthEntry {
    /// Base64エンコードされた "username:password"
    auth: Option<String>,
}

/// credential helper からのレスポンス
#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct CredentialResponse {
    username: String,
    secret: String,
}

/// レジストリ認証を管理
#[derive(Debug, Clone)]
pub struct RegistryAuth {
    config_path: PathBuf,
    configured: BTreeMap<String, Authentication>,
}

impl Default for RegistryAuth {
    fn default() -> Self {
        Self::new(BTreeMap::new())
    }
}

impl RegistryAuth {
    /// 新しい RegistryAuth を作成
    ///
    /// config.json は `$DOCKER_CONFIG/config.json`、なければ ~/.docker/config.json
    pub fn new(configured: BTreeMap<String, Authentication>) -> Self {
        let config_path = std::env::var("DOCKER_CONFIG")
            .map(PathBuf::from)
            .unwrap_or_else(|_| {
                dirs::home_dir()
                    .map(|h| h.join(".docker"))
                    .unwrap_or_else(|| PathBuf::from(".docker"))
            })
            .join("config.json");

        Self {
            config_path,
            configured,
        }
    }

    /// 指定したパスの config.json を使用
    pub fn with_config_path(
        config_path: PathBuf,
        configured: BTreeMap<String, Authentication>,
    ) -> Self {
        Self {
            config_path,
            configured,
        }
    }

    /// イメージ名からレジストリの認証情報を取得
    ///
    /// * `Ok(Some(credentials))` - 認証情報が見つかった場合
    /// * `Ok(None)` - 認証情報が不要または見つからない場合
    pub fn get_credentials(&self, image: &str, access: Access) -> BuildResult<Option<Credentials>> {
        let registry = extract_registry(image);

        if let Some(method) = self.configured_method(image, &registry, access) {
            tracing::debug!(registry = %registry, ?access, "Using configured credentials");
            return resolve_method(method, &registry).map(Some);
        }

        // config.json が存在しない場合は認証なしで続行
        if !self.config_path.exists() {
            tracing::debug!("Docker config.json not found at {:?}", self.config_path);
            return Ok(None);
        }

        let config = self.load_docker_config()?;

        if let Some(auth_entry) = lookup_auth(&config.auths, &registry)
            && let Some(auth_b64) = &auth_entry.auth
            && let Some(creds) = decode_auth(auth_b64, &registry)?
        {
            tracing::debug!("Found credentials in auths for {}", registry);
            return Ok(Some(creds));
        }

        if let Some(helper) = &config.creds_store {
            tracing::debug!("Trying credential helper: {}", helper);
            if let Ok(Some(creds)) = get_from_helper(helper, &registry) {
                return Ok(Some(creds));
            }
        }

        tracing::debug!("No credentials found for {}", registry);
        Ok(None)
    }

    /// 最も長く一致する設定キーの認証方法
    fn configured_method(&self, image: &str, registry: &str, access: Access) -> Option<&AuthMethod> {
        self.configured
            .iter()
            .filter(|(key, _)| key.as_str() == registry || image.starts_with(key.as_str()))
            .max_by_key(|(key, _)| key.len())
            .and_then(|(_, auth)| match access {
                Access::Reading => auth.reading.as_ref(),
                Access::Writing => auth.writing.as_ref(),
            })
    }

    /// Docker config.json を読み込み
    fn load_docker_config(&self) -> BuildResult<DockerConfig> {
        let content =
            std::fs::read_to_string(&self.config_path).map_err(|e| BuildError::AuthFailed {
                registry: self.config_path.display().to_string(),
                message: format!("Failed to read config.json: {}", e),
            })?;

        serde_json::from_str(&content).map_err(|e| BuildError::AuthFailed {
            registry: self.config_path.display().to_string(),
            message: format!("Failed to parse config.json: {}", e),
        })
    }
}

/// イメージ名からレジストリを抽出
///
/// - `ghcr.io/org/app:tag` -> `ghcr.io`
/// - `myuser/app:tag` -> `docker.io`
/// - `localhost:5000/app` -> `localhost:5000`
pub fn extract_registry(image: &str) -> String {
    if let Some((first, _)) = image.split_once('/')
        && (first.contains('.') || first.contains(':') || first == "localhost")
    {
        return first.to_string();
    }
    "docker.io".to_string()
}

/// Docker Hub は `https://index.docker.io/v1/` で登録されている
fn lookup_auth<'a>(auths: &'a HashMap<String, AuthEntry>, registry: &str) -> Option<&'a AuthEntry> {
    auths.get(registry).or_else(|| {
        auths.iter().find_map(|(key, entry)| {
            let host = key
                .trim_start_matches("https://")
                .trim_start_matches("http://")
                .split('/')
                .next()
                .unwrap_or_default();
            let same = host == registry || (registry == "docker.io" && host == "index.docker.io");
            same.then_some(entry)
        })
    })
}

fn resolve_method(method: &AuthMethod, registry: &str) -> BuildResult<Credentials> {
    match method {
        AuthMethod::Plain { username, password } => Ok(Credentials {
            username: username.clone(),
            password: password.clone(),
            server_address: registry.to_string(),
        }),
        AuthMethod::Environment {
            username_env,
            password_env,
        } => {
            let read = |name: &str| {
                std::env::var(name).map_err(|_| BuildError::AuthFailed {
                    registry: registry.to_string(),
                    message: format!("環境変数 {} が設定されていません", name),
                })
            };
            Ok(Credentials {
                username: read(username_env)?,
                password: read(password_env)?,
                server_address: registry.to_string(),
            })
        }
    }
}

/// Base64エンコードされた認証情報をデコード
fn decode_auth(auth_b64: &str, registry: &str) -> BuildResult<Option<Credentials>> {
    let decoded = base64::engine::general_purpose::STANDARD
        .decode(auth_b64)
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to decode auth: {}", e),
        })?;

    let auth_str = String::from_utf8(decoded).map_err(|e| BuildError::AuthFailed {
        registry: registry.to_string(),
        message: format!("Invalid UTF-8 in auth: {}", e),
    })?;

    Ok(auth_str
        .split_once(':')
        .map(|(username, password)| Credentials {
            username: username.to_string(),
            password: password.to_string(),
            server_address: registry.to_string(),
        }))
}

/// credential helper から認証情報を取得
fn get_from_helper(helper: &str, registry: &str) -> BuildResult<Option<Credentials>> {
    let helper_cmd = format!("docker-credential-{}", helper);

    let mut child = Command::new(&helper_cmd)
        .arg("get")
        .stdin(Stdio::piped())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to run {}: {}", helper_cmd, e),
        })?;

    // レジストリ名を stdin に渡す
    if let Some(mut stdin) = child.stdin.take() {
        stdin.write_all(registry.as_bytes()).ok();
    }

    let output = child
        .wait_with_output()
        .map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Credential helper failed: {}", e),
        })?;

    if !output.status.success() {
        tracing::debug!(
            "Credential helper returned error for {}: {}",
            registry,
            String::from_utf8_lossy(&output.stderr)
        );
        return Ok(None);
    }

    let response: CredentialResponse =
        serde_json::from_slice(&output.stdout).map_err(|e| BuildError::AuthFailed {
            registry: registry.to_string(),
            message: format!("Failed to parse credential helper response: {}", e),
        })?;

    Ok(Some(Credentials {
        username: response.username,
        password: response.secret,
        server_address: registry.to_string(),
    }))
}
