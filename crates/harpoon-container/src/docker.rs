//! bollard による Docker エンジン実装

// Bollard 0.19 の非推奨APIを一時的に使用
#![allow(deprecated)]

use crate::converter::to_docker_config;
use crate::engine::{
    BuildMessage, BuildOptions, ContainerSpec, ContainerStatus, Credentials, Engine,
    ProgressMessage, split_reference,
};
use crate::error::{EngineError, EngineResult};
use async_trait::async_trait;
use bollard::Docker;
use bollard::auth::DockerCredentials;
use bollard::container::{AttachContainerResults, LogOutput};
use bollard::errors::Error as BollardError;
use bollard::exec::{CreateExecOptions, StartExecOptions, StartExecResults};
use bollard::image::{BuildImageOptions, CreateImageOptions, PushImageOptions};
use bollard::query_parameters::{
    AttachContainerOptions, CommitContainerOptions, DownloadFromContainerOptions,
    InspectContainerOptions, KillContainerOptions, ListImagesOptions, LogsOptions,
    RemoveContainerOptions, RemoveImageOptions, StartContainerOptions, StopContainerOptions,
    TagImageOptions, WaitContainerOptions,
};
use bytes::Bytes;
use futures_util::stream::{BoxStream, StreamExt};
use http_body_util::{Either, Full};
use std::collections::{BTreeMap, HashMap};
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::time::sleep;
use tracing::{debug, warn};

/// exec の終了を確認する間隔
const EXEC_POLL_INTERVAL: Duration = Duration::from_millis(100);

/// exec の終了を確認する回数の上限
const EXEC_POLL_ATTEMPTS: usize = 50;

/// 終了コードが得られなかった exec の扱い
const EXEC_UNKNOWN_EXIT: i64 = -1;

/// Docker デーモン
#[derive(Clone)]
pub struct DockerEngine {
    docker: Docker,
}

impl DockerEngine {
    /// `DOCKER_HOST` などの環境設定に従って接続し、疎通を確認する
    pub async fn connect() -> EngineResult<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        // 接続テスト
        docker
            .ping()
            .await
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok(Self { docker })
    }

    /// デーモンへの疎通を確認せずにクライアントを作る
    pub fn lazy() -> EngineResult<Self> {
        let docker = Docker::connect_with_defaults()
            .map_err(|e| EngineError::Transient(e.to_string()))?;
        Ok(Self { docker })
    }

    pub fn from_docker(docker: Docker) -> Self {
        Self { docker }
    }

    pub fn docker(&self) -> &Docker {
        &self.docker
    }
}

fn docker_credentials(credentials: Option<Credentials>) -> Option<DockerCredentials> {
    credentials.map(|c| DockerCredentials {
        username: Some(c.username),
        password: Some(c.password),
        serveraddress: Some(c.server_address),
        ..Default::default()
    })
}

/// 終了が確認できた exec だけ終了コードを信用する
fn exec_exit_code(running: Option<bool>, exit_code: Option<i64>) -> i64 {
    match (running, exit_code) {
        (Some(false), Some(code)) => code,
        _ => EXEC_UNKNOWN_EXIT,
    }
}

fn is_status(err: &BollardError, code: u16) -> bool {
    matches!(err, BollardError::DockerResponseServerError { status_code, .. } if *status_code == code)
}

#[async_trait]
impl Engine for DockerEngine {
    fn build_image<'a>(
        &'a self,
        context: Vec<u8>,
        tag: &'a str,
        options: &'a BuildOptions,
    ) -> BoxStream<'a, EngineResult<BuildMessage>> {
        tracing::info!("Building image: {}", tag);

        let build_options = BuildImageOptions::<String> {
            dockerfile: options.dockerfile.clone(),
            t: tag.to_string(),
            nocache: options.no_cache,
            rm: true,       // 中間コンテナを削除
            forcerm: false, // 失敗時の中間コンテナは調査用に残す
            pull: options.pull,
            ..Default::default()
        };
        debug!("Build options: {:?}", build_options);

        let body = Full::new(Bytes::from(context));
        self.docker
            .build_image(build_options, None, Some(Either::Left(body)))
            .map(|msg| {
                let info = msg.map_err(EngineError::from)?;
                let error = info.error.or_else(|| {
                    info.error_detail.map(|detail| {
                        detail
                            .message
                            .unwrap_or_else(|| "Unknown build error".to_string())
                    })
                });
                Ok(BuildMessage {
                    stream: info.stream,
                    status: info.status,
                    error,
                })
            })
            .boxed()
    }

    async fn image_id(&self, reference: &str) -> EngineResult<Option<String>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(image.id),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn image_tags(&self, reference: &str) -> EngineResult<Option<Vec<String>>> {
        match self.docker.inspect_image(reference).await {
            Ok(image) => Ok(Some(image.repo_tags.unwrap_or_default())),
            Err(e) if is_status(&e, 404) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_image(&self, reference: &str, force: bool) -> EngineResult<()> {
        let options = RemoveImageOptions {
            force,
            ..Default::default()
        };
        self.docker
            .remove_image(reference, Some(options), None)
            .await?;
        Ok(())
    }

    async fn tag_image(&self, source: &str, repo: &str, tag: &str) -> EngineResult<()> {
        let options = TagImageOptions {
            repo: Some(repo.to_string()),
            tag: Some(tag.to_string()),
        };
        self.docker.tag_image(source, Some(options)).await?;
        Ok(())
    }

    async fn dangling_images(&self) -> EngineResult<Vec<String>> {
        let mut filters = HashMap::new();
        filters.insert("dangling".to_string(), vec!["true".to_string()]);
        let options = ListImagesOptions {
            filters: Some(filters),
            ..Default::default()
        };
        let images = self.docker.list_images(Some(options)).await?;
        Ok(images.into_iter().map(|image| image.id).collect())
    }

    fn pull_image<'a>(
        &'a self,
        reference: &'a str,
        credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>> {
        // ダイジェスト指定は tag にそのまま渡せる
        let (image_name, tag) = split_reference(reference);
        let options = CreateImageOptions::<String> {
            from_image: image_name,
            tag,
            ..Default::default()
        };
        self.docker
            .create_image(Some(options), None, docker_credentials(credentials))
            .map(|info| {
                let info = info.map_err(EngineError::from)?;
                Ok(ProgressMessage {
                    id: info.id,
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                })
            })
            .boxed()
    }

    fn push_image<'a>(
        &'a self,
        reference: &'a str,
        credentials: Option<Credentials>,
    ) -> BoxStream<'a, EngineResult<ProgressMessage>> {
        let (image_name, tag) = split_reference(reference);
        let options = PushImageOptions::<String> { tag };
        self.docker
            .push_image(&image_name, Some(options), docker_credentials(credentials))
            .map(|info| {
                let info = info.map_err(EngineError::from)?;
                Ok(ProgressMessage {
                    id: None,
                    status: info.status,
                    progress: info.progress,
                    error: info.error,
                })
            })
            .boxed()
    }

    async fn create_container(&self, spec: &ContainerSpec) -> EngineResult<String> {
        let (config, options) = to_docker_config(spec);
        let response = self.docker.create_container(Some(options), config).await?;
        for warning in response.warnings {
            warn!(container = %spec.name, "{}", warning);
        }
        Ok(response.id)
    }

    async fn start_container(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .start_container(id, None::<StartContainerOptions>)
            .await
        {
            Ok(_) => Ok(()),
            // 既に起動している
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn start_attached(&self, id: &str, tty: bool) -> EngineResult<i64> {
        let options = AttachContainerOptions {
            stdin: true,
            stdout: true,
            stderr: true,
            stream: true,
            logs: true,
            detach_keys: None,
        };
        let AttachContainerResults {
            mut output,
            mut input,
        } = self.docker.attach_container(id, Some(options)).await?;

        self.start_container(id).await?;

        let raw_mode = tty && crossterm::terminal::enable_raw_mode().is_ok();

        // 端末の入力をコンテナに流す
        let stdin_task = tokio::spawn(async move {
            let mut stdin = tokio::io::stdin();
            let mut buf = [0u8; 1024];
            loop {
                match stdin.read(&mut buf).await {
                    Ok(0) | Err(_) => break,
                    Ok(n) => {
                        if input.write_all(&buf[..n]).await.is_err() {
                            break;
                        }
                    }
                }
            }
        });

        let mut stdout = tokio::io::stdout();
        let mut stderr = tokio::io::stderr();
        while let Some(chunk) = output.next().await {
            let written = match chunk {
                Ok(LogOutput::StdErr { message }) => stderr.write_all(&message).await,
                Ok(log) => stdout.write_all(&log.into_bytes()).await,
                Err(e) => {
                    warn!(container = id, "Attach stream ended: {}", e);
                    break;
                }
            };
            if written.is_err() {
                break;
            }
            let _ = stdout.flush().await;
        }

        stdin_task.abort();
        if raw_mode {
            let _ = crossterm::terminal::disable_raw_mode();
        }

        self.wait_container(id).await
    }

    async fn inspect_container(&self, id: &str) -> EngineResult<Option<ContainerStatus>> {
        let info = match self
            .docker
            .inspect_container(id, None::<InspectContainerOptions>)
            .await
        {
            Ok(info) => info,
            Err(e) if is_status(&e, 404) => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let state = info.state.unwrap_or_default();
        let mut host_ports = BTreeMap::new();
        if let Some(ports) = info.network_settings.and_then(|settings| settings.ports) {
            for (container_port, bindings) in ports {
                let port = bindings
                    .unwrap_or_default()
                    .into_iter()
                    .find_map(|binding| binding.host_port.and_then(|p| p.parse::<u16>().ok()));
                if let Some(port) = port {
                    host_ports.insert(container_port, port);
                }
            }
        }

        Ok(Some(ContainerStatus {
            id: info.id.unwrap_or_else(|| id.to_string()),
            name: info
                .name
                .map(|name| name.trim_start_matches('/').to_string())
                .unwrap_or_default(),
            running: state.running.unwrap_or(false),
            exit_code: state.exit_code,
            status: state.status.map(|s| s.to_string()).unwrap_or_default(),
            host_ports,
        }))
    }

    async fn stop_container(&self, id: &str, timeout_secs: i32) -> EngineResult<()> {
        let options = StopContainerOptions {
            t: Some(timeout_secs),
            signal: None,
        };
        match self.docker.stop_container(id, Some(options)).await {
            Ok(_) => Ok(()),
            // 既に停止している
            Err(e) if is_status(&e, 304) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn kill_container(&self, id: &str) -> EngineResult<()> {
        match self
            .docker
            .kill_container(id, None::<KillContainerOptions>)
            .await
        {
            Ok(_) => Ok(()),
            // 停止済みのコンテナは 409 になる
            Err(e) if is_status(&e, 409) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn remove_container(&self, id: &str, remove_volumes: bool) -> EngineResult<()> {
        let options = RemoveContainerOptions {
            force: true,
            v: remove_volumes,
            ..Default::default()
        };
        self.docker.remove_container(id, Some(options)).await?;
        Ok(())
    }

    async fn wait_container(&self, id: &str) -> EngineResult<i64> {
        let mut stream = self
            .docker
            .wait_container(id, None::<WaitContainerOptions>);
        let mut exit_code = 0;
        while let Some(result) = stream.next().await {
            match result {
                Ok(response) => exit_code = response.status_code,
                // 0 以外の終了はエラーとして返ってくる
                Err(BollardError::DockerContainerWaitError { code, .. }) => exit_code = code,
                Err(e) => return Err(e.into()),
            }
        }
        Ok(exit_code)
    }

    async fn exec(&self, id: &str, cmd: Vec<String>) -> EngineResult<i64> {
        let exec_config = CreateExecOptions {
            cmd: Some(cmd),
            attach_stdout: Some(true),
            attach_stderr: Some(true),
            ..Default::default()
        };
        let message = self.docker.create_exec(id, exec_config).await?;

        if let StartExecResults::Attached { mut output, .. } = self
            .docker
            .start_exec(&message.id, None::<StartExecOptions>)
            .await?
        {
            while let Some(chunk) = output.next().await {
                if let Ok(log) = chunk {
                    debug!(container = id, "{}", log.to_string().trim_end());
                }
            }
        }

        // ストリームが閉じた直後はまだ終了コードが確定していないことがある
        let mut inspect = self.docker.inspect_exec(&message.id).await?;
        for _ in 0..EXEC_POLL_ATTEMPTS {
            if inspect.running == Some(false) {
                break;
            }
            sleep(EXEC_POLL_INTERVAL).await;
            inspect = self.docker.inspect_exec(&message.id).await?;
        }
        Ok(exec_exit_code(inspect.running, inspect.exit_code))
    }

    async fn logs(&self, id: &str, tail: usize) -> EngineResult<Vec<String>> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            tail: tail.to_string(),
            follow: false,
            ..Default::default()
        };
        let mut logs = self.docker.logs(id, Some(options));
        let mut lines = Vec::new();
        while let Some(log) = logs.next().await {
            let log = log?;
            lines.extend(log.to_string().lines().map(String::from));
        }
        Ok(lines)
    }

    fn follow_logs<'a>(&'a self, id: &'a str) -> BoxStream<'a, EngineResult<String>> {
        let options = LogsOptions {
            stdout: true,
            stderr: true,
            follow: true,
            tail: "all".to_string(),
            ..Default::default()
        };
        self.docker
            .logs(id, Some(options))
            .map(|log| log.map(|l| l.to_string()).map_err(EngineError::from))
            .boxed()
    }

    async fn commit_container(
        &self,
        id: &str,
        reference: &str,
        cmd: Option<Vec<String>>,
    ) -> EngineResult<()> {
        let (repo, tag) = split_reference(reference);
        let options = CommitContainerOptions {
            container: Some(id.to_string()),
            repo: Some(repo),
            tag: Some(tag),
            pause: true,
            ..Default::default()
        };
        let config = bollard::models::ContainerConfig {
            cmd,
            ..Default::default()
        };
        self.docker.commit_container(options, config).await?;
        Ok(())
    }

    async fn download(&self, id: &str, path: &str) -> EngineResult<Vec<u8>> {
        let options = DownloadFromContainerOptions {
            path: path.to_string(),
        };
        let mut stream = self.docker.download_from_container(id, Some(options));
        let mut data = Vec::new();
        while let Some(chunk) = stream.next().await {
            data.extend_from_slice(&chunk?);
        }
        Ok(data)
    }

    async fn create_network(&self, name: &str) -> EngineResult<()> {
        let network_config = bollard::models::NetworkCreateRequest {
            name: name.to_string(),
            driver: Some("bridge".to_string()),
            ..Default::default()
        };
        self.docker.create_network(network_config).await?;
        Ok(())
    }

    async fn connect_network(
        &self,
        network: &str,
        container: &str,
        aliases: &[String],
    ) -> EngineResult<()> {
        let request = bollard::models::NetworkConnectRequest {
            container: Some(container.to_string()),
            endpoint_config: Some(bollard::models::EndpointSettings {
                aliases: (!aliases.is_empty()).then(|| aliases.to_vec()),
                ..Default::default()
            }),
        };
        self.docker.connect_network(network, request).await?;
        Ok(())
    }

    async fn remove_network(&self, name: &str) -> EngineResult<()> {
        self.docker.remove_network(name).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exec_exit_code_requires_finished_exec() {
        assert_eq!(exec_exit_code(Some(false), Some(0)), 0);
        assert_eq!(exec_exit_code(Some(false), Some(7)), 7);
        assert_eq!(exec_exit_code(Some(true), None), EXEC_UNKNOWN_EXIT);
        assert_eq!(exec_exit_code(Some(true), Some(0)), EXEC_UNKNOWN_EXIT);
        assert_eq!(exec_exit_code(Some(false), None), EXEC_UNKNOWN_EXIT);
        assert_eq!(exec_exit_code(None, None), EXEC_UNKNOWN_EXIT);
    }

    #[tokio::test]
    #[ignore] // Dockerが必要
    async fn test_inspect_missing_container() {
        let engine = DockerEngine::connect().await.unwrap();
        let status = engine
            .inspect_container("harpoon-no-such-container")
            .await
            .unwrap();
        assert!(status.is_none());
    }

    #[tokio::test]
    #[ignore] // Dockerが必要
    async fn test_missing_image_has_no_id() {
        let engine = DockerEngine::connect().await.unwrap();
        let id = engine.image_id("harpoon/no-such-image:nope").await.unwrap();
        assert_eq!(id, None);
    }
}
