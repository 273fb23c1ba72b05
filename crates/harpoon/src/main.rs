mod actions;
mod tasks;

use actions::{Harpoon, Settings};
use clap::error::ErrorKind;
use clap::{CommandFactory, Parser};
use colored::Colorize;
use harpoon_build::{BuildError, RegistryAuth};
use harpoon_container::{
    ContainerError, DockerEngine, Engine, Intervener, NoIntervention, ShellIntervener,
};
use harpoon_core::{
    CONFIG_ENV, EnvSpec, HarpoonConfig, LoadOptions, find_config_file, load_config,
};
use std::io::IsTerminal;
use std::path::PathBuf;
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

/// ユーザーが中断したときの終了コード
const EXIT_USER_QUIT: i32 = 130;

#[derive(Parser, Debug)]
#[command(name = "harpoon", version)]
#[command(about = "依存し合うコンテナイメージを1つの YAML からビルド・実行・配布する", long_about = None)]
struct Cli {
    /// 実行するタスク（make, run, make-all, list-tasks など）
    task: Option<String>,
    /// 対象のイメージキー（container-manager では待ち受けアドレス）
    image: Option<String>,

    /// 実行するタスク（位置引数の代わり）
    #[arg(long = "task", conflicts_with = "task", hide = true)]
    task_flag: Option<String>,
    /// 対象のイメージキー（位置引数の代わり）
    #[arg(long = "image", conflicts_with = "image", hide = true)]
    image_flag: Option<String>,

    /// 設定ファイル（デフォルト: ./harpoon.yml）
    #[arg(long, env = CONFIG_ENV, value_name = "FILE")]
    harpoon_config: Option<PathBuf>,

    /// デバッグログを表示
    #[arg(short, long, conflicts_with = "silent")]
    verbose: bool,
    /// エラー以外のログを表示しない
    #[arg(short, long)]
    silent: bool,
    /// 端末での対話を行わない
    #[arg(long)]
    non_interactive: bool,

    /// 実行するコマンドを上書き
    #[arg(long, conflicts_with = "bash")]
    command: Option<String>,
    /// `/bin/bash -c` で実行するコマンド
    #[arg(long)]
    bash: Option<String>,
    /// 環境変数（NAME, NAME=value, NAME:default）
    #[arg(short, long, value_name = "ENV")]
    env: Vec<String>,

    /// 置き換えられた古いイメージを残す
    #[arg(long)]
    keep_replaced: bool,
    /// 失敗時に介入シェルを開かない
    #[arg(long)]
    no_intervention: bool,
    /// ビルド出力を隠してスピナーを表示
    #[arg(long)]
    silent_build: bool,
    /// イメージのタグを上書き
    #[arg(long)]
    tag: Option<String>,
    /// pull できないイメージを警告に留める
    #[arg(long)]
    ignore_missing: bool,
    /// make-all の後で push 可能なイメージを push
    #[arg(long)]
    do_push: bool,
    /// 依存コンテナを起動しない
    #[arg(long)]
    flat: bool,
    /// 終了したコンテナとボリュームを残す
    #[arg(long)]
    no_cleanup: bool,
    /// retrieve で取り出すイメージ内のパス
    #[arg(long, value_name = "PATH")]
    artifact: Option<String>,
    /// retrieve の出力先
    #[arg(short, long, env = "FILENAME", value_name = "FILENAME")]
    output: Option<PathBuf>,
    /// container-manager の待ち受けアドレスを書き出すファイル
    #[arg(long, value_name = "FILE")]
    port_file: Option<PathBuf>,

    /// `{$@}` に展開される追加の引数
    #[arg(last = true)]
    extra: Vec<String>,
}

impl Cli {
    fn apply(&self, config: &mut HarpoonConfig) {
        let options = &mut config.harpoon;
        if self.non_interactive || !std::io::stdin().is_terminal() {
            options.interactive = false;
        }
        options.no_intervention |= self.no_intervention;
        options.silent_build |= self.silent_build;
        options.keep_replaced |= self.keep_replaced;
        options.ignore_missing |= self.ignore_missing;
        options.do_push |= self.do_push;
        options.flat |= self.flat;
        options.no_cleanup |= self.no_cleanup;
        if let Some(tag) = &self.tag {
            options.tag = Some(tag.clone());
        }
        if let Some(artifact) = &self.artifact {
            options.artifact = Some(artifact.clone());
        }
        if let Some(command) = &self.command {
            options.command = Some(command.clone());
            options.bash = None;
        }
        if let Some(bash) = &self.bash {
            options.bash = Some(bash.clone());
            options.command = None;
        }
        options.env.extend(self.env.iter().map(|spec| EnvSpec::parse(spec)));
    }

    fn log_filter(&self) -> EnvFilter {
        if self.verbose {
            EnvFilter::new("debug")
        } else if self.silent {
            EnvFilter::new("error")
        } else {
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    tracing_subscriber::fmt()
        .with_env_filter(cli.log_filter())
        .with_writer(std::io::stderr)
        .init();

    let code = match run(cli).await {
        Ok(code) => code,
        Err(e) => report(&e),
    };
    std::process::exit(code);
}

async fn run(cli: Cli) -> anyhow::Result<i32> {
    let Some(task) = cli.task.clone().or_else(|| cli.task_flag.clone()) else {
        Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "タスクを指定してください（harpoon list-tasks で一覧を表示）",
            )
            .exit();
    };
    let image = cli.image.clone().or_else(|| cli.image_flag.clone());

    let config_path = find_config_file(cli.harpoon_config.as_deref())?;
    let load_options = LoadOptions {
        extra: cli.extra.join(" "),
        tag: cli.tag.clone(),
        home_config: None,
    }
    .with_home_config();
    let mut config = load_config(&config_path, &load_options)?;
    cli.apply(&mut config);

    let invocation = tasks::resolve(&task, image, &config.tasks)?;
    invocation.apply(&mut config.harpoon);

    let engine: Arc<dyn Engine> = if invocation.builtin.needs_engine() {
        Arc::new(DockerEngine::connect().await?)
    } else {
        Arc::new(DockerEngine::lazy()?)
    };
    let intervener: Arc<dyn Intervener> = if config.harpoon.intervention_enabled() {
        Arc::new(ShellIntervener::default())
    } else {
        Arc::new(NoIntervention)
    };
    let auth = RegistryAuth::new(config.authentication.clone());
    let settings = Settings {
        port_file: cli.port_file.clone(),
        output_file: cli.output.clone(),
    };

    let harpoon = Harpoon::new(config, engine, intervener, auth, settings);
    harpoon.execute(&invocation).await
}

/// エラーを表示して終了コードを返す
fn report(error: &anyhow::Error) -> i32 {
    if is_user_quit(error) {
        eprintln!("{}", "⚠ 中断しました".yellow());
        return EXIT_USER_QUIT;
    }

    let message = match error.downcast_ref::<BuildError>() {
        Some(build_error) => build_error.user_message(),
        None => format!("{:#}", error),
    };
    eprintln!("{} {}", "Error:".red().bold(), message);
    1
}

fn is_user_quit(error: &anyhow::Error) -> bool {
    if let Some(ContainerError::UserQuit) = error.downcast_ref::<ContainerError>() {
        return true;
    }
    error
        .downcast_ref::<BuildError>()
        .is_some_and(BuildError::is_user_quit)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_cli_flags_override_options() {
        let cli = Cli::parse_from([
            "harpoon",
            "run",
            "app",
            "--non-interactive",
            "--bash",
            "echo hi",
            "--env",
            "A=1",
            "--env",
            "B",
            "--tag",
            "v2",
            "--flat",
            "--",
            "x",
            "y",
        ]);
        let mut config = HarpoonConfig {
            config_root: PathBuf::from("."),
            harpoon: Default::default(),
            images: Default::default(),
            authentication: Default::default(),
            tasks: Default::default(),
        };
        config.harpoon.command = Some("ls".into());
        cli.apply(&mut config);

        let options = &config.harpoon;
        assert!(!options.interactive);
        assert!(options.flat);
        assert_eq!(options.bash.as_deref(), Some("echo hi"));
        assert_eq!(options.command, None);
        assert_eq!(options.tag.as_deref(), Some("v2"));
        assert_eq!(options.env, vec![EnvSpec::parse("A=1"), EnvSpec::parse("B")]);
        assert_eq!(cli.extra, vec!["x", "y"]);
    }

    #[test]
    fn test_task_flag_alternative() {
        let cli = Cli::parse_from(["harpoon", "--task", "make", "--image", "app"]);
        assert_eq!(cli.task, None);
        assert_eq!(cli.task_flag.as_deref(), Some("make"));
        assert_eq!(cli.image_flag.as_deref(), Some("app"));
    }

    #[test]
    fn test_user_quit_detection() {
        let error = anyhow::Error::from(ContainerError::UserQuit);
        assert!(is_user_quit(&error));
        assert_eq!(report(&error), EXIT_USER_QUIT);

        let error = anyhow::Error::from(BuildError::Container(ContainerError::UserQuit));
        assert!(is_user_quit(&error));

        let error = anyhow::anyhow!("boom");
        assert!(!is_user_quit(&error));
        assert_eq!(report(&error), 1);
    }
}
