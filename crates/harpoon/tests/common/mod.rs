#![allow(deprecated)]

use assert_cmd::Command;
use std::fs;
use std::path::PathBuf;
use tempfile::TempDir;

pub const CONFIG: &str = r#"
harpoon:
  image_name_prefix: demo
images:
  base:
    context: false
    commands:
      - FROM alpine:3.20
      - RUN apk add --no-cache bash
  app:
    context: false
    image_index: registry.example.com
    commands:
      - FROM base
      - [ADD, {content: "hello", dest: /etc/motd}]
      - CMD ["sh", "-c", "echo {$@}"]
    tasks:
      greet:
        action: run
        description: 挨拶する
        options:
          command: echo hello
tasks:
  build-app:
    action: make
    image: app
"#;

pub struct TestProject {
    pub root: TempDir,
}

impl TestProject {
    pub fn new() -> Self {
        let root = tempfile::tempdir().unwrap();
        Self { root }
    }

    pub fn with_config(content: &str) -> Self {
        let project = Self::new();
        project.write_config(content);
        project
    }

    pub fn write_config(&self, content: &str) {
        fs::write(self.config_path(), content).unwrap();
    }

    pub fn config_path(&self) -> PathBuf {
        self.root.path().join("harpoon.yml")
    }

    /// 設定ファイルを指定した harpoon コマンド
    pub fn harpoon(&self) -> Command {
        let mut cmd = Command::cargo_bin("harpoon").unwrap();
        cmd.env_remove("HARPOON_CONFIG")
            .env("NO_COLOR", "1")
            .env("HOME", self.root.path())
            .arg("--harpoon-config")
            .arg(self.config_path())
            .arg("--non-interactive");
        cmd
    }
}
