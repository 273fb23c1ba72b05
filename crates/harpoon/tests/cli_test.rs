#![allow(deprecated)] // TODO: cargo_bin → cargo_bin_cmd! へ移行

mod common;

use assert_cmd::Command;
use common::{CONFIG, TestProject};
use predicates::prelude::*;

/// CLIヘルプが正しく表示されることを確認
#[test]
fn test_cli_help() {
    let mut cmd = Command::cargo_bin("harpoon").unwrap();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--harpoon-config"))
        .stdout(predicate::str::contains("--silent-build"))
        .stdout(predicate::str::contains("--no-intervention"));
}

#[test]
fn test_cli_version() {
    let mut cmd = Command::cargo_bin("harpoon").unwrap();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

/// 引数の誤りは終了コード 2
#[test]
fn test_parse_error_exits_with_two() {
    let mut cmd = Command::cargo_bin("harpoon").unwrap();
    cmd.arg("--no-such-flag").assert().code(2);

    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .args(["--command", "ls", "--bash", "ls", "run", "app"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_task_exits_with_two() {
    let project = TestProject::with_config(CONFIG);
    project.harpoon().assert().code(2);
}

#[test]
fn test_unknown_task() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .arg("deploy")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error:"))
        .stderr(predicate::str::contains("deploy"));
}

#[test]
fn test_task_without_image() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .arg("print-dockerfile")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("print-dockerfile"));
}

#[test]
fn test_unknown_image() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .args(["print-dockerfile", "nope"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("nope"));
}

#[test]
fn test_missing_config_file() {
    let project = TestProject::new();
    project
        .harpoon()
        .arg("show")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("harpoon.yml"));
}

#[test]
fn test_print_dockerfile() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .args(["print-dockerfile", "app", "--tag", "v3", "--", "from", "cli"])
        .assert()
        .success()
        .stdout(predicate::str::starts_with("FROM demo-base:v3\n"))
        .stdout(predicate::str::contains("/etc/motd"))
        .stdout(predicate::str::contains("echo from cli"));
}

#[test]
fn test_print_dockerfile_with_flags() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .args(["--task", "print-dockerfile", "--image", "base"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FROM alpine:3.20"))
        .stdout(predicate::str::contains("RUN apk add --no-cache bash"));
}

#[test]
fn test_config_from_environment() {
    let project = TestProject::with_config(CONFIG);
    let mut cmd = Command::cargo_bin("harpoon").unwrap();
    cmd.env("HARPOON_CONFIG", project.config_path())
        .env("HOME", project.root.path())
        .args(["print-dockerfile", "base"])
        .assert()
        .success()
        .stdout(predicate::str::contains("FROM alpine:3.20"));
}

#[test]
fn test_show_layers() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .arg("show")
        .assert()
        .success()
        .stdout(predicate::str::contains("Layer 0"))
        .stdout(predicate::str::contains("Layer 1"))
        .stdout(predicate::str::contains("registry.example.com/demo-app"));
}

#[test]
fn test_show_pushable() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .arg("show-pushable")
        .assert()
        .success()
        .stdout(predicate::str::contains("app"))
        .stdout(predicate::str::contains("demo-base").not());
}

#[test]
fn test_list_tasks() {
    let project = TestProject::with_config(CONFIG);
    project
        .harpoon()
        .arg("list-tasks")
        .assert()
        .success()
        .stdout(predicate::str::contains("make-all"))
        .stdout(predicate::str::contains("container-manager"))
        .stdout(predicate::str::contains("build-app"))
        .stdout(predicate::str::contains("greet"))
        .stdout(predicate::str::contains("挨拶する"));
}

#[test]
fn test_dependency_cycle_is_reported() {
    let project = TestProject::with_config(
        r#"
images:
  a:
    context: false
    commands: ["FROM b"]
  b:
    context: false
    commands: ["FROM a"]
"#,
    );
    project
        .harpoon()
        .arg("show")
        .assert()
        .code(1)
        .stderr(predicate::str::contains("Error:"));
}
