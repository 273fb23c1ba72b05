//! git との連携
//!
//! `git` コマンドを呼び出して、コンテキストに含めるファイルの判定と
//! 各ファイルの最終コミット時刻の取得を行う。パスはすべてコンテキストの
//! ルートディレクトリからの相対パス。

use crate::error::{BuildError, BuildResult};
use std::collections::{BTreeMap, BTreeSet};
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};

const COMMIT_MARKER: &str = "commit ";

/// コミット履歴から得た時刻
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CommitTimes {
    /// 走査を始めたコミット（HEAD）
    pub first_commit: Option<String>,
    pub times: BTreeMap<String, i64>,
}

/// コンテキストのルートから見た git リポジトリ
#[derive(Debug, Clone)]
pub struct Repository {
    /// コンテキストのルート
    dir: PathBuf,
    toplevel: PathBuf,
    git_dir: PathBuf,
}

impl Repository {
    /// `dir` を含むリポジトリを探す
    pub fn discover(dir: &Path) -> BuildResult<Self> {
        let unavailable = |message: String| BuildError::VcsUnavailable {
            root: dir.to_path_buf(),
            message,
        };

        let output = git(dir)
            .args(["rev-parse", "--show-toplevel", "--absolute-git-dir"])
            .output()
            .map_err(|e| unavailable(format!("git を実行できません: {}", e)))?;
        if !output.status.success() {
            return Err(unavailable(
                String::from_utf8_lossy(&output.stderr).trim().to_string(),
            ));
        }

        let stdout = String::from_utf8_lossy(&output.stdout);
        let mut lines = stdout.lines();
        match (lines.next(), lines.next()) {
            (Some(toplevel), Some(git_dir)) => Ok(Self {
                dir: dir.to_path_buf(),
                toplevel: PathBuf::from(toplevel),
                git_dir: PathBuf::from(git_dir),
            }),
            _ => Err(unavailable(format!("予期しない出力: {}", stdout.trim()))),
        }
    }

    pub fn toplevel(&self) -> &Path {
        &self.toplevel
    }

    /// `.git` ディレクトリ
    pub fn git_dir(&self) -> &Path {
        &self.git_dir
    }

    pub fn is_shallow(&self) -> BuildResult<bool> {
        let output = self.run(&["rev-parse", "--is-shallow-repository"])?;
        Ok(output.trim() == "true")
    }

    /// shallow clone ならエラー
    pub fn ensure_full_history(&self) -> BuildResult<()> {
        if self.is_shallow()? {
            return Err(BuildError::ShallowRepo {
                root: self.toplevel.clone(),
            });
        }
        Ok(())
    }

    /// HEAD のコミット（コミットがなければ `None`）
    pub fn head(&self) -> Option<String> {
        self.run(&["rev-parse", "--verify", "--quiet", "HEAD"])
            .ok()
            .map(|out| out.trim().to_string())
            .filter(|head| !head.is_empty())
    }

    /// 管理対象のファイル
    pub fn tracked_files(&self) -> BuildResult<BTreeSet<String>> {
        self.list_files(&["ls-files", "-z"])
    }

    /// 管理対象外で ignore もされていないファイル
    pub fn untracked_files(&self) -> BuildResult<BTreeSet<String>> {
        self.list_files(&["ls-files", "-z", "--others", "--exclude-standard"])
    }

    /// ignore されているファイル
    pub fn ignored_files(&self) -> BuildResult<BTreeSet<String>> {
        self.list_files(&["ls-files", "-z", "--others", "--ignored", "--exclude-standard"])
    }

    /// HEAD から変更されているファイル
    pub fn changed_files(&self) -> BuildResult<BTreeSet<String>> {
        if self.head().is_none() {
            return Ok(BTreeSet::new());
        }
        self.list_files(&["diff", "--name-only", "-z", "--relative", "HEAD"])
    }

    /// 各パスが最後に変更されたコミットの author 時刻
    ///
    /// 新しいコミットから順に辿り、すべてのパスの時刻が分かるか
    /// `stop_at` のコミットに到達した時点で止める。
    pub fn commit_times(
        &self,
        paths: &BTreeSet<String>,
        stop_at: Option<&str>,
    ) -> BuildResult<CommitTimes> {
        let mut result = CommitTimes {
            first_commit: self.head(),
            ..Default::default()
        };
        if paths.is_empty() || result.first_commit.is_none() {
            return Ok(result);
        }

        let mut child = git(&self.dir)
            .args([
                "-c",
                "core.quotePath=false",
                "log",
                "--relative",
                "--name-only",
                "--format=commit %H %at",
                "HEAD",
                "--",
                ".",
            ])
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| self.unavailable(e))?;

        let Some(stdout) = child.stdout.take() else {
            return Err(self.unavailable("git log の出力を読めません"));
        };

        let mut current_time: Option<i64> = None;
        for line in BufReader::new(stdout).lines() {
            let line = line.map_err(|e| self.unavailable(e))?;
            if let Some(header) = line.strip_prefix(COMMIT_MARKER) {
                let mut parts = header.split_whitespace();
                let commit = parts.next().unwrap_or_default();
                if stop_at == Some(commit) {
                    break;
                }
                current_time = parts.next().and_then(|t| t.parse().ok());
                continue;
            }

            let path = line.trim_end();
            if path.is_empty() {
                continue;
            }
            if let Some(time) = current_time
                && paths.contains(path)
                && !result.times.contains_key(path)
            {
                result.times.insert(path.to_string(), time);
                if result.times.len() == paths.len() {
                    break;
                }
            }
        }

        // 途中で止めた場合は残りの出力を捨てる
        let _ = child.kill();
        let _ = child.wait();

        tracing::debug!(
            found = result.times.len(),
            wanted = paths.len(),
            "Collected commit times"
        );
        Ok(result)
    }

    fn list_files(&self, args: &[&str]) -> BuildResult<BTreeSet<String>> {
        let output = self.run(args)?;
        Ok(output
            .split('\0')
            .filter(|path| !path.is_empty())
            .map(|path| path.to_string())
            .collect())
    }

    fn run(&self, args: &[&str]) -> BuildResult<String> {
        let output = git(&self.dir)
            .args(["-c", "core.quotePath=false"])
            .args(args)
            .output()
            .map_err(|e| self.unavailable(e))?;
        if !output.status.success() {
            return Err(self.unavailable(String::from_utf8_lossy(&output.stderr).trim()));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }

    fn unavailable(&self, err: impl std::fmt::Display) -> BuildError {
        BuildError::VcsUnavailable {
            root: self.dir.clone(),
            message: err.to_string(),
        }
    }
}

fn git(dir: &Path) -> Command {
    let mut command = Command::new("git");
    command.current_dir(dir).stdin(Stdio::null());
    command
}

/// `git` コマンドが使えるか
pub fn git_available() -> bool {
    Command::new("git")
        .arg("--version")
        .stdout(Stdio::null())
        .stderr(Stdio::null())
        .status()
        .is_ok_and(|status| status.success())
}
