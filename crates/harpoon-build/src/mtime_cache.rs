//! コミット時刻のキャッシュ
//!
//! `<git-dir>/harpoon_cached_mtimes.json` に、対象パスの集合とルートディレクトリ
//! ごとに、走査を始めたコミットと各パスの時刻を保存する。次回は HEAD から
//! キャッシュしたコミットまでだけを辿り、結果をマージする。

use crate::error::{BuildError, BuildResult};
use crate::vcs::Repository;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, BTreeSet};
use std::io::Write;
use std::path::{Path, PathBuf};

pub const CACHE_FILE_NAME: &str = "harpoon_cached_mtimes.json";

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub commit: String,
    pub root_dir: String,
    /// ソート済み
    pub use_files_relpaths: Vec<String>,
    pub mtimes: BTreeMap<String, i64>,
}

#[derive(Debug, Clone)]
pub struct MtimeCache {
    path: PathBuf,
    entries: Vec<CacheEntry>,
}

impl MtimeCache {
    /// キャッシュファイルを読む（壊れていれば空として扱う）
    pub fn load(git_dir: &Path) -> Self {
        let path = git_dir.join(CACHE_FILE_NAME);
        let entries = match std::fs::read_to_string(&path) {
            Ok(content) => serde_json::from_str(&content).unwrap_or_else(|e| {
                tracing::warn!(path = %path.display(), "Ignoring broken mtime cache: {}", e);
                Vec::new()
            }),
            Err(_) => Vec::new(),
        };
        Self { path, entries }
    }

    pub fn get(&self, root_dir: &str, paths: &BTreeSet<String>) -> Option<&CacheEntry> {
        self.entries.iter().find(|entry| {
            entry.root_dir == root_dir
                && entry.use_files_relpaths.len() == paths.len()
                && entry.use_files_relpaths.iter().zip(paths).all(|(a, b)| a == b)
        })
    }

    pub fn insert(&mut self, entry: CacheEntry) {
        self.entries.retain(|existing| {
            existing.root_dir != entry.root_dir
                || existing.use_files_relpaths != entry.use_files_relpaths
        });
        self.entries.push(entry);
    }

    /// 一時ファイルに書いてから置き換える
    pub fn save(&self) -> BuildResult<()> {
        let dir = self.path.parent().unwrap_or(Path::new("."));
        let mut file =
            tempfile::NamedTempFile::new_in(dir).map_err(|e| BuildError::io(&self.path, e))?;
        let content =
            serde_json::to_vec(&self.entries).map_err(|e| BuildError::io(&self.path, e))?;
        file.write_all(&content)
            .map_err(|e| BuildError::io(&self.path, e))?;
        file.persist(&self.path)
            .map_err(|e| BuildError::io(&self.path, e.error))?;
        Ok(())
    }

    pub fn entries(&self) -> &[CacheEntry] {
        &self.entries
    }
}

/// キャッシュを使って各パスのコミット時刻を求める
pub fn commit_times(
    repo: &Repository,
    root_dir: &Path,
    paths: &BTreeSet<String>,
) -> BuildResult<BTreeMap<String, i64>> {
    if paths.is_empty() {
        return Ok(BTreeMap::new());
    }

    let root_key = root_dir.display().to_string();
    let mut cache = MtimeCache::load(repo.git_dir());
    let cached = cache.get(&root_key, paths).cloned();

    let walked = repo.commit_times(paths, cached.as_ref().map(|entry| entry.commit.as_str()))?;
    let Some(first_commit) = walked.first_commit else {
        return Ok(BTreeMap::new());
    };

    let mut mtimes = walked.times;
    if let Some(cached) = cached {
        tracing::debug!(commit = %cached.commit, "Using cached commit times");
        for (path, time) in cached.mtimes {
            mtimes.entry(path).or_insert(time);
        }
    }

    cache.insert(CacheEntry {
        commit: first_commit,
        root_dir: root_key,
        use_files_relpaths: paths.iter().cloned().collect(),
        mtimes: mtimes.clone(),
    });
    if let Err(e) = cache.save() {
        tracing::warn!("Failed to save mtime cache: {}", e);
    }

    Ok(mtimes)
}
