//! ビルドコンテキストの組み立て
//!
//! ルートディレクトリを走査し、git の管理状態と include / exclude の glob で
//! ファイルを絞り込み、必要ならコミット時刻を mtime として tar.gz にまとめる。

use crate::error::{BuildError, BuildResult};
use crate::mtime_cache;
use crate::vcs::Repository;
use flate2::Compression;
use flate2::write::GzEncoder;
use glob::Pattern;
use harpoon_core::{ContextSpec, MtimeMode};
use std::collections::BTreeSet;
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use tar::{Builder, Header};

pub const DOCKERFILE_NAME: &str = "Dockerfile";

const MAX_CONTEXT_SIZE: u64 = 500 * 1024 * 1024; // 500MB

/// コンテキストに含めるファイル
#[derive(Debug, Clone, PartialEq)]
pub struct ContextFile {
    /// tar 内での名前（ルートからの相対パス）
    pub name: String,
    pub disk: PathBuf,
    /// シンボリックリンク経由の場合、実体のルートからの相対パス
    pub real: Option<String>,
    /// 経由したディレクトリのシンボリックリンク
    pub link: Option<String>,
    /// `None` ならファイルシステムの mtime
    pub mtime: Option<i64>,
}

impl ContextFile {
    /// git の情報を引くときのパス
    fn vcs_path(&self) -> &str {
        self.real.as_deref().unwrap_or(&self.name)
    }
}

/// コンテキストに追加するデータ
#[derive(Debug, Clone, PartialEq)]
pub struct ExtraBlob {
    pub name: String,
    pub data: Vec<u8>,
}

pub struct ContextBuilder;

impl ContextBuilder {
    /// ビルドコンテキストを tar.gz として作成
    ///
    /// 追加データを入れた後、最後に `Dockerfile` を置く。
    pub fn build_context(
        spec: &ContextSpec,
        extras: &[ExtraBlob],
        dockerfile: &str,
    ) -> BuildResult<Vec<u8>> {
        tracing::debug!("Creating build context from: {}", spec.root_dir.display());

        let files = if spec.enabled {
            Self::files(spec)?
        } else {
            Vec::new()
        };

        let temp = tempfile::tempfile().map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
        let encoder = GzEncoder::new(temp, Compression::default());
        let mut tar = Builder::new(encoder);

        Self::append_files(&mut tar, &files)?;
        for extra in extras {
            append_bytes(&mut tar, &extra.name, &extra.data)?;
        }
        append_bytes(&mut tar, DOCKERFILE_NAME, dockerfile.as_bytes())?;

        let encoder = tar
            .into_inner()
            .map_err(|e| BuildError::io(&spec.root_dir, e))?;
        let temp = encoder
            .finish()
            .map_err(|e| BuildError::io(&spec.root_dir, e))?;

        let data = read_back(temp).map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
        tracing::debug!(files = files.len(), "Build context created: {} bytes", data.len());
        Self::check_context_size(data.len() as u64);
        Ok(data)
    }

    /// ディレクトリだけの非圧縮 tar（`ADD {context: ...}` 用）
    pub fn archive(spec: &ContextSpec) -> BuildResult<Vec<u8>> {
        let files = Self::files(spec)?;
        let temp = tempfile::tempfile().map_err(|e| BuildError::io(std::env::temp_dir(), e))?;
        let mut tar = Builder::new(temp);
        Self::append_files(&mut tar, &files)?;
        let temp = tar
            .into_inner()
            .map_err(|e| BuildError::io(&spec.root_dir, e))?;
        read_back(temp).map_err(|e| BuildError::io(std::env::temp_dir(), e))
    }

    /// コンテキストに含めるファイルと mtime を決める
    pub fn files(spec: &ContextSpec) -> BuildResult<Vec<ContextFile>> {
        let excludes = compile(&spec.exclude)?;
        let includes = compile(&spec.include)?;
        let mtime_globs = match &spec.use_vcs_mtimes {
            MtimeMode::Only(globs) => Some(compile(globs)?),
            _ => None,
        };

        let mut files = walk(&spec.root_dir)?;
        files.retain(|file| !(file.name == DOCKERFILE_NAME && file.link.is_none()));

        let repo = if spec.needs_vcs() {
            Some(Repository::discover(&spec.root_dir)?)
        } else {
            None
        };

        let mut ignored = BTreeSet::new();
        if let Some(repo) = &repo {
            if spec.use_vcs_ignore || spec.use_vcs_mtimes.is_enabled() {
                ignored = repo.ignored_files()?;
            }
            if spec.use_vcs {
                let mut known = repo.tracked_files()?;
                known.extend(repo.untracked_files()?);
                files.retain(|file| {
                    known.contains(&file.name)
                        || file.link.as_ref().is_some_and(|link| known.contains(link))
                });
            }
            if spec.use_vcs_ignore {
                files.retain(|file| !ignored.contains(&file.name));
            }
        }

        files.retain(|file| !matches_any(&excludes, &file.name) || matches_any(&includes, &file.name));

        if let Some(repo) = &repo
            && spec.use_vcs_mtimes.is_enabled()
        {
            repo.ensure_full_history()?;

            let mut uncertain = repo.untracked_files()?;
            uncertain.extend(repo.changed_files()?);
            uncertain.extend(ignored);

            let wanted: BTreeSet<String> = files
                .iter()
                .filter(|file| !uncertain.contains(file.vcs_path()))
                .filter(|file| match &mtime_globs {
                    Some(globs) => matches_any(globs, &file.name),
                    None => true,
                })
                .map(|file| file.vcs_path().to_string())
                .collect();

            let times = mtime_cache::commit_times(repo, &spec.root_dir, &wanted)?;
            for file in &mut files {
                if wanted.contains(file.vcs_path()) {
                    file.mtime = times.get(file.vcs_path()).copied();
                }
            }
        }

        Ok(files)
    }

    fn append_files<W: Write>(tar: &mut Builder<W>, files: &[ContextFile]) -> BuildResult<()> {
        for file in files {
            let handle = match File::open(&file.disk) {
                Ok(handle) => handle,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                    tracing::warn!(path = %file.disk.display(), "File disappeared while creating context");
                    continue;
                }
                Err(e) => return Err(BuildError::io(&file.disk, e)),
            };
            let metadata = handle
                .metadata()
                .map_err(|e| BuildError::io(&file.disk, e))?;

            let mut header = Header::new_gnu();
            header.set_metadata(&metadata);
            if let Some(mtime) = file.mtime {
                header.set_mtime(mtime.max(0) as u64);
            }
            tar.append_data(&mut header, &file.name, handle)
                .map_err(|e| BuildError::io(&file.disk, e))?;
        }
        Ok(())
    }

    /// コンテキストサイズのチェックと警告
    fn check_context_size(size: u64) {
        if size > MAX_CONTEXT_SIZE {
            tracing::warn!(
                "警告: ビルドコンテキストが大きすぎます（{}MB）\n\
                 context.exclude で不要なファイルを除外することを推奨します。",
                size / 1024 / 1024
            );
        }
    }
}

fn append_bytes<W: Write>(tar: &mut Builder<W>, name: &str, data: &[u8]) -> BuildResult<()> {
    let mut header = Header::new_gnu();
    header.set_size(data.len() as u64);
    header.set_mode(0o644);
    header.set_mtime(0);
    tar.append_data(&mut header, name, data)
        .map_err(|e| BuildError::io(name, e))
}

fn read_back(mut file: File) -> std::io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(0))?;
    let mut data = Vec::new();
    file.read_to_end(&mut data)?;
    Ok(data)
}

fn compile(patterns: &[String]) -> BuildResult<Vec<Pattern>> {
    patterns
        .iter()
        .map(|pattern| {
            Pattern::new(pattern).map_err(|e| BuildError::BadGlob {
                pattern: pattern.clone(),
                message: e.to_string(),
            })
        })
        .collect()
}

/// パス自身か親ディレクトリのどれかが一致するか
fn matches_any(patterns: &[Pattern], path: &str) -> bool {
    if patterns.is_empty() {
        return false;
    }
    let mut prefixes = vec![path];
    prefixes.extend(path.match_indices('/').map(|(index, _)| &path[..index]));
    patterns
        .iter()
        .any(|pattern| prefixes.iter().any(|prefix| pattern.matches(prefix)))
}

/// ルート以下のファイルを名前順に列挙する
///
/// ディレクトリへのシンボリックリンクは辿り、中のファイルはリンクのパスの下に置く。
fn walk(root: &Path) -> BuildResult<Vec<ContextFile>> {
    let canonical_root = fs::canonicalize(root).map_err(|e| BuildError::io(root, e))?;
    let mut visited = BTreeSet::from([canonical_root.clone()]);
    let mut files = Vec::new();
    let mut walker = Walker {
        root: &canonical_root,
        visited: &mut visited,
        files: &mut files,
    };
    walker.visit(root, "", None)?;
    Ok(files)
}

struct Walker<'a> {
    root: &'a Path,
    visited: &'a mut BTreeSet<PathBuf>,
    files: &'a mut Vec<ContextFile>,
}

impl Walker<'_> {
    fn visit(&mut self, dir: &Path, prefix: &str, link: Option<&str>) -> BuildResult<()> {
        let mut entries: Vec<_> = fs::read_dir(dir)
            .map_err(|e| BuildError::io(dir, e))?
            .filter_map(|entry| entry.ok())
            .collect();
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let name = format!("{}{}", prefix, entry.file_name().to_string_lossy());
            let Ok(file_type) = entry.file_type() else {
                continue;
            };

            if file_type.is_symlink() {
                // リンク切れは無視
                let Ok(target) = fs::canonicalize(&path) else {
                    tracing::debug!(path = %path.display(), "Skipping broken symlink");
                    continue;
                };
                let real = target
                    .strip_prefix(self.root)
                    .ok()
                    .map(|rel| rel.to_string_lossy().into_owned());
                if target.is_dir() {
                    if !self.visited.insert(target.clone()) {
                        continue;
                    }
                    let link = link.unwrap_or(&name).to_string();
                    self.visit_linked(&target, &format!("{}/", name), real, &link)?;
                    self.visited.remove(&target);
                } else if target.is_file() {
                    self.files.push(ContextFile {
                        name,
                        disk: path,
                        real,
                        link: link.map(str::to_string),
                        mtime: None,
                    });
                }
            } else if file_type.is_dir() {
                self.visit(&path, &format!("{}/", name), link)?;
            } else if file_type.is_file() {
                self.files.push(ContextFile {
                    name,
                    disk: path,
                    real: None,
                    link: link.map(str::to_string),
                    mtime: None,
                });
            }
        }
        Ok(())
    }

    /// リンク先の中身をリンクのパスの下に並べる
    fn visit_linked(
        &mut self,
        target: &Path,
        prefix: &str,
        real: Option<String>,
        link: &str,
    ) -> BuildResult<()> {
        let start = self.files.len();
        self.visit(target, prefix, Some(link))?;
        if let Some(real) = real {
            for file in &mut self.files[start..] {
                if file.real.is_none()
                    && let Some(rest) = file.name.strip_prefix(prefix)
                {
                    file.real = Some(format!("{}/{}", real, rest));
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vcs::git_available;
    use crate::vcs::test_support::*;
    use std::collections::BTreeMap;

    fn entries(data: &[u8]) -> BTreeMap<String, (u64, Vec<u8>)> {
        let decoder = flate2::read::GzDecoder::new(data);
        let mut archive = tar::Archive::new(decoder);
        let mut result = BTreeMap::new();
        for entry in archive.entries().unwrap() {
            let mut entry = entry.unwrap();
            let name = entry.path().unwrap().to_string_lossy().into_owned();
            let mtime = entry.header().mtime().unwrap();
            let mut content = Vec::new();
            entry.read_to_end(&mut content).unwrap();
            result.insert(name, (mtime, content));
        }
        result
    }

    fn names(files: &[ContextFile]) -> Vec<&str> {
        files.iter().map(|f| f.name.as_str()).collect()
    }

    #[test]
    fn test_create_context() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("file1.txt"), "content1").unwrap();
        let subdir = temp_dir.path().join("subdir");
        fs::create_dir(&subdir).unwrap();
        fs::write(subdir.join("file3.txt"), "content3").unwrap();
        // コンテキスト内の Dockerfile は生成したもので置き換わる
        fs::write(temp_dir.path().join("Dockerfile"), "FROM old").unwrap();

        let spec = ContextSpec::new(temp_dir.path());
        let extras = vec![ExtraBlob {
            name: "abc-x".into(),
            data: b"hi".to_vec(),
        }];
        let data = ContextBuilder::build_context(&spec, &extras, "FROM scratch\n").unwrap();

        let entries = entries(&data);
        assert_eq!(entries["file1.txt"].1, b"content1");
        assert_eq!(entries["subdir/file3.txt"].1, b"content3");
        assert_eq!(entries["abc-x"].1, b"hi");
        assert_eq!(entries["Dockerfile"].1, b"FROM scratch\n");
        assert_eq!(entries.len(), 4);
    }

    #[test]
    fn test_disabled_context_has_only_dockerfile() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("file1.txt"), "content1").unwrap();

        let spec = ContextSpec::disabled(temp_dir.path());
        let data = ContextBuilder::build_context(&spec, &[], "FROM scratch\n").unwrap();
        assert_eq!(entries(&data).into_keys().collect::<Vec<_>>(), vec!["Dockerfile"]);
    }

    #[test]
    fn test_include_readmits_excluded() {
        let temp_dir = tempfile::tempdir().unwrap();
        let logs = temp_dir.path().join("logs");
        fs::create_dir(&logs).unwrap();
        fs::write(logs.join("keep.log"), "").unwrap();
        fs::write(logs.join("drop.log"), "").unwrap();
        fs::write(temp_dir.path().join("app.py"), "").unwrap();
        fs::write(temp_dir.path().join("app.pyc"), "").unwrap();

        let mut spec = ContextSpec::new(temp_dir.path());
        spec.exclude = vec!["logs".into(), "*.pyc".into()];
        spec.include = vec!["logs/keep.log".into()];

        let files = ContextBuilder::files(&spec).unwrap();
        assert_eq!(names(&files), vec!["app.py", "logs/keep.log"]);
    }

    #[test]
    fn test_bad_glob() {
        let temp_dir = tempfile::tempdir().unwrap();
        let mut spec = ContextSpec::new(temp_dir.path());
        spec.exclude = vec!["[".into()];
        assert!(matches!(
            ContextBuilder::files(&spec),
            Err(BuildError::BadGlob { .. })
        ));
    }

    #[cfg(unix)]
    #[test]
    fn test_symlinked_directory_is_walked() {
        let temp_dir = tempfile::tempdir().unwrap();
        let real = temp_dir.path().join("real");
        fs::create_dir(&real).unwrap();
        fs::write(real.join("a.txt"), "a").unwrap();
        std::os::unix::fs::symlink(&real, temp_dir.path().join("linked")).unwrap();
        // 自分自身を指すリンクで無限に辿らない
        std::os::unix::fs::symlink(temp_dir.path(), real.join("loop")).unwrap();

        let files = ContextBuilder::files(&ContextSpec::new(temp_dir.path())).unwrap();
        assert_eq!(names(&files), vec!["linked/a.txt", "real/a.txt"]);

        let linked = &files[0];
        assert_eq!(linked.real.as_deref(), Some("real/a.txt"));
        assert_eq!(linked.link.as_deref(), Some("linked"));
    }

    #[test]
    fn test_context_is_reproducible() {
        let temp_dir = tempfile::tempdir().unwrap();
        fs::write(temp_dir.path().join("b.txt"), "b").unwrap();
        fs::write(temp_dir.path().join("a.txt"), "a").unwrap();

        let spec = ContextSpec::new(temp_dir.path());
        let first = ContextBuilder::build_context(&spec, &[], "FROM scratch\n").unwrap();
        let second = ContextBuilder::build_context(&spec, &[], "FROM scratch\n").unwrap();
        assert_eq!(entries(&first), entries(&second));
    }

    #[test]
    fn test_vcs_filtering_and_mtimes() {
        if !git_available() {
            return;
        }
        let temp_dir = tempfile::tempdir().unwrap();
        let root = temp_dir.path();
        init(root);
        fs::write(root.join(".gitignore"), "*.log\n").unwrap();
        fs::write(root.join("tracked.txt"), "t").unwrap();
        fs::write(root.join("edited.txt"), "e").unwrap();
        git(root, &["add", "."]);
        commit_at(root, "first", 1_234_567);

        fs::write(root.join("edited.txt"), "changed").unwrap();
        fs::write(root.join("new.txt"), "n").unwrap();
        fs::write(root.join("debug.log"), "l").unwrap();

        let mut spec = ContextSpec::new(root);
        spec.use_vcs = true;
        spec.use_vcs_ignore = true;
        spec.use_vcs_mtimes = MtimeMode::All;

        let files = ContextBuilder::files(&spec).unwrap();
        assert_eq!(
            names(&files),
            vec![".gitignore", "edited.txt", "new.txt", "tracked.txt"]
        );

        let mtimes: BTreeMap<&str, Option<i64>> =
            files.iter().map(|f| (f.name.as_str(), f.mtime)).collect();
        assert_eq!(mtimes["tracked.txt"], Some(1_234_567));
        assert_eq!(mtimes["edited.txt"], None);
        assert_eq!(mtimes["new.txt"], None);

        let data = ContextBuilder::build_context(&spec, &[], "FROM scratch\n").unwrap();
        assert_eq!(entries(&data)["tracked.txt"].0, 1_234_567);
    }

    #[test]
    fn test_mtimes_outside_repository() {
        if !git_available() {
            return;
        }
        let temp_dir = tempfile::tempdir().unwrap();
        let mut spec = ContextSpec::new(temp_dir.path());
        spec.use_vcs_mtimes = MtimeMode::All;
        assert!(matches!(
            ContextBuilder::files(&spec),
            Err(BuildError::VcsUnavailable { .. })
        ));
    }
}
