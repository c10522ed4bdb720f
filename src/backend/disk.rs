use std::fs;
use std::io::Write;
use std::path::{Component, Path, PathBuf};
use std::time::UNIX_EPOCH;

use ignore::WalkBuilder;

use super::{Entry, EntryIter, Sink, Source};
use crate::error::{Result, StagError};

/// 磁盘目录后端：条目名是相对 root 的 `/` 分隔路径
#[derive(Clone, Debug)]
pub struct DiskBackend {
    root: PathBuf,
}

impl DiskBackend {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn entry_path(&self, name: &str) -> Result<PathBuf> {
        let rel = Path::new(name);
        let escapes = rel
            .components()
            .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir));
        if name.is_empty() || escapes {
            return Err(StagError::invalid(
                format!("{}/{}", self.root.display(), name),
                "entry name must stay below the container",
            ));
        }
        Ok(self.root.join(rel))
    }

    fn relative_name(&self, path: &Path) -> Option<String> {
        let rel = path.strip_prefix(&self.root).ok()?;
        let parts: Vec<&str> = rel
            .components()
            .filter_map(|c| match c {
                Component::Normal(s) => s.to_str(),
                _ => None,
            })
            .collect();
        if parts.is_empty() {
            None
        } else {
            Some(parts.join("/"))
        }
    }
}

impl Source for DiskBackend {
    fn list(&self) -> Result<EntryIter<'_>> {
        if !self.root.is_dir() {
            return Err(StagError::NotFound(self.root.display().to_string()));
        }
        // 普通目录列举：不套用 .gitignore / 隐藏文件规则
        let walker = WalkBuilder::new(&self.root)
            .standard_filters(false)
            .sort_by_file_name(|a, b| a.cmp(b))
            .build();
        let iter = walker
            .filter_map(|e| match e {
                Ok(e) => Some(e),
                Err(err) => {
                    tracing::debug!("skip unreadable entry: {}", err);
                    None
                }
            })
            .filter(|e| e.file_type().map(|ft| ft.is_file()).unwrap_or(false))
            .filter_map(move |e| {
                let name = self.relative_name(e.path())?;
                if is_tmp_name(&name) {
                    return None;
                }
                let metadata = e.metadata().ok();
                Some(Ok(Entry {
                    name,
                    size: metadata.as_ref().map(|m| m.len()).unwrap_or(0),
                    fingerprint: None,
                    modified: metadata
                        .and_then(|m| m.modified().ok())
                        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                        .map(|d| d.as_secs()),
                }))
            });
        Ok(Box::new(iter))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        let path = self.entry_path(name)?;
        fs::read(&path).map_err(|e| StagError::from_io(e, &path.display().to_string()))
    }

    fn exists(&self, name: &str) -> Result<bool> {
        Ok(self.entry_path(name)?.is_file())
    }
}

impl Sink for DiskBackend {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let path = self.entry_path(name)?;
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        write_atomic(&path, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        let path = self.entry_path(name)?;
        match fs::remove_file(&path) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(e.into()),
        }
    }
}

/// 临时文件的前缀/后缀；列举时跳过
pub(crate) const TMP_PREFIX: &str = ".stagfs-";
pub(crate) const TMP_SUFFIX: &str = ".tmp";

fn is_tmp_name(name: &str) -> bool {
    let base = name.rsplit('/').next().unwrap_or(name);
    base.starts_with(TMP_PREFIX) && base.ends_with(TMP_SUFFIX)
}

/// 同目录下独立的临时文件 + fsync + persist(rename)
///
/// 每次写都有自己的临时文件，同一路径的并发写互不踩踏，最后一个 rename 生效；
/// 中途失败时目标文件保持原样，临时文件随 drop 删除。
pub(crate) fn write_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let dir = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    let written = (|| -> std::io::Result<()> {
        let mut tmp = tempfile::Builder::new()
            .prefix(TMP_PREFIX)
            .suffix(TMP_SUFFIX)
            .tempfile_in(dir)?;
        tmp.write_all(data)?;
        tmp.as_file().sync_all()?;
        tmp.persist(path).map_err(|e| e.error)?;
        Ok(())
    })();
    if let Err(e) = written {
        tracing::warn!("atomic write of {} failed: {}", path.display(), e);
        return Err(StagError::PartialWrite(format!("{}: {}", path.display(), e)));
    }
    Ok(())
}
