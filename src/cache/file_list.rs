use std::path::PathBuf;

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use super::disk::DiskCache;
use super::lock_table::LockTable;
use super::version::CacheVersion;
use crate::backend::{collect_pages, AsyncSource, Entry, Source};
use crate::error::Result;

/// 列举缓存的 key：调用方换一个 counter 就是显式作废
///
/// `scoped` 把容器标识混进落盘 key，两个容器用同一个 name 也互不覆盖。
/// 标识只以 hash 出现，连接串里的凭据不会写进文件名。
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct FileListKey {
    pub name: String,
    pub counter: u64,
    scope: Option<u64>,
}

impl FileListKey {
    pub fn new(name: impl Into<String>, counter: u64) -> Self {
        Self {
            name: name.into(),
            counter,
            scope: None,
        }
    }

    /// 已经 scoped 的 key 保持原样
    pub fn scoped(mut self, container: &str) -> Self {
        if self.scope.is_none() {
            self.scope = Some(xxh3_64(container.as_bytes()));
        }
        self
    }

    pub fn is_scoped(&self) -> bool {
        self.scope.is_some()
    }

    fn storage_key(&self) -> String {
        match self.scope {
            Some(h) => format!("{}@{:016x}", self.name, h),
            None => self.name.clone(),
        }
    }

    fn version(&self) -> CacheVersion {
        CacheVersion::from(self.counter)
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingRecord {
    pub entries: Vec<Entry>,
    pub fingerprint: u64,
}

impl ListingRecord {
    pub fn new(entries: Vec<Entry>) -> Self {
        let fingerprint = listing_digest(&entries);
        Self { entries, fingerprint }
    }
}

/// 与顺序无关的列举摘要（名字 + 大小 + etag）
pub fn listing_digest(entries: &[Entry]) -> u64 {
    let mut sorted: Vec<&Entry> = entries.iter().collect();
    sorted.sort_by(|a, b| a.name.cmp(&b.name));
    let mut h = Xxh3::new();
    for e in sorted {
        h.update(e.name.as_bytes());
        h.update(&[0]);
        h.update(&e.size.to_le_bytes());
        if let Some(fp) = &e.fingerprint {
            h.update(fp.as_bytes());
        }
        h.update(&[0xff]);
    }
    h.digest()
}

/// 云容器列举缓存
///
/// 落盘的列举在 counter 不变时一直被信任。打开 validate 时，命中后会再做一次
/// 完整列举并比对摘要：摘要不同就用新列举替换旧记录，即使 counter 没变。
/// 这是唯一由外部状态（而不是版本比较）触发的作废。
/// 校验时后端不可用（`BackendUnavailable`）则继续返回旧列举。
///
/// 同一个 key 的读写由锁表串行化；实例在 registry 里按 locator 共享。
pub struct FileListCache {
    disk: DiskCache,
    locks: LockTable<String>,
    validate: bool,
}

impl FileListCache {
    pub fn new(dir: impl Into<PathBuf>, validate: bool) -> Self {
        Self {
            disk: DiskCache::new(dir),
            locks: LockTable::new(),
            validate,
        }
    }

    pub fn validates_by_default(&self) -> bool {
        self.validate
    }

    /// 显式作废（不论 counter）；返回是否存在记录
    pub fn invalidate(&self, key: &FileListKey) -> Result<bool> {
        let id = key.storage_key();
        let _guard = self.locks.lock(id.clone());
        self.disk.delete(&id)
    }

    pub fn cached(&self, key: &FileListKey) -> Result<Option<ListingRecord>> {
        self.disk.get(&key.storage_key(), &key.version())
    }

    pub fn get_or_list(&self, key: &FileListKey, source: &dyn Source, validate: Option<bool>) -> Result<Vec<Entry>> {
        let validate = validate.unwrap_or(self.validate);
        let version = key.version();
        let id = key.storage_key();
        let _guard = self.locks.lock(id.clone());

        let Some(record) = self.disk.get::<ListingRecord>(&id, &version)? else {
            tracing::debug!("file-list miss: {}@{}", key.name, key.counter);
            let fresh = ListingRecord::new(collect(source)?);
            self.disk.set(&id, version, &fresh)?;
            return Ok(fresh.entries);
        };
        if !validate {
            tracing::debug!("file-list hit: {}@{}", key.name, key.counter);
            return Ok(record.entries);
        }
        match collect(source) {
            Ok(entries) => self.reconcile(key, record, entries),
            Err(e) if e.is_unavailable() => {
                tracing::warn!("file-list `{}`: cannot validate ({}); serving cached listing", key.name, e);
                Ok(record.entries)
            }
            Err(e) => Err(e),
        }
    }

    pub async fn get_or_list_async(
        &self,
        key: &FileListKey,
        source: &dyn AsyncSource,
        validate: Option<bool>,
    ) -> Result<Vec<Entry>> {
        let validate = validate.unwrap_or(self.validate);
        let version = key.version();
        let id = key.storage_key();
        let _guard = self.locks.lock_async(id.clone()).await;

        let Some(record) = self.disk.get_async::<ListingRecord>(&id, &version).await? else {
            tracing::debug!("file-list miss: {}@{}", key.name, key.counter);
            let fresh = ListingRecord::new(collect_pages(source.list().await?).await?);
            self.disk.set_async(&id, version, fresh.clone()).await?;
            return Ok(fresh.entries);
        };
        if !validate {
            tracing::debug!("file-list hit: {}@{}", key.name, key.counter);
            return Ok(record.entries);
        }
        let listed = match source.list().await {
            Ok(pages) => collect_pages(pages).await,
            Err(e) => Err(e),
        };
        match listed {
            Ok(entries) => {
                let fresh = ListingRecord::new(entries);
                if fresh.fingerprint == record.fingerprint {
                    return Ok(record.entries);
                }
                tracing::warn!("file-list `{}` drifted from the container; replacing", key.name);
                self.disk.set_async(&id, version, fresh.clone()).await?;
                Ok(fresh.entries)
            }
            Err(e) if e.is_unavailable() => {
                tracing::warn!("file-list `{}`: cannot validate ({}); serving cached listing", key.name, e);
                Ok(record.entries)
            }
            Err(e) => Err(e),
        }
    }

    fn reconcile(&self, key: &FileListKey, cached: ListingRecord, entries: Vec<Entry>) -> Result<Vec<Entry>> {
        let fresh = ListingRecord::new(entries);
        if fresh.fingerprint == cached.fingerprint {
            return Ok(cached.entries);
        }
        tracing::warn!("file-list `{}` drifted from the container; replacing", key.name);
        self.disk.set(&key.storage_key(), key.version(), &fresh)?;
        Ok(fresh.entries)
    }
}

fn collect(source: &dyn Source) -> Result<Vec<Entry>> {
    source.list()?.collect()
}
