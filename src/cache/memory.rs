use std::future::Future;
use std::sync::Arc;

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde::Serialize;

use super::disk::DiskCache;
use super::lock_table::LockTable;
use super::version::{CacheRef, CacheVersion};
use crate::error::Result;

/// `$` 开头的 key 存到磁盘层
pub const DISK_KEY_PREFIX: char = '$';

fn is_disk_key(key: &str) -> bool {
    key.starts_with(DISK_KEY_PREFIX)
}

struct Slot<V> {
    version: CacheVersion,
    value: V,
    keep: bool,
}

/// 磁盘层：把 `DiskCache` 的序列化约束收在这里，`Cache<V>` 本身不需要
trait DiskTier<V>: Send + Sync {
    fn load(&self, key: &str, version: &CacheVersion) -> Result<Option<V>>;
    fn save(&self, key: &str, version: CacheVersion, value: &V) -> Result<()>;
    fn drop_key(&self, key: &str) -> Result<bool>;
}

impl<V: Serialize + DeserializeOwned> DiskTier<V> for DiskCache {
    fn load(&self, key: &str, version: &CacheVersion) -> Result<Option<V>> {
        self.get(key, version)
    }

    fn save(&self, key: &str, version: CacheVersion, value: &V) -> Result<()> {
        self.set(key, version, value)
    }

    fn drop_key(&self, key: &str) -> Result<bool> {
        self.delete(key)
    }
}

/// 进程内版本化缓存（DashMap 实现）
///
/// `get_or_compute` 对同一 key 是 single-flight：第一个调用方在该 key 的闸门内计算，
/// 并发的其他调用方等待它发布结果后直接命中。计算失败（或 panic、或 async 取消）时
/// 闸门照常释放，下一个等待者重新计算。
///
/// 挂了磁盘层（`with_disk`）时，`$` 开头的 key 落盘，遵循 `DiskCache` 的版本规则
/// （精确相等）；其余 key 只在内存里，已存储版本 >= 请求版本即命中。
pub struct Cache<V: Clone + Send + Sync> {
    slots: DashMap<String, Slot<V>>,
    revisions: DashMap<String, u64>,
    locks: LockTable<String>,
    disk: Option<Arc<dyn DiskTier<V>>>,
}

impl<V: Clone + Send + Sync> Default for Cache<V> {
    fn default() -> Self {
        Self {
            slots: DashMap::new(),
            revisions: DashMap::new(),
            locks: LockTable::new(),
            disk: None,
        }
    }
}

impl<V: Clone + Send + Sync> Cache<V> {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_disk(mut self, disk: DiskCache) -> Self
    where
        V: Serialize + DeserializeOwned + 'static,
    {
        self.disk = Some(Arc::new(disk));
        self
    }

    fn disk_for(&self, key: &str) -> Option<&Arc<dyn DiskTier<V>>> {
        if is_disk_key(key) {
            self.disk.as_ref()
        } else {
            None
        }
    }

    pub fn get(&self, key: &str, version: &CacheVersion) -> Option<V> {
        if let Some(disk) = self.disk_for(key) {
            return match disk.load(key, version) {
                Ok(v) => v,
                Err(e) => {
                    tracing::warn!("disk tier read of `{}` failed: {}; treating as miss", key, e);
                    None
                }
            };
        }
        let slot = self.slots.get(key)?;
        if slot.version.satisfies(version) {
            Some(slot.value.clone())
        } else {
            None
        }
    }

    pub fn get_ref(&self, r: &CacheRef) -> Option<V> {
        self.get(&r.key, &r.version)
    }

    pub fn contains(&self, key: &str, version: &CacheVersion) -> bool {
        if self.disk_for(key).is_some() {
            return self.get(key, version).is_some();
        }
        self.slots
            .get(key)
            .map(|s| s.version.satisfies(version))
            .unwrap_or(false)
    }

    pub fn set(&self, key: &str, version: CacheVersion, value: V) -> Result<()> {
        self.set_with(key, version, value, false)
    }

    /// `keep`：`unload()` 时保留
    pub fn set_with(&self, key: &str, version: CacheVersion, value: V, keep: bool) -> Result<()> {
        if let Some(disk) = self.disk_for(key) {
            disk.save(key, version, &value)?;
        } else {
            self.slots.insert(key.to_string(), Slot { version, value, keep });
        }
        self.increase_revision(key);
        Ok(())
    }

    /// 返回是否真的删掉了东西
    pub fn remove(&self, key: &str) -> Result<bool> {
        if let Some(disk) = self.disk_for(key) {
            return disk.drop_key(key);
        }
        Ok(self.slots.remove(key).is_some())
    }

    /// 返回删掉的条数
    pub fn remove_keys<'k>(&self, keys: impl IntoIterator<Item = &'k str>) -> Result<usize> {
        let mut n = 0;
        for key in keys {
            if self.remove(key)? {
                n += 1;
            }
        }
        Ok(n)
    }

    /// 只清内存；磁盘层由 `DiskCache::clear` 管
    pub fn clear(&self) {
        self.slots.clear();
        self.revisions.clear();
    }

    /// 丢掉所有没标 `keep` 的内存条目，返回丢掉的条数
    pub fn unload(&self) -> usize {
        let before = self.slots.len();
        self.slots.retain(|_, slot| slot.keep);
        before - self.slots.len()
    }

    /// 该 key 被发布过多少次
    pub fn revision(&self, key: &str) -> u64 {
        self.revisions.get(key).map(|r| *r).unwrap_or(0)
    }

    pub fn increase_revision(&self, key: &str) -> u64 {
        let mut rev = self.revisions.entry(key.to_string()).or_insert(0);
        *rev += 1;
        *rev
    }

    /// 当前存储版本对应的引用
    pub fn create_ref(&self, key: &str) -> Option<CacheRef> {
        self.slots
            .get(key)
            .map(|s| CacheRef::new(key, s.version.clone()))
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// 读-改-写；磁盘层 key 在该 key 的闸门内完成，内存 key 在分片锁内完成
    fn update<T>(&self, key: &str, f: impl FnOnce(Option<V>) -> (Option<V>, T)) -> Result<T> {
        if let Some(disk) = self.disk_for(key) {
            let _guard = self.locks.lock(key.to_string());
            let version = CacheVersion::default();
            let (next, out) = f(disk.load(key, &version)?);
            match next {
                Some(v) => disk.save(key, version, &v)?,
                None => {
                    disk.drop_key(key)?;
                }
            }
            self.increase_revision(key);
            return Ok(out);
        }
        let out = match self.slots.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                let (next, out) = f(Some(occ.get().value.clone()));
                match next {
                    Some(v) => occ.get_mut().value = v,
                    None => {
                        occ.remove();
                    }
                }
                out
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                let (next, out) = f(None);
                if let Some(value) = next {
                    vac.insert(Slot {
                        version: CacheVersion::default(),
                        value,
                        keep: false,
                    });
                }
                out
            }
        };
        self.increase_revision(key);
        Ok(out)
    }

    pub fn get_or_compute<F>(&self, key: &str, version: CacheVersion, compute: F) -> Result<V>
    where
        F: FnOnce() -> Result<V>,
    {
        if let Some(v) = self.get(key, &version) {
            tracing::debug!("cache hit: {}@{}", key, version);
            return Ok(v);
        }
        let _guard = self.locks.lock(key.to_string());
        // 等闸门期间别人可能已经发布
        if let Some(v) = self.get(key, &version) {
            tracing::debug!("cache hit after wait: {}@{}", key, version);
            return Ok(v);
        }
        tracing::debug!("cache miss: {}@{}", key, version);
        let value = compute()?;
        self.set(key, version, value.clone())?;
        Ok(value)
    }

    pub async fn get_or_compute_async<F, Fut>(&self, key: &str, version: CacheVersion, compute: F) -> Result<V>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(v) = self.get(key, &version) {
            tracing::debug!("cache hit: {}@{}", key, version);
            return Ok(v);
        }
        let _guard = self.locks.lock_async(key.to_string()).await;
        if let Some(v) = self.get(key, &version) {
            tracing::debug!("cache hit after wait: {}@{}", key, version);
            return Ok(v);
        }
        tracing::debug!("cache miss: {}@{}", key, version);
        let value = compute().await?;
        self.set(key, version, value.clone())?;
        Ok(value)
    }
}

/// 列表值
impl<T: Clone + Send + Sync> Cache<Vec<T>> {
    /// 追加到列表末尾（不存在则新建），返回新长度
    pub fn lpush(&self, key: &str, items: impl IntoIterator<Item = T>) -> Result<usize> {
        self.update(key, |cur| {
            let mut list = cur.unwrap_or_default();
            list.extend(items);
            let n = list.len();
            (Some(list), n)
        })
    }

    /// 按下标取出一个元素；负下标从末尾数。取空的列表连同 key 一起删除
    pub fn pop(&self, key: &str, index: isize) -> Result<Option<T>> {
        self.update(key, |cur| {
            let Some(mut list) = cur else {
                return (None, None);
            };
            let len = list.len() as isize;
            let at = if index < 0 { len + index } else { index };
            if at < 0 || at >= len {
                return (if list.is_empty() { None } else { Some(list) }, None);
            }
            let item = list.remove(at as usize);
            let next = if list.is_empty() { None } else { Some(list) };
            (next, Some(item))
        })
    }
}

/// 计数器
impl Cache<i64> {
    /// 不存在时从 0 开始，返回新值
    pub fn inc(&self, key: &str, by: i64) -> Result<i64> {
        self.update(key, |cur| {
            let next = cur.unwrap_or(0) + by;
            (Some(next), next)
        })
    }

    pub fn dec(&self, key: &str, by: i64) -> Result<i64> {
        self.inc(key, -by)
    }
}
