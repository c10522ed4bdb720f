use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use super::bundle::{BundleStore, CacheBundle};
use super::lock_table::LockTable;
use super::version::CacheVersion;
use crate::error::Result;

fn schema_of<V>() -> &'static str {
    std::any::type_name::<V>()
}

struct Inner {
    store: BundleStore,
    locks: LockTable<String>,
}

/// 落盘的版本化缓存
///
/// 与进程内 `Cache` 不同，这里版本必须精确相等：磁盘上是别的版本就当 miss，
/// 重算后覆盖写，不会把旧结果当新的返回。
#[derive(Clone)]
pub struct DiskCache {
    inner: Arc<Inner>,
}

impl DiskCache {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            inner: Arc::new(Inner {
                store: BundleStore::new(dir),
                locks: LockTable::new(),
            }),
        }
    }

    pub fn dir(&self) -> &Path {
        self.inner.store.dir()
    }

    pub fn bundle_path(&self, key: &str) -> PathBuf {
        self.inner.store.path_for(key)
    }

    pub fn get<V: DeserializeOwned>(&self, key: &str, version: &CacheVersion) -> Result<Option<V>> {
        let Some(bundle) = self.inner.store.load_matching(key, version, schema_of::<V>())? else {
            return Ok(None);
        };
        match bincode::deserialize(&bundle.payload) {
            Ok(v) => Ok(Some(v)),
            Err(e) => {
                tracing::warn!("bundle `{}` payload undecodable: {}; treating as miss", key, e);
                Ok(None)
            }
        }
    }

    /// 同一 key 的写经由锁表串行化
    pub fn set<V: Serialize>(&self, key: &str, version: CacheVersion, value: &V) -> Result<()> {
        let _guard = self.inner.locks.lock(key.to_string());
        self.put(key, version, value)
    }

    /// 调用方已持有该 key 的闸门
    fn put<V: Serialize>(&self, key: &str, version: CacheVersion, value: &V) -> Result<()> {
        let payload = bincode::serialize(value)?;
        self.inner
            .store
            .write(&CacheBundle::new(key, version, schema_of::<V>(), payload))
    }

    /// 返回是否真的删掉了文件
    pub fn delete(&self, key: &str) -> Result<bool> {
        self.inner.store.remove(key)
    }

    pub fn clear(&self) -> Result<usize> {
        self.inner.store.clear()
    }

    /// 只看版本，不解 payload
    pub fn contains(&self, key: &str, version: &CacheVersion) -> Result<bool> {
        match self.inner.store.load(key) {
            Ok(Some(b)) => Ok(&b.meta.version == version),
            Ok(None) => Ok(false),
            Err(e) if matches!(e, crate::error::StagError::StaleCacheBundle { .. }) => Ok(false),
            Err(e) => Err(e),
        }
    }

    pub fn get_or_compute<V, F>(&self, key: &str, version: CacheVersion, compute: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned,
        F: FnOnce() -> Result<V>,
    {
        if let Some(v) = self.get(key, &version)? {
            tracing::debug!("disk cache hit: {}@{}", key, version);
            return Ok(v);
        }
        let _guard = self.inner.locks.lock(key.to_string());
        if let Some(v) = self.get(key, &version)? {
            return Ok(v);
        }
        tracing::debug!("disk cache miss: {}@{}", key, version);
        let value = compute()?;
        self.put(key, version, &value)?;
        Ok(value)
    }

    pub async fn get_async<V>(&self, key: &str, version: &CacheVersion) -> Result<Option<V>>
    where
        V: DeserializeOwned + Send + 'static,
    {
        let this = self.clone();
        let key = key.to_string();
        let version = version.clone();
        tokio::task::spawn_blocking(move || this.get(&key, &version)).await?
    }

    pub async fn set_async<V>(&self, key: &str, version: CacheVersion, value: V) -> Result<()>
    where
        V: Serialize + Send + 'static,
    {
        let _guard = self.inner.locks.lock_async(key.to_string()).await;
        self.put_async(key, version, value).await
    }

    async fn put_async<V>(&self, key: &str, version: CacheVersion, value: V) -> Result<()>
    where
        V: Serialize + Send + 'static,
    {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.put(&key, version, &value)).await?
    }

    pub async fn delete_async(&self, key: &str) -> Result<bool> {
        let this = self.clone();
        let key = key.to_string();
        tokio::task::spawn_blocking(move || this.delete(&key)).await?
    }

    pub async fn get_or_compute_async<V, F, Fut>(&self, key: &str, version: CacheVersion, compute: F) -> Result<V>
    where
        V: Serialize + DeserializeOwned + Clone + Send + 'static,
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<V>>,
    {
        if let Some(v) = self.get_async(key, &version).await? {
            tracing::debug!("disk cache hit: {}@{}", key, version);
            return Ok(v);
        }
        let _guard = self.inner.locks.lock_async(key.to_string()).await;
        if let Some(v) = self.get_async(key, &version).await? {
            return Ok(v);
        }
        tracing::debug!("disk cache miss: {}@{}", key, version);
        let value = compute().await?;
        self.put_async(key, version, value.clone()).await?;
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::time::Duration;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        std::env::temp_dir().join(format!("stagfs-diskcache-{}-{}", tag, nanos))
    }

    #[test]
    fn survives_a_new_instance() {
        let dir = unique_tmp_dir("restart");
        let calls = AtomicUsize::new(0);
        let compute = || {
            calls.fetch_add(1, Ordering::SeqCst);
            Ok(vec!["a".to_string(), "b".to_string()])
        };
        let first = DiskCache::new(&dir).get_or_compute("names", 1.into(), compute).unwrap();
        let second = DiskCache::new(&dir).get_or_compute("names", 1.into(), compute).unwrap();
        assert_eq!(first, second);
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn version_bump_recomputes_and_overwrites() {
        let dir = unique_tmp_dir("bump");
        let cache = DiskCache::new(&dir);
        cache.set("k", 1.into(), &10u32).unwrap();
        let v: u32 = cache.get_or_compute("k", 2.into(), || Ok(20)).unwrap();
        assert_eq!(v, 20);
        assert!(cache.contains("k", &2.into()).unwrap());
        assert!(!cache.contains("k", &1.into()).unwrap());
        // 回到旧版本也是 miss
        assert_eq!(cache.get::<u32>("k", &1.into()).unwrap(), None);
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn delete_reports_presence() {
        let dir = unique_tmp_dir("delete");
        let cache = DiskCache::new(&dir);
        cache.set("k", 1.into(), &"v").unwrap();
        assert!(cache.delete("k").unwrap());
        assert!(!cache.delete("k").unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn type_change_is_a_miss() {
        let dir = unique_tmp_dir("schema");
        let cache = DiskCache::new(&dir);
        cache.set("k", 1.into(), &5u64).unwrap();
        assert_eq!(cache.get::<String>("k", &1.into()).unwrap(), None);
        assert_eq!(cache.get::<u64>("k", &1.into()).unwrap(), Some(5));
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn async_round_trip() {
        let dir = unique_tmp_dir("async");
        let cache = DiskCache::new(&dir);
        let calls = AtomicUsize::new(0);
        for _ in 0..3 {
            let v = cache
                .get_or_compute_async("k", 4.into(), || async {
                    calls.fetch_add(1, Ordering::SeqCst);
                    Ok(b"payload".to_vec())
                })
                .await
                .unwrap();
            assert_eq!(v, b"payload");
        }
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(cache.delete_async("k").await.unwrap());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_sets_on_one_key_all_succeed() {
        let dir = unique_tmp_dir("race");
        let cache = DiskCache::new(&dir);
        let barrier = std::sync::Barrier::new(8);
        std::thread::scope(|scope| {
            let handles: Vec<_> = (0..8u8)
                .map(|i| {
                    let cache = &cache;
                    let barrier = &barrier;
                    scope.spawn(move || {
                        barrier.wait();
                        cache.set("k", 1.into(), &vec![i; 4 << 20])
                    })
                })
                .collect();
            for h in handles {
                h.join().unwrap().unwrap();
            }
        });
        let v: Vec<u8> = cache.get("k", &1.into()).unwrap().unwrap();
        assert_eq!(v.len(), 4 << 20);
        assert!(v.iter().all(|b| *b == v[0]));
        assert!(cache.inner.locks.is_empty());
        let _ = std::fs::remove_dir_all(&dir);
    }

    #[tokio::test]
    async fn cancelled_compute_releases_the_key() {
        let dir = unique_tmp_dir("cancel");
        let cache = DiskCache::new(&dir);
        let stuck = tokio::time::timeout(
            Duration::from_millis(50),
            cache.get_or_compute_async("k", 1.into(), || async {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                Ok(0u32)
            }),
        )
        .await;
        assert!(stuck.is_err());
        assert!(cache.inner.locks.is_empty());

        let v = tokio::time::timeout(
            Duration::from_secs(5),
            cache.get_or_compute_async("k", 1.into(), || async { Ok(7u32) }),
        )
        .await
        .expect("gate was left held")
        .unwrap();
        assert_eq!(v, 7);
        let _ = std::fs::remove_dir_all(&dir);
    }
}
