use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use super::bundle::{now_millis, BundleStore, CacheBundle};
use super::lock_table::LockTable;
use super::version::CacheVersion;
use crate::config::WebConfig;
use crate::error::{Result, StagError};
use crate::http::{AsyncHttpFetcher, HttpFetcher};

const SCHEMA: &str = "web-body";

/// Web 抓取缓存：每个 URL 一个 bundle，按 TTL 过期（不走版本比较）
///
/// - `ttl == 0`：永远重新抓取
/// - 同一个 URL 的并发请求只抓一次
/// - `cleanup()`：删掉超过 `max_general_age` 的文件，总量超过 `max_cache_size` 时整体清空
pub struct WebCache {
    store: BundleStore,
    locks: LockTable<String>,
    fetcher: Arc<dyn HttpFetcher>,
    async_fetcher: Arc<dyn AsyncHttpFetcher>,
    default_ttl: Duration,
    max_general_age: Duration,
    max_cache_size: u64,
}

fn version() -> CacheVersion {
    CacheVersion::default()
}

impl WebCache {
    pub fn new(
        dir: impl Into<PathBuf>,
        config: &WebConfig,
        fetcher: Arc<dyn HttpFetcher>,
        async_fetcher: Arc<dyn AsyncHttpFetcher>,
    ) -> Self {
        Self {
            store: BundleStore::new(dir),
            locks: LockTable::new(),
            fetcher,
            async_fetcher,
            default_ttl: config.default_ttl(),
            max_general_age: config.max_general_age(),
            max_cache_size: config.max_cache_size,
        }
    }

    pub fn default_ttl(&self) -> Duration {
        self.default_ttl
    }

    /// 任意年龄的缓存记录；损坏的当作没有
    pub fn find(&self, url: &str) -> Result<Option<CacheBundle>> {
        self.store.load_matching(url, &version(), SCHEMA)
    }

    pub fn store(&self, url: &str, body: &[u8]) -> Result<()> {
        self.store
            .write(&CacheBundle::new(url, version(), SCHEMA, body.to_vec()))
    }

    /// `max_age == None` 用默认 TTL
    pub fn fetch(&self, url: &str, max_age: Option<Duration>) -> Result<Vec<u8>> {
        self.get_or_fetch(url, max_age.unwrap_or(self.default_ttl))
    }

    fn fresh(bundle: &CacheBundle, ttl: Duration) -> bool {
        (bundle.age_millis() as u128) < ttl.as_millis()
    }

    pub fn get_or_fetch(&self, url: &str, ttl: Duration) -> Result<Vec<u8>> {
        if let Some(b) = self.find(url)? {
            if Self::fresh(&b, ttl) {
                tracing::debug!("web cache hit: {}", url);
                return Ok(b.payload);
            }
        }
        let _guard = self.locks.lock(url.to_string());
        if let Some(b) = self.find(url)? {
            // 等待期间别人刚抓过（ttl 为 0 时仍然重抓）
            if Self::fresh(&b, ttl) {
                return Ok(b.payload);
            }
        }
        tracing::debug!("web cache fetch: {}", url);
        let body = self.fetcher.get(url)?;
        self.store(url, &body)?;
        Ok(body)
    }

    pub async fn get_or_fetch_async(&self, url: &str, ttl: Duration) -> Result<Vec<u8>> {
        if let Some(b) = self.find_async(url).await? {
            if Self::fresh(&b, ttl) {
                tracing::debug!("web cache hit: {}", url);
                return Ok(b.payload);
            }
        }
        let _guard = self.locks.lock_async(url.to_string()).await;
        if let Some(b) = self.find_async(url).await? {
            if Self::fresh(&b, ttl) {
                return Ok(b.payload);
            }
        }
        tracing::debug!("web cache fetch: {}", url);
        let body = self.async_fetcher.get(url).await?;
        let store = self.store.clone();
        let bundle = CacheBundle::new(url, version(), SCHEMA, body.clone());
        tokio::task::spawn_blocking(move || store.write(&bundle)).await??;
        Ok(body)
    }

    async fn find_async(&self, url: &str) -> Result<Option<CacheBundle>> {
        let store = self.store.clone();
        let url = url.to_string();
        tokio::task::spawn_blocking(move || store.load_matching(&url, &version(), SCHEMA)).await?
    }

    pub fn total_size(&self) -> Result<u64> {
        Ok(self.store.files()?.iter().map(|(_, size, _)| *size).sum())
    }

    pub fn flush(&self) -> Result<usize> {
        let n = self.store.clear()?;
        tracing::info!("web cache flushed: {} files", n);
        Ok(n)
    }

    pub fn cleanup(&self) -> Result<()> {
        let cutoff = now_millis().saturating_sub(self.max_general_age.as_millis() as u64);
        let mut total = 0u64;
        let mut removed = 0usize;
        for (path, size, modified) in self.store.files()? {
            if modified < cutoff {
                match std::fs::remove_file(&path) {
                    Ok(()) => removed += 1,
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                    Err(e) => return Err(StagError::Io(e)),
                }
            } else {
                total += size;
            }
        }
        if removed > 0 {
            tracing::info!("web cache cleanup: {} expired files removed", removed);
        }
        if total > self.max_cache_size {
            tracing::info!("web cache over budget ({} > {}), flushing", total, self.max_cache_size);
            self.flush()?;
        }
        Ok(())
    }
}
