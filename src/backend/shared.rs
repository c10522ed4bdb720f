//! 非磁盘外层容器的共享字节
//!
//! 云上（或另一个归档里）的归档每次打开都整段下载代价太高：同一个外层 locator 的字节在
//! registry 里只取一次，之后所有 `ArchiveSource` 共享同一份 `Arc<[u8]>`。
//! 经本 registry 打开的 sink 写入或删除某个条目时，对应的外层字节随之作废；
//! registry 之外发生的改动要调用方显式 `invalidate`。

use std::future::Future;
use std::sync::Arc;

use super::{AsyncSink, Sink};
use crate::cache::{Cache, CacheVersion};
use crate::error::Result;
use crate::locator::Locator;

use async_trait::async_trait;

/// key = 外层 locator 的完整标识
#[derive(Default)]
pub struct SharedArchives {
    bytes: Cache<Arc<[u8]>>,
}

impl SharedArchives {
    pub fn new() -> Self {
        Self::default()
    }

    /// 同一 locator 的并发加载只跑一次 `load`
    pub fn get_or_load<F>(&self, outer: &Locator, load: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce() -> Result<Vec<u8>>,
    {
        self.bytes
            .get_or_compute(&outer.identifier(), CacheVersion::default(), || load().map(Arc::from))
    }

    pub async fn get_or_load_async<F, Fut>(&self, outer: &Locator, load: F) -> Result<Arc<[u8]>>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Vec<u8>>>,
    {
        self.bytes
            .get_or_compute_async(&outer.identifier(), CacheVersion::default(), || async move {
                load().await.map(Arc::from)
            })
            .await
    }

    pub fn is_loaded(&self, outer: &Locator) -> bool {
        self.bytes.contains(&outer.identifier(), &CacheVersion::default())
    }

    /// 返回是否真的丢掉了一份字节
    pub fn invalidate(&self, outer: &Locator) -> bool {
        let key = outer.identifier();
        // 内存 key 不会走磁盘层，remove 不会失败
        let dropped = self.bytes.remove(&key).unwrap_or(false);
        if dropped {
            tracing::debug!("shared archive dropped: {}", outer);
        }
        dropped
    }

    pub fn clear(&self) {
        self.bytes.clear();
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    fn invalidate_child(&self, container: &Locator, name: &str) {
        if let Ok(outer) = container.child(name) {
            self.invalidate(&outer);
        }
    }
}

/// 写穿 sink，写完作废对应条目的共享字节
pub(crate) struct Invalidating<S: ?Sized> {
    inner: Arc<S>,
    container: Locator,
    shared: Arc<SharedArchives>,
}

impl<S: ?Sized> Invalidating<S> {
    pub(crate) fn new(inner: Arc<S>, container: Locator, shared: Arc<SharedArchives>) -> Self {
        Self {
            inner,
            container,
            shared,
        }
    }
}

impl Sink for Invalidating<dyn Sink> {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let out = self.inner.store(name, data);
        self.shared.invalidate_child(&self.container, name);
        out
    }

    fn delete(&self, name: &str) -> Result<()> {
        let out = self.inner.delete(name);
        self.shared.invalidate_child(&self.container, name);
        out
    }

    fn close(&self) -> Result<()> {
        self.inner.close()
    }
}

#[async_trait]
impl AsyncSink for Invalidating<dyn AsyncSink> {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let out = self.inner.store(name, data).await;
        self.shared.invalidate_child(&self.container, name);
        out
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let out = self.inner.delete(name).await;
        self.shared.invalidate_child(&self.container, name);
        out
    }

    async fn close(&self) -> Result<()> {
        self.inner.close().await
    }
}
