//! scheme -> factory 注册表
//!
//! 归档可以装在任意后端里（磁盘、云、Web，甚至另一个归档），归档 factory 打开外层
//! 容器时回到 registry 解析外层 locator，resolver 本身不认识任何后端。

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use super::archive::{ArchiveSink, ArchiveSource, AsyncArchiveSink, MemoryArchive};
use super::disk::DiskBackend;
use super::shared::{Invalidating, SharedArchives};
use super::web::WebSource;
use super::{AsyncSink, AsyncSource, Blocking, Sink, Source};
use crate::cache::{DiskCache, FileListCache, WebCache};
use crate::cloud::{AsyncBlobConnector, AsyncCloudBlobBackend, BlobConnector, CloudBlobBackend};
use crate::config::StagConfig;
use crate::error::{Result, StagError};
use crate::http::{AsyncHttpFetcher, HttpFetcher, ReqwestFetcher};
use crate::locator::{Locator, Resolver, Scheme};

/// 每个 scheme 一个 factory，locator 指向容器（目录 / 归档 / 云容器 / URL）
#[async_trait]
pub trait BackendFactory: Send + Sync {
    fn scheme(&self) -> Scheme;

    fn open_source(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn Source>>;

    fn open_sink(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn Sink>>;

    /// 默认：同步后端挂到阻塞线程上
    async fn open_source_async(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSource>> {
        Ok(Arc::new(Blocking::<dyn Source>::new(self.open_source(reg, locator)?)))
    }

    async fn open_sink_async(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSink>> {
        Ok(Arc::new(Blocking::<dyn Sink>::new(self.open_sink(reg, locator)?)))
    }
}

fn mismatch(scheme: Scheme, locator: &Locator) -> StagError {
    StagError::invalid(locator.to_string(), format!("not a {} locator", scheme.name()))
}

// ===== disk =====

struct DiskFactory;

impl DiskFactory {
    fn backend(locator: &Locator) -> Result<DiskBackend> {
        match locator {
            Locator::Disk { path } => Ok(DiskBackend::new(path)),
            other => Err(mismatch(Scheme::Disk, other)),
        }
    }
}

#[async_trait]
impl BackendFactory for DiskFactory {
    fn scheme(&self) -> Scheme {
        Scheme::Disk
    }

    fn open_source(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Source>> {
        Ok(Arc::new(Self::backend(locator)?))
    }

    fn open_sink(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Sink>> {
        Ok(Arc::new(Self::backend(locator)?))
    }
}

// ===== archive =====

struct ArchiveFactory;

fn archive_parts(locator: &Locator) -> Result<(Option<&Locator>, &str)> {
    match locator {
        Locator::Archive { outer, inner } => Ok((outer.as_deref(), inner.as_str())),
        other => Err(mismatch(Scheme::Archive, other)),
    }
}

fn existing_archive(read: Result<Vec<u8>>) -> Result<MemoryArchive> {
    match read {
        Ok(bytes) => MemoryArchive::from_bytes(bytes),
        Err(e) if e.is_not_found() => Ok(MemoryArchive::new()),
        Err(e) => Err(e),
    }
}

#[async_trait]
impl BackendFactory for ArchiveFactory {
    fn scheme(&self) -> Scheme {
        Scheme::Archive
    }

    fn open_source(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn Source>> {
        let (outer, inner) = archive_parts(locator)?;
        let source = match outer {
            None => return Err(StagError::invalid(locator.to_string(), "a memory archive has nothing to read")),
            Some(Locator::Disk { path }) => ArchiveSource::from_file(path.clone()),
            Some(o) => ArchiveSource::from_bytes(reg.outer_bytes(o)?),
        };
        Ok(Arc::new(source.with_prefix(inner)))
    }

    fn open_sink(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn Sink>> {
        let (outer, inner) = archive_parts(locator)?;
        let Some(outer) = outer else {
            return Ok(Arc::new(ArchiveSink::memory()));
        };
        let (container, name) = outer.split_entry()?;
        let existing = existing_archive(reg.read(outer))?;
        let target = reg.open_sink(&container)?;
        Ok(Arc::new(ArchiveSink::persisting_to(existing, target, name, inner)))
    }

    async fn open_source_async(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSource>> {
        let (outer, inner) = archive_parts(locator)?;
        let source = match outer {
            None => return Err(StagError::invalid(locator.to_string(), "a memory archive has nothing to read")),
            Some(Locator::Disk { path }) => ArchiveSource::from_file(path.clone()),
            Some(o) => ArchiveSource::from_bytes(reg.outer_bytes_async(o).await?),
        };
        let source: Arc<dyn Source> = Arc::new(source.with_prefix(inner));
        Ok(Arc::new(Blocking::new(source)))
    }

    async fn open_sink_async(&self, reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSink>> {
        let (outer, inner) = archive_parts(locator)?;
        let Some(outer) = outer else {
            let sink: Arc<dyn Sink> = Arc::new(ArchiveSink::memory());
            return Ok(Arc::new(Blocking::new(sink)));
        };
        let (container, name) = outer.split_entry()?;
        let existing = existing_archive(reg.read_async(outer).await)?;
        let target = reg.open_sink_async(&container).await?;
        Ok(Arc::new(AsyncArchiveSink::persisting_to(existing, target, name, inner)))
    }
}

// ===== web =====

struct WebFactory {
    cache: Arc<WebCache>,
    ttl: Duration,
}

impl WebFactory {
    fn source(&self, locator: &Locator) -> Result<WebSource> {
        match locator {
            Locator::Web { url } => Ok(WebSource::new(url.clone(), self.cache.clone(), self.ttl)),
            other => Err(mismatch(Scheme::Web, other)),
        }
    }
}

#[async_trait]
impl BackendFactory for WebFactory {
    fn scheme(&self) -> Scheme {
        Scheme::Web
    }

    fn open_source(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Source>> {
        Ok(Arc::new(self.source(locator)?))
    }

    fn open_sink(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Sink>> {
        Err(StagError::invalid(locator.to_string(), "web locators are read-only"))
    }

    async fn open_source_async(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSource>> {
        Ok(Arc::new(self.source(locator)?))
    }

    async fn open_sink_async(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSink>> {
        Err(StagError::invalid(locator.to_string(), "web locators are read-only"))
    }
}

// ===== cloud-blob =====

struct CloudFactory {
    connector: Arc<dyn BlobConnector>,
    async_connector: Arc<dyn AsyncBlobConnector>,
}

fn cloud_parts(locator: &Locator) -> Result<(&str, &str, &str)> {
    match locator {
        Locator::CloudBlob {
            connection,
            container,
            inner,
        } => Ok((connection, container, inner)),
        other => Err(mismatch(Scheme::CloudBlob, other)),
    }
}

impl CloudFactory {
    fn connect(&self, locator: &Locator) -> Result<Arc<CloudBlobBackend>> {
        let (conn, container, prefix) = cloud_parts(locator)?;
        Ok(Arc::new(CloudBlobBackend::connect(
            self.connector.as_ref(),
            conn,
            container,
            prefix,
        )?))
    }

    async fn connect_async(&self, locator: &Locator) -> Result<Arc<AsyncCloudBlobBackend>> {
        let (conn, container, prefix) = cloud_parts(locator)?;
        Ok(Arc::new(
            AsyncCloudBlobBackend::connect(self.async_connector.as_ref(), conn, container, prefix).await?,
        ))
    }
}

#[async_trait]
impl BackendFactory for CloudFactory {
    fn scheme(&self) -> Scheme {
        Scheme::CloudBlob
    }

    fn open_source(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Source>> {
        let backend: Arc<dyn Source> = self.connect(locator)?;
        Ok(backend)
    }

    fn open_sink(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn Sink>> {
        let backend: Arc<dyn Sink> = self.connect(locator)?;
        Ok(backend)
    }

    async fn open_source_async(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSource>> {
        let backend: Arc<dyn AsyncSource> = self.connect_async(locator).await?;
        Ok(backend)
    }

    async fn open_sink_async(&self, _reg: &Registry, locator: &Locator) -> Result<Arc<dyn AsyncSink>> {
        let backend: Arc<dyn AsyncSink> = self.connect_async(locator).await?;
        Ok(backend)
    }
}

// ===== registry =====

pub struct Registry {
    resolver: Resolver,
    factories: HashMap<Scheme, Arc<dyn BackendFactory>>,
    config: StagConfig,
    web_cache: Arc<WebCache>,
    file_lists: Arc<FileListCache>,
    archives: Arc<SharedArchives>,
    bundles: DiskCache,
}

impl Registry {
    /// 默认 HTTP client（reqwest）；云 scheme 需要再 `with_blob_service`
    pub fn new(config: StagConfig) -> Result<Self> {
        let fetcher = Arc::new(ReqwestFetcher::new(Duration::from_secs(config.web.timeout_secs))?);
        Ok(Self::with_fetchers(config, fetcher.clone(), fetcher))
    }

    pub fn with_fetchers(
        config: StagConfig,
        fetcher: Arc<dyn HttpFetcher>,
        async_fetcher: Arc<dyn AsyncHttpFetcher>,
    ) -> Self {
        let web_cache = Arc::new(WebCache::new(
            config.web_cache_dir(),
            &config.web,
            fetcher,
            async_fetcher,
        ));
        let file_lists = Arc::new(FileListCache::new(config.file_list_dir(), config.file_list.validate));
        let mut reg = Self {
            resolver: Resolver::new(&config.archive.extensions),
            factories: HashMap::new(),
            web_cache: web_cache.clone(),
            file_lists,
            archives: Arc::new(SharedArchives::new()),
            bundles: DiskCache::new(config.bundle_dir()),
            config,
        };
        reg.register(Arc::new(DiskFactory));
        reg.register(Arc::new(ArchiveFactory));
        reg.register(Arc::new(WebFactory {
            cache: web_cache,
            ttl: reg.config.web.default_ttl(),
        }));
        reg
    }

    /// 注册云容器的 wire client
    pub fn with_blob_service(
        mut self,
        connector: Arc<dyn BlobConnector>,
        async_connector: Arc<dyn AsyncBlobConnector>,
    ) -> Self {
        self.register(Arc::new(CloudFactory {
            connector,
            async_connector,
        }));
        self
    }

    /// 同 scheme 后注册的覆盖先注册的
    pub fn register(&mut self, factory: Arc<dyn BackendFactory>) {
        self.factories.insert(factory.scheme(), factory);
    }

    pub fn config(&self) -> &StagConfig {
        &self.config
    }

    pub fn web_cache(&self) -> &Arc<WebCache> {
        &self.web_cache
    }

    pub fn file_lists(&self) -> &Arc<FileListCache> {
        &self.file_lists
    }

    /// `$` key 的落盘层（`bundle_dir` 下）
    pub fn bundles(&self) -> &DiskCache {
        &self.bundles
    }

    /// 非磁盘外层容器的共享字节；registry 之外改了容器时在这里作废
    pub fn shared_archives(&self) -> &Arc<SharedArchives> {
        &self.archives
    }

    pub fn resolve(&self, identifier: &str) -> Result<Locator> {
        self.resolver.resolve(identifier)
    }

    fn factory(&self, locator: &Locator) -> Result<&Arc<dyn BackendFactory>> {
        let scheme = locator.scheme();
        self.factories.get(&scheme).ok_or_else(|| {
            StagError::BackendUnavailable(format!("no backend registered for `{}://`", scheme.name()))
        })
    }

    pub fn open_source(&self, container: &Locator) -> Result<Arc<dyn Source>> {
        tracing::debug!("open source: {}", container);
        self.factory(container)?.open_source(self, container)
    }

    pub fn open_sink(&self, container: &Locator) -> Result<Arc<dyn Sink>> {
        tracing::debug!("open sink: {}", container);
        let sink = self.factory(container)?.open_sink(self, container)?;
        Ok(Arc::new(Invalidating::new(sink, container.clone(), self.archives.clone())))
    }

    pub async fn open_source_async(&self, container: &Locator) -> Result<Arc<dyn AsyncSource>> {
        tracing::debug!("open async source: {}", container);
        self.factory(container)?.open_source_async(self, container).await
    }

    pub async fn open_sink_async(&self, container: &Locator) -> Result<Arc<dyn AsyncSink>> {
        tracing::debug!("open async sink: {}", container);
        let sink = self.factory(container)?.open_sink_async(self, container).await?;
        Ok(Arc::new(Invalidating::new(sink, container.clone(), self.archives.clone())))
    }

    /// 文件级 locator 的完整内容
    pub fn read(&self, locator: &Locator) -> Result<Vec<u8>> {
        let (container, name) = locator.split_entry()?;
        self.open_source(&container)?.read(&name)
    }

    pub async fn read_async(&self, locator: &Locator) -> Result<Vec<u8>> {
        let (container, name) = locator.split_entry()?;
        self.open_source_async(&container).await?.read(&name).await
    }

    fn shares(&self, outer: &Locator) -> bool {
        self.config.archive.share_remote && !matches!(outer, Locator::Disk { .. } | Locator::Web { .. })
    }

    /// 归档外层容器的字节：开了共享就整个 registry 只取一次
    ///
    /// Web 外层不进共享，由 `WebCache` 按 TTL 管。
    fn outer_bytes(&self, outer: &Locator) -> Result<Arc<[u8]>> {
        if !self.shares(outer) {
            return Ok(Arc::from(self.read(outer)?));
        }
        self.archives.get_or_load(outer, || self.read(outer))
    }

    async fn outer_bytes_async(&self, outer: &Locator) -> Result<Arc<[u8]>> {
        if !self.shares(outer) {
            return Ok(Arc::from(self.read_async(outer).await?));
        }
        self.archives.get_or_load_async(outer, || self.read_async(outer)).await
    }
}
