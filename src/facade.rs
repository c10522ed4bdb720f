//! 高层入口：按 locator 取后端并委托
//!
//! 所有操作都只经过 `Registry` + `Source`/`Sink` 能力集，
//! 这里没有任何按后端类型的分支。

use std::sync::Arc;

use rayon::prelude::*;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::{AsyncSink, AsyncSource, Entry, EntryPager, ListFilter, Registry, Sink, Source};
use crate::cache::{Cache, FileListKey};
use crate::config::StagConfig;
use crate::error::{Result, StagError};
use crate::locator::Locator;

pub struct Stag {
    registry: Arc<Registry>,
}

impl Stag {
    pub fn new(config: StagConfig) -> Result<Self> {
        Ok(Self::with_registry(Registry::new(config)?))
    }

    pub fn with_registry(registry: Registry) -> Self {
        Self {
            registry: Arc::new(registry),
        }
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    /// 进程内缓存，`$` 开头的 key 落到配置的 bundle 目录
    pub fn cache<V>(&self) -> Cache<V>
    where
        V: Clone + Send + Sync + Serialize + DeserializeOwned + 'static,
    {
        Cache::new().with_disk(self.registry.bundles().clone())
    }

    pub fn resolve(&self, identifier: &str) -> Result<Locator> {
        self.registry.resolve(identifier)
    }

    /// 容器级 locator -> 源（惰性列举用）
    pub fn open_source(&self, container: &str) -> Result<Arc<dyn Source>> {
        self.registry.open_source(&self.resolve(container)?)
    }

    /// 容器级 locator -> sink；用完必须 `close()`
    pub fn open_sink(&self, container: &str) -> Result<Arc<dyn Sink>> {
        self.registry.open_sink(&self.resolve(container)?)
    }

    // ===== bytes =====

    pub fn load_bytes(&self, identifier: &str) -> Result<Vec<u8>> {
        let loc = self.resolve(identifier)?;
        tracing::debug!("load {}", loc);
        self.registry.read(&loc)
    }

    pub fn save_bytes(&self, identifier: &str, data: &[u8]) -> Result<()> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        tracing::debug!("save {} ({} bytes)", loc, data.len());
        let sink = self.registry.open_sink(&container)?;
        sink.store(&name, data)?;
        sink.close()
    }

    pub fn exists(&self, identifier: &str) -> Result<bool> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        let found = self
            .registry
            .open_source(&container)
            .and_then(|src| src.exists(&name));
        match found {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }

    /// 不存在不是错误
    pub fn delete(&self, identifier: &str) -> Result<()> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        let sink = self.registry.open_sink(&container)?;
        sink.delete(&name)?;
        sink.close()
    }

    pub fn copy(&self, src: &str, dst: &str) -> Result<()> {
        let data = self.load_bytes(src)?;
        self.save_bytes(dst, &data)
    }

    // ===== text / json =====

    /// `crlf`：`Some(true)` 统一成 `\r\n`，`Some(false)` 统一成 `\n`，`None` 原样
    pub fn load_text(&self, identifier: &str, crlf: Option<bool>) -> Result<String> {
        let bytes = self.load_bytes(identifier)?;
        Ok(line_endings(decode_utf8(identifier, bytes)?, crlf))
    }

    pub fn save_text(&self, identifier: &str, text: &str, crlf: Option<bool>) -> Result<()> {
        self.save_bytes(identifier, line_endings(text.to_string(), crlf).as_bytes())
    }

    pub fn load_json<T: DeserializeOwned>(&self, identifier: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.load_bytes(identifier)?)?)
    }

    /// `indent == None` 输出紧凑格式
    pub fn save_json<T: Serialize + ?Sized>(&self, identifier: &str, value: &T, indent: Option<usize>) -> Result<()> {
        self.save_bytes(identifier, &encode_json(value, indent)?)
    }

    // ===== listing =====

    pub fn list(&self, container: &str, filter: &ListFilter) -> Result<Vec<Entry>> {
        let source = self.open_source(container)?;
        let entries = filter.apply(source.list()?).collect::<Result<Vec<_>>>()?;
        Ok(entries)
    }

    /// 经 file-list cache 的列举；key 自动按容器 scoped
    pub fn list_cached(&self, container: &str, key: &FileListKey, validate: Option<bool>) -> Result<Vec<Entry>> {
        let loc = self.resolve(container)?;
        let key = key.clone().scoped(&loc.identifier());
        let source = self.registry.open_source(&loc)?;
        self.registry.file_lists().get_or_list(&key, source.as_ref(), validate)
    }

    /// 丢掉某个容器的列举缓存（不论 counter）
    pub fn invalidate_list(&self, container: &str, key: &FileListKey) -> Result<bool> {
        let loc = self.resolve(container)?;
        self.registry
            .file_lists()
            .invalidate(&key.clone().scoped(&loc.identifier()))
    }

    /// 把 `src` 容器里的全部条目拷到 `dst` 容器，返回条目数
    pub fn copy_all(&self, src: &str, dst: &str) -> Result<usize> {
        let source = self.open_source(src)?;
        let entries = source.list()?.collect::<Result<Vec<_>>>()?;
        let sink = self.open_sink(dst)?;
        entries.par_iter().try_for_each(|e| {
            let data = source.read(&e.name)?;
            sink.store(&e.name, &data)
        })?;
        sink.close()?;
        tracing::info!("copied {} entries: {} -> {}", entries.len(), src, dst);
        Ok(entries.len())
    }

    // ===== async =====

    pub async fn open_source_async(&self, container: &str) -> Result<Arc<dyn AsyncSource>> {
        let loc = self.resolve(container)?;
        self.registry.open_source_async(&loc).await
    }

    pub async fn open_sink_async(&self, container: &str) -> Result<Arc<dyn AsyncSink>> {
        let loc = self.resolve(container)?;
        self.registry.open_sink_async(&loc).await
    }

    pub async fn load_bytes_async(&self, identifier: &str) -> Result<Vec<u8>> {
        let loc = self.resolve(identifier)?;
        tracing::debug!("load {}", loc);
        self.registry.read_async(&loc).await
    }

    pub async fn save_bytes_async(&self, identifier: &str, data: &[u8]) -> Result<()> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        tracing::debug!("save {} ({} bytes)", loc, data.len());
        let sink = self.registry.open_sink_async(&container).await?;
        sink.store(&name, data).await?;
        sink.close().await
    }

    pub async fn exists_async(&self, identifier: &str) -> Result<bool> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        let found = match self.registry.open_source_async(&container).await {
            Ok(src) => src.exists(&name).await,
            Err(e) => Err(e),
        };
        match found {
            Err(e) if e.is_not_found() => Ok(false),
            other => other,
        }
    }

    pub async fn delete_async(&self, identifier: &str) -> Result<()> {
        let loc = self.resolve(identifier)?;
        let (container, name) = loc.split_entry()?;
        let sink = self.registry.open_sink_async(&container).await?;
        sink.delete(&name).await?;
        sink.close().await
    }

    pub async fn copy_async(&self, src: &str, dst: &str) -> Result<()> {
        let data = self.load_bytes_async(src).await?;
        self.save_bytes_async(dst, &data).await
    }

    pub async fn load_text_async(&self, identifier: &str, crlf: Option<bool>) -> Result<String> {
        let bytes = self.load_bytes_async(identifier).await?;
        Ok(line_endings(decode_utf8(identifier, bytes)?, crlf))
    }

    pub async fn save_text_async(&self, identifier: &str, text: &str, crlf: Option<bool>) -> Result<()> {
        self.save_bytes_async(identifier, line_endings(text.to_string(), crlf).as_bytes())
            .await
    }

    pub async fn load_json_async<T: DeserializeOwned>(&self, identifier: &str) -> Result<T> {
        Ok(serde_json::from_slice(&self.load_bytes_async(identifier).await?)?)
    }

    pub async fn save_json_async<T: Serialize + ?Sized>(
        &self,
        identifier: &str,
        value: &T,
        indent: Option<usize>,
    ) -> Result<()> {
        let body = encode_json(value, indent)?;
        self.save_bytes_async(identifier, &body).await
    }

    /// 一页一页地取，够了就停
    pub async fn list_async(&self, container: &str, filter: &ListFilter) -> Result<Vec<Entry>> {
        let source = self.open_source_async(container).await?;
        let mut pages = source.list().await?;
        let mut out = Vec::new();
        while let Some(page) = pages.next_page().await? {
            if filter.collect_page(&mut out, page) {
                break;
            }
        }
        Ok(out)
    }

    pub async fn list_cached_async(
        &self,
        container: &str,
        key: &FileListKey,
        validate: Option<bool>,
    ) -> Result<Vec<Entry>> {
        let loc = self.resolve(container)?;
        let key = key.clone().scoped(&loc.identifier());
        let source = self.registry.open_source_async(&loc).await?;
        self.registry
            .file_lists()
            .get_or_list_async(&key, source.as_ref(), validate)
            .await
    }

    /// 边列举边拷贝，一次只持有一页；并发度由调用方自己控制
    pub async fn copy_all_async(&self, src: &str, dst: &str) -> Result<usize> {
        let source = self.open_source_async(src).await?;
        let mut pages = source.list().await?;
        let sink = self.open_sink_async(dst).await?;
        let mut copied = 0;
        while let Some(page) = pages.next_page().await? {
            for e in &page {
                let data = source.read(&e.name).await?;
                sink.store(&e.name, &data).await?;
            }
            copied += page.len();
        }
        sink.close().await?;
        tracing::info!("copied {} entries: {} -> {}", copied, src, dst);
        Ok(copied)
    }
}

fn decode_utf8(identifier: &str, bytes: Vec<u8>) -> Result<String> {
    String::from_utf8(bytes).map_err(|e| {
        StagError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidData,
            format!("{} is not valid utf-8: {}", identifier, e),
        ))
    })
}

fn line_endings(text: String, crlf: Option<bool>) -> String {
    match crlf {
        None => text,
        Some(false) => text.replace("\r\n", "\n"),
        Some(true) => text.replace("\r\n", "\n").replace('\n', "\r\n"),
    }
}

fn encode_json<T: Serialize + ?Sized>(value: &T, indent: Option<usize>) -> Result<Vec<u8>> {
    let Some(n) = indent else {
        return Ok(serde_json::to_vec(value)?);
    };
    let pad = vec![b' '; n];
    let mut out = Vec::new();
    let fmt = serde_json::ser::PrettyFormatter::with_indent(&pad);
    let mut ser = serde_json::Serializer::with_formatter(&mut out, fmt);
    value.serialize(&mut ser)?;
    Ok(out)
}
