//! 统一的 Source / Sink 能力集
//!
//! 四种后端（disk / archive / web / cloud-blob）都实现同一组接口，
//! facade 只按 locator 的 scheme 从 registry 取后端，不做后端特判。

pub mod archive;
pub mod disk;
pub mod filter;
pub mod registry;
pub mod shared;
pub mod web;

use std::collections::BTreeSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::Result;

pub use filter::ListFilter;
pub use registry::{BackendFactory, Registry};
pub use shared::SharedArchives;

/// 源内的一个条目（不可变快照）
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Entry {
    /// 后端相对名，`/` 分隔
    pub name: String,
    pub size: u64,
    /// etag / crc / hash
    pub fingerprint: Option<String>,
    /// unix 秒
    pub modified: Option<u64>,
}

impl Entry {
    pub fn new(name: impl Into<String>, size: u64) -> Self {
        Self {
            name: name.into(),
            size,
            fingerprint: None,
            modified: None,
        }
    }

    pub fn with_fingerprint(mut self, fp: impl Into<String>) -> Self {
        self.fingerprint = Some(fp.into());
        self
    }
}

/// 惰性、可重启：每次 `list()` 都是一次新的列举
pub type EntryIter<'a> = Box<dyn Iterator<Item = Result<Entry>> + Send + 'a>;

pub trait Source: Send + Sync {
    fn list(&self) -> Result<EntryIter<'_>>;

    /// 不存在 -> `NotFound`
    fn read(&self, name: &str) -> Result<Vec<u8>>;

    fn exists(&self, name: &str) -> Result<bool> {
        match self.read(name) {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

/// 写端使用内部可变性，`&self` 即可写
pub trait Sink: Send + Sync {
    /// 覆盖写（幂等）
    fn store(&self, name: &str, data: &[u8]) -> Result<()>;

    /// 删除不存在的条目不是错误
    fn delete(&self, name: &str) -> Result<()>;

    fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// 异步列举的游标：一次取一页，`Ok(None)` = 列举结束
///
/// 不持有源的借用，可以在源之外单独推进；drop 即放弃剩余页。
#[async_trait]
pub trait EntryPager: Send {
    async fn next_page(&mut self) -> Result<Option<Vec<Entry>>>;
}

pub type EntryPages = Box<dyn EntryPager>;

/// 已经在内存里的列举（单页）
pub struct SinglePage(Option<Vec<Entry>>);

impl SinglePage {
    pub fn boxed(entries: Vec<Entry>) -> EntryPages {
        Box::new(SinglePage(Some(entries)))
    }
}

#[async_trait]
impl EntryPager for SinglePage {
    async fn next_page(&mut self) -> Result<Option<Vec<Entry>>> {
        Ok(self.0.take())
    }
}

/// 取完所有页；只在确实需要完整列举时用
pub async fn collect_pages(mut pages: EntryPages) -> Result<Vec<Entry>> {
    let mut out = Vec::new();
    while let Some(page) = pages.next_page().await? {
        out.extend(page);
    }
    Ok(out)
}

#[async_trait]
pub trait AsyncSource: Send + Sync {
    async fn list(&self) -> Result<EntryPages>;

    async fn read(&self, name: &str) -> Result<Vec<u8>>;

    async fn exists(&self, name: &str) -> Result<bool> {
        match self.read(name).await {
            Ok(_) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e),
        }
    }
}

#[async_trait]
pub trait AsyncSink: Send + Sync {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()>;

    async fn delete(&self, name: &str) -> Result<()>;

    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

/// `Blocking` 列举每页的条目数
const BLOCKING_PAGE: usize = 1000;

/// 阻塞线程上的同步迭代器按页送过来；channel 容量 1，消费端不取就不往下走
struct ChannelPager {
    rx: mpsc::Receiver<Result<Vec<Entry>>>,
}

#[async_trait]
impl EntryPager for ChannelPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Entry>>> {
        self.rx.recv().await.transpose()
    }
}

fn pump_pages(src: &dyn Source, tx: &mpsc::Sender<Result<Vec<Entry>>>) {
    let iter = match src.list() {
        Ok(iter) => iter,
        Err(e) => {
            let _ = tx.blocking_send(Err(e));
            return;
        }
    };
    let mut page = Vec::with_capacity(BLOCKING_PAGE);
    for item in iter {
        match item {
            Ok(entry) => page.push(entry),
            Err(e) => {
                let _ = tx.blocking_send(Err(e));
                return;
            }
        }
        if page.len() == BLOCKING_PAGE {
            // 接收端已 drop：调用方不要剩下的页了
            if tx.blocking_send(Ok(std::mem::take(&mut page))).is_err() {
                return;
            }
        }
    }
    if !page.is_empty() {
        let _ = tx.blocking_send(Ok(page));
    }
}

/// 把同步后端挂到 async 能力集上：每次调用进 `spawn_blocking`
pub struct Blocking<T: ?Sized>(pub Arc<T>);

impl<T: ?Sized> Blocking<T> {
    pub fn new(inner: Arc<T>) -> Self {
        Self(inner)
    }
}

#[async_trait]
impl AsyncSource for Blocking<dyn Source> {
    async fn list(&self) -> Result<EntryPages> {
        let src = self.0.clone();
        let (tx, rx) = mpsc::channel(1);
        tokio::task::spawn_blocking(move || pump_pages(src.as_ref(), &tx));
        Ok(Box::new(ChannelPager { rx }))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        let src = self.0.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || src.read(&name)).await?
    }

    async fn exists(&self, name: &str) -> Result<bool> {
        let src = self.0.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || src.exists(&name)).await?
    }
}

#[async_trait]
impl AsyncSink for Blocking<dyn Sink> {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        let sink = self.0.clone();
        let name = name.to_string();
        let data = data.to_vec();
        tokio::task::spawn_blocking(move || sink.store(&name, &data)).await?
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let sink = self.0.clone();
        let name = name.to_string();
        tokio::task::spawn_blocking(move || sink.delete(&name)).await?
    }

    async fn close(&self) -> Result<()> {
        let sink = self.0.clone();
        tokio::task::spawn_blocking(move || sink.close()).await?
    }
}

/// 列举统计
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ListingStats {
    pub total_files: u64,
    pub total_bytes: u64,
    pub total_dirs: u64,
}

impl ListingStats {
    pub fn from_entries<'a>(entries: impl IntoIterator<Item = &'a Entry>) -> Self {
        let mut stats = ListingStats::default();
        let mut dirs = BTreeSet::new();
        for e in entries {
            stats.total_files += 1;
            stats.total_bytes += e.size;
            let mut rest = e.name.as_str();
            while let Some((parent, _)) = rest.rsplit_once('/') {
                if !dirs.insert(parent.to_string()) {
                    break;
                }
                rest = parent;
            }
        }
        stats.total_dirs = dirs.len() as u64;
        stats
    }
}
