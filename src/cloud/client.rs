//! 云存储 wire client 的边界
//!
//! 真正的 SDK 是外部协作者；这里只定义它需要提供的能力，外加一个进程内实现
//! `MemoryBlobService`（测试和 `--memory-blob` 用）。

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use xxhash_rust::xxh3::xxh3_64;

use super::connection::ConnectionConfig;
use crate::cache::bundle::now_millis;
use crate::error::{Result, StagError};

#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ObjectInfo {
    pub name: String,
    pub size: u64,
    pub etag: String,
    /// unix 毫秒
    pub modified: Option<u64>,
}

/// 分页列举的一页；`next_marker == None` 表示最后一页
#[derive(Clone, Debug, Default)]
pub struct ObjectPage {
    pub items: Vec<ObjectInfo>,
    pub next_marker: Option<String>,
}

/// 阻塞 client（调用期间阻塞当前线程）
pub trait BlobClient: Send + Sync {
    fn list_objects(&self, container: &str, prefix: &str, marker: Option<&str>) -> Result<ObjectPage>;
    /// 不存在 -> `NotFound`
    fn get_object(&self, container: &str, name: &str) -> Result<Vec<u8>>;
    fn put_object(&self, container: &str, name: &str, data: &[u8]) -> Result<()>;
    /// 不存在 -> `NotFound`（是否忽略由后端决定）
    fn delete_object(&self, container: &str, name: &str) -> Result<()>;
    fn close(&self) -> Result<()> {
        Ok(())
    }
}

#[async_trait]
pub trait AsyncBlobClient: Send + Sync {
    async fn list_objects(&self, container: &str, prefix: &str, marker: Option<&str>) -> Result<ObjectPage>;
    async fn get_object(&self, container: &str, name: &str) -> Result<Vec<u8>>;
    async fn put_object(&self, container: &str, name: &str, data: &[u8]) -> Result<()>;
    async fn delete_object(&self, container: &str, name: &str) -> Result<()>;
    async fn close(&self) -> Result<()> {
        Ok(())
    }
}

pub trait BlobConnector: Send + Sync {
    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BlobClient>>;
}

#[async_trait]
pub trait AsyncBlobConnector: Send + Sync {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AsyncBlobClient>>;
}

// ===== 进程内实现 =====

#[derive(Clone)]
struct StoredObject {
    data: Arc<Vec<u8>>,
    etag: String,
    modified: u64,
}

/// (account, container, name) -> object
type ObjectKey = (String, String, String);

struct ServiceState {
    objects: RwLock<BTreeMap<ObjectKey, StoredObject>>,
    page_size: usize,
    available: AtomicBool,
    connects: AtomicUsize,
    closes: AtomicUsize,
    list_calls: AtomicUsize,
    get_calls: AtomicUsize,
}

/// 内存里的 blob 服务；clone 共享同一份数据
#[derive(Clone)]
pub struct MemoryBlobService {
    state: Arc<ServiceState>,
}

impl Default for MemoryBlobService {
    fn default() -> Self {
        Self::with_page_size(1000)
    }
}

impl MemoryBlobService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            state: Arc::new(ServiceState {
                objects: RwLock::new(BTreeMap::new()),
                page_size: page_size.max(1),
                available: AtomicBool::new(true),
                connects: AtomicUsize::new(0),
                closes: AtomicUsize::new(0),
                list_calls: AtomicUsize::new(0),
                get_calls: AtomicUsize::new(0),
            }),
        }
    }

    /// 模拟网络故障：之后所有调用返回 `BackendUnavailable`
    pub fn set_available(&self, up: bool) {
        self.state.available.store(up, Ordering::SeqCst);
    }

    /// 绕过 client 直接放对象（测试夹具）
    pub fn insert(&self, account: &str, container: &str, name: &str, data: &[u8]) {
        put(&self.state, account, container, name, data);
    }

    pub fn connects(&self) -> usize {
        self.state.connects.load(Ordering::SeqCst)
    }

    pub fn closes(&self) -> usize {
        self.state.closes.load(Ordering::SeqCst)
    }

    pub fn list_calls(&self) -> usize {
        self.state.list_calls.load(Ordering::SeqCst)
    }

    pub fn get_calls(&self) -> usize {
        self.state.get_calls.load(Ordering::SeqCst)
    }

    fn client(&self, config: &ConnectionConfig) -> Result<MemoryBlobClient> {
        check_up(&self.state)?;
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        tracing::info!("memory blob service: connected as `{}`", config.account);
        Ok(MemoryBlobClient {
            state: self.state.clone(),
            account: config.account.clone(),
            closed: AtomicBool::new(false),
        })
    }
}

fn check_up(state: &ServiceState) -> Result<()> {
    if state.available.load(Ordering::SeqCst) {
        Ok(())
    } else {
        Err(StagError::BackendUnavailable("blob service unreachable".into()))
    }
}

fn put(state: &ServiceState, account: &str, container: &str, name: &str, data: &[u8]) {
    let obj = StoredObject {
        data: Arc::new(data.to_vec()),
        etag: format!("{:016x}", xxh3_64(data)),
        modified: now_millis(),
    };
    state
        .objects
        .write()
        .insert((account.to_string(), container.to_string(), name.to_string()), obj);
}

impl BlobConnector for MemoryBlobService {
    fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn BlobClient>> {
        Ok(Arc::new(self.client(config)?))
    }
}

#[async_trait]
impl AsyncBlobConnector for MemoryBlobService {
    async fn connect(&self, config: &ConnectionConfig) -> Result<Arc<dyn AsyncBlobClient>> {
        Ok(Arc::new(self.client(config)?))
    }
}

pub struct MemoryBlobClient {
    state: Arc<ServiceState>,
    account: String,
    closed: AtomicBool,
}

impl MemoryBlobClient {
    fn check(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(StagError::BackendUnavailable("client closed".into()));
        }
        check_up(&self.state)
    }

    fn key(&self, container: &str, name: &str) -> ObjectKey {
        (self.account.clone(), container.to_string(), name.to_string())
    }

    fn list_page(&self, container: &str, prefix: &str, marker: Option<&str>) -> Result<ObjectPage> {
        self.check()?;
        self.state.list_calls.fetch_add(1, Ordering::SeqCst);
        let objects = self.state.objects.read();
        let start = self.key(container, marker.unwrap_or(""));
        let mut items = Vec::new();
        let mut next_marker = None;
        for ((acct, cont, name), obj) in objects.range(start..) {
            if acct != &self.account || cont != container {
                break;
            }
            // marker 是上一页最后一个名字，不含
            if marker == Some(name.as_str()) || !name.starts_with(prefix) {
                continue;
            }
            if items.len() == self.state.page_size {
                next_marker = items.last().map(|i: &ObjectInfo| i.name.clone());
                break;
            }
            items.push(ObjectInfo {
                name: name.clone(),
                size: obj.data.len() as u64,
                etag: obj.etag.clone(),
                modified: Some(obj.modified),
            });
        }
        Ok(ObjectPage { items, next_marker })
    }

    fn get(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        self.check()?;
        self.state.get_calls.fetch_add(1, Ordering::SeqCst);
        self.state
            .objects
            .read()
            .get(&self.key(container, name))
            .map(|o| (*o.data).clone())
            .ok_or_else(|| StagError::NotFound(format!("{}/{}", container, name)))
    }

    fn put(&self, container: &str, name: &str, data: &[u8]) -> Result<()> {
        self.check()?;
        put(&self.state, &self.account, container, name, data);
        Ok(())
    }

    fn delete(&self, container: &str, name: &str) -> Result<()> {
        self.check()?;
        match self.state.objects.write().remove(&self.key(container, name)) {
            Some(_) => Ok(()),
            None => Err(StagError::NotFound(format!("{}/{}", container, name))),
        }
    }

    fn shutdown(&self) -> Result<()> {
        if !self.closed.swap(true, Ordering::SeqCst) {
            self.state.closes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(())
    }
}

impl BlobClient for MemoryBlobClient {
    fn list_objects(&self, container: &str, prefix: &str, marker: Option<&str>) -> Result<ObjectPage> {
        self.list_page(container, prefix, marker)
    }

    fn get_object(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        self.get(container, name)
    }

    fn put_object(&self, container: &str, name: &str, data: &[u8]) -> Result<()> {
        self.put(container, name, data)
    }

    fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        self.delete(container, name)
    }

    fn close(&self) -> Result<()> {
        self.shutdown()
    }
}

#[async_trait]
impl AsyncBlobClient for MemoryBlobClient {
    async fn list_objects(&self, container: &str, prefix: &str, marker: Option<&str>) -> Result<ObjectPage> {
        tokio::task::yield_now().await;
        self.list_page(container, prefix, marker)
    }

    async fn get_object(&self, container: &str, name: &str) -> Result<Vec<u8>> {
        tokio::task::yield_now().await;
        self.get(container, name)
    }

    async fn put_object(&self, container: &str, name: &str, data: &[u8]) -> Result<()> {
        tokio::task::yield_now().await;
        self.put(container, name, data)
    }

    async fn delete_object(&self, container: &str, name: &str) -> Result<()> {
        tokio::task::yield_now().await;
        self.delete(container, name)
    }

    async fn close(&self) -> Result<()> {
        self.shutdown()
    }
}
