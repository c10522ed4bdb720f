use std::collections::VecDeque;
use std::sync::Arc;

use parking_lot::Mutex;

use super::client::{BlobClient, BlobConnector};
use super::connection::ConnectionConfig;
use super::BlobScope;
use crate::backend::{Entry, EntryIter, Sink, Source};
use crate::error::{Result, StagError};

/// 阻塞式云容器后端
///
/// 构造时就建立连接（`{{env.*}}` 在这一步解析），直到 `close()`。
/// 推荐用 `scoped` 包住使用过程，保证任何退出路径都会关闭。
pub struct CloudBlobBackend {
    account: String,
    scope: BlobScope,
    client: Mutex<Option<Arc<dyn BlobClient>>>,
}

impl CloudBlobBackend {
    pub fn connect(connector: &dyn BlobConnector, connection: &str, container: &str, prefix: &str) -> Result<Self> {
        let scope = BlobScope::new(container, prefix)?;
        let config = ConnectionConfig::resolve(connection)?;
        let client = connector.connect(&config)?;
        tracing::info!("cloud-blob connected: {}/{}", config.account, scope.container);
        Ok(Self {
            account: config.account,
            scope,
            client: Mutex::new(Some(client)),
        })
    }

    /// enter/exit：`f` 无论成功失败都会 close
    pub fn scoped<T>(
        connector: &dyn BlobConnector,
        connection: &str,
        container: &str,
        prefix: &str,
        f: impl FnOnce(&CloudBlobBackend) -> Result<T>,
    ) -> Result<T> {
        let backend = Self::connect(connector, connection, container, prefix)?;
        let out = f(&backend);
        let closed = backend.close();
        match (out, closed) {
            (Ok(v), Ok(())) => Ok(v),
            (Ok(_), Err(e)) => Err(e),
            (Err(e), closed) => {
                if let Err(ce) = closed {
                    tracing::warn!("cloud-blob close after failure also failed: {}", ce);
                }
                Err(e)
            }
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn container(&self) -> &str {
        &self.scope.container
    }

    pub fn is_closed(&self) -> bool {
        self.client.lock().is_none()
    }

    fn client(&self) -> Result<Arc<dyn BlobClient>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| StagError::BackendUnavailable("cloud-blob backend already closed".into()))
    }

    /// 幂等
    pub fn close(&self) -> Result<()> {
        let client = self.client.lock().take();
        match client {
            Some(c) => {
                tracing::debug!("cloud-blob closing: {}/{}", self.account, self.scope.container);
                c.close()
            }
            None => Ok(()),
        }
    }
}

impl Drop for CloudBlobBackend {
    fn drop(&mut self) {
        if let Err(e) = self.close() {
            tracing::warn!("cloud-blob close on drop failed: {}", e);
        }
    }
}

/// 逐页拉取的惰性列举；同一时刻最多持有一页
struct BlobListing {
    client: Arc<dyn BlobClient>,
    scope: BlobScope,
    list_prefix: String,
    marker: Option<String>,
    buffer: VecDeque<Entry>,
    done: bool,
}

impl BlobListing {
    fn fill(&mut self) -> Result<()> {
        let page = self
            .client
            .list_objects(&self.scope.container, &self.list_prefix, self.marker.as_deref())?;
        self.marker = page.next_marker;
        self.done = self.marker.is_none();
        let scope = &self.scope;
        self.buffer
            .extend(page.items.into_iter().filter_map(|i| scope.entry(i)));
        Ok(())
    }
}

impl Iterator for BlobListing {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            if let Some(e) = self.buffer.pop_front() {
                return Some(Ok(e));
            }
            if self.done {
                return None;
            }
            if let Err(e) = self.fill() {
                self.done = true;
                return Some(Err(e));
            }
        }
    }
}

impl Source for CloudBlobBackend {
    fn list(&self) -> Result<EntryIter<'_>> {
        Ok(Box::new(BlobListing {
            client: self.client()?,
            scope: self.scope.clone(),
            list_prefix: self.scope.list_prefix(),
            marker: None,
            buffer: VecDeque::new(),
            done: false,
        }))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.client()?
            .get_object(&self.scope.container, &self.scope.blob_name(name))
    }
}

impl Sink for CloudBlobBackend {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.client()?
            .put_object(&self.scope.container, &self.scope.blob_name(name), data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        match self
            .client()?
            .delete_object(&self.scope.container, &self.scope.blob_name(name))
        {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    fn close(&self) -> Result<()> {
        CloudBlobBackend::close(self)
    }
}
