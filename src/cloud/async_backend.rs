use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;

use super::client::{AsyncBlobClient, AsyncBlobConnector};
use super::connection::ConnectionConfig;
use super::BlobScope;
use crate::backend::{AsyncSink, AsyncSource, Entry, EntryPager, EntryPages};
use crate::error::{Result, StagError};

/// async 云容器后端
///
/// 每个操作都是挂起点；多个实例可以在同一个 runtime 上同时有未完成的调用。
/// 与 `CloudBlobBackend` 没有继承关系，只共享 `ConnectionConfig` / `BlobScope`。
pub struct AsyncCloudBlobBackend {
    account: String,
    scope: BlobScope,
    client: Mutex<Option<Arc<dyn AsyncBlobClient>>>,
}

impl AsyncCloudBlobBackend {
    pub async fn connect(
        connector: &dyn AsyncBlobConnector,
        connection: &str,
        container: &str,
        prefix: &str,
    ) -> Result<Self> {
        let scope = BlobScope::new(container, prefix)?;
        let config = ConnectionConfig::resolve(connection)?;
        let client = connector.connect(&config).await?;
        tracing::info!("cloud-blob (async) connected: {}/{}", config.account, scope.container);
        Ok(Self {
            account: config.account,
            scope,
            client: Mutex::new(Some(client)),
        })
    }

    /// enter/exit：`f` 结束（含出错）后 close
    pub async fn scoped<T, F, Fut>(
        connector: &dyn AsyncBlobConnector,
        connection: &str,
        container: &str,
        prefix: &str,
        f: F,
    ) -> Result<T>
    where
        F: FnOnce(Arc<AsyncCloudBlobBackend>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let backend = Arc::new(Self::connect(connector, connection, container, prefix).await?);
        let out = f(backend.clone()).await;
        let closed = backend.close().await;
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

    fn client(&self) -> Result<Arc<dyn AsyncBlobClient>> {
        self.client
            .lock()
            .clone()
            .ok_or_else(|| StagError::BackendUnavailable("cloud-blob backend already closed".into()))
    }

    /// 幂等
    pub async fn close(&self) -> Result<()> {
        let client = self.client.lock().take();
        match client {
            Some(c) => {
                tracing::debug!("cloud-blob (async) closing: {}/{}", self.account, self.scope.container);
                c.close().await
            }
            None => Ok(()),
        }
    }

    /// 一页一页取；不会一次持有整个列举
    pub fn pager(&self) -> Result<AsyncBlobPager> {
        Ok(AsyncBlobPager {
            client: self.client()?,
            scope: self.scope.clone(),
            list_prefix: self.scope.list_prefix(),
            marker: None,
            done: false,
        })
    }
}

impl Drop for AsyncCloudBlobBackend {
    fn drop(&mut self) {
        let Some(client) = self.client.lock().take() else {
            return;
        };
        // 没有显式 close：有 runtime 就把 close 交给它，否则直接释放
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = client.close().await {
                        tracing::warn!("cloud-blob close on drop failed: {}", e);
                    }
                });
            }
            Err(_) => tracing::warn!("cloud-blob backend dropped outside a runtime without close()"),
        }
    }
}

pub struct AsyncBlobPager {
    client: Arc<dyn AsyncBlobClient>,
    scope: BlobScope,
    list_prefix: String,
    marker: Option<String>,
    done: bool,
}

#[async_trait]
impl EntryPager for AsyncBlobPager {
    async fn next_page(&mut self) -> Result<Option<Vec<Entry>>> {
        if self.done {
            return Ok(None);
        }
        let page = self
            .client
            .list_objects(&self.scope.container, &self.list_prefix, self.marker.as_deref())
            .await?;
        self.marker = page.next_marker;
        self.done = self.marker.is_none();
        let scope = &self.scope;
        Ok(Some(page.items.into_iter().filter_map(|i| scope.entry(i)).collect()))
    }
}

#[async_trait]
impl AsyncSource for AsyncCloudBlobBackend {
    async fn list(&self) -> Result<EntryPages> {
        Ok(Box::new(self.pager()?))
    }

    async fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.client()?
            .get_object(&self.scope.container, &self.scope.blob_name(name))
            .await
    }
}

#[async_trait]
impl AsyncSink for AsyncCloudBlobBackend {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.client()?
            .put_object(&self.scope.container, &self.scope.blob_name(name), data)
            .await
    }

    async fn delete(&self, name: &str) -> Result<()> {
        let result = self
            .client()?
            .delete_object(&self.scope.container, &self.scope.blob_name(name))
            .await;
        match result {
            Err(e) if e.is_not_found() => Ok(()),
            other => other,
        }
    }

    async fn close(&self) -> Result<()> {
        AsyncCloudBlobBackend::close(self).await
    }
}
