use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::error::{Result, StagError};

/// 阻塞式 GET
pub trait HttpFetcher: Send + Sync {
    fn get(&self, url: &str) -> Result<Vec<u8>>;
}

#[async_trait]
pub trait AsyncHttpFetcher: Send + Sync {
    async fn get(&self, url: &str) -> Result<Vec<u8>>;
}

/// reqwest 实现（rustls）
///
/// 阻塞 client 内部自带一个 runtime，不能在 async 上下文里创建或销毁，
/// 所以只在第一次同步调用时才建（调用方此时已经在阻塞线程上）。
pub struct ReqwestFetcher {
    client: reqwest::Client,
    blocking: Mutex<Option<reqwest::blocking::Client>>,
    timeout: Duration,
}

impl ReqwestFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .map_err(|e| StagError::BackendUnavailable(format!("http client: {}", e)))?;
        Ok(Self {
            client,
            blocking: Mutex::new(None),
            timeout,
        })
    }

    fn blocking_client(&self) -> Result<reqwest::blocking::Client> {
        let mut slot = self.blocking.lock();
        if let Some(c) = slot.as_ref() {
            return Ok(c.clone());
        }
        let c = reqwest::blocking::Client::builder()
            .timeout(self.timeout)
            .build()
            .map_err(|e| StagError::BackendUnavailable(format!("http client: {}", e)))?;
        *slot = Some(c.clone());
        Ok(c)
    }
}

fn status_error(url: &str, status: reqwest::StatusCode) -> StagError {
    if status == reqwest::StatusCode::NOT_FOUND {
        StagError::NotFound(url.to_string())
    } else {
        StagError::BackendUnavailable(format!("{}: HTTP {}", url, status))
    }
}

fn transport_error(url: &str, err: reqwest::Error) -> StagError {
    StagError::BackendUnavailable(format!("{}: {}", url, err))
}

impl HttpFetcher for ReqwestFetcher {
    fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .blocking_client()?
            .get(url)
            .send()
            .map_err(|e| transport_error(url, e))?;
        if !resp.status().is_success() {
            return Err(status_error(url, resp.status()));
        }
        let body = resp.bytes().map_err(|e| transport_error(url, e))?;
        Ok(body.to_vec())
    }
}

#[async_trait]
impl AsyncHttpFetcher for ReqwestFetcher {
    async fn get(&self, url: &str) -> Result<Vec<u8>> {
        let resp = self
            .client
            .get(url)
            .send()
            .await
            .map_err(|e| transport_error(url, e))?;
        if !resp.status().is_success() {
            return Err(status_error(url, resp.status()));
        }
        let body = resp.bytes().await.map_err(|e| transport_error(url, e))?;
        Ok(body.to_vec())
    }
}
