//! 云容器后端
//!
//! 同步与 async 两个后端是各自独立的实现，只共享纯数据部分：
//! `ConnectionConfig`（连接串解析）和本文件里的命名换算。

pub mod async_backend;
pub mod client;
pub mod connection;
pub mod sync_backend;

pub use async_backend::{AsyncBlobPager, AsyncCloudBlobBackend};
pub use client::{
    AsyncBlobClient, AsyncBlobConnector, BlobClient, BlobConnector, MemoryBlobService, ObjectInfo, ObjectPage,
};
pub use connection::ConnectionConfig;
pub use sync_backend::CloudBlobBackend;

use crate::backend::Entry;
use crate::error::{Result, StagError};

/// 容器 + 前缀（后端实例的地址部分）
#[derive(Clone, Debug, PartialEq, Eq)]
pub(crate) struct BlobScope {
    pub container: String,
    pub prefix: String,
}

impl BlobScope {
    pub fn new(container: &str, prefix: &str) -> Result<Self> {
        if container.is_empty() {
            return Err(StagError::invalid(prefix, "cloud locator names no container"));
        }
        Ok(Self {
            container: container.to_string(),
            prefix: prefix.trim_matches('/').to_string(),
        })
    }

    /// list 时传给服务端的前缀
    pub fn list_prefix(&self) -> String {
        if self.prefix.is_empty() {
            String::new()
        } else {
            format!("{}/", self.prefix)
        }
    }

    pub fn blob_name(&self, name: &str) -> String {
        if self.prefix.is_empty() {
            name.to_string()
        } else {
            format!("{}/{}", self.prefix, name)
        }
    }

    pub fn entry(&self, info: ObjectInfo) -> Option<Entry> {
        let name = if self.prefix.is_empty() {
            info.name
        } else {
            info.name.strip_prefix(&self.list_prefix())?.to_string()
        };
        Some(Entry {
            name,
            size: info.size,
            fingerprint: Some(info.etag),
            modified: info.modified.map(|ms| ms / 1000),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn scope_maps_names_both_ways() {
        let scope = BlobScope::new("box", "/pre/").unwrap();
        assert_eq!(scope.blob_name("a.txt"), "pre/a.txt");
        assert_eq!(scope.list_prefix(), "pre/");
        let e = scope
            .entry(ObjectInfo {
                name: "pre/a.txt".into(),
                size: 3,
                etag: "e".into(),
                modified: Some(5_000),
            })
            .unwrap();
        assert_eq!(e.name, "a.txt");
        assert_eq!(e.modified, Some(5));
        assert!(BlobScope::new("", "x").is_err());
    }
}
