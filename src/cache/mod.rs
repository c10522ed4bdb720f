//! 缓存族
//!
//! - `Cache`：进程内，版本 >= 请求版本即命中，single-flight
//! - `DiskCache`：落盘 bundle，版本必须精确相等
//! - `WebCache`：按 URL，TTL 过期
//! - `FileListCache`：云容器列举，counter 作废 + 可选漂移校验

pub mod bundle;
pub mod disk;
pub mod file_list;
pub mod lock_table;
pub mod memory;
pub mod version;
pub mod web;

pub use bundle::{BundleMeta, BundleStore, CacheBundle};
pub use disk::DiskCache;
pub use file_list::{FileListCache, FileListKey, ListingRecord};
pub use lock_table::LockTable;
pub use memory::Cache;
pub use version::{CacheRef, CacheVersion};
pub use web::WebCache;
