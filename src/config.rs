use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::error::{Result, StagError};

pub const ENV_CACHE_DIR: &str = "STAGFS_CACHE_DIR";
pub const ENV_CONFIG: &str = "STAGFS_CONFIG";

/// 运行期配置（TOML）
///
/// ```toml
/// cache_dir = "/var/cache/stagfs"
///
/// [web]
/// default_ttl_secs = 600
///
/// [archive]
/// extensions = ["zip", "whl"]
/// share_remote = true
/// ```
#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct StagConfig {
    pub cache_dir: PathBuf,
    pub web: WebConfig,
    pub archive: ArchiveConfig,
    pub file_list: FileListConfig,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    /// facade 默认 TTL（0 = 每次都重新抓取）
    pub default_ttl_secs: u64,
    /// 任何缓存文件的最长寿命，cleanup 时清掉
    pub max_general_age_secs: u64,
    /// 超过后整体 flush
    pub max_cache_size: u64,
    pub timeout_secs: u64,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
#[serde(default)]
pub struct ArchiveConfig {
    /// 判定容器边界的扩展名（不含点，小写）
    pub extensions: Vec<String>,
    /// 云 / Web 上的外层容器字节在进程内共享，只下载一次
    pub share_remote: bool,
}

#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FileListConfig {
    pub validate: bool,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self {
            default_ttl_secs: 60 * 60,
            max_general_age_secs: 60 * 60 * 7,
            max_cache_size: 200_000_000,
            timeout_secs: 30,
        }
    }
}

impl Default for ArchiveConfig {
    fn default() -> Self {
        Self {
            extensions: vec!["zip".to_string()],
            share_remote: true,
        }
    }
}

impl Default for StagConfig {
    fn default() -> Self {
        Self {
            cache_dir: default_cache_dir(),
            web: WebConfig::default(),
            archive: ArchiveConfig::default(),
            file_list: FileListConfig::default(),
        }
    }
}

impl WebConfig {
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.default_ttl_secs)
    }

    pub fn max_general_age(&self) -> Duration {
        Duration::from_secs(self.max_general_age_secs)
    }
}

impl StagConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|e| StagError::from_io(e, &path.display().to_string()))?;
        toml::from_str(&text).map_err(|e| StagError::invalid(path.display().to_string(), e.to_string()))
    }

    /// 默认值 + `STAGFS_CONFIG` 指向的 TOML + `STAGFS_CACHE_DIR` 覆盖
    pub fn from_env() -> Result<Self> {
        let mut cfg = match std::env::var_os(ENV_CONFIG) {
            Some(p) => Self::load(Path::new(&p))?,
            None => Self::default(),
        };
        if let Some(dir) = std::env::var_os(ENV_CACHE_DIR) {
            cfg.cache_dir = PathBuf::from(dir);
        }
        Ok(cfg)
    }

    pub fn with_cache_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cache_dir = dir.into();
        self
    }

    pub fn web_cache_dir(&self) -> PathBuf {
        self.cache_dir.join("web")
    }

    pub fn bundle_dir(&self) -> PathBuf {
        self.cache_dir.join("bundles")
    }

    pub fn file_list_dir(&self) -> PathBuf {
        self.cache_dir.join("file-lists")
    }
}

pub fn default_cache_dir() -> PathBuf {
    dirs::cache_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("stagfs")
}
