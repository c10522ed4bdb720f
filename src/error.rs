use thiserror::Error;

/// 统一错误类型（locator / backend / cache 共用）
///
/// 传播约定：
/// - `InvalidLocator` / `MissingCredential`：解析与连接阶段的错误，直接抛给调用方
/// - `StaleCacheBundle`：只在 cache 内部出现，读路径上降级为 miss，不会透出
/// - `BackendUnavailable`：传输层失败；file-list 校验探针遇到它时回退到已缓存列表
/// - `NotFound`：永远透出，不吞
#[derive(Debug, Error)]
pub enum StagError {
    #[error("invalid locator `{locator}`: {reason}")]
    InvalidLocator { locator: String, reason: String },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("missing credential: environment variable `{0}` is not set")]
    MissingCredential(String),

    #[error("stale cache bundle `{key}`: {reason}")]
    StaleCacheBundle { key: String, reason: String },

    #[error("backend unavailable: {0}")]
    BackendUnavailable(String),

    #[error("partial write of `{0}`")]
    PartialWrite(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error("archive error: {0}")]
    Archive(zip::result::ZipError),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Encode(#[from] bincode::Error),
}

pub type Result<T> = std::result::Result<T, StagError>;

impl StagError {
    pub fn invalid(locator: impl Into<String>, reason: impl Into<String>) -> Self {
        StagError::InvalidLocator {
            locator: locator.into(),
            reason: reason.into(),
        }
    }

    pub fn stale(key: impl Into<String>, reason: impl Into<String>) -> Self {
        StagError::StaleCacheBundle {
            key: key.into(),
            reason: reason.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            StagError::NotFound(_) => true,
            StagError::Io(e) => e.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }

    pub fn is_unavailable(&self) -> bool {
        matches!(self, StagError::BackendUnavailable(_))
    }

    /// 磁盘 IO 错误归一：ENOENT -> NotFound(name)
    pub fn from_io(err: std::io::Error, name: &str) -> Self {
        if err.kind() == std::io::ErrorKind::NotFound {
            StagError::NotFound(name.to_string())
        } else {
            StagError::Io(err)
        }
    }
}

impl From<zip::result::ZipError> for StagError {
    fn from(err: zip::result::ZipError) -> Self {
        match err {
            zip::result::ZipError::FileNotFound => StagError::NotFound("archive entry".into()),
            zip::result::ZipError::Io(e) => StagError::Io(e),
            other => StagError::Archive(other),
        }
    }
}

impl From<tokio::task::JoinError> for StagError {
    fn from(err: tokio::task::JoinError) -> Self {
        StagError::BackendUnavailable(format!("blocking task failed: {}", err))
    }
}
