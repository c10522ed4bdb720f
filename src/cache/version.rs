use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::StagError;

/// 可比较的版本标记：整数或元组，按字典序比较
///
/// 空版本是最小值，任何已存储的版本都不会被它作废。
#[derive(Clone, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheVersion(Vec<u64>);

impl CacheVersion {
    pub fn new(parts: Vec<u64>) -> Self {
        Self(parts)
    }

    pub fn parts(&self) -> &[u64] {
        &self.0
    }

    /// 命中规则：已存储版本不低于请求版本
    pub fn satisfies(&self, requested: &CacheVersion) -> bool {
        self >= requested
    }
}

impl From<u64> for CacheVersion {
    fn from(v: u64) -> Self {
        Self(vec![v])
    }
}

impl From<(u64, u64)> for CacheVersion {
    fn from((a, b): (u64, u64)) -> Self {
        Self(vec![a, b])
    }
}

impl From<(u64, u64, u64)> for CacheVersion {
    fn from((a, b, c): (u64, u64, u64)) -> Self {
        Self(vec![a, b, c])
    }
}

impl From<Vec<u64>> for CacheVersion {
    fn from(v: Vec<u64>) -> Self {
        Self(v)
    }
}

impl fmt::Display for CacheVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let parts: Vec<String> = self.0.iter().map(|p| p.to_string()).collect();
        f.write_str(&parts.join("."))
    }
}

impl FromStr for CacheVersion {
    type Err = StagError;

    /// `"3"` / `"1.2"`；空串 = 空版本
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        if s.is_empty() {
            return Ok(Self::default());
        }
        s.split('.')
            .map(|p| {
                p.parse::<u64>()
                    .map_err(|_| StagError::invalid(s, "version parts must be integers"))
            })
            .collect::<Result<Vec<_>, _>>()
            .map(Self)
    }
}

/// key + 版本
#[derive(Clone, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CacheRef {
    pub key: String,
    pub version: CacheVersion,
}

impl CacheRef {
    pub fn new(key: impl Into<String>, version: impl Into<CacheVersion>) -> Self {
        Self {
            key: key.into(),
            version: version.into(),
        }
    }

    /// `"name@1.2"` -> (name, 1.2)；没有 `@` 时版本为空
    pub fn parse(text: &str) -> Result<Self, StagError> {
        match text.rsplit_once('@') {
            Some((key, ver)) if !key.is_empty() => Ok(Self {
                key: key.to_string(),
                version: ver.parse()?,
            }),
            Some(_) => Err(StagError::invalid(text, "empty cache key")),
            None => Ok(Self {
                key: text.to_string(),
                version: CacheVersion::default(),
            }),
        }
    }
}

impl fmt::Display for CacheRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.key, self.version)
    }
}
