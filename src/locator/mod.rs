//! Scheme 前缀路径解析
//!
//! 语法：
//! - `<path>` / `file://<path>`                              磁盘
//! - `archive://<outer-locator>/<inner-path>`（别名 `zip://`）  归档条目；outer 本身是完整 locator（递归）
//! - `http://<url>` / `https://<url>`                         Web 资源
//! - `cloud-blob://<conn>/<container>/<inner>`（别名 `azure://`）云容器对象
//!
//! 解析是纯函数：只看字符串本身，不访问任何存储，也不替换 `{{env.*}}`
//! （占位符在连接时才解析，见 `cloud::connection`）。

pub mod env;

use std::fmt;
use std::path::{Path, PathBuf};

use crate::error::{Result, StagError};

pub use env::{insert_environment_data, resolve_placeholders};

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Scheme {
    Disk,
    Archive,
    Web,
    CloudBlob,
}

impl Scheme {
    pub fn name(self) -> &'static str {
        match self {
            Scheme::Disk => "file",
            Scheme::Archive => "archive",
            Scheme::Web => "http",
            Scheme::CloudBlob => "cloud-blob",
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Locator {
    Disk {
        path: PathBuf,
    },
    /// `outer == None`：纯内存归档（只能作为 sink）
    Archive {
        outer: Option<Box<Locator>>,
        inner: String,
    },
    Web {
        url: String,
    },
    CloudBlob {
        connection: String,
        container: String,
        inner: String,
    },
}

/// 解析器：只持有“哪些扩展名算归档容器”这一条规则
#[derive(Clone, Debug)]
pub struct Resolver {
    archive_exts: Vec<String>,
}

impl Default for Resolver {
    fn default() -> Self {
        Self::new(["zip"])
    }
}

impl Resolver {
    pub fn new<I, S>(exts: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<str>,
    {
        Self {
            archive_exts: exts
                .into_iter()
                .map(|e| e.as_ref().trim_start_matches('.').to_ascii_lowercase())
                .collect(),
        }
    }

    pub fn resolve(&self, identifier: &str) -> Result<Locator> {
        self.resolve_at(identifier, false)
    }

    /// `nested`：作为另一个归档的 outer，必须指向一个条目（容器边界不能落在末尾）
    fn resolve_at(&self, identifier: &str, nested: bool) -> Result<Locator> {
        if identifier.is_empty() {
            return Err(StagError::invalid(identifier, "empty locator"));
        }
        let Some((scheme, rest)) = split_scheme(identifier) else {
            return Ok(Locator::Disk {
                path: PathBuf::from(identifier),
            });
        };
        match scheme.to_ascii_lowercase().as_str() {
            "file" => {
                if rest.is_empty() {
                    return Err(StagError::invalid(identifier, "file:// without a path"));
                }
                Ok(Locator::Disk {
                    path: PathBuf::from(rest),
                })
            }
            "archive" | "zip" => self.resolve_archive(identifier, rest, nested),
            "http" | "https" => {
                if rest.is_empty() {
                    return Err(StagError::invalid(identifier, "url without host"));
                }
                Ok(Locator::Web {
                    url: identifier.to_string(),
                })
            }
            "cloud-blob" | "azure" => resolve_cloud(identifier, rest),
            other => Err(StagError::invalid(
                identifier,
                format!("unsupported scheme `{}`", other),
            )),
        }
    }

    fn resolve_archive(&self, identifier: &str, rest: &str, nested: bool) -> Result<Locator> {
        if rest.is_empty() {
            return Ok(Locator::Archive {
                outer: None,
                inner: String::new(),
            });
        }
        let (outer_str, inner) = match self.container_boundary(rest, nested) {
            Some(end) => (&rest[..end], rest[end..].trim_start_matches('/')),
            None => (rest, ""),
        };
        let outer = self.resolve_at(outer_str, true)?;
        if let Locator::Archive { outer: None, .. } = outer {
            return Err(StagError::invalid(
                identifier,
                "a memory archive cannot be the outer container",
            ));
        }
        if let Locator::Web { .. } = outer {
            if outer_str.ends_with('/') {
                return Err(StagError::invalid(identifier, "web locator is not a container"));
            }
        }
        Ok(Locator::Archive {
            outer: Some(Box::new(outer)),
            inner: normalize_inner(inner),
        })
    }

    /// 最后一个“扩展名命中归档列表”的路径段的结束位置
    fn container_boundary(&self, rest: &str, skip_tail: bool) -> Option<usize> {
        let mut best = None;
        let mut seg_start = 0usize;
        for (i, c) in rest.char_indices().chain(std::iter::once((rest.len(), '/'))) {
            if c != '/' {
                continue;
            }
            let seg = &rest[seg_start..i];
            if self.is_archive_segment(seg) && !(skip_tail && i == rest.len()) {
                best = Some(i);
            }
            seg_start = i + 1;
        }
        best
    }

    fn is_archive_segment(&self, seg: &str) -> bool {
        let Some((stem, ext)) = seg.rsplit_once('.') else {
            return false;
        };
        !stem.is_empty() && self.archive_exts.iter().any(|e| e.eq_ignore_ascii_case(ext))
    }
}

/// 默认解析器（扩展名 `zip`）
pub fn resolve(identifier: &str) -> Result<Locator> {
    Resolver::default().resolve(identifier)
}

fn split_scheme(identifier: &str) -> Option<(&str, &str)> {
    let pos = identifier.find("://")?;
    let scheme = &identifier[..pos];
    let valid = !scheme.is_empty()
        && scheme
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '+' || c == '.');
    if !valid {
        return None;
    }
    Some((scheme, &identifier[pos + 3..]))
}

/// `conn/container/inner`：conn 可能含 `/`（base64 key），
/// 取第一个“其后路径段不含 `=`/`;`”的 `/` 作为分界。
fn resolve_cloud(identifier: &str, rest: &str) -> Result<Locator> {
    let mut split = None;
    for (i, c) in rest.char_indices() {
        if c != '/' {
            continue;
        }
        let next = &rest[i + 1..];
        let next_seg = next.split('/').next().unwrap_or("");
        if !next_seg.contains('=') && !next_seg.contains(';') {
            split = Some(i);
            break;
        }
    }
    let (connection, tail) = match split {
        Some(i) => (&rest[..i], &rest[i + 1..]),
        None => (rest, ""),
    };
    if connection.is_empty() {
        return Err(StagError::invalid(identifier, "missing connection string"));
    }
    let (container, inner) = match tail.split_once('/') {
        Some((c, i)) => (c, i),
        None => (tail, ""),
    };
    Ok(Locator::CloudBlob {
        connection: connection.to_string(),
        container: container.to_string(),
        inner: normalize_inner(inner),
    })
}

fn normalize_inner(inner: &str) -> String {
    inner
        .replace('\\', "/")
        .split('/')
        .filter(|s| !s.is_empty() && *s != ".")
        .collect::<Vec<_>>()
        .join("/")
}

impl Locator {
    pub fn scheme(&self) -> Scheme {
        match self {
            Locator::Disk { .. } => Scheme::Disk,
            Locator::Archive { .. } => Scheme::Archive,
            Locator::Web { .. } => Scheme::Web,
            Locator::CloudBlob { .. } => Scheme::CloudBlob,
        }
    }

    pub fn disk(path: impl Into<PathBuf>) -> Self {
        Locator::Disk { path: path.into() }
    }

    /// 普通磁盘路径（无任何包装）
    pub fn is_simple(&self) -> bool {
        matches!(self, Locator::Disk { .. })
    }

    /// 在容器 locator 下拼一个条目名
    pub fn child(&self, name: &str) -> Result<Locator> {
        let name = normalize_inner(name);
        if name.is_empty() {
            return Ok(self.clone());
        }
        match self {
            Locator::Disk { path } => Ok(Locator::Disk {
                path: path.join(&name),
            }),
            Locator::Archive { outer, inner } => Ok(Locator::Archive {
                outer: outer.clone(),
                inner: join_inner(inner, &name),
            }),
            Locator::Web { url } => Err(StagError::invalid(
                url.clone(),
                format!("web resources cannot contain `{}`", name),
            )),
            Locator::CloudBlob {
                connection,
                container,
                inner,
            } => Ok(Locator::CloudBlob {
                connection: connection.clone(),
                container: container.clone(),
                inner: join_inner(inner, &name),
            }),
        }
    }

    /// 文件级 locator -> (容器 locator, 条目名)
    ///
    /// Web 资源本身即条目，名字为空串。
    pub fn split_entry(&self) -> Result<(Locator, String)> {
        match self {
            Locator::Disk { path } => {
                let name = path
                    .file_name()
                    .and_then(|n| n.to_str())
                    .ok_or_else(|| StagError::invalid(path.display().to_string(), "no file name"))?
                    .to_string();
                let parent = match path.parent() {
                    Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
                    _ => PathBuf::from("."),
                };
                Ok((Locator::Disk { path: parent }, name))
            }
            Locator::Archive { outer, inner } => {
                if inner.is_empty() {
                    return Err(StagError::invalid(self.to_string(), "archive locator names no entry"));
                }
                Ok((
                    Locator::Archive {
                        outer: outer.clone(),
                        inner: String::new(),
                    },
                    inner.clone(),
                ))
            }
            Locator::Web { .. } => Ok((self.clone(), String::new())),
            Locator::CloudBlob {
                connection,
                container,
                inner,
            } => {
                if container.is_empty() || inner.is_empty() {
                    return Err(StagError::invalid(self.to_string(), "cloud locator names no object"));
                }
                Ok((
                    Locator::CloudBlob {
                        connection: connection.clone(),
                        container: container.clone(),
                        inner: String::new(),
                    },
                    inner.clone(),
                ))
            }
        }
    }

    /// 规范化的完整标识（不脱敏，用作 cache key）
    pub fn identifier(&self) -> String {
        self.render(false)
    }

    pub fn disk_path(&self) -> Option<&Path> {
        match self {
            Locator::Disk { path } => Some(path),
            _ => None,
        }
    }

    fn render(&self, redact: bool) -> String {
        match self {
            Locator::Disk { path } => path.display().to_string(),
            Locator::Archive { outer, inner } => {
                let mut s = String::from("archive://");
                if let Some(o) = outer {
                    s.push_str(&o.render(redact));
                }
                if !inner.is_empty() {
                    s.push('/');
                    s.push_str(inner);
                }
                s
            }
            Locator::Web { url } => url.clone(),
            Locator::CloudBlob {
                connection,
                container,
                inner,
            } => {
                let conn = if redact {
                    redact_connection(connection)
                } else {
                    connection.clone()
                };
                let mut s = format!("cloud-blob://{}", conn);
                if !container.is_empty() {
                    s.push('/');
                    s.push_str(container);
                }
                if !inner.is_empty() {
                    s.push('/');
                    s.push_str(inner);
                }
                s
            }
        }
    }
}

impl fmt::Display for Locator {
    /// 日志用：隐藏 AccountKey / SAS
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.render(true))
    }
}

fn join_inner(base: &str, name: &str) -> String {
    if base.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", base, name)
    }
}

pub(crate) fn redact_connection(conn: &str) -> String {
    conn.split(';')
        .map(|part| match part.split_once('=') {
            Some((k, _))
                if k.eq_ignore_ascii_case("AccountKey")
                    || k.eq_ignore_ascii_case("SharedAccessSignature") =>
            {
                format!("{}=***", k)
            }
            _ => part.to_string(),
        })
        .collect::<Vec<_>>()
        .join(";")
}

#[cfg(test)]
mod tests {
    use super::*;

    const CONN: &str = "DefaultEndpointsProtocol=https;AccountName=acct;AccountKey=ab/cd==;EndpointSuffix=core.windows.net";

    #[test]
    fn bare_and_file_paths_are_disk() {
        assert_eq!(resolve("/tmp/a.txt").unwrap(), Locator::disk("/tmp/a.txt"));
        assert_eq!(resolve("file:///tmp/a.txt").unwrap(), Locator::disk("/tmp/a.txt"));
        assert!(resolve("file:///tmp/a.txt").unwrap().is_simple());
    }

    #[test]
    fn unknown_scheme_and_empty_are_invalid() {
        assert!(matches!(
            resolve("ftp://server/path"),
            Err(StagError::InvalidLocator { .. })
        ));
        assert!(matches!(resolve(""), Err(StagError::InvalidLocator { .. })));
        assert!(matches!(resolve("file://"), Err(StagError::InvalidLocator { .. })));
    }

    #[test]
    fn web_urls_keep_full_identifier() {
        let loc = resolve("https://example.com/data/file.txt").unwrap();
        assert_eq!(
            loc,
            Locator::Web {
                url: "https://example.com/data/file.txt".into()
            }
        );
        assert!(loc.child("x").is_err());
    }

    #[test]
    fn archive_on_disk_splits_at_container() {
        let loc = resolve("archive:///data/set.zip/sub/file.txt").unwrap();
        assert_eq!(
            loc,
            Locator::Archive {
                outer: Some(Box::new(Locator::disk("/data/set.zip"))),
                inner: "sub/file.txt".into(),
            }
        );
        let zip_alias = resolve("zip:///data/set.zip/sub/file.txt").unwrap();
        assert_eq!(loc, zip_alias);
    }

    #[test]
    fn archive_without_inner_is_container_root() {
        let loc = resolve("archive:///data/set.zip").unwrap();
        assert_eq!(
            loc,
            Locator::Archive {
                outer: Some(Box::new(Locator::disk("/data/set.zip"))),
                inner: String::new(),
            }
        );
        assert!(loc.split_entry().is_err());
    }

    #[test]
    fn empty_archive_is_memory_sink() {
        assert_eq!(
            resolve("archive://").unwrap(),
            Locator::Archive {
                outer: None,
                inner: String::new()
            }
        );
        assert!(resolve("archive://archive://").is_err());
    }

    #[test]
    fn nested_archive_in_cloud() {
        let loc = resolve("archive://cloud-blob://acct/container/data.zip/inner.txt").unwrap();
        assert_eq!(
            loc,
            Locator::Archive {
                outer: Some(Box::new(Locator::CloudBlob {
                    connection: "acct".into(),
                    container: "container".into(),
                    inner: "data.zip".into(),
                })),
                inner: "inner.txt".into(),
            }
        );
    }

    #[test]
    fn archive_in_archive_uses_last_boundary() {
        let loc = resolve("archive://archive:///a/outer.zip/inner.zip/file.txt").unwrap();
        let expected_outer = Locator::Archive {
            outer: Some(Box::new(Locator::disk("/a/outer.zip"))),
            inner: "inner.zip".into(),
        };
        assert_eq!(
            loc,
            Locator::Archive {
                outer: Some(Box::new(expected_outer)),
                inner: "file.txt".into(),
            }
        );
    }

    #[test]
    fn custom_extensions() {
        let r = Resolver::new([".whl", "zip"]);
        let loc = r.resolve("archive:///dist/pkg-1.0.whl/pkg/__init__.py").unwrap();
        match loc {
            Locator::Archive { outer, inner } => {
                assert_eq!(*outer.unwrap(), Locator::disk("/dist/pkg-1.0.whl"));
                assert_eq!(inner, "pkg/__init__.py");
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn cloud_connection_string_with_slash_in_key() {
        let id = format!("cloud-blob://{}/box/folder/a.bin", CONN);
        let loc = resolve(&id).unwrap();
        assert_eq!(
            loc,
            Locator::CloudBlob {
                connection: CONN.into(),
                container: "box".into(),
                inner: "folder/a.bin".into(),
            }
        );
        assert_eq!(loc.identifier(), id);
        assert!(!loc.to_string().contains("ab/cd=="));
        assert!(loc.to_string().contains("AccountKey=***"));
    }

    #[test]
    fn cloud_connection_only_and_azure_alias() {
        let loc = resolve(&format!("azure://{}", CONN)).unwrap();
        assert_eq!(
            loc,
            Locator::CloudBlob {
                connection: CONN.into(),
                container: String::new(),
                inner: String::new(),
            }
        );
        let loc = resolve(&format!("azure://{}/box", CONN)).unwrap();
        match loc {
            Locator::CloudBlob { container, inner, .. } => {
                assert_eq!(container, "box");
                assert!(inner.is_empty());
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn placeholders_survive_resolution() {
        let loc = resolve("cloud-blob://AccountName={{env.NOPE_ACCT}};AccountKey={{env.NOPE_KEY}}/c/x").unwrap();
        match loc {
            Locator::CloudBlob { connection, .. } => assert!(connection.contains("{{env.NOPE_KEY}}")),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn split_entry_per_scheme() {
        let (c, n) = resolve("/tmp/dir/a.txt").unwrap().split_entry().unwrap();
        assert_eq!(c, Locator::disk("/tmp/dir"));
        assert_eq!(n, "a.txt");

        let (c, n) = resolve("a.txt").unwrap().split_entry().unwrap();
        assert_eq!(c, Locator::disk("."));
        assert_eq!(n, "a.txt");

        let (c, n) = resolve("cloud-blob://acct/box/deep/x.json").unwrap().split_entry().unwrap();
        assert_eq!(c.identifier(), "cloud-blob://acct/box");
        assert_eq!(n, "deep/x.json");

        let (c, n) = resolve("archive:///z.zip/a/b.txt").unwrap().split_entry().unwrap();
        assert_eq!(c.identifier(), "archive:///z.zip");
        assert_eq!(n, "a/b.txt");
    }

    #[test]
    fn child_joins_names() {
        let root = resolve("archive:///z.zip").unwrap();
        assert_eq!(root.child("a/b.txt").unwrap().identifier(), "archive:///z.zip/a/b.txt");
        let cloud = resolve("cloud-blob://acct/box/pre").unwrap();
        assert_eq!(cloud.child("x").unwrap().identifier(), "cloud-blob://acct/box/pre/x");
    }
}
