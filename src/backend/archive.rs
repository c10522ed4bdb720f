//! 归档后端（zip）
//!
//! - `MemoryArchive`：整个容器在内存里，始终是一份完整可读的 zip
//! - `ArchiveSource`：惰性打开，第一次访问时一遍 O(n) 建索引，之后复用；
//!   不监听外部修改，需要看到新内容时调用 `reopen()`
//! - `ArchiveSink` / `AsyncArchiveSink`：在内存里改，`close()` 时把整个容器
//!   写回外层 locator（外层本身可以是任意 scheme，包括另一个归档）
//!
//! zip 不支持原地删除：删除 = 跳过目标条目重写整个容器，O(n)。

use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek, Write};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::Mutex;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use super::{AsyncSink, Entry, EntryIter, Sink, Source};
use crate::error::{Result, StagError};

/// 只有 end-of-central-directory 的空 zip
const EMPTY_ZIP: [u8; 22] = [
    0x50, 0x4b, 0x05, 0x06, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0, 0,
];

fn file_options() -> SimpleFileOptions {
    SimpleFileOptions::default().compression_method(CompressionMethod::Deflated)
}

fn entry_of(name: &str, size: u64, crc: u32) -> Entry {
    Entry {
        name: name.to_string(),
        size,
        fingerprint: Some(format!("{:08x}", crc)),
        modified: None,
    }
}

fn read_entry<R: Read + Seek>(archive: &mut ZipArchive<R>, name: &str) -> Result<Vec<u8>> {
    let mut file = match archive.by_name(name) {
        Ok(f) => f,
        Err(zip::result::ZipError::FileNotFound) => return Err(StagError::NotFound(name.to_string())),
        Err(e) => return Err(e.into()),
    };
    if file.is_dir() {
        return Err(StagError::NotFound(name.to_string()));
    }
    let mut buf = Vec::with_capacity(file.size() as usize);
    file.read_to_end(&mut buf)?;
    Ok(buf)
}

fn scoped(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", prefix, name)
    }
}

fn unscoped<'a>(prefix: &str, name: &'a str) -> Option<&'a str> {
    if prefix.is_empty() {
        return Some(name);
    }
    name.strip_prefix(prefix)?.strip_prefix('/')
}

// ===== MemoryArchive =====

/// 内存归档
#[derive(Clone)]
pub struct MemoryArchive {
    bytes: Vec<u8>,
}

impl Default for MemoryArchive {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for MemoryArchive {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryArchive").field("len", &self.bytes.len()).finish()
    }
}

impl MemoryArchive {
    pub fn new() -> Self {
        Self {
            bytes: EMPTY_ZIP.to_vec(),
        }
    }

    /// 校验后接管字节
    pub fn from_bytes(bytes: Vec<u8>) -> Result<Self> {
        ZipArchive::new(Cursor::new(bytes.as_slice()))?;
        Ok(Self { bytes })
    }

    fn open(&self) -> Result<ZipArchive<Cursor<&[u8]>>> {
        Ok(ZipArchive::new(Cursor::new(self.bytes.as_slice()))?)
    }

    pub fn entries(&self) -> Result<Vec<Entry>> {
        let mut archive = self.open()?;
        let mut out = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            if !file.is_dir() {
                out.push(entry_of(file.name(), file.size(), file.crc32()));
            }
        }
        Ok(out)
    }

    pub fn names(&self) -> Result<Vec<String>> {
        Ok(self.entries()?.into_iter().map(|e| e.name).collect())
    }

    pub fn contains(&self, name: &str) -> Result<bool> {
        Ok(self.open()?.index_for_name(name).is_some())
    }

    pub fn read(&self, name: &str) -> Result<Vec<u8>> {
        read_entry(&mut self.open()?, name)
    }

    /// 同名条目先移除再追加
    pub fn store(&mut self, name: &str, data: &[u8]) -> Result<()> {
        if name.is_empty() || name.ends_with('/') {
            return Err(StagError::invalid(name, "archive entry needs a file name"));
        }
        self.remove(name)?;
        let mut writer = ZipWriter::new_append(Cursor::new(self.bytes.clone()))?;
        writer.start_file(name, file_options())?;
        writer.write_all(data)?;
        self.bytes = writer.finish()?.into_inner();
        Ok(())
    }

    /// 重写容器跳过 `name`；返回是否真的删掉了东西
    pub fn remove(&mut self, name: &str) -> Result<bool> {
        let mut src = self.open()?;
        if src.index_for_name(name).is_none() {
            return Ok(false);
        }
        let mut writer = ZipWriter::new(Cursor::new(Vec::with_capacity(self.bytes.len())));
        for i in 0..src.len() {
            let file = src.by_index_raw(i)?;
            if file.name() == name {
                continue;
            }
            writer.raw_copy_file(file)?;
        }
        drop(src);
        self.bytes = writer.finish()?.into_inner();
        Ok(true)
    }

    /// 容器字节数
    pub fn byte_len(&self) -> usize {
        self.bytes.len()
    }

    /// 没有文件条目
    pub fn is_empty(&self) -> bool {
        self.entries().map(|e| e.is_empty()).unwrap_or(true)
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.bytes.clone()
    }

    pub fn into_bytes(self) -> Vec<u8> {
        self.bytes
    }
}

// ===== ArchiveSource =====

trait ReadSeek: Read + Seek + Send {}
impl<T: Read + Seek + Send> ReadSeek for T {}

enum Container {
    File(PathBuf),
    Bytes(Arc<[u8]>),
}

struct OpenArchive {
    archive: ZipArchive<Box<dyn ReadSeek>>,
    index: HashMap<String, usize>,
    entries: Vec<Entry>,
}

/// 只读归档源（文件或字节）
pub struct ArchiveSource {
    container: Container,
    prefix: String,
    open: Mutex<Option<OpenArchive>>,
}

impl ArchiveSource {
    pub fn from_file(path: impl Into<PathBuf>) -> Self {
        Self {
            container: Container::File(path.into()),
            prefix: String::new(),
            open: Mutex::new(None),
        }
    }

    pub fn from_bytes(bytes: impl Into<Arc<[u8]>>) -> Self {
        Self {
            container: Container::Bytes(bytes.into()),
            prefix: String::new(),
            open: Mutex::new(None),
        }
    }

    /// 只暴露 `prefix/` 下的条目（名字相对 prefix）
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.trim_matches('/').to_string();
        self
    }

    /// 丢掉索引，下次访问重新打开容器
    pub fn reopen(&self) {
        *self.open.lock() = None;
    }

    fn with_open<T>(&self, f: impl FnOnce(&mut OpenArchive) -> Result<T>) -> Result<T> {
        let mut guard = self.open.lock();
        if guard.is_none() {
            *guard = Some(self.build_index()?);
        }
        match guard.as_mut() {
            Some(open) => f(open),
            None => Err(StagError::BackendUnavailable("archive index unavailable".into())),
        }
    }

    fn build_index(&self) -> Result<OpenArchive> {
        let reader: Box<dyn ReadSeek> = match &self.container {
            Container::File(path) => {
                let f = File::open(path).map_err(|e| StagError::from_io(e, &path.display().to_string()))?;
                Box::new(BufReader::new(f))
            }
            Container::Bytes(bytes) => Box::new(Cursor::new(bytes.clone())),
        };
        let mut archive = ZipArchive::new(reader)?;
        let mut index = HashMap::with_capacity(archive.len());
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            if file.is_dir() {
                continue;
            }
            let Some(rel) = unscoped(&self.prefix, file.name()) else {
                continue;
            };
            let entry = entry_of(rel, file.size(), file.crc32());
            index.insert(entry.name.clone(), i);
            entries.push(entry);
        }
        tracing::debug!("archive indexed: {} entries", entries.len());
        Ok(OpenArchive {
            archive,
            index,
            entries,
        })
    }
}

impl Source for ArchiveSource {
    fn list(&self) -> Result<EntryIter<'_>> {
        let entries = self.with_open(|open| Ok(open.entries.clone()))?;
        Ok(Box::new(entries.into_iter().map(Ok)))
    }

    fn read(&self, name: &str) -> Result<Vec<u8>> {
        self.with_open(|open| {
            let idx = *open
                .index
                .get(name)
                .ok_or_else(|| StagError::NotFound(name.to_string()))?;
            let mut file = open.archive.by_index(idx)?;
            let mut buf = Vec::with_capacity(file.size() as usize);
            file.read_to_end(&mut buf)?;
            Ok(buf)
        })
    }

    fn exists(&self, name: &str) -> Result<bool> {
        self.with_open(|open| Ok(open.index.contains_key(name)))
    }
}

// ===== sinks =====

/// sink 共用的暂存区
struct Staged {
    archive: Mutex<MemoryArchive>,
    prefix: String,
    dirty: AtomicBool,
}

impl Staged {
    fn new(archive: MemoryArchive, prefix: &str) -> Self {
        Self {
            archive: Mutex::new(archive),
            prefix: prefix.trim_matches('/').to_string(),
            dirty: AtomicBool::new(false),
        }
    }

    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.archive.lock().store(&scoped(&self.prefix, name), data)?;
        self.dirty.store(true, Ordering::Release);
        Ok(())
    }

    fn delete(&self, name: &str) -> Result<()> {
        if self.archive.lock().remove(&scoped(&self.prefix, name))? {
            self.dirty.store(true, Ordering::Release);
        }
        Ok(())
    }

    /// 有改动才返回字节，并清掉脏标记
    fn take_dirty(&self) -> Option<Vec<u8>> {
        if self.dirty.swap(false, Ordering::AcqRel) {
            Some(self.archive.lock().to_bytes())
        } else {
            None
        }
    }

    fn mark_dirty(&self) {
        self.dirty.store(true, Ordering::Release);
    }
}

/// 同步归档 sink
///
/// `target == None` 是纯内存归档：字节通过 `to_bytes()` 取走。
pub struct ArchiveSink {
    staged: Staged,
    target: Option<(Arc<dyn Sink>, String)>,
}

impl ArchiveSink {
    pub fn memory() -> Self {
        Self {
            staged: Staged::new(MemoryArchive::new(), ""),
            target: None,
        }
    }

    /// `existing` 是外层容器当前的内容（没有就传空归档）
    pub fn persisting_to(existing: MemoryArchive, target: Arc<dyn Sink>, name: impl Into<String>, prefix: &str) -> Self {
        Self {
            staged: Staged::new(existing, prefix),
            target: Some((target, name.into())),
        }
    }

    pub fn to_bytes(&self) -> Vec<u8> {
        self.staged.archive.lock().to_bytes()
    }

    pub fn archive(&self) -> MemoryArchive {
        self.staged.archive.lock().clone()
    }
}

impl Sink for ArchiveSink {
    fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.staged.store(name, data)
    }

    fn delete(&self, name: &str) -> Result<()> {
        self.staged.delete(name)
    }

    fn close(&self) -> Result<()> {
        let Some((target, name)) = &self.target else {
            return Ok(());
        };
        if let Some(bytes) = self.staged.take_dirty() {
            if let Err(e) = target.store(name, &bytes) {
                self.staged.mark_dirty();
                return Err(e);
            }
            tracing::debug!("archive `{}` persisted ({} bytes)", name, bytes.len());
        }
        target.close()
    }
}

impl Drop for ArchiveSink {
    fn drop(&mut self) {
        if self.target.is_some() && self.staged.dirty.load(Ordering::Acquire) {
            tracing::warn!("archive sink dropped with unsaved changes; call close()");
        }
    }
}

/// async 归档 sink：内存操作不挂起，只有写回外层时挂起
pub struct AsyncArchiveSink {
    staged: Staged,
    target: (Arc<dyn AsyncSink>, String),
}

impl AsyncArchiveSink {
    pub fn persisting_to(existing: MemoryArchive, target: Arc<dyn AsyncSink>, name: impl Into<String>, prefix: &str) -> Self {
        Self {
            staged: Staged::new(existing, prefix),
            target: (target, name.into()),
        }
    }
}

#[async_trait]
impl AsyncSink for AsyncArchiveSink {
    async fn store(&self, name: &str, data: &[u8]) -> Result<()> {
        self.staged.store(name, data)
    }

    async fn delete(&self, name: &str) -> Result<()> {
        self.staged.delete(name)
    }

    async fn close(&self) -> Result<()> {
        let (target, name) = &self.target;
        if let Some(bytes) = self.staged.take_dirty() {
            if let Err(e) = target.store(name, &bytes).await {
                self.staged.mark_dirty();
                return Err(e);
            }
        }
        target.close().await
    }
}

impl Drop for AsyncArchiveSink {
    fn drop(&mut self) {
        if self.staged.dirty.load(Ordering::Acquire) {
            tracing::warn!("archive sink dropped with unsaved changes; call close()");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::disk::DiskBackend;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        let dir = std::env::temp_dir().join(format!("stagfs-archive-{}-{}", tag, nanos));
        std::fs::create_dir_all(&dir).unwrap();
        dir
    }

    #[test]
    fn memory_sink_round_trip_hello() {
        let sink = ArchiveSink::memory();
        sink.store("hello.txt", b"hi").unwrap();
        sink.close().unwrap();
        let bytes = sink.to_bytes();

        let source = ArchiveSource::from_bytes(bytes);
        let names: Vec<String> = source.list().unwrap().map(|e| e.unwrap().name).collect();
        assert_eq!(names, vec!["hello.txt".to_string()]);
        assert_eq!(source.read("hello.txt").unwrap(), b"hi");
    }

    #[test]
    fn store_replaces_existing_name() {
        let mut ar = MemoryArchive::new();
        ar.store("a.txt", b"one").unwrap();
        ar.store("b.txt", b"two").unwrap();
        ar.store("a.txt", b"three").unwrap();
        assert_eq!(ar.names().unwrap(), vec!["b.txt".to_string(), "a.txt".to_string()]);
        assert_eq!(ar.read("a.txt").unwrap(), b"three");
    }

    #[test]
    fn remove_is_idempotent() {
        let mut ar = MemoryArchive::new();
        ar.store("a.txt", b"x").unwrap();
        assert!(ar.remove("a.txt").unwrap());
        assert!(!ar.remove("a.txt").unwrap());
        assert!(ar.is_empty());
        assert!(MemoryArchive::from_bytes(ar.into_bytes()).is_ok());
    }

    #[test]
    fn listing_counts_and_sizes() {
        let mut ar = MemoryArchive::new();
        let mut expected = 0u64;
        for i in 0..25 {
            let body = vec![b'x'; i * 10];
            expected += body.len() as u64;
            ar.store(&format!("dir/f{:02}.bin", i), &body).unwrap();
        }
        let src = ArchiveSource::from_bytes(ar.into_bytes());
        let entries: Vec<Entry> = src.list().unwrap().collect::<Result<_>>().unwrap();
        assert_eq!(entries.len(), 25);
        let unique: std::collections::HashSet<_> = entries.iter().map(|e| &e.name).collect();
        assert_eq!(unique.len(), 25);
        assert_eq!(entries.iter().map(|e| e.size).sum::<u64>(), expected);
    }

    #[test]
    fn missing_entry_is_not_found() {
        let src = ArchiveSource::from_bytes(MemoryArchive::new().into_bytes());
        assert!(matches!(src.read("nope"), Err(StagError::NotFound(_))));
        assert!(!src.exists("nope").unwrap());
    }

    #[test]
    fn garbage_bytes_are_rejected() {
        assert!(MemoryArchive::from_bytes(b"not a zip".to_vec()).is_err());
    }

    #[test]
    fn prefix_scopes_names() {
        let mut ar = MemoryArchive::new();
        ar.store("sub/a.txt", b"a").unwrap();
        ar.store("other/b.txt", b"b").unwrap();
        let src = ArchiveSource::from_bytes(ar.into_bytes()).with_prefix("sub");
        let names: Vec<String> = src.list().unwrap().map(|e| e.unwrap().name).collect();
        assert_eq!(names, vec!["a.txt".to_string()]);
        assert_eq!(src.read("a.txt").unwrap(), b"a");
    }

    #[test]
    fn file_backed_sink_persists_on_close_and_reopen_sees_it() {
        let dir = unique_tmp_dir("persist");
        let disk: Arc<dyn Sink> = Arc::new(DiskBackend::new(&dir));
        let sink = ArchiveSink::persisting_to(MemoryArchive::new(), disk.clone(), "out.zip", "");
        sink.store("x.txt", b"x").unwrap();
        sink.close().unwrap();

        let src = ArchiveSource::from_file(dir.join("out.zip"));
        assert_eq!(src.read("x.txt").unwrap(), b"x");

        let existing = MemoryArchive::from_bytes(std::fs::read(dir.join("out.zip")).unwrap()).unwrap();
        let sink = ArchiveSink::persisting_to(existing, disk, "out.zip", "");
        sink.store("y.txt", b"y").unwrap();
        sink.close().unwrap();

        assert!(!src.exists("y.txt").unwrap());
        src.reopen();
        assert_eq!(src.read("y.txt").unwrap(), b"y");
        let _ = std::fs::remove_dir_all(&dir);
    }
}
