use std::fs;
use std::io::{Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};
use xxhash_rust::xxh3::{xxh3_64, Xxh3};

use super::version::CacheVersion;
use crate::error::{Result, StagError};

/// Bundle 文件 Header
const MAGIC: u32 = 0x57A6_CB01;
const FORMAT_VERSION: u32 = 1;
const STATE_COMMITTED: u32 = 0x0000_0001;
const STATE_INCOMPLETE: u32 = 0xFFFF_FFFF;
const HEADER_SIZE: usize = 4 + 4 + 4 + 8 + 8; // magic + format + state + body_len + checksum
const EXT: &str = "bundle";
const TMP_SUFFIX: &str = ".bundle-tmp";

/// 自描述元数据
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BundleMeta {
    pub key: String,
    pub version: CacheVersion,
    /// unix 毫秒
    pub created_at: u64,
    /// payload 的类型标签
    pub schema: String,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheBundle {
    pub meta: BundleMeta,
    pub payload: Vec<u8>,
}

impl CacheBundle {
    pub fn new(key: &str, version: CacheVersion, schema: &str, payload: Vec<u8>) -> Self {
        Self {
            meta: BundleMeta {
                key: key.to_string(),
                version,
                created_at: now_millis(),
                schema: schema.to_string(),
            },
            payload,
        }
    }

    pub fn age_millis(&self) -> u64 {
        now_millis().saturating_sub(self.meta.created_at)
    }
}

pub(crate) fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

struct ChecksumWriter<'a, W: Write> {
    inner: &'a mut W,
    hasher: Xxh3,
    bytes: u64,
}

impl<'a, W: Write> ChecksumWriter<'a, W> {
    fn new(inner: &'a mut W) -> Self {
        Self {
            inner,
            hasher: Xxh3::new(),
            bytes: 0,
        }
    }

    fn finish(self) -> (u64, u64) {
        (self.bytes, self.hasher.digest())
    }
}

impl<'a, W: Write> Write for ChecksumWriter<'a, W> {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.hasher.update(&buf[..n]);
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        self.inner.flush()
    }
}

fn header(state: u32, body_len: u64, checksum: u64) -> [u8; HEADER_SIZE] {
    let mut h = [0u8; HEADER_SIZE];
    h[0..4].copy_from_slice(&MAGIC.to_le_bytes());
    h[4..8].copy_from_slice(&FORMAT_VERSION.to_le_bytes());
    h[8..12].copy_from_slice(&state.to_le_bytes());
    h[12..20].copy_from_slice(&body_len.to_le_bytes());
    h[20..28].copy_from_slice(&checksum.to_le_bytes());
    h
}

fn le_u32(b: &[u8]) -> u32 {
    let mut a = [0u8; 4];
    a.copy_from_slice(&b[..4]);
    u32::from_le_bytes(a)
}

fn le_u64(b: &[u8]) -> u64 {
    let mut a = [0u8; 8];
    a.copy_from_slice(&b[..8]);
    u64::from_le_bytes(a)
}

/// 目录里的一组 bundle 文件（文件名 = key 的 xxh3）
///
/// 落盘流程：
/// 1) 在同目录建一个独立的临时文件，写 INCOMPLETE header（len/checksum 先置 0）
/// 2) bincode 流式写 body，边写边算长度和 xxh3
/// 3) seek 回开头覆盖 COMMITTED header
/// 4) fsync(tmp) 5) rename(tmp, target) 6) fsync(dir)
///
/// 同一 key 的并发写各自有临时文件，最后一个 rename 生效，读者只会看到某个完整版本。
///
/// 任一步失败 target 都保持旧内容；加载时 magic/format/state/len/checksum/key
/// 任何不一致都判为 `StaleCacheBundle`。
#[derive(Clone, Debug)]
pub struct BundleStore {
    dir: PathBuf,
}

impl BundleStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn path_for(&self, key: &str) -> PathBuf {
        self.dir
            .join(format!("{:016x}.{}", xxh3_64(key.as_bytes()), EXT))
    }

    pub fn write(&self, bundle: &CacheBundle) -> Result<()> {
        fs::create_dir_all(&self.dir)?;
        let path = self.path_for(&bundle.meta.key);
        let body_len = match self.persist(&path, bundle) {
            Ok(len) => len,
            Err(e) => {
                tracing::warn!("bundle write for `{}` failed: {}", bundle.meta.key, e);
                return Err(StagError::PartialWrite(format!("{}: {}", bundle.meta.key, e)));
            }
        };

        if let Ok(dir) = fs::File::open(&self.dir) {
            let _ = dir.sync_all();
        }
        tracing::info!(
            "bundle written: {}@{} ({} bytes)",
            bundle.meta.key,
            bundle.meta.version,
            HEADER_SIZE as u64 + body_len
        );
        Ok(())
    }

    /// 每次写一个独立的临时文件；失败时临时文件随 drop 删除
    fn persist(&self, path: &Path, bundle: &CacheBundle) -> Result<u64> {
        let mut tmp = tempfile::Builder::new()
            .prefix(".")
            .suffix(TMP_SUFFIX)
            .tempfile_in(&self.dir)?;
        let file = tmp.as_file_mut();
        file.write_all(&header(STATE_INCOMPLETE, 0, 0))?;
        let (body_len, checksum) = {
            let mut cw = ChecksumWriter::new(&mut *file);
            bincode::serialize_into(&mut cw, bundle)?;
            cw.finish()
        };
        file.seek(SeekFrom::Start(0))?;
        file.write_all(&header(STATE_COMMITTED, body_len, checksum))?;
        file.sync_all()?;
        tmp.persist(path).map_err(|e| StagError::Io(e.error))?;
        Ok(body_len)
    }

    /// 没有文件 -> `Ok(None)`；完整性不过 -> `Err(StaleCacheBundle)`
    pub fn load(&self, key: &str) -> Result<Option<CacheBundle>> {
        let path = self.path_for(key);
        let data = match fs::read(&path) {
            Ok(d) => d,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        decode(key, &data).map(Some)
    }

    /// 读路径用：任何不新鲜（完整性或版本不符）都当 miss
    pub fn load_matching(&self, key: &str, version: &CacheVersion, schema: &str) -> Result<Option<CacheBundle>> {
        match self.load(key) {
            Ok(Some(b)) if &b.meta.version == version && b.meta.schema == schema => Ok(Some(b)),
            Ok(Some(b)) => {
                tracing::debug!(
                    "bundle `{}` is {}@{}, wanted {}@{}; treating as miss",
                    key,
                    b.meta.schema,
                    b.meta.version,
                    schema,
                    version
                );
                Ok(None)
            }
            Ok(None) => Ok(None),
            Err(StagError::StaleCacheBundle { key, reason }) => {
                tracing::warn!("stale bundle `{}`: {}; treating as miss", key, reason);
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }

    pub fn remove(&self, key: &str) -> Result<bool> {
        match fs::remove_file(self.path_for(key)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// 所有 bundle 文件（路径, 大小, 修改时间毫秒）
    pub fn files(&self) -> Result<Vec<(PathBuf, u64, u64)>> {
        let rd = match fs::read_dir(&self.dir) {
            Ok(rd) => rd,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        let mut out = Vec::new();
        for entry in rd {
            let entry = entry?;
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some(EXT) {
                continue;
            }
            let meta = entry.metadata()?;
            let modified = meta
                .modified()
                .ok()
                .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
                .map(|d| d.as_millis() as u64)
                .unwrap_or(0);
            out.push((path, meta.len(), modified));
        }
        Ok(out)
    }

    pub fn clear(&self) -> Result<usize> {
        let files = self.files()?;
        let n = files.len();
        for (path, _, _) in files {
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(n)
    }
}

fn decode(key: &str, data: &[u8]) -> Result<CacheBundle> {
    if data.len() < HEADER_SIZE {
        return Err(StagError::stale(key, "bundle too small"));
    }
    let magic = le_u32(&data[0..4]);
    let format = le_u32(&data[4..8]);
    let state = le_u32(&data[8..12]);
    let body_len = le_u64(&data[12..20]);
    let stored_checksum = le_u64(&data[20..28]);

    if magic != MAGIC {
        return Err(StagError::stale(key, format!("magic mismatch: {:#x}", magic)));
    }
    if format != FORMAT_VERSION {
        return Err(StagError::stale(key, format!("format {} != {}", format, FORMAT_VERSION)));
    }
    if state != STATE_COMMITTED {
        return Err(StagError::stale(key, "bundle state INCOMPLETE"));
    }
    let body = &data[HEADER_SIZE..];
    if body.len() as u64 != body_len {
        return Err(StagError::stale(key, "body length mismatch"));
    }
    if xxh3_64(body) != stored_checksum {
        return Err(StagError::stale(key, "checksum mismatch"));
    }
    let bundle: CacheBundle =
        bincode::deserialize(body).map_err(|e| StagError::stale(key, format!("decode failed: {}", e)))?;
    // 文件名是 hash，碰撞时 key 不同
    if bundle.meta.key != key {
        return Err(StagError::stale(key, format!("bundle belongs to `{}`", bundle.meta.key)));
    }
    Ok(bundle)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn unique_tmp_dir(tag: &str) -> PathBuf {
        let nanos = SystemTime::now().duration_since(UNIX_EPOCH).unwrap().as_nanos();
        std::env::temp_dir().join(format!("stagfs-bundle-{}-{}", tag, nanos))
    }

    #[test]
    fn write_then_load_on_fresh_store() {
        let dir = unique_tmp_dir("roundtrip");
        let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
        let bundle = CacheBundle::new("listing:a", (3, 1).into(), "bytes", payload.clone());
        BundleStore::new(&dir).write(&bundle).unwrap();

        let fresh = BundleStore::new(&dir);
        let loaded = fresh.load("listing:a").unwrap().unwrap();
        assert_eq!(loaded.payload, payload);
        assert_eq!(loaded.meta.version, CacheVersion::from((3, 1)));
        assert_eq!(loaded.meta, bundle.meta);
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn missing_bundle_is_none() {
        let store = BundleStore::new(unique_tmp_dir("missing"));
        assert!(store.load("nope").unwrap().is_none());
        assert!(!store.remove("nope").unwrap());
    }

    #[test]
    fn corrupted_bundle_is_stale_and_matching_load_misses() {
        let dir = unique_tmp_dir("corrupt");
        let store = BundleStore::new(&dir);
        store
            .write(&CacheBundle::new("k", 1.into(), "bytes", b"payload".to_vec()))
            .unwrap();
        let path = store.path_for("k");
        let mut data = fs::read(&path).unwrap();
        let last = data.len() - 1;
        data[last] ^= 0xFF;
        fs::write(&path, &data).unwrap();

        assert!(matches!(store.load("k"), Err(StagError::StaleCacheBundle { .. })));
        assert!(store.load_matching("k", &1.into(), "bytes").unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn incomplete_header_is_stale() {
        let dir = unique_tmp_dir("incomplete");
        let store = BundleStore::new(&dir);
        fs::create_dir_all(&dir).unwrap();
        let mut data = header(STATE_INCOMPLETE, 0, 0).to_vec();
        data.extend_from_slice(b"junk");
        fs::write(store.path_for("k"), data).unwrap();
        assert!(matches!(store.load("k"), Err(StagError::StaleCacheBundle { .. })));
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn version_or_schema_mismatch_is_miss() {
        let dir = unique_tmp_dir("mismatch");
        let store = BundleStore::new(&dir);
        store
            .write(&CacheBundle::new("k", 1.into(), "bytes", b"x".to_vec()))
            .unwrap();
        assert!(store.load_matching("k", &1.into(), "bytes").unwrap().is_some());
        assert!(store.load_matching("k", &2.into(), "bytes").unwrap().is_none());
        assert!(store.load_matching("k", &1.into(), "json").unwrap().is_none());
        assert_eq!(store.clear().unwrap(), 1);
        assert!(store.load("k").unwrap().is_none());
        let _ = fs::remove_dir_all(&dir);
    }

    #[test]
    fn concurrent_writers_leave_one_complete_bundle() {
        let dir = unique_tmp_dir("race");
        let store = std::sync::Arc::new(BundleStore::new(&dir));
        let barrier = std::sync::Arc::new(std::sync::Barrier::new(8));
        let handles: Vec<_> = (0..8u8)
            .map(|i| {
                let store = store.clone();
                let barrier = barrier.clone();
                std::thread::spawn(move || {
                    barrier.wait();
                    store.write(&CacheBundle::new("k", 1.into(), "bytes", vec![i; 1 << 20]))
                })
            })
            .collect();
        for h in handles {
            h.join().unwrap().unwrap();
        }
        let loaded = store.load("k").unwrap().unwrap();
        assert_eq!(loaded.payload.len(), 1 << 20);
        assert!(loaded.payload.iter().all(|b| *b == loaded.payload[0]));
        // 只剩目标文件，临时文件都已 rename 或删除
        assert_eq!(fs::read_dir(&dir).unwrap().count(), 1);
        assert_eq!(store.files().unwrap().len(), 1);
        let _ = fs::remove_dir_all(&dir);
    }
}
