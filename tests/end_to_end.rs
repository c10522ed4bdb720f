use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use stagfs::backend::archive::{ArchiveSink, ArchiveSource, MemoryArchive};
use stagfs::backend::ListingStats;
use stagfs::cache::{BundleStore, Cache, CacheBundle, CacheVersion, DiskCache, FileListKey};
use stagfs::cloud::MemoryBlobService;
use stagfs::http::{AsyncHttpFetcher, HttpFetcher};
use stagfs::{ListFilter, Registry, Sink, Source, Stag, StagConfig, StagError};

#[derive(Default)]
struct FakeWeb {
    calls: AtomicUsize,
}

impl FakeWeb {
    fn body(&self, url: &str) -> stagfs::Result<Vec<u8>> {
        let n = self.calls.fetch_add(1, Ordering::SeqCst);
        if url.ends_with("/gone") {
            return Err(StagError::NotFound(url.to_string()));
        }
        Ok(format!("{}#{}", url, n).into_bytes())
    }
}

impl HttpFetcher for FakeWeb {
    fn get(&self, url: &str) -> stagfs::Result<Vec<u8>> {
        self.body(url)
    }
}

#[async_trait]
impl AsyncHttpFetcher for FakeWeb {
    async fn get(&self, url: &str) -> stagfs::Result<Vec<u8>> {
        tokio::task::yield_now().await;
        self.body(url)
    }
}

struct Fixture {
    _tmp: tempfile::TempDir,
    root: std::path::PathBuf,
    stag: Stag,
    web: Arc<FakeWeb>,
    blobs: MemoryBlobService,
}

fn fixture() -> Fixture {
    let tmp = tempfile::tempdir().unwrap();
    let root = tmp.path().to_path_buf();
    let cfg = StagConfig::default().with_cache_dir(root.join("cache"));
    let web = Arc::new(FakeWeb::default());
    let blobs = MemoryBlobService::new();
    let registry = Registry::with_fetchers(cfg, web.clone(), web.clone())
        .with_blob_service(Arc::new(blobs.clone()), Arc::new(blobs.clone()));
    Fixture {
        _tmp: tmp,
        root,
        stag: Stag::with_registry(registry),
        web,
        blobs,
    }
}

fn zip_fixture(entries: &[(&str, &[u8])]) -> Vec<u8> {
    let mut ar = MemoryArchive::new();
    for (name, data) in entries {
        ar.store(name, data).unwrap();
    }
    ar.into_bytes()
}

#[test]
fn memory_archive_hello_scenario() {
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
fn memory_archive_via_locator_is_a_sink_only() {
    let f = fixture();
    let sink = f.stag.open_sink("archive://").unwrap();
    sink.store("a.txt", b"a").unwrap();
    sink.close().unwrap();
    assert!(matches!(
        f.stag.open_source("archive://"),
        Err(StagError::InvalidLocator { .. })
    ));
}

#[test]
fn archive_listing_counts_and_sizes() {
    let f = fixture();
    let container = format!("archive://{}/many.zip", f.root.display());
    let sink = f.stag.open_sink(&container).unwrap();
    let mut expected_bytes = 0u64;
    for i in 0..40 {
        let body = vec![b'x'; i * 7 + 1];
        expected_bytes += body.len() as u64;
        sink.store(&format!("dir{}/item{:03}.bin", i % 3, i), &body).unwrap();
    }
    sink.close().unwrap();

    let entries = f.stag.list(&container, &ListFilter::new()).unwrap();
    assert_eq!(entries.len(), 40);
    let unique: std::collections::HashSet<_> = entries.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(unique.len(), 40);
    assert_eq!(entries.iter().map(|e| e.size).sum::<u64>(), expected_bytes);
}

#[test]
fn nested_archive_in_cloud_reads_fixture_entry() {
    let f = fixture();
    f.blobs.insert(
        "acct",
        "container",
        "data.zip",
        &zip_fixture(&[("inner.txt", b"fixture body"), ("other.txt", b"-")]),
    );
    let body = f
        .stag
        .load_bytes("archive://cloud-blob://acct/container/data.zip/inner.txt")
        .unwrap();
    assert_eq!(body, b"fixture body");
    assert_eq!(f.blobs.get_calls(), 1);
}

#[test]
fn repeated_reads_from_a_cloud_archive_fetch_it_once() {
    let f = fixture();
    f.blobs
        .insert("acct", "c", "data.zip", &zip_fixture(&[("a.txt", b"a"), ("b.txt", b"b")]));
    for _ in 0..5 {
        assert_eq!(f.stag.load_bytes("archive://cloud-blob://acct/c/data.zip/a.txt").unwrap(), b"a");
    }
    assert_eq!(f.stag.load_bytes("archive://cloud-blob://acct/c/data.zip/b.txt").unwrap(), b"b");
    assert_eq!(f.blobs.get_calls(), 1);

    f.stag
        .save_bytes("archive://cloud-blob://acct/c/data.zip/c.txt", b"c")
        .unwrap();
    assert_eq!(f.stag.load_bytes("archive://cloud-blob://acct/c/data.zip/c.txt").unwrap(), b"c");
    // 打开 sink 读一次，写回后重新共享一次
    assert_eq!(f.blobs.get_calls(), 3);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn nested_archive_in_cloud_async() {
    let f = fixture();
    f.blobs
        .insert("acct", "container", "data.zip", &zip_fixture(&[("inner.txt", b"async body")]));
    let id = "archive://cloud-blob://acct/container/data.zip/inner.txt";
    assert_eq!(f.stag.load_bytes_async(id).await.unwrap(), b"async body");

    f.stag
        .save_bytes_async("archive://cloud-blob://acct/container/data.zip/added.txt", b"new")
        .await
        .unwrap();
    assert_eq!(
        f.stag
            .load_bytes_async("archive://cloud-blob://acct/container/data.zip/added.txt")
            .await
            .unwrap(),
        b"new"
    );
    assert_eq!(f.stag.load_bytes_async(id).await.unwrap(), b"async body");
}

#[test]
fn deleting_missing_entries_is_a_no_op_everywhere() {
    let f = fixture();
    let disk = f.root.join("plain").join("nothing.txt");
    f.stag.delete(disk.to_str().unwrap()).unwrap();
    f.stag
        .delete(&format!("archive://{}/a.zip/nothing.txt", f.root.display()))
        .unwrap();
    f.stag.delete("cloud-blob://acct/box/nothing.txt").unwrap();
    assert!(f
        .stag
        .load_bytes("cloud-blob://acct/box/nothing.txt")
        .unwrap_err()
        .is_not_found());
}

#[test]
fn copy_between_schemes() {
    let f = fixture();
    let src = f.root.join("in.json");
    f.stag
        .save_json(src.to_str().unwrap(), &serde_json::json!({"k": [1, 2]}), None)
        .unwrap();
    f.stag
        .copy(src.to_str().unwrap(), "cloud-blob://acct/box/dir/in.json")
        .unwrap();
    let zipped = "archive://cloud-blob://acct/box/pack.zip/in.json";
    f.stag.copy("cloud-blob://acct/box/dir/in.json", zipped).unwrap();
    let v: serde_json::Value = f.stag.load_json(zipped).unwrap();
    assert_eq!(v["k"][1], 2);
    assert!(f.stag.exists("cloud-blob://acct/box/pack.zip").unwrap());
}

#[test]
fn web_ttl_zero_always_fetches_and_ttl_reuses() {
    let f = fixture();
    let cache = f.stag.registry().web_cache().clone();
    let url = "https://example.test/data.csv";

    let a = cache.get_or_fetch(url, Duration::ZERO).unwrap();
    let b = cache.get_or_fetch(url, Duration::ZERO).unwrap();
    assert_ne!(a, b);
    assert_eq!(f.web.calls.load(Ordering::SeqCst), 2);

    let c = cache.get_or_fetch(url, Duration::from_secs(600)).unwrap();
    assert_eq!(c, b);
    assert_eq!(f.web.calls.load(Ordering::SeqCst), 2);

    // facade 走同一个 cache（默认 TTL 3600s）
    assert_eq!(f.stag.load_bytes(url).unwrap(), b);
    assert!(f.stag.load_bytes("https://example.test/gone").unwrap_err().is_not_found());
    assert!(f.stag.save_bytes(url, b"x").is_err());
}

#[test]
fn cache_computes_once_per_version() {
    let cache: Cache<String> = Cache::new();
    let runs = AtomicUsize::new(0);
    let compute = || {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok("v".to_string())
    };
    cache.get_or_compute("k", CacheVersion::from(1), compute).unwrap();
    cache.get_or_compute("k", CacheVersion::from(1), compute).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    cache.get_or_compute("k", CacheVersion::from(2), compute).unwrap();
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn single_flight_across_threads() {
    let cache: Arc<Cache<u64>> = Arc::new(Cache::new());
    let runs = Arc::new(AtomicUsize::new(0));
    let handles: Vec<_> = (0..8)
        .map(|_| {
            let cache = cache.clone();
            let runs = runs.clone();
            std::thread::spawn(move || {
                cache
                    .get_or_compute("slow", CacheVersion::from(1), || {
                        runs.fetch_add(1, Ordering::SeqCst);
                        std::thread::sleep(Duration::from_millis(50));
                        Ok(42)
                    })
                    .unwrap()
            })
        })
        .collect();
    for h in handles {
        assert_eq!(h.join().unwrap(), 42);
    }
    assert_eq!(runs.load(Ordering::SeqCst), 1);
}

#[test]
fn bundle_survives_a_fresh_store_instance() {
    let tmp = tempfile::tempdir().unwrap();
    let payload: Vec<u8> = (0..=255u8).cycle().take(10_000).collect();
    let version = CacheVersion::from((3, 1));
    BundleStore::new(tmp.path())
        .write(&CacheBundle::new("model", version.clone(), "raw", payload.clone()))
        .unwrap();

    let reloaded = BundleStore::new(tmp.path()).load("model").unwrap().unwrap();
    assert_eq!(reloaded.payload, payload);
    assert_eq!(reloaded.meta.version, version);
}

#[test]
fn disk_cache_version_bump_recomputes() {
    let tmp = tempfile::tempdir().unwrap();
    let runs = AtomicUsize::new(0);
    let compute = |v: u32| {
        runs.fetch_add(1, Ordering::SeqCst);
        Ok(vec![v; 3])
    };
    {
        let cache = DiskCache::new(tmp.path());
        cache.get_or_compute("k", CacheVersion::from(1), || compute(1)).unwrap();
    }
    // 新实例，同版本：读盘，不算
    let cache = DiskCache::new(tmp.path());
    assert_eq!(
        cache.get_or_compute("k", CacheVersion::from(1), || compute(9)).unwrap(),
        vec![1, 1, 1]
    );
    assert_eq!(runs.load(Ordering::SeqCst), 1);
    assert_eq!(
        cache.get_or_compute("k", CacheVersion::from(2), || compute(2)).unwrap(),
        vec![2, 2, 2]
    );
    assert_eq!(runs.load(Ordering::SeqCst), 2);
}

#[test]
fn cached_cloud_listing_until_counter_bump() {
    let f = fixture();
    f.blobs.insert("acct", "box", "a.txt", b"1");
    let key = FileListKey::new("box-listing", 1);
    let first = f.stag.list_cached("cloud-blob://acct/box", &key, None).unwrap();
    assert_eq!(first.len(), 1);

    f.blobs.insert("acct", "box", "b.txt", b"2");
    let lists_before = f.blobs.list_calls();
    let again = f.stag.list_cached("cloud-blob://acct/box", &key, None).unwrap();
    assert_eq!(again.len(), 1);
    assert_eq!(f.blobs.list_calls(), lists_before);

    let validated = f.stag.list_cached("cloud-blob://acct/box", &key, Some(true)).unwrap();
    assert_eq!(validated.len(), 2);

    let bumped = f
        .stag
        .list_cached("cloud-blob://acct/box", &FileListKey::new("box-listing", 2), None)
        .unwrap();
    assert_eq!(bumped.len(), 2);
}

#[test]
fn listing_keys_are_per_container() {
    let f = fixture();
    f.blobs.insert("acct", "left", "l.txt", b"1");
    f.blobs.insert("acct", "right", "r1.txt", b"1");
    f.blobs.insert("acct", "right", "r2.txt", b"1");
    let key = FileListKey::new("listing", 1);
    assert_eq!(f.stag.list_cached("cloud-blob://acct/left", &key, None).unwrap().len(), 1);
    assert_eq!(f.stag.list_cached("cloud-blob://acct/right", &key, None).unwrap().len(), 2);
    assert_eq!(f.stag.list_cached("cloud-blob://acct/left", &key, None).unwrap().len(), 1);

    f.blobs.insert("acct", "left", "l2.txt", b"2");
    assert!(f.stag.invalidate_list("cloud-blob://acct/left", &key).unwrap());
    assert_eq!(f.stag.list_cached("cloud-blob://acct/left", &key, None).unwrap().len(), 2);
    assert_eq!(f.stag.list_cached("cloud-blob://acct/right", &key, None).unwrap().len(), 2);
}

#[test]
fn missing_credential_surfaces_at_connect() {
    let f = fixture();
    let id = "cloud-blob://AccountName=acct;AccountKey={{env.STAGFS_E2E_UNSET_KEY}}/box/x.txt";
    // 解析不读环境变量
    assert!(f.stag.resolve(id).is_ok());
    assert!(matches!(f.stag.load_bytes(id), Err(StagError::MissingCredential(name)) if name == "STAGFS_E2E_UNSET_KEY"));
}

#[test]
fn dollar_keys_survive_a_new_facade() {
    let f = fixture();
    let cache = f.stag.cache::<Vec<String>>();
    cache
        .set("$names", CacheVersion::from(3), vec!["a".to_string(), "b".to_string()])
        .unwrap();
    cache.set("plain", CacheVersion::from(3), vec!["m".to_string()]).unwrap();
    assert!(f.root.join("cache").join("bundles").is_dir());

    let cfg = StagConfig::default().with_cache_dir(f.root.join("cache"));
    let web = Arc::new(FakeWeb::default());
    let other = Stag::with_registry(Registry::with_fetchers(cfg, web.clone(), web));
    let reopened = other.cache::<Vec<String>>();
    assert_eq!(
        reopened.get("$names", &CacheVersion::from(3)),
        Some(vec!["a".to_string(), "b".to_string()])
    );
    assert_eq!(reopened.get("plain", &CacheVersion::from(3)), None);
}

#[test]
fn flat_listing_and_totals() {
    let f = fixture();
    let dir = f.root.join("tree");
    let sink = f.stag.open_sink(dir.to_str().unwrap()).unwrap();
    sink.store("top.txt", b"12").unwrap();
    sink.store("sub/a.txt", b"123").unwrap();
    sink.store("sub/deeper/b.txt", b"1234").unwrap();
    sink.close().unwrap();

    let all = f.stag.list(dir.to_str().unwrap(), &ListFilter::new()).unwrap();
    let stats = ListingStats::from_entries(&all);
    assert_eq!((stats.total_files, stats.total_dirs, stats.total_bytes), (3, 2, 9));

    let flat = f.stag.list(dir.to_str().unwrap(), &ListFilter::new().flat(true)).unwrap();
    let names: Vec<&str> = flat.iter().map(|e| e.name.as_str()).collect();
    assert_eq!(names, vec!["top.txt"]);
}
