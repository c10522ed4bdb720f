use std::io::Write;
use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use stagfs::backend::ListingStats;
use stagfs::cache::FileListKey;
use stagfs::cloud::MemoryBlobService;
use stagfs::{ListFilter, Registry, Stag, StagConfig};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// scheme 前缀路径的读写工具
#[derive(Parser, Debug)]
#[command(name = "stagfs", version)]
struct Cli {
    /// TOML 配置（默认读 STAGFS_CONFIG）
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// 用进程内的 blob 服务承接 cloud-blob:// （无真实 wire client）
    #[arg(long, global = true)]
    memory_blob: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// 输出一个条目的内容
    Cat { locator: String },
    /// 把本地文件写到 locator
    Put { locator: String, file: PathBuf },
    /// 任意两个 scheme 之间拷贝
    Cp { src: String, dst: String },
    /// 删除（不存在不报错）
    Rm { locator: String },
    /// 列出容器条目
    Ls {
        locator: String,
        #[arg(long)]
        mask: Option<String>,
        #[arg(long)]
        max: Option<usize>,
        /// 经 file-list cache 列举，NAME 为缓存名
        #[arg(long, value_name = "NAME")]
        cached: Option<String>,
        #[arg(long, default_value_t = 0)]
        counter: u64,
        #[arg(long)]
        validate: bool,
        /// 只列顶层条目（不进子目录）
        #[arg(long)]
        flat: bool,
        /// 末尾输出文件数、目录数、总字节数
        #[arg(long)]
        stats: bool,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("stagfs=info")))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let config = match &cli.config {
        Some(path) => StagConfig::load(path)?,
        None => StagConfig::from_env()?,
    };
    info!("cache dir: {}", config.cache_dir.display());

    let mut registry = Registry::new(config)?;
    if cli.memory_blob {
        let svc = MemoryBlobService::new();
        registry = registry.with_blob_service(Arc::new(svc.clone()), Arc::new(svc));
    }
    let stag = Stag::with_registry(registry);

    match cli.command {
        Command::Cat { locator } => {
            let body = stag.load_bytes_async(&locator).await?;
            std::io::stdout().write_all(&body)?;
        }
        Command::Put { locator, file } => {
            let body = tokio::fs::read(&file).await?;
            stag.save_bytes_async(&locator, &body).await?;
            info!("stored {} bytes", body.len());
        }
        Command::Cp { src, dst } => stag.copy_async(&src, &dst).await?,
        Command::Rm { locator } => stag.delete_async(&locator).await?,
        Command::Ls {
            locator,
            mask,
            max,
            cached,
            counter,
            validate,
            flat,
            stats,
        } => {
            let mut filter = ListFilter::new().flat(flat);
            if let Some(m) = &mask {
                filter = filter.mask(m);
            }
            if let Some(n) = max {
                filter = filter.max_entries(n);
            }
            let entries = match cached {
                Some(name) => {
                    let key = FileListKey::new(name, counter);
                    let listed = stag
                        .list_cached_async(&locator, &key, validate.then_some(true))
                        .await?;
                    filter.apply_vec(listed)
                }
                None => stag.list_async(&locator, &filter).await?,
            };
            let mut out = std::io::stdout().lock();
            for e in &entries {
                writeln!(out, "{:>12}  {}", e.size, e.name)?;
            }
            if stats {
                let s = ListingStats::from_entries(&entries);
                writeln!(
                    out,
                    "{} files, {} dirs, {} bytes",
                    s.total_files, s.total_dirs, s.total_bytes
                )?;
            }
        }
    }
    Ok(())
}
