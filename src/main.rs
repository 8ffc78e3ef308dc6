use std::str::FromStr;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;

use anyhow::{Context, Result, bail};
use camino::Utf8PathBuf;
use clap::Parser;
use tracing::*;
use tracing_subscriber::filter::LevelFilter;

use offsite::cache::Cache;
use offsite::cdp::DirMonitor;
use offsite::client::HttpStore;
use offsite::config::{self, Configuration};
use offsite::counters;
use offsite::filter::Filter;
use offsite::hashing::ObjectId;
use offsite::manager::UploadManager;
use offsite::object;
use offsite::progress::{self, Event};
use offsite::store::{ObjectStore, SnapshotKind};
use offsite::walk::Upload;

/// Continuous content-addressed backup to a remote object store.
#[derive(Debug, Parser)]
#[command(version)]
struct Args {
    /// Verbosity (-v, -vv, -vvv, etc.)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Configuration file (default: ~/.config/offsite.toml)
    #[arg(short, long)]
    config: Option<Utf8PathBuf>,

    #[command(subcommand)]
    subcommand: Subcommand,
}

#[derive(Debug, clap::Subcommand)]
enum Subcommand {
    /// Back up every configured root once and publish the snapshot.
    Backup,
    /// Watch the configured roots and back up on change until killed.
    Watch,
    /// Fetch a directory object and list its entries.
    LsDir {
        /// 64-hex object name
        hex: String,
    },
}

fn main() -> Result<()> {
    let args = Args::parse();
    init_logger(args.verbose);

    let cfg = config::load(args.config.as_deref())?;
    let res = match args.subcommand {
        Subcommand::Backup => backup(&cfg),
        Subcommand::Watch => watch(&cfg),
        Subcommand::LsDir { hex } => ls_dir(&cfg, &hex),
    };
    counters::log_counts();
    res
}

/// Set up tracing to spit messages to stderr.
fn init_logger(verbosity: u8) {
    let level = match verbosity {
        0 => LevelFilter::WARN,
        1 => LevelFilter::INFO,
        2 => LevelFilter::DEBUG,
        _ => LevelFilter::TRACE,
    };
    tracing_subscriber::fmt()
        .with_max_level(level)
        .with_writer(std::io::stderr)
        .init();
}

struct Engine {
    manager: Arc<UploadManager>,
    events: std::sync::mpsc::Receiver<Event>,
    cache: Arc<Cache>,
}

fn build_engine(cfg: &Configuration) -> Result<Engine> {
    if cfg.roots.is_empty() {
        bail!("No backup roots configured");
    }
    let device = cfg.device_name()?;
    let cache = Arc::new(Cache::open(&cfg.cache_path)?);
    let filter = Arc::new(Filter::new(
        &cfg.skip_paths,
        &cfg.skip_patterns,
        &cfg.skip_fstypes,
        Some(&cfg.cache_path),
    )?);
    let (events, rx) = progress::channel();

    let commit_store = store_for(cfg, &device, Arc::new(AtomicBool::new(false)));
    let manager = Arc::new(UploadManager::with_behavior(
        commit_store,
        !cfg!(target_os = "linux"),
        std::time::Duration::from_secs(cfg.cdp_delay),
    ));

    for root in &cfg.roots {
        // Each root gets its own cancellation flag, shared between its
        // walker and its store clone so retry loops unwind on cancel.
        let cancel = Arc::new(AtomicBool::new(false));
        let store = store_for(cfg, &device, cancel.clone());
        manager.add_upload_root(Arc::new(Upload::new(
            root.clone(),
            cache.clone(),
            store,
            filter.clone(),
            cfg.workers,
            cancel,
            events.clone(),
        )));
    }

    Ok(Engine {
        manager,
        events: rx,
        cache,
    })
}

fn store_for(
    cfg: &Configuration,
    device: &str,
    cancel: Arc<AtomicBool>,
) -> Arc<dyn ObjectStore> {
    Arc::new(HttpStore::new(
        &cfg.api_host,
        device,
        cfg.user.as_deref(),
        &cfg.aname,
        &cfg.apass,
        cancel,
    ))
}

fn backup(cfg: &Configuration) -> Result<()> {
    let engine = build_engine(cfg)?;
    engine.manager.start_all();
    engine.manager.wait_all();

    let mut failed = false;
    for ev in engine.events.try_iter() {
        if let Event::RunFinished { cancelled: true } = ev {
            failed = true;
        }
    }
    if failed {
        bail!("Backup failed; see the log");
    }

    engine
        .manager
        .commit_device_root()
        .context("Couldn't publish the device history entry")?;

    for up in engine.manager.uploads() {
        let info = up.latest_snapshot();
        if let Some(first) = info.hash.first() {
            println!("{} {}", up.root(), first.short_name());
        }
    }
    engine.cache.quiesce();
    Ok(())
}

fn watch(cfg: &Configuration) -> Result<()> {
    let engine = build_engine(cfg)?;
    engine.manager.start_scheduler();
    let _monitor = DirMonitor::spawn(engine.manager.clone(), &cfg.roots)?;

    info!("Watching {} root(s)", cfg.roots.len());
    // Runs publish snapshot events; each one becomes a history commit.
    for ev in engine.events.iter() {
        match ev {
            Event::Snapshot { kind, root, .. } => {
                debug!(
                    "{} snapshot ready: {}",
                    match kind {
                        SnapshotKind::Complete => "Complete",
                        SnapshotKind::Partial => "Partial",
                    },
                    root.first().map(|h| h.short_name()).unwrap_or_default(),
                );
                if let Err(e) = engine.manager.commit_device_root() {
                    warn!("Couldn't publish the device history entry: {e}");
                }
            }
            Event::RunFinished { cancelled } => {
                if cancelled {
                    warn!("A backup run was cancelled");
                }
            }
        }
    }
    Ok(())
}

fn ls_dir(cfg: &Configuration, hex: &str) -> Result<()> {
    let id = ObjectId::from_str(hex)?;
    let device = cfg.device_name()?;
    let store = store_for(cfg, &device, Arc::new(AtomicBool::new(false)));
    let bytes = store
        .fetch_object(&id)
        .with_context(|| format!("Couldn't fetch {id}"))?;
    let dir = object::decode_dir(&bytes)?;

    println!(
        "{} directory, treesize {}",
        match dir.kind {
            object::DirKind::Complete => "complete",
            object::DirKind::Partial => "partial",
        },
        dir.treesize
    );
    for (refs, meta) in &dir.entries {
        let line = match meta {
            object::Meta::PosixFile {
                name,
                user,
                group,
                mode,
                size,
                ..
            } => format!("-{mode:04o} {user}:{group} {size:>12} {name}"),
            object::Meta::PosixDir {
                name,
                user,
                group,
                mode,
                ..
            } => format!("d{mode:04o} {user}:{group} {:>12} {name}/", ""),
            object::Meta::WindowsFile {
                name, owner, size, ..
            } => format!("-     {owner} {size:>12} {name}"),
            object::Meta::WindowsDir { name, owner, .. } => {
                format!("d     {owner} {:>12} {name}/", "")
            }
        };
        let chunks = refs.len();
        println!("{line}  ({chunks} object{})", if chunks == 1 { "" } else { "s" });
    }
    Ok(())
}
