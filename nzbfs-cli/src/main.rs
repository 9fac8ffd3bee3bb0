//! `nzbfsd`: wires the NNTP client, disk cache, NZB assembly service, and
//! presenters together. Config loading, subcommand shape, and the
//! daemon/mount split follow the teacher's own `tvix-store` binary.

mod config;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context as _;
use axum::body::Body;
use axum::http::Request;
use clap::{Parser, Subcommand};
use tower::service_fn;
use tracing::{info, Level};

use nzbfs_engine::cache::{DiskCache, EvictMode};
use nzbfs_model::parse_nzb;
use nzbfs_nntp::{NntpClient, NntpConfig};
use nzbfs_store::{Service, ServiceConfig};
use nzbfs_vfs::Tree;

use config::Settings;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Path to a TOML config file; also settable via NZBFS_CONFIG.
    #[arg(long, env = "NZBFS_CONFIG")]
    config: Option<PathBuf>,

    /// Overrides the configured log level.
    #[arg(long)]
    log_level: Option<Level>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Runs the WebDAV presenter (and, if `--mount` is given, a FUSE mount)
    /// over whatever NZBs are registered at startup.
    Serve {
        /// NZB files to register before presenters bind.
        #[arg(long = "nzb")]
        nzbs: Vec<PathBuf>,

        /// Mount a FUSE filesystem at this path in addition to WebDAV.
        #[arg(long)]
        mount: Option<PathBuf>,
    },
    /// Parses and prints the files an NZB would expose, without binding
    /// any presenter. Useful for checking grouping/deobfuscation output.
    Inspect {
        nzb: PathBuf,
    },
}

fn default_threads() -> usize {
    std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4)
}

async fn build_service(settings: &Settings, tree: Arc<Tree>) -> anyhow::Result<Service> {
    let cache = DiskCache::open(&settings.cache.path, settings.cache.max_size, EvictMode::Blocking)
        .await
        .context("opening disk cache")?;

    let nntp_cfg = NntpConfig {
        host: settings.usenet.host.clone(),
        port: settings.usenet.port,
        tls: settings.usenet.tls,
        user: settings.usenet.user.clone(),
        pass: settings.usenet.pass.clone(),
        max_conn: settings.usenet.max_conn,
        ..Default::default()
    };
    let fetcher = Arc::new(NntpClient::new(nntp_cfg));

    let read_ahead = (settings.read_ahead.max_bytes > 1).then(|| nzbfs_engine::readahead::ReadAheadConfig {
        avg_speed_window: std::time::Duration::from_secs_f64(settings.read_ahead.avg_speed_window_secs),
        read_ahead_horizon: std::time::Duration::from_secs_f64(settings.read_ahead.horizon_secs),
        min_bytes: settings.read_ahead.min_bytes,
        max_bytes: settings.read_ahead.max_bytes,
        low_water_bytes: settings.read_ahead.low_water_bytes,
    });

    let service_config = ServiceConfig {
        file_blacklist: Settings::compile_blacklist(&settings.nzb_filter.file_blacklist, "nzb_filter.file_blacklist")?,
        fs_blacklist: Settings::compile_blacklist(&settings.filesystem.blacklist, "filesystem.blacklist")?,
        flatten_max_depth: settings.filesystem.flatten_max_depth,
        fix_filename_threshold: settings.filesystem.fix_filename_threshold,
        try_read_bytes: settings.nzb_filter.try_read_bytes,
        try_read_pct: settings.nzb_filter.try_read_pct,
        healthy_threshold: settings.nzb_filter.healthy_threshold,
        health_check: settings.nzb_filter.try_read_bytes > 0 || settings.nzb_filter.try_read_pct > 0.0,
        read_ahead,
    };

    Ok(Service::new(tree, cache, fetcher, service_config))
}

async fn register_nzbs(service: &Service, paths: &[PathBuf]) -> anyhow::Result<()> {
    for path in paths {
        let bytes = tokio::fs::read(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let nzb = parse_nzb(&bytes).with_context(|| format!("parsing {}", path.display()))?;
        let name = nzb.name.clone();
        service
            .add_nzb(nzb)
            .await
            .with_context(|| format!("registering {name}"))?;
        info!(nzb = %name, "registered");
    }
    Ok(())
}

async fn serve_webdav(addr_spec: &str, tree: Arc<Tree>) -> anyhow::Result<()> {
    let addr: SocketAddr = if let Some(stripped) = addr_spec.strip_prefix(':') {
        format!("0.0.0.0:{stripped}").parse()?
    } else {
        addr_spec.parse()?
    };

    let dav_handler = dav_server::DavHandler::builder()
        .filesystem(Box::new(nzbfs_presenters::webdav::NzbDavFs::new(tree)))
        .locksystem(dav_server::fakels::FakeLs::new())
        .build_handler();

    let dav_service = service_fn(move |req: Request<Body>| {
        let dav_handler = dav_handler.clone();
        async move { Ok::<_, std::convert::Infallible>(dav_handler.handle(req).await) }
    });

    let app = axum::Router::new().route_service("/*path", dav_service);

    info!(%addr, "webdav presenter listening");
    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app).await?;
    Ok(())
}

fn mount_fuse(
    mountpoint: &PathBuf,
    tree: Arc<Tree>,
    allow_other: bool,
) -> anyhow::Result<nzbfs_presenters::fuse::FuseDaemon> {
    let fs = nzbfs_presenters::fuse::NzbFuseFs::new(tree, tokio::runtime::Handle::current());
    let daemon = nzbfs_presenters::fuse::FuseDaemon::new(fs, mountpoint, default_threads(), allow_other)?;
    Ok(daemon)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let mut settings = Settings::load(cli.config.as_deref())?;
    if let Some(level) = cli.log_level {
        settings.log_level = level.to_string().to_lowercase();
    }

    let level: Level = settings.log_level.parse().unwrap_or(Level::INFO);
    nzbfs_tracing::TracingBuilder::default().level(level).init()?;

    match cli.command {
        Commands::Serve { nzbs, mount } => {
            let tree = Arc::new(Tree::new());
            let service = build_service(&settings, tree.clone()).await?;
            register_nzbs(&service, &nzbs).await?;

            let _fuse_daemon = match &mount {
                Some(path) => Some(mount_fuse(path, tree.clone(), settings.presenters.mount_allow_other)?),
                None => None,
            };

            serve_webdav(&settings.presenters.webdav_addr, tree).await?;
        }
        Commands::Inspect { nzb } => {
            let tree = Arc::new(Tree::new());
            let service = build_service(&settings, tree.clone()).await?;
            register_nzbs(&service, std::slice::from_ref(&nzb)).await?;
            for entry in tree.list("", true)? {
                if !entry.is_dir {
                    println!("{}\t{}", entry.size, entry.path);
                }
            }
        }
    }

    Ok(())
}
