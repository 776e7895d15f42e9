//! dxfuse command line front end.
//!
//! Usage:
//!   dxfuse [flags] MOUNTPOINT PROJECT1 [PROJECT2 ...]
//!   dxfuse [flags] MOUNTPOINT manifest.json
//!
//! Projects can be named by id (`project-…`) or by name; the manifest
//! form describes the initial filesystem structure explicitly.

use std::fs::OpenOptions;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tracing_subscriber::EnvFilter;

use dxfuse_common::{
    Error, Manifest, ManifestDirectory, Result, HTTP_CLIENT_POOL_SIZE, LOG_FILE,
};
use dxfuse_platform::{
    HttpPlatformClient, HttpRangeFetcher, PlatformClient, PlatformEnvironment,
};
use dxfuse_vfs::{mount_foreground, Filesys, Options};

#[derive(Parser, Debug)]
#[command(name = "dxfuse", version)]
#[command(about = "Mount remote projects as a POSIX filesystem")]
struct Args {
    /// Mount the filesystem in read-only mode
    #[arg(long = "readOnly")]
    read_only: bool,

    /// Enable verbose debugging (0, 1, 2, ...)
    #[arg(long, default_value_t = 0)]
    verbose: u32,

    /// Tap into FUSE debugging information
    #[arg(long = "debugFuse")]
    debug_fuse: bool,

    /// Owner uid reported for filesystem nodes (defaults to the caller)
    #[arg(long)]
    uid: Option<u32>,

    /// Owner gid reported for filesystem nodes (defaults to the caller)
    #[arg(long)]
    gid: Option<u32>,

    /// Where to mount the filesystem
    mountpoint: PathBuf,

    /// Project ids/names, or a single manifest.json
    #[arg(required = true)]
    targets: Vec<String>,
}

fn init_logging(args: &Args) {
    let level: &str = match args.verbose {
        0 => "info",
        1 => "debug",
        _ => "trace",
    };
    let mut directives: String = level.to_string();
    if args.debug_fuse {
        directives.push_str(",fuser=debug");
    }
    let filter: EnvFilter = EnvFilter::new(directives);

    // The daemon's stdout/stderr go away once the shell moves on; log to
    // a file when we can.
    let log_file = OpenOptions::new().create(true).append(true).open(LOG_FILE);
    match log_file {
        Ok(file) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(Arc::new(file))
                .with_ansi(false)
                .init();
        }
        Err(_) => {
            tracing_subscriber::fmt()
                .with_env_filter(filter)
                .with_writer(std::io::stderr)
                .with_ansi(false)
                .init();
        }
    }
}

/// Resolve one command line target to a project id.
async fn resolve_project(client: &HttpPlatformClient, target: &str) -> Result<String> {
    if target.starts_with("project-") {
        return Ok(target.to_string());
    }
    match client.find_project(target).await? {
        Some(id) => Ok(id),
        None => Err(Error::NotFound),
    }
}

/// Assemble the mount manifest: either parse the one given, or build one
/// directory entry per project, mounted under the project's name.
async fn build_manifest(client: &HttpPlatformClient, args: &Args) -> Result<Manifest> {
    if args.targets.len() == 1 && args.targets[0].ends_with(".json") {
        let payload: String = std::fs::read_to_string(&args.targets[0])?;
        return Manifest::parse(&payload);
    }

    let mut manifest = Manifest::default();
    for target in &args.targets {
        let proj_id: String = resolve_project(client, target).await.map_err(|e| {
            Error::IO(format!("could not resolve project {}: {}", target, e))
        })?;
        let desc = client.describe_project(&proj_id).await?;
        manifest.directories.push(ManifestDirectory {
            proj_id: desc.id.clone(),
            folder: "/".to_string(),
            dirname: format!("/{}", desc.name),
            ctime: desc.ctime,
            mtime: desc.mtime,
        });
    }
    manifest.validate()?;
    Ok(manifest)
}

async fn serve(args: Args) -> Result<()> {
    let env: PlatformEnvironment = PlatformEnvironment::from_env()?;
    if !env.on_worker() {
        eprintln!(
            "Warning: running outside a worker. The filesystem depends on a \
             good network path to the platform and its backing store; without \
             one, kernel timeouts can freeze the mount."
        );
    }

    let client = Arc::new(HttpPlatformClient::new(env, HTTP_CLIENT_POOL_SIZE));
    let manifest: Manifest = build_manifest(&client, &args).await?;

    let uid: u32 = args.uid.unwrap_or_else(|| unsafe { libc::getuid() });
    let gid: u32 = args.gid.unwrap_or_else(|| unsafe { libc::getgid() });
    let mut options: Options = Options::default()
        .with_read_only(args.read_only)
        .with_owner(uid, gid);
    options.verbose_level = args.verbose;

    let read_only: bool = options.read_only;
    let fsys: Filesys = Filesys::new(
        client,
        Arc::new(HttpRangeFetcher::new()),
        &manifest,
        options,
    )
    .await?;

    tracing::info!("mounting dxfuse at {}", args.mountpoint.display());
    eprintln!("Ready");

    // Serves until unmounted; upload draining runs in session teardown.
    let mountpoint: PathBuf = args.mountpoint.clone();
    tokio::task::spawn_blocking(move || mount_foreground(fsys, &mountpoint, read_only))
        .await
        .map_err(|e| Error::IO(format!("mount task failed: {}", e)))?
}

fn main() {
    let args: Args = Args::parse();
    init_logging(&args);

    let runtime = match tokio::runtime::Builder::new_multi_thread().enable_all().build() {
        Ok(rt) => rt,
        Err(e) => {
            eprintln!("dxfuse: could not start runtime: {}", e);
            std::process::exit(1);
        }
    };

    match runtime.block_on(serve(args)) {
        Ok(()) => {}
        Err(e) => {
            tracing::error!("{}", e);
            eprintln!("dxfuse: {}", e);
            std::process::exit(1);
        }
    }
}
