use routekeeper::api::{ApiServer, ApiState, PKG_NAME, VERSION};
use routekeeper::config::Config;
use routekeeper::registry::Registry;
use routekeeper::reload::{CommandReloader, NoopReloader, Reload};
use routekeeper::service::BackendService;
use routekeeper::template::TemplateStore;
use routekeeper::users::UserStore;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("routekeeper=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);
    check_directories(&config);

    // One instance per backend directory: the PID file lock enforces it
    let pid_file_path = config.server.pid_file.as_ref().map(PathBuf::from);
    let _pid_file = if let Some(ref path) = pid_file_path {
        let pid_file = write_pid_file(path)?;
        info!(path = %path.display(), "PID file written and locked");
        Some(pid_file)
    } else {
        None
    };

    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let reloader: Arc<dyn Reload> = if config.reload.enabled {
        let reloader = CommandReloader::from_command_line(&config.reload.command)?;
        info!(command = %config.reload.command, "Proxy reload command configured");
        Arc::new(reloader)
    } else {
        warn!("Proxy reload disabled, changes are picked up on the proxy's own schedule");
        Arc::new(NoopReloader)
    };

    let registry = Registry::open(config.paths.backend_dir());
    let backends = Arc::new(BackendService::new(
        registry,
        TemplateStore::new(config.paths.template_dir()),
        reloader,
        config.paths.user_dir(),
    ));

    let api_key = config.server.api_key.clone().unwrap_or_else(|| {
        let key = uuid::Uuid::new_v4().to_string();
        info!(api_key = %key, "Generated API key (configure server.api_key to set a fixed value)");
        key
    });

    let state = Arc::new(ApiState {
        backends: Arc::clone(&backends),
        users: UserStore::new(config.paths.user_dir(), config.paths.user_suffix.clone()),
        api_key,
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let api_server = ApiServer::new(bind_addr, state, shutdown_rx);
    let api_handle = tokio::spawn(async move {
        if let Err(e) = api_server.run().await {
            error!(error = %e, "API server error");
        }
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM) or a rescan request (SIGHUP)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sighup = signal(SignalKind::hangup())?;

        loop {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {
                    info!("Received SIGINT (Ctrl+C), shutting down...");
                    break;
                }
                _ = sigterm.recv() => {
                    info!("Received SIGTERM, shutting down...");
                    break;
                }
                _ = sighup.recv() => {
                    info!(path = %config.paths.backend_dir, "Received SIGHUP, rescanning backend directory...");
                    let count = backends.rescan();
                    info!(backends = count, "Backend directory rescanned");
                }
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    let _ = shutdown_tx.send(true);

    let _ = tokio::time::timeout(Duration::from_secs(5), api_handle).await;

    if let Some(ref path) = pid_file_path {
        if let Err(e) = std::fs::remove_file(path) {
            warn!(path = %path.display(), error = %e, "Failed to remove PID file");
        }
    }

    info!("Shutdown complete");
    Ok(())
}

/// PID file handle that maintains an exclusive lock
#[cfg(unix)]
struct PidFile {
    _file: std::fs::File,
}

#[cfg(unix)]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        use std::os::unix::io::AsRawFd;

        let file = std::fs::OpenOptions::new()
            .write(true)
            .create(true)
            .truncate(true)
            .open(path)?;

        // Try to acquire exclusive lock (non-blocking)
        let fd = file.as_raw_fd();
        let result = unsafe { libc::flock(fd, libc::LOCK_EX | libc::LOCK_NB) };

        if result != 0 {
            let err = std::io::Error::last_os_error();
            if err.kind() == std::io::ErrorKind::WouldBlock {
                anyhow::bail!("Another instance is already running (PID file is locked)");
            }
            return Err(err.into());
        }

        let pid = std::process::id();
        use std::io::Write;
        writeln!(&file, "{}", pid)?;

        // Keep the file handle open to maintain the lock
        Ok(Self { _file: file })
    }
}

#[cfg(not(unix))]
struct PidFile;

#[cfg(not(unix))]
impl PidFile {
    fn create(path: &Path) -> anyhow::Result<Self> {
        let pid = std::process::id();
        let mut file = std::fs::File::create(path)?;
        use std::io::Write;
        writeln!(file, "{}", pid)?;
        Ok(Self)
    }
}

fn write_pid_file(path: &Path) -> anyhow::Result<PidFile> {
    PidFile::create(path)
}

/// Missing directories are not fatal: the registry reads as empty until they appear
fn check_directories(config: &Config) {
    for (name, dir) in [
        ("backend_dir", config.paths.backend_dir()),
        ("template_dir", config.paths.template_dir()),
    ] {
        if !dir.is_dir() {
            warn!(setting = name, path = %dir.display(), "Configured directory does not exist");
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting backend control plane");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        api_key_configured = config.server.api_key.is_some(),
        "Server configuration"
    );
    info!(
        backend_dir = %config.paths.backend_dir,
        template_dir = %config.paths.template_dir,
        user_dir = %config.paths.user_dir().display(),
        "Paths"
    );
    info!(
        enabled = config.reload.enabled,
        command = %config.reload.command,
        "Proxy reload settings"
    );
}
