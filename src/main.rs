//! wg-guard main entry point
//!
//! Runs the control server, or acts as a client of a running server to
//! manage tunnels and peers from the command line.

use anyhow::{bail, Context as _};
use clap::{Parser, Subcommand, ValueEnum};
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tracing::{error, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use wg_guard::config::{validation, BackendKind, Config, DEFAULT_CONFIG_PATH};
use wg_guard::control::{CommandHandler, ControlClient, ControlServer};
use wg_guard::device::{DeviceBackend, MemoryBackend, Reconciler, WgQuickBackend};
use wg_guard::lifecycle::{CreateTunnel, LifecycleManager, NewPeer};
use wg_guard::render::Profile;
use wg_guard::store::FileStore;
use wg_guard::{APP_NAME, VERSION};

/// WireGuard control plane
#[derive(Parser, Debug)]
#[command(name = APP_NAME, version = VERSION, about, long_about = None)]
struct Cli {
    /// Enable debug output in the logs
    #[arg(long, global = true)]
    debug: bool,

    /// Configuration file path
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Control server address
    #[arg(short, long, global = true)]
    address: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the control server
    Server {
        /// WireGuard configuration and state directory
        #[arg(long)]
        dir: Option<PathBuf>,

        /// External endpoint of the guard tunnel
        #[arg(long)]
        endpoint: Option<String>,

        /// Device backend
        #[arg(long, value_enum)]
        backend: Option<Backend>,
    },

    /// Create a new tunnel
    Create {
        /// Tunnel ID
        id: String,

        /// CIDR for the tunnel address
        #[arg(short, long)]
        address: String,

        /// Endpoint peers connect to; peers dial its host on the tunnel's listen port
        #[arg(short, long, default_value = "127.0.0.1:31000")]
        endpoint: String,
    },

    /// Delete a tunnel
    Delete {
        /// Tunnel ID
        id: String,
    },

    /// List all tunnels
    List,

    /// Manage peers
    Peers {
        /// Tunnel name
        #[arg(short, long)]
        tunnel: String,

        #[command(subcommand)]
        command: PeerCommands,
    },
}

#[derive(Subcommand, Debug)]
enum PeerCommands {
    /// Create a new peer and print its connection profile
    New {
        /// Peer ID
        id: String,

        /// Address for the peer instead of the next free one
        #[arg(short, long)]
        ip: Option<String>,

        /// DNS for the peer
        #[arg(long)]
        dns: Option<String>,

        /// Ranges the peer routes through the tunnel
        #[arg(long, value_delimiter = ',')]
        ips: Vec<String>,

        /// Extra ranges routed to the peer
        #[arg(long, value_delimiter = ',')]
        route: Vec<String>,

        /// Keepalive interval in seconds
        #[arg(long)]
        keepalive: Option<u16>,
    },

    /// Delete a peer
    Delete {
        /// Peer ID
        id: String,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum Backend {
    WgQuick,
    Memory,
}

impl From<Backend> for BackendKind {
    fn from(backend: Backend) -> Self {
        match backend {
            Backend::WgQuick => BackendKind::WgQuick,
            Backend::Memory => BackendKind::Memory,
        }
    }
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Initialize logging
    init_logging(cli.debug);

    if let Err(e) = run(cli).await {
        error!("Error: {:#}", e);
        eprintln!("{:#}", e);
        std::process::exit(1);
    }
}

/// Initialize structured logging with tracing
fn init_logging(debug: bool) {
    let filter = if debug {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("debug"))
    } else {
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"))
    };

    tracing_subscriber::registry()
        .with(filter)
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}

/// Load the configuration and apply global overrides
fn load_config(cli: &Cli) -> anyhow::Result<Config> {
    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::from_file_or_default(DEFAULT_CONFIG_PATH)?,
    };
    if let Some(address) = &cli.address {
        config.server.address = address.clone();
    }
    Ok(config)
}

/// Run the CLI command
async fn run(cli: Cli) -> anyhow::Result<()> {
    let mut config = load_config(&cli)?;

    if let Commands::Server {
        dir,
        endpoint,
        backend,
    } = cli.command
    {
        if let Some(dir) = dir {
            config.server.state_dir = dir;
        }
        if endpoint.is_some() {
            config.server.endpoint = endpoint;
        }
        if let Some(backend) = backend {
            config.server.backend = backend.into();
        }
        config.validate()?;
        return serve(config).await;
    }

    let addr = validation::parse_listen_address(&config.server.address)?;
    let mut client = ControlClient::connect(addr).await?;

    match cli.command {
        Commands::Server { .. } => Ok(()),
        Commands::Create {
            id,
            address,
            endpoint,
        } => {
            let req = CreateTunnel {
                id,
                address,
                endpoint,
            };
            let tunnel = cancellable(client.create_tunnel(req)).await?;
            print_json(&tunnel)
        }
        Commands::Delete { id } => cancellable(client.delete_tunnel(&id)).await,
        Commands::List => {
            let tunnels = cancellable(client.list_tunnels()).await?;
            if tunnels.is_empty() {
                return Ok(());
            }
            print_json(&tunnels)
        }
        Commands::Peers { tunnel, command } => match command {
            PeerCommands::New {
                id,
                ip,
                dns,
                ips,
                route,
                keepalive,
            } => {
                let allowed_ips = ips
                    .iter()
                    .map(|ip| validation::parse_cidr(ip))
                    .collect::<wg_guard::Result<Vec<_>>>()?;

                let req = NewPeer {
                    tunnel_id: tunnel,
                    peer_id: id,
                    address: ip,
                    dns,
                    allowed_ips: route,
                };
                let created = cancellable(client.new_peer(req)).await?;

                let mut profile = Profile::for_peer(&created.peer, &created.tunnel, allowed_ips)?;
                for peer in &mut profile.peers {
                    peer.persistent_keepalive = keepalive;
                }
                print!("{}", profile.render());
                Ok(())
            }
            PeerCommands::Delete { id } => {
                let updated = cancellable(client.delete_peer(&tunnel, &id)).await?;
                print_json(&updated)
            }
        },
    }
}

/// Run the control server until a shutdown signal arrives
async fn serve(config: Config) -> anyhow::Result<()> {
    let server_config = &config.server;
    info!("Starting {} v{}", APP_NAME, VERSION);

    let backend: Arc<dyn DeviceBackend> = match server_config.backend {
        BackendKind::WgQuick => {
            if !is_root() {
                bail!("control server must run as root to manage WireGuard devices");
            }
            Arc::new(WgQuickBackend::new(&server_config.state_dir))
        }
        BackendKind::Memory => {
            warn!("Using in-memory device backend; no interfaces will be configured");
            Arc::new(MemoryBackend::new())
        }
    };

    let store = FileStore::open(&server_config.state_dir)
        .with_context(|| format!("opening state directory {:?}", server_config.state_dir))?;
    let manager = Arc::new(LifecycleManager::new(
        Arc::new(store),
        Reconciler::new(backend),
        server_config.base_listen_port,
    ));

    let failed = manager.reconcile_all().await?;
    if failed > 0 {
        warn!("{} tunnel(s) could not be reconciled at startup", failed);
    }

    let guard = manager
        .ensure_guard_tunnel(server_config)
        .await
        .context("creating guard tunnel")?;
    info!(
        "Guard tunnel '{}' at {} (public key {})",
        guard.id, guard.address, guard.public_key
    );

    let handler = Arc::new(CommandHandler::new(manager));
    let server = ControlServer::bind(server_config.listen_address()?, handler).await?;
    server.serve(shutdown_signal()).await?;

    info!("Server stopped");
    Ok(())
}

/// Abort the in-flight request when a shutdown signal arrives.
///
/// Dropping the connection makes the server cancel the request if it has not
/// reached the device yet.
async fn cancellable<T, F>(request: F) -> anyhow::Result<T>
where
    F: Future<Output = wg_guard::Result<T>>,
{
    tokio::select! {
        result = request => Ok(result?),
        _ = shutdown_signal() => bail!("request cancelled"),
    }
}

fn print_json<T: serde::Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(unix)]
fn is_root() -> bool {
    // SAFETY: geteuid has no preconditions and cannot fail
    unsafe { libc::geteuid() == 0 }
}

#[cfg(not(unix))]
fn is_root() -> bool {
    false
}

/// Wait for shutdown signal (Ctrl+C or SIGTERM)
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C signal");
        },
        _ = terminate => {
            info!("Received SIGTERM signal");
        },
    }
}
