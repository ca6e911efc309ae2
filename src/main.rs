// src/main.rs
use std::net::{IpAddr, Ipv4Addr, SocketAddr};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::{Parser, Subcommand};
use tokio::net::TcpListener;
use tokio::signal::unix::{signal, SignalKind};
use tokio::task::JoinHandle;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use cyberdeck_login::auth::AuthService;
use cyberdeck_login::command::{CommandRunner, SystemRunner};
use cyberdeck_login::config::{Paths, ServerConfig};
use cyberdeck_login::context::ServerContext;
use cyberdeck_login::control::{self, ControlCommand, ControlServer, DEFAULT_CONTROL_SOCKET};
use cyberdeck_login::lock_monitor::LockStateMonitor;
use cyberdeck_login::nonce::NonceManager;
use cyberdeck_login::registry::DeviceRegistry;
use cyberdeck_login::relay::{verifier, RelayClient, RelayClientConfig, RelayHub};
use cyberdeck_login::session::{RegistrationWindow, SessionOrchestrator};
use cyberdeck_login::transport::{LocalGatt, Peripheral, Radio};
use cyberdeck_login::unlock::{UnlockActuator, DEFAULT_TRIGGER_FILE};

#[derive(Parser)]
#[command(name = "cyberdeck-login", version, about = "Bluetooth challenge/response unlock server")]
struct Cli {
    #[arg(long, env = "CONFIG_PATH", default_value = "/data/config.json", global = true)]
    config: PathBuf,
    #[arg(long, env = "PUBLIC_KEYS_DIR", default_value = "/data/publicKeys", global = true)]
    public_keys_dir: PathBuf,
    #[arg(long, env = "TRUSTED_KEYS_DIR", default_value = "/data/trustedKeys", global = true)]
    trusted_keys_dir: PathBuf,
    #[arg(long, env = "CONTROL_SOCKET", default_value = DEFAULT_CONTROL_SOCKET, global = true)]
    control_socket: PathBuf,
    #[arg(long, env = "TRIGGER_FILE", default_value = DEFAULT_TRIGGER_FILE, global = true)]
    trigger_file: PathBuf,
    #[command(subcommand)]
    mode: Option<Mode>,
}

#[derive(Subcommand)]
enum Mode {
    /// Serve the characteristics from the local radio (default).
    Serve,
    /// Verify on this host for a radio host connecting over the relay.
    Verifier {
        #[arg(long, env = "TCP_PORT", default_value_t = 3100)]
        port: u16,
        #[arg(long, default_value_t = IpAddr::V4(Ipv4Addr::UNSPECIFIED))]
        bind: IpAddr,
    },
    /// Advertise here and forward every operation to a verifier.
    RadioRelay {
        /// `host:port` or a full `ws://` URL.
        #[arg(long, env = "RELAY_SERVER")]
        server: String,
        #[arg(long, env = "COMPUTER_NAME", default_value = "cyberdeck")]
        name: String,
    },
    /// Open the registration window on a running server.
    RegisterMode {
        seconds: Option<u64>,
        #[arg(long)]
        exit: bool,
    },
    /// Print a running server's state.
    Status,
}

impl Cli {
    fn paths(&self) -> Paths {
        Paths {
            config: self.config.clone(),
            public_keys_dir: self.public_keys_dir.clone(),
            trusted_keys_dir: self.trusted_keys_dir.clone(),
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    match &cli.mode {
        None | Some(Mode::Serve) => serve(&cli).await,
        Some(Mode::Verifier { port, bind }) => {
            run_verifier(&cli, SocketAddr::new(*bind, *port)).await
        }
        Some(Mode::RadioRelay { server, name }) => run_radio_relay(server, name).await,
        Some(Mode::RegisterMode { seconds, exit }) => register_mode(&cli, *seconds, *exit).await,
        Some(Mode::Status) => status(&cli).await,
    }
}

struct Core {
    config: ServerConfig,
    ctx: Arc<ServerContext>,
    nonces: Arc<NonceManager>,
    registry: Arc<DeviceRegistry>,
}

async fn build_core(cli: &Cli, registration: Arc<RegistrationWindow>) -> anyhow::Result<Core> {
    let paths = cli.paths();
    let config = ServerConfig::load(&paths).await?;

    let registry = Arc::new(DeviceRegistry::new(
        config.registered_devices.clone(),
        paths.trusted_keys_dir.clone(),
        paths.public_keys_dir.clone(),
    ));
    registry.load().await?;
    info!(devices = registry.snapshot().len(), "trusted devices loaded");

    let nonces = Arc::new(NonceManager::new(config.nonce_rotation_interval()));
    nonces.start_rotation();

    let auth = Arc::new(AuthService::new(
        nonces.clone(),
        registry.clone(),
        config.computer_name.clone(),
    ));
    let runner = Arc::new(SystemRunner::new(Duration::from_millis(
        config.unlock.command_timeout_ms,
    )));
    let unlocker = Arc::new(UnlockActuator::new(
        config.login_user.clone(),
        cli.trigger_file.clone(),
        config.unlock.clone(),
        runner,
    ));

    let ctx = Arc::new(ServerContext {
        auth,
        registry: registry.clone(),
        unlocker,
        registration,
    });
    Ok(Core {
        config,
        ctx,
        nonces,
        registry,
    })
}

#[cfg(feature = "bluez")]
async fn open_radio() -> anyhow::Result<Arc<dyn Radio>> {
    let radio = cyberdeck_login::transport::bluez::BluezRadio::open().await?;
    Ok(Arc::new(radio))
}

#[cfg(not(feature = "bluez"))]
async fn open_radio() -> anyhow::Result<Arc<dyn Radio>> {
    anyhow::bail!("no radio backend: rebuild with `--features bluez`")
}

async fn start_control(
    cli: &Cli,
    orchestrator: &Arc<SessionOrchestrator>,
    config: &ServerConfig,
) -> anyhow::Result<(Arc<ControlServer>, JoinHandle<()>)> {
    let control = Arc::new(ControlServer::new(
        orchestrator.clone(),
        config.registration_duration(),
        cli.control_socket.clone(),
    ));
    let listener = control.bind().await?;
    let task = tokio::spawn(control.clone().serve(listener));
    Ok((control, task))
}

async fn serve(cli: &Cli) -> anyhow::Result<()> {
    let radio = open_radio().await?;
    let registration = Arc::new(RegistrationWindow::new());
    let core = build_core(cli, registration.clone()).await?;
    let watcher = core.registry.spawn_watcher(core.config.registry_poll_interval());

    let runner: Arc<dyn CommandRunner> = Arc::new(SystemRunner::default());
    let monitor = LockStateMonitor::desktop(
        runner,
        core.config.idle_threshold(),
        core.config.idle_poll_interval(),
    );
    let peripheral = Peripheral::new(
        radio,
        Arc::new(LocalGatt::new(core.ctx.clone())),
        &core.config.computer_name,
    );
    let orchestrator = Arc::new(SessionOrchestrator::new(
        peripheral,
        monitor.probe(),
        registration,
    ));
    let (control, control_task) = start_control(cli, &orchestrator, &core.config).await?;

    if let Err(e) = orchestrator.sync_initial_state().await {
        error!("initial advertising failed: {e}");
    }
    let events = monitor.start();
    let orch = orchestrator.clone();
    let events_task = tokio::spawn(async move { orch.run(events).await });
    info!(name = %core.config.computer_name, "unlock server running");

    shutdown_signal().await;
    info!("shutting down");
    monitor.stop();
    events_task.abort();
    watcher.abort();
    control_task.abort();
    orchestrator.shutdown().await;
    core.nonces.stop_rotation();
    remove_socket(&control).await;
    Ok(())
}

async fn run_verifier(cli: &Cli, addr: SocketAddr) -> anyhow::Result<()> {
    let orchestrator = Arc::new(SessionOrchestrator::registration_only());
    let core = build_core(cli, orchestrator.registration()).await?;
    let watcher = core.registry.spawn_watcher(core.config.registry_poll_interval());
    let (control, control_task) = start_control(cli, &orchestrator, &core.config).await?;

    let hub = RelayHub::new(core.ctx.clone());
    let listener = TcpListener::bind(addr).await?;
    let result = tokio::select! {
        r = verifier::serve(listener, hub) => r,
        _ = shutdown_signal() => {
            info!("shutting down");
            Ok(())
        }
    };

    watcher.abort();
    control_task.abort();
    orchestrator.shutdown().await;
    core.nonces.stop_rotation();
    remove_socket(&control).await;
    result
}

async fn run_radio_relay(server: &str, name: &str) -> anyhow::Result<()> {
    let radio = open_radio().await?;
    let url = if server.starts_with("ws://") || server.starts_with("wss://") {
        server.to_string()
    } else {
        format!("ws://{server}")
    };
    let client = RelayClient::new(RelayClientConfig::new(url));
    let link = client.spawn();

    // the verifier decides who gets in; the radio host advertises throughout
    let peripheral = Peripheral::new(radio, client.clone(), name);
    peripheral.start().await?;
    info!(name, "relay radio running");

    shutdown_signal().await;
    info!("shutting down");
    link.abort();
    if let Err(e) = peripheral.stop().await {
        error!("failed to stop advertising: {e}");
    }
    Ok(())
}

async fn register_mode(cli: &Cli, seconds: Option<u64>, exit: bool) -> anyhow::Result<()> {
    let cmd = if exit {
        ControlCommand::ExitRegistrationMode
    } else {
        ControlCommand::EnterRegistrationMode {
            duration_ms: seconds.map(|s| s.saturating_mul(1000)),
        }
    };
    let reply = control::send_command(&cli.control_socket, &cmd).await?;
    if !reply.success {
        anyhow::bail!(reply.error.unwrap_or_else(|| "request failed".into()));
    }
    match (exit, reply.expires_at) {
        (true, _) => println!("Registration mode disabled"),
        (false, Some(t)) => {
            let until = chrono::DateTime::from_timestamp_millis(t)
                .map(|d| d.with_timezone(&chrono::Local).format("%H:%M:%S").to_string())
                .unwrap_or_default();
            println!("Registration mode enabled until {until}");
        }
        (false, None) => println!("Registration mode enabled"),
    }
    Ok(())
}

async fn status(cli: &Cli) -> anyhow::Result<()> {
    let reply = control::send_command(&cli.control_socket, &ControlCommand::Status).await?;
    println!("{}", serde_json::to_string_pretty(&reply)?);
    Ok(())
}

async fn remove_socket(control: &ControlServer) {
    match tokio::fs::remove_file(control.path()).await {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => error!("failed to remove control socket: {e}"),
    }
}

async fn shutdown_signal() {
    let term = async {
        match signal(SignalKind::terminate()) {
            Ok(mut s) => {
                s.recv().await;
            }
            Err(e) => {
                error!("cannot listen for SIGTERM: {e}");
                std::future::pending::<()>().await;
            }
        }
    };
    tokio::select! {
        r = tokio::signal::ctrl_c() => {
            if let Err(e) = r {
                error!("cannot listen for SIGINT: {e}");
            }
        }
        _ = term => {}
    }
}
