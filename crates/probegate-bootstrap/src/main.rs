//! probe-bootstrap: first-boot provisioning and tunnel supervision on a probe

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use probegate_bootstrap::{
    BootstrapAgent, BootstrapConfig, BootstrapError, BootstrapOutcome, BootstrapSeams, BootstrapSettings,
    CompletionMarker, HttpPortClient, HttpRegistrationTrigger, RegistrationTrigger, SshKeygenProvider,
    SysfsMacSource, SystemdTunnelInstaller, DEFAULT_CONFIG_FILE,
};
use probegate_tunnel::{SshLauncher, SystemdInstaller, TunnelCredentials, TunnelSpec, TunnelSupervisor};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use tracing::{error, info, warn};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Probe bootstrap agent
#[derive(Parser, Debug)]
#[command(name = "probe-bootstrap")]
#[command(about = "Zero-touch probe provisioning: port, key, tunnel, registration")]
#[command(version)]
struct Cli {
    /// Bootstrap configuration file (YAML)
    #[arg(short, long, global = true, env = "PROBEGATE_BOOTSTRAP_CONFIG", default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    /// Log level (trace, debug, info, warn, error)
    #[arg(long, global = true, env = "RUST_LOG", default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the bootstrap state machine once (no-op when already complete)
    Run {
        /// Port Allocation Service base URL
        #[arg(long, env = "PROBEGATE_GATEKEEPER_URL")]
        gatekeeper_url: Option<String>,

        /// Registration trigger URL
        #[arg(long, env = "PROBEGATE_REGISTRATION_URL")]
        registration_url: Option<String>,

        /// Network interface identifying the probe
        #[arg(long, env = "PROBEGATE_INTERFACE")]
        interface: Option<String>,

        /// Ignore an existing completion marker
        #[arg(long)]
        force: bool,
    },

    /// Keep the reverse tunnel for PORT up until terminated (run by systemd)
    Supervise {
        /// Assigned proxy port
        #[arg(long)]
        port: u16,
    },
}

fn setup_logging(log_level: &str) {
    let filter = EnvFilter::try_new(log_level).unwrap_or_else(|_| EnvFilter::new("info"));

    tracing_subscriber::registry()
        .with(fmt::layer().with_target(true).with_thread_ids(false))
        .with(filter)
        .init();
}

fn load_config(path: &Path) -> Result<BootstrapConfig> {
    if path.exists() {
        info!("Loading configuration from: {}", path.display());
        Ok(BootstrapConfig::load(path)?)
    } else {
        warn!("Config file {} not found, using defaults", path.display());
        Ok(BootstrapConfig::default())
    }
}

async fn run_bootstrap(config_path: &Path, config: BootstrapConfig, force: bool) -> Result<BootstrapOutcome, BootstrapError> {
    let marker = CompletionMarker::new(&config.marker_path);
    if force && marker.is_present().await {
        warn!(path = %marker.path().display(), "Removing completion marker (--force)");
        tokio::fs::remove_file(marker.path())
            .await
            .map_err(|e| BootstrapError::Fatal(format!("Failed to remove marker: {}", e)))?;
    }

    let hostname = hostname::get()
        .map(|h| h.to_string_lossy().into_owned())
        .unwrap_or_else(|_| "unknown".to_string());

    let trigger: Option<Arc<dyn RegistrationTrigger>> = match &config.registration_url {
        Some(url) => Some(Arc::new(HttpRegistrationTrigger::new(url.clone(), config.http_timeout)?)),
        None => None,
    };

    let program = std::env::current_exe()
        .map_err(|e| BootstrapError::Fatal(format!("Cannot locate own executable: {}", e)))?;

    let seams = BootstrapSeams {
        mac_source: Arc::new(SysfsMacSource::new(config.interface.clone())),
        ports: Arc::new(HttpPortClient::new(config.gatekeeper_url.clone(), config.http_timeout)?),
        keys: Arc::new(SshKeygenProvider::new(
            config.private_key_path.clone(),
            format!("root@{}", hostname),
        )),
        tunnels: Arc::new(SystemdTunnelInstaller::new(SystemdInstaller::new(), program, config_path)),
        trigger,
    };

    let settings = BootstrapSettings {
        tenant_config_paths: config.tenant_config_paths.clone(),
        marker,
        retry: config.retry.clone(),
        hostname,
        host_config_key: config.host_config_key.clone(),
    };

    BootstrapAgent::new(settings, seams).run().await
}

async fn supervise(config: BootstrapConfig, port: u16) -> Result<()> {
    let spec = TunnelSpec::new(
        port,
        config.proxy.clone(),
        TunnelCredentials {
            private_key: config.private_key_path.clone(),
        },
    );

    let supervisor = TunnelSupervisor::new(Arc::new(SshLauncher::new()));
    supervisor
        .start(spec)
        .await
        .with_context(|| format!("Failed to start tunnel for port {}", port))?;

    info!(port, proxy = %config.proxy.destination(), "Supervising reverse tunnel");
    shutdown_signal().await;

    info!("Shutting down tunnel supervisor");
    supervisor.stop_all().await;
    Ok(())
}

async fn shutdown_signal() {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => {}
                    _ = term.recv() => {}
                }
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                let _ = tokio::signal::ctrl_c().await;
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    setup_logging(&cli.log_level);

    let mut config = match load_config(&cli.config) {
        Ok(config) => config,
        Err(e) => {
            error!("{:#}", e);
            return ExitCode::from(2);
        }
    };

    match cli.command {
        Commands::Run {
            gatekeeper_url,
            registration_url,
            interface,
            force,
        } => {
            if let Some(url) = gatekeeper_url {
                config.gatekeeper_url = url;
            }
            if let Some(url) = registration_url {
                config.registration_url = Some(url);
            }
            if let Some(interface) = interface {
                config.interface = interface;
            }
            if let Err(e) = config.validate() {
                error!("{}", e);
                return ExitCode::from(2);
            }

            match run_bootstrap(&cli.config, config, force).await {
                Ok(BootstrapOutcome::AlreadyComplete { .. }) => ExitCode::SUCCESS,
                Ok(BootstrapOutcome::Completed { proxy_port }) => {
                    info!(port = proxy_port, "Probe provisioned");
                    ExitCode::SUCCESS
                }
                Err(e @ BootstrapError::Retryable(_)) => {
                    error!("Bootstrap gave up, will retry on next start: {}", e);
                    ExitCode::from(1)
                }
                Err(e @ BootstrapError::Fatal(_)) => {
                    error!("Bootstrap failed, operator action required: {}", e);
                    ExitCode::from(2)
                }
            }
        }
        Commands::Supervise { port } => {
            if let Err(e) = config.validate() {
                error!("{}", e);
                return ExitCode::from(2);
            }
            match supervise(config, port).await {
                Ok(()) => ExitCode::SUCCESS,
                Err(e) => {
                    error!("{:#}", e);
                    ExitCode::from(1)
                }
            }
        }
    }
}
