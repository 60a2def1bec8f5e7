use std::{net::SocketAddr, path::Path, sync::Arc, time::Duration};

use apiman::{
    adapters::{
        FileConfigProvider, HttpFunctionClient, InMemoryEntityStore, KongClient, LocalGateway,
        admin::{self, AdminState},
        server,
    },
    config::{ManagerConfig, ManagerConfigValidator, loader::load_config, models::GatewayDriver},
    core::{ApiService, Controller, ControllerOptions, DispatchOptions},
    metrics,
    ports::{ConfigProvider, EntityStore, FunctionClient, Gateway},
    tracing_setup,
    utils::{GracefulShutdown, ShutdownReason},
};
use clap::Parser;
use color_eyre::{
    Result,
    eyre::{Context, WrapErr},
};
use tokio::task::JoinHandle;

#[derive(Parser, Debug)]
#[clap(author, version, about)]
struct Args {
    #[clap(subcommand)]
    command: Option<Commands>,

    #[clap(short, long, default_value = "apiman.toml")]
    config: String,
}

#[derive(Parser, Debug)]
enum Commands {
    /// Validate configuration file
    Validate {
        /// Configuration file to validate
        #[clap(short, long, default_value = "apiman.toml")]
        config: String,
    },
    /// Initialize a new configuration file
    Init {
        /// Output path for the new config file
        #[clap(short, long, default_value = "apiman.toml")]
        config: String,
    },
    /// Start the manager (default)
    Serve {
        /// Configuration file to use
        #[clap(short, long, default_value = "apiman.toml")]
        config: String,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    color_eyre::install()?;

    let args = Args::parse();
    match args.command {
        Some(Commands::Validate { config }) => validate_config_command(&config).await,
        Some(Commands::Init { config }) => init_config_command(&config).await,
        Some(Commands::Serve { config }) => serve(&config).await,
        None => serve(&args.config).await,
    }
}

async fn serve(config_path: &str) -> Result<()> {
    // reqwest pulls in ring while rustls defaults to aws-lc-rs, so pick one explicitly
    let provider = rustls::crypto::aws_lc_rs::default_provider();
    let provider_installed = rustls::crypto::CryptoProvider::install_default(provider).is_ok();

    let config_provider = Arc::new(
        FileConfigProvider::new(config_path).context("Failed to create config provider")?,
    );
    let config: ManagerConfig = config_provider
        .load_config()
        .await
        .with_context(|| format!("Failed to load initial config from {config_path}"))?;
    ManagerConfigValidator::validate(&config).wrap_err("Invalid configuration")?;

    tracing_setup::init_tracing_with_config(&config.logging.level, config.logging.json, true)?;
    metrics::init_metrics()?;
    if !provider_installed {
        tracing::warn!("a rustls crypto provider was already installed, keeping it");
    }

    let listen_addr: SocketAddr = config
        .listen_addr
        .parse()
        .context("Failed to parse listen address")?;
    let admin_addr: SocketAddr = config
        .admin_addr
        .parse()
        .context("Failed to parse admin address")?;

    let shutdown = GracefulShutdown::new();
    {
        let shutdown = shutdown.clone();
        tokio::spawn(async move { shutdown.run_signal_handler().await });
    }

    let store: Arc<dyn EntityStore> = Arc::new(InMemoryEntityStore::new());
    let client: Arc<dyn FunctionClient> = Arc::new(
        HttpFunctionClient::new(
            config.function_manager.url.clone(),
            Duration::from_secs(config.function_manager.timeout_secs),
        )
        .context("Failed to create function manager client")?,
    );

    let mut servers: Vec<JoinHandle<()>> = Vec::new();

    let gateway: Arc<dyn Gateway> = match config.gateway.driver {
        GatewayDriver::Local => {
            let options = DispatchOptions {
                protocol_mismatch: config.gateway.protocol_mismatch,
                max_form_bytes: config.gateway.max_form_bytes,
            };
            let local = Arc::new(LocalGateway::new(Some(store.clone()), client, options).await);

            let tls = config.tls.clone();
            let token = shutdown.token();
            let on_error = shutdown.clone();
            let serving = local.clone();
            servers.push(tokio::spawn(async move {
                if let Err(e) =
                    server::serve_gateway(listen_addr, serving, tls.as_ref(), token).await
                {
                    tracing::error!(error = %format!("{e:#}"), "local gateway stopped");
                    on_error.trigger_shutdown(ShutdownReason::Requested);
                }
            }));
            local
        }
        GatewayDriver::Kong => {
            let kong = KongClient::new(&config.gateway.kong)?;
            kong.initialize()
                .await
                .wrap_err("Failed to initialize Kong")?;
            tracing::info!(host = %config.gateway.kong.host, "using Kong gateway driver");
            Arc::new(kong)
        }
    };

    let controller = Controller::new(
        ControllerOptions {
            resync_period: config.controller.resync_period()?,
            workers: config.controller.workers,
        },
        store.clone(),
        gateway,
    )
    .with_cancellation(shutdown.token());
    controller.start().await.wrap_err("Failed to start controller")?;

    let service = Arc::new(ApiService::new(store).with_watcher(controller.watcher()));
    service
        .apply(&config.organization, config.apis.clone())
        .await;

    {
        let token = shutdown.token();
        let on_error = shutdown.clone();
        let router = admin::router(AdminState::new(service.clone(), config.organization.clone()));
        servers.push(tokio::spawn(async move {
            if let Err(e) = server::serve_admin(admin_addr, router, token).await {
                tracing::error!(error = %format!("{e:#}"), "management API stopped");
                on_error.trigger_shutdown(ShutdownReason::Requested);
            }
        }));
    }

    match config_provider.watch() {
        Some(notify_rx) => {
            tokio::spawn(watch_config(
                notify_rx,
                config_provider.clone(),
                service.clone(),
                shutdown.clone(),
            ));
        }
        None => tracing::warn!("config change notifications unavailable"),
    }

    tracing::info!(
        driver = ?config.gateway.driver,
        organization = %config.organization,
        apis = config.apis.len(),
        "apiman started"
    );

    let reason = shutdown.wait_for_shutdown_signal().await;
    tracing::info!(?reason, "shutting down");

    controller.shutdown().await;
    let drain = async {
        for server in servers {
            if let Err(e) = server.await {
                tracing::warn!(error = %e, "server task ended abnormally");
            }
        }
    };
    if tokio::time::timeout(shutdown.drain_timeout(), drain)
        .await
        .is_err()
    {
        tracing::warn!("servers did not drain in time");
    }

    tracing::info!("graceful shutdown completed");
    Ok(())
}

/// Re-apply the declared APIs whenever the config file changes.
async fn watch_config(
    mut notify_rx: tokio::sync::mpsc::Receiver<()>,
    provider: Arc<FileConfigProvider>,
    service: Arc<ApiService>,
    shutdown: GracefulShutdown,
) {
    let debounce = Duration::from_secs(2);
    let token = shutdown.token();
    tracing::info!(path = %provider.path().display(), "config watcher started");

    loop {
        tokio::select! {
            _ = token.cancelled() => break,
            next = notify_rx.recv() => {
                if next.is_none() {
                    break;
                }
                // Editors often write a file in several steps
                tokio::time::sleep(debounce).await;
                while notify_rx.try_recv().is_ok() {}

                let config = match provider.load_config().await {
                    Ok(config) => config,
                    Err(e) => {
                        tracing::error!(error = %format!("{e:#}"), "failed to reload configuration, keeping current apis");
                        continue;
                    }
                };
                if let Err(e) = ManagerConfigValidator::validate(&config) {
                    tracing::error!(error = %e, "reloaded configuration is invalid, keeping current apis");
                    continue;
                }
                let summary = service.apply(&config.organization, config.apis).await;
                tracing::info!(?summary, "configuration reloaded");
            }
        }
    }
    tracing::info!("config watcher stopped");
}

/// Validate configuration file and exit
async fn validate_config_command(config_path: &str) -> Result<()> {
    println!("Validating configuration file: {config_path}");

    if !Path::new(config_path).exists() {
        eprintln!("Error: configuration file '{config_path}' not found");
        std::process::exit(1);
    }

    let config = match load_config(config_path).await {
        Ok(config) => {
            println!("Configuration parsing: OK");
            config
        }
        Err(e) => {
            eprintln!("Configuration parsing failed:");
            eprintln!("   {e:#}");
            std::process::exit(1);
        }
    };

    match ManagerConfigValidator::validate(&config) {
        Ok(()) => {
            println!("Configuration validation: OK");
            println!();
            println!("Configuration summary:");
            println!("   - Gateway listen address: {}", config.listen_addr);
            println!("   - Management address: {}", config.admin_addr);
            println!("   - Organization: {}", config.organization);
            println!("   - Gateway driver: {:?}", config.gateway.driver);
            println!("   - Declared APIs: {}", config.apis.len());
            println!("   - TLS enabled: {}", config.tls.is_some());
            Ok(())
        }
        Err(e) => {
            eprintln!("Configuration validation failed:");
            eprintln!("{e}");
            std::process::exit(1);
        }
    }
}

/// Initialize a new configuration file
async fn init_config_command(config_path: &str) -> Result<()> {
    let path = Path::new(config_path);
    if path.exists() {
        eprintln!("Error: configuration file '{config_path}' already exists");
        std::process::exit(1);
    }

    let default_config = r#"# apiman configuration

# Local gateway traffic
listen_addr = "0.0.0.0:8081"
# Management API
admin_addr = "127.0.0.1:8082"
# Organization declared APIs belong to
organization = "dispatch"

[gateway]
driver = "local"
# "continue" writes the 400 and still runs the function, "reject" stops
protocol_mismatch = "continue"

[function_manager]
url = "http://localhost:8080"
timeout_secs = 60

[controller]
resync_period = "60s"
workers = 1

[logging]
level = "info"
json = false

[[apis]]
name = "hello"
function = "hello-py"
enabled = true
uris = ["/hello"]
methods = ["GET", "POST"]
"#;

    tokio::fs::write(path, default_config)
        .await
        .context("Failed to write config file")?;
    println!("Created default configuration at: {config_path}");
    println!("   Run 'apiman serve --config {config_path}' to start");
    Ok(())
}
