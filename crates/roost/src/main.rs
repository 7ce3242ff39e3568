use std::io::{self, IsTerminal, Write};
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result, bail};
use clap::{Args, Parser, Subcommand};
use log::{LevelFilter, debug, info, warn};
use tokio_util::sync::CancellationToken;

use roost::config::{ConfigStore, DEFAULT_CONFIG_PATH};
use roost::environment::EnvironmentSettings;
use roost::events::Event;
use roost::install::InstallScript;
use roost::runtime::{DockerClient, RuntimeApi};
use roost::{Node, Platform};

const APP_NAME: &str = "roost";

fn main() {
    if let Err(err) = try_main() {
        let _ = writeln!(io::stderr(), "{err:?}");
        std::process::exit(1);
    }
}

fn try_main() -> Result<()> {
    let cli = Cli::parse();

    let store = ConfigStore::load(&cli.common.config)
        .with_context(|| format!("loading {}", cli.common.config.display()))?;
    if cli.common.debug {
        store.enable_debug_from_flag();
    }
    init_logging(&cli.common, store.snapshot().debug);
    debug!("configuration loaded from {}", store.path().display());

    match cli.command {
        Command::Config { command } => handle_config(&store, command),
        command => async_main(Arc::new(store), command),
    }
}

#[tokio::main]
async fn async_main(store: Arc<ConfigStore>, command: Command) -> Result<()> {
    let node = connect(store).await?;
    match command {
        Command::Boot => handle_boot(&node).await,
        Command::Stats { id, count } => handle_stats(&node, &id, count).await,
        Command::DiskUsage { id } => handle_disk_usage(&node, &id).await,
        Command::Chown { id } => handle_chown(&node, &id).await,
        Command::Install(cmd) => handle_install(&node, cmd).await,
        Command::Config { .. } => unreachable!("handled before the runtime starts"),
    }
}

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Roost - node agent for containerized game servers.",
    propagate_version = true
)]
struct Cli {
    #[command(flatten)]
    common: CommonOpts,
    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Clone, Args)]
struct CommonOpts {
    /// Configuration file
    #[arg(long, value_name = "PATH", global = true, env = "ROOST_CONFIG", default_value = DEFAULT_CONFIG_PATH)]
    config: PathBuf,
    /// Enable debug logging for this run
    #[arg(long, global = true)]
    debug: bool,
    /// Log as JSON
    #[arg(long, global = true)]
    json: bool,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// Prepare the host and supervise registered workloads until interrupted
    Boot,
    /// Stream usage samples of a running workload as JSON lines
    Stats {
        id: String,
        /// Stop after this many samples
        #[arg(long)]
        count: Option<usize>,
    },
    /// Print the disk usage of a workload's data directory in bytes
    DiskUsage { id: String },
    /// Give the node user ownership of a workload's files
    Chown { id: String },
    /// Run an install script for a workload
    Install(InstallCommand),
    /// Inspect the configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommand,
    },
}

#[derive(Debug, Args)]
struct InstallCommand {
    id: String,
    /// Image the script runs in
    #[arg(long)]
    image: String,
    /// Script file on this host
    #[arg(long, value_name = "PATH")]
    script: PathBuf,
    /// Interpreter for the script
    #[arg(long, default_value = "bash")]
    entrypoint: String,
}

#[derive(Debug, Subcommand)]
enum ConfigCommand {
    /// Print the effective configuration as TOML
    Show,
    /// Print the configuration file path
    Path,
}

fn init_logging(common: &CommonOpts, config_debug: bool) {
    use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

    let level = if common.debug || config_debug {
        LevelFilter::Debug
    } else {
        LevelFilter::Info
    };
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(format!("{APP_NAME}={}", level.as_str().to_lowercase())));

    if common.json {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .try_init()
            .ok();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().with_ansi(io::stderr().is_terminal()))
            .try_init()
            .ok();
    }

    // Also init env_logger for compatibility with log crate users
    let mut builder =
        env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info"));
    builder.filter_level(level);
    builder.try_init().ok();
}

// TODO: add a named-pipe transport so Windows hosts can reach the engine.
async fn connect(store: Arc<ConfigStore>) -> Result<Node> {
    let config = store.snapshot();
    let client = DockerClient::connect(&config.docker.socket)
        .await
        .with_context(|| format!("connecting to {}", config.docker.socket.display()))?;
    info!(
        "connected to container engine at {} (api {})",
        client.socket().display(),
        client.api_version()
    );

    let platform = Platform::from_config(&config);
    let runtime: Arc<dyn RuntimeApi> = Arc::new(client);
    Ok(Node::new(store, runtime, platform))
}

async fn handle_boot(node: &Node) -> Result<()> {
    let ctx = CancellationToken::new();
    let store = node.config();

    store
        .configure_directories()
        .await
        .context("configuring directories")?;
    let timezone = store.configure_timezone().await;
    info!("configured timezone {}", timezone);

    node.ensure_network(&ctx)
        .await
        .context("configuring container network")?;
    store
        .write_to_disk()
        .await
        .context("saving configuration")?;

    let loaded = node
        .load_definitions()
        .await
        .context("loading workload definitions")?;
    info!("loaded {} workload definition(s)", loaded);

    if store.snapshot().system.check_permissions_on_boot {
        fix_ownership(node).await;
    }

    let running = node.restore(&ctx).await.context("restoring workloads")?;
    info!("{} workload(s) running", running);
    node.persist_states().await.context("saving states")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    info!("shutting down");
    ctx.cancel();
    node.persist_states().await.context("saving states")?;
    Ok(())
}

#[cfg(unix)]
async fn fix_ownership(node: &Node) {
    for id in node.ids() {
        if let Err(e) = node.chown(&id).await {
            warn!("failed to fix ownership for {}: {}", id, e);
        }
    }
}

#[cfg(not(unix))]
async fn fix_ownership(_node: &Node) {}

async fn handle_stats(node: &Node, id: &str, count: Option<usize>) -> Result<()> {
    let ctx = CancellationToken::new();
    let env = match node.get(id) {
        Some(env) => env,
        None => node.register(id, EnvironmentSettings::default()).await?,
    };

    let mut events = env.events().subscribe();
    if !env.attach(&ctx).await? {
        bail!("workload {} is not running", id);
    }

    let mut seen = 0;
    let mut stdout = io::stdout();
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => break,
            event = events.recv() => match event {
                Ok(event @ Event::Resource(_)) => {
                    writeln!(stdout, "{}", event.envelope())?;
                    seen += 1;
                    if count.is_some_and(|c| seen >= c) {
                        break;
                    }
                }
                Ok(Event::State(state)) if state.is_offline() => {
                    info!("workload {} went offline", id);
                    break;
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    debug!("skipped {} events", n);
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            },
        }
    }
    Ok(())
}

async fn handle_disk_usage(node: &Node, id: &str) -> Result<()> {
    let bytes = node
        .disk_usage(id)
        .await
        .with_context(|| format!("measuring {}", id))?;
    println!("{}", bytes);
    Ok(())
}

#[cfg(unix)]
async fn handle_chown(node: &Node, id: &str) -> Result<()> {
    node.chown(id)
        .await
        .with_context(|| format!("fixing ownership for {}", id))
}

#[cfg(not(unix))]
async fn handle_chown(_node: &Node, _id: &str) -> Result<()> {
    bail!("ownership changes are only supported on unix hosts")
}

async fn handle_install(node: &Node, cmd: InstallCommand) -> Result<()> {
    let script = tokio::fs::read_to_string(&cmd.script)
        .await
        .with_context(|| format!("reading {}", cmd.script.display()))?;

    node.load_definitions()
        .await
        .context("loading workload definitions")?;
    if node.get(&cmd.id).is_none() {
        node.register(&cmd.id, EnvironmentSettings::default())
            .await?;
    }

    let installer = node.installer(
        &cmd.id,
        InstallScript {
            container_image: cmd.image,
            entrypoint: cmd.entrypoint,
            script,
        },
    )?;

    let env = node.environment(&cmd.id)?;
    let mut events = env.events().subscribe();
    let printer = tokio::spawn(async move {
        while let Ok(event) = events.recv().await {
            match event {
                Event::InstallOutput(line) => println!("{}", line),
                Event::InstallCompleted { .. } => break,
                _ => {}
            }
        }
    });

    let ctx = CancellationToken::new();
    let cancel = ctx.clone();
    let interrupt = tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            cancel.cancel();
        }
    });

    let result = installer.run(&ctx).await;
    interrupt.abort();
    let _ = printer.await;
    result.with_context(|| format!("installing {}", cmd.id))
}

fn handle_config(store: &ConfigStore, command: ConfigCommand) -> Result<()> {
    match command {
        ConfigCommand::Show => {
            let body =
                toml::to_string_pretty(&store.snapshot()).context("serializing configuration")?;
            print!("{}", body);
        }
        ConfigCommand::Path => println!("{}", store.path().display()),
    }
    Ok(())
}
