use clap::{Args, Parser, Subcommand};
use opsdeck::{
    config::{ConfigManager, EnvConfigManager},
    logger::FileTelemetry,
    registry::{PluginRegistry, SupervisorSettings},
    schema::write_schema,
    secret::{CredentialsManager, EnvCredentialsManager},
    watcher::{scan_plugins_dir, watch_plugins_dir},
};
use std::{env, fs, path::PathBuf, process, time::Duration};
use tracing::{error, info};

#[derive(Parser, Debug)]
#[command(
    name = "opsdeck",
    about = "Plugin worker supervisor for the opsdeck platform",
    version = "0.2.0"
)]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the supervisor
    Run(RunArgs),

    /// Emit JSON-Schema for the wire types
    Schema(SchemaArgs),

    /// Initialize a fresh layout
    Init,
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Optional log level override (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// First port handed to workers
    #[arg(long, default_value_t = 42000)]
    port_start: u16,

    /// Last port handed to workers
    #[arg(long, default_value_t = 42999)]
    port_end: u16,

    /// Seconds a worker gets between SIGTERM and SIGKILL
    #[arg(long, default_value_t = 5)]
    grace_secs: u64,
}

#[derive(Args, Debug)]
struct SchemaArgs {
    /// Directory the schema files are written to
    #[arg(long, default_value = "schemas")]
    out_dir: PathBuf,
}

fn resolve_root_dir() -> PathBuf {
    env::var("OPSDECK_ROOT").map(PathBuf::from).unwrap_or_else(|_| PathBuf::from("."))
}

fn cmd_init(root: &PathBuf) -> anyhow::Result<()> {
    for dir in ["plugins", "logs", "events", "schemas"] {
        fs::create_dir_all(root.join(dir))?;
    }
    let env_file = root.join(".env");
    if !env_file.exists() {
        fs::write(&env_file, "# opsdeck configuration\n")?;
    }
    println!("initialized opsdeck layout under {}", root.display());
    Ok(())
}

async fn cmd_run(root: PathBuf, args: RunArgs) -> anyhow::Result<()> {
    let _telemetry =
        FileTelemetry::init_files(&args.log_level, &root.join("logs"), &root.join("events"));

    let settings = SupervisorSettings {
        port_range: args.port_start..=args.port_end,
        grace: Duration::from_secs(args.grace_secs),
        log_dir: Some(root.join("logs")),
        log_level: Some(args.log_level.clone()),
        platform_api_url: env::var("OPSDECK_PLATFORM_API_URL").ok(),
        ..SupervisorSettings::default()
    };
    let config = ConfigManager(EnvConfigManager::new(root.join(".env")));
    let credentials = CredentialsManager(EnvCredentialsManager::new());
    let registry = PluginRegistry::new(settings, config, credentials);

    let plugins_dir = root.join("plugins");
    fs::create_dir_all(&plugins_dir)?;
    let found = scan_plugins_dir(&plugins_dir, &registry)?;
    info!(found, dir = %plugins_dir.display(), "plugin discovery complete");
    let _watcher =
        watch_plugins_dir(&plugins_dir, registry.clone(), Duration::from_secs(2))?;

    info!("supervisor running, press ctrl-c to stop");
    tokio::signal::ctrl_c().await?;
    info!("shutting down workers");
    registry.shutdown_all().await;
    Ok(())
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    let root = resolve_root_dir();

    let result = match cli.command {
        Some(Commands::Run(args)) => cmd_run(root, args).await,
        Some(Commands::Schema(args)) => write_schema(args.out_dir),
        Some(Commands::Init) | None => cmd_init(&root),
    };

    if let Err(e) = result {
        error!("{e:#}");
        process::exit(1);
    }
}
