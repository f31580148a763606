use std::{
    fs,
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{Context, bail};
use clap::{Args, Parser, Subcommand};
use portable::{
    ConfigManager, ControlChannelFactory, EnvConfigManager, PluginInsManager, PluginMeta, PortableSettings,
    logger::{LogConfig, init_tracing},
    runtime::launch::LaunchSpec,
};
use tracing::info;

#[derive(Parser, Debug)]
#[command(name = "portable", about = "Supervise out-of-process portable plugins", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Start the given plugins and keep them running until Ctrl-C
    Run(RunArgs),

    /// Check that a plugin descriptor parses and can be launched
    Validate {
        descriptor: PathBuf,
        #[arg(long)]
        env_file: Option<PathBuf>,
    },

    /// Print the JSON-Schema of plugin descriptors
    Schema {
        /// Print the schema of the runtime settings instead
        #[arg(long, default_value_t = false)]
        settings: bool,
    },
}

#[derive(Args, Debug)]
struct RunArgs {
    /// Plugin descriptor files (JSON)
    #[arg(required = true)]
    descriptors: Vec<PathBuf>,

    /// `.env` file with PORTABLE_* settings
    #[arg(long, default_value = ".env")]
    env_file: PathBuf,

    /// Log filter (e.g. error, warn, info, debug, trace)
    #[arg(long, default_value = "info")]
    log_level: String,

    /// Also write a daily rolling log into this directory
    #[arg(long)]
    log_dir: Option<PathBuf>,

    /// OpenTelemetry endpoint (e.g. http://localhost:4318)
    #[arg(long)]
    otel_endpoint: Option<String>,
}

fn read_descriptor(path: &Path) -> anyhow::Result<PluginMeta> {
    let raw = fs::read_to_string(path).with_context(|| format!("could not read {}", path.display()))?;
    serde_json::from_str(&raw).with_context(|| format!("{} is not a valid plugin descriptor", path.display()))
}

async fn load_settings(env_file: Option<PathBuf>) -> anyhow::Result<PortableSettings> {
    let config = ConfigManager(EnvConfigManager::new(env_file));
    Ok(PortableSettings::load(&config).await?)
}

#[cfg(unix)]
fn channel_factory(settings: &PortableSettings) -> anyhow::Result<Arc<dyn ControlChannelFactory>> {
    Ok(Arc::new(portable::IpcChannelFactory::new(settings)))
}

#[cfg(not(unix))]
fn channel_factory(_settings: &PortableSettings) -> anyhow::Result<Arc<dyn ControlChannelFactory>> {
    bail!("the control channel needs Unix domain sockets")
}

#[tokio::main(flavor = "multi_thread", worker_threads = 4)]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    match cli.command {
        Commands::Run(args) => run(args).await,
        Commands::Validate { descriptor, env_file } => {
            let meta = read_descriptor(&descriptor)?;
            let settings = load_settings(env_file).await?;
            let config = serde_json::to_string(&settings.portable_config())?;
            let spec = LaunchSpec::build(&meta, &settings.python_bin, &config)?;
            if !meta.executable.exists() {
                bail!("executable {} does not exist", meta.executable.display());
            }
            println!("✅ Plugin `{}` is valid, it will run: {:?} {:?}", meta.name, spec.program, spec.args);
            Ok(())
        }
        Commands::Schema { settings } => {
            let schema = if settings {
                schemars::schema_for!(PortableSettings)
            } else {
                schemars::schema_for!(PluginMeta)
            };
            println!("{}", serde_json::to_string_pretty(&schema)?);
            Ok(())
        }
    }
}

async fn run(args: RunArgs) -> anyhow::Result<()> {
    let _telemetry = init_tracing(&LogConfig::new(args.log_level, args.log_dir, args.otel_endpoint))?;

    let descriptors = args
        .descriptors
        .iter()
        .map(|path| read_descriptor(path))
        .collect::<anyhow::Result<Vec<_>>>()?;
    let settings = load_settings(Some(args.env_file)).await?;
    info!(socket_dir = %settings.socket_dir.display(), crash_policy = ?settings.crash_policy, "portable runtime starting up");

    let factory = channel_factory(&settings)?;
    let manager = PluginInsManager::new(settings, factory);
    for meta in descriptors {
        manager.create_ins(meta, true).await?;
    }

    tokio::signal::ctrl_c().await.context("could not listen for Ctrl-C")?;
    info!("received Ctrl-C, stopping plugins: {:?}", manager.names());
    manager.shutdown().await;
    Ok(())
}
