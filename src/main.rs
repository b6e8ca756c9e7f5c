use std::path::PathBuf;

use clap::{Args, Parser, Subcommand};
use tracing::Level;
use tracing_subscriber::EnvFilter;

use dialup::{
    server::ProxyServer,
    settings::{Destination, Settings, SettingsStore},
    Result,
};

#[derive(Parser)]
#[clap(author, version, about, arg_required_else_help = true)]
struct Opt {
    #[command(subcommand)]
    commands: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the proxy in the foreground
    Run(BootArgs),

    /// Write a settings file with the factory defaults
    Init {
        /// Where to write the settings file
        #[arg(default_value = "dialup.toml")]
        path: PathBuf,
    },
}

#[derive(Args)]
struct BootArgs {
    /// Log level (trace / debug / info / warn / error). Default: info.
    /// Can be overridden by environment variable DIALUP_LOG.
    #[arg(
        long,
        short = 'L',
        env = "DIALUP_LOG",
        default_value = "info",
        verbatim_doc_comment
    )]
    log: Level,

    /// Settings file to load. A missing file means factory defaults.
    #[arg(long, short = 'c')]
    config: Option<PathBuf>,

    /// Local port to listen on (overrides the settings file).
    #[arg(long, short = 'p')]
    port: Option<u16>,

    /// Destination to forward to, as host, host:port, or an http:// URL
    /// (overrides the settings file).
    #[arg(long, short = 'd', verbatim_doc_comment)]
    destination: Option<Destination>,

    /// Throughput ceiling in bytes per second, 0 for unlimited
    /// (overrides the settings file).
    #[arg(long, short = 'b', verbatim_doc_comment)]
    bytes_per_second: Option<u64>,
}

fn main() -> Result<()> {
    match Opt::parse().commands {
        Commands::Run(args) => run(args),
        Commands::Init { path } => init(path),
    }
}

fn run(args: BootArgs) -> Result<()> {
    let filter = EnvFilter::from_default_env().add_directive(args.log.into());
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut settings = match &args.config {
        Some(path) => SettingsStore::new(path).load()?,
        None => Settings::default(),
    };
    if let Some(port) = args.port {
        settings.listen_port = port;
    }
    if let Some(destination) = args.destination {
        settings.destination = Some(destination);
    }
    if let Some(ceiling) = args.bytes_per_second {
        settings.bytes_per_second = ceiling;
    }

    tracing::info!("version: {}", env!("CARGO_PKG_VERSION"));

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()?
        .block_on(async {
            let server = ProxyServer::new(settings);
            server.start()?;

            tokio::signal::ctrl_c().await?;
            tracing::info!("shutdown signal received, draining connections...");
            server.stop().await;
            Ok(())
        })
}

fn init(path: PathBuf) -> Result<()> {
    SettingsStore::new(&path).save(&Settings::default())?;
    println!("wrote factory settings to {}", path.display());
    Ok(())
}
