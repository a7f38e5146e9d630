//! PicoTun, an obfuscating reverse-tunnel data plane.

use std::path::PathBuf;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use picotun::config::Mode;
use picotun::{stats, Config, TunnelClient, TunnelServer};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const BUILD_DATE: &str = env!("BUILD_DATE");
const GIT_HASH: &str = env!("GIT_HASH");

#[derive(Parser)]
#[command(name = "picotun")]
#[command(version = VERSION)]
#[command(about = "Obfuscating reverse-tunnel data plane", long_about = None)]
struct Cli {
    /// Configuration file path
    #[arg(short, long, value_name = "FILE")]
    config: Option<PathBuf>,

    /// Verbose logging (-v info, -vv debug, -vvv trace)
    #[arg(short, long, action = clap::ArgAction::Count)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run as the tunnel client (behind the restrictive network)
    Client {
        /// Server address, host:port (overrides the config file)
        #[arg(short, long)]
        server: Option<String>,

        /// Pre-shared key (overrides the config file)
        #[arg(long, env = "PICOTUN_PSK")]
        psk: Option<String>,
    },

    /// Run as the tunnel server (the exposed endpoint)
    Server {
        /// Listen address (overrides the config file)
        #[arg(short, long)]
        listen: Option<String>,

        /// Pre-shared key (overrides the config file)
        #[arg(long, env = "PICOTUN_PSK")]
        psk: Option<String>,
    },

    /// Print sample client and server configuration files
    Genconf,

    /// Print version and build information
    Version,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let level = match cli.verbose {
        0 => log::LevelFilter::Warn,
        1 => log::LevelFilter::Info,
        2 => log::LevelFilter::Debug,
        _ => log::LevelFilter::Trace,
    };
    env_logger::Builder::from_default_env()
        .filter_level(level)
        .format_timestamp_millis()
        .init();

    match &cli.command {
        Commands::Version => {
            println!("picotun {} ({}, built {})", VERSION, GIT_HASH, BUILD_DATE);
            return Ok(());
        }
        Commands::Genconf => {
            print!("{}", SAMPLE_SERVER_CONF);
            println!();
            print!("{}", SAMPLE_CLIENT_CONF);
            return Ok(());
        }
        _ => {}
    }

    let mut config = match &cli.config {
        Some(path) => Config::from_file(path)
            .with_context(|| format!("loading {}", path.display()))?,
        None => Config::default(),
    };
    if cli.verbose > 0 {
        config.verbose = true;
    }

    let cancel = CancellationToken::new();
    {
        let cancel = cancel.clone();
        tokio::spawn(async move {
            if tokio::signal::ctrl_c().await.is_ok() {
                log::info!("[MAIN] interrupt received, shutting down");
                cancel.cancel();
            }
        });
    }

    stats::mark_started();
    if config.stats_interval > 0 {
        stats::start_stats_logger(
            Duration::from_secs(config.stats_interval),
            cancel.clone(),
        );
    }

    match cli.command {
        Commands::Client { server, psk } => {
            config.mode = Mode::Client;
            if let Some(server) = server {
                config.server_url = server;
                config.paths.clear();
            }
            if let Some(psk) = psk {
                config.psk = psk;
            }
            config.normalize();
            config.validate()?;

            let client = TunnelClient::new(config)?;
            client.run(cancel).await?;
        }
        Commands::Server { listen, psk } => {
            config.mode = Mode::Server;
            if let Some(listen) = listen {
                config.listen = listen;
            }
            if let Some(psk) = psk {
                config.psk = psk;
            }
            config.normalize();
            config.validate()?;

            let server = TunnelServer::new(config);
            server.serve(cancel).await?;
        }
        Commands::Genconf | Commands::Version => unreachable!(),
    }

    Ok(())
}

const SAMPLE_SERVER_CONF: &str = r#"# picotun server configuration
mode = "server"
listen = "0.0.0.0:2020"
psk = "change-me"
profile = "balanced"
compression = ""        # "" or "snappy" (must match the client)

[mimic]
fake_domain = "www.google.com"
fake_path = "/search"

[obfs]
enabled = true
min_padding = 4
max_padding = 32

[forward]
tcp = ["8080->127.0.0.1:80"]
udp = []
"#;

const SAMPLE_CLIENT_CONF: &str = r#"# picotun client configuration
mode = "client"
psk = "change-me"
profile = "balanced"
compression = ""        # must match the server

[[paths]]
transport = "httpmux"
addr = "server.example.com:2020"
connection_pool = 4
retry_interval = 3
dial_timeout = 10

[mimic]
fake_domain = "www.google.com"
fake_path = "/search"

[obfs]
enabled = true
min_padding = 4
max_padding = 32

[fragment]
enabled = true
min_size = 64
max_size = 191
"#;
