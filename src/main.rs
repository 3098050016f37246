use std::path::PathBuf;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use netsniffer::config::DEFAULT_CONFIG_FILE;
use netsniffer::{Config, Controller, NoopSystem, PcapEngine, TracingSink, list_devices};

#[derive(Parser)]
#[command(name = "netsniffer", about = "capture proxy and link-layer traffic as packet records")]
struct Cli {
    /// Config file; missing or invalid files fall back to defaults
    #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
    config: PathBuf,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// List capture devices
    Devices,
    /// Capture link-layer frames until interrupted
    Capture {
        /// Device to open instead of the configured one
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Run the recording proxy until interrupted
    Proxy {
        #[arg(short, long)]
        port: Option<u16>,
    },
    /// Run proxy and capture together
    Run {
        #[arg(short, long)]
        device: Option<String>,
    },
    /// Write the effective config back to the config file
    InitConfig,
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let cli = Cli::parse();
    let mut config = Config::load_or_default(&cli.config);

    let (proxy, capture, device) = match cli.command {
        Command::Devices => {
            for dev in list_devices()? {
                let addrs: Vec<String> = dev
                    .addresses
                    .iter()
                    .map(|a| match &a.netmask {
                        Some(mask) => format!("{}/{mask}", a.addr),
                        None => a.addr.clone(),
                    })
                    .collect();
                println!("{}\t{}\t{}", dev.name, addrs.join(","), dev.desc.unwrap_or_default());
            }
            return Ok(());
        }
        Command::InitConfig => {
            config.save(&cli.config)?;
            info!(path = %cli.config.display(), "config written");
            return Ok(());
        }
        Command::Capture { device } => (false, true, device),
        Command::Proxy { port } => {
            if let Some(port) = port {
                config.http.port = port;
            }
            (true, false, None)
        }
        Command::Run { device } => (true, true, device),
    };

    let ctl = Controller::new(
        config,
        Arc::new(PcapEngine),
        Arc::new(TracingSink),
        Arc::new(NoopSystem),
    )?;

    let mut failed = false;
    if proxy {
        match ctl.start_proxy().await {
            Ok(addr) => info!(%addr, "set your HTTP proxy to this address"),
            Err(e) => {
                error!("{e}");
                failed = true;
            }
        }
    }
    if capture && !failed {
        if let Err(e) = ctl.start_capture(device.as_deref()) {
            error!("{e}");
            failed = true;
        }
    }

    if !failed {
        tokio::signal::ctrl_c().await?;
        info!("interrupted, shutting down");
    }
    let stats = ctl.shutdown().await;
    info!(
        forwarded = stats.forwarded,
        filtered = stats.filtered,
        logged = stats.logged,
        "done"
    );
    if failed {
        std::process::exit(1);
    }
    Ok(())
}
