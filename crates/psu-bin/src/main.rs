//! `psu` command-line entry point.
//!
//! ```bash
//! psu serve --config config/psu.toml      # address-routed ZeroMQ server
//! psu serve --simulate                    # same, against simulated instruments
//! psu client "46:::ReadPower"             # one request to a running server
//! psu control --gpib 6 --on --read        # direct control through the GPIB proxy
//! psu monitor --gpib 6 --interval 15      # periodic power logging
//! ```

// Global allocator (Microsoft Rust Guidelines: M-MIMALLOC-APPS)
#[cfg(not(test))]
#[global_allocator]
static GLOBAL: mimalloc::MiMalloc = mimalloc::MiMalloc;

mod control;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use psu_hardware::transport::Connector;
use psu_hardware::{
    AddressRouter, BoundDriver, Endpoint, ModelFactory, PsuConfig, SimulatedBench,
    SimulatedInstrument, TcpConnector,
};
use psu_server::{parse_power_reply, Dispatcher, PsuServer};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing_subscriber::prelude::*;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser)]
#[command(name = "psu")]
#[command(about = "Bench power supply control over GPIB-Ethernet and SCPI sockets", long_about = None)]
struct Cli {
    /// Configuration file (TOML). Defaults to config/psu.toml if present.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Additional plain-text log file
    #[arg(long, global = true)]
    log_file: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Resolve configured addresses and serve requests until Ctrl+C
    Serve {
        /// ZeroMQ endpoint, overrides server.bind
        #[arg(long)]
        bind: Option<String>,

        /// Also accept one request per line on this `host:port`
        #[arg(long)]
        lines: Option<String>,

        /// Serve simulated instruments instead of real hardware
        #[arg(long)]
        simulate: bool,
    },

    /// Send one request to a running server and print the reply
    Client {
        /// Request line, e.g. "46:::ReadPower"
        request: String,

        /// Server: a `tcp://` ZeroMQ endpoint, or `host:port` of a line listener
        #[arg(long, default_value = "tcp://127.0.0.1:5560")]
        server: String,
    },

    /// Control one instrument directly through a GPIB proxy
    Control {
        #[command(flatten)]
        target: Target,

        /// Zero output 2, program output 1 and turn the output on
        #[arg(long, alias = "On")]
        on: bool,

        /// Turn the output off
        #[arg(long, alias = "Off", conflicts_with = "on")]
        off: bool,

        /// Voltage for output 1 (1.2 V with --on if unset)
        #[arg(long, alias = "setVoltage")]
        set_voltage: Option<f64>,

        /// Print the identification string
        #[arg(long)]
        id: bool,

        /// Print one power reading
        #[arg(long)]
        read: bool,

        /// Return the instrument to local mode
        #[arg(long)]
        disconnect: bool,
    },

    /// Log a power reading periodically until Ctrl+C
    Monitor {
        #[command(flatten)]
        target: Target,

        /// Seconds between readings
        #[arg(long, default_value_t = 15.0)]
        interval: f64,
    },
}

#[derive(Args)]
struct Target {
    /// GPIB-Ethernet proxy, host or host:port
    #[arg(long, default_value = "192.168.1.50")]
    proxy: String,

    /// GPIB address of the supply
    #[arg(long, default_value_t = 8)]
    gpib: u8,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = PsuConfig::load(cli.config.as_deref())?;
    if cli.log_file.is_some() {
        config.log_file = cli.log_file.clone();
    }
    init_tracing(&config.log_level, config.log_file.as_deref())?;

    match cli.command {
        Commands::Serve {
            bind,
            lines,
            simulate,
        } => serve(config, bind, lines, simulate).await,
        Commands::Client { request, server } => {
            let reply = if server.starts_with("tcp://") {
                psu_server::request_zmq(&server, &request).await?
            } else {
                psu_server::request_once(&server, &request).await?
            };
            match parse_power_reply(&reply) {
                Some(reading) if request.ends_with(":::ReadPower") => println!("{}", reading),
                _ => println!("{}", reply),
            }
            Ok(())
        }
        Commands::Control {
            target,
            on,
            off,
            set_voltage,
            id,
            read,
            disconnect,
        } => {
            let driver = resolve_target(&config, &target).await?;
            let actions = control::ControlActions {
                on,
                off,
                set_voltage,
                id,
                read,
                disconnect,
            };
            for line in control::run(&driver, &actions).await? {
                println!("{}", line);
            }
            Ok(())
        }
        Commands::Monitor { target, interval } => {
            let interval = Duration::try_from_secs_f64(interval)
                .ok()
                .filter(|d| !d.is_zero())
                .context("--interval must be a positive number of seconds")?;
            let driver = resolve_target(&config, &target).await?;
            control::monitor(&driver, interval, shutdown_signal()).await
        }
    }
}

fn init_tracing(level: &str, log_file: Option<&Path>) -> Result<()> {
    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let console = fmt::layer().with_filter(filter());
    let file = match log_file {
        Some(path) => {
            let file = std::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(path)
                .with_context(|| format!("Failed to open log file {}", path.display()))?;
            Some(
                fmt::layer()
                    .with_ansi(false)
                    .with_writer(Arc::new(file))
                    .with_filter(filter()),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console)
        .with(file)
        .try_init()
        .context("Failed to initialize tracing")
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "Failed to listen for Ctrl+C");
        std::future::pending::<()>().await;
    }
}

async fn serve(
    mut config: PsuConfig,
    bind: Option<String>,
    lines: Option<String>,
    simulate: bool,
) -> Result<()> {
    if let Some(bind) = bind {
        config.server.bind = bind;
    }
    if lines.is_some() {
        config.server.line_bind = lines;
    }

    let connector: Arc<dyn Connector> = if simulate {
        tracing::info!("Serving simulated instruments");
        Arc::new(simulated_lab(&config)?)
    } else {
        Arc::new(TcpConnector::new(
            config.routing.connect_timeout(),
            config.routing.query_timeout(),
        ))
    };

    let router = AddressRouter::from_config(&config, connector)
        .await
        .context("Required address did not resolve")?;
    let mut server = PsuServer::new(Dispatcher::new(router))
        .listen_zmq(&config.server.bind)
        .await?;
    if let Some(line_bind) = &config.server.line_bind {
        server = server.listen_lines(line_bind).await?;
    }
    server.run_until(shutdown_signal()).await
}

/// One simulated dual-output supply per configured address, on the first
/// GPIB proxy.
fn simulated_lab(config: &PsuConfig) -> Result<SimulatedBench> {
    let bench = SimulatedBench::new();
    let proxy = config
        .routing
        .gpib_proxies
        .first()
        .context("--simulate needs at least one GPIB proxy in routing.gpib_proxies")?;
    for address in &config.routing.addresses {
        let bus_address = config.routing.gpib_address(address)?;
        bench.add_gpib_instrument(proxy.clone(), bus_address, SimulatedInstrument::agilent_e3648a());
    }
    Ok(bench)
}

async fn resolve_target(config: &PsuConfig, target: &Target) -> Result<BoundDriver> {
    let proxy = if target.proxy.contains(':') {
        target.proxy.clone()
    } else {
        format!("{}:{}", target.proxy, psu_hardware::transport::prologix::PROLOGIX_PORT)
    };
    let connector = TcpConnector::new(
        config.routing.connect_timeout(),
        config.routing.query_timeout(),
    );
    let factory = ModelFactory::new(config.descriptor_table(), Arc::new(connector));
    let endpoint = Endpoint::gpib(proxy, target.gpib);
    factory
        .resolve(&endpoint)
        .await
        .with_context(|| format!("No supported supply at {}", endpoint))
}
