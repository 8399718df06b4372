use std::net::Ipv4Addr;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use clap::{Args, Parser, Subcommand};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

use netlat::advertise::ListenOptions;
use netlat::config::{LoggingConfig, NetlatConfig};
use netlat::endpoint::{Endpoint, Family, Transport};
use netlat::harness::{measure, Measurement, TimingOptions};
use netlat::locator::ServiceLocator;
use netlat::protocol::connect::{self, ConnectClient, ConnectServer};
use netlat::protocol::xact::{self, XactClient, XactServer};
use netlat::registry::PortRegistry;
use netlat::socket::SockOpts;
use netlat::{NetError, ServiceId};

/// Exit status for failures that carry no network error class.
const EXIT_USAGE: i32 = 64;

const BACKGROUND_FLAG: &str = "--background";
const READY_LINE_FLAG: &str = "--ready-line";

#[derive(Parser)]
#[command(
    name = "netlat",
    about = "TCP connection-cost and transaction-latency microbenchmarks over IPv4 and vsock",
    version,
    long_about = None
)]
struct Cli {
    /// Configuration file (default: $NETLAT_CONFIG, then /etc/netlat/netlat.toml)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// JSON output for machine parsing
    #[arg(long, global = true)]
    json: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Connection-cost benchmark: connect and close, no payload
    Connect {
        #[command(subcommand)]
        action: ConnectAction,
    },

    /// Transaction-latency benchmark: fixed-size echo over one connection
    Tcp {
        #[command(subcommand)]
        action: TcpAction,
    },
}

#[derive(Subcommand)]
enum ConnectAction {
    /// Run the connection-cost server
    Serve(ServerArgs),
    /// Measure connection cost against a server
    Run(ClientArgs),
    /// Ask a running server to stop
    Shutdown(TargetArgs),
}

#[derive(Subcommand)]
enum TcpAction {
    /// Run the transaction server
    Serve(ServerArgs),
    /// Measure transaction latency against a server
    Run {
        #[command(flatten)]
        client: ClientArgs,

        /// Message size in bytes
        #[arg(short = 'm', long)]
        message_size: Option<usize>,
    },
    /// Ask a running server to stop
    Shutdown(TargetArgs),
}

#[derive(Args)]
struct ServerArgs {
    /// IPv4 address to bind
    #[arg(long)]
    bind: Option<Ipv4Addr>,

    /// Listen backlog
    #[arg(long)]
    backlog: Option<i32>,

    /// Listen on vsock instead of IPv4
    #[arg(long)]
    vsock: bool,

    /// Service id: negative for a fixed port, positive for a portmapper program
    #[arg(long, allow_hyphen_values = true)]
    service: Option<ServiceId>,

    /// Detach once the server is listening; stop it with `shutdown`
    #[arg(long)]
    background: bool,

    /// Print the bound endpoint on stdout once listening
    #[arg(long, hide = true)]
    ready_line: bool,
}

#[derive(Args)]
struct TargetArgs {
    /// Server host name or address
    host: String,

    /// Connect over vsock to this context id
    #[arg(long)]
    vsock_cid: Option<u32>,

    /// Service id: negative for a fixed port, positive for a portmapper program
    #[arg(long, allow_hyphen_values = true)]
    service: Option<ServiceId>,
}

#[derive(Args)]
struct ClientArgs {
    #[command(flatten)]
    target: TargetArgs,

    /// Timed repetitions
    #[arg(short = 'N', long)]
    repetitions: Option<u32>,

    /// Warmup before timing, in milliseconds
    #[arg(short = 'W', long)]
    warmup_ms: Option<u64>,
}

#[derive(Clone, Copy)]
enum Bench {
    Connect,
    Transaction,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();
    if let Err(e) = run(cli).await {
        let code = e
            .chain()
            .find_map(|cause| cause.downcast_ref::<NetError>())
            .map_or(EXIT_USAGE, NetError::exit_code);
        eprintln!("netlat: {e:#}");
        std::process::exit(code);
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config = NetlatConfig::resolve(cli.config.as_deref())?;
    init_tracing(&config.logging);
    let registry: Arc<dyn PortRegistry> = Arc::new(config.portmapper());

    match cli.command {
        Commands::Connect { action } => match action {
            ConnectAction::Serve(args) => serve(Bench::Connect, args, &config, registry).await,
            ConnectAction::Run(args) => {
                let timing = timing(&config, &args);
                let locator = locator(&config, &args.target, registry)?;
                let service = args.target.service.unwrap_or(config.services.connect);
                let host = args.target.host;
                let measurement = tokio::task::spawn_blocking(move || {
                    let mut client = ConnectClient::new(locator, host, service);
                    let label = client.label();
                    measure(&mut client, &label, &timing)
                })
                .await??;
                report(&measurement, cli.json)
            }
            ConnectAction::Shutdown(target) => {
                let mut locator = locator(&config, &target, registry)?;
                let service = target.service.unwrap_or(config.services.connect);
                tokio::task::spawn_blocking(move || {
                    connect::request_shutdown(&mut locator, &target.host, service)
                })
                .await??;
                Ok(())
            }
        },
        Commands::Tcp { action } => match action {
            TcpAction::Serve(args) => serve(Bench::Transaction, args, &config, registry).await,
            TcpAction::Run {
                client,
                message_size,
            } => {
                let timing = timing(&config, &client);
                let locator = locator(&config, &client.target, registry)?;
                let service = client.target.service.unwrap_or(config.services.transaction);
                let size = message_size.unwrap_or(config.bench.message_size);
                let host = client.target.host;
                let measurement = tokio::task::spawn_blocking(move || {
                    let mut client = XactClient::new(locator, host, service, size)?;
                    let label = client.label();
                    measure(&mut client, &label, &timing)
                })
                .await??;
                report(&measurement, cli.json)
            }
            TcpAction::Shutdown(target) => {
                let mut locator = locator(&config, &target, registry)?;
                let service = target.service.unwrap_or(config.services.transaction);
                tokio::task::spawn_blocking(move || {
                    xact::request_shutdown(&mut locator, &target.host, service)
                })
                .await??;
                Ok(())
            }
        },
    }
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    if logging.json {
        builder.json().init();
    } else {
        builder.init();
    }
}

async fn serve(
    bench: Bench,
    args: ServerArgs,
    config: &NetlatConfig,
    registry: Arc<dyn PortRegistry>,
) -> Result<()> {
    let backlog = args.backlog.unwrap_or(config.network.backlog);
    if backlog < 1 {
        bail!("backlog must be at least 1, got {backlog}");
    }
    let default_service = match bench {
        Bench::Connect => config.services.connect,
        Bench::Transaction => config.services.transaction,
    };
    let options = ListenOptions {
        family: if args.vsock {
            Family::Vsock
        } else {
            config.network.transport
        },
        address: args.bind.unwrap_or(config.network.bind_address),
        backlog,
        service: args.service.unwrap_or(default_service),
        opts: SockOpts::REUSE,
    };
    if args.background {
        return spawn_background().await;
    }

    let shutdown = CancellationToken::new();
    let interrupt = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping server");
            interrupt.cancel();
        }
    });

    let reason = match bench {
        Bench::Connect => {
            let server = ConnectServer::bind(&options, registry)?;
            announce(server.endpoint(), args.ready_line);
            server.run(shutdown).await?
        }
        Bench::Transaction => {
            let server = XactServer::bind(&options, registry)?;
            announce(server.endpoint(), args.ready_line);
            server.run(shutdown).await?
        }
    };
    info!(%reason, "server exited");
    Ok(())
}

fn announce(endpoint: Endpoint, ready_line: bool) {
    if ready_line {
        println!("{endpoint}");
    }
}

/// Re-run this command detached, without `--background`, and return once
/// the child reports the endpoint it is listening on. A child that exits
/// first passes its exit status through.
async fn spawn_background() -> Result<()> {
    let exe = std::env::current_exe().context("cannot locate the netlat executable")?;
    let args = std::env::args_os()
        .skip(1)
        .filter(|arg| arg != BACKGROUND_FLAG);
    let mut child = tokio::process::Command::new(exe)
        .args(args)
        .arg(READY_LINE_FLAG)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::null())
        // out of the terminal's process group, so Ctrl-C here does not reach it
        .process_group(0)
        .spawn()
        .context("failed to start background server")?;
    let pid = child.id();

    let stdout = child
        .stdout
        .take()
        .context("background server stdout not captured")?;
    let mut line = String::new();
    BufReader::new(stdout).read_line(&mut line).await?;
    let endpoint = line.trim();
    if endpoint.is_empty() {
        let status = child.wait().await?;
        debug!(?pid, %status, "background server exited before listening");
        eprintln!("netlat: background server exited before listening ({status})");
        std::process::exit(status.code().unwrap_or(EXIT_USAGE));
    }

    info!(?pid, %endpoint, "server running in background");
    println!("{endpoint}");
    Ok(())
}

fn locator(
    config: &NetlatConfig,
    target: &TargetArgs,
    registry: Arc<dyn PortRegistry>,
) -> Result<ServiceLocator> {
    let transport = match target.vsock_cid {
        Some(cid) => Transport::Vsock { cid },
        None => config.transport()?,
    };
    Ok(ServiceLocator::new(transport, registry))
}

fn timing(config: &NetlatConfig, args: &ClientArgs) -> TimingOptions {
    let defaults = config.timing();
    TimingOptions {
        repetitions: args.repetitions.unwrap_or(defaults.repetitions).max(1),
        warmup: args
            .warmup_ms
            .map(Duration::from_millis)
            .unwrap_or(defaults.warmup),
        min_duration: defaults.min_duration,
    }
}

fn report(measurement: &Measurement, json: bool) -> Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(measurement)?);
    } else {
        println!("{}", measurement.summary());
    }
    Ok(())
}
