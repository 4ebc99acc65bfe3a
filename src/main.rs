use std::env;
use std::net::{IpAddr, SocketAddr};
use std::path::PathBuf;
use std::process::exit;

use certmonger_exporter::bus::dbus::SystemBus;
use certmonger_exporter::config::{Config, ConfigError};
use certmonger_exporter::notify::Notifier;
use certmonger_exporter::supervisor::{spawn_worker, Supervisor};
use certmonger_exporter::worker::{self, WorkerOptions};
use certmonger_exporter::{BusSnapshotCollector, Snapshot};
use clap::{Parser, Subcommand, ValueEnum};
use comfy_table::Table;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "certmonger-exporter", version, about)]
struct Cli {
    /// Path to a TOML configuration file
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Unprivileged user the network-facing worker switches to
    #[arg(long, env = "CERTMONGER_EXPORTER_USER", global = true)]
    user: Option<String>,

    /// Port for the metrics endpoint
    #[arg(long, env = "CERTMONGER_EXPORTER_PORT", global = true)]
    port: Option<u16>,

    /// Address for the metrics endpoint
    #[arg(long, env = "CERTMONGER_EXPORTER_LISTEN_ADDRESS", global = true)]
    listen_address: Option<String>,

    /// Log level (overridden by RUST_LOG)
    #[arg(long, env = "CERTMONGER_EXPORTER_LOG_LEVEL", global = true)]
    log_level: Option<String>,

    /// Seconds an HTTP scrape waits for a snapshot
    #[arg(long, env = "CERTMONGER_EXPORTER_SCRAPE_TIMEOUT", global = true)]
    scrape_timeout: Option<u64>,

    /// Seconds to wait for the worker to exit before killing it
    #[arg(long, env = "CERTMONGER_EXPORTER_SHUTDOWN_TIMEOUT", global = true)]
    shutdown_timeout: Option<u64>,

    /// Print an example configuration file and exit
    #[arg(long)]
    example_config: bool,

    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Internal: run the unprivileged worker on an inherited socket
    #[command(hide = true)]
    Worker {
        #[arg(long)]
        ipc_fd: i32,
    },
    /// Query certmonger once and print what the exporter would see
    Collect {
        #[arg(short, long, value_enum, default_value_t = OutputFormat::Table)]
        output: OutputFormat,
    },
}

#[derive(ValueEnum, Clone, Copy, Debug)]
enum OutputFormat {
    Table,
    Json,
}

fn main() {
    let cli = Cli::parse();

    if cli.example_config {
        print!("{}", Config::example_toml());
        exit(0);
    }

    let config = load_config(&cli);
    init_tracing(config.as_ref().map(Config::log_level).unwrap_or("info"));
    let config = match config.and_then(|c| c.validate().map(|_| c)) {
        Ok(config) => config,
        Err(e) => {
            error!(error = %e, "Invalid configuration");
            exit(1);
        }
    };

    let code = match cli.command {
        None => run_exporter(&config),
        Some(Command::Worker { ipc_fd }) => run_worker(&config, ipc_fd),
        Some(Command::Collect { output }) => collect_once(output),
    };
    exit(code);
}

fn load_config(cli: &Cli) -> Result<Config, ConfigError> {
    let file_config = match &cli.config {
        Some(path) => Config::from_file(path)?,
        None => Config::default(),
    };
    let cli_config = Config::from_cli_args(
        cli.user.clone(),
        cli.port,
        cli.listen_address.clone(),
        cli.log_level.clone(),
        cli.scrape_timeout,
        cli.shutdown_timeout,
    );
    Ok(Config::defaults()
        .merge_with(file_config)
        .merge_with(cli_config))
}

fn init_tracing(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_writer(std::io::stderr);

    // The journal timestamps lines itself.
    if env::var_os("INVOCATION_ID").is_some() {
        builder.without_time().with_ansi(false).init();
    } else {
        builder.init();
    }
}

fn run_exporter(config: &Config) -> i32 {
    info!(version = env!("CARGO_PKG_VERSION"), "certmonger-exporter starting");

    let worker = match spawn_worker(config) {
        Ok(worker) => worker,
        Err(e) => {
            error!(error = %e, "Failed to start worker");
            return 1;
        }
    };

    let collector = BusSnapshotCollector::new(SystemBus::new());
    Supervisor::new(
        collector,
        Notifier::from_env(),
        config.scrape_timeout(),
        config.shutdown_timeout(),
    )
    .run(worker)
}

fn run_worker(config: &Config, ipc_fd: i32) -> i32 {
    let address: IpAddr = match config.listen_address().parse() {
        Ok(address) => address,
        Err(e) => {
            error!(error = %e, "Invalid listen address");
            return 1;
        }
    };
    worker::run(WorkerOptions {
        ipc_fd,
        user: config.user().to_string(),
        listen: SocketAddr::new(address, config.port()),
        scrape_timeout: config.scrape_timeout(),
    })
}

fn collect_once(output: OutputFormat) -> i32 {
    let snapshot = BusSnapshotCollector::new(SystemBus::new()).collect();

    match output {
        OutputFormat::Json => match serde_json::to_string_pretty(&snapshot) {
            Ok(json) => println!("{}", json),
            Err(e) => {
                error!(error = %e, "Failed to encode snapshot");
                return 1;
            }
        },
        OutputFormat::Table => print_table(&snapshot),
    }

    if snapshot.bus_reachable {
        0
    } else {
        1
    }
}

fn print_table(snapshot: &Snapshot) {
    let enabled = match snapshot.service_enabled {
        Some(true) => "enabled",
        Some(false) => "disabled",
        None => "unknown",
    };
    println!("certmonger.service: {}", enabled);
    println!("Bus reachable: {}", snapshot.bus_reachable);

    let mut table = Table::new();
    table.set_header(vec![
        "Nickname",
        "CA",
        "Storage",
        "Location",
        "Status",
        "Not valid after",
        "CA error",
        "Stuck",
    ]);
    for record in &snapshot.requests {
        let location = match record.storage.nickname() {
            "" => record.storage.location().to_string(),
            nickname => format!("{}:{}", record.storage.location(), nickname),
        };
        table.add_row(vec![
            record.nickname.clone(),
            record.ca.clone(),
            record.storage.storage_type().to_string(),
            location,
            record.status.clone(),
            record.not_valid_after.to_string(),
            record.ca_error.to_string(),
            record.stuck.to_string(),
        ]);
    }
    println!("{}", table);
}
