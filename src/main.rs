//! SparkKV server binary.
//!
//! Loads configuration (file, then command-line overrides), sets up logging,
//! and runs the server until Ctrl+C.

use anyhow::Context;
use sparkkv::config::Config;
use sparkkv::server::Server;
use std::path::PathBuf;
use tokio::signal;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

/// Command-line overrides. Unset fields keep the file or default value.
#[derive(Debug, Default)]
struct CliArgs {
    config: Option<PathBuf>,
    host: Option<String>,
    port: Option<u16>,
    workers: Option<usize>,
    requirepass: Option<String>,
}

impl CliArgs {
    /// Parse configuration overrides from command-line arguments
    fn from_args() -> Self {
        let mut cli = CliArgs::default();
        let args: Vec<String> = std::env::args().collect();

        let mut i = 1;
        while i < args.len() {
            match args[i].as_str() {
                "--config" | "-c" => {
                    cli.config = Some(PathBuf::from(require_value(&args, i, "--config")));
                    i += 2;
                }
                "--host" | "-h" => {
                    cli.host = Some(require_value(&args, i, "--host").to_string());
                    i += 2;
                }
                "--port" | "-p" => {
                    cli.port = Some(parse_value(&args, i, "--port", "invalid port number"));
                    i += 2;
                }
                "--workers" | "-w" => {
                    cli.workers = Some(parse_value(&args, i, "--workers", "invalid worker count"));
                    i += 2;
                }
                "--requirepass" => {
                    cli.requirepass = Some(require_value(&args, i, "--requirepass").to_string());
                    i += 2;
                }
                "--help" => {
                    print_help();
                    std::process::exit(0);
                }
                "--version" | "-v" => {
                    println!("SparkKV version {}", sparkkv::VERSION);
                    std::process::exit(0);
                }
                _ => {
                    eprintln!("Unknown argument: {}", args[i]);
                    print_help();
                    std::process::exit(1);
                }
            }
        }

        cli
    }

    /// Loads the config file (if any) and applies the overrides.
    fn into_config(self) -> anyhow::Result<Config> {
        let mut config = match &self.config {
            Some(path) => Config::from_file(path)?,
            None => Config::default(),
        };
        if let Some(host) = self.host {
            config.host = host;
        }
        if let Some(port) = self.port {
            config.port = port;
        }
        if let Some(workers) = self.workers {
            config.workers = workers;
        }
        if self.requirepass.is_some() {
            config.requirepass = self.requirepass;
        }
        config.validate().context("invalid command-line options")?;
        Ok(config)
    }
}

fn require_value<'a>(args: &'a [String], i: usize, flag: &str) -> &'a str {
    match args.get(i + 1) {
        Some(value) => value,
        None => {
            eprintln!("Error: {} requires a value", flag);
            std::process::exit(1);
        }
    }
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str, msg: &str) -> T {
    require_value(args, i, flag).parse().unwrap_or_else(|_| {
        eprintln!("Error: {}", msg);
        std::process::exit(1);
    })
}

fn print_help() {
    println!(
        r#"
SparkKV - Redis-compatible connection and command-dispatch core

USAGE:
    sparkkv [OPTIONS]

OPTIONS:
    -c, --config <FILE>          TOML configuration file
    -h, --host <HOST>            Host to bind to (default: 127.0.0.1)
    -p, --port <PORT>            Port to listen on (default: 6379)
    -w, --workers <N>            Worker threads owning client sessions (default: 4)
        --requirepass <PASS>     Require AUTH with this password
    -v, --version                Print version information
        --help                   Print this help message

EXAMPLES:
    sparkkv                              # Start on 127.0.0.1:6379
    sparkkv --port 6380 --workers 8      # Eight workers on port 6380
    sparkkv --config sparkkv.toml        # Load settings from a file

CONNECTING:
    $ redis-cli -p 6379
    127.0.0.1:6379> PING
    PONG
"#
    );
}

fn print_banner(config: &Config) {
    println!(
        r#"
SparkKV v{}
──────────────────────────────────────────────────────────────
Listening on {} with {} worker thread(s)
Use Ctrl+C to shutdown gracefully.
"#,
        sparkkv::VERSION,
        config.bind_address(),
        config.workers,
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = CliArgs::from_args().into_config()?;

    // RUST_LOG wins over the configured level
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&config.log_level))
        .context("invalid log level")?;
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(false)
        .with_file(false)
        .with_line_number(false)
        .init();

    let server = Server::new(config);
    let listener = server.bind().await?;
    print_banner(&server.context().config);

    let shutdown = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    info!(auth = server.context().config.auth_required(), "Server started");
    server.run(listener, shutdown).await
}
