//! mcshard - A Sharding Proxy for Memcached
//!
//! This is the main entry point for the proxy. It parses the command line,
//! sets up logging, starts the proxy pipeline and waits for Ctrl+C.

use mcshard::{Proxy, ProxyConfig};
use tracing::info;
use tracing_subscriber::{EnvFilter, FmtSubscriber};

/// Parse configuration from command-line arguments
fn config_from_args() -> ProxyConfig {
    let mut config = ProxyConfig::default();
    let args: Vec<String> = std::env::args().collect();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "--listen" | "-l" => {
                if i + 1 < args.len() {
                    config.listen = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: --listen requires a value");
                    std::process::exit(1);
                }
            }
            "--backend" | "-b" => {
                if i + 1 < args.len() {
                    config.backends.push(args[i + 1].clone());
                    i += 2;
                } else {
                    eprintln!("Error: --backend requires a value");
                    std::process::exit(1);
                }
            }
            "--workers" | "-w" => {
                if i + 1 < args.len() {
                    config.workers = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid worker count");
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("Error: --workers requires a value");
                    std::process::exit(1);
                }
            }
            "--max-keys" => {
                if i + 1 < args.len() {
                    config.max_keys = args[i + 1].parse().unwrap_or_else(|_| {
                        eprintln!("Error: invalid key count");
                        std::process::exit(1);
                    });
                    i += 2;
                } else {
                    eprintln!("Error: --max-keys requires a value");
                    std::process::exit(1);
                }
            }
            "--sharded" | "-s" => {
                config.sharded_get = true;
                i += 1;
            }
            "--help" => {
                print_help();
                std::process::exit(0);
            }
            "--version" | "-v" => {
                println!("mcshard version {}", mcshard::VERSION);
                std::process::exit(0);
            }
            _ => {
                eprintln!("Unknown argument: {}", args[i]);
                print_help();
                std::process::exit(1);
            }
        }
    }

    config
}

fn print_help() {
    println!(
        r#"
mcshard - A Sharding Proxy for Memcached

USAGE:
    mcshard [OPTIONS] --backend <ADDR> [--backend <ADDR> ...]

OPTIONS:
    -l, --listen <ADDR>      Address to listen on (default: 127.0.0.1:11311)
    -b, --backend <ADDR>     A memcached backend, repeatable (host:port)
    -w, --workers <N>        Worker count (default: 8)
    -s, --sharded            Split multi-key gets across backends
        --max-keys <N>       Max keys per get request (default: 12)
    -v, --version            Print version information
        --help               Print this help message

EXAMPLES:
    mcshard -b 10.0.0.1:11211
    mcshard -b 10.0.0.1:11211 -b 10.0.0.2:11211 -b 10.0.0.3:11211 --sharded
    mcshard -l 0.0.0.0:11311 -b 10.0.0.1:11211 -w 16
"#
    );
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = config_from_args();

    // Set up logging, RUST_LOG overrides the default level
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    FmtSubscriber::builder()
        .with_env_filter(filter)
        .with_target(false)
        .init();

    info!(
        listen = %config.listen,
        backends = config.backend_count(),
        workers = config.workers,
        sharded = config.sharded_get,
        max_keys = config.max_keys,
        "starting mcshard v{}", mcshard::VERSION
    );

    let proxy = Proxy::start(config).await?;

    tokio::signal::ctrl_c().await?;
    info!("Shutdown signal received, stopping proxy...");

    let summary = proxy.shutdown().await;
    info!(
        jobs = summary.jobs,
        errors = summary.errors,
        "Proxy shutdown complete"
    );
    Ok(())
}
