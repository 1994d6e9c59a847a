//! relaymq - a minimal exact-topic publish/subscribe broker.

use std::sync::Arc;

use log::error;

use relaymq::config::Config;
use relaymq::http;
use relaymq::server::Server;
use relaymq::shared::SharedState;

/// Default configuration file path.
const DEFAULT_CONFIG_PATH: &str = "relaymq.toml";

fn parse_args() -> String {
    let args: Vec<String> = std::env::args().collect();
    let mut config_path = DEFAULT_CONFIG_PATH.to_string();

    let mut i = 1;
    while i < args.len() {
        match args[i].as_str() {
            "-c" | "--config" => {
                if i + 1 < args.len() {
                    config_path = args[i + 1].clone();
                    i += 2;
                } else {
                    eprintln!("Error: -c requires a path argument");
                    std::process::exit(1);
                }
            }
            "-h" | "--help" => {
                println!("relaymq - minimal exact-topic pub/sub broker");
                println!();
                println!("Usage: relaymq [OPTIONS]");
                println!();
                println!("Options:");
                println!(
                    "  -c, --config <PATH>     Configuration file (default: {})",
                    DEFAULT_CONFIG_PATH
                );
                println!("  -h, --help              Show this help message");
                println!();
                println!("Settings may also be supplied via RELAYMQ__ environment");
                println!("variables, e.g. RELAYMQ__SERVER__BIND=0.0.0.0:1884");
                std::process::exit(0);
            }
            arg => {
                eprintln!("Unknown argument: {}", arg);
                std::process::exit(1);
            }
        }
    }

    config_path
}

fn main() {
    let config_path = parse_args();

    let config = match Config::load(&config_path) {
        Ok(c) => c,
        Err(e) => {
            eprintln!("Failed to load configuration: {}", e);
            std::process::exit(1);
        }
    };

    env_logger::Builder::from_env(
        env_logger::Env::default().default_filter_or(&config.log.level),
    )
    .init();

    let num_workers = if config.server.workers == 0 {
        num_cpus::get()
    } else {
        config.server.workers
    };

    let shared = Arc::new(SharedState::new());

    if config.http.enabled {
        http::start_stats_server(config.http.bind, shared.clone());
    }

    let mut server = match Server::with_workers(
        config.server.bind,
        num_workers,
        shared,
        config.log.packet_times,
    ) {
        Ok(s) => s,
        Err(e) => {
            error!("Failed to start server: {}", e);
            std::process::exit(1);
        }
    };

    if let Err(e) = server.run() {
        error!("Server error: {}", e);
        std::process::exit(1);
    }
}
