// CLI entry point for the drivelink control server.
//
// Runs the control server against the built-in headless simulation, which
// is enough to exercise clients end to end without a rendering engine. See
// `server.rs` for the threading architecture and `headless.rs` for the
// frame loop.
//
// Usage:
//   drivelink-server [OPTIONS]
//     --config <PATH>       JSON config file (fields default when absent)
//     --host <ADDR>         Client listen address (default: 127.0.0.1)
//     --port <PORT>         Client listen port (default: 9876)
//     --sim-port <PORT>     Simulation endpoint port (default: 9009)
//     --frame-rate <HZ>     Host frame rate (default: 60)
//
// Log verbosity follows `RUST_LOG` (default: info).

use std::path::PathBuf;

use drivelink_server::{ServerConfig, start_headless_server};
use log::{error, info};

/// Command-line values applied on top of the config file.
#[derive(Default)]
struct Overrides {
    config_path: Option<PathBuf>,
    client_host: Option<String>,
    client_port: Option<u16>,
    sim_port: Option<u16>,
    frame_rate_hz: Option<u32>,
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let overrides = parse_args();
    let mut config = match &overrides.config_path {
        Some(path) => match ServerConfig::from_file(path) {
            Ok(config) => config,
            Err(e) => {
                error!("failed to load {}: {e}", path.display());
                std::process::exit(1);
            }
        },
        None => ServerConfig::default(),
    };
    if let Some(host) = overrides.client_host {
        config.client_host = host;
    }
    if let Some(port) = overrides.client_port {
        config.client_port = port;
    }
    if let Some(port) = overrides.sim_port {
        config.sim_port = port;
    }
    if let Some(rate) = overrides.frame_rate_hz {
        config.frame_rate_hz = rate;
    }

    let (handle, addr) = match start_headless_server(config) {
        Ok(result) => result,
        Err(e) => {
            error!("failed to start server: {e}");
            std::process::exit(1);
        }
    };

    info!("control server listening on {addr}");
    println!("Press Ctrl+C to stop.");

    // The frame loop only exits on stop(); SIGINT ends the process.
    handle.wait();
}

/// Parse command-line arguments. Uses simple `std::env::args()` matching.
fn parse_args() -> Overrides {
    let mut overrides = Overrides::default();
    let args: Vec<String> = std::env::args().collect();
    let mut i = 1;

    while i < args.len() {
        match args[i].as_str() {
            "--config" => {
                i += 1;
                overrides.config_path = Some(args.get(i).map(PathBuf::from).unwrap_or_else(|| {
                    eprintln!("--config requires a path");
                    std::process::exit(1);
                }));
            }
            "--host" => {
                i += 1;
                overrides.client_host = Some(args.get(i).cloned().unwrap_or_else(|| {
                    eprintln!("--host requires an address");
                    std::process::exit(1);
                }));
            }
            "--port" => {
                i += 1;
                overrides.client_port = Some(parse_value(&args, i, "--port", "a valid port"));
            }
            "--sim-port" => {
                i += 1;
                overrides.sim_port = Some(parse_value(&args, i, "--sim-port", "a valid port"));
            }
            "--frame-rate" => {
                i += 1;
                overrides.frame_rate_hz =
                    Some(parse_value(&args, i, "--frame-rate", "a frame rate in Hz"));
            }
            "--help" | "-h" => {
                print_usage();
                std::process::exit(0);
            }
            other => {
                eprintln!("Unknown argument: {other}");
                print_usage();
                std::process::exit(1);
            }
        }
        i += 1;
    }

    overrides
}

fn parse_value<T: std::str::FromStr>(args: &[String], i: usize, flag: &str, what: &str) -> T {
    args.get(i).and_then(|s| s.parse().ok()).unwrap_or_else(|| {
        eprintln!("{flag} requires {what}");
        std::process::exit(1);
    })
}

fn print_usage() {
    println!("Usage: drivelink-server [OPTIONS]");
    println!();
    println!("Options:");
    println!("  --config <PATH>       JSON config file");
    println!("  --host <ADDR>         Client listen address (default: 127.0.0.1)");
    println!("  --port <PORT>         Client listen port (default: 9876)");
    println!("  --sim-port <PORT>     Simulation endpoint port (default: 9009)");
    println!("  --frame-rate <HZ>     Host frame rate (default: 60)");
    println!("  --help, -h            Show this help");
}
