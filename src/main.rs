mod cli;
mod utils;

use echoprobe::{EchoEngine, EngineConfig, Outcome};
use std::time::Duration;

#[tokio::main]
async fn main() {
    // Enable debug logging if RUST_LOG is set
    if std::env::var("RUST_LOG").is_ok() {
        env_logger::init();
    }

    // Parse command line arguments
    let args = match cli::parse_args() {
        Ok(args) => args,
        Err(e) => {
            utils::exit_with_error(&format!("Invalid arguments: {}", e), 1);
        }
    };

    // Validate parameters
    if let Err(e) = utils::validate_probe_params(args.count, args.timeout, args.interval, args.ttl) {
        utils::exit_with_error(&e.to_string(), 1);
    }

    let Some(target) = args.destination() else {
        utils::exit_with_error("No target or gateway given", 1);
    };

    let engine = match EchoEngine::new(EngineConfig::default().with_ttl(args.ttl)) {
        Ok(engine) => engine,
        Err(e) => {
            utils::exit_with_error(&format!("Failed to start echo engine: {:#}", e), 1);
        }
    };

    let timeout = Duration::from_millis(args.timeout.unwrap_or(1000) as u64);
    let interval = Duration::from_millis(args.interval.unwrap_or(1000) as u64);
    let count = args.count.unwrap_or(u32::MAX);

    println!("Probing {} every {}ms:", target, interval.as_millis());

    // Setup signal handler for Ctrl+C
    let mut shutdown_signal = utils::setup_signal_handler();

    for i in 0..count {
        // Check for shutdown signal
        if shutdown_signal.is_requested() {
            break;
        }

        match engine.ping(&target, timeout).await {
            Outcome::Pong { sequence, elapsed_ms } => {
                println!("Reply from {}: seq={} time={}", target, sequence, utils::format_time(elapsed_ms));
            }
            Outcome::Timeout { sequence } => {
                println!("Request timed out (seq={}).", sequence);
            }
            Outcome::Error(message) => {
                eprintln!("Error: {}", message);
            }
        }

        // Don't sleep after the last request
        if (args.continuous || i + 1 < count) && shutdown_signal.sleep(interval).await {
            break;
        }
    }
}
