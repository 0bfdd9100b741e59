//! runas CLI
//!
//! Runs a command as another user:
//! - logs on with the given credentials
//! - relays the command's stdout and stderr
//! - exits with the command's exit code

use std::env;
use std::process;

use runas_command::{create_usage, init_tracing, run, setup_signal_handlers, TRACE_ENV};

/// Configuration from environment variables
struct Config {
    /// Filter directive for internal tracing
    trace_filter: Option<String>,
    /// Do not install signal handlers
    no_signal_handlers: bool,
}

impl Config {
    fn from_env() -> Self {
        Self {
            trace_filter: env::var(TRACE_ENV).ok(),
            no_signal_handlers: env_bool("RUNAS_NO_SIGNAL_HANDLERS"),
        }
    }
}

fn env_bool(name: &str) -> bool {
    env::var(name).is_ok_and(|v| v == "1" || v == "true")
}

fn main() {
    let config = Config::from_env();
    init_tracing(config.trace_filter.as_deref());

    // Take the child down with us when interrupted
    if !config.no_signal_handlers {
        setup_signal_handlers();
    }

    let args: Vec<String> = env::args().skip(1).collect();
    if args.is_empty() {
        println!("{}", create_usage());
        process::exit(0);
    }

    process::exit(run(&args));
}
