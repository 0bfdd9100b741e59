//! runas-command library
//!
//! Runs a command under alternate user credentials, relays its output and
//! propagates its exit code, with diagnostics gated by a log level.

pub mod args_parser;
pub mod credentials;
pub mod diagnostics;
pub mod errors;
pub mod launcher;
pub mod logging;
pub mod output_blocks;
pub mod secret;
pub mod signal_handler;
pub mod supervisor;
#[cfg(unix)]
pub mod unix_account;
#[cfg(windows)]
pub mod win32;

// Re-export commonly used items
pub use args_parser::{
    parse_args, parse_invocation, requested_log_level, Invocation, LogLevel, RunSpec,
    VALID_LOG_LEVELS,
};
pub use credentials::{
    current_user, Authenticator, Identity, IdentityGuard, SystemAuthenticator, SystemIdentity,
};
pub use diagnostics::{DiagnosticEvent, DiagnosticsReporter, EventKind};
pub use errors::{ArgumentError, ErrorKind, RunAsError, DEFAULT_EXIT_CODE_BASE};
pub use launcher::{LaunchResult, Launcher, SystemLauncher};
pub use logging::{init_tracing, TRACE_ENV};
pub use output_blocks::{
    create_settings_header, create_summary, create_usage, create_version_text, format_duration,
    SummaryOptions, SETTINGS_TITLE, TOOL_TITLE,
};
pub use secret::{scrub_secret, SecretString, REDACTED};
pub use self_test::{run_self_test, Privileges};
pub use signal_handler::setup_signal_handlers;
pub use supervisor::{run, RunState, Supervisor};
