//! Internal tracing, written to stderr and off unless `RUNAS_TRACE` is set
//!
//! `RUNAS_TRACE` takes an `EnvFilter` directive such as `debug` or
//! `runas_command=trace`.

use tracing_subscriber::EnvFilter;

/// Environment variable holding the tracing filter
pub const TRACE_ENV: &str = "RUNAS_TRACE";

/// Install the tracing subscriber for `filter`
///
/// Returns whether a subscriber was installed. An invalid filter is reported
/// on stderr and leaves tracing off.
pub fn init_tracing(filter: Option<&str>) -> bool {
    let filter = match filter.map(str::trim) {
        Some(filter) if !filter.is_empty() => filter,
        _ => return false,
    };

    let filter = match EnvFilter::try_new(filter) {
        Ok(filter) => filter,
        Err(e) => {
            eprintln!("Warning: ignoring invalid {} value: {}", TRACE_ENV, e);
            return false;
        }
    };

    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init()
        .is_ok()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unset_or_blank_filter_leaves_tracing_off() {
        assert!(!init_tracing(None));
        assert!(!init_tracing(Some("   ")));
    }

    #[test]
    fn test_invalid_filter_is_rejected() {
        assert!(!init_tracing(Some("runas_command=notalevel")));
    }
}
