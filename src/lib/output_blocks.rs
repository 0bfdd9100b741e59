//! Output formatting for the settings header and the final summary
//!
//! The header identifies the tool and echoes the resolved settings with the
//! password redacted:
//!
//! ```text
//! JetBrains RunAs 0.1.0
//! Settings:
//!   User name:           bob
//!   Domain:              CORP
//!   Password:            ********
//!   ...
//! ```

use crate::args_parser::RunSpec;
use crate::secret::REDACTED;

/// Tool identity line written first in the settings header
pub const TOOL_TITLE: &str = "JetBrains RunAs";

/// Title of the settings section
pub const SETTINGS_TITLE: &str = "Settings:";

/// Width of the label column in the settings section
const LABEL_WIDTH: usize = 21;

/// Pad text to a specific width (never truncates)
fn pad_text(text: &str, width: usize) -> String {
    if text.len() >= width {
        text.to_string()
    } else {
        format!("{}{}", text, " ".repeat(width - text.len()))
    }
}

/// Create a `label: value` line of the settings section
fn create_setting_line(label: &str, value: &str) -> String {
    format!("  {}{}", pad_text(&format!("{}:", label), LABEL_WIDTH), value)
}

/// Create the settings header for a run
pub fn create_settings_header(spec: &RunSpec) -> String {
    let mut lines = vec![
        format!("{} {}", TOOL_TITLE, env!("CARGO_PKG_VERSION")),
        SETTINGS_TITLE.to_string(),
    ];

    lines.push(create_setting_line("User name", &spec.user));
    lines.push(create_setting_line(
        "Domain",
        spec.domain.as_deref().unwrap_or("(none)"),
    ));
    lines.push(create_setting_line("Password", REDACTED));
    lines.push(create_setting_line("Command line", &spec.display_command_line()));
    lines.push(create_setting_line(
        "Working directory",
        spec.working_directory.as_deref().unwrap_or("(current)"),
    ));
    lines.push(create_setting_line(
        "Inherit environment",
        &spec.inherit_environment.to_string(),
    ));
    lines.push(create_setting_line("Log level", spec.log_level.as_str()));
    lines.push(create_setting_line(
        "Exit code base",
        &spec.exit_code_base.to_string(),
    ));

    lines.join("\n")
}

/// Create the settings header for self-test mode
pub fn create_self_test_header(exit_code_base: i32) -> String {
    [
        format!("{} {}", TOOL_TITLE, env!("CARGO_PKG_VERSION")),
        SETTINGS_TITLE.to_string(),
        create_setting_line("Mode", "self test"),
        create_setting_line("Exit code base", &exit_code_base.to_string()),
    ]
    .join("\n")
}

/// Version text for `--version`
pub fn create_version_text() -> String {
    [
        format!("{} version: {}", TOOL_TITLE, env!("CARGO_PKG_VERSION")),
        String::new(),
        format!("OS: {}", std::env::consts::OS),
        format!("Architecture: {}", std::env::consts::ARCH),
    ]
    .join("\n")
}

/// Usage text for `--help` and for an empty command line
pub fn create_usage() -> String {
    r#"Usage: runas -u:<user> -p:<password> [options] [--] <command> [args...]
       runas -t [-l:<level>]

Options:
  -u:<user>        Account to run the command as (DOMAIN\user, user@domain or user)
  -p:<password>    Password of the account (may be empty)
  -d:<domain>      Domain of the account
  -l:<level>       Log level: quiet, normal, debug (default: normal)
  -w:<directory>   Working directory of the command
  -i:<true|false>  Inherit the current environment (default: false)
  -b:<integer>     Base of the exit codes reported for runas's own failures
  -c:<file>        Read more arguments from a file, one per line
  -t               Check the privileges needed to run commands as other users
  --help, -h, -?   Show this help
  --version        Show version information

Exit codes:
  The exit code of the command, or <base> + 1 for invalid arguments,
  <base> + 2 when the logon fails, <base> + 3 when the command cannot be
  started and <base> + 4 when the self test finds missing privileges.

Examples:
  runas -u:CORP\builder -p:secret build.cmd --release
  runas -c:credentials.args -l:debug -- tool.exe -x
  runas -t"#
        .to_string()
}

/// Format duration in seconds with appropriate precision
pub fn format_duration(duration_ms: f64) -> String {
    let seconds = duration_ms / 1000.0;
    if seconds < 0.001 {
        "0.001".to_string()
    } else if seconds < 10.0 {
        format!("{:.3}", seconds)
    } else if seconds < 100.0 {
        format!("{:.2}", seconds)
    } else {
        format!("{:.1}", seconds)
    }
}

/// Options for the final summary line
pub struct SummaryOptions<'a> {
    pub exit_code: i32,
    pub duration_ms: Option<f64>,
    /// Error message when runas itself failed
    pub error: Option<&'a str>,
}

/// Create the final success or failure summary
pub fn create_summary(options: &SummaryOptions) -> String {
    let elapsed = options
        .duration_ms
        .map(|ms| format!(" in {} seconds", format_duration(ms)))
        .unwrap_or_default();

    match options.error {
        Some(error) => format!(
            "RunAs failed{}: {} (exit code {})",
            elapsed, error, options.exit_code
        ),
        None => format!(
            "RunAs finished{}, exit code: {}",
            elapsed, options.exit_code
        ),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::args_parser::parse_args;

    fn spec(args: &[&str]) -> RunSpec {
        let args: Vec<String> = args.iter().map(|s| s.to_string()).collect();
        parse_args(&args).unwrap()
    }

    #[test]
    fn test_header_contains_title_and_settings() {
        let header = create_settings_header(&spec(&["-u:bob", "-p:pa55", "-l:debug", "run.cmd"]));
        let lines: Vec<&str> = header.lines().collect();
        assert!(lines[0].starts_with(TOOL_TITLE));
        assert_eq!(lines[1], SETTINGS_TITLE);
        assert!(header.contains("User name:"));
        assert!(header.contains("bob"));
        assert!(header.contains("run.cmd"));
        assert!(header.contains("debug"));
    }

    #[test]
    fn test_header_redacts_password() {
        let header = create_settings_header(&spec(&["-u:bob", "-p:pa55word", "run.cmd"]));
        assert!(!header.contains("pa55word"));
        assert!(header.contains(REDACTED));
    }

    #[test]
    fn test_header_is_intact_for_short_passwords() {
        for password in ["a", "0", "Settings", "JetBrains"] {
            let flag = format!("-p:{}", password);
            let header = create_settings_header(&spec(&["-u:bob", &flag, "-l:debug", "run.cmd"]));
            assert!(header.starts_with(TOOL_TITLE), "{}", header);
            for label in [SETTINGS_TITLE, "User name:", "Domain:", "Password:", "Exit code base:"] {
                assert!(header.contains(label), "missing {:?} in:\n{}", label, header);
            }
        }
    }

    #[test]
    fn test_header_hides_password_passed_to_command() {
        let header = create_settings_header(&spec(&["-u:bob", "-p:a", "login.cmd", "a"]));
        assert!(header.contains("login.cmd ********"));
    }

    #[test]
    fn test_setting_line_alignment() {
        let line = create_setting_line("Domain", "CORP");
        assert_eq!(line, format!("  {}CORP", pad_text("Domain:", LABEL_WIDTH)));
        let long = create_setting_line("A very long label name here", "x");
        assert!(long.ends_with(": x") || long.ends_with(":x"));
    }

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(0.5), "0.001");
        assert_eq!(format_duration(1234.0), "1.234");
        assert_eq!(format_duration(12345.0), "12.35");
        assert_eq!(format_duration(123456.0), "123.5");
    }

    #[test]
    fn test_summary_success_and_failure() {
        let ok = create_summary(&SummaryOptions {
            exit_code: 0,
            duration_ms: Some(1500.0),
            error: None,
        });
        assert_eq!(ok, "RunAs finished in 1.500 seconds, exit code: 0");

        let failed = create_summary(&SummaryOptions {
            exit_code: 242,
            duration_ms: None,
            error: Some("cannot log on"),
        });
        assert_eq!(failed, "RunAs failed: cannot log on (exit code 242)");
    }

    #[test]
    fn test_self_test_header() {
        let header = create_self_test_header(-100);
        assert!(header.contains(TOOL_TITLE));
        assert!(header.contains(SETTINGS_TITLE));
        assert!(header.contains("-100"));
    }
}
