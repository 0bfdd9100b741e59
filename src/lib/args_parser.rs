//! Argument Parser for the runas command
//!
//! Syntax:
//! $ runas [options] [--] <command> [command-args...]
//!
//! Options use the `-name:value` form:
//! -u:<user>        Account to run the command as (DOMAIN\user, user@domain or user)
//! -p:<password>    Password of the account
//! -d:<domain>      Domain of the account
//! -l:<level>       Log level: quiet, normal, debug (default: normal)
//! -w:<directory>   Working directory of the command
//! -i:<true|false>  Inherit the environment of the current process (default: false)
//! -b:<integer>     Base of the exit codes reported for runas's own failures
//! -c:<file>        Read more arguments from a file, one per line
//! -t               Self test: check the privileges required to switch accounts
//!
//! Options may appear in any order. The first token that is not an option
//! starts the command; everything after it is passed to the command.

use std::collections::VecDeque;
use std::fmt;
use std::fs;
use std::path::PathBuf;
use std::str::FromStr;
use std::sync::OnceLock;

use regex::Regex;

use crate::errors::{ArgumentError, DEFAULT_EXIT_CODE_BASE};
use crate::secret::{scrub_secret, SecretString};

/// Valid values for `-l:`
pub const VALID_LOG_LEVELS: [&str; 3] = ["quiet", "normal", "debug"];

/// `-name` or `-name:value`
const FLAG_REGEX: &str = r"(?s)^-([A-Za-z?]+)(?::(.*))?$";

/// `DOMAIN\user`
const DOMAIN_USER_REGEX: &str = r"^([^\\]+)\\(.+)$";

fn flag_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(FLAG_REGEX).expect("flag pattern is valid"))
}

fn domain_user_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(DOMAIN_USER_REGEX).expect("account pattern is valid"))
}

/// Verbosity of runas's own diagnostics
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Default)]
pub enum LogLevel {
    /// Nothing is printed
    Quiet,
    /// Only the final success or failure summary
    #[default]
    Normal,
    /// Settings header and every lifecycle step
    Debug,
}

impl LogLevel {
    pub fn as_str(self) -> &'static str {
        match self {
            LogLevel::Quiet => "quiet",
            LogLevel::Normal => "normal",
            LogLevel::Debug => "debug",
        }
    }
}

impl FromStr for LogLevel {
    type Err = ArgumentError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "quiet" | "off" => Ok(LogLevel::Quiet),
            "normal" => Ok(LogLevel::Normal),
            "debug" => Ok(LogLevel::Debug),
            _ => Err(ArgumentError::InvalidLogLevel(s.to_string())),
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything needed for one run, immutable once parsed
#[derive(Debug, Clone)]
pub struct RunSpec {
    /// Executable or script to start
    pub executable: String,
    /// Arguments passed to the executable
    pub arguments: Vec<String>,
    /// Account name without the domain part
    pub user: String,
    pub password: SecretString,
    pub domain: Option<String>,
    pub log_level: LogLevel,
    pub working_directory: Option<String>,
    /// Merge the current environment into the account's environment
    pub inherit_environment: bool,
    pub exit_code_base: i32,
}

impl RunSpec {
    /// Account in `DOMAIN\user` form, or just the user without a domain
    pub fn account(&self) -> String {
        match self.domain {
            Some(ref domain) => format!("{}\\{}", domain, self.user),
            None => self.user.clone(),
        }
    }

    /// Command and arguments joined with spaces, for display
    pub fn command_line(&self) -> String {
        std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }

    /// [`command_line`](Self::command_line) with arguments that carry the
    /// password hidden
    pub fn display_command_line(&self) -> String {
        let password = self.password.expose();
        std::iter::once(self.executable.as_str())
            .chain(self.arguments.iter().map(String::as_str))
            .map(|arg| scrub_secret(arg, password))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// What the command line asks runas to do
#[derive(Debug)]
pub enum Invocation {
    Run(RunSpec),
    SelfTest {
        log_level: LogLevel,
        exit_code_base: i32,
    },
    Help,
    Version,
}

/// Options collected before validation
#[derive(Debug, Default)]
struct RawOptions {
    user: Option<String>,
    password: Option<String>,
    domain: Option<String>,
    log_level: Option<LogLevel>,
    working_directory: Option<String>,
    inherit_environment: Option<bool>,
    exit_code_base: Option<i32>,
    self_test: bool,
    help: bool,
    version: bool,
}

/// A token and the argument file it came from, if any
struct Token {
    value: String,
    origin: Option<PathBuf>,
}

/// Parse command line arguments into a run specification
///
/// Fails with [`ArgumentError::MissingCommand`] for invocations that do not
/// run a command (self test, help, version).
pub fn parse_args(args: &[String]) -> Result<RunSpec, ArgumentError> {
    match parse_invocation(args)? {
        Invocation::Run(spec) => Ok(spec),
        _ => Err(ArgumentError::MissingCommand),
    }
}

/// Parse command line arguments into an invocation
pub fn parse_invocation(args: &[String]) -> Result<Invocation, ArgumentError> {
    let mut options = RawOptions::default();
    let mut command: Vec<String> = Vec::new();
    let mut command_started = false;

    let mut queue: VecDeque<Token> = args
        .iter()
        .map(|a| Token {
            value: a.clone(),
            origin: None,
        })
        .collect();

    while let Some(token) = queue.pop_front() {
        if command_started {
            command.push(token.value);
            continue;
        }

        if token.value == "--" {
            command_started = true;
            continue;
        }

        if !token.value.starts_with('-') {
            command_started = true;
            command.push(token.value);
            continue;
        }

        if let Some(path) = parse_option(&token.value, &mut options)? {
            if let Some(origin) = token.origin {
                return Err(ArgumentError::NestedArgumentFile { path: origin });
            }
            let lines = read_argument_file(&path)?;
            for line in lines.into_iter().rev() {
                queue.push_front(Token {
                    value: line,
                    origin: Some(path.clone()),
                });
            }
        }
    }

    if options.help {
        return Ok(Invocation::Help);
    }
    if options.version {
        return Ok(Invocation::Version);
    }

    let log_level = options.log_level.unwrap_or_default();
    let exit_code_base = options.exit_code_base.unwrap_or(DEFAULT_EXIT_CODE_BASE);

    if options.self_test {
        return Ok(Invocation::SelfTest {
            log_level,
            exit_code_base,
        });
    }

    let raw_user = options.user.ok_or(ArgumentError::MissingFlag("-u"))?;
    let password = options.password.ok_or(ArgumentError::MissingFlag("-p"))?;
    let (user, domain) = split_account(&raw_user, options.domain)?;

    let mut command = command.into_iter();
    let executable = command.next().ok_or(ArgumentError::MissingCommand)?;
    if executable.is_empty() {
        return Err(ArgumentError::MissingCommand);
    }

    Ok(Invocation::Run(RunSpec {
        executable,
        arguments: command.collect(),
        user,
        password: SecretString::new(password),
        domain,
        log_level,
        working_directory: options.working_directory,
        inherit_environment: options.inherit_environment.unwrap_or(false),
        exit_code_base,
    }))
}

/// Parse a single option into `options`
/// Returns the path of an argument file to expand, if the option was `-c:`
fn parse_option(arg: &str, options: &mut RawOptions) -> Result<Option<PathBuf>, ArgumentError> {
    // --help / --version
    if arg == "--help" {
        options.help = true;
        return Ok(None);
    }
    if arg == "--version" {
        options.version = true;
        return Ok(None);
    }

    let captures = flag_regex()
        .captures(arg)
        .ok_or_else(|| ArgumentError::UnknownFlag(arg.to_string()))?;
    let name = captures[1].to_ascii_lowercase();
    let value = captures.get(2).map(|m| m.as_str().to_string());

    let required = |value: Option<String>| -> Result<String, ArgumentError> {
        value.ok_or_else(|| ArgumentError::MissingValue(format!("-{}", name)))
    };

    match name.as_str() {
        "u" => options.user = Some(required(value)?),
        "p" => options.password = Some(required(value)?),
        "d" => {
            let domain = required(value)?;
            options.domain = if domain.is_empty() { None } else { Some(domain) };
        }
        "l" => options.log_level = Some(required(value)?.parse()?),
        "w" => {
            let dir = required(value)?;
            options.working_directory = if dir.is_empty() { None } else { Some(dir) };
        }
        "i" => {
            let raw = required(value)?;
            options.inherit_environment = Some(parse_bool(&raw).ok_or_else(|| {
                ArgumentError::InvalidValue {
                    flag: "-i".to_string(),
                    value: raw.clone(),
                }
            })?);
        }
        "b" => {
            let raw = required(value)?;
            options.exit_code_base =
                Some(raw.trim().parse().map_err(|_| ArgumentError::InvalidValue {
                    flag: "-b".to_string(),
                    value: raw.clone(),
                })?);
        }
        "c" => return Ok(Some(PathBuf::from(required(value)?))),
        "t" => {
            if value.is_some() {
                return Err(ArgumentError::UnknownFlag(arg.to_string()));
            }
            options.self_test = true;
        }
        "h" | "?" => options.help = true,
        _ => return Err(ArgumentError::UnknownFlag(arg.to_string())),
    }

    Ok(None)
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" => Some(true),
        "false" | "0" | "no" => Some(false),
        _ => None,
    }
}

/// Split `DOMAIN\user` unless a domain was given explicitly
fn split_account(
    user: &str,
    domain: Option<String>,
) -> Result<(String, Option<String>), ArgumentError> {
    if user.trim().is_empty() {
        return Err(ArgumentError::EmptyUser);
    }

    if domain.is_some() {
        return Ok((user.to_string(), domain));
    }

    match domain_user_regex().captures(user) {
        Some(captures) => Ok((captures[2].to_string(), Some(captures[1].to_string()))),
        None => Ok((user.to_string(), None)),
    }
}

/// Read an argument file: one argument per line, blank lines skipped
fn read_argument_file(path: &PathBuf) -> Result<Vec<String>, ArgumentError> {
    let content = fs::read_to_string(path).map_err(|source| ArgumentError::ArgumentFile {
        path: path.clone(),
        source,
    })?;

    Ok(content
        .lines()
        .map(|line| line.trim_end_matches('\r'))
        .filter(|line| !line.trim().is_empty())
        .map(String::from)
        .collect())
}

/// Best-effort lookup of `-l:` for reporting errors when parsing fails
pub fn requested_log_level(args: &[String]) -> Option<LogLevel> {
    let mut level = None;
    for arg in args {
        if arg == "--" || !arg.starts_with('-') {
            break;
        }
        if let Some(captures) = flag_regex().captures(arg) {
            if captures[1].eq_ignore_ascii_case("l") {
                if let Some(parsed) = captures.get(2).and_then(|v| v.as_str().parse().ok()) {
                    level = Some(parsed);
                }
            }
        }
    }
    level
}
