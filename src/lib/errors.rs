//! Error taxonomy and exit-code policy
//!
//! Tool failures are reported with exit codes from a range that is disjoint
//! from the codes a child process normally returns:
//! - `base + 1`: invalid command line
//! - `base + 2`: the credentials were rejected
//! - `base + 3`: the child process could not be created
//! - `base + 4`: the self test found missing privileges
//!
//! A child that runs and fails is not a tool error; its exit code is
//! propagated unchanged.

use std::path::PathBuf;

/// Default exit-code base on Windows, where exit codes are 32-bit
#[cfg(windows)]
pub const DEFAULT_EXIT_CODE_BASE: i32 = -100_000;

/// Default exit-code base on Unix, where exit codes are truncated to 8 bits
#[cfg(not(windows))]
pub const DEFAULT_EXIT_CODE_BASE: i32 = 240;

/// Kind of tool-level failure
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorKind {
    Argument,
    Authentication,
    ProcessCreation,
    NoAdministrativePrivileges,
}

impl ErrorKind {
    /// Offset added to the exit-code base for this failure kind
    pub fn offset(self) -> i32 {
        match self {
            ErrorKind::Argument => 1,
            ErrorKind::Authentication => 2,
            ErrorKind::ProcessCreation => 3,
            ErrorKind::NoAdministrativePrivileges => 4,
        }
    }

    /// Exit code reported for this failure kind with the given base
    pub fn exit_code(self, base: i32) -> i32 {
        base.wrapping_add(self.offset())
    }
}

/// Malformed or missing command-line input
#[derive(Debug, thiserror::Error)]
pub enum ArgumentError {
    #[error("no command to run was specified")]
    MissingCommand,

    #[error("required option {0} is missing")]
    MissingFlag(&'static str),

    #[error("unknown option: {0}")]
    UnknownFlag(String),

    #[error("option {0} requires a value")]
    MissingValue(String),

    #[error("invalid log level \"{0}\", expected one of: quiet, normal, debug")]
    InvalidLogLevel(String),

    #[error("invalid value \"{value}\" for option {flag}")]
    InvalidValue { flag: String, value: String },

    #[error("user name must not be empty")]
    EmptyUser,

    #[error("argument file {} cannot reference another argument file", path.display())]
    NestedArgumentFile { path: PathBuf },

    #[error("cannot read argument file {}: {source}", path.display())]
    ArgumentFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

/// Failure of the tool itself (as opposed to a failing child process)
#[derive(Debug, thiserror::Error)]
pub enum RunAsError {
    #[error("invalid arguments: {0}")]
    Argument(#[from] ArgumentError),

    #[error("cannot log on as \"{account}\": {reason}")]
    Authentication { account: String, reason: String },

    #[error("cannot start \"{command}\": {reason}")]
    ProcessCreation { command: String, reason: String },

    #[error("{0}")]
    NoAdministrativePrivileges(String),
}

impl RunAsError {
    pub fn authentication(account: impl Into<String>, reason: impl ToString) -> Self {
        RunAsError::Authentication {
            account: account.into(),
            reason: reason.to_string(),
        }
    }

    pub fn process_creation(command: impl Into<String>, reason: impl ToString) -> Self {
        RunAsError::ProcessCreation {
            command: command.into(),
            reason: reason.to_string(),
        }
    }

    pub fn kind(&self) -> ErrorKind {
        match self {
            RunAsError::Argument(_) => ErrorKind::Argument,
            RunAsError::Authentication { .. } => ErrorKind::Authentication,
            RunAsError::ProcessCreation { .. } => ErrorKind::ProcessCreation,
            RunAsError::NoAdministrativePrivileges(_) => ErrorKind::NoAdministrativePrivileges,
        }
    }

    /// Exit code reported for this error with the given base
    pub fn exit_code(&self, base: i32) -> i32 {
        self.kind().exit_code(base)
    }
}

/// Attach the name of the failing call to an OS error
pub(crate) fn os_error_with_context(context: &str, err: std::io::Error) -> std::io::Error {
    std::io::Error::new(err.kind(), format!("{}: {}", context, err))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_codes_are_distinct_per_kind() {
        let codes: Vec<i32> = [
            ErrorKind::Argument,
            ErrorKind::Authentication,
            ErrorKind::ProcessCreation,
            ErrorKind::NoAdministrativePrivileges,
        ]
        .iter()
        .map(|k| k.exit_code(DEFAULT_EXIT_CODE_BASE))
        .collect();

        for (i, a) in codes.iter().enumerate() {
            assert_ne!(*a, 0);
            for b in &codes[i + 1..] {
                assert_ne!(a, b);
            }
        }
    }

    #[test]
    fn test_custom_base() {
        assert_eq!(ErrorKind::Authentication.exit_code(-1000), -998);
        assert_eq!(ErrorKind::Argument.exit_code(100), 101);
    }

    #[test]
    fn test_error_kind_mapping() {
        let err = RunAsError::from(ArgumentError::MissingCommand);
        assert_eq!(err.kind(), ErrorKind::Argument);
        assert_eq!(
            RunAsError::authentication("bob", "bad password").kind(),
            ErrorKind::Authentication
        );
        assert_eq!(
            RunAsError::process_creation("x.exe", "not found").kind(),
            ErrorKind::ProcessCreation
        );
    }

    #[test]
    fn test_error_messages() {
        let err = RunAsError::authentication("CORP\\bob", "the user name or password is incorrect");
        assert_eq!(
            err.to_string(),
            "cannot log on as \"CORP\\bob\": the user name or password is incorrect"
        );
        assert_eq!(
            ArgumentError::UnknownFlag("-x:1".to_string()).to_string(),
            "unknown option: -x:1"
        );
    }

    #[test]
    fn test_os_error_with_context() {
        let err = os_error_with_context(
            "LogonUserW",
            std::io::Error::new(std::io::ErrorKind::PermissionDenied, "denied"),
        );
        assert_eq!(err.kind(), std::io::ErrorKind::PermissionDenied);
        assert_eq!(err.to_string(), "LogonUserW: denied");
    }
}
