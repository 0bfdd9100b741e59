//! Supervisor: drives one invocation from arguments to exit code
//!
//! ```text
//! Start -> Validating -> Authenticating -> Launching -> Reporting -> Done(code)
//!              |               |                            |
//!              +---------------+----------------------------+--> Failed(kind)
//! ```
//!
//! At debug level the settings header is written before logging on, so it
//! is present even when the credentials are rejected.

use std::io::Write;
use std::time::Instant;

use crate::args_parser::{parse_invocation, requested_log_level, Invocation, LogLevel, RunSpec};
use crate::credentials::{current_user, Authenticator, Identity, IdentityGuard};
use crate::diagnostics::DiagnosticsReporter;
use crate::errors::{ErrorKind, RunAsError, DEFAULT_EXIT_CODE_BASE};
use crate::launcher::{LaunchResult, Launcher};
use crate::output_blocks::{
    create_settings_header, create_summary, create_usage, create_version_text, SummaryOptions,
};
use crate::self_test::run_self_test;

/// Lifecycle of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RunState {
    Start,
    Validating,
    Authenticating,
    Launching,
    Reporting,
    Done(i32),
    Failed(ErrorKind),
}

impl RunState {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunState::Done(_) | RunState::Failed(_))
    }
}

/// Owns the collaborators of a run and the diagnostics sink
pub struct Supervisor<A, L, W>
where
    A: Authenticator,
    L: Launcher<A::Identity>,
    W: Write,
{
    authenticator: A,
    launcher: L,
    reporter: DiagnosticsReporter<W>,
    state: RunState,
}

impl<A, L, W> Supervisor<A, L, W>
where
    A: Authenticator,
    L: Launcher<A::Identity>,
    W: Write,
{
    pub fn new(authenticator: A, launcher: L, sink: W) -> Self {
        Self {
            authenticator,
            launcher,
            reporter: DiagnosticsReporter::new(LogLevel::default(), sink),
            state: RunState::Start,
        }
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    /// Give back the diagnostics sink
    pub fn into_sink(self) -> W {
        self.reporter.into_inner()
    }

    fn transition(&mut self, next: RunState) {
        tracing::debug!(from = ?self.state, to = ?next, "state transition");
        self.state = next;
    }

    /// Run one invocation and return the exit code for the OS
    pub fn run(&mut self, args: &[String]) -> i32 {
        self.transition(RunState::Validating);

        match parse_invocation(args) {
            Ok(Invocation::Run(spec)) => self.run_command(spec),
            Ok(Invocation::SelfTest {
                log_level,
                exit_code_base,
            }) => {
                self.reporter.set_level(log_level);
                self.transition(RunState::Reporting);
                match run_self_test(&mut self.reporter, exit_code_base) {
                    Ok(exit_code) => {
                        self.transition(RunState::Done(exit_code));
                        exit_code
                    }
                    Err(exit_code) => {
                        self.transition(RunState::Failed(ErrorKind::NoAdministrativePrivileges));
                        exit_code
                    }
                }
            }
            Ok(Invocation::Help) => self.print_text(create_usage()),
            Ok(Invocation::Version) => self.print_text(create_version_text()),
            Err(e) => {
                // The level is still honoured when the rest of the line is invalid
                self.reporter
                    .set_level(requested_log_level(args).unwrap_or_default());
                redact_password_arguments(&mut self.reporter, args);
                self.fail(RunAsError::from(e), DEFAULT_EXIT_CODE_BASE, None)
            }
        }
    }

    fn print_text(&mut self, text: String) -> i32 {
        let sink = self.reporter.sink_mut();
        let _ = writeln!(sink, "{}", text);
        let _ = sink.flush();
        self.transition(RunState::Done(0));
        0
    }

    fn run_command(&mut self, spec: RunSpec) -> i32 {
        let started = Instant::now();
        let base = spec.exit_code_base;

        self.reporter.set_level(spec.log_level);
        self.reporter.redact(spec.password.expose());
        self.reporter.header(create_settings_header(&spec));
        if self.reporter.is_enabled(LogLevel::Debug) {
            self.reporter
                .step(format!("Current account: {}", current_user()));
        }

        self.transition(RunState::Authenticating);
        let account = spec.account();
        self.reporter.step(format!("Logging on as {}", account));
        let mut guard = match self.authenticator.acquire(
            &spec.user,
            &spec.password,
            spec.domain.as_deref(),
        ) {
            Ok(identity) => IdentityGuard::new(identity),
            Err(e) => {
                let reason = self.reporter.scrub(&e.to_string());
                self.reporter.step(format!("Logon failed: {}", reason));
                return self.fail(e, base, Some(started));
            }
        };
        if let Some(identity) = guard.identity() {
            let message = format!("Logged on as {}", identity.account());
            self.reporter.step(message);
        }

        self.transition(RunState::Launching);
        self.reporter
            .step(format!("Starting process: {}", spec.display_command_line()));
        let result = match guard.identity() {
            Some(identity) => self.launcher.launch(identity, &spec),
            None => LaunchResult::failed(RunAsError::process_creation(
                spec.command_line(),
                "no identity to launch with",
            )),
        };
        match result.exit_code {
            Some(code) => self.reporter.step(format!("Process exited with code {}", code)),
            None => self.reporter.step("Process was not started"),
        }

        if guard.release() {
            self.reporter.step("Identity released");
        }

        self.transition(RunState::Reporting);
        match (result.launch_error, result.exit_code) {
            (Some(e), _) => self.fail(e, base, Some(started)),
            (None, Some(exit_code)) => {
                self.reporter.summary(create_summary(&SummaryOptions {
                    exit_code,
                    duration_ms: Some(elapsed_ms(started)),
                    error: None,
                }));
                self.transition(RunState::Done(exit_code));
                exit_code
            }
            (None, None) => self.fail(
                RunAsError::process_creation(spec.command_line(), "no exit code was reported"),
                base,
                Some(started),
            ),
        }
    }

    fn fail(&mut self, error: RunAsError, base: i32, started: Option<Instant>) -> i32 {
        let exit_code = error.exit_code(base);
        tracing::debug!(kind = ?error.kind(), exit_code, "run failed");
        let reason = self.reporter.scrub(&error.to_string());
        self.reporter.summary(create_summary(&SummaryOptions {
            exit_code,
            duration_ms: started.map(elapsed_ms),
            error: Some(&reason),
        }));
        self.transition(RunState::Failed(error.kind()));
        exit_code
    }
}

fn elapsed_ms(started: Instant) -> f64 {
    started.elapsed().as_secs_f64() * 1000.0
}

/// Keep `-p:` values out of error output when parsing failed
fn redact_password_arguments<W: Write>(reporter: &mut DiagnosticsReporter<W>, args: &[String]) {
    for arg in args {
        if arg == "--" || !arg.starts_with('-') {
            break;
        }
        if let Some(value) = arg.get(..3).filter(|p| p.eq_ignore_ascii_case("-p:")) {
            reporter.redact(&arg[value.len()..]);
        }
    }
}

/// Run with the platform authenticator and launcher, writing diagnostics to
/// stdout
pub fn run(args: &[String]) -> i32 {
    use crate::credentials::SystemAuthenticator;
    use crate::launcher::SystemLauncher;

    let mut supervisor = Supervisor::new(SystemAuthenticator, SystemLauncher, std::io::stdout());
    supervisor.run(args)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    #[derive(Default)]
    struct Calls {
        acquired: u32,
        released: u32,
        launched: u32,
    }

    struct FakeIdentity {
        calls: Rc<RefCell<Calls>>,
    }

    impl Identity for FakeIdentity {
        fn account(&self) -> String {
            "fake".to_string()
        }

        fn release(&mut self) {
            self.calls.borrow_mut().released += 1;
        }
    }

    struct FakeAuthenticator {
        calls: Rc<RefCell<Calls>>,
        accept: bool,
    }

    impl Authenticator for FakeAuthenticator {
        type Identity = FakeIdentity;

        fn acquire(
            &self,
            user: &str,
            _password: &crate::secret::SecretString,
            _domain: Option<&str>,
        ) -> Result<FakeIdentity, RunAsError> {
            self.calls.borrow_mut().acquired += 1;
            if self.accept {
                Ok(FakeIdentity {
                    calls: self.calls.clone(),
                })
            } else {
                Err(RunAsError::authentication(user, "bad credentials"))
            }
        }
    }

    struct FakeLauncher {
        calls: Rc<RefCell<Calls>>,
        exit_code: i32,
    }

    impl Launcher<FakeIdentity> for FakeLauncher {
        fn launch(&self, _identity: &FakeIdentity, _spec: &RunSpec) -> LaunchResult {
            self.calls.borrow_mut().launched += 1;
            LaunchResult::exited(self.exit_code, String::new(), String::new())
        }
    }

    fn args(strs: &[&str]) -> Vec<String> {
        strs.iter().map(|s| s.to_string()).collect()
    }

    fn run_fake(accept: bool, exit_code: i32, argv: &[&str]) -> (i32, String, Rc<RefCell<Calls>>, RunState) {
        let calls = Rc::new(RefCell::new(Calls::default()));
        let mut supervisor = Supervisor::new(
            FakeAuthenticator {
                calls: calls.clone(),
                accept,
            },
            FakeLauncher {
                calls: calls.clone(),
                exit_code,
            },
            Vec::new(),
        );
        let code = supervisor.run(&args(argv));
        let state = supervisor.state();
        let out = String::from_utf8(supervisor.into_sink()).unwrap();
        (code, out, calls, state)
    }

    #[test]
    fn test_success_propagates_exit_code() {
        let (code, out, calls, state) = run_fake(true, 7, &["-u:bob", "-p:x", "run.cmd"]);
        assert_eq!(code, 7);
        assert_eq!(state, RunState::Done(7));
        assert!(out.contains("exit code: 7"));
        let calls = calls.borrow();
        assert_eq!((calls.acquired, calls.launched, calls.released), (1, 1, 1));
    }

    #[test]
    fn test_authentication_failure_keeps_header() {
        let (code, out, calls, state) = run_fake(
            false,
            0,
            &["-u:SomeAsTestUser", "-p:SomePassword", "-l:debug", "command.cmd"],
        );
        assert_eq!(code, ErrorKind::Authentication.exit_code(DEFAULT_EXIT_CODE_BASE));
        assert_eq!(state, RunState::Failed(ErrorKind::Authentication));
        assert!(out.contains("JetBrains RunAs"));
        assert!(out.contains("Settings:"));
        assert!(!out.contains("SomePassword"));
        assert_eq!(calls.borrow().launched, 0);
        assert_eq!(calls.borrow().released, 0);
    }

    #[test]
    fn test_argument_error_never_authenticates() {
        let (code, out, calls, state) = run_fake(true, 0, &["-p:x", "run.cmd"]);
        assert_eq!(code, ErrorKind::Argument.exit_code(DEFAULT_EXIT_CODE_BASE));
        assert_eq!(state, RunState::Failed(ErrorKind::Argument));
        assert!(out.contains("-u"));
        assert_eq!(calls.borrow().acquired, 0);
    }

    #[test]
    fn test_argument_error_ignores_custom_base() {
        let (code, _, _, _) = run_fake(true, 0, &["-b:1000", "-u:bob", "-p:x"]);
        assert_eq!(code, ErrorKind::Argument.exit_code(DEFAULT_EXIT_CODE_BASE));
    }

    #[test]
    fn test_custom_base_applies_to_logon_failure() {
        let (code, _, _, _) = run_fake(false, 0, &["-b:1000", "-u:bob", "-p:x", "run.cmd"]);
        assert_eq!(code, 1002);
    }

    #[test]
    fn test_quiet_argument_error_prints_nothing() {
        let (_, out, _, _) = run_fake(true, 0, &["-l:quiet", "-z:bad"]);
        assert!(out.is_empty());
    }

    #[test]
    fn test_password_hidden_when_parsing_fails() {
        let (_, out, _, _) = run_fake(true, 0, &["-p:hunter2", "-zz:hunter2"]);
        assert!(!out.contains("hunter2"));
    }

    #[test]
    fn test_short_passwords_leave_diagnostics_intact() {
        for password in ["a", "0", "Settings"] {
            let flag = format!("-p:{}", password);
            let (_, out, _, _) =
                run_fake(false, 0, &["-u:SomeAsTestUser", &flag, "-l:debug", "command.cmd"]);
            assert!(out.contains("JetBrains RunAs"), "{}", out);
            assert!(out.contains("Settings:"), "{}", out);
            assert!(out.contains("User name:"), "{}", out);
            assert!(out.contains("Domain:"), "{}", out);
            assert!(out.contains("RunAs failed"), "{}", out);

            let (code, out, _, _) = run_fake(true, 0, &["-u:bob", &flag, "run.cmd"]);
            assert_eq!(code, 0);
            assert!(out.contains("exit code: 0"), "{}", out);
        }
    }

    #[test]
    fn test_help_writes_usage() {
        let (code, out, calls, state) = run_fake(true, 0, &["-?"]);
        assert_eq!(code, 0);
        assert_eq!(state, RunState::Done(0));
        assert!(out.starts_with("Usage: runas"));
        assert_eq!(calls.borrow().acquired, 0);
    }

    #[test]
    fn test_state_is_terminal_after_run() {
        let (_, _, _, state) = run_fake(true, 0, &["-u:bob", "-p:x", "run.cmd"]);
        assert!(state.is_terminal());
        assert!(!RunState::Launching.is_terminal());
    }

    #[test]
    fn test_redact_password_arguments_stops_at_command() {
        let mut reporter = DiagnosticsReporter::new(LogLevel::Normal, Vec::new());
        redact_password_arguments(
            &mut reporter,
            &args(&["-P:Secret", "tool", "-p:not-a-password"]),
        );
        let out = reporter.scrub("Secret not-a-password");
        assert!(!out.contains("Secret"));
        assert!(out.contains("not-a-password"));
    }
}
