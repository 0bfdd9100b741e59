//! Process launcher: starts the command under an identity and relays its output
//!
//! The child's stdout and stderr are each drained by a relay thread that
//! writes every chunk to runas's own stream as soon as it arrives and keeps a
//! copy for the [`LaunchResult`].
//!
//! The launcher waits for the child itself, not for its streams. A stream
//! still held open by a descendant after the child exits is abandoned once
//! [`RELAY_DRAIN_MS`] has passed.

use std::io::{BufRead, BufReader, Read, Write};
use std::sync::mpsc::{self, Receiver};
use std::thread;
use std::time::{Duration, Instant};

use crate::args_parser::RunSpec;
use crate::credentials::Identity;
use crate::errors::RunAsError;

/// Outcome of one launch
#[derive(Debug, Default)]
pub struct LaunchResult {
    /// Exit code of the child; `None` when no child ran to completion
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Why the child could not be created
    pub launch_error: Option<RunAsError>,
}

impl LaunchResult {
    pub fn exited(exit_code: i32, stdout: String, stderr: String) -> Self {
        Self {
            exit_code: Some(exit_code),
            stdout,
            stderr,
            launch_error: None,
        }
    }

    pub fn failed(error: RunAsError) -> Self {
        Self {
            launch_error: Some(error),
            ..Self::default()
        }
    }
}

/// Starts a command under an identity and waits for it
pub trait Launcher<I: Identity> {
    fn launch(&self, identity: &I, spec: &RunSpec) -> LaunchResult;
}

/// Copy `reader` to `sink` chunk by chunk, returning everything read
///
/// Bytes are relayed unchanged; the capture is decoded lossily.
pub fn relay_stream<R: Read, W: Write>(reader: R, mut sink: W) -> String {
    let mut reader = BufReader::new(reader);
    let mut captured = Vec::new();
    let mut line = Vec::new();

    loop {
        line.clear();
        match reader.read_until(b'\n', &mut line) {
            Ok(0) => break,
            Ok(_) => {
                let _ = sink.write_all(&line);
                let _ = sink.flush();
                captured.extend_from_slice(&line);
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!(error = %e, "relay stopped");
                break;
            }
        }
    }

    String::from_utf8_lossy(&captured).into_owned()
}

/// How long captures are awaited after the child exits
pub const RELAY_DRAIN_MS: u64 = 1000;

/// Relay threads for the child's two streams
pub(crate) struct Relays {
    stdout: Receiver<String>,
    stderr: Receiver<String>,
}

impl Relays {
    /// Drain both child streams on their own threads
    pub(crate) fn spawn<O, E, SO, SE>(stdout: O, stderr: E, out_sink: SO, err_sink: SE) -> Self
    where
        O: Read + Send + 'static,
        E: Read + Send + 'static,
        SO: Write + Send + 'static,
        SE: Write + Send + 'static,
    {
        Self {
            stdout: spawn_relay(stdout, out_sink),
            stderr: spawn_relay(stderr, err_sink),
        }
    }

    /// Collect both captures; call after the child has exited
    pub(crate) fn finish(self, drain: Duration) -> (String, String) {
        let deadline = Instant::now() + drain;
        (
            collect_capture(&self.stdout, deadline, "stdout"),
            collect_capture(&self.stderr, deadline, "stderr"),
        )
    }
}

fn spawn_relay<R, W>(reader: R, sink: W) -> Receiver<String>
where
    R: Read + Send + 'static,
    W: Write + Send + 'static,
{
    let (tx, rx) = mpsc::channel();
    thread::spawn(move || {
        let _ = tx.send(relay_stream(reader, sink));
    });
    rx
}

fn collect_capture(rx: &Receiver<String>, deadline: Instant, stream: &str) -> String {
    match rx.recv_timeout(deadline.saturating_duration_since(Instant::now())) {
        Ok(captured) => captured,
        Err(_) => {
            // The relay thread keeps forwarding until runas exits
            tracing::debug!(stream, "stream still open after the child exited");
            String::new()
        }
    }
}

fn system_relays<O, E>(stdout: O, stderr: E) -> Relays
where
    O: Read + Send + 'static,
    E: Read + Send + 'static,
{
    Relays::spawn(stdout, stderr, std::io::stdout(), std::io::stderr())
}

/// Quote one argument following the MSVCRT parsing rules
pub fn quote_argument(arg: &str) -> String {
    if !arg.is_empty() && !arg.chars().any(|c| matches!(c, ' ' | '\t' | '\n' | '\x0b' | '"')) {
        return arg.to_string();
    }

    let mut quoted = String::with_capacity(arg.len() + 2);
    quoted.push('"');

    let chars: Vec<char> = arg.chars().collect();
    let mut i = 0;
    while i < chars.len() {
        let mut num_backslashes = 0;
        while i < chars.len() && chars[i] == '\\' {
            i += 1;
            num_backslashes += 1;
        }

        if i == chars.len() {
            // Backslashes before the closing quote are doubled
            quoted.push_str(&"\\".repeat(num_backslashes * 2));
            break;
        } else if chars[i] == '"' {
            quoted.push_str(&"\\".repeat(num_backslashes * 2 + 1));
            quoted.push('"');
        } else {
            quoted.push_str(&"\\".repeat(num_backslashes));
            quoted.push(chars[i]);
        }
        i += 1;
    }

    quoted.push('"');
    quoted
}

/// Whether the target has to be run by the command interpreter
pub fn is_batch_file(executable: &str) -> bool {
    let lower = executable.to_ascii_lowercase();
    lower.ends_with(".cmd") || lower.ends_with(".bat")
}

/// Build a Windows command line
///
/// Batch files are wrapped as `"<shell>" /C "<command line>"`.
pub fn windows_command_line(executable: &str, arguments: &[String], shell: &str) -> String {
    let command_line = std::iter::once(executable)
        .chain(arguments.iter().map(String::as_str))
        .map(quote_argument)
        .collect::<Vec<_>>()
        .join(" ");

    if is_batch_file(executable) {
        format!("{} /C \"{}\"", quote_argument(shell), command_line)
    } else {
        command_line
    }
}

/// Launches commands with the platform's process creation APIs
#[derive(Debug, Default, Clone, Copy)]
pub struct SystemLauncher;

#[cfg(unix)]
mod platform {
    use super::*;
    use std::os::unix::process::ExitStatusExt;
    use std::process::{Command, Stdio};

    use crate::credentials::SystemIdentity;
    use crate::signal_handler::{clear_child, register_child};
    use crate::unix_account;

    impl Launcher<SystemIdentity> for SystemLauncher {
        fn launch(&self, identity: &SystemIdentity, spec: &RunSpec) -> LaunchResult {
            let account = match identity.target() {
                Some(account) => account,
                None => {
                    return LaunchResult::failed(RunAsError::process_creation(
                        spec.command_line(),
                        "the identity has already been released",
                    ))
                }
            };

            let mut command = Command::new(&spec.executable);
            command
                .args(&spec.arguments)
                .stdin(Stdio::inherit())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped());

            if let Some(ref dir) = spec.working_directory {
                command.current_dir(dir);
            }
            if !spec.inherit_environment {
                unix_account::reset_environment(&mut command, account);
            }
            if let Some(ref groups) = identity.switch_groups {
                unix_account::switch_account(&mut command, account, groups.clone());
            }

            let mut child = match command.spawn() {
                Ok(child) => child,
                Err(e) => {
                    return LaunchResult::failed(RunAsError::process_creation(
                        spec.command_line(),
                        e,
                    ))
                }
            };
            register_child(child.id());
            tracing::debug!(pid = child.id(), "child started");

            let relays = match (child.stdout.take(), child.stderr.take()) {
                (Some(stdout), Some(stderr)) => system_relays(stdout, stderr),
                _ => {
                    let _ = child.kill();
                    let _ = child.wait();
                    clear_child();
                    return LaunchResult::failed(RunAsError::process_creation(
                        spec.command_line(),
                        "child output pipes are unavailable",
                    ));
                }
            };

            let status = child.wait();
            clear_child();
            let (stdout_output, stderr_output) =
                relays.finish(Duration::from_millis(RELAY_DRAIN_MS));

            match status {
                // A child killed by a signal reports 128 + signal, like a shell
                Ok(status) => {
                    let exit_code = status
                        .code()
                        .or_else(|| status.signal().map(|sig| 128 + sig))
                        .unwrap_or(1);
                    tracing::debug!(exit_code, "child exited");
                    LaunchResult::exited(exit_code, stdout_output, stderr_output)
                }
                Err(e) => LaunchResult::failed(RunAsError::process_creation(
                    spec.command_line(),
                    format!("error waiting for command: {}", e),
                )),
            }
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::env;

    use crate::credentials::SystemIdentity;
    use crate::signal_handler::{clear_child, register_child};
    use crate::win32::{self, InheritablePipe, Job, LaunchRequest, ProcessInfo};

    const DEFAULT_SHELL: &str = "cmd.exe";

    impl Launcher<SystemIdentity> for SystemLauncher {
        fn launch(&self, identity: &SystemIdentity, spec: &RunSpec) -> LaunchResult {
            let fail = |reason: &dyn std::fmt::Display| {
                LaunchResult::failed(RunAsError::process_creation(
                    spec.command_line(),
                    reason.to_string(),
                ))
            };

            let token = match identity.token() {
                Some(token) => token,
                None => return fail(&"the identity has already been released"),
            };

            let shell = env::var("ComSpec").unwrap_or_else(|_| DEFAULT_SHELL.to_string());
            let command_line = windows_command_line(&spec.executable, &spec.arguments, &shell);
            tracing::debug!(%command_line, "creating process");

            let environment = match win32::environment_block(token, spec.inherit_environment) {
                Ok(environment) => environment,
                Err(e) => return fail(&e),
            };
            let (stdout_pipe, stderr_pipe) = match (InheritablePipe::new(), InheritablePipe::new())
            {
                (Ok(stdout), Ok(stderr)) => (stdout, stderr),
                (Err(e), _) | (_, Err(e)) => return fail(&e),
            };

            let request = LaunchRequest {
                command_line: &command_line,
                working_directory: spec.working_directory.as_deref(),
                environment: &environment,
                stdout: &stdout_pipe.write,
                stderr: &stderr_pipe.write,
            };

            let mut fallback = false;
            let process = match win32::create_process_as_user(token, &request) {
                Ok(process) => process,
                Err(e) if win32::is_privilege_not_held(&e) => {
                    tracing::debug!("primary token privilege not held, using secondary logon");
                    fallback = true;
                    match win32::create_process_with_logon(
                        &identity.user,
                        identity.domain.as_deref(),
                        &identity.password,
                        &request,
                    ) {
                        Ok(process) => process,
                        Err(e) => return fail(&e),
                    }
                }
                Err(e) => return fail(&format!("CreateProcessAsUserW: {}", e)),
            };

            // Our copies of the write ends must go for the readers to see EOF
            let InheritablePipe { read: stdout_read, write: stdout_write } = stdout_pipe;
            let InheritablePipe { read: stderr_read, write: stderr_write } = stderr_pipe;
            drop(stdout_write);
            drop(stderr_write);

            let job = match attach_job(&process, fallback) {
                Ok(job) => job,
                Err(e) => {
                    win32::terminate_process(process.process.as_raw(), 1);
                    return fail(&e);
                }
            };

            register_child(process.process.as_raw(), job.as_ref().map(Job::as_raw));
            if let Err(e) = process.resume() {
                clear_child();
                win32::terminate_process(process.process.as_raw(), 1);
                return fail(&e);
            }
            tracing::debug!(pid = process.pid, "child started");

            let relays = system_relays(stdout_read, stderr_read);
            let status = process.wait();
            clear_child();
            // Closing the job ends any descendants still holding the pipes
            drop(job);
            let (stdout_output, stderr_output) =
                relays.finish(Duration::from_millis(RELAY_DRAIN_MS));

            match status {
                // Exit codes are 32-bit; keep every bit
                Ok(code) => LaunchResult::exited(code as i32, stdout_output, stderr_output),
                Err(e) => fail(&format!("error waiting for command: {}", e)),
            }
        }
    }

    /// Put the suspended child into a kill-on-close job
    ///
    /// Processes from the secondary logon service may already sit in a job
    /// that forbids nesting; there the job is skipped.
    fn attach_job(process: &ProcessInfo, best_effort: bool) -> std::io::Result<Option<Job>> {
        let attached = Job::kill_on_close().and_then(|job| job.assign(process).map(|_| job));
        match attached {
            Ok(job) => Ok(Some(job)),
            Err(e) if best_effort => {
                tracing::debug!(error = %e, "running without a job object");
                Ok(None)
            }
            Err(e) => Err(e),
        }
    }
}
