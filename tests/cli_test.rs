//! End-to-end tests of the runas binary
//!
//! The commands run as the invoking account, which needs no privileges.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use runas_command::{current_user, ErrorKind, DEFAULT_EXIT_CODE_BASE};

/// Run the CLI and capture output
fn run_cli(args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_runas"))
        .args(args)
        .env_remove("RUNAS_TRACE")
        .output()
        .expect("failed to execute runas")
}

fn stdout_of(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

/// Write an executable shell script
fn write_script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{}\n", body)).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn user_flag() -> String {
    format!("-u:{}", current_user())
}

#[test]
fn test_debug_run_as_current_user() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "command.cmd", "echo Hello from command");
    let script = script.to_string_lossy();

    let output = run_cli(&[&user_flag(), "-p:aaa", "-l:debug", &script]);
    let stdout = stdout_of(&output);

    assert_eq!(output.status.code(), Some(0), "stdout:\n{}", stdout);
    let header = stdout.find("JetBrains RunAs").expect("header line");
    let settings = stdout.find("Settings:").expect("settings section");
    let child = stdout.find("Hello from command").expect("child output");
    let summary = stdout.find("RunAs finished").expect("summary");
    assert!(header < settings && settings < child && child < summary);
    assert!(!stdout.contains("-p:aaa"));
}

#[test]
fn test_unknown_user_reports_authentication_failure() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "command.cmd", "echo should not run");
    let script = script.to_string_lossy();

    let output = run_cli(&[
        "-u:SomeAsTestUser",
        "-p:SomePassword",
        "-l:debug",
        &script,
    ]);
    let stdout = stdout_of(&output);

    assert_eq!(
        output.status.code(),
        Some(ErrorKind::Authentication.exit_code(DEFAULT_EXIT_CODE_BASE))
    );
    assert!(stdout.contains("JetBrains RunAs"));
    assert!(stdout.contains("Settings:"));
    assert!(stdout.contains("RunAs failed"));
    assert!(!stdout.contains("should not run"));
    assert!(!stdout.contains("SomePassword"));
}

#[test]
fn test_single_letter_password_keeps_header_readable() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "command.cmd", "echo Hello");
    let script = script.to_string_lossy();

    let output = run_cli(&[&user_flag(), "-p:a", "-l:debug", &script]);
    let stdout = stdout_of(&output);

    assert_eq!(output.status.code(), Some(0), "stdout:\n{}", stdout);
    assert!(stdout.contains("JetBrains RunAs"));
    assert!(stdout.contains("Settings:"));
    assert!(stdout.contains("Password:"));
    assert!(stdout.contains("exit code: 0"));
}

#[test]
fn test_exit_code_is_propagated() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "fail.sh", "echo failing >&2\nexit 3");
    let script = script.to_string_lossy();

    let output = run_cli(&[&user_flag(), "-p:unused-pw", &script]);

    assert_eq!(output.status.code(), Some(3));
    assert!(String::from_utf8_lossy(&output.stderr).contains("failing"));
}

#[test]
fn test_quiet_prints_only_child_output() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "hello.sh", "echo hi");
    let script = script.to_string_lossy();

    let output = run_cli(&[&user_flag(), "-p:unused-pw", "-l:quiet", &script]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_of(&output), "hi\n");
}

#[test]
fn test_arguments_reach_the_command() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(
        dir.path(),
        "args.sh",
        "for a in \"$@\"; do echo \"[$a]\"; done",
    );
    let script = script.to_string_lossy();

    let output = run_cli(&[
        &user_flag(),
        "-p:unused-pw",
        "-l:quiet",
        &script,
        "-u:not-a-flag",
        "two words",
    ]);

    assert_eq!(stdout_of(&output), "[-u:not-a-flag]\n[two words]\n");
}

#[test]
fn test_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "pwd.sh", "pwd");
    let script = script.to_string_lossy();
    let work = dir.path().canonicalize().unwrap();
    let work_flag = format!("-w:{}", work.display());

    let output = run_cli(&[&user_flag(), "-p:unused-pw", "-l:quiet", &work_flag, &script]);

    assert_eq!(stdout_of(&output).trim(), work.to_string_lossy());
}

#[test]
fn test_missing_command_is_an_argument_error() {
    let output = run_cli(&["-u:bob", "-p:unused-pw"]);
    assert_eq!(
        output.status.code(),
        Some(ErrorKind::Argument.exit_code(DEFAULT_EXIT_CODE_BASE))
    );
    assert!(stdout_of(&output).contains("no command"));
}

#[test]
fn test_missing_executable_is_a_creation_error() {
    let output = run_cli(&[&user_flag(), "-p:unused-pw", "/definitely/not/here"]);
    assert_eq!(
        output.status.code(),
        Some(ErrorKind::ProcessCreation.exit_code(DEFAULT_EXIT_CODE_BASE))
    );
}

#[test]
fn test_argument_file_supplies_credentials() {
    let dir = tempfile::tempdir().unwrap();
    let script = write_script(dir.path(), "hello.sh", "echo from args file");
    let args_file = dir.path().join("run.args");
    fs::write(&args_file, format!("{}\n-p:secret\n-l:quiet\n", user_flag())).unwrap();
    let c_flag = format!("-c:{}", args_file.display());

    let output = run_cli(&[&c_flag, &script.to_string_lossy()]);

    assert_eq!(output.status.code(), Some(0));
    assert_eq!(stdout_of(&output), "from args file\n");
}

#[test]
fn test_help_and_version() {
    let help = run_cli(&["--help"]);
    assert_eq!(help.status.code(), Some(0));
    assert!(stdout_of(&help).contains("Usage: runas"));

    let version = run_cli(&["--version"]);
    assert_eq!(version.status.code(), Some(0));
    assert!(stdout_of(&version).contains(env!("CARGO_PKG_VERSION")));

    let empty = run_cli(&[]);
    assert_eq!(empty.status.code(), Some(0));
    assert!(stdout_of(&empty).contains("Usage: runas"));
}
