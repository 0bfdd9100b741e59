//! Unix account database lookups and privilege switching
//!
//! Uses the reentrant `getpwnam_r` so lookups are safe from any thread.

use std::ffi::{CStr, CString};
use std::io;
use std::os::unix::process::CommandExt;
use std::process::Command;

use crate::errors::os_error_with_context;

/// Upper bound for the `getpwnam_r` scratch buffer
const MAX_PASSWD_BUFFER: usize = 1 << 20;

/// PATH given to a child whose environment is not inherited
pub const DEFAULT_PATH: &str = "/usr/local/sbin:/usr/local/bin:/usr/sbin:/usr/bin:/sbin:/bin";

/// An entry of the account database
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
    pub home: String,
    pub shell: String,
}

fn c_string_lossy(ptr: *const libc::c_char) -> String {
    if ptr.is_null() {
        return String::new();
    }
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}

/// Look up an account by name
///
/// Returns `Ok(None)` when no such account exists.
pub fn lookup(name: &str) -> io::Result<Option<Account>> {
    let c_name = match CString::new(name) {
        Ok(c_name) => c_name,
        Err(_) => return Ok(None),
    };

    let mut buf: Vec<libc::c_char> = vec![0; 1024];
    loop {
        let mut pwd: libc::passwd = unsafe { std::mem::zeroed() };
        let mut result: *mut libc::passwd = std::ptr::null_mut();
        let rc = unsafe {
            libc::getpwnam_r(
                c_name.as_ptr(),
                &mut pwd,
                buf.as_mut_ptr(),
                buf.len(),
                &mut result,
            )
        };

        if rc == libc::ERANGE && buf.len() < MAX_PASSWD_BUFFER {
            let len = buf.len() * 2;
            buf.resize(len, 0);
            continue;
        }

        // Some libcs report a missing entry through errno
        if result.is_null() {
            return match rc {
                0 | libc::ENOENT | libc::ESRCH | libc::EBADF | libc::EPERM => Ok(None),
                errno => Err(os_error_with_context(
                    "getpwnam_r",
                    io::Error::from_raw_os_error(errno),
                )),
            };
        }

        return Ok(Some(Account {
            name: c_string_lossy(pwd.pw_name),
            uid: pwd.pw_uid,
            gid: pwd.pw_gid,
            home: c_string_lossy(pwd.pw_dir),
            shell: c_string_lossy(pwd.pw_shell),
        }));
    }
}

pub fn effective_uid() -> libc::uid_t {
    unsafe { libc::geteuid() }
}

/// Supplementary groups of an account, including its primary group
#[cfg(target_os = "linux")]
pub fn supplementary_groups(account: &Account) -> io::Result<Vec<libc::gid_t>> {
    let c_name = CString::new(account.name.as_str())
        .map_err(|e| io::Error::new(io::ErrorKind::InvalidInput, e))?;

    let mut count: libc::c_int = 32;
    loop {
        let mut groups: Vec<libc::gid_t> = vec![0; count as usize];
        let previous = count;
        let rc = unsafe {
            libc::getgrouplist(c_name.as_ptr(), account.gid, groups.as_mut_ptr(), &mut count)
        };
        if rc >= 0 {
            groups.truncate(count as usize);
            return Ok(groups);
        }
        // `count` now holds the required size
        if count <= previous {
            count = previous * 2;
        }
    }
}

#[cfg(not(target_os = "linux"))]
pub fn supplementary_groups(account: &Account) -> io::Result<Vec<libc::gid_t>> {
    Ok(vec![account.gid])
}

/// Make `command` drop to `account` in the child before exec
///
/// The caller must be root. Groups are set first, then the gid, then the uid.
pub fn switch_account(command: &mut Command, account: &Account, groups: Vec<libc::gid_t>) {
    let uid = account.uid;
    let gid = account.gid;
    unsafe {
        command.pre_exec(move || {
            if libc::setgroups(groups.len() as _, groups.as_ptr()) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setgid(gid) != 0 {
                return Err(io::Error::last_os_error());
            }
            if libc::setuid(uid) != 0 {
                return Err(io::Error::last_os_error());
            }
            Ok(())
        });
    }
}

/// Replace the environment of `command` with a minimal login environment
pub fn reset_environment(command: &mut Command, account: &Account) {
    command
        .env_clear()
        .env("HOME", &account.home)
        .env("USER", &account.name)
        .env("LOGNAME", &account.name)
        .env("SHELL", &account.shell)
        .env("PATH", DEFAULT_PATH);
}
