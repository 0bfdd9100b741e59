//! Signal handling that takes the supervised child down with runas
//!
//! When runas is interrupted by SIGINT (Ctrl+C), SIGTERM (kill) or SIGHUP
//! (terminal close), the registered child gets SIGTERM, a grace period to
//! exit, then SIGKILL. runas then exits with 128 + signal number.
//!
//! On Windows a console control handler terminates the child's job object
//! and lets the default handler end runas.

use std::sync::atomic::Ordering;

/// Time the child gets to exit after SIGTERM
pub const GRACE_PERIOD_MS: u64 = 2000;

pub use platform::{clear_child, register_child, registered_child, setup_signal_handlers};

#[cfg(unix)]
mod platform {
    use super::*;
    use std::sync::atomic::AtomicI32;

    /// Pid of the running child, 0 when none
    static CHILD_PID: AtomicI32 = AtomicI32::new(0);

    const POLL_INTERVAL_MS: u64 = 50;

    /// Set up signal handlers for child cleanup on interruption
    pub fn setup_signal_handlers() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| unsafe {
            // SIGINT (Ctrl+C) - exit code 130 (128 + 2)
            libc::signal(libc::SIGINT, handle_signal as libc::sighandler_t);
            // SIGTERM (kill command) - exit code 143 (128 + 15)
            libc::signal(libc::SIGTERM, handle_signal as libc::sighandler_t);
            // SIGHUP (terminal closed) - exit code 129 (128 + 1)
            libc::signal(libc::SIGHUP, handle_signal as libc::sighandler_t);
        });
    }

    /// Register the child to terminate on interruption
    pub fn register_child(pid: u32) {
        CHILD_PID.store(pid as i32, Ordering::SeqCst);
    }

    /// Forget the child (call once it has been reaped)
    pub fn clear_child() {
        CHILD_PID.store(0, Ordering::SeqCst);
    }

    pub fn registered_child() -> Option<u32> {
        match CHILD_PID.load(Ordering::SeqCst) {
            0 => None,
            pid => Some(pid as u32),
        }
    }

    extern "C" fn handle_signal(sig: libc::c_int) {
        let exit_code = 128 + sig;

        let pid = CHILD_PID.swap(0, Ordering::SeqCst);
        if pid > 0 {
            terminate_child(pid);
        }

        // Only async-signal-safe calls from here on
        unsafe { libc::_exit(exit_code) };
    }

    fn terminate_child(pid: libc::pid_t) {
        let interval = libc::timespec {
            tv_sec: 0,
            tv_nsec: (POLL_INTERVAL_MS * 1_000_000) as libc::c_long,
        };

        unsafe {
            libc::kill(pid, libc::SIGTERM);
            for _ in 0..GRACE_PERIOD_MS / POLL_INTERVAL_MS {
                let mut status: libc::c_int = 0;
                let rc = libc::waitpid(pid, &mut status, libc::WNOHANG);
                if rc == pid || rc < 0 {
                    return;
                }
                libc::nanosleep(&interval, std::ptr::null_mut());
            }
            libc::kill(pid, libc::SIGKILL);
        }
    }
}

#[cfg(windows)]
mod platform {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    use winapi::shared::minwindef::{BOOL, DWORD, FALSE, TRUE};
    use winapi::um::consoleapi::SetConsoleCtrlHandler;
    use winapi::um::winnt::HANDLE;

    use crate::win32;

    /// Raw process handle of the running child, 0 when none
    static CHILD_PROCESS: AtomicUsize = AtomicUsize::new(0);
    /// Raw job handle of the running child, 0 when none
    static CHILD_JOB: AtomicUsize = AtomicUsize::new(0);

    /// Exit code given to a child terminated on interruption
    const INTERRUPTED_EXIT_CODE: u32 = 0xC000_013A;

    pub fn setup_signal_handlers() {
        use std::sync::Once;
        static INIT: Once = Once::new();

        INIT.call_once(|| unsafe {
            SetConsoleCtrlHandler(Some(handle_console_event), TRUE);
        });
    }

    /// Register the child to terminate on interruption
    ///
    /// The handles must stay open until [`clear_child`] is called.
    pub fn register_child(process: HANDLE, job: Option<HANDLE>) {
        CHILD_JOB.store(job.map_or(0, |j| j as usize), Ordering::SeqCst);
        CHILD_PROCESS.store(process as usize, Ordering::SeqCst);
    }

    /// Forget the child (call before its handles are closed)
    pub fn clear_child() {
        CHILD_PROCESS.store(0, Ordering::SeqCst);
        CHILD_JOB.store(0, Ordering::SeqCst);
    }

    pub fn registered_child() -> Option<HANDLE> {
        match CHILD_PROCESS.load(Ordering::SeqCst) {
            0 => None,
            raw => Some(raw as HANDLE),
        }
    }

    unsafe extern "system" fn handle_console_event(ctrl_type: DWORD) -> BOOL {
        tracing::debug!(ctrl_type, "console control event");

        let job = CHILD_JOB.swap(0, Ordering::SeqCst);
        let process = CHILD_PROCESS.swap(0, Ordering::SeqCst);
        if job != 0 {
            win32::terminate_job(job as HANDLE, INTERRUPTED_EXIT_CODE);
        } else if process != 0 {
            win32::terminate_process(process as HANDLE, INTERRUPTED_EXIT_CODE);
        }

        // Let the default handler end runas
        FALSE
    }
}
