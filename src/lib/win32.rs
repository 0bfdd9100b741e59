//! Win32 bindings for logon tokens, process creation and job objects
//!
//! Every raw handle is owned by a wrapper that closes it on drop.

use std::ffi::OsStr;
use std::io::{Error as IoError, Result as IoResult};
use std::os::windows::ffi::OsStrExt;
use std::ptr::{null, null_mut};

use winapi::shared::minwindef::{BOOL, DWORD, FALSE, LPVOID, TRUE};
use winapi::shared::winerror::{
    ERROR_BROKEN_PIPE, ERROR_INSUFFICIENT_BUFFER, ERROR_PRIVILEGE_NOT_HELD,
};
use winapi::um::errhandlingapi::GetLastError;
use winapi::um::fileapi::ReadFile;
use winapi::um::handleapi::{CloseHandle, SetHandleInformation, INVALID_HANDLE_VALUE};
use winapi::um::jobapi2::{
    AssignProcessToJobObject, CreateJobObjectW, SetInformationJobObject, TerminateJobObject,
};
use winapi::um::minwinbase::SECURITY_ATTRIBUTES;
use winapi::um::namedpipeapi::CreatePipe;
use winapi::um::processenv::GetStdHandle;
use winapi::um::processthreadsapi::{
    CreateProcessAsUserW, GetCurrentProcess, GetExitCodeProcess, OpenProcessToken, ResumeThread,
    TerminateProcess, PROCESS_INFORMATION, STARTUPINFOW,
};
use winapi::um::securitybaseapi::{CheckTokenMembership, CreateWellKnownSid, GetTokenInformation};
use winapi::um::synchapi::WaitForSingleObject;
use winapi::um::userenv::{CreateEnvironmentBlock, DestroyEnvironmentBlock};
use winapi::um::winbase::{
    LogonUserW, CREATE_SUSPENDED, CREATE_UNICODE_ENVIRONMENT, HANDLE_FLAG_INHERIT, INFINITE,
    LOGON32_LOGON_INTERACTIVE, LOGON32_PROVIDER_DEFAULT, STARTF_USESTDHANDLES, STD_INPUT_HANDLE,
    WAIT_FAILED,
};
use winapi::um::winnt::{
    JobObjectExtendedLimitInformation, TokenGroups, WinBuiltinAdministratorsSid, HANDLE,
    JOBOBJECT_EXTENDED_LIMIT_INFORMATION, JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE, LPCWSTR, LPWSTR,
    SE_GROUP_LOGON_ID, SID_AND_ATTRIBUTES, TOKEN_GROUPS, TOKEN_QUERY,
};
use winapi::um::wow64apiset::IsWow64Process;

use crate::errors::os_error_with_context;
use crate::secret::SecretString;

/// `dwLogonFlags` value that loads the user's profile
const LOGON_WITH_PROFILE: DWORD = 0x0000_0001;

/// Large enough for any SID
const MAX_SID_SIZE: usize = 68;

#[link(name = "advapi32")]
extern "system" {
    fn CreateProcessWithLogonW(
        lpUsername: LPCWSTR,
        lpDomain: LPCWSTR,
        lpPassword: LPCWSTR,
        dwLogonFlags: DWORD,
        lpApplicationName: LPCWSTR,
        lpCommandLine: LPWSTR,
        dwCreationFlags: DWORD,
        lpEnvironment: LPVOID,
        lpCurrentDirectory: LPCWSTR,
        lpStartupInfo: *mut STARTUPINFOW,
        lpProcessInformation: *mut PROCESS_INFORMATION,
    ) -> BOOL;
}

/// Encode as a null-terminated UTF-16 string
pub fn wide(s: impl AsRef<OsStr>) -> Vec<u16> {
    s.as_ref().encode_wide().chain(std::iter::once(0)).collect()
}

/// An owned kernel handle
#[derive(Debug)]
pub struct Handle(HANDLE);

// Kernel handles may be used from any thread
unsafe impl Send for Handle {}

impl Handle {
    pub fn as_raw(&self) -> HANDLE {
        self.0
    }

    fn is_valid(&self) -> bool {
        !self.0.is_null() && self.0 != INVALID_HANDLE_VALUE
    }
}

impl Drop for Handle {
    fn drop(&mut self) {
        if self.is_valid() {
            unsafe {
                CloseHandle(self.0);
            }
        }
    }
}

/// Log on with a password and return the primary token
pub fn logon_user(user: &str, domain: Option<&str>, password: &SecretString) -> IoResult<Handle> {
    let user = wide(user);
    let domain = domain.map(wide);
    let mut password = wide(password.expose());
    let mut token: HANDLE = null_mut();

    let res = unsafe {
        LogonUserW(
            user.as_ptr(),
            domain.as_ref().map_or(null(), |d| d.as_ptr()),
            password.as_ptr(),
            LOGON32_LOGON_INTERACTIVE,
            LOGON32_PROVIDER_DEFAULT,
            &mut token,
        )
    };
    let result = if res == 0 {
        Err(os_error_with_context("LogonUserW", IoError::last_os_error()))
    } else {
        Ok(Handle(token))
    };

    wipe(&mut password);
    result
}

fn wipe(buf: &mut [u16]) {
    for unit in buf.iter_mut() {
        unsafe { std::ptr::write_volatile(unit, 0) };
    }
}

/// Read end of an anonymous pipe
pub struct PipeReader(Handle);

impl std::io::Read for PipeReader {
    fn read(&mut self, buf: &mut [u8]) -> IoResult<usize> {
        let mut num_read: DWORD = 0;
        let ok = unsafe {
            ReadFile(
                self.0.as_raw(),
                buf.as_mut_ptr() as *mut _,
                buf.len() as DWORD,
                &mut num_read,
                null_mut(),
            )
        };
        if ok == 0 {
            // The writer closing its end is the normal end of stream
            if unsafe { GetLastError() } == ERROR_BROKEN_PIPE {
                return Ok(0);
            }
            return Err(os_error_with_context("ReadFile", IoError::last_os_error()));
        }
        Ok(num_read as usize)
    }
}

/// An anonymous pipe whose write end is inherited by the child
pub struct InheritablePipe {
    pub read: PipeReader,
    pub write: Handle,
}

impl InheritablePipe {
    pub fn new() -> IoResult<Self> {
        let mut sa = SECURITY_ATTRIBUTES {
            nLength: std::mem::size_of::<SECURITY_ATTRIBUTES>() as DWORD,
            lpSecurityDescriptor: null_mut(),
            bInheritHandle: TRUE,
        };
        let mut read: HANDLE = INVALID_HANDLE_VALUE;
        let mut write: HANDLE = INVALID_HANDLE_VALUE;
        if unsafe { CreatePipe(&mut read, &mut write, &mut sa, 0) } == 0 {
            return Err(os_error_with_context("CreatePipe", IoError::last_os_error()));
        }
        let read = Handle(read);
        let write = Handle(write);

        // Only the write end goes to the child
        if unsafe { SetHandleInformation(read.as_raw(), HANDLE_FLAG_INHERIT, 0) } == 0 {
            return Err(os_error_with_context(
                "SetHandleInformation HANDLE_FLAG_INHERIT",
                IoError::last_os_error(),
            ));
        }

        Ok(Self {
            read: PipeReader(read),
            write,
        })
    }
}

/// Environment block of a user, as a double-null terminated UTF-16 buffer
pub fn environment_block(token: &Handle, inherit: bool) -> IoResult<Vec<u16>> {
    let mut block: LPVOID = null_mut();
    let inherit = if inherit { TRUE } else { FALSE };
    if unsafe { CreateEnvironmentBlock(&mut block, token.as_raw(), inherit) } == 0 {
        return Err(os_error_with_context(
            "CreateEnvironmentBlock",
            IoError::last_os_error(),
        ));
    }

    // key=value\0 ... key=value\0\0
    let env = unsafe {
        let start = block as *const u16;
        let mut len = 0;
        while !(start.add(len).read() == 0 && start.add(len + 1).read() == 0) {
            len += 1;
        }
        std::slice::from_raw_parts(start, len + 2).to_vec()
    };

    unsafe {
        DestroyEnvironmentBlock(block);
    }
    Ok(env)
}

/// Handles of a created process
pub struct ProcessInfo {
    pub process: Handle,
    pub thread: Handle,
    pub pid: DWORD,
}

impl ProcessInfo {
    fn from_raw(pi: PROCESS_INFORMATION) -> Self {
        Self {
            process: Handle(pi.hProcess),
            thread: Handle(pi.hThread),
            pid: pi.dwProcessId,
        }
    }

    /// Resume the primary thread of a process created suspended
    pub fn resume(&self) -> IoResult<()> {
        if unsafe { ResumeThread(self.thread.as_raw()) } == DWORD::MAX {
            Err(os_error_with_context("ResumeThread", IoError::last_os_error()))
        } else {
            Ok(())
        }
    }

    /// Block until the process exits and return its exit code
    pub fn wait(&self) -> IoResult<u32> {
        if unsafe { WaitForSingleObject(self.process.as_raw(), INFINITE) } == WAIT_FAILED {
            return Err(os_error_with_context(
                "WaitForSingleObject(process)",
                IoError::last_os_error(),
            ));
        }
        let mut exit_code: DWORD = 0;
        if unsafe { GetExitCodeProcess(self.process.as_raw(), &mut exit_code) } == 0 {
            return Err(os_error_with_context(
                "GetExitCodeProcess",
                IoError::last_os_error(),
            ));
        }
        Ok(exit_code)
    }
}

/// What to start and how to wire it
pub struct LaunchRequest<'a> {
    pub command_line: &'a str,
    pub working_directory: Option<&'a str>,
    pub environment: &'a [u16],
    pub stdout: &'a Handle,
    pub stderr: &'a Handle,
}

fn startup_info(request: &LaunchRequest) -> STARTUPINFOW {
    let mut si: STARTUPINFOW = unsafe { std::mem::zeroed() };
    si.cb = std::mem::size_of::<STARTUPINFOW>() as DWORD;
    si.dwFlags = STARTF_USESTDHANDLES;
    si.hStdInput = unsafe { GetStdHandle(STD_INPUT_HANDLE) };
    si.hStdOutput = request.stdout.as_raw();
    si.hStdError = request.stderr.as_raw();
    si
}

/// Create a suspended process with `CreateProcessAsUserW`
///
/// Needs SeAssignPrimaryTokenPrivilege, which services usually hold. The
/// error is the raw OS error.
pub fn create_process_as_user(token: &Handle, request: &LaunchRequest) -> IoResult<ProcessInfo> {
    let mut si = startup_info(request);
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let mut command_line = wide(request.command_line);
    let cwd = request.working_directory.map(wide);
    let mut env = request.environment.to_vec();

    let res = unsafe {
        CreateProcessAsUserW(
            token.as_raw(),
            null(),
            command_line.as_mut_ptr(),
            null_mut(),
            null_mut(),
            TRUE,
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            env.as_mut_ptr() as LPVOID,
            cwd.as_ref().map_or(null(), |c| c.as_ptr()),
            &mut si,
            &mut pi,
        )
    };
    if res == 0 {
        // Left without context so the caller can test for a missing privilege
        Err(IoError::last_os_error())
    } else {
        Ok(ProcessInfo::from_raw(pi))
    }
}

/// Whether an error from [`create_process_as_user`] means the caller lacks
/// the privilege to assign a primary token
pub fn is_privilege_not_held(err: &IoError) -> bool {
    err.raw_os_error() == Some(ERROR_PRIVILEGE_NOT_HELD as i32)
}

/// Create a suspended process with `CreateProcessWithLogonW`
///
/// Works for ordinary accounts through the secondary logon service.
pub fn create_process_with_logon(
    user: &str,
    domain: Option<&str>,
    password: &SecretString,
    request: &LaunchRequest,
) -> IoResult<ProcessInfo> {
    let mut si = startup_info(request);
    let mut pi: PROCESS_INFORMATION = unsafe { std::mem::zeroed() };
    let user = wide(user);
    let domain = domain.map(wide);
    let mut password = wide(password.expose());
    let mut command_line = wide(request.command_line);
    let cwd = request.working_directory.map(wide);
    let mut env = request.environment.to_vec();

    let res = unsafe {
        CreateProcessWithLogonW(
            user.as_ptr(),
            domain.as_ref().map_or(null(), |d| d.as_ptr()),
            password.as_ptr(),
            LOGON_WITH_PROFILE,
            null(),
            command_line.as_mut_ptr(),
            CREATE_SUSPENDED | CREATE_UNICODE_ENVIRONMENT,
            env.as_mut_ptr() as LPVOID,
            cwd.as_ref().map_or(null(), |c| c.as_ptr()),
            &mut si,
            &mut pi,
        )
    };
    let result = if res == 0 {
        Err(os_error_with_context(
            "CreateProcessWithLogonW",
            IoError::last_os_error(),
        ))
    } else {
        Ok(ProcessInfo::from_raw(pi))
    };

    wipe(&mut password);
    result
}

/// A job object that kills its processes when the last handle closes
pub struct Job(Handle);

impl Job {
    pub fn kill_on_close() -> IoResult<Self> {
        let job = unsafe { CreateJobObjectW(null_mut(), null()) };
        if job.is_null() {
            return Err(os_error_with_context(
                "CreateJobObjectW",
                IoError::last_os_error(),
            ));
        }
        let job = Job(Handle(job));

        let mut info: JOBOBJECT_EXTENDED_LIMIT_INFORMATION = unsafe { std::mem::zeroed() };
        info.BasicLimitInformation.LimitFlags = JOB_OBJECT_LIMIT_KILL_ON_JOB_CLOSE;
        let res = unsafe {
            SetInformationJobObject(
                job.0.as_raw(),
                JobObjectExtendedLimitInformation,
                &mut info as *mut _ as LPVOID,
                std::mem::size_of::<JOBOBJECT_EXTENDED_LIMIT_INFORMATION>() as DWORD,
            )
        };
        if res == 0 {
            return Err(os_error_with_context(
                "SetInformationJobObject",
                IoError::last_os_error(),
            ));
        }
        Ok(job)
    }

    pub fn assign(&self, process: &ProcessInfo) -> IoResult<()> {
        if unsafe { AssignProcessToJobObject(self.0.as_raw(), process.process.as_raw()) } == 0 {
            Err(os_error_with_context(
                "AssignProcessToJobObject",
                IoError::last_os_error(),
            ))
        } else {
            Ok(())
        }
    }

    pub fn as_raw(&self) -> HANDLE {
        self.0.as_raw()
    }
}

/// Terminate every process of a job given its raw handle
pub fn terminate_job(job: HANDLE, exit_code: u32) -> bool {
    unsafe { TerminateJobObject(job, exit_code) != 0 }
}

/// Terminate a process given its raw handle
pub fn terminate_process(process: HANDLE, exit_code: u32) -> bool {
    unsafe { TerminateProcess(process, exit_code) != 0 }
}

fn current_process_token() -> IoResult<Handle> {
    let mut token: HANDLE = null_mut();
    if unsafe { OpenProcessToken(GetCurrentProcess(), TOKEN_QUERY, &mut token) } == 0 {
        return Err(os_error_with_context(
            "OpenProcessToken(GetCurrentProcess)",
            IoError::last_os_error(),
        ));
    }
    Ok(Handle(token))
}

/// Whether the current process token carries a logon SID
///
/// Interactive sessions have one; services running under a service account
/// do not.
pub fn has_logon_sid() -> IoResult<bool> {
    let token = current_process_token()?;

    let mut size: DWORD = 0;
    let err = unsafe {
        GetTokenInformation(token.as_raw(), TokenGroups, null_mut(), 0, &mut size);
        GetLastError()
    };
    if err != ERROR_INSUFFICIENT_BUFFER {
        return Err(os_error_with_context(
            "GetTokenInformation TokenGroups unexpected failure",
            IoError::last_os_error(),
        ));
    }

    // u64 storage keeps TOKEN_GROUPS suitably aligned
    let mut data = vec![0u64; (size as usize + 7) / 8];
    if unsafe {
        GetTokenInformation(
            token.as_raw(),
            TokenGroups,
            data.as_mut_ptr() as LPVOID,
            size,
            &mut size,
        )
    } == 0
    {
        return Err(os_error_with_context(
            "GetTokenInformation TokenGroups",
            IoError::last_os_error(),
        ));
    }

    let groups = unsafe {
        let groups = &*(data.as_ptr() as *const TOKEN_GROUPS);
        std::slice::from_raw_parts(
            groups.Groups.as_ptr() as *const SID_AND_ATTRIBUTES,
            groups.GroupCount as usize,
        )
    };
    Ok(groups
        .iter()
        .any(|g| g.Attributes & SE_GROUP_LOGON_ID == SE_GROUP_LOGON_ID))
}

/// Whether the current user is a member of the builtin administrators group
pub fn is_administrator() -> IoResult<bool> {
    let mut sid = [0u8; MAX_SID_SIZE];
    let mut size = MAX_SID_SIZE as DWORD;
    if unsafe {
        CreateWellKnownSid(
            WinBuiltinAdministratorsSid,
            null_mut(),
            sid.as_mut_ptr() as *mut _,
            &mut size,
        )
    } == 0
    {
        return Err(os_error_with_context(
            "CreateWellKnownSid(Administrators)",
            IoError::last_os_error(),
        ));
    }

    let mut is_member: BOOL = FALSE;
    if unsafe { CheckTokenMembership(null_mut(), sid.as_mut_ptr() as *mut _, &mut is_member) } == 0
    {
        return Err(os_error_with_context(
            "CheckTokenMembership",
            IoError::last_os_error(),
        ));
    }
    Ok(is_member != FALSE)
}

/// Whether the operating system is 64-bit
pub fn is_64bit_os() -> bool {
    if cfg!(target_pointer_width = "64") {
        return true;
    }
    let mut wow64: BOOL = FALSE;
    unsafe { IsWow64Process(GetCurrentProcess(), &mut wow64) != 0 && wow64 != FALSE }
}
