use core::ops::BitOr;

use crate::environment::Variables;

/// Desktop every child is attached to.
pub const DEFAULT_DESKTOP: &str = "winsta0\\default";

/// Working directory used when the user's environment gives no better choice.
pub const FALLBACK_WORKING_DIRECTORY: &str = "C:\\Windows\\System32";

/// `dwCreationFlags` bits for `CreateProcessAsUserW`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct CreationFlags(pub u32);

impl CreationFlags {
    pub const DebugProcess: CreationFlags = CreationFlags(0x0000_0001);

    pub const DebugOnlyThisProcess: CreationFlags = CreationFlags(0x0000_0002);

    pub const CreateSuspended: CreationFlags = CreationFlags(0x0000_0004);

    /// The child gets its own console instead of inheriting ours.
    pub const CreateNewConsole: CreationFlags = CreationFlags(0x0000_0010);

    pub const CreateNewProcessGroup: CreationFlags = CreationFlags(0x0000_0200);

    /// `lpEnvironment` is UTF-16, as `CreateEnvironmentBlock` produces.
    pub const CreateUnicodeEnvironment: CreationFlags = CreationFlags(0x0000_0400);

    pub const CreateSeparateWowVdm: CreationFlags = CreationFlags(0x0000_0800);

    pub const CreateSharedWowVdm: CreationFlags = CreationFlags(0x0000_1000);

    pub const CreateProtectedProcess: CreationFlags = CreationFlags(0x0004_0000);

    pub const CreateBreakawayFromJob: CreationFlags = CreationFlags(0x0100_0000);

    pub const CreatePreserveCodeAuthzLevel: CreationFlags = CreationFlags(0x0200_0000);

    pub const CreateDefaultErrorMode: CreationFlags = CreationFlags(0x0400_0000);

    pub const CreateNoWindow: CreationFlags = CreationFlags(0x0800_0000);

    /// Flags used by [`launch`]: a Unicode environment always, and a new
    /// console only when output is not redirected.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let flags = CreationFlags::for_launch(true);
    /// assert!(!flags.contains(CreationFlags::CreateNewConsole));
    /// ```
    pub fn for_launch(redirect: bool) -> Self {
        if redirect {
            CreationFlags::CreateUnicodeEnvironment
        } else {
            CreationFlags::CreateUnicodeEnvironment | CreationFlags::CreateNewConsole
        }
    }

    /// Checks if the current [`CreationFlags`] includes every bit of `other`.
    pub fn contains(self, other: CreationFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for CreationFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        CreationFlags(self.0 | rhs.0)
    }
}

/// `STARTUPINFOW::dwFlags` bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(transparent)]
pub struct StartupFlags(pub u32);

impl StartupFlags {
    /// `wShowWindow` is honoured.
    pub const UseShowWindow: StartupFlags = StartupFlags(0x0000_0001);

    /// `hStdInput`, `hStdOutput` and `hStdError` are honoured.
    pub const UseStdHandles: StartupFlags = StartupFlags(0x0000_0100);

    /// Startup flags used by [`launch`], redirected or not.
    pub fn for_launch() -> Self {
        StartupFlags::UseStdHandles | StartupFlags::UseShowWindow
    }

    pub fn contains(self, other: StartupFlags) -> bool {
        (self.0 & other.0) == other.0
    }
}

impl BitOr for StartupFlags {
    type Output = Self;

    fn bitor(self, rhs: Self) -> Self::Output {
        StartupFlags(self.0 | rhs.0)
    }
}

/// Initial visibility of the child's main window (`SW_*`).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
#[repr(u16)]
pub enum WindowStyle {
    #[default]
    Hidden = 0,
    Normal = 1,
    Minimized = 2,
    Maximized = 3,
}

/// What to launch and how.
///
/// At least one of `application` and `command_line` must be set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
#[cfg_attr(not(windows), allow(dead_code))]
pub struct LaunchOptions {
    application: Option<String>,
    command_line: Option<String>,
    working_directory: Option<String>,
    window: WindowStyle,
    redirect: bool,
}

impl LaunchOptions {
    /// Options that run `command_line`, resolved through the user's `PATH`.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let options = LaunchOptions::new("cmd.exe /c whoami").redirect(true);
    /// ```
    pub fn new(command_line: impl Into<String>) -> Self {
        Self {
            command_line: Some(command_line.into()),
            ..Default::default()
        }
    }

    /// Explicit path of the executable; the command line is then passed as its arguments.
    pub fn application(mut self, path: impl Into<String>) -> Self {
        self.application = Some(path.into());
        self
    }

    pub fn command_line(mut self, command_line: impl Into<String>) -> Self {
        self.command_line = Some(command_line.into());
        self
    }

    /// Overrides the default working directory (see [`default_working_directory`]).
    pub fn working_directory(mut self, dir: impl Into<String>) -> Self {
        self.working_directory = Some(dir.into());
        self
    }

    pub fn window(mut self, window: WindowStyle) -> Self {
        self.window = window;
        self
    }

    /// Captures standard output and error instead of giving the child a console.
    pub fn redirect(mut self, redirect: bool) -> Self {
        self.redirect = redirect;
        self
    }

    pub fn is_redirected(&self) -> bool {
        self.redirect
    }

    pub fn creation_flags(&self) -> CreationFlags {
        CreationFlags::for_launch(self.redirect)
    }

    pub fn startup_flags(&self) -> StartupFlags {
        StartupFlags::for_launch()
    }

    /// The directory the child starts in, given the user's environment.
    pub fn resolve_working_directory(&self, environment: &Variables) -> String {
        match &self.working_directory {
            Some(dir) => dir.clone(),
            None => default_working_directory(environment),
        }
    }
}

/// `USERPROFILE`, else `%SystemRoot%\System32`, else [`FALLBACK_WORKING_DIRECTORY`].
pub fn default_working_directory(environment: &Variables) -> String {
    if let Some(profile) = environment.get("USERPROFILE").filter(|dir| !dir.is_empty()) {
        return profile.to_owned();
    }

    match environment.get("SystemRoot").filter(|dir| !dir.is_empty()) {
        Some(root) => format!("{}\\System32", root.trim_end_matches('\\')),
        None => FALLBACK_WORKING_DIRECTORY.to_owned(),
    }
}

#[cfg(windows)]
pub use self::launcher::*;

#[cfg(windows)]
mod launcher {
    use super::{LaunchOptions, DEFAULT_DESKTOP};
    use crate::{
        environment::EnvironmentBlock,
        error::{last_error, Error, Result},
        handle::KernelHandle,
        output::LaunchResult,
        pipe::{drain_concurrently, inheritance_guard, Pipe},
        token::PrimaryToken,
    };
    use core::{
        mem::zeroed,
        ptr::{null, null_mut},
    };
    use std::{ffi::OsStr, os::windows::ffi::OsStrExt};
    use windows_sys::Win32::{
        Foundation::{FALSE, WAIT_FAILED},
        System::Threading::{
            CreateProcessAsUserW, GetExitCodeProcess, WaitForSingleObject, INFINITE,
            PROCESS_INFORMATION, STARTUPINFOW,
        },
    };

    /// Launches a process as the user of `token` and waits for it to exit.
    ///
    /// With redirection, both output pipes are drained on their own threads
    /// while this thread waits, so a child that fills one pipe before
    /// writing to the other cannot deadlock the call.
    ///
    /// # Parameters
    ///
    /// * `token` - A primary token from [`crate::resolve_user_token`].
    /// * `options` - What to run, and whether to capture its output.
    ///
    /// # Returns
    ///
    /// * `Ok(LaunchResult)` - Process and thread ids, exit code, and the
    ///   captured text when redirecting.
    /// * `Err(Error)` - `PipeSetupFailed`, `EnvironmentBlockFailed`,
    ///   `ProcessCreationFailed` or `ProcessWaitFailed`. Every handle
    ///   acquired before the failure is closed.
    ///
    /// # Example
    ///
    /// ```rust,ignore
    /// let token = resolve_user_token(SessionSelector::ActiveConsole, false)?;
    /// let result = launch(&token, &LaunchOptions::new("cmd.exe /c whoami").redirect(true))?;
    /// print!("{}", result.stdout.unwrap_or_default());
    /// ```
    pub fn launch(token: &PrimaryToken, options: &LaunchOptions) -> Result<LaunchResult> {
        // While held, no other launch can create a child that inherits handles,
        // so our inheritable write ends reach only our child.
        let inheritance = options.redirect.then(inheritance_guard);

        // Pipes come first so a pipe failure aborts before anything else is allocated.
        let pipes = if options.redirect {
            Some((Pipe::create()?, Pipe::create()?))
        } else {
            None
        };

        let environment = EnvironmentBlock::create(token)?;
        let working_directory = options.resolve_working_directory(&environment.variables());

        let mut desktop = DEFAULT_DESKTOP.to_pwstr();
        let application = options.application.as_deref().map(|app| app.to_pwstr());
        let mut command_line = options.command_line.as_deref().map(|cmd| cmd.to_pwstr());
        let current_dir = working_directory.as_str().to_pwstr();

        let (h_stdout, h_stderr) = match &pipes {
            Some((out, err)) => (out.write_end().as_raw(), err.write_end().as_raw()),
            None => (null_mut(), null_mut()),
        };

        let flags = options.creation_flags();
        let si = STARTUPINFOW {
            cb: size_of::<STARTUPINFOW>() as u32,
            lpDesktop: desktop.as_mut_ptr(),
            dwFlags: options.startup_flags().0,
            wShowWindow: options.window as u16,
            hStdOutput: h_stdout,
            hStdError: h_stderr,
            ..unsafe { zeroed() }
        };
        let mut pi = unsafe { zeroed::<PROCESS_INFORMATION>() };

        tracing::debug!(
            application = ?options.application,
            command_line = ?options.command_line,
            %working_directory,
            flags = flags.0,
            redirect = options.redirect,
            "creating process as user"
        );

        let created = unsafe {
            CreateProcessAsUserW(
                token.as_raw(),
                application.as_ref().map_or(null(), |app| app.as_ptr()),
                command_line.as_mut().map_or(null_mut(), |cmd| cmd.as_mut_ptr()),
                null(),
                null(),
                options.redirect as i32,
                flags.0,
                environment.as_raw(),
                current_dir.as_ptr(),
                &si,
                &mut pi,
            )
        };
        let failure = (created == FALSE).then(last_error);

        // The child has its own copy of the environment by now.
        drop(environment);

        // Our write ends must be closed before the lock is released.
        let readers = pipes.map(|(out, err)| (out.into_reader(), err.into_reader()));
        drop(inheritance);

        if let Some(code) = failure {
            return Err(Error::ProcessCreationFailed(code));
        }

        let process = unsafe { KernelHandle::from_raw(pi.hProcess) };
        let thread = unsafe { KernelHandle::from_raw(pi.hThread) };
        tracing::debug!(pid = pi.dwProcessId, tid = pi.dwThreadId, "process created");

        let (exit_code, stdout, stderr) = match readers {
            Some((out, err)) => {
                let (exit_code, stdout, stderr) = drain_concurrently(out, err, || wait_for_exit(&process));
                (exit_code?, Some(stdout), Some(stderr))
            }
            None => (wait_for_exit(&process)?, None, None),
        };

        drop(thread);
        drop(process);

        tracing::debug!(pid = pi.dwProcessId, exit_code, "process exited");
        Ok(LaunchResult {
            process_id: pi.dwProcessId,
            thread_id: pi.dwThreadId,
            exit_code,
            stdout,
            stderr,
        })
    }

    /// Blocks until `process` exits and returns its exit code.
    fn wait_for_exit(process: &KernelHandle) -> Result<u32> {
        if unsafe { WaitForSingleObject(process.as_raw(), INFINITE) } == WAIT_FAILED {
            return Err(Error::ProcessWaitFailed(last_error()));
        }

        let mut exit_code = 0u32;
        if unsafe { GetExitCodeProcess(process.as_raw(), &mut exit_code) } == FALSE {
            return Err(Error::ProcessWaitFailed(last_error()));
        }

        Ok(exit_code)
    }

    trait PWSTR {
        /// Converts a `&str` to a null-terminated UTF-16 wide string, suitable for Windows APIs.
        fn to_pwstr(&self) -> Vec<u16>;
    }

    impl PWSTR for &str {
        fn to_pwstr(&self) -> Vec<u16> {
            OsStr::new(self).encode_wide().chain(std::iter::once(0)).collect()
        }
    }
}
