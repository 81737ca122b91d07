use thiserror::Error;

use crate::session::SessionId;

/// Result alias used across the crate.
pub type Result<T> = core::result::Result<T, Error>;

/// Failures surfaced by the session-to-process pipeline.
///
/// Every variant that originates from a Win32 call carries the raw error code
/// returned by `GetLastError`, so callers can branch on the kind and still
/// report the code verbatim.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum Error {
    /// `WTSEnumerateSessionsW` itself failed.
    #[error("session enumeration failed (Win32 error {0} - 0x{0:08X})")]
    EnumerationFailed(u32),

    /// The session does not exist, or has no user attached.
    #[error("session {0} does not exist")]
    SessionNotFound(SessionId),

    /// No session is attached to the physical console.
    #[error("no active console session found, typically because no user is logged on")]
    NoActiveSession,

    /// No session is owned by the requested user.
    #[error("no session found for user '{0}'")]
    UserNotFound(String),

    /// Querying the session token, or reading information from it, failed.
    #[error("failed to query user token (Win32 error {0} - 0x{0:08X})")]
    TokenQueryFailed(u32),

    /// `DuplicateTokenEx` failed to produce a primary token.
    #[error("failed to duplicate token as primary (Win32 error {0} - 0x{0:08X})")]
    TokenDuplicationFailed(u32),

    /// The calling process does not hold (or has disabled) the named privilege.
    #[error("missing required privilege {0}; run as SYSTEM or grant the privilege to the caller")]
    MissingPrivilege(String),

    /// The caller's own token could not be opened or read.
    #[error("failed to read the current process privileges (Win32 error {0} - 0x{0:08X})")]
    PrivilegeQueryFailed(u32),

    /// `CreateEnvironmentBlock` failed or returned an invalid block.
    #[error("failed to create environment block (Win32 error {0} - 0x{0:08X})")]
    EnvironmentBlockFailed(u32),

    /// Creating a redirection pipe or adjusting its inheritance failed.
    #[error("failed to set up redirection pipes (Win32 error {0} - 0x{0:08X})")]
    PipeSetupFailed(u32),

    /// `CreateProcessAsUserW` failed.
    #[error("CreateProcessAsUserW failed (Win32 error {0} - 0x{0:08X})")]
    ProcessCreationFailed(u32),

    /// Waiting for the child or reading its exit code failed.
    #[error("failed to wait for process exit (Win32 error {0} - 0x{0:08X})")]
    ProcessWaitFailed(u32),
}

impl Error {
    /// Returns the underlying Win32 error code, if the failure carries one.
    pub fn os_code(&self) -> Option<u32> {
        match *self {
            Error::EnumerationFailed(code)
            | Error::TokenQueryFailed(code)
            | Error::TokenDuplicationFailed(code)
            | Error::PrivilegeQueryFailed(code)
            | Error::EnvironmentBlockFailed(code)
            | Error::PipeSetupFailed(code)
            | Error::ProcessCreationFailed(code)
            | Error::ProcessWaitFailed(code) => Some(code),
            Error::SessionNotFound(_)
            | Error::NoActiveSession
            | Error::UserNotFound(_)
            | Error::MissingPrivilege(_) => None,
        }
    }
}

/// Reads the calling thread's last Win32 error.
#[cfg(windows)]
pub(crate) fn last_error() -> u32 {
    unsafe { windows_sys::Win32::Foundation::GetLastError() }
}
