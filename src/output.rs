use core::fmt;
use serde::Serialize;

/// Outcome of a launched process, produced once it has exited.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LaunchResult {
    /// The process ID
    pub process_id: u32,

    /// ID of the primary thread
    pub thread_id: u32,

    /// The exit code of the process
    pub exit_code: u32,

    /// Captured standard output, only when redirection was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stdout: Option<String>,

    /// Captured standard error, only when redirection was requested
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stderr: Option<String>,
}

impl LaunchResult {
    /// Returns `true` if output was captured.
    pub fn is_redirected(&self) -> bool {
        self.stdout.is_some() || self.stderr.is_some()
    }

    /// Exit code as the signed value a shell would report.
    pub fn exit_code_i32(&self) -> i32 {
        self.exit_code as i32
    }
}

impl fmt::Display for LaunchResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PID {}: exit code {}", self.process_id, self.exit_code)
    }
}
