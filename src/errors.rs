use nix::errno::Errno;
use nix::unistd::Pid;

/// Errors produced by the tracing engine.
///
/// `Errno` carries an ordinary POSIX errno that should be turned into a
/// synthetic syscall return value; `TraceeVanished` is always recoverable
/// at the call site (drop the record, keep the loop going); `Fatal` means
/// the sandbox can no longer guarantee containment and must exit.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    #[error("tracee {0} vanished")]
    TraceeVanished(Pid),

    #[error("{0}")]
    Errno(#[from] Errno),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl SandboxError {
    /// The errno this error should surface as, from the tracee's point of view.
    pub fn get_errno(&self) -> i32 {
        match self {
            SandboxError::Errno(e) => *e as i32,
            SandboxError::TraceeVanished(_) => Errno::ESRCH as i32,
            SandboxError::Fatal(_) => 0,
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(self, SandboxError::Fatal(_))
    }

    /// Maps a raw nix error at a ptrace/proc call site to our error type,
    /// collapsing ESRCH (tracee went away mid-operation) to its own variant.
    pub fn from_nix(pid: Pid, e: Errno) -> SandboxError {
        if e == Errno::ESRCH {
            SandboxError::TraceeVanished(pid)
        } else {
            SandboxError::Errno(e)
        }
    }
}

pub type Result<T> = std::result::Result<T, SandboxError>;
