use nix::errno::Errno;

/// Errors fall in three classes the sampling controller cares about:
/// fatal ones abort the session, per-sample ones are counted as `(failed)`
/// and sampling continues, and `TargetTerminated` ends the session early
/// while keeping everything collected so far. `SymbolsNotLoaded` is the one
/// retryable resolution error.
#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    /// Unrecoverable: privilege denied, unreadable ELF, unknown ABI.
    #[error("{0}")]
    Fatal(String),

    /// A ptrace control operation failed.
    #[error("ptrace {op} failed: {errno}")]
    Ptrace { op: &'static str, errno: Errno },

    /// A single word read or write in the target failed, usually a race
    /// with the interpreter freeing an object between samples.
    #[error("failed to access target memory at {addr:#x}: {errno}")]
    PeekFail { addr: u64, errno: Errno },

    /// waitpid returned something other than the expected stop.
    #[error("unexpected wait status: {0}")]
    UnexpectedStatus(String),

    /// The target went away. Collected samples are still emitted.
    #[error("target process terminated")]
    TargetTerminated,

    /// The dynamic loader has not mapped the interpreter yet; callers retry
    /// with backoff.
    #[error("interpreter symbols not loaded")]
    SymbolsNotLoaded,
}

impl ProfileError {
    pub fn is_fatal(&self) -> bool {
        matches!(self, ProfileError::Fatal(_))
    }
}

pub type Result<T> = std::result::Result<T, ProfileError>;
