//! Error types for the weft runtime

use core::fmt;

/// Result type for runtime operations
pub type SchedResult<T> = Result<T, SchedError>;

/// Errors surfaced by the scheduler and reactor.
///
/// These cover resource exhaustion and lifecycle failures. Misuse
/// (double-arming an event, yielding the root fiber, stopping from the
/// wrong thread) is a programming error and panics instead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SchedError {
    /// Scheduler already started
    AlreadyStarted,

    /// Scheduler was never started
    NotStarted,

    /// Failed to spawn a worker thread
    SpawnFailed,

    /// epoll_create / epoll_ctl failed (errno)
    Epoll(i32),

    /// pipe creation or fcntl on the wake pipe failed (errno)
    WakePipe(i32),

    /// Stack or mapping failure
    Memory(MemoryError),
}

impl fmt::Display for SchedError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SchedError::AlreadyStarted => write!(f, "scheduler already started"),
            SchedError::NotStarted => write!(f, "scheduler not started"),
            SchedError::SpawnFailed => write!(f, "failed to spawn worker thread"),
            SchedError::Epoll(e) => write!(f, "epoll error: errno {}", e),
            SchedError::WakePipe(e) => write!(f, "wake pipe error: errno {}", e),
            SchedError::Memory(e) => write!(f, "memory error: {}", e),
        }
    }
}

impl std::error::Error for SchedError {}

/// Stack-mapping errors
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MemoryError {
    /// mmap failed
    AllocationFailed,

    /// mprotect of the guard page failed
    ProtectionFailed,

    /// Requested stack smaller than one usable page
    StackTooSmall,
}

impl fmt::Display for MemoryError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MemoryError::AllocationFailed => write!(f, "stack allocation failed"),
            MemoryError::ProtectionFailed => write!(f, "guard page protection failed"),
            MemoryError::StackTooSmall => write!(f, "stack size too small"),
        }
    }
}

impl From<MemoryError> for SchedError {
    fn from(e: MemoryError) -> Self {
        SchedError::Memory(e)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_display() {
        assert_eq!(
            format!("{}", SchedError::Memory(MemoryError::AllocationFailed)),
            "memory error: stack allocation failed"
        );
        assert_eq!(format!("{}", SchedError::Epoll(22)), "epoll error: errno 22");
    }

    #[test]
    fn test_from_memory() {
        let e: SchedError = MemoryError::StackTooSmall.into();
        assert!(matches!(e, SchedError::Memory(MemoryError::StackTooSmall)));
    }
}
