//! Engine error taxonomy.
//!
//! Detector outcomes bubble up to the epoch controller, which is the only
//! place that decides between commit, rollback, and abort. Lower layers
//! return these errors and never terminate the process themselves.

use thiserror::Error;

/// Errors produced by the engine and its components.
#[derive(Debug, Error)]
pub enum EngineError {
    /// A canary word next to a live object was overwritten.
    #[error("heap overflow at {address:#x} (object {object_start:#x?})")]
    OverflowDetected {
        address: usize,
        object_start: Option<usize>,
    },
    /// A quarantined object was written after it was freed.
    #[error("use-after-free at {address:#x} (object {object_start:#x})")]
    UseAfterFreeDetected { address: usize, object_start: usize },
    /// Live objects were unreachable at program end.
    #[error("{count} leaked object(s) at program end")]
    MemoryLeakDetected { count: usize },
    /// The heap region has no room left for a chunk of the requested size.
    #[error("heap exhausted: requested {requested} bytes, {remaining} remaining")]
    AllocatorExhausted { requested: usize, remaining: usize },
    /// Mapping or protecting the backing store failed.
    #[error("backing store setup failed during {op}: {source}")]
    BackingStoreSetupFailure {
        op: &'static str,
        #[source]
        source: std::io::Error,
    },
    /// No thread slot is free and a commit could not reclaim one.
    #[error("thread slots exhausted ({max} alive)")]
    ThreadSlotExhausted { max: usize },
    /// Preempting a thread at an epoch boundary failed.
    #[error("failed to deliver stop request to thread {thread}")]
    SignalDeliveryFailure { thread: usize },
    /// Corruption was detected again right after a rollback.
    #[error("corruption detected again after rollback in epoch {epoch}")]
    RepeatedCorruption { epoch: u64 },
    /// A tracked write landed outside every registered region.
    #[error("address {address:#x} is outside every tracked region")]
    AddressOutOfRange { address: usize },
    /// A free or realloc named a pointer that is not a live heap object.
    #[error("invalid free of {address:#x}")]
    InvalidFree { address: usize },
    /// A synchronization call violated the primitive's contract.
    #[error("sync misuse by thread {thread}: {what}")]
    SyncMisuse { thread: usize, what: &'static str },
    /// Configuration could not be validated.
    #[error("invalid config: {0}")]
    InvalidConfig(String),
    /// An OS thread could not be started.
    #[error("failed to start thread: {0}")]
    ThreadStart(#[from] std::io::Error),
    /// A thread body returned an error from `step`.
    #[error("thread {thread} faulted: {message}")]
    ThreadFault { thread: usize, message: String },
}

impl EngineError {
    /// Returns true if the process cannot continue after this error.
    #[must_use]
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            Self::AllocatorExhausted { .. }
                | Self::BackingStoreSetupFailure { .. }
                | Self::RepeatedCorruption { .. }
                | Self::AddressOutOfRange { .. }
                | Self::ThreadSlotExhausted { .. }
                | Self::ThreadStart(_)
        )
    }

    /// Returns true if a rollback or commit can recover from this error.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            Self::OverflowDetected { .. }
                | Self::UseAfterFreeDetected { .. }
                | Self::MemoryLeakDetected { .. }
                | Self::SignalDeliveryFailure { .. }
        )
    }

    pub(crate) fn backing(op: &'static str) -> Self {
        Self::BackingStoreSetupFailure {
            op,
            source: std::io::Error::last_os_error(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detections_are_recoverable_not_fatal() {
        let overflow = EngineError::OverflowDetected {
            address: 0x1000,
            object_start: Some(0xfc0),
        };
        assert!(overflow.is_recoverable());
        assert!(!overflow.is_fatal());

        let uaf = EngineError::UseAfterFreeDetected {
            address: 0x2000,
            object_start: 0x2000,
        };
        assert!(uaf.is_recoverable());
    }

    #[test]
    fn setup_failures_are_fatal() {
        let err = EngineError::BackingStoreSetupFailure {
            op: "mmap",
            source: std::io::Error::from_raw_os_error(libc::ENOMEM),
        };
        assert!(err.is_fatal());
        assert!(!err.is_recoverable());
        assert!(EngineError::RepeatedCorruption { epoch: 3 }.is_fatal());
    }

    #[test]
    fn display_includes_addresses() {
        let err = EngineError::AddressOutOfRange { address: 0xdead };
        assert_eq!(err.to_string(), "address 0xdead is outside every tracked region");
    }
}
