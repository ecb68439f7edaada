//! Epoch-based speculative execution and rollback for heap error detection.
//!
//! A program runs as engine threads whose tracked memory is checkpointed at
//! every epoch begin. At each epoch end all threads stop, the detectors run,
//! and the epoch is either committed or rolled back and replayed under the
//! recorded synchronization order, with watchpoints on the corrupted words.
//!
//! # Architecture
//!
//! - **Regions** (`region`, `mapping`, `fault`): copy-on-write twin pages,
//!   word-diff commit and rollback, optional write-fault tracking
//! - **Allocator** (`allocator`, `bitmap`, `tracking`): page source, size
//!   classes, canary decorator, and per-object provenance
//! - **Quarantine** (`quarantine`): delayed reuse with sentinel fills
//! - **Synchronization** (`sync`, `sync_log`): tracked mutexes and barriers
//!   with per-variable and per-thread event lists for replay
//! - **Threads** (`thread_registry`, `execution`, `context`): slots, control
//!   blocks, and resumable bodies with saved execution state
//! - **Epochs** (`epoch`, `engine`): stop-the-world rendezvous, commit,
//!   rollback, and the thread run loop
//! - **Reporting** (`diagnostics`, `leak`, `error`, `metrics`): pluggable
//!   corruption reports, leak scan, error taxonomy, atomic counters
//! - **Configuration** (`config`): environment-derived engine options

#![deny(unsafe_code)]

pub mod allocator;
pub mod bitmap;
pub mod config;
pub mod context;
pub mod diagnostics;
pub mod engine;
pub mod epoch;
pub mod error;
pub mod execution;
pub mod fault;
pub mod leak;
pub mod mapping;
pub mod metrics;
pub mod quarantine;
pub mod region;
pub mod sync;
pub mod sync_log;
pub mod thread_registry;
pub mod tracking;

pub use allocator::{BumpPageSource, CanaryDecorator, HeapAllocator, PageSource, SizeClassAllocator};
pub use config::{Detectors, EngineConfig, FatalAction, WriteTracking};
pub use context::ThreadContext;
pub use diagnostics::{
    CollectingDiagnostics, CorruptionKind, CorruptionReport, DiagnosticsBackend, TracingDiagnostics,
    WatchHit,
};
pub use engine::{Engine, EngineState, RunSummary};
pub use epoch::{Phase, Verdict};
pub use error::EngineError;
pub use execution::{Outcome, SavedExecutionState, Step, StepFn, ThreadBody, step_fn};
pub use metrics::{EngineMetrics, MetricsSnapshot};
pub use region::{MemoryRegion, PAGE_SIZE, WORD_SIZE};
pub use sync::{BarrierId, MutexId};
pub use thread_registry::{ThreadId, ThreadStatus};
pub use tracking::CallSite;
