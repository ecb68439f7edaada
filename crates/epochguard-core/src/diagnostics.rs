//! Corruption reports and pluggable diagnostics backends.
//!
//! Detectors produce [`CorruptionReport`]s; the epoch controller hands each
//! one to the engine's [`DiagnosticsBackend`] before deciding between
//! commit and rollback. Symbol resolution or hardware watchpoints belong in
//! a backend, not in the engine.

use std::fmt;

use parking_lot::Mutex;

use crate::error::EngineError;
use crate::thread_registry::ThreadId;
use crate::tracking::CallSite;

/// Class of memory error.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CorruptionKind {
    Overflow,
    UseAfterFree,
    Leak,
}

impl CorruptionKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Overflow => "overflow",
            Self::UseAfterFree => "use_after_free",
            Self::Leak => "leak",
        }
    }
}

impl fmt::Display for CorruptionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// One detected memory error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorruptionReport {
    pub kind: CorruptionKind,
    /// Corrupted word (overflow, use-after-free) or object start (leak).
    pub address: usize,
    pub object_start: Option<usize>,
    pub object_size: Option<usize>,
    /// Value found at `address`, if it was read.
    pub value: Option<u64>,
    /// Thread that allocated the object.
    pub thread: Option<ThreadId>,
    pub alloc_site: Option<CallSite>,
    pub free_site: Option<CallSite>,
    pub epoch: u64,
}

impl CorruptionReport {
    /// The detection error this report stands for.
    #[must_use]
    pub fn to_error(&self) -> EngineError {
        match self.kind {
            CorruptionKind::Overflow => EngineError::OverflowDetected {
                address: self.address,
                object_start: self.object_start,
            },
            CorruptionKind::UseAfterFree => EngineError::UseAfterFreeDetected {
                address: self.address,
                object_start: self.object_start.unwrap_or(self.address),
            },
            CorruptionKind::Leak => EngineError::MemoryLeakDetected { count: 1 },
        }
    }
}

impl fmt::Display for CorruptionReport {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} at {:#x}", self.kind, self.address)?;
        if let (Some(start), Some(size)) = (self.object_start, self.object_size) {
            write!(f, " in object {start:#x} ({size} bytes)")?;
        }
        if let Some(site) = self.alloc_site {
            write!(f, ", allocated at {site}")?;
        }
        if let Some(site) = self.free_site {
            write!(f, ", freed at {site}")?;
        }
        write!(f, " [epoch {}]", self.epoch)
    }
}

/// A replayed write touched an address that was corrupted before rollback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WatchHit {
    pub address: usize,
    pub thread: ThreadId,
    pub epoch: u64,
    pub site: CallSite,
}

/// Receiver of engine diagnostics.
pub trait DiagnosticsBackend: Send + Sync {
    fn report_corruption(&self, report: &CorruptionReport);

    fn on_rollback(&self, _epoch: u64) {}

    fn on_watch_hit(&self, _hit: &WatchHit) {}
}

/// Logs every diagnostic through `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingDiagnostics;

impl DiagnosticsBackend for TracingDiagnostics {
    fn report_corruption(&self, report: &CorruptionReport) {
        tracing::warn!(
            kind = %report.kind,
            address = format_args!("{:#x}", report.address),
            object_start = ?report.object_start,
            object_size = ?report.object_size,
            alloc_site = ?report.alloc_site.map(|s| s.to_string()),
            free_site = ?report.free_site.map(|s| s.to_string()),
            epoch = report.epoch,
            "memory corruption detected"
        );
    }

    fn on_rollback(&self, epoch: u64) {
        tracing::warn!(epoch, "rolling back epoch");
    }

    fn on_watch_hit(&self, hit: &WatchHit) {
        tracing::warn!(
            address = format_args!("{:#x}", hit.address),
            thread = %hit.thread,
            epoch = hit.epoch,
            site = %hit.site,
            "replayed write hit a corrupted address"
        );
    }
}

/// Records every diagnostic for later inspection.
#[derive(Debug, Default)]
pub struct CollectingDiagnostics {
    reports: Mutex<Vec<CorruptionReport>>,
    rollbacks: Mutex<Vec<u64>>,
    watch_hits: Mutex<Vec<WatchHit>>,
}

impl CollectingDiagnostics {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn reports(&self) -> Vec<CorruptionReport> {
        self.reports.lock().clone()
    }

    #[must_use]
    pub fn reports_of(&self, kind: CorruptionKind) -> Vec<CorruptionReport> {
        self.reports
            .lock()
            .iter()
            .filter(|r| r.kind == kind)
            .cloned()
            .collect()
    }

    /// Epochs that were rolled back, in order.
    #[must_use]
    pub fn rollbacks(&self) -> Vec<u64> {
        self.rollbacks.lock().clone()
    }

    #[must_use]
    pub fn watch_hits(&self) -> Vec<WatchHit> {
        self.watch_hits.lock().clone()
    }
}

impl DiagnosticsBackend for CollectingDiagnostics {
    fn report_corruption(&self, report: &CorruptionReport) {
        self.reports.lock().push(report.clone());
    }

    fn on_rollback(&self, epoch: u64) {
        self.rollbacks.lock().push(epoch);
    }

    fn on_watch_hit(&self, hit: &WatchHit) {
        self.watch_hits.lock().push(*hit);
    }
}
