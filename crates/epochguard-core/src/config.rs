//! Engine configuration.
//!
//! Settings come from an explicit [`EngineConfig`] or from environment
//! variables read once per process by [`global_config`]:
//! - `EPOCHGUARD_TRACKING`: `explicit` (default) or `trap`.
//! - `EPOCHGUARD_DETECT`: comma list of `overflow`, `uaf`, `leak`, or `all`/`none`.
//! - `EPOCHGUARD_FATAL`: `halt` (default) or `abort`.
//! - `EPOCHGUARD_MAX_THREADS`, `EPOCHGUARD_QUARANTINE_ENTRIES`,
//!   `EPOCHGUARD_QUARANTINE_BYTES`, `EPOCHGUARD_HEAP_BYTES`,
//!   `EPOCHGUARD_GLOBALS_BYTES`: numeric limits (decimal or `0x` hex).

use std::sync::OnceLock;

use crate::error::EngineError;
use crate::region::PAGE_SIZE;

/// Hard ceiling on alive threads; per-page writer sets are 64-bit masks.
pub const MAX_THREADS_LIMIT: usize = 64;

/// How writes to a tracked region reach `MemoryRegion::handle_write`.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum WriteTracking {
    /// Every engine-mediated write announces itself before touching memory.
    #[default]
    Explicit,
    /// The transient view is write-protected and faults are routed by a
    /// `SIGSEGV` handler.
    Trap,
}

impl WriteTracking {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "trap" | "fault" | "mprotect" | "signal" => Self::Trap,
            _ => Self::Explicit,
        }
    }
}

/// What the engine does after an unrecoverable detection.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FatalAction {
    /// Stop every thread and return the error to the embedder.
    #[default]
    Halt,
    /// Abort the process after the final diagnostic pass.
    Abort,
}

impl FatalAction {
    /// Parse from string (case-insensitive).
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        match s.trim().to_ascii_lowercase().as_str() {
            "abort" | "crash" | "die" => Self::Abort,
            _ => Self::Halt,
        }
    }
}

/// Which detectors run at epoch boundaries.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Detectors {
    pub overflow: bool,
    pub use_after_free: bool,
    pub leak: bool,
}

impl Detectors {
    /// All detectors enabled.
    #[must_use]
    pub const fn all() -> Self {
        Self {
            overflow: true,
            use_after_free: true,
            leak: true,
        }
    }

    /// All detectors disabled.
    #[must_use]
    pub const fn none() -> Self {
        Self {
            overflow: false,
            use_after_free: false,
            leak: false,
        }
    }

    /// Parse a comma-separated detector list. Unknown names are ignored.
    #[must_use]
    pub fn from_str_loose(s: &str) -> Self {
        let mut out = Self::none();
        for part in s.split(',').map(|p| p.trim().to_ascii_lowercase()) {
            match part.as_str() {
                "all" | "full" => out = Self::all(),
                "none" | "off" => out = Self::none(),
                "overflow" | "canary" => out.overflow = true,
                "uaf" | "use-after-free" | "quarantine" => out.use_after_free = true,
                "leak" | "leaks" => out.leak = true,
                _ => {}
            }
        }
        out
    }
}

impl Default for Detectors {
    fn default() -> Self {
        Self::all()
    }
}

/// Complete engine configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub tracking: WriteTracking,
    pub detectors: Detectors,
    pub fatal_action: FatalAction,
    /// Maximum concurrently alive threads, including the main thread.
    pub max_threads: usize,
    /// Entries held by each per-thread quarantine.
    pub quarantine_entries: usize,
    /// Byte budget of each per-thread quarantine.
    pub quarantine_bytes: usize,
    pub heap_bytes: usize,
    pub globals_bytes: usize,
}

impl EngineConfig {
    /// Defaults suitable for tests and small programs.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            tracking: WriteTracking::Explicit,
            detectors: Detectors::all(),
            fatal_action: FatalAction::Halt,
            max_threads: 16,
            quarantine_entries: 1023,
            quarantine_bytes: 16 * 1024 * 1024,
            heap_bytes: 64 * 1024 * 1024,
            globals_bytes: 64 * 1024,
        }
    }

    /// Build a configuration from `EPOCHGUARD_*` environment variables.
    #[must_use]
    pub fn from_env() -> Self {
        let mut cfg = Self::new();
        if let Ok(v) = std::env::var("EPOCHGUARD_TRACKING") {
            cfg.tracking = WriteTracking::from_str_loose(&v);
        }
        if let Ok(v) = std::env::var("EPOCHGUARD_DETECT") {
            cfg.detectors = Detectors::from_str_loose(&v);
        }
        if let Ok(v) = std::env::var("EPOCHGUARD_FATAL") {
            cfg.fatal_action = FatalAction::from_str_loose(&v);
        }
        let numeric = [
            ("EPOCHGUARD_MAX_THREADS", &mut cfg.max_threads),
            ("EPOCHGUARD_QUARANTINE_ENTRIES", &mut cfg.quarantine_entries),
            ("EPOCHGUARD_QUARANTINE_BYTES", &mut cfg.quarantine_bytes),
            ("EPOCHGUARD_HEAP_BYTES", &mut cfg.heap_bytes),
            ("EPOCHGUARD_GLOBALS_BYTES", &mut cfg.globals_bytes),
        ];
        for (key, slot) in numeric {
            if let Some(n) = std::env::var(key).ok().and_then(|v| parse_usize(&v)) {
                *slot = n;
            }
        }
        cfg
    }

    #[must_use]
    pub fn with_tracking(mut self, tracking: WriteTracking) -> Self {
        self.tracking = tracking;
        self
    }

    #[must_use]
    pub fn with_detectors(mut self, detectors: Detectors) -> Self {
        self.detectors = detectors;
        self
    }

    #[must_use]
    pub fn with_fatal_action(mut self, action: FatalAction) -> Self {
        self.fatal_action = action;
        self
    }

    #[must_use]
    pub fn with_max_threads(mut self, n: usize) -> Self {
        self.max_threads = n;
        self
    }

    #[must_use]
    pub fn with_quarantine(mut self, entries: usize, bytes: usize) -> Self {
        self.quarantine_entries = entries;
        self.quarantine_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_heap_bytes(mut self, bytes: usize) -> Self {
        self.heap_bytes = bytes;
        self
    }

    #[must_use]
    pub fn with_globals_bytes(mut self, bytes: usize) -> Self {
        self.globals_bytes = bytes;
        self
    }

    /// Check limits before any memory is mapped.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.max_threads == 0 || self.max_threads > MAX_THREADS_LIMIT {
            return Err(EngineError::InvalidConfig(format!(
                "max_threads must be in 1..={MAX_THREADS_LIMIT}, got {}",
                self.max_threads
            )));
        }
        if self.quarantine_entries == 0 {
            return Err(EngineError::InvalidConfig(
                "quarantine_entries must be non-zero".to_string(),
            ));
        }
        if self.heap_bytes < 16 * PAGE_SIZE {
            return Err(EngineError::InvalidConfig(format!(
                "heap_bytes must be at least {} bytes",
                16 * PAGE_SIZE
            )));
        }
        if self.globals_bytes == 0 {
            return Err(EngineError::InvalidConfig(
                "globals_bytes must be non-zero".to_string(),
            ));
        }
        Ok(())
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self::new()
    }
}

fn parse_usize(s: &str) -> Option<usize> {
    let s = s.trim().replace('_', "");
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(hex) => usize::from_str_radix(hex, 16).ok(),
        None => s.parse().ok(),
    }
}

static GLOBAL_CONFIG: OnceLock<EngineConfig> = OnceLock::new();

/// Get the environment-derived configuration (read on first call, cached thereafter).
#[must_use]
pub fn global_config() -> &'static EngineConfig {
    GLOBAL_CONFIG.get_or_init(EngineConfig::from_env)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_tracking_modes() {
        assert_eq!(WriteTracking::from_str_loose("trap"), WriteTracking::Trap);
        assert_eq!(WriteTracking::from_str_loose("MPROTECT"), WriteTracking::Trap);
        assert_eq!(
            WriteTracking::from_str_loose("explicit"),
            WriteTracking::Explicit
        );
        assert_eq!(WriteTracking::from_str_loose("bogus"), WriteTracking::Explicit);
    }

    #[test]
    fn parse_fatal_action() {
        assert_eq!(FatalAction::from_str_loose("abort"), FatalAction::Abort);
        assert_eq!(FatalAction::from_str_loose("Halt"), FatalAction::Halt);
        assert_eq!(FatalAction::from_str_loose(""), FatalAction::Halt);
    }

    #[test]
    fn parse_detector_lists() {
        assert_eq!(Detectors::from_str_loose("all"), Detectors::all());
        assert_eq!(Detectors::from_str_loose("none"), Detectors::none());
        let d = Detectors::from_str_loose("overflow, leak");
        assert!(d.overflow);
        assert!(!d.use_after_free);
        assert!(d.leak);
        assert!(Detectors::from_str_loose("uaf").use_after_free);
    }

    #[test]
    fn parse_numbers_accept_hex_and_underscores() {
        assert_eq!(parse_usize("4096"), Some(4096));
        assert_eq!(parse_usize("0x1000"), Some(4096));
        assert_eq!(parse_usize("1_048_576"), Some(1_048_576));
        assert_eq!(parse_usize("lots"), None);
    }

    #[test]
    fn validate_rejects_out_of_range_threads() {
        assert!(EngineConfig::new().validate().is_ok());
        assert!(EngineConfig::new().with_max_threads(0).validate().is_err());
        assert!(
            EngineConfig::new()
                .with_max_threads(MAX_THREADS_LIMIT + 1)
                .validate()
                .is_err()
        );
        assert!(EngineConfig::new().with_quarantine(0, 64).validate().is_err());
    }
}
