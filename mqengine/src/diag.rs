use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use serde_json::json;

use crate::error::{EngineError, Result};

/// Failure data capture for conditions that should be unreachable.
///
/// A fatal probe halts the engine: every entry point fails with
/// [`EngineError::Halted`] afterwards, leaving the process to be restarted.
#[derive(Debug, Default)]
pub struct Diagnostics {
    halted: AtomicBool,
    probes: AtomicU64,
}

impl Diagnostics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn ffdc(&self, probe: &str, fatal: bool, message: &str, data: serde_json::Value) {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let dump = json!({
            "probe": probe,
            "fatal": fatal,
            "message": message,
            "data": data,
            "thread": format!("{:?}", std::thread::current().id()),
        });
        if fatal {
            log::error!("FFDC {} (fatal), {}", probe, dump);
            self.halted.store(true, Ordering::SeqCst);
        } else {
            log::warn!("FFDC {}, {}", probe, dump);
        }
    }

    #[inline]
    pub fn is_halted(&self) -> bool {
        self.halted.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn check_running(&self) -> Result<()> {
        if self.is_halted() {
            Err(EngineError::Halted)
        } else {
            Ok(())
        }
    }

    #[inline]
    pub fn probe_count(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }
}
