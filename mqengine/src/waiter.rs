//! Per-consumer delivery waiter.
//!
//! The waiter is the consumer's registration with its queue. Only an
//! `ENABLED` waiter is offered messages; the queue moves it to `LOCKED` for
//! the duration of a delivery. Disable and enable requests that race a
//! delivery are recorded as pending flags and resolved by [`Waiter::unlock`].
//!
//! Every transition out of an enabled state owes the consumer one "disabled"
//! notification; the methods report how many the caller has to fire.

use std::sync::atomic::{AtomicU32, Ordering};

use crate::error::{EngineError, Result};

pub const DISCONNECTED: u32 = 0;
pub const DISABLED: u32 = 1;
pub const ENABLED: u32 = 2;
pub const LOCKED: u32 = 4;
pub const DISABLE_PEND: u32 = 0x10;
pub const CANCEL_DISABLE_PEND: u32 = 0x20;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Enabled {
    Now,
    /// A pending disable was cancelled; it still fires its notification
    /// but the waiter ends up enabled
    CancelledDisable,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Disabled {
    /// Disabled, the caller fires one notification
    Now,
    /// Disabled when the in-progress delivery unlocks the waiter
    Pending,
    /// The caller fires one notification now and one more follows on unlock
    PendingAfterCancel,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct Unlocked {
    pub disabled_fires: u8,
}

#[derive(Debug)]
pub struct Waiter(AtomicU32);

impl Default for Waiter {
    fn default() -> Self {
        Waiter(AtomicU32::new(DISCONNECTED))
    }
}

impl Waiter {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn state(&self) -> u32 {
        self.0.load(Ordering::SeqCst)
    }

    #[inline]
    pub fn is_enabled(&self) -> bool {
        let s = self.state();
        s == ENABLED || (s & LOCKED != 0 && (s & DISABLE_PEND == 0 || s & CANCEL_DISABLE_PEND != 0))
    }

    /// Attach to a queue; the waiter starts disabled
    pub fn connect(&self) -> Result<()> {
        self.0
            .compare_exchange(DISCONNECTED, DISABLED, Ordering::SeqCst, Ordering::SeqCst)
            .map(|_| ())
            .map_err(|_| EngineError::WaiterInvalid)
    }

    /// Detach from the queue, only valid once disabled
    pub fn disconnect(&self) -> Result<()> {
        match self.0.compare_exchange(DISABLED, DISCONNECTED, Ordering::SeqCst, Ordering::SeqCst) {
            Ok(_) => Ok(()),
            Err(DISCONNECTED) => Ok(()),
            Err(_) => Err(EngineError::WaiterInvalid),
        }
    }

    /// Claim the waiter for one delivery
    #[inline]
    pub fn try_lock(&self) -> bool {
        self.0.compare_exchange(ENABLED, LOCKED, Ordering::SeqCst, Ordering::SeqCst).is_ok()
    }

    pub fn enable(&self) -> Result<Enabled> {
        let mut cur = self.state();
        loop {
            let (next, res) = match cur {
                DISABLED => (ENABLED, Enabled::Now),
                s if s == LOCKED | DISABLE_PEND => (s | CANCEL_DISABLE_PEND, Enabled::CancelledDisable),
                ENABLED | LOCKED => return Err(EngineError::WaiterEnabled),
                s if s == LOCKED | DISABLE_PEND | CANCEL_DISABLE_PEND => return Err(EngineError::WaiterEnabled),
                _ => return Err(EngineError::WaiterInvalid),
            };
            match self.0.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(res),
                Err(actual) => cur = actual,
            }
        }
    }

    pub fn disable(&self) -> Result<Disabled> {
        let mut cur = self.state();
        loop {
            let (next, res) = match cur {
                ENABLED => (DISABLED, Disabled::Now),
                LOCKED => (LOCKED | DISABLE_PEND, Disabled::Pending),
                s if s == LOCKED | DISABLE_PEND | CANCEL_DISABLE_PEND => {
                    (LOCKED | DISABLE_PEND, Disabled::PendingAfterCancel)
                }
                s if s == LOCKED | DISABLE_PEND => return Ok(Disabled::Pending),
                DISABLED => return Err(EngineError::WaiterDisabled),
                _ => return Err(EngineError::WaiterInvalid),
            };
            match self.0.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Ok(res),
                Err(actual) => cur = actual,
            }
        }
    }

    /// Release the delivery lock, `suspend` disables the waiter as well
    pub fn unlock(&self, suspend: bool) -> Unlocked {
        let mut cur = self.state();
        loop {
            let (next, fires) = match cur {
                LOCKED if suspend => (DISABLED, 1),
                LOCKED => (ENABLED, 0),
                s if s == LOCKED | DISABLE_PEND => (DISABLED, 1),
                s if s == LOCKED | DISABLE_PEND | CANCEL_DISABLE_PEND => {
                    if suspend {
                        (DISABLED, 2)
                    } else {
                        (ENABLED, 1)
                    }
                }
                other => {
                    log::warn!("unlock of a waiter that is not locked, state: {:#x}", other);
                    return Unlocked::default();
                }
            };
            match self.0.compare_exchange(cur, next, Ordering::SeqCst, Ordering::SeqCst) {
                Ok(_) => return Unlocked { disabled_fires: fires },
                Err(actual) => cur = actual,
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_enable_disable() {
        let w = Waiter::new();
        assert_eq!(w.enable(), Err(EngineError::WaiterInvalid));
        w.connect().unwrap();
        assert_eq!(w.disable(), Err(EngineError::WaiterDisabled));
        assert_eq!(w.enable(), Ok(Enabled::Now));
        assert_eq!(w.enable(), Err(EngineError::WaiterEnabled));
        assert_eq!(w.disable(), Ok(Disabled::Now));
        w.disconnect().unwrap();
        assert_eq!(w.state(), DISCONNECTED);
    }

    #[test]
    fn test_disable_while_locked() {
        let w = Waiter::new();
        w.connect().unwrap();
        w.enable().unwrap();
        assert!(w.try_lock());
        assert!(!w.try_lock());
        assert_eq!(w.disable(), Ok(Disabled::Pending));
        assert!(!w.is_enabled());
        assert_eq!(w.unlock(false), Unlocked { disabled_fires: 1 });
        assert_eq!(w.state(), DISABLED);
    }

    #[test]
    fn test_enable_cancels_pending_disable() {
        let w = Waiter::new();
        w.connect().unwrap();
        w.enable().unwrap();
        assert!(w.try_lock());
        w.disable().unwrap();
        assert_eq!(w.enable(), Ok(Enabled::CancelledDisable));
        assert!(w.is_enabled());
        assert_eq!(w.unlock(false), Unlocked { disabled_fires: 1 });
        assert_eq!(w.state(), ENABLED);
    }

    #[test]
    fn test_disable_after_cancel() {
        let w = Waiter::new();
        w.connect().unwrap();
        w.enable().unwrap();
        assert!(w.try_lock());
        w.disable().unwrap();
        w.enable().unwrap();
        assert_eq!(w.disable(), Ok(Disabled::PendingAfterCancel));
        assert_eq!(w.unlock(false), Unlocked { disabled_fires: 1 });
        assert_eq!(w.state(), DISABLED);
    }

    #[test]
    fn test_suspend_on_unlock() {
        let w = Waiter::new();
        w.connect().unwrap();
        w.enable().unwrap();
        assert!(w.try_lock());
        assert_eq!(w.unlock(true), Unlocked { disabled_fires: 1 });
        assert_eq!(w.state(), DISABLED);
        assert_eq!(w.disconnect(), Ok(()));
    }
}
