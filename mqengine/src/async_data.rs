//! Completion plumbing for operations that may have to wait for a store commit.
//!
//! An operation either finishes on the calling thread (`Completion::Done`),
//! fails, or returns `Completion::Pending`, in which case the callback it was
//! given fires exactly once later, possibly before the call has returned.
//!
//! [`AsyncData`] is the stack of continuations handed to the store. Engine
//! layers push `Internal` entries on top of the caller's `External` callback;
//! when the store commit completes the stack is unwound top-down. An internal
//! entry may take ownership of the stack to go asynchronous again.

use std::fmt;

use parking_lot::Mutex;

use crate::error::Result;

pub type CompletionCallback<T> = Box<dyn FnOnce(Result<T>) + Send + 'static>;

/// Continuation run when the stack is unwound. Returning `None` means the
/// continuation kept the stack and will resume it itself.
pub type Continuation = Box<dyn FnOnce(Result<()>, AsyncData) -> Option<(Result<()>, AsyncData)> + Send + 'static>;

#[derive(Debug, Clone, PartialEq, Eq)]
#[must_use]
pub enum Completion<T> {
    Done(T),
    Pending,
}

impl<T> Completion<T> {
    #[inline]
    pub fn is_pending(&self) -> bool {
        matches!(self, Completion::Pending)
    }

    #[inline]
    pub fn done(self) -> Option<T> {
        match self {
            Completion::Done(t) => Some(t),
            Completion::Pending => None,
        }
    }

    #[inline]
    pub fn map<U, F: FnOnce(T) -> U>(self, f: F) -> Completion<U> {
        match self {
            Completion::Done(t) => Completion::Done(f(t)),
            Completion::Pending => Completion::Pending,
        }
    }
}

pub enum AsyncEntry {
    Internal { tag: &'static str, f: Continuation },
    External { tag: &'static str, cb: CompletionCallback<()> },
}

impl AsyncEntry {
    #[inline]
    pub fn tag(&self) -> &'static str {
        match self {
            AsyncEntry::Internal { tag, .. } | AsyncEntry::External { tag, .. } => tag,
        }
    }
}

#[derive(Default)]
pub struct AsyncData {
    entries: Vec<AsyncEntry>,
}

impl fmt::Debug for AsyncData {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.entries.iter().map(|e| e.tag())).finish()
    }
}

impl AsyncData {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    #[inline]
    pub fn with_callback(tag: &'static str, cb: Option<CompletionCallback<()>>) -> Self {
        let mut data = Self::new();
        if let Some(cb) = cb {
            data.push_external(tag, cb);
        }
        data
    }

    #[inline]
    pub fn push_internal<F>(&mut self, tag: &'static str, f: F)
    where
        F: FnOnce(Result<()>, AsyncData) -> Option<(Result<()>, AsyncData)> + Send + 'static,
    {
        self.entries.push(AsyncEntry::Internal { tag, f: Box::new(f) });
    }

    #[inline]
    pub fn push_external(&mut self, tag: &'static str, cb: CompletionCallback<()>) {
        self.entries.push(AsyncEntry::External { tag, cb });
    }

    /// Remove the top entry without running it
    #[inline]
    pub fn pop(&mut self) -> Option<AsyncEntry> {
        self.entries.pop()
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Unwind the stack with the outcome of the operation it was waiting on
    pub fn resume(self, rc: Result<()>) {
        let mut data = self;
        let mut rc = rc;
        while let Some(entry) = data.entries.pop() {
            match entry {
                AsyncEntry::Internal { tag, f } => {
                    log::trace!("resume internal continuation {}, rc: {:?}", tag, rc);
                    match f(rc, data) {
                        Some((next_rc, next_data)) => {
                            rc = next_rc;
                            data = next_data;
                        }
                        None => return,
                    }
                }
                AsyncEntry::External { tag, cb } => {
                    log::trace!("invoke completion callback {}, rc: {:?}", tag, rc);
                    cb(rc.clone());
                }
            }
        }
    }
}

/// Settles a callback-bearing operation whose completion may land on any thread.
///
/// The initiating thread calls [`arm`](Self::arm), does its synchronous work and
/// then [`settle`](Self::settle). If [`complete`](Self::complete) ran before
/// `settle`, the result is returned synchronously and the callback is dropped
/// unfired; otherwise the callback fires exactly once from `complete`.
pub struct PendingCompletion<T> {
    inner: Mutex<PendingInner<T>>,
}

struct PendingInner<T> {
    armed: bool,
    in_call: bool,
    result: Option<Result<T>>,
    cb: Option<CompletionCallback<T>>,
}

impl<T> Default for PendingCompletion<T> {
    fn default() -> Self {
        PendingCompletion { inner: Mutex::new(PendingInner { armed: false, in_call: false, result: None, cb: None }) }
    }
}

impl<T> fmt::Debug for PendingCompletion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let inner = self.inner.lock();
        write!(f, "PendingCompletion {{ armed: {}, in_call: {} }}", inner.armed, inner.in_call)
    }
}

impl<T: Send + 'static> PendingCompletion<T> {
    #[inline]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn arm(&self, cb: Option<CompletionCallback<T>>) {
        let mut inner = self.inner.lock();
        inner.armed = true;
        inner.in_call = true;
        inner.result = None;
        inner.cb = cb;
    }

    pub fn complete(&self, res: Result<T>) {
        let (cb, res) = {
            let mut inner = self.inner.lock();
            if !inner.armed {
                return;
            }
            if inner.in_call {
                inner.result = Some(res);
                return;
            }
            inner.armed = false;
            (inner.cb.take(), res)
        };
        if let Some(cb) = cb {
            cb(res);
        }
    }

    pub fn settle(&self) -> Result<Completion<T>> {
        let (res, _unfired) = {
            let mut inner = self.inner.lock();
            inner.in_call = false;
            match inner.result.take() {
                Some(res) => {
                    inner.armed = false;
                    (Some(res), inner.cb.take())
                }
                None => (None, None),
            }
        };
        match res {
            Some(res) => res.map(Completion::Done),
            None => Ok(Completion::Pending),
        }
    }

    #[inline]
    pub fn is_armed(&self) -> bool {
        self.inner.lock().armed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::EngineError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    #[test]
    fn test_resume_unwinds_top_down() {
        let order = Arc::new(Mutex::new(Vec::new()));
        let o1 = order.clone();
        let o2 = order.clone();
        let o3 = order.clone();
        let mut data = AsyncData::with_callback(
            "caller",
            Some(Box::new(move |rc| {
                assert!(rc.is_ok());
                o1.lock().push("caller");
            })),
        );
        data.push_internal("first", move |rc, d| {
            o2.lock().push("first");
            Some((rc, d))
        });
        data.push_internal("second", move |rc, d| {
            o3.lock().push("second");
            Some((rc, d))
        });
        assert_eq!(data.len(), 3);
        data.resume(Ok(()));
        assert_eq!(*order.lock(), vec!["second", "first", "caller"]);
    }

    #[test]
    fn test_internal_entry_can_change_result() {
        let seen = Arc::new(Mutex::new(None));
        let s = seen.clone();
        let mut data = AsyncData::with_callback("caller", Some(Box::new(move |rc| *s.lock() = Some(rc))));
        data.push_internal("fail", |_rc, d| Some((Err(EngineError::RolledBack), d)));
        data.resume(Ok(()));
        assert_eq!(*seen.lock(), Some(Err(EngineError::RolledBack)));
    }

    #[test]
    fn test_internal_entry_suspends_again() {
        let fired = Arc::new(AtomicUsize::new(0));
        let parked: Arc<Mutex<Option<AsyncData>>> = Arc::new(Mutex::new(None));
        let f = fired.clone();
        let mut data = AsyncData::with_callback(
            "caller",
            Some(Box::new(move |_| {
                f.fetch_add(1, Ordering::SeqCst);
            })),
        );
        let p = parked.clone();
        data.push_internal("second-commit", move |_rc, d| {
            *p.lock() = Some(d);
            None
        });
        data.resume(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        let d = parked.lock().take().unwrap();
        d.resume(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_pending_completion_inline_completion_is_sync() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let p: PendingCompletion<u32> = PendingCompletion::new();
        p.arm(Some(Box::new(move |_| {
            f.fetch_add(1, Ordering::SeqCst);
        })));
        p.complete(Ok(7));
        assert_eq!(p.settle(), Ok(Completion::Done(7)));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
        p.complete(Ok(8));
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[test]
    fn test_pending_completion_late_completion_fires_once() {
        let fired = Arc::new(AtomicUsize::new(0));
        let f = fired.clone();
        let p: Arc<PendingCompletion<()>> = Arc::new(PendingCompletion::new());
        p.arm(Some(Box::new(move |rc| {
            assert!(rc.is_ok());
            f.fetch_add(1, Ordering::SeqCst);
        })));
        assert_eq!(p.settle(), Ok(Completion::Pending));
        let p2 = p.clone();
        std::thread::spawn(move || p2.complete(Ok(()))).join().unwrap();
        p.complete(Ok(()));
        assert_eq!(fired.load(Ordering::SeqCst), 1);
        assert!(!p.is_armed());
    }
}
