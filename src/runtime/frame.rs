//! Call frames and the process-wide call observer

use super::symbols::{CodeId, SymbolTable};
use crossbeam::sync::ShardedLock;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, PoisonError};

/// Unique id of one function invocation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct FrameId(u64);

impl FrameId {
    /// Raw numeric value
    pub fn as_u64(self) -> u64 {
        self.0
    }
}

static NEXT_FRAME_ID: AtomicU64 = AtomicU64::new(1);

/// What happened to a frame
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CallEvent {
    /// The function was entered
    Call,
    /// The function returned normally
    Return,
    /// The function is being left by a panic
    Unwind,
}

/// The frame an event refers to
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FrameInfo {
    pub id: FrameId,
    pub code: CodeId,
}

/// Receives every call and return of instrumented code
///
/// Runs inline on the calling thread, so implementations must be cheap and
/// must not panic.
pub trait CallObserver: Send + Sync {
    fn observe(&self, frame: &FrameInfo, event: CallEvent);
}

/// The traced program's runtime: symbols plus the observer slot
pub struct Runtime {
    symbols: SymbolTable,
    observer: ShardedLock<Option<Arc<dyn CallObserver>>>,
    /// Fast-path flag mirroring `observer.is_some()`
    observed: AtomicBool,
}

impl Default for Runtime {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("symbols", &self.symbols)
            .field("observed", &self.observed.load(Ordering::Relaxed))
            .finish()
    }
}

impl Runtime {
    /// Create a runtime with no symbols and no observer
    pub fn new() -> Self {
        Self {
            symbols: SymbolTable::new(),
            observer: ShardedLock::new(None),
            observed: AtomicBool::new(false),
        }
    }

    /// The runtime's symbol table
    pub fn symbols(&self) -> &SymbolTable {
        &self.symbols
    }

    /// Currently installed observer
    pub fn observer(&self) -> Option<Arc<dyn CallObserver>> {
        self.observer
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Install `observer` (or remove with `None`), returning the previous one
    pub fn replace_observer(
        &self,
        observer: Option<Arc<dyn CallObserver>>,
    ) -> Option<Arc<dyn CallObserver>> {
        let mut slot = self
            .observer
            .write()
            .unwrap_or_else(PoisonError::into_inner);
        self.observed.store(observer.is_some(), Ordering::Release);
        std::mem::replace(&mut *slot, observer)
    }

    /// Install an observer, returning the previous one
    pub fn set_observer(&self, observer: Arc<dyn CallObserver>) -> Option<Arc<dyn CallObserver>> {
        self.replace_observer(Some(observer))
    }

    /// Remove the observer
    pub fn take_observer(&self) -> Option<Arc<dyn CallObserver>> {
        self.replace_observer(None)
    }

    /// Enter a frame for `code`
    ///
    /// The returned guard reports `Return`, or `Unwind` if dropped during a
    /// panic. Events go to the observer installed at entry time.
    pub fn enter(&self, code: CodeId) -> Frame {
        let info = FrameInfo {
            id: FrameId(NEXT_FRAME_ID.fetch_add(1, Ordering::Relaxed)),
            code,
        };

        if !self.observed.load(Ordering::Acquire) {
            return Frame {
                info,
                observer: None,
            };
        }

        let observer = self.observer();
        if let Some(observer) = &observer {
            observer.observe(&info, CallEvent::Call);
        }
        Frame { info, observer }
    }

    /// Run `f` inside a frame for `code`
    pub fn call<R>(&self, code: CodeId, f: impl FnOnce() -> R) -> R {
        let _frame = self.enter(code);
        f()
    }
}

/// RAII guard for one invocation
#[must_use = "the frame ends when this guard is dropped"]
pub struct Frame {
    info: FrameInfo,
    observer: Option<Arc<dyn CallObserver>>,
}

impl Frame {
    /// Identity of this invocation
    pub fn info(&self) -> FrameInfo {
        self.info
    }
}

impl Drop for Frame {
    fn drop(&mut self) {
        if let Some(observer) = self.observer.take() {
            let event = if std::thread::panicking() {
                CallEvent::Unwind
            } else {
                CallEvent::Return
            };
            observer.observe(&self.info, event);
        }
    }
}
