//! Instrumentation hook
//!
//! Installs a `CallObserver` into the traced runtime that times every frame
//! of a watched function and records the sample in the `StatsRegistry`.
//!
//! - Watched functions are resolved by name through the symbol table; names
//!   that fail to resolve are logged and dropped, never fatal.
//! - Recursive and concurrent calls are timed per frame, so each entry/exit
//!   pair is one sample. A frame left by a panic still counts.
//! - The observer that was installed before `enable` keeps receiving every
//!   event and is put back on `disable`.

use crate::identity::FunctionId;
use crate::registry::{StatsMap, StatsRegistry};
use crate::runtime::{CallEvent, CallObserver, CodeId, FrameId, FrameInfo, ResolveError, Runtime};
use crossbeam::sync::ShardedLock;
use dashmap::DashMap;
use fnv::{FnvBuildHasher, FnvHashMap, FnvHashSet};
use std::collections::hash_map::Entry;
use std::collections::BTreeSet;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Instant;
use thiserror::Error;

/// Errors reported by hook control operations
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum HookError {
    #[error("tracing is not enabled")]
    NotEnabled,

    #[error(transparent)]
    Resolve(#[from] ResolveError),
}

/// Result type for hook operations
pub type Result<T> = std::result::Result<T, HookError>;

/// A name that could not be watched
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResolutionFailure {
    pub function: FunctionId,
    pub error: ResolveError,
}

/// Outcome of `enable` / `update`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct EnableReport {
    /// Functions now being watched
    pub watched: BTreeSet<FunctionId>,
    /// Requested names that were dropped
    pub failed: Vec<ResolutionFailure>,
}

/// A watched frame entered but not yet left
struct InFlight {
    function: FunctionId,
    started: Instant,
    /// disable count when the frame was entered
    generation: u64,
}

/// The observer installed into the runtime
struct Interceptor {
    enabled: AtomicBool,
    /// bumped by every disable; frames from an older generation are dropped
    generation: AtomicU64,
    /// code → identity the controller asked for
    watched: ShardedLock<FnvHashMap<CodeId, FunctionId>>,
    in_flight: DashMap<FrameId, InFlight, FnvBuildHasher>,
    registry: Arc<StatsRegistry>,
    /// observer that was in place before we were installed
    previous: ShardedLock<Option<Arc<dyn CallObserver>>>,
}

impl Interceptor {
    fn new(registry: Arc<StatsRegistry>) -> Self {
        Self {
            enabled: AtomicBool::new(false),
            generation: AtomicU64::new(0),
            watched: ShardedLock::new(FnvHashMap::default()),
            in_flight: DashMap::with_hasher(FnvBuildHasher::default()),
            registry,
            previous: ShardedLock::new(None),
        }
    }

    fn watched_identity(&self, code: CodeId) -> Option<FunctionId> {
        self.watched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&code)
            .cloned()
    }

    fn forward(&self, frame: &FrameInfo, event: CallEvent) {
        let previous = self
            .previous
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();
        if let Some(previous) = previous {
            if catch_unwind(AssertUnwindSafe(|| previous.observe(frame, event))).is_err() {
                tracing::warn!(?event, "chained call observer panicked");
            }
        }
    }
}

impl CallObserver for Interceptor {
    fn observe(&self, frame: &FrameInfo, event: CallEvent) {
        match event {
            CallEvent::Call => {
                // Read before `enabled`: a disable racing this call bumps it
                let generation = self.generation.load(Ordering::Acquire);
                if self.enabled.load(Ordering::Acquire) {
                    if let Some(function) = self.watched_identity(frame.code) {
                        self.in_flight.insert(
                            frame.id,
                            InFlight {
                                function,
                                started: Instant::now(),
                                generation,
                            },
                        );
                    }
                }
            }
            CallEvent::Return | CallEvent::Unwind => {
                if let Some((_, entry)) = self.in_flight.remove(&frame.id) {
                    let elapsed = entry.started.elapsed().as_secs_f64();
                    let current = entry.generation == self.generation.load(Ordering::Acquire);
                    if current && self.enabled.load(Ordering::Acquire) {
                        let function = entry.function;
                        self.registry.record(&function, elapsed);
                        tracing::trace!(%function, elapsed, ?event, "call completed");
                    }
                }
            }
        }
        self.forward(frame, event);
    }
}

#[derive(Default)]
struct HookControl {
    enabled: bool,
    /// marked code, watched regardless of the requested names
    marked: FnvHashSet<CodeId>,
}

/// Enables, updates and disables interception of watched functions
pub struct InstrumentationHook {
    runtime: Arc<Runtime>,
    registry: Arc<StatsRegistry>,
    interceptor: Arc<Interceptor>,
    control: Mutex<HookControl>,
}

impl std::fmt::Debug for InstrumentationHook {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("InstrumentationHook")
            .field("enabled", &self.is_enabled())
            .field("registry", &self.registry)
            .finish()
    }
}

impl InstrumentationHook {
    /// Create a disabled hook for `runtime` with its own registry
    pub fn new(runtime: Arc<Runtime>) -> Self {
        Self::with_registry(runtime, Arc::new(StatsRegistry::new()))
    }

    /// Create a disabled hook that records into `registry`
    pub fn with_registry(runtime: Arc<Runtime>, registry: Arc<StatsRegistry>) -> Self {
        let interceptor = Arc::new(Interceptor::new(Arc::clone(&registry)));
        Self {
            runtime,
            registry,
            interceptor,
            control: Mutex::new(HookControl::default()),
        }
    }

    /// The registry samples are recorded into
    pub fn registry(&self) -> &Arc<StatsRegistry> {
        &self.registry
    }

    /// The instrumented runtime
    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// True while interception is installed
    pub fn is_enabled(&self) -> bool {
        self.interceptor.enabled.load(Ordering::Acquire)
    }

    /// Currently watched identities
    pub fn watched(&self) -> BTreeSet<FunctionId> {
        self.interceptor
            .watched
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .values()
            .cloned()
            .collect()
    }

    /// Start intercepting `functions`
    ///
    /// Already enabled: behaves as `update`, hooks are never installed twice.
    /// Known functions keep their accumulated stats.
    pub fn enable<I, S>(&self, functions: I) -> EnableReport
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionId>,
    {
        let mut control = self.lock_control();
        let report = self.install_watch_set(&control, functions);

        if control.enabled {
            tracing::debug!(watched = report.watched.len(), "already enabled, watch set updated");
            return report;
        }

        let ours: Arc<dyn CallObserver> = self.interceptor.clone();
        let previous = self.runtime.set_observer(ours);
        *self
            .interceptor
            .previous
            .write()
            .unwrap_or_else(PoisonError::into_inner) = previous;

        self.interceptor.enabled.store(true, Ordering::Release);
        control.enabled = true;
        tracing::info!(watched = report.watched.len(), failed = report.failed.len(), "tracing enabled");
        report
    }

    /// Change the watch set without losing stats of functions that stay
    pub fn update<I, S>(&self, functions: I) -> Result<EnableReport>
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionId>,
    {
        let control = self.lock_control();
        if !control.enabled {
            return Err(HookError::NotEnabled);
        }
        Ok(self.install_watch_set(&control, functions))
    }

    /// Remove interception and return the final stats
    ///
    /// Safe to call while disabled: returns the last known stats.
    pub fn disable(&self) -> StatsMap {
        let mut control = self.lock_control();
        if !control.enabled {
            return self.registry.snapshot();
        }

        self.interceptor.enabled.store(false, Ordering::Release);
        self.interceptor.generation.fetch_add(1, Ordering::AcqRel);
        let previous = self
            .interceptor
            .previous
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .take();

        let current = self.runtime.observer();
        let still_ours = current
            .as_ref()
            .is_some_and(|current| same_observer(current, &self.interceptor));
        if still_ours {
            self.runtime.replace_observer(previous);
        } else {
            tracing::warn!("call observer was replaced while tracing; leaving it in place");
        }

        self.interceptor
            .watched
            .write()
            .unwrap_or_else(PoisonError::into_inner)
            .clear();
        self.interceptor.in_flight.clear();
        control.enabled = false;

        tracing::info!(functions = self.registry.len(), "tracing disabled");
        self.registry.snapshot()
    }

    /// Current stats without changing anything
    pub fn get_results(&self) -> StatsMap {
        self.registry.snapshot()
    }

    /// Always watch `code` while enabled, across updates
    pub fn mark(&self, code: CodeId) -> Result<FunctionId> {
        let function = self.runtime.symbols().identity_of(code)?;
        let mut control = self.lock_control();
        control.marked.insert(code);

        if control.enabled {
            self.registry.ensure([&function]);
            self.interceptor
                .watched
                .write()
                .unwrap_or_else(PoisonError::into_inner)
                .insert(code, function.clone());
        }
        Ok(function)
    }

    /// Drop all recorded stats
    pub fn clear(&self) {
        self.registry.clear();
    }

    fn lock_control(&self) -> std::sync::MutexGuard<'_, HookControl> {
        self.control.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Resolve `functions` and swap in the new watch set
    fn install_watch_set<I, S>(&self, control: &HookControl, functions: I) -> EnableReport
    where
        I: IntoIterator<Item = S>,
        S: Into<FunctionId>,
    {
        let symbols = self.runtime.symbols();
        let mut watched = FnvHashMap::default();
        let mut report = EnableReport::default();

        for code in &control.marked {
            match symbols.identity_of(*code) {
                Ok(function) => {
                    watched.insert(*code, function);
                }
                Err(error) => tracing::warn!(%error, "marked function vanished"),
            }
        }

        for function in functions {
            let function = function.into();
            match symbols.resolve(&function) {
                Ok(symbol) => match watched.entry(symbol.code) {
                    Entry::Vacant(slot) => {
                        slot.insert(function);
                    }
                    Entry::Occupied(slot) if *slot.get() != function => {
                        tracing::warn!(
                            %function,
                            watched_as = %slot.get(),
                            "function already watched under another name, skipping"
                        );
                    }
                    Entry::Occupied(_) => {}
                },
                Err(error) => {
                    tracing::warn!(%function, %error, "could not resolve function, skipping");
                    report.failed.push(ResolutionFailure { function, error });
                }
            }
        }

        report.watched = watched.values().cloned().collect();
        self.registry.ensure(report.watched.iter());
        *self
            .interceptor
            .watched
            .write()
            .unwrap_or_else(PoisonError::into_inner) = watched;
        report
    }
}

impl Drop for InstrumentationHook {
    fn drop(&mut self) {
        // Never leave a dangling observer in the runtime
        self.disable();
    }
}

fn same_observer(observer: &Arc<dyn CallObserver>, interceptor: &Arc<Interceptor>) -> bool {
    std::ptr::eq(
        Arc::as_ptr(observer) as *const (),
        Arc::as_ptr(interceptor) as *const (),
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    fn setup() -> (Arc<Runtime>, InstrumentationHook) {
        let runtime = Arc::new(Runtime::new());
        let hook = InstrumentationHook::new(Arc::clone(&runtime));
        (runtime, hook)
    }

    #[test]
    fn test_enable_watches_resolved_functions() {
        let (runtime, hook) = setup();
        runtime.symbols().define("m", "a");
        runtime.symbols().define("m", "b");

        let report = hook.enable(["m.a", "m.b"]);

        assert!(hook.is_enabled());
        assert_eq!(report.watched.len(), 2);
        assert!(report.failed.is_empty());
        assert_eq!(hook.get_results()["m.a"], crate::stats::FunctionStats::new());
    }

    #[test]
    fn test_resolution_failure_drops_only_that_name() {
        let (runtime, hook) = setup();
        runtime.symbols().define("m", "a");
        runtime.symbols().define("m", "b");

        let report = hook.enable(["m.a", "missing.f", "m.b"]);

        assert_eq!(report.watched.len(), 2);
        assert_eq!(report.failed.len(), 1);
        assert_eq!(report.failed[0].function.as_str(), "missing.f");
        assert!(hook.get_results().get("missing.f").is_none());
    }

    #[test]
    fn test_calls_to_watched_function_are_timed() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        let other = runtime.symbols().define("m", "other");
        hook.enable(["m.a"]);

        runtime.call(a, || std::thread::sleep(Duration::from_millis(5)));
        runtime.call(a, || ());
        runtime.call(other, || ());

        let stats = hook.disable();
        let a_stats = stats["m.a"];
        assert_eq!(a_stats.call_count, 2);
        assert!(a_stats.max_time >= 0.005);
        assert!(a_stats.min_time <= a_stats.max_time);
        assert!(stats.get("m.other").is_none());
    }

    #[test]
    fn test_recursion_counts_every_frame() {
        let (runtime, hook) = setup();
        let code = runtime.symbols().define("m", "fib");
        hook.enable(["m.fib"]);

        fn fib(runtime: &Runtime, code: CodeId, n: u32) -> u64 {
            runtime.call(code, || {
                if n < 2 {
                    n as u64
                } else {
                    fib(runtime, code, n - 1) + fib(runtime, code, n - 2)
                }
            })
        }
        assert_eq!(fib(&runtime, code, 10), 55);

        // fib(10) makes 177 calls
        assert_eq!(hook.disable()["m.fib"].call_count, 177);
    }

    #[test]
    fn test_panicking_call_is_still_a_sample() {
        let (runtime, hook) = setup();
        let code = runtime.symbols().define("m", "fails");
        hook.enable(["m.fails"]);

        let result = std::panic::catch_unwind(AssertUnwindSafe(|| {
            runtime.call(code, || panic!("error inside traced function"))
        }));
        assert!(result.is_err());

        assert_eq!(hook.disable()["m.fails"].call_count, 1);
    }

    #[test]
    fn test_enable_twice_merges_and_installs_once() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        runtime.symbols().define("m", "b");

        hook.enable(["m.a"]);
        runtime.call(a, || ());
        hook.enable(["m.a", "m.b"]);
        runtime.call(a, || ());

        let stats = hook.disable();
        assert_eq!(stats["m.a"].call_count, 2);
        assert_eq!(stats["m.b"].call_count, 0);
        assert!(runtime.observer().is_none());
    }

    #[test]
    fn test_update_requires_enabled() {
        let (runtime, hook) = setup();
        runtime.symbols().define("m", "a");
        assert_eq!(hook.update(["m.a"]).unwrap_err(), HookError::NotEnabled);
        assert!(hook.get_results().is_empty());
    }

    #[test]
    fn test_update_keeps_stats_of_remaining_functions() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        let b = runtime.symbols().define("m", "b");

        hook.enable(["m.a"]);
        runtime.call(a, || ());
        hook.update(["m.a", "m.b"]).unwrap();
        runtime.call(a, || ());
        runtime.call(b, || ());
        hook.update(["m.b"]).unwrap();
        runtime.call(a, || ());

        let stats = hook.disable();
        assert_eq!(stats["m.a"].call_count, 2);
        assert_eq!(stats["m.b"].call_count, 1);
    }

    #[test]
    fn test_disable_when_not_enabled_is_noop() {
        let (_runtime, hook) = setup();
        assert!(hook.disable().is_empty());
        assert!(!hook.is_enabled());
    }

    #[test]
    fn test_calls_after_disable_are_ignored() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        hook.enable(["m.a"]);
        runtime.call(a, || ());
        let stats = hook.disable();
        runtime.call(a, || ());

        assert_eq!(stats["m.a"].call_count, 1);
        assert_eq!(hook.get_results()["m.a"].call_count, 1);
    }

    #[test]
    fn test_frame_open_across_disable_is_not_recorded() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        hook.enable(["m.a"]);

        let frame = runtime.enter(a);
        hook.disable();
        drop(frame);

        assert_eq!(hook.get_results()["m.a"].call_count, 0);
    }

    #[test]
    fn test_frame_entered_during_disable_is_not_recorded_after_reenable() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        hook.enable(["m.a"]);

        let frame = runtime.enter(a);
        let entered_in = hook.interceptor.generation.load(Ordering::Acquire);
        hook.disable();
        // A call that saw tracing enabled but inserts after disable cleared
        hook.interceptor.in_flight.insert(
            frame.info().id,
            InFlight {
                function: FunctionId::new("m.a"),
                started: Instant::now(),
                generation: entered_in,
            },
        );

        hook.enable(["m.a"]);
        drop(frame);
        assert_eq!(hook.get_results()["m.a"].call_count, 0);

        runtime.call(a, || ());
        assert_eq!(hook.disable()["m.a"].call_count, 1);
    }

    #[test]
    fn test_aliases_of_one_function_keep_first_name() {
        let (runtime, hook) = setup();
        let main = runtime.symbols().define("", "main");

        let report = hook.enable(["main", "__main__.main"]);
        assert!(report.failed.is_empty());
        assert_eq!(report.watched.len(), 1);
        assert!(report.watched.contains("main"));

        runtime.call(main, || ());
        let stats = hook.disable();
        assert_eq!(stats["main"].call_count, 1);
        assert!(!stats.contains_key("__main__.main"));
    }

    struct Counting(AtomicUsize);

    impl CallObserver for Counting {
        fn observe(&self, _frame: &FrameInfo, _event: CallEvent) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn test_previous_observer_is_chained_and_restored() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        let other = runtime.symbols().define("m", "other");
        let debugger = Arc::new(Counting(AtomicUsize::new(0)));
        runtime.set_observer(debugger.clone());

        hook.enable(["m.a"]);
        runtime.call(a, || ());
        runtime.call(other, || ());
        hook.disable();

        // Both calls and both returns reached the chained observer
        assert_eq!(debugger.0.load(Ordering::SeqCst), 4);
        let restored = runtime.observer().unwrap();
        assert!(std::ptr::eq(
            Arc::as_ptr(&restored) as *const (),
            Arc::as_ptr(&debugger) as *const ()
        ));
    }

    struct Panicking;

    impl CallObserver for Panicking {
        fn observe(&self, _frame: &FrameInfo, _event: CallEvent) {
            panic!("broken debugger");
        }
    }

    #[test]
    fn test_panicking_chained_observer_is_contained() {
        let (runtime, hook) = setup();
        let a = runtime.symbols().define("m", "a");
        runtime.set_observer(Arc::new(Panicking));

        hook.enable(["m.a"]);
        assert_eq!(runtime.call(a, || 3), 3);
        assert_eq!(hook.disable()["m.a"].call_count, 1);
    }

    #[test]
    fn test_marked_function_survives_update() {
        let (runtime, hook) = setup();
        let marked = runtime.symbols().define("m", "decorated");
        runtime.symbols().define("m", "a");

        assert_eq!(hook.mark(marked).unwrap().as_str(), "m.decorated");
        hook.enable(["m.a"]);
        hook.update(Vec::<String>::new()).unwrap();
        runtime.call(marked, || ());

        assert!(hook.watched().contains("m.decorated"));
        assert_eq!(hook.disable()["m.decorated"].call_count, 1);
    }

    #[test]
    fn test_drop_restores_runtime_observer() {
        let runtime = Arc::new(Runtime::new());
        runtime.symbols().define("m", "a");
        {
            let hook = InstrumentationHook::new(Arc::clone(&runtime));
            hook.enable(["m.a"]);
            assert!(runtime.observer().is_some());
        }
        assert!(runtime.observer().is_none());
    }
}
