//! Synthetic traced program used by the `fntrace` driver and benches
//!
//! Three functions live in the `workload` module of a `Runtime`:
//! a recursive `fib`, a byte `checksum`, and `flaky`, which panics on
//! every seventh call.

use crate::runtime::{CodeId, Runtime};
use std::panic::{self, AssertUnwindSafe};
use std::sync::Arc;

pub const MODULE: &str = "workload";

/// Panic payload raised by `flaky`
pub const FLAKY_PANIC: &str = "workload.flaky: injected failure";

#[derive(Debug, Clone)]
pub struct Workload {
    runtime: Arc<Runtime>,
    fib: CodeId,
    checksum: CodeId,
    flaky: CodeId,
}

impl Workload {
    /// Define the workload functions in `runtime`
    pub fn register(runtime: Arc<Runtime>) -> Self {
        let symbols = runtime.symbols();
        let fib = symbols.define(MODULE, "fib");
        let checksum = symbols.define(MODULE, "checksum");
        let flaky = symbols.define(MODULE, "flaky");
        Self {
            runtime,
            fib,
            checksum,
            flaky,
        }
    }

    /// Names of every workload function
    pub fn function_names() -> Vec<String> {
        ["fib", "checksum", "flaky"]
            .iter()
            .map(|name| format!("{}.{}", MODULE, name))
            .collect()
    }

    pub fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    pub fn fib(&self, n: u32) -> u64 {
        self.runtime.call(self.fib, || {
            if n < 2 {
                u64::from(n)
            } else {
                self.fib(n - 1) + self.fib(n - 2)
            }
        })
    }

    pub fn checksum(&self, data: &[u8]) -> u32 {
        self.runtime.call(self.checksum, || {
            data.iter()
                .fold(0u32, |acc, &b| acc.rotate_left(5) ^ u32::from(b))
        })
    }

    /// Panics when `i` is a multiple of 7
    pub fn flaky(&self, i: u64) -> u64 {
        self.runtime.call(self.flaky, || {
            if i % 7 == 0 {
                panic::panic_any(FLAKY_PANIC);
            }
            i * 2
        })
    }

    /// Run `calls` rounds of all three functions, returning a digest
    pub fn run(&self, calls: usize, depth: u32) -> u64 {
        let mut digest = 0u64;
        for i in 0..calls as u64 {
            digest = digest.wrapping_add(self.fib(depth));
            digest ^= u64::from(self.checksum(&i.to_le_bytes()));
            if let Ok(value) = panic::catch_unwind(AssertUnwindSafe(|| self.flaky(i))) {
                digest = digest.wrapping_add(value);
            }
        }
        digest
    }
}

/// Silence panics raised by `flaky`, keeping the previous hook for others
pub fn quiet_flaky_panics() {
    let previous = panic::take_hook();
    panic::set_hook(Box::new(move |info| {
        let injected = info
            .payload()
            .downcast_ref::<&str>()
            .is_some_and(|message| *message == FLAKY_PANIC);
        if !injected {
            previous(info);
        }
    }));
}
