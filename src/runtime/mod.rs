//! Host runtime model
//!
//! The tracer instruments functions of a live program. This module is the
//! program side of that contract: a symbol table mapping `module.function`
//! names to code ids, and a frame mechanism that reports every call and
//! return of instrumented code to a single process-wide observer.
//!
//! Programs instrument a function by entering a frame for its code id:
//!
//! ```
//! use fntrace::runtime::Runtime;
//!
//! let runtime = Runtime::new();
//! let code = runtime.symbols().define("app.math", "square");
//! let square = |x: u64| runtime.call(code, || x * x);
//! assert_eq!(square(7), 49);
//! ```

mod frame;
mod symbols;

pub use frame::{CallEvent, CallObserver, Frame, FrameId, FrameInfo, Runtime};
pub use symbols::{CodeId, ResolveError, Symbol, SymbolTable};
