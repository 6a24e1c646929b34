//! fntrace - per-function call tracing with live statistics
//!
//! This library intercepts entry and exit of selected functions in a
//! runtime, aggregates call counts and latency per function, and lets an
//! external controller start, update, poll and stop tracing through
//! pluggable backends.
//!
//! The pieces, bottom-up:
//! - [`runtime`]: symbol table, call frames and the observer slot
//! - [`hook`]: the instrumentation hook feeding a [`registry::StatsRegistry`]
//! - [`agent`]: executes tracer commands inside the traced process
//! - [`backend`] and [`transport`]: the ways a controller reaches an agent
//! - [`control`]: the controller-side session state machine

pub mod agent;
pub mod backend;
pub mod cli;
pub mod config;
pub mod control;
pub mod hook;
pub mod identity;
pub mod pending;
pub mod protocol;
pub mod registry;
pub mod runtime;
pub mod stats;
pub mod transport;
pub mod workload;

pub use control::ControlSurface;
pub use hook::InstrumentationHook;
pub use identity::FunctionId;
pub use registry::{StatsMap, StatsRegistry};
pub use stats::FunctionStats;
