#![forbid(unsafe_code)]
//! Kiln — forked test execution engine
//!
//! Kiln executes a dynamically discovered set of test units by delegating
//! them to isolated worker processes, streaming structured results back over
//! a framed binary protocol, and scheduling suites, classes, and methods
//! inside each worker under bounded concurrency.
//!
//! The crate splits along the process boundary: `fork` is the controller
//! side (spawn, monitor, consume, aggregate), `exec` is the worker side
//! (scheduler tree, dispatch, provider seam), and the `kiln_wire` member
//! crate carries the vocabulary both sides speak.
//!
//! ## Panic Policy
//!
//! This codebase follows explicit error handling:
//!
//! - **Production code**: Use `Result` or `Option` with `?` / `ok_or` /
//!   `map_err`. The `cli`, `exec`, and `fork` modules enforce
//!   `#![deny(clippy::unwrap_used)]`.
//!
//! - **Test code**: `.unwrap()` and `.expect()` are acceptable in tests.
//!
//! - **Process failures are data**: once a worker has been spawned, its
//!   crashes, timeouts, and protocol violations are recorded in the
//!   `RunResult`, never thrown.

pub mod cli;
pub mod exec;
pub mod fork;
pub mod settings;

pub use exec::{ConcurrencyIntent, ConcurrencyPlan, EventDispatcher};
pub use fork::{ForkConfiguration, ForkPool, RunOutcome, RunResult};
pub use settings::RunSettings;
