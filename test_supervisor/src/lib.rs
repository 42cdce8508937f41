/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Supervision engine for running test programs as isolated child
//! processes.
//!
//! The crate is layered bottom-up:
//!
//! - [`executor`] spawns arbitrary children in private work/control
//!   directories, bounds their run time with a
//!   [`DeadlineKiller`](executor::DeadlineKiller), and reaps them one
//!   at a time through [`Executor::wait`](executor::Executor::wait)
//!   or [`Executor::wait_any`](executor::Executor::wait_any).
//! - [`result`] parses the one-line results file written by test
//!   programs and reconciles it against how the process actually
//!   terminated.
//! - [`scheduler`] maps test-case semantics onto process lifecycles:
//!   it runs the test body, chains cleanup and secondary cleanup
//!   routines behind it, and surfaces exactly one
//!   [`ResultHandle`](scheduler::ResultHandle) per test case.
//! - [`interface`] holds the per-technology strategies
//!   ([`Interface`](interface::Interface)) that know how to list, run
//!   and interpret a given kind of test program.
//!
//! Interrupts (SIGINT/SIGTERM/SIGHUP) are funneled through
//! [`interrupts`]; every spawning or blocking operation observes the
//! flag and tears down all live children before reporting
//! [`Interrupted`](interrupts::Interrupted).

pub mod config;
pub mod executor;
pub mod interface;
pub mod interrupts;
pub mod model;
pub mod result;
pub mod scheduler;
mod stacktrace;

pub use config::SupervisorConfig;
pub use executor::ProcStatus;
pub use interface::Interface;
pub use interface::InterfaceRegistry;
pub use model::TestResult;
pub use scheduler::ResultHandle;
pub use scheduler::SchedulerHandle;
pub use scheduler::with_scheduler;

/// Environment variable holding the log filter used by
/// [`initialize_logging`].
pub const LOG_FILTER_ENV: &str = "TEST_SUPERVISOR_LOG";

/// Install a `tracing` subscriber writing to stderr.
///
/// The filter is taken from [`LOG_FILTER_ENV`] and defaults to
/// `info`. Calling this more than once is harmless: only the first
/// subscriber is installed.
pub fn initialize_logging() {
    let filter = tracing_subscriber::EnvFilter::try_from_env(LOG_FILTER_ENV)
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .try_init();
}
