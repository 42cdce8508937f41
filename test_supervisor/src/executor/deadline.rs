/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-process wall-clock limits.

use std::sync::Arc;
use std::sync::Mutex;
use std::sync::PoisonError;
use std::time::Duration;

use nix::errno::Errno;
use nix::sys::signal::Signal;
use nix::sys::signal::killpg;
use nix::unistd::Pid;
use tokio::task::JoinHandle;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Armed,
    Disarmed,
    Fired,
}

/// Kills a process group once a deadline passes.
///
/// The killer is armed on construction and ends in exactly one of two
/// terminal states: disarmed via [`DeadlineKiller::unprogram`] or
/// fired when the deadline elapsed first. Firing sends `SIGKILL` to
/// the whole process group led by `pid`, so descendants of the
/// supervised child die with it.
///
/// The killer must be armed before anyone waits on `pid`; otherwise
/// the timer could fire against a recycled pid. [`Executor`] upholds
/// this by constructing the killer before starting the exit monitor.
///
/// [`Executor`]: crate::executor::Executor
#[derive(Debug)]
pub struct DeadlineKiller {
    pid: u32,
    state: Arc<Mutex<State>>,
    timer: JoinHandle<()>,
}

impl DeadlineKiller {
    /// Arm a killer for the process group led by `pid`. Must be
    /// called from within a tokio runtime.
    pub fn new(timeout: Duration, pid: u32) -> Self {
        let state = Arc::new(Mutex::new(State::Armed));
        let timer = tokio::spawn({
            let state = Arc::clone(&state);
            async move {
                tokio::time::sleep(timeout).await;
                let mut state = state.lock().unwrap_or_else(PoisonError::into_inner);
                if *state != State::Armed {
                    return;
                }
                *state = State::Fired;
                tracing::info!(pid, ?timeout, "deadline exceeded; killing process group");
                if let Err(e) = kill_process_group(pid) {
                    tracing::warn!(pid, "failed to kill process group: {e}");
                }
            }
        });
        Self { pid, state, timer }
    }

    /// Disarm the killer. Has no effect once fired or disarmed.
    pub fn unprogram(&self) {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if *state == State::Armed {
            *state = State::Disarmed;
            self.timer.abort();
            tracing::trace!(pid = self.pid, "deadline disarmed");
        }
    }

    /// Whether the deadline elapsed and the kill was dispatched.
    pub fn fired(&self) -> bool {
        *self.state.lock().unwrap_or_else(PoisonError::into_inner) == State::Fired
    }
}

impl Drop for DeadlineKiller {
    fn drop(&mut self) {
        self.unprogram();
    }
}

/// Send `SIGKILL` to the process group led by `pid`. A group that no
/// longer exists is not an error.
pub(crate) fn kill_process_group(pid: u32) -> nix::Result<()> {
    let pgid = i32::try_from(pid).map_err(|_| Errno::EINVAL)?;
    match killpg(Pid::from_raw(pgid), Signal::SIGKILL) {
        Ok(()) | Err(Errno::ESRCH) => Ok(()),
        Err(e) => Err(e),
    }
}
