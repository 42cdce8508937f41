/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Cancellation flag shared by every spawning and blocking operation.
//!
//! An [`Interrupts`] value is a cheap, cloneable handle onto a single
//! flag. [`Interrupts::global`] is the process-wide instance that
//! [`install_signal_handlers`] arms; tests construct private
//! instances with [`Interrupts::new`] so that raising one does not
//! disturb unrelated tests running in the same process.
//!
//! The flag is sticky: once raised it stays raised. Blocking waits
//! race [`Interrupts::wait`] against their own completion so that an
//! interrupt delivered while blocked is observed immediately rather
//! than at the next call.

use std::fmt;
use std::sync::Arc;
use std::sync::LazyLock;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicI32;
use std::sync::atomic::Ordering;

use tokio::sync::Notify;

static GLOBAL: LazyLock<Interrupts> = LazyLock::new(Interrupts::new);

/// Error returned by operations that observed a raised interrupt
/// flag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
#[error("interrupted{}", by_signal(.signal))]
pub struct Interrupted {
    /// Signal that raised the flag, when known.
    pub signal: Option<i32>,
}

fn by_signal(signal: &Option<i32>) -> String {
    signal.map(|s| format!(" by signal {s}")).unwrap_or_default()
}

struct Inner {
    raised: AtomicBool,
    // 0 means "no signal recorded".
    signal: AtomicI32,
    notify: Notify,
}

/// Handle onto a sticky cancellation flag.
#[derive(Clone)]
pub struct Interrupts {
    inner: Arc<Inner>,
}

impl Interrupts {
    /// Create a fresh, lowered flag.
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                raised: AtomicBool::new(false),
                signal: AtomicI32::new(0),
                notify: Notify::new(),
            }),
        }
    }

    /// The process-wide flag.
    pub fn global() -> Self {
        GLOBAL.clone()
    }

    /// Raise the flag, waking every task blocked in [`Self::wait`].
    pub fn interrupt(&self, signal: Option<i32>) {
        if let Some(signal) = signal {
            let _ = self.inner.signal.compare_exchange(
                0,
                signal,
                Ordering::SeqCst,
                Ordering::SeqCst,
            );
        }
        self.inner.raised.store(true, Ordering::SeqCst);
        self.inner.notify.notify_waiters();
    }

    /// Whether the flag has been raised.
    pub fn is_interrupted(&self) -> bool {
        self.inner.raised.load(Ordering::SeqCst)
    }

    /// Fail with [`Interrupted`] if the flag has been raised.
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.is_interrupted() {
            let signal = match self.inner.signal.load(Ordering::SeqCst) {
                0 => None,
                s => Some(s),
            };
            Err(Interrupted { signal })
        } else {
            Ok(())
        }
    }

    /// Resolve once the flag is raised. Returns immediately if it
    /// already is.
    pub async fn wait(&self) {
        loop {
            let notified = self.inner.notify.notified();
            tokio::pin!(notified);
            // Register before checking so a concurrent `interrupt`
            // cannot slip between the check and the await.
            notified.as_mut().enable();
            if self.is_interrupted() {
                return;
            }
            notified.await;
        }
    }
}

impl Default for Interrupts {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Interrupts {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Interrupts")
            .field("raised", &self.is_interrupted())
            .finish()
    }
}

/// Route SIGINT, SIGTERM and SIGHUP into [`Interrupts::global`].
///
/// Must be called from within a tokio runtime. The handlers stay
/// installed after the first delivery, so repeated signals never fall
/// back to the default disposition while teardown is in progress.
pub fn install_signal_handlers() -> std::io::Result<()> {
    use tokio::signal::unix::SignalKind;
    use tokio::signal::unix::signal;

    for (kind, signo) in [
        (SignalKind::interrupt(), libc::SIGINT),
        (SignalKind::terminate(), libc::SIGTERM),
        (SignalKind::hangup(), libc::SIGHUP),
    ] {
        let mut stream = signal(kind)?;
        let interrupts = Interrupts::global();
        tokio::spawn(async move {
            while stream.recv().await.is_some() {
                tracing::info!(signal = signo, "interrupt received");
                interrupts.interrupt(Some(signo));
            }
        });
    }
    Ok(())
}
