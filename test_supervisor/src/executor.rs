/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Isolated execution of arbitrary child processes.
//!
//! [`Executor`] runs each child inside a private directory tree under
//! a per-run root of all test directories:
//!
//! ```text
//! <work_root>/test-supervisor.XXXXXX/   (root of all tests)
//!     <seq>/                            (root work directory)
//!         work/                         (child cwd; child-owned)
//!         control/                      (supervisor-owned)
//!             stdout.txt
//!             stderr.txt
//! ```
//!
//! The work directory belongs to the child: it may delete everything
//! in it without affecting the supervisor's captured output or
//! cookies, which live in the control directory.
//!
//! ## Lifecycle
//!
//! - [`Executor::spawn`] creates a fresh root work directory, calls
//!   the caller's hook to obtain a [`ProcessCommand`], starts it in
//!   its own process group and arms a [`DeadlineKiller`].
//! - [`Executor::spawn_followup`] runs another command in the same
//!   directories as a previous one, appending to its output files.
//! - [`Executor::wait`] and [`Executor::wait_any`] block until a
//!   child terminates and return an [`ExitHandle`]. A child killed
//!   for exceeding its deadline reports no status at all.
//! - [`ExitHandle::cleanup`] deletes the child's directories once the
//!   caller is done with them; [`Executor::cleanup`] removes the root
//!   of all tests.
//!
//! Every spawn and wait checks the [`Interrupts`] flag first. An
//! interrupt tears everything down (all process groups killed, all
//! directories removed) before [`ExecutorError::Interrupted`] is
//! returned. The same teardown runs on `Drop`.

mod deadline;
mod isolation;

use std::collections::HashMap;
use std::collections::VecDeque;
use std::fmt;
use std::fs::File;
use std::fs::OpenOptions;
use std::os::unix::fs::PermissionsExt;
use std::os::unix::process::ExitStatusExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::ExitStatus;
use std::sync::Arc;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use std::sync::mpsc;
use std::sync::mpsc::RecvTimeoutError;
use std::time::Duration;
use std::time::SystemTime;

pub use deadline::DeadlineKiller;
pub(crate) use deadline::kill_process_group;
pub use isolation::Account;
pub use isolation::ProcessCommand;
use serde::Deserialize;
use serde::Serialize;
use tempfile::TempDir;
use tokio::task::JoinSet;

use crate::config::SupervisorConfig;
use crate::interrupts::Interrupted;
use crate::interrupts::Interrupts;

/// Name of the file capturing a child's stdout in its control
/// directory.
pub const STDOUT_FILE_NAME: &str = "stdout.txt";
/// Name of the file capturing a child's stderr in its control
/// directory.
pub const STDERR_FILE_NAME: &str = "stderr.txt";

const WORK_DIR_NAME: &str = "work";
const CONTROL_DIR_NAME: &str = "control";
const ROOT_PREFIX: &str = "test-supervisor.";

/// Errors returned by the [`Executor`].
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    /// The interrupt flag was raised. Every child has already been
    /// killed and every directory removed.
    #[error(transparent)]
    Interrupted(#[from] Interrupted),

    #[error("failed to spawn child: {0}")]
    Spawn(#[source] std::io::Error),

    #[error("spawn hook failed: {0:#}")]
    Hook(anyhow::Error),

    #[error("failed to wait for child {id}: {source}")]
    Wait {
        id: ExecId,
        #[source]
        source: std::io::Error,
    },

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no live child with id {0}")]
    UnknownHandle(ExecId),

    #[error("no children to wait for")]
    NoChildren,

    #[error("executor has been torn down")]
    TornDown,

    #[error("internal executor error: {0}")]
    Internal(String),
}

impl ExecutorError {
    pub fn is_interrupted(&self) -> bool {
        matches!(self, ExecutorError::Interrupted(_))
    }

    fn io(action: &'static str, path: &Path, source: std::io::Error) -> Self {
        ExecutorError::Io {
            action,
            path: path.to_path_buf(),
            source,
        }
    }
}

/// How a child terminated on its own.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ProcStatus {
    /// The child called `exit(code)`.
    Exited { code: i32 },
    /// The child was terminated by `signal`.
    Signaled { signal: i32, core_dumped: bool },
}

impl ProcStatus {
    pub fn exited_with(&self, expected: i32) -> bool {
        matches!(*self, ProcStatus::Exited { code } if code == expected)
    }

    pub fn success(&self) -> bool {
        self.exited_with(0)
    }
}

impl From<ExitStatus> for ProcStatus {
    fn from(status: ExitStatus) -> Self {
        if let Some(signal) = status.signal() {
            ProcStatus::Signaled {
                signal,
                core_dumped: status.core_dumped(),
            }
        } else if let Some(code) = status.code() {
            ProcStatus::Exited { code }
        } else {
            // Stopped or continued; keep the raw wait status.
            ProcStatus::Exited {
                code: status.into_raw(),
            }
        }
    }
}

impl fmt::Display for ProcStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            ProcStatus::Exited { code } => write!(f, "exited with code {code}"),
            ProcStatus::Signaled {
                signal,
                core_dumped: false,
            } => write!(f, "received signal {signal}"),
            ProcStatus::Signaled {
                signal,
                core_dumped: true,
            } => write!(f, "received signal {signal} (core dumped)"),
        }
    }
}

/// Identifier of one spawned child, unique for the lifetime of the
/// [`Executor`]. Unlike pids, ids are never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ExecId(u64);

impl fmt::Display for ExecId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "#{}", self.0)
    }
}

/// Directories shared by a child and all its follow-ups.
#[derive(Debug)]
struct Workspace {
    root: PathBuf,
    work: PathBuf,
    control: PathBuf,
    /// Exit handles (reaped or still to be reaped) that keep the
    /// directories alive.
    owners: AtomicUsize,
}

impl Workspace {
    fn retain(&self) {
        self.owners.fetch_add(1, Ordering::SeqCst);
    }

    /// Drop one owner, removing the directories along with the last
    /// one.
    fn release(&self) -> std::io::Result<()> {
        if self.owners.fetch_sub(1, Ordering::SeqCst) != 1 {
            return Ok(());
        }
        match remove_tree(&self.root) {
            Err(e) if e.kind() != std::io::ErrorKind::NotFound => Err(e),
            _ => Ok(()),
        }
    }
}

/// Handle to a spawned, not yet reaped, child.
#[derive(Debug, Clone)]
pub struct ExecHandle {
    id: ExecId,
    pid: u32,
    workspace: Arc<Workspace>,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    account: Option<Account>,
}

impl ExecHandle {
    pub fn id(&self) -> ExecId {
        self.id
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn work_directory(&self) -> &Path {
        &self.workspace.work
    }

    pub fn control_directory(&self) -> &Path {
        &self.workspace.control
    }

    pub fn stdout_file(&self) -> &Path {
        &self.stdout_file
    }

    pub fn stderr_file(&self) -> &Path {
        &self.stderr_file
    }
}

#[derive(Debug)]
struct ExitInner {
    id: ExecId,
    pid: u32,
    program: PathBuf,
    status: Option<ProcStatus>,
    start_time: SystemTime,
    end_time: SystemTime,
    workspace: Arc<Workspace>,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    account: Option<Account>,
    cleaned: AtomicBool,
}

/// Result of waiting for a child.
///
/// The handle owns the child's directories: they stay on disk,
/// including the captured output, until [`ExitHandle::cleanup`] is
/// called. Clones share that ownership and cleaning up any clone
/// cleans up all of them.
#[derive(Debug, Clone)]
pub struct ExitHandle {
    inner: Arc<ExitInner>,
}

impl ExitHandle {
    pub fn id(&self) -> ExecId {
        self.inner.id
    }

    pub fn original_pid(&self) -> u32 {
        self.inner.pid
    }

    /// The program the child ran.
    pub fn program(&self) -> &Path {
        &self.inner.program
    }

    /// Termination status, or `None` if the child was killed for
    /// exceeding its deadline.
    pub fn status(&self) -> Option<&ProcStatus> {
        self.inner.status.as_ref()
    }

    pub fn start_time(&self) -> SystemTime {
        self.inner.start_time
    }

    pub fn end_time(&self) -> SystemTime {
        self.inner.end_time
    }

    pub fn root(&self) -> &Path {
        &self.inner.workspace.root
    }

    pub fn work_directory(&self) -> &Path {
        &self.inner.workspace.work
    }

    pub fn control_directory(&self) -> &Path {
        &self.inner.workspace.control
    }

    pub fn stdout_file(&self) -> &Path {
        &self.inner.stdout_file
    }

    pub fn stderr_file(&self) -> &Path {
        &self.inner.stderr_file
    }

    pub fn is_cleaned(&self) -> bool {
        self.inner.cleaned.load(Ordering::SeqCst)
    }

    /// Release this handle's directories. They are deleted, captured
    /// output included, once no follow-up of the same chain still
    /// holds them. Explicit output targets given to
    /// [`SpawnOptions`] are left alone. Idempotent.
    pub fn cleanup(&self) -> Result<(), ExecutorError> {
        if self.inner.cleaned.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let workspace = &self.inner.workspace;
        workspace
            .release()
            .map_err(|e| ExecutorError::io("failed to remove", &workspace.root, e))
    }
}

/// Parameters of [`Executor::spawn`].
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Wall-clock limit after which the child's process group is
    /// killed.
    pub timeout: Duration,
    /// Run the child as this account instead of the current one.
    pub account: Option<Account>,
    /// Capture stdout here instead of the control directory. The
    /// file is owned by the caller and survives cleanup.
    pub stdout: Option<PathBuf>,
    /// Same as `stdout`, for stderr.
    pub stderr: Option<PathBuf>,
}

impl SpawnOptions {
    pub fn new(timeout: Duration) -> Self {
        Self {
            timeout,
            account: None,
            stdout: None,
            stderr: None,
        }
    }
}

/// A child that has been spawned but not yet reaped.
#[derive(Debug)]
struct LiveChild {
    pid: u32,
    program: PathBuf,
    workspace: Arc<Workspace>,
    stdout_file: PathBuf,
    stderr_file: PathBuf,
    account: Option<Account>,
    start_time: SystemTime,
}

/// What an exit monitor reports once its child is gone.
#[derive(Debug)]
struct Exit {
    id: ExecId,
    status: std::io::Result<ExitStatus>,
    timed_out: bool,
    end_time: SystemTime,
}

/// Spawns, time-bounds and reaps isolated children.
///
/// The executor is driven by a single controlling task through
/// `&mut self`. Each child is watched by a monitor task in a
/// [`JoinSet`]; waits collect monitor results with `join_next`, so
/// blocking never involves polling.
pub struct Executor {
    root: Option<TempDir>,
    root_path: PathBuf,
    interrupts: Interrupts,
    next_id: u64,
    live: HashMap<ExecId, LiveChild>,
    monitors: JoinSet<Exit>,
    /// Exits collected while waiting for a specific child.
    stashed: VecDeque<Exit>,
    torn_down: bool,
    debugger: String,
    stacktrace_timeout: Duration,
}

impl Executor {
    /// Create the root of all tests under `config.work_root`.
    pub fn new(config: &SupervisorConfig, interrupts: Interrupts) -> Result<Self, ExecutorError> {
        let mut builder = tempfile::Builder::new();
        builder.prefix(ROOT_PREFIX);
        let root = match &config.work_root {
            Some(work_root) => builder
                .tempdir_in(work_root)
                .map_err(|e| ExecutorError::io("failed to create root in", work_root, e))?,
            None => builder.tempdir().map_err(|e| {
                ExecutorError::io("failed to create root in", &std::env::temp_dir(), e)
            })?,
        };
        let root_path = root.path().to_path_buf();
        tracing::debug!(root = %root_path.display(), "executor initialized");
        Ok(Self {
            root: Some(root),
            root_path,
            interrupts,
            next_id: 0,
            live: HashMap::new(),
            monitors: JoinSet::new(),
            stashed: VecDeque::new(),
            torn_down: false,
            debugger: config.debugger.clone(),
            stacktrace_timeout: config.stacktrace_timeout,
        })
    }

    /// Directory holding every root work directory.
    pub fn root_path(&self) -> &Path {
        &self.root_path
    }

    pub fn interrupts(&self) -> &Interrupts {
        &self.interrupts
    }

    /// Number of spawned children not yet returned by a wait.
    pub fn pending(&self) -> usize {
        // Stashed exits stay in `live` until reaped.
        self.live.len()
    }

    pub(crate) fn debugger(&self) -> &str {
        &self.debugger
    }

    pub(crate) fn stacktrace_timeout(&self) -> Duration {
        self.stacktrace_timeout
    }

    /// Spawn a child in a fresh root work directory.
    ///
    /// `hook` receives the control directory and returns the command
    /// to run; it may also drop files (cookies) in the control
    /// directory. Must be called from within a tokio runtime.
    pub fn spawn<F>(&mut self, hook: F, options: SpawnOptions) -> Result<ExecHandle, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        self.check_interrupt()?;
        self.check_live()?;

        let id = self.allocate_id();
        let root = self.root_path.join(id.0.to_string());
        let workspace = Arc::new(Workspace {
            work: root.join(WORK_DIR_NAME),
            control: root.join(CONTROL_DIR_NAME),
            root,
            owners: AtomicUsize::new(1),
        });

        let result = self.spawn_in(id, hook, &workspace, &options);
        if result.is_err() {
            if let Err(e) = workspace.release() {
                tracing::warn!(%id, "failed to remove {}: {e}", workspace.root.display());
            }
        }
        result
    }

    fn spawn_in<F>(
        &mut self,
        id: ExecId,
        hook: F,
        workspace: &Arc<Workspace>,
        options: &SpawnOptions,
    ) -> Result<ExecHandle, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        for dir in [&workspace.root, &workspace.work, &workspace.control] {
            std::fs::create_dir(dir)
                .map_err(|e| ExecutorError::io("failed to create", dir, e))?;
        }
        isolation::prepare_work_directory(&workspace.work, options.account.as_ref())
            .map_err(|e| ExecutorError::io("failed to chown", &workspace.work, e))?;

        let stdout_file = options
            .stdout
            .clone()
            .unwrap_or_else(|| workspace.control.join(STDOUT_FILE_NAME));
        let stderr_file = options
            .stderr
            .clone()
            .unwrap_or_else(|| workspace.control.join(STDERR_FILE_NAME));

        self.start(
            id,
            hook,
            Arc::clone(workspace),
            Output::truncate(&stdout_file, &stderr_file)?,
            options.timeout,
            options.account.clone(),
        )
    }

    /// Spawn a child continuing the work of `prior`.
    ///
    /// The follow-up runs in `prior`'s directories with the same
    /// account, and appends to `prior`'s output files so a whole
    /// chain produces one continuous diagnostic stream.
    pub fn spawn_followup<F>(
        &mut self,
        hook: F,
        prior: &ExitHandle,
        timeout: Duration,
    ) -> Result<ExecHandle, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        self.spawn_followup_into(hook, prior, timeout, prior.stdout_file(), prior.stderr_file())
    }

    /// [`Executor::spawn_followup`] with explicit output files.
    pub(crate) fn spawn_followup_into<F>(
        &mut self,
        hook: F,
        prior: &ExitHandle,
        timeout: Duration,
        stdout: &Path,
        stderr: &Path,
    ) -> Result<ExecHandle, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        self.check_interrupt()?;
        self.check_live()?;
        if prior.is_cleaned() {
            return Err(ExecutorError::Internal(format!(
                "follow-up of {} requested after cleanup",
                prior.id()
            )));
        }

        let workspace = &prior.inner.workspace;
        workspace.retain();
        let id = self.allocate_id();
        let result = Output::append(stdout, stderr).and_then(|output| {
            self.start(
                id,
                hook,
                Arc::clone(workspace),
                output,
                timeout,
                prior.inner.account.clone(),
            )
        });
        if result.is_err() {
            if let Err(e) = workspace.release() {
                tracing::warn!(%id, "failed to remove {}: {e}", workspace.root.display());
            }
        }
        result
    }

    #[tracing::instrument(
        level = "debug",
        skip_all,
        fields(id = %id, program = tracing::field::Empty, pid = tracing::field::Empty)
    )]
    fn start<F>(
        &mut self,
        id: ExecId,
        hook: F,
        workspace: Arc<Workspace>,
        output: Output,
        timeout: Duration,
        account: Option<Account>,
    ) -> Result<ExecHandle, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        let command = hook(&workspace.control).map_err(ExecutorError::Hook)?;
        tracing::Span::current().record(
            "program",
            tracing::field::display(command.program().display()),
        );

        let Output {
            stdout_path,
            stderr_path,
            stdout,
            stderr,
        } = output;
        let mut cmd = tokio::process::Command::from(isolation::build_command(
            &command,
            &workspace.work,
            account.as_ref(),
            stdout,
            stderr,
        ));

        let start_time = SystemTime::now();
        let mut child = cmd.spawn().map_err(ExecutorError::Spawn)?;
        let Some(pid) = child.id() else {
            return Err(ExecutorError::Internal(format!(
                "child {id} exited before its pid was known"
            )));
        };
        tracing::Span::current().record("pid", pid);
        tracing::debug!(?timeout, "spawned");

        // Arm before the monitor starts waiting on the pid.
        let killer = DeadlineKiller::new(timeout, pid);
        self.monitors.spawn(async move {
            let status = child.wait().await;
            killer.unprogram();
            Exit {
                id,
                status,
                timed_out: killer.fired(),
                end_time: SystemTime::now(),
            }
        });

        let previous = self.live.insert(
            id,
            LiveChild {
                pid,
                program: command.program().to_path_buf(),
                workspace: Arc::clone(&workspace),
                stdout_file: stdout_path.clone(),
                stderr_file: stderr_path.clone(),
                account: account.clone(),
                start_time,
            },
        );
        assert!(previous.is_none(), "duplicate live child {id}");

        Ok(ExecHandle {
            id,
            pid,
            workspace,
            stdout_file: stdout_path,
            stderr_file: stderr_path,
            account,
        })
    }

    /// Run a follow-up of `prior` to completion on the calling thread.
    ///
    /// For callers that cannot await, such as destructors. The
    /// follow-up shares `prior`'s directories, account and output
    /// files like one started by [`Executor::spawn_followup`], but it
    /// is never tracked: it is reaped here and its deadline is
    /// enforced by a helper thread. `prior` may still be running.
    /// Returns `None` if the deadline killed the follow-up.
    pub(crate) fn run_followup_blocking<F>(
        &mut self,
        hook: F,
        prior: &ExecHandle,
        timeout: Duration,
    ) -> Result<Option<ProcStatus>, ExecutorError>
    where
        F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
    {
        self.check_interrupt()?;
        self.check_live()?;

        let workspace = &prior.workspace;
        workspace.retain();
        let id = self.allocate_id();
        let result = run_to_completion(id, hook, workspace, prior, timeout);
        if let Err(e) = workspace.release() {
            tracing::warn!(%id, "failed to remove {}: {e}", workspace.root.display());
        }
        result
    }

    /// Wait for the child behind `handle`.
    ///
    /// Exits of other children observed meanwhile are kept for later
    /// waits.
    pub async fn wait(&mut self, handle: &ExecHandle) -> Result<ExitHandle, ExecutorError> {
        let exit = self.wait_for(Some(handle.id)).await?;
        self.finish(exit).await
    }

    /// Wait for whichever child terminates first.
    pub async fn wait_any(&mut self) -> Result<ExitHandle, ExecutorError> {
        let exit = self.wait_for(None).await?;
        self.finish(exit).await
    }

    /// Reap `exit` and, for core-dumping children, append a stack
    /// trace to its stderr.
    async fn finish(&mut self, exit: Exit) -> Result<ExitHandle, ExecutorError> {
        let handle = self.reap(exit)?;
        if let Some(ProcStatus::Signaled {
            core_dumped: true, ..
        }) = handle.status()
        {
            crate::stacktrace::dump(self, &handle).await?;
        }
        Ok(handle)
    }

    /// Like [`Executor::wait`], without stack trace collection.
    pub(crate) async fn wait_plain(
        &mut self,
        handle: &ExecHandle,
    ) -> Result<ExitHandle, ExecutorError> {
        let exit = self.wait_for(Some(handle.id)).await?;
        self.reap(exit)
    }

    async fn wait_for(&mut self, target: Option<ExecId>) -> Result<Exit, ExecutorError> {
        self.check_interrupt()?;
        self.check_live()?;

        let stashed = match target {
            Some(id) => self.stashed.iter().position(|exit| exit.id == id),
            None if self.stashed.is_empty() => None,
            None => Some(0),
        };
        if let Some(exit) = stashed.and_then(|index| self.stashed.remove(index)) {
            return Ok(exit);
        }
        match target {
            Some(id) if !self.live.contains_key(&id) => {
                return Err(ExecutorError::UnknownHandle(id));
            }
            None if self.monitors.is_empty() => return Err(ExecutorError::NoChildren),
            _ => {}
        }

        loop {
            let interrupts = self.interrupts.clone();
            let joined = tokio::select! {
                biased;
                _ = interrupts.wait() => None,
                joined = self.monitors.join_next() => Some(joined),
            };
            let Some(joined) = joined else {
                self.check_interrupt()?;
                continue;
            };
            let exit = match joined {
                Some(Ok(exit)) => exit,
                Some(Err(e)) => {
                    return Err(ExecutorError::Internal(format!("exit monitor failed: {e}")));
                }
                None => return Err(ExecutorError::NoChildren),
            };
            match target {
                Some(id) if id != exit.id => self.stashed.push_back(exit),
                _ => return Ok(exit),
            }
        }
    }

    fn reap(&mut self, exit: Exit) -> Result<ExitHandle, ExecutorError> {
        let Some(child) = self.live.remove(&exit.id) else {
            return Err(ExecutorError::Internal(format!(
                "exit of untracked child {}",
                exit.id
            )));
        };
        let status = exit.status.map_err(|source| {
            if let Err(e) = child.workspace.release() {
                tracing::warn!(
                    id = %exit.id,
                    "failed to remove {}: {e}",
                    child.workspace.root.display()
                );
            }
            ExecutorError::Wait {
                id: exit.id,
                source,
            }
        })?;
        let status = (!exit.timed_out).then(|| ProcStatus::from(status));
        match &status {
            Some(status) => tracing::debug!(id = %exit.id, pid = child.pid, %status, "reaped"),
            None => tracing::debug!(id = %exit.id, pid = child.pid, "reaped after timeout"),
        }

        Ok(ExitHandle {
            inner: Arc::new(ExitInner {
                id: exit.id,
                pid: child.pid,
                program: child.program,
                status,
                start_time: child.start_time,
                end_time: exit.end_time,
                workspace: child.workspace,
                stdout_file: child.stdout_file,
                stderr_file: child.stderr_file,
                account: child.account,
                cleaned: AtomicBool::new(false),
            }),
        })
    }

    /// Kill the process group of a live child. Its exit is still
    /// reported by the next matching wait.
    pub fn kill(&mut self, handle: &ExecHandle) -> Result<(), ExecutorError> {
        let Some(child) = self.live.get(&handle.id) else {
            return Ok(());
        };
        tracing::debug!(id = %handle.id, pid = child.pid, "killing child");
        kill_process_group(child.pid).map_err(|e| {
            ExecutorError::Internal(format!("failed to kill process group {}: {e}", child.pid))
        })
    }

    /// Remove the root of all tests.
    ///
    /// Expected to run after every child has been waited for and
    /// every [`ExitHandle`] cleaned up; any straggler is killed
    /// first. Idempotent.
    pub fn cleanup(&mut self) -> Result<(), ExecutorError> {
        if self.torn_down {
            return Ok(());
        }
        if self.pending() > 0 {
            tracing::warn!(
                children = self.pending(),
                "executor cleaned up with unreaped children"
            );
        }
        self.shutdown()
            .map_err(|e| ExecutorError::io("failed to remove", &self.root_path, e))
    }

    fn check_interrupt(&mut self) -> Result<(), ExecutorError> {
        if let Err(interrupted) = self.interrupts.check() {
            self.teardown();
            return Err(interrupted.into());
        }
        Ok(())
    }

    fn check_live(&self) -> Result<(), ExecutorError> {
        if self.torn_down {
            Err(ExecutorError::TornDown)
        } else {
            Ok(())
        }
    }

    fn allocate_id(&mut self) -> ExecId {
        self.next_id += 1;
        ExecId(self.next_id)
    }

    /// Kill every live child and remove every directory. Runs once;
    /// failures are logged.
    fn teardown(&mut self) {
        if self.torn_down {
            return;
        }
        if let Err(e) = self.shutdown() {
            tracing::warn!(
                root = %self.root_path.display(),
                "failed to remove root of all tests: {e}"
            );
        }
    }

    /// Live children whose exit has not been observed yet. The pid of
    /// a stashed exit may already belong to an unrelated process.
    fn unexited(&self) -> impl Iterator<Item = (ExecId, u32)> + '_ {
        self.live
            .iter()
            .filter(|(id, _)| !self.stashed.iter().any(|exit| exit.id == **id))
            .map(|(id, child)| (*id, child.pid))
    }

    fn shutdown(&mut self) -> std::io::Result<()> {
        self.torn_down = true;
        let unexited: Vec<(ExecId, u32)> = self.unexited().collect();
        self.live.clear();
        for (id, pid) in unexited {
            tracing::debug!(%id, pid, "killing unreaped child");
            if let Err(e) = kill_process_group(pid) {
                tracing::warn!(%id, pid, "failed to kill process group: {e}");
            }
        }
        self.monitors.abort_all();
        self.monitors.detach_all();
        self.stashed.clear();

        let Some(root) = self.root.take() else {
            return Ok(());
        };
        if let Err(e) = root.close() {
            tracing::debug!("retrying removal of {}: {e}", self.root_path.display());
            match remove_tree(&self.root_path) {
                Err(e) if e.kind() != std::io::ErrorKind::NotFound => return Err(e),
                _ => {}
            }
        }
        tracing::debug!(root = %self.root_path.display(), "executor cleaned up");
        Ok(())
    }
}

impl Drop for Executor {
    fn drop(&mut self) {
        self.teardown();
    }
}

impl fmt::Debug for Executor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Executor")
            .field("root", &self.root_path)
            .field("live", &self.live.len())
            .field("torn_down", &self.torn_down)
            .finish()
    }
}

/// Output files of a child, opened and ready to hand over.
struct Output {
    stdout_path: PathBuf,
    stderr_path: PathBuf,
    stdout: File,
    stderr: File,
}

impl Output {
    fn truncate(stdout: &Path, stderr: &Path) -> Result<Self, ExecutorError> {
        let mut options = OpenOptions::new();
        options.write(true).create(true).truncate(true);
        Self::open(&options, stdout, stderr)
    }

    fn append(stdout: &Path, stderr: &Path) -> Result<Self, ExecutorError> {
        let mut options = OpenOptions::new();
        options.append(true).create(true);
        Self::open(&options, stdout, stderr)
    }

    fn open(options: &OpenOptions, stdout: &Path, stderr: &Path) -> Result<Self, ExecutorError> {
        let open = |path: &Path| {
            options
                .open(path)
                .map_err(|e| ExecutorError::io("failed to open", path, e))
        };
        let stdout_file = open(stdout)?;
        // Both streams may go to the same file; share one description
        // so appends interleave instead of overwriting each other.
        let stderr_file = if stdout == stderr {
            stdout_file
                .try_clone()
                .map_err(|e| ExecutorError::io("failed to duplicate", stderr, e))?
        } else {
            open(stderr)?
        };
        Ok(Self {
            stdout_path: stdout.to_path_buf(),
            stderr_path: stderr.to_path_buf(),
            stdout: stdout_file,
            stderr: stderr_file,
        })
    }
}

#[tracing::instrument(level = "debug", skip_all, fields(id = %id, pid = tracing::field::Empty))]
fn run_to_completion<F>(
    id: ExecId,
    hook: F,
    workspace: &Workspace,
    prior: &ExecHandle,
    timeout: Duration,
) -> Result<Option<ProcStatus>, ExecutorError>
where
    F: FnOnce(&Path) -> anyhow::Result<ProcessCommand>,
{
    let command = hook(&workspace.control).map_err(ExecutorError::Hook)?;
    let Output { stdout, stderr, .. } = Output::append(&prior.stdout_file, &prior.stderr_file)?;
    let mut child = isolation::build_command(
        &command,
        &workspace.work,
        prior.account.as_ref(),
        stdout,
        stderr,
    )
    .spawn()
    .map_err(ExecutorError::Spawn)?;
    let pid = child.id();
    tracing::Span::current().record("pid", pid);
    tracing::debug!(?timeout, "spawned");

    // Dropping `disarm` wakes the killer before its deadline.
    let (disarm, disarmed) = mpsc::channel::<()>();
    let killer = std::thread::spawn(move || match disarmed.recv_timeout(timeout) {
        Err(RecvTimeoutError::Timeout) => {
            tracing::info!(pid, ?timeout, "deadline exceeded; killing process group");
            if let Err(e) = kill_process_group(pid) {
                tracing::warn!(pid, "failed to kill process group: {e}");
            }
            true
        }
        _ => false,
    });
    let status = child.wait();
    drop(disarm);
    let timed_out = killer.join().unwrap_or(false);

    let status = status.map_err(|source| ExecutorError::Wait { id, source })?;
    let status = (!timed_out).then(|| ProcStatus::from(status));
    match &status {
        Some(status) => tracing::debug!(%status, "reaped"),
        None => tracing::debug!("reaped after timeout"),
    }
    Ok(status)
}

/// Remove a directory tree, restoring write permissions on
/// directories a child may have locked down.
fn remove_tree(path: &Path) -> std::io::Result<()> {
    match std::fs::remove_dir_all(path) {
        Err(e) if e.kind() == std::io::ErrorKind::PermissionDenied => {
            make_writable(path);
            std::fs::remove_dir_all(path)
        }
        result => result,
    }
}

fn make_writable(path: &Path) {
    let Ok(metadata) = std::fs::symlink_metadata(path) else {
        return;
    };
    if !metadata.is_dir() {
        return;
    }
    let _ = std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o755));
    if let Ok(entries) = std::fs::read_dir(path) {
        for entry in entries.flatten() {
            make_writable(&entry.path());
        }
    }
}
