/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test-case scheduling on top of the [`Executor`].
//!
//! [`SchedulerHandle`] turns "run this test case" into exactly one
//! [`ResultHandle`], no matter how many processes it takes to get
//! there. Each spawned process has a record in the execution table,
//! tagged with its role:
//!
//! - [`ExecData::Test`]: the body of a test case. The record lives
//!   until the caller cleans up the resulting [`ResultHandle`].
//! - [`ExecData::Cleanup`] and [`ExecData::SecondaryCleanup`]: steps
//!   chained behind a body. They are never reported on their own;
//!   their outcome is folded into the body's result and their record
//!   is dropped as soon as they are reaped.
//!
//! ## Result merging
//!
//! A bad body result (failed or broken) always wins. Otherwise a
//! chained step that times out, crashes or exits with a non-zero code
//! downgrades the result to broken; a clean exit keeps it.
//!
//! ## Teardown
//!
//! [`SchedulerHandle::cleanup`] runs once, on every exit path when
//! the scheduler is used through [`with_scheduler`] or
//! [`SchedulerHandle::run`]: cleanup routines still owed by
//! unfinished test cases run to completion, failures are logged, and
//! the executor removes every remaining directory.
//!
//! A scheduler dropped without that teardown, for instance because
//! the future driving it was cancelled or panicked, still runs the
//! owed routines from `Drop`. They run synchronously, each bounded
//! by its test case's timeout, before the executor's own sweep.

use std::collections::HashMap;
use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::MutexGuard;
use std::sync::PoisonError;
use std::time::Duration;
use std::time::SystemTime;

use anyhow::Context;
use futures::future::BoxFuture;

use crate::config::ConfigVars;
use crate::config::SupervisorConfig;
use crate::executor::Account;
use crate::executor::ExecHandle;
use crate::executor::ExecId;
use crate::executor::Executor;
use crate::executor::ExecutorError;
use crate::executor::ExitHandle;
use crate::executor::ProcStatus;
use crate::executor::ProcessCommand;
use crate::executor::SpawnOptions;
use crate::interface::Interface;
use crate::interface::InterfaceRegistry;
use crate::interrupts::Interrupts;
use crate::model::RequiredUser;
use crate::model::TestCase;
use crate::model::TestProgram;
use crate::model::TestResult;

/// Exit code of a child that skipped the test body because a
/// precondition failed. Only meaningful together with the
/// [`SKIPPED_COOKIE_NAME`] file.
pub const EXIT_SKIPPED: i32 = 84;

/// File in the control directory holding the reason a test case was
/// skipped.
pub const SKIPPED_COOKIE_NAME: &str = "skipped.txt";

/// Name of the placeholder test case reported when listing a test
/// program fails.
pub const LIST_FAILURE_TEST_CASE: &str = "__test_cases_list__";

/// Errors returned by the [`SchedulerHandle`].
#[derive(Debug, thiserror::Error)]
pub enum SchedulerError {
    #[error("unknown interface '{0}'")]
    UnknownInterface(String),

    #[error("unknown test case '{case}' in test program {program}")]
    UnknownTestCase { program: String, case: String },

    #[error(transparent)]
    Executor(#[from] ExecutorError),

    #[error("cannot run as unprivileged user: {0:#}")]
    Account(anyhow::Error),

    #[error("{action} {}: {source}", path.display())]
    Io {
        action: &'static str,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot debug a test case while other test cases are running")]
    Busy,

    #[error("internal scheduler error: {0}")]
    Internal(String),
}

impl SchedulerError {
    /// Whether the error reports a raised interrupt flag.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, SchedulerError::Executor(e) if e.is_interrupted())
    }
}

/// Steps that can be chained behind a test body.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChainStep {
    Cleanup,
    SecondaryCleanup,
}

impl fmt::Display for ChainStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ChainStep::Cleanup => f.write_str("cleanup"),
            ChainStep::SecondaryCleanup => f.write_str("secondary cleanup"),
        }
    }
}

/// Record of a test body.
struct TestExecData {
    program: Arc<TestProgram>,
    case_name: String,
    interface: Arc<dyn Interface>,
    vars: ConfigVars,
    fake_result: Option<TestResult>,
    timeout: Duration,
    needs_cleanup: bool,
    needs_secondary_cleanup: bool,
    handle: ExecHandle,
    /// Set once the body has been reaped.
    exit: Option<ExitHandle>,
}

impl TestExecData {
    /// Next step owed by this test case, marking it as no longer owed.
    fn take_next_step(&mut self) -> Option<ChainStep> {
        if std::mem::take(&mut self.needs_cleanup) {
            Some(ChainStep::Cleanup)
        } else if std::mem::take(&mut self.needs_secondary_cleanup) {
            Some(ChainStep::SecondaryCleanup)
        } else {
            None
        }
    }

    fn owes_steps(&self) -> bool {
        self.needs_cleanup || self.needs_secondary_cleanup
    }
}

/// Record of a step chained behind a test body.
struct CleanupExecData {
    /// Key of the body's [`ExecData::Test`] record.
    original: ExecId,
    handle: ExecHandle,
    body: ExitHandle,
    body_result: TestResult,
}

/// Execution table entry, tagged by role.
enum ExecData {
    Test(TestExecData),
    Cleanup(CleanupExecData),
    SecondaryCleanup(CleanupExecData),
}

type ExecTable = Arc<Mutex<HashMap<ExecId, ExecData>>>;

fn lock_table(table: &ExecTable) -> MutexGuard<'_, HashMap<ExecId, ExecData>> {
    table.lock().unwrap_or_else(PoisonError::into_inner)
}

fn insert_record(table: &ExecTable, id: ExecId, data: ExecData) {
    if lock_table(table).insert(id, data).is_some() {
        panic!("execution record {id} inserted twice; scheduling bug");
    }
}

/// Outcome of processing one reaped child.
enum Progress {
    /// A chained step was spawned; the logical test is not done.
    Pending,
    Done(ResultHandle),
}

/// The final result of one test case.
///
/// Holds the test body's directories (and therefore its captured
/// output) until [`ResultHandle::cleanup`] is called.
pub struct ResultHandle {
    id: ExecId,
    program: Arc<TestProgram>,
    case_name: String,
    result: TestResult,
    exit: ExitHandle,
    table: ExecTable,
}

impl ResultHandle {
    /// Id of the test body, as returned by
    /// [`SchedulerHandle::spawn_test`].
    pub fn id(&self) -> ExecId {
        self.id
    }

    pub fn original_pid(&self) -> u32 {
        self.exit.original_pid()
    }

    pub fn test_program(&self) -> &Arc<TestProgram> {
        &self.program
    }

    pub fn test_case_name(&self) -> &str {
        &self.case_name
    }

    pub fn test_result(&self) -> &TestResult {
        &self.result
    }

    /// The test body's exit, never that of a chained step.
    pub fn exit(&self) -> &ExitHandle {
        &self.exit
    }

    pub fn start_time(&self) -> SystemTime {
        self.exit.start_time()
    }

    pub fn end_time(&self) -> SystemTime {
        self.exit.end_time()
    }

    pub fn work_directory(&self) -> &Path {
        self.exit.work_directory()
    }

    pub fn stdout_file(&self) -> &Path {
        self.exit.stdout_file()
    }

    pub fn stderr_file(&self) -> &Path {
        self.exit.stderr_file()
    }

    /// Forget the test case and delete its directories. Idempotent.
    pub fn cleanup(&self) -> Result<(), SchedulerError> {
        lock_table(&self.table).remove(&self.id);
        Ok(self.exit.cleanup()?)
    }
}

impl fmt::Debug for ResultHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ResultHandle")
            .field("id", &self.id)
            .field("program", &self.program.to_string())
            .field("case_name", &self.case_name)
            .field("result", &self.result)
            .finish()
    }
}

/// Runs test cases and reports one result per test case.
pub struct SchedulerHandle {
    executor: Executor,
    interfaces: InterfaceRegistry,
    table: ExecTable,
    finalized: bool,
}

impl SchedulerHandle {
    /// Create a scheduler observing the process-wide interrupt flag.
    pub fn new(
        interfaces: InterfaceRegistry,
        config: &SupervisorConfig,
    ) -> Result<Self, SchedulerError> {
        Self::with_interrupts(interfaces, config, Interrupts::global())
    }

    /// Create a scheduler observing `interrupts`.
    pub fn with_interrupts(
        interfaces: InterfaceRegistry,
        config: &SupervisorConfig,
        interrupts: Interrupts,
    ) -> Result<Self, SchedulerError> {
        Ok(Self {
            executor: Executor::new(config, interrupts)?,
            interfaces,
            table: Arc::new(Mutex::new(HashMap::new())),
            finalized: false,
        })
    }

    /// Directory holding the directories of every test case.
    pub fn root_path(&self) -> &Path {
        self.executor.root_path()
    }

    pub fn interrupts(&self) -> &Interrupts {
        self.executor.interrupts()
    }

    fn find_interface(&self, program: &TestProgram) -> Result<Arc<dyn Interface>, SchedulerError> {
        self.interfaces
            .find(program.interface_name())
            .ok_or_else(|| SchedulerError::UnknownInterface(program.interface_name().to_string()))
    }

    /// List the test cases of `program`.
    ///
    /// Failing to run the listing, or to make sense of its output,
    /// yields a single [`LIST_FAILURE_TEST_CASE`] placeholder whose
    /// precomputed result is broken. Only an unknown interface and
    /// interrupts are reported as errors.
    #[tracing::instrument(level = "debug", skip_all, fields(program = %program))]
    pub async fn list_tests(
        &mut self,
        program: &TestProgram,
        config: &SupervisorConfig,
    ) -> Result<Vec<TestCase>, SchedulerError> {
        let interface = self.find_interface(program)?;
        let vars = config.test_suite_vars(program.test_suite_name());

        match self
            .run_listing(interface.as_ref(), program, &vars, config.list_timeout)
            .await?
        {
            Ok(test_cases) if !test_cases.is_empty() => Ok(test_cases),
            Ok(_) => Ok(vec![list_failure("Empty test cases list".to_string())]),
            Err(e) => {
                tracing::warn!("failed to list test cases: {e:#}");
                Ok(vec![list_failure(format!("{e:#}"))])
            }
        }
    }

    /// Run the listing child of `program`. The outer error is reserved
    /// for interrupts.
    async fn run_listing(
        &mut self,
        interface: &dyn Interface,
        program: &TestProgram,
        vars: &ConfigVars,
        timeout: Duration,
    ) -> Result<anyhow::Result<Vec<TestCase>>, ExecutorError> {
        let command = interface.exec_list(program, vars);
        let handle = match self.executor.spawn(|_| Ok(command), SpawnOptions::new(timeout)) {
            Ok(handle) => handle,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => return Ok(Err(e.into())),
        };
        let exit = match self.executor.wait(&handle).await {
            Ok(exit) => exit,
            Err(e) if e.is_interrupted() => return Err(e),
            Err(e) => return Ok(Err(e.into())),
        };

        let parsed = interface.parse_list(exit.status(), exit.stdout_file(), exit.stderr_file());
        if let Err(e) = exit.cleanup() {
            tracing::warn!("failed to clean up after listing: {e}");
        }
        Ok(parsed)
    }

    /// Start the body of `case_name`.
    ///
    /// Test cases with a precomputed result still spawn a (trivial)
    /// child; the result is taken as-is once it is reaped. Test cases
    /// whose requirements are not met spawn a child that only reports
    /// the skip.
    #[tracing::instrument(level = "debug", skip_all, fields(program = %program, case = case_name))]
    pub fn spawn_test(
        &mut self,
        program: &Arc<TestProgram>,
        case_name: &str,
        config: &SupervisorConfig,
    ) -> Result<ExecHandle, SchedulerError> {
        let interface = self.find_interface(program)?;
        let case = program
            .find(case_name)
            .ok_or_else(|| SchedulerError::UnknownTestCase {
                program: program.to_string(),
                case: case_name.to_string(),
            })?;
        let metadata = case.metadata();
        let vars = config.test_suite_vars(program.test_suite_name());
        let fake_result = case.fake_result().cloned();

        let account = match (&config.unprivileged_user, metadata.required_user) {
            (Some(user), Some(RequiredUser::Unprivileged)) if nix::unistd::geteuid().is_root() => {
                Some(Account::lookup(user).map_err(SchedulerError::Account)?)
            }
            _ => None,
        };
        let skip_reason = match fake_result {
            Some(_) => None,
            None => metadata.check_requirements(config, program.test_suite_name()),
        };

        let hook = |control: &Path| -> anyhow::Result<ProcessCommand> {
            if fake_result.is_some() {
                return Ok(ProcessCommand::exit(0));
            }
            if let Some(reason) = &skip_reason {
                let cookie = control.join(SKIPPED_COOKIE_NAME);
                std::fs::write(&cookie, reason)
                    .with_context(|| format!("failed to write {}", cookie.display()))?;
                return Ok(ProcessCommand::exit(EXIT_SKIPPED));
            }
            Ok(interface.exec_test(program, case_name, &vars, control))
        };
        let options = SpawnOptions {
            account,
            ..SpawnOptions::new(metadata.timeout)
        };
        let handle = self.executor.spawn(hook, options)?;
        tracing::debug!(id = %handle.id(), pid = handle.pid(), "test case spawned");

        insert_record(
            &self.table,
            handle.id(),
            ExecData::Test(TestExecData {
                program: Arc::clone(program),
                case_name: case_name.to_string(),
                interface,
                vars,
                fake_result,
                timeout: metadata.timeout,
                needs_cleanup: metadata.has_cleanup,
                needs_secondary_cleanup: metadata.has_secondary_cleanup,
                handle: handle.clone(),
                exit: None,
            }),
        );
        Ok(handle)
    }

    /// Wait for any test case to complete, cleanup steps included.
    pub async fn wait_any(&mut self) -> Result<ResultHandle, SchedulerError> {
        loop {
            let exit = self.executor.wait_any().await?;
            match self.process_exit(exit)? {
                Progress::Pending => continue,
                Progress::Done(result) => return Ok(result),
            }
        }
    }

    fn process_exit(&mut self, exit: ExitHandle) -> Result<Progress, SchedulerError> {
        let data = lock_table(&self.table).remove(&exit.id());
        match data {
            Some(ExecData::Test(test)) => self.process_test_exit(test, exit),
            Some(ExecData::Cleanup(cleanup)) => {
                self.process_chain_exit(cleanup, exit, ChainStep::Cleanup)
            }
            Some(ExecData::SecondaryCleanup(cleanup)) => {
                self.process_chain_exit(cleanup, exit, ChainStep::SecondaryCleanup)
            }
            None => Err(SchedulerError::Internal(format!(
                "reaped child {} has no execution record",
                exit.id()
            ))),
        }
    }

    fn process_test_exit(
        &mut self,
        mut test: TestExecData,
        exit: ExitHandle,
    ) -> Result<Progress, SchedulerError> {
        let result = match &test.fake_result {
            Some(result) => result.clone(),
            None => match read_skip_cookie(&exit) {
                Some(reason) => {
                    test.needs_cleanup = false;
                    test.needs_secondary_cleanup = false;
                    TestResult::Skipped(reason)
                }
                None => test.interface.compute_result(
                    exit.status(),
                    exit.control_directory(),
                    exit.stdout_file(),
                    exit.stderr_file(),
                ),
            },
        };
        tracing::debug!(id = %exit.id(), case = %test.case_name, %result, "test body finished");

        if !result.is_good() {
            report_leftover_files(&exit);
        }
        test.exit = Some(exit.clone());
        self.advance(exit.id(), test, exit, result)
    }

    fn process_chain_exit(
        &mut self,
        cleanup: CleanupExecData,
        exit: ExitHandle,
        step: ChainStep,
    ) -> Result<Progress, SchedulerError> {
        let result = merge_step_result(cleanup.body_result, exit.status(), step);
        if let Err(e) = exit.cleanup() {
            tracing::warn!("failed to clean up after {step}: {e}");
        }

        let test = match lock_table(&self.table).remove(&cleanup.original) {
            Some(ExecData::Test(test)) => test,
            _ => {
                return Err(SchedulerError::Internal(format!(
                    "{step} {} has no test record",
                    cleanup.original
                )));
            }
        };
        self.advance(cleanup.original, test, cleanup.body, result)
    }

    /// Spawn the next step owed by `test`, or finalize it if none is
    /// left. Steps that fail to spawn are skipped, downgrading a good
    /// result to broken.
    fn advance(
        &mut self,
        id: ExecId,
        mut test: TestExecData,
        body: ExitHandle,
        mut result: TestResult,
    ) -> Result<Progress, SchedulerError> {
        loop {
            let Some(step) = test.take_next_step() else {
                let done = ResultHandle {
                    id,
                    program: Arc::clone(&test.program),
                    case_name: test.case_name.clone(),
                    result,
                    exit: body,
                    table: Arc::clone(&self.table),
                };
                insert_record(&self.table, id, ExecData::Test(test));
                return Ok(Progress::Done(done));
            };

            match self.spawn_step(&test, &body, step) {
                Ok(handle) => {
                    tracing::debug!(%id, %step, step_id = %handle.id(), "chained step spawned");
                    let step_id = handle.id();
                    let cleanup = CleanupExecData {
                        original: id,
                        handle,
                        body,
                        body_result: result,
                    };
                    insert_record(&self.table, id, ExecData::Test(test));
                    let data = match step {
                        ChainStep::Cleanup => ExecData::Cleanup(cleanup),
                        ChainStep::SecondaryCleanup => ExecData::SecondaryCleanup(cleanup),
                    };
                    insert_record(&self.table, step_id, data);
                    return Ok(Progress::Pending);
                }
                Err(e) if e.is_interrupted() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(%id, "failed to spawn {step}: {e}");
                    if result.is_good() {
                        result =
                            TestResult::Broken(format!("Failed to spawn test case {step}: {e}"));
                    }
                }
            }
        }
    }

    fn spawn_step(
        &mut self,
        test: &TestExecData,
        body: &ExitHandle,
        step: ChainStep,
    ) -> Result<ExecHandle, ExecutorError> {
        let hook = |control: &Path| -> anyhow::Result<ProcessCommand> {
            Ok(step_command(test, step, control))
        };
        self.executor.spawn_followup(hook, body, test.timeout)
    }

    /// Run a single test case and copy its output to the given
    /// files. Refuses to run while other test cases are in flight.
    pub async fn debug_test(
        &mut self,
        program: &Arc<TestProgram>,
        case_name: &str,
        config: &SupervisorConfig,
        stdout_target: &Path,
        stderr_target: &Path,
    ) -> Result<ResultHandle, SchedulerError> {
        if self.executor.pending() > 0 {
            return Err(SchedulerError::Busy);
        }
        self.spawn_test(program, case_name, config)?;
        let result = self.wait_any().await?;

        for (from, to) in [
            (result.stdout_file(), stdout_target),
            (result.stderr_file(), stderr_target),
        ] {
            std::fs::copy(from, to).map_err(|source| SchedulerError::Io {
                action: "failed to copy output to",
                path: to.to_path_buf(),
                source,
            })?;
        }
        Ok(result)
    }

    /// Run `body` against this scheduler, then [`Self::cleanup`]
    /// regardless of how `body` returned.
    ///
    /// An error from `body` takes precedence over one from cleanup.
    pub async fn run<T, F>(mut self, body: F) -> Result<T, SchedulerError>
    where
        F: for<'a> FnOnce(&'a mut SchedulerHandle) -> BoxFuture<'a, Result<T, SchedulerError>>,
    {
        let result = body(&mut self).await;
        let cleanup = self.cleanup().await;
        let value = result?;
        cleanup?;
        Ok(value)
    }

    /// Tear the scheduler down.
    ///
    /// Every test case that still owes a cleanup or secondary cleanup
    /// gets it, exactly once: a body that is still running is killed
    /// first, chained steps already running are waited for. Failures
    /// of these steps are logged, not returned. Finally every
    /// directory is removed. Only the first call does anything.
    pub async fn cleanup(&mut self) -> Result<(), SchedulerError> {
        if std::mem::replace(&mut self.finalized, true) {
            return Ok(());
        }

        let mut records: Vec<(ExecId, ExecData)> = lock_table(&self.table).drain().collect();
        records.sort_by_key(|(id, _)| *id);
        let mut tests = Vec::new();
        let mut in_flight = Vec::new();
        for (_, data) in records {
            match data {
                ExecData::Test(test) if test.owes_steps() => tests.push(test),
                ExecData::Test(_) => {}
                ExecData::Cleanup(step) | ExecData::SecondaryCleanup(step) => in_flight.push(step),
            }
        }

        let mut outcome = Ok(());
        for step in in_flight {
            match self.executor.wait(&step.handle).await {
                Ok(exit) => {
                    if let Err(e) = exit.cleanup() {
                        tracing::warn!("failed to clean up chained step: {e}");
                    }
                }
                Err(e) if e.is_interrupted() => {
                    outcome = Err(e.into());
                    break;
                }
                Err(e) => tracing::warn!("failed to wait for chained step: {e}"),
            }
        }
        if outcome.is_ok() {
            for test in tests {
                if let Err(e) = self.finish_abandoned(test).await {
                    outcome = Err(e);
                    break;
                }
            }
        }

        if let Err(e) = self.executor.cleanup() {
            tracing::warn!("failed to clean up executor: {e}");
            if outcome.is_ok() {
                outcome = Err(e.into());
            }
        }
        outcome
    }

    /// Run the steps still owed by an unfinished test case. Returns
    /// an error only when interrupted.
    async fn finish_abandoned(&mut self, mut test: TestExecData) -> Result<(), SchedulerError> {
        let body = match test.exit.take() {
            Some(exit) => exit,
            None => {
                tracing::info!(
                    case = %test.case_name,
                    pid = test.handle.pid(),
                    "killing unfinished test body"
                );
                if let Err(e) = self.executor.kill(&test.handle) {
                    tracing::warn!(case = %test.case_name, "{e}");
                }
                match self.executor.wait(&test.handle).await {
                    Ok(exit) => exit,
                    Err(e) if e.is_interrupted() => return Err(e.into()),
                    Err(e) => {
                        tracing::warn!(case = %test.case_name, "failed to wait for test body: {e}");
                        return Ok(());
                    }
                }
            }
        };

        while let Some(step) = test.take_next_step() {
            let handle = match self.spawn_step(&test, &body, step) {
                Ok(handle) => handle,
                Err(e) if e.is_interrupted() => return Err(e.into()),
                Err(e) => {
                    tracing::warn!(case = %test.case_name, "failed to spawn {step}: {e}");
                    continue;
                }
            };
            match self.executor.wait(&handle).await {
                Ok(exit) => {
                    log_step_outcome(&test.case_name, step, exit.status());
                    if let Err(e) = exit.cleanup() {
                        tracing::warn!("failed to clean up after {step}: {e}");
                    }
                }
                Err(e) if e.is_interrupted() => return Err(e.into()),
                Err(e) => tracing::warn!(case = %test.case_name, "failed to wait for {step}: {e}"),
            }
        }

        if let Err(e) = body.cleanup() {
            tracing::warn!("failed to clean up test body: {e}");
        }
        Ok(())
    }

    /// [`Self::finish_abandoned`] for callers that cannot await. A
    /// running body is killed but not reaped; the owed steps run in
    /// its directories all the same. Returns an error only when
    /// interrupted.
    fn finish_abandoned_blocking(&mut self, mut test: TestExecData) -> Result<(), ExecutorError> {
        if test.exit.is_none() {
            tracing::info!(
                case = %test.case_name,
                pid = test.handle.pid(),
                "killing unfinished test body"
            );
            if let Err(e) = self.executor.kill(&test.handle) {
                tracing::warn!(case = %test.case_name, "{e}");
            }
        }

        while let Some(step) = test.take_next_step() {
            let hook = |control: &Path| -> anyhow::Result<ProcessCommand> {
                Ok(step_command(&test, step, control))
            };
            match self
                .executor
                .run_followup_blocking(hook, &test.handle, test.timeout)
            {
                Ok(status) => log_step_outcome(&test.case_name, step, status.as_ref()),
                Err(e) if e.is_interrupted() => return Err(e),
                Err(e) => tracing::warn!(case = %test.case_name, "failed to run {step}: {e}"),
            }
        }
        Ok(())
    }
}

impl Drop for SchedulerHandle {
    fn drop(&mut self) {
        if std::mem::replace(&mut self.finalized, true) {
            return;
        }

        let mut records: Vec<(ExecId, ExecData)> = lock_table(&self.table).drain().collect();
        records.sort_by_key(|(id, _)| *id);
        let mut tests = Vec::new();
        for (id, data) in records {
            match data {
                ExecData::Test(test) if test.owes_steps() => tests.push(test),
                ExecData::Test(_) => {}
                ExecData::Cleanup(step) | ExecData::SecondaryCleanup(step) => {
                    tracing::debug!(%id, original = %step.original, "killing chained step");
                    if let Err(e) = self.executor.kill(&step.handle) {
                        tracing::warn!(%id, "{e}");
                    }
                }
            }
        }
        if tests.is_empty() {
            return;
        }

        tracing::warn!(
            owed = tests.len(),
            "scheduler dropped without cleanup; running pending cleanup routines"
        );
        for test in tests {
            if let Err(e) = self.finish_abandoned_blocking(test) {
                tracing::warn!("abandoning pending cleanup routines: {e}");
                break;
            }
        }
    }
}

impl fmt::Debug for SchedulerHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SchedulerHandle")
            .field("executor", &self.executor)
            .field("interfaces", &self.interfaces)
            .field("records", &lock_table(&self.table).len())
            .finish()
    }
}

/// Create a scheduler, run `body` against it and tear it down, on
/// success and failure alike.
pub async fn with_scheduler<T, F>(
    interfaces: InterfaceRegistry,
    config: &SupervisorConfig,
    body: F,
) -> Result<T, SchedulerError>
where
    F: for<'a> FnOnce(&'a mut SchedulerHandle) -> BoxFuture<'a, Result<T, SchedulerError>>,
{
    SchedulerHandle::new(interfaces, config)?.run(body).await
}

fn step_command(test: &TestExecData, step: ChainStep, control: &Path) -> ProcessCommand {
    let TestExecData {
        interface,
        program,
        case_name,
        vars,
        ..
    } = test;
    match step {
        ChainStep::Cleanup => interface.exec_cleanup(program, case_name, vars, control),
        ChainStep::SecondaryCleanup => {
            interface.exec_secondary_cleanup(program, case_name, vars, control)
        }
    }
}

fn log_step_outcome(case: &str, step: ChainStep, status: Option<&ProcStatus>) {
    match status {
        Some(status) if status.success() => tracing::debug!(case, "{step} succeeded"),
        Some(status) => tracing::warn!(case, "{step} {status}"),
        None => tracing::warn!(case, "{step} timed out"),
    }
}

fn list_failure(reason: String) -> TestCase {
    TestCase::with_fake_result(
        LIST_FAILURE_TEST_CASE,
        "Represents the correct processing of the test cases list",
        TestResult::Broken(reason),
    )
}

/// The skip reason left by a child that bailed out before running
/// the test body. The reason is free text written by the test; bytes
/// that are not UTF-8 are replaced rather than losing the skip.
fn read_skip_cookie(exit: &ExitHandle) -> Option<String> {
    if !exit.status()?.exited_with(EXIT_SKIPPED) {
        return None;
    }
    let reason = std::fs::read(exit.control_directory().join(SKIPPED_COOKIE_NAME)).ok()?;
    Some(String::from_utf8_lossy(&reason).into_owned())
}

fn merge_step_result(
    body_result: TestResult,
    status: Option<&ProcStatus>,
    step: ChainStep,
) -> TestResult {
    if !body_result.is_good() {
        return body_result;
    }
    match status {
        Some(status) if status.success() => body_result,
        Some(status) => TestResult::Broken(format!("Test case {step} {status}")),
        None => TestResult::Broken(format!("Test case {step} timed out")),
    }
}

/// Append the names of files left in the work directory to stderr.
fn report_leftover_files(exit: &ExitHandle) {
    let Ok(entries) = std::fs::read_dir(exit.work_directory()) else {
        return;
    };
    let mut names: Vec<String> = entries
        .flatten()
        .map(|entry| entry.file_name().to_string_lossy().into_owned())
        .collect();
    if names.is_empty() {
        return;
    }
    names.sort();

    use std::io::Write;
    let line = format!("Files left in work directory after failure: {}", names.join(", "));
    let result = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(exit.stderr_file())
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = result {
        tracing::warn!("failed to report leftover files: {e}");
    }
}
