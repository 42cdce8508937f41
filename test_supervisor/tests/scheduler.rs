/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! End-to-end scheduler tests driven by shell-script test cases.

use std::collections::BTreeSet;
use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use test_supervisor::Interface;
use test_supervisor::InterfaceRegistry;
use test_supervisor::ProcStatus;
use test_supervisor::SchedulerHandle;
use test_supervisor::SupervisorConfig;
use test_supervisor::TestResult;
use test_supervisor::config::ConfigVars;
use test_supervisor::executor::ProcessCommand;
use test_supervisor::interrupts::Interrupts;
use test_supervisor::model::Metadata;
use test_supervisor::model::TestCase;
use test_supervisor::model::TestProgram;
use test_supervisor::result::RESULTS_FILE_NAME;
use test_supervisor::result::calculate_result;
use test_supervisor::scheduler::EXIT_SKIPPED;
use test_supervisor::scheduler::LIST_FAILURE_TEST_CASE;
use test_supervisor::scheduler::SKIPPED_COOKIE_NAME;
use test_supervisor::scheduler::SchedulerError;
use tracing_test::traced_test;

const WAIT: Duration = Duration::from_secs(30);

#[derive(Debug, Clone, Default)]
struct Script {
    body: String,
    cleanup: String,
    secondary_cleanup: String,
}

/// Interface whose test cases are shell snippets. The body reports
/// its result by writing to `$RESULT_FILE` and may skip itself by
/// writing a reason to `$SKIP_COOKIE`.
#[derive(Debug, Default)]
struct ScriptInterface {
    list: String,
    scripts: HashMap<String, Script>,
}

impl ScriptInterface {
    fn script(&self, case_name: &str) -> Script {
        self.scripts.get(case_name).cloned().unwrap_or_default()
    }
}

impl Interface for ScriptInterface {
    fn exec_list(&self, _program: &TestProgram, _vars: &ConfigVars) -> ProcessCommand {
        ProcessCommand::shell(&self.list)
    }

    fn parse_list(
        &self,
        status: Option<&ProcStatus>,
        stdout: &Path,
        _stderr: &Path,
    ) -> anyhow::Result<Vec<TestCase>> {
        match status {
            Some(status) if status.success() => {}
            Some(status) => anyhow::bail!("listing {status}"),
            None => anyhow::bail!("listing timed out"),
        }
        Ok(std::fs::read_to_string(stdout)?
            .lines()
            .map(|name| TestCase::new(name, Metadata::default()))
            .collect())
    }

    fn exec_test(
        &self,
        _program: &TestProgram,
        case_name: &str,
        _vars: &ConfigVars,
        control_directory: &Path,
    ) -> ProcessCommand {
        ProcessCommand::shell(self.script(case_name).body)
            .env("RESULT_FILE", control_directory.join(RESULTS_FILE_NAME))
            .env("SKIP_COOKIE", control_directory.join(SKIPPED_COOKIE_NAME))
    }

    fn exec_cleanup(
        &self,
        _program: &TestProgram,
        case_name: &str,
        _vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        ProcessCommand::shell(self.script(case_name).cleanup)
    }

    fn exec_secondary_cleanup(
        &self,
        _program: &TestProgram,
        case_name: &str,
        _vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        ProcessCommand::shell(self.script(case_name).secondary_cleanup)
    }

    fn compute_result(
        &self,
        status: Option<&ProcStatus>,
        control_directory: &Path,
        _stdout: &Path,
        _stderr: &Path,
    ) -> TestResult {
        calculate_result(status, &control_directory.join(RESULTS_FILE_NAME))
    }
}

struct Fixture {
    dir: tempfile::TempDir,
    config: SupervisorConfig,
    interrupts: Interrupts,
}

impl Fixture {
    fn new() -> Self {
        let dir = tempfile::tempdir().unwrap();
        let config = SupervisorConfig {
            work_root: Some(dir.path().to_path_buf()),
            ..Default::default()
        };
        Self {
            dir,
            config,
            interrupts: Interrupts::new(),
        }
    }

    /// File outside every work directory, for scripts to leave traces in.
    fn log(&self) -> PathBuf {
        self.dir.path().join("log")
    }

    fn read_log(&self) -> String {
        std::fs::read_to_string(self.log()).unwrap_or_default()
    }

    fn scheduler(&self, interface: ScriptInterface) -> SchedulerHandle {
        let mut registry = InterfaceRegistry::new();
        registry.register("script", interface).unwrap();
        SchedulerHandle::with_interrupts(registry, &self.config, self.interrupts.clone()).unwrap()
    }
}

fn program(cases: Vec<TestCase>) -> Arc<TestProgram> {
    Arc::new(TestProgram::new(
        "script",
        "scripts",
        "/nonexistent",
        "suite",
        cases,
    ))
}

fn case(name: &str, has_cleanup: bool, has_secondary_cleanup: bool) -> TestCase {
    TestCase::new(
        name,
        Metadata {
            has_cleanup,
            has_secondary_cleanup,
            ..Default::default()
        },
    )
}

fn single(name: &str, script: Script) -> ScriptInterface {
    ScriptInterface {
        scripts: HashMap::from([(name.to_string(), script)]),
        ..Default::default()
    }
}

async fn wait_any(scheduler: &mut SchedulerHandle) -> test_supervisor::ResultHandle {
    tokio::time::timeout(WAIT, scheduler.wait_any())
        .await
        .expect("timed out waiting for a test case")
        .unwrap()
}

#[tokio::test]
async fn passed_test_runs_its_cleanup() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "ok",
        Script {
            body: r#"echo hello; echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: format!("echo cleanup >> {}", log.display()),
            ..Default::default()
        },
    ));
    let program = program(vec![case("ok", true, false)]);

    let handle = scheduler.spawn_test(&program, "ok", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;

    assert_eq!(result.id(), handle.id());
    assert_eq!(result.original_pid(), handle.pid());
    assert_eq!(result.test_case_name(), "ok");
    assert_eq!(result.test_result(), &TestResult::Passed);
    assert_eq!(fixture.read_log(), "cleanup\n");
    assert_eq!(
        std::fs::read_to_string(result.stdout_file()).unwrap(),
        "hello\n"
    );
    assert!(result.start_time() <= result.end_time());

    result.cleanup().unwrap();
    assert!(!result.work_directory().exists());
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn failing_cleanup_breaks_a_good_result() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: "echo cleaning up; exit 3".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", true, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Broken("Test case cleanup exited with code 3".to_string())
    );
    // Cleanup output lands in the body's files.
    let stdout = std::fs::read_to_string(result.stdout_file()).unwrap();
    assert!(stdout.contains("cleaning up"), "{stdout}");

    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn bad_body_result_survives_cleanup_failure() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo "failed: assertion" > "$RESULT_FILE""#.to_string(),
            cleanup: "exit 1".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", true, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Failed("assertion".to_string())
    );
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn cleanup_timeout_breaks_the_result() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: "sleep 60".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![TestCase::new(
        "t",
        Metadata {
            timeout: Duration::from_secs(1),
            has_cleanup: true,
            ..Default::default()
        },
    )]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Broken("Test case cleanup timed out".to_string())
    );
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn body_timeout_is_broken() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "slow",
        Script {
            body: "sleep 60".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![TestCase::new(
        "slow",
        Metadata {
            timeout: Duration::from_secs(1),
            ..Default::default()
        },
    )]);

    scheduler.spawn_test(&program, "slow", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Broken("Test case body timed out".to_string())
    );
    assert_eq!(result.exit().status(), None);
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn unmet_requirements_skip_without_cleanup() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: format!("echo body >> {}", log.display()),
            cleanup: format!("echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![TestCase::new(
        "t",
        Metadata {
            has_cleanup: true,
            has_secondary_cleanup: true,
            required_files: vec![PathBuf::from("/nonexistent/required")],
            ..Default::default()
        },
    )]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Skipped("Required file '/nonexistent/required' not found".to_string())
    );
    assert_eq!(fixture.read_log(), "");
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn self_skipped_body_runs_no_cleanup() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: format!(r#"printf 'no network' > "$SKIP_COOKIE"; exit {EXIT_SKIPPED}"#),
            cleanup: format!("echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![case("t", true, true)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Skipped("no network".to_string())
    );
    assert_eq!(fixture.read_log(), "");
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
    assert_eq!(fixture.read_log(), "");
}

#[tokio::test]
async fn skip_cookie_may_hold_arbitrary_bytes() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: format!(r#"printf 'bad \377 byte' > "$SKIP_COOKIE"; exit {EXIT_SKIPPED}"#),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Skipped("bad \u{FFFD} byte".to_string())
    );
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn skip_exit_code_alone_is_not_a_skip() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: format!(r#"echo passed > "$RESULT_FILE"; exit {EXIT_SKIPPED}"#),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Broken(format!(
            "Passed test case should have reported success but exited with code {EXIT_SKIPPED}"
        ))
    );
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn skip_cookie_is_ignored_on_success() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo stale > "$SKIP_COOKIE"; echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: format!("echo cleanup >> {}", log.display()),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", true, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(result.test_result(), &TestResult::Passed);
    assert_eq!(fixture.read_log(), "cleanup\n");
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn expected_timeout_is_an_expected_failure() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo "expected_timeout: slow" > "$RESULT_FILE"; sleep 60"#.to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![TestCase::new(
        "t",
        Metadata {
            timeout: Duration::from_secs(1),
            ..Default::default()
        },
    )]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::ExpectedFailure("slow".to_string())
    );
    assert_eq!(result.exit().status(), None);
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn secondary_cleanup_runs_after_cleanup() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: format!("sleep 0.2; echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![case("t", true, true)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(result.test_result(), &TestResult::Passed);
    assert_eq!(fixture.read_log(), "cleanup\nsecondary\n");
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn secondary_cleanup_failure_breaks_the_result() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            secondary_cleanup: "kill -TERM $$".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, true)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(
        result.test_result(),
        &TestResult::Broken(format!(
            "Test case secondary cleanup received signal {}",
            libc::SIGTERM
        ))
    );
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn concurrent_tests_are_reported_once_each() {
    let fixture = Fixture::new();
    let outcomes = [
        ("a", "passed", TestResult::Passed),
        ("b", "failed: b broke", TestResult::Failed("b broke".to_string())),
        ("c", "skipped: not today", TestResult::Skipped("not today".to_string())),
        ("d", "expected_failure: known", TestResult::ExpectedFailure("known".to_string())),
        ("e", "passed", TestResult::Passed),
    ];
    let interface = ScriptInterface {
        scripts: outcomes
            .iter()
            .enumerate()
            .map(|(i, (name, line, _))| {
                let script = Script {
                    body: format!(r#"sleep 0.{i}; echo "{line}" > "$RESULT_FILE""#),
                    cleanup: "true".to_string(),
                    ..Default::default()
                };
                (name.to_string(), script)
            })
            .collect(),
        ..Default::default()
    };
    let mut scheduler = fixture.scheduler(interface);
    let program = program(
        outcomes
            .iter()
            .map(|(name, _, _)| case(name, true, false))
            .collect(),
    );

    let mut spawned = HashMap::new();
    for (name, _, _) in &outcomes {
        let handle = scheduler.spawn_test(&program, name, &fixture.config).unwrap();
        spawned.insert(handle.id(), name.to_string());
    }

    let mut reported = BTreeSet::new();
    for _ in 0..outcomes.len() {
        let result = wait_any(&mut scheduler).await;
        assert!(reported.insert(result.id()), "{:?} reported twice", result.id());
        assert_eq!(spawned[&result.id()], result.test_case_name());
        let (_, _, expected) = outcomes
            .iter()
            .find(|(name, _, _)| *name == result.test_case_name())
            .unwrap();
        assert_eq!(result.test_result(), expected);
        result.cleanup().unwrap();
    }
    assert_eq!(reported, spawned.keys().copied().collect());
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn failed_listing_becomes_a_broken_placeholder() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(ScriptInterface {
        list: "echo oops >&2; exit 1".to_string(),
        ..Default::default()
    });
    let listed = program(Vec::new());

    let cases = scheduler.list_tests(&listed, &fixture.config).await.unwrap();
    assert_eq!(cases.len(), 1);
    assert_eq!(cases[0].name(), LIST_FAILURE_TEST_CASE);
    let expected = TestResult::Broken("listing exited with code 1".to_string());
    assert_eq!(cases[0].fake_result(), Some(&expected));

    // The placeholder runs like any other test case.
    let program = program(cases);
    scheduler
        .spawn_test(&program, LIST_FAILURE_TEST_CASE, &fixture.config)
        .unwrap();
    let result = wait_any(&mut scheduler).await;
    assert_eq!(result.test_result(), &expected);
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn listing_returns_test_cases() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(ScriptInterface {
        list: "echo one; echo two".to_string(),
        ..Default::default()
    });

    let cases = scheduler
        .list_tests(&program(Vec::new()), &fixture.config)
        .await
        .unwrap();
    let names: Vec<_> = cases.iter().map(TestCase::name).collect();
    assert_eq!(names, vec!["one", "two"]);

    let mut empty = fixture.scheduler(ScriptInterface {
        list: "true".to_string(),
        ..Default::default()
    });
    let cases = empty
        .list_tests(&program(Vec::new()), &fixture.config)
        .await
        .unwrap();
    assert_eq!(
        cases[0].fake_result(),
        Some(&TestResult::Broken("Empty test cases list".to_string()))
    );

    scheduler.cleanup().await.unwrap();
    empty.cleanup().await.unwrap();
}

#[tokio::test]
async fn unknown_interface_and_test_case_are_errors() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(ScriptInterface::default());
    let foreign = Arc::new(TestProgram::new(
        "tap",
        "t",
        "/nonexistent",
        "suite",
        vec![case("x", false, false)],
    ));

    let err = scheduler
        .spawn_test(&foreign, "x", &fixture.config)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownInterface(ref name) if name == "tap"));
    let err = scheduler
        .list_tests(&foreign, &fixture.config)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownInterface(_)));

    let err = scheduler
        .spawn_test(&program(Vec::new()), "missing", &fixture.config)
        .unwrap_err();
    assert!(matches!(err, SchedulerError::UnknownTestCase { .. }));
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn leftover_files_are_reported_for_bad_results() {
    let fixture = Fixture::new();
    let interface = ScriptInterface {
        scripts: HashMap::from([
            (
                "bad".to_string(),
                Script {
                    body: r#"touch junk other; echo "failed: x" > "$RESULT_FILE""#.to_string(),
                    ..Default::default()
                },
            ),
            (
                "good".to_string(),
                Script {
                    body: r#"touch junk; echo passed > "$RESULT_FILE""#.to_string(),
                    ..Default::default()
                },
            ),
        ]),
        ..Default::default()
    };
    let mut scheduler = fixture.scheduler(interface);
    let program = program(vec![case("bad", false, false), case("good", false, false)]);

    for name in ["bad", "good"] {
        scheduler.spawn_test(&program, name, &fixture.config).unwrap();
        let result = wait_any(&mut scheduler).await;
        let stderr = std::fs::read_to_string(result.stderr_file()).unwrap_or_default();
        if name == "bad" {
            assert!(
                stderr.contains("Files left in work directory after failure: junk, other"),
                "{stderr}"
            );
        } else {
            assert!(!stderr.contains("Files left"), "{stderr}");
        }
        result.cleanup().unwrap();
    }
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn debug_test_copies_output() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo to-stdout; echo to-stderr >&2; echo passed > "$RESULT_FILE""#
                .to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, false)]);
    let out = fixture.dir.path().join("out.txt");
    let err = fixture.dir.path().join("err.txt");

    let result = tokio::time::timeout(
        WAIT,
        scheduler.debug_test(&program, "t", &fixture.config, &out, &err),
    )
    .await
    .unwrap()
    .unwrap();
    assert_eq!(result.test_result(), &TestResult::Passed);
    assert_eq!(std::fs::read_to_string(&out).unwrap(), "to-stdout\n");
    assert_eq!(std::fs::read_to_string(&err).unwrap(), "to-stderr\n");
    result.cleanup().unwrap();

    // Refused while another test case is in flight.
    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let busy = scheduler
        .debug_test(&program, "t", &fixture.config, &out, &err)
        .await
        .unwrap_err();
    assert!(matches!(busy, SchedulerError::Busy));
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
async fn teardown_runs_owed_cleanups_once() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: "sleep 60".to_string(),
            cleanup: format!("echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![case("t", true, true)]);
    let root = scheduler.root_path().to_path_buf();
    let config = fixture.config.clone();

    let outcome: Result<(), SchedulerError> = tokio::time::timeout(
        WAIT,
        scheduler.run(move |scheduler| {
            Box::pin(async move {
                scheduler.spawn_test(&program, "t", &config)?;
                Err::<(), _>(SchedulerError::Busy)
            })
        }),
    )
    .await
    .unwrap();

    assert!(matches!(outcome, Err(SchedulerError::Busy)));
    assert_eq!(fixture.read_log(), "cleanup\nsecondary\n");
    assert!(!root.exists());
}

#[tokio::test]
async fn dropped_scheduler_runs_owed_cleanups() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: "sleep 60".to_string(),
            cleanup: format!("echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![case("t", true, true)]);
    let root = scheduler.root_path().to_path_buf();

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    drop(scheduler);

    assert_eq!(fixture.read_log(), "cleanup\nsecondary\n");
    assert!(!root.exists());
}

#[tokio::test]
async fn dropped_scheduler_skips_running_steps() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            cleanup: format!("sleep 60; echo cleanup >> {}", log.display()),
            secondary_cleanup: format!("echo secondary >> {}", log.display()),
        },
    ));
    let program = program(vec![case("t", true, true)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    // Gives up while the cleanup is still running.
    let waited = tokio::time::timeout(Duration::from_millis(500), scheduler.wait_any()).await;
    assert!(waited.is_err());
    drop(scheduler);

    // The running cleanup is killed and not repeated; the secondary
    // cleanup it was holding up still runs.
    assert_eq!(fixture.read_log(), "secondary\n");
}

#[tokio::test]
async fn cancelled_run_still_runs_owed_cleanups() {
    let fixture = Fixture::new();
    let log = fixture.log();
    let scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: "sleep 60".to_string(),
            cleanup: format!("echo cleanup >> {}", log.display()),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", true, false)]);
    let root = scheduler.root_path().to_path_buf();
    let config = fixture.config.clone();

    let run = scheduler.run(move |scheduler| {
        Box::pin(async move {
            scheduler.spawn_test(&program, "t", &config)?;
            scheduler.wait_any().await.map(|_| ())
        })
    });
    let outcome = tokio::time::timeout(Duration::from_millis(300), run).await;

    assert!(outcome.is_err(), "run finished despite a running body");
    assert_eq!(fixture.read_log(), "cleanup\n");
    assert!(!root.exists());
}

#[tokio::test]
async fn teardown_is_idempotent() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(ScriptInterface::default());
    let root = scheduler.root_path().to_path_buf();
    assert!(root.exists());
    scheduler.cleanup().await.unwrap();
    scheduler.cleanup().await.unwrap();
    assert!(!root.exists());
}

#[tokio::test]
async fn interrupt_tears_everything_down() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: "sleep 60".to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, false)]);
    let root = scheduler.root_path().to_path_buf();

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let interrupts = fixture.interrupts.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(200)).await;
        interrupts.interrupt(Some(libc::SIGINT));
    });

    let err = tokio::time::timeout(WAIT, scheduler.wait_any())
        .await
        .expect("interrupt not observed")
        .unwrap_err();
    assert!(err.is_interrupted(), "{err}");
    assert!(!root.exists());

    let err = scheduler
        .spawn_test(&program, "t", &fixture.config)
        .unwrap_err();
    assert!(err.is_interrupted(), "{err}");
    scheduler.cleanup().await.unwrap();
}

#[tokio::test]
#[traced_test]
async fn spawning_is_logged() {
    let fixture = Fixture::new();
    let mut scheduler = fixture.scheduler(single(
        "t",
        Script {
            body: r#"echo passed > "$RESULT_FILE""#.to_string(),
            ..Default::default()
        },
    ));
    let program = program(vec![case("t", false, false)]);

    scheduler.spawn_test(&program, "t", &fixture.config).unwrap();
    let result = wait_any(&mut scheduler).await;
    result.cleanup().unwrap();
    scheduler.cleanup().await.unwrap();
    assert!(logs_contain("test case spawned"));
    assert!(logs_contain("test body finished"));
}
