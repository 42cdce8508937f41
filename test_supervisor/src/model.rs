/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Read-only description of test programs and the user-facing test
//! result.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use serde::Deserialize;
use serde::Serialize;

use crate::config::SupervisorConfig;

/// Timeout applied to test cases that do not declare one.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(300);

/// Outcome of one test case as reported to callers.
///
/// This is the externalized form of
/// [`Verdict`](crate::result::Verdict): every "expected" flavor of
/// the internal verdict collapses into [`TestResult::ExpectedFailure`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TestResult {
    Passed,
    Failed(String),
    Skipped(String),
    Broken(String),
    ExpectedFailure(String),
}

impl TestResult {
    /// Whether the result counts as a success. Failed and broken
    /// results are the only "bad" ones.
    pub fn is_good(&self) -> bool {
        !matches!(self, TestResult::Failed(_) | TestResult::Broken(_))
    }

    /// The reason attached to the result, if any.
    pub fn reason(&self) -> Option<&str> {
        match self {
            TestResult::Passed => None,
            TestResult::Failed(reason)
            | TestResult::Skipped(reason)
            | TestResult::Broken(reason)
            | TestResult::ExpectedFailure(reason) => Some(reason),
        }
    }
}

impl fmt::Display for TestResult {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TestResult::Passed => f.write_str("passed"),
            TestResult::Failed(reason) => write!(f, "failed: {reason}"),
            TestResult::Skipped(reason) => write!(f, "skipped: {reason}"),
            TestResult::Broken(reason) => write!(f, "broken: {reason}"),
            TestResult::ExpectedFailure(reason) => write!(f, "expected_failure: {reason}"),
        }
    }
}

/// Privileges a test case needs to run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RequiredUser {
    Root,
    Unprivileged,
}

/// Test case metadata.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Metadata {
    pub description: String,
    pub timeout: Duration,
    pub has_cleanup: bool,
    /// Whether an extra teardown step runs after the cleanup routine
    /// (e.g. tearing down an execution environment).
    pub has_secondary_cleanup: bool,
    pub required_user: Option<RequiredUser>,
    /// Architectures the test case supports; empty means any.
    pub allowed_architectures: Vec<String>,
    /// Configuration variables that must be defined.
    pub required_configs: Vec<String>,
    /// Absolute paths that must exist.
    pub required_files: Vec<PathBuf>,
    /// Programs that must exist; relative names are looked up in
    /// `PATH`.
    pub required_programs: Vec<PathBuf>,
}

impl Default for Metadata {
    fn default() -> Self {
        Self {
            description: String::new(),
            timeout: DEFAULT_TIMEOUT,
            has_cleanup: false,
            has_secondary_cleanup: false,
            required_user: None,
            allowed_architectures: Vec::new(),
            required_configs: Vec::new(),
            required_files: Vec::new(),
            required_programs: Vec::new(),
        }
    }
}

impl Metadata {
    /// Check the test case's preconditions against the running
    /// system.
    ///
    /// Returns the reason to skip the test case, or `None` if every
    /// requirement is met.
    pub fn check_requirements(
        &self,
        config: &SupervisorConfig,
        test_suite: &str,
    ) -> Option<String> {
        if !self.allowed_architectures.is_empty()
            && !self
                .allowed_architectures
                .iter()
                .any(|arch| arch == std::env::consts::ARCH)
        {
            return Some(format!(
                "Current architecture '{}' not supported",
                std::env::consts::ARCH
            ));
        }

        let vars = config.test_suite_vars(test_suite);
        for name in &self.required_configs {
            if !vars.contains_key(name) {
                return Some(format!("Required configuration property '{name}' not defined"));
            }
        }

        match self.required_user {
            Some(RequiredUser::Root) if !nix::unistd::geteuid().is_root() => {
                return Some("Requires root privileges".to_string());
            }
            Some(RequiredUser::Unprivileged)
                if nix::unistd::geteuid().is_root() && config.unprivileged_user.is_none() =>
            {
                return Some(
                    "Requires an unprivileged user but the unprivileged-user \
                     configuration variable is not defined"
                        .to_string(),
                );
            }
            _ => {}
        }

        for file in &self.required_files {
            if !file.is_absolute() {
                return Some(format!(
                    "Relative required file '{}' is not supported",
                    file.display()
                ));
            }
            if !file.exists() {
                return Some(format!("Required file '{}' not found", file.display()));
            }
        }

        for program in &self.required_programs {
            if program.is_absolute() {
                if !program.exists() {
                    return Some(format!("Required program '{}' not found", program.display()));
                }
            } else if which::which(program).is_err() {
                return Some(format!(
                    "Required program '{}' not found in PATH",
                    program.display()
                ));
            }
        }

        None
    }
}

/// A test case within a test program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestCase {
    name: String,
    metadata: Metadata,
    fake_result: Option<TestResult>,
}

impl TestCase {
    pub fn new(name: impl Into<String>, metadata: Metadata) -> Self {
        Self {
            name: name.into(),
            metadata,
            fake_result: None,
        }
    }

    /// A test case whose result is known without running anything.
    ///
    /// Used to represent failures that happen before any real test
    /// case exists, such as a test program whose listing failed.
    pub fn with_fake_result(
        name: impl Into<String>,
        description: impl Into<String>,
        result: TestResult,
    ) -> Self {
        Self {
            name: name.into(),
            metadata: Metadata {
                description: description.into(),
                ..Default::default()
            },
            fake_result: Some(result),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn fake_result(&self) -> Option<&TestResult> {
        self.fake_result.as_ref()
    }
}

/// A test program: one binary exposing one or more test cases.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TestProgram {
    interface: String,
    binary: PathBuf,
    root: PathBuf,
    test_suite: String,
    test_cases: Vec<TestCase>,
}

impl TestProgram {
    /// Describe a test program.
    ///
    /// `binary` is relative to `root`; `interface` names the
    /// [`Interface`](crate::interface::Interface) that knows how to
    /// drive it.
    pub fn new(
        interface: impl Into<String>,
        binary: impl Into<PathBuf>,
        root: impl Into<PathBuf>,
        test_suite: impl Into<String>,
        test_cases: Vec<TestCase>,
    ) -> Self {
        Self {
            interface: interface.into(),
            binary: binary.into(),
            root: root.into(),
            test_suite: test_suite.into(),
            test_cases,
        }
    }

    pub fn interface_name(&self) -> &str {
        &self.interface
    }

    pub fn relative_path(&self) -> &Path {
        &self.binary
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn absolute_path(&self) -> PathBuf {
        self.root.join(&self.binary)
    }

    pub fn test_suite_name(&self) -> &str {
        &self.test_suite
    }

    pub fn test_cases(&self) -> &[TestCase] {
        &self.test_cases
    }

    /// Replace the test case list, typically with the output of
    /// [`SchedulerHandle::list_tests`](crate::scheduler::SchedulerHandle::list_tests).
    pub fn set_test_cases(&mut self, test_cases: Vec<TestCase>) {
        self.test_cases = test_cases;
    }

    pub fn find(&self, name: &str) -> Option<&TestCase> {
        self.test_cases.iter().find(|case| case.name == name)
    }
}

impl fmt::Display for TestProgram {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.binary.display())
    }
}
