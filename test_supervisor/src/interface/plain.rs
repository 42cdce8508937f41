/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Test programs whose exit status is their result.

use std::path::Path;

use crate::config::ConfigVars;
use crate::executor::ProcStatus;
use crate::executor::ProcessCommand;
use crate::interface::Interface;
use crate::model::Metadata;
use crate::model::TestCase;
use crate::model::TestProgram;
use crate::model::TestResult;

/// Name of the only test case of a plain test program.
pub const MAIN_TEST_CASE: &str = "main";

/// Prefix of the environment variables carrying configuration
/// variables to plain test programs.
pub const ENV_PREFIX: &str = "TEST_ENV_";

/// A plain test program is a single test case: it passes by exiting
/// with 0 and fails with any other code.
#[derive(Debug, Clone, Copy, Default)]
pub struct PlainInterface;

impl Interface for PlainInterface {
    fn exec_list(&self, _program: &TestProgram, _vars: &ConfigVars) -> ProcessCommand {
        ProcessCommand::exit(0)
    }

    fn parse_list(
        &self,
        _status: Option<&ProcStatus>,
        _stdout: &Path,
        _stderr: &Path,
    ) -> anyhow::Result<Vec<TestCase>> {
        Ok(vec![TestCase::new(MAIN_TEST_CASE, Metadata::default())])
    }

    fn exec_test(
        &self,
        program: &TestProgram,
        _case_name: &str,
        vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        vars.iter().fold(
            ProcessCommand::new(program.absolute_path()),
            |command, (name, value)| command.env(format!("{ENV_PREFIX}{name}"), value),
        )
    }

    fn compute_result(
        &self,
        status: Option<&ProcStatus>,
        _control_directory: &Path,
        _stdout: &Path,
        _stderr: &Path,
    ) -> TestResult {
        match status {
            None => TestResult::Broken("Test case body timed out".to_string()),
            Some(ProcStatus::Exited { code: 0 }) => TestResult::Passed,
            Some(ProcStatus::Exited { code }) => {
                TestResult::Failed(format!("Returned non-success exit status {code}"))
            }
            Some(ProcStatus::Signaled { signal, .. }) => {
                TestResult::Broken(format!("Received signal {signal}"))
            }
        }
    }
}
