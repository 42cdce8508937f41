/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! ATF test programs.
//!
//! Listing runs `<program> -l`, which prints:
//!
//! ```text
//! Content-Type: application/X-atf-tp; version="1"
//!
//! ident: first
//! descr: A test case
//! timeout: 30
//!
//! ident: second
//! has.cleanup: true
//! ```
//!
//! A body runs as
//! `<program> -r<control>/result.atf -s<srcdir> [-v name=value]... <case>`
//! and reports its result through the results file (see
//! [`crate::result`]). A cleanup routine runs as
//! `<program> -s<srcdir> [-v name=value]... <case>:cleanup`.

use std::ffi::OsString;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use anyhow::bail;

use crate::config::ConfigVars;
use crate::executor::ProcStatus;
use crate::executor::ProcessCommand;
use crate::interface::Interface;
use crate::model::Metadata;
use crate::model::RequiredUser;
use crate::model::TestCase;
use crate::model::TestProgram;
use crate::model::TestResult;
use crate::result::RESULTS_FILE_NAME;
use crate::result::calculate_result;

const CONTENT_TYPE: &str = r#"Content-Type: application/X-atf-tp; version="1""#;

/// Variable that tells ATF test programs they run under a supervisor
/// rather than by hand.
const RUNNING_INSIDE_ENV: (&str, &str) = ("__RUNNING_INSIDE_ATF_RUN", "internal-yes-value");

#[derive(Debug, Clone, Copy, Default)]
pub struct AtfInterface;

impl AtfInterface {
    /// Command running `program` with the flags shared by bodies and
    /// cleanup routines. `-r` must come before every other flag.
    fn run_command(
        program: &TestProgram,
        vars: &ConfigVars,
        results_file: Option<&Path>,
    ) -> ProcessCommand {
        let absolute = program.absolute_path();
        let srcdir = absolute.parent().unwrap_or_else(|| Path::new("/"));

        let mut command =
            ProcessCommand::new(&absolute).env(RUNNING_INSIDE_ENV.0, RUNNING_INSIDE_ENV.1);
        if let Some(results_file) = results_file {
            command = command.arg(flag("-r", results_file));
        }
        command = command.arg(flag("-s", srcdir));
        vars.iter().fold(command, |command, (name, value)| {
            command.arg("-v").arg(format!("{name}={value}"))
        })
    }
}

fn flag(name: &str, path: &Path) -> OsString {
    let mut flag = OsString::from(name);
    flag.push(path);
    flag
}

impl Interface for AtfInterface {
    fn exec_list(&self, program: &TestProgram, _vars: &ConfigVars) -> ProcessCommand {
        ProcessCommand::new(program.absolute_path())
            .env(RUNNING_INSIDE_ENV.0, RUNNING_INSIDE_ENV.1)
            .arg("-l")
    }

    fn parse_list(
        &self,
        status: Option<&ProcStatus>,
        stdout: &Path,
        stderr: &Path,
    ) -> anyhow::Result<Vec<TestCase>> {
        match status {
            None => bail!("Test program timed out while listing test cases"),
            Some(status) if !status.success() => {
                let detail = std::fs::read_to_string(stderr).unwrap_or_default();
                let detail = detail.trim();
                if detail.is_empty() {
                    bail!("Test program did not exit cleanly: {status}");
                }
                bail!("Test program did not exit cleanly: {status}; stderr: {detail}");
            }
            Some(_) => {}
        }
        let output = std::fs::read_to_string(stdout)
            .with_context(|| format!("Failed to read test cases list {}", stdout.display()))?;
        parse_test_cases(&output)
    }

    fn exec_test(
        &self,
        program: &TestProgram,
        case_name: &str,
        vars: &ConfigVars,
        control_directory: &Path,
    ) -> ProcessCommand {
        let results_file = control_directory.join(RESULTS_FILE_NAME);
        Self::run_command(program, vars, Some(&results_file)).arg(case_name)
    }

    fn exec_cleanup(
        &self,
        program: &TestProgram,
        case_name: &str,
        vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        Self::run_command(program, vars, None).arg(format!("{case_name}:cleanup"))
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

/// Parse the output of `<program> -l`.
pub fn parse_test_cases(output: &str) -> anyhow::Result<Vec<TestCase>> {
    let mut lines = output.lines();
    match lines.next() {
        Some(CONTENT_TYPE) => {}
        Some(other) => bail!(
            "Invalid header for test case list; expecting '{CONTENT_TYPE}' but found '{other}'"
        ),
        None => bail!("Empty test cases list"),
    }
    match lines.next() {
        Some("") => {}
        _ => bail!(
            "Invalid header for test case list; expecting a blank line after the content type"
        ),
    }

    let mut test_cases = Vec::new();
    let mut current: Option<(String, Metadata)> = None;
    for line in lines {
        if line.is_empty() {
            if let Some((name, metadata)) = current.take() {
                test_cases.push(TestCase::new(name, metadata));
            }
            continue;
        }
        let (key, value) = line
            .split_once(": ")
            .with_context(|| format!("Invalid property line '{line}'"))?;
        if key == "ident" {
            if let Some((name, _)) = &current {
                bail!("Test case '{name}' is not separated from '{value}' by a blank line");
            }
            if value.is_empty() {
                bail!("Empty test case identifier");
            }
            current = Some((value.to_string(), Metadata::default()));
            continue;
        }
        let Some((name, metadata)) = current.as_mut() else {
            bail!("Property '{key}' found before any 'ident' property");
        };
        apply_property(metadata, key, value)
            .with_context(|| format!("Invalid metadata for test case '{name}'"))?;
    }
    if let Some((name, metadata)) = current.take() {
        test_cases.push(TestCase::new(name, metadata));
    }

    if test_cases.is_empty() {
        bail!("No test cases");
    }
    Ok(test_cases)
}

fn apply_property(metadata: &mut Metadata, key: &str, value: &str) -> anyhow::Result<()> {
    let words = || value.split_whitespace().map(str::to_string);
    match key {
        "descr" => metadata.description = value.to_string(),
        "has.cleanup" => metadata.has_cleanup = parse_bool(value)?,
        "timeout" => {
            let seconds: u64 = value
                .parse()
                .with_context(|| format!("Invalid timeout '{value}'"))?;
            // Zero keeps the default limit.
            if seconds > 0 {
                metadata.timeout = Duration::from_secs(seconds);
            }
        }
        "require.user" => {
            metadata.required_user = match value {
                "root" => Some(RequiredUser::Root),
                "unprivileged" => Some(RequiredUser::Unprivileged),
                "" => None,
                other => bail!("Invalid required user '{other}'"),
            }
        }
        "require.arch" => metadata.allowed_architectures.extend(words()),
        "require.config" => metadata.required_configs.extend(words()),
        "require.files" => metadata
            .required_files
            .extend(words().map(PathBuf::from)),
        "require.progs" => metadata
            .required_programs
            .extend(words().map(PathBuf::from)),
        key if key.starts_with("X-") => {}
        key => bail!("Unknown test case metadata property '{key}'"),
    }
    Ok(())
}

fn parse_bool(value: &str) -> anyhow::Result<bool> {
    match value {
        "true" | "yes" => Ok(true),
        "false" | "no" => Ok(false),
        other => bail!("Invalid boolean value '{other}'"),
    }
}
