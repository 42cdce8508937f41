/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Self-reported test results and their reconciliation.
//!
//! A test program reports its own outcome by writing a single line
//! to a results file:
//!
//! ```text
//! passed
//! {broken|failed|skipped|expected_death|expected_failure|expected_timeout}: <reason>
//! {expected_exit|expected_signal}[(<non-negative integer>)]: <reason>
//! ```
//!
//! The line must end with a newline and nothing may follow it.
//!
//! What the program claims is not trusted on its own: [`Verdict::apply`]
//! checks the claim against how the process actually terminated
//! and downgrades inconsistent claims (e.g. "passed" followed by a
//! crash) to [`Verdict::Broken`]. [`calculate_result`] bundles
//! loading, reconciling and externalizing.

use std::fmt;
use std::path::Path;
use std::path::PathBuf;

use crate::executor::ProcStatus;
use crate::model::TestResult;

/// Name of the results file inside a test's control directory.
pub const RESULTS_FILE_NAME: &str = "result.atf";

/// Exit code of a test program reporting success.
const EXIT_SUCCESS: i32 = 0;
/// Exit code of a test program reporting failure.
const EXIT_FAILURE: i32 = 1;

/// A test result as reported by the test program itself.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Passed,
    Failed(String),
    Skipped(String),
    Broken(String),
    ExpectedDeath(String),
    ExpectedExit(Option<i32>, String),
    ExpectedFailure(String),
    ExpectedSignal(Option<i32>, String),
    ExpectedTimeout(String),
}

/// Errors raised while reading a results file.
#[derive(Debug, thiserror::Error)]
pub enum ResultFileError {
    #[error("Empty test result or no new line")]
    Empty,
    #[error("Test result contains multiple lines: {0}")]
    MultipleLines(String),
    #[error("Unknown test result type in: {0}")]
    UnknownType(String),
    #[error("{0} cannot have a reason")]
    UnexpectedReason(String),
    #[error("'{0}' test case result must be followed by ': <reason>'")]
    MissingReason(String),
    #[error("Empty reason for '{0}' test case result")]
    EmptyReason(String),
    #[error("'{0}' cannot have an argument")]
    UnexpectedArgument(String),
    #[error("Mismatched '(' in {0}")]
    MismatchedParen(String),
    #[error("Invalid integer argument '{arg}' to '{status}' test case result")]
    InvalidArgument { status: String, arg: String },
    #[error("Cannot open results file {}: {source}", path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl Verdict {
    /// Parse the full contents of a results file.
    pub fn parse(contents: &str) -> Result<Self, ResultFileError> {
        let Some((line, rest)) = contents.split_once('\n') else {
            return Err(ResultFileError::Empty);
        };
        if !rest.is_empty() {
            return Err(ResultFileError::MultipleLines(contents.to_string()));
        }
        Self::parse_line(line)
    }

    /// Read and parse a results file.
    pub fn load(path: &Path) -> Result<Self, ResultFileError> {
        let contents = std::fs::read_to_string(path).map_err(|source| ResultFileError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::parse(&contents)
    }

    fn parse_line(line: &str) -> Result<Self, ResultFileError> {
        let (head, reason) = match line.split_once(": ") {
            Some((head, reason)) => (head, Some(reason)),
            None => (line, None),
        };
        let (status, arg) = match head.split_once('(') {
            Some((status, rest)) => {
                let arg = rest
                    .strip_suffix(')')
                    .ok_or_else(|| ResultFileError::MismatchedParen(line.to_string()))?;
                (status, Some(arg))
            }
            None => (head, None),
        };

        let reason_for = |status: &str| -> Result<String, ResultFileError> {
            match reason {
                None => Err(ResultFileError::MissingReason(status.to_string())),
                Some("") => Err(ResultFileError::EmptyReason(status.to_string())),
                Some(reason) => Ok(reason.to_string()),
            }
        };
        let no_arg = |status: &str| -> Result<(), ResultFileError> {
            match arg {
                None => Ok(()),
                Some(_) => Err(ResultFileError::UnexpectedArgument(status.to_string())),
            }
        };
        let int_arg = |status: &str| -> Result<Option<i32>, ResultFileError> {
            arg.map(|arg| {
                arg.parse::<u32>()
                    .ok()
                    .and_then(|value| i32::try_from(value).ok())
                    .ok_or_else(|| ResultFileError::InvalidArgument {
                        status: status.to_string(),
                        arg: arg.to_string(),
                    })
            })
            .transpose()
        };

        match status {
            "passed" => {
                no_arg(status)?;
                if reason.is_some() {
                    return Err(ResultFileError::UnexpectedReason(status.to_string()));
                }
                Ok(Verdict::Passed)
            }
            "broken" => no_arg(status).and(reason_for(status)).map(Verdict::Broken),
            "failed" => no_arg(status).and(reason_for(status)).map(Verdict::Failed),
            "skipped" => no_arg(status).and(reason_for(status)).map(Verdict::Skipped),
            "expected_death" => no_arg(status)
                .and(reason_for(status))
                .map(Verdict::ExpectedDeath),
            "expected_failure" => no_arg(status)
                .and(reason_for(status))
                .map(Verdict::ExpectedFailure),
            "expected_timeout" => no_arg(status)
                .and(reason_for(status))
                .map(Verdict::ExpectedTimeout),
            "expected_exit" => {
                let code = int_arg(status)?;
                Ok(Verdict::ExpectedExit(code, reason_for(status)?))
            }
            "expected_signal" => {
                let signal = int_arg(status)?;
                Ok(Verdict::ExpectedSignal(signal, reason_for(status)?))
            }
            _ => Err(ResultFileError::UnknownType(line.to_string())),
        }
    }

    /// Whether the verdict counts as a success: passed, skipped, or
    /// any of the expected outcomes.
    pub fn is_good(&self) -> bool {
        !matches!(self, Verdict::Failed(_) | Verdict::Broken(_))
    }

    /// Reconcile the self-reported verdict with the actual
    /// termination status of the process. `None` means the process
    /// was killed for exceeding its deadline.
    pub fn apply(self, status: Option<&ProcStatus>) -> Verdict {
        let Some(status) = status else {
            return match self {
                Verdict::ExpectedTimeout(_) => self,
                _ => Verdict::Broken("Test case body timed out".to_string()),
            };
        };

        match self {
            Verdict::Broken(_) | Verdict::ExpectedDeath(_) => self,

            Verdict::ExpectedExit(expected, reason) => match *status {
                ProcStatus::Exited { code } => match expected {
                    Some(expected) if expected != code => Verdict::Failed(format!(
                        "Test case expected to exit with code {expected} but got code {code}"
                    )),
                    _ => Verdict::ExpectedExit(expected, reason),
                },
                _ => Verdict::Broken(format!("Expected clean exit but {status}")),
            },

            Verdict::ExpectedSignal(expected, reason) => match *status {
                ProcStatus::Signaled { signal, .. } => match expected {
                    Some(expected) if expected != signal => Verdict::Failed(format!(
                        "Test case expected to receive signal {expected} but got {signal}"
                    )),
                    _ => Verdict::ExpectedSignal(expected, reason),
                },
                _ => Verdict::Broken(format!("Expected signal but {status}")),
            },

            Verdict::ExpectedFailure(_) => {
                if status.exited_with(EXIT_SUCCESS) {
                    self
                } else {
                    Verdict::Broken(format!(
                        "Expected failure should have reported success but {status}"
                    ))
                }
            }

            Verdict::ExpectedTimeout(_) => {
                Verdict::Broken(format!("Expected timeout but {status}"))
            }

            Verdict::Failed(_) => {
                if status.exited_with(EXIT_FAILURE) {
                    self
                } else {
                    Verdict::Broken(format!(
                        "Failed test case should have reported failure but {status}"
                    ))
                }
            }

            Verdict::Passed => {
                if status.exited_with(EXIT_SUCCESS) {
                    self
                } else {
                    Verdict::Broken(format!(
                        "Passed test case should have reported success but {status}"
                    ))
                }
            }

            Verdict::Skipped(_) => {
                if status.exited_with(EXIT_SUCCESS) {
                    self
                } else {
                    Verdict::Broken(format!(
                        "Skipped test case should have reported success but {status}"
                    ))
                }
            }
        }
    }

    /// Collapse into the user-facing [`TestResult`].
    pub fn externalize(self) -> TestResult {
        match self {
            Verdict::Passed => TestResult::Passed,
            Verdict::Failed(reason) => TestResult::Failed(reason),
            Verdict::Skipped(reason) => TestResult::Skipped(reason),
            Verdict::Broken(reason) => TestResult::Broken(reason),
            Verdict::ExpectedDeath(reason)
            | Verdict::ExpectedExit(_, reason)
            | Verdict::ExpectedFailure(reason)
            | Verdict::ExpectedSignal(_, reason)
            | Verdict::ExpectedTimeout(reason) => TestResult::ExpectedFailure(reason),
        }
    }
}

impl fmt::Display for Verdict {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fn with_arg(
            f: &mut fmt::Formatter<'_>,
            name: &str,
            arg: &Option<i32>,
            reason: &str,
        ) -> fmt::Result {
            match arg {
                Some(arg) => write!(f, "{name}({arg}): {reason}"),
                None => write!(f, "{name}: {reason}"),
            }
        }

        match self {
            Verdict::Passed => f.write_str("passed"),
            Verdict::Failed(reason) => write!(f, "failed: {reason}"),
            Verdict::Skipped(reason) => write!(f, "skipped: {reason}"),
            Verdict::Broken(reason) => write!(f, "broken: {reason}"),
            Verdict::ExpectedDeath(reason) => write!(f, "expected_death: {reason}"),
            Verdict::ExpectedExit(code, reason) => with_arg(f, "expected_exit", code, reason),
            Verdict::ExpectedFailure(reason) => write!(f, "expected_failure: {reason}"),
            Verdict::ExpectedSignal(signal, reason) => {
                with_arg(f, "expected_signal", signal, reason)
            }
            Verdict::ExpectedTimeout(reason) => write!(f, "expected_timeout: {reason}"),
        }
    }
}

/// Compute the user-facing result of a test body.
///
/// Failing to read or parse `results_file` yields a broken verdict
/// carrying the failure text; that verdict still goes through
/// [`Verdict::apply`], so a body that both timed out and left no
/// results file is reported as a timeout.
pub fn calculate_result(status: Option<&ProcStatus>, results_file: &Path) -> TestResult {
    let verdict = match Verdict::load(results_file) {
        Ok(verdict) => verdict,
        Err(e) => Verdict::Broken(e.to_string()),
    };
    verdict.apply(status).externalize()
}
