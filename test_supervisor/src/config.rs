/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Supervisor configuration.
//!
//! Values are resolved in layers, highest precedence first:
//! **Env → File → Default**. A YAML file (if any) is read with
//! [`SupervisorConfig::from_yaml`], and selected keys can then be
//! overridden from the environment with
//! [`SupervisorConfig::apply_env`]. [`SupervisorConfig::load`] does
//! both.
//!
//! ```yaml
//! work_root: /var/tmp
//! unprivileged_user: nobody
//! debugger: gdb
//! stacktrace_timeout: 60s
//! list_timeout: 5m
//! test_suites:
//!   mysuite:
//!     some_var: some value
//! ```

use std::collections::BTreeMap;
use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Context;
use serde::Deserialize;
use serde::Serialize;

/// Overrides [`SupervisorConfig::work_root`].
pub const WORK_ROOT_ENV: &str = "TEST_SUPERVISOR_WORK_ROOT";
/// Overrides [`SupervisorConfig::unprivileged_user`].
pub const UNPRIVILEGED_USER_ENV: &str = "TEST_SUPERVISOR_UNPRIVILEGED_USER";
/// Overrides [`SupervisorConfig::debugger`].
pub const DEBUGGER_ENV: &str = "TEST_SUPERVISOR_DEBUGGER";

/// Variables handed to test programs of one test suite.
pub type ConfigVars = BTreeMap<String, String>;

/// User-provided policy consumed by the executor and scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct SupervisorConfig {
    /// Directory under which the per-run root of all test
    /// directories is created. `None` means the system temporary
    /// directory.
    pub work_root: Option<PathBuf>,

    /// Account used for test cases that require an unprivileged
    /// user when the supervisor itself runs as root.
    pub unprivileged_user: Option<String>,

    /// Debugger used to extract stack traces from core dumps; either
    /// an absolute path or a name looked up in `PATH`.
    pub debugger: String,

    /// Upper bound for a single debugger run.
    #[serde(with = "humantime_serde")]
    pub stacktrace_timeout: Duration,

    /// Upper bound for listing the test cases of one program.
    #[serde(with = "humantime_serde")]
    pub list_timeout: Duration,

    /// Per-test-suite variables, keyed by test suite name.
    pub test_suites: BTreeMap<String, ConfigVars>,
}

impl Default for SupervisorConfig {
    fn default() -> Self {
        Self {
            work_root: None,
            unprivileged_user: None,
            debugger: "gdb".to_string(),
            stacktrace_timeout: Duration::from_secs(60),
            list_timeout: Duration::from_secs(300),
            test_suites: BTreeMap::new(),
        }
    }
}

impl SupervisorConfig {
    /// Parse a YAML document. Missing keys take their defaults.
    pub fn from_yaml_str(contents: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(contents)?)
    }

    /// Read and parse a YAML file.
    pub fn from_yaml<P: AsRef<Path>>(path: P) -> anyhow::Result<Self> {
        let path = path.as_ref();
        let contents = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read configuration file {}", path.display()))?;
        Self::from_yaml_str(&contents)
            .with_context(|| format!("failed to parse configuration file {}", path.display()))
    }

    /// Apply the environment layer on top of `self`.
    pub fn apply_env(mut self) -> Self {
        if let Some(value) = std::env::var_os(WORK_ROOT_ENV) {
            self.work_root = Some(PathBuf::from(value));
        }
        if let Ok(value) = std::env::var(UNPRIVILEGED_USER_ENV) {
            self.unprivileged_user = if value.is_empty() { None } else { Some(value) };
        }
        if let Ok(value) = std::env::var(DEBUGGER_ENV) {
            self.debugger = value;
        }
        self
    }

    /// Defaults, overlaid with `file` (if given), overlaid with the
    /// environment.
    pub fn load(file: Option<&Path>) -> anyhow::Result<Self> {
        let base = match file {
            Some(path) => Self::from_yaml(path)?,
            None => Self::default(),
        };
        Ok(base.apply_env())
    }

    /// Snapshot of the variables configured for `test_suite`.
    ///
    /// The `unprivileged-user` variable is injected when an
    /// unprivileged account is configured so that test programs can
    /// find out which account they are expected to drop to.
    pub fn test_suite_vars(&self, test_suite: &str) -> ConfigVars {
        let mut vars = self.test_suites.get(test_suite).cloned().unwrap_or_default();
        if let Some(user) = &self.unprivileged_user {
            vars.insert("unprivileged-user".to_string(), user.clone());
        }
        vars
    }
}

mod humantime_serde {
    use std::time::Duration;

    use serde::Deserialize;
    use serde::Deserializer;
    use serde::Serializer;

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&humantime::format_duration(*value).to_string())
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let s = String::deserialize(deserializer)?;
        humantime::parse_duration(&s).map_err(serde::de::Error::custom)
    }
}
