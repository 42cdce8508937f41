/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Per-technology knowledge of how to drive test programs.
//!
//! An [`Interface`] knows how to list the test cases of one kind of
//! test program, how to run a test case (and its cleanup) and how to
//! turn the outcome into a [`TestResult`]. The scheduler owns an
//! [`InterfaceRegistry`] mapping technology names, as declared by
//! [`TestProgram::interface_name`], to implementations.
//!
//! Every `exec_*` method only *describes* the child to run; the
//! executor takes care of isolation and supervision. The returned
//! child must terminate on its own.

pub mod atf;
pub mod plain;

use std::fmt;
use std::path::Path;
use std::sync::Arc;

use crate::config::ConfigVars;
use crate::executor::ProcStatus;
use crate::executor::ProcessCommand;
use crate::model::TestCase;
use crate::model::TestProgram;
use crate::model::TestResult;

/// Strategy for one test program technology.
pub trait Interface: Send + Sync + 'static {
    /// Child that prints the test cases of `program`.
    fn exec_list(&self, program: &TestProgram, vars: &ConfigVars) -> ProcessCommand;

    /// Parse the output of an [`Interface::exec_list`] child that
    /// terminated with `status` (`None` if it timed out).
    ///
    /// Misbehaving test programs are reported as errors; the
    /// scheduler turns them into a broken placeholder test case.
    fn parse_list(
        &self,
        status: Option<&ProcStatus>,
        stdout: &Path,
        stderr: &Path,
    ) -> anyhow::Result<Vec<TestCase>>;

    /// Child running the body of `case_name`. Files meant for
    /// [`Interface::compute_result`] go to `control_directory`.
    fn exec_test(
        &self,
        program: &TestProgram,
        case_name: &str,
        vars: &ConfigVars,
        control_directory: &Path,
    ) -> ProcessCommand;

    /// Child running the cleanup routine of `case_name`. Only used
    /// for test cases whose metadata declares one.
    fn exec_cleanup(
        &self,
        _program: &TestProgram,
        _case_name: &str,
        _vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        ProcessCommand::exit(0)
    }

    /// Child tearing down whatever environment the test case ran in.
    /// Runs after the cleanup routine, for test cases whose metadata
    /// declares a secondary cleanup.
    fn exec_secondary_cleanup(
        &self,
        _program: &TestProgram,
        _case_name: &str,
        _vars: &ConfigVars,
        _control_directory: &Path,
    ) -> ProcessCommand {
        ProcessCommand::exit(0)
    }

    /// Result of a test body that terminated with `status` (`None`
    /// if it timed out).
    fn compute_result(
        &self,
        status: Option<&ProcStatus>,
        control_directory: &Path,
        stdout: &Path,
        stderr: &Path,
    ) -> TestResult;
}

/// Registered interfaces, in registration order.
#[derive(Clone, Default)]
pub struct InterfaceRegistry {
    interfaces: Vec<(String, Arc<dyn Interface>)>,
}

impl InterfaceRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with the built-in `plain` and `atf` interfaces.
    pub fn with_defaults() -> Self {
        let mut registry = Self::new();
        registry.interfaces.push(("plain".to_string(), Arc::new(plain::PlainInterface)));
        registry.interfaces.push(("atf".to_string(), Arc::new(atf::AtfInterface)));
        registry
    }

    /// Register `interface` under `name`.
    pub fn register<I: Interface>(&mut self, name: &str, interface: I) -> anyhow::Result<()> {
        if self.find(name).is_some() {
            anyhow::bail!("interface '{name}' already registered");
        }
        self.interfaces.push((name.to_string(), Arc::new(interface)));
        Ok(())
    }

    pub fn find(&self, name: &str) -> Option<Arc<dyn Interface>> {
        self.interfaces
            .iter()
            .find(|(registered, _)| registered == name)
            .map(|(_, interface)| Arc::clone(interface))
    }

    pub fn names(&self) -> impl Iterator<Item = &str> {
        self.interfaces.iter().map(|(name, _)| name.as_str())
    }
}

impl fmt::Debug for InterfaceRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.names()).finish()
    }
}
