/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Turning a [`ProcessCommand`] into an isolated child process.
//!
//! Every child starts from the same baseline regardless of the
//! supervisor's own environment:
//! - stdin reads from `/dev/null`;
//! - the cwd, `HOME` and `TMPDIR` all point at the child's private
//!   work directory;
//! - `TZ` is `UTC` and locale variables (`LANG`, `LC_*`) are removed;
//! - the umask is `022`;
//! - the child leads its own process group, so that
//!   [`kill_process_group`](super::deadline::kill_process_group)
//!   reaches everything it spawns.

use std::ffi::OsStr;
use std::ffi::OsString;
use std::fmt;
use std::fs::File;
use std::os::unix::process::CommandExt;
use std::path::Path;
use std::path::PathBuf;
use std::process::Stdio;

use anyhow::Context;

/// Description of the program a spawn hook wants to run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessCommand {
    program: PathBuf,
    args: Vec<OsString>,
    env: Vec<(OsString, OsString)>,
}

impl ProcessCommand {
    pub fn new(program: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: Vec::new(),
        }
    }

    /// A child that runs `script` with `/bin/sh -c`.
    pub fn shell(script: impl AsRef<OsStr>) -> Self {
        Self::new("/bin/sh").arg("-c").arg(script)
    }

    /// A child that does nothing but exit with `code`.
    pub fn exit(code: i32) -> Self {
        Self::shell(format!("exit {code}"))
    }

    pub fn arg(mut self, arg: impl AsRef<OsStr>) -> Self {
        self.args.push(arg.as_ref().to_os_string());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: AsRef<OsStr>,
    {
        self.args
            .extend(args.into_iter().map(|arg| arg.as_ref().to_os_string()));
        self
    }

    /// Set an environment variable on top of the normalized baseline.
    pub fn env(mut self, key: impl AsRef<OsStr>, value: impl AsRef<OsStr>) -> Self {
        self.env
            .push((key.as_ref().to_os_string(), value.as_ref().to_os_string()));
        self
    }

    pub fn program(&self) -> &Path {
        &self.program
    }

    pub fn get_args(&self) -> &[OsString] {
        &self.args
    }

    pub fn get_env(&self) -> &[(OsString, OsString)] {
        &self.env
    }
}

impl fmt::Display for ProcessCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.program.display())?;
        for arg in &self.args {
            write!(f, " {}", arg.to_string_lossy())?;
        }
        Ok(())
    }
}

/// An account children can be run as.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Account {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
}

impl Account {
    /// Look up `name` in the system user database.
    pub fn lookup(name: &str) -> anyhow::Result<Self> {
        let user = nix::unistd::User::from_name(name)
            .with_context(|| format!("failed to look up user '{name}'"))?
            .with_context(|| format!("unknown user '{name}'"))?;
        Ok(Self {
            name: user.name,
            uid: user.uid.as_raw(),
            gid: user.gid.as_raw(),
        })
    }
}

/// Hand ownership of a freshly created work directory to `account`
/// so the child can write to it after dropping privileges.
pub(crate) fn prepare_work_directory(
    work_directory: &Path,
    account: Option<&Account>,
) -> std::io::Result<()> {
    let Some(account) = account else {
        return Ok(());
    };
    nix::unistd::chown(
        work_directory,
        Some(nix::unistd::Uid::from_raw(account.uid)),
        Some(nix::unistd::Gid::from_raw(account.gid)),
    )
    .map_err(std::io::Error::from)
}

/// Build the isolated command for `command`. Callers that wait
/// asynchronously wrap it in a [`tokio::process::Command`].
pub(crate) fn build_command(
    command: &ProcessCommand,
    work_directory: &Path,
    account: Option<&Account>,
    stdout: File,
    stderr: File,
) -> std::process::Command {
    let mut cmd = std::process::Command::new(&command.program);
    cmd.args(&command.args)
        .current_dir(work_directory)
        .stdin(Stdio::null())
        .stdout(stdout)
        .stderr(stderr);

    for (key, _) in std::env::vars_os() {
        if is_locale_variable(&key) {
            cmd.env_remove(&key);
        }
    }
    cmd.env("HOME", work_directory)
        .env("TMPDIR", work_directory)
        .env("TZ", "UTC");
    cmd.envs(command.env.iter().map(|(k, v)| (k, v)));

    if let Some(account) = account {
        cmd.uid(account.uid).gid(account.gid);
    }

    // SAFETY: runs in the child between fork and exec; only
    // async-signal-safe calls are made.
    unsafe {
        cmd.pre_exec(|| {
            if libc::setpgid(0, 0) != 0 {
                return Err(std::io::Error::last_os_error());
            }
            libc::umask(0o022);
            Ok(())
        });
    }

    cmd
}

fn is_locale_variable(name: &OsStr) -> bool {
    let name = name.to_string_lossy();
    name == "LANG" || name.starts_with("LC_")
}
