/*
 * Copyright (c) Meta Platforms, Inc. and affiliates.
 * All rights reserved.
 *
 * This source code is licensed under the BSD-style license found in the
 * LICENSE file in the root directory of this source tree.
 */

//! Stack traces of children that dumped core.
//!
//! When a child dies with a core dump, the executor locates the core
//! file and runs a debugger over it as a follow-up of the dead child.
//! Everything produced here, debugger output included, is appended to
//! the child's stderr. Nothing in this module fails the wait that
//! triggered it: a missing debugger or core file results in a note in
//! stderr instead. Only an interrupt propagates.

use std::ffi::OsStr;
use std::io::Write;
use std::os::unix::ffi::OsStrExt;
use std::path::Path;
use std::path::PathBuf;

use crate::executor::ExecutorError;
use crate::executor::Executor;
use crate::executor::ExitHandle;
use crate::executor::ProcessCommand;

/// Longest program name the kernel uses when naming core files, if
/// it truncates them at all.
#[cfg(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
))]
const MAX_CORE_NAME_LENGTH: Option<usize> = Some(16);
#[cfg(not(any(
    target_os = "macos",
    target_os = "freebsd",
    target_os = "netbsd",
    target_os = "openbsd",
    target_os = "dragonfly"
)))]
const MAX_CORE_NAME_LENGTH: Option<usize> = None;

/// Append a stack trace of the core dumped by `exit`'s child to its
/// stderr.
pub(crate) async fn dump(executor: &mut Executor, exit: &ExitHandle) -> Result<(), ExecutorError> {
    let stderr = exit.stderr_file().to_path_buf();

    let Some(debugger) = find_debugger(executor.debugger()) else {
        append_line(
            &stderr,
            &format!(
                "Cannot find debugger '{}'; no stack trace collected",
                executor.debugger()
            ),
        );
        return Ok(());
    };

    let Some(core) = find_core(exit.program(), exit.original_pid(), exit.work_directory()) else {
        append_line(&stderr, "Cannot find any core file; no stack trace collected");
        return Ok(());
    };

    append_line(
        &stderr,
        &format!(
            "Examining core file {} with {}",
            core.display(),
            debugger.display()
        ),
    );
    tracing::debug!(
        pid = exit.original_pid(),
        core = %core.display(),
        "collecting stack trace"
    );

    let program = exit.program().to_path_buf();
    let hook = move |_: &Path| {
        Ok::<_, anyhow::Error>(
            ProcessCommand::new(debugger)
                .args(["-batch", "-q", "-ex", "bt"])
                .arg(program)
                .arg(core),
        )
    };
    let timeout = executor.stacktrace_timeout();
    let handle = match executor.spawn_followup_into(hook, exit, timeout, &stderr, &stderr) {
        Ok(handle) => handle,
        Err(e) if e.is_interrupted() => return Err(e),
        Err(e) => {
            append_line(&stderr, &format!("Failed to run debugger: {e}"));
            return Ok(());
        }
    };

    let summary = match executor.wait_plain(&handle).await {
        Ok(debugger_exit) => {
            let summary = match debugger_exit.status() {
                None => "Debugger timed out".to_string(),
                Some(status) if status.success() => "Debugger exited successfully".to_string(),
                Some(status) => format!("Debugger failed ({status}); see output above"),
            };
            if let Err(e) = debugger_exit.cleanup() {
                tracing::warn!("failed to clean up after debugger: {e}");
            }
            summary
        }
        Err(e) if e.is_interrupted() => return Err(e),
        Err(e) => format!("Failed to wait for debugger: {e}"),
    };
    append_line(&stderr, &summary);
    Ok(())
}

/// Resolve the debugger: absolute paths must exist, anything else is
/// looked up in `PATH`.
fn find_debugger(debugger: &str) -> Option<PathBuf> {
    let path = Path::new(debugger);
    if path.is_absolute() {
        path.exists().then(|| path.to_path_buf())
    } else {
        which::which(debugger).ok()
    }
}

/// Places the kernel may have written the core of `program` running
/// as `pid`, most likely first.
fn core_candidates(program: &Path, pid: u32, work_directory: &Path) -> Vec<PathBuf> {
    let mut candidates = Vec::new();
    if let Some(name) = program.file_name() {
        let mut core_name = truncate(name, MAX_CORE_NAME_LENGTH).to_os_string();
        core_name.push(".core");
        candidates.push(work_directory.join(&core_name));
        if program.is_absolute() {
            if let Some(dir) = program.parent() {
                candidates.push(dir.join(&core_name));
            }
        }
    }
    candidates.push(work_directory.join(format!("core.{pid}")));
    candidates.push(PathBuf::from(format!("/cores/core.{pid}")));
    candidates
}

fn find_core(program: &Path, pid: u32, work_directory: &Path) -> Option<PathBuf> {
    core_candidates(program, pid, work_directory)
        .into_iter()
        .find(|candidate| candidate.is_file())
}

fn truncate(name: &OsStr, max: Option<usize>) -> &OsStr {
    let bytes = name.as_bytes();
    match max {
        Some(max) if bytes.len() > max => OsStr::from_bytes(&bytes[..max]),
        _ => name,
    }
}

fn append_line(path: &Path, line: &str) {
    let result = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(path)
        .and_then(|mut file| writeln!(file, "{line}"));
    if let Err(e) = result {
        tracing::warn!("failed to append to {}: {e}", path.display());
    }
}
