// SdnDebug: fault injection and correspondence checking for SDN controllers
// Copyright (C) 2022-2023 Tibor Schneider <sctibor@ethz.ch>
//
// This program is free software; you can redistribute it and/or modify
// it under the terms of the GNU General Public License as published by
// the Free Software Foundation; either version 2 of the License, or
// (at your option) any later version.
//
// This program is distributed in the hope that it will be useful,
// but WITHOUT ANY WARRANTY; without even the implied warranty of
// MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
// GNU General Public License for more details.
//
// You should have received a copy of the GNU General Public License along
// with this program; if not, write to the Free Software Foundation, Inc.,
// 51 Franklin Street, Fifth Floor, Boston, MA 02110-1301 USA.

//! Controller Process Manager
//!
//! Launches the controller processes of an experiment, forwards their output to the log, and
//! terminates them again. Every launch logs the resolved command line and the process id, since
//! controller crashes are the main thing this harness is looking for.

use std::process::{ExitStatus, Stdio};

use log::{debug, error, info, warn};
use simnet::{controller::Controller, types::ControllerId};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, BufReader},
    process::{Child, Command},
    task::JoinHandle,
};

/// A launched controller process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessHandle {
    /// The controller
    pub controller: ControllerId,
    /// Process id
    pub pid: u32,
    /// Command line after placeholder substitution
    pub cmdline: Vec<String>,
}

/// A controller process that has exited on its own.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProcessExit {
    /// The controller
    pub controller: ControllerId,
    /// Process id
    pub pid: u32,
    /// Exit status
    pub status: ExitStatus,
}

#[derive(Debug)]
struct TrackedProcess {
    handle: ProcessHandle,
    child: Option<Child>,
    forwarders: Vec<JoinHandle<()>>,
}

/// Keeps track of all launched controller processes.
#[derive(Debug, Default)]
pub struct ProcessManager {
    procs: Vec<TrackedProcess>,
}

impl ProcessManager {
    /// Create a manager without any process.
    pub fn new() -> Self {
        Self::default()
    }

    /// Launch one process for each controller. If a launch fails, all processes launched so far
    /// (including those of earlier calls) are killed before the error is returned.
    pub async fn boot(
        &mut self,
        controllers: &[Controller],
    ) -> Result<Vec<ProcessHandle>, ProcessError> {
        let mut handles = Vec::with_capacity(controllers.len());
        for controller in controllers {
            match self.launch(controller) {
                Ok(handle) => handles.push(handle),
                Err(e) => {
                    error!("Cannot launch {}: {e}", controller.label());
                    if let Err(kill_err) = self.kill_all().await {
                        warn!("Cleanup after failed launch was incomplete: {kill_err}");
                    }
                    return Err(e);
                }
            }
        }
        Ok(handles)
    }

    /// Launch a single controller.
    pub fn launch(&mut self, controller: &Controller) -> Result<ProcessHandle, ProcessError> {
        let label = controller.label();
        let cmdline = controller.resolved_cmdline();
        let (program, args) = cmdline
            .split_first()
            .ok_or(ProcessError::EmptyCommand(controller.id))?;

        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|source| ProcessError::Spawn {
                controller: controller.id,
                program: program.clone(),
                source,
            })?;
        let pid = child.id().ok_or(ProcessError::NoPid(controller.id))?;

        info!("Launched controller {label}: {} [{pid}]", cmdline.join(" "));

        let mut forwarders = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(forward_lines(label.clone(), stdout));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(forward_lines(label, stderr));
        }

        let handle = ProcessHandle {
            controller: controller.id,
            pid,
            cmdline,
        };
        self.procs.push(TrackedProcess {
            handle: handle.clone(),
            child: Some(child),
            forwarders,
        });
        Ok(handle)
    }

    /// Handles of all tracked processes, including those that have exited.
    pub fn handles(&self) -> impl Iterator<Item = &ProcessHandle> {
        self.procs.iter().map(|p| &p.handle)
    }

    /// Returns `true` if no process is tracked.
    pub fn is_empty(&self) -> bool {
        self.procs.is_empty()
    }

    /// Number of processes that were neither killed nor seen exiting.
    pub fn num_running(&self) -> usize {
        self.procs.iter().filter(|p| p.child.is_some()).count()
    }

    /// Check all running processes without blocking. Every process that has exited is reported
    /// (and logged) exactly once.
    pub fn poll_exited(&mut self) -> Vec<ProcessExit> {
        let mut exited = Vec::new();
        for proc in self.procs.iter_mut() {
            let status = match proc.child.as_mut().map(|c| c.try_wait()) {
                Some(Ok(Some(status))) => status,
                Some(Ok(None)) | None => continue,
                Some(Err(e)) => {
                    warn!("[{}] cannot query process state: {e}", proc.handle.controller);
                    continue;
                }
            };
            error!(
                "Controller {} [{}] exited with {status}",
                proc.handle.controller, proc.handle.pid
            );
            proc.child = None;
            exited.push(ProcessExit {
                controller: proc.handle.controller,
                pid: proc.handle.pid,
                status,
            });
        }
        exited
    }

    /// Kill every tracked process and wait for it to terminate. Every process is attempted even
    /// if killing another one fails; the first error is returned. Calling this function again (or
    /// after a partial boot) is fine.
    pub async fn kill_all(&mut self) -> Result<(), ProcessError> {
        let mut first_error = None;
        for proc in self.procs.iter_mut() {
            let Some(mut child) = proc.child.take() else {
                continue;
            };
            let controller = proc.handle.controller;
            let pid = proc.handle.pid;
            match child.try_wait() {
                Ok(Some(status)) => debug!("[{controller}] already exited with {status}"),
                _ => match child.kill().await {
                    Ok(()) => info!("Killed controller {controller} [{pid}]"),
                    Err(source) => {
                        warn!("Cannot kill controller {controller} [{pid}]: {source}");
                        if first_error.is_none() {
                            first_error = Some(ProcessError::Kill {
                                controller,
                                pid,
                                source,
                            });
                        }
                    }
                },
            }
            for forwarder in proc.forwarders.drain(..) {
                forwarder.abort();
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

/// Forward every line of `stream` to the log, prefixed with the controller label.
fn forward_lines<R>(label: String, stream: R) -> JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::task::spawn(async move {
        let mut lines = BufReader::new(stream).lines();
        loop {
            match lines.next_line().await {
                Ok(Some(line)) => debug!("[{label}] {line}"),
                Ok(None) => break,
                Err(e) => {
                    debug!("[{label}] output closed: {e}");
                    break;
                }
            }
        }
    })
}

/// Errors of the process manager
#[derive(Debug, Error)]
pub enum ProcessError {
    /// The command line is empty.
    #[error("Controller {0} has no command line")]
    EmptyCommand(ControllerId),
    /// The process could not be spawned.
    #[error("Cannot spawn `{program}` for controller {controller}: {source}")]
    Spawn {
        /// The controller
        controller: ControllerId,
        /// The program
        program: String,
        /// The error
        #[source]
        source: std::io::Error,
    },
    /// The process exited before its id could be read.
    #[error("Controller {0} exited immediately")]
    NoPid(ControllerId),
    /// The process could not be killed.
    #[error("Cannot kill controller {controller} [{pid}]: {source}")]
    Kill {
        /// The controller
        controller: ControllerId,
        /// Process id
        pid: u32,
        /// The error
        #[source]
        source: std::io::Error,
    },
}
