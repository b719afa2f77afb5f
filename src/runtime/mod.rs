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

//! Module to run an experiment: the run context, cancellation, and the top-level run routine.

use std::sync::Arc;

use log::{error, info, warn};
use simnet::{
    channel::TcpConnector,
    controller::Controller,
    generator::{TopologyGenerator, TopologyShape},
    scheduler::Scheduler,
    topology::Topology,
    trace::TraceError,
    types::TopologyError,
};
use thiserror::Error;
use tokio::{sync::watch, task::JoinHandle};

use crate::{
    config::{Cli, ConfigError},
    procs::{ProcessError, ProcessManager},
};

pub mod correspondence;
pub mod engine;
pub mod faults;
pub mod interactive;

use engine::{FuzzTester, SimulationReport};
use faults::{FuzzerParams, ParamsError};
use interactive::StdinInput;

/// Cancellation flag shared between the engine and the signal listener.
#[derive(Debug, Clone)]
pub struct CancellationToken {
    inner: Arc<watch::Sender<bool>>,
}

impl Default for CancellationToken {
    fn default() -> Self {
        Self::new()
    }
}

impl CancellationToken {
    /// Create a token that is not cancelled.
    pub fn new() -> Self {
        let (tx, _) = watch::channel(false);
        Self { inner: Arc::new(tx) }
    }

    /// Cancel the token. Cancelling twice has no further effect.
    pub fn cancel(&self) {
        self.inner.send_replace(true);
    }

    /// Returns `true` if the token was cancelled.
    pub fn is_cancelled(&self) -> bool {
        *self.inner.borrow()
    }

    /// Wait until the token is cancelled.
    pub async fn cancelled(&self) {
        let mut rx = self.inner.subscribe();
        while !*rx.borrow_and_update() {
            if rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Cancel `token` on `SIGINT` or `SIGTERM`.
pub fn spawn_signal_listener(token: CancellationToken) -> JoinHandle<()> {
    tokio::task::spawn(async move {
        tokio::select! {
            r = tokio::signal::ctrl_c() => if let Err(e) = r {
                warn!("Cannot listen for interrupts: {e}");
                return;
            },
            _ = terminate() => {},
        }
        warn!("Received termination signal, shutting down");
        token.cancel();
    })
}

#[cfg(unix)]
async fn terminate() {
    use tokio::signal::unix::{signal, SignalKind};
    match signal(SignalKind::terminate()) {
        Ok(mut s) => {
            s.recv().await;
        }
        Err(e) => {
            warn!("Cannot listen for SIGTERM: {e}");
            std::future::pending::<()>().await
        }
    }
}

#[cfg(not(unix))]
async fn terminate() {
    std::future::pending::<()>().await
}

/// Everything a run owns: controllers, processes, scheduler, and topology. Created at the start
/// of a run and shut down exactly once.
#[derive(Debug)]
pub struct RunContext {
    pub(crate) controllers: Vec<Controller>,
    pub(crate) boot_controllers: bool,
    pub(crate) generator: TopologyGenerator,
    pub(crate) shape: TopologyShape,
    pub(crate) processes: ProcessManager,
    pub(crate) scheduler: Scheduler<Topology>,
    pub(crate) topology: Option<Topology>,
    cancel: CancellationToken,
    stopped: bool,
}

impl RunContext {
    /// Create a new context.
    pub fn new(
        controllers: Vec<Controller>,
        boot_controllers: bool,
        generator: TopologyGenerator,
        shape: TopologyShape,
    ) -> Self {
        Self {
            controllers,
            boot_controllers,
            generator,
            shape,
            processes: ProcessManager::new(),
            scheduler: Scheduler::new(),
            topology: None,
            cancel: CancellationToken::new(),
            stopped: false,
        }
    }

    /// The controllers
    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    /// Whether the controllers are launched
    pub fn boot_controllers(&self) -> bool {
        self.boot_controllers
    }

    /// The topology shape
    pub fn shape(&self) -> TopologyShape {
        self.shape
    }

    /// The token that interrupts the run.
    pub fn cancellation(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// The controller processes
    pub fn processes(&self) -> &ProcessManager {
        &self.processes
    }

    /// The scheduler
    pub fn scheduler(&self) -> &Scheduler<Topology> {
        &self.scheduler
    }

    /// The scheduler, for registering additional tasks before the run.
    pub fn scheduler_mut(&mut self) -> &mut Scheduler<Topology> {
        &mut self.scheduler
    }

    /// The topology, once it was generated.
    pub fn topology(&self) -> Option<&Topology> {
        self.topology.as_ref()
    }

    /// Returns `true` if the scheduler was told to quit.
    pub fn has_quit(&self) -> bool {
        self.scheduler.has_quit()
    }

    /// Returns `true` if the context was shut down.
    pub fn is_stopped(&self) -> bool {
        self.stopped
    }

    /// Kill all controller processes and quit the scheduler. Both are attempted even if the
    /// first fails. Only the first call has an effect.
    pub async fn shutdown(&mut self) -> Result<(), ProcessError> {
        if self.stopped {
            return Ok(());
        }
        self.stopped = true;
        let killed = self.processes.kill_all().await;
        if let Err(e) = &killed {
            error!("Cannot kill all controllers: {e}");
        }
        self.scheduler.quit();
        info!("Shut down");
        killed
    }
}

/// Errors that abort a run
#[derive(Debug, Error)]
pub enum SimError {
    /// Invalid configuration
    #[error("{0}")]
    Config(#[from] ConfigError),
    /// Invalid fuzzer parameters
    #[error("{0}")]
    Params(#[from] ParamsError),
    /// The topology cannot be generated.
    #[error("Cannot generate the topology: {0}")]
    Topology(#[from] TopologyError),
    /// The dataplane trace is invalid.
    #[error("{0}")]
    Trace(#[from] TraceError),
    /// The controllers cannot be launched.
    #[error("Cannot launch the controllers: {0}")]
    Process(#[from] ProcessError),
    /// The run context was already used.
    #[error("The run context was already shut down")]
    Stopped,
}

/// Exit status of the process after a run. Completed, interrupted, and halted runs exit with
/// `0`, also if violations were found. Setup failures exit with `1`.
pub fn exit_status(result: &Result<SimulationReport, SimError>) -> u8 {
    match result {
        Ok(report) => {
            if report.interrupted {
                info!("Stopped after an interrupt");
            }
            let violations = report.violations().count();
            if violations > 0 {
                error!("Found {violations} correspondence violations");
            }
            0
        }
        Err(e) => {
            error!("{e}");
            1
        }
    }
}

/// Run an experiment as configured on the command line.
pub async fn run(cli: &Cli) -> Result<SimulationReport, SimError> {
    let setup = cli.setup()?;
    let params = FuzzerParams::load(&setup.fuzzer_params)?;
    let generator = TopologyGenerator::new(TcpConnector)
        .with_binding(setup.binding)
        .with_hosts_per_switch(setup.hosts_per_switch);
    let mut ctx = RunContext::new(
        setup.controllers,
        setup.boot_controllers,
        generator,
        setup.shape,
    );
    let listener = spawn_signal_listener(ctx.cancellation());

    let steps = setup.engine.steps;
    let mut engine = FuzzTester::new(setup.engine, params, setup.flavor.service());
    if let Some(path) = setup.trace_file {
        engine = engine.with_trace_file(path);
    }
    if engine.config().interactive {
        engine = engine.with_input(Box::new(StdinInput::new()));
    }

    let result = engine.simulate(&mut ctx, steps).await;
    listener.abort();
    result
}
