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

//! The fuzz / simulation engine.
//!
//! [`FuzzTester::simulate`] drives a run through the states
//!
//! ```text
//! Idle -> Booting -> Stepping <-> CorrespondenceChecking
//!                       |
//!                       v
//!                   Draining -> Stopped
//! ```
//!
//! Every step first applies the random faults and the due trace events, and then ticks the
//! scheduler exactly once. Correspondence checks only run between two steps, so they always see
//! the network after a complete tick.

use std::{collections::BTreeSet, fmt::Display, path::PathBuf, time::Duration};

use log::{debug, error, info, warn};
use simnet::{
    deferred_io::{ChannelHealth, DeferredIoWorker, IoLoop},
    scheduler::Scheduler,
    topology::Topology,
    trace::{DataplaneTrace, NetworkEvent, TraceReader},
    types::SwitchId,
};

use super::{
    correspondence::{CheckVerdict, CorrespondenceChecker, HealthAlert},
    faults::{FaultInjector, FaultKind, FuzzerParams},
    interactive::{describe, Command, OperatorInput, StdinInput, HELP},
    RunContext, SimError,
};
use crate::snapshot::SnapshotService;

/// Configuration of the engine
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FuzzerConfig {
    /// Wait for operator input before every step.
    pub interactive: bool,
    /// Number of steps between two correspondence checks
    pub check_interval: u64,
    /// Check after every step.
    pub force_check: bool,
    /// Delay between two steps in non-interactive mode
    pub delay: Duration,
    /// Seed of the fault injection
    pub seed: u64,
    /// Number of steps, or `None` to run until interrupted.
    pub steps: Option<u64>,
    /// Stop at the first correspondence violation.
    pub halt_on_violation: bool,
    /// Maximal number of ticks to wait during boot until every switch completed its handshake.
    /// With `0`, stepping starts right away and the handshakes complete during the first steps.
    pub connect_ticks: u64,
}

impl Default for FuzzerConfig {
    fn default() -> Self {
        Self {
            interactive: true,
            check_interval: 35,
            force_check: false,
            delay: Duration::from_millis(100),
            seed: 0,
            steps: None,
            halt_on_violation: false,
            connect_ticks: 0,
        }
    }
}

/// States of the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineState {
    /// Not started
    Idle,
    /// Generating the topology and launching the controllers
    Booting,
    /// Simulating steps
    Stepping,
    /// Comparing the views of the controllers with the network
    CorrespondenceChecking,
    /// Cleaning up
    Draining,
    /// Done
    Stopped,
}

/// Where a fault came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultOrigin {
    /// Drawn by the fault injector
    Random,
    /// Replayed from the dataplane trace
    Trace,
    /// Requested by the operator
    Operator,
}

impl Display for FaultOrigin {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Random => f.write_str("injecting"),
            Self::Trace => f.write_str("replaying"),
            Self::Operator => f.write_str("operator"),
        }
    }
}

/// A fault that was applied (or attempted) during the run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FaultEvent {
    /// Step before whose tick the fault was applied
    pub step: u64,
    /// Where the fault came from
    pub origin: FaultOrigin,
    /// Kind of the fault
    pub kind: FaultKind,
    /// The event
    pub event: NetworkEvent,
    /// `false` if the event had no effect on the network.
    pub applied: bool,
}

/// Everything that happened during a run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimulationReport {
    /// Number of steps simulated
    pub steps_run: u64,
    /// All faults, in the order they were applied
    pub faults: Vec<FaultEvent>,
    /// All check verdicts, in the order they were taken
    pub checks: Vec<CheckVerdict>,
    /// All health alerts
    pub alerts: Vec<HealthAlert>,
    /// State of the engine at the end
    pub final_state: EngineState,
    /// The run was interrupted by a signal.
    pub interrupted: bool,
    /// The run stopped at a correspondence violation.
    pub halted: bool,
}

impl Default for SimulationReport {
    fn default() -> Self {
        Self {
            steps_run: 0,
            faults: Vec::new(),
            checks: Vec::new(),
            alerts: Vec::new(),
            final_state: EngineState::Idle,
            interrupted: false,
            halted: false,
        }
    }
}

impl SimulationReport {
    /// All verdicts that are violations.
    pub fn violations(&self) -> impl Iterator<Item = &CheckVerdict> {
        self.checks.iter().filter(|c| c.is_violation())
    }
}

/// Outcome of waiting for the operator
enum Prompt {
    Advance(u64),
    Quit,
    Interrupted,
}

/// The engine. See the [module documentation](self).
#[derive(Debug)]
pub struct FuzzTester {
    config: FuzzerConfig,
    injector: FaultInjector,
    checker: CorrespondenceChecker,
    trace_file: Option<PathBuf>,
    trace: Option<DataplaneTrace>,
    input: Option<Box<dyn OperatorInput>>,
    state: EngineState,
    report: SimulationReport,
    failing_channels: BTreeSet<SwitchId>,
}

impl FuzzTester {
    /// Create an engine that draws faults according to `params`, and takes snapshots with
    /// `snapshot`.
    pub fn new(
        config: FuzzerConfig,
        params: FuzzerParams,
        snapshot: Box<dyn SnapshotService>,
    ) -> Self {
        Self {
            injector: FaultInjector::new(params, config.seed),
            config,
            checker: CorrespondenceChecker::new(snapshot),
            trace_file: None,
            trace: None,
            input: None,
            state: EngineState::Idle,
            report: SimulationReport::default(),
            failing_channels: BTreeSet::new(),
        }
    }

    /// Replay a dataplane trace.
    pub fn with_trace_file(mut self, path: impl Into<PathBuf>) -> Self {
        self.trace_file = Some(path.into());
        self
    }

    /// Read operator commands from `input` instead of the standard input.
    pub fn with_input(mut self, input: Box<dyn OperatorInput>) -> Self {
        self.input = Some(input);
        self
    }

    /// The configuration
    pub fn config(&self) -> &FuzzerConfig {
        &self.config
    }

    /// The current state
    pub fn state(&self) -> EngineState {
        self.state
    }

    fn transition(&mut self, next: EngineState) {
        debug!("[fuzzer] {:?} -> {:?}", self.state, next);
        self.state = next;
    }

    /// Run the simulation for `steps` steps (or until interrupted). The context is always shut
    /// down when this function returns, also on errors.
    pub async fn simulate(
        mut self,
        ctx: &mut RunContext,
        steps: Option<u64>,
    ) -> Result<SimulationReport, SimError> {
        if ctx.is_stopped() {
            return Err(SimError::Stopped);
        }
        if self.config.interactive && self.input.is_none() {
            self.input = Some(Box::new(StdinInput::new()));
        }

        self.transition(EngineState::Booting);
        if let Err(e) = self.boot(ctx).await {
            error!("{e}");
            self.drain(ctx).await;
            return Err(e);
        }

        self.transition(EngineState::Stepping);
        self.step_loop(ctx, steps).await;

        self.drain(ctx).await;
        let report = &self.report;
        info!(
            "Simulated {} steps: {} faults, {} checks, {} violations, {} alerts",
            report.steps_run,
            report.faults.iter().filter(|f| f.applied).count(),
            report.checks.len(),
            report.violations().count(),
            report.alerts.len(),
        );
        Ok(self.report)
    }

    /// Generate the topology, validate the trace, and launch the controllers.
    async fn boot(&mut self, ctx: &mut RunContext) -> Result<(), SimError> {
        let controllers = ctx.controllers.clone();
        let mut topo = ctx
            .generator
            .generate(&controllers, ctx.shape, DeferredIoWorker::new)?;

        if let Some(path) = self.trace_file.as_ref() {
            let events = DataplaneTrace::validate(TraceReader::open(path)?, &topo)?;
            info!("Dataplane trace {path:?} contains {events} events");
            self.trace = Some(DataplaneTrace::open(path)?);
        }

        if ctx.boot_controllers {
            ctx.processes.boot(&controllers).await?;
        } else {
            info!("Controllers are not launched by the harness");
        }

        ctx.scheduler.schedule(IoLoop::new());
        topo.connect_all(ctx.scheduler.timers_mut());
        if self.config.connect_ticks > 0 {
            self.await_connections(&mut topo, &mut ctx.scheduler);
        }
        ctx.topology = Some(topo);
        Ok(())
    }

    /// Tick the scheduler until every live switch is connected to its controller, but at most
    /// `connect_ticks` times.
    fn await_connections(&self, topo: &mut Topology, scheduler: &mut Scheduler<Topology>) {
        let all_connected = |topo: &Topology| {
            topo.switches()
                .iter()
                .filter(|s| !s.is_failed())
                .all(|s| s.is_control_connected())
        };
        let mut ticks = 0;
        while ticks < self.config.connect_ticks && !all_connected(topo) {
            scheduler.tick(topo);
            ticks += 1;
        }
        if all_connected(topo) {
            info!("All switches connected after {ticks} ticks");
        } else {
            warn!(
                "Not all switches connected after {ticks} ticks, continuing with {} of {}",
                topo.switches()
                    .iter()
                    .filter(|s| s.is_control_connected())
                    .count(),
                topo.switches().len()
            );
        }
    }

    async fn step_loop(&mut self, ctx: &mut RunContext, steps: Option<u64>) {
        let cancel = ctx.cancellation();
        let mut step = 0;
        let mut pending = 0;
        loop {
            if steps.map(|n| step >= n).unwrap_or(false) {
                break;
            }
            if cancel.is_cancelled() {
                self.report.interrupted = true;
                break;
            }

            if self.config.interactive {
                if pending == 0 {
                    match self.prompt(ctx, step).await {
                        Prompt::Advance(n) => pending = n,
                        Prompt::Quit => break,
                        Prompt::Interrupted => {
                            self.report.interrupted = true;
                            break;
                        }
                    }
                    if pending == 0 {
                        continue;
                    }
                }
                pending -= 1;
            } else if !self.config.delay.is_zero() {
                tokio::select! {
                    _ = tokio::time::sleep(self.config.delay) => {},
                    _ = cancel.cancelled() => {
                        self.report.interrupted = true;
                        break;
                    }
                }
            }

            step += 1;
            self.advance(ctx, step);
            self.report.steps_run = step;

            let due = self.config.force_check
                || (self.config.check_interval > 0 && step % self.config.check_interval == 0);
            if due && self.check(ctx, step).await && self.config.halt_on_violation {
                warn!("[step {step}] halting at the correspondence violation");
                self.report.halted = true;
                break;
            }
        }
        if self.report.interrupted {
            warn!("Interrupted after {step} steps");
        }
    }

    /// Wait for operator commands until one of them advances or stops the simulation.
    async fn prompt(&mut self, ctx: &mut RunContext, step: u64) -> Prompt {
        let cancel = ctx.cancellation();
        let prompt = format!("[step {step}] > ");
        loop {
            let Some(input) = self.input.as_mut() else {
                return Prompt::Quit;
            };
            let line = tokio::select! {
                line = input.next_line(&prompt) => line,
                _ = cancel.cancelled() => return Prompt::Interrupted,
            };
            let Some(line) = line else {
                info!("End of operator input");
                return Prompt::Quit;
            };
            match line.parse::<Command>() {
                Ok(Command::Step(n)) => return Prompt::Advance(n),
                Ok(Command::Quit) => return Prompt::Quit,
                Ok(Command::Inspect) => {
                    if let Some(topo) = ctx.topology.as_ref() {
                        println!("{}", describe(topo, step));
                    }
                }
                Ok(Command::Check) => {
                    self.check(ctx, step).await;
                }
                Ok(Command::Fail(event)) => {
                    if let Some(topo) = ctx.topology.as_mut() {
                        // applied before the tick of the next step
                        let next = step + 1;
                        self.inject(topo, &mut ctx.scheduler, next, FaultOrigin::Operator, event);
                    }
                }
                Ok(Command::Help) => println!("{HELP}"),
                Err(e) => println!("{e}\n{HELP}"),
            }
        }
    }

    /// Apply the faults of this step and tick the scheduler once.
    fn advance(&mut self, ctx: &mut RunContext, step: u64) {
        let Some(topo) = ctx.topology.as_mut() else {
            return;
        };
        let scheduler = &mut ctx.scheduler;

        for event in self.injector.draw(topo, scheduler.now()) {
            self.inject(topo, scheduler, step, FaultOrigin::Random, event);
        }
        let replayed = match self.trace.as_mut().map(|t| t.events_due(step)) {
            Some(Ok(events)) => events,
            Some(Err(e)) => {
                error!("[step {step}] cannot replay the dataplane trace: {e}");
                self.trace = None;
                Vec::new()
            }
            None => Vec::new(),
        };
        for event in replayed {
            self.inject(topo, scheduler, step, FaultOrigin::Trace, event);
        }

        let tick = scheduler.tick(topo);
        if !tick.failures.is_empty() {
            debug!("[step {step}] {} failures during the tick", tick.failures.len());
        }

        for switch in topo.switches() {
            if switch.control().health() != ChannelHealth::LikelyCrashed {
                self.failing_channels.remove(&switch.id());
            } else if self.failing_channels.insert(switch.id()) {
                self.report.alerts.push(HealthAlert::ChannelFailing {
                    step,
                    controller: switch.controller(),
                    channel: switch.control().peer(),
                });
            }
        }
        for exit in ctx.processes.poll_exited() {
            self.report.alerts.push(HealthAlert::ProcessExited {
                step,
                controller: exit.controller,
                status: exit.status.to_string(),
            });
        }
    }

    fn inject(
        &mut self,
        topo: &mut Topology,
        scheduler: &mut Scheduler<Topology>,
        step: u64,
        origin: FaultOrigin,
        event: NetworkEvent,
    ) {
        match topo.apply_event(&event, scheduler.timers_mut()) {
            Ok(applied) => {
                if applied {
                    info!("[step {step}] {origin} {event}");
                }
                self.report.faults.push(FaultEvent {
                    step,
                    origin,
                    kind: FaultKind::of(&event),
                    event,
                    applied,
                });
            }
            Err(e) => warn!("[step {step}] cannot apply {event}: {e}"),
        }
    }

    /// Check all controllers. Returns `true` if a violation was found.
    async fn check(&mut self, ctx: &RunContext, step: u64) -> bool {
        let Some(topo) = ctx.topology.as_ref() else {
            return false;
        };
        self.transition(EngineState::CorrespondenceChecking);
        let (verdicts, alerts) = self.checker.check(step, topo).await;
        self.transition(EngineState::Stepping);
        let violation = verdicts.iter().any(|v| v.is_violation());
        self.report.checks.extend(verdicts);
        self.report.alerts.extend(alerts);
        violation
    }

    async fn drain(&mut self, ctx: &mut RunContext) {
        self.transition(EngineState::Draining);
        // errors are logged by the context; reaching `Stopped` does not depend on them.
        let _ = ctx.shutdown().await;
        self.transition(EngineState::Stopped);
        self.report.final_state = EngineState::Stopped;
    }
}
