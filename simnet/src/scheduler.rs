// SimNet: deterministic SDN data-plane simulator written in Rust
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

//! Single-threaded cooperative scheduler.
//!
//! The [`Scheduler`] owns a set of recurring [`Task`]s and a queue of deferred callbacks
//! ([`Timers`]). Both operate on a *world* `W` that is passed into every tick, so that the
//! scheduler never owns the simulated network itself. One call to [`Scheduler::tick`] performs
//! the following phases:
//!
//! 1. poll every registered task for readiness (non-blocking),
//! 2. run the tasks that reported to be ready,
//! 3. run the deferred callbacks that are due, ordered by due time and registration order.
//!
//! Virtual time advances by one after every tick. A callback registered with delay `0` during
//! the deferred phase runs in the next tick at the earliest, so a tick always terminates.
//!
//! Failures of tasks or callbacks never stop the loop. They are logged and returned in the
//! [`TickReport`]; only [`Scheduler::quit`] stops it.

use std::collections::BTreeMap;

use log::{debug, trace, warn};

use crate::types::{TaskError, VirtualTime};

/// What should happen with a task after it was run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TaskStatus {
    /// Keep the task registered.
    Continue,
    /// Remove the task from the scheduler.
    Finished,
}

/// Unit of recurring work registered with the [`Scheduler`].
pub trait Task<W> {
    /// Name used for logging and failure reports.
    fn name(&self) -> &str;

    /// Non-blocking readiness check. Only tasks that return `Ok(true)` are run in this tick. The
    /// default implementation is always ready.
    fn poll(&mut self, world: &mut W) -> Result<bool, TaskError> {
        let _ = world;
        Ok(true)
    }

    /// Run the task once.
    fn run(&mut self, world: &mut W, timers: &mut Timers<W>) -> Result<TaskStatus, TaskError>;
}

/// Boxed deferred callback.
type Callback<W> = Box<dyn FnOnce(&mut W, &mut Timers<W>) -> Result<(), TaskError>>;

/// A callback waiting in the timer queue.
struct Deferred<W> {
    /// Label for logging.
    label: String,
    /// The function to call
    callback: Callback<W>,
}

/// Queue of deferred callbacks. This is the `call_later` primitive handed to everything that
/// wants to postpone work to a later tick.
pub struct Timers<W> {
    now: VirtualTime,
    seq: u64,
    pending: BTreeMap<(VirtualTime, u64), Deferred<W>>,
}

impl<W> std::fmt::Debug for Timers<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Timers")
            .field("now", &self.now)
            .field("seq", &self.seq)
            .field("pending", &self.pending.len())
            .finish()
    }
}

impl<W> Default for Timers<W> {
    fn default() -> Self {
        Self {
            now: 0,
            seq: 0,
            pending: BTreeMap::new(),
        }
    }
}

impl<W> Timers<W> {
    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.now
    }

    /// Register `callback` to run once `delay` ticks have elapsed. Callbacks with the same due
    /// time run in the order in which they were registered.
    pub fn call_later<F>(&mut self, delay: VirtualTime, label: impl Into<String>, callback: F)
    where
        F: FnOnce(&mut W, &mut Timers<W>) -> Result<(), TaskError> + 'static,
    {
        let key = (self.now.saturating_add(delay), self.seq);
        self.seq += 1;
        self.pending.insert(
            key,
            Deferred {
                label: label.into(),
                callback: Box::new(callback),
            },
        );
    }

    /// Number of pending callbacks.
    pub fn len(&self) -> usize {
        self.pending.len()
    }

    /// Returns `true` if no callback is pending.
    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Due time of the next pending callback.
    pub fn next_due(&self) -> Option<VirtualTime> {
        self.pending.keys().next().map(|(t, _)| *t)
    }

    /// Pop the next callback that is due and that was registered before `fence`.
    fn pop_due(&mut self, fence: u64) -> Option<Deferred<W>> {
        let (&(time, seq), _) = self.pending.first_key_value()?;
        if time <= self.now && seq < fence {
            self.pending.remove(&(time, seq))
        } else {
            None
        }
    }
}

/// Identifier of a registered task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TaskId(pub usize);

/// A task or callback that failed during a tick.
#[derive(Debug)]
pub struct TaskFailure {
    /// Virtual time of the tick.
    pub time: VirtualTime,
    /// Name of the task or label of the callback.
    pub source: String,
    /// The error.
    pub error: TaskError,
}

/// Summary of a single tick.
#[derive(Debug, Default)]
pub struct TickReport {
    /// Virtual time at which the tick was executed.
    pub time: VirtualTime,
    /// Number of tasks that were ready and ran.
    pub tasks_run: usize,
    /// Number of deferred callbacks that ran.
    pub callbacks_run: usize,
    /// Tasks and callbacks that failed.
    pub failures: Vec<TaskFailure>,
}

/// The cooperative scheduler. See the [module documentation](self).
pub struct Scheduler<W> {
    tasks: Vec<(TaskId, Box<dyn Task<W>>)>,
    timers: Timers<W>,
    next_task: usize,
    has_quit: bool,
}

impl<W> std::fmt::Debug for Scheduler<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Scheduler")
            .field(
                "tasks",
                &self.tasks.iter().map(|(_, t)| t.name()).collect::<Vec<_>>(),
            )
            .field("timers", &self.timers)
            .field("has_quit", &self.has_quit)
            .finish()
    }
}

impl<W> Default for Scheduler<W> {
    fn default() -> Self {
        Self::new()
    }
}

impl<W> Scheduler<W> {
    /// Create a new scheduler at virtual time 0.
    pub fn new() -> Self {
        Self {
            tasks: Vec::new(),
            timers: Timers::default(),
            next_task: 0,
            has_quit: false,
        }
    }

    /// Register a recurring task. Tasks are polled and run in registration order.
    pub fn schedule<T: Task<W> + 'static>(&mut self, task: T) -> TaskId {
        let id = TaskId(self.next_task);
        self.next_task += 1;
        debug!("[scheduler] registered task {}", task.name());
        self.tasks.push((id, Box::new(task)));
        id
    }

    /// Register `callback` to run after `delay` ticks. See [`Timers::call_later`].
    pub fn call_later<F>(&mut self, delay: VirtualTime, label: impl Into<String>, callback: F)
    where
        F: FnOnce(&mut W, &mut Timers<W>) -> Result<(), TaskError> + 'static,
    {
        self.timers.call_later(delay, label, callback)
    }

    /// Get mutable access to the timer queue, to register callbacks from outside a tick.
    pub fn timers_mut(&mut self) -> &mut Timers<W> {
        &mut self.timers
    }

    /// Current virtual time.
    pub fn now(&self) -> VirtualTime {
        self.timers.now
    }

    /// Number of registered tasks.
    pub fn num_tasks(&self) -> usize {
        self.tasks.len()
    }

    /// Stop the scheduler. All tasks and pending callbacks are dropped, and every subsequent
    /// call to [`Scheduler::tick`] does nothing. Returns `false` if the scheduler had already
    /// quit, in which case nothing happens.
    pub fn quit(&mut self) -> bool {
        if self.has_quit {
            return false;
        }
        debug!(
            "[scheduler] quit at t={} ({} tasks, {} pending callbacks)",
            self.timers.now,
            self.tasks.len(),
            self.timers.len()
        );
        self.has_quit = true;
        self.tasks.clear();
        self.timers.pending.clear();
        true
    }

    /// Returns `true` if [`Scheduler::quit`] was called.
    pub fn has_quit(&self) -> bool {
        self.has_quit
    }

    /// Execute one iteration of the loop on `world`.
    pub fn tick(&mut self, world: &mut W) -> TickReport {
        let now = self.timers.now;
        let mut report = TickReport {
            time: now,
            ..Default::default()
        };
        if self.has_quit {
            return report;
        }

        // poll all tasks for readiness
        let mut ready = Vec::with_capacity(self.tasks.len());
        for (idx, (_, task)) in self.tasks.iter_mut().enumerate() {
            match task.poll(world) {
                Ok(true) => ready.push(idx),
                Ok(false) => {}
                Err(error) => {
                    warn!("[scheduler] t={now} poll of {} failed: {error}", task.name());
                    report.failures.push(TaskFailure {
                        time: now,
                        source: task.name().to_string(),
                        error,
                    });
                }
            }
        }

        // run the ready tasks
        let mut finished = Vec::new();
        for idx in ready {
            let (id, task) = &mut self.tasks[idx];
            report.tasks_run += 1;
            match task.run(world, &mut self.timers) {
                Ok(TaskStatus::Continue) => {}
                Ok(TaskStatus::Finished) => finished.push(*id),
                Err(error) => {
                    warn!("[scheduler] t={now} task {} failed: {error}", task.name());
                    report.failures.push(TaskFailure {
                        time: now,
                        source: task.name().to_string(),
                        error,
                    });
                }
            }
        }
        if !finished.is_empty() {
            self.tasks.retain(|(id, _)| !finished.contains(id));
        }

        // run all deferred callbacks that were registered before this phase started.
        let fence = self.timers.seq;
        while let Some(deferred) = self.timers.pop_due(fence) {
            trace!("[scheduler] t={now} {}", deferred.label);
            report.callbacks_run += 1;
            if let Err(error) = (deferred.callback)(world, &mut self.timers) {
                warn!("[scheduler] t={now} {} failed: {error}", deferred.label);
                report.failures.push(TaskFailure {
                    time: now,
                    source: deferred.label,
                    error,
                });
            }
        }

        self.timers.now += 1;
        report
    }
}
