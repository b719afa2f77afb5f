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

//! Correspondence checks: compare the view of every controller with the ground truth.

use std::collections::BTreeMap;

use log::{error, warn};
use simnet::{
    topology::{Topology, ViewDiff},
    types::ControllerId,
};

use crate::snapshot::SnapshotService;

/// Number of consecutive snapshot failures after which a controller is reported as unhealthy.
pub const SNAPSHOT_FAILURE_THRESHOLD: usize = 2;

/// Outcome of a check for one controller
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    /// The view of the controller matches the network.
    Consistent,
    /// The view of the controller differs from the network.
    Violation(ViewDiff),
    /// No snapshot could be taken.
    Unavailable(String),
}

/// Verdict of a single controller at a single step
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CheckVerdict {
    /// Step after which the check was done
    pub step: u64,
    /// The controller
    pub controller: ControllerId,
    /// The outcome
    pub verdict: Verdict,
}

impl CheckVerdict {
    /// Returns `true` if the check found a violation.
    pub fn is_violation(&self) -> bool {
        matches!(self.verdict, Verdict::Violation(_))
    }
}

/// Something that looks wrong with a controller, independent of its view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HealthAlert {
    /// Snapshots failed several times in a row.
    SnapshotFailures {
        /// Step of the last failure
        step: u64,
        /// The controller
        controller: ControllerId,
        /// Number of consecutive failures
        count: usize,
    },
    /// The controller process has exited.
    ProcessExited {
        /// Step at which the exit was noticed
        step: u64,
        /// The controller
        controller: ControllerId,
        /// Exit status
        status: String,
    },
    /// The control channel of a switch keeps failing.
    ChannelFailing {
        /// Step at which the escalation was noticed
        step: u64,
        /// The controller
        controller: ControllerId,
        /// Description of the channel
        channel: String,
    },
}

/// Runs correspondence checks with a [`SnapshotService`].
#[derive(Debug)]
pub struct CorrespondenceChecker {
    service: Box<dyn SnapshotService>,
    failures: BTreeMap<ControllerId, usize>,
}

impl CorrespondenceChecker {
    /// Create a checker that uses `service`.
    pub fn new(service: Box<dyn SnapshotService>) -> Self {
        Self {
            service,
            failures: BTreeMap::new(),
        }
    }

    /// Check every controller of the topology, in ascending order. The topology must not change
    /// while the check is running.
    pub async fn check(
        &mut self,
        step: u64,
        topo: &Topology,
    ) -> (Vec<CheckVerdict>, Vec<HealthAlert>) {
        let mut verdicts = Vec::new();
        let mut alerts = Vec::new();
        for controller in topo.panel().controllers() {
            let expected = topo.expected_view(controller.id);
            let verdict = match self.service.snapshot(controller).await {
                Ok(observed) => {
                    self.failures.remove(&controller.id);
                    let diff = expected.diff(&observed);
                    if diff.is_empty() {
                        Verdict::Consistent
                    } else {
                        error!(
                            "[step {step}] correspondence violation on {}: {diff}",
                            controller.id
                        );
                        Verdict::Violation(diff)
                    }
                }
                Err(e) => {
                    warn!("[step {step}] {e}");
                    let count = self.failures.entry(controller.id).or_default();
                    *count += 1;
                    if *count == SNAPSHOT_FAILURE_THRESHOLD {
                        error!(
                            "[step {step}] controller {} likely crashed: {count} consecutive snapshots failed",
                            controller.id
                        );
                        alerts.push(HealthAlert::SnapshotFailures {
                            step,
                            controller: controller.id,
                            count: *count,
                        });
                    }
                    Verdict::Unavailable(e.to_string())
                }
            };
            verdicts.push(CheckVerdict {
                step,
                controller: controller.id,
                verdict,
            });
        }
        (verdicts, alerts)
    }
}
