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

//! Randomized fault injection.
//!
//! The fuzzer parameters assign a probability to every [`FaultKind`]. In every step, the
//! [`FaultInjector`] goes through all kinds in their declaration order, and through all eligible
//! targets of that kind in ascending order, and draws once per target. Since the random number
//! generator is seeded explicitly, the same seed, parameters, and topology always result in the
//! same faults.

use std::{collections::BTreeMap, fmt::Display, path::Path, str::FromStr};

use rand::{rngs::StdRng, Rng, SeedableRng};
use serde::{Deserialize, Serialize};
use simnet::{
    topology::Topology,
    trace::NetworkEvent,
    types::{HostId, VirtualTime},
};
use thiserror::Error;

/// Number of ticks a channel is held by a control message delay.
pub const DELAY_TICKS: u64 = 3;

/// Kinds of faults that can be injected.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize,
)]
#[serde(rename_all = "snake_case")]
pub enum FaultKind {
    /// Crash a live switch
    SwitchFailure,
    /// Restart a crashed switch
    SwitchRecovery,
    /// Take down an inter-switch link
    LinkFailure,
    /// Bring up an inter-switch link
    LinkRecovery,
    /// Take down the access link of a host
    AccessLinkFailure,
    /// Bring up the access link of a host
    AccessLinkRecovery,
    /// Disconnect a switch from its controller
    ControlChannelFailure,
    /// Reconnect a switch to its controller
    ControlChannelRecovery,
    /// Drop the queued control messages of a switch
    ControlMessageDrop,
    /// Hold the control channel of a switch for [`DELAY_TICKS`] ticks
    ControlMessageDelay,
    /// Send a packet from a host to another host
    TrafficGeneration,
}

impl FaultKind {
    /// All kinds, in the order in which they are drawn.
    pub const ALL: [FaultKind; 11] = [
        Self::SwitchFailure,
        Self::SwitchRecovery,
        Self::LinkFailure,
        Self::LinkRecovery,
        Self::AccessLinkFailure,
        Self::AccessLinkRecovery,
        Self::ControlChannelFailure,
        Self::ControlChannelRecovery,
        Self::ControlMessageDrop,
        Self::ControlMessageDelay,
        Self::TrafficGeneration,
    ];

    /// Name as used in the parameter file and on the command prompt.
    pub fn name(&self) -> &'static str {
        match self {
            Self::SwitchFailure => "switch_failure",
            Self::SwitchRecovery => "switch_recovery",
            Self::LinkFailure => "link_failure",
            Self::LinkRecovery => "link_recovery",
            Self::AccessLinkFailure => "access_link_failure",
            Self::AccessLinkRecovery => "access_link_recovery",
            Self::ControlChannelFailure => "control_channel_failure",
            Self::ControlChannelRecovery => "control_channel_recovery",
            Self::ControlMessageDrop => "control_message_drop",
            Self::ControlMessageDelay => "control_message_delay",
            Self::TrafficGeneration => "traffic_generation",
        }
    }

    /// The kind of a network event.
    pub fn of(event: &NetworkEvent) -> Self {
        match event {
            NetworkEvent::SwitchFailure { .. } => Self::SwitchFailure,
            NetworkEvent::SwitchRecovery { .. } => Self::SwitchRecovery,
            NetworkEvent::LinkFailure { .. } => Self::LinkFailure,
            NetworkEvent::LinkRecovery { .. } => Self::LinkRecovery,
            NetworkEvent::AccessLinkFailure { .. } => Self::AccessLinkFailure,
            NetworkEvent::AccessLinkRecovery { .. } => Self::AccessLinkRecovery,
            NetworkEvent::ControlChannelFailure { .. } => Self::ControlChannelFailure,
            NetworkEvent::ControlChannelRecovery { .. } => Self::ControlChannelRecovery,
            NetworkEvent::ControlMessageDrop { .. } => Self::ControlMessageDrop,
            NetworkEvent::ControlMessageDelay { .. } => Self::ControlMessageDelay,
            NetworkEvent::Packet { .. } => Self::TrafficGeneration,
        }
    }
}

impl Display for FaultKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for FaultKind {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::ALL
            .into_iter()
            .find(|k| k.name() == s)
            .ok_or_else(|| ParamsError::UnknownKind(s.to_string()))
    }
}

/// Probability of every fault kind. Kinds that are not mentioned have probability 0.
///
/// The parameter file is a TOML table:
///
/// ```toml
/// link_failure = 0.05
/// link_recovery = 0.2
/// traffic_generation = 0.1
/// ```
#[derive(Debug, Clone, Default, PartialEq)]
pub struct FuzzerParams {
    probabilities: BTreeMap<FaultKind, f64>,
}

impl FuzzerParams {
    /// Parameters without any fault.
    pub fn new() -> Self {
        Self::default()
    }

    /// Read the parameters from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ParamsError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ParamsError::Io {
            path: path.display().to_string(),
            source,
        })?;
        content.parse()
    }

    /// Change the probability of a fault kind.
    pub fn set(&mut self, kind: FaultKind, probability: f64) -> Result<(), ParamsError> {
        if !(0.0..=1.0).contains(&probability) {
            return Err(ParamsError::InvalidProbability { kind, probability });
        }
        if probability == 0.0 {
            self.probabilities.remove(&kind);
        } else {
            self.probabilities.insert(kind, probability);
        }
        Ok(())
    }

    /// Builder version of [`FuzzerParams::set`].
    pub fn with(mut self, kind: FaultKind, probability: f64) -> Result<Self, ParamsError> {
        self.set(kind, probability)?;
        Ok(self)
    }

    /// Probability of a fault kind
    pub fn probability(&self, kind: FaultKind) -> f64 {
        self.probabilities.get(&kind).copied().unwrap_or(0.0)
    }

    /// Returns `true` if no fault can be injected.
    pub fn is_quiet(&self) -> bool {
        self.probabilities.is_empty()
    }

    /// Iterate over all kinds with non-zero probability, in their declaration order.
    pub fn iter(&self) -> impl Iterator<Item = (FaultKind, f64)> + '_ {
        self.probabilities.iter().map(|(k, p)| (*k, *p))
    }
}

impl FromStr for FuzzerParams {
    type Err = ParamsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let raw: BTreeMap<String, f64> = toml::from_str(s)?;
        let mut params = Self::new();
        for (key, probability) in raw {
            params.set(key.parse()?, probability)?;
        }
        Ok(params)
    }
}

/// Draws random faults.
#[derive(Debug)]
pub struct FaultInjector {
    params: FuzzerParams,
    rng: StdRng,
}

impl FaultInjector {
    /// Create an injector with an explicit seed.
    pub fn new(params: FuzzerParams, seed: u64) -> Self {
        Self {
            params,
            rng: StdRng::seed_from_u64(seed),
        }
    }

    /// The parameters
    pub fn params(&self) -> &FuzzerParams {
        &self.params
    }

    /// Draw the faults of one step. Eligibility is decided on the state of `topo` before any of
    /// the returned events is applied.
    pub fn draw(&mut self, topo: &Topology, now: VirtualTime) -> Vec<NetworkEvent> {
        let mut events = Vec::new();
        for (kind, probability) in self.params.iter() {
            for target in eligible(topo, kind, now) {
                if !self.rng.gen_bool(probability) {
                    continue;
                }
                let event = match target {
                    Target::Event(event) => event,
                    Target::Sender(src) => {
                        let others: Vec<HostId> = topo
                            .hosts()
                            .iter()
                            .map(|h| h.id)
                            .filter(|h| *h != src)
                            .collect();
                        let dst = others[self.rng.gen_range(0..others.len())];
                        NetworkEvent::Packet { src, dst }
                    }
                };
                events.push(event);
            }
        }
        events
    }
}

/// A candidate for a fault. Packets need a second draw for the destination.
enum Target {
    Event(NetworkEvent),
    Sender(HostId),
}

/// All targets of `kind`, in ascending order.
fn eligible(topo: &Topology, kind: FaultKind, now: VirtualTime) -> Vec<Target> {
    let alive = topo.switches().iter().filter(|s| !s.is_failed());
    match kind {
        FaultKind::SwitchFailure => alive
            .map(|s| NetworkEvent::SwitchFailure { switch: s.id() })
            .map(Target::Event)
            .collect(),
        FaultKind::SwitchRecovery => topo
            .switches()
            .iter()
            .filter(|s| s.is_failed())
            .map(|s| Target::Event(NetworkEvent::SwitchRecovery { switch: s.id() }))
            .collect(),
        FaultKind::LinkFailure => topo
            .links()
            .iter()
            .filter(|l| l.up)
            .map(|l| {
                Target::Event(NetworkEvent::LinkFailure {
                    a: l.a.0,
                    b: l.b.0,
                })
            })
            .collect(),
        FaultKind::LinkRecovery => topo
            .links()
            .iter()
            .filter(|l| !l.up)
            .map(|l| {
                Target::Event(NetworkEvent::LinkRecovery {
                    a: l.a.0,
                    b: l.b.0,
                })
            })
            .collect(),
        FaultKind::AccessLinkFailure => topo
            .access_links()
            .iter()
            .filter(|a| a.up)
            .map(|a| Target::Event(NetworkEvent::AccessLinkFailure { host: a.host }))
            .collect(),
        FaultKind::AccessLinkRecovery => topo
            .access_links()
            .iter()
            .filter(|a| !a.up)
            .map(|a| Target::Event(NetworkEvent::AccessLinkRecovery { host: a.host }))
            .collect(),
        FaultKind::ControlChannelFailure => alive
            .filter(|s| !s.control().is_closed())
            .map(|s| Target::Event(NetworkEvent::ControlChannelFailure { switch: s.id() }))
            .collect(),
        FaultKind::ControlChannelRecovery => alive
            .filter(|s| s.control().is_closed())
            .map(|s| Target::Event(NetworkEvent::ControlChannelRecovery { switch: s.id() }))
            .collect(),
        FaultKind::ControlMessageDrop => alive
            .filter(|s| s.control().pending_sends() > 0)
            .map(|s| Target::Event(NetworkEvent::ControlMessageDrop { switch: s.id() }))
            .collect(),
        FaultKind::ControlMessageDelay => alive
            .filter(|s| !s.control().is_closed() && !s.control().is_held(now))
            .map(|s| {
                Target::Event(NetworkEvent::ControlMessageDelay {
                    switch: s.id(),
                    ticks: DELAY_TICKS,
                })
            })
            .collect(),
        FaultKind::TrafficGeneration if topo.hosts().len() < 2 => Vec::new(),
        FaultKind::TrafficGeneration => topo
            .access_links()
            .iter()
            .filter(|a| a.up)
            .map(|a| Target::Sender(a.host))
            .collect(),
    }
}

/// Errors in the fuzzer parameters
#[derive(Debug, Error)]
pub enum ParamsError {
    /// Cannot read the file.
    #[error("Cannot read {path}: {source}")]
    Io {
        /// The file
        path: String,
        /// The error
        #[source]
        source: std::io::Error,
    },
    /// The file is not a valid TOML table of probabilities.
    #[error("Invalid fuzzer parameters: {0}")]
    Toml(#[from] toml::de::Error),
    /// Unknown fault kind
    #[error("Unknown fault kind `{0}`")]
    UnknownKind(String),
    /// The probability is not in `[0, 1]`.
    #[error("Probability of {kind} must be in [0, 1], but is {probability}")]
    InvalidProbability {
        /// The fault kind
        kind: FaultKind,
        /// The invalid probability
        probability: f64,
    },
}
