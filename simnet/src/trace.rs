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

//! Network events and dataplane traces.
//!
//! A dataplane trace is a file with one JSON object per line. Every object contains the step at
//! which the event is replayed, and the event itself, tagged by its `type`:
//!
//! ```text
//! # comment
//! {"step": 3, "type": "link_failure", "a": 1, "b": 2}
//! {"step": 5, "type": "packet", "src": 1, "dst": 2}
//! {"step": 9, "type": "link_recovery", "a": 1, "b": 2}
//! ```
//!
//! Steps must be non-decreasing. The trace is read lazily while it is replayed.

use std::{
    fmt::Display,
    fs::File,
    io::{self, BufRead, BufReader},
    path::Path,
};

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{
    topology::Topology,
    types::{HostId, SwitchId, TopologyError},
};

/// An event that changes the simulated network.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum NetworkEvent {
    /// The link between two switches goes down.
    LinkFailure {
        /// One end of the link
        a: SwitchId,
        /// The other end of the link
        b: SwitchId,
    },
    /// The link between two switches comes back up.
    LinkRecovery {
        /// One end of the link
        a: SwitchId,
        /// The other end of the link
        b: SwitchId,
    },
    /// A switch crashes.
    SwitchFailure {
        /// The switch
        switch: SwitchId,
    },
    /// A crashed switch restarts.
    SwitchRecovery {
        /// The switch
        switch: SwitchId,
    },
    /// The access link of a host goes down.
    AccessLinkFailure {
        /// The host
        host: HostId,
    },
    /// The access link of a host comes back up.
    AccessLinkRecovery {
        /// The host
        host: HostId,
    },
    /// The control channel of a switch is disconnected.
    ControlChannelFailure {
        /// The switch
        switch: SwitchId,
    },
    /// The control channel of a switch is reconnected.
    ControlChannelRecovery {
        /// The switch
        switch: SwitchId,
    },
    /// All control messages of a switch that were not yet written are dropped.
    ControlMessageDrop {
        /// The switch
        switch: SwitchId,
    },
    /// The control channel of a switch is held for some ticks.
    ControlMessageDelay {
        /// The switch
        switch: SwitchId,
        /// Number of ticks
        ticks: u64,
    },
    /// A host sends a packet to another host.
    Packet {
        /// Sender
        src: HostId,
        /// Receiver
        dst: HostId,
    },
}

impl Display for NetworkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::LinkFailure { a, b } => write!(f, "link failure {a} -- {b}"),
            Self::LinkRecovery { a, b } => write!(f, "link recovery {a} -- {b}"),
            Self::SwitchFailure { switch } => write!(f, "switch failure {switch}"),
            Self::SwitchRecovery { switch } => write!(f, "switch recovery {switch}"),
            Self::AccessLinkFailure { host } => write!(f, "access link failure {host}"),
            Self::AccessLinkRecovery { host } => write!(f, "access link recovery {host}"),
            Self::ControlChannelFailure { switch } => {
                write!(f, "control channel failure {switch}")
            }
            Self::ControlChannelRecovery { switch } => {
                write!(f, "control channel recovery {switch}")
            }
            Self::ControlMessageDrop { switch } => write!(f, "control message drop {switch}"),
            Self::ControlMessageDelay { switch, ticks } => {
                write!(f, "control message delay {switch} ({ticks} ticks)")
            }
            Self::Packet { src, dst } => write!(f, "packet {src} -> {dst}"),
        }
    }
}

/// An event of a dataplane trace
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TraceEvent {
    /// Step at which the event is replayed
    pub step: u64,
    /// The event
    #[serde(flatten)]
    pub event: NetworkEvent,
}

/// Errors while reading a dataplane trace
#[derive(Debug, Error)]
pub enum TraceError {
    /// Cannot read the trace
    #[error("Cannot read the trace: {0}")]
    Io(#[from] io::Error),
    /// A line is not a valid event
    #[error("Invalid event on line {line}: {source}")]
    Parse {
        /// Line number (starting at 1)
        line: usize,
        /// Parse error
        #[source]
        source: serde_json::Error,
    },
    /// Steps are decreasing
    #[error("Event on line {line} at step {step} happens before the previous event (step {previous})")]
    OutOfOrder {
        /// Line number (starting at 1)
        line: usize,
        /// Step of the event
        step: u64,
        /// Step of the previous event
        previous: u64,
    },
    /// The event references something that is not part of the topology
    #[error("Event on line {line} does not match the topology: {source}")]
    Invalid {
        /// Line number (starting at 1)
        line: usize,
        /// What is wrong
        #[source]
        source: TopologyError,
    },
}

/// Iterator over the events of a trace, together with their line numbers.
#[derive(Debug)]
pub struct TraceReader<R> {
    reader: R,
    line: usize,
    last_step: Option<u64>,
    buf: String,
}

impl<R: BufRead> TraceReader<R> {
    /// Read the trace from `reader`.
    pub fn new(reader: R) -> Self {
        Self {
            reader,
            line: 0,
            last_step: None,
            buf: String::new(),
        }
    }

    /// Line number of the last event returned.
    pub fn line(&self) -> usize {
        self.line
    }
}

impl TraceReader<BufReader<File>> {
    /// Open a trace file.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Ok(Self::new(BufReader::new(File::open(path)?)))
    }
}

impl<R: BufRead> Iterator for TraceReader<R> {
    type Item = Result<TraceEvent, TraceError>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            self.buf.clear();
            match self.reader.read_line(&mut self.buf) {
                Ok(0) => return None,
                Ok(_) => {}
                Err(e) => return Some(Err(e.into())),
            }
            self.line += 1;
            let line = self.buf.trim();
            if line.is_empty() || line.starts_with('#') {
                continue;
            }
            let event: TraceEvent = match serde_json::from_str(line) {
                Ok(e) => e,
                Err(source) => {
                    return Some(Err(TraceError::Parse {
                        line: self.line,
                        source,
                    }))
                }
            };
            if let Some(previous) = self.last_step {
                if event.step < previous {
                    return Some(Err(TraceError::OutOfOrder {
                        line: self.line,
                        step: event.step,
                        previous,
                    }));
                }
            }
            self.last_step = Some(event.step);
            return Some(Ok(event));
        }
    }
}

/// Lazy replay of a dataplane trace.
#[derive(Debug)]
pub struct DataplaneTrace<R = BufReader<File>> {
    reader: TraceReader<R>,
    pending: Option<TraceEvent>,
    error: Option<TraceError>,
    exhausted: bool,
    replayed: usize,
}

impl DataplaneTrace<BufReader<File>> {
    /// Open a trace file for replay.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, TraceError> {
        Ok(Self::new(TraceReader::open(path)?))
    }
}

impl<R: BufRead> DataplaneTrace<R> {
    /// Replay the events of `reader`.
    pub fn new(reader: TraceReader<R>) -> Self {
        Self {
            reader,
            pending: None,
            error: None,
            exhausted: false,
            replayed: 0,
        }
    }

    /// Check every event of a trace against the topology without replaying it. Returns the
    /// number of events.
    pub fn validate(reader: TraceReader<R>, topo: &Topology) -> Result<usize, TraceError> {
        let mut reader = reader;
        let mut count = 0;
        while let Some(event) = reader.next() {
            let event = event?;
            topo.check_event(&event.event)
                .map_err(|source| TraceError::Invalid {
                    line: reader.line(),
                    source,
                })?;
            count += 1;
        }
        Ok(count)
    }

    /// Returns `true` if all events were replayed.
    pub fn is_exhausted(&self) -> bool {
        self.exhausted && self.pending.is_none()
    }

    /// Number of events replayed so far.
    pub fn replayed(&self) -> usize {
        self.replayed
    }

    /// Take all events that are due at `step` (including those of earlier steps that were not
    /// yet taken), in file order. Reading stops at the first broken line. The events before it
    /// are still returned, and the error is returned by the next call.
    pub fn events_due(&mut self, step: u64) -> Result<Vec<NetworkEvent>, TraceError> {
        if let Some(e) = self.error.take() {
            return Err(e);
        }
        let mut due = Vec::new();
        loop {
            if self.pending.is_none() && !self.exhausted {
                match self.reader.next() {
                    Some(Ok(event)) => self.pending = Some(event),
                    Some(Err(e)) => {
                        self.exhausted = true;
                        if due.is_empty() {
                            return Err(e);
                        }
                        self.error = Some(e);
                    }
                    None => self.exhausted = true,
                }
            }
            match self.pending.take() {
                Some(event) if event.step <= step => due.push(event.event),
                Some(event) => {
                    self.pending = Some(event);
                    break;
                }
                None => break,
            }
        }
        self.replayed += due.len();
        Ok(due)
    }
}
