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

//! Module containing all type definitions

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::openflow::OfError;

/// Virtual time of the simulation, counted in scheduler ticks.
pub type VirtualTime = u64;

macro_rules! id_type {
    ($(#[$meta:meta])* $name:ident($inner:ty), $fmt:literal) => {
        $(#[$meta])*
        #[derive(PartialEq, Eq, PartialOrd, Ord, Hash, Debug, Clone, Copy, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(pub $inner);

        impl std::fmt::Display for $name {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, $fmt, self.0)
            }
        }

        impl From<$inner> for $name {
            fn from(x: $inner) -> Self {
                Self(x)
            }
        }
    };
}

id_type!(
    /// Datapath identifier of a switch. Generated switches are numbered starting at 1.
    SwitchId(u64),
    "s{}"
);
id_type!(
    /// Identifier of a host. Generated hosts are numbered starting at 1.
    HostId(u32),
    "h{}"
);
id_type!(
    /// Index of a controller in the controller list of the experiment.
    ControllerId(usize),
    "c{}"
);
id_type!(
    /// Index of a control channel (deferred I/O worker) in the topology.
    ChannelId(usize),
    "ch{}"
);
id_type!(
    /// Index of an inter-switch link.
    LinkId(usize),
    "l{}"
);
id_type!(
    /// Index of an access link (switch to host).
    AccessLinkId(usize),
    "a{}"
);
id_type!(
    /// Data-plane port number on a switch. Port numbers start at 1.
    PortNo(u16),
    "{}"
);

/// Configuration errors while generating or mutating a topology.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TopologyError {
    /// The number of switches of a mesh must be positive.
    #[error("Number of switches must be positive, got {0}")]
    InvalidSwitchCount(usize),
    /// A fat-tree needs a positive, even number of pods.
    #[error("Number of pods must be a positive even number, got {0}")]
    InvalidPodCount(usize),
    /// Every switch needs at least one host.
    #[error("Every switch needs at least one host, got {0} hosts per switch")]
    InvalidHostsPerSwitch(usize),
    /// The controller list is empty.
    #[error("No controller was supplied")]
    NoControllers,
    /// A controller referenced by the binding policy does not exist.
    #[error("Controller {0} does not exist")]
    UnknownController(ControllerId),
    /// The address of a controller cannot be resolved.
    #[error("Cannot resolve controller address {0}")]
    InvalidAddress(String),
    /// Switch is not present in the topology
    #[error("Switch was not found in topology: {0}")]
    UnknownSwitch(SwitchId),
    /// Host is not present in the topology
    #[error("Host was not found in topology: {0}")]
    UnknownHost(HostId),
    /// No link connects the two switches
    #[error("Link does not exist: {0} -- {1}")]
    UnknownLink(SwitchId, SwitchId),
}

/// Error raised by a scheduler task or a deferred callback. These errors are recoverable: the
/// scheduler reports them and skips the failing unit of work for the current tick.
#[derive(Debug, Error)]
pub enum TaskError {
    /// I/O error on a control channel.
    #[error("I/O error on {channel}: {source}")]
    Io {
        /// The channel on which the error occurred.
        channel: ChannelId,
        /// The underlying error.
        #[source]
        source: std::io::Error,
    },
    /// The channel does not exist.
    #[error("Channel {0} does not exist")]
    UnknownChannel(ChannelId),
    /// The peer sent something that cannot be decoded.
    #[error("Protocol error on {0}: {1}")]
    Protocol(ChannelId, OfError),
    /// Any other failure.
    #[error("{0}")]
    Other(String),
}
