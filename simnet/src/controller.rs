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

//! Controllers participating in an experiment.

use serde::{Deserialize, Serialize};

use crate::types::ControllerId;

/// Placeholder in a controller command line that is replaced by the controller address.
pub const ADDRESS_PLACEHOLDER: &str = "__address__";
/// Placeholder in a controller command line that is replaced by the controller port.
pub const PORT_PLACEHOLDER: &str = "__port__";
/// Address used if nothing else is configured.
pub const DEFAULT_ADDRESS: &str = "127.0.0.1";

/// A controller the switches connect to. The command line is a template that may contain
/// [`ADDRESS_PLACEHOLDER`] and [`PORT_PLACEHOLDER`].
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Controller {
    /// Index of the controller.
    pub id: ControllerId,
    /// Address on which the controller listens for switches.
    pub address: String,
    /// Port on which the controller listens for switches.
    pub port: u16,
    /// Command line template used to launch the controller process.
    pub cmdline: Vec<String>,
    /// Port on which the controller exposes its internal state for snapshots. If `None`, the
    /// default of the snapshot flavor is used.
    pub snapshot_port: Option<u16>,
}

impl Controller {
    /// Create a new controller listening on the default address.
    pub fn new(id: usize, cmdline: Vec<String>, port: u16) -> Self {
        Self {
            id: ControllerId(id),
            address: DEFAULT_ADDRESS.to_string(),
            port,
            cmdline,
            snapshot_port: None,
        }
    }

    /// Change the listening address.
    pub fn with_address(mut self, address: impl Into<String>) -> Self {
        self.address = address.into();
        self
    }

    /// Change the snapshot port.
    pub fn with_snapshot_port(mut self, port: u16) -> Self {
        self.snapshot_port = Some(port);
        self
    }

    /// Name used in logs, `c<index>`.
    pub fn label(&self) -> String {
        self.id.to_string()
    }

    /// Substitute the address and port placeholders in the command line template. The address
    /// is substituted first, then the port.
    pub fn resolved_cmdline(&self) -> Vec<String> {
        let port = self.port.to_string();
        self.cmdline
            .iter()
            .map(|arg| {
                arg.replace(ADDRESS_PLACEHOLDER, &self.address)
                    .replace(PORT_PLACEHOLDER, &port)
            })
            .collect()
    }
}
