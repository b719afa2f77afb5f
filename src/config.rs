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

//! Command line and experiment configuration.

use std::{
    path::{Path, PathBuf},
    time::Duration,
};

use clap::{Parser, ValueEnum};
use log::warn;
use serde::Deserialize;
use simnet::{
    controller::{Controller, DEFAULT_ADDRESS},
    generator::{BindingPolicy, TopologyShape},
    types::ControllerId,
};
use thiserror::Error;

use crate::{runtime::engine::FuzzerConfig, snapshot::ControllerFlavor};

/// Run an SDN controller against a simulated network, inject faults, and check that the view of
/// the controller matches the network.
#[derive(Debug, Clone, Parser)]
#[clap(author, version)]
pub struct Cli {
    /// Run without operator input.
    #[clap(long = "non-interactive", short = 'n')]
    pub non_interactive: bool,
    /// Number of steps between two correspondence checks.
    #[clap(long = "check-interval", short = 'C', default_value = "35")]
    pub check_interval: u64,
    /// Check the correspondence after every step.
    #[clap(long = "force-check")]
    pub force_check: bool,
    /// Delay between two steps in non-interactive mode, in seconds.
    #[clap(long = "delay", short = 'D', default_value = "0.1")]
    pub delay: f64,
    /// Seed of the fault injection.
    #[clap(long = "random-seed", short = 'R', default_value = "0")]
    pub random_seed: u64,
    /// Number of steps to simulate. Runs until interrupted if omitted.
    #[clap(long = "steps", short = 's')]
    pub steps: Option<u64>,
    /// Port of the first controller. Controller `i` listens on `port + i`.
    #[clap(long = "port", short = 'p', default_value = "6633")]
    pub port: u16,
    /// Controller flavor, used for snapshots.
    #[clap(long = "controller", short = 'l', value_enum, default_value = "pox")]
    pub controller: ControllerFlavor,
    /// Probabilities of all fault kinds.
    #[clap(long = "fuzzer-params", short = 'f', default_value = "fuzzer_params.toml")]
    pub fuzzer_params: PathBuf,
    /// Generate a fat-tree instead of a mesh. `--num-switches` is then the number of pods.
    #[clap(long = "fat-tree", short = 'F')]
    pub fat_tree: bool,
    /// Dataplane trace to replay.
    #[clap(long = "trace-file", short = 't')]
    pub trace_file: Option<PathBuf>,
    /// Number of switches (or pods with `--fat-tree`).
    #[clap(long = "num-switches", short = 'N', default_value = "2")]
    pub num_switches: usize,
    /// Experiment configuration file.
    #[clap(long = "config", short = 'c')]
    pub config: Option<PathBuf>,
    /// How switches are assigned to controllers.
    #[clap(long = "binding", value_enum, default_value = "round-robin")]
    pub binding: BindingArg,
    /// Controller used with `--binding fixed`.
    #[clap(long = "fixed-controller", default_value = "0")]
    pub fixed_controller: usize,
    /// Stop at the first correspondence violation.
    #[clap(long = "halt-on-violation")]
    pub halt_on_violation: bool,
    /// Number of ticks to wait during boot until all switches are connected. With 0, stepping
    /// starts right away.
    #[clap(long = "connect-ticks", default_value = "0")]
    pub connect_ticks: u64,
    /// Command line of the controller. `__address__` and `__port__` are replaced.
    #[clap(trailing_var_arg = true, allow_hyphen_values = true)]
    pub controller_args: Vec<String>,
}

/// Binding policy on the command line
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum BindingArg {
    /// Distribute switches over all controllers.
    RoundRobin,
    /// Bind all switches to `--fixed-controller`.
    Fixed,
}

/// Experiment configuration file. Every field is optional.
///
/// ```toml
/// boot_controllers = true
///
/// [[controllers]]
/// cmdline = ["./pox.py", "openflow.of_01", "--address=__address__", "--port=__port__"]
/// snapshot_port = 7790
///
/// [topology]
/// shape = "fat_tree"
/// size = 4
/// binding = "round_robin"
/// ```
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExperimentConfig {
    /// Controllers. If missing, a single controller is built from the command line.
    pub controllers: Option<Vec<ControllerConfig>>,
    /// Whether the controllers are launched by the harness.
    pub boot_controllers: Option<bool>,
    /// Topology to generate.
    pub topology: Option<TopologyConfig>,
}

/// A controller of the experiment configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControllerConfig {
    /// Command line template. If missing, the controller arguments of the command line are used.
    pub cmdline: Option<Vec<String>>,
    /// Listening address
    pub address: Option<String>,
    /// Listening port
    pub port: Option<u16>,
    /// Port for snapshots
    pub snapshot_port: Option<u16>,
}

/// Shape names of the experiment configuration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ShapeName {
    /// Full mesh
    Mesh,
    /// Fat-tree
    FatTree,
}

/// Topology section of the experiment configuration
#[derive(Debug, Clone, Default, PartialEq, Eq, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct TopologyConfig {
    /// Shape of the topology
    pub shape: Option<ShapeName>,
    /// Number of switches (mesh) or pods (fat-tree)
    pub size: Option<usize>,
    /// Binding policy
    pub binding: Option<BindingPolicy>,
    /// Hosts per mesh switch
    pub hosts_per_switch: Option<usize>,
}

impl ExperimentConfig {
    /// Read the configuration from a TOML file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        content.parse()
    }
}

impl std::str::FromStr for ExperimentConfig {
    type Err = ConfigError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(toml::from_str(s)?)
    }
}

/// Everything needed to run an experiment, after merging the command line and the
/// configuration file.
#[derive(Debug, Clone, PartialEq)]
pub struct RunConfig {
    /// All controllers, with resolved addresses and ports.
    pub controllers: Vec<Controller>,
    /// Whether the controllers are launched.
    pub boot_controllers: bool,
    /// Topology shape
    pub shape: TopologyShape,
    /// Binding policy
    pub binding: BindingPolicy,
    /// Hosts per mesh switch
    pub hosts_per_switch: usize,
    /// Controller flavor
    pub flavor: ControllerFlavor,
    /// Fuzzer parameters file
    pub fuzzer_params: PathBuf,
    /// Dataplane trace
    pub trace_file: Option<PathBuf>,
    /// Engine configuration
    pub engine: FuzzerConfig,
}

impl Cli {
    /// Read the experiment configuration (if any) and merge it with the command line.
    pub fn setup(&self) -> Result<RunConfig, ConfigError> {
        let config = match self.config.as_ref() {
            Some(path) => ExperimentConfig::load(path)?,
            None => ExperimentConfig::default(),
        };
        self.merge(config)
    }

    /// Merge the command line with an experiment configuration.
    pub fn merge(&self, config: ExperimentConfig) -> Result<RunConfig, ConfigError> {
        if self.controller_args.is_empty() {
            warn!("No controller arguments given");
        }
        if !self.delay.is_finite() || self.delay < 0.0 {
            return Err(ConfigError::InvalidDelay(self.delay));
        }
        if self.check_interval == 0 && !self.force_check {
            return Err(ConfigError::InvalidCheckInterval);
        }

        let controllers = match config.controllers {
            Some(list) if !list.is_empty() => list
                .into_iter()
                .enumerate()
                .map(|(i, c)| self.controller_from_config(i, c))
                .collect::<Result<Vec<_>, _>>()?,
            _ => vec![Controller::new(0, self.controller_args.clone(), self.port)],
        };
        let boot_controllers = config
            .boot_controllers
            .unwrap_or_else(|| controllers.iter().any(|c| !c.cmdline.is_empty()));
        if boot_controllers {
            if let Some(c) = controllers.iter().find(|c| c.cmdline.is_empty()) {
                return Err(ConfigError::MissingCommand(c.id));
            }
        }

        let topology = config.topology.unwrap_or_default();
        let size = topology.size.unwrap_or(self.num_switches);
        let fat_tree = match topology.shape {
            Some(shape) => shape == ShapeName::FatTree,
            None => self.fat_tree,
        };
        let shape = if fat_tree {
            TopologyShape::FatTree { num_pods: size }
        } else {
            TopologyShape::Mesh { num_switches: size }
        };
        let binding = topology.binding.unwrap_or(match self.binding {
            BindingArg::RoundRobin => BindingPolicy::RoundRobin,
            BindingArg::Fixed => BindingPolicy::Fixed(ControllerId(self.fixed_controller)),
        });

        Ok(RunConfig {
            controllers,
            boot_controllers,
            shape,
            binding,
            hosts_per_switch: topology.hosts_per_switch.unwrap_or(1),
            flavor: self.controller,
            fuzzer_params: self.fuzzer_params.clone(),
            trace_file: self.trace_file.clone(),
            engine: FuzzerConfig {
                interactive: !self.non_interactive,
                check_interval: self.check_interval,
                force_check: self.force_check,
                delay: Duration::from_secs_f64(self.delay),
                seed: self.random_seed,
                steps: self.steps,
                halt_on_violation: self.halt_on_violation,
                connect_ticks: self.connect_ticks,
            },
        })
    }

    fn controller_from_config(
        &self,
        idx: usize,
        config: ControllerConfig,
    ) -> Result<Controller, ConfigError> {
        let port = match config.port {
            Some(port) => port,
            None => u16::try_from(idx)
                .ok()
                .and_then(|i| self.port.checked_add(i))
                .ok_or(ConfigError::PortOverflow(ControllerId(idx)))?,
        };
        let cmdline = config
            .cmdline
            .unwrap_or_else(|| self.controller_args.clone());
        let mut controller = Controller::new(idx, cmdline, port)
            .with_address(config.address.unwrap_or_else(|| DEFAULT_ADDRESS.to_string()));
        controller.snapshot_port = config.snapshot_port;
        Ok(controller)
    }
}

/// Errors in the configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Cannot read a configuration file.
    #[error("Cannot read {path:?}: {source}")]
    Io {
        /// The file
        path: PathBuf,
        /// The error
        #[source]
        source: std::io::Error,
    },
    /// The configuration file is not valid.
    #[error("Invalid experiment configuration: {0}")]
    Toml(#[from] toml::de::Error),
    /// The delay is negative.
    #[error("Invalid delay: {0}")]
    InvalidDelay(f64),
    /// The check interval is zero.
    #[error("The check interval must be positive (or use --force-check)")]
    InvalidCheckInterval,
    /// A controller should be booted but has no command line.
    #[error("Controller {0} should be booted, but has no command line")]
    MissingCommand(ControllerId),
    /// No port left for a controller.
    #[error("No port left for controller {0}")]
    PortOverflow(ControllerId),
}
