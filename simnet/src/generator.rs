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

//! Topology generation: flat meshes and fat-trees.
//!
//! The generator never touches the scheduler. Every control channel is opened through the
//! [`Connector`], and turned into a [`DeferredIoWorker`] by the `create_worker` function
//! supplied by the caller.

use log::{debug, info};
use serde::{Deserialize, Serialize};

use crate::{
    channel::{Connector, RawChannel},
    controller::Controller,
    deferred_io::DeferredIoWorker,
    switch::SwitchTier,
    topology::Topology,
    types::{ControllerId, SwitchId, TopologyError},
};

/// How switches are assigned to controllers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BindingPolicy {
    /// The `i`-th switch (in creation order) is bound to controller `i mod #controllers`.
    RoundRobin,
    /// All switches are bound to the same controller.
    Fixed(ControllerId),
}

impl Default for BindingPolicy {
    fn default() -> Self {
        Self::RoundRobin
    }
}

impl BindingPolicy {
    /// Controller of the `idx`-th switch.
    fn controller_for(&self, controllers: &[Controller], idx: usize) -> ControllerId {
        match self {
            Self::RoundRobin => controllers[idx % controllers.len()].id,
            Self::Fixed(c) => *c,
        }
    }
}

/// Shape of the generated topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "shape", rename_all = "snake_case")]
pub enum TopologyShape {
    /// All switches are connected to each other.
    Mesh {
        /// Number of switches
        num_switches: usize,
    },
    /// Fat-tree with core, aggregation, and edge switches.
    FatTree {
        /// Number of pods (must be even)
        num_pods: usize,
    },
}

impl Default for TopologyShape {
    fn default() -> Self {
        Self::Mesh { num_switches: 2 }
    }
}

impl std::fmt::Display for TopologyShape {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Mesh { num_switches } => write!(f, "mesh of {num_switches} switches"),
            Self::FatTree { num_pods } => write!(f, "fat-tree with {num_pods} pods"),
        }
    }
}

/// Number of elements in a fat-tree with `k` pods.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FatTreeSizes {
    /// Core switches, `(k/2)^2`
    pub core: usize,
    /// Aggregation switches, `k * k/2`
    pub aggregation: usize,
    /// Edge switches, `k * k/2`
    pub edge: usize,
    /// Hosts (and access links), `k^3 / 4`
    pub hosts: usize,
    /// Inter-switch links, `k^3 / 2`
    pub links: usize,
}

impl FatTreeSizes {
    /// Compute the sizes for `k` pods.
    pub fn for_pods(k: usize) -> Self {
        let half = k / 2;
        Self {
            core: half * half,
            aggregation: k * half,
            edge: k * half,
            hosts: k * half * half,
            links: 2 * k * half * half,
        }
    }

    /// Total number of switches
    pub fn switches(&self) -> usize {
        self.core + self.aggregation + self.edge
    }
}

/// Builds [`Topology`]s. See the [module documentation](self).
#[derive(Debug)]
pub struct TopologyGenerator {
    binding: BindingPolicy,
    hosts_per_switch: usize,
    connector: Box<dyn Connector>,
}

impl TopologyGenerator {
    /// Create a generator that opens control channels with `connector`, binds switches
    /// round-robin, and attaches one host to each mesh switch.
    pub fn new(connector: impl Connector + 'static) -> Self {
        Self {
            binding: BindingPolicy::default(),
            hosts_per_switch: 1,
            connector: Box::new(connector),
        }
    }

    /// Change the binding policy.
    pub fn with_binding(mut self, binding: BindingPolicy) -> Self {
        self.binding = binding;
        self
    }

    /// Change the number of hosts attached to each switch of a mesh. Fat-trees always attach
    /// `k/2` hosts to each edge switch.
    pub fn with_hosts_per_switch(mut self, hosts: usize) -> Self {
        self.hosts_per_switch = hosts;
        self
    }

    /// The binding policy
    pub fn binding(&self) -> BindingPolicy {
        self.binding
    }

    /// Check the parameters without opening any channel.
    pub fn validate(
        &self,
        controllers: &[Controller],
        shape: TopologyShape,
    ) -> Result<(), TopologyError> {
        match shape {
            TopologyShape::Mesh { num_switches: 0 } => {
                return Err(TopologyError::InvalidSwitchCount(0))
            }
            TopologyShape::FatTree { num_pods } if num_pods == 0 || num_pods % 2 == 1 => {
                return Err(TopologyError::InvalidPodCount(num_pods))
            }
            TopologyShape::Mesh { .. } if self.hosts_per_switch == 0 => {
                return Err(TopologyError::InvalidHostsPerSwitch(0))
            }
            _ => {}
        }
        if controllers.is_empty() {
            return Err(TopologyError::NoControllers);
        }
        if let BindingPolicy::Fixed(c) = self.binding {
            if !controllers.iter().any(|x| x.id == c) {
                return Err(TopologyError::UnknownController(c));
            }
        }
        Ok(())
    }

    /// Generate a topology of the given shape.
    pub fn generate<F>(
        &mut self,
        controllers: &[Controller],
        shape: TopologyShape,
        create_worker: F,
    ) -> Result<Topology, TopologyError>
    where
        F: FnMut(Box<dyn RawChannel>) -> DeferredIoWorker,
    {
        match shape {
            TopologyShape::Mesh { num_switches } => {
                self.populate(controllers, create_worker, num_switches)
            }
            TopologyShape::FatTree { num_pods } => {
                self.populate_fat_tree(controllers, create_worker, num_pods)
            }
        }
    }

    /// Generate a full mesh of `num_switches` switches.
    pub fn populate<F>(
        &mut self,
        controllers: &[Controller],
        mut create_worker: F,
        num_switches: usize,
    ) -> Result<Topology, TopologyError>
    where
        F: FnMut(Box<dyn RawChannel>) -> DeferredIoWorker,
    {
        self.validate(controllers, TopologyShape::Mesh { num_switches })?;
        let mut topo = Topology::new(controllers.to_vec());

        let switches = (0..num_switches)
            .map(|i| self.new_switch(&mut topo, controllers, i, SwitchTier::Mesh, &mut create_worker))
            .collect::<Result<Vec<_>, _>>()?;

        for (i, a) in switches.iter().enumerate() {
            for b in &switches[i + 1..] {
                topo.add_link(*a, *b)?;
            }
        }
        for s in &switches {
            for _ in 0..self.hosts_per_switch {
                topo.add_host(*s)?;
            }
        }

        info!(
            "Generated a mesh: {} switches, {} links, {} hosts",
            topo.switches().len(),
            topo.links().len(),
            topo.hosts().len()
        );
        Ok(topo)
    }

    /// Generate a fat-tree with `num_pods` pods. Switches are created in the order core,
    /// then for each pod its aggregation and its edge switches.
    pub fn populate_fat_tree<F>(
        &mut self,
        controllers: &[Controller],
        mut create_worker: F,
        num_pods: usize,
    ) -> Result<Topology, TopologyError>
    where
        F: FnMut(Box<dyn RawChannel>) -> DeferredIoWorker,
    {
        self.validate(controllers, TopologyShape::FatTree { num_pods })?;
        let k = num_pods;
        let half = k / 2;
        let mut topo = Topology::new(controllers.to_vec());
        let mut idx = 0;

        let mut core = Vec::with_capacity(half * half);
        for _ in 0..half * half {
            core.push(self.new_switch(&mut topo, controllers, idx, SwitchTier::Core, &mut create_worker)?);
            idx += 1;
        }

        for pod in 0..k {
            let mut aggregation: Vec<SwitchId> = Vec::with_capacity(half);
            for _ in 0..half {
                aggregation.push(self.new_switch(
                    &mut topo,
                    controllers,
                    idx,
                    SwitchTier::Aggregation,
                    &mut create_worker,
                )?);
                idx += 1;
            }
            let mut edge: Vec<SwitchId> = Vec::with_capacity(half);
            for _ in 0..half {
                edge.push(self.new_switch(
                    &mut topo,
                    controllers,
                    idx,
                    SwitchTier::Edge,
                    &mut create_worker,
                )?);
                idx += 1;
            }

            for e in &edge {
                for a in &aggregation {
                    topo.add_link(*e, *a)?;
                }
                for _ in 0..half {
                    topo.add_host(*e)?;
                }
            }
            // the j-th aggregation switch of every pod connects to the j-th group of cores.
            for (j, a) in aggregation.iter().enumerate() {
                for c in &core[j * half..(j + 1) * half] {
                    topo.add_link(*a, *c)?;
                }
            }
            debug!("Generated pod {pod}");
        }

        info!(
            "Generated a fat-tree with {k} pods: {} switches, {} links, {} hosts",
            topo.switches().len(),
            topo.links().len(),
            topo.hosts().len()
        );
        Ok(topo)
    }

    fn new_switch<F>(
        &mut self,
        topo: &mut Topology,
        controllers: &[Controller],
        idx: usize,
        tier: SwitchTier,
        create_worker: &mut F,
    ) -> Result<SwitchId, TopologyError>
    where
        F: FnMut(Box<dyn RawChannel>) -> DeferredIoWorker,
    {
        let controller_id = self.binding.controller_for(controllers, idx);
        let controller = controllers
            .iter()
            .find(|c| c.id == controller_id)
            .ok_or(TopologyError::UnknownController(controller_id))?;
        let channel = self.connector.connect(controller)?;
        topo.add_switch(tier, create_worker(channel), controller_id)
    }
}
