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

//! The simulated network.
//!
//! A [`Topology`] is the ground truth of the simulation: the [`Panel`] of controllers, the
//! switches (each owning its control channel), the inter-switch links, the hosts, and their
//! access links. It is mutated only by applying [`NetworkEvent`]s, and it computes the view
//! each controller is expected to have.

use std::collections::{BTreeMap, BTreeSet};

use itertools::Itertools;
use log::debug;
use petgraph::unionfind::UnionFind;
use serde::{Deserialize, Serialize};

use crate::{
    controller::Controller,
    deferred_io::{ChannelHost, DeferredIoWorker},
    scheduler::Timers,
    switch::{ethernet_frame, PortPeer, SoftwareSwitch, SwitchTier},
    trace::NetworkEvent,
    types::{
        AccessLinkId, ChannelId, ControllerId, HostId, LinkId, PortNo, SwitchId, TaskError,
        TopologyError,
    },
};

/// Aggregate over all controllers of the topology, and the control channels bound to each of
/// them.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Panel {
    controllers: Vec<Controller>,
    connections: BTreeMap<ControllerId, BTreeSet<ChannelId>>,
}

impl Panel {
    /// Create a panel over the given controllers.
    pub fn new(controllers: Vec<Controller>) -> Self {
        let connections = controllers
            .iter()
            .map(|c| (c.id, BTreeSet::new()))
            .collect();
        Self {
            controllers,
            connections,
        }
    }

    /// All controllers
    pub fn controllers(&self) -> &[Controller] {
        &self.controllers
    }

    /// Get a controller
    pub fn controller(&self, id: ControllerId) -> Option<&Controller> {
        self.controllers.iter().find(|c| c.id == id)
    }

    /// Channels bound to the controller.
    pub fn connections(&self, id: ControllerId) -> impl Iterator<Item = ChannelId> + '_ {
        self.connections.get(&id).into_iter().flatten().copied()
    }

    /// Bind a channel to a controller.
    fn bind(&mut self, controller: ControllerId, channel: ChannelId) -> Result<(), TopologyError> {
        self.connections
            .get_mut(&controller)
            .ok_or(TopologyError::UnknownController(controller))?
            .insert(channel);
        Ok(())
    }
}

/// Link between two switches.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Link {
    /// Id of the link
    pub id: LinkId,
    /// First endpoint
    pub a: (SwitchId, PortNo),
    /// Second endpoint
    pub b: (SwitchId, PortNo),
    /// Whether the link is up
    pub up: bool,
}

impl Link {
    /// Returns `true` if the link connects `x` and `y` (in any direction).
    pub fn connects(&self, x: SwitchId, y: SwitchId) -> bool {
        (self.a.0 == x && self.b.0 == y) || (self.a.0 == y && self.b.0 == x)
    }

    /// Returns `true` if `x` is one of the endpoints.
    pub fn touches(&self, x: SwitchId) -> bool {
        self.a.0 == x || self.b.0 == x
    }

    /// The link as it is seen by a controller.
    pub fn view(&self) -> LinkView {
        LinkView::new(self.a.0, self.b.0)
    }
}

/// A host
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Host {
    /// Id of the host
    pub id: HostId,
    /// Name of the host
    pub name: String,
    /// The access link attaching the host to its switch
    pub access_link: AccessLinkId,
}

/// Link between a switch and a host.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AccessLink {
    /// Id of the access link
    pub id: AccessLinkId,
    /// The host
    pub host: HostId,
    /// The switch
    pub switch: SwitchId,
    /// Port on the switch
    pub port: PortNo,
    /// Whether the access link is up
    pub up: bool,
}

/// Undirected link as reported by a controller. The smaller switch id is always `a`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct LinkView {
    /// Smaller endpoint
    pub a: SwitchId,
    /// Larger endpoint
    pub b: SwitchId,
}

impl LinkView {
    /// Create a normalized link.
    pub fn new(x: SwitchId, y: SwitchId) -> Self {
        if x <= y {
            Self { a: x, b: y }
        } else {
            Self { a: y, b: x }
        }
    }
}

impl std::fmt::Display for LinkView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -- {}", self.a, self.b)
    }
}

/// The network as known by a controller, or as it should be known by a controller.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ControllerView {
    /// Switches connected to the controller
    pub switches: BTreeSet<SwitchId>,
    /// Links between those switches. `None` if the controller does not expose links.
    pub links: Option<BTreeSet<LinkView>>,
}

impl ControllerView {
    /// Compare `self` (the expected view) with the observed view. Links are only compared if
    /// the observed view contains links.
    pub fn diff(&self, observed: &ControllerView) -> ViewDiff {
        let mut diff = ViewDiff {
            missing_switches: self
                .switches
                .difference(&observed.switches)
                .copied()
                .collect(),
            unexpected_switches: observed
                .switches
                .difference(&self.switches)
                .copied()
                .collect(),
            ..Default::default()
        };
        if let Some(observed_links) = observed.links.as_ref() {
            let expected_links = self.links.clone().unwrap_or_default();
            diff.missing_links = expected_links
                .difference(observed_links)
                .copied()
                .collect();
            diff.unexpected_links = observed_links
                .difference(&expected_links)
                .copied()
                .collect();
        }
        diff
    }
}

/// Difference between an expected and an observed [`ControllerView`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ViewDiff {
    /// Switches that should be known but are not
    pub missing_switches: BTreeSet<SwitchId>,
    /// Switches that are known but should not be
    pub unexpected_switches: BTreeSet<SwitchId>,
    /// Links that should be known but are not
    pub missing_links: BTreeSet<LinkView>,
    /// Links that are known but should not be
    pub unexpected_links: BTreeSet<LinkView>,
}

impl ViewDiff {
    /// Returns `true` if both views are equal.
    pub fn is_empty(&self) -> bool {
        self.missing_switches.is_empty()
            && self.unexpected_switches.is_empty()
            && self.missing_links.is_empty()
            && self.unexpected_links.is_empty()
    }
}

impl std::fmt::Display for ViewDiff {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.is_empty() {
            return write!(f, "no difference");
        }
        let mut parts = Vec::new();
        if !self.missing_switches.is_empty() {
            parts.push(format!(
                "missing switches {{{}}}",
                self.missing_switches.iter().join(", ")
            ));
        }
        if !self.unexpected_switches.is_empty() {
            parts.push(format!(
                "unexpected switches {{{}}}",
                self.unexpected_switches.iter().join(", ")
            ));
        }
        if !self.missing_links.is_empty() {
            parts.push(format!(
                "missing links {{{}}}",
                self.missing_links.iter().join(", ")
            ));
        }
        if !self.unexpected_links.is_empty() {
            parts.push(format!(
                "unexpected links {{{}}}",
                self.unexpected_links.iter().join(", ")
            ));
        }
        write!(f, "{}", parts.join("; "))
    }
}

/// The simulated network. See the [module documentation](self).
#[derive(Debug)]
pub struct Topology {
    panel: Panel,
    switches: Vec<SoftwareSwitch>,
    links: Vec<Link>,
    hosts: Vec<Host>,
    access_links: Vec<AccessLink>,
}

impl Topology {
    /// Create an empty topology over the given controllers.
    pub fn new(controllers: Vec<Controller>) -> Self {
        Self {
            panel: Panel::new(controllers),
            switches: Vec::new(),
            links: Vec::new(),
            hosts: Vec::new(),
            access_links: Vec::new(),
        }
    }

    /// Split the topology into the panel, the switches, the links, the hosts, and the access
    /// links.
    pub fn into_parts(
        self,
    ) -> (
        Panel,
        Vec<SoftwareSwitch>,
        Vec<Link>,
        Vec<Host>,
        Vec<AccessLink>,
    ) {
        (
            self.panel,
            self.switches,
            self.links,
            self.hosts,
            self.access_links,
        )
    }

    /// Add a switch whose control channel `worker` is bound to `controller`. Switch ids are
    /// assigned sequentially, starting at 1.
    pub fn add_switch(
        &mut self,
        tier: SwitchTier,
        mut worker: DeferredIoWorker,
        controller: ControllerId,
    ) -> Result<SwitchId, TopologyError> {
        let channel = ChannelId(self.switches.len());
        self.panel.bind(controller, channel)?;
        worker.attach(channel, controller);
        let id = SwitchId(self.switches.len() as u64 + 1);
        self.switches
            .push(SoftwareSwitch::new(id, tier, worker, controller));
        Ok(id)
    }

    /// Connect two switches with a new link.
    pub fn add_link(&mut self, x: SwitchId, y: SwitchId) -> Result<LinkId, TopologyError> {
        self.switch(x)?;
        self.switch(y)?;
        let port_x = self
            .switch_mut(x)?
            .add_port(PortPeer::Switch(y, PortNo(0)));
        let port_y = self
            .switch_mut(y)?
            .add_port(PortPeer::Switch(x, port_x));
        self.switch_mut(x)?
            .set_port_peer(port_x, PortPeer::Switch(y, port_y));
        let id = LinkId(self.links.len());
        self.links.push(Link {
            id,
            a: (x, port_x),
            b: (y, port_y),
            up: true,
        });
        Ok(id)
    }

    /// Attach a new host to a switch.
    pub fn add_host(&mut self, switch: SwitchId) -> Result<HostId, TopologyError> {
        let host = HostId(self.hosts.len() as u32 + 1);
        let port = self.switch_mut(switch)?.add_port(PortPeer::Host(host));
        let access_link = AccessLinkId(self.access_links.len());
        self.access_links.push(AccessLink {
            id: access_link,
            host,
            switch,
            port,
            up: true,
        });
        self.hosts.push(Host {
            id: host,
            name: host.to_string(),
            access_link,
        });
        Ok(host)
    }

    /// The panel of controllers
    pub fn panel(&self) -> &Panel {
        &self.panel
    }

    /// All switches, ordered by id
    pub fn switches(&self) -> &[SoftwareSwitch] {
        &self.switches
    }

    /// All inter-switch links
    pub fn links(&self) -> &[Link] {
        &self.links
    }

    /// All hosts, ordered by id
    pub fn hosts(&self) -> &[Host] {
        &self.hosts
    }

    /// All access links
    pub fn access_links(&self) -> &[AccessLink] {
        &self.access_links
    }

    /// Get a switch
    pub fn switch(&self, id: SwitchId) -> Result<&SoftwareSwitch, TopologyError> {
        id.0.checked_sub(1)
            .and_then(|i| self.switches.get(i as usize))
            .ok_or(TopologyError::UnknownSwitch(id))
    }

    fn switch_mut(&mut self, id: SwitchId) -> Result<&mut SoftwareSwitch, TopologyError> {
        id.0.checked_sub(1)
            .and_then(|i| self.switches.get_mut(i as usize))
            .ok_or(TopologyError::UnknownSwitch(id))
    }

    /// Get a host
    pub fn host(&self, id: HostId) -> Result<&Host, TopologyError> {
        id.0.checked_sub(1)
            .and_then(|i| self.hosts.get(i as usize))
            .ok_or(TopologyError::UnknownHost(id))
    }

    /// Get the access link of a host
    pub fn access_link_of(&self, host: HostId) -> Result<&AccessLink, TopologyError> {
        let id = self.host(host)?.access_link;
        self.access_links
            .get(id.0)
            .ok_or(TopologyError::UnknownHost(host))
    }

    /// Find the link between two switches.
    pub fn link_between(&self, x: SwitchId, y: SwitchId) -> Result<&Link, TopologyError> {
        self.links
            .iter()
            .find(|l| l.connects(x, y))
            .ok_or(TopologyError::UnknownLink(x, y))
    }

    /// Switch that owns the control channel `id`.
    pub fn channel_owner(&self, id: ChannelId) -> Option<SwitchId> {
        self.switches.get(id.0).map(|s| s.id())
    }

    /// Start the OpenFlow handshake on every switch that is alive.
    pub fn connect_all(&mut self, timers: &mut Timers<Self>) {
        for switch in self.switches.iter_mut() {
            switch.start_handshake(timers);
        }
    }

    /// Returns `true` if the switch is control-connected to its controller.
    pub fn is_control_connected(&self, id: SwitchId) -> bool {
        self.switch(id)
            .map(|s| s.is_control_connected())
            .unwrap_or(false)
    }

    /// The view `controller` should have of the network: all live switches bound to it whose
    /// control connection is established, and all up links between them.
    pub fn expected_view(&self, controller: ControllerId) -> ControllerView {
        let switches: BTreeSet<SwitchId> = self
            .switches
            .iter()
            .filter(|s| s.controller() == controller && s.is_control_connected())
            .map(|s| s.id())
            .collect();
        let links = self
            .links
            .iter()
            .filter(|l| l.up && switches.contains(&l.a.0) && switches.contains(&l.b.0))
            .map(|l| l.view())
            .collect();
        ControllerView {
            switches,
            links: Some(links),
        }
    }

    /// Connected components of live switches over links that are up, each sorted, ordered by
    /// their smallest switch.
    pub fn partitions(&self) -> Vec<BTreeSet<SwitchId>> {
        let mut uf = UnionFind::<usize>::new(self.switches.len());
        for link in self.links.iter().filter(|l| l.up) {
            let (a, b) = (link.a.0, link.b.0);
            let alive = |s: SwitchId| self.switch(s).map(|s| !s.is_failed()).unwrap_or(false);
            if alive(a) && alive(b) {
                uf.union(a.0 as usize - 1, b.0 as usize - 1);
            }
        }
        let mut groups: BTreeMap<usize, BTreeSet<SwitchId>> = BTreeMap::new();
        for (idx, switch) in self.switches.iter().enumerate() {
            if !switch.is_failed() {
                groups
                    .entry(uf.find(idx))
                    .or_default()
                    .insert(switch.id());
            }
        }
        groups
            .into_values()
            .sorted_by_key(|g| g.iter().next().copied())
            .collect()
    }

    /// Check that `event` only references existing switches, hosts, and links.
    pub fn check_event(&self, event: &NetworkEvent) -> Result<(), TopologyError> {
        match event {
            NetworkEvent::LinkFailure { a, b } | NetworkEvent::LinkRecovery { a, b } => {
                self.link_between(*a, *b).map(|_| ())
            }
            NetworkEvent::SwitchFailure { switch }
            | NetworkEvent::SwitchRecovery { switch }
            | NetworkEvent::ControlChannelFailure { switch }
            | NetworkEvent::ControlChannelRecovery { switch }
            | NetworkEvent::ControlMessageDrop { switch }
            | NetworkEvent::ControlMessageDelay { switch, .. } => self.switch(*switch).map(|_| ()),
            NetworkEvent::AccessLinkFailure { host } | NetworkEvent::AccessLinkRecovery { host } => {
                self.host(*host).map(|_| ())
            }
            NetworkEvent::Packet { src, dst } => {
                self.host(*src)?;
                self.host(*dst).map(|_| ())
            }
        }
    }

    /// Apply an event to the network. Returns `false` if the event had no effect (for instance
    /// because the link was already down).
    pub fn apply_event(
        &mut self,
        event: &NetworkEvent,
        timers: &mut Timers<Self>,
    ) -> Result<bool, TopologyError> {
        self.check_event(event)?;
        let changed = match event {
            NetworkEvent::LinkFailure { a, b } => self.set_link_state(*a, *b, false, timers)?,
            NetworkEvent::LinkRecovery { a, b } => self.set_link_state(*a, *b, true, timers)?,
            NetworkEvent::SwitchFailure { switch } => {
                self.set_switch_state(*switch, false, timers)?
            }
            NetworkEvent::SwitchRecovery { switch } => {
                self.set_switch_state(*switch, true, timers)?
            }
            NetworkEvent::AccessLinkFailure { host } => {
                self.set_access_link_state(*host, false, timers)?
            }
            NetworkEvent::AccessLinkRecovery { host } => {
                self.set_access_link_state(*host, true, timers)?
            }
            NetworkEvent::ControlChannelFailure { switch } => {
                let s = self.switch_mut(*switch)?;
                if s.control().is_closed() {
                    false
                } else {
                    s.control_mut().close();
                    s.reset_control();
                    true
                }
            }
            NetworkEvent::ControlChannelRecovery { switch } => {
                let s = self.switch_mut(*switch)?;
                if s.control().is_closed() && !s.is_failed() {
                    s.control_mut().reopen();
                    s.start_handshake(timers);
                    true
                } else {
                    false
                }
            }
            NetworkEvent::ControlMessageDrop { switch } => {
                self.switch_mut(*switch)?.drop_pending_control() > 0
            }
            NetworkEvent::ControlMessageDelay { switch, ticks } => {
                let until = timers.now().saturating_add(*ticks);
                let s = self.switch_mut(*switch)?;
                if s.control().is_closed() || *ticks == 0 {
                    false
                } else {
                    s.control_mut().hold(until);
                    true
                }
            }
            NetworkEvent::Packet { src, dst } => {
                let access = self.access_link_of(*src)?.clone();
                if !access.up {
                    false
                } else {
                    let frame = ethernet_frame(*src, *dst);
                    self.switch_mut(access.switch)?
                        .packet_in(access.port, frame, timers)
                }
            }
        };
        if !changed {
            debug!("{event} has no effect");
        }
        Ok(changed)
    }

    fn set_link_state(
        &mut self,
        a: SwitchId,
        b: SwitchId,
        up: bool,
        timers: &mut Timers<Self>,
    ) -> Result<bool, TopologyError> {
        let link = self
            .links
            .iter_mut()
            .find(|l| l.connects(a, b))
            .ok_or(TopologyError::UnknownLink(a, b))?;
        if link.up == up {
            return Ok(false);
        }
        link.up = up;
        let id = link.id;
        self.refresh_link_ports(id, timers)?;
        Ok(true)
    }

    fn set_switch_state(
        &mut self,
        id: SwitchId,
        up: bool,
        timers: &mut Timers<Self>,
    ) -> Result<bool, TopologyError> {
        let switch = self.switch_mut(id)?;
        if switch.is_failed() != up {
            return Ok(false);
        }
        if up {
            switch.set_failed(false);
            switch.control_mut().reopen();
        } else {
            switch.control_mut().close();
            switch.set_failed(true);
        }
        let touching: Vec<LinkId> = self
            .links
            .iter()
            .filter(|l| l.touches(id))
            .map(|l| l.id)
            .collect();
        for link in touching {
            self.refresh_link_ports(link, timers)?;
        }
        if up {
            self.switch_mut(id)?.start_handshake(timers);
        }
        Ok(true)
    }

    /// A port of a link is up if the link is up and both switches are alive.
    fn refresh_link_ports(
        &mut self,
        id: LinkId,
        timers: &mut Timers<Self>,
    ) -> Result<(), TopologyError> {
        let link = self
            .links
            .get(id.0)
            .cloned()
            .ok_or(TopologyError::UnknownLink(SwitchId(0), SwitchId(0)))?;
        let alive_a = !self.switch(link.a.0)?.is_failed();
        let alive_b = !self.switch(link.b.0)?.is_failed();
        let up = link.up && alive_a && alive_b;
        self.switch_mut(link.a.0)?
            .set_port_state(link.a.1, up, timers);
        self.switch_mut(link.b.0)?
            .set_port_state(link.b.1, up, timers);
        Ok(())
    }

    fn set_access_link_state(
        &mut self,
        host: HostId,
        up: bool,
        timers: &mut Timers<Self>,
    ) -> Result<bool, TopologyError> {
        let id = self.host(host)?.access_link;
        let access = self
            .access_links
            .get_mut(id.0)
            .ok_or(TopologyError::UnknownHost(host))?;
        if access.up == up {
            return Ok(false);
        }
        access.up = up;
        let (switch, port) = (access.switch, access.port);
        self.switch_mut(switch)?.set_port_state(port, up, timers);
        Ok(true)
    }
}

impl ChannelHost for Topology {
    fn channel_mut(&mut self, id: ChannelId) -> Option<&mut DeferredIoWorker> {
        self.switches.get_mut(id.0).map(|s| s.control_mut())
    }

    fn channel_ids(&self) -> Vec<ChannelId> {
        (0..self.switches.len()).map(ChannelId).collect()
    }

    fn on_readable(&mut self, id: ChannelId, timers: &mut Timers<Self>) -> Result<(), TaskError> {
        let switch = self
            .switches
            .get_mut(id.0)
            .ok_or(TaskError::UnknownChannel(id))?;
        let data = switch.control_mut().take_received();
        switch
            .handle_control_input(&data, timers)
            .map_err(|e| TaskError::Protocol(id, e))
    }

    fn on_disconnected(
        &mut self,
        id: ChannelId,
        timers: &mut Timers<Self>,
    ) -> Result<(), TaskError> {
        let switch = self
            .switches
            .get_mut(id.0)
            .ok_or(TaskError::UnknownChannel(id))?;
        debug!(
            "[{}] {} closed the control connection",
            switch.name(),
            switch.controller()
        );
        // the switch reconnects and restarts the handshake.
        switch.start_handshake(timers);
        Ok(())
    }
}
