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

//! Simulated OpenFlow switch.
//!
//! A [`SoftwareSwitch`] owns its data-plane ports and its control channel, a
//! [`DeferredIoWorker`] towards exactly one controller. It answers the handshake and keep-alive
//! messages of the controller, and reports port changes and packets to it.

use std::collections::BTreeMap;

use log::{debug, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    deferred_io::{ChannelHost, DeferredIoWorker},
    openflow::{Features, FrameDecoder, OfError, OfMessage, PhyPort, PortReason, NO_BUFFER},
    scheduler::Timers,
    types::{ControllerId, HostId, PortNo, SwitchId},
};

/// Number of bytes of a packet that is sent to the controller.
const MISS_SEND_LEN: u16 = 128;

/// Role of a switch in the topology.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum SwitchTier {
    /// Switch of a flat mesh
    Mesh,
    /// Core switch of a fat-tree
    Core,
    /// Aggregation switch of a fat-tree
    Aggregation,
    /// Edge switch of a fat-tree, to which hosts are attached
    Edge,
}

/// What is attached to a data-plane port.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum PortPeer {
    /// Another switch, and the port on that switch.
    Switch(SwitchId, PortNo),
    /// A host.
    Host(HostId),
}

/// A data-plane port
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Port {
    /// Port number
    pub no: PortNo,
    /// Remote end of the port
    pub peer: PortPeer,
    /// Whether the port is up
    pub up: bool,
}

/// Progress of the OpenFlow handshake on the control channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Handshake {
    /// Nothing sent yet, or the connection was reset.
    Idle,
    /// `HELLO` was sent.
    HelloSent,
    /// `FEATURES_REPLY` was sent. The controller knows the switch.
    FeaturesReplied,
}

/// A simulated switch.
#[derive(Debug)]
pub struct SoftwareSwitch {
    id: SwitchId,
    name: String,
    tier: SwitchTier,
    ports: BTreeMap<PortNo, Port>,
    control: DeferredIoWorker,
    controller: ControllerId,
    failed: bool,
    handshake: Handshake,
    features_seq: Option<u64>,
    decoder: FrameDecoder,
    next_xid: u32,
}

impl SoftwareSwitch {
    /// Create a new switch without ports. `control` must already be attached to `controller`.
    pub(crate) fn new(
        id: SwitchId,
        tier: SwitchTier,
        control: DeferredIoWorker,
        controller: ControllerId,
    ) -> Self {
        Self {
            id,
            name: id.to_string(),
            tier,
            ports: BTreeMap::new(),
            control,
            controller,
            failed: false,
            handshake: Handshake::Idle,
            features_seq: None,
            decoder: FrameDecoder::new(),
            next_xid: 1,
        }
    }

    /// Datapath id of the switch
    pub fn id(&self) -> SwitchId {
        self.id
    }

    /// Name of the switch
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Role of the switch
    pub fn tier(&self) -> SwitchTier {
        self.tier
    }

    /// Controller to which the control channel is bound.
    pub fn controller(&self) -> ControllerId {
        self.controller
    }

    /// The control channel
    pub fn control(&self) -> &DeferredIoWorker {
        &self.control
    }

    /// Mutable reference to the control channel
    pub fn control_mut(&mut self) -> &mut DeferredIoWorker {
        &mut self.control
    }

    /// Returns `true` if the switch has crashed.
    pub fn is_failed(&self) -> bool {
        self.failed
    }

    /// State of the OpenFlow handshake
    pub fn handshake(&self) -> Handshake {
        self.handshake
    }

    /// Returns `true` if the switch is alive, its control channel is open, and its
    /// `FEATURES_REPLY` was written to the controller. Later replies still waiting in the send
    /// queue do not matter.
    pub fn is_control_connected(&self) -> bool {
        !self.failed
            && !self.control.is_closed()
            && self.handshake == Handshake::FeaturesReplied
            && self
                .features_seq
                .map_or(false, |seq| self.control.is_written_through(seq))
    }

    /// Iterate over all ports, in ascending order.
    pub fn ports(&self) -> impl Iterator<Item = &Port> {
        self.ports.values()
    }

    /// Get a port
    pub fn port(&self, no: PortNo) -> Option<&Port> {
        self.ports.get(&no)
    }

    /// Find the port attached to `peer`.
    pub fn port_to(&self, peer: PortPeer) -> Option<PortNo> {
        self.ports.values().find(|p| p.peer == peer).map(|p| p.no)
    }

    /// Add a new port with the next free port number.
    pub(crate) fn add_port(&mut self, peer: PortPeer) -> PortNo {
        let no = PortNo(self.ports.keys().next_back().map(|p| p.0 + 1).unwrap_or(1));
        self.ports.insert(no, Port { no, peer, up: true });
        no
    }

    /// Connect the remote end of the port `no` to another switch.
    pub(crate) fn set_port_peer(&mut self, no: PortNo, peer: PortPeer) {
        if let Some(port) = self.ports.get_mut(&no) {
            port.peer = peer;
        }
    }

    /// Mark the switch as crashed or alive. A crashed switch forgets its control connection.
    pub(crate) fn set_failed(&mut self, failed: bool) {
        self.failed = failed;
        if failed {
            self.reset_control();
        }
    }

    /// Forget the state of the control connection.
    pub(crate) fn reset_control(&mut self) {
        self.handshake = Handshake::Idle;
        self.features_seq = None;
        self.decoder.reset();
    }

    /// Drop the queued control messages. If the `FEATURES_REPLY` was among them, the controller
    /// never learns about the switch and the handshake falls back to `HelloSent`. Returns the
    /// number of dropped messages.
    pub(crate) fn drop_pending_control(&mut self) -> usize {
        let dropped = self.control.drop_pending_send();
        if let Some(seq) = self.features_seq {
            if !self.control.is_pending(seq) && !self.control.is_written_through(seq) {
                debug!("[{}] FEATURES_REPLY to {} was dropped", self.name, self.controller);
                self.handshake = Handshake::HelloSent;
                self.features_seq = None;
            }
        }
        dropped
    }

    /// Features as reported to the controller.
    pub fn features(&self) -> Features {
        Features {
            datapath_id: self.id.0,
            n_buffers: 0,
            n_tables: 1,
            ports: self.ports.values().map(|p| self.phy_port(p)).collect(),
        }
    }

    fn phy_port(&self, port: &Port) -> PhyPort {
        PhyPort {
            port_no: port.no,
            hw_addr: PhyPort::hw_addr_for(self.id.0, port.no),
            name: format!("{}-eth{}", self.name, port.no),
            up: port.up,
        }
    }

    fn send<W: ChannelHost>(
        &mut self,
        msg: OfMessage,
        xid: Option<u32>,
        timers: &mut Timers<W>,
    ) -> Option<u64> {
        let xid = xid.unwrap_or_else(|| {
            let xid = self.next_xid;
            self.next_xid = self.next_xid.wrapping_add(1);
            xid
        });
        trace!("[{}] -> {}: {:?} (xid {xid})", self.name, self.controller, msg);
        self.control.send(msg.encode(xid), timers)
    }

    /// Start (or restart) the OpenFlow handshake by sending `HELLO`.
    pub fn start_handshake<W: ChannelHost>(&mut self, timers: &mut Timers<W>) {
        if self.failed || self.control.is_closed() {
            return;
        }
        self.reset_control();
        self.handshake = Handshake::HelloSent;
        self.send(OfMessage::Hello, None, timers);
    }

    /// Process data received from the controller and send the replies. Malformed frames are
    /// skipped; the first decoding error is returned after all frames were processed.
    pub fn handle_control_input<W: ChannelHost>(
        &mut self,
        data: &[u8],
        timers: &mut Timers<W>,
    ) -> Result<(), OfError> {
        if self.failed {
            return Ok(());
        }
        self.decoder.push(data);
        let mut first_error = None;
        loop {
            let (xid, msg) = match self.decoder.next_frame() {
                Ok(Some(frame)) => frame,
                Ok(None) => break,
                Err(e) => {
                    warn!("[{}] cannot decode message from {}: {e}", self.name, self.controller);
                    if first_error.is_none() {
                        first_error = Some(e);
                    }
                    continue;
                }
            };
            trace!("[{}] <- {}: {:?} (xid {xid})", self.name, self.controller, msg);
            match msg {
                OfMessage::Hello => {
                    if self.handshake == Handshake::Idle {
                        self.handshake = Handshake::HelloSent;
                        self.send(OfMessage::Hello, None, timers);
                    }
                }
                OfMessage::EchoRequest(payload) => {
                    self.send(OfMessage::EchoReply(payload), Some(xid), timers);
                }
                OfMessage::FeaturesRequest => {
                    let features = self.features();
                    let seq = self.send(OfMessage::FeaturesReply(features), Some(xid), timers);
                    if self.handshake != Handshake::FeaturesReplied {
                        debug!("[{}] connected to {}", self.name, self.controller);
                        self.features_seq = seq;
                    }
                    self.handshake = Handshake::FeaturesReplied;
                }
                OfMessage::GetConfigRequest => {
                    self.send(
                        OfMessage::GetConfigReply {
                            flags: 0,
                            miss_send_len: MISS_SEND_LEN,
                        },
                        Some(xid),
                        timers,
                    );
                }
                OfMessage::BarrierRequest => {
                    self.send(OfMessage::BarrierReply, Some(xid), timers);
                }
                OfMessage::Error { kind, code } => warn!(
                    "[{}] {} reported error type {kind} code {code}",
                    self.name, self.controller
                ),
                _ => {}
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Change the state of a port. If the state changes and the switch is connected, a
    /// `PORT_STATUS` message is sent. Returns `true` if the state changed.
    pub(crate) fn set_port_state<W: ChannelHost>(
        &mut self,
        no: PortNo,
        up: bool,
        timers: &mut Timers<W>,
    ) -> bool {
        let port = match self.ports.get_mut(&no) {
            Some(p) if p.up != up => p,
            _ => return false,
        };
        port.up = up;
        let port = port.clone();
        if !self.failed && self.handshake == Handshake::FeaturesReplied {
            let phy = self.phy_port(&port);
            self.send(
                OfMessage::PortStatus {
                    reason: PortReason::Modify,
                    port: phy,
                },
                None,
                timers,
            );
        }
        true
    }

    /// Report a packet received on `in_port` to the controller. Returns `false` if the packet
    /// could not be reported.
    pub(crate) fn packet_in<W: ChannelHost>(
        &mut self,
        in_port: PortNo,
        packet: Vec<u8>,
        timers: &mut Timers<W>,
    ) -> bool {
        if self.failed || self.handshake != Handshake::FeaturesReplied {
            return false;
        }
        if !self.ports.get(&in_port).map(|p| p.up).unwrap_or(false) {
            return false;
        }
        let mut data = packet;
        data.truncate(MISS_SEND_LEN as usize);
        self.send(
            OfMessage::PacketIn {
                buffer_id: NO_BUFFER,
                in_port,
                data,
            },
            None,
            timers,
        );
        true
    }
}

/// Hardware address of a host.
pub fn host_mac(host: HostId) -> [u8; 6] {
    let h = host.0.to_be_bytes();
    [0x02, 0x00, h[0], h[1], h[2], h[3]]
}

/// Minimal ethernet frame from `src` to `dst`, used for simulated traffic.
pub fn ethernet_frame(src: HostId, dst: HostId) -> Vec<u8> {
    let mut frame = Vec::with_capacity(64);
    frame.extend_from_slice(&host_mac(dst));
    frame.extend_from_slice(&host_mac(src));
    // IPv4 ethertype
    frame.extend_from_slice(&[0x08, 0x00]);
    frame.resize(64, 0);
    frame
}
