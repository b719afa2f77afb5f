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

//! Test module

use std::collections::BTreeSet;

use crate::{
    channel::{ControllerEnd, RawChannel},
    openflow::{FrameDecoder, OfMessage},
    types::SwitchId,
};

mod test_controller;
mod test_topology;
mod test_trace;

/// Minimal controller answering the handshake of every switch attached to one of its ends.
pub(crate) struct TestController {
    ends: Vec<(ControllerEnd, FrameDecoder)>,
    pub(crate) known: BTreeSet<SwitchId>,
    pub(crate) port_status: Vec<(SwitchId, OfMessage)>,
    pub(crate) packet_ins: Vec<(SwitchId, OfMessage)>,
}

impl TestController {
    pub(crate) fn new(ends: Vec<ControllerEnd>) -> Self {
        Self {
            ends: ends.into_iter().map(|e| (e, FrameDecoder::new())).collect(),
            known: BTreeSet::new(),
            port_status: Vec::new(),
            packet_ins: Vec::new(),
        }
    }

    /// Send an `ECHO_REQUEST` keep-alive to every switch.
    pub(crate) fn echo(&mut self, xid: u32) {
        for (end, _) in self.ends.iter_mut() {
            end.channel
                .write(&OfMessage::EchoRequest(b"alive".to_vec()).encode(xid))
                .unwrap();
        }
    }

    /// Read everything from all ends and reply.
    pub(crate) fn pump(&mut self) {
        for (idx, (end, decoder)) in self.ends.iter_mut().enumerate() {
            // the switch behind end `idx` has datapath id `idx + 1` in generated topologies.
            let dpid = SwitchId(idx as u64 + 1);
            let mut buf = [0u8; 4096];
            loop {
                match end.channel.read(&mut buf) {
                    Ok(0) => {
                        self.known.remove(&dpid);
                        decoder.reset();
                        break;
                    }
                    Ok(n) => decoder.push(&buf[..n]),
                    Err(_) => break,
                }
            }
            while let Ok(Some((xid, msg))) = decoder.next_frame() {
                match msg {
                    OfMessage::Hello => {
                        self.known.remove(&dpid);
                        end.channel
                            .write(&OfMessage::FeaturesRequest.encode(xid + 1000))
                            .unwrap();
                    }
                    OfMessage::FeaturesReply(f) => {
                        self.known.insert(SwitchId(f.datapath_id));
                    }
                    msg @ OfMessage::PortStatus { .. } => self.port_status.push((dpid, msg)),
                    msg @ OfMessage::PacketIn { .. } => self.packet_ins.push((dpid, msg)),
                    _ => {}
                }
            }
        }
    }
}
