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

//! Test module

use std::{
    collections::BTreeSet,
    sync::{Arc, Mutex},
    time::Duration,
};

use async_trait::async_trait;
use simnet::{
    channel::{ControllerEnd, LoopbackConnector, RawChannel},
    controller::Controller,
    generator::{TopologyGenerator, TopologyShape},
    openflow::{FrameDecoder, OfMessage},
    scheduler::{Task, TaskStatus, Timers},
    topology::{ControllerView, Topology},
    types::{ControllerId, SwitchId, TaskError},
};

use crate::{
    runtime::{engine::FuzzerConfig, CancellationToken, RunContext},
    snapshot::{SnapshotError, SnapshotService},
};

mod test_engine;

/// Non-interactive configuration that checks after every step without any delay.
pub(crate) fn fast_config(steps: u64) -> FuzzerConfig {
    FuzzerConfig {
        interactive: false,
        check_interval: 1,
        force_check: true,
        delay: Duration::ZERO,
        seed: 0,
        steps: Some(steps),
        halt_on_violation: false,
        connect_ticks: 0,
    }
}

/// A run context over in-memory channels, together with a fake controller attached to them.
pub(crate) fn loopback_context(
    controllers: Vec<Controller>,
    boot: bool,
    shape: TopologyShape,
) -> (RunContext, FakeController) {
    let connector = LoopbackConnector::new();
    let fake = FakeController::new(connector.clone());
    let mut ctx = RunContext::new(controllers, boot, TopologyGenerator::new(connector), shape);
    ctx.scheduler_mut().schedule(fake.clone());
    (ctx, fake)
}

#[derive(Debug)]
struct Attached {
    end: ControllerEnd,
    decoder: FrameDecoder,
    dpid: Option<SwitchId>,
}

#[derive(Debug)]
struct FakeState {
    connector: LoopbackConnector,
    ends: Vec<Attached>,
    keep_alives: bool,
    next_xid: u32,
}

impl FakeState {
    fn pump(&mut self) {
        for end in self.connector.take_ends() {
            self.ends.push(Attached {
                end,
                decoder: FrameDecoder::new(),
                dpid: None,
            });
        }
        for a in self.ends.iter_mut() {
            let mut buf = [0u8; 4096];
            loop {
                match a.end.channel.read(&mut buf) {
                    Ok(0) => {
                        a.dpid = None;
                        a.decoder.reset();
                        break;
                    }
                    Ok(n) => a.decoder.push(&buf[..n]),
                    Err(_) => break,
                }
            }
            while let Ok(Some((xid, msg))) = a.decoder.next_frame() {
                match msg {
                    OfMessage::Hello => {
                        a.dpid = None;
                        let request = OfMessage::FeaturesRequest.encode(xid.wrapping_add(1000));
                        let _ = a.end.channel.write(&request);
                    }
                    OfMessage::EchoRequest(payload) => {
                        let _ = a.end.channel.write(&OfMessage::EchoReply(payload).encode(xid));
                    }
                    OfMessage::FeaturesReply(f) => a.dpid = Some(SwitchId(f.datapath_id)),
                    _ => {}
                }
            }
            if self.keep_alives && a.dpid.is_some() {
                self.next_xid = self.next_xid.wrapping_add(1);
                let echo = OfMessage::EchoRequest(b"alive".to_vec()).encode(self.next_xid);
                let _ = a.end.channel.write(&echo);
            }
        }
    }

    fn view(&self, controller: ControllerId) -> ControllerView {
        ControllerView {
            switches: self
                .ends
                .iter()
                .filter(|a| a.end.controller == controller)
                .filter_map(|a| a.dpid)
                .collect(),
            links: None,
        }
    }
}

/// Minimal controller on the other end of a [`LoopbackConnector`]. It answers the handshake in
/// every tick, and reports the switches that completed it as its view. It does not discover
/// links.
#[derive(Debug, Clone)]
pub(crate) struct FakeController {
    state: Arc<Mutex<FakeState>>,
}

impl FakeController {
    pub(crate) fn new(connector: LoopbackConnector) -> Self {
        Self {
            state: Arc::new(Mutex::new(FakeState {
                connector,
                ends: Vec::new(),
                keep_alives: false,
                next_xid: 0,
            })),
        }
    }

    /// Send an `ECHO_REQUEST` to every connected switch whenever the controller is pumped.
    pub(crate) fn send_keep_alives(&self) {
        self.state.lock().unwrap().keep_alives = true;
    }

    pub(crate) fn known(&self, controller: ControllerId) -> BTreeSet<SwitchId> {
        let mut state = self.state.lock().unwrap();
        state.pump();
        state.view(controller).switches
    }

    fn snapshot_now(&self, controller: ControllerId) -> ControllerView {
        let mut state = self.state.lock().unwrap();
        state.pump();
        state.view(controller)
    }
}

impl Task<Topology> for FakeController {
    fn name(&self) -> &str {
        "fake-controller"
    }

    fn run(
        &mut self,
        _: &mut Topology,
        _: &mut Timers<Topology>,
    ) -> Result<TaskStatus, TaskError> {
        self.state.lock().unwrap().pump();
        Ok(TaskStatus::Continue)
    }
}

#[async_trait]
impl SnapshotService for FakeController {
    async fn snapshot(&mut self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        Ok(self.snapshot_now(controller.id))
    }
}

/// Snapshot service that always returns the same view.
#[derive(Debug, Clone, Default)]
pub(crate) struct StaticSnapshot(pub(crate) ControllerView);

#[async_trait]
impl SnapshotService for StaticSnapshot {
    async fn snapshot(&mut self, _: &Controller) -> Result<ControllerView, SnapshotError> {
        Ok(self.0.clone())
    }
}

/// Snapshot service of a controller that never answers.
#[derive(Debug, Clone, Default)]
pub(crate) struct DeadSnapshot;

#[async_trait]
impl SnapshotService for DeadSnapshot {
    async fn snapshot(&mut self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        Err(SnapshotError::Unavailable(
            controller.id,
            "connection refused".to_string(),
        ))
    }
}

/// Task that cancels a token once the scheduler reaches a given time.
#[derive(Debug)]
pub(crate) struct CancelAt {
    pub(crate) token: CancellationToken,
    pub(crate) at: u64,
}

impl Task<Topology> for CancelAt {
    fn name(&self) -> &str {
        "cancel"
    }

    fn run(
        &mut self,
        _: &mut Topology,
        timers: &mut Timers<Topology>,
    ) -> Result<TaskStatus, TaskError> {
        if timers.now() >= self.at {
            self.token.cancel();
            return Ok(TaskStatus::Finished);
        }
        Ok(TaskStatus::Continue)
    }
}
