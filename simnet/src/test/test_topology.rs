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

use maplit::btreeset;
use pretty_assertions::assert_eq;

use super::TestController;
use crate::{
    channel::LoopbackConnector,
    controller::Controller,
    deferred_io::{DeferredIoWorker, IoLoop},
    generator::TopologyGenerator,
    openflow::OfMessage,
    scheduler::Scheduler,
    switch::Handshake,
    topology::*,
    trace::NetworkEvent,
    types::{ControllerId, HostId, PortNo, SwitchId, TopologyError},
};

struct Setup {
    scheduler: Scheduler<Topology>,
    topo: Topology,
    ctrl: TestController,
}

impl Setup {
    fn mesh(n: usize) -> Self {
        let connector = LoopbackConnector::new();
        let mut topo = TopologyGenerator::new(connector.clone())
            .populate(
                &[Controller::new(0, Vec::new(), 6633)],
                DeferredIoWorker::new,
                n,
            )
            .unwrap();
        let ctrl = TestController::new(connector.take_ends());
        let mut scheduler = Scheduler::new();
        scheduler.schedule(IoLoop::new());
        topo.connect_all(scheduler.timers_mut());
        Self {
            scheduler,
            topo,
            ctrl,
        }
    }

    fn run(&mut self, ticks: usize) {
        for _ in 0..ticks {
            let report = self.scheduler.tick(&mut self.topo);
            assert!(report.failures.is_empty(), "{:?}", report.failures);
            self.ctrl.pump();
        }
    }

    fn apply(&mut self, event: NetworkEvent) -> bool {
        self.topo
            .apply_event(&event, self.scheduler.timers_mut())
            .unwrap()
    }

    fn expected(&self) -> ControllerView {
        self.topo.expected_view(ControllerId(0))
    }

    fn observed(&self) -> ControllerView {
        ControllerView {
            switches: self.ctrl.known.clone(),
            links: None,
        }
    }
}

fn s(x: u64) -> SwitchId {
    SwitchId(x)
}

#[test]
fn handshake_connects_all_switches() {
    let mut t = Setup::mesh(3);
    t.run(2);
    assert!(!t.topo.is_control_connected(s(1)));
    t.run(1);
    for sw in t.topo.switches() {
        assert_eq!(sw.handshake(), Handshake::FeaturesReplied);
        assert!(t.topo.is_control_connected(sw.id()));
    }
    assert_eq!(t.ctrl.known, btreeset! {s(1), s(2), s(3)});
    assert_eq!(
        t.expected(),
        ControllerView {
            switches: btreeset! {s(1), s(2), s(3)},
            links: Some(btreeset! {
                LinkView::new(s(1), s(2)),
                LinkView::new(s(1), s(3)),
                LinkView::new(s(2), s(3)),
            }),
        }
    );
}

#[test]
fn no_faults_no_difference() {
    let mut t = Setup::mesh(4);
    for _ in 0..20 {
        t.run(1);
        assert!(t.expected().diff(&t.observed()).is_empty());
    }
}

#[test]
fn view_diff() {
    let expected = ControllerView {
        switches: btreeset! {s(1), s(2)},
        links: Some(btreeset! {LinkView::new(s(2), s(1))}),
    };
    let observed = ControllerView {
        switches: btreeset! {s(2), s(3)},
        links: Some(btreeset! {LinkView::new(s(2), s(3))}),
    };
    let diff = expected.diff(&observed);
    assert_eq!(diff.missing_switches, btreeset! {s(1)});
    assert_eq!(diff.unexpected_switches, btreeset! {s(3)});
    assert_eq!(diff.missing_links, btreeset! {LinkView::new(s(1), s(2))});
    assert_eq!(diff.unexpected_links, btreeset! {LinkView::new(s(3), s(2))});
    assert_eq!(
        diff.to_string(),
        "missing switches {s1}; unexpected switches {s3}; missing links {s1 -- s2}; unexpected links {s2 -- s3}"
    );

    // links are ignored if the controller does not report them
    let observed = ControllerView {
        switches: btreeset! {s(1), s(2)},
        links: None,
    };
    assert!(expected.diff(&observed).is_empty());
}

#[test]
fn link_failure_and_recovery() {
    let mut t = Setup::mesh(3);
    t.run(3);
    assert!(t.apply(NetworkEvent::LinkFailure { a: s(2), b: s(1) }));
    assert!(!t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(2) }));
    t.run(2);

    let reported: Vec<(SwitchId, bool)> = t
        .ctrl
        .port_status
        .iter()
        .map(|(sw, msg)| match msg {
            OfMessage::PortStatus { port, .. } => (*sw, port.up),
            _ => unreachable!(),
        })
        .collect();
    assert_eq!(reported, vec![(s(1), false), (s(2), false)]);
    assert_eq!(
        t.expected().links,
        Some(btreeset! {LinkView::new(s(1), s(3)), LinkView::new(s(2), s(3))})
    );
    assert_eq!(t.topo.partitions(), vec![btreeset! {s(1), s(2), s(3)}]);

    assert!(t.apply(NetworkEvent::LinkRecovery { a: s(1), b: s(2) }));
    t.run(2);
    assert_eq!(t.ctrl.port_status.len(), 4);
    assert_eq!(t.expected().links.map(|l| l.len()), Some(3));
}

#[test]
fn switch_failure_and_recovery() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.apply(NetworkEvent::SwitchFailure { switch: s(2) }));
    assert!(!t.apply(NetworkEvent::SwitchFailure { switch: s(2) }));
    assert!(t.topo.switch(s(2)).unwrap().control().is_closed());
    t.run(2);
    assert_eq!(t.ctrl.known, btreeset! {s(1)});
    assert_eq!(t.expected().switches, btreeset! {s(1)});
    assert_eq!(t.topo.partitions(), vec![btreeset! {s(1)}]);
    // only the surviving switch reports its port
    assert_eq!(t.ctrl.port_status.len(), 1);
    assert_eq!(t.ctrl.port_status[0].0, s(1));

    assert!(t.apply(NetworkEvent::SwitchRecovery { switch: s(2) }));
    t.run(4);
    assert_eq!(t.ctrl.known, btreeset! {s(1), s(2)});
    assert!(t.expected().diff(&t.observed()).is_empty());
    assert_eq!(t.topo.partitions(), vec![btreeset! {s(1), s(2)}]);
}

#[test]
fn partitions_after_link_failures() {
    let mut t = Setup::mesh(3);
    t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(2) });
    t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(3) });
    assert_eq!(
        t.topo.partitions(),
        vec![btreeset! {s(1)}, btreeset! {s(2), s(3)}]
    );
}

#[test]
fn control_channel_failure_and_recovery() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.apply(NetworkEvent::ControlChannelFailure { switch: s(1) }));
    assert!(!t.topo.is_control_connected(s(1)));
    t.run(1);
    assert_eq!(t.ctrl.known, btreeset! {s(2)});
    assert!(t.expected().diff(&t.observed()).is_empty());

    assert!(t.apply(NetworkEvent::ControlChannelRecovery { switch: s(1) }));
    assert!(!t.apply(NetworkEvent::ControlChannelRecovery { switch: s(1) }));
    t.run(4);
    assert_eq!(t.ctrl.known, btreeset! {s(1), s(2)});
}

#[test]
fn keep_alives_do_not_disconnect() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.expected().diff(&t.observed()).is_empty());
    for xid in 0..5 {
        t.ctrl.echo(xid);
        t.run(1);
        assert!(t.topo.is_control_connected(s(1)));
        assert!(t.topo.is_control_connected(s(2)));
        assert!(t.expected().diff(&t.observed()).is_empty());
    }
}

#[test]
fn dropped_features_reply_is_not_connected() {
    let mut t = Setup::mesh(2);
    // HELLO is written in the first tick, FEATURES_REPLY is queued in the second.
    t.run(2);
    assert_eq!(
        t.topo.switch(s(1)).unwrap().handshake(),
        Handshake::FeaturesReplied
    );
    assert!(t.apply(NetworkEvent::ControlMessageDrop { switch: s(1) }));
    assert_eq!(t.topo.switch(s(1)).unwrap().handshake(), Handshake::HelloSent);
    t.run(3);
    assert!(!t.topo.is_control_connected(s(1)));
    assert!(t.topo.is_control_connected(s(2)));
    assert_eq!(t.ctrl.known, btreeset! {s(2)});
    assert!(t.expected().diff(&t.observed()).is_empty());
}

#[test]
fn control_channel_stays_closed_on_failed_switch() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.apply(NetworkEvent::SwitchFailure { switch: s(1) }));
    assert!(!t.apply(NetworkEvent::ControlChannelRecovery { switch: s(1) }));
    let sw = t.topo.switch(s(1)).unwrap();
    assert!(sw.is_failed());
    assert!(sw.control().is_closed());

    assert!(t.apply(NetworkEvent::SwitchRecovery { switch: s(1) }));
    assert!(!t.topo.switch(s(1)).unwrap().control().is_closed());
    t.run(4);
    assert!(t.topo.is_control_connected(s(1)));
}

#[test]
fn very_long_delay_does_not_overflow() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.apply(NetworkEvent::ControlMessageDelay {
        switch: s(1),
        ticks: u64::MAX
    }));
    let now = t.scheduler.now();
    assert!(t.topo.switch(s(1)).unwrap().control().is_held(now));
    t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(2) });
    t.run(5);
    assert_eq!(t.ctrl.port_status.len(), 1);
    assert_eq!(t.ctrl.port_status[0].0, s(2));
}

#[test]
fn dropped_control_messages_are_lost() {
    let mut t = Setup::mesh(2);
    t.run(3);
    t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(2) });
    assert!(t.apply(NetworkEvent::ControlMessageDrop { switch: s(1) }));
    assert!(!t.apply(NetworkEvent::ControlMessageDrop { switch: s(1) }));
    t.run(2);
    assert_eq!(t.ctrl.port_status.len(), 1);
    assert_eq!(t.ctrl.port_status[0].0, s(2));
    assert_eq!(
        t.topo.switch(s(1)).unwrap().control().stats().messages_dropped,
        1
    );
}

#[test]
fn delayed_control_messages_arrive_later() {
    let mut t = Setup::mesh(2);
    t.run(3);
    assert!(t.apply(NetworkEvent::ControlMessageDelay {
        switch: s(1),
        ticks: 3
    }));
    t.apply(NetworkEvent::LinkFailure { a: s(1), b: s(2) });
    t.run(3);
    assert_eq!(t.ctrl.port_status.len(), 1);
    assert_eq!(t.ctrl.port_status[0].0, s(2));
    t.run(1);
    assert_eq!(t.ctrl.port_status.len(), 2);
}

#[test]
fn packets_are_reported_by_the_ingress_switch() {
    let mut t = Setup::mesh(2);
    // not yet connected
    assert!(!t.apply(NetworkEvent::Packet {
        src: HostId(1),
        dst: HostId(2)
    }));
    t.run(3);
    assert!(t.apply(NetworkEvent::Packet {
        src: HostId(1),
        dst: HostId(2)
    }));
    t.run(1);
    assert_eq!(t.ctrl.packet_ins.len(), 1);
    match &t.ctrl.packet_ins[0] {
        (sw, OfMessage::PacketIn { in_port, data, .. }) => {
            assert_eq!(*sw, s(1));
            // port 1 goes to s2, port 2 to h1
            assert_eq!(*in_port, PortNo(2));
            assert_eq!(data.len(), 64);
        }
        m => panic!("unexpected {m:?}"),
    }

    assert!(t.apply(NetworkEvent::AccessLinkFailure { host: HostId(1) }));
    assert!(!t.apply(NetworkEvent::Packet {
        src: HostId(1),
        dst: HostId(2)
    }));
    assert!(t.apply(NetworkEvent::AccessLinkRecovery { host: HostId(1) }));
    assert!(t.topo.access_link_of(HostId(1)).unwrap().up);
}

#[test]
fn events_referencing_unknown_elements() {
    let mut t = Setup::mesh(2);
    let timers = t.scheduler.timers_mut();
    assert_eq!(
        t.topo
            .apply_event(&NetworkEvent::SwitchFailure { switch: s(3) }, timers),
        Err(TopologyError::UnknownSwitch(s(3)))
    );
    assert_eq!(
        t.topo.check_event(&NetworkEvent::Packet {
            src: HostId(1),
            dst: HostId(9)
        }),
        Err(TopologyError::UnknownHost(HostId(9)))
    );
    assert_eq!(
        t.topo
            .check_event(&NetworkEvent::LinkFailure { a: s(1), b: s(1) }),
        Err(TopologyError::UnknownLink(s(1), s(1)))
    );
    assert_eq!(
        t.topo.check_event(&NetworkEvent::LinkRecovery { a: s(2), b: s(1) }),
        Ok(())
    );
}
