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

use std::io::{Cursor, Write};

use pretty_assertions::assert_eq;

use crate::{
    channel::LoopbackConnector,
    controller::Controller,
    deferred_io::DeferredIoWorker,
    generator::TopologyGenerator,
    topology::Topology,
    trace::*,
    types::{HostId, SwitchId, TopologyError},
};

const TRACE: &str = r#"
# a small trace
{"step": 1, "type": "link_failure", "a": 1, "b": 2}
{"step": 1, "type": "packet", "src": 1, "dst": 2}

{"step": 4, "type": "control_message_delay", "switch": 2, "ticks": 3}
{"step": 9, "type": "link_recovery", "a": 1, "b": 2}
"#;

fn reader(s: &str) -> TraceReader<Cursor<Vec<u8>>> {
    TraceReader::new(Cursor::new(s.as_bytes().to_vec()))
}

fn mesh(n: usize) -> Topology {
    TopologyGenerator::new(LoopbackConnector::new())
        .populate(
            &[Controller::new(0, Vec::new(), 6633)],
            DeferredIoWorker::new,
            n,
        )
        .unwrap()
}

#[test]
fn parse_trace() {
    let events: Vec<TraceEvent> = reader(TRACE).collect::<Result<_, _>>().unwrap();
    assert_eq!(
        events,
        vec![
            TraceEvent {
                step: 1,
                event: NetworkEvent::LinkFailure {
                    a: SwitchId(1),
                    b: SwitchId(2)
                }
            },
            TraceEvent {
                step: 1,
                event: NetworkEvent::Packet {
                    src: HostId(1),
                    dst: HostId(2)
                }
            },
            TraceEvent {
                step: 4,
                event: NetworkEvent::ControlMessageDelay {
                    switch: SwitchId(2),
                    ticks: 3
                }
            },
            TraceEvent {
                step: 9,
                event: NetworkEvent::LinkRecovery {
                    a: SwitchId(1),
                    b: SwitchId(2)
                }
            },
        ]
    );
}

#[test]
fn events_serialize_to_the_trace_format() {
    let event = TraceEvent {
        step: 3,
        event: NetworkEvent::SwitchFailure {
            switch: SwitchId(4),
        },
    };
    assert_eq!(
        serde_json::to_string(&event).unwrap(),
        r#"{"step":3,"type":"switch_failure","switch":4}"#
    );
}

#[test]
fn replay_is_lazy_and_ordered() {
    let mut trace = DataplaneTrace::new(reader(TRACE));
    assert!(trace.events_due(0).unwrap().is_empty());
    assert_eq!(trace.events_due(1).unwrap().len(), 2);
    assert!(trace.events_due(2).unwrap().is_empty());
    // step 4 was skipped, its events are replayed at the next step
    assert_eq!(
        trace.events_due(5).unwrap(),
        vec![NetworkEvent::ControlMessageDelay {
            switch: SwitchId(2),
            ticks: 3
        }]
    );
    assert!(!trace.is_exhausted());
    assert_eq!(trace.events_due(100).unwrap().len(), 1);
    assert!(trace.is_exhausted());
    assert_eq!(trace.replayed(), 4);
    assert!(trace.events_due(101).unwrap().is_empty());
}

#[test]
fn broken_line_keeps_earlier_events() {
    let trace = "{\"step\": 2, \"type\": \"link_failure\", \"a\": 1, \"b\": 2}\n\
                 {\"step\": 2, \"type\": \"switch_failure\", \"switch\": 2}\n\
                 {\"step\": 2, \"type\": \"switch_failure\"\n\
                 {\"step\": 3, \"type\": \"switch_recovery\", \"switch\": 2}\n";
    let mut trace = DataplaneTrace::new(reader(trace));
    assert_eq!(
        trace.events_due(2).unwrap(),
        vec![
            NetworkEvent::LinkFailure {
                a: SwitchId(1),
                b: SwitchId(2)
            },
            NetworkEvent::SwitchFailure {
                switch: SwitchId(2)
            },
        ]
    );
    assert_eq!(trace.replayed(), 2);
    assert!(matches!(
        trace.events_due(3),
        Err(TraceError::Parse { line: 3, .. })
    ));
    assert!(trace.events_due(4).unwrap().is_empty());

    let mut trace = DataplaneTrace::new(reader("not json\n"));
    assert!(matches!(
        trace.events_due(1),
        Err(TraceError::Parse { line: 1, .. })
    ));
    assert!(trace.is_exhausted());
}

#[test]
fn out_of_order_steps() {
    let trace = "{\"step\": 5, \"type\": \"switch_failure\", \"switch\": 1}\n\
                 {\"step\": 2, \"type\": \"switch_recovery\", \"switch\": 1}\n";
    let result: Result<Vec<_>, _> = reader(trace).collect();
    match result {
        Err(TraceError::OutOfOrder {
            line,
            step,
            previous,
        }) => {
            assert_eq!((line, step, previous), (2, 2, 5));
        }
        r => panic!("unexpected result: {r:?}"),
    }
}

#[test]
fn parse_errors_report_the_line() {
    let trace = "# header\n{\"step\": 1, \"type\": \"teleport\", \"switch\": 1}\n";
    match reader(trace).next() {
        Some(Err(TraceError::Parse { line, .. })) => assert_eq!(line, 2),
        r => panic!("unexpected result: {r:?}"),
    }
}

#[test]
fn validate_against_topology() {
    let topo = mesh(2);
    assert_eq!(DataplaneTrace::validate(reader(TRACE), &topo).unwrap(), 4);

    let bad = "{\"step\": 1, \"type\": \"packet\", \"src\": 1, \"dst\": 2}\n\
               {\"step\": 2, \"type\": \"packet\", \"src\": 1, \"dst\": 7}\n";
    match DataplaneTrace::validate(reader(bad), &topo) {
        Err(TraceError::Invalid { line, source }) => {
            assert_eq!(line, 2);
            assert_eq!(source, TopologyError::UnknownHost(HostId(7)));
        }
        r => panic!("unexpected result: {r:?}"),
    }

    let bad = "{\"step\": 1, \"type\": \"link_failure\", \"a\": 1, \"b\": 3}\n";
    assert!(matches!(
        DataplaneTrace::validate(reader(bad), &topo),
        Err(TraceError::Invalid { line: 1, .. })
    ));
}

#[test]
fn open_trace_file() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    file.write_all(TRACE.as_bytes()).unwrap();
    file.flush().unwrap();
    let mut trace = DataplaneTrace::open(file.path()).unwrap();
    assert_eq!(trace.events_due(10).unwrap().len(), 4);
    assert!(DataplaneTrace::open("/this/file/does/not/exist").is_err());
}
