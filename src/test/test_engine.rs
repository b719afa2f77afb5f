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

use std::io::Write;

use maplit::btreeset;
use pretty_assertions::assert_eq;
use simnet::{
    controller::Controller,
    generator::TopologyShape,
    topology::ControllerView,
    trace::{NetworkEvent, TraceError},
    types::{ControllerId, SwitchId, TopologyError},
};

use super::{fast_config, loopback_context, DeadSnapshot, StaticSnapshot};
use crate::{
    config::ConfigError,
    runtime::{
        correspondence::{HealthAlert, Verdict},
        engine::{EngineState, FaultOrigin, FuzzTester, FuzzerConfig, SimulationReport},
        exit_status,
        faults::{FaultKind, FuzzerParams},
        interactive::ScriptedInput,
        SimError,
    },
};

fn single_controller() -> Vec<Controller> {
    vec![Controller::new(0, Vec::new(), 6633)]
}

fn mesh(n: usize) -> TopologyShape {
    TopologyShape::Mesh { num_switches: n }
}

#[test_log::test(tokio::test)]
async fn quiet_mesh_stays_consistent() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let engine = FuzzTester::new(fast_config(10), FuzzerParams::new(), Box::new(fake.clone()));
    let report = engine.simulate(&mut ctx, Some(10)).await.unwrap();

    assert_eq!(report.steps_run, 10);
    assert_eq!(report.final_state, EngineState::Stopped);
    assert!(!report.interrupted);
    assert!(report.faults.is_empty());
    assert_eq!(report.checks.len(), 10);
    assert!(report
        .checks
        .iter()
        .all(|c| c.verdict == Verdict::Consistent));
    assert_eq!(report.violations().count(), 0);
    assert!(report.alerts.is_empty());

    let topo = ctx.topology().unwrap();
    assert!(topo.is_control_connected(SwitchId(1)));
    assert!(topo.is_control_connected(SwitchId(2)));
    assert_eq!(
        fake.known(ControllerId(0)),
        btreeset! {SwitchId(1), SwitchId(2)}
    );
    assert!(ctx.has_quit());
    assert!(ctx.processes().is_empty());
}

#[tokio::test]
async fn keep_alives_keep_the_view_consistent() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(3));
    fake.send_keep_alives();
    let engine = FuzzTester::new(fast_config(15), FuzzerParams::new(), Box::new(fake.clone()));
    let report = engine.simulate(&mut ctx, Some(15)).await.unwrap();

    assert_eq!(report.checks.len(), 15);
    assert_eq!(report.violations().count(), 0);
    let topo = ctx.topology().unwrap();
    assert!(topo
        .switches()
        .iter()
        .all(|s| s.control().stats().messages_sent > 3));
    assert_eq!(
        fake.known(ControllerId(0)),
        btreeset! {SwitchId(1), SwitchId(2), SwitchId(3)}
    );
}

#[tokio::test]
async fn boot_waits_for_the_handshakes() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let config = FuzzerConfig {
        connect_ticks: 10,
        ..fast_config(1)
    };
    let report = FuzzTester::new(config, FuzzerParams::new(), Box::new(fake.clone()))
        .simulate(&mut ctx, Some(1))
        .await
        .unwrap();
    assert_eq!(report.steps_run, 1);
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.checks[0].verdict, Verdict::Consistent);
    assert_eq!(
        fake.known(ControllerId(0)),
        btreeset! {SwitchId(1), SwitchId(2)}
    );

    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    FuzzTester::new(fast_config(1), FuzzerParams::new(), Box::new(fake.clone()))
        .simulate(&mut ctx, Some(1))
        .await
        .unwrap();
    assert!(fake.known(ControllerId(0)).is_empty());
}

#[tokio::test]
async fn fat_tree_without_controllers() {
    let (mut ctx, fake) = loopback_context(
        single_controller(),
        false,
        TopologyShape::FatTree { num_pods: 4 },
    );
    let engine = FuzzTester::new(fast_config(1), FuzzerParams::new(), Box::new(fake));
    let report = engine.simulate(&mut ctx, Some(1)).await.unwrap();

    assert_eq!(report.steps_run, 1);
    let topo = ctx.topology().unwrap();
    assert_eq!(topo.switches().len(), 20);
    assert_eq!(topo.hosts().len(), 16);
    assert_eq!(topo.access_links().len(), 16);
    assert_eq!(topo.links().len(), 32);
    assert!(ctx.processes().is_empty());
}

async fn fuzzed_run(seed: u64) -> SimulationReport {
    let params = FuzzerParams::new()
        .with(FaultKind::SwitchFailure, 0.05)
        .and_then(|p| p.with(FaultKind::SwitchRecovery, 0.5))
        .and_then(|p| p.with(FaultKind::LinkFailure, 0.3))
        .and_then(|p| p.with(FaultKind::LinkRecovery, 0.5))
        .and_then(|p| p.with(FaultKind::ControlMessageDrop, 0.2))
        .and_then(|p| p.with(FaultKind::ControlMessageDelay, 0.1))
        .and_then(|p| p.with(FaultKind::TrafficGeneration, 0.3))
        .unwrap();
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(3));
    let config = FuzzerConfig {
        seed,
        ..fast_config(30)
    };
    FuzzTester::new(config, params, Box::new(fake))
        .simulate(&mut ctx, Some(30))
        .await
        .unwrap()
}

#[tokio::test]
async fn same_seed_same_run() {
    let a = fuzzed_run(7).await;
    let b = fuzzed_run(7).await;
    assert!(!a.faults.is_empty());
    assert_eq!(a.faults, b.faults);
    assert_eq!(a.checks, b.checks);
    assert_eq!(a.alerts, b.alerts);
    assert!(a.faults.iter().all(|f| f.origin == FaultOrigin::Random));
    assert!(a.faults.windows(2).all(|w| w[0].step <= w[1].step));
}

#[tokio::test]
async fn violation_is_recorded() {
    let (mut ctx, _) = loopback_context(single_controller(), false, mesh(2));
    let wrong = StaticSnapshot(ControllerView {
        switches: btreeset! {SwitchId(7)},
        links: None,
    });
    let report = FuzzTester::new(fast_config(4), FuzzerParams::new(), Box::new(wrong))
        .simulate(&mut ctx, Some(4))
        .await
        .unwrap();

    assert_eq!(report.steps_run, 4);
    assert!(!report.halted);
    assert_eq!(report.violations().count(), 4);
    match &report.checks[0].verdict {
        Verdict::Violation(diff) => {
            assert_eq!(diff.unexpected_switches, btreeset! {SwitchId(7)});
            assert!(diff.missing_switches.is_empty());
        }
        v => panic!("expected a violation, got {v:?}"),
    }
    // from step 3 on, both switches are connected but not reported.
    match &report.checks[3].verdict {
        Verdict::Violation(diff) => {
            assert_eq!(diff.missing_switches, btreeset! {SwitchId(1), SwitchId(2)})
        }
        v => panic!("expected a violation, got {v:?}"),
    }
}

#[tokio::test]
async fn halt_on_violation() {
    let (mut ctx, _) = loopback_context(single_controller(), false, mesh(2));
    let wrong = StaticSnapshot(ControllerView {
        switches: btreeset! {SwitchId(7)},
        links: None,
    });
    let config = FuzzerConfig {
        halt_on_violation: true,
        ..fast_config(10)
    };
    let report = FuzzTester::new(config, FuzzerParams::new(), Box::new(wrong))
        .simulate(&mut ctx, Some(10))
        .await
        .unwrap();

    assert!(report.halted);
    assert_eq!(report.steps_run, 1);
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.final_state, EngineState::Stopped);
    assert!(ctx.has_quit());
}

#[tokio::test]
async fn consecutive_snapshot_failures_raise_one_alert() {
    let (mut ctx, _) = loopback_context(single_controller(), false, mesh(2));
    let report = FuzzTester::new(fast_config(4), FuzzerParams::new(), Box::new(DeadSnapshot))
        .simulate(&mut ctx, Some(4))
        .await
        .unwrap();

    assert_eq!(report.steps_run, 4);
    assert!(report
        .checks
        .iter()
        .all(|c| matches!(c.verdict, Verdict::Unavailable(_))));
    assert_eq!(
        report.alerts,
        vec![HealthAlert::SnapshotFailures {
            step: 2,
            controller: ControllerId(0),
            count: 2
        }]
    );
}

#[tokio::test]
async fn checks_follow_the_interval() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let config = FuzzerConfig {
        check_interval: 4,
        force_check: false,
        ..fast_config(10)
    };
    let report = FuzzTester::new(config, FuzzerParams::new(), Box::new(fake))
        .simulate(&mut ctx, Some(10))
        .await
        .unwrap();
    let steps: Vec<u64> = report.checks.iter().map(|c| c.step).collect();
    assert_eq!(steps, vec![4, 8]);
}

#[tokio::test]
async fn two_controllers_are_checked_in_order() {
    let controllers = vec![
        Controller::new(0, Vec::new(), 6633),
        Controller::new(1, Vec::new(), 6634),
    ];
    let (mut ctx, fake) = loopback_context(controllers, false, mesh(4));
    let report = FuzzTester::new(fast_config(5), FuzzerParams::new(), Box::new(fake.clone()))
        .simulate(&mut ctx, Some(5))
        .await
        .unwrap();

    assert_eq!(report.checks.len(), 10);
    let order: Vec<(u64, ControllerId)> = report
        .checks
        .iter()
        .take(4)
        .map(|c| (c.step, c.controller))
        .collect();
    assert_eq!(
        order,
        vec![
            (1, ControllerId(0)),
            (1, ControllerId(1)),
            (2, ControllerId(0)),
            (2, ControllerId(1))
        ]
    );
    assert_eq!(report.violations().count(), 0);
    assert_eq!(
        fake.known(ControllerId(0)),
        btreeset! {SwitchId(1), SwitchId(3)}
    );
    assert_eq!(
        fake.known(ControllerId(1)),
        btreeset! {SwitchId(2), SwitchId(4)}
    );
}

#[tokio::test]
async fn trace_is_replayed() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "# link flap and a packet").unwrap();
    writeln!(file, r#"{{"step": 2, "type": "link_failure", "a": 1, "b": 2}}"#).unwrap();
    writeln!(file, r#"{{"step": 4, "type": "packet", "src": 1, "dst": 2}}"#).unwrap();
    writeln!(file, r#"{{"step": 5, "type": "link_recovery", "a": 2, "b": 1}}"#).unwrap();
    file.flush().unwrap();

    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let report = FuzzTester::new(fast_config(6), FuzzerParams::new(), Box::new(fake))
        .with_trace_file(file.path())
        .simulate(&mut ctx, Some(6))
        .await
        .unwrap();

    let replayed: Vec<(u64, FaultOrigin, FaultKind, bool)> = report
        .faults
        .iter()
        .map(|f| (f.step, f.origin, f.kind, f.applied))
        .collect();
    assert_eq!(
        replayed,
        vec![
            (2, FaultOrigin::Trace, FaultKind::LinkFailure, true),
            (4, FaultOrigin::Trace, FaultKind::TrafficGeneration, true),
            (5, FaultOrigin::Trace, FaultKind::LinkRecovery, true),
        ]
    );
    assert_eq!(report.violations().count(), 0);
    let topo = ctx.topology().unwrap();
    assert!(topo.link_between(SwitchId(1), SwitchId(2)).unwrap().up);
}

#[tokio::test]
async fn invalid_trace_is_a_setup_error() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, r#"{{"step": 1, "type": "switch_failure", "switch": 9}}"#).unwrap();
    file.flush().unwrap();

    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let result = FuzzTester::new(fast_config(3), FuzzerParams::new(), Box::new(fake))
        .with_trace_file(file.path())
        .simulate(&mut ctx, Some(3))
        .await;

    assert!(matches!(
        result,
        Err(SimError::Trace(TraceError::Invalid {
            line: 1,
            source: TopologyError::UnknownSwitch(SwitchId(9))
        }))
    ));
    assert!(ctx.is_stopped());
    assert!(ctx.has_quit());
    assert!(ctx.topology().is_none());
}

#[tokio::test]
async fn invalid_topology_is_a_setup_error() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(0));
    let result = FuzzTester::new(fast_config(3), FuzzerParams::new(), Box::new(fake))
        .simulate(&mut ctx, Some(3))
        .await;
    assert!(matches!(
        result,
        Err(SimError::Topology(TopologyError::InvalidSwitchCount(0)))
    ));
    assert!(ctx.is_stopped());
}

#[tokio::test]
async fn exit_status_follows_the_outcome() {
    let (mut ctx, _) = loopback_context(single_controller(), false, mesh(2));
    let wrong = StaticSnapshot(ControllerView {
        switches: btreeset! {SwitchId(7)},
        links: None,
    });
    let result = FuzzTester::new(fast_config(2), FuzzerParams::new(), Box::new(wrong))
        .simulate(&mut ctx, Some(2))
        .await;
    assert_eq!(result.as_ref().unwrap().violations().count(), 2);
    assert_eq!(exit_status(&result), 0);

    let interrupted = SimulationReport {
        interrupted: true,
        ..SimulationReport::default()
    };
    assert_eq!(exit_status(&Ok(interrupted)), 0);
    let halted = SimulationReport {
        halted: true,
        ..SimulationReport::default()
    };
    assert_eq!(exit_status(&Ok(halted)), 0);

    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(0));
    let result = FuzzTester::new(fast_config(3), FuzzerParams::new(), Box::new(fake))
        .simulate(&mut ctx, Some(3))
        .await;
    assert_eq!(exit_status(&result), 1);
    assert_eq!(
        exit_status(&Err(SimError::Config(ConfigError::InvalidCheckInterval))),
        1
    );
}

#[tokio::test]
async fn context_cannot_be_reused() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    FuzzTester::new(fast_config(1), FuzzerParams::new(), Box::new(fake.clone()))
        .simulate(&mut ctx, Some(1))
        .await
        .unwrap();
    let again = FuzzTester::new(fast_config(1), FuzzerParams::new(), Box::new(fake))
        .simulate(&mut ctx, Some(1))
        .await;
    assert!(matches!(again, Err(SimError::Stopped)));
}

#[tokio::test]
async fn interactive_session() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let input = ScriptedInput::new([
        "",
        "step 2",
        "inspect",
        "check",
        "fail link_failure 1 2",
        "bogus",
        "help",
        "quit",
        "step 100",
    ]);
    let config = FuzzerConfig {
        interactive: true,
        force_check: false,
        check_interval: 35,
        steps: None,
        ..fast_config(0)
    };
    let report = FuzzTester::new(config, FuzzerParams::new(), Box::new(fake))
        .with_input(Box::new(input))
        .simulate(&mut ctx, None)
        .await
        .unwrap();

    assert_eq!(report.steps_run, 3);
    assert!(!report.interrupted);
    assert_eq!(report.final_state, EngineState::Stopped);
    assert_eq!(report.faults.len(), 1);
    // labeled with the step whose tick it precedes
    assert_eq!(report.faults[0].step, 4);
    assert_eq!(report.faults[0].origin, FaultOrigin::Operator);
    assert_eq!(
        report.faults[0].event,
        NetworkEvent::LinkFailure {
            a: SwitchId(1),
            b: SwitchId(2)
        }
    );
    assert_eq!(report.checks.len(), 1);
    assert_eq!(report.checks[0].step, 3);
    assert_eq!(report.checks[0].verdict, Verdict::Consistent);
    let topo = ctx.topology().unwrap();
    assert!(!topo.link_between(SwitchId(1), SwitchId(2)).unwrap().up);
}

#[tokio::test]
async fn end_of_input_quits() {
    let (mut ctx, fake) = loopback_context(single_controller(), false, mesh(2));
    let config = FuzzerConfig {
        interactive: true,
        steps: None,
        ..fast_config(0)
    };
    let report = FuzzTester::new(config, FuzzerParams::new(), Box::new(fake))
        .with_input(Box::new(ScriptedInput::new(Vec::<String>::new())))
        .simulate(&mut ctx, None)
        .await
        .unwrap();
    assert_eq!(report.steps_run, 0);
    assert!(!report.interrupted);
    assert!(ctx.has_quit());
}
