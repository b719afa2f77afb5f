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

#![deny(missing_docs, missing_debug_implementations)]

//! # SimNet
//!
//! Deterministic simulation of an OpenFlow data plane, used to test SDN controllers.
//!
//! ## Main Concepts
//!
//! The [`scheduler::Scheduler`] is a single-threaded cooperative event loop. It drives a set of
//! [`scheduler::Task`]s and a queue of deferred callbacks on a *world*, which is usually a
//! [`topology::Topology`]. Every tick polls the tasks, runs the ready ones, and then runs the
//! due callbacks ordered by due time and registration order. Since nothing else moves the
//! simulation forward, the order of events only depends on the order of ticks.
//!
//! Switches talk to controllers over [`deferred_io::DeferredIoWorker`]s. Such a worker never
//! touches its socket on its own: sends are queued and flushed in a deferred callback, and
//! received data is buffered by the [`deferred_io::IoLoop`] task before it is delivered to the
//! switch. In between, faults can hold, drop, or close the channel.
//!
//! The [`generator::TopologyGenerator`] builds a flat mesh or a fat-tree. It opens every control
//! channel through a [`channel::Connector`] and wraps it with a `create_worker` function
//! supplied by the caller, so the generator never depends on the scheduler. The resulting
//! [`topology::Topology`] is the ground truth of the simulation. It applies
//! [`trace::NetworkEvent`]s and computes the [`topology::ControllerView`] each controller should
//! have.
//!
//! ## Example usage
//!
//! ```
//! use simnet::prelude::*;
//!
//! fn main() -> Result<(), TopologyError> {
//!     let controllers = vec![Controller::new(0, Vec::new(), 6633)];
//!     let mut generator = TopologyGenerator::new(LoopbackConnector::new());
//!     let mut topo = generator.populate(&controllers, DeferredIoWorker::new, 3)?;
//!     assert_eq!(topo.switches().len(), 3);
//!     assert_eq!(topo.links().len(), 3);
//!
//!     let mut scheduler = Scheduler::new();
//!     scheduler.schedule(IoLoop::new());
//!     topo.connect_all(scheduler.timers_mut());
//!     for _ in 0..10 {
//!         scheduler.tick(&mut topo);
//!     }
//!     assert!(scheduler.quit());
//!     assert!(scheduler.has_quit());
//!     Ok(())
//! }
//! ```

pub mod channel;
pub mod controller;
pub mod deferred_io;
pub mod generator;
pub mod openflow;
pub mod prelude;
pub mod scheduler;
pub mod switch;
pub mod topology;
pub mod trace;
pub mod types;

#[cfg(test)]
mod test;
