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

#![deny(missing_docs, missing_debug_implementations)]

//! # SdnDebug
//!
//! Fault injection and correspondence checking for SDN controllers.
//!
//! The harness builds a simulated OpenFlow network with [`simnet`], launches the controllers
//! under test, and drives the network step by step. In every step, faults are drawn from a
//! seeded random number generator and replayed from a dataplane trace. Every few steps, the
//! network view of each controller is captured with a [`snapshot::SnapshotService`] and compared
//! with the ground truth of the simulation.
//!
//! The main parts are:
//!
//! - [`config`]: command line and experiment configuration.
//! - [`procs`]: launching and terminating controller processes.
//! - [`snapshot`]: capturing the view of POX and Floodlight.
//! - [`runtime`]: the run context, cancellation, and the engine ([`runtime::engine::FuzzTester`]).

pub mod config;
pub mod procs;
pub mod runtime;
pub mod snapshot;

pub use runtime::{exit_status, run, SimError};

#[cfg(test)]
mod test;
