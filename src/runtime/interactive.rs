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

//! Operator commands for interactive mode.
//!
//! ```text
//! (empty) | s | step [n]        advance one (or n) steps
//! q | quit | exit               stop the simulation
//! i | inspect                   print the state of the network
//! c | check                     run a correspondence check now
//! f | fail <kind> <target...>   inject a fault, e.g. `fail link_failure 1 2`
//! h | help                      print this help
//! ```
//!
//! Switches may be written as `3` or `s3`, hosts as `2` or `h2`.

use std::{collections::VecDeque, fmt::Write, str::FromStr};

use async_trait::async_trait;
use itertools::Itertools;
use simnet::{
    topology::Topology,
    trace::NetworkEvent,
    types::{HostId, SwitchId},
};
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader, Lines, Stdin};

use super::faults::{FaultKind, DELAY_TICKS};

/// Help text of the prompt.
pub const HELP: &str = "\
(empty) | s | step [n]        advance one (or n) steps
q | quit | exit               stop the simulation
i | inspect                   print the state of the network
c | check                     run a correspondence check now
f | fail <kind> <target...>   inject a fault, e.g. `fail link_failure 1 2`
h | help                      print this help";

/// A parsed operator command
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Advance the given number of steps.
    Step(u64),
    /// Stop the simulation.
    Quit,
    /// Print the state of the network.
    Inspect,
    /// Check the correspondence now.
    Check,
    /// Inject a fault.
    Fail(NetworkEvent),
    /// Print the help.
    Help,
}

/// Errors while parsing a command
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum CommandError {
    /// Unknown command
    #[error("Unknown command `{0}`")]
    Unknown(String),
    /// Unknown fault kind
    #[error("Unknown fault kind `{0}`")]
    UnknownFault(String),
    /// A number could not be parsed.
    #[error("Invalid number `{0}`")]
    InvalidNumber(String),
    /// An argument is missing.
    #[error("Missing argument: {0}")]
    MissingArgument(&'static str),
    /// Too many arguments.
    #[error("Unexpected argument `{0}`")]
    TooManyArguments(String),
}

fn number<T: FromStr>(word: &str, prefix: char) -> Result<T, CommandError> {
    word.strip_prefix(prefix)
        .unwrap_or(word)
        .parse()
        .map_err(|_| CommandError::InvalidNumber(word.to_string()))
}

fn count(word: &str) -> Result<u64, CommandError> {
    word.parse()
        .map_err(|_| CommandError::InvalidNumber(word.to_string()))
}

fn switch<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<SwitchId, CommandError> {
    let word = args.next().ok_or(CommandError::MissingArgument("switch"))?;
    Ok(SwitchId(number(word, 's')?))
}

fn host<'a>(args: &mut impl Iterator<Item = &'a str>) -> Result<HostId, CommandError> {
    let word = args.next().ok_or(CommandError::MissingArgument("host"))?;
    Ok(HostId(number(word, 'h')?))
}

/// Build the network event of a `fail` command.
fn parse_fault<'a>(mut args: impl Iterator<Item = &'a str>) -> Result<NetworkEvent, CommandError> {
    let kind = args.next().ok_or(CommandError::MissingArgument("fault kind"))?;
    let kind: FaultKind = kind
        .parse()
        .map_err(|_| CommandError::UnknownFault(kind.to_string()))?;
    let args = &mut args;
    let event = match kind {
        FaultKind::SwitchFailure => NetworkEvent::SwitchFailure {
            switch: switch(args)?,
        },
        FaultKind::SwitchRecovery => NetworkEvent::SwitchRecovery {
            switch: switch(args)?,
        },
        FaultKind::LinkFailure => NetworkEvent::LinkFailure {
            a: switch(args)?,
            b: switch(args)?,
        },
        FaultKind::LinkRecovery => NetworkEvent::LinkRecovery {
            a: switch(args)?,
            b: switch(args)?,
        },
        FaultKind::AccessLinkFailure => NetworkEvent::AccessLinkFailure { host: host(args)? },
        FaultKind::AccessLinkRecovery => NetworkEvent::AccessLinkRecovery { host: host(args)? },
        FaultKind::ControlChannelFailure => NetworkEvent::ControlChannelFailure {
            switch: switch(args)?,
        },
        FaultKind::ControlChannelRecovery => NetworkEvent::ControlChannelRecovery {
            switch: switch(args)?,
        },
        FaultKind::ControlMessageDrop => NetworkEvent::ControlMessageDrop {
            switch: switch(args)?,
        },
        FaultKind::ControlMessageDelay => NetworkEvent::ControlMessageDelay {
            switch: switch(args)?,
            ticks: match args.next() {
                Some(word) => count(word)?,
                None => DELAY_TICKS,
            },
        },
        FaultKind::TrafficGeneration => NetworkEvent::Packet {
            src: host(args)?,
            dst: host(args)?,
        },
    };
    match args.next() {
        Some(extra) => Err(CommandError::TooManyArguments(extra.to_string())),
        None => Ok(event),
    }
}

impl FromStr for Command {
    type Err = CommandError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let mut words = s.split_whitespace();
        let command = match words.next() {
            None => return Ok(Self::Step(1)),
            Some(w) => w.to_lowercase(),
        };
        let result = match command.as_str() {
            "s" | "step" => match words.next() {
                Some(n) => Self::Step(count(n)?),
                None => Self::Step(1),
            },
            "q" | "quit" | "exit" => Self::Quit,
            "i" | "inspect" => Self::Inspect,
            "c" | "check" => Self::Check,
            "h" | "help" | "?" => Self::Help,
            "f" | "fail" => return parse_fault(words).map(Self::Fail),
            _ => return Err(CommandError::Unknown(command)),
        };
        match words.next() {
            Some(extra) => Err(CommandError::TooManyArguments(extra.to_string())),
            None => Ok(result),
        }
    }
}

/// Human-readable description of the state of the network.
pub fn describe(topo: &Topology, step: u64) -> String {
    let mut s = String::new();
    let _ = writeln!(s, "step {step}");
    for switch in topo.switches() {
        let control = switch.control();
        let _ = writeln!(
            s,
            "  {} ({:?}) -> {}: {}{}, {:?}, {} pending, {} sent, {} dropped",
            switch.name(),
            switch.tier(),
            switch.controller(),
            if switch.is_failed() { "failed" } else { "alive" },
            if switch.is_control_connected() {
                ", connected"
            } else {
                ""
            },
            control.health(),
            control.pending_sends(),
            control.stats().messages_sent,
            control.stats().messages_dropped,
        );
    }
    let down = topo.links().iter().filter(|l| !l.up).map(|l| l.view()).join(", ");
    if !down.is_empty() {
        let _ = writeln!(s, "  links down: {down}");
    }
    let hosts_down = topo
        .access_links()
        .iter()
        .filter(|a| !a.up)
        .map(|a| a.host)
        .join(", ");
    if !hosts_down.is_empty() {
        let _ = writeln!(s, "  hosts disconnected: {hosts_down}");
    }
    let partitions = topo
        .partitions()
        .iter()
        .map(|p| format!("{{{}}}", p.iter().join(", ")))
        .join(" ");
    let _ = write!(s, "  partitions: {partitions}");
    s
}

/// Source of operator input.
#[async_trait]
pub trait OperatorInput: std::fmt::Debug + Send {
    /// Show `prompt` and read the next line. Returns `None` at the end of the input.
    async fn next_line(&mut self, prompt: &str) -> Option<String>;
}

/// Reads commands from the standard input.
#[derive(Debug)]
pub struct StdinInput {
    lines: Lines<BufReader<Stdin>>,
}

impl Default for StdinInput {
    fn default() -> Self {
        Self::new()
    }
}

impl StdinInput {
    /// Read from the standard input.
    pub fn new() -> Self {
        Self {
            lines: BufReader::new(tokio::io::stdin()).lines(),
        }
    }
}

#[async_trait]
impl OperatorInput for StdinInput {
    async fn next_line(&mut self, prompt: &str) -> Option<String> {
        let mut stdout = tokio::io::stdout();
        let _ = stdout.write_all(prompt.as_bytes()).await;
        let _ = stdout.flush().await;
        self.lines.next_line().await.ok().flatten()
    }
}

/// A fixed list of commands.
#[derive(Debug, Default, Clone)]
pub struct ScriptedInput {
    lines: VecDeque<String>,
}

impl ScriptedInput {
    /// Create an input that returns `lines` in order.
    pub fn new<I, S>(lines: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            lines: lines.into_iter().map(Into::into).collect(),
        }
    }
}

#[async_trait]
impl OperatorInput for ScriptedInput {
    async fn next_line(&mut self, _prompt: &str) -> Option<String> {
        self.lines.pop_front()
    }
}
