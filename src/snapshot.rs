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

//! Snapshot Service
//!
//! Captures the network view of a running controller, so that it can be compared with the
//! ground truth of the simulation. The flavor of the controller is chosen once at startup.

use std::{collections::BTreeSet, time::Duration};

use async_trait::async_trait;
use clap::ValueEnum;
use log::trace;
use serde::Deserialize;
use simnet::{
    controller::Controller,
    topology::{ControllerView, LinkView},
    types::{ControllerId, SwitchId},
};
use thiserror::Error;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
    time::timeout,
};

/// Port of the POX messenger service, if the controller does not configure one.
pub const POX_DEFAULT_PORT: u16 = 7790;
/// Port of the Floodlight REST API, if the controller does not configure one.
pub const FLOODLIGHT_DEFAULT_PORT: u16 = 8080;
/// Time after which an unresponsive controller is considered unavailable.
pub const SNAPSHOT_TIMEOUT: Duration = Duration::from_secs(2);

/// Errors while taking a snapshot
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SnapshotError {
    /// The controller cannot be reached.
    #[error("Controller {0} is unavailable: {1}")]
    Unavailable(ControllerId, String),
    /// The controller answered with something that is not a network view.
    #[error("Controller {0} returned a malformed state: {1}")]
    Malformed(ControllerId, String),
}

/// Something that can capture the network view of a controller.
#[async_trait]
pub trait SnapshotService: std::fmt::Debug + Send {
    /// Capture the current view of `controller`.
    async fn snapshot(&mut self, controller: &Controller) -> Result<ControllerView, SnapshotError>;
}

/// Supported controller flavors
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, ValueEnum)]
pub enum ControllerFlavor {
    /// POX, queried through its messenger service.
    Pox,
    /// Floodlight, queried through its REST API.
    Floodlight,
}

impl ControllerFlavor {
    /// Snapshot service for this flavor.
    pub fn service(&self) -> Box<dyn SnapshotService> {
        match self {
            Self::Pox => Box::new(PoxSnapshotService::default()),
            Self::Floodlight => Box::new(FloodlightSnapshotService::default()),
        }
    }
}

/// Parse a datapath id, either decimal or colon / dash separated hex
/// (`00:00:00:00:00:00:00:01`).
pub fn parse_dpid(s: &str) -> Option<SwitchId> {
    let s = s.trim();
    if s.contains(':') || s.contains('-') {
        let hex: String = s.chars().filter(|c| *c != ':' && *c != '-').collect();
        u64::from_str_radix(&hex, 16).ok().map(SwitchId)
    } else {
        s.parse().ok().map(SwitchId)
    }
}

/// A datapath id as it appears in JSON: a number or a string.
#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum JsonDpid {
    Num(u64),
    Str(String),
}

impl JsonDpid {
    fn resolve(&self) -> Option<SwitchId> {
        match self {
            Self::Num(x) => Some(SwitchId(*x)),
            Self::Str(s) => parse_dpid(s),
        }
    }
}

fn resolve_all<'a>(
    controller: ControllerId,
    dpids: impl IntoIterator<Item = &'a JsonDpid>,
) -> Result<Vec<SwitchId>, SnapshotError> {
    dpids
        .into_iter()
        .map(|d| {
            d.resolve()
                .ok_or_else(|| SnapshotError::Malformed(controller, format!("invalid dpid {d:?}")))
        })
        .collect()
}

async fn connect(controller: &Controller, port: u16) -> Result<TcpStream, SnapshotError> {
    let target = format!("{}:{}", controller.address, port);
    match timeout(SNAPSHOT_TIMEOUT, TcpStream::connect(&target)).await {
        Ok(Ok(stream)) => Ok(stream),
        Ok(Err(e)) => Err(SnapshotError::Unavailable(
            controller.id,
            format!("cannot connect to {target}: {e}"),
        )),
        Err(_) => Err(SnapshotError::Unavailable(
            controller.id,
            format!("timeout while connecting to {target}"),
        )),
    }
}

/// Snapshots of POX. The messenger service speaks newline-delimited JSON; the view is requested
/// with `{"getnom": 0}` after the `nommessenger` hello.
#[derive(Debug, Default, Clone)]
pub struct PoxSnapshotService;

#[derive(Debug, Deserialize)]
struct PoxSwitch {
    dpid: JsonDpid,
}

#[derive(Debug, Deserialize)]
struct PoxLink {
    node1: JsonDpid,
    node2: JsonDpid,
}

#[derive(Debug, Deserialize)]
struct PoxNom {
    #[serde(default)]
    switches: Vec<PoxSwitch>,
    links: Option<Vec<PoxLink>>,
}

impl PoxSnapshotService {
    /// Parse a single line received from the messenger. Returns `Ok(None)` for messages that
    /// do not carry the view.
    pub fn parse_line(
        controller: ControllerId,
        line: &str,
    ) -> Result<Option<ControllerView>, SnapshotError> {
        let value: serde_json::Value = serde_json::from_str(line)
            .map_err(|e| SnapshotError::Malformed(controller, e.to_string()))?;
        if value.get("switches").is_none() {
            return Ok(None);
        }
        let nom: PoxNom = serde_json::from_value(value)
            .map_err(|e| SnapshotError::Malformed(controller, e.to_string()))?;
        let switches = resolve_all(controller, nom.switches.iter().map(|s| &s.dpid))?
            .into_iter()
            .collect();
        let links = match nom.links {
            Some(links) => {
                let mut result = BTreeSet::new();
                for link in links {
                    let ends = resolve_all(controller, [&link.node1, &link.node2])?;
                    result.insert(LinkView::new(ends[0], ends[1]));
                }
                Some(result)
            }
            None => None,
        };
        Ok(Some(ControllerView { switches, links }))
    }

    async fn query(&self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        let port = controller.snapshot_port.unwrap_or(POX_DEFAULT_PORT);
        let stream = connect(controller, port).await?;
        let (read, mut write) = stream.into_split();
        let unavailable = |e: std::io::Error| SnapshotError::Unavailable(controller.id, e.to_string());

        write
            .write_all(b"{\"hello\": \"nommessenger\"}\n{\"getnom\": 0}\n")
            .await
            .map_err(unavailable)?;
        write.flush().await.map_err(unavailable)?;

        let mut lines = BufReader::new(read).lines();
        while let Some(line) = lines.next_line().await.map_err(unavailable)? {
            let line = line.trim();
            if line.is_empty() {
                continue;
            }
            trace!("[{}] snapshot: {line}", controller.id);
            if let Some(view) = Self::parse_line(controller.id, line)? {
                return Ok(view);
            }
        }
        Err(SnapshotError::Unavailable(
            controller.id,
            "connection closed before the view was received".to_string(),
        ))
    }
}

#[async_trait]
impl SnapshotService for PoxSnapshotService {
    async fn snapshot(&mut self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        match timeout(SNAPSHOT_TIMEOUT, self.query(controller)).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Unavailable(
                controller.id,
                "timeout while waiting for the view".to_string(),
            )),
        }
    }
}

/// Snapshots of Floodlight, through the REST API.
#[derive(Debug, Clone)]
pub struct FloodlightSnapshotService {
    client: reqwest::Client,
}

impl Default for FloodlightSnapshotService {
    fn default() -> Self {
        let client = reqwest::Client::builder()
            .timeout(SNAPSHOT_TIMEOUT)
            .build()
            .unwrap_or_default();
        Self { client }
    }
}

/// Path of the list of connected switches
const FLOODLIGHT_SWITCHES: &str = "/wm/core/controller/switches/json";
/// Path of the list of discovered links
const FLOODLIGHT_LINKS: &str = "/wm/topology/links/json";

#[derive(Debug, Deserialize)]
struct FloodlightSwitch {
    #[serde(alias = "switchDPID")]
    dpid: JsonDpid,
}

#[derive(Debug, Deserialize)]
struct FloodlightLink {
    #[serde(rename = "src-switch")]
    src: JsonDpid,
    #[serde(rename = "dst-switch")]
    dst: JsonDpid,
}

impl FloodlightSnapshotService {
    /// Parse the body of the switch list.
    pub fn parse_switches(
        controller: ControllerId,
        body: &str,
    ) -> Result<BTreeSet<SwitchId>, SnapshotError> {
        let switches: Vec<FloodlightSwitch> = serde_json::from_str(body)
            .map_err(|e| SnapshotError::Malformed(controller, e.to_string()))?;
        Ok(resolve_all(controller, switches.iter().map(|s| &s.dpid))?
            .into_iter()
            .collect())
    }

    /// Parse the body of the link list. Links are reported once per direction.
    pub fn parse_links(
        controller: ControllerId,
        body: &str,
    ) -> Result<BTreeSet<LinkView>, SnapshotError> {
        let links: Vec<FloodlightLink> = serde_json::from_str(body)
            .map_err(|e| SnapshotError::Malformed(controller, e.to_string()))?;
        let mut result = BTreeSet::new();
        for link in links {
            let ends = resolve_all(controller, [&link.src, &link.dst])?;
            result.insert(LinkView::new(ends[0], ends[1]));
        }
        Ok(result)
    }

    async fn get(&self, controller: &Controller, path: &str) -> Result<String, SnapshotError> {
        let port = controller.snapshot_port.unwrap_or(FLOODLIGHT_DEFAULT_PORT);
        let url = format!("http://{}:{port}{path}", controller.address);
        trace!("[{}] snapshot: GET {url}", controller.id);
        let unavailable = |e: reqwest::Error| SnapshotError::Unavailable(controller.id, e.to_string());
        self.client
            .get(&url)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .and_then(|response| response.error_for_status())
            .map_err(unavailable)?
            .text()
            .await
            .map_err(unavailable)
    }

    async fn query(&self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        let switches = self.get(controller, FLOODLIGHT_SWITCHES).await?;
        let switches = Self::parse_switches(controller.id, &switches)?;
        let links = self.get(controller, FLOODLIGHT_LINKS).await?;
        let links = Self::parse_links(controller.id, &links)?;
        Ok(ControllerView {
            switches,
            links: Some(links),
        })
    }
}

#[async_trait]
impl SnapshotService for FloodlightSnapshotService {
    async fn snapshot(&mut self, controller: &Controller) -> Result<ControllerView, SnapshotError> {
        match timeout(SNAPSHOT_TIMEOUT, self.query(controller)).await {
            Ok(result) => result,
            Err(_) => Err(SnapshotError::Unavailable(
                controller.id,
                "timeout while waiting for the REST API".to_string(),
            )),
        }
    }
}
