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

//! Minimal OpenFlow 1.0 wire codec.
//!
//! Only the messages needed for a switch to attach to a controller and to report data-plane
//! events are parsed. Every other message is kept as [`OfMessage::Other`], such that it can be
//! skipped without losing the framing.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::types::PortNo;

/// OpenFlow protocol version 1.0
pub const OFP_VERSION: u8 = 0x01;
/// Length of the common header
pub const HEADER_LEN: usize = 8;
/// Length of a physical port description
pub const PHY_PORT_LEN: usize = 48;
/// Largest message that is accepted.
pub const MAX_MESSAGE_LEN: usize = u16::MAX as usize;

const OFPT_HELLO: u8 = 0;
const OFPT_ERROR: u8 = 1;
const OFPT_ECHO_REQUEST: u8 = 2;
const OFPT_ECHO_REPLY: u8 = 3;
const OFPT_FEATURES_REQUEST: u8 = 5;
const OFPT_FEATURES_REPLY: u8 = 6;
const OFPT_GET_CONFIG_REQUEST: u8 = 7;
const OFPT_GET_CONFIG_REPLY: u8 = 8;
const OFPT_SET_CONFIG: u8 = 9;
const OFPT_PACKET_IN: u8 = 10;
const OFPT_PORT_STATUS: u8 = 12;
const OFPT_BARRIER_REQUEST: u8 = 18;
const OFPT_BARRIER_REPLY: u8 = 19;

/// `OFPPC_PORT_DOWN`: the port is administratively down.
const OFPPC_PORT_DOWN: u32 = 1;
/// `OFPPS_LINK_DOWN`: no physical link present.
const OFPPS_LINK_DOWN: u32 = 1;

/// Buffer id signalling that the packet is not buffered on the switch.
pub const NO_BUFFER: u32 = u32::MAX;

/// Errors while decoding OpenFlow messages.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum OfError {
    /// The message uses a different protocol version.
    #[error("Unsupported OpenFlow version 0x{0:02x}")]
    BadVersion(u8),
    /// The length field in the header is invalid.
    #[error("Invalid message length {0}")]
    BadLength(usize),
    /// The body is shorter than required by the message type.
    #[error("Truncated message of type {msg_type}: expected {expected} bytes, got {got}")]
    Truncated {
        /// Message type
        msg_type: u8,
        /// Expected length
        expected: usize,
        /// Actual length
        got: usize,
    },
}

/// Description of a physical port.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PhyPort {
    /// Port number
    pub port_no: PortNo,
    /// Hardware address
    pub hw_addr: [u8; 6],
    /// Name of the port (at most 15 bytes are encoded)
    pub name: String,
    /// Whether the port is up (administratively and physically).
    pub up: bool,
}

impl PhyPort {
    /// Hardware address derived from the datapath id and the port number.
    pub fn hw_addr_for(datapath_id: u64, port_no: PortNo) -> [u8; 6] {
        let dp = datapath_id.to_be_bytes();
        let port = port_no.0.to_be_bytes();
        [0x02, dp[5], dp[6], dp[7], port[0], port[1]]
    }

    fn encode(&self, buf: &mut Vec<u8>) {
        buf.extend_from_slice(&self.port_no.0.to_be_bytes());
        buf.extend_from_slice(&self.hw_addr);
        let mut name = [0u8; 16];
        for (dst, src) in name.iter_mut().take(15).zip(self.name.bytes()) {
            *dst = src;
        }
        buf.extend_from_slice(&name);
        let (config, state) = if self.up {
            (0, 0)
        } else {
            (OFPPC_PORT_DOWN, OFPPS_LINK_DOWN)
        };
        buf.extend_from_slice(&config.to_be_bytes());
        buf.extend_from_slice(&state.to_be_bytes());
        // curr, advertised, supported, peer
        buf.extend_from_slice(&[0u8; 16]);
    }

    fn decode(b: &[u8]) -> Self {
        let name_len = b[8..24].iter().position(|c| *c == 0).unwrap_or(16);
        let config = be_u32(&b[24..28]);
        let state = be_u32(&b[28..32]);
        Self {
            port_no: PortNo(be_u16(&b[0..2])),
            hw_addr: [b[2], b[3], b[4], b[5], b[6], b[7]],
            name: String::from_utf8_lossy(&b[8..8 + name_len]).into_owned(),
            up: config & OFPPC_PORT_DOWN == 0 && state & OFPPS_LINK_DOWN == 0,
        }
    }
}

/// Body of a `FEATURES_REPLY`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Features {
    /// Datapath id of the switch
    pub datapath_id: u64,
    /// Number of packets that can be buffered
    pub n_buffers: u32,
    /// Number of flow tables
    pub n_tables: u8,
    /// Physical ports
    pub ports: Vec<PhyPort>,
}

/// Reason of a `PORT_STATUS` message.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum PortReason {
    /// The port was added
    Add,
    /// The port was removed
    Delete,
    /// Some attribute of the port has changed
    Modify,
}

impl PortReason {
    fn code(self) -> u8 {
        match self {
            Self::Add => 0,
            Self::Delete => 1,
            Self::Modify => 2,
        }
    }

    fn from_code(code: u8) -> Self {
        match code {
            0 => Self::Add,
            1 => Self::Delete,
            _ => Self::Modify,
        }
    }
}

/// An OpenFlow message (without the transaction id).
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum OfMessage {
    /// `HELLO`
    Hello,
    /// `ERROR`
    Error {
        /// Error type
        kind: u16,
        /// Error code
        code: u16,
    },
    /// `ECHO_REQUEST` with its payload
    EchoRequest(Vec<u8>),
    /// `ECHO_REPLY` with its payload
    EchoReply(Vec<u8>),
    /// `FEATURES_REQUEST`
    FeaturesRequest,
    /// `FEATURES_REPLY`
    FeaturesReply(Features),
    /// `GET_CONFIG_REQUEST`
    GetConfigRequest,
    /// `GET_CONFIG_REPLY`
    GetConfigReply {
        /// Config flags
        flags: u16,
        /// Number of bytes of a packet sent to the controller
        miss_send_len: u16,
    },
    /// `SET_CONFIG`
    SetConfig {
        /// Config flags
        flags: u16,
        /// Number of bytes of a packet sent to the controller
        miss_send_len: u16,
    },
    /// `PACKET_IN`
    PacketIn {
        /// Buffer id, or [`NO_BUFFER`]
        buffer_id: u32,
        /// Port on which the packet was received
        in_port: PortNo,
        /// Packet data
        data: Vec<u8>,
    },
    /// `PORT_STATUS`
    PortStatus {
        /// What happened
        reason: PortReason,
        /// The port after the change
        port: PhyPort,
    },
    /// `BARRIER_REQUEST`
    BarrierRequest,
    /// `BARRIER_REPLY`
    BarrierReply,
    /// Any message that is not interpreted
    Other {
        /// Message type
        msg_type: u8,
        /// Message body
        body: Vec<u8>,
    },
}

impl OfMessage {
    /// Message type code
    pub fn msg_type(&self) -> u8 {
        match self {
            Self::Hello => OFPT_HELLO,
            Self::Error { .. } => OFPT_ERROR,
            Self::EchoRequest(_) => OFPT_ECHO_REQUEST,
            Self::EchoReply(_) => OFPT_ECHO_REPLY,
            Self::FeaturesRequest => OFPT_FEATURES_REQUEST,
            Self::FeaturesReply(_) => OFPT_FEATURES_REPLY,
            Self::GetConfigRequest => OFPT_GET_CONFIG_REQUEST,
            Self::GetConfigReply { .. } => OFPT_GET_CONFIG_REPLY,
            Self::SetConfig { .. } => OFPT_SET_CONFIG,
            Self::PacketIn { .. } => OFPT_PACKET_IN,
            Self::PortStatus { .. } => OFPT_PORT_STATUS,
            Self::BarrierRequest => OFPT_BARRIER_REQUEST,
            Self::BarrierReply => OFPT_BARRIER_REPLY,
            Self::Other { msg_type, .. } => *msg_type,
        }
    }

    /// Encode the message with transaction id `xid`.
    pub fn encode(&self, xid: u32) -> Vec<u8> {
        let mut buf = Vec::with_capacity(HEADER_LEN);
        buf.push(OFP_VERSION);
        buf.push(self.msg_type());
        buf.extend_from_slice(&[0, 0]);
        buf.extend_from_slice(&xid.to_be_bytes());
        match self {
            Self::Hello
            | Self::FeaturesRequest
            | Self::GetConfigRequest
            | Self::BarrierRequest
            | Self::BarrierReply => {}
            Self::Error { kind, code } => {
                buf.extend_from_slice(&kind.to_be_bytes());
                buf.extend_from_slice(&code.to_be_bytes());
            }
            Self::EchoRequest(data) | Self::EchoReply(data) => buf.extend_from_slice(data),
            Self::FeaturesReply(f) => {
                buf.extend_from_slice(&f.datapath_id.to_be_bytes());
                buf.extend_from_slice(&f.n_buffers.to_be_bytes());
                buf.push(f.n_tables);
                buf.extend_from_slice(&[0u8; 3]);
                // capabilities and actions
                buf.extend_from_slice(&[0u8; 8]);
                f.ports.iter().for_each(|p| p.encode(&mut buf));
            }
            Self::GetConfigReply {
                flags,
                miss_send_len,
            }
            | Self::SetConfig {
                flags,
                miss_send_len,
            } => {
                buf.extend_from_slice(&flags.to_be_bytes());
                buf.extend_from_slice(&miss_send_len.to_be_bytes());
            }
            Self::PacketIn {
                buffer_id,
                in_port,
                data,
            } => {
                buf.extend_from_slice(&buffer_id.to_be_bytes());
                buf.extend_from_slice(&(data.len() as u16).to_be_bytes());
                buf.extend_from_slice(&in_port.0.to_be_bytes());
                // reason (no match) and padding
                buf.extend_from_slice(&[0u8; 2]);
                buf.extend_from_slice(data);
            }
            Self::PortStatus { reason, port } => {
                buf.push(reason.code());
                buf.extend_from_slice(&[0u8; 7]);
                port.encode(&mut buf);
            }
            Self::Other { body, .. } => buf.extend_from_slice(body),
        }
        let len = (buf.len().min(MAX_MESSAGE_LEN) as u16).to_be_bytes();
        buf[2] = len[0];
        buf[3] = len[1];
        buf
    }

    /// Decode a message from a complete frame (header included). Returns the transaction id and
    /// the message.
    pub fn decode(frame: &[u8]) -> Result<(u32, Self), OfError> {
        if frame.len() < HEADER_LEN {
            return Err(OfError::BadLength(frame.len()));
        }
        let version = frame[0];
        let msg_type = frame[1];
        let len = be_u16(&frame[2..4]) as usize;
        if len < HEADER_LEN || len != frame.len() {
            return Err(OfError::BadLength(len));
        }
        // version negotiation happens with HELLO, which may carry a higher version.
        if version != OFP_VERSION && msg_type != OFPT_HELLO {
            return Err(OfError::BadVersion(version));
        }
        let xid = be_u32(&frame[4..8]);
        let body = &frame[HEADER_LEN..];
        let need = |expected: usize| {
            if body.len() < expected {
                Err(OfError::Truncated {
                    msg_type,
                    expected,
                    got: body.len(),
                })
            } else {
                Ok(())
            }
        };

        let msg = match msg_type {
            OFPT_HELLO => Self::Hello,
            OFPT_ERROR => {
                need(4)?;
                Self::Error {
                    kind: be_u16(&body[0..2]),
                    code: be_u16(&body[2..4]),
                }
            }
            OFPT_ECHO_REQUEST => Self::EchoRequest(body.to_vec()),
            OFPT_ECHO_REPLY => Self::EchoReply(body.to_vec()),
            OFPT_FEATURES_REQUEST => Self::FeaturesRequest,
            OFPT_FEATURES_REPLY => {
                need(24)?;
                Self::FeaturesReply(Features {
                    datapath_id: be_u64(&body[0..8]),
                    n_buffers: be_u32(&body[8..12]),
                    n_tables: body[12],
                    ports: body[24..]
                        .chunks_exact(PHY_PORT_LEN)
                        .map(PhyPort::decode)
                        .collect(),
                })
            }
            OFPT_GET_CONFIG_REQUEST => Self::GetConfigRequest,
            OFPT_GET_CONFIG_REPLY | OFPT_SET_CONFIG => {
                need(4)?;
                let flags = be_u16(&body[0..2]);
                let miss_send_len = be_u16(&body[2..4]);
                if msg_type == OFPT_SET_CONFIG {
                    Self::SetConfig {
                        flags,
                        miss_send_len,
                    }
                } else {
                    Self::GetConfigReply {
                        flags,
                        miss_send_len,
                    }
                }
            }
            OFPT_PACKET_IN => {
                need(10)?;
                Self::PacketIn {
                    buffer_id: be_u32(&body[0..4]),
                    in_port: PortNo(be_u16(&body[6..8])),
                    data: body[10..].to_vec(),
                }
            }
            OFPT_PORT_STATUS => {
                need(8 + PHY_PORT_LEN)?;
                Self::PortStatus {
                    reason: PortReason::from_code(body[0]),
                    port: PhyPort::decode(&body[8..8 + PHY_PORT_LEN]),
                }
            }
            OFPT_BARRIER_REQUEST => Self::BarrierRequest,
            OFPT_BARRIER_REPLY => Self::BarrierReply,
            _ => Self::Other {
                msg_type,
                body: body.to_vec(),
            },
        };
        Ok((xid, msg))
    }
}

/// Splits a byte stream into OpenFlow frames.
#[derive(Debug, Default, Clone)]
pub struct FrameDecoder {
    buf: Vec<u8>,
}

impl FrameDecoder {
    /// Create an empty decoder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Append received bytes.
    pub fn push(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Number of buffered bytes.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Discard all buffered bytes.
    pub fn reset(&mut self) {
        self.buf.clear();
    }

    /// Decode the next complete frame, if any. A frame that cannot be decoded is consumed and
    /// reported as an error. If the length field itself is invalid, the stream cannot be
    /// resynchronized and the whole buffer is discarded.
    pub fn next_frame(&mut self) -> Result<Option<(u32, OfMessage)>, OfError> {
        if self.buf.len() < HEADER_LEN {
            return Ok(None);
        }
        let len = be_u16(&self.buf[2..4]) as usize;
        if len < HEADER_LEN {
            self.buf.clear();
            return Err(OfError::BadLength(len));
        }
        if self.buf.len() < len {
            return Ok(None);
        }
        let frame: Vec<u8> = self.buf.drain(..len).collect();
        OfMessage::decode(&frame).map(Some)
    }
}

fn be_u16(b: &[u8]) -> u16 {
    u16::from_be_bytes([b[0], b[1]])
}

fn be_u32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn be_u64(b: &[u8]) -> u64 {
    let mut x = [0u8; 8];
    x.copy_from_slice(&b[..8]);
    u64::from_be_bytes(x)
}
