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

//! Raw bidirectional byte-stream endpoints, and the connectors that open them.
//!
//! A [`RawChannel`] is never used directly by a switch. It is wrapped into a
//! [`DeferredIoWorker`](crate::deferred_io::DeferredIoWorker), which only touches the channel
//! when the scheduler pumps it.

use std::{
    collections::VecDeque,
    io::{self, Read, Write},
    net::{SocketAddr, TcpStream, ToSocketAddrs},
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use log::{debug, trace};

use crate::{
    controller::Controller,
    types::{ControllerId, TopologyError},
};

/// Socket-like endpoint. All operations must be non-blocking (apart from a bounded connect
/// timeout).
pub trait RawChannel: std::fmt::Debug {
    /// Read available data. Returns `Err(WouldBlock)` if nothing can be read right now,
    /// `Err(NotConnected)` if the channel is not (yet) connected, and `Ok(0)` if the peer
    /// closed the connection.
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize>;

    /// Write data, possibly only partially. Returns `Err(WouldBlock)` if nothing can be
    /// written right now, and `Err(NotConnected)` if the channel is not (yet) connected.
    fn write(&mut self, buf: &[u8]) -> io::Result<usize>;

    /// Close the channel. Subsequent reads and writes fail until [`RawChannel::reopen`].
    fn close(&mut self);

    /// Re-establish a closed channel.
    fn reopen(&mut self);

    /// Description of the remote end.
    fn peer(&self) -> String;
}

/// Opens raw channels towards controllers.
pub trait Connector: std::fmt::Debug {
    /// Open a channel to `controller`. This must not block until the controller accepts the
    /// connection; connecting lazily is fine.
    fn connect(&mut self, controller: &Controller) -> Result<Box<dyn RawChannel>, TopologyError>;
}

/// Lock a mutex, ignoring poisoning (the protected data is plain bytes).
fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Connection state shared by both ends of a [`MemoryChannel`].
#[derive(Debug, Default)]
struct Connection {
    closed: bool,
    generation: u64,
    a_to_b: VecDeque<u8>,
    b_to_a: VecDeque<u8>,
}

/// One end of an in-memory pipe. Useful to attach simulated controllers to a topology without
/// any sockets.
#[derive(Debug)]
pub struct MemoryChannel {
    name: String,
    is_a: bool,
    conn: Arc<Mutex<Connection>>,
}

impl MemoryChannel {
    /// Create both ends of a new in-memory pipe.
    pub fn pair(name: impl Into<String>) -> (MemoryChannel, MemoryChannel) {
        let name = name.into();
        let conn = Arc::new(Mutex::new(Connection::default()));
        (
            Self {
                name: format!("{name}/a"),
                is_a: true,
                conn: conn.clone(),
            },
            Self {
                name: format!("{name}/b"),
                is_a: false,
                conn,
            },
        )
    }

    /// Returns `true` if the pipe is currently open.
    pub fn is_open(&self) -> bool {
        !lock(&self.conn).closed
    }

    /// Number of times the pipe was reopened.
    pub fn generation(&self) -> u64 {
        lock(&self.conn).generation
    }
}

impl RawChannel for MemoryChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let mut conn = lock(&self.conn);
        if conn.closed {
            return Ok(0);
        }
        let queue = if self.is_a {
            &mut conn.b_to_a
        } else {
            &mut conn.a_to_b
        };
        if queue.is_empty() {
            return Err(io::ErrorKind::WouldBlock.into());
        }
        let n = buf.len().min(queue.len());
        for (dst, src) in buf.iter_mut().zip(queue.drain(..n)) {
            *dst = src;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let mut conn = lock(&self.conn);
        if conn.closed {
            return Err(io::ErrorKind::BrokenPipe.into());
        }
        let queue = if self.is_a {
            &mut conn.a_to_b
        } else {
            &mut conn.b_to_a
        };
        queue.extend(buf.iter().copied());
        Ok(buf.len())
    }

    fn close(&mut self) {
        let mut conn = lock(&self.conn);
        conn.closed = true;
        conn.a_to_b.clear();
        conn.b_to_a.clear();
    }

    fn reopen(&mut self) {
        let mut conn = lock(&self.conn);
        if conn.closed {
            conn.closed = false;
            conn.generation += 1;
        }
    }

    fn peer(&self) -> String {
        self.name.clone()
    }
}

/// Timeout of a single connection attempt.
const CONNECT_TIMEOUT: Duration = Duration::from_millis(10);
/// Maximum number of polls skipped between two connection attempts.
const MAX_BACKOFF: u32 = 64;

/// Non-blocking TCP connection to a controller. The connection is established lazily with an
/// exponential backoff (counted in polls), and re-established after the peer closed it.
#[derive(Debug)]
pub struct TcpChannel {
    addr: SocketAddr,
    stream: Option<TcpStream>,
    closed: bool,
    backoff: u32,
    skip: u32,
}

impl TcpChannel {
    /// Create a new, not yet connected channel to `addr`.
    pub fn new(addr: SocketAddr) -> Self {
        Self {
            addr,
            stream: None,
            closed: false,
            backoff: 1,
            skip: 0,
        }
    }

    /// Get the stream, trying to connect if necessary.
    fn stream(&mut self) -> io::Result<&mut TcpStream> {
        if self.closed {
            return Err(io::ErrorKind::NotConnected.into());
        }
        if self.stream.is_none() {
            if self.skip > 0 {
                self.skip -= 1;
                return Err(io::ErrorKind::NotConnected.into());
            }
            match TcpStream::connect_timeout(&self.addr, CONNECT_TIMEOUT) {
                Ok(stream) => {
                    stream.set_nonblocking(true)?;
                    stream.set_nodelay(true)?;
                    debug!("[tcp] connected to {}", self.addr);
                    self.stream = Some(stream);
                    self.backoff = 1;
                }
                Err(e) => {
                    trace!("[tcp] cannot connect to {}: {e}", self.addr);
                    self.skip = self.backoff;
                    self.backoff = (self.backoff * 2).min(MAX_BACKOFF);
                    return Err(io::Error::new(io::ErrorKind::NotConnected, e));
                }
            }
        }
        self.stream
            .as_mut()
            .ok_or_else(|| io::ErrorKind::NotConnected.into())
    }
}

impl RawChannel for TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.stream()?.read(buf)?;
        if n == 0 {
            debug!("[tcp] {} closed the connection", self.addr);
            self.stream = None;
        }
        Ok(n)
    }

    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.stream()?.write(buf)
    }

    fn close(&mut self) {
        if let Some(stream) = self.stream.take() {
            let _ = stream.shutdown(std::net::Shutdown::Both);
        }
        self.closed = true;
    }

    fn reopen(&mut self) {
        self.closed = false;
        self.backoff = 1;
        self.skip = 0;
    }

    fn peer(&self) -> String {
        self.addr.to_string()
    }
}

/// Connects switches to controllers over TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

impl Connector for TcpConnector {
    fn connect(&mut self, controller: &Controller) -> Result<Box<dyn RawChannel>, TopologyError> {
        let target = format!("{}:{}", controller.address, controller.port);
        let addr = (controller.address.as_str(), controller.port)
            .to_socket_addrs()
            .map_err(|_| TopologyError::InvalidAddress(target.clone()))?
            .next()
            .ok_or(TopologyError::InvalidAddress(target))?;
        Ok(Box::new(TcpChannel::new(addr)))
    }
}

/// The controller side of a channel opened by the [`LoopbackConnector`].
#[derive(Debug)]
pub struct ControllerEnd {
    /// The controller the switch connected to.
    pub controller: ControllerId,
    /// The controller end of the pipe.
    pub channel: MemoryChannel,
}

/// Connects switches to in-memory pipes. The controller ends of all pipes are collected and can
/// be taken with [`LoopbackConnector::take_ends`], for instance to attach simulated controllers.
#[derive(Debug, Default, Clone)]
pub struct LoopbackConnector {
    ends: Arc<Mutex<Vec<ControllerEnd>>>,
}

impl LoopbackConnector {
    /// Create a new connector.
    pub fn new() -> Self {
        Self::default()
    }

    /// Take all controller ends created so far, in the order the switches connected.
    pub fn take_ends(&self) -> Vec<ControllerEnd> {
        std::mem::take(&mut *lock(&self.ends))
    }
}

impl Connector for LoopbackConnector {
    fn connect(&mut self, controller: &Controller) -> Result<Box<dyn RawChannel>, TopologyError> {
        let mut ends = lock(&self.ends);
        let (switch_end, controller_end) =
            MemoryChannel::pair(format!("{}#{}", controller.label(), ends.len()));
        ends.push(ControllerEnd {
            controller: controller.id,
            channel: controller_end,
        });
        Ok(Box::new(switch_end))
    }
}
