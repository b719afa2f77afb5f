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

//! Deferred I/O workers.
//!
//! A [`DeferredIoWorker`] wraps a [`RawChannel`] such that the channel is only ever read or
//! written when the [`Scheduler`](crate::scheduler::Scheduler) pumps it. Sending data only
//! enqueues it and registers a flush callback; incoming data is buffered by the [`IoLoop`] task
//! and handed to the owner of the worker (the [`ChannelHost`]) in a separate delivery callback.
//! Between these steps, the fault injector may hold, drop, or close the channel.
//!
//! Without any fault, all data sent on one worker is written in FIFO order, and all data read
//! from it is delivered in FIFO order. Data is never duplicated.

use std::{collections::VecDeque, io};

use log::{debug, error, trace, warn};
use serde::{Deserialize, Serialize};

use crate::{
    channel::RawChannel,
    scheduler::{Task, TaskStatus, Timers},
    types::{ChannelId, ControllerId, TaskError, VirtualTime},
};

/// Number of consecutive I/O errors after which a channel is reported as likely crashed.
pub const DEFAULT_ERROR_THRESHOLD: usize = 3;

/// Maximum number of reads performed on a single channel in one poll.
const MAX_READS_PER_POLL: usize = 64;

/// The owner of all deferred I/O workers. Deferred callbacks find their worker through this
/// trait, and deliver received data back to the owner.
pub trait ChannelHost: Sized + 'static {
    /// Get the worker with the given id.
    fn channel_mut(&mut self, id: ChannelId) -> Option<&mut DeferredIoWorker>;

    /// All channel ids, in ascending order.
    fn channel_ids(&self) -> Vec<ChannelId>;

    /// Called after new data was delivered into the inbox of the worker `id`.
    fn on_readable(&mut self, id: ChannelId, timers: &mut Timers<Self>) -> Result<(), TaskError>;

    /// Called after the peer of the worker `id` closed the connection.
    fn on_disconnected(&mut self, id: ChannelId, timers: &mut Timers<Self>)
        -> Result<(), TaskError>;
}

/// Result of polling a worker for readable data.
#[derive(Debug)]
pub enum Readiness {
    /// Nothing happened.
    Idle,
    /// New data was read and waits for delivery.
    Data,
    /// The peer closed the connection.
    Disconnected,
    /// Reading failed.
    Failed(TaskError),
}

/// Health of a channel, derived from the number of consecutive I/O errors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ChannelHealth {
    /// No recent errors.
    Healthy,
    /// Some consecutive errors, below the escalation threshold.
    Degraded(usize),
    /// The error threshold was reached. The controller has likely crashed.
    LikelyCrashed,
}

/// Counters of a single worker.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelStats {
    /// Number of messages completely written to the channel.
    pub messages_sent: usize,
    /// Number of bytes written to the channel.
    pub bytes_sent: usize,
    /// Number of bytes read from the channel.
    pub bytes_received: usize,
    /// Number of bytes delivered to the host.
    pub bytes_delivered: usize,
    /// Number of messages dropped by fault injection.
    pub messages_dropped: usize,
    /// Number of I/O errors.
    pub errors: usize,
}

/// Socket wrapper whose reads and writes are gated by the scheduler.
#[derive(Debug)]
pub struct DeferredIoWorker {
    id: ChannelId,
    controller: Option<ControllerId>,
    channel: Box<dyn RawChannel>,
    send_queue: VecDeque<(u64, Vec<u8>)>,
    send_offset: usize,
    next_seq: u64,
    written_seq: u64,
    recv_queue: Vec<u8>,
    inbox: Vec<u8>,
    hold_until: Option<VirtualTime>,
    flush_scheduled: bool,
    deliver_scheduled: bool,
    closed: bool,
    peer_gone: bool,
    connected_once: bool,
    consecutive_errors: usize,
    escalated: bool,
    error_threshold: usize,
    stats: ChannelStats,
}

impl DeferredIoWorker {
    /// Wrap a raw channel. The worker gets its id once it is attached to a topology.
    pub fn new(channel: Box<dyn RawChannel>) -> Self {
        Self {
            id: ChannelId(0),
            controller: None,
            channel,
            send_queue: VecDeque::new(),
            send_offset: 0,
            next_seq: 1,
            written_seq: 0,
            recv_queue: Vec::new(),
            inbox: Vec::new(),
            hold_until: None,
            flush_scheduled: false,
            deliver_scheduled: false,
            closed: false,
            peer_gone: false,
            connected_once: false,
            consecutive_errors: 0,
            escalated: false,
            error_threshold: DEFAULT_ERROR_THRESHOLD,
            stats: ChannelStats::default(),
        }
    }

    /// Change the number of consecutive errors after which the channel is escalated.
    pub fn with_error_threshold(mut self, threshold: usize) -> Self {
        self.error_threshold = threshold.max(1);
        self
    }

    /// Bind the worker to its id and its controller.
    pub(crate) fn attach(&mut self, id: ChannelId, controller: ControllerId) {
        self.id = id;
        self.controller = Some(controller);
    }

    /// Id of the worker.
    pub fn id(&self) -> ChannelId {
        self.id
    }

    /// Controller at the other end of the channel.
    pub fn controller(&self) -> Option<ControllerId> {
        self.controller
    }

    /// Description of the remote end.
    pub fn peer(&self) -> String {
        self.channel.peer()
    }

    /// Enqueue `data` for sending. The data is written in a later scheduler callback. Returns
    /// the sequence number of the message, or `None` if nothing was queued.
    pub fn send<W: ChannelHost>(&mut self, data: Vec<u8>, timers: &mut Timers<W>) -> Option<u64> {
        if data.is_empty() || self.closed {
            return None;
        }
        let seq = self.next_seq;
        self.next_seq += 1;
        self.send_queue.push_back((seq, data));
        self.schedule_flush(timers, 0);
        Some(seq)
    }

    /// Returns `true` if the message with sequence number `seq` is still waiting to be written.
    pub fn is_pending(&self, seq: u64) -> bool {
        self.send_queue.iter().any(|(s, _)| *s == seq)
    }

    /// Returns `true` if the message with sequence number `seq`, or any later message, was
    /// completely written. Messages are written in order.
    pub fn is_written_through(&self, seq: u64) -> bool {
        self.written_seq >= seq
    }

    /// Number of messages waiting to be written.
    pub fn pending_sends(&self) -> usize {
        self.send_queue.len()
    }

    /// Number of received bytes that were not yet delivered.
    pub fn pending_receives(&self) -> usize {
        self.recv_queue.len()
    }

    /// Take all data delivered so far.
    pub fn take_received(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.inbox)
    }

    /// Withhold all sends and deliveries until virtual time `until`.
    pub fn hold(&mut self, until: VirtualTime) {
        self.hold_until = Some(self.hold_until.map_or(until, |t| t.max(until)));
    }

    /// Returns `true` if the channel is held at time `now`.
    pub fn is_held(&self, now: VirtualTime) -> bool {
        self.hold_until.map(|t| now < t).unwrap_or(false)
    }

    /// Drop all queued messages that were not yet (partially) written. Returns the number of
    /// dropped messages.
    pub fn drop_pending_send(&mut self) -> usize {
        let keep = usize::from(self.send_offset > 0);
        let dropped = self.send_queue.len().saturating_sub(keep);
        self.send_queue.truncate(keep);
        self.stats.messages_dropped += dropped;
        dropped
    }

    /// Close the channel. All queued and undelivered data is discarded.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        debug!("[{}] closing channel to {}", self.id, self.peer());
        self.closed = true;
        self.channel.close();
        self.stats.messages_dropped += self.send_queue.len();
        self.send_queue.clear();
        self.send_offset = 0;
        self.recv_queue.clear();
        self.inbox.clear();
        self.hold_until = None;
    }

    /// Reopen a closed channel.
    pub fn reopen(&mut self) {
        if !self.closed {
            return;
        }
        debug!("[{}] reopening channel to {}", self.id, self.peer());
        self.closed = false;
        self.peer_gone = false;
        self.consecutive_errors = 0;
        self.escalated = false;
        self.channel.reopen();
    }

    /// Returns `true` if the channel was closed by fault injection.
    pub fn is_closed(&self) -> bool {
        self.closed
    }

    /// Health of the channel.
    pub fn health(&self) -> ChannelHealth {
        if self.escalated {
            ChannelHealth::LikelyCrashed
        } else if self.consecutive_errors > 0 {
            ChannelHealth::Degraded(self.consecutive_errors)
        } else {
            ChannelHealth::Healthy
        }
    }

    /// Counters of the worker.
    pub fn stats(&self) -> &ChannelStats {
        &self.stats
    }

    fn schedule_flush<W: ChannelHost>(&mut self, timers: &mut Timers<W>, delay: VirtualTime) {
        if self.flush_scheduled {
            return;
        }
        self.flush_scheduled = true;
        let id = self.id;
        timers.call_later(delay, format!("flush {id}"), move |world: &mut W, timers| {
            world
                .channel_mut(id)
                .ok_or(TaskError::UnknownChannel(id))?
                .flush(timers)
        });
    }

    /// Write as much of the send queue as the channel accepts.
    fn flush<W: ChannelHost>(&mut self, timers: &mut Timers<W>) -> Result<(), TaskError> {
        self.flush_scheduled = false;
        if self.closed {
            return Ok(());
        }
        let now = timers.now();
        if let Some(until) = self.hold_until {
            if now < until {
                trace!("[{}] send held until t={until}", self.id);
                self.schedule_flush(timers, until - now);
                return Ok(());
            }
            self.hold_until = None;
        }

        let mut result = Ok(());
        while let Some((seq, head)) = self.send_queue.front() {
            let (seq, len) = (*seq, head.len());
            match self.channel.write(&head[self.send_offset..]) {
                Ok(0) => break,
                Ok(n) => {
                    self.io_ok();
                    self.stats.bytes_sent += n;
                    self.send_offset += n;
                    if self.send_offset >= len {
                        self.send_queue.pop_front();
                        self.send_offset = 0;
                        self.written_seq = seq;
                        self.stats.messages_sent += 1;
                    }
                }
                Err(e) if is_not_ready(&e) => break,
                Err(e) => {
                    result = Err(self.io_error(e));
                    break;
                }
            }
        }

        if !self.send_queue.is_empty() && !self.escalated {
            self.schedule_flush(timers, 1);
        }
        result
    }

    /// Read everything the channel has to offer into the receive buffer.
    pub fn poll_readable(&mut self) -> Readiness {
        if self.closed {
            return Readiness::Idle;
        }
        let mut buf = [0u8; 4096];
        let mut got_data = false;
        for _ in 0..MAX_READS_PER_POLL {
            match self.channel.read(&mut buf) {
                Ok(0) => {
                    if self.peer_gone {
                        break;
                    }
                    self.peer_gone = true;
                    if self.connected_once {
                        self.consecutive_errors += 1;
                        self.check_escalation();
                    }
                    return Readiness::Disconnected;
                }
                Ok(n) => {
                    self.io_ok();
                    self.stats.bytes_received += n;
                    self.recv_queue.extend_from_slice(&buf[..n]);
                    got_data = true;
                }
                Err(e) if is_not_ready(&e) => break,
                Err(e) => return Readiness::Failed(self.io_error(e)),
            }
        }
        if got_data {
            Readiness::Data
        } else {
            Readiness::Idle
        }
    }

    /// Register a delivery callback for the buffered data.
    pub fn schedule_delivery<W: ChannelHost>(&mut self, timers: &mut Timers<W>) {
        if self.deliver_scheduled || self.recv_queue.is_empty() {
            return;
        }
        self.deliver_scheduled = true;
        let id = self.id;
        let now = timers.now();
        let delay = self.hold_until.map(|t| t.saturating_sub(now)).unwrap_or(0);
        timers.call_later(delay, format!("deliver {id}"), move |world: &mut W, timers| {
            let worker = world.channel_mut(id).ok_or(TaskError::UnknownChannel(id))?;
            if worker.deliver(timers) {
                world.on_readable(id, timers)
            } else {
                Ok(())
            }
        });
    }

    /// Move the buffered data into the inbox. Returns `false` if nothing was delivered.
    fn deliver<W: ChannelHost>(&mut self, timers: &mut Timers<W>) -> bool {
        self.deliver_scheduled = false;
        if self.closed || self.recv_queue.is_empty() {
            return false;
        }
        if self.is_held(timers.now()) {
            self.schedule_delivery(timers);
            return false;
        }
        self.stats.bytes_delivered += self.recv_queue.len();
        self.inbox.append(&mut self.recv_queue);
        true
    }

    fn io_ok(&mut self) {
        self.connected_once = true;
        self.peer_gone = false;
        self.consecutive_errors = 0;
    }

    fn io_error(&mut self, source: io::Error) -> TaskError {
        self.stats.errors += 1;
        if self.connected_once {
            self.consecutive_errors += 1;
            self.check_escalation();
        } else {
            debug!("[{}] not connected to {}: {source}", self.id, self.peer());
        }
        TaskError::Io {
            channel: self.id,
            source,
        }
    }

    fn check_escalation(&mut self) {
        if self.escalated || self.consecutive_errors < self.error_threshold {
            return;
        }
        self.escalated = true;
        match self.controller {
            Some(c) => error!(
                "[{}] {} consecutive errors on the channel to {c}: controller likely crashed",
                self.id, self.consecutive_errors
            ),
            None => error!(
                "[{}] {} consecutive errors on the channel to {}: peer likely crashed",
                self.id,
                self.consecutive_errors,
                self.peer()
            ),
        }
    }
}

fn is_not_ready(e: &io::Error) -> bool {
    matches!(
        e.kind(),
        io::ErrorKind::WouldBlock | io::ErrorKind::NotConnected | io::ErrorKind::Interrupted
    )
}

/// Scheduler task that pumps all workers of a [`ChannelHost`].
///
/// In the poll phase, every open worker is read without blocking. In the run phase, deliveries
/// and disconnect notifications are registered as deferred callbacks, in ascending channel
/// order.
#[derive(Debug, Default)]
pub struct IoLoop {
    ready: Vec<(ChannelId, Readiness)>,
}

impl IoLoop {
    /// Create a new I/O loop.
    pub fn new() -> Self {
        Self::default()
    }
}

impl<W: ChannelHost> Task<W> for IoLoop {
    fn name(&self) -> &str {
        "io-loop"
    }

    fn poll(&mut self, world: &mut W) -> Result<bool, TaskError> {
        self.ready.clear();
        for id in world.channel_ids() {
            if let Some(worker) = world.channel_mut(id) {
                match worker.poll_readable() {
                    Readiness::Idle if worker.pending_receives() == 0 => {}
                    Readiness::Idle => self.ready.push((id, Readiness::Data)),
                    readiness => self.ready.push((id, readiness)),
                }
            }
        }
        Ok(!self.ready.is_empty())
    }

    fn run(&mut self, world: &mut W, timers: &mut Timers<W>) -> Result<TaskStatus, TaskError> {
        let mut first_error = None;
        for (id, readiness) in self.ready.drain(..) {
            let worker = match world.channel_mut(id) {
                Some(w) => w,
                None => continue,
            };
            match readiness {
                Readiness::Idle => {}
                Readiness::Data => worker.schedule_delivery(timers),
                Readiness::Disconnected => {
                    worker.schedule_delivery(timers);
                    timers.call_later(0, format!("disconnect {id}"), move |world: &mut W, t| {
                        world.on_disconnected(id, t)
                    });
                }
                Readiness::Failed(e) => {
                    if first_error.is_none() {
                        first_error = Some(e);
                    } else {
                        warn!("[{id}] {e}");
                    }
                }
            }
        }
        match first_error {
            Some(e) => Err(e),
            None => Ok(TaskStatus::Continue),
        }
    }
}
