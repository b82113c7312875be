//! Reliable-ordered channel on top of unreliable datagrams
//!
//! Every outgoing datagram is one [`Frame`]: the highest contiguous
//! reliable sequence number received so far (the ack), every reliable
//! packet the peer has not acknowledged yet, and this tick's unreliable
//! packets. The receiver delivers reliable packets strictly in sequence
//! order, buffering anything that arrives early, and always ahead of the
//! unreliable packets carried in the same frame.

use bincode::{deserialize, serialize};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use std::collections::{BTreeMap, VecDeque};
use std::marker::PhantomData;
use std::time::{Duration, Instant};
use thiserror::Error;

/// Minimum spacing between retransmissions of unacknowledged packets.
pub const RESEND_INTERVAL: Duration = Duration::from_millis(100);
const RATE_WINDOW: Duration = Duration::from_secs(1);
/// How far past the last delivered sequence number packets are buffered.
pub const RECEIVE_WINDOW: u32 = 256;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error("malformed frame: {0}")]
    Decode(bincode::Error),
    #[error("could not encode frame: {0}")]
    Encode(bincode::Error),
}

#[derive(Debug, Serialize, Deserialize)]
struct Frame<T> {
    ack: u32,
    reliable: Vec<(u32, T)>,
    unreliable: Vec<T>,
}

/// Sliding-window byte counter used for bandwidth statistics.
#[derive(Debug)]
pub struct RateCounter {
    samples: VecDeque<(Instant, usize)>,
    window: Duration,
}

impl RateCounter {
    pub fn new(window: Duration) -> Self {
        Self {
            samples: VecDeque::new(),
            window,
        }
    }

    pub fn record(&mut self, now: Instant, bytes: usize) {
        self.samples.push_back((now, bytes));
        self.expire(now);
    }

    /// Bytes per second over the window ending at `now`.
    pub fn rate(&mut self, now: Instant) -> f32 {
        self.expire(now);
        let total: usize = self.samples.iter().map(|(_, bytes)| bytes).sum();
        total as f32 / self.window.as_secs_f32()
    }

    fn expire(&mut self, now: Instant) {
        while let Some(&(at, _)) = self.samples.front() {
            if now.duration_since(at) > self.window {
                self.samples.pop_front();
            } else {
                break;
            }
        }
    }
}

/// One end of a reliable-ordered connection.
///
/// `Out` is what this end sends and `In` what it receives, so the server
/// holds `Channel<ServerPacket, ClientPacket>` and a client the mirror type.
#[derive(Debug)]
pub struct Channel<Out, In> {
    next_seq: u32,
    unacked: VecDeque<(u32, Out)>,
    reliable_dirty: bool,
    last_reliable_sent: Option<Instant>,

    received_seq: u32,
    early: BTreeMap<u32, In>,
    ack_pending: bool,

    incoming: RateCounter,
    outgoing: RateCounter,
    _marker: PhantomData<fn(In)>,
}

impl<Out, In> Channel<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned,
{
    pub fn new() -> Self {
        Self {
            next_seq: 1,
            unacked: VecDeque::new(),
            reliable_dirty: false,
            last_reliable_sent: None,
            received_seq: 0,
            early: BTreeMap::new(),
            ack_pending: false,
            incoming: RateCounter::new(RATE_WINDOW),
            outgoing: RateCounter::new(RATE_WINDOW),
            _marker: PhantomData,
        }
    }

    /// Queues a packet that is resent until the peer acknowledges it.
    pub fn add_reliable(&mut self, packet: Out) {
        self.unacked.push_back((self.next_seq, packet));
        self.next_seq = self.next_seq.wrapping_add(1);
        self.reliable_dirty = true;
    }

    pub fn has_pending_reliable(&self) -> bool {
        !self.unacked.is_empty()
    }

    /// Feeds one datagram through the channel, returning the logical
    /// packets that became deliverable.
    pub fn process(&mut self, datagram: &[u8], now: Instant) -> Result<Vec<In>, ChannelError> {
        let frame: Frame<In> = deserialize(datagram).map_err(ChannelError::Decode)?;
        self.incoming.record(now, datagram.len());

        while let Some(&(seq, _)) = self.unacked.front() {
            if seq <= frame.ack {
                self.unacked.pop_front();
            } else {
                break;
            }
        }

        let window_end = self.received_seq.saturating_add(RECEIVE_WINDOW);
        for (seq, packet) in frame.reliable {
            self.ack_pending = true;
            if seq > self.received_seq && seq <= window_end {
                self.early.entry(seq).or_insert(packet);
            }
        }

        let mut delivered = Vec::new();
        while let Some(packet) = self.early.remove(&(self.received_seq + 1)) {
            self.received_seq += 1;
            delivered.push(packet);
        }
        delivered.extend(frame.unreliable);
        Ok(delivered)
    }

    /// Builds the datagram for this tick, or `None` when there is nothing
    /// worth sending.
    pub fn transmit(
        &mut self,
        unreliable: &[Out],
        now: Instant,
    ) -> Result<Option<Vec<u8>>, ChannelError> {
        let resend_due = self
            .last_reliable_sent
            .map_or(true, |at| now.duration_since(at) >= RESEND_INTERVAL);
        let send_reliable = !self.unacked.is_empty() && (self.reliable_dirty || resend_due);

        if !send_reliable && unreliable.is_empty() && !self.ack_pending {
            return Ok(None);
        }

        let frame = Frame {
            ack: self.received_seq,
            reliable: if send_reliable {
                self.unacked.iter().map(|(seq, p)| (*seq, p)).collect()
            } else {
                Vec::new()
            },
            unreliable: unreliable.iter().collect(),
        };
        let data = serialize(&frame).map_err(ChannelError::Encode)?;

        if send_reliable {
            self.last_reliable_sent = Some(now);
            self.reliable_dirty = false;
        }
        self.ack_pending = false;
        self.outgoing.record(now, data.len());
        Ok(Some(data))
    }

    pub fn incoming_rate(&mut self, now: Instant) -> f32 {
        self.incoming.rate(now)
    }

    pub fn outgoing_rate(&mut self, now: Instant) -> f32 {
        self.outgoing.rate(now)
    }
}

impl<Out, In> Default for Channel<Out, In>
where
    Out: Serialize,
    In: DeserializeOwned,
{
    fn default() -> Self {
        Self::new()
    }
}
