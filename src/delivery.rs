//! Deliveries: identity, state and body bytes of a single message exchange on a link.
//!
//! An incoming delivery moves through these states:
//!
//! ```ascii
//!   (none) --transfer[first]--> partial
//!   partial --transfer[more=true]--> partial
//!   partial --transfer[more=false]--> complete
//!   partial --transfer[aborted=true]--> aborted
//!   complete|aborted --settle--> settled --> (removed at the next quiescent point)
//! ```
//!
//! A delivery is removed once the local side settled it. For an outgoing delivery, a settled
//!  disposition from the peer also moves it to `settled`, but the application still releases
//!  it through `settle()` after looking at the peer's outcome.
//!
//! Outgoing deliveries follow the same states, driven by `send()` / `abort()` instead of
//!  transfer frames.

pub mod delivery_buffer;
pub mod delivery_table;

use std::time::Instant;

use bytes::Bytes;
use tracing::trace;

use crate::delivery::delivery_buffer::DeliveryBuffer;
use crate::error::{LinkError, LinkResult};
use crate::frame::{DeliveryTag, Outcome};

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Direction {
    Incoming,
    Outgoing,
}

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum DeliveryState {
    /// more body fragments may follow
    Partial,
    /// the last fragment was seen, buffered bytes may still be unread
    Complete,
    /// the sender cancelled the delivery, all body bytes are discarded
    Aborted,
    /// terminal: settled by the local application, or an outgoing delivery settled by the peer
    Settled,
}

/// Result of a streaming read
#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum Received {
    /// this many bytes were written; zero means 'nothing available right now'
    Bytes(usize),
    /// no more bytes will ever be available for this delivery
    End,
}
impl Received {
    pub const END_RAW: isize = -1;

    /// the classic integer shape: number of bytes, or -1 for the end of the delivery
    pub fn as_raw(&self) -> isize {
        match self {
            Received::Bytes(n) => *n as isize,
            Received::End => Self::END_RAW,
        }
    }
}

#[derive(Debug)]
pub struct Delivery {
    tag: DeliveryTag,
    direction: Direction,
    state: DeliveryState,
    buffer: DeliveryBuffer,
    local_outcome: Option<Outcome>,
    remote_outcome: Option<Outcome>,
    remote_settled: bool,
    local_settled: bool,
    last_activity: Instant,
    /// Outgoing only: the delivery consumed credit and its transfers are handed to the link.
    ///  Before that, its fragments wait in `buffer`.
    started: bool,
}

impl Delivery {
    pub fn new(tag: DeliveryTag, direction: Direction, now: Instant) -> Delivery {
        Delivery {
            tag,
            direction,
            state: DeliveryState::Partial,
            buffer: DeliveryBuffer::new(),
            local_outcome: None,
            remote_outcome: None,
            remote_settled: false,
            local_settled: false,
            last_activity: now,
            started: false,
        }
    }

    pub fn tag(&self) -> DeliveryTag {
        self.tag
    }

    pub fn direction(&self) -> Direction {
        self.direction
    }

    pub fn state(&self) -> DeliveryState {
        self.state
    }

    pub fn local_outcome(&self) -> Option<Outcome> {
        self.local_outcome
    }

    pub fn remote_outcome(&self) -> Option<Outcome> {
        self.remote_outcome
    }

    pub fn remote_settled(&self) -> bool {
        self.remote_settled
    }

    /// true once the local application settled the delivery, which makes it eligible for removal
    pub fn local_settled(&self) -> bool {
        self.local_settled
    }

    pub fn last_activity(&self) -> Instant {
        self.last_activity
    }

    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    pub fn consumed_len(&self) -> usize {
        self.buffer.consumed()
    }

    pub fn is_started(&self) -> bool {
        self.started
    }

    pub(crate) fn mark_started(&mut self) {
        self.started = true;
    }

    pub(crate) fn buffer_mut(&mut self) -> &mut DeliveryBuffer {
        &mut self.buffer
    }

    /// Appends the next body fragment. A fragment with `more == false` completes the delivery.
    pub fn append(&mut self, fragment: Bytes, more: bool, now: Instant) -> LinkResult<()> {
        if self.state != DeliveryState::Partial {
            return Err(LinkError::InvalidState(format!("delivery {} is {:?}, no more body bytes can be added", self.tag, self.state)));
        }

        trace!("delivery {}: appending {} bytes, more={}", self.tag, fragment.len(), more);
        self.buffer.push(fragment);
        if !more {
            self.state = DeliveryState::Complete;
        }
        self.last_activity = now;
        Ok(())
    }

    /// Cancels a partial delivery, discarding all buffered body bytes
    pub fn abort(&mut self) -> LinkResult<()> {
        if self.state != DeliveryState::Partial {
            return Err(LinkError::InvalidState(format!("delivery {} is {:?} and can not be aborted", self.tag, self.state)));
        }

        let discarded = self.buffer.clear();
        trace!("delivery {}: aborted, discarding {} buffered bytes", self.tag, discarded);
        self.state = DeliveryState::Aborted;
        Ok(())
    }

    /// Settles a complete or aborted delivery locally. A delivery the peer settled already is
    ///  `Settled` but still needs this to be released.
    pub fn settle(&mut self) -> LinkResult<()> {
        if self.local_settled {
            return Err(LinkError::InvalidState(format!("delivery {} is already settled", self.tag)));
        }
        if self.state == DeliveryState::Partial {
            return Err(LinkError::InvalidState(format!("delivery {} is still partial and can not be settled", self.tag)));
        }

        self.buffer.clear();
        self.state = DeliveryState::Settled;
        self.local_settled = true;
        Ok(())
    }

    pub fn set_local_outcome(&mut self, outcome: Outcome) {
        self.local_outcome = Some(outcome);
    }

    /// Records the peer's disposition. A settled disposition for an outgoing delivery that has
    ///  all its body makes it `Settled`. Incoming deliveries the peer settled (i.e. sent
    ///  pre-settled) stay readable until the application settles them.
    pub fn on_remote_disposition(&mut self, outcome: Option<Outcome>, settled: bool) {
        if outcome.is_some() {
            self.remote_outcome = outcome;
        }
        if settled {
            self.remote_settled = true;
            if self.direction == Direction::Outgoing && matches!(self.state, DeliveryState::Complete | DeliveryState::Aborted) {
                self.buffer.clear();
                self.state = DeliveryState::Settled;
            }
        }
    }

    /// Reads the next body bytes. Never returns `End` while the delivery is partial, and always
    ///  returns `End` once it was aborted.
    pub fn read(&mut self, dst: &mut [u8]) -> Received {
        match self.state {
            DeliveryState::Aborted | DeliveryState::Settled => Received::End,
            DeliveryState::Complete if self.buffer.is_empty() => Received::End,
            DeliveryState::Complete | DeliveryState::Partial => Received::Bytes(self.buffer.read(dst)),
        }
    }

    /// true iff body bytes are buffered or may still arrive
    pub fn has_remaining(&self) -> bool {
        match self.state {
            DeliveryState::Partial => true,
            DeliveryState::Complete => !self.buffer.is_empty(),
            DeliveryState::Aborted | DeliveryState::Settled => false,
        }
    }
}
