use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace};

use crate::delivery::{DeliveryState, Direction, Received};
use crate::error::{condition, LinkError, LinkResult};
use crate::frame::{DeliveryTag, Disposition, Outcome, Role, Transfer};
use crate::link::{Endpoint, Link};
use crate::mux::LinkEvent;

/// Receiver operations and the incoming delivery state machine
impl Link {
    pub(crate) fn flow(&mut self, credits: i32) -> LinkResult<()> {
        if credits < 0 {
            return Err(LinkError::InvalidArgument(format!("credit must not be negative: {}", credits)));
        }
        self.check_attached()?;
        self.flow.grant(credits as u32);
        Ok(())
    }

    /// The number of deliveries the peer sender said it has ready
    pub fn available(&self) -> Option<u32> {
        self.flow.peer_available()
    }

    pub fn current(&self) -> Option<DeliveryTag> {
        match &self.endpoint {
            Endpoint::Receiver { current, .. } => *current,
            Endpoint::Sender { .. } => None,
        }
    }

    /// Hands out the earliest delivery that arrived and was not handed out before, and makes
    ///  it the current delivery for `recv`
    pub(crate) fn next_delivery(&mut self) -> LinkResult<Option<DeliveryTag>> {
        self.check_active()?;

        let Endpoint::Receiver { ready, current, .. } = &mut self.endpoint else {
            return Err(LinkError::InvalidState(format!("link {} is not a receiver", self.name)));
        };
        while let Some(tag) = ready.pop_front() {
            if self.deliveries.get(tag).is_some_and(|d| d.state() != DeliveryState::Settled) {
                *current = Some(tag);
                return Ok(Some(tag));
            }
        }
        Ok(None)
    }

    /// Reads body bytes of the current delivery into `dst[offset..offset+size]`
    pub(crate) fn recv(&mut self, dst: &mut [u8], offset: usize, size: usize) -> LinkResult<Received> {
        let end = offset.checked_add(size)
            .filter(|end| *end <= dst.len())
            .ok_or_else(|| LinkError::InvalidArgument(format!("range {}+{} exceeds the buffer length {}", offset, size, dst.len())))?;
        self.check_active()?;

        let tag = self.current()
            .ok_or_else(|| LinkError::InvalidState(format!("link {} has no current delivery", self.name)))?;
        Ok(match self.deliveries.get_mut(tag) {
            Some(delivery) => delivery.read(&mut dst[offset..end]),
            None => Received::End,
        })
    }

    /// Appends all currently buffered body bytes of a delivery to `dst`. Returns true iff more
    ///  bytes are buffered or may still arrive.
    pub(crate) fn recv_delivery(&mut self, tag: DeliveryTag, dst: &mut Vec<u8>) -> LinkResult<bool> {
        self.check_active()?;

        if self.deliveries.state_of(tag).is_none() {
            return Err(LinkError::InvalidArgument(format!("unknown delivery {}", tag)));
        }
        let Some(delivery) = self.deliveries.get_mut(tag) else {
            // settled and removed
            return Ok(false);
        };

        let start = dst.len();
        dst.resize(start + delivery.buffered_len(), 0);
        let n = match delivery.read(&mut dst[start..]) {
            Received::Bytes(n) => n,
            Received::End => 0,
        };
        dst.truncate(start + n);
        Ok(delivery.has_remaining())
    }

    /// Records an outcome for a delivery without settling it, and tells the peer
    pub(crate) fn disposition(&mut self, tag: DeliveryTag, outcome: Outcome) -> LinkResult<()> {
        self.check_active()?;

        let delivery = self.deliveries.require_mut(tag)?;
        if delivery.state() == DeliveryState::Settled {
            return Err(LinkError::InvalidState(format!("delivery {} is settled", tag)));
        }
        delivery.set_local_outcome(outcome);

        self.outbound.dispositions.push_back(Disposition {
            handle: self.handle,
            role: self.role,
            delivery_tag: tag,
            settled: false,
            outcome: Some(outcome),
        });
        Ok(())
    }

    pub(super) fn on_transfer(&mut self, transfer: Transfer, now: Instant, events: &mut VecDeque<LinkEvent>) -> LinkResult<()> {
        if self.role != Role::Receiver {
            debug!("link {}: transfer received on a sending link", self.name);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }

        let tag = transfer.delivery_tag;
        if self.skip_expired(&transfer) {
            return Ok(());
        }

        match self.deliveries.state_of(tag) {
            None => {
                if transfer.aborted {
                    trace!("link {}: ignoring abort of delivery {} that never started", self.name, tag);
                    return Ok(());
                }

                self.flow.on_incoming_delivery()?;
                if self.deliveries.partials().any(|d| d.direction() == Direction::Incoming) {
                    debug!("link {}: delivery {} started while another delivery is still partial", self.name, tag);
                    return Err(LinkError::protocol(condition::ILLEGAL_STATE));
                }

                let delivery = self.deliveries.insert_incoming(tag, now)?;
                delivery.append(transfer.payload, transfer.more, now)?;
                if transfer.settled {
                    delivery.on_remote_disposition(None, true);
                }

                trace!("link {}: delivery {} arrived", self.name, tag);
                if let Endpoint::Receiver { ready, expired, .. } = &mut self.endpoint {
                    ready.push_back(tag);
                    // the peer moved on without finishing the expired delivery
                    *expired = None;
                }
                events.push_back(LinkEvent::DeliveryArrived { handle: self.handle, tag });
            }
            Some(DeliveryState::Partial) => {
                let delivery = self.deliveries.require_mut(tag)?;
                if transfer.aborted {
                    debug!("link {}: peer aborted delivery {}", self.name, tag);
                    delivery.abort()?;
                }
                else {
                    delivery.append(transfer.payload, transfer.more, now)?;
                }
                if transfer.settled {
                    delivery.on_remote_disposition(None, true);
                }
                events.push_back(LinkEvent::DeliveryUpdated { handle: self.handle, tag });
            }
            Some(state) => {
                debug!("link {}: transfer for delivery {} which is {:?}", self.name, tag, state);
                return Err(LinkError::protocol(condition::ILLEGAL_STATE));
            }
        }
        Ok(())
    }

    /// Drops a transfer that continues a delivery this side aborted for inactivity. The peer
    ///  does not know about the abort, so the rest of the delivery is not a protocol violation.
    fn skip_expired(&mut self, transfer: &Transfer) -> bool {
        let Endpoint::Receiver { expired, .. } = &mut self.endpoint else {
            return false;
        };
        if *expired != Some(transfer.delivery_tag) {
            return false;
        }

        trace!("link {}: dropping transfer for expired delivery {}", self.name, transfer.delivery_tag);
        if !transfer.more || transfer.aborted {
            *expired = None;
        }
        true
    }
}
