use std::time::Instant;

use bytes::{Bytes, BytesMut};
use tracing::{debug, trace};

use crate::delivery::{DeliveryState, Direction};
use crate::error::{LinkError, LinkResult};
use crate::frame::{DeliveryTag, Outcome, Transfer};
use crate::link::{Endpoint, Link};

/// Sender operations. A delivery consumes one credit when its first fragment goes out. Without
///  credit, or while an earlier delivery is still partial, it waits in the blocked queue, and
///  blocked deliveries start in order once both conditions clear.
impl Link {
    pub(crate) fn new_delivery(&mut self, now: Instant) -> LinkResult<DeliveryTag> {
        self.check_attached()?;
        self.deliveries.allocate(now)
    }

    pub(crate) fn offer(&mut self, n: i32) -> LinkResult<()> {
        if n < 0 {
            return Err(LinkError::InvalidArgument(format!("offer must not be negative: {}", n)));
        }
        self.check_attached()?;
        self.flow.offer(n as u32);
        Ok(())
    }

    pub fn offered(&self) -> u32 {
        self.flow.offered()
    }

    pub(crate) fn send(&mut self, tag: DeliveryTag, bytes: Bytes, more: bool, now: Instant) -> LinkResult<()> {
        self.check_attached()?;

        let delivery = self.deliveries.require_mut(tag)?;
        delivery.append(bytes, more, now)?;

        if delivery.is_started() {
            self.frame_outgoing(tag);
            if !more {
                self.start_blocked();
            }
            return Ok(());
        }
        if self.is_blocked(tag) {
            trace!("link {}: delivery {} is still waiting to start, buffering", self.name, tag);
            return Ok(());
        }

        let must_wait = self.num_blocked() > 0 || self.open_delivery().is_some();
        if !must_wait && self.flow.try_start_delivery() {
            self.frame_outgoing(tag);
            return Ok(());
        }

        if let Endpoint::Sender { blocked } = &mut self.endpoint {
            blocked.push_back(tag);
        }
        if self.flow.credit() == 0 {
            debug!("link {}: no credit for delivery {} - queueing it", self.name, tag);
            Err(LinkError::NoCredit)
        }
        else {
            debug!("link {}: delivery {} queued behind earlier deliveries", self.name, tag);
            Ok(())
        }
    }

    pub(crate) fn abort(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.check_active()?;
        self.abort_outgoing(tag)
    }

    /// A started delivery gets an abort transfer after the transfers that are already queued. A
    ///  delivery that never started disappears without a trace on the wire.
    pub(super) fn abort_outgoing(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        let delivery = self.deliveries.require_mut(tag)?;
        let started = delivery.is_started();
        delivery.abort()?;

        if started {
            debug!("link {}: aborting delivery {}", self.name, tag);
            self.outbound.transfers.push_back(Transfer {
                handle: self.handle,
                delivery_tag: tag,
                more: false,
                aborted: true,
                settled: false,
                payload: Bytes::new(),
            });
        }
        else {
            debug!("link {}: dropping delivery {} that never started", self.name, tag);
            if let Endpoint::Sender { blocked } = &mut self.endpoint {
                blocked.retain(|t| *t != tag);
            }
            self.deliveries.remove(tag);
        }
        self.start_blocked();
        Ok(())
    }

    pub fn remote_outcome(&self, tag: DeliveryTag) -> LinkResult<Option<Outcome>> {
        self.deliveries.get(tag)
            .map(|d| d.remote_outcome())
            .ok_or_else(|| LinkError::InvalidArgument(format!("unknown delivery {}", tag)))
    }

    pub fn remote_settled(&self, tag: DeliveryTag) -> LinkResult<bool> {
        match self.deliveries.get(tag) {
            Some(d) => Ok(d.remote_settled()),
            None if self.deliveries.state_of(tag).is_some() => Ok(true),
            None => Err(LinkError::InvalidArgument(format!("unknown delivery {}", tag))),
        }
    }

    /// number of deliveries waiting for credit
    pub fn num_blocked(&self) -> usize {
        match &self.endpoint {
            Endpoint::Sender { blocked } => blocked.len(),
            Endpoint::Receiver { .. } => 0,
        }
    }

    fn is_blocked(&self, tag: DeliveryTag) -> bool {
        match &self.endpoint {
            Endpoint::Sender { blocked } => blocked.contains(&tag),
            Endpoint::Receiver { .. } => false,
        }
    }

    /// The started outgoing delivery that still waits for fragments. Transfers of other
    ///  deliveries must not go out before it is complete or aborted.
    fn open_delivery(&self) -> Option<DeliveryTag> {
        self.deliveries.partials()
            .find(|d| d.direction() == Direction::Outgoing && d.is_started())
            .map(|d| d.tag())
    }

    /// Starts blocked deliveries in order while there is credit. A delivery that is still
    ///  partial after starting keeps the ones behind it waiting.
    pub(super) fn start_blocked(&mut self) {
        loop {
            if let Some(open) = self.open_delivery() {
                trace!("link {}: delivery {} is still open, later deliveries wait", self.name, open);
                return;
            }
            let Endpoint::Sender { blocked } = &mut self.endpoint else {
                return;
            };
            let Some(&tag) = blocked.front() else {
                return;
            };
            if !self.flow.try_start_delivery() {
                return;
            }
            blocked.pop_front();

            debug!("link {}: credit arrived, starting delivery {}", self.name, tag);
            self.frame_outgoing(tag);
        }
    }

    /// Moves the buffered body bytes of a started delivery into transfers. Bytes are appended
    ///  to the last queued transfer of the same delivery while it has room; the first transfer
    ///  of a delivery is queued even if its body is empty.
    fn frame_outgoing(&mut self, tag: DeliveryTag) {
        let max_payload = self.config.max_frame_payload;
        let handle = self.handle;

        let Some(delivery) = self.deliveries.get_mut(tag) else {
            return;
        };
        let complete = delivery.state() == DeliveryState::Complete;
        let mut first = !delivery.is_started();
        delivery.mark_started();
        let buffer = delivery.buffer_mut();
        let transfers = &mut self.outbound.transfers;

        if !first {
            if let Some(open) = transfers.back_mut().filter(|t| t.delivery_tag == tag && t.more && !t.aborted) {
                let chunk = buffer.take_chunk(max_payload.saturating_sub(open.payload.len()));
                if !chunk.is_empty() {
                    let mut merged = BytesMut::with_capacity(open.payload.len() + chunk.len());
                    merged.extend_from_slice(&open.payload);
                    merged.extend_from_slice(&chunk);
                    open.payload = merged.freeze();
                }
                if complete && buffer.is_empty() {
                    open.more = false;
                    return;
                }
            }
        }

        loop {
            let payload = buffer.take_chunk(max_payload);
            let more = !(complete && buffer.is_empty());
            if payload.is_empty() && more && !first {
                break;
            }

            trace!("link {}: queueing transfer for delivery {} with {} bytes, more={}", self.name, tag, payload.len(), more);
            transfers.push_back(Transfer {
                handle,
                delivery_tag: tag,
                more,
                aborted: false,
                settled: false,
                payload,
            });
            first = false;

            if buffer.is_empty() {
                break;
            }
        }
    }
}
