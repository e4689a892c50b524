use std::collections::BTreeMap;
use std::time::Instant;

use tracing::{debug, trace};

use crate::delivery::{Delivery, DeliveryState, Direction};
use crate::error::{condition, LinkError, LinkResult};
use crate::frame::DeliveryTag;

/// All deliveries of a single link that are not yet removed, ordered by tag.
///
/// Tags are monotonic per link, so tag order is initiation order. The table keeps a watermark
///  of the next tag: a tag below the watermark that is no longer in the table belonged to a
///  delivery that was settled and removed, unless the peer skipped it. Skipped tags are kept
///  as ranges, which stay empty for peers that number their deliveries consecutively.
#[derive(Debug, Default)]
pub struct DeliveryTable {
    deliveries: BTreeMap<DeliveryTag, Delivery>,
    watermark: DeliveryTag,
    /// the last possible tag was used, so no tag is above the watermark any more
    exhausted: bool,
    /// tags the peer skipped, as `start -> end` (exclusive)
    skipped: BTreeMap<DeliveryTag, DeliveryTag>,
}

impl DeliveryTable {
    pub fn new() -> DeliveryTable {
        DeliveryTable::default()
    }

    pub fn len(&self) -> usize {
        self.deliveries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.deliveries.is_empty()
    }

    /// Creates a new outgoing delivery with the next tag
    pub fn allocate(&mut self, now: Instant) -> LinkResult<DeliveryTag> {
        if self.exhausted {
            return Err(LinkError::InvalidState("all delivery tags of this link are used".to_string()));
        }

        let tag = self.watermark;
        self.advance_watermark(tag);
        self.deliveries.insert(tag, Delivery::new(tag, Direction::Outgoing, now));
        trace!("allocated outgoing delivery {}", tag);
        Ok(tag)
    }

    /// Creates the incoming delivery for a first transfer. The tag must be higher than every tag
    ///  seen before on this link.
    pub fn insert_incoming(&mut self, tag: DeliveryTag, now: Instant) -> LinkResult<&mut Delivery> {
        if self.exhausted || tag < self.watermark {
            debug!("incoming delivery tag {} is below the watermark {}", tag, self.watermark);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }

        if tag > self.watermark {
            trace!("peer skipped delivery tags {}..{}", self.watermark, tag);
            self.skipped.insert(self.watermark, tag);
        }
        self.advance_watermark(tag);
        Ok(self.deliveries.entry(tag)
            .or_insert_with(|| Delivery::new(tag, Direction::Incoming, now)))
    }

    fn advance_watermark(&mut self, used: DeliveryTag) {
        match used.checked_next() {
            Some(next) => self.watermark = next,
            None => {
                self.watermark = used;
                self.exhausted = true;
            }
        }
    }

    /// true iff the tag belonged to a delivery of this link at some point
    fn was_used(&self, tag: DeliveryTag) -> bool {
        if !self.exhausted && tag >= self.watermark {
            return false;
        }
        !self.skipped.range(..=tag)
            .next_back()
            .is_some_and(|(_, end)| tag < *end)
    }

    pub fn get(&self, tag: DeliveryTag) -> Option<&Delivery> {
        self.deliveries.get(&tag)
    }

    pub fn get_mut(&mut self, tag: DeliveryTag) -> Option<&mut Delivery> {
        self.deliveries.get_mut(&tag)
    }

    /// looks up a delivery that the application refers to, failing for unknown tags
    pub fn require_mut(&mut self, tag: DeliveryTag) -> LinkResult<&mut Delivery> {
        let was_used = self.was_used(tag);
        match self.deliveries.get_mut(&tag) {
            Some(d) => Ok(d),
            None if was_used => Err(LinkError::InvalidState(format!("delivery {} is settled", tag))),
            None => Err(LinkError::InvalidArgument(format!("unknown delivery {}", tag))),
        }
    }

    /// The state of a delivery, or `None` if the tag was never seen on this link
    pub fn state_of(&self, tag: DeliveryTag) -> Option<DeliveryState> {
        match self.deliveries.get(&tag) {
            Some(d) => Some(d.state()),
            None if self.was_used(tag) => Some(DeliveryState::Settled),
            None => None,
        }
    }

    pub fn remove(&mut self, tag: DeliveryTag) -> Option<Delivery> {
        self.deliveries.remove(&tag)
    }

    /// Removes all deliveries the local side settled, returning how many were removed
    pub fn purge_settled(&mut self) -> usize {
        let before = self.deliveries.len();
        self.deliveries.retain(|_, d| !d.local_settled());
        before - self.deliveries.len()
    }

    /// Destroys all deliveries, e.g. when the link detaches. The watermark is kept.
    pub fn clear(&mut self) -> usize {
        let num_destroyed = self.deliveries.len();
        self.deliveries.clear();
        num_destroyed
    }

    /// tags of all deliveries the local side has not settled, in initiation order
    pub fn unsettled(&self) -> impl Iterator<Item = DeliveryTag> + '_ {
        self.deliveries.values()
            .filter(|d| !d.local_settled())
            .map(|d| d.tag())
    }

    pub fn partials(&self) -> impl Iterator<Item = &Delivery> + '_ {
        self.deliveries.values()
            .filter(|d| d.state() == DeliveryState::Partial)
    }
}
