use tracing::{debug, trace};

use crate::config::OfferMode;
use crate::error::{condition, LinkError, LinkResult};
use crate::frame::{Flow, Handle, Role};

/// Credit bookkeeping of a single link, and the decision *when* a flow frame goes out.
///
/// Flow updates are coalesced: changes only set a 'pending' flag, and the frame is built from
///  the state at the time the link is polled. So several `flow()` calls in one drain cycle
///  produce a single frame carrying the latest snapshot.
#[derive(Debug)]
pub struct FlowController {
    role: Role,
    /// receiver: deliveries the peer may still start; sender: deliveries we may still start
    credit: u32,
    /// number of deliveries started on this link, wrapping
    delivery_count: u32,
    /// the delivery count announced in our attach, relevant for a peer flow without one
    initial_delivery_count: u32,

    offer_mode: OfferMode,
    offered: u32,
    advertised: Option<u32>,
    /// last `available` the peer sender advertised
    peer_available: Option<u32>,

    credit_window: Option<u32>,
    /// credit dropped to zero through incoming deliveries since the last grant
    exhausted: bool,

    flow_pending: bool,
    echo_pending: bool,
}

impl FlowController {
    pub fn new(role: Role, offer_mode: OfferMode, credit_window: Option<u32>) -> FlowController {
        FlowController {
            role,
            credit: 0,
            delivery_count: 0,
            initial_delivery_count: 0,
            offer_mode,
            offered: 0,
            advertised: None,
            peer_available: None,
            credit_window,
            exhausted: false,
            flow_pending: false,
            echo_pending: false,
        }
    }

    pub fn credit(&self) -> u32 {
        self.credit
    }

    pub fn delivery_count(&self) -> u32 {
        self.delivery_count
    }

    pub fn offered(&self) -> u32 {
        self.offered
    }

    pub fn peer_available(&self) -> Option<u32> {
        self.peer_available
    }

    /// A receiver continues counting where the peer sender's attach says it starts
    pub fn set_delivery_count(&mut self, delivery_count: u32) {
        self.delivery_count = delivery_count;
        self.initial_delivery_count = delivery_count;
    }

    /// receiver: adds credit. Zero is legal and changes nothing.
    pub fn grant(&mut self, credits: u32) {
        if credits == 0 {
            return;
        }
        self.credit = self.credit.saturating_add(credits);
        self.exhausted = false;
        self.flow_pending = true;
        debug!("granted {} credits, credit is now {}", credits, self.credit);
    }

    /// receiver: a new incoming delivery starts and consumes one credit
    pub fn on_incoming_delivery(&mut self) -> LinkResult<()> {
        if self.credit == 0 {
            debug!("peer started a delivery without credit");
            return Err(LinkError::protocol(condition::TRANSFER_LIMIT_EXCEEDED));
        }
        self.credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        if self.credit == 0 {
            self.exhausted = true;
        }
        Ok(())
    }

    /// receiver: the application settled a delivery. With a credit window configured, exhausted
    ///  credit is topped up again.
    pub fn on_delivery_settled(&mut self) {
        if let Some(window) = self.credit_window {
            if self.exhausted && self.credit == 0 {
                trace!("credit exhausted and a delivery was consumed - topping up to {}", window);
                self.credit = window;
                self.exhausted = false;
                self.flow_pending = true;
            }
        }
    }

    /// sender: declares the number of deliveries ready for transmission
    pub fn offer(&mut self, n: u32) {
        self.offered = match self.offer_mode {
            OfferMode::Absolute => n,
            OfferMode::Cumulative => self.offered.saturating_add(n),
        };
        if self.advertised != Some(self.offered) {
            self.flow_pending = true;
        }
    }

    /// sender: consumes one credit for a new delivery if there is any
    pub fn try_start_delivery(&mut self) -> bool {
        if self.credit == 0 {
            return false;
        }
        self.credit -= 1;
        self.delivery_count = self.delivery_count.wrapping_add(1);
        true
    }

    /// Applies the peer's flow state. Returns true if a sender's credit went up.
    pub fn on_peer_flow(&mut self, flow: &Flow) -> bool {
        if flow.echo {
            self.echo_pending = true;
            self.flow_pending = true;
        }

        match self.role {
            Role::Sender => {
                let peer_delivery_count = flow.delivery_count.unwrap_or(self.initial_delivery_count);
                let limit = peer_delivery_count.wrapping_add(flow.link_credit);
                // serial number arithmetic: a 'negative' distance means the peer is behind us
                let distance = limit.wrapping_sub(self.delivery_count) as i32;
                let new_credit = distance.max(0) as u32;

                let increased = new_credit > self.credit;
                trace!("peer flow: delivery count {}, link credit {} - credit {} -> {}", peer_delivery_count, flow.link_credit, self.credit, new_credit);
                self.credit = new_credit;
                increased
            }
            Role::Receiver => {
                if flow.available.is_some() {
                    self.peer_available = flow.available;
                }
                false
            }
        }
    }

    pub fn has_pending_flow(&self) -> bool {
        match self.role {
            Role::Receiver => self.flow_pending,
            Role::Sender => self.echo_pending || (self.flow_pending && self.advertised != Some(self.offered)),
        }
    }

    /// Builds the coalesced flow frame if one is due, resetting the pending state
    pub fn take_flow(&mut self, handle: Handle) -> Option<Flow> {
        if !self.has_pending_flow() {
            self.flow_pending = false;
            return None;
        }
        let echo_reply = self.echo_pending;
        self.flow_pending = false;
        self.echo_pending = false;

        let available = match self.role {
            Role::Sender => {
                self.advertised = Some(self.offered);
                Some(self.offered)
            }
            Role::Receiver => None,
        };

        trace!("flow for link {}: delivery count {}, credit {}, available {:?}, echo reply {}", handle, self.delivery_count, self.credit, available, echo_reply);
        Some(Flow {
            handle,
            delivery_count: Some(self.delivery_count),
            link_credit: self.credit,
            available,
            echo: false,
        })
    }

    /// discards pending flow state, e.g. when the link terminates
    pub fn clear_pending(&mut self) {
        self.flow_pending = false;
        self.echo_pending = false;
    }
}
