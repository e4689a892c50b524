//! A link is a unidirectional message pipe between two peers, one side sending and the other
//!  receiving. Both roles share the state in [Link]; the role-specific operations live in the
//!  `sender` and `receiver` submodules.
//!
//! Link lifecycle:
//!
//! ```ascii
//!   detached --attach (local or peer)--> attached
//!   attached --local detach--> detaching --peer detach--> detached
//!   attached --peer detach--> detached (terminated, operations fail with `Detached`)
//!   attached --protocol error--> detached (terminated, waiting for the peer's detach)
//! ```
//!
//! A link never talks to the mux directly: inbound frames are pushed in through `on_frame`,
//!  outbound frames are pulled out through `poll_frame`, and events go to a queue the caller
//!  passes in.

pub mod receiver;
pub mod sender;

use std::collections::VecDeque;
use std::time::Instant;

use tracing::{debug, trace, warn};

use crate::clock::IdleTimer;
use crate::config::EffectiveLinkConfig;
use crate::delivery::delivery_table::DeliveryTable;
use crate::delivery::{DeliveryState, Direction};
use crate::error::{condition, LinkError, LinkResult};
use crate::flow_controller::FlowController;
use crate::frame::{Attach, DeliveryTag, Detach, Disposition, Frame, Handle, Role, Transfer};
use crate::mux::LinkEvent;

#[derive(Debug, Copy, Clone, Eq, PartialEq)]
pub enum LinkState {
    Detached,
    Attached,
    /// detach was requested locally, waiting for the peer's detach
    Detaching,
}

/// the role specific part of a link's state
#[derive(Debug)]
enum Endpoint {
    Sender {
        /// deliveries waiting for credit or for an earlier partial delivery, in tag order
        blocked: VecDeque<DeliveryTag>,
    },
    Receiver {
        /// deliveries that arrived but were not yet handed out by `next()`
        ready: VecDeque<DeliveryTag>,
        current: Option<DeliveryTag>,
        /// a partial delivery that was aborted locally for inactivity, while the peer may still
        ///  be sending it
        expired: Option<DeliveryTag>,
    },
}

impl Endpoint {
    fn for_role(role: Role) -> Endpoint {
        match role {
            Role::Sender => Endpoint::Sender { blocked: VecDeque::new() },
            Role::Receiver => Endpoint::Receiver { ready: VecDeque::new(), current: None, expired: None },
        }
    }
}

/// frames waiting to be polled, by kind
#[derive(Debug, Default)]
struct Outbound {
    attach: bool,
    dispositions: VecDeque<Disposition>,
    transfers: VecDeque<Transfer>,
    detach: Option<Detach>,
}

#[derive(Debug)]
pub struct Link {
    name: String,
    role: Role,
    handle: Handle,
    remote_handle: Option<Handle>,
    state: LinkState,
    config: EffectiveLinkConfig,
    flow: FlowController,
    deliveries: DeliveryTable,
    endpoint: Endpoint,
    outbound: Outbound,

    attach_sent: bool,
    remote_attached: bool,
    /// the peer detached the link, or a protocol error did
    terminated: bool,
    /// this side detached with an error, and frames the peer sent before seeing that are dropped
    awaiting_remote_detach: bool,
    local_condition: Option<String>,
    remote_condition: Option<String>,
}

impl Link {
    pub fn new(name: String, role: Role, handle: Handle, config: EffectiveLinkConfig) -> Link {
        let flow = FlowController::new(role, config.offer_mode, config.credit_window);
        Link {
            name,
            role,
            handle,
            remote_handle: None,
            state: LinkState::Detached,
            config,
            flow,
            deliveries: DeliveryTable::new(),
            endpoint: Endpoint::for_role(role),
            outbound: Outbound::default(),
            attach_sent: false,
            remote_attached: false,
            terminated: false,
            awaiting_remote_detach: false,
            local_condition: None,
            remote_condition: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn role(&self) -> Role {
        self.role
    }

    pub fn handle(&self) -> Handle {
        self.handle
    }

    pub fn remote_handle(&self) -> Option<Handle> {
        self.remote_handle
    }

    pub fn state(&self) -> LinkState {
        self.state
    }

    pub fn credit(&self) -> u32 {
        self.flow.credit()
    }

    pub fn delivery_count(&self) -> u32 {
        self.flow.delivery_count()
    }

    pub fn is_remote_attached(&self) -> bool {
        self.remote_attached
    }

    /// the condition the peer detached this link with
    pub fn remote_condition(&self) -> Option<&str> {
        self.remote_condition.as_deref()
    }

    /// the condition this side detached the link with after a protocol error
    pub fn local_condition(&self) -> Option<&str> {
        self.local_condition.as_deref()
    }

    pub fn num_deliveries(&self) -> usize {
        self.deliveries.len()
    }

    /// The state of a delivery. Deliveries that were settled and removed report `Settled`.
    pub fn delivery_state(&self, tag: DeliveryTag) -> LinkResult<DeliveryState> {
        self.deliveries.state_of(tag)
            .ok_or_else(|| LinkError::InvalidArgument(format!("unknown delivery {}", tag)))
    }

    /// Unsettled deliveries in the order they were initiated
    pub fn unsettled(&self) -> impl Iterator<Item = DeliveryTag> + '_ {
        self.deliveries.unsettled()
    }

    fn detached_error(&self) -> LinkError {
        LinkError::Detached {
            condition: self.remote_condition.clone().or_else(|| self.local_condition.clone()),
        }
    }

    /// operations that start something new need an attached link
    fn check_attached(&self) -> LinkResult<()> {
        if self.terminated {
            return Err(self.detached_error());
        }
        if self.state != LinkState::Attached {
            return Err(LinkError::InvalidState(format!("link {} is {:?}", self.name, self.state)));
        }
        Ok(())
    }

    /// operations on existing deliveries are still allowed while detaching
    fn check_active(&self) -> LinkResult<()> {
        if self.terminated {
            return Err(self.detached_error());
        }
        if self.state == LinkState::Detached {
            return Err(LinkError::InvalidState(format!("link {} is detached", self.name)));
        }
        Ok(())
    }

    pub(crate) fn attach(&mut self) -> LinkResult<()> {
        if self.terminated {
            return Err(self.detached_error());
        }
        if self.state != LinkState::Detached || self.attach_sent || self.outbound.attach {
            return Err(LinkError::InvalidState(format!("link {} was attached before", self.name)));
        }

        debug!("attaching link {} ({:?}) with handle {}", self.name, self.role, self.handle);
        self.state = LinkState::Attached;
        self.outbound.attach = true;
        Ok(())
    }

    /// Starts an orderly detach: transfers that were already queued still go out before the
    ///  detach frame. Deliveries still waiting for credit are dropped.
    pub(crate) fn detach(&mut self) -> LinkResult<()> {
        self.check_attached()?;

        debug!("detaching link {}", self.name);
        self.state = LinkState::Detaching;
        if let Endpoint::Sender { blocked } = &mut self.endpoint {
            for tag in blocked.drain(..) {
                self.deliveries.remove(tag);
            }
        }
        self.outbound.detach = Some(Detach { handle: self.handle, closed: true, condition: None });
        Ok(())
    }

    /// Settles a complete or aborted delivery and lets the peer know, unless the peer settled
    ///  it already
    pub(crate) fn settle(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.check_active()?;

        let delivery = self.deliveries.require_mut(tag)?;
        delivery.settle()?;
        let outcome = delivery.local_outcome();

        if delivery.remote_settled() {
            trace!("link {}: settled delivery {}, the peer settled it before", self.name, tag);
        }
        else {
            trace!("link {}: settled delivery {}", self.name, tag);
            self.outbound.dispositions.push_back(Disposition {
                handle: self.handle,
                role: self.role,
                delivery_tag: tag,
                settled: true,
                outcome,
            });
        }

        if let Endpoint::Receiver { current, .. } = &mut self.endpoint {
            if *current == Some(tag) {
                *current = None;
            }
            self.flow.on_delivery_settled();
        }
        Ok(())
    }

    /// Dispatches an inbound frame. Protocol violations terminate this link only.
    pub(crate) fn on_frame(&mut self, frame: Frame, now: Instant, events: &mut VecDeque<LinkEvent>) {
        if let Frame::Detach(detach) = &frame {
            self.on_detach(detach, events);
            return;
        }
        if self.awaiting_remote_detach {
            trace!("link {}: dropping {:?} frame that was in flight when the link failed", self.name, frame.kind());
            return;
        }

        let result = match frame {
            Frame::Attach(attach) => self.on_attach(&attach, events),
            Frame::Transfer(transfer) => self.on_transfer(transfer, now, events),
            Frame::Flow(flow) => {
                if self.flow.on_peer_flow(&flow) {
                    events.push_back(LinkEvent::CreditAvailable { handle: self.handle });
                    self.start_blocked();
                }
                Ok(())
            }
            Frame::Disposition(disposition) => self.on_disposition(&disposition, events),
            Frame::Detach(_) => Ok(()),
        };

        if let Err(e) = result {
            let condition = e.condition().unwrap_or(condition::ILLEGAL_STATE).to_string();
            self.fail(condition, events);
        }
    }

    fn on_attach(&mut self, attach: &Attach, events: &mut VecDeque<LinkEvent>) -> LinkResult<()> {
        if self.remote_attached {
            debug!("link {}: duplicate attach from peer", self.name);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }
        // mapped before validating, so that the peer's reply to our detach finds the link
        self.remote_attached = true;
        self.remote_handle = Some(attach.handle);

        if attach.role != self.role.opposite() {
            debug!("link {}: peer attached as {:?}, but this side is {:?} as well", self.name, attach.role, self.role);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }
        if self.terminated || (self.state == LinkState::Detached && self.attach_sent) {
            debug!("link {}: peer attached a link that was detached before", self.name);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }

        if self.role == Role::Receiver {
            self.flow.set_delivery_count(attach.initial_delivery_count);
        }

        if self.state == LinkState::Detached && !self.terminated {
            debug!("link {} attached by peer", self.name);
            self.state = LinkState::Attached;
            if !self.attach_sent {
                self.outbound.attach = true;
            }
        }

        events.push_back(LinkEvent::RemoteAttached { handle: self.handle });
        Ok(())
    }

    fn on_disposition(&mut self, disposition: &Disposition, events: &mut VecDeque<LinkEvent>) -> LinkResult<()> {
        if disposition.role == self.role {
            debug!("link {}: disposition from a peer with the same role {:?}", self.name, self.role);
            return Err(LinkError::protocol(condition::ILLEGAL_STATE));
        }

        match self.deliveries.get_mut(disposition.delivery_tag) {
            Some(delivery) => {
                delivery.on_remote_disposition(disposition.outcome, disposition.settled);
                events.push_back(LinkEvent::DeliveryUpdated { handle: self.handle, tag: disposition.delivery_tag });
            }
            None => {
                trace!("link {}: disposition for delivery {} which is no longer known - ignoring", self.name, disposition.delivery_tag);
            }
        }
        Ok(())
    }

    fn on_detach(&mut self, detach: &Detach, events: &mut VecDeque<LinkEvent>) {
        self.remote_handle = None;
        self.remote_attached = false;

        if self.awaiting_remote_detach {
            debug!("link {}: peer acknowledged the detach after a protocol error", self.name);
            self.awaiting_remote_detach = false;
            return;
        }

        self.remote_condition = detach.condition.clone();
        self.destroy_deliveries();
        if self.state == LinkState::Detaching {
            debug!("link {}: detach completed", self.name);
            self.state = LinkState::Detached;
        }
        else {
            debug!("link {}: detached by peer, condition {:?}", self.name, detach.condition);
            self.state = LinkState::Detached;
            self.terminated = true;
            self.outbound.transfers.clear();
            self.outbound.dispositions.clear();
            self.flow.clear_pending();
            if self.attach_sent || self.outbound.attach {
                self.outbound.detach = Some(Detach { handle: self.handle, closed: true, condition: None });
            }
        }

        events.push_back(LinkEvent::RemoteDetached { handle: self.handle, condition: detach.condition.clone() });
    }

    /// Terminates the link after a protocol violation by the peer
    fn fail(&mut self, condition: String, events: &mut VecDeque<LinkEvent>) {
        warn!("link {} ({}): protocol error {} - detaching", self.name, self.handle, condition);

        self.state = LinkState::Detached;
        self.terminated = true;
        self.local_condition = Some(condition.clone());
        self.destroy_deliveries();
        self.outbound.transfers.clear();
        self.outbound.dispositions.clear();
        self.flow.clear_pending();
        self.outbound.detach = Some(Detach { handle: self.handle, closed: true, condition: Some(condition.clone()) });
        self.awaiting_remote_detach = self.remote_handle.is_some();

        events.push_back(LinkEvent::LinkError { handle: self.handle, condition });
    }

    fn destroy_deliveries(&mut self) {
        let num_destroyed = self.deliveries.clear();
        if num_destroyed > 0 {
            debug!("link {}: destroyed {} deliveries", self.name, num_destroyed);
        }
        self.endpoint = Endpoint::for_role(self.role);
    }

    pub(crate) fn purge_settled(&mut self) -> usize {
        self.deliveries.purge_settled()
    }

    pub(crate) fn has_outbound(&self) -> bool {
        self.outbound.attach
            || (!self.terminated && self.flow.has_pending_flow())
            || !self.outbound.dispositions.is_empty()
            || !self.outbound.transfers.is_empty()
            || self.outbound.detach.is_some()
    }

    /// The next outbound frame. Per link, attach goes first, then flow, dispositions, transfers
    ///  and finally detach.
    pub(crate) fn poll_frame(&mut self) -> Option<Frame> {
        if self.outbound.attach {
            self.outbound.attach = false;
            self.attach_sent = true;
            return Some(Frame::Attach(Attach {
                name: self.name.clone(),
                handle: self.handle,
                role: self.role,
                initial_delivery_count: self.flow.delivery_count(),
            }));
        }
        if !self.terminated {
            if let Some(flow) = self.flow.take_flow(self.handle) {
                return Some(Frame::Flow(flow));
            }
        }
        if let Some(disposition) = self.outbound.dispositions.pop_front() {
            return Some(Frame::Disposition(disposition));
        }
        if let Some(transfer) = self.outbound.transfers.pop_front() {
            return Some(Frame::Transfer(transfer));
        }
        self.outbound.detach.take()
            .map(Frame::Detach)
    }

    /// Aborts partial deliveries that saw no activity within the idle timeout. The rest of an
    ///  incoming delivery that expired is dropped when the peer sends it.
    pub(crate) fn expire_idle(&mut self, now: Instant, timer: &IdleTimer, events: &mut VecDeque<LinkEvent>) -> usize {
        let expired = self.deliveries.partials()
            .filter(|d| timer.is_expired(d.last_activity(), now))
            .map(|d| (d.tag(), d.direction()))
            .collect::<Vec<_>>();

        for &(tag, direction) in &expired {
            debug!("link {}: delivery {} saw no activity within {:?} - aborting", self.name, tag, timer.timeout());
            let result = match direction {
                Direction::Outgoing => self.abort_outgoing(tag),
                Direction::Incoming => {
                    let result = self.deliveries.require_mut(tag)
                        .and_then(|d| d.abort());
                    if let Endpoint::Receiver { expired, .. } = &mut self.endpoint {
                        *expired = Some(tag);
                    }
                    events.push_back(LinkEvent::DeliveryUpdated { handle: self.handle, tag });
                    result
                }
            };
            if let Err(e) = result {
                warn!("link {}: aborting idle delivery {} failed: {}", self.name, tag, e);
            }
        }
        expired.len()
    }

    pub(crate) fn next_idle_deadline(&self, timer: &IdleTimer) -> Option<Instant> {
        self.deliveries.partials()
            .map(|d| timer.deadline(d.last_activity()))
            .min()
    }
}
