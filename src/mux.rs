//! The link multiplexer: owns all links of one connection, routes inbound frames to them and
//!  drains their outbound frames fairly.
//!
//! Application code reaches a link through a borrowed view ([SenderRef], [ReceiverRef],
//!  [LinkRef]). A view holds the link together with the mux's ready queue, and re-registers
//!  the link's readiness when it is dropped, so there is no need for links to point back to
//!  the mux.

pub mod ready_queue;

use std::collections::VecDeque;
use std::ops::Deref;
use std::time::Instant;

use rustc_hash::FxHashMap;
use tracing::{debug, trace, warn};

use crate::clock::IdleTimer;
use crate::config::EngineConfig;
use crate::delivery::Received;
use crate::error::{condition, LinkError, LinkResult};
use crate::frame::{Attach, DeliveryTag, Frame, Handle, Outcome, Payload, Role};
use crate::link::Link;
use crate::mux::ready_queue::ReadyQueue;

/// Things the application may want to react to, drained through [LinkMux::poll_event]
#[derive(Debug, Clone, Eq, PartialEq)]
pub enum LinkEvent {
    /// the peer attached a link, possibly creating it on this side
    RemoteAttached { handle: Handle },
    /// the peer detached a link; its deliveries are gone
    RemoteDetached { handle: Handle, condition: Option<String> },
    /// the peer violated the protocol on a link, which was detached with this condition
    LinkError { handle: Handle, condition: String },
    /// a sender's credit went up
    CreditAvailable { handle: Handle },
    /// a new incoming delivery is available through `next()`
    DeliveryArrived { handle: Handle, tag: DeliveryTag },
    /// body bytes arrived for a delivery, it was aborted, or the peer's disposition changed it
    DeliveryUpdated { handle: Handle, tag: DeliveryTag },
}

pub struct LinkMux {
    config: EngineConfig,
    links: FxHashMap<Handle, Link>,
    names: FxHashMap<String, Handle>,
    /// the peer's handles of attached links, mapped to our own
    remote_handles: FxHashMap<Handle, Handle>,
    ready: ReadyQueue,
    events: VecDeque<LinkEvent>,
    next_handle: u32,
    idle_timer: Option<IdleTimer>,
    now: Instant,
}

impl LinkMux {
    pub fn new(config: EngineConfig, now: Instant) -> anyhow::Result<LinkMux> {
        config.validate()?;
        let idle_timer = config.delivery_idle_timeout
            .map(IdleTimer::new);

        Ok(LinkMux {
            config,
            links: FxHashMap::default(),
            names: FxHashMap::default(),
            remote_handles: FxHashMap::default(),
            ready: ReadyQueue::new(),
            events: VecDeque::new(),
            next_handle: 0,
            idle_timer,
            now,
        })
    }

    pub fn config(&self) -> &EngineConfig {
        &self.config
    }

    pub fn now(&self) -> Instant {
        self.now
    }

    /// Moves the mux's notion of 'now' forward. Time never goes backwards.
    pub fn set_now(&mut self, now: Instant) {
        if now > self.now {
            self.now = now;
        }
    }

    pub fn create_sender(&mut self, name: &str) -> LinkResult<Handle> {
        self.create_link(name, Role::Sender)
    }

    pub fn create_receiver(&mut self, name: &str) -> LinkResult<Handle> {
        self.create_link(name, Role::Receiver)
    }

    fn create_link(&mut self, name: &str, role: Role) -> LinkResult<Handle> {
        if self.names.contains_key(name) {
            return Err(LinkError::InvalidArgument(format!("there is a link named {} already", name)));
        }
        if self.links.len() >= self.config.max_links {
            return Err(LinkError::InvalidState(format!("the maximum number of links ({}) is reached", self.config.max_links)));
        }

        let handle = Handle::from_raw(self.next_handle);
        self.next_handle = self.next_handle.checked_add(1)
            .ok_or_else(|| LinkError::InvalidState("link handles are exhausted".to_string()))?;

        let link_config = self.config.get_effective_link_config(name);
        self.links.insert(handle, Link::new(name.to_string(), role, handle, link_config));
        self.names.insert(name.to_string(), handle);
        debug!("created {:?} link {} with handle {}", role, name, handle);
        Ok(handle)
    }

    pub fn handle_by_name(&self, name: &str) -> Option<Handle> {
        self.names.get(name).copied()
    }

    /// all link handles in ascending order
    pub fn handles(&self) -> Vec<Handle> {
        let mut handles = self.links.keys().copied().collect::<Vec<_>>();
        handles.sort();
        handles
    }

    /// read-only access to a link
    pub fn get(&self, handle: Handle) -> Option<&Link> {
        self.links.get(&handle)
    }

    pub fn link(&mut self, handle: Handle) -> LinkResult<LinkRef<'_>> {
        let link = self.links.get_mut(&handle)
            .ok_or_else(|| LinkError::InvalidArgument(format!("no link with handle {}", handle)))?;
        Ok(LinkRef {
            link,
            ready: &mut self.ready,
            now: self.now,
        })
    }

    pub fn sender(&mut self, handle: Handle) -> LinkResult<SenderRef<'_>> {
        let inner = self.link(handle)?;
        if inner.role() != Role::Sender {
            return Err(LinkError::InvalidArgument(format!("link {} is not a sender", handle)));
        }
        Ok(SenderRef { inner })
    }

    pub fn receiver(&mut self, handle: Handle) -> LinkResult<ReceiverRef<'_>> {
        let inner = self.link(handle)?;
        if inner.role() != Role::Receiver {
            return Err(LinkError::InvalidArgument(format!("link {} is not a receiver", handle)));
        }
        Ok(ReceiverRef { inner })
    }

    /// Routes an inbound frame. Frames for a handle the peer has not attached are a
    ///  connection-level protocol error and touch no link.
    pub fn on_frame(&mut self, frame: Frame) -> LinkResult<()> {
        trace!("inbound {:?} frame for remote handle {}", frame.kind(), frame.handle());

        if let Frame::Attach(attach) = frame {
            return self.on_attach(attach);
        }

        let remote = frame.handle();
        let Some(&handle) = self.remote_handles.get(&remote) else {
            warn!("received {:?} frame for unattached handle {}", frame.kind(), remote);
            return Err(LinkError::protocol(condition::UNATTACHED_HANDLE));
        };
        self.dispatch(handle, remote, frame);
        Ok(())
    }

    fn on_attach(&mut self, attach: Attach) -> LinkResult<()> {
        let handle = match self.names.get(&attach.name) {
            Some(&handle) => handle,
            None => {
                debug!("peer attached unknown link {} as {:?} - creating it", attach.name, attach.role);
                self.create_link(&attach.name, attach.role.opposite())?
            }
        };

        let remote = attach.handle;
        match self.remote_handles.get(&remote) {
            Some(&mapped) if mapped != handle => {
                warn!("peer attached link {} with handle {} that is in use for another link", attach.name, remote);
                return Err(LinkError::protocol(condition::ILLEGAL_STATE));
            }
            Some(_) => {}
            None => {
                if self.links.get(&handle).is_some_and(|l| l.remote_handle().is_none()) {
                    self.remote_handles.insert(remote, handle);
                }
            }
        }

        self.dispatch(handle, remote, Frame::Attach(attach));
        Ok(())
    }

    fn dispatch(&mut self, handle: Handle, remote: Handle, frame: Frame) {
        let Some(link) = self.links.get_mut(&handle) else {
            self.remote_handles.remove(&remote);
            return;
        };

        link.on_frame(frame, self.now, &mut self.events);

        if link.remote_handle() != Some(remote) {
            self.remote_handles.remove(&remote);
        }
        if link.has_outbound() {
            self.ready.push(handle);
        }
    }

    /// The next outbound frame: one frame from the link at the head of the ready queue, which
    ///  then goes to the back of the queue if it has more work
    pub fn poll_frame(&mut self) -> Option<Frame> {
        while let Some(handle) = self.ready.pop() {
            let Some(link) = self.links.get_mut(&handle) else {
                continue;
            };
            let Some(frame) = link.poll_frame() else {
                continue;
            };
            if link.has_outbound() {
                self.ready.push(handle);
            }
            trace!("outbound {:?} frame for link {}", frame.kind(), handle);
            return Some(frame);
        }
        None
    }

    pub fn has_outbound(&self) -> bool {
        !self.ready.is_empty()
    }

    /// number of links with outbound work
    pub fn num_ready(&self) -> usize {
        self.ready.len()
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.events.pop_front()
    }

    /// Removes settled deliveries from all links
    pub fn purge_settled(&mut self) -> usize {
        let num_purged = self.links.values_mut()
            .map(|link| link.purge_settled())
            .sum();
        if num_purged > 0 {
            trace!("purged {} settled deliveries", num_purged);
        }
        num_purged
    }

    /// Aborts idle partial deliveries if an idle timeout is configured
    pub fn expire_idle(&mut self) -> usize {
        let Some(timer) = self.idle_timer else {
            return 0;
        };

        let mut num_expired = 0;
        for handle in self.handles() {
            if let Some(link) = self.links.get_mut(&handle) {
                num_expired += link.expire_idle(self.now, &timer, &mut self.events);
                if link.has_outbound() {
                    self.ready.push(handle);
                }
            }
        }
        num_expired
    }

    pub fn next_idle_deadline(&self) -> Option<Instant> {
        let timer = self.idle_timer?;
        self.links.values()
            .filter_map(|link| link.next_idle_deadline(&timer))
            .min()
    }
}

/// Mutable access to a link of either role. Dropping the view makes the mux pick up outbound
///  work the operations produced.
pub struct LinkRef<'a> {
    link: &'a mut Link,
    ready: &'a mut ReadyQueue,
    now: Instant,
}

impl Deref for LinkRef<'_> {
    type Target = Link;

    fn deref(&self) -> &Link {
        &*self.link
    }
}

impl Drop for LinkRef<'_> {
    fn drop(&mut self) {
        if self.link.has_outbound() {
            self.ready.push(self.link.handle());
        }
    }
}

impl LinkRef<'_> {
    pub fn attach(&mut self) -> LinkResult<()> {
        self.link.attach()
    }

    pub fn detach(&mut self) -> LinkResult<()> {
        self.link.detach()
    }

    pub fn settle(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.link.settle(tag)
    }
}

pub struct SenderRef<'a> {
    inner: LinkRef<'a>,
}

impl Deref for SenderRef<'_> {
    type Target = Link;

    fn deref(&self) -> &Link {
        &*self.inner.link
    }
}

impl SenderRef<'_> {
    pub fn attach(&mut self) -> LinkResult<()> {
        self.inner.attach()
    }

    pub fn detach(&mut self) -> LinkResult<()> {
        self.inner.detach()
    }

    /// allocates the tag for the next outgoing delivery
    pub fn delivery(&mut self) -> LinkResult<DeliveryTag> {
        self.inner.link.new_delivery(self.inner.now)
    }

    pub fn offer(&mut self, n: i32) -> LinkResult<()> {
        self.inner.link.offer(n)
    }

    /// Appends the next body fragment. Returns `NoCredit` if the delivery could not start; it
    ///  is queued and goes out once the peer grants credit.
    pub fn send(&mut self, tag: DeliveryTag, bytes: impl Into<Payload>, more: bool) -> LinkResult<()> {
        let now = self.inner.now;
        self.inner.link.send(tag, bytes.into(), more, now)
    }

    pub fn abort(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.inner.link.abort(tag)
    }

    pub fn settle(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.inner.settle(tag)
    }
}

pub struct ReceiverRef<'a> {
    inner: LinkRef<'a>,
}

impl Deref for ReceiverRef<'_> {
    type Target = Link;

    fn deref(&self) -> &Link {
        &*self.inner.link
    }
}

impl ReceiverRef<'_> {
    pub fn attach(&mut self) -> LinkResult<()> {
        self.inner.attach()
    }

    pub fn detach(&mut self) -> LinkResult<()> {
        self.inner.detach()
    }

    pub fn flow(&mut self, credits: i32) -> LinkResult<()> {
        self.inner.link.flow(credits)
    }

    /// the earliest delivery not handed out yet, which becomes the current delivery
    pub fn next(&mut self) -> LinkResult<Option<DeliveryTag>> {
        self.inner.link.next_delivery()
    }

    pub fn recv(&mut self, dst: &mut [u8], offset: usize, size: usize) -> LinkResult<Received> {
        self.inner.link.recv(dst, offset, size)
    }

    pub fn recv_delivery(&mut self, tag: DeliveryTag, dst: &mut Vec<u8>) -> LinkResult<bool> {
        self.inner.link.recv_delivery(tag, dst)
    }

    pub fn disposition(&mut self, tag: DeliveryTag, outcome: Outcome) -> LinkResult<()> {
        self.inner.link.disposition(tag, outcome)
    }

    pub fn settle(&mut self, tag: DeliveryTag) -> LinkResult<()> {
        self.inner.settle(tag)
    }
}
