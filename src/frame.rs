//! The frame structures the engine consumes from and emits to the external codec.
//!
//! These are decoded performatives - the engine never sees wire bytes. See [crate::codec] for
//!  the reference byte-level encoding.

use std::fmt::{Display, Formatter};

use bytes::Bytes;
use num_enum::{IntoPrimitive, TryFromPrimitive};

pub type Payload = Bytes;

/// Numeric identifier of an attached link. Each side assigns its own handles; a frame carries
///  the handle of the side that sent it.
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug)]
pub struct Handle(u32);

impl Display for Handle {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl Handle {
    pub fn from_raw(value: u32) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u32 {
        self.0
    }
}

/// Link-scoped, monotonically increasing delivery identifier
#[derive(Copy, Clone, Eq, PartialEq, Ord, PartialOrd, Hash, Debug, Default)]
pub struct DeliveryTag(u64);

impl Display for DeliveryTag {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl DeliveryTag {
    pub const ZERO: DeliveryTag = DeliveryTag(0);

    pub fn from_raw(value: u64) -> Self {
        Self(value)
    }

    pub fn to_raw(&self) -> u64 {
        self.0
    }

    /// the following tag, or `None` for the last one
    pub fn checked_next(&self) -> Option<DeliveryTag> {
        self.0.checked_add(1).map(DeliveryTag)
    }
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Role {
    Sender = 0,
    Receiver = 1,
}
impl Role {
    pub fn opposite(&self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }
}

/// The outcome a receiver assigns to a delivery
#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, Hash, TryFromPrimitive, IntoPrimitive)]
pub enum Outcome {
    Received = 1,
    Accepted = 2,
    Rejected = 3,
    Released = 4,
    Modified = 5,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Attach {
    pub name: String,
    pub handle: Handle,
    /// the role of the *sending* side of this frame
    pub role: Role,
    pub initial_delivery_count: u32,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Transfer {
    pub handle: Handle,
    pub delivery_tag: DeliveryTag,
    pub more: bool,
    pub aborted: bool,
    pub settled: bool,
    pub payload: Payload,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Flow {
    pub handle: Handle,
    /// `None` means 'the initial delivery count announced in attach'
    pub delivery_count: Option<u32>,
    pub link_credit: u32,
    /// number of deliveries the sender has ready, only sent by senders
    pub available: Option<u32>,
    /// asks the peer to reply with its own flow state
    pub echo: bool,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Disposition {
    pub handle: Handle,
    /// the role of the side sending the disposition
    pub role: Role,
    pub delivery_tag: DeliveryTag,
    pub settled: bool,
    pub outcome: Option<Outcome>,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub struct Detach {
    pub handle: Handle,
    pub closed: bool,
    pub condition: Option<String>,
}

#[repr(u8)]
#[derive(Debug, Copy, Clone, Eq, PartialEq, TryFromPrimitive, IntoPrimitive)]
pub enum FrameKind {
    Attach = 1,
    Transfer = 2,
    Flow = 3,
    Disposition = 4,
    Detach = 5,
}

#[derive(Clone, Debug, Eq, PartialEq)]
pub enum Frame {
    Attach(Attach),
    Transfer(Transfer),
    Flow(Flow),
    Disposition(Disposition),
    Detach(Detach),
}

impl Frame {
    pub fn handle(&self) -> Handle {
        match self {
            Frame::Attach(f) => f.handle,
            Frame::Transfer(f) => f.handle,
            Frame::Flow(f) => f.handle,
            Frame::Disposition(f) => f.handle,
            Frame::Detach(f) => f.handle,
        }
    }

    pub fn kind(&self) -> FrameKind {
        match self {
            Frame::Attach(_) => FrameKind::Attach,
            Frame::Transfer(_) => FrameKind::Transfer,
            Frame::Flow(_) => FrameKind::Flow,
            Frame::Disposition(_) => FrameKind::Disposition,
            Frame::Detach(_) => FrameKind::Detach,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[rstest]
    #[case::zero(0, Some(1))]
    #[case::regular(41, Some(42))]
    #[case::last(u64::MAX, None)]
    fn test_tag_checked_next(#[case] tag: u64, #[case] expected: Option<u64>) {
        assert_eq!(DeliveryTag::from_raw(tag).checked_next(), expected.map(DeliveryTag::from_raw));
    }

    #[rstest]
    #[case::sender(Role::Sender, Role::Receiver)]
    #[case::receiver(Role::Receiver, Role::Sender)]
    fn test_role_opposite(#[case] role: Role, #[case] expected: Role) {
        assert_eq!(role.opposite(), expected);
    }

    #[test]
    fn test_frame_handle_and_kind() {
        let frame = Frame::Detach(Detach { handle: Handle::from_raw(7), closed: true, condition: None });
        assert_eq!(frame.handle(), Handle::from_raw(7));
        assert_eq!(frame.kind(), FrameKind::Detach);
        assert_eq!(u8::from(frame.kind()), 5);
        assert_eq!(FrameKind::try_from(2u8).unwrap(), FrameKind::Transfer);
        assert!(FrameKind::try_from(9u8).is_err());
    }
}
