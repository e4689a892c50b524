//! The link layer of an AMQP-style messaging engine.
//!
//! A connection carries any number of independent, flow-controlled, unidirectional *links*.
//!  A sender link transfers *deliveries* (messages, possibly split over several transfer
//!  frames) to the matching receiver link on the peer. The receiver grants credit, the sender
//!  spends one credit per delivery, and both sides settle deliveries once they are done with
//!  them.
//!
//! The core is a set of synchronous state machines ([link::Link], [mux::LinkMux]) that consume
//!  and produce decoded [frame::Frame]s. [engine::Engine] adds the byte boundary through a
//!  pluggable [frame_io::FrameCodec], and [driver::EngineDriver] runs an engine over a tokio
//!  stream.

pub mod clock;
pub mod codec;
pub mod config;
pub mod delivery;
pub mod driver;
pub mod engine;
pub mod error;
pub mod flow_controller;
pub mod frame;
pub mod frame_io;
pub mod link;
pub mod mux;

#[cfg(test)] pub mod test_util;

pub use delivery::{DeliveryState, Received};
pub use engine::Engine;
pub use error::{LinkError, LinkResult};
pub use frame::{DeliveryTag, Frame, Handle, Outcome, Payload, Role};
pub use mux::{LinkEvent, LinkMux};
