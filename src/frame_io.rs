use anyhow::Context;
use bytes::BytesMut;
use tracing::trace;

#[cfg(test)] use mockall::automock;

use crate::frame::Frame;
use crate::mux::LinkMux;

/// The wire format, which is not the engine's business. An implementation turns bytes into
///  whole frames and back.
#[cfg_attr(test, automock)]
pub trait FrameCodec: Send {
    /// Decodes the next whole frame, consuming its bytes. Returns `None` without consuming
    ///  anything if the buffer does not hold a complete frame yet.
    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Frame>>;

    fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> anyhow::Result<()>;

    /// the number of bytes `encode` would append for this frame
    fn encoded_len(&self, frame: &Frame) -> usize;

    /// The largest transfer payload `encode` accepts for any handle and delivery tag, if the
    ///  wire format has a limit
    fn max_transfer_payload(&self) -> Option<usize> {
        None
    }
}

/// Moves frames between a codec and the mux.
///
/// Outbound, each call polls at most one frame per link that is ready when the call starts,
///  and stops at the output budget. A frame that was polled but does not fit is held for the
///  next call; it is the only frame buffered outside the links.
pub struct FrameIo {
    max_output_per_call: usize,
    held: Option<Frame>,
}

impl FrameIo {
    pub fn new(max_output_per_call: usize) -> FrameIo {
        FrameIo {
            max_output_per_call,
            held: None,
        }
    }

    pub fn has_held(&self) -> bool {
        self.held.is_some()
    }

    /// Decodes all whole frames in `inbound` and hands them to the mux. A frame the mux rejects
    ///  is a protocol error for the entire connection.
    pub fn read_frames(&mut self, codec: &dyn FrameCodec, inbound: &mut BytesMut, mux: &mut LinkMux) -> anyhow::Result<usize> {
        let mut num_read = 0;
        while let Some(frame) = codec.decode(inbound)? {
            mux.on_frame(frame)
                .context("protocol error on the connection")?;
            num_read += 1;
        }
        Ok(num_read)
    }

    pub fn write_frames(&mut self, codec: &dyn FrameCodec, mux: &mut LinkMux, outbound: &mut BytesMut) -> anyhow::Result<usize> {
        let num_slots = mux.num_ready() + usize::from(self.held.is_some());

        let mut num_bytes = 0;
        let mut num_written = 0;
        for _ in 0..num_slots {
            let Some(frame) = self.held.take().or_else(|| mux.poll_frame()) else {
                break;
            };

            let len = codec.encoded_len(&frame);
            if num_written > 0 && num_bytes + len > self.max_output_per_call {
                trace!("output budget exhausted after {} frames - holding a {:?} frame", num_written, frame.kind());
                self.held = Some(frame);
                break;
            }

            codec.encode(&frame, outbound)?;
            num_bytes += len;
            num_written += 1;
        }
        Ok(num_written)
    }
}
