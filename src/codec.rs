//! A compact binary encoding of [Frame]s, for embedders that do not bring their own wire
//!  format and for testing engines against each other through real bytes.
//!
//! Each frame is a big-endian `u32` length followed by that many bytes: a kind byte, then the
//!  kind's fields. Integers are varints, strings are length-prefixed UTF-8, optional fields are
//!  announced in a flags byte. A transfer's payload takes up the rest of the frame and is
//!  decoded without copying.

use anyhow::{anyhow, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use bytes_varint::{VarIntSupport, VarIntSupportMut};
use num_enum::TryFromPrimitive;

use crate::frame::{Attach, DeliveryTag, Detach, Disposition, Flow, Frame, FrameKind, Handle, Outcome, Role, Transfer};
use crate::frame_io::FrameCodec;

const LENGTH_PREFIX_LEN: usize = std::mem::size_of::<u32>();

pub const DEFAULT_MAX_FRAME_SIZE: usize = 1024*1024;

const TRANSFER_MORE: u8 = 1;
const TRANSFER_ABORTED: u8 = 2;
const TRANSFER_SETTLED: u8 = 4;

const FLOW_HAS_DELIVERY_COUNT: u8 = 1;
const FLOW_HAS_AVAILABLE: u8 = 2;
const FLOW_ECHO: u8 = 4;

const DISPOSITION_SETTLED: u8 = 1;

const DETACH_CLOSED: u8 = 1;
const DETACH_HAS_CONDITION: u8 = 2;

/// no outcome in a disposition frame
const NO_OUTCOME: u8 = 0;

pub struct BinaryFrameCodec {
    /// upper bound for a frame's size, excluding the length prefix
    max_frame_size: usize,
}

impl Default for BinaryFrameCodec {
    fn default() -> Self {
        BinaryFrameCodec::new(DEFAULT_MAX_FRAME_SIZE)
    }
}

impl BinaryFrameCodec {
    pub fn new(max_frame_size: usize) -> BinaryFrameCodec {
        BinaryFrameCodec { max_frame_size }
    }

    pub fn max_frame_size(&self) -> usize {
        self.max_frame_size
    }

    fn body_len(frame: &Frame) -> usize {
        let fields_len = match frame {
            Frame::Attach(f) => string_len(&f.name) + varint_len(f.handle.to_raw() as u64) + 1 + varint_len(f.initial_delivery_count as u64),
            Frame::Transfer(f) => varint_len(f.handle.to_raw() as u64) + varint_len(f.delivery_tag.to_raw()) + 1 + f.payload.len(),
            Frame::Flow(f) => {
                varint_len(f.handle.to_raw() as u64)
                    + 1
                    + f.delivery_count.map(|n| varint_len(n as u64)).unwrap_or(0)
                    + varint_len(f.link_credit as u64)
                    + f.available.map(|n| varint_len(n as u64)).unwrap_or(0)
            }
            Frame::Disposition(f) => varint_len(f.handle.to_raw() as u64) + 1 + varint_len(f.delivery_tag.to_raw()) + 1 + 1,
            Frame::Detach(f) => varint_len(f.handle.to_raw() as u64) + 1 + f.condition.as_deref().map(string_len).unwrap_or(0),
        };
        1 + fields_len
    }
}

impl FrameCodec for BinaryFrameCodec {
    fn decode(&self, buf: &mut BytesMut) -> anyhow::Result<Option<Frame>> {
        if buf.len() < LENGTH_PREFIX_LEN {
            return Ok(None);
        }
        let len = u32::from_be_bytes([buf[0], buf[1], buf[2], buf[3]]) as usize;
        if len == 0 {
            bail!("empty frame");
        }
        if len > self.max_frame_size {
            bail!("frame of {} bytes exceeds the maximum frame size of {}", len, self.max_frame_size);
        }
        if buf.len() < LENGTH_PREFIX_LEN + len {
            return Ok(None);
        }

        buf.advance(LENGTH_PREFIX_LEN);
        let mut body = buf.split_to(len).freeze();
        let frame = deser_frame(&mut body)?;
        if body.has_remaining() {
            bail!("{} trailing bytes after {:?} frame", body.remaining(), frame.kind());
        }
        Ok(Some(frame))
    }

    fn encode(&self, frame: &Frame, buf: &mut BytesMut) -> anyhow::Result<()> {
        let len = Self::body_len(frame);
        if len > self.max_frame_size {
            bail!("{:?} frame of {} bytes exceeds the maximum frame size of {}", frame.kind(), len, self.max_frame_size);
        }

        buf.reserve(LENGTH_PREFIX_LEN + len);
        buf.put_u32(len as u32);
        buf.put_u8(frame.kind().into());
        match frame {
            Frame::Attach(f) => f.ser(buf),
            Frame::Transfer(f) => f.ser(buf),
            Frame::Flow(f) => f.ser(buf),
            Frame::Disposition(f) => f.ser(buf),
            Frame::Detach(f) => f.ser(buf),
        }
        Ok(())
    }

    fn encoded_len(&self, frame: &Frame) -> usize {
        LENGTH_PREFIX_LEN + Self::body_len(frame)
    }

    fn max_transfer_payload(&self) -> Option<usize> {
        let widest_header = Frame::Transfer(Transfer {
            handle: Handle::from_raw(u32::MAX),
            delivery_tag: DeliveryTag::from_raw(u64::MAX),
            more: true,
            aborted: false,
            settled: false,
            payload: Bytes::new(),
        });
        Some(self.max_frame_size.saturating_sub(Self::body_len(&widest_header)))
    }
}

fn deser_frame(buf: &mut Bytes) -> anyhow::Result<Frame> {
    let kind = FrameKind::try_from_primitive(buf.try_get_u8()?)?;
    let frame = match kind {
        FrameKind::Attach => Frame::Attach(Attach::deser(buf)?),
        FrameKind::Transfer => Frame::Transfer(Transfer::deser(buf)?),
        FrameKind::Flow => Frame::Flow(Flow::deser(buf)?),
        FrameKind::Disposition => Frame::Disposition(Disposition::deser(buf)?),
        FrameKind::Detach => Frame::Detach(Detach::deser(buf)?),
    };
    Ok(frame)
}

fn varint_len(value: u64) -> usize {
    let num_bits = (u64::BITS - value.leading_zeros()) as usize;
    num_bits.max(1).div_ceil(7)
}

fn string_len(s: &str) -> usize {
    varint_len(s.len() as u64) + s.len()
}

fn put_string(buf: &mut BytesMut, s: &str) {
    buf.put_usize_varint(s.len());
    buf.put_slice(s.as_bytes());
}

fn try_get_string(buf: &mut Bytes) -> anyhow::Result<String> {
    let len = buf.try_get_usize_varint()?;
    if len > buf.remaining() {
        bail!("string of length {} exceeds the remaining {} bytes", len, buf.remaining());
    }
    let raw = buf.split_to(len);
    let s = std::str::from_utf8(&raw)?;
    Ok(s.to_string())
}

fn try_get_handle(buf: &mut Bytes) -> anyhow::Result<Handle> {
    Ok(Handle::from_raw(buf.try_get_u32_varint()?))
}

fn try_get_role(buf: &mut Bytes) -> anyhow::Result<Role> {
    let raw = buf.try_get_u8()?;
    Role::try_from_primitive(raw)
        .map_err(|_| anyhow!("invalid role {}", raw))
}

impl Attach {
    fn ser(&self, buf: &mut BytesMut) {
        put_string(buf, &self.name);
        buf.put_u32_varint(self.handle.to_raw());
        buf.put_u8(self.role.into());
        buf.put_u32_varint(self.initial_delivery_count);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Attach> {
        let name = try_get_string(buf)?;
        let handle = try_get_handle(buf)?;
        let role = try_get_role(buf)?;
        let initial_delivery_count = buf.try_get_u32_varint()?;
        Ok(Attach { name, handle, role, initial_delivery_count })
    }
}

impl Transfer {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.handle.to_raw());
        buf.put_u64_varint(self.delivery_tag.to_raw());

        let mut flags = 0;
        if self.more { flags |= TRANSFER_MORE; }
        if self.aborted { flags |= TRANSFER_ABORTED; }
        if self.settled { flags |= TRANSFER_SETTLED; }
        buf.put_u8(flags);

        buf.put_slice(&self.payload);
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Transfer> {
        let handle = try_get_handle(buf)?;
        let delivery_tag = DeliveryTag::from_raw(buf.try_get_u64_varint()?);
        let flags = buf.try_get_u8()?;
        let payload = buf.split_to(buf.len());

        Ok(Transfer {
            handle,
            delivery_tag,
            more: flags & TRANSFER_MORE != 0,
            aborted: flags & TRANSFER_ABORTED != 0,
            settled: flags & TRANSFER_SETTLED != 0,
            payload,
        })
    }
}

impl Flow {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.handle.to_raw());

        let mut flags = 0;
        if self.delivery_count.is_some() { flags |= FLOW_HAS_DELIVERY_COUNT; }
        if self.available.is_some() { flags |= FLOW_HAS_AVAILABLE; }
        if self.echo { flags |= FLOW_ECHO; }
        buf.put_u8(flags);

        if let Some(delivery_count) = self.delivery_count {
            buf.put_u32_varint(delivery_count);
        }
        buf.put_u32_varint(self.link_credit);
        if let Some(available) = self.available {
            buf.put_u32_varint(available);
        }
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Flow> {
        let handle = try_get_handle(buf)?;
        let flags = buf.try_get_u8()?;

        let delivery_count = if flags & FLOW_HAS_DELIVERY_COUNT != 0 {
            Some(buf.try_get_u32_varint()?)
        }
        else {
            None
        };
        let link_credit = buf.try_get_u32_varint()?;
        let available = if flags & FLOW_HAS_AVAILABLE != 0 {
            Some(buf.try_get_u32_varint()?)
        }
        else {
            None
        };

        Ok(Flow {
            handle,
            delivery_count,
            link_credit,
            available,
            echo: flags & FLOW_ECHO != 0,
        })
    }
}

impl Disposition {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.handle.to_raw());
        buf.put_u8(self.role.into());
        buf.put_u64_varint(self.delivery_tag.to_raw());
        buf.put_u8(if self.settled { DISPOSITION_SETTLED } else { 0 });
        buf.put_u8(self.outcome.map(u8::from).unwrap_or(NO_OUTCOME));
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Disposition> {
        let handle = try_get_handle(buf)?;
        let role = try_get_role(buf)?;
        let delivery_tag = DeliveryTag::from_raw(buf.try_get_u64_varint()?);
        let settled = buf.try_get_u8()? & DISPOSITION_SETTLED != 0;
        let outcome = match buf.try_get_u8()? {
            NO_OUTCOME => None,
            raw => Some(Outcome::try_from_primitive(raw)
                .map_err(|_| anyhow!("invalid outcome {}", raw))?),
        };
        Ok(Disposition { handle, role, delivery_tag, settled, outcome })
    }
}

impl Detach {
    fn ser(&self, buf: &mut BytesMut) {
        buf.put_u32_varint(self.handle.to_raw());

        let mut flags = 0;
        if self.closed { flags |= DETACH_CLOSED; }
        if self.condition.is_some() { flags |= DETACH_HAS_CONDITION; }
        buf.put_u8(flags);

        if let Some(condition) = &self.condition {
            put_string(buf, condition);
        }
    }

    fn deser(buf: &mut Bytes) -> anyhow::Result<Detach> {
        let handle = try_get_handle(buf)?;
        let flags = buf.try_get_u8()?;
        let condition = if flags & DETACH_HAS_CONDITION != 0 {
            Some(try_get_string(buf)?)
        }
        else {
            None
        };
        Ok(Detach {
            handle,
            closed: flags & DETACH_CLOSED != 0,
            condition,
        })
    }
}
