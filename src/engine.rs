use std::sync::Arc;
use std::time::Instant;

use anyhow::bail;
use bytes::{Bytes, BytesMut};
use tracing::trace;

use crate::clock::Clock;
use crate::config::EngineConfig;
use crate::frame_io::{FrameCodec, FrameIo};
use crate::mux::{LinkEvent, LinkMux};

/// One connection's link layer at the byte boundary: bytes go in through [Engine::input], come
///  out through [Engine::output], and all work happens in [Engine::tick].
///
/// Link operations go through [Engine::mux_mut]. They only queue frames; nothing is written
///  before the next tick.
pub struct Engine<C: FrameCodec> {
    mux: LinkMux,
    io: FrameIo,
    codec: C,
    clock: Arc<dyn Clock>,
    inbound: BytesMut,
    outbound: BytesMut,
}

impl<C: FrameCodec> Engine<C> {
    pub fn new(config: EngineConfig, codec: C, clock: Arc<dyn Clock>) -> anyhow::Result<Engine<C>> {
        if let Some(max_payload) = codec.max_transfer_payload() {
            if config.max_frame_payload > max_payload {
                bail!("max frame payload ({}) exceeds the largest payload the codec can frame ({})", config.max_frame_payload, max_payload);
            }
        }

        let io = FrameIo::new(config.max_output_per_tick);
        let mux = LinkMux::new(config, clock.now())?;

        Ok(Engine {
            mux,
            io,
            codec,
            clock,
            inbound: BytesMut::new(),
            outbound: BytesMut::new(),
        })
    }

    pub fn mux(&self) -> &LinkMux {
        &self.mux
    }

    pub fn mux_mut(&mut self) -> &mut LinkMux {
        &mut self.mux
    }

    pub fn codec(&self) -> &C {
        &self.codec
    }

    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Buffers bytes received from the peer. They are decoded on the next tick.
    pub fn input(&mut self, bytes: &[u8]) {
        self.inbound.extend_from_slice(bytes);
    }

    /// Does all pending work: decodes and dispatches inbound frames, aborts idle deliveries,
    ///  purges settled deliveries and encodes outbound frames up to the output budget.
    ///
    /// Returns when the engine wants to be ticked next: `now` if there is outbound work left,
    ///  the next idle deadline otherwise.
    ///
    /// An error means the connection is unusable, e.g. because the peer sent a frame for an
    ///  unattached handle or bytes the codec could not decode.
    pub fn tick(&mut self, now: Instant) -> anyhow::Result<Option<Instant>> {
        self.mux.set_now(now);

        let num_read = self.io.read_frames(&self.codec, &mut self.inbound, &mut self.mux)?;
        let num_expired = self.mux.expire_idle();
        self.mux.purge_settled();
        let num_written = self.io.write_frames(&self.codec, &mut self.mux, &mut self.outbound)?;

        if num_read + num_expired + num_written > 0 {
            trace!("tick: {} frames read, {} deliveries expired, {} frames written", num_read, num_expired, num_written);
        }
        Ok(self.next_deadline())
    }

    /// [Engine::tick] with the current time from the engine's clock
    pub fn poll(&mut self) -> anyhow::Result<Option<Instant>> {
        let now = self.clock.now();
        self.tick(now)
    }

    fn next_deadline(&self) -> Option<Instant> {
        if self.mux.has_outbound() || self.io.has_held() {
            Some(self.mux.now())
        }
        else {
            self.mux.next_idle_deadline()
        }
    }

    /// takes all bytes encoded so far
    pub fn output(&mut self) -> Bytes {
        self.outbound.split().freeze()
    }

    pub fn has_output(&self) -> bool {
        !self.outbound.is_empty()
    }

    pub fn poll_event(&mut self) -> Option<LinkEvent> {
        self.mux.poll_event()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::{ManualClock, MockClock};
    use crate::codec::BinaryFrameCodec;
    use crate::delivery::{DeliveryState, Received};
    use crate::error::LinkError;
    use crate::frame::{Detach, Frame, Handle, Outcome};
    use rstest::rstest;
    use std::time::Duration;

    type TestEngine = Engine<BinaryFrameCodec>;

    fn engine(config: EngineConfig, clock: &Arc<ManualClock>) -> TestEngine {
        Engine::new(config, BinaryFrameCodec::default(), clock.clone()).unwrap()
    }

    /// ticks both engines and moves their output across until neither has anything to say
    fn exchange(a: &mut TestEngine, b: &mut TestEngine) {
        loop {
            a.poll().unwrap();
            let a_out = a.output();
            b.input(&a_out);
            b.poll().unwrap();
            let b_out = b.output();
            a.input(&b_out);

            if a_out.is_empty() && b_out.is_empty() && !a.mux().has_outbound() && !b.mux().has_outbound() {
                return;
            }
        }
    }

    /// a client engine with an attached sender "queue" and a server engine with the matching
    ///  receiver
    fn connected(config: EngineConfig, clock: &Arc<ManualClock>) -> (TestEngine, TestEngine, Handle, Handle) {
        let mut client = engine(config, clock);
        let mut server = engine(EngineConfig::default(), clock);

        let sender = client.mux_mut().create_sender("queue").unwrap();
        client.mux_mut().sender(sender).unwrap().attach().unwrap();
        exchange(&mut client, &mut server);

        let receiver = server.mux().handle_by_name("queue").unwrap();
        while client.poll_event().is_some() {}
        while server.poll_event().is_some() {}
        (client, server, sender, receiver)
    }

    fn clock() -> Arc<ManualClock> {
        Arc::new(ManualClock::new(Instant::now()))
    }

    #[test]
    fn test_two_fragment_receive() {
        let clock = clock();
        let (mut client, mut server, s, r) = connected(EngineConfig::default(), &clock);
        server.mux_mut().receiver(r).unwrap().flow(5).unwrap();
        exchange(&mut client, &mut server);
        assert_eq!(client.mux().get(s).unwrap().credit(), 5);

        {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            sender.send(d, "HEL", true).unwrap();
            sender.send(d, "LO", false).unwrap();
        }
        exchange(&mut client, &mut server);

        let mut receiver = server.mux_mut().receiver(r).unwrap();
        let d = receiver.next().unwrap().unwrap();
        let mut buf = [0u8; 8];
        assert_eq!(receiver.recv(&mut buf, 0, 8), Ok(Received::Bytes(5)));
        assert_eq!(&buf[..5], b"HELLO");
        assert_eq!(receiver.recv(&mut buf, 0, 8), Ok(Received::End));
        assert_eq!(receiver.credit(), 4);
        assert_eq!(receiver.delivery_state(d), Ok(DeliveryState::Complete));
    }

    #[test]
    fn test_send_without_credit() {
        let clock = clock();
        let (mut client, mut server, s, r) = connected(EngineConfig::default(), &clock);

        let d = {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            assert_eq!(sender.send(d, "X", false), Err(LinkError::NoCredit));
            d
        };
        exchange(&mut client, &mut server);
        assert_eq!(server.mux().get(r).unwrap().num_deliveries(), 0);

        server.mux_mut().receiver(r).unwrap().flow(2).unwrap();
        exchange(&mut client, &mut server);

        assert_eq!(client.mux().get(s).unwrap().credit(), 1);
        assert_eq!(client.mux().get(s).unwrap().delivery_state(d), Ok(DeliveryState::Complete));

        let mut receiver = server.mux_mut().receiver(r).unwrap();
        let tag = receiver.next().unwrap().unwrap();
        let mut body = Vec::new();
        assert_eq!(receiver.recv_delivery(tag, &mut body), Ok(false));
        assert_eq!(body, b"X");
    }

    #[test]
    fn test_abort_mid_delivery() {
        let clock = clock();
        let (mut client, mut server, s, r) = connected(EngineConfig::default(), &clock);
        server.mux_mut().receiver(r).unwrap().flow(1).unwrap();
        exchange(&mut client, &mut server);

        let d = {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            sender.send(d, "AB", true).unwrap();
            sender.abort(d).unwrap();
            assert!(matches!(sender.send(d, "C", false), Err(LinkError::InvalidState(_))));
            d
        };

        let mut out = BytesMut::new();
        while client.poll().unwrap().is_some() {
            out.extend_from_slice(&client.output());
        }
        out.extend_from_slice(&client.output());
        server.input(&out);

        let codec = BinaryFrameCodec::default();
        let mut transfers = Vec::new();
        while let Some(frame) = codec.decode(&mut out).unwrap() {
            if let Frame::Transfer(t) = frame {
                transfers.push((t.payload, t.more, t.aborted));
            }
        }
        assert_eq!(transfers, vec![(Bytes::from_static(b"AB"), true, false), (Bytes::new(), false, true)]);

        exchange(&mut client, &mut server);
        assert_eq!(server.mux().get(r).unwrap().delivery_state(d), Ok(DeliveryState::Aborted));
        let mut receiver = server.mux_mut().receiver(r).unwrap();
        assert_eq!(receiver.next(), Ok(Some(d)));
        let mut buf = [0u8; 4];
        assert_eq!(receiver.recv(&mut buf, 0, 4), Ok(Received::End));
    }

    #[test]
    fn test_outcome_round_trip() {
        let clock = clock();
        let (mut client, mut server, s, r) = connected(EngineConfig::default(), &clock);
        server.mux_mut().receiver(r).unwrap().flow(1).unwrap();
        exchange(&mut client, &mut server);

        let d = {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            sender.send(d, "msg", false).unwrap();
            d
        };
        exchange(&mut client, &mut server);

        {
            let mut receiver = server.mux_mut().receiver(r).unwrap();
            let tag = receiver.next().unwrap().unwrap();
            receiver.disposition(tag, Outcome::Rejected).unwrap();
            receiver.settle(tag).unwrap();
        }
        exchange(&mut client, &mut server);

        {
            let mut sender = client.mux_mut().sender(s).unwrap();
            assert_eq!(sender.remote_outcome(d), Ok(Some(Outcome::Rejected)));
            assert_eq!(sender.remote_settled(d), Ok(true));
            sender.settle(d).unwrap();
        }
        exchange(&mut client, &mut server);

        assert_eq!(client.mux().get(s).unwrap().num_deliveries(), 0);
        assert_eq!(server.mux().get(r).unwrap().num_deliveries(), 0);
    }

    #[test]
    fn test_fragments_spread_over_ticks() {
        let clock = clock();
        let config = EngineConfig { max_frame_payload: 4, max_output_per_tick: 16, ..EngineConfig::default() };
        let (mut client, mut server, s, r) = connected(config, &clock);
        server.mux_mut().receiver(r).unwrap().flow(1).unwrap();
        exchange(&mut client, &mut server);

        {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            sender.send(d, "0123456789abcdef", false).unwrap();
        }

        let now = clock.now();
        let mut num_ticks = 0;
        loop {
            num_ticks += 1;
            let deadline = client.tick(now).unwrap();
            let out = client.output();
            assert!(out.len() <= 16);
            server.input(&out);
            if deadline != Some(now) {
                break;
            }
        }
        assert!(num_ticks > 1);

        server.poll().unwrap();
        let mut receiver = server.mux_mut().receiver(r).unwrap();
        let tag = receiver.next().unwrap().unwrap();
        let mut body = Vec::new();
        assert_eq!(receiver.recv_delivery(tag, &mut body), Ok(false));
        assert_eq!(body, b"0123456789abcdef");
    }

    #[test]
    fn test_idle_deadline() {
        let clock = clock();
        let start = clock.now();
        let config = EngineConfig { delivery_idle_timeout: Some(Duration::from_secs(10)), ..EngineConfig::default() };
        let (mut client, mut server, s, r) = connected(config, &clock);
        server.mux_mut().receiver(r).unwrap().flow(1).unwrap();
        exchange(&mut client, &mut server);
        assert_eq!(client.poll().unwrap(), None);

        {
            let mut sender = client.mux_mut().sender(s).unwrap();
            let d = sender.delivery().unwrap();
            sender.send(d, "part", true).unwrap();
        }
        assert_eq!(client.poll().unwrap(), Some(start + Duration::from_secs(10)));
        server.input(&client.output());
        server.poll().unwrap();

        clock.advance(Duration::from_secs(11));
        client.poll().unwrap();
        server.input(&client.output());
        server.poll().unwrap();

        let tag = server.mux_mut().receiver(r).unwrap().next().unwrap().unwrap();
        assert_eq!(server.mux().get(r).unwrap().delivery_state(tag), Ok(DeliveryState::Aborted));
    }

    #[test]
    fn test_poll_uses_clock() {
        let now = Instant::now();
        let mut clock = MockClock::new();
        clock.expect_now().times(2).return_const(now);

        let mut engine = Engine::new(EngineConfig::default(), BinaryFrameCodec::default(), Arc::new(clock)).unwrap();
        assert_eq!(engine.poll().unwrap(), None);
        assert_eq!(engine.mux().now(), now);
    }

    #[rstest]
    #[case::fits(1024, 1024 - 17, true)]
    #[case::too_large(1024, 1024, false)]
    fn test_payload_must_fit_codec(#[case] max_frame_size: usize, #[case] max_frame_payload: usize, #[case] expected_ok: bool) {
        let config = EngineConfig { max_frame_payload, ..EngineConfig::default() };
        let result = Engine::new(config, BinaryFrameCodec::new(max_frame_size), clock());
        assert_eq!(result.is_ok(), expected_ok);
    }

    #[test]
    fn test_garbage_input() {
        let clock = clock();
        let mut engine = engine(EngineConfig::default(), &clock);
        engine.input(&[0, 0, 0, 2, 99, 99]);
        assert!(engine.poll().is_err());
    }

    #[test]
    fn test_unattached_handle() {
        let clock = clock();
        let mut engine = engine(EngineConfig::default(), &clock);

        let mut bytes = BytesMut::new();
        BinaryFrameCodec::default().encode(&Frame::Detach(Detach { handle: Handle::from_raw(4), closed: true, condition: None }), &mut bytes).unwrap();
        engine.input(&bytes);

        assert!(engine.poll().is_err());
    }
}
