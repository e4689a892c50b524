//! Runs an [Engine] over an async byte stream in a tokio task.
//!
//! The task owns both halves of the stream. It feeds received bytes to the engine, ticks it,
//!  writes the output, and then sleeps until more bytes arrive, the application touched the
//!  engine through an [EngineHandle], or the engine's next deadline passes.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::sync::{Mutex, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, error, trace};

use crate::engine::Engine;
use crate::frame_io::FrameCodec;

const READ_BUFFER_SIZE: usize = 16*1024;

/// Shared access to a driven engine. Cloning is cheap.
pub struct EngineHandle<C: FrameCodec> {
    engine: Arc<Mutex<Engine<C>>>,
    wakeup: Arc<Notify>,
}

impl<C: FrameCodec> Clone for EngineHandle<C> {
    fn clone(&self) -> Self {
        EngineHandle {
            engine: self.engine.clone(),
            wakeup: self.wakeup.clone(),
        }
    }
}

impl<C: FrameCodec> EngineHandle<C> {
    /// Runs `f` on the engine and wakes the driver, so that frames `f` queued go out without
    ///  waiting for the peer.
    pub async fn with<R>(&self, f: impl FnOnce(&mut Engine<C>) -> R) -> R {
        let result = {
            let mut engine = self.engine.lock().await;
            f(&mut engine)
        };
        self.wakeup.notify_one();
        result
    }
}

pub struct EngineDriver;

impl EngineDriver {
    pub fn spawn<C, S>(engine: Engine<C>, stream: S) -> (EngineHandle<C>, JoinHandle<anyhow::Result<()>>)
    where
        C: FrameCodec + 'static,
        S: AsyncRead + AsyncWrite + Send + 'static,
    {
        let handle = EngineHandle {
            engine: Arc::new(Mutex::new(engine)),
            wakeup: Arc::new(Notify::new()),
        };

        let cloned_handle = handle.clone();
        let join_handle = tokio::spawn(async move {
            let result = Self::run(cloned_handle, stream).await;
            if let Err(e) = &result {
                error!("engine driver terminated: {:#}", e);
            }
            result
        });

        (handle, join_handle)
    }

    /// Returns `Ok` when the peer closes the stream
    async fn run<C, S>(handle: EngineHandle<C>, stream: S) -> anyhow::Result<()>
    where
        C: FrameCodec,
        S: AsyncRead + AsyncWrite,
    {
        let (mut reader, mut writer) = tokio::io::split(stream);
        let mut read_buf = vec![0u8; READ_BUFFER_SIZE];

        loop {
            let (output, sleep_duration) = {
                let mut engine = handle.engine.lock().await;
                let deadline = engine.poll()?;
                let now = engine.clock().now();
                (engine.output(), deadline.map(|d| d.saturating_duration_since(now)))
            };

            if !output.is_empty() {
                trace!("writing {} bytes", output.len());
                writer.write_all(&output).await
                    .context("error writing to the connection")?;
                writer.flush().await
                    .context("error flushing the connection")?;
            }

            if sleep_duration.is_some_and(|d| d.is_zero()) {
                tokio::task::yield_now().await;
                continue;
            }

            tokio::select! {
                n = reader.read(&mut read_buf) => {
                    let n = n.context("error reading from the connection")?;
                    if n == 0 {
                        debug!("connection closed by the peer");
                        return Ok(());
                    }
                    trace!("read {} bytes", n);
                    handle.engine.lock().await
                        .input(&read_buf[..n]);
                }
                _ = handle.wakeup.notified() => {}
                _ = Self::sleep(sleep_duration) => {}
            }
        }
    }

    async fn sleep(duration: Option<Duration>) {
        match duration {
            Some(duration) => tokio::time::sleep(duration).await,
            None => std::future::pending().await,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::TokioClock;
    use crate::codec::BinaryFrameCodec;
    use crate::config::EngineConfig;
    use crate::delivery::DeliveryState;
    use crate::frame::{DeliveryTag, Frame, Handle, Transfer};
    use crate::mux::LinkEvent;
    use bytes::{Bytes, BytesMut};
    use tokio::runtime::Builder;

    fn engine() -> Engine<BinaryFrameCodec> {
        Engine::new(EngineConfig::default(), BinaryFrameCodec::default(), Arc::new(TokioClock)).unwrap()
    }

    /// polls `f` until it returns a value, giving the drivers time to exchange frames
    async fn eventually<R>(handle: &EngineHandle<BinaryFrameCodec>, mut f: impl FnMut(&mut Engine<BinaryFrameCodec>) -> Option<R>) -> R {
        for _ in 0..100 {
            if let Some(result) = handle.with(&mut f).await {
                return result;
            }
            tokio::time::sleep(Duration::from_millis(10)).await;
        }
        panic!("condition not reached");
    }

    #[test]
    fn test_message_over_duplex_stream() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (client_stream, server_stream) = tokio::io::duplex(4096);
            let (client, client_join) = EngineDriver::spawn(engine(), client_stream);
            let (server, server_join) = EngineDriver::spawn(engine(), server_stream);

            let s = client.with(|e| {
                let s = e.mux_mut().create_sender("queue")?;
                e.mux_mut().sender(s)?.attach()?;
                Ok::<_, anyhow::Error>(s)
            }).await.unwrap();

            let r = eventually(&server, |e| match e.poll_event() {
                Some(LinkEvent::RemoteAttached { handle }) => Some(handle),
                _ => None,
            }).await;
            server.with(|e| e.mux_mut().receiver(r).unwrap().flow(1).unwrap()).await;

            eventually(&client, |e| (e.mux().get(s).unwrap().credit() == 1).then_some(())).await;
            client.with(|e| {
                let mut sender = e.mux_mut().sender(s).unwrap();
                let d = sender.delivery().unwrap();
                sender.send(d, "over the wire", false).unwrap();
            }).await;

            let body = eventually(&server, |e| {
                let mut receiver = e.mux_mut().receiver(r).unwrap();
                let tag = receiver.next().unwrap()?;
                let mut body = Vec::new();
                receiver.recv_delivery(tag, &mut body).unwrap();
                Some(body)
            }).await;
            assert_eq!(body, b"over the wire");

            drop(client);
            client_join.abort();
            assert!(server_join.await.unwrap().is_ok());
        });
    }

    #[test]
    fn test_protocol_error_terminates_driver() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let (mut peer, stream) = tokio::io::duplex(4096);
            let (_handle, join) = EngineDriver::spawn(engine(), stream);

            // a transfer for a handle the peer never attached
            let mut bytes = BytesMut::new();
            BinaryFrameCodec::default().encode(&Frame::Transfer(Transfer {
                handle: Handle::from_raw(3),
                delivery_tag: DeliveryTag::ZERO,
                more: false,
                aborted: false,
                settled: false,
                payload: Bytes::new(),
            }), &mut bytes).unwrap();
            peer.write_all(&bytes).await.unwrap();

            assert!(join.await.unwrap().is_err());
        });
    }

    #[test]
    fn test_idle_deadline_wakes_driver() {
        let rt = Builder::new_current_thread().enable_all().start_paused(true).build().unwrap();
        rt.block_on(async {
            let config = EngineConfig { delivery_idle_timeout: Some(Duration::from_secs(30)), ..EngineConfig::default() };
            let client_engine = Engine::new(config, BinaryFrameCodec::default(), Arc::new(TokioClock)).unwrap();

            let (client_stream, server_stream) = tokio::io::duplex(4096);
            let (client, _client_join) = EngineDriver::spawn(client_engine, client_stream);
            let (server, _server_join) = EngineDriver::spawn(engine(), server_stream);

            let s = client.with(|e| {
                let s = e.mux_mut().create_sender("queue").unwrap();
                e.mux_mut().sender(s).unwrap().attach().unwrap();
                s
            }).await;
            let r = eventually(&server, |e| e.mux().handle_by_name("queue")).await;
            server.with(|e| e.mux_mut().receiver(r).unwrap().flow(1).unwrap()).await;
            eventually(&client, |e| (e.mux().get(s).unwrap().credit() == 1).then_some(())).await;

            let d = client.with(|e| {
                let mut sender = e.mux_mut().sender(s).unwrap();
                let d = sender.delivery().unwrap();
                sender.send(d, "never finished", true).unwrap();
                d
            }).await;

            // nobody touches the engines, only the idle deadline can trigger the abort
            tokio::time::sleep(Duration::from_secs(31)).await;

            let state = server.with(|e| e.mux().get(r).unwrap().delivery_state(d)).await;
            assert_eq!(state, Ok(DeliveryState::Aborted));
        });
    }
}
