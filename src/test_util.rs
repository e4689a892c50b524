use std::time::Instant;

use crate::config::EngineConfig;
use crate::frame::Handle;
use crate::mux::LinkMux;

pub fn test_mux(config: EngineConfig) -> LinkMux {
    LinkMux::new(config, Instant::now())
        .expect("test config should be valid")
}

/// Moves frames between two muxes in both directions until neither has anything left to
///  send, returning the number of frames moved
pub fn pump(a: &mut LinkMux, b: &mut LinkMux) -> usize {
    let mut num_moved = 0;
    loop {
        let mut progress = false;
        while let Some(frame) = a.poll_frame() {
            b.on_frame(frame).expect("frame should be accepted");
            num_moved += 1;
            progress = true;
        }
        while let Some(frame) = b.poll_frame() {
            a.on_frame(frame).expect("frame should be accepted");
            num_moved += 1;
            progress = true;
        }
        if !progress {
            return num_moved;
        }
    }
}

/// Two muxes with a link `name` attached between them, a sender on the first and a receiver on
///  the second. Events from the attach handshake are drained.
pub fn connected_pair(name: &str) -> (LinkMux, LinkMux, Handle, Handle) {
    let mut client = test_mux(EngineConfig::default());
    let mut server = test_mux(EngineConfig::default());

    let sender = client.create_sender(name).unwrap();
    client.sender(sender).unwrap().attach().unwrap();
    pump(&mut client, &mut server);

    let receiver = server.handle_by_name(name)
        .expect("peer attach should create the receiver");
    while client.poll_event().is_some() {}
    while server.poll_event().is_some() {}

    (client, server, sender, receiver)
}
