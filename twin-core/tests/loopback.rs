//! Primary link against a peer responder over the in-memory loopback.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use twin_core::config::LinkConfig;
use twin_core::{
    loopback_pair, ChannelKind, Command, Config, EventId, Link, LinkError, PeerEvent, Policy,
    Responder, SharedLink, StatusCode, SystemClock, TwinCore,
};

/// Run a responder until `stop` is set; returns every event it produced.
fn spawn_peer(
    link: Link<twin_core::LoopbackTransport>,
    stop: Arc<AtomicBool>,
) -> thread::JoinHandle<(Vec<PeerEvent>, Link<twin_core::LoopbackTransport>)> {
    thread::spawn(move || {
        let mut responder = Responder::new(link);
        let mut events = Vec::new();
        while !stop.load(Ordering::Relaxed) {
            match responder.serve_once(10) {
                Ok(Some(ev)) => events.push(ev),
                Ok(None) => {}
                Err(e) => panic!("peer failed: {e}"),
            }
        }
        (events, responder.into_link())
    })
}

#[test]
fn ping_and_status_round_trip() {
    let (a, b) = loopback_pair(8192);
    let stop = Arc::new(AtomicBool::new(false));
    let peer = spawn_peer(Link::new(b), stop.clone());

    let mut link = Link::new(a);
    let mut status = [0u8; 8];
    let n = link
        .send_command(Command::Ping, &[], Some(&mut status), 500)
        .unwrap();
    assert_eq!(n, 1);
    assert_eq!(status[0], StatusCode::Success as u8);

    let n = link
        .send_command(Command::GetStatus, &[], Some(&mut status), 500)
        .unwrap();
    assert_eq!(n, 5);
    assert_eq!(status[0], StatusCode::Success as u8);
    let seen = u32::from_le_bytes([status[1], status[2], status[3], status[4]]);
    assert_eq!(seen, 2);

    // Ack-only command.
    assert_eq!(
        link.send_command(Command::ExecutePayload, b"args", None, 500).unwrap(),
        0
    );

    stop.store(true, Ordering::Relaxed);
    let (events, _) = peer.join().unwrap();
    assert!(events.contains(&PeerEvent::Command {
        command: Command::ExecutePayload,
        sequence: 2,
        args: b"args".to_vec(),
    }));
}

#[test]
fn events_flow_both_ways() {
    let (a, b) = loopback_pair(8192);
    let stop = Arc::new(AtomicBool::new(false));
    let peer = spawn_peer(Link::new(b), stop.clone());

    let mut link = Link::new(a);
    let seq = link.trigger_event(EventId::OsDetected, &[2]).unwrap();
    thread::sleep(Duration::from_millis(50));
    stop.store(true, Ordering::Relaxed);
    let (events, mut peer_link) = peer.join().unwrap();
    assert_eq!(
        events,
        vec![PeerEvent::Event {
            id: EventId::OsDetected.to_u32(),
            sequence: seq,
            data: vec![2],
        }]
    );

    // The peer acknowledged; now it raises an event and the primary waits for it.
    let sender = thread::spawn(move || {
        thread::sleep(Duration::from_millis(20));
        peer_link
            .trigger_event(EventId::ButtonPressed, b"long")
            .unwrap();
        peer_link
    });
    let data = link.wait_for_event(EventId::ButtonPressed, 1000).unwrap();
    assert_eq!(data, b"long".to_vec());
    let mut peer_link = sender.join().unwrap();
    let ack = peer_link.recv_packet(200).unwrap().unwrap();
    assert_eq!(ack.packet_type(), twin_core::PacketType::Ack);
}

#[test]
fn command_without_peer_times_out() {
    let (a, _b) = loopback_pair(1024);
    let mut link = Link::new(a);
    assert!(matches!(
        link.send_command(Command::Ping, &[], None, 40),
        Err(LinkError::Timeout)
    ));
}

#[test]
fn scheduler_streams_over_relayed_channels() {
    let (a, b) = loopback_pair(64 * 1024);
    let stop = Arc::new(AtomicBool::new(false));
    let peer = spawn_peer(Link::new(b), stop.clone());

    let link = SharedLink::new(a, LinkConfig::default());
    let mut core = TwinCore::new(Config::default(), Arc::new(SystemClock::new())).unwrap();
    core.attach(ChannelKind::Wifi, Box::new(link.sink(ChannelKind::Wifi)));
    core.attach(ChannelKind::Bluetooth, Box::new(link.sink(ChannelKind::Bluetooth)));
    assert!(core.establish(ChannelKind::Wifi, 500));
    assert!(core.establish(ChannelKind::Bluetooth, 500));

    let payload: Vec<u8> = (0..2500u32).map(|i| (i % 251) as u8).collect();
    core.queue_data("log", payload.clone(), Policy::Speed, true).unwrap();
    core.queue_data("cfg", vec![9u8; 100], Policy::Stealth, false).unwrap();
    let ticks = core.run_until_idle(20);
    assert!(core.is_complete("log"));
    assert!(core.is_complete("cfg"));
    assert_eq!(ticks, 3);

    thread::sleep(Duration::from_millis(100));
    stop.store(true, Ordering::Relaxed);
    let (events, _) = peer.join().unwrap();

    let mut wifi = Vec::new();
    let mut bt = Vec::new();
    for ev in events {
        if let PeerEvent::Data { channel, bytes } = ev {
            if channel == ChannelKind::Wifi.id() {
                wifi.extend_from_slice(&bytes);
            } else if channel == ChannelKind::Bluetooth.id() {
                bt.extend_from_slice(&bytes);
            }
        }
    }
    // Session header (16) + name, then the body, byte for byte.
    assert_eq!(&wifi[16..19], b"log");
    assert_eq!(&wifi[19..], payload.as_slice());
    assert_eq!(&bt[16..19], b"cfg");
    assert_eq!(&bt[19..], &[9u8; 100][..]);
}
