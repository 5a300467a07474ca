//! Control-plane behavior over real localhost sockets.
//!
//! Each test stands up the dispatcher with its registries and drives it by
//! handing messages straight to the router, observing what reaches fake
//! clients and plugins bound on ephemeral ports.

use m1_system_helper::clients::ClientKind;
use m1_system_helper::events::EventBus;
use m1_system_helper::mixer::SpatialMixer;
use m1_system_helper::osc::sender::OscSender;
use m1_system_helper::osc::OscDispatcher;
use m1_system_helper::plugins::PluginRegistry;
use m1_system_helper::clients::ClientRegistry;
use m1_system_helper::supervisor::{ServiceCommands, Supervisor};
use m1_system_helper::tracker::PannerTracker;
use rosc::{decoder, OscMessage, OscPacket, OscType};
use std::net::UdpSocket;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A fake client/plugin endpoint on an ephemeral localhost port. Messages
/// read while looking for a specific address are buffered, not dropped.
struct Probe {
    socket: UdpSocket,
    pending: std::cell::RefCell<std::collections::VecDeque<OscMessage>>,
}

impl Probe {
    fn new() -> Self {
        let socket = UdpSocket::bind("127.0.0.1:0").unwrap();
        socket
            .set_read_timeout(Some(Duration::from_millis(100)))
            .unwrap();
        Self {
            socket,
            pending: std::cell::RefCell::new(std::collections::VecDeque::new()),
        }
    }

    fn port(&self) -> u16 {
        self.socket.local_addr().unwrap().port()
    }

    fn recv_socket(&self) -> Option<OscMessage> {
        let mut buf = [0u8; 4096];
        let (len, _) = self.socket.recv_from(&mut buf).ok()?;
        match decoder::decode_udp(&buf[..len]).ok()?.1 {
            OscPacket::Message(msg) => Some(msg),
            OscPacket::Bundle(_) => None,
        }
    }

    fn try_recv(&self) -> Option<OscMessage> {
        if let Some(msg) = self.pending.borrow_mut().pop_front() {
            return Some(msg);
        }
        self.recv_socket()
    }

    /// Wait (up to 2 s) for a message with the given address; anything else
    /// read along the way stays queued for later expectations.
    fn expect(&self, addr: &str) -> OscMessage {
        let queued = self
            .pending
            .borrow()
            .iter()
            .position(|msg| msg.addr == addr);
        if let Some(pos) = queued {
            return self.pending.borrow_mut().remove(pos).unwrap();
        }
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if let Some(msg) = self.recv_socket() {
                if msg.addr == addr {
                    return msg;
                }
                self.pending.borrow_mut().push_back(msg);
            }
        }
        panic!("no {addr} message arrived");
    }

    /// Drain everything currently queued.
    fn drain(&self) {
        self.pending.borrow_mut().clear();
        while self.recv_socket().is_some() {}
    }

    /// Assert that no message with the given address arrives for a while.
    fn assert_silent(&self, addr: &str) {
        assert!(
            !self.pending.borrow().iter().any(|msg| msg.addr == addr),
            "unexpected queued {addr}"
        );
        let deadline = Instant::now() + Duration::from_millis(250);
        while Instant::now() < deadline {
            if let Some(msg) = self.recv_socket() {
                assert_ne!(msg.addr, addr, "unexpected {addr}: {msg:?}");
                self.pending.borrow_mut().push_back(msg);
            }
        }
    }
}

fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
    OscMessage {
        addr: addr.to_string(),
        args,
    }
}

fn dispatcher() -> (OscDispatcher, Arc<ClientRegistry>, Arc<PluginRegistry>, Arc<PannerTracker>) {
    let sender = Arc::new(OscSender::new().unwrap());
    let events = Arc::new(EventBus::new());
    let clients = Arc::new(ClientRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
    let plugins = Arc::new(PluginRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
    let tracker = Arc::new(PannerTracker::new(Arc::clone(&events)));
    let mixer = Arc::new(SpatialMixer::default());
    let supervisor = Arc::new(Supervisor::with_commands(1, ServiceCommands::disabled()));
    let dispatcher = OscDispatcher::bind(
        0,
        sender,
        Arc::clone(&clients),
        Arc::clone(&plugins),
        Arc::clone(&tracker),
        mixer,
        supervisor,
    )
    .unwrap();
    (dispatcher, clients, plugins, tracker)
}

#[test]
fn test_add_client_replies_with_connection_id() {
    let (dispatcher, clients, _plugins, _tracker) = dispatcher();
    let monitor = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(monitor.port() as i32),
            OscType::String("monitor".into()),
        ],
    ));

    let reply = monitor.expect("/connectedToServer");
    assert_eq!(reply.args, vec![OscType::Int(0)]);
    assert_eq!(clients.count(), 1);
    assert_eq!(clients.find(monitor.port()).unwrap().kind, ClientKind::Monitor);

    // The first monitor is immediately activated.
    let activate = monitor.expect("/m1-activate-client");
    assert_eq!(activate.args[0], OscType::Int(1));
}

#[test]
fn test_status_pulse_replies_response_or_reconnect() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let known = Probe::new();
    let stranger = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(known.port() as i32),
            OscType::String("player".into()),
        ],
    ));
    known.drain();

    dispatcher.handle_message(&message(
        "/m1-status",
        vec![OscType::Int(known.port() as i32)],
    ));
    known.expect("/m1-response");

    dispatcher.handle_message(&message(
        "/m1-status",
        vec![OscType::Int(stranger.port() as i32)],
    ));
    stranger.expect("/m1-reconnect-req");
}

#[test]
fn test_remove_client_broadcasts_updated_count() {
    let (dispatcher, clients, _plugins, _tracker) = dispatcher();
    let going = Probe::new();
    let staying = Probe::new();

    for probe in [&going, &staying] {
        dispatcher.handle_message(&message(
            "/m1-addClient",
            vec![
                OscType::Int(probe.port() as i32),
                OscType::String("player".into()),
            ],
        ));
    }
    going.drain();
    staying.drain();

    dispatcher.handle_message(&message(
        "/m1-removeClient",
        vec![OscType::Int(going.port() as i32)],
    ));

    let update = staying.expect("/connectedClientsUpdate");
    assert_eq!(update.args, vec![OscType::Int(1)]);
    assert_eq!(clients.count(), 1);
}

#[test]
fn test_master_ypr_broadcast_is_deduplicated() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let plugin_a = Probe::new();
    let plugin_b = Probe::new();

    for probe in [&plugin_a, &plugin_b] {
        dispatcher.handle_message(&message(
            "/m1-register-plugin",
            vec![OscType::Int(probe.port() as i32)],
        ));
    }
    // Registration pushes the current orientation; clear those out.
    std::thread::sleep(Duration::from_millis(50));
    plugin_a.drain();
    plugin_b.drain();

    dispatcher.handle_message(&message(
        "/setMasterYPR",
        vec![
            OscType::Float(10.0),
            OscType::Float(20.0),
            OscType::Float(30.0),
        ],
    ));

    for probe in [&plugin_a, &plugin_b] {
        let msg = probe.expect("/monitor-settings");
        assert_eq!(
            msg.args,
            vec![
                OscType::Int(0),
                OscType::Float(10.0),
                OscType::Float(20.0),
                OscType::Float(30.0),
            ]
        );
        // Exactly once.
        probe.assert_silent("/monitor-settings");
    }

    // Unchanged orientation sends nothing.
    dispatcher.handle_message(&message(
        "/setMasterYPR",
        vec![
            OscType::Float(10.0),
            OscType::Float(20.0),
            OscType::Float(30.0),
        ],
    ));
    plugin_a.assert_silent("/monitor-settings");
    plugin_b.assert_silent("/monitor-settings");
}

#[test]
fn test_monitoring_mode_change_pushes_with_current_ypr() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let plugin = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-register-plugin",
        vec![OscType::Int(plugin.port() as i32)],
    ));
    std::thread::sleep(Duration::from_millis(50));
    plugin.drain();

    dispatcher.handle_message(&message("/setMonitoringMode", vec![OscType::Int(2)]));
    let msg = plugin.expect("/monitor-settings");
    assert_eq!(msg.args[0], OscType::Int(2));

    // Same mode again: deduplicated.
    dispatcher.handle_message(&message("/setMonitoringMode", vec![OscType::Int(2)]));
    plugin.assert_silent("/monitor-settings");
}

#[test]
fn test_monitor_rotation_reactivates() {
    let (dispatcher, clients, _plugins, _tracker) = dispatcher();
    let monitors = [Probe::new(), Probe::new(), Probe::new()];

    for probe in &monitors {
        dispatcher.handle_message(&message(
            "/m1-addClient",
            vec![
                OscType::Int(probe.port() as i32),
                OscType::String("monitor".into()),
            ],
        ));
    }
    std::thread::sleep(Duration::from_millis(50));
    for probe in &monitors {
        probe.drain();
    }

    dispatcher.handle_message(&message(
        "/setMonitorActiveReq",
        vec![OscType::Int(monitors[2].port() as i32)],
    ));

    // The rotated monitor hears activation 1; the others 0.
    assert_eq!(
        monitors[2].expect("/m1-activate-client").args[0],
        OscType::Int(1)
    );
    assert_eq!(
        monitors[0].expect("/m1-activate-client").args[0],
        OscType::Int(0)
    );
    assert_eq!(
        clients.monitor_order(),
        vec![
            monitors[2].port(),
            monitors[0].port(),
            monitors[1].port()
        ]
    );
}

#[test]
fn test_panner_settings_forwarded_to_players_and_disconnect_drops() {
    let (dispatcher, _clients, plugins, tracker) = dispatcher();
    let player = Probe::new();
    let plugin_port = 9400;

    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(player.port() as i32),
            OscType::String("player".into()),
        ],
    ));
    dispatcher.handle_message(&message(
        "/m1-register-plugin",
        vec![OscType::Int(plugin_port)],
    ));
    std::thread::sleep(Duration::from_millis(50));
    player.drain();

    let settings = message(
        "/panner-settings",
        vec![
            OscType::Int(plugin_port),
            OscType::Int(1),
            OscType::String("Keys".into()),
            OscType::Color(rosc::OscColor {
                red: 1,
                green: 2,
                blue: 3,
                alpha: 255,
            }),
            OscType::Int(0),
            OscType::Float(12.0),
            OscType::Float(-4.0),
            OscType::Float(55.0),
            OscType::Float(0.9),
            OscType::Int(0),
        ],
    );
    dispatcher.handle_message(&settings);

    // Full settings forwarded verbatim to players.
    let forwarded = player.expect("/panner-settings");
    assert_eq!(forwarded.args, settings.args);
    assert_eq!(plugins.find(plugin_port as u16).unwrap().name, "Keys");
    assert_eq!(tracker.snapshot().len(), 1);

    // state == -1 drops the plugin and relays the disconnect.
    dispatcher.handle_message(&message(
        "/panner-settings",
        vec![OscType::Int(plugin_port), OscType::Int(-1)],
    ));
    let disconnect = player.expect("/panner-settings");
    assert_eq!(
        disconnect.args,
        vec![OscType::Int(plugin_port), OscType::Int(-1)]
    );
    assert_eq!(plugins.count(), 0);
    assert!(tracker.snapshot().is_empty());
}

#[test]
fn test_channel_config_pushed_once_per_value() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let plugin = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-register-plugin",
        vec![OscType::Int(plugin.port() as i32)],
    ));
    std::thread::sleep(Duration::from_millis(50));
    plugin.drain();

    dispatcher.handle_message(&message("/setChannelConfigReq", vec![OscType::Int(14)]));
    let config = plugin.expect("/m1-channel-config");
    assert_eq!(config.args, vec![OscType::Int(14)]);

    dispatcher.handle_message(&message("/setChannelConfigReq", vec![OscType::Int(14)]));
    plugin.assert_silent("/m1-channel-config");

    dispatcher.handle_message(&message("/setChannelConfigReq", vec![OscType::Int(8)]));
    plugin.expect("/m1-channel-config");
}

#[test]
fn test_player_transport_forwards() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let player = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(player.port() as i32),
            OscType::String("player".into()),
        ],
    ));
    std::thread::sleep(Duration::from_millis(50));
    player.drain();

    dispatcher.handle_message(&message(
        "/setPlayerPosition",
        vec![OscType::Int(42), OscType::Float(12.5)],
    ));
    let position = player.expect("/playerPosition");
    assert_eq!(position.args, vec![OscType::Int(42), OscType::Float(12.5)]);

    dispatcher.handle_message(&message(
        "/setPlayerIsPlaying",
        vec![OscType::Int(43), OscType::Int(1)],
    ));
    let playing = player.expect("/playerIsPlaying");
    assert_eq!(playing.args, vec![OscType::Int(43), OscType::Int(1)]);

    dispatcher.handle_message(&message(
        "/setPlayerFrameRate",
        vec![OscType::Float(29.97)],
    ));
    let rate = player.expect("/playerFrameRate");
    assert_eq!(rate.args, vec![OscType::Float(29.97)]);
}

#[test]
fn test_player_ypr_offset_goes_to_monitors_only() {
    let (dispatcher, _clients, _plugins, _tracker) = dispatcher();
    let monitor = Probe::new();
    let player = Probe::new();

    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(monitor.port() as i32),
            OscType::String("monitor".into()),
        ],
    ));
    dispatcher.handle_message(&message(
        "/m1-addClient",
        vec![
            OscType::Int(player.port() as i32),
            OscType::String("player".into()),
        ],
    ));
    std::thread::sleep(Duration::from_millis(50));
    monitor.drain();
    player.drain();

    dispatcher.handle_message(&message(
        "/setPlayerYPR",
        vec![OscType::Float(5.0), OscType::Float(-2.0)],
    ));
    let offset = monitor.expect("/YPR-Offset");
    assert_eq!(offset.args, vec![OscType::Float(5.0), OscType::Float(-2.0)]);
    player.assert_silent("/YPR-Offset");
}

#[test]
fn test_malformed_messages_are_discarded() {
    let (dispatcher, clients, plugins, _tracker) = dispatcher();

    // Wrong arg types and missing args must not mutate anything or panic.
    dispatcher.handle_message(&message("/m1-addClient", vec![OscType::Float(1.0)]));
    dispatcher.handle_message(&message("/m1-addClient", vec![]));
    dispatcher.handle_message(&message("/m1-register-plugin", vec![OscType::String("x".into())]));
    dispatcher.handle_message(&message("/setMasterYPR", vec![OscType::Float(1.0)]));
    dispatcher.handle_message(&message("/panner-settings", vec![OscType::Int(9000)]));
    dispatcher.handle_message(&message("/no-such-address", vec![]));

    assert_eq!(clients.count(), 0);
    assert_eq!(plugins.count(), 0);
}
