//! OSC control plane.
//!
//! A UDP listener on the helper port routes messages by address pattern to the
//! client and plugin registries, relays panner settings and master orientation,
//! and keeps everybody alive with a ping/reap tick. All traffic is
//! localhost-only; malformed payloads are logged and discarded.

pub mod sender;

use crate::clients::{ClientKind, ClientRegistry};
use crate::error::{HelperError, Result};
use crate::mixer::SpatialMixer;
use crate::plugins::PluginRegistry;
use crate::supervisor::Supervisor;
use crate::tracker::PannerTracker;
use parking_lot::Mutex;
use rosc::{decoder, OscMessage, OscPacket, OscType};
use sender::OscSender;
use std::net::UdpSocket;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// Ping/reap cadence.
pub const PING_INTERVAL: Duration = Duration::from_millis(20);

struct MasterState {
    mode: i32,
    yaw: f32,
    pitch: f32,
    roll: f32,
    prev_mode: i32,
    prev_yaw: f32,
    prev_pitch: f32,
    prev_roll: f32,
    last_channel_count: i32,
}

impl Default for MasterState {
    fn default() -> Self {
        Self {
            mode: 0,
            yaw: 0.0,
            pitch: 0.0,
            roll: 0.0,
            prev_mode: 0,
            prev_yaw: 0.0,
            prev_pitch: 0.0,
            prev_roll: 0.0,
            last_channel_count: -1,
        }
    }
}

pub struct OscDispatcher {
    socket: UdpSocket,
    port: u16,
    sender: Arc<OscSender>,
    clients: Arc<ClientRegistry>,
    plugins: Arc<PluginRegistry>,
    tracker: Arc<PannerTracker>,
    mixer: Arc<SpatialMixer>,
    supervisor: Arc<Supervisor>,
    state: Mutex<MasterState>,
}

impl OscDispatcher {
    /// Bind the helper port. Failure here is fatal for the service.
    #[allow(clippy::too_many_arguments)]
    pub fn bind(
        port: u16,
        sender: Arc<OscSender>,
        clients: Arc<ClientRegistry>,
        plugins: Arc<PluginRegistry>,
        tracker: Arc<PannerTracker>,
        mixer: Arc<SpatialMixer>,
        supervisor: Arc<Supervisor>,
    ) -> Result<Self> {
        let socket = UdpSocket::bind(("127.0.0.1", port))
            .map_err(|source| HelperError::Bind { port, source })?;
        socket.set_read_timeout(Some(PING_INTERVAL))?;
        let port = socket.local_addr()?.port();
        tracing::info!(port, "OSC control plane listening");

        Ok(Self {
            socket,
            port,
            sender,
            clients,
            plugins,
            tracker,
            mixer,
            supervisor,
            state: Mutex::new(MasterState::default()),
        })
    }

    pub fn local_port(&self) -> u16 {
        self.port
    }

    /// Socket loop: receive, dispatch, tick. Checks the stop flag at the top
    /// of every cycle.
    pub fn run(&self, stop: &AtomicBool) {
        let mut buf = [0u8; 8192];
        let mut last_tick = Instant::now();

        while !stop.load(Ordering::Relaxed) {
            match self.socket.recv_from(&mut buf) {
                Ok((len, _)) => match decoder::decode_udp(&buf[..len]) {
                    Ok((_, packet)) => self.handle_packet(&packet),
                    Err(err) => tracing::debug!(%err, "undecodable OSC datagram"),
                },
                Err(err)
                    if err.kind() == std::io::ErrorKind::WouldBlock
                        || err.kind() == std::io::ErrorKind::TimedOut => {}
                Err(err) => tracing::warn!(%err, "socket receive failed"),
            }

            if last_tick.elapsed() >= PING_INTERVAL {
                self.tick();
                last_tick = Instant::now();
            }
        }
    }

    fn handle_packet(&self, packet: &OscPacket) {
        match packet {
            OscPacket::Message(message) => self.handle_message(message),
            OscPacket::Bundle(bundle) => {
                for inner in &bundle.content {
                    self.handle_packet(inner);
                }
            }
        }
    }

    /// Route one message by address pattern. A handler error never reaches
    /// the socket loop.
    pub fn handle_message(&self, message: &OscMessage) {
        match message.addr.as_str() {
            // Orientation-manager signals
            "/m1-clientRequestsServer" => self.supervisor.request_start(),
            "/m1-clientExists" => self.supervisor.note_client_seen(),

            // Client signals
            "/m1-addClient" => self.handle_add_client(message),
            "/m1-removeClient" => self.handle_remove_client(message),
            "/m1-status" => self.handle_client_pulse(message),

            // Plugin signals
            "/m1-register-plugin" => self.handle_register_plugin(message),
            "/m1-status-plugin" => self.handle_plugin_pulse(message),

            // General signals
            "/setPlayerYPR" => self.handle_set_player_ypr(message),
            "/setMonitoringMode" => self.handle_set_monitoring_mode(message),
            "/setMasterYPR" => self.handle_set_master_ypr(message),
            "/panner-settings" => self.handle_panner_settings(message),
            "/setChannelConfigReq" => self.handle_channel_config(message),
            "/setMonitorActiveReq" => self.handle_monitor_active(message),
            "/setPlayerFrameRate" => self.handle_player_frame_rate(message),
            "/setPlayerPosition" => self.handle_player_position(message),
            "/setPlayerIsPlaying" => self.handle_player_is_playing(message),

            other => tracing::debug!(addr = other, "unroutable OSC address"),
        }
    }

    /// Periodic duty: ping everyone, reap the silent.
    pub fn tick(&self) {
        self.clients.send_to_all("/m1-ping", vec![]);
        self.plugins.send_to_all("/m1-ping", vec![]);
        self.clients.reap_inactive();
        self.plugins.reap_inactive();
        let plugins = Arc::clone(&self.plugins);
        self.tracker.prune_osc(move |port| plugins.find(port).is_some());
    }

    // ------------------------------------------------------------------
    // Handlers
    // ------------------------------------------------------------------

    fn handle_add_client(&self, message: &OscMessage) {
        let (Some(port), Some(kind)) = (port_arg(message, 0), str_arg(message, 1)) else {
            tracing::debug!("malformed /m1-addClient");
            return;
        };
        self.clients.add_client(port, ClientKind::parse(kind));
        let count = self.clients.count() as i32;
        self.sender.send(
            port,
            "/connectedToServer",
            vec![OscType::Int(count - 1)],
        );
    }

    fn handle_remove_client(&self, message: &OscMessage) {
        let Some(port) = port_arg(message, 0) else {
            tracing::debug!("malformed /m1-removeClient");
            return;
        };
        self.clients.remove_client(port);
        let count = self.clients.count() as i32;
        self.clients
            .send_to_all("/connectedClientsUpdate", vec![OscType::Int(count)]);
    }

    fn handle_client_pulse(&self, message: &OscMessage) {
        let Some(port) = port_arg(message, 0) else {
            return;
        };
        if self.clients.touch(port) {
            self.sender.send(port, "/m1-response", vec![]);
        } else {
            // Unknown client: ask it to register again.
            self.sender.send(port, "/m1-reconnect-req", vec![]);
        }
    }

    fn handle_register_plugin(&self, message: &OscMessage) {
        let Some(port) = port_arg(message, 0) else {
            tracing::debug!("malformed /m1-register-plugin");
            return;
        };
        self.plugins.register(port);
        // Bring the newcomer up to date with the master orientation.
        let (mode, yaw, pitch, roll) = {
            let state = self.state.lock();
            (state.mode, state.yaw, state.pitch, state.roll)
        };
        self.plugins.send_monitor_settings(mode, yaw, pitch, roll);
        if let Some(plugin) = self.plugins.find(port) {
            self.tracker.update_from_osc(&plugin);
        }
    }

    fn handle_plugin_pulse(&self, message: &OscMessage) {
        let Some(port) = port_arg(message, 0) else {
            return;
        };
        if self.plugins.has_active(port) {
            self.plugins.touch(port);
        }
    }

    fn handle_set_player_ypr(&self, message: &OscMessage) {
        let (Some(yaw), Some(pitch)) = (float_arg(message, 0), float_arg(message, 1)) else {
            tracing::debug!("malformed /setPlayerYPR");
            return;
        };
        self.clients.send_to_kind(
            ClientKind::Monitor,
            "/YPR-Offset",
            vec![OscType::Float(yaw), OscType::Float(pitch)],
        );
    }

    fn handle_set_monitoring_mode(&self, message: &OscMessage) {
        let Some(mode) = int_arg(message, 0) else {
            return;
        };
        let push = {
            let mut state = self.state.lock();
            state.mode = mode;
            if mode != state.prev_mode {
                state.prev_mode = mode;
                Some((mode, state.yaw, state.pitch, state.roll))
            } else {
                None
            }
        };
        if let Some((mode, yaw, pitch, roll)) = push {
            self.plugins.send_monitor_settings(mode, yaw, pitch, roll);
        }
    }

    fn handle_set_master_ypr(&self, message: &OscMessage) {
        let (Some(yaw), Some(pitch), Some(roll)) = (
            float_arg(message, 0),
            float_arg(message, 1),
            float_arg(message, 2),
        ) else {
            tracing::debug!(args = message.args.len(), "malformed /setMasterYPR");
            return;
        };
        let push = {
            let mut state = self.state.lock();
            state.yaw = yaw;
            state.pitch = pitch;
            state.roll = roll;
            let changed = state.prev_yaw != yaw
                || state.prev_pitch != pitch
                || state.prev_roll != roll
                || state.prev_mode != state.mode;
            if changed {
                state.prev_yaw = yaw;
                state.prev_pitch = pitch;
                state.prev_roll = roll;
                state.prev_mode = state.mode;
                Some((state.mode, yaw, pitch, roll))
            } else {
                None
            }
        };
        if let Some((mode, yaw, pitch, roll)) = push {
            self.plugins.send_monitor_settings(mode, yaw, pitch, roll);
            self.mixer.set_master_ypr(yaw, pitch, roll);
            tracing::debug!(yaw, pitch, roll, "master orientation updated");
        }
    }

    fn handle_panner_settings(&self, message: &OscMessage) {
        let (Some(port), Some(state)) = (port_arg(message, 0), int_arg(message, 1)) else {
            tracing::debug!("malformed /panner-settings");
            return;
        };

        if state == -1 {
            // Plugin is going away; tell the players.
            self.plugins.remove(port);
            self.tracker.remove_osc(port);
            self.clients.send_to_kind(
                ClientKind::Player,
                "/panner-settings",
                vec![OscType::Int(port as i32), OscType::Int(-1)],
            );
            tracing::info!(port, "relayed panner disconnect");
            return;
        }

        self.plugins.touch(port);
        if message.args.len() >= 10 {
            self.plugins.update_settings(port, message);
            if let Some(plugin) = self.plugins.find(port) {
                self.tracker.update_from_osc(&plugin);
            }
            self.clients.forward_to_kind(ClientKind::Player, message);
        } else {
            tracing::debug!(len = message.args.len(), "short /panner-settings");
        }
    }

    fn handle_channel_config(&self, message: &OscMessage) {
        let Some(count) = int_arg(message, 0) else {
            return;
        };
        let changed = {
            let mut state = self.state.lock();
            if state.last_channel_count != count {
                state.last_channel_count = count;
                true
            } else {
                false
            }
        };
        if changed {
            tracing::info!(count, "channel config changed");
            self.plugins
                .send_to_all("/m1-channel-config", vec![OscType::Int(count)]);
            if count > 0 {
                self.mixer.set_output_channels(count as usize);
            }
        }
    }

    fn handle_monitor_active(&self, message: &OscMessage) {
        let Some(port) = port_arg(message, 0) else {
            return;
        };
        if !self.clients.rotate_monitor_to_active(port) {
            tracing::debug!(port, "monitor rotation failed, unknown port");
        }
    }

    fn handle_player_frame_rate(&self, message: &OscMessage) {
        let Some(rate) = float_arg(message, 0) else {
            return;
        };
        self.clients.send_to_kind(
            ClientKind::Player,
            "/playerFrameRate",
            vec![OscType::Float(rate)],
        );
    }

    fn handle_player_position(&self, message: &OscMessage) {
        let (Some(tick), Some(seconds)) = (int_arg(message, 0), float_arg(message, 1)) else {
            return;
        };
        self.clients.send_to_kind(
            ClientKind::Player,
            "/playerPosition",
            vec![OscType::Int(tick), OscType::Float(seconds)],
        );
    }

    fn handle_player_is_playing(&self, message: &OscMessage) {
        let (Some(tick), Some(playing)) = (int_arg(message, 0), int_arg(message, 1)) else {
            return;
        };
        self.clients.send_to_kind(
            ClientKind::Player,
            "/playerIsPlaying",
            vec![
                OscType::Int(tick),
                OscType::Int(i32::from(playing != 0)),
            ],
        );
    }
}

// Argument access is a tagged match; anything else counts as malformed.

fn int_arg(message: &OscMessage, index: usize) -> Option<i32> {
    match message.args.get(index) {
        Some(OscType::Int(value)) => Some(*value),
        _ => None,
    }
}

fn float_arg(message: &OscMessage, index: usize) -> Option<f32> {
    match message.args.get(index) {
        Some(OscType::Float(value)) => Some(*value),
        _ => None,
    }
}

fn str_arg<'a>(message: &'a OscMessage, index: usize) -> Option<&'a str> {
    match message.args.get(index) {
        Some(OscType::String(value)) => Some(value.as_str()),
        _ => None,
    }
}

fn port_arg(message: &OscMessage, index: usize) -> Option<u16> {
    int_arg(message, index)
        .filter(|p| (1..=i32::from(u16::MAX)).contains(p))
        .map(|p| p as u16)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::EventBus;

    fn message(addr: &str, args: Vec<OscType>) -> OscMessage {
        OscMessage {
            addr: addr.to_string(),
            args,
        }
    }

    #[test]
    fn test_arg_helpers_are_strict_about_tags() {
        let msg = message(
            "/x",
            vec![
                OscType::Int(7001),
                OscType::Float(1.5),
                OscType::String("monitor".into()),
            ],
        );
        assert_eq!(int_arg(&msg, 0), Some(7001));
        assert_eq!(float_arg(&msg, 0), None);
        assert_eq!(float_arg(&msg, 1), Some(1.5));
        assert_eq!(str_arg(&msg, 2), Some("monitor"));
        assert_eq!(int_arg(&msg, 9), None);
    }

    #[test]
    fn test_port_arg_rejects_out_of_range() {
        assert_eq!(port_arg(&message("/x", vec![OscType::Int(0)]), 0), None);
        assert_eq!(port_arg(&message("/x", vec![OscType::Int(-5)]), 0), None);
        assert_eq!(
            port_arg(&message("/x", vec![OscType::Int(70000)]), 0),
            None
        );
        assert_eq!(
            port_arg(&message("/x", vec![OscType::Int(6345)]), 0),
            Some(6345)
        );
    }

    #[test]
    fn test_bind_on_taken_port_is_fatal() {
        let holder = UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = holder.local_addr().unwrap().port();

        let sender = Arc::new(OscSender::new().unwrap());
        let events = Arc::new(EventBus::new());
        let clients = Arc::new(ClientRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
        let plugins = Arc::new(PluginRegistry::new(Arc::clone(&sender), Arc::clone(&events)));
        let tracker = Arc::new(PannerTracker::new(Arc::clone(&events)));
        let mixer = Arc::new(SpatialMixer::default());
        let supervisor = Arc::new(Supervisor::with_commands(
            1,
            crate::supervisor::ServiceCommands::disabled(),
        ));

        let result = OscDispatcher::bind(
            port, sender, clients, plugins, tracker, mixer, supervisor,
        );
        assert!(matches!(result, Err(HelperError::Bind { .. })));
    }
}
