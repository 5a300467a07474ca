//! Panner plugin registry (OSC-facing side).
//!
//! Plugins announce themselves with `/m1-register-plugin` and keep themselves
//! alive with pulses and `/panner-settings` updates. The registry caches the
//! last known spatial settings per plugin and pushes master orientation out to
//! all of them.

use crate::events::{EventBus, HelperEvent};
use crate::osc::sender::OscSender;
use parking_lot::Mutex;
use rosc::{OscColor, OscMessage, OscType};
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A plugin is alive while its last pulse is younger than this.
pub const PLUGIN_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone)]
pub struct PluginRecord {
    pub port: u16,
    pub state: i32,
    pub name: String,
    pub color: OscColor,
    pub input_mode: i32,
    pub azimuth: f32,
    pub elevation: f32,
    pub diverge: f32,
    pub gain: f32,
    pub panner_mode: i32,
    pub auto_orbit: bool,
    pub st_orbit_azimuth: f32,
    pub st_spread: f32,
    pub is_panner: bool,
    pub last_seen: Instant,
}

impl PluginRecord {
    fn new(port: u16) -> Self {
        Self {
            port,
            state: 0,
            name: String::new(),
            color: OscColor {
                red: 0,
                green: 0,
                blue: 0,
                alpha: 0,
            },
            input_mode: 0,
            azimuth: 0.0,
            elevation: 0.0,
            diverge: 0.0,
            gain: 1.0,
            panner_mode: 0,
            auto_orbit: false,
            st_orbit_azimuth: 0.0,
            st_spread: 0.0,
            is_panner: false,
            last_seen: Instant::now(),
        }
    }
}

pub struct PluginRegistry {
    inner: Mutex<Vec<PluginRecord>>,
    sender: Arc<OscSender>,
    events: Arc<EventBus>,
    timeout: Duration,
}

impl PluginRegistry {
    pub fn new(sender: Arc<OscSender>, events: Arc<EventBus>) -> Self {
        Self::with_timeout(sender, events, PLUGIN_TIMEOUT)
    }

    pub fn with_timeout(sender: Arc<OscSender>, events: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Vec::new()),
            sender,
            events,
            timeout,
        }
    }

    /// Register (or re-register) a plugin endpoint.
    pub fn register(&self, port: u16) {
        let mut plugins = self.inner.lock();
        if let Some(existing) = plugins.iter_mut().find(|p| p.port == port) {
            existing.last_seen = Instant::now();
            self.events.publish(HelperEvent::PluginUpdated(port));
            tracing::debug!(port, "plugin re-registered");
        } else {
            plugins.push(PluginRecord::new(port));
            self.events.publish(HelperEvent::PluginAdded(port));
            tracing::info!(port, "plugin registered");
        }
    }

    pub fn remove(&self, port: u16) {
        let mut plugins = self.inner.lock();
        let before = plugins.len();
        plugins.retain(|p| p.port != port);
        if plugins.len() != before {
            tracing::info!(port, "plugin removed");
            self.events.publish(HelperEvent::PluginRemoved(port));
        }
    }

    /// Refresh the liveness timer.
    pub fn touch(&self, port: u16) -> bool {
        let mut plugins = self.inner.lock();
        match plugins.iter_mut().find(|p| p.port == port) {
            Some(plugin) => {
                plugin.last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    pub fn has_active(&self, port: u16) -> bool {
        let plugins = self.inner.lock();
        plugins
            .iter()
            .any(|p| p.port == port && p.last_seen.elapsed() < self.timeout)
    }

    /// Cache the settings carried by a full `/panner-settings` message.
    /// Positional layout: port, state, name, color, input mode, azimuth,
    /// elevation, diverge, gain, panner mode, then optional auto-orbit,
    /// stereo orbit azimuth, stereo spread.
    pub fn update_settings(&self, port: u16, message: &OscMessage) {
        let mut plugins = self.inner.lock();
        let Some(plugin) = plugins.iter_mut().find(|p| p.port == port) else {
            return;
        };
        if message.args.len() < 10 {
            return;
        }

        if let Some(OscType::Int(state)) = message.args.get(1) {
            plugin.state = *state;
        }
        if let Some(OscType::String(name)) = message.args.get(2) {
            plugin.name = name.clone();
        }
        if let Some(OscType::Color(color)) = message.args.get(3) {
            plugin.color = color.clone();
        }
        if let Some(OscType::Int(mode)) = message.args.get(4) {
            plugin.input_mode = *mode;
        }
        if let Some(OscType::Float(azimuth)) = message.args.get(5) {
            plugin.azimuth = *azimuth;
        }
        if let Some(OscType::Float(elevation)) = message.args.get(6) {
            plugin.elevation = *elevation;
        }
        if let Some(OscType::Float(diverge)) = message.args.get(7) {
            plugin.diverge = *diverge;
        }
        if let Some(OscType::Float(gain)) = message.args.get(8) {
            plugin.gain = *gain;
        }
        if let Some(OscType::Int(mode)) = message.args.get(9) {
            plugin.panner_mode = *mode;
        }
        if message.args.len() >= 13 {
            if let Some(OscType::Int(orbit)) = message.args.get(10) {
                plugin.auto_orbit = *orbit != 0;
            }
            if let Some(OscType::Float(azimuth)) = message.args.get(11) {
                plugin.st_orbit_azimuth = *azimuth;
            }
            if let Some(OscType::Float(spread)) = message.args.get(12) {
                plugin.st_spread = *spread;
            }
        }
        plugin.is_panner = true;
        plugin.last_seen = Instant::now();
        self.events.publish(HelperEvent::PluginSettingsUpdated(port));
    }

    /// Push master orientation to every plugin.
    pub fn send_monitor_settings(&self, mode: i32, yaw: f32, pitch: f32, roll: f32) {
        let plugins = self.inner.lock();
        tracing::debug!(
            count = plugins.len(),
            mode,
            yaw,
            pitch,
            roll,
            "sending monitor settings"
        );
        for plugin in plugins.iter() {
            self.sender.send(
                plugin.port,
                "/monitor-settings",
                vec![
                    OscType::Int(mode),
                    OscType::Float(yaw),
                    OscType::Float(pitch),
                    OscType::Float(roll),
                ],
            );
        }
    }

    pub fn send_to_all(&self, addr: &str, args: Vec<OscType>) {
        let plugins = self.inner.lock();
        for plugin in plugins.iter() {
            self.sender.send(plugin.port, addr, args.clone());
        }
    }

    /// Drop every plugin whose last pulse is older than the timeout.
    pub fn reap_inactive(&self) {
        let mut plugins = self.inner.lock();
        let now = Instant::now();
        let timeout = self.timeout;
        let dead: Vec<u16> = plugins
            .iter()
            .filter(|p| now.duration_since(p.last_seen) > timeout)
            .map(|p| p.port)
            .collect();
        plugins.retain(|p| now.duration_since(p.last_seen) <= timeout);
        drop(plugins);
        for port in dead {
            tracing::info!(port, "plugin timed out");
            self.events.publish(HelperEvent::PluginRemoved(port));
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().len()
    }

    pub fn snapshot(&self) -> Vec<PluginRecord> {
        self.inner.lock().clone()
    }

    pub fn find(&self, port: u16) -> Option<PluginRecord> {
        self.inner.lock().iter().find(|p| p.port == port).cloned()
    }
}
