//! Monitor/player client registry.
//!
//! Clients register over OSC with a reply port and a role. The registry keeps
//! the main list plus ordered `monitors` and `players` sub-views, and after
//! every mutation re-runs the activation policy: the first monitor and the
//! first player are the active ones, everybody else is told to stand down.

use crate::events::{EventBus, HelperEvent};
use crate::osc::sender::OscSender;
use parking_lot::Mutex;
use rosc::OscType;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A client is alive while its last pulse is younger than this.
pub const CLIENT_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ClientKind {
    Monitor,
    Player,
    Unknown,
}

impl ClientKind {
    pub fn parse(raw: &str) -> Self {
        if raw.eq_ignore_ascii_case("monitor") {
            ClientKind::Monitor
        } else if raw.eq_ignore_ascii_case("player") {
            ClientKind::Player
        } else {
            ClientKind::Unknown
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            ClientKind::Monitor => "monitor",
            ClientKind::Player => "player",
            ClientKind::Unknown => "unknown",
        }
    }
}

#[derive(Debug, Clone)]
pub struct ClientRecord {
    pub port: u16,
    pub kind: ClientKind,
    pub active: bool,
    pub last_seen: Instant,
}

#[derive(Default)]
struct Inner {
    clients: Vec<ClientRecord>,
    monitors: Vec<u16>,
    players: Vec<u16>,
}

impl Inner {
    fn find(&self, port: u16) -> Option<usize> {
        self.clients.iter().position(|c| c.port == port)
    }
}

pub struct ClientRegistry {
    inner: Mutex<Inner>,
    sender: Arc<OscSender>,
    events: Arc<EventBus>,
    timeout: Duration,
}

impl ClientRegistry {
    pub fn new(sender: Arc<OscSender>, events: Arc<EventBus>) -> Self {
        Self::with_timeout(sender, events, CLIENT_TIMEOUT)
    }

    pub fn with_timeout(sender: Arc<OscSender>, events: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            inner: Mutex::new(Inner::default()),
            sender,
            events,
            timeout,
        }
    }

    /// Register (or refresh) a client. New clients trigger re-activation.
    pub fn add_client(&self, port: u16, kind: ClientKind) {
        let mut inner = self.inner.lock();
        if let Some(pos) = inner.find(port) {
            inner.clients[pos].last_seen = Instant::now();
            return;
        }

        inner.clients.push(ClientRecord {
            port,
            kind,
            active: false,
            last_seen: Instant::now(),
        });
        match kind {
            ClientKind::Monitor => inner.monitors.push(port),
            ClientKind::Player => inner.players.push(port),
            ClientKind::Unknown => {}
        }
        tracing::info!(port, kind = kind.as_str(), "client added");
        self.events.publish(HelperEvent::ClientAdded(port));
        self.activate_locked(&mut inner);
    }

    /// Remove a client. Removing the active monitor promotes the previous one
    /// in the list (wrapping to the last).
    pub fn remove_client(&self, port: u16) {
        let mut inner = self.inner.lock();

        let monitor_pos = inner.monitors.iter().position(|p| *p == port);
        let was_active_monitor = monitor_pos
            .and_then(|_| inner.find(port))
            .map(|i| inner.clients[i].active && inner.clients[i].kind == ClientKind::Monitor)
            .unwrap_or(false);

        inner.monitors.retain(|p| *p != port);
        inner.players.retain(|p| *p != port);
        if let Some(pos) = inner.find(port) {
            inner.clients.remove(pos);
            tracing::info!(port, "client removed");
            self.events.publish(HelperEvent::ClientRemoved(port));
        }

        if was_active_monitor && !inner.monitors.is_empty() {
            let removed_index = monitor_pos.unwrap_or(0);
            let promote = if removed_index > 0 {
                removed_index - 1
            } else {
                inner.monitors.len() - 1
            };
            inner.monitors[..=promote].rotate_right(1);
        }
        self.activate_locked(&mut inner);
    }

    /// Refresh the liveness timer. Returns whether the client is known.
    pub fn touch(&self, port: u16) -> bool {
        let mut inner = self.inner.lock();
        match inner.find(port) {
            Some(pos) => {
                inner.clients[pos].last_seen = Instant::now();
                true
            }
            None => false,
        }
    }

    /// Rotate the named monitor to the front of the ordering (preserving the
    /// relative order of the rest) and re-run activation.
    pub fn rotate_monitor_to_active(&self, port: u16) -> bool {
        let mut inner = self.inner.lock();
        let Some(pos) = inner.monitors.iter().position(|p| *p == port) else {
            tracing::debug!(port, "rotate requested for unknown monitor");
            return false;
        };
        inner.monitors[..=pos].rotate_right(1);
        self.activate_locked(&mut inner);
        true
    }

    /// Re-run the activation policy without any other mutation.
    pub fn activate(&self) {
        let mut inner = self.inner.lock();
        self.activate_locked(&mut inner);
    }

    fn activate_locked(&self, inner: &mut Inner) {
        let monitor_count = inner.monitors.len();
        for i in 0..monitor_count {
            let port = inner.monitors[i];
            let active = i == 0;
            self.sender
                .send(port, "/m1-activate-client", vec![OscType::Int(i32::from(active))]);
            if let Some(pos) = inner.find(port) {
                inner.clients[pos].active = active;
            }
        }

        for i in 0..inner.players.len() {
            let port = inner.players[i];
            let active = i == 0;
            let mut args = vec![OscType::Int(i32::from(active))];
            if monitor_count > 0 {
                args.push(OscType::Int(monitor_count as i32));
            }
            self.sender.send(port, "/m1-activate-client", args);
            if let Some(pos) = inner.find(port) {
                inner.clients[pos].active = active;
            }
        }

        self.events.publish(HelperEvent::ClientsActivationChanged);
    }

    /// Drop every client whose last pulse is older than the timeout.
    pub fn reap_inactive(&self) {
        let mut inner = self.inner.lock();
        let now = Instant::now();
        let timeout = self.timeout;

        let dead: Vec<u16> = inner
            .clients
            .iter()
            .filter(|c| now.duration_since(c.last_seen) > timeout)
            .map(|c| c.port)
            .collect();
        if dead.is_empty() {
            return;
        }

        for port in &dead {
            inner.monitors.retain(|p| p != port);
            inner.players.retain(|p| p != port);
            inner.clients.retain(|c| c.port != *port);
            tracing::info!(port, "client timed out");
            self.events.publish(HelperEvent::ClientRemoved(*port));
        }
        self.activate_locked(&mut inner);
    }

    pub fn send_to_all(&self, addr: &str, args: Vec<OscType>) {
        let inner = self.inner.lock();
        for client in &inner.clients {
            self.sender.send(client.port, addr, args.clone());
        }
    }

    pub fn send_to_kind(&self, kind: ClientKind, addr: &str, args: Vec<OscType>) {
        let inner = self.inner.lock();
        let ports = match kind {
            ClientKind::Monitor => &inner.monitors,
            ClientKind::Player => &inner.players,
            ClientKind::Unknown => return,
        };
        for port in ports {
            self.sender.send(*port, addr, args.clone());
        }
    }

    pub fn forward_to_kind(&self, kind: ClientKind, message: &rosc::OscMessage) {
        let inner = self.inner.lock();
        let ports = match kind {
            ClientKind::Monitor => &inner.monitors,
            ClientKind::Player => &inner.players,
            ClientKind::Unknown => return,
        };
        for port in ports {
            self.sender.forward(*port, message);
        }
    }

    pub fn count(&self) -> usize {
        self.inner.lock().clients.len()
    }

    pub fn monitor_count(&self) -> usize {
        self.inner.lock().monitors.len()
    }

    /// Monitor ports in activation order (index 0 is active).
    pub fn monitor_order(&self) -> Vec<u16> {
        self.inner.lock().monitors.clone()
    }

    pub fn snapshot(&self) -> Vec<ClientRecord> {
        self.inner.lock().clients.clone()
    }

    pub fn find(&self, port: u16) -> Option<ClientRecord> {
        let inner = self.inner.lock();
        inner.find(port).map(|i| inner.clients[i].clone())
    }
}
