//! Unified panner tracker.
//!
//! Two sources feed one record type: segments discovered on disk (audio and
//! parameters read straight from shared memory) and plugins that only speak
//! OSC. When the same plugin is visible through both (matched by the port it
//! reports), the shared-memory view wins for audio and parameters while the
//! OSC view wins for display identity and color. All mutation happens inside
//! one critical section; readers get snapshots.

use crate::events::{EventBus, HelperEvent};
use crate::plugins::PluginRecord;
use m1_memshare::params::ids;
use m1_memshare::{AudioFormat, BufferRead, ParameterMap};
use parking_lot::Mutex;
use rosc::OscColor;
use std::sync::Arc;
use std::time::{Duration, Instant};

/// A shared-memory record older than this with a dead producer is removed;
/// with a live producer it goes stale instead.
pub const PANNER_TIMEOUT: Duration = Duration::from_secs(5);

/// Durable identity of a tracked panner.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PannerKey {
    /// Segment-backed: `(pid, addr)` parsed from the segment file name.
    MemShare { pid: u32, addr: u64 },
    /// OSC-only fallback, keyed by the plugin's reply port.
    Osc { port: u16 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PannerStatus {
    /// Recently updated, actively streaming.
    Active,
    /// Producer alive but audio stopped; the record persists.
    Stale,
}

#[derive(Debug, Clone)]
pub struct PannerRecord {
    pub key: PannerKey,
    pub display_name: String,
    pub port: u16,
    pub pid: u32,
    pub addr: u64,
    pub status: PannerStatus,
    pub is_active: bool,
    pub format: AudioFormat,
    pub params: ParameterMap,
    pub color: OscColor,
    pub last_update: Instant,
    pub is_playing: bool,
    pub playhead_seconds: f64,
    pub current_buffer_id: u64,
}

impl PannerRecord {
    fn new(key: PannerKey, display_name: String) -> Self {
        let (pid, addr, port) = match key {
            PannerKey::MemShare { pid, addr } => (pid, addr, 0),
            PannerKey::Osc { port } => (0, 0, port),
        };
        Self {
            key,
            display_name,
            port,
            pid,
            addr,
            status: PannerStatus::Active,
            is_active: true,
            format: AudioFormat::default(),
            params: ParameterMap::new(),
            color: OscColor {
                red: 0,
                green: 0,
                blue: 0,
                alpha: 0,
            },
            last_update: Instant::now(),
            is_playing: false,
            playhead_seconds: 0.0,
            current_buffer_id: 0,
        }
    }

    pub fn azimuth(&self) -> f32 {
        self.params.get_f32(ids::AZIMUTH, 0.0)
    }

    pub fn elevation(&self) -> f32 {
        self.params.get_f32(ids::ELEVATION, 0.0)
    }

    pub fn diverge(&self) -> f32 {
        self.params.get_f32(ids::DIVERGE, 0.0)
    }

    pub fn gain(&self) -> f32 {
        self.params.get_f32(ids::GAIN, 1.0)
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TrackingStats {
    pub memshare_panners: usize,
    pub osc_panners: usize,
    pub stale_panners: usize,
}

pub struct PannerTracker {
    panners: Mutex<Vec<PannerRecord>>,
    events: Arc<EventBus>,
    timeout: Duration,
}

impl PannerTracker {
    pub fn new(events: Arc<EventBus>) -> Self {
        Self::with_timeout(events, PANNER_TIMEOUT)
    }

    pub fn with_timeout(events: Arc<EventBus>, timeout: Duration) -> Self {
        Self {
            panners: Mutex::new(Vec::new()),
            events,
            timeout,
        }
    }

    /// Record a newly attached segment, before any buffer has been read.
    pub fn attach_memshare(&self, pid: u32, addr: u64, display_name: &str) {
        let key = PannerKey::MemShare { pid, addr };
        let mut panners = self.panners.lock();
        if panners.iter().any(|p| p.key == key) {
            return;
        }
        panners.push(PannerRecord::new(key, display_name.to_string()));
        tracing::info!(pid, addr, "panner discovered via shared memory");
        self.events.publish(HelperEvent::PannerAdded(key));
    }

    /// Fold the latest buffer read out of a segment into the record. The
    /// shared-memory view wins for audio format and parameters; if an
    /// OSC-only record reported the same port, it is absorbed and keeps
    /// supplying display name and color.
    pub fn update_from_segment(
        &self,
        pid: u32,
        addr: u64,
        format: AudioFormat,
        read: &BufferRead,
    ) {
        let key = PannerKey::MemShare { pid, addr };
        let port = read.params.get_i32(ids::PORT, 0).clamp(0, u16::MAX as i32) as u16;

        let mut panners = self.panners.lock();

        // Absorb the OSC twin, keeping its display identity.
        let mut osc_name = None;
        let mut osc_color = None;
        if port != 0 {
            if let Some(pos) = panners
                .iter()
                .position(|p| p.key == PannerKey::Osc { port })
            {
                let twin = panners.remove(pos);
                osc_name = Some(twin.display_name);
                osc_color = Some(twin.color);
                self.events.publish(HelperEvent::PannerRemoved(twin.key));
            }
        }

        let existed = panners.iter().any(|p| p.key == key);
        if !existed {
            panners.push(PannerRecord::new(key, format!("Panner (PID {pid})")));
        }
        let record = panners
            .iter_mut()
            .find(|p| p.key == key)
            .expect("record just ensured");

        record.format = format;
        record.params = read.params.clone();
        record.is_playing = read.is_playing;
        record.playhead_seconds = read.playhead_seconds;
        record.current_buffer_id = read.buffer_id;
        record.status = PannerStatus::Active;
        record.is_active = true;
        record.last_update = Instant::now();
        if port != 0 {
            record.port = port;
        }
        let wire_name = read.params.get_str(ids::DISPLAY_NAME, "");
        if let Some(name) = osc_name {
            record.display_name = name;
        } else if !wire_name.is_empty() {
            record.display_name = wire_name;
        }
        if let Some(color) = osc_color {
            record.color = color;
        } else {
            let color = OscColor {
                red: read.params.get_i32(ids::COLOR_R, record.color.red as i32) as u8,
                green: read.params.get_i32(ids::COLOR_G, record.color.green as i32) as u8,
                blue: read.params.get_i32(ids::COLOR_B, record.color.blue as i32) as u8,
                alpha: read.params.get_i32(ids::COLOR_A, record.color.alpha as i32) as u8,
            };
            record.color = color;
        }
        drop(panners);

        if existed {
            self.events.publish(HelperEvent::PannerUpdated(key));
        } else {
            self.events.publish(HelperEvent::PannerAdded(key));
        }
    }

    /// Fold an OSC `/panner-settings` update in. Display identity and color
    /// always follow OSC; parameters only when no segment view exists for the
    /// same plugin.
    pub fn update_from_osc(&self, plugin: &PluginRecord) {
        let mut panners = self.panners.lock();

        // A segment-backed record for this port takes the identity fields and
        // keeps its own parameters.
        if let Some(record) = panners
            .iter_mut()
            .find(|p| matches!(p.key, PannerKey::MemShare { .. }) && p.port == plugin.port)
        {
            if !plugin.name.is_empty() {
                record.display_name = plugin.name.clone();
            }
            record.color = plugin.color.clone();
            let key = record.key;
            drop(panners);
            self.events.publish(HelperEvent::PannerUpdated(key));
            return;
        }

        let key = PannerKey::Osc { port: plugin.port };
        let existed = panners.iter().any(|p| p.key == key);
        if !existed {
            panners.push(PannerRecord::new(key, plugin.name.clone()));
        }
        let record = panners
            .iter_mut()
            .find(|p| p.key == key)
            .expect("record just ensured");
        if !plugin.name.is_empty() {
            record.display_name = plugin.name.clone();
        }
        record.color = plugin.color.clone();
        record.params.set_f32(ids::AZIMUTH, plugin.azimuth);
        record.params.set_f32(ids::ELEVATION, plugin.elevation);
        record.params.set_f32(ids::DIVERGE, plugin.diverge);
        record.params.set_f32(ids::GAIN, plugin.gain);
        record.params.set_i32(ids::INPUT_MODE, plugin.input_mode);
        record.params.set_i32(ids::STATE, plugin.state);
        record.status = PannerStatus::Active;
        record.is_active = true;
        record.last_update = Instant::now();
        drop(panners);

        if existed {
            self.events.publish(HelperEvent::PannerUpdated(key));
        } else {
            self.events.publish(HelperEvent::PannerAdded(key));
        }
    }

    pub fn remove(&self, key: PannerKey) {
        let mut panners = self.panners.lock();
        let before = panners.len();
        panners.retain(|p| p.key != key);
        if panners.len() != before {
            drop(panners);
            self.events.publish(HelperEvent::PannerRemoved(key));
        }
    }

    pub fn remove_osc(&self, port: u16) {
        self.remove(PannerKey::Osc { port });
    }

    /// Drop OSC-only records whose plugin registration disappeared.
    pub fn prune_osc(&self, keep: impl Fn(u16) -> bool) {
        let mut panners = self.panners.lock();
        let mut removed = Vec::new();
        panners.retain(|record| match record.key {
            PannerKey::Osc { port } if !keep(port) => {
                removed.push(record.key);
                false
            }
            _ => true,
        });
        drop(panners);
        for key in removed {
            self.events.publish(HelperEvent::PannerRemoved(key));
        }
    }

    /// Sweep segment-backed records: timed out + dead producer → removed;
    /// timed out + live producer → stale but kept. Returns removed keys so
    /// the scanner can drop its attachments.
    pub fn reap_memshare(&self, is_alive: impl Fn(u32) -> bool) -> Vec<PannerKey> {
        let mut panners = self.panners.lock();
        let timeout = self.timeout;
        let mut removed = Vec::new();

        panners.retain_mut(|record| {
            let PannerKey::MemShare { pid, .. } = record.key else {
                return true;
            };
            if record.last_update.elapsed() <= timeout {
                return true;
            }
            if is_alive(pid) {
                // Plugin idling, not streaming. Keep tracking it.
                record.status = PannerStatus::Stale;
                record.is_active = false;
                true
            } else {
                removed.push(record.key);
                false
            }
        });
        drop(panners);

        for key in &removed {
            tracing::info!(?key, "panner removed, producer gone");
            self.events.publish(HelperEvent::PannerRemoved(*key));
        }
        removed
    }

    pub fn snapshot(&self) -> Vec<PannerRecord> {
        self.panners.lock().clone()
    }

    pub fn find_memshare(&self, pid: u32, addr: u64) -> Option<PannerRecord> {
        let key = PannerKey::MemShare { pid, addr };
        self.panners.lock().iter().find(|p| p.key == key).cloned()
    }

    pub fn has_panners(&self) -> bool {
        !self.panners.lock().is_empty()
    }

    pub fn stats(&self) -> TrackingStats {
        let panners = self.panners.lock();
        TrackingStats {
            memshare_panners: panners
                .iter()
                .filter(|p| matches!(p.key, PannerKey::MemShare { .. }))
                .count(),
            osc_panners: panners
                .iter()
                .filter(|p| matches!(p.key, PannerKey::Osc { .. }))
                .count(),
            stale_panners: panners
                .iter()
                .filter(|p| p.status == PannerStatus::Stale)
                .count(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use m1_memshare::UpdateSource;

    fn tracker() -> (Arc<PannerTracker>, crossbeam_channel::Receiver<HelperEvent>) {
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        (Arc::new(PannerTracker::new(events)), rx)
    }

    fn buffer_read(port: i32, azimuth: f32) -> BufferRead {
        let mut params = ParameterMap::new();
        params.set_i32(ids::PORT, port);
        params.set_f32(ids::AZIMUTH, azimuth);
        BufferRead {
            buffer_id: 1,
            sequence: 1,
            timestamp_ms: 0,
            audio: vec![vec![0.0; 16]],
            params,
            daw_timestamp: 0,
            playhead_seconds: 0.0,
            is_playing: true,
            update_source: UpdateSource::Host,
        }
    }

    fn osc_plugin(port: u16, name: &str) -> PluginRecord {
        let mut plugin = crate::plugins::PluginRecord {
            name: name.to_string(),
            azimuth: 30.0,
            ..new_plugin(port)
        };
        plugin.color.red = 200;
        plugin
    }

    fn new_plugin(port: u16) -> PluginRecord {
        // Mirror of PluginRecord::new, which is private to the registry.
        let registry = crate::plugins::PluginRegistry::new(
            Arc::new(crate::osc::sender::OscSender::new().unwrap()),
            Arc::new(EventBus::new()),
        );
        registry.register(port);
        registry.find(port).unwrap()
    }

    #[test]
    fn test_attach_then_update_publishes_added_then_updated() {
        let (tracker, rx) = tracker();
        tracker.attach_memshare(4321, 0x10, "Panner (PID 4321)");
        let key = PannerKey::MemShare {
            pid: 4321,
            addr: 0x10,
        };
        assert_eq!(rx.try_recv().unwrap(), HelperEvent::PannerAdded(key));

        tracker.update_from_segment(4321, 0x10, AudioFormat::default(), &buffer_read(0, 0.5));
        assert_eq!(rx.try_recv().unwrap(), HelperEvent::PannerUpdated(key));

        let record = tracker.find_memshare(4321, 0x10).unwrap();
        assert_eq!(record.azimuth(), 0.5);
        assert!(record.is_active);
    }

    #[test]
    fn test_memshare_absorbs_osc_twin_and_keeps_identity() {
        let (tracker, _rx) = tracker();

        // OSC side first: a plugin on port 9200 with a name and color.
        tracker.update_from_osc(&osc_plugin(9200, "Lead Vox"));
        assert_eq!(tracker.stats().osc_panners, 1);

        // The segment for the same plugin shows up, reporting port 9200.
        tracker.update_from_segment(77, 0x2, AudioFormat::default(), &buffer_read(9200, 0.25));

        let stats = tracker.stats();
        assert_eq!(stats.osc_panners, 0);
        assert_eq!(stats.memshare_panners, 1);

        let record = tracker.find_memshare(77, 0x2).unwrap();
        // Shared memory wins parameters, OSC wins identity display and color.
        assert_eq!(record.azimuth(), 0.25);
        assert_eq!(record.display_name, "Lead Vox");
        assert_eq!(record.color.red, 200);
        assert_eq!(record.port, 9200);
    }

    #[test]
    fn test_osc_update_to_merged_record_touches_identity_only() {
        let (tracker, _rx) = tracker();
        tracker.update_from_segment(77, 0x2, AudioFormat::default(), &buffer_read(9200, 0.25));

        tracker.update_from_osc(&osc_plugin(9200, "Renamed"));
        let record = tracker.find_memshare(77, 0x2).unwrap();
        assert_eq!(record.display_name, "Renamed");
        // Parameters still come from the segment, not the OSC update.
        assert_eq!(record.azimuth(), 0.25);
        // No second record was created.
        assert_eq!(tracker.stats().osc_panners, 0);
    }

    #[test]
    fn test_reap_removes_dead_and_stales_alive() {
        let events = Arc::new(EventBus::new());
        let rx = events.subscribe();
        let tracker = PannerTracker::with_timeout(events, Duration::from_millis(20));

        tracker.attach_memshare(1111, 0x1, "dead");
        tracker.attach_memshare(2222, 0x2, "alive");
        while rx.try_recv().is_ok() {}

        std::thread::sleep(Duration::from_millis(40));
        let removed = tracker.reap_memshare(|pid| pid == 2222);

        assert_eq!(
            removed,
            vec![PannerKey::MemShare {
                pid: 1111,
                addr: 0x1
            }]
        );
        let snapshot = tracker.snapshot();
        assert_eq!(snapshot.len(), 1);
        assert_eq!(snapshot[0].status, PannerStatus::Stale);
        assert!(!snapshot[0].is_active);
        assert!(matches!(
            rx.try_recv().unwrap(),
            HelperEvent::PannerRemoved(_)
        ));
    }

    #[test]
    fn test_osc_disconnect_removes_record() {
        let (tracker, _rx) = tracker();
        tracker.update_from_osc(&osc_plugin(9300, "Solo"));
        assert!(tracker.has_panners());
        tracker.remove_osc(9300);
        assert!(!tracker.has_panners());
    }
}
