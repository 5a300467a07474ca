//! Segment discovery and liveness.
//!
//! A scan walks the prioritized shared directories for segment files, probes
//! the producer PID, reclaims abandoned files, and attaches to live segments
//! as a consumer. A faster refresh pass drains attached segments into the
//! tracker and the mixer.

use crate::mixer::SpatialMixer;
use crate::process::is_pid_alive;
use crate::tracker::{PannerKey, PannerTracker};
use m1_memshare::params::ids;
use m1_memshare::{MemShareError, Segment, SegmentName, SEGMENT_EXTENSION};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

/// Directory scan cadence.
pub const SCAN_INTERVAL: Duration = Duration::from_secs(1);

/// Attached-segment refresh cadence.
pub const UPDATE_INTERVAL: Duration = Duration::from_millis(100);

/// Consumer ID the service registers against every segment.
pub const SERVICE_CONSUMER_ID: u32 = 9001;

/// Queue capacity every panner segment is created with.
pub const SEGMENT_QUEUE_SIZE: u32 = 8;

/// Files older than this are reclaimed unconditionally (dead producer; live
/// producers are exempted by the PID probe).
pub const HARD_STALE: Duration = Duration::from_secs(2 * 60 * 60);

/// Files older than this are reclaimed when their producer is gone.
pub const SOFT_STALE: Duration = Duration::from_secs(10 * 60);

/// Corrupt attach attempts tolerated before the file is deleted.
const MAX_CORRUPT_ATTEMPTS: u32 = 3;

/// Most buffers drained from one segment per refresh tick.
const MAX_DRAIN_PER_TICK: u32 = 8;

#[derive(Debug, Clone)]
pub struct ScannerConfig {
    /// Prioritized search directories; a scan stops after the first directory
    /// once it yielded a live panner.
    pub search_dirs: Vec<PathBuf>,
    pub consumer_id: u32,
    pub soft_stale: Duration,
    pub hard_stale: Duration,
}

impl Default for ScannerConfig {
    fn default() -> Self {
        Self {
            search_dirs: crate::paths::shared_directories(),
            consumer_id: SERVICE_CONSUMER_ID,
            soft_stale: SOFT_STALE,
            hard_stale: HARD_STALE,
        }
    }
}

struct Attachment {
    name: SegmentName,
    path: PathBuf,
    segment: Arc<Segment>,
}

pub struct SegmentScanner {
    config: ScannerConfig,
    tracker: Arc<PannerTracker>,
    mixer: Arc<SpatialMixer>,
    attachments: Mutex<HashMap<(u32, u64), Attachment>>,
    corrupt_attempts: Mutex<HashMap<PathBuf, u32>>,
}

impl SegmentScanner {
    pub fn new(
        config: ScannerConfig,
        tracker: Arc<PannerTracker>,
        mixer: Arc<SpatialMixer>,
    ) -> Self {
        Self {
            config,
            tracker,
            mixer,
            attachments: Mutex::new(HashMap::new()),
            corrupt_attempts: Mutex::new(HashMap::new()),
        }
    }

    /// One discovery tick: enumerate, attach, reclaim, reap.
    pub fn scan(&self) {
        let dirs = self.config.search_dirs.clone();
        for (index, dir) in dirs.iter().enumerate() {
            if !dir.is_dir() {
                continue;
            }
            let mut found_live = false;
            match std::fs::read_dir(dir) {
                Ok(entries) => {
                    for entry in entries.flatten() {
                        let path = entry.path();
                        // Unparseable names are ignored, never deleted.
                        let Some(name) = SegmentName::parse_path(&path) else {
                            continue;
                        };
                        if self.consider_file(&path, &name) {
                            found_live = true;
                        }
                    }
                }
                Err(err) => {
                    tracing::warn!(dir = %dir.display(), %err, "could not enumerate directory");
                    continue;
                }
            }
            // Producers all write to the priority directory; once it yields,
            // the rest of the list is fallback only.
            if found_live && index == 0 {
                break;
            }
        }

        self.reclaim_stale_files();
        self.reap_records();
    }

    /// Returns whether the file belongs to a live producer.
    fn consider_file(&self, path: &Path, name: &SegmentName) -> bool {
        if !is_pid_alive(name.pid) {
            return false;
        }
        if file_age(path).map(|age| age > self.config.hard_stale).unwrap_or(false) {
            tracing::debug!(path = %path.display(), "file past hard threshold, left for reclamation");
            return false;
        }

        let key = (name.pid, name.addr);
        if self.attachments.lock().contains_key(&key) {
            return true;
        }

        match Segment::attach(path, SEGMENT_QUEUE_SIZE) {
            Ok(segment) => {
                if let Err(err) = segment.register_consumer(self.config.consumer_id) {
                    tracing::warn!(path = %path.display(), %err, "could not register as consumer");
                    return false;
                }
                self.corrupt_attempts.lock().remove(path);
                let display = format!("Panner (PID {})", name.pid);
                self.tracker.attach_memshare(name.pid, name.addr, &display);
                self.mixer.upsert_track(
                    PannerKey::MemShare {
                        pid: name.pid,
                        addr: name.addr,
                    },
                    &display,
                );
                self.attachments.lock().insert(
                    key,
                    Attachment {
                        name: name.clone(),
                        path: path.to_path_buf(),
                        segment: Arc::new(segment),
                    },
                );
                tracing::info!(path = %path.display(), pid = name.pid, "attached to panner segment");
                true
            }
            Err(MemShareError::Corrupt(reason)) => {
                let mut attempts = self.corrupt_attempts.lock();
                let count = attempts.entry(path.to_path_buf()).or_insert(0);
                *count += 1;
                tracing::warn!(path = %path.display(), %reason, attempt = *count, "segment failed validation");
                if *count >= MAX_CORRUPT_ATTEMPTS {
                    attempts.remove(path);
                    drop(attempts);
                    if let Err(err) = std::fs::remove_file(path) {
                        tracing::warn!(path = %path.display(), %err, "could not delete corrupt segment");
                    } else {
                        tracing::info!(path = %path.display(), "deleted corrupt segment");
                    }
                }
                false
            }
            Err(err) => {
                // Transient platform trouble: skip, retry next tick.
                tracing::debug!(path = %path.display(), %err, "attach failed");
                false
            }
        }
    }

    /// Delete abandoned segment files. A live producer exempts its file from
    /// age-based reclamation entirely.
    fn reclaim_stale_files(&self) {
        for dir in &self.config.search_dirs {
            if !dir.is_dir() {
                continue;
            }
            let Ok(entries) = std::fs::read_dir(dir) else {
                continue;
            };
            for entry in entries.flatten() {
                let path = entry.path();
                if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
                    continue;
                }
                let Some(name) = SegmentName::parse_path(&path) else {
                    continue;
                };
                let Some(age) = file_age(&path) else {
                    continue;
                };

                let reason = if is_pid_alive(name.pid) {
                    None
                } else if age > self.config.hard_stale {
                    Some("past hard threshold")
                } else if age > self.config.soft_stale {
                    Some("past soft threshold with dead producer")
                } else {
                    None
                };

                if let Some(reason) = reason {
                    match std::fs::remove_file(&path) {
                        Ok(()) => {
                            tracing::info!(path = %path.display(), reason, "reclaimed stale segment file")
                        }
                        Err(err) => {
                            tracing::warn!(path = %path.display(), %err, "could not reclaim stale file")
                        }
                    }
                }
            }
        }
    }

    /// Drop records whose producer died and detach from their segments.
    fn reap_records(&self) {
        let removed = self.tracker.reap_memshare(is_pid_alive);
        if removed.is_empty() {
            return;
        }
        let mut attachments = self.attachments.lock();
        for key in removed {
            let PannerKey::MemShare { pid, addr } = key else {
                continue;
            };
            if let Some(attachment) = attachments.remove(&(pid, addr)) {
                let _ = attachment.segment.unregister_consumer(self.config.consumer_id);
                tracing::info!(pid, "detached from panner segment");
            }
            self.mixer.remove_track(&key);
        }
    }

    /// One refresh tick: drain every attached segment into the tracker and
    /// the mixer. Record liveness advances only when a read succeeds.
    pub fn refresh(&self) {
        let attachments: Vec<(u32, u64, Arc<Segment>)> = {
            let map = self.attachments.lock();
            map.values()
                .map(|a| (a.name.pid, a.name.addr, Arc::clone(&a.segment)))
                .collect()
        };

        for (pid, addr, segment) in attachments {
            for _ in 0..MAX_DRAIN_PER_TICK {
                match segment.read_oldest_unacked(self.config.consumer_id) {
                    Ok(read) => {
                        if let Err(err) =
                            segment.acknowledge(read.buffer_id, self.config.consumer_id)
                        {
                            tracing::debug!(pid, %err, "ack failed");
                        }
                        self.tracker
                            .update_from_segment(pid, addr, segment.audio_format(), &read);
                        self.mixer.submit_block(
                            PannerKey::MemShare { pid, addr },
                            &read.audio,
                            read.params.get_f32(ids::AZIMUTH, 0.0),
                            read.params.get_f32(ids::DIVERGE, 50.0),
                            read.params.get_f32(ids::GAIN, 1.0),
                        );
                    }
                    Err(MemShareError::NoData) => break,
                    Err(err) => {
                        tracing::debug!(pid, %err, "segment read failed");
                        break;
                    }
                }
            }
        }
    }

    pub fn attached_count(&self) -> usize {
        self.attachments.lock().len()
    }

    pub fn attached_paths(&self) -> Vec<PathBuf> {
        self.attachments.lock().values().map(|a| a.path.clone()).collect()
    }
}

fn file_age(path: &Path) -> Option<Duration> {
    let modified = std::fs::metadata(path).ok()?.modified().ok()?;
    modified.elapsed().ok()
}
