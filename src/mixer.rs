//! Spatial bus mixer.
//!
//! Audio drained from panner segments lands here as per-track blocks and is
//! summed into an N-channel spatial bus with master yaw applied. The bus uses
//! a constant-power ring gain law; the full spatial encode/decode lives in the
//! panner plugins themselves, so the bus only has to place and sum already
//! encoded material.

use crate::tracker::PannerKey;
use parking_lot::Mutex;
use std::collections::HashMap;

/// Default spatial bus width.
pub const DEFAULT_BUS_CHANNELS: usize = 8;

/// Per-sample smoothing factor for the level meters.
const LEVEL_SMOOTHING: f32 = 0.8;

struct Track {
    name: String,
    gain: f32,
    muted: bool,
    azimuth: f32,
    diverge: f32,
    pending: Option<Vec<Vec<f32>>>,
    level: f32,
}

struct Inner {
    channels: usize,
    block_size: usize,
    master_yaw: f32,
    master_pitch: f32,
    master_roll: f32,
    tracks: HashMap<PannerKey, Track>,
    output_levels: Vec<f32>,
}

pub struct SpatialMixer {
    inner: Mutex<Inner>,
}

impl Default for SpatialMixer {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CHANNELS, 512)
    }
}

impl SpatialMixer {
    pub fn new(channels: usize, block_size: usize) -> Self {
        Self {
            inner: Mutex::new(Inner {
                channels: channels.max(1),
                block_size,
                master_yaw: 0.0,
                master_pitch: 0.0,
                master_roll: 0.0,
                tracks: HashMap::new(),
                output_levels: vec![0.0; channels.max(1)],
            }),
        }
    }

    pub fn set_output_channels(&self, channels: usize) {
        let mut inner = self.inner.lock();
        inner.channels = channels.max(1);
        inner.output_levels = vec![0.0; inner.channels];
    }

    pub fn set_master_ypr(&self, yaw: f32, pitch: f32, roll: f32) {
        let mut inner = self.inner.lock();
        inner.master_yaw = yaw;
        inner.master_pitch = pitch;
        inner.master_roll = roll;
    }

    pub fn upsert_track(&self, key: PannerKey, name: &str) {
        let mut inner = self.inner.lock();
        inner
            .tracks
            .entry(key)
            .and_modify(|t| t.name = name.to_string())
            .or_insert_with(|| Track {
                name: name.to_string(),
                gain: 1.0,
                muted: false,
                azimuth: 0.0,
                diverge: 50.0,
                pending: None,
                level: 0.0,
            });
    }

    pub fn remove_track(&self, key: &PannerKey) {
        self.inner.lock().tracks.remove(key);
    }

    pub fn set_track_gain(&self, key: &PannerKey, gain: f32) {
        if let Some(track) = self.inner.lock().tracks.get_mut(key) {
            track.gain = gain;
        }
    }

    pub fn set_track_mute(&self, key: &PannerKey, muted: bool) {
        if let Some(track) = self.inner.lock().tracks.get_mut(key) {
            track.muted = muted;
        }
    }

    /// Hand a drained audio block plus its spatial placement to the bus. The
    /// block is consumed by the next `process_block`.
    pub fn submit_block(&self, key: PannerKey, audio: &[Vec<f32>], azimuth: f32, diverge: f32, gain: f32) {
        let mut inner = self.inner.lock();
        let track = inner.tracks.entry(key).or_insert_with(|| Track {
            name: String::new(),
            gain: 1.0,
            muted: false,
            azimuth: 0.0,
            diverge: 50.0,
            pending: None,
            level: 0.0,
        });
        track.azimuth = azimuth;
        track.diverge = diverge;
        track.gain = gain;
        track.pending = Some(audio.to_vec());

        let peak = audio
            .iter()
            .flat_map(|ch| ch.iter())
            .fold(0.0f32, |acc, s| acc.max(s.abs()));
        track.level = track.level * LEVEL_SMOOTHING + peak * (1.0 - LEVEL_SMOOTHING);
    }

    /// Mix every pending block into `output`, which is resized to the bus
    /// shape and zeroed first. Returns the number of tracks that contributed.
    pub fn process_block(&self, output: &mut Vec<Vec<f32>>) -> usize {
        let mut inner = self.inner.lock();
        let channels = inner.channels;
        let block = inner.block_size;
        output.resize(channels, Vec::new());
        for channel in output.iter_mut() {
            channel.clear();
            channel.resize(block, 0.0);
        }

        let yaw = inner.master_yaw;
        let mut mixed = 0;
        for track in inner.tracks.values_mut() {
            let Some(audio) = track.pending.take() else {
                continue;
            };
            if track.muted || audio.is_empty() {
                continue;
            }
            let weights = ring_weights(track.azimuth - yaw, track.diverge, channels);
            let samples = audio[0].len().min(block);

            // Downmix the source channels, then place the mono sum on the bus.
            for frame in 0..samples {
                let mut sum = 0.0f32;
                for channel in &audio {
                    sum += channel[frame];
                }
                sum *= track.gain / audio.len() as f32;
                for (ch, weight) in weights.iter().enumerate() {
                    output[ch][frame] += sum * weight;
                }
            }
            mixed += 1;
        }

        // Smoothed per-channel peaks for the meters.
        for (ch, level) in inner.output_levels.iter_mut().enumerate() {
            let peak = output[ch].iter().fold(0.0f32, |acc, s| acc.max(s.abs()));
            *level = *level * LEVEL_SMOOTHING + peak * (1.0 - LEVEL_SMOOTHING);
        }
        mixed
    }

    pub fn output_levels(&self) -> Vec<f32> {
        self.inner.lock().output_levels.clone()
    }

    pub fn track_level(&self, key: &PannerKey) -> Option<f32> {
        self.inner.lock().tracks.get(key).map(|t| t.level)
    }

    pub fn track_count(&self) -> usize {
        self.inner.lock().tracks.len()
    }

    pub fn track_names(&self) -> Vec<String> {
        self.inner
            .lock()
            .tracks
            .values()
            .map(|t| t.name.clone())
            .collect()
    }
}

/// Constant-power placement on a channel ring. `diverge` blends between a
/// uniform spread (0) and a fully focused placement (100).
fn ring_weights(azimuth_deg: f32, diverge: f32, channels: usize) -> Vec<f32> {
    if channels == 1 {
        return vec![1.0];
    }
    let pos = (azimuth_deg.rem_euclid(360.0) / 360.0) * channels as f32;
    let lo = pos.floor() as usize % channels;
    let hi = (lo + 1) % channels;
    let frac = pos - pos.floor();

    let mut weights = vec![0.0f32; channels];
    weights[lo] = (frac * std::f32::consts::FRAC_PI_2).cos();
    weights[hi] = (frac * std::f32::consts::FRAC_PI_2).sin();

    let focus = (diverge.clamp(0.0, 100.0)) / 100.0;
    let uniform = 1.0 / (channels as f32).sqrt();
    for weight in weights.iter_mut() {
        *weight = *weight * focus + uniform * (1.0 - focus);
    }
    weights
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key(pid: u32) -> PannerKey {
        PannerKey::MemShare { pid, addr: 1 }
    }

    #[test]
    fn test_ring_weights_are_constant_power_when_focused() {
        for azimuth in [0.0, 45.0, 90.0, 123.0, 359.0] {
            let weights = ring_weights(azimuth, 100.0, 8);
            let power: f32 = weights.iter().map(|w| w * w).sum();
            assert!((power - 1.0).abs() < 1e-4, "azimuth {azimuth}: {power}");
        }
    }

    #[test]
    fn test_zero_azimuth_feeds_first_channel() {
        let weights = ring_weights(0.0, 100.0, 8);
        assert!((weights[0] - 1.0).abs() < 1e-6);
        assert!(weights[1..].iter().all(|w| w.abs() < 1e-6));
    }

    #[test]
    fn test_process_block_consumes_pending_audio() {
        let mixer = SpatialMixer::new(8, 64);
        mixer.upsert_track(key(1), "one");
        mixer.submit_block(key(1), &[vec![0.5; 64]], 0.0, 100.0, 1.0);

        let mut out = Vec::new();
        assert_eq!(mixer.process_block(&mut out), 1);
        assert_eq!(out.len(), 8);
        assert_eq!(out[0].len(), 64);
        assert!((out[0][0] - 0.5).abs() < 1e-6);
        assert!(out[1][0].abs() < 1e-6);

        // Block was consumed; the next cycle mixes silence.
        assert_eq!(mixer.process_block(&mut out), 0);
        assert!(out[0][0].abs() < 1e-6);
    }

    #[test]
    fn test_master_yaw_rotates_placement() {
        let mixer = SpatialMixer::new(4, 16);
        mixer.upsert_track(key(1), "one");
        // Source at 90° with master yaw 90° lands back on channel 0.
        mixer.set_master_ypr(90.0, 0.0, 0.0);
        mixer.submit_block(key(1), &[vec![1.0; 16]], 90.0, 100.0, 1.0);

        let mut out = Vec::new();
        mixer.process_block(&mut out);
        assert!((out[0][0] - 1.0).abs() < 1e-6);
    }

    #[test]
    fn test_muted_track_does_not_contribute() {
        let mixer = SpatialMixer::new(4, 16);
        mixer.upsert_track(key(1), "one");
        mixer.set_track_mute(&key(1), true);
        mixer.submit_block(key(1), &[vec![1.0; 16]], 0.0, 100.0, 1.0);

        let mut out = Vec::new();
        assert_eq!(mixer.process_block(&mut out), 0);
    }

    #[test]
    fn test_remove_track() {
        let mixer = SpatialMixer::new(4, 16);
        mixer.upsert_track(key(1), "one");
        assert_eq!(mixer.track_count(), 1);
        mixer.remove_track(&key(1));
        assert_eq!(mixer.track_count(), 0);
    }
}
