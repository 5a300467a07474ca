//! Typed parameter map carried alongside every queued audio buffer.
//!
//! Parameters are keyed by 32-bit IDs (hashes of canonical names) and hold one
//! of four value kinds. The wire form is a length-prefixed sequence of
//! `(id, tag, value)` entries so producer and consumer can exchange sparse
//! maps without a schema.

use crate::error::{MemShareError, Result};
use std::collections::BTreeMap;

/// Well-known parameter IDs (32-bit hashes of the canonical names).
pub mod ids {
    pub const AZIMUTH: u32 = 0x1A2B3C4D; // "azimuth"
    pub const ELEVATION: u32 = 0x2B3C4D5E; // "elevation"
    pub const DIVERGE: u32 = 0x3C4D5E6F; // "diverge"
    pub const GAIN: u32 = 0x4D5E6F70; // "gain"
    pub const STEREO_ORBIT_AZIMUTH: u32 = 0x5E6F7081; // "stereoOrbitAzimuth"
    pub const STEREO_SPREAD: u32 = 0x6F708192; // "stereoSpread"
    pub const STEREO_INPUT_BALANCE: u32 = 0x708192A3; // "stereoInputBalance"
    pub const AUTO_ORBIT: u32 = 0x8192A3B4; // "autoOrbit"
    pub const ISOTROPIC_MODE: u32 = 0x92A3B4C5; // "isotropicMode"
    pub const EQUALPOWER_MODE: u32 = 0xA3B4C5D6; // "equalpowerMode"
    pub const GAIN_COMPENSATION_MODE: u32 = 0xB4C5D6E7; // "gainCompensationMode"
    pub const LOCK_OUTPUT_LAYOUT: u32 = 0xC5D6E7F8; // "lockOutputLayout"
    pub const INPUT_MODE: u32 = 0xD6E7F809; // "inputMode"
    pub const OUTPUT_MODE: u32 = 0xE7F8091A; // "outputMode"
    pub const PORT: u32 = 0xF8091A2B; // "port"
    pub const STATE: u32 = 0x091A2B3C; // "state"
    pub const COLOR_R: u32 = 0x1A2B3C4E; // "colorR"
    pub const COLOR_G: u32 = 0x2B3C4E5F; // "colorG"
    pub const COLOR_B: u32 = 0x3C4E5F60; // "colorB"
    pub const COLOR_A: u32 = 0x4E5F6071; // "colorA"
    pub const DISPLAY_NAME: u32 = 0x5F607182; // "displayName"
    pub const BUFFER_ID: u32 = 0x60718293; // "bufferId"
    pub const BUFFER_SEQUENCE: u32 = 0x71829304; // "bufferSequence"
    pub const BUFFER_TIMESTAMP: u32 = 0x82930415; // "bufferTimestamp"

    /// Hash a canonical parameter name into a dynamic ID.
    pub fn hash_name(name: &str) -> u32 {
        name.bytes()
            .fold(0u32, |hash, b| hash.wrapping_mul(31).wrapping_add(b as u32))
    }
}

/// One parameter value.
#[derive(Debug, Clone, PartialEq)]
pub enum ParameterValue {
    F32(f32),
    I32(i32),
    Bool(bool),
    Str(String),
}

impl ParameterValue {
    fn wire_tag(&self) -> u8 {
        match self {
            ParameterValue::F32(_) => 1,
            ParameterValue::I32(_) => 2,
            ParameterValue::Bool(_) => 3,
            ParameterValue::Str(_) => 4,
        }
    }
}

/// Sparse map of parameter ID to typed value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ParameterMap {
    entries: BTreeMap<u32, ParameterValue>,
}

impl ParameterMap {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn set(&mut self, id: u32, value: ParameterValue) {
        self.entries.insert(id, value);
    }

    pub fn set_f32(&mut self, id: u32, value: f32) {
        self.set(id, ParameterValue::F32(value));
    }

    pub fn set_i32(&mut self, id: u32, value: i32) {
        self.set(id, ParameterValue::I32(value));
    }

    pub fn set_bool(&mut self, id: u32, value: bool) {
        self.set(id, ParameterValue::Bool(value));
    }

    pub fn set_str(&mut self, id: u32, value: impl Into<String>) {
        self.set(id, ParameterValue::Str(value.into()));
    }

    pub fn get(&self, id: u32) -> Option<&ParameterValue> {
        self.entries.get(&id)
    }

    pub fn get_f32(&self, id: u32, default: f32) -> f32 {
        match self.entries.get(&id) {
            Some(ParameterValue::F32(v)) => *v,
            _ => default,
        }
    }

    pub fn get_i32(&self, id: u32, default: i32) -> i32 {
        match self.entries.get(&id) {
            Some(ParameterValue::I32(v)) => *v,
            _ => default,
        }
    }

    pub fn get_bool(&self, id: u32, default: bool) -> bool {
        match self.entries.get(&id) {
            Some(ParameterValue::Bool(v)) => *v,
            _ => default,
        }
    }

    pub fn get_str(&self, id: u32, default: &str) -> String {
        match self.entries.get(&id) {
            Some(ParameterValue::Str(v)) => v.clone(),
            _ => default.to_string(),
        }
    }

    pub fn iter(&self) -> impl Iterator<Item = (&u32, &ParameterValue)> {
        self.entries.iter()
    }

    /// Number of bytes `encode` will produce.
    pub fn encoded_len(&self) -> usize {
        4 + self
            .entries
            .values()
            .map(|v| {
                5 + match v {
                    ParameterValue::F32(_) | ParameterValue::I32(_) => 4,
                    ParameterValue::Bool(_) => 1,
                    ParameterValue::Str(s) => 4 + s.len(),
                }
            })
            .sum::<usize>()
    }

    /// Append the wire form to `out`.
    pub fn encode(&self, out: &mut Vec<u8>) {
        out.extend_from_slice(&(self.entries.len() as u32).to_le_bytes());
        for (id, value) in &self.entries {
            out.extend_from_slice(&id.to_le_bytes());
            out.push(value.wire_tag());
            match value {
                ParameterValue::F32(v) => out.extend_from_slice(&v.to_le_bytes()),
                ParameterValue::I32(v) => out.extend_from_slice(&v.to_le_bytes()),
                ParameterValue::Bool(v) => out.push(u8::from(*v)),
                ParameterValue::Str(s) => {
                    out.extend_from_slice(&(s.len() as u32).to_le_bytes());
                    out.extend_from_slice(s.as_bytes());
                }
            }
        }
    }

    /// Decode a wire-form map from the front of `bytes`.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        let mut cursor = Cursor::new(bytes);
        let count = cursor.u32()?;
        let mut map = ParameterMap::new();
        for _ in 0..count {
            let id = cursor.u32()?;
            let tag = cursor.u8()?;
            let value = match tag {
                1 => ParameterValue::F32(f32::from_le_bytes(cursor.array::<4>()?)),
                2 => ParameterValue::I32(i32::from_le_bytes(cursor.array::<4>()?)),
                3 => ParameterValue::Bool(cursor.u8()? != 0),
                4 => {
                    let len = cursor.u32()? as usize;
                    let raw = cursor.bytes(len)?;
                    let s = std::str::from_utf8(raw).map_err(|_| {
                        MemShareError::Corrupt(format!("parameter {id:#x}: invalid UTF-8"))
                    })?;
                    ParameterValue::Str(s.to_string())
                }
                other => {
                    return Err(MemShareError::Corrupt(format!(
                        "parameter {id:#x}: unknown value tag {other}"
                    )))
                }
            };
            map.set(id, value);
        }
        Ok(map)
    }
}

struct Cursor<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    fn bytes(&mut self, len: usize) -> Result<&'a [u8]> {
        let end = self
            .pos
            .checked_add(len)
            .filter(|end| *end <= self.bytes.len())
            .ok_or_else(|| MemShareError::Corrupt("parameter map truncated".into()))?;
        let out = &self.bytes[self.pos..end];
        self.pos = end;
        Ok(out)
    }

    fn array<const N: usize>(&mut self) -> Result<[u8; N]> {
        let raw = self.bytes(N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(raw);
        Ok(out)
    }

    fn u8(&mut self) -> Result<u8> {
        Ok(self.bytes(1)?[0])
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.array::<4>()?))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_wire_roundtrip_is_identity() {
        let mut map = ParameterMap::new();
        map.set_f32(ids::AZIMUTH, 0.5);
        map.set_f32(ids::ELEVATION, -0.25);
        map.set_i32(ids::INPUT_MODE, 2);
        map.set_bool(ids::AUTO_ORBIT, true);
        map.set_str(ids::DISPLAY_NAME, "Drums L");

        let mut encoded = Vec::new();
        map.encode(&mut encoded);
        assert_eq!(encoded.len(), map.encoded_len());

        let decoded = ParameterMap::decode(&encoded).unwrap();
        assert_eq!(decoded, map);
        assert_eq!(decoded.get_f32(ids::AZIMUTH, 0.0), 0.5);
        assert_eq!(decoded.get_f32(ids::ELEVATION, 0.0), -0.25);
        assert_eq!(decoded.get_i32(ids::INPUT_MODE, 0), 2);
        assert!(decoded.get_bool(ids::AUTO_ORBIT, false));
        assert_eq!(decoded.get_str(ids::DISPLAY_NAME, ""), "Drums L");
    }

    #[test]
    fn test_empty_map_roundtrip() {
        let map = ParameterMap::new();
        let mut encoded = Vec::new();
        map.encode(&mut encoded);
        assert_eq!(encoded, 0u32.to_le_bytes());
        assert!(ParameterMap::decode(&encoded).unwrap().is_empty());
    }

    #[test]
    fn test_getters_fall_back_on_missing_or_mistyped() {
        let mut map = ParameterMap::new();
        map.set_i32(ids::PORT, 9001);

        assert_eq!(map.get_i32(ids::PORT, 0), 9001);
        // Wrong type falls back to the default rather than coercing.
        assert_eq!(map.get_f32(ids::PORT, 1.25), 1.25);
        assert_eq!(map.get_f32(ids::GAIN, 1.0), 1.0);
        assert_eq!(map.get_str(ids::DISPLAY_NAME, "unnamed"), "unnamed");
    }

    #[test]
    fn test_decode_rejects_truncated_input() {
        let mut map = ParameterMap::new();
        map.set_str(ids::DISPLAY_NAME, "Bus 1");
        let mut encoded = Vec::new();
        map.encode(&mut encoded);

        encoded.truncate(encoded.len() - 2);
        assert!(ParameterMap::decode(&encoded).is_err());
    }

    #[test]
    fn test_decode_rejects_unknown_tag() {
        let mut encoded = Vec::new();
        encoded.extend_from_slice(&1u32.to_le_bytes());
        encoded.extend_from_slice(&ids::GAIN.to_le_bytes());
        encoded.push(9); // no such tag
        encoded.extend_from_slice(&[0, 0, 0, 0]);
        assert!(ParameterMap::decode(&encoded).is_err());
    }

    #[test]
    fn test_hash_name() {
        // hash(c0..cn) = ((c0 * 31) + c1) * 31 + ...
        let expected = "az"
            .bytes()
            .fold(0u32, |h, b| h.wrapping_mul(31).wrapping_add(b as u32));
        assert_eq!(ids::hash_name("az"), expected);
        assert_ne!(ids::hash_name("azimuth"), ids::hash_name("elevation"));
    }
}
