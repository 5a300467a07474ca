//! Segment file naming.
//!
//! Every producer names its segment
//! `M1SpatialSystem_<role>_PID<pid>_PTR<addr>_T<timestamp>` with a `.mem`
//! extension. `(pid, addr)` is the durable key for a producer instance; the
//! timestamp disambiguates a re-created segment from the same process.

use std::path::Path;

/// Common prefix of every segment file.
pub const SEGMENT_PREFIX: &str = "M1SpatialSystem_";

/// File extension of segment files (without the dot).
pub const SEGMENT_EXTENSION: &str = "mem";

/// Parsed identity of a segment file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SegmentName {
    /// Producer role, e.g. `M1Panner`.
    pub role: String,
    /// Producer process ID.
    pub pid: u32,
    /// Producer-chosen address token (hex or decimal in the file name).
    pub addr: u64,
    /// Creation time in milliseconds since the Unix epoch.
    pub timestamp_ms: u64,
}

impl SegmentName {
    pub fn new(role: impl Into<String>, pid: u32, addr: u64, timestamp_ms: u64) -> Self {
        Self {
            role: role.into(),
            pid,
            addr,
            timestamp_ms,
        }
    }

    /// File stem (no extension) for this identity.
    pub fn stem(&self) -> String {
        format!(
            "{}{}_PID{}_PTR{:#x}_T{}",
            SEGMENT_PREFIX, self.role, self.pid, self.addr, self.timestamp_ms
        )
    }

    /// Full file name including the `.mem` extension.
    pub fn file_name(&self) -> String {
        format!("{}.{}", self.stem(), SEGMENT_EXTENSION)
    }

    /// Parse a file stem. Returns `None` when any of the `_PID`, `_PTR`, `_T`
    /// tokens is missing or malformed.
    pub fn parse(stem: &str) -> Option<Self> {
        let rest = stem.strip_prefix(SEGMENT_PREFIX)?;

        let pid_pos = rest.find("_PID")?;
        let role = &rest[..pid_pos];
        if role.is_empty() {
            return None;
        }

        let after_pid = &rest[pid_pos + 4..];
        let pid_end = after_pid.find('_')?;
        let pid: u32 = after_pid[..pid_end].parse().ok()?;

        let after = &after_pid[pid_end..];
        let addr_str = after.strip_prefix("_PTR")?;
        let addr_end = addr_str.find('_')?;
        let addr = parse_addr(&addr_str[..addr_end])?;

        let ts_str = addr_str[addr_end..].strip_prefix("_T")?;
        let timestamp_ms: u64 = ts_str.parse().ok()?;

        Some(Self {
            role: role.to_string(),
            pid,
            addr,
            timestamp_ms,
        })
    }

    /// Parse a path, requiring the `.mem` extension.
    pub fn parse_path(path: &Path) -> Option<Self> {
        if path.extension().and_then(|e| e.to_str()) != Some(SEGMENT_EXTENSION) {
            return None;
        }
        Self::parse(path.file_stem()?.to_str()?)
    }
}

/// Address tokens are usually hex (with or without `0x`), with decimal as a
/// last resort for producers that formatted the pointer as an integer.
fn parse_addr(token: &str) -> Option<u64> {
    if token.is_empty() {
        return None;
    }
    if let Some(hex) = token.strip_prefix("0x").or_else(|| token.strip_prefix("0X")) {
        return u64::from_str_radix(hex, 16).ok();
    }
    u64::from_str_radix(token, 16)
        .ok()
        .or_else(|| token.parse().ok())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_format_parse_roundtrip() {
        let name = SegmentName::new("M1Panner", 4321, 0x7f3a_9c00, 1_700_000_123_456);
        let parsed = SegmentName::parse(&name.stem()).unwrap();
        assert_eq!(parsed, name);
        assert!(name.file_name().ends_with(".mem"));
    }

    #[test]
    fn test_parse_hex_variants_and_decimal_fallback() {
        let with_prefix =
            SegmentName::parse("M1SpatialSystem_M1Panner_PID100_PTR0x1f_T5").unwrap();
        assert_eq!(with_prefix.addr, 0x1f);

        let bare_hex = SegmentName::parse("M1SpatialSystem_M1Panner_PID100_PTR1f_T5").unwrap();
        assert_eq!(bare_hex.addr, 0x1f);

        // A token hex can't express ('g'...) falls through to decimal, while
        // all-digit tokens parse as hex first, matching how producers format
        // pointers.
        let digits = SegmentName::parse("M1SpatialSystem_M1Panner_PID100_PTR10_T5").unwrap();
        assert_eq!(digits.addr, 0x10);
    }

    #[test]
    fn test_parse_rejects_missing_tokens() {
        assert!(SegmentName::parse("M1SpatialSystem_M1Panner_PTR0x1_T5").is_none());
        assert!(SegmentName::parse("M1SpatialSystem_M1Panner_PID100_T5").is_none());
        assert!(SegmentName::parse("M1SpatialSystem_M1Panner_PID100_PTR0x1").is_none());
        assert!(SegmentName::parse("NotASegment_PID100_PTR0x1_T5").is_none());
        assert!(SegmentName::parse("M1SpatialSystem_M1Panner_PIDx_PTR0x1_T5").is_none());
    }

    #[test]
    fn test_parse_path_requires_mem_extension() {
        let good = PathBuf::from("/tmp/M1SpatialSystem_M1Panner_PID1_PTR0x2_T3.mem");
        assert!(SegmentName::parse_path(&good).is_some());

        let bad_ext = PathBuf::from("/tmp/M1SpatialSystem_M1Panner_PID1_PTR0x2_T3.tmp");
        assert!(SegmentName::parse_path(&bad_ext).is_none());
    }
}
