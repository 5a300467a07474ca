//! Shared-directory search paths for panner segment files.
//!
//! Producers drop their segment files into a platform cache directory; the
//! scanner walks this prioritized list. The sandbox group container comes
//! first where the platform has one, then the per-user caches, then temp
//! fallbacks.

use std::path::PathBuf;

const PANNER_CACHE_DIR: &str = "M1-Panner";

/// Prioritized list of directories that may hold segment files. Directories
/// that do not exist are still returned; the scanner skips them.
pub fn shared_directories() -> Vec<PathBuf> {
    let mut dirs = Vec::new();

    #[cfg(target_os = "macos")]
    {
        if let Ok(home) = std::env::var("HOME") {
            let home = PathBuf::from(home);
            // Sandboxed group container first.
            dirs.push(
                home.join("Library/Group Containers/group.com.mach1.spatial.shared")
                    .join("Library/Caches")
                    .join(PANNER_CACHE_DIR),
            );
            dirs.push(home.join("Library/Caches").join(PANNER_CACHE_DIR));
            dirs.push(
                home.join("Library/Containers/com.mach1.spatial.helper/Data/Library/Caches")
                    .join(PANNER_CACHE_DIR),
            );
        }
        dirs.push(PathBuf::from("/tmp").join(PANNER_CACHE_DIR));
    }

    #[cfg(target_os = "windows")]
    {
        if let Ok(appdata) = std::env::var("LOCALAPPDATA") {
            dirs.push(PathBuf::from(appdata).join(PANNER_CACHE_DIR));
        }
        if let Ok(temp) = std::env::var("TEMP") {
            dirs.push(PathBuf::from(temp).join(PANNER_CACHE_DIR));
        }
    }

    #[cfg(not(any(target_os = "macos", target_os = "windows")))]
    {
        if let Ok(home) = std::env::var("HOME") {
            let home = PathBuf::from(home);
            dirs.push(home.join(".cache").join(PANNER_CACHE_DIR));
            dirs.push(home.join(".local/share").join(PANNER_CACHE_DIR));
        }
        dirs.push(PathBuf::from("/tmp").join(PANNER_CACHE_DIR));
    }

    dirs
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_directories_are_nonempty_and_end_in_cache_dir() {
        let dirs = shared_directories();
        assert!(!dirs.is_empty());
        for dir in &dirs {
            assert_eq!(
                dir.file_name().and_then(|n| n.to_str()),
                Some(PANNER_CACHE_DIR)
            );
        }
    }
}
