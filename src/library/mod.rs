//! Library index: bounded-depth discovery of audio files plus metadata
//! extraction and on-disk caches. The engine trusts what it is handed here
//! and re-validates against the decoder at load time.

pub mod metadata;
pub mod persist;

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use tracing::debug;

/// Extensions the scanner considers audio.
pub const AUDIO_EXTENSIONS: [&str; 9] = [
    "wav", "wave", "flac", "mp3", "m4a", "aac", "ogg", "aiff", "aif",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DirStats {
    pub dir: String,
    #[serde(rename = "fileCount")]
    pub file_count: usize,
}

#[derive(Debug, Default)]
pub struct DiscoverResult {
    pub paths: Vec<PathBuf>,
    pub stats: Vec<DirStats>,
}

pub fn is_audio_path(path: &Path) -> bool {
    path.extension()
        .and_then(|e| e.to_str())
        .map(|e| e.to_ascii_lowercase())
        .map(|e| AUDIO_EXTENSIONS.contains(&e.as_str()))
        .unwrap_or(false)
}

/// Walk `roots` for audio files, descending at most `recursive_level`
/// directory levels below each root (0 scans only the roots themselves).
/// Unreadable entries are skipped, not fatal.
pub fn discover(roots: &[PathBuf], recursive_level: usize) -> DiscoverResult {
    let mut result = DiscoverResult::default();
    for root in roots {
        walk(root, recursive_level, &mut result);
    }
    result.paths.sort();
    result.paths.dedup();
    result
}

fn walk(dir: &Path, depth_left: usize, result: &mut DiscoverResult) {
    let entries = match std::fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) => {
            debug!(dir = %dir.display(), "skipping unreadable directory: {}", e);
            return;
        }
    };
    let mut count = 0_usize;
    let mut subdirs = vec![];
    for entry in entries.filter_map(Result::ok) {
        let path = entry.path();
        if path.is_dir() {
            subdirs.push(path);
        } else if is_audio_path(&path) {
            result.paths.push(path);
            count += 1;
        }
    }
    result.stats.push(DirStats {
        dir: dir.display().to_string(),
        file_count: count,
    });
    if depth_left > 0 {
        subdirs.sort();
        for subdir in subdirs {
            walk(&subdir, depth_left - 1, result);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn touch(path: &Path) {
        std::fs::write(path, b"x").unwrap();
    }

    #[test]
    fn discover_respects_recursion_bound() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path();
        touch(&root.join("a.wav"));
        touch(&root.join("not_audio.txt"));
        std::fs::create_dir(root.join("sub")).unwrap();
        touch(&root.join("sub/b.flac"));
        std::fs::create_dir(root.join("sub/deeper")).unwrap();
        touch(&root.join("sub/deeper/c.mp3"));

        let shallow = discover(&[root.to_path_buf()], 0);
        assert_eq!(shallow.paths.len(), 1);
        assert_eq!(shallow.stats.len(), 1);
        assert_eq!(shallow.stats[0].file_count, 1);

        let one_level = discover(&[root.to_path_buf()], 1);
        assert_eq!(one_level.paths.len(), 2);

        let two_levels = discover(&[root.to_path_buf()], 2);
        assert_eq!(two_levels.paths.len(), 3);
        let total: usize = two_levels.stats.iter().map(|s| s.file_count).sum();
        assert_eq!(total, 3);
    }

    #[test]
    fn extension_filter_is_case_insensitive() {
        assert!(is_audio_path(Path::new("x/SONG.WAV")));
        assert!(is_audio_path(Path::new("x/song.FlAc")));
        assert!(!is_audio_path(Path::new("x/song.pdf")));
        assert!(!is_audio_path(Path::new("noext")));
    }
}
