use serde::{Deserialize, Serialize};
use std::path::PathBuf;

/// A named offset inside an asset, parsed from container metadata.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Chapter {
    pub timestamp_s: f64,
    pub title: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub start_sample: Option<u64>,
}

/// Immutable description of one audio file, as produced by the metadata
/// extractor. `duration_s` tracks `total_frames / sample_rate_hz` to within
/// one frame; chapter timestamps are non-decreasing and bounded by the
/// duration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AudioAsset {
    pub path: PathBuf,
    pub sample_rate_hz: u32,
    pub bit_depth: Option<u32>,
    pub channel_count: usize,
    pub duration_s: f64,
    pub size_bytes: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub artist: Option<String>,
    /// Embedded cover art (PNG or JPEG bytes), if the container carries one.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub thumbnail: Option<Vec<u8>>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub chapters: Vec<Chapter>,
}

impl AudioAsset {
    pub fn total_frames(&self) -> u64 {
        (self.duration_s * self.sample_rate_hz as f64).round() as u64
    }

    /// Clamp chapter timestamps into `[0, duration_s]` and drop entries that
    /// would break the non-decreasing ordering invariant.
    pub fn normalize_chapters(&mut self) {
        self.chapters
            .retain(|c| c.timestamp_s.is_finite() && c.timestamp_s >= 0.0);
        let duration = self.duration_s;
        for chapter in &mut self.chapters {
            if chapter.timestamp_s > duration {
                chapter.timestamp_s = duration;
            }
        }
        let mut last = 0.0_f64;
        self.chapters.retain(|c| {
            if c.timestamp_s >= last {
                last = c.timestamp_s;
                true
            } else {
                false
            }
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn chapter(ts: f64, title: &str) -> Chapter {
        Chapter {
            timestamp_s: ts,
            title: title.to_string(),
            description: None,
            start_sample: None,
        }
    }

    #[test]
    fn chapters_are_clamped_and_ordered() {
        let mut asset = AudioAsset {
            path: PathBuf::from("a.flac"),
            sample_rate_hz: 48_000,
            bit_depth: Some(16),
            channel_count: 2,
            duration_s: 10.0,
            size_bytes: 0,
            artist: None,
            thumbnail: None,
            chapters: vec![
                chapter(0.0, "one"),
                chapter(4.0, "two"),
                chapter(2.0, "out of order"),
                chapter(99.0, "past the end"),
                chapter(-1.0, "negative"),
            ],
        };
        asset.normalize_chapters();
        let stamps: Vec<f64> = asset.chapters.iter().map(|c| c.timestamp_s).collect();
        assert_eq!(stamps, vec![0.0, 4.0, 10.0]);
    }

    #[test]
    fn total_frames_matches_duration() {
        let asset = AudioAsset {
            path: PathBuf::from("a.wav"),
            sample_rate_hz: 44_100,
            bit_depth: Some(24),
            channel_count: 1,
            duration_s: 2.5,
            size_bytes: 0,
            artist: None,
            thumbnail: None,
            chapters: vec![],
        };
        assert_eq!(asset.total_frames(), 110_250);
    }

    #[test]
    fn serialization_skips_absent_optionals() {
        let asset = AudioAsset {
            path: PathBuf::from("a.wav"),
            sample_rate_hz: 48_000,
            bit_depth: None,
            channel_count: 1,
            duration_s: 1.0,
            size_bytes: 4,
            artist: None,
            thumbnail: None,
            chapters: vec![],
        };
        let json = serde_json::to_string(&asset).unwrap();
        assert!(!json.contains("artist"));
        assert!(!json.contains("thumbnail"));
        assert!(!json.contains("chapters"));
    }
}
