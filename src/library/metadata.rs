//! Metadata extraction: builds the full `AudioAsset` for a file, including
//! embedded cover art and chapter markers.

use daqplay_engine::asset::{AudioAsset, Chapter};
use daqplay_engine::error::EngineError;
use std::collections::BTreeMap;
use std::fs::File;
use std::path::Path;
use symphonia::core::{
    formats::FormatOptions,
    io::MediaSourceStream,
    meta::{MetadataOptions, MetadataRevision, StandardTagKey, Value},
    probe::Hint,
};
use tracing::debug;

pub fn extract(path: &Path) -> Result<AudioAsset, EngineError> {
    let file = File::open(path).map_err(|e| {
        EngineError::Validation(format!("cannot open '{}': {}", path.display(), e))
    })?;
    let size_bytes = file.metadata().map(|m| m.len()).unwrap_or(0);
    let mss = MediaSourceStream::new(Box::new(file), Default::default());
    let mut hint = Hint::new();
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        hint.with_extension(ext);
    }
    let mut probed = symphonia::default::get_probe()
        .format(
            &hint,
            mss,
            &FormatOptions::default(),
            &MetadataOptions::default(),
        )
        .map_err(|e| {
            EngineError::Decoder(format!(
                "unsupported or unreadable audio '{}': {}",
                path.display(),
                e
            ))
        })?;
    let format = &mut probed.format;
    let track = format.default_track().ok_or_else(|| {
        EngineError::Decoder(format!("no decodable audio track in '{}'", path.display()))
    })?;
    let params = track.codec_params.clone();
    let sample_rate = params.sample_rate.unwrap_or(48_000);
    let channel_count = params.channels.map(|c| c.count()).unwrap_or(1).max(1);
    let total_frames = params.n_frames.unwrap_or(0);
    let duration_s = total_frames as f64 / sample_rate as f64;

    let mut artist = None;
    let mut thumbnail = None;
    let mut chapter_tags: BTreeMap<u32, (Option<f64>, Option<String>)> = BTreeMap::new();

    // Side metadata discovered during probing (ID3 and friends), then the
    // container's own metadata.
    if let Some(mut side) = probed.metadata.get() {
        if let Some(revision) = side.skip_to_latest() {
            harvest(revision, &mut artist, &mut thumbnail, &mut chapter_tags);
        }
    }
    if let Some(revision) = format.metadata().skip_to_latest() {
        harvest(revision, &mut artist, &mut thumbnail, &mut chapter_tags);
    }

    let mut chapters: Vec<Chapter> = chapter_tags
        .into_iter()
        .filter_map(|(index, (timestamp, title))| {
            let timestamp_s = timestamp?;
            Some(Chapter {
                timestamp_s,
                title: title.unwrap_or_else(|| format!("Chapter {}", index + 1)),
                description: None,
                start_sample: Some((timestamp_s * sample_rate as f64).round() as u64),
            })
        })
        .collect();

    // Containers with native cue points (FLAC cuesheets) take precedence
    // over comment-style chapters.
    if let Some(time_base) = params.time_base {
        let cues = format.cues();
        if !cues.is_empty() {
            chapters = cues
                .iter()
                .map(|cue| {
                    let time = time_base.calc_time(cue.start_ts);
                    let timestamp_s = time.seconds as f64 + time.frac;
                    let title = cue
                        .tags
                        .iter()
                        .find(|t| {
                            t.std_key == Some(StandardTagKey::TrackTitle)
                                || t.key.eq_ignore_ascii_case("title")
                        })
                        .map(|t| t.value.to_string())
                        .unwrap_or_else(|| format!("Track {}", cue.index));
                    Chapter {
                        timestamp_s,
                        title,
                        description: None,
                        start_sample: Some(cue.start_ts),
                    }
                })
                .collect();
        }
    }

    let mut asset = AudioAsset {
        path: path.to_path_buf(),
        sample_rate_hz: sample_rate,
        bit_depth: params.bits_per_sample,
        channel_count,
        duration_s,
        size_bytes,
        artist,
        thumbnail,
        chapters,
    };
    asset.normalize_chapters();
    debug!(
        path = %path.display(),
        chapters = asset.chapters.len(),
        "extracted metadata"
    );
    Ok(asset)
}

fn harvest(
    revision: &MetadataRevision,
    artist: &mut Option<String>,
    thumbnail: &mut Option<Vec<u8>>,
    chapter_tags: &mut BTreeMap<u32, (Option<f64>, Option<String>)>,
) {
    for tag in revision.tags() {
        if tag.std_key == Some(StandardTagKey::Artist) && artist.is_none() {
            *artist = Some(tag.value.to_string());
        }
        if let Some((index, is_name)) = parse_chapter_key(&tag.key) {
            let entry = chapter_tags.entry(index).or_default();
            if is_name {
                entry.1 = Some(tag.value.to_string());
            } else if let Some(ts) = parse_chapter_timestamp(&tag.value) {
                entry.0 = Some(ts);
            }
        }
    }
    if thumbnail.is_none() {
        if let Some(visual) = revision.visuals().first() {
            *thumbnail = Some(visual.data.to_vec());
        }
    }
}

/// `CHAPTER001` -> (1, false); `CHAPTER001NAME` -> (1, true).
fn parse_chapter_key(key: &str) -> Option<(u32, bool)> {
    let rest = key
        .strip_prefix("CHAPTER")
        .or_else(|| key.strip_prefix("chapter"))?;
    let (digits, suffix) = rest.split_at(rest.find(|c: char| !c.is_ascii_digit()).unwrap_or(rest.len()));
    if digits.is_empty() {
        return None;
    }
    let index: u32 = digits.parse().ok()?;
    match suffix {
        "" => Some((index, false)),
        s if s.eq_ignore_ascii_case("name") => Some((index, true)),
        _ => None,
    }
}

/// `HH:MM:SS.mmm` (or `MM:SS.mmm`) to seconds.
fn parse_chapter_timestamp(value: &Value) -> Option<f64> {
    let text = value.to_string();
    let mut seconds = 0.0_f64;
    for part in text.split(':') {
        let v: f64 = part.trim().parse().ok()?;
        seconds = seconds * 60.0 + v;
    }
    (seconds.is_finite() && seconds >= 0.0).then_some(seconds)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chapter_keys_parse() {
        assert_eq!(parse_chapter_key("CHAPTER000"), Some((0, false)));
        assert_eq!(parse_chapter_key("CHAPTER012NAME"), Some((12, true)));
        assert_eq!(parse_chapter_key("CHAPTER2name"), Some((2, true)));
        assert_eq!(parse_chapter_key("CHAPTERS"), None);
        assert_eq!(parse_chapter_key("ARTIST"), None);
    }

    #[test]
    fn chapter_timestamps_parse() {
        let ts = |s: &str| parse_chapter_timestamp(&Value::String(s.to_string()));
        assert_eq!(ts("00:00:15.500"), Some(15.5));
        assert_eq!(ts("01:02:03.000"), Some(3723.0));
        assert_eq!(ts("02:30.25"), Some(150.25));
        assert_eq!(ts("nonsense"), None);
    }

    #[test]
    fn extract_reads_wav_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("probe.wav");
        let samples = vec![0.1_f32; 4410 * 2];
        wavers::write::<f32, _>(&path, &samples, 44_100, 2).unwrap();
        let asset = extract(&path).unwrap();
        assert_eq!(asset.sample_rate_hz, 44_100);
        assert_eq!(asset.channel_count, 2);
        assert!((asset.duration_s - 0.1).abs() < 1.0e-6);
        assert!(asset.size_bytes > 0);
        assert!(asset.chapters.is_empty());
    }

    #[test]
    fn extract_rejects_missing_file() {
        let result = extract(Path::new("/no/such/file.flac"));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
