//! Multi-track composer: assembles one FLAC file from a declarative YAML
//! description. Source tracks are decoded through the normal engine
//! decoder, concatenated at a common rate and channel shape, and the
//! result carries one chapter marker per track so the player can navigate
//! it like any other chaptered asset.

use daqplay_engine::asset::Chapter;
use daqplay_engine::decoder::{Decoder, SampleSource};
use daqplay_engine::error::EngineError;
use flacenc::bitsink::ByteSink;
use flacenc::component::BitRepr;
use flacenc::error::Verify;
use serde::Deserialize;
use std::path::{Path, PathBuf};
use tracing::info;

#[derive(Debug, Deserialize)]
pub struct CompositionSpec {
    #[serde(default)]
    pub title: Option<String>,
    pub tracks: Vec<TrackEntry>,
}

#[derive(Debug, Deserialize)]
pub struct TrackEntry {
    pub file: PathBuf,
    #[serde(default)]
    pub title: Option<String>,
    #[serde(default)]
    pub gain_db: Option<f32>,
    /// Silence inserted before this track.
    #[serde(default)]
    pub gap_s: Option<f64>,
}

#[derive(Debug)]
pub struct ComposeSummary {
    pub output: PathBuf,
    pub sample_rate_hz: u32,
    pub channels: usize,
    pub total_frames: u64,
    pub chapters: Vec<Chapter>,
}

pub fn compose(spec_path: &Path, output: &Path) -> Result<ComposeSummary, EngineError> {
    let text = std::fs::read_to_string(spec_path).map_err(|e| {
        EngineError::Validation(format!("cannot read '{}': {}", spec_path.display(), e))
    })?;
    let spec: CompositionSpec = serde_yaml::from_str(&text).map_err(|e| {
        EngineError::Validation(format!("bad composition '{}': {}", spec_path.display(), e))
    })?;
    if spec.tracks.is_empty() {
        return Err(EngineError::Validation(
            "composition has no tracks".to_string(),
        ));
    }
    let base_dir = spec_path.parent().unwrap_or(Path::new("."));

    // First pass: open every source, fix the output rate and width.
    let mut decoders = Vec::with_capacity(spec.tracks.len());
    let mut sample_rate = 0_u32;
    let mut channels = 0_usize;
    for entry in &spec.tracks {
        let path = resolve(base_dir, &entry.file);
        let decoder = Decoder::open(&path)?;
        if sample_rate == 0 {
            sample_rate = decoder.sample_rate_hz();
        } else if decoder.sample_rate_hz() != sample_rate {
            return Err(EngineError::Validation(format!(
                "'{}' is {} Hz but the composition runs at {} Hz; resampling is not supported",
                path.display(),
                decoder.sample_rate_hz(),
                sample_rate
            )));
        }
        channels = channels.max(decoder.channel_count());
        decoders.push(decoder);
    }

    // Second pass: decode, widen, gain, concatenate.
    let mut mixed: Vec<f32> = Vec::new();
    let mut chapters = Vec::with_capacity(spec.tracks.len());
    for (entry, mut decoder) in spec.tracks.iter().zip(decoders) {
        let gap_frames = (entry.gap_s.unwrap_or(0.0).max(0.0) * sample_rate as f64).round() as usize;
        mixed.extend(std::iter::repeat_n(0.0_f32, gap_frames * channels));

        let start_frame = mixed.len() / channels;
        chapters.push(Chapter {
            timestamp_s: start_frame as f64 / sample_rate as f64,
            title: entry
                .title
                .clone()
                .unwrap_or_else(|| stem_of(&entry.file)),
            description: None,
            start_sample: Some(start_frame as u64),
        });

        let gain = 10.0_f32.powf(entry.gain_db.unwrap_or(0.0) / 20.0);
        let src_channels = decoder.channel_count();
        let mut scratch = vec![0.0_f32; 4096 * src_channels];
        loop {
            let read = decoder.read_into(&mut scratch, 4096)?;
            if read == 0 {
                break;
            }
            for frame in scratch[..read * src_channels].chunks(src_channels) {
                for ch in 0..channels {
                    mixed.push(frame[ch % src_channels] * gain);
                }
            }
        }
    }

    let total_frames = (mixed.len() / channels) as u64;
    let bytes = encode_flac(&mixed, channels, sample_rate)?;
    let bytes = embed_chapters(bytes, &chapters, spec.title.as_deref())?;
    std::fs::write(output, &bytes).map_err(|e| {
        EngineError::Internal(format!("cannot write '{}': {}", output.display(), e))
    })?;
    info!(
        output = %output.display(),
        tracks = chapters.len(),
        total_frames,
        "composition written"
    );
    Ok(ComposeSummary {
        output: output.to_path_buf(),
        sample_rate_hz: sample_rate,
        channels,
        total_frames,
        chapters,
    })
}

fn resolve(base: &Path, file: &Path) -> PathBuf {
    if file.is_absolute() {
        file.to_path_buf()
    } else {
        base.join(file)
    }
}

fn stem_of(path: &Path) -> String {
    path.file_stem()
        .and_then(|s| s.to_str())
        .unwrap_or("track")
        .to_string()
}

fn encode_flac(samples: &[f32], channels: usize, sample_rate: u32) -> Result<Vec<u8>, EngineError> {
    let quantized: Vec<i32> = samples
        .iter()
        .map(|s| (s.clamp(-1.0, 1.0) * 32767.0).round() as i32)
        .collect();
    let config = flacenc::config::Encoder::default()
        .into_verified()
        .map_err(|e| EngineError::Internal(format!("FLAC encoder config rejected: {:?}", e)))?;
    let source = flacenc::source::MemSource::from_samples(
        &quantized,
        channels,
        16,
        sample_rate as usize,
    );
    let stream = flacenc::encode_with_fixed_block_size(&config, source, config.block_size)
        .map_err(|e| EngineError::Internal(format!("FLAC encode failed: {:?}", e)))?;
    let mut sink = ByteSink::new();
    stream
        .write(&mut sink)
        .map_err(|e| EngineError::Internal(format!("FLAC serialize failed: {:?}", e)))?;
    Ok(sink.as_slice().to_vec())
}

/// Splice a VORBIS_COMMENT metadata block carrying `CHAPTERnnn` markers
/// into an encoded FLAC stream, after the existing metadata blocks.
fn embed_chapters(
    flac: Vec<u8>,
    chapters: &[Chapter],
    title: Option<&str>,
) -> Result<Vec<u8>, EngineError> {
    if flac.len() < 8 || &flac[..4] != b"fLaC" {
        return Err(EngineError::Internal(
            "encoder produced a stream without a FLAC signature".to_string(),
        ));
    }
    // Walk the metadata chain to the last block and clear its last-flag.
    let mut offset = 4_usize;
    let mut last_header;
    loop {
        if offset + 4 > flac.len() {
            return Err(EngineError::Internal(
                "truncated FLAC metadata chain".to_string(),
            ));
        }
        last_header = offset;
        let is_last = flac[offset] & 0x80 != 0;
        let length = u32::from_be_bytes([0, flac[offset + 1], flac[offset + 2], flac[offset + 3]])
            as usize;
        offset += 4 + length;
        if is_last {
            break;
        }
    }

    let mut comments: Vec<String> = Vec::with_capacity(chapters.len() * 2 + 1);
    if let Some(title) = title {
        comments.push(format!("TITLE={}", title));
    }
    for (index, chapter) in chapters.iter().enumerate() {
        comments.push(format!(
            "CHAPTER{:03}={}",
            index,
            format_timestamp(chapter.timestamp_s)
        ));
        comments.push(format!("CHAPTER{:03}NAME={}", index, chapter.title));
    }

    let vendor = b"daqplay";
    let mut body = Vec::new();
    body.extend_from_slice(&(vendor.len() as u32).to_le_bytes());
    body.extend_from_slice(vendor);
    body.extend_from_slice(&(comments.len() as u32).to_le_bytes());
    for comment in &comments {
        body.extend_from_slice(&(comment.len() as u32).to_le_bytes());
        body.extend_from_slice(comment.as_bytes());
    }

    let mut out = Vec::with_capacity(flac.len() + body.len() + 4);
    out.extend_from_slice(&flac[..offset]);
    out[last_header] &= 0x7F;
    // VORBIS_COMMENT (type 4), now the final metadata block.
    out.push(0x80 | 0x04);
    let length = (body.len() as u32).to_be_bytes();
    out.extend_from_slice(&length[1..]);
    out.extend_from_slice(&body);
    out.extend_from_slice(&flac[offset..]);
    Ok(out)
}

/// Seconds to `HH:MM:SS.mmm`, the Vorbis chapter timestamp format.
fn format_timestamp(seconds: f64) -> String {
    let total_ms = (seconds.max(0.0) * 1000.0).round() as u64;
    let ms = total_ms % 1000;
    let s = (total_ms / 1000) % 60;
    let m = (total_ms / 60_000) % 60;
    let h = total_ms / 3_600_000;
    format!("{:02}:{:02}:{:02}.{:03}", h, m, s, ms)
}
