//! Symphonia-backed file decoder. Produces interleaved float32 frames in
//! [-1, 1] at the source's native rate; the frame pump drains it one
//! callback quantum at a time.

use crate::error::{EngineError, Result};
use std::fs::File;
use std::path::Path;
use symphonia::core::{
    audio::SampleBuffer,
    codecs::DecoderOptions,
    errors::Error as SymphoniaError,
    formats::{FormatOptions, FormatReader, SeekMode, SeekTo},
    io::MediaSourceStream,
    meta::MetadataOptions,
    probe::Hint,
};
use tracing::{debug, warn};

/// Container/codec tag for the opened source. Dispatch happens inside
/// Symphonia; this tag is what status replies and the CLI report.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Codec {
    Wav,
    Flac,
    Mp3,
    Aac,
    Ogg,
    Aiff,
    Other,
}

impl Codec {
    fn from_extension(path: &Path) -> Self {
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .map(|e| e.to_ascii_lowercase())
            .unwrap_or_default();
        match ext.as_str() {
            "wav" | "wave" => Codec::Wav,
            "flac" => Codec::Flac,
            "mp3" => Codec::Mp3,
            "m4a" | "mp4" | "aac" => Codec::Aac,
            "ogg" | "oga" => Codec::Ogg,
            "aiff" | "aif" => Codec::Aiff,
            _ => Codec::Other,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Codec::Wav => "wav",
            Codec::Flac => "flac",
            Codec::Mp3 => "mp3",
            Codec::Aac => "aac",
            Codec::Ogg => "ogg",
            Codec::Aiff => "aiff",
            Codec::Other => "other",
        }
    }
}

/// The narrow decode capability the frame pump consumes. `Decoder` is the
/// production implementation; tests substitute slow or failing sources.
pub trait SampleSource: Send {
    /// Fill `dest` with up to `n_frames` interleaved frames, returning how
    /// many were produced. A short read means the source cannot currently
    /// yield more; zero at end of stream.
    fn read_into(&mut self, dest: &mut [f32], n_frames: usize) -> Result<usize>;
    /// Position the next read at frame `n` (± one codec frame), returning
    /// the frame index the next read will actually start at.
    fn seek_to_sample(&mut self, n: u64) -> Result<u64>;
    fn position(&self) -> u64;
    fn total_frames(&self) -> Option<u64>;
    fn sample_rate_hz(&self) -> u32;
    fn channel_count(&self) -> usize;
    fn bit_depth(&self) -> Option<u32>;
}

const MAX_DISCARDED_PACKETS: usize = 3;

pub struct Decoder {
    format: Box<dyn FormatReader>,
    decoder: Box<dyn symphonia::core::codecs::Decoder>,
    track_id: u32,
    codec: Codec,
    sample_rate: u32,
    channels: usize,
    bits_per_sample: Option<u32>,
    total: Option<u64>,
    /// Decoded-but-undelivered samples from the last packet.
    pending: Option<SampleBuffer<f32>>,
    pending_offset: usize,
    /// Frame index of the next sample `read_into` will deliver.
    next_frame: u64,
    /// Frames to silently discard after a coarse demuxer seek.
    skip_frames: u64,
    eof: bool,
}

impl Decoder {
    pub fn open(path: &Path) -> Result<Self> {
        let file = File::open(path).map_err(|e| {
            EngineError::Validation(format!("cannot open '{}': {}", path.display(), e))
        })?;
        let mss = MediaSourceStream::new(Box::new(file), Default::default());
        let mut hint = Hint::new();
        if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
            hint.with_extension(ext);
        }
        let probed = symphonia::default::get_probe()
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
        let format = probed.format;
        let track = format.default_track().ok_or_else(|| {
            EngineError::Decoder(format!("no decodable audio track in '{}'", path.display()))
        })?;
        let track_id = track.id;
        let params = track.codec_params.clone();
        let decoder = symphonia::default::get_codecs()
            .make(&params, &DecoderOptions::default())
            .map_err(|e| {
                EngineError::Decoder(format!(
                    "no decoder for '{}': {}",
                    path.display(),
                    e
                ))
            })?;
        let sample_rate = params.sample_rate.unwrap_or(48_000);
        let channels = params.channels.map(|c| c.count()).unwrap_or(1).max(1);
        let codec = Codec::from_extension(path);
        debug!(
            path = %path.display(),
            codec = codec.as_str(),
            sample_rate,
            channels,
            "opened decoder"
        );
        Ok(Self {
            format,
            decoder,
            track_id,
            codec,
            sample_rate,
            channels,
            bits_per_sample: params.bits_per_sample,
            total: params.n_frames,
            pending: None,
            pending_offset: 0,
            next_frame: 0,
            skip_frames: 0,
            eof: false,
        })
    }

    pub fn codec(&self) -> Codec {
        self.codec
    }

    /// Decode the next packet into `pending`. Returns false at end of
    /// stream. Corrupt packets are skipped, up to a small bound.
    fn refill(&mut self) -> Result<bool> {
        let mut discarded = 0;
        loop {
            if discarded > MAX_DISCARDED_PACKETS {
                return Err(EngineError::Decoder(
                    "discarded too many corrupt packets".to_string(),
                ));
            }
            let packet = match self.format.next_packet() {
                Ok(packet) => packet,
                Err(SymphoniaError::IoError(e))
                    if e.kind() == std::io::ErrorKind::UnexpectedEof =>
                {
                    self.eof = true;
                    return Ok(false);
                }
                Err(SymphoniaError::ResetRequired) => {
                    return Err(EngineError::Decoder("decoder reset required".to_string()));
                }
                Err(e) => {
                    return Err(EngineError::Decoder(format!("packet read failed: {}", e)));
                }
            };
            if packet.track_id() != self.track_id {
                continue;
            }
            match self.decoder.decode(&packet) {
                Ok(decoded) => {
                    let spec = *decoded.spec();
                    let needed = decoded.capacity() as u64;
                    let reuse = self
                        .pending
                        .as_ref()
                        .map(|b| b.capacity() >= decoded.capacity() * spec.channels.count())
                        .unwrap_or(false);
                    if !reuse {
                        self.pending = Some(SampleBuffer::<f32>::new(needed, spec));
                    }
                    let buffer = self.pending.as_mut().expect("pending buffer set above");
                    buffer.copy_interleaved_ref(decoded);
                    self.pending_offset = 0;
                    return Ok(true);
                }
                Err(SymphoniaError::DecodeError(e)) => {
                    warn!("discarding malformed packet: {}", e);
                    discarded += 1;
                }
                Err(SymphoniaError::ResetRequired) => {
                    self.decoder.reset();
                    discarded += 1;
                }
                Err(e) => {
                    return Err(EngineError::Decoder(format!("decode failed: {}", e)));
                }
            }
        }
    }
}

impl SampleSource for Decoder {
    fn read_into(&mut self, dest: &mut [f32], n_frames: usize) -> Result<usize> {
        let channels = self.channels;
        let wanted = n_frames.min(dest.len() / channels.max(1));
        let mut filled = 0_usize;
        while filled < wanted {
            let have = self
                .pending
                .as_ref()
                .map(|b| b.len().saturating_sub(self.pending_offset))
                .unwrap_or(0);
            if have == 0 {
                if self.eof || !self.refill()? {
                    break;
                }
                continue;
            }
            let have_frames = have / channels;
            if self.skip_frames > 0 {
                let skip = (self.skip_frames as usize).min(have_frames);
                self.pending_offset += skip * channels;
                self.skip_frames -= skip as u64;
                continue;
            }
            let take = have_frames.min(wanted - filled);
            let start = self.pending_offset;
            let end = start + take * channels;
            let samples = self.pending.as_ref().expect("pending checked above");
            dest[filled * channels..(filled + take) * channels]
                .copy_from_slice(&samples.samples()[start..end]);
            self.pending_offset = end;
            filled += take;
        }
        self.next_frame += filled as u64;
        Ok(filled)
    }

    fn seek_to_sample(&mut self, n: u64) -> Result<u64> {
        let clamped = match self.total {
            Some(total) => n.min(total),
            None => n,
        };
        if let Some(total) = self.total {
            // Seeking to (or past) the end is a no-op read position; the
            // demuxer would reject the timestamp.
            if clamped >= total {
                self.pending = None;
                self.pending_offset = 0;
                self.skip_frames = 0;
                self.next_frame = total;
                self.eof = true;
                return Ok(total);
            }
        }
        let seeked = self
            .format
            .seek(
                SeekMode::Accurate,
                SeekTo::TimeStamp {
                    ts: clamped,
                    track_id: self.track_id,
                },
            )
            .map_err(|e| EngineError::Decoder(format!("seek to sample {} failed: {}", n, e)))?;
        // Seeking happens in the demuxer; the codec must not carry state
        // across the discontinuity.
        self.decoder.reset();
        self.pending = None;
        self.pending_offset = 0;
        self.eof = false;
        if seeked.actual_ts <= clamped {
            self.skip_frames = clamped - seeked.actual_ts;
            self.next_frame = clamped;
        } else {
            // Overshot by part of a codec frame; the pump zero-pads the gap.
            self.skip_frames = 0;
            self.next_frame = seeked.actual_ts;
        }
        Ok(self.next_frame)
    }

    fn position(&self) -> u64 {
        self.next_frame
    }

    fn total_frames(&self) -> Option<u64> {
        self.total
    }

    fn sample_rate_hz(&self) -> u32 {
        self.sample_rate
    }

    fn channel_count(&self) -> usize {
        self.channels
    }

    fn bit_depth(&self) -> Option<u32> {
        self.bits_per_sample
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    fn write_fixture(dir: &tempfile::TempDir, frames: usize, channels: u16) -> PathBuf {
        let path = dir.path().join("fixture.wav");
        let mut samples = Vec::with_capacity(frames * channels as usize);
        for i in 0..frames {
            let t = i as f32 / 48_000.0;
            let value = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
            for ch in 0..channels {
                // Offset the channels so interleaving mistakes show up.
                samples.push(if ch == 0 { value } else { -value });
            }
        }
        wavers::write::<f32, _>(&path, &samples, 48_000, channels).expect("fixture write");
        path
    }

    #[test]
    fn reports_stream_parameters() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, 4800, 2);
        let decoder = Decoder::open(&path).unwrap();
        assert_eq!(decoder.sample_rate_hz(), 48_000);
        assert_eq!(decoder.channel_count(), 2);
        assert_eq!(decoder.total_frames(), Some(4800));
        assert_eq!(decoder.codec(), Codec::Wav);
    }

    #[test]
    fn reads_all_frames_then_short_reads() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, 1000, 1);
        let mut decoder = Decoder::open(&path).unwrap();
        let mut dest = vec![0.0_f32; 512];
        let mut got = 0;
        loop {
            let n = decoder.read_into(&mut dest, 512).unwrap();
            if n == 0 {
                break;
            }
            assert!(dest[..n].iter().all(|s| s.is_finite()));
            got += n;
        }
        assert_eq!(got, 1000);
        assert_eq!(decoder.position(), 1000);
        assert_eq!(decoder.read_into(&mut dest, 512).unwrap(), 0);
    }

    #[test]
    fn seek_lands_within_one_codec_frame() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, 48_000, 2);
        let mut decoder = Decoder::open(&path).unwrap();
        let target = 31_337_u64;
        let landed = decoder.seek_to_sample(target).unwrap();
        assert_eq!(landed, target);
        let mut dest = vec![0.0_f32; 8];
        decoder.read_into(&mut dest, 4).unwrap();
        // Sample value at the landing point matches the synthesized signal.
        let t = target as f32 / 48_000.0;
        let expected = (t * 440.0 * std::f32::consts::TAU).sin() * 0.5;
        assert!((dest[0] - expected).abs() < 1.0e-3);
    }

    #[test]
    fn seek_past_end_clamps_to_total() {
        let dir = tempfile::tempdir().unwrap();
        let path = write_fixture(&dir, 1000, 1);
        let mut decoder = Decoder::open(&path).unwrap();
        let landed = decoder.seek_to_sample(10_000).unwrap();
        assert_eq!(landed, 1000);
        let mut dest = vec![0.0_f32; 64];
        assert_eq!(decoder.read_into(&mut dest, 64).unwrap(), 0);
    }

    #[test]
    fn rejects_missing_file() {
        let result = Decoder::open(Path::new("/nonexistent/audio.flac"));
        assert!(matches!(result, Err(EngineError::Validation(_))));
    }
}
