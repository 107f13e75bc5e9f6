//! Fan-out from source channels to AO lines.
//!
//! Mono feeds every line, stereo alternates even/odd (optionally flipped),
//! and wider sources wrap modulo the channel count. Gain is a plain linear
//! multiply applied after mapping.

/// Pure mapping from `src_channels`-wide frames to `ao_channels`-wide
/// frames. Built once per job; the flip and gain inputs arrive per block.
#[derive(Debug, Clone, Copy)]
pub struct ChannelMap {
    src_channels: usize,
    ao_channels: usize,
}

impl ChannelMap {
    pub fn new(src_channels: usize, ao_channels: usize) -> Self {
        Self {
            src_channels: src_channels.max(1),
            ao_channels: ao_channels.max(1),
        }
    }

    pub fn ao_channels(&self) -> usize {
        self.ao_channels
    }

    /// Whether a left/right flip request has any effect for this source.
    pub fn flippable(&self) -> bool {
        self.src_channels == 2
    }

    /// Index of the source channel feeding AO line `ao_index`.
    fn source_for(&self, ao_index: usize, flip: bool) -> usize {
        match self.src_channels {
            1 => 0,
            2 => {
                let left_on_even = !flip;
                if (ao_index % 2 == 0) == left_on_even { 0 } else { 1 }
            }
            s => ao_index % s,
        }
    }

    /// Expand `n_frames` interleaved source frames into the AO-interleaved
    /// staging buffer, applying `gain`. `dst` must hold
    /// `n_frames * ao_channels` samples; this never allocates.
    pub fn map_block(&self, src: &[f32], n_frames: usize, dst: &mut [f64], gain: f32, flip: bool) {
        debug_assert!(src.len() >= n_frames * self.src_channels);
        debug_assert!(dst.len() >= n_frames * self.ao_channels);
        let flip = flip && self.flippable();
        for frame in 0..n_frames {
            let src_base = frame * self.src_channels;
            let dst_base = frame * self.ao_channels;
            for ao in 0..self.ao_channels {
                let sample = src[src_base + self.source_for(ao, flip)] * gain;
                dst[dst_base + ao] = sample as f64;
            }
        }
    }
}

/// Linear playback gain from the control-protocol volume fields.
pub fn linear_gain(volume_pct: u8, muted: bool) -> f32 {
    if muted {
        0.0
    } else {
        f32::from(volume_pct.min(100)) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn map(src: &[f32], src_ch: usize, ao_ch: usize, gain: f32, flip: bool) -> Vec<f64> {
        let frames = src.len() / src_ch;
        let mapper = ChannelMap::new(src_ch, ao_ch);
        let mut dst = vec![0.0_f64; frames * ao_ch];
        mapper.map_block(src, frames, &mut dst, gain, flip);
        dst
    }

    #[test]
    fn mono_feeds_every_line() {
        let out = map(&[0.5, -0.25], 1, 4, 1.0, false);
        assert_eq!(out, vec![0.5, 0.5, 0.5, 0.5, -0.25, -0.25, -0.25, -0.25]);
    }

    #[test]
    fn stereo_alternates_even_left_odd_right() {
        let out = map(&[0.1, 0.2], 2, 4, 1.0, false);
        assert_eq!(
            out.iter().map(|v| (*v * 10.0).round() as i32).collect::<Vec<_>>(),
            vec![1, 2, 1, 2]
        );
    }

    #[test]
    fn stereo_flip_swaps_roles() {
        let out = map(&[0.1, 0.2], 2, 4, 1.0, true);
        assert_eq!(
            out.iter().map(|v| (*v * 10.0).round() as i32).collect::<Vec<_>>(),
            vec![2, 1, 2, 1]
        );
    }

    #[test]
    fn flip_is_identity_for_non_stereo() {
        for src_ch in [1_usize, 3, 5] {
            let src: Vec<f32> = (0..src_ch * 2).map(|i| i as f32 * 0.01).collect();
            let plain = map(&src, src_ch, 4, 1.0, false);
            let flipped = map(&src, src_ch, 4, 1.0, true);
            assert_eq!(plain, flipped, "flip must be inert for {} channels", src_ch);
        }
    }

    #[test]
    fn wide_sources_wrap_modulo() {
        let out = map(&[0.1, 0.2, 0.3], 3, 5, 1.0, false);
        assert_eq!(
            out.iter().map(|v| (*v * 10.0).round() as i32).collect::<Vec<_>>(),
            vec![1, 2, 3, 1, 2]
        );
    }

    #[test]
    fn gain_and_mute_scale_linearly() {
        assert_eq!(linear_gain(100, false), 1.0);
        assert_eq!(linear_gain(50, false), 0.5);
        assert_eq!(linear_gain(100, true), 0.0);
        assert_eq!(linear_gain(255, false), 1.0);
        let out = map(&[0.8], 1, 2, 0.25, false);
        assert!((out[0] - 0.2).abs() < 1.0e-6);
    }

    #[test]
    fn mapped_output_is_finite_for_full_width() {
        let src: Vec<f32> = (0..8 * 16).map(|i| ((i * 37) % 200) as f32 / 100.0 - 1.0).collect();
        let out = map(&src, 8, 3, 1.0, false);
        assert_eq!(out.len(), 16 * 3);
        assert!(out.iter().all(|v| v.is_finite()));
    }
}
