use crate::asset::AudioAsset;
use crate::channels::ChannelSpec;
use crate::registry::DeviceDescriptor;
use crate::transport::TransportState;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};

pub const DEFAULT_SAMPLES_PER_FRAME: usize = 8192;
pub const DEFAULT_VOLUME_PCT: u8 = 100;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopMode {
    #[default]
    None,
    All,
    One,
}

/// Fields both the audio callback and the control handlers touch. Guarded
/// by one mutex held only for O(1) reads and writes; never across a decoder
/// read or a device write.
#[derive(Debug)]
pub struct SharedParams {
    pub volume_pct: u8,
    pub muted: bool,
    pub flip_lr_stereo: bool,
    pub position_samples: u64,
    pub underflow_events: u64,
}

impl SharedParams {
    fn new(volume_pct: u8, flip_lr_stereo: bool) -> Self {
        Self {
            volume_pct,
            muted: false,
            flip_lr_stereo,
            position_samples: 0,
            underflow_events: 0,
        }
    }
}

/// One loaded source bound to one device. Created at `load_audio`, torn
/// down on `terminate` or reload. Sample rate and channel layout are fixed
/// for the job's lifetime; the shared params may change mid-stream.
pub struct PlaybackJob {
    pub asset: AudioAsset,
    pub device: DeviceDescriptor,
    pub channels: ChannelSpec,
    pub sample_rate_hz: u32,
    pub samples_per_frame: usize,
    pub loop_mode: LoopMode,
    pub total_samples: u64,
    pub shared: Arc<Mutex<SharedParams>>,
}

impl PlaybackJob {
    pub fn new(
        asset: AudioAsset,
        device: DeviceDescriptor,
        channels: ChannelSpec,
        total_samples: u64,
        samples_per_frame: usize,
        volume_pct: u8,
        flip_lr_stereo: bool,
    ) -> Self {
        let sample_rate_hz = asset.sample_rate_hz;
        Self {
            asset,
            device,
            channels,
            sample_rate_hz,
            samples_per_frame,
            loop_mode: LoopMode::None,
            total_samples,
            shared: Arc::new(Mutex::new(SharedParams::new(volume_pct, flip_lr_stereo))),
        }
    }

    pub fn position_samples(&self) -> u64 {
        self.shared.lock().expect("job params poisoned").position_samples
    }

    pub fn duration_s(&self) -> f64 {
        self.total_samples as f64 / self.sample_rate_hz as f64
    }

    pub fn position_s(&self) -> f64 {
        self.position_samples() as f64 / self.sample_rate_hz as f64
    }

    /// Status snapshot for `load_audio` and `status` replies.
    pub fn info(&self, state: TransportState, error: Option<String>) -> PlayerInfo {
        let shared = self.shared.lock().expect("job params poisoned");
        PlayerInfo {
            state,
            file_path: self.asset.path.display().to_string(),
            device_name: self.device.name.clone(),
            product_type: self.device.product_type.clone(),
            ao_channels: self.channels.ao.clone(),
            do_channels: self.channels.dout.clone(),
            ai_channels: self.channels.ai.clone(),
            sample_rate_hz: self.sample_rate_hz,
            samples_per_frame: self.samples_per_frame,
            volume: shared.volume_pct,
            muted: shared.muted,
            flip_lr_stereo: shared.flip_lr_stereo,
            loop_mode: self.loop_mode,
            position_samples: shared.position_samples,
            total_samples: self.total_samples,
            duration_s: self.total_samples as f64 / self.sample_rate_hz as f64,
            underflow_events: shared.underflow_events,
            error,
        }
    }
}

/// Serializable summary of the current job and transport, shared by the
/// `status` task and the terminal playback messages.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PlayerInfo {
    pub state: TransportState,
    pub file_path: String,
    pub device_name: String,
    pub product_type: String,
    pub ao_channels: Vec<String>,
    pub do_channels: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ai_channels: Vec<String>,
    pub sample_rate_hz: u32,
    pub samples_per_frame: usize,
    pub volume: u8,
    pub muted: bool,
    pub flip_lr_stereo: bool,
    pub loop_mode: LoopMode,
    pub position_samples: u64,
    pub total_samples: u64,
    pub duration_s: f64,
    pub underflow_events: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
