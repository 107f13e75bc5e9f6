use crate::error::Result;
use crate::job::{LoopMode, PlayerInfo};
use crate::progress::ProgressUpdate;
use crate::registry::DeviceDescriptor;
use std::path::PathBuf;
use tokio::sync::{mpsc::UnboundedSender, oneshot};

/// Everything `load_audio` can carry. Channel lists use device-relative
/// names (`ao0`, `port0/line0`); the DO list defaults to the TTL sync pair.
#[derive(Debug, Clone)]
pub struct LoadRequest {
    pub file_path: PathBuf,
    pub device_name: String,
    pub ao_channels: Vec<String>,
    pub do_channels: Option<Vec<String>>,
    pub ai_channels: Vec<String>,
    pub volume: Option<u8>,
    pub samples_per_frame: Option<usize>,
    pub flip_lr_stereo: Option<bool>,
}

#[derive(Debug, Clone, Copy)]
pub enum SeekTarget {
    Seconds(f64),
    Samples(u64),
}

/// Control actions, one per protocol task that reaches the engine.
#[derive(Debug)]
pub enum Action {
    LoadAudio(Box<LoadRequest>),
    Play {
        start_position_s: Option<f64>,
        volume: Option<u8>,
        loop_mode: Option<LoopMode>,
    },
    Pause {
        /// Also rewind to the start, i.e. a full stop.
        stop: bool,
    },
    Resume,
    Seek(SeekTarget),
    SetVolume(u8),
    FlipStereo(Option<bool>),
    Status,
    GetPosition,
    ListDevices {
        refresh: bool,
    },
    Terminate,
}

/// Typed reply payloads; the protocol layer serializes them into the
/// envelope's `data` field.
#[derive(Debug)]
pub enum Reply {
    Ack,
    /// `None` means no job is loaded (transport Idle).
    Status(Option<Box<PlayerInfo>>),
    Devices {
        devices: Vec<DeviceDescriptor>,
        driver_version: Option<String>,
    },
    Position {
        position_s: f64,
        duration_s: f64,
        position_samples: u64,
        total_samples: u64,
    },
    Volume {
        volume: u8,
    },
    Flip {
        flip_lr_stereo: bool,
    },
}

/// Broadcast stream consumed by the active play session.
#[derive(Debug, Clone)]
pub enum Event {
    Progress(ProgressUpdate),
    /// The stream reached its end; sent exactly once per run.
    Completed(Box<PlayerInfo>),
    /// Playback ended without completing (pause, teardown, escalation, or
    /// device fault).
    Stopped {
        info: Option<Box<PlayerInfo>>,
        error: Option<String>,
    },
}

pub enum Message {
    Request {
        action: Action,
        reply: oneshot::Sender<Result<Reply>>,
    },
    Subscribe(UnboundedSender<Event>),
}
