use crate::asset::AudioAsset;
use crate::channels::ChannelSpec;
use crate::decoder::{Decoder, SampleSource};
use crate::error::{EngineError, Result};
use crate::hw::traits::DaqBackend;
use crate::job::{DEFAULT_SAMPLES_PER_FRAME, DEFAULT_VOLUME_PCT, PlaybackJob, PlayerInfo};
use crate::message::{Action, Event, LoadRequest, Message, Reply, SeekTarget};
use crate::progress::{PROGRESS_INTERVAL, ProgressEmitter};
use crate::pump::{FramePump, PumpCommand, PumpEvent};
use crate::registry::{DeviceDescriptor, DeviceRegistry};
use crate::transport::{Transport, TransportState};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender, unbounded_channel};
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

/// Device-touching control operations give up after this long rather than
/// leaving the transport in a transient state.
const DEVICE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Engine {
    rx: UnboundedReceiver<Message>,
    backend: Arc<dyn DaqBackend>,
    registry: DeviceRegistry,
    transport: Transport,
    job: Option<PlaybackJob>,
    pump: Option<FramePump>,
    pump_tx: UnboundedSender<PumpEvent>,
    pump_rx: UnboundedReceiver<PumpEvent>,
    subscribers: Vec<UnboundedSender<Event>>,
    emitter: ProgressEmitter,
}

impl Engine {
    pub fn new(rx: UnboundedReceiver<Message>, backend: Arc<dyn DaqBackend>) -> Self {
        let (pump_tx, pump_rx) = unbounded_channel();
        Self {
            rx,
            registry: DeviceRegistry::new(backend.clone()),
            backend,
            transport: Transport::default(),
            job: None,
            pump: None,
            pump_tx,
            pump_rx,
            subscribers: vec![],
            emitter: ProgressEmitter::default(),
        }
    }

    pub async fn work(&mut self) {
        let mut ticker = tokio::time::interval(PROGRESS_INTERVAL);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            tokio::select! {
                message = self.rx.recv() => match message {
                    Some(Message::Request { action, reply }) => {
                        let result = self.handle_request(action).await;
                        let _ = reply.send(result);
                    }
                    Some(Message::Subscribe(tx)) => self.subscribers.push(tx),
                    None => break,
                },
                event = self.pump_rx.recv() => {
                    if let Some(event) = event {
                        self.handle_pump_event(event);
                    }
                }
                _ = ticker.tick() => self.emit_progress(),
            }
        }
        if let Some(pump) = self.pump.take() {
            pump.shutdown();
        }
        info!("engine task exiting");
    }

    fn info(&self) -> Option<Box<PlayerInfo>> {
        self.job.as_ref().map(|job| {
            Box::new(job.info(self.transport.state(), self.transport.error.clone()))
        })
    }

    fn broadcast(&mut self, event: Event) {
        self.subscribers.retain(|tx| tx.send(event.clone()).is_ok());
    }

    /// End the active play session's event stream, if any.
    fn end_play_session(&mut self, error: Option<String>) {
        if self.subscribers.is_empty() {
            return;
        }
        let info = self.info();
        self.broadcast(Event::Stopped { info, error });
        self.subscribers.clear();
    }

    fn teardown(&mut self, error: Option<String>) {
        self.end_play_session(error);
        if let Some(pump) = self.pump.take() {
            pump.shutdown();
        }
        self.job = None;
        self.emitter.reset();
    }

    async fn handle_request(&mut self, action: Action) -> Result<Reply> {
        match action {
            Action::LoadAudio(request) => self.handle_load(*request).await,
            Action::Play {
                start_position_s,
                volume,
                loop_mode,
            } => self.handle_play(start_position_s, volume, loop_mode),
            Action::Pause { stop } => self.handle_pause(stop),
            Action::Resume => self.handle_play(None, None, None),
            Action::Seek(target) => self.handle_seek(target),
            Action::SetVolume(volume) => self.handle_volume(volume),
            Action::FlipStereo(flip) => self.handle_flip(flip),
            Action::Status => Ok(Reply::Status(self.info())),
            Action::GetPosition => {
                let job = self.require_job()?;
                Ok(Reply::Position {
                    position_s: job.position_s(),
                    duration_s: job.duration_s(),
                    position_samples: job.position_samples(),
                    total_samples: job.total_samples,
                })
            }
            Action::ListDevices { refresh } => {
                let devices = self.enumerate_devices(refresh).await?;
                Ok(Reply::Devices {
                    devices,
                    driver_version: self.registry.driver_version(),
                })
            }
            Action::Terminate => {
                self.teardown(None);
                self.transport.reset();
                self.transport.error = None;
                Ok(Reply::Ack)
            }
        }
    }

    fn require_job(&self) -> Result<&PlaybackJob> {
        self.job
            .as_ref()
            .ok_or_else(|| EngineError::Validation("no audio loaded".to_string()))
    }

    fn require_pump(&self) -> Result<&FramePump> {
        self.pump
            .as_ref()
            .ok_or_else(|| EngineError::Internal("job present without a pump".to_string()))
    }

    async fn enumerate_devices(&mut self, refresh: bool) -> Result<Vec<DeviceDescriptor>> {
        if !refresh {
            if let Some(cached) = self.registry.cached() {
                return Ok(cached.to_vec());
            }
        }
        let backend = self.backend.clone();
        let devices = tokio::time::timeout(
            DEVICE_TIMEOUT,
            tokio::task::spawn_blocking(move || backend.enumerate()),
        )
        .await
        .map_err(|_| EngineError::Device("device enumeration timed out".to_string()))?
        .map_err(|e| EngineError::Internal(format!("enumeration task failed: {}", e)))??;
        self.registry.set_cache(devices.clone());
        Ok(devices)
    }

    async fn handle_load(&mut self, request: LoadRequest) -> Result<Reply> {
        let volume = request.volume.unwrap_or(DEFAULT_VOLUME_PCT);
        if volume > 100 {
            return Err(EngineError::Validation(format!(
                "volume {} out of range 0..100",
                volume
            )));
        }
        let samples_per_frame = request
            .samples_per_frame
            .unwrap_or(DEFAULT_SAMPLES_PER_FRAME);
        if samples_per_frame == 0 {
            return Err(EngineError::Validation(
                "samples_per_frame must be positive".to_string(),
            ));
        }
        let channels = ChannelSpec::new(
            request.ao_channels,
            request.do_channels,
            request.ai_channels,
        );
        let devices = self.enumerate_devices(false).await?;
        let device = devices
            .into_iter()
            .find(|d| d.name == request.device_name)
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown device '{}'", request.device_name))
            })?;
        channels.validate(&device)?;

        let decoder = Decoder::open(&request.file_path)?;
        let total = decoder.total_frames().ok_or_else(|| {
            EngineError::Decoder(format!(
                "cannot determine stream length of '{}'",
                request.file_path.display()
            ))
        })?;
        let sample_rate = decoder.sample_rate_hz();
        let src_channels = decoder.channel_count();
        let mut flip = request.flip_lr_stereo.unwrap_or(false);
        if flip && src_channels != 2 {
            warn!(
                channels = src_channels,
                "flip_lr_stereo ignored for non-stereo source"
            );
            flip = false;
        }
        let size_bytes = std::fs::metadata(&request.file_path)
            .map(|m| m.len())
            .unwrap_or(0);
        let asset = AudioAsset {
            path: request.file_path.clone(),
            sample_rate_hz: sample_rate,
            bit_depth: decoder.bit_depth(),
            channel_count: src_channels,
            duration_s: total as f64 / sample_rate as f64,
            size_bytes,
            artist: None,
            thumbnail: None,
            chapters: vec![],
        };

        // Anything currently loaded goes away before the device is retaken.
        // A failure past this point leaves the transport Idle, never
        // half-loaded.
        self.teardown(Some("superseded by load_audio".to_string()));
        self.transport.reset();
        self.transport.error = None;

        let job = PlaybackJob::new(
            asset,
            device.clone(),
            channels.clone(),
            total,
            samples_per_frame,
            volume,
            flip,
        );
        let shared = job.shared.clone();
        let backend = self.backend.clone();
        let pump_tx = self.pump_tx.clone();
        let ao_count = channels.ao_count();
        let open_device = device;
        let open_channels = channels;
        let pump = tokio::time::timeout(
            DEVICE_TIMEOUT,
            tokio::task::spawn_blocking(move || -> Result<FramePump> {
                let tasks =
                    backend.open(&open_device, &open_channels, sample_rate, samples_per_frame)?;
                FramePump::spawn(
                    Box::new(decoder),
                    tasks,
                    ao_count,
                    shared,
                    samples_per_frame,
                    total,
                    pump_tx,
                )
            }),
        )
        .await
        .map_err(|_| EngineError::Device("device open timed out".to_string()))?
        .map_err(|e| EngineError::Internal(format!("device open task failed: {}", e)))??;

        self.job = Some(job);
        self.pump = Some(pump);
        self.transport.set(TransportState::Loaded);
        info!(
            file = %request.file_path.display(),
            device = %request.device_name,
            sample_rate,
            "audio loaded and primed"
        );
        Ok(Reply::Status(self.info()))
    }

    fn handle_play(
        &mut self,
        start_position_s: Option<f64>,
        volume: Option<u8>,
        loop_mode: Option<crate::job::LoopMode>,
    ) -> Result<Reply> {
        let state = self.transport.state();
        if !state.can_play() {
            return Err(EngineError::Validation("no audio loaded".to_string()));
        }
        {
            let job = self
                .job
                .as_mut()
                .ok_or_else(|| EngineError::Validation("no audio loaded".to_string()))?;
            if let Some(volume) = volume {
                if volume > 100 {
                    return Err(EngineError::Validation(format!(
                        "volume {} out of range 0..100",
                        volume
                    )));
                }
                job.shared.lock().expect("job params poisoned").volume_pct = volume;
            }
            if let Some(loop_mode) = loop_mode {
                job.loop_mode = loop_mode;
            }
        }
        let job = self.require_job()?;
        let from = match start_position_s {
            Some(seconds) => {
                if !(0.0..=job.duration_s()).contains(&seconds) {
                    return Err(EngineError::Validation(format!(
                        "start position {}s outside 0..{:.3}s",
                        seconds,
                        job.duration_s()
                    )));
                }
                Some(((seconds * job.sample_rate_hz as f64).round() as u64).min(job.total_samples))
            }
            // Replaying a completed job is an implicit rewind.
            None if state == TransportState::Completed => Some(0),
            None => None,
        };
        self.require_pump()?.send(PumpCommand::Start { from });
        if let Some(from) = from {
            if let Some(job) = &self.job {
                job.shared.lock().expect("job params poisoned").position_samples = from;
            }
        }
        self.transport.set(TransportState::Playing);
        Ok(Reply::Status(self.info()))
    }

    fn handle_pause(&mut self, stop: bool) -> Result<Reply> {
        let state = self.transport.state();
        if !state.is_active() {
            return Err(EngineError::Validation("no audio loaded".to_string()));
        }
        if matches!(state, TransportState::Playing | TransportState::Seeking) {
            self.require_pump()?.send(PumpCommand::Pause);
            self.transport.set(TransportState::Paused);
            self.end_play_session(None);
        }
        if stop {
            self.require_pump()?.send(PumpCommand::Seek {
                frame: 0,
                resume: false,
            });
            if let Some(job) = &self.job {
                job.shared.lock().expect("job params poisoned").position_samples = 0;
            }
            self.transport.set(TransportState::Paused);
        }
        Ok(Reply::Status(self.info()))
    }

    fn handle_seek(&mut self, target: SeekTarget) -> Result<Reply> {
        let state = self.transport.state();
        if !state.can_seek() {
            return Err(EngineError::Validation(
                "seek requires loaded audio".to_string(),
            ));
        }
        let job = self.require_job()?;
        let frame = match target {
            SeekTarget::Seconds(seconds) => {
                if !(0.0..=job.duration_s() + f64::EPSILON).contains(&seconds) {
                    return Err(EngineError::Validation(format!(
                        "seek time {}s outside 0..{:.3}s",
                        seconds,
                        job.duration_s()
                    )));
                }
                ((seconds * job.sample_rate_hz as f64).round() as u64).min(job.total_samples)
            }
            SeekTarget::Samples(samples) => samples.min(job.total_samples),
        };
        let resume = state == TransportState::Playing;
        self.transport.set(TransportState::Seeking);
        self.require_pump()?.send(PumpCommand::Seek { frame, resume });
        if let Some(job) = &self.job {
            job.shared.lock().expect("job params poisoned").position_samples = frame;
        }
        self.transport.set(if resume {
            TransportState::Playing
        } else if state == TransportState::Loaded {
            TransportState::Loaded
        } else {
            TransportState::Paused
        });
        Ok(Reply::Status(self.info()))
    }

    fn handle_volume(&mut self, volume: u8) -> Result<Reply> {
        if volume > 100 {
            return Err(EngineError::Validation(format!(
                "volume {} out of range 0..100",
                volume
            )));
        }
        let job = self.require_job()?;
        job.shared.lock().expect("job params poisoned").volume_pct = volume;
        Ok(Reply::Volume { volume })
    }

    fn handle_flip(&mut self, flip: Option<bool>) -> Result<Reply> {
        let job = self.require_job()?;
        if let Some(flip) = flip {
            if flip && job.asset.channel_count != 2 {
                warn!(
                    channels = job.asset.channel_count,
                    "flip_lr_stereo ignored for non-stereo source"
                );
            } else {
                job.shared.lock().expect("job params poisoned").flip_lr_stereo = flip;
            }
        }
        let current = job
            .shared
            .lock()
            .expect("job params poisoned")
            .flip_lr_stereo;
        Ok(Reply::Flip {
            flip_lr_stereo: current,
        })
    }

    fn handle_pump_event(&mut self, event: PumpEvent) {
        match event {
            PumpEvent::Progress {
                position_samples,
                underflow_events,
            } => {
                self.emitter.note(position_samples, underflow_events);
            }
            PumpEvent::Completed { position_samples } => {
                self.transport.set(TransportState::Completed);
                info!(position = position_samples, "playback completed");
                if let Some(info) = self.info() {
                    self.broadcast(Event::Completed(info));
                }
                self.subscribers.clear();
                self.emitter.reset();
            }
            PumpEvent::UnderflowEscalated { message } => {
                self.transport.set(TransportState::Paused);
                self.transport.error = Some(message.clone());
                self.end_play_session(Some(message));
            }
            PumpEvent::Fault { error } => {
                error!("pump fault, releasing device: {}", error);
                let message = error.to_string();
                self.end_play_session(Some(message.clone()));
                if let Some(pump) = self.pump.take() {
                    pump.shutdown();
                }
                self.job = None;
                self.emitter.reset();
                self.transport.reset();
                self.transport.error = Some(message);
            }
        }
    }

    fn emit_progress(&mut self) {
        if self.transport.state() != TransportState::Playing {
            return;
        }
        let Some(job) = &self.job else { return };
        let (total, rate) = (job.total_samples, job.sample_rate_hz);
        if let Some(update) = self.emitter.take(total, rate) {
            self.broadcast(Event::Progress(update));
        }
    }
}
