//! The frame pump: a dedicated audio thread that owns the AO+DO task pair
//! and drains the decoder into the hardware buffer one callback quantum at
//! a time. Everything here is paced by the device sample clock; the thread
//! sleeps between block edges and never allocates on the steady path.

use crate::decoder::SampleSource;
use crate::error::{EngineError, Result};
use crate::hw::traits::{AoTask, DoTask, TaskPair};
use crate::job::SharedParams;
use crate::mapper::{ChannelMap, linear_gain};
use std::sync::mpsc::{Receiver, Sender, TryRecvError, channel};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use tokio::sync::mpsc::UnboundedSender;
use tracing::{debug, error, info};

/// Blocks written ahead of the sample clock: one being generated, one in
/// reserve so a late decoder read is absorbed by the onboard buffer.
const PRIME_BLOCKS: usize = 2;
/// Consecutive missed deadlines that stop generation.
const UNDERFLOW_ESCALATION_COUNT: u32 = 3;
const UNDERFLOW_ESCALATION_WINDOW: Duration = Duration::from_secs(2);

#[derive(Debug)]
pub enum PumpCommand {
    /// Begin or resume generation. `from` forces a source position first.
    Start { from: Option<u64> },
    Pause,
    Seek { frame: u64, resume: bool },
    /// Tear down the tasks and exit the thread.
    Stop,
}

#[derive(Debug)]
pub enum PumpEvent {
    Progress {
        position_samples: u64,
        underflow_events: u64,
    },
    Completed {
        position_samples: u64,
    },
    /// Repeated underflows within the escalation window; generation was
    /// stopped and the transport should park in Paused with an error.
    UnderflowEscalated { message: String },
    /// The driver or the decoder gave up; the transport must drop to Idle.
    Fault { error: EngineError },
}

/// Handle owned by the engine. The engine sends `Stop` on teardown and
/// joins the thread through `shutdown`.
pub struct FramePump {
    commands: Sender<PumpCommand>,
    handle: Option<JoinHandle<()>>,
}

impl FramePump {
    /// Open-and-prime entry point. Priming runs on the caller's thread so
    /// `load_audio` failures surface synchronously; the worker thread takes
    /// over afterwards, parked until `Start`.
    pub fn spawn(
        source: Box<dyn SampleSource>,
        tasks: TaskPair,
        ao_channels: usize,
        shared: Arc<Mutex<SharedParams>>,
        samples_per_frame: usize,
        total_frames: u64,
        events: UnboundedSender<PumpEvent>,
    ) -> Result<Self> {
        let src_channels = source.channel_count();
        let map = ChannelMap::new(src_channels, ao_channels);
        let mut worker = PumpWorker {
            source,
            ao: tasks.ao,
            dout: tasks.dout,
            map,
            src_channels,
            shared,
            events,
            samples_per_frame,
            total_frames,
            src_scratch: vec![0.0_f32; samples_per_frame * src_channels],
            ao_buffers: [
                vec![0.0_f64; samples_per_frame * map.ao_channels()],
                vec![0.0_f64; samples_per_frame * map.ao_channels()],
            ],
            buffer_index: 0,
            run_base: 0,
            consumed_since: 0,
            enqueued_since: 0,
            gen_base: 0,
            primed_at: None,
            underflow_streak: 0,
            underflow_window_start: None,
            decode_retry_armed: true,
        };
        worker.prime(0)?;
        let (tx, rx) = channel::<PumpCommand>();
        let handle = std::thread::Builder::new()
            .name("daqplay-pump".to_string())
            .spawn(move || worker.work(rx))
            .map_err(|e| EngineError::Internal(format!("failed to spawn pump thread: {}", e)))?;
        Ok(Self {
            commands: tx,
            handle: Some(handle),
        })
    }

    pub fn send(&self, command: PumpCommand) {
        let _ = self.commands.send(command);
    }

    pub fn shutdown(mut self) {
        let _ = self.commands.send(PumpCommand::Stop);
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

/// Outcome of one streaming episode.
enum Step {
    Parked,
    Exit,
}

/// Outcome of one callback quantum.
enum Block {
    /// A block was enqueued; `missed` marks a padded or late one.
    Produced { missed: bool },
    /// Nothing left to enqueue.
    End,
}

struct PumpWorker {
    source: Box<dyn SampleSource>,
    ao: Box<dyn AoTask>,
    dout: Box<dyn DoTask>,
    map: ChannelMap,
    src_channels: usize,
    shared: Arc<Mutex<SharedParams>>,
    events: UnboundedSender<PumpEvent>,
    samples_per_frame: usize,
    total_frames: u64,
    src_scratch: Vec<f32>,
    ao_buffers: [Vec<f64>; 2],
    buffer_index: usize,
    /// Source frame index at which the current AO run began.
    run_base: u64,
    /// Source frames consumed since `run_base`, zero padding included.
    consumed_since: u64,
    /// Frames queued to the device since the last prime.
    enqueued_since: u64,
    /// Device generation counter at task start.
    gen_base: u64,
    /// Source position the current onboard queue was primed at.
    primed_at: Option<u64>,
    underflow_streak: u32,
    underflow_window_start: Option<Instant>,
    /// One mid-stream decoder failure is retried with a reseek; armed again
    /// after any clean read.
    decode_retry_armed: bool,
}

impl PumpWorker {
    fn work(mut self, commands: Receiver<PumpCommand>) {
        loop {
            let command = match commands.recv() {
                Ok(command) => command,
                Err(_) => break,
            };
            let step = match command {
                PumpCommand::Stop => Step::Exit,
                PumpCommand::Pause => Step::Parked,
                PumpCommand::Start { from } => self.start(from, &commands),
                PumpCommand::Seek { frame, resume } => match self.reprime(frame) {
                    Ok(()) if resume => self.stream(&commands),
                    Ok(()) => Step::Parked,
                    Err(e) => self.fault(e),
                },
            };
            if let Step::Exit = step {
                break;
            }
        }
        let _ = self.ao.stop();
        let _ = self.dout.set_low();
        debug!("frame pump thread exiting");
    }

    fn start(&mut self, from: Option<u64>, commands: &Receiver<PumpCommand>) -> Step {
        let target = from.unwrap_or_else(|| self.resume_position());
        if self.primed_at != Some(target) {
            if let Err(e) = self.reprime(target) {
                return self.fault(e);
            }
        }
        self.stream(commands)
    }

    fn resume_position(&self) -> u64 {
        self.shared
            .lock()
            .expect("job params poisoned")
            .position_samples
    }

    /// Flush the device queue and refill it from `target`. Leaves the tasks
    /// stopped and the DO lines low.
    fn reprime(&mut self, target: u64) -> Result<()> {
        self.ao.stop()?;
        self.dout.set_low()?;
        self.prime(target)
    }

    fn prime(&mut self, target: u64) -> Result<()> {
        let landed = self.source.seek_to_sample(target)?;
        self.run_base = target;
        self.consumed_since = 0;
        self.enqueued_since = 0;
        self.underflow_streak = 0;
        self.underflow_window_start = None;
        self.decode_retry_armed = true;
        self.shared
            .lock()
            .expect("job params poisoned")
            .position_samples = target;
        if landed > target {
            // The demuxer overshot by part of a codec frame; lead in with
            // silence so the timeline still starts at `target`.
            let gap = (landed - target).min(self.samples_per_frame as u64) as usize;
            let zeros = vec![0.0_f64; gap * self.map.ao_channels()];
            self.ao.write(&zeros, gap)?;
            self.enqueued_since += gap as u64;
            self.consumed_since += gap as u64;
        }
        for _ in 0..PRIME_BLOCKS {
            if let Block::End = self.produce_block()? {
                break;
            }
        }
        self.gen_base = self.ao.generated_frames()?;
        self.primed_at = Some(target);
        Ok(())
    }

    fn start_tasks(&mut self) -> Result<()> {
        self.dout.set_high()?;
        self.ao.start()?;
        self.gen_base = self.ao.generated_frames()?;
        Ok(())
    }

    fn stream(&mut self, commands: &Receiver<PumpCommand>) -> Step {
        if let Err(e) = self.start_tasks() {
            return self.fault(e);
        }
        info!(position = self.run_base, "generation started");
        loop {
            match commands.try_recv() {
                Ok(PumpCommand::Stop) => return Step::Exit,
                Ok(PumpCommand::Pause) => return self.pause(),
                Ok(PumpCommand::Seek { frame, resume }) => {
                    if let Err(e) = self.reprime(frame) {
                        return self.fault(e);
                    }
                    if !resume {
                        return Step::Parked;
                    }
                    if let Err(e) = self.start_tasks() {
                        return self.fault(e);
                    }
                    continue;
                }
                // Restart while already running is a seek in disguise.
                Ok(PumpCommand::Start { from: Some(frame) }) => {
                    if let Err(e) = self.reprime(frame).and_then(|()| self.start_tasks()) {
                        return self.fault(e);
                    }
                    continue;
                }
                Ok(PumpCommand::Start { from: None }) => {}
                Err(TryRecvError::Empty) => {}
                Err(TryRecvError::Disconnected) => return Step::Exit,
            }

            if let Err(e) = self.ao.wait_block(self.samples_per_frame) {
                return self.fault(e);
            }
            match self.produce_block() {
                Ok(Block::Produced { missed }) => {
                    if missed && self.note_underflow() {
                        return self.escalate();
                    }
                }
                Ok(Block::End) => return self.drain_and_complete(),
                Err(e) => return self.fault(e),
            }
        }
    }

    /// Decode, map, and enqueue one callback quantum.
    fn produce_block(&mut self) -> Result<Block> {
        let spf = self.samples_per_frame;
        let read = loop {
            match self.source.read_into(&mut self.src_scratch, spf) {
                Ok(read) => {
                    self.decode_retry_armed = true;
                    break read;
                }
                Err(e) if self.decode_retry_armed => {
                    // One reseek is allowed to shake off a transient decode
                    // failure; the missed interval plays as silence.
                    error!("mid-stream decode failure, reseeking: {}", e);
                    self.decode_retry_armed = false;
                    let position = self.run_base + self.consumed_since;
                    self.source.seek_to_sample(position)?;
                    break 0;
                }
                Err(e) => return Err(e),
            }
        };

        let source_done = match self.source.total_frames() {
            Some(total) => self.source.position() >= total,
            None => read == 0,
        };
        if read == 0 && source_done {
            return Ok(Block::End);
        }
        // A short read with data still owed is a stall: pad the rest of the
        // block with silence and record the miss.
        let stalled = read < spf && !source_done;
        let frames = if stalled { spf } else { read };
        if stalled {
            self.src_scratch[read * self.src_channels..frames * self.src_channels].fill(0.0);
        }

        let (gain, flip) = {
            let shared = self.shared.lock().expect("job params poisoned");
            (
                linear_gain(shared.volume_pct, shared.muted),
                shared.flip_lr_stereo,
            )
        };
        let buffer = &mut self.ao_buffers[self.buffer_index];
        self.buffer_index = (self.buffer_index + 1) % 2;
        self.map
            .map_block(&self.src_scratch, frames, buffer, gain, flip);

        let outcome = self
            .ao
            .write(&buffer[..frames * self.map.ao_channels()], frames)?;
        self.enqueued_since += outcome.frames_queued as u64;
        self.consumed_since += frames as u64;

        let missed = outcome.underflowed || stalled;
        // Padding can run past the source total; the reported position
        // never does.
        let position = (self.run_base + self.consumed_since).min(self.total_frames);
        let underflow_events = {
            let mut shared = self.shared.lock().expect("job params poisoned");
            shared.position_samples = position;
            if missed {
                shared.underflow_events += 1;
            }
            shared.underflow_events
        };
        let _ = self.events.send(PumpEvent::Progress {
            position_samples: position,
            underflow_events,
        });
        Ok(Block::Produced { missed })
    }

    /// Track the escalation window. True means the caller must stop.
    fn note_underflow(&mut self) -> bool {
        let now = Instant::now();
        match self.underflow_window_start {
            Some(start) if now.duration_since(start) <= UNDERFLOW_ESCALATION_WINDOW => {
                self.underflow_streak += 1;
            }
            _ => {
                self.underflow_window_start = Some(now);
                self.underflow_streak = 1;
            }
        }
        self.underflow_streak >= UNDERFLOW_ESCALATION_COUNT
    }

    fn escalate(&mut self) -> Step {
        let audible = self.audible_position();
        let _ = self.ao.stop();
        let _ = self.dout.set_low();
        self.primed_at = None;
        self.shared
            .lock()
            .expect("job params poisoned")
            .position_samples = audible;
        let message = format!(
            "{} consecutive underflows within {:?}; generation stopped",
            self.underflow_streak, UNDERFLOW_ESCALATION_WINDOW
        );
        error!("{}", message);
        let _ = self.events.send(PumpEvent::UnderflowEscalated { message });
        Step::Parked
    }

    fn pause(&mut self) -> Step {
        let audible = self.audible_position();
        if let Err(e) = self.ao.stop().and_then(|()| self.dout.set_low()) {
            return self.fault(e);
        }
        self.primed_at = None;
        self.shared
            .lock()
            .expect("job params poisoned")
            .position_samples = audible;
        info!(position = audible, "generation paused");
        Step::Parked
    }

    fn audible_position(&mut self) -> u64 {
        let generated = self
            .ao
            .generated_frames()
            .unwrap_or(self.gen_base)
            .saturating_sub(self.gen_base);
        (self.run_base + generated.min(self.consumed_since)).min(self.total_frames)
    }

    fn drain_and_complete(&mut self) -> Step {
        // Let the last enqueued samples reach the lines before declaring
        // completion.
        loop {
            let generated = match self.ao.generated_frames() {
                Ok(g) => g.saturating_sub(self.gen_base),
                Err(e) => return self.fault(e),
            };
            let remaining = self.enqueued_since.saturating_sub(generated);
            if remaining == 0 {
                break;
            }
            if let Err(e) = self.ao.wait_block(remaining as usize) {
                return self.fault(e);
            }
        }
        if let Err(e) = self.ao.stop().and_then(|()| self.dout.set_low()) {
            return self.fault(e);
        }
        self.primed_at = None;
        let position = (self.run_base + self.consumed_since).min(self.total_frames);
        self.shared
            .lock()
            .expect("job params poisoned")
            .position_samples = position;
        info!(position, "generation completed");
        let _ = self.events.send(PumpEvent::Completed {
            position_samples: position,
        });
        Step::Parked
    }

    fn fault(&mut self, error: EngineError) -> Step {
        let _ = self.ao.stop();
        let _ = self.dout.set_low();
        self.primed_at = None;
        error!("frame pump fault: {}", error);
        let _ = self.events.send(PumpEvent::Fault { error });
        Step::Parked
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channels::ChannelSpec;
    use crate::hw::sim::{Pace, SimBackend};
    use crate::hw::traits::DaqBackend;

    /// In-memory source with optional stalling, for exercising the pump
    /// without files or codecs.
    struct MemorySource {
        samples: Vec<f32>,
        channels: usize,
        rate: u32,
        position: u64,
        stall_reads: u32,
    }

    impl MemorySource {
        fn new(frames: usize, channels: usize) -> Self {
            let mut samples = Vec::with_capacity(frames * channels);
            for i in 0..frames {
                for ch in 0..channels {
                    samples.push(((i + ch) % 100) as f32 / 100.0);
                }
            }
            Self {
                samples,
                channels,
                rate: 48_000,
                position: 0,
                stall_reads: 0,
            }
        }

        fn total(&self) -> u64 {
            (self.samples.len() / self.channels) as u64
        }
    }

    impl SampleSource for MemorySource {
        fn read_into(&mut self, dest: &mut [f32], n_frames: usize) -> Result<usize> {
            if self.stall_reads > 0 {
                self.stall_reads -= 1;
                return Ok(0);
            }
            let left = (self.total() - self.position) as usize;
            let take = n_frames.min(left);
            let start = self.position as usize * self.channels;
            dest[..take * self.channels]
                .copy_from_slice(&self.samples[start..start + take * self.channels]);
            self.position += take as u64;
            Ok(take)
        }

        fn seek_to_sample(&mut self, n: u64) -> Result<u64> {
            self.position = n.min(self.total());
            Ok(self.position)
        }

        fn position(&self) -> u64 {
            self.position
        }

        fn total_frames(&self) -> Option<u64> {
            Some(self.total())
        }

        fn sample_rate_hz(&self) -> u32 {
            self.rate
        }

        fn channel_count(&self) -> usize {
            self.channels
        }

        fn bit_depth(&self) -> Option<u32> {
            Some(32)
        }
    }

    struct Rig {
        pump: FramePump,
        shared: Arc<Mutex<SharedParams>>,
        probe: crate::hw::sim::ProbeHandle,
        events: tokio::sync::mpsc::UnboundedReceiver<PumpEvent>,
        total: u64,
    }

    fn rig(source: MemorySource, ao_lines: &[&str], spf: usize) -> Rig {
        rig_paced(source, ao_lines, spf, Pace::Immediate)
    }

    fn rig_paced(source: MemorySource, ao_lines: &[&str], spf: usize, pace: Pace) -> Rig {
        let backend = SimBackend::new(pace);
        let probe = backend.probe();
        let devices = backend.enumerate().unwrap();
        let spec = ChannelSpec::new(ao_lines.iter().map(|s| s.to_string()).collect(), None, vec![]);
        let tasks = backend.open(&devices[0], &spec, source.rate, spf).unwrap();
        let shared = Arc::new(Mutex::new(SharedParams {
            volume_pct: 100,
            muted: false,
            flip_lr_stereo: false,
            position_samples: 0,
            underflow_events: 0,
        }));
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let total = source.total();
        let pump = FramePump::spawn(
            Box::new(source),
            tasks,
            spec.ao_count(),
            shared.clone(),
            spf,
            total,
            tx,
        )
        .unwrap();
        Rig {
            pump,
            shared,
            probe,
            events: rx,
            total,
        }
    }

    fn wait_for<F: Fn(&PumpEvent) -> bool>(rig: &mut Rig, pred: F) -> PumpEvent {
        loop {
            let event = rig
                .events
                .blocking_recv()
                .expect("pump event channel closed early");
            if pred(&event) {
                return event;
            }
        }
    }

    #[test]
    fn plays_to_completion_with_exact_position() {
        let mut rig = rig(MemorySource::new(1000, 1), &["ao0", "ao1"], 256);
        rig.pump.send(PumpCommand::Start { from: None });
        let event = wait_for(&mut rig, |e| matches!(e, PumpEvent::Completed { .. }));
        let PumpEvent::Completed { position_samples } = event else {
            unreachable!()
        };
        assert_eq!(position_samples, rig.total);
        assert_eq!(rig.shared.lock().unwrap().position_samples, rig.total);
        {
            let probe = rig.probe.lock().unwrap();
            // Mono fan-out: both AO lines carry the source signal.
            assert_eq!(probe.ao_written.len(), 1000 * 2);
            assert!(!probe.do_high);
            assert_eq!(probe.do_transitions.first(), Some(&true));
            assert_eq!(probe.do_transitions.last(), Some(&false));
        }
        rig.pump.shutdown();
    }

    #[test]
    fn do_lines_high_only_while_playing() {
        // Realtime pace so the run is still in flight when we look.
        let mut rig = rig_paced(MemorySource::new(100_000, 1), &["ao0"], 512, Pace::Realtime);
        rig.pump.send(PumpCommand::Start { from: None });
        wait_for(&mut rig, |e| matches!(e, PumpEvent::Progress { .. }));
        assert!(rig.probe.lock().unwrap().do_high);
        rig.pump.send(PumpCommand::Pause);
        // Pause acknowledges through the shared position; poll the probe.
        for _ in 0..200 {
            if !rig.probe.lock().unwrap().do_high {
                break;
            }
            std::thread::sleep(Duration::from_millis(5));
        }
        assert!(!rig.probe.lock().unwrap().do_high);
        let paused_at = rig.shared.lock().unwrap().position_samples;
        assert!(paused_at <= 100_000);
        rig.pump.shutdown();
    }

    #[test]
    fn stalling_source_escalates_to_stop() {
        let mut source = MemorySource::new(100_000, 1);
        source.stall_reads = 50;
        let mut rig = rig(source, &["ao0"], 256);
        rig.pump.send(PumpCommand::Start { from: None });
        let event = wait_for(&mut rig, |e| {
            matches!(e, PumpEvent::UnderflowEscalated { .. })
        });
        let PumpEvent::UnderflowEscalated { message } = event else {
            unreachable!()
        };
        assert!(message.contains("underflow"));
        assert!(rig.shared.lock().unwrap().underflow_events >= 3);
        assert!(!rig.probe.lock().unwrap().do_high);
        rig.pump.shutdown();
    }

    #[test]
    fn device_loss_faults() {
        let mut rig = rig(MemorySource::new(100_000, 1), &["ao0"], 256);
        rig.probe.lock().unwrap().fail_writes_after = Some(4);
        rig.pump.send(PumpCommand::Start { from: None });
        let event = wait_for(&mut rig, |e| matches!(e, PumpEvent::Fault { .. }));
        let PumpEvent::Fault { error } = event else {
            unreachable!()
        };
        assert_eq!(error.kind(), "device");
        rig.pump.shutdown();
    }

    #[test]
    fn seek_restarts_from_target() {
        let mut rig = rig(MemorySource::new(50_000, 1), &["ao0"], 256);
        rig.pump.send(PumpCommand::Seek {
            frame: 40_000,
            resume: true,
        });
        let event = wait_for(&mut rig, |e| matches!(e, PumpEvent::Progress { .. }));
        let PumpEvent::Progress {
            position_samples, ..
        } = event
        else {
            unreachable!()
        };
        assert!(position_samples >= 40_000);
        wait_for(&mut rig, |e| matches!(e, PumpEvent::Completed { .. }));
        rig.pump.shutdown();
    }
}
