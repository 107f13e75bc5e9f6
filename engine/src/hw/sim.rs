//! Software-clocked DAQ backend. Paces generation off a monotonic clock at
//! the configured sample rate and records everything written to it, which is
//! what the integration tests probe instead of an oscilloscope.

use crate::channels::ChannelSpec;
use crate::error::{EngineError, Result};
use crate::hw::traits::{AoTask, BlockEdge, DaqBackend, DoTask, TaskPair, WriteOutcome};
use crate::registry::DeviceDescriptor;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

/// How `wait_block` passes time. `Realtime` sleeps like hardware would;
/// `Immediate` returns as soon as the bookkeeping is done so a 30 second
/// asset plays in milliseconds under test.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Pace {
    Realtime,
    Immediate,
}

/// Shared capture state behind every task the backend opens.
#[derive(Debug, Default)]
pub struct SimProbe {
    /// All AO frames written, interleaved in write order.
    pub ao_written: Vec<f64>,
    pub ao_channels: usize,
    pub do_high: bool,
    /// DO level transitions in the order they were commanded.
    pub do_transitions: Vec<bool>,
    pub writes: u64,
    pub underflows_reported: u64,
    /// Fail the AO write after this many successful writes, as if the
    /// device had been unplugged.
    pub fail_writes_after: Option<u64>,
    /// Report the next N writes as having missed the hardware deadline.
    pub force_underflow_writes: u64,
}

pub type ProbeHandle = Arc<Mutex<SimProbe>>;

pub struct SimBackend {
    pace: Pace,
    devices: Vec<DeviceDescriptor>,
    probe: ProbeHandle,
}

impl SimBackend {
    pub fn new(pace: Pace) -> Self {
        Self {
            pace,
            devices: vec![
                DeviceDescriptor {
                    name: "SimDev1".to_string(),
                    product_type: "USB-6343 (simulated)".to_string(),
                    product_category: "X Series DAQ".to_string(),
                    max_ao_rate_hz: 1_000_000.0,
                    ao_line_count: 4,
                    do_line_count: 32,
                },
                DeviceDescriptor {
                    name: "SimDev2".to_string(),
                    product_type: "USB-6001 (simulated)".to_string(),
                    product_category: "Multifunction DAQ".to_string(),
                    max_ao_rate_hz: 250_000.0,
                    ao_line_count: 2,
                    do_line_count: 8,
                },
            ],
            probe: Arc::new(Mutex::new(SimProbe::default())),
        }
    }

    /// Test hook: the capture/fault-injection state shared with opened tasks.
    pub fn probe(&self) -> ProbeHandle {
        self.probe.clone()
    }
}

impl DaqBackend for SimBackend {
    fn label(&self) -> &'static str {
        "sim"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        Ok(self.devices.clone())
    }

    fn driver_version(&self) -> Option<String> {
        Some("sim-1.0.0".to_string())
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        channels: &ChannelSpec,
        sample_rate_hz: u32,
        _samples_per_frame: usize,
    ) -> Result<TaskPair> {
        if sample_rate_hz as f64 > device.max_ao_rate_hz {
            return Err(EngineError::Device(format!(
                "sample rate {} Hz exceeds AO max {} Hz on '{}'",
                sample_rate_hz, device.max_ao_rate_hz, device.name
            )));
        }
        {
            let mut probe = self.probe.lock().expect("sim probe poisoned");
            probe.ao_written.clear();
            probe.do_transitions.clear();
            probe.ao_channels = channels.ao_count();
            probe.writes = 0;
            probe.underflows_reported = 0;
        }
        Ok(TaskPair {
            ao: Box::new(SimAoTask {
                rate: sample_rate_hz,
                channels: channels.ao_count(),
                pace: self.pace,
                probe: self.probe.clone(),
                queued_frames: 0,
                generated_frames: 0,
                gen_at_start: 0,
                epoch: None,
            }),
            dout: Box::new(SimDoTask {
                probe: self.probe.clone(),
            }),
        })
    }
}

struct SimAoTask {
    rate: u32,
    channels: usize,
    pace: Pace,
    probe: ProbeHandle,
    queued_frames: u64,
    generated_frames: u64,
    gen_at_start: u64,
    epoch: Option<Instant>,
}

impl AoTask for SimAoTask {
    fn start(&mut self) -> Result<()> {
        if self.epoch.is_some() {
            return Err(EngineError::Internal("AO task started twice".to_string()));
        }
        self.epoch = Some(Instant::now());
        self.gen_at_start = self.generated_frames;
        Ok(())
    }

    fn stop(&mut self) -> Result<()> {
        // Aborting a generation task discards whatever the host had queued
        // but the device not yet generated.
        self.queued_frames = self.generated_frames;
        self.epoch = None;
        Ok(())
    }

    fn write(&mut self, interleaved: &[f64], frames: usize) -> Result<WriteOutcome> {
        if interleaved.len() < frames * self.channels {
            return Err(EngineError::Internal(format!(
                "AO write of {} frames with only {} samples",
                frames,
                interleaved.len()
            )));
        }
        let mut probe = self.probe.lock().expect("sim probe poisoned");
        if let Some(limit) = probe.fail_writes_after {
            if probe.writes >= limit {
                return Err(EngineError::Device(
                    "simulated device loss: AO write failed".to_string(),
                ));
            }
        }
        let mut underflowed = self.epoch.is_some() && self.generated_frames > self.queued_frames;
        if probe.force_underflow_writes > 0 {
            probe.force_underflow_writes -= 1;
            underflowed = true;
        }
        // The driver clips to the device voltage range silently.
        probe.ao_written.extend(
            interleaved[..frames * self.channels]
                .iter()
                .map(|v| v.clamp(-1.0, 1.0)),
        );
        probe.writes += 1;
        if underflowed {
            probe.underflows_reported += 1;
        }
        self.queued_frames += frames as u64;
        Ok(WriteOutcome {
            frames_queued: frames,
            underflowed,
        })
    }

    fn generated_frames(&self) -> Result<u64> {
        Ok(self.generated_frames)
    }

    fn wait_block(&mut self, frames: usize) -> Result<BlockEdge> {
        let epoch = self
            .epoch
            .ok_or_else(|| EngineError::Internal("wait_block on a stopped AO task".to_string()))?;
        let target = self.generated_frames + frames as u64;
        if self.pace == Pace::Realtime {
            let due = epoch
                + Duration::from_secs_f64((target - self.gen_at_start) as f64 / self.rate as f64);
            let now = Instant::now();
            if due > now {
                std::thread::sleep(due - now);
            }
        }
        // The sample clock does not stop for the host: the block is
        // generated whether or not data was queued in time.
        self.generated_frames = target;
        Ok(BlockEdge {
            generated_frames: self.generated_frames,
        })
    }
}

struct SimDoTask {
    probe: ProbeHandle,
}

impl DoTask for SimDoTask {
    fn set_high(&mut self) -> Result<()> {
        let mut probe = self.probe.lock().expect("sim probe poisoned");
        probe.do_high = true;
        probe.do_transitions.push(true);
        Ok(())
    }

    fn set_low(&mut self) -> Result<()> {
        let mut probe = self.probe.lock().expect("sim probe poisoned");
        probe.do_high = false;
        probe.do_transitions.push(false);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn spec() -> ChannelSpec {
        ChannelSpec::new(vec!["ao0".to_string(), "ao1".to_string()], None, vec![])
    }

    fn open(backend: &SimBackend) -> TaskPair {
        let devices = backend.enumerate().unwrap();
        backend.open(&devices[0], &spec(), 48_000, 64).unwrap()
    }

    #[test]
    fn captures_written_frames() {
        let backend = SimBackend::new(Pace::Immediate);
        let probe = backend.probe();
        let mut pair = open(&backend);
        let block = vec![0.25_f64; 64 * 2];
        pair.ao.write(&block, 64).unwrap();
        pair.ao.start().unwrap();
        pair.ao.wait_block(64).unwrap();
        let probe = probe.lock().unwrap();
        assert_eq!(probe.ao_written.len(), 128);
        assert_eq!(probe.underflows_reported, 0);
    }

    #[test]
    fn write_past_generation_is_an_underflow() {
        let backend = SimBackend::new(Pace::Immediate);
        let probe = backend.probe();
        let mut pair = open(&backend);
        pair.ao.start().unwrap();
        // Two blocks tick by before anything is queued.
        pair.ao.wait_block(64).unwrap();
        pair.ao.wait_block(64).unwrap();
        let block = vec![0.0_f64; 64 * 2];
        let outcome = pair.ao.write(&block, 64).unwrap();
        assert!(outcome.underflowed);
        assert_eq!(probe.lock().unwrap().underflows_reported, 1);
    }

    #[test]
    fn out_of_range_samples_are_clipped() {
        let backend = SimBackend::new(Pace::Immediate);
        let probe = backend.probe();
        let mut pair = open(&backend);
        let block = vec![3.0_f64; 2];
        pair.ao.write(&block, 1).unwrap();
        assert_eq!(probe.lock().unwrap().ao_written, vec![1.0, 1.0]);
    }

    #[test]
    fn do_lines_record_transitions() {
        let backend = SimBackend::new(Pace::Immediate);
        let probe = backend.probe();
        let mut pair = open(&backend);
        pair.dout.set_high().unwrap();
        pair.dout.set_low().unwrap();
        let probe = probe.lock().unwrap();
        assert!(!probe.do_high);
        assert_eq!(probe.do_transitions, vec![true, false]);
    }

    #[test]
    fn rejects_rate_above_device_max() {
        let backend = SimBackend::new(Pace::Immediate);
        let devices = backend.enumerate().unwrap();
        let result = backend.open(&devices[1], &spec(), 400_000, 64);
        assert!(matches!(result, Err(EngineError::Device(_))));
    }
}
