use crate::channels::ChannelSpec;
use crate::error::Result;
use crate::registry::DeviceDescriptor;

/// Result of one buffered write against the AO task.
#[derive(Debug, Clone, Copy)]
pub struct WriteOutcome {
    pub frames_queued: usize,
    /// The device consumed past the host write pointer before this write
    /// landed; the missed interval was not under host control.
    pub underflowed: bool,
}

/// One "N samples generated" edge of the hardware sample clock.
#[derive(Debug, Clone, Copy)]
pub struct BlockEdge {
    pub generated_frames: u64,
}

/// Continuous analog-output generation task bound to a set of AO lines.
/// Samples are interleaved frames in device units (volts); writes before
/// `start` prime the onboard buffer.
pub trait AoTask: Send {
    fn start(&mut self) -> Result<()>;
    fn stop(&mut self) -> Result<()>;
    /// Queue `frames` interleaved frames. Blocks while the device buffer is
    /// full; that backpressure is the only intended suspension point.
    fn write(&mut self, interleaved: &[f64], frames: usize) -> Result<WriteOutcome>;
    fn generated_frames(&self) -> Result<u64>;
    /// Return once the device has generated `frames` more frames. This is
    /// the callback edge that paces the frame pump.
    fn wait_block(&mut self, frames: usize) -> Result<BlockEdge>;
}

/// Digital-output task over the named sync lines. The lines follow the
/// transport: HIGH on entry to Playing, LOW on any exit from it.
pub trait DoTask: Send {
    fn set_high(&mut self) -> Result<()>;
    fn set_low(&mut self) -> Result<()>;
}

/// An opened AO+DO task pair sharing a start trigger.
pub struct TaskPair {
    pub ao: Box<dyn AoTask>,
    pub dout: Box<dyn DoTask>,
}

/// A DAQ driver backend: device enumeration plus task creation. Engine and
/// tests construct one explicitly; nothing here is process-global.
pub trait DaqBackend: Send + Sync {
    fn label(&self) -> &'static str;
    /// Enumerate devices. May take tens of milliseconds to seconds against
    /// a real driver; callers cache the result and refresh on request.
    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>>;
    fn driver_version(&self) -> Option<String>;
    fn open(
        &self,
        device: &DeviceDescriptor,
        channels: &ChannelSpec,
        sample_rate_hz: u32,
        samples_per_frame: usize,
    ) -> Result<TaskPair>;
}
