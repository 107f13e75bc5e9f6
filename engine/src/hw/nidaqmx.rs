//! Raw binding to the NI-DAQmx C runtime, limited to the handful of calls
//! the player needs: AO voltage tasks with onboard sample-clock timing,
//! static digital lines for the TTL sync pulse, and system/device queries
//! for enumeration.

#![allow(non_snake_case)]

use crate::channels::ChannelSpec;
use crate::error::{EngineError, Result};
use crate::hw::traits::{AoTask, BlockEdge, DaqBackend, DoTask, TaskPair, WriteOutcome};
use crate::registry::DeviceDescriptor;
use std::ffi::{CStr, CString, c_char, c_void};
use std::time::Duration;
use tracing::warn;

type TaskHandle = *mut c_void;

const DAQMX_VAL_VOLTS: i32 = 10348;
const DAQMX_VAL_RISING: i32 = 10280;
const DAQMX_VAL_CONT_SAMPS: i32 = 10123;
const DAQMX_VAL_GROUP_BY_SCAN_NUMBER: u32 = 1;
const DAQMX_VAL_CHAN_FOR_ALL_LINES: i32 = 1;
const DAQMX_VAL_DO_NOT_ALLOW_REGEN: i32 = 10158;

/// Generation ran ahead of the host write pointer.
const DAQMX_ERR_SAMPLES_NO_LONGER_AVAILABLE: i32 = -200290;
const DAQMX_ERR_UNDERFLOW: i32 = -200621;

#[link(name = "nidaqmx")]
unsafe extern "C" {
    fn DAQmxCreateTask(name: *const c_char, task: *mut TaskHandle) -> i32;
    fn DAQmxClearTask(task: TaskHandle) -> i32;
    fn DAQmxStartTask(task: TaskHandle) -> i32;
    fn DAQmxStopTask(task: TaskHandle) -> i32;
    fn DAQmxCreateAOVoltageChan(
        task: TaskHandle,
        physical_channel: *const c_char,
        name: *const c_char,
        min_val: f64,
        max_val: f64,
        units: i32,
        custom_scale: *const c_char,
    ) -> i32;
    fn DAQmxCreateDOChan(
        task: TaskHandle,
        lines: *const c_char,
        name: *const c_char,
        line_grouping: i32,
    ) -> i32;
    fn DAQmxCfgSampClkTiming(
        task: TaskHandle,
        source: *const c_char,
        rate: f64,
        active_edge: i32,
        sample_mode: i32,
        samps_per_chan: u64,
    ) -> i32;
    fn DAQmxCfgOutputBuffer(task: TaskHandle, samps_per_chan: u32) -> i32;
    fn DAQmxSetWriteRegenMode(task: TaskHandle, mode: i32) -> i32;
    fn DAQmxCfgDigEdgeStartTrig(task: TaskHandle, source: *const c_char, edge: i32) -> i32;
    fn DAQmxWriteAnalogF64(
        task: TaskHandle,
        samps_per_chan: i32,
        auto_start: u32,
        timeout: f64,
        data_layout: u32,
        data: *const f64,
        samps_written: *mut i32,
        reserved: *mut c_void,
    ) -> i32;
    fn DAQmxWriteDigitalLines(
        task: TaskHandle,
        samps_per_chan: i32,
        auto_start: u32,
        timeout: f64,
        data_layout: u32,
        data: *const u8,
        samps_written: *mut i32,
        reserved: *mut c_void,
    ) -> i32;
    fn DAQmxGetWriteTotalSampPerChanGenerated(task: TaskHandle, value: *mut u64) -> i32;
    fn DAQmxGetExtendedErrorInfo(buffer: *mut c_char, size: u32) -> i32;
    fn DAQmxGetSysDevNames(buffer: *mut c_char, size: u32) -> i32;
    fn DAQmxGetSysNIDAQMajorVersion(value: *mut u32) -> i32;
    fn DAQmxGetSysNIDAQMinorVersion(value: *mut u32) -> i32;
    fn DAQmxGetSysNIDAQUpdateVersion(value: *mut u32) -> i32;
    fn DAQmxGetDevProductType(device: *const c_char, buffer: *mut c_char, size: u32) -> i32;
    fn DAQmxGetDevProductCategory(device: *const c_char, value: *mut i32) -> i32;
    fn DAQmxGetDevAOMaxRate(device: *const c_char, value: *mut f64) -> i32;
    fn DAQmxGetDevAOPhysicalChans(device: *const c_char, buffer: *mut c_char, size: u32) -> i32;
    fn DAQmxGetDevDOLines(device: *const c_char, buffer: *mut c_char, size: u32) -> i32;
}

fn extended_error() -> String {
    let mut buf = vec![0_i8 as c_char; 2048];
    unsafe {
        DAQmxGetExtendedErrorInfo(buf.as_mut_ptr(), buf.len() as u32);
        CStr::from_ptr(buf.as_ptr()).to_string_lossy().into_owned()
    }
}

fn check(code: i32) -> Result<()> {
    if code < 0 {
        return Err(EngineError::Device(format!(
            "DAQmx error {}: {}",
            code,
            extended_error()
        )));
    }
    if code > 0 {
        warn!("DAQmx warning {}: {}", code, extended_error());
    }
    Ok(())
}

fn cstring(value: &str) -> Result<CString> {
    CString::new(value)
        .map_err(|_| EngineError::Validation(format!("embedded NUL in name '{}'", value)))
}

fn query_string(f: impl Fn(*mut c_char, u32) -> i32) -> Result<String> {
    let mut buf = vec![0_i8 as c_char; 4096];
    check(f(buf.as_mut_ptr(), buf.len() as u32))?;
    Ok(unsafe { CStr::from_ptr(buf.as_ptr()) }
        .to_string_lossy()
        .into_owned())
}

fn count_list(list: &str) -> usize {
    list.split(',').filter(|s| !s.trim().is_empty()).count()
}

fn category_name(value: i32) -> &'static str {
    match value {
        14643 => "M Series DAQ",
        15858 => "X Series DAQ",
        14642 => "E Series DAQ",
        15895 => "USB DAQ",
        14648 => "Digital IO",
        _ => "DAQ",
    }
}

/// Backend over the installed NI-DAQmx runtime.
pub struct NidaqmxBackend;

impl NidaqmxBackend {
    pub fn new() -> Self {
        Self
    }
}

impl Default for NidaqmxBackend {
    fn default() -> Self {
        Self::new()
    }
}

impl DaqBackend for NidaqmxBackend {
    fn label(&self) -> &'static str {
        "nidaqmx"
    }

    fn enumerate(&self) -> Result<Vec<DeviceDescriptor>> {
        let names = query_string(|buf, len| unsafe { DAQmxGetSysDevNames(buf, len) })?;
        let mut devices = Vec::new();
        for name in names.split(',').map(str::trim).filter(|s| !s.is_empty()) {
            let dev = cstring(name)?;
            let product_type = query_string(|buf, len| unsafe {
                DAQmxGetDevProductType(dev.as_ptr(), buf, len)
            })?;
            let mut category = 0_i32;
            check(unsafe { DAQmxGetDevProductCategory(dev.as_ptr(), &mut category) })?;
            let mut max_ao_rate = 0.0_f64;
            check(unsafe { DAQmxGetDevAOMaxRate(dev.as_ptr(), &mut max_ao_rate) })?;
            let ao_chans = query_string(|buf, len| unsafe {
                DAQmxGetDevAOPhysicalChans(dev.as_ptr(), buf, len)
            })?;
            let do_lines = query_string(|buf, len| unsafe {
                DAQmxGetDevDOLines(dev.as_ptr(), buf, len)
            })?;
            devices.push(DeviceDescriptor {
                name: name.to_string(),
                product_type,
                product_category: category_name(category).to_string(),
                max_ao_rate_hz: max_ao_rate,
                ao_line_count: count_list(&ao_chans),
                do_line_count: count_list(&do_lines),
            });
        }
        Ok(devices)
    }

    fn driver_version(&self) -> Option<String> {
        let mut major = 0_u32;
        let mut minor = 0_u32;
        let mut update = 0_u32;
        let ok = unsafe {
            DAQmxGetSysNIDAQMajorVersion(&mut major) >= 0
                && DAQmxGetSysNIDAQMinorVersion(&mut minor) >= 0
                && DAQmxGetSysNIDAQUpdateVersion(&mut update) >= 0
        };
        ok.then(|| format!("{}.{}.{}", major, minor, update))
    }

    fn open(
        &self,
        device: &DeviceDescriptor,
        channels: &ChannelSpec,
        sample_rate_hz: u32,
        samples_per_frame: usize,
    ) -> Result<TaskPair> {
        // Both tasks prefix line names with the device, e.g. "Dev1/ao0".
        let ao_spec = channels
            .ao
            .iter()
            .map(|c| format!("{}/{}", device.name, c))
            .collect::<Vec<_>>()
            .join(",");
        let do_spec = channels
            .dout
            .iter()
            .map(|c| format!("{}/{}", device.name, c))
            .collect::<Vec<_>>()
            .join(",");

        let mut ao_handle: TaskHandle = std::ptr::null_mut();
        check(unsafe { DAQmxCreateTask(c"daqplay-ao".as_ptr(), &mut ao_handle) })?;
        let ao = NidaqmxAoTask {
            handle: ao_handle,
            rate: sample_rate_hz,
        };
        let ao_chans = cstring(&ao_spec)?;
        check(unsafe {
            DAQmxCreateAOVoltageChan(
                ao.handle,
                ao_chans.as_ptr(),
                c"".as_ptr(),
                -10.0,
                10.0,
                DAQMX_VAL_VOLTS,
                std::ptr::null(),
            )
        })?;
        // 4 callback quanta of onboard buffer, clocked continuously off the
        // device timebase.
        check(unsafe {
            DAQmxCfgSampClkTiming(
                ao.handle,
                std::ptr::null(),
                sample_rate_hz as f64,
                DAQMX_VAL_RISING,
                DAQMX_VAL_CONT_SAMPS,
                (samples_per_frame as u64) * 4,
            )
        })?;
        check(unsafe { DAQmxCfgOutputBuffer(ao.handle, (samples_per_frame as u32) * 4) })?;
        check(unsafe { DAQmxSetWriteRegenMode(ao.handle, DAQMX_VAL_DO_NOT_ALLOW_REGEN) })?;

        let mut do_handle: TaskHandle = std::ptr::null_mut();
        check(unsafe { DAQmxCreateTask(c"daqplay-do".as_ptr(), &mut do_handle) })?;
        let dout = NidaqmxDoTask {
            handle: do_handle,
            line_count: channels.dout.len(),
        };
        let do_lines = cstring(&do_spec)?;
        check(unsafe {
            DAQmxCreateDOChan(
                dout.handle,
                do_lines.as_ptr(),
                c"".as_ptr(),
                DAQMX_VAL_CHAN_FOR_ALL_LINES,
            )
        })?;
        // First DO sample lands on the AO start trigger, so the sync pulse
        // and the first audio sample are coincident within one sample clock.
        let trigger = cstring(&format!("/{}/ao/StartTrigger", device.name))?;
        if let Err(e) = check(unsafe {
            DAQmxCfgDigEdgeStartTrig(dout.handle, trigger.as_ptr(), DAQMX_VAL_RISING)
        }) {
            // Static DO tasks on some devices reject triggers; fall back to
            // on-demand writes.
            warn!("DO start trigger not armed: {}", e);
        }

        Ok(TaskPair {
            ao: Box::new(ao),
            dout: Box::new(dout),
        })
    }
}

struct NidaqmxAoTask {
    handle: TaskHandle,
    rate: u32,
}

// The handle is only ever used from the audio thread that owns the task.
unsafe impl Send for NidaqmxAoTask {}

impl AoTask for NidaqmxAoTask {
    fn start(&mut self) -> Result<()> {
        check(unsafe { DAQmxStartTask(self.handle) })
    }

    fn stop(&mut self) -> Result<()> {
        check(unsafe { DAQmxStopTask(self.handle) })
    }

    fn write(&mut self, interleaved: &[f64], frames: usize) -> Result<WriteOutcome> {
        let mut written = 0_i32;
        let code = unsafe {
            DAQmxWriteAnalogF64(
                self.handle,
                frames as i32,
                0,
                10.0,
                DAQMX_VAL_GROUP_BY_SCAN_NUMBER,
                interleaved.as_ptr(),
                &mut written,
                std::ptr::null_mut(),
            )
        };
        if code == DAQMX_ERR_SAMPLES_NO_LONGER_AVAILABLE || code == DAQMX_ERR_UNDERFLOW {
            // The device ran past us. Re-arm the task and report the miss;
            // the pump owns the zero-padding policy.
            let _ = unsafe { DAQmxStopTask(self.handle) };
            check(unsafe { DAQmxStartTask(self.handle) })?;
            return Ok(WriteOutcome {
                frames_queued: 0,
                underflowed: true,
            });
        }
        check(code)?;
        Ok(WriteOutcome {
            frames_queued: written as usize,
            underflowed: false,
        })
    }

    fn generated_frames(&self) -> Result<u64> {
        let mut generated = 0_u64;
        check(unsafe { DAQmxGetWriteTotalSampPerChanGenerated(self.handle, &mut generated) })?;
        Ok(generated)
    }

    fn wait_block(&mut self, frames: usize) -> Result<BlockEdge> {
        let target = self.generated_frames()? + frames as u64;
        let quarter = Duration::from_secs_f64(frames as f64 / self.rate as f64 / 4.0);
        loop {
            let generated = self.generated_frames()?;
            if generated >= target {
                return Ok(BlockEdge {
                    generated_frames: generated,
                });
            }
            std::thread::sleep(quarter);
        }
    }
}

impl Drop for NidaqmxAoTask {
    fn drop(&mut self) {
        unsafe {
            let _ = DAQmxStopTask(self.handle);
            let _ = DAQmxClearTask(self.handle);
        }
    }
}

struct NidaqmxDoTask {
    handle: TaskHandle,
    line_count: usize,
}

unsafe impl Send for NidaqmxDoTask {}

impl NidaqmxDoTask {
    fn write_level(&mut self, level: u8) -> Result<()> {
        let data = vec![level; self.line_count];
        let mut written = 0_i32;
        check(unsafe {
            DAQmxWriteDigitalLines(
                self.handle,
                1,
                1,
                10.0,
                DAQMX_VAL_GROUP_BY_SCAN_NUMBER,
                data.as_ptr(),
                &mut written,
                std::ptr::null_mut(),
            )
        })
    }
}

impl DoTask for NidaqmxDoTask {
    fn set_high(&mut self) -> Result<()> {
        self.write_level(1)
    }

    fn set_low(&mut self) -> Result<()> {
        self.write_level(0)
    }
}

impl Drop for NidaqmxDoTask {
    fn drop(&mut self) {
        unsafe {
            let _ = DAQmxStopTask(self.handle);
            let _ = DAQmxClearTask(self.handle);
        }
    }
}
