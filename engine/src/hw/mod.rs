#[cfg(feature = "nidaqmx")]
pub mod nidaqmx;
pub mod sim;
pub mod traits;

use crate::hw::traits::DaqBackend;
use std::sync::Arc;

/// When set, the simulator backend skips sample-clock pacing. Used by CI
/// runs that drive the server against the simulator.
pub const SIM_IMMEDIATE_ENV: &str = "DAQPLAY_SIM_IMMEDIATE";

pub fn env_flag(key: &str) -> bool {
    std::env::var(key)
        .ok()
        .map(|v| {
            let s = v.trim().to_ascii_lowercase();
            s == "1" || s == "true" || s == "yes" || s == "on"
        })
        .unwrap_or(false)
}

/// Default backend for this build: NI-DAQmx when linked in, otherwise the
/// simulator.
pub fn default_backend() -> Arc<dyn DaqBackend> {
    #[cfg(feature = "nidaqmx")]
    {
        Arc::new(nidaqmx::NidaqmxBackend::new())
    }
    #[cfg(not(feature = "nidaqmx"))]
    {
        let pace = if env_flag(SIM_IMMEDIATE_ENV) {
            sim::Pace::Immediate
        } else {
            sim::Pace::Realtime
        };
        Arc::new(sim::SimBackend::new(pace))
    }
}
