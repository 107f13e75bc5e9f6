use crate::channels::ChannelSpec;
use crate::error::{EngineError, Result};
use crate::hw::traits::DaqBackend;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tracing::info;

/// One DAQ device as reported by the driver.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    pub name: String,
    pub product_type: String,
    pub product_category: String,
    pub max_ao_rate_hz: f64,
    pub ao_line_count: usize,
    pub do_line_count: usize,
}

/// Cached view over backend enumeration. Driver queries can take seconds,
/// so results stick until an operator asks for a refresh.
pub struct DeviceRegistry {
    backend: Arc<dyn DaqBackend>,
    devices: Option<Vec<DeviceDescriptor>>,
    driver_version: Option<String>,
}

impl DeviceRegistry {
    pub fn new(backend: Arc<dyn DaqBackend>) -> Self {
        Self {
            backend,
            devices: None,
            driver_version: None,
        }
    }

    pub fn backend(&self) -> Arc<dyn DaqBackend> {
        self.backend.clone()
    }

    /// Cached enumeration, if one happened yet.
    pub fn cached(&self) -> Option<&[DeviceDescriptor]> {
        self.devices.as_deref()
    }

    /// Install an enumeration performed elsewhere (the engine runs it on a
    /// blocking task with a timeout).
    pub fn set_cache(&mut self, devices: Vec<DeviceDescriptor>) {
        self.devices = Some(devices);
    }

    pub fn list_devices(&mut self, refresh: bool) -> Result<Vec<DeviceDescriptor>> {
        if refresh || self.devices.is_none() {
            let devices = self.backend.enumerate()?;
            info!(
                backend = self.backend.label(),
                count = devices.len(),
                "enumerated DAQ devices"
            );
            self.devices = Some(devices);
        }
        Ok(self.devices.clone().unwrap_or_default())
    }

    pub fn driver_version(&mut self) -> Option<String> {
        if self.driver_version.is_none() {
            self.driver_version = self.backend.driver_version();
        }
        self.driver_version.clone()
    }

    /// Resolve a device by name and check the channel spec against it.
    pub fn validate(&mut self, device_name: &str, channels: &ChannelSpec) -> Result<DeviceDescriptor> {
        let devices = self.list_devices(false)?;
        let device = devices
            .into_iter()
            .find(|d| d.name == device_name)
            .ok_or_else(|| {
                EngineError::Validation(format!("unknown device '{}'", device_name))
            })?;
        channels.validate(&device)?;
        Ok(device)
    }
}
