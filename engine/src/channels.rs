use crate::error::{EngineError, Result};
use crate::registry::DeviceDescriptor;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default TTL sync lines, driven HIGH for the whole of `Playing`.
pub const DEFAULT_DO_LINES: [&str; 2] = ["port0/line0", "port0/line1"];

/// The physical lines a playback job binds on the selected device. AO lines
/// are named `ao0..aoN`, DO lines `portP/lineL`. AI lines are accepted and
/// validated but not otherwise consumed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChannelSpec {
    pub ao: Vec<String>,
    pub dout: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub ai: Vec<String>,
}

impl ChannelSpec {
    pub fn new(ao: Vec<String>, dout: Option<Vec<String>>, ai: Vec<String>) -> Self {
        let dout =
            dout.unwrap_or_else(|| DEFAULT_DO_LINES.iter().map(|s| s.to_string()).collect());
        Self { ao, dout, ai }
    }

    pub fn ao_count(&self) -> usize {
        self.ao.len()
    }

    /// Check the spec against a device: names well formed, unique within
    /// their list, and within the device's line counts.
    pub fn validate(&self, device: &DeviceDescriptor) -> Result<()> {
        if self.ao.is_empty() {
            return Err(EngineError::Validation(
                "at least one AO channel is required".to_string(),
            ));
        }
        Self::check_unique("ao_channels", &self.ao)?;
        Self::check_unique("do_channels", &self.dout)?;
        Self::check_unique("ai_channels", &self.ai)?;
        for name in &self.ao {
            let index = parse_ao_index(name)?;
            if index >= device.ao_line_count {
                return Err(EngineError::Validation(format!(
                    "AO channel '{}' is not present on device '{}' ({} AO lines)",
                    name, device.name, device.ao_line_count
                )));
            }
        }
        for name in &self.dout {
            let line = parse_do_line(name)?;
            if line >= device.do_line_count {
                return Err(EngineError::Validation(format!(
                    "DO line '{}' is not present on device '{}' ({} DO lines)",
                    name, device.name, device.do_line_count
                )));
            }
        }
        for name in &self.ai {
            parse_ai_index(name)?;
        }
        Ok(())
    }

    fn check_unique(label: &str, names: &[String]) -> Result<()> {
        let mut seen = HashSet::with_capacity(names.len());
        for name in names {
            if !seen.insert(name.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate entry '{}' in {}",
                    name, label
                )));
            }
        }
        Ok(())
    }
}

/// `"ao3"` -> 3
pub fn parse_ao_index(name: &str) -> Result<usize> {
    name.strip_prefix("ao")
        .and_then(|rest| rest.parse::<usize>().ok())
        .ok_or_else(|| {
            EngineError::Validation(format!("bad AO channel name '{}', expected aoN", name))
        })
}

/// `"ai0"` -> 0
pub fn parse_ai_index(name: &str) -> Result<usize> {
    name.strip_prefix("ai")
        .and_then(|rest| rest.parse::<usize>().ok())
        .ok_or_else(|| {
            EngineError::Validation(format!("bad AI channel name '{}', expected aiN", name))
        })
}

/// `"port0/line1"` -> flat line index. Ports are 8 lines wide, which matches
/// the M- and X-series port layout the player targets.
pub fn parse_do_line(name: &str) -> Result<usize> {
    let err = || {
        EngineError::Validation(format!(
            "bad DO line name '{}', expected portP/lineL",
            name
        ))
    };
    let (port, line) = name.split_once('/').ok_or_else(err)?;
    let port: usize = port
        .strip_prefix("port")
        .and_then(|p| p.parse().ok())
        .ok_or_else(err)?;
    let line: usize = line
        .strip_prefix("line")
        .and_then(|l| l.parse().ok())
        .ok_or_else(err)?;
    if line >= 8 {
        return Err(err());
    }
    Ok(port * 8 + line)
}
