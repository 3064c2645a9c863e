//! Platform and device enumeration.
//!
//! Each discovered device gets one [`ClContext`], registered under the
//! canonical name `"OpenCL/<platform>/<device>"`. The registry owns the
//! contexts exclusively; dropping it releases every device resource.

use log::warn;
use opencl3::device::{
    Device, CL_DEVICE_TYPE_ALL, CL_FP_DENORM, CL_FP_FMA, CL_FP_INF_NAN, CL_FP_ROUND_TO_NEAREST,
    CL_FP_ROUND_TO_ZERO, CL_FP_SOFT_FLOAT,
};
use opencl3::platform::get_platforms;

use std::collections::BTreeMap;

use crate::context::ClContext;
use crate::error::functions::no_device;
use crate::ComputeError;

pub struct ClRegistry {
    contexts: BTreeMap<String, ClContext>,
}

impl ClRegistry {
    /// Enumerate all platforms and devices. Platforms or devices that
    /// fail to enumerate are skipped with a warning rather than
    /// poisoning the registry.
    pub fn new() -> Self {
        let mut contexts = BTreeMap::new();

        let platforms = match get_platforms() {
            Ok(platforms) => platforms,
            Err(e) => {
                warn!("enumerating OpenCL platforms failed: {e}");
                Vec::new()
            }
        };

        for platform in &platforms {
            let platform_name = platform
                .name()
                .unwrap_or_else(|_| "unknown".to_string())
                .trim()
                .to_string();
            let device_ids = match platform.get_devices(CL_DEVICE_TYPE_ALL) {
                Ok(ids) => ids,
                Err(e) => {
                    warn!("enumerating devices on platform '{platform_name}' failed: {e}");
                    continue;
                }
            };
            for device_id in device_ids {
                let device = Device::new(device_id);
                let device_name = device.name().unwrap_or_default().trim().to_string();

                let extensions = device.extensions().unwrap_or_default();
                let mut info = vec![
                    ("device_name".to_string(), device_name.clone()),
                    (
                        "driver_version".to_string(),
                        device.driver_version().unwrap_or_default(),
                    ),
                    (
                        "device_version".to_string(),
                        device.version().unwrap_or_default(),
                    ),
                    ("device_extensions".to_string(), extensions.clone()),
                ];

                let mut supports_double = extensions.contains("cl_khr_fp64");
                match device.double_fp_config() {
                    Ok(config) => {
                        info.push((
                            "device_double_fp_config".to_string(),
                            fp_config_flags(config),
                        ));
                        supports_double = supports_double || config != 0;
                    }
                    // pre-1.2 drivers do not provide the query; the
                    // extension probe above decides
                    Err(_) => info.push((
                        "device_double_fp_config".to_string(),
                        "not provided by this driver".to_string(),
                    )),
                }

                let key = format!("OpenCL/{platform_name}/{device_name}");
                contexts.insert(key, ClContext::new(device, info, supports_double));
            }
        }

        ClRegistry { contexts }
    }

    /// Registered device names, sorted.
    pub fn device_names(&self) -> Vec<String> {
        self.contexts.keys().cloned().collect()
    }

    /// Look up the context for a registered device name.
    pub fn context(&mut self, name: &str) -> Result<&mut ClContext, ComputeError> {
        if !self.contexts.contains_key(name) {
            return Err(no_device(format!(
                "device '{name}' not found; available devices: {}",
                self.device_names().join(", ")
            )));
        }
        Ok(self.contexts.get_mut(name).unwrap())
    }
}

impl Default for ClRegistry {
    fn default() -> Self {
        Self::new()
    }
}

fn fp_config_flags(config: u64) -> String {
    let mut flags = String::new();
    for (bit, name) in [
        (CL_FP_DENORM, "Denorm,"),
        (CL_FP_INF_NAN, "InfNan,"),
        (CL_FP_ROUND_TO_NEAREST, "RoundNearest,"),
        (CL_FP_ROUND_TO_ZERO, "RoundZero,"),
        (CL_FP_FMA, "FMA,"),
        (CL_FP_SOFT_FLOAT, "SoftFloat,"),
    ] {
        if config & bit != 0 {
            flags.push_str(name);
        }
    }
    flags
}
