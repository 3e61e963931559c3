use std::fmt;
use std::path::Path;

/// Accelerator kinds a model can be placed on.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Device {
    /// NVIDIA GPU.
    Cuda,
    /// Apple Metal Performance Shaders.
    Mps,
    /// Generic CPU; always available.
    Cpu,
}

impl Device {
    /// Whether inference on this device should offload layers to a GPU.
    pub fn is_accelerator(self) -> bool {
        !matches!(self, Device::Cpu)
    }
}

impl fmt::Display for Device {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Device::Cuda => "cuda",
            Device::Mps => "mps",
            Device::Cpu => "cpu",
        };
        f.write_str(name)
    }
}

impl std::str::FromStr for Device {
    type Err = ();

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "cuda" | "gpu" => Ok(Self::Cuda),
            "mps" | "metal" => Ok(Self::Mps),
            "cpu" => Ok(Self::Cpu),
            _ => Err(()),
        }
    }
}

/// Answers whether an accelerator is usable on this host.
pub trait DeviceDetector: Send + Sync {
    /// Report availability of `device`.
    fn is_available(&self, device: Device) -> bool;
}

/// Detector that inspects the running host.
#[derive(Debug, Default, Clone, Copy)]
pub struct HostDevices;

impl DeviceDetector for HostDevices {
    fn is_available(&self, device: Device) -> bool {
        match device {
            Device::Cuda => cuda_visible(),
            Device::Mps => cfg!(all(target_os = "macos", target_arch = "aarch64")),
            Device::Cpu => true,
        }
    }
}

fn cuda_visible() -> bool {
    if let Ok(value) = std::env::var("CUDA_VISIBLE_DEVICES") {
        let value = value.trim();
        if value.is_empty() || value == "-1" {
            return false;
        }
    }
    Path::new("/proc/driver/nvidia/version").exists()
}

/// Pick the first available device from `priority`.
///
/// CPU terminates the search; an exhausted list without CPU still yields CPU.
pub fn device_for(priority: &[Device], detector: &dyn DeviceDetector) -> Device {
    for &device in priority {
        if device == Device::Cpu {
            return Device::Cpu;
        }
        if detector.is_available(device) {
            return device;
        }
        tracing::debug!(%device, "Device unavailable; trying next");
    }
    Device::Cpu
}
