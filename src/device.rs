//! # Compute Device Selection
//!
//! Picks the device Whisper inference runs on, with automatic detection and
//! CPU fallback when no accelerator is available.

use candle_core::Device;
use std::sync::OnceLock;
use tracing::{debug, info, warn};

/// Cached auto-detected device so detection runs once per process.
static BEST_DEVICE: OnceLock<Device> = OnceLock::new();

/// Resolve a configured preference ("auto", "cpu", "cuda", "metal") to a
/// usable device, falling back to CPU when the preference is unavailable.
pub fn select_device(preference: &str) -> Device {
    match preference.to_lowercase().as_str() {
        "cpu" => Device::Cpu,
        "cuda" | "gpu" => cuda_device().unwrap_or(Device::Cpu),
        "metal" => metal_device().unwrap_or(Device::Cpu),
        "auto" | "automatic" => best_device(),
        other => {
            warn!("Unknown device preference '{}', using auto detection", other);
            best_device()
        }
    }
}

/// Short label for health and capability reporting.
pub fn device_label(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}

fn best_device() -> Device {
    BEST_DEVICE
        .get_or_init(|| {
            if let Some(device) = cuda_device() {
                info!("Selected CUDA GPU for inference");
                return device;
            }
            if let Some(device) = metal_device() {
                info!("Selected Metal GPU for inference");
                return device;
            }
            info!("No GPU acceleration available, using CPU for inference");
            Device::Cpu
        })
        .clone()
}

fn cuda_device() -> Option<Device> {
    match Device::new_cuda(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("CUDA not available: {}", e);
            None
        }
    }
}

fn metal_device() -> Option<Device> {
    match Device::new_metal(0) {
        Ok(device) => Some(device),
        Err(e) => {
            debug!("Metal not available: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_cpu_preference_always_resolves() {
        let device = select_device("cpu");
        assert!(matches!(device, Device::Cpu));
        assert_eq!(device_label(&device), "cpu");
    }

    #[test]
    fn test_unknown_preference_falls_back() {
        // Must resolve to something usable rather than erroring.
        let _ = select_device("quantum");
    }
}
