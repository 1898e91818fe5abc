//! Compute device selection.

use candle_core::Device;

/// Environment variable forcing CPU execution (`1` or `true`).
pub const FORCE_CPU_ENV: &str = "CONVLSTM_FORCE_CPU";
/// Environment variable selecting the CUDA ordinal.
pub const CUDA_DEVICE_ENV: &str = "CONVLSTM_CUDA_DEVICE";

/// Pick the device for a run. Called once at startup.
///
/// Prefers CUDA when the crate is built with the `cuda` feature; any failure
/// falls back to CPU with a warning rather than an error.
#[must_use]
pub fn select_device() -> Device {
    let force_cpu = std::env::var(FORCE_CPU_ENV)
        .ok()
        .is_some_and(|v| v == "1" || v.eq_ignore_ascii_case("true"));
    let ordinal = std::env::var(CUDA_DEVICE_ENV)
        .ok()
        .and_then(|v| v.parse::<usize>().ok())
        .unwrap_or(0);

    if force_cpu {
        tracing::warn!("CPU mode forced via {FORCE_CPU_ENV}");
        return Device::Cpu;
    }
    if !cfg!(feature = "cuda") {
        tracing::info!("Training device: CPU (built without the cuda feature)");
        return Device::Cpu;
    }

    match Device::cuda_if_available(ordinal) {
        Ok(device @ Device::Cuda(_)) => {
            tracing::info!("Training device: CUDA (device {ordinal})");
            device
        }
        Ok(_) => {
            tracing::warn!("CUDA not available; falling back to CPU");
            Device::Cpu
        }
        Err(err) => {
            tracing::warn!("CUDA init failed ({err}); falling back to CPU");
            Device::Cpu
        }
    }
}

/// Short name for logs and reports.
#[must_use]
pub fn device_name(device: &Device) -> &'static str {
    match device {
        Device::Cpu => "cpu",
        Device::Cuda(_) => "cuda",
        Device::Metal(_) => "metal",
    }
}
