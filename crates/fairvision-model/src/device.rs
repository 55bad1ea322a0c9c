//! Device selection: CUDA > Metal > CPU fallback.

use candle_core::Device;

/// Select the best available compute device for the given accelerator ordinal.
///
/// Tries CUDA first (when compiled with `cuda` feature), then Metal
/// (when compiled with `metal` feature), then falls back to CPU.
pub fn select_device(gpu_id: usize) -> Device {
    #[cfg(feature = "cuda")]
    {
        if let Ok(device) = Device::new_cuda(gpu_id) {
            tracing::info!(gpu_id, "Using CUDA device");
            return device;
        }
        tracing::warn!(gpu_id, "CUDA feature enabled but device unavailable, falling back");
    }

    #[cfg(feature = "metal")]
    {
        if let Ok(device) = Device::new_metal(gpu_id) {
            tracing::info!(gpu_id, "Using Metal device");
            return device;
        }
        tracing::warn!(gpu_id, "Metal feature enabled but device unavailable, falling back");
    }

    tracing::debug!(gpu_id, "Using CPU device");
    Device::Cpu
}

#[cfg(test)]
mod tests {
    use super::*;

    #[cfg(not(any(feature = "cuda", feature = "metal")))]
    #[test]
    fn test_cpu_fallback_without_accelerator_features() {
        assert!(matches!(select_device(0), Device::Cpu));
        assert!(matches!(select_device(3), Device::Cpu));
    }
}
