//! Compute Device Selection
//!
//! The local backend prefers an accelerator when enough device memory is
//! free and falls back to CPU otherwise. One decision per batch, never
//! mid-batch, and the CPU fallback warns exactly once per process.

use std::sync::OnceLock;

/// Compute device for an embedding batch
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Device {
    Accelerator,
    Cpu,
}

impl std::fmt::Display for Device {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Device::Accelerator => write!(f, "accelerator"),
            Device::Cpu => write!(f, "cpu"),
        }
    }
}

static CPU_FALLBACK_WARNED: OnceLock<()> = OnceLock::new();

/// Free accelerator memory in bytes, when an accelerator is present
///
/// `TESSERA_ACCELERATOR_FREE_BYTES` overrides the probe; without it the
/// build reports no accelerator unless compiled with `metal`, where the
/// runtime owns device memory and the probe reports effectively unlimited.
pub fn free_accelerator_memory() -> Option<u64> {
    if let Ok(value) = std::env::var("TESSERA_ACCELERATOR_FREE_BYTES") {
        return value.parse().ok();
    }
    #[cfg(feature = "metal")]
    {
        return Some(u64::MAX);
    }
    #[cfg(not(feature = "metal"))]
    None
}

/// Pick the device for the next batch
pub fn select_device(min_free_bytes: u64) -> Device {
    match free_accelerator_memory() {
        Some(free) if free >= min_free_bytes => Device::Accelerator,
        _ => Device::Cpu,
    }
}

/// Emit the CPU-fallback warning once per process
pub fn warn_cpu_fallback_once() {
    CPU_FALLBACK_WARNED.get_or_init(|| {
        tracing::warn!("accelerator memory below threshold, embedding batches run on CPU");
    });
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_select_device_threshold() {
        // SAFETY: test-only env mutation, no concurrent readers in this test binary
        unsafe {
            std::env::set_var("TESSERA_ACCELERATOR_FREE_BYTES", "1048576");
        }
        assert_eq!(select_device(500 * 1024 * 1024), Device::Cpu);
        assert_eq!(select_device(1024), Device::Accelerator);
        unsafe {
            std::env::remove_var("TESSERA_ACCELERATOR_FREE_BYTES");
        }
    }
}
