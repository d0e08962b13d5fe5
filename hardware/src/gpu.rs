/*!
GPU Detection

Detects GPU vendor, VRAM and driver details for backend selection and load
planning.
*/

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::constants::*;
use crate::Result;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum GpuVendor {
    Nvidia,
    Amd,
    Intel,
    Apple,
    Unknown,
}

impl GpuVendor {
    /// Classify a free-form adapter description
    pub fn classify(description: &str) -> Self {
        let lower = description.to_lowercase();
        if lower.contains(GPU_KEYWORD_NVIDIA) {
            Self::Nvidia
        } else if lower.contains(GPU_KEYWORD_AMD)
            || lower.contains(GPU_KEYWORD_RADEON)
            || lower.split_whitespace().any(|w| w == GPU_KEYWORD_ATI)
        {
            Self::Amd
        } else if lower.contains(GPU_KEYWORD_INTEL) {
            Self::Intel
        } else if lower.contains(GPU_KEYWORD_APPLE) {
            Self::Apple
        } else {
            Self::Unknown
        }
    }
}

impl fmt::Display for GpuVendor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Nvidia => write!(f, "{}", GPU_VENDOR_NVIDIA),
            Self::Amd => write!(f, "{}", GPU_VENDOR_AMD),
            Self::Intel => write!(f, "{}", GPU_VENDOR_INTEL),
            Self::Apple => write!(f, "{}", GPU_VENDOR_APPLE),
            Self::Unknown => write!(f, "{}", GPU_VENDOR_UNKNOWN),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GpuInfo {
    pub vendor: GpuVendor,
    pub name: String,
    pub vram_mb: Option<u64>,
    pub free_vram_mb: Option<u64>,
    pub driver_version: Option<String>,
    /// A Vulkan loader is present on the host
    pub vulkan: bool,
    /// CUDA compute capability, e.g. `8.9`
    pub compute_capability: Option<String>,
}

impl GpuInfo {
    pub fn nvidia(
        name: &str,
        vram_mb: Option<u64>,
        free_vram_mb: Option<u64>,
        driver_version: Option<&str>,
    ) -> Self {
        Self {
            vendor: GpuVendor::Nvidia,
            name: name.to_string(),
            vram_mb,
            free_vram_mb,
            driver_version: driver_version.map(str::to_string),
            vulkan: false,
            compute_capability: None,
        }
    }
}

/// Detect GPUs using platform-specific methods
pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    #[cfg(target_os = "windows")]
    {
        crate::platform_windows::detect_gpus()
    }

    #[cfg(target_os = "linux")]
    {
        crate::platform_linux::detect_gpus()
    }

    #[cfg(target_os = "macos")]
    {
        crate::platform_macos::detect_gpus()
    }

    #[cfg(not(any(target_os = "windows", target_os = "linux", target_os = "macos")))]
    {
        Ok(Vec::new())
    }
}

/// Parse `nvidia-smi --query-gpu=name,memory.total,memory.free,driver_version,compute_cap`
/// CSV output (no header, no units)
pub(crate) fn parse_nvidia_smi(stdout: &str) -> Vec<GpuInfo> {
    stdout
        .lines()
        .filter_map(|line| {
            let parts: Vec<&str> = line.split(',').map(|s| s.trim()).collect();
            if parts.len() < 4 || parts[0].is_empty() {
                return None;
            }
            let mut gpu = GpuInfo::nvidia(
                parts[0],
                parts[1].parse().ok(),
                parts[2].parse().ok(),
                Some(parts[3]),
            );
            gpu.compute_capability = parts
                .get(4)
                .filter(|cc| !cc.is_empty() && **cc != "[N/A]")
                .map(|cc| cc.to_string());
            Some(gpu)
        })
        .collect()
}
