/*!
# llamactl Hardware Detection

Enumerates compute devices and memory budgets for llama.cpp load planning
and backend selection.

## Features

- CPU instruction-set extensions (AVX, AVX2, AVX-512, NEON)
- GPU vendor, VRAM (total and free), driver version and Vulkan availability
- Device listing straight from a `llama-server` binary (`--list-devices`)
- [`HardwareProbe`] snapshots consumed by the load planner
- Serializable for JSON output

## Example

```rust,no_run
use llamactl_hardware::detect_system;

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let system = detect_system()?;
    println!("CPU: {} {:?}", system.cpu.model_name, system.cpu.extensions);
    for gpu in &system.gpus {
        println!("GPU: {} ({:?} MiB free)", gpu.name, gpu.free_vram_mb);
    }
    Ok(())
}
```
*/

use serde::{Deserialize, Serialize};
use sysinfo::System;
use thiserror::Error;

mod cpu;
mod devices;
mod gpu;
mod memory;
mod probe;
pub mod constants;

#[cfg(target_os = "windows")]
mod platform_windows;

#[cfg(target_os = "linux")]
mod platform_linux;

#[cfg(target_os = "macos")]
mod platform_macos;

pub use cpu::{detect_cpu, CpuInfo, CpuVendor};
pub use devices::{get_devices, parse_device_output, DeviceInfo};
pub use gpu::{detect_gpus, GpuInfo, GpuVendor};
pub use memory::{detect_memory, MemoryInfo};
pub use probe::{BackendDeviceProbe, GpuMemory, HardwareProbe, HardwareSnapshot, SystemProbe};

#[derive(Debug, Error)]
pub enum HardwareError {
    #[error("Failed to detect CPU: {0}")]
    CpuDetection(String),

    #[error("Failed to detect GPU: {0}")]
    GpuDetection(String),

    #[error("Backend binary not found: {0}")]
    BackendNotFound(String),

    #[error("Device probe failed: {0}")]
    ProbeFailed(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, HardwareError>;

/// Complete system hardware information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SystemInfo {
    pub cpu: CpuInfo,
    pub gpus: Vec<GpuInfo>,
    pub memory: MemoryInfo,
    pub os: OsInfo,
}

impl SystemInfo {
    /// Total VRAM across GPUs that report it, in MiB
    pub fn total_vram_mb(&self) -> u64 {
        self.gpus.iter().filter_map(|gpu| gpu.vram_mb).sum()
    }
}

/// Operating system information
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OsInfo {
    /// `linux`, `windows`, `macos`, ...
    pub name: String,
    pub version: String,
    /// `x86_64`, `aarch64`, ...
    pub arch: String,
}

impl OsInfo {
    /// Detect operating system information including version.
    pub fn detect() -> Self {
        let version = System::long_os_version()
            .or_else(System::os_version)
            .unwrap_or_else(|| "unknown".to_string());

        Self {
            name: std::env::consts::OS.to_string(),
            version,
            arch: std::env::consts::ARCH.to_string(),
        }
    }
}

/// Detect complete system hardware
pub fn detect_system() -> Result<SystemInfo> {
    let cpu = detect_cpu()?;
    let gpus = detect_gpus()?;
    let memory = detect_memory()?;
    let os = OsInfo::detect();

    Ok(SystemInfo {
        cpu,
        gpus,
        memory,
        os,
    })
}
