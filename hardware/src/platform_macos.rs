/*!
macOS-specific GPU detection

Apple Silicon exposes a single Metal device sharing system memory, so VRAM is
reported as the unified RAM figure.
*/

use std::process::Command;

use crate::constants::*;
use crate::gpu::{GpuInfo, GpuVendor};
use crate::Result;

pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let arch = std::env::consts::ARCH;
    if arch != "aarch64" {
        return Ok(Vec::new());
    }

    let memory = crate::memory::detect_memory()?;
    let name = chip_name().unwrap_or_else(|| "Apple Silicon GPU".to_string());

    Ok(vec![GpuInfo {
        vendor: GpuVendor::Apple,
        name,
        vram_mb: Some(memory.total_ram_mb),
        free_vram_mb: Some(memory.available_ram_mb),
        driver_version: None,
        vulkan: false,
        compute_capability: None,
    }])
}

fn chip_name() -> Option<String> {
    let output = Command::new(CMD_SYSTEM_PROFILER)
        .args(["SPDisplaysDataType", "-json"])
        .output()
        .ok()?;
    let data: serde_json::Value = serde_json::from_slice(&output.stdout).ok()?;
    data["SPDisplaysDataType"][0]["sppci_model"]
        .as_str()
        .map(str::to_string)
}
