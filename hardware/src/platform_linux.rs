/*!
Linux-specific GPU detection using nvidia-smi and lspci
*/

use std::path::Path;
use std::process::Command;

use crate::constants::*;
use crate::gpu::{parse_nvidia_smi, GpuInfo, GpuVendor};
use crate::Result;

/// Detect GPUs on Linux. nvidia-smi gives VRAM figures; lspci is the fallback.
pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let vulkan = vulkan_available();
    let mut gpus = Vec::new();

    if let Ok(output) = Command::new(CMD_NVIDIA_SMI)
        .args([NVIDIA_SMI_QUERY, NVIDIA_SMI_FORMAT])
        .output()
    {
        if output.status.success() {
            gpus = parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout));
        } else {
            tracing::debug!("nvidia-smi exited with {}", output.status);
        }
    }

    if gpus.is_empty() {
        if let Ok(output) = Command::new(CMD_LSPCI).output() {
            if output.status.success() {
                gpus = parse_lspci(&String::from_utf8_lossy(&output.stdout));
            }
        }
    }

    for gpu in &mut gpus {
        gpu.vulkan = vulkan;
    }

    Ok(gpus)
}

fn vulkan_available() -> bool {
    VULKAN_LOADER_PATHS_LINUX
        .iter()
        .any(|path| Path::new(path).exists())
}

fn parse_lspci(stdout: &str) -> Vec<GpuInfo> {
    stdout
        .lines()
        .filter(|line| {
            let lower = line.to_lowercase();
            lower.contains(KEYWORD_VGA) || lower.contains(KEYWORD_3D)
        })
        .map(|line| {
            // "01:00.0 VGA compatible controller: NVIDIA Corporation AD102 [GeForce RTX 4090]"
            let description = line.splitn(3, ':').nth(2).unwrap_or(line).trim();
            GpuInfo {
                vendor: GpuVendor::classify(description),
                name: description.to_string(),
                vram_mb: None,
                free_vram_mb: None,
                driver_version: None,
                vulkan: false,
                compute_capability: None,
            }
        })
        .collect()
}
