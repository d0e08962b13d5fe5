/*!
Windows-specific GPU detection using nvidia-smi and WMI
*/

use std::path::PathBuf;
use std::process::Command;

use crate::constants::*;
use crate::gpu::{parse_nvidia_smi, GpuInfo, GpuVendor};
use crate::{HardwareError, Result};

pub fn detect_gpus() -> Result<Vec<GpuInfo>> {
    let vulkan = vulkan_available();

    let mut gpus = match Command::new(CMD_NVIDIA_SMI)
        .args([NVIDIA_SMI_QUERY, NVIDIA_SMI_FORMAT])
        .output()
    {
        Ok(output) if output.status.success() => {
            parse_nvidia_smi(&String::from_utf8_lossy(&output.stdout))
        }
        _ => Vec::new(),
    };

    if gpus.is_empty() {
        gpus = detect_video_controllers()?;
    }

    for gpu in &mut gpus {
        gpu.vulkan = vulkan;
    }

    Ok(gpus)
}

fn vulkan_available() -> bool {
    let system_root = std::env::var_os("SystemRoot").unwrap_or_else(|| "C:\\Windows".into());
    PathBuf::from(system_root)
        .join("System32")
        .join(VULKAN_LOADER_WINDOWS)
        .exists()
}

/// Non-NVIDIA adapters via Win32_VideoController
fn detect_video_controllers() -> Result<Vec<GpuInfo>> {
    let output = Command::new(CMD_POWERSHELL)
        .args([
            "-NoProfile",
            "-Command",
            "Get-CimInstance -ClassName Win32_VideoController | Select-Object Name, AdapterRAM, DriverVersion | ConvertTo-Json",
        ])
        .output()
        .map_err(|e| HardwareError::GpuDetection(format!("PowerShell failed: {}", e)))?;

    if !output.status.success() {
        return Err(HardwareError::GpuDetection(
            String::from_utf8_lossy(&output.stderr).to_string(),
        ));
    }

    let json_str = String::from_utf8_lossy(&output.stdout);
    if json_str.trim().is_empty() {
        return Ok(Vec::new());
    }
    let data: serde_json::Value = serde_json::from_str(&json_str)
        .map_err(|e| HardwareError::GpuDetection(format!("JSON parse failed: {}", e)))?;

    // Single adapter comes back as an object, several as an array
    let entries = match data {
        serde_json::Value::Array(items) => items,
        other => vec![other],
    };

    Ok(entries
        .iter()
        .filter_map(|entry| {
            let name = entry["Name"].as_str()?.trim().to_string();
            let lower = name.to_lowercase();
            if lower.contains(KEYWORD_BASIC_DISPLAY) || lower.contains(KEYWORD_MICROSOFT_BASIC) {
                return None;
            }
            Some(GpuInfo {
                vendor: GpuVendor::classify(&name),
                vram_mb: entry["AdapterRAM"].as_u64().map(|b| b / 1024 / 1024),
                free_vram_mb: None,
                driver_version: entry["DriverVersion"].as_str().map(str::to_string),
                vulkan: false,
                compute_capability: None,
                name,
            })
        })
        .collect())
}
