/*!
Backend Device Listing

Asks a `llama-server` binary which compute devices it can see
(`--list-devices`) and parses the answer. This is the authoritative view for
planning: it reflects the backend actually being launched, not what the OS
reports.
*/

use regex::Regex;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::process::Stdio;
use std::sync::OnceLock;
use std::time::Duration;
use tokio::process::Command;

use crate::constants::*;
use crate::{HardwareError, Result};

/// One device reported by the backend. Memory figures are MiB.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceInfo {
    pub id: String,
    pub name: String,
    pub mem: u64,
    pub free: u64,
}

fn device_line_regex() -> Option<&'static Regex> {
    static RE: OnceLock<Option<Regex>> = OnceLock::new();
    // "Vulkan0: Intel(R) Arc(tm) A750 Graphics (DG2) (8128 MiB, 8128 MiB free)"
    RE.get_or_init(|| {
        Regex::new(r"^([^:\s]+):\s*(.*\S)\s*\(\s*(\d+)\s*MiB\s*,\s*(\d+)\s*MiB\s+free\s*\)$").ok()
    })
    .as_ref()
}

/// List devices visible to the backend at `backend_path`.
///
/// The binary's own directory and `library_path` (when given) are prepended
/// to the platform library search variable so bundled runtimes resolve.
pub async fn get_devices(
    backend_path: &Path,
    library_path: Option<&Path>,
) -> Result<Vec<DeviceInfo>> {
    if !backend_path.is_file() {
        return Err(HardwareError::BackendNotFound(
            backend_path.display().to_string(),
        ));
    }

    tracing::info!("Listing devices via {}", backend_path.display());

    let mut extra = Vec::new();
    if let Some(dir) = backend_path.parent() {
        extra.push(dir);
    }
    if let Some(lib) = library_path {
        extra.push(lib);
    }
    let (var, value) = common::platform::library_search_path(&extra);

    let mut command = Command::new(backend_path);
    command
        .arg(DEVICE_LIST_FLAG)
        .env(var, value)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = tokio::time::timeout(
        Duration::from_secs(DEVICE_PROBE_TIMEOUT_SECS),
        command.output(),
    )
    .await
    .map_err(|_| {
        HardwareError::ProbeFailed(format!(
            "timed out after {}s waiting for device list",
            DEVICE_PROBE_TIMEOUT_SECS
        ))
    })?
    .map_err(|e| HardwareError::ProbeFailed(format!("failed to run backend: {}", e)))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        tracing::error!("{} {} failed: {}", backend_path.display(), DEVICE_LIST_FLAG, stderr.trim());
        return Err(HardwareError::ProbeFailed(format!(
            "backend exited with {}: {}",
            output.status,
            stderr.trim()
        )));
    }

    let stdout = String::from_utf8_lossy(&output.stdout);
    tracing::debug!("Device list output:\n{}", stdout);
    parse_device_output(&stdout)
}

/// Parse `--list-devices` output.
///
/// Everything before the `Available devices:` header is ignored, malformed
/// device lines are skipped. The result is ordered by id (`CUDA2` before
/// `CUDA10`), keeping the backend's order for equal ids.
pub fn parse_device_output(output: &str) -> Result<Vec<DeviceInfo>> {
    let mut lines = output.lines();
    if !lines.by_ref().any(|line| line.trim() == DEVICE_LIST_HEADER) {
        return Err(HardwareError::ProbeFailed(format!(
            "could not find '{}' in backend output",
            DEVICE_LIST_HEADER
        )));
    }

    let mut devices: Vec<DeviceInfo> = lines
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .filter_map(|line| {
            let parsed = parse_device_line(line);
            if parsed.is_none() {
                tracing::warn!("Skipping malformed device line: {}", line);
            }
            parsed
        })
        .collect();

    if devices.is_empty() {
        tracing::warn!("No devices found in output");
    }

    devices.sort_by(|a, b| id_sort_key(&a.id).cmp(&id_sort_key(&b.id)));
    Ok(devices)
}

fn parse_device_line(line: &str) -> Option<DeviceInfo> {
    let caps = device_line_regex()?.captures(line)?;
    Some(DeviceInfo {
        id: caps[1].to_string(),
        name: caps[2].trim().to_string(),
        mem: caps[3].parse().ok()?,
        free: caps[4].parse().ok()?,
    })
}

/// Split `CUDA12` into `("CUDA", 12)` so numbered devices sort numerically
fn id_sort_key(id: &str) -> (&str, u64, &str) {
    let digits_at = id
        .char_indices()
        .rev()
        .take_while(|(_, c)| c.is_ascii_digit())
        .last()
        .map(|(i, _)| i)
        .unwrap_or(id.len());
    let (prefix, number) = id.split_at(digits_at);
    (prefix, number.parse().unwrap_or(0), number)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_cuda_line() {
        let dev = parse_device_line("CUDA0: NVIDIA GeForce RTX 4090 (24576 MiB, 24000 MiB free)").unwrap();
        assert_eq!(dev.id, "CUDA0");
        assert_eq!(dev.name, "NVIDIA GeForce RTX 4090");
        assert_eq!(dev.mem, 24576);
        assert_eq!(dev.free, 24000);
    }

    #[test]
    fn test_parse_nested_parentheses() {
        let dev = parse_device_line("Vulkan0: Intel(R) Arc(tm) A750 Graphics (DG2) (8128 MiB, 8128 MiB free)").unwrap();
        assert_eq!(dev.name, "Intel(R) Arc(tm) A750 Graphics (DG2)");
        assert_eq!(dev.free, 8128);
    }

    #[test]
    fn test_parse_malformed_lines() {
        assert!(parse_device_line("CUDA0 NVIDIA no colon (1 MiB, 1 MiB free)").is_none());
        assert!(parse_device_line("CUDA0: NVIDIA (lots of MiB, 1 MiB free)").is_none());
        assert!(parse_device_line("CUDA0: NVIDIA (24576 MiB)").is_none());
    }

    #[test]
    fn test_output_without_header() {
        let err = parse_device_output("ggml_cuda_init: found 1 CUDA devices").unwrap_err();
        assert!(matches!(err, HardwareError::ProbeFailed(_)));
    }

    #[test]
    fn test_output_header_only() {
        let devices = parse_device_output("Available devices:\n\n").unwrap();
        assert!(devices.is_empty());
    }

    #[test]
    fn test_output_sorted_and_filtered() {
        let out = "\
ggml_vulkan: Found 2 Vulkan devices:
Available devices:
  Vulkan1: AMD Radeon Graphics (RADV GFX1151) (87722 MiB, 87722 MiB free)
  garbage line
  Vulkan0: NVIDIA GeForce RTX 3090 (24576 MiB, 24576 MiB free)
  CUDA10: Tesla A100 (81920 MiB, 80000 MiB free)
  CUDA2: Tesla A100 (81920 MiB, 81000 MiB free)
";
        let devices = parse_device_output(out).unwrap();
        let ids: Vec<&str> = devices.iter().map(|d| d.id.as_str()).collect();
        assert_eq!(ids, vec!["CUDA2", "CUDA10", "Vulkan0", "Vulkan1"]);
    }

    #[tokio::test]
    async fn test_missing_binary() {
        let err = get_devices(Path::new("/nonexistent/llama-server"), None)
            .await
            .unwrap_err();
        assert!(matches!(err, HardwareError::BackendNotFound(_)));
    }
}
