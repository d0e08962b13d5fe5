/*!
Hardware snapshots for the load planner

The planner only needs free VRAM per GPU and total RAM. [`HardwareProbe`]
hides where those numbers come from so planning can run against the OS view,
a backend's own device list, or a fixed snapshot in tests.
*/

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;

use crate::devices::get_devices;
use crate::memory::detect_memory;
use crate::{detect_system, HardwareError, Result};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GpuMemory {
    pub id: String,
    pub total_mb: u64,
    pub free_mb: u64,
}

/// Point-in-time memory budget. All figures in MiB.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardwareSnapshot {
    pub gpus: Vec<GpuMemory>,
    pub total_ram_mb: u64,
    pub available_ram_mb: u64,
}

impl HardwareSnapshot {
    pub fn total_free_vram_mb(&self) -> u64 {
        self.gpus.iter().map(|gpu| gpu.free_mb).sum()
    }
}

#[async_trait]
pub trait HardwareProbe: Send + Sync {
    async fn snapshot(&self) -> Result<HardwareSnapshot>;
}

/// A fixed snapshot probes as itself
#[async_trait]
impl HardwareProbe for HardwareSnapshot {
    async fn snapshot(&self) -> Result<HardwareSnapshot> {
        Ok(self.clone())
    }
}

/// OS-level detection (nvidia-smi, lspci, system_profiler, sysinfo)
#[derive(Debug, Clone, Default)]
pub struct SystemProbe;

#[async_trait]
impl HardwareProbe for SystemProbe {
    async fn snapshot(&self) -> Result<HardwareSnapshot> {
        let system = tokio::task::spawn_blocking(detect_system)
            .await
            .map_err(|e| HardwareError::ProbeFailed(format!("detection task failed: {}", e)))??;

        let gpus = system
            .gpus
            .iter()
            .enumerate()
            .filter_map(|(index, gpu)| {
                let total_mb = gpu.vram_mb?;
                Some(GpuMemory {
                    id: format!("GPU{}", index),
                    total_mb,
                    // Without a free figure, assume the card is idle
                    free_mb: gpu.free_vram_mb.unwrap_or(total_mb),
                })
            })
            .collect();

        Ok(HardwareSnapshot {
            gpus,
            total_ram_mb: system.memory.total_ram_mb,
            available_ram_mb: system.memory.available_ram_mb,
        })
    }
}

/// Devices as seen by a specific `llama-server` build, plus system RAM
#[derive(Debug, Clone)]
pub struct BackendDeviceProbe {
    pub backend_path: PathBuf,
    pub library_path: Option<PathBuf>,
}

impl BackendDeviceProbe {
    pub fn new(backend_path: impl Into<PathBuf>) -> Self {
        Self {
            backend_path: backend_path.into(),
            library_path: None,
        }
    }

    pub fn with_library_path(mut self, library_path: impl Into<PathBuf>) -> Self {
        self.library_path = Some(library_path.into());
        self
    }
}

#[async_trait]
impl HardwareProbe for BackendDeviceProbe {
    async fn snapshot(&self) -> Result<HardwareSnapshot> {
        let devices = get_devices(&self.backend_path, self.library_path.as_deref()).await?;
        let memory = detect_memory()?;

        Ok(HardwareSnapshot {
            gpus: devices
                .into_iter()
                .map(|dev| GpuMemory {
                    id: dev.id,
                    total_mb: dev.mem,
                    free_mb: dev.free,
                })
                .collect(),
            total_ram_mb: memory.total_ram_mb,
            available_ram_mb: memory.available_ram_mb,
        })
    }
}
