/*!
Memory Detection (RAM)
*/

use serde::{Deserialize, Serialize};
use sysinfo::System;

use crate::Result;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryInfo {
    /// Total system RAM in MiB
    pub total_ram_mb: u64,

    /// Available (free) system RAM in MiB
    pub available_ram_mb: u64,

    /// Used system RAM in MiB
    pub used_ram_mb: u64,
}

/// Detect system memory (RAM) using sysinfo crate
pub fn detect_memory() -> Result<MemoryInfo> {
    let mut sys = System::new();
    sys.refresh_memory();

    Ok(MemoryInfo {
        total_ram_mb: sys.total_memory() / 1024 / 1024,
        available_ram_mb: sys.available_memory() / 1024 / 1024,
        used_ram_mb: sys.used_memory() / 1024 / 1024,
    })
}
