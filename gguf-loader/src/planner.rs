//! Load planning: how many layers go to the GPU, where the KV cache lives and
//! how much context fits.
//!
//! The decision itself is the pure [`plan_from_inputs`]; [`plan_model_load`]
//! gathers file sizes, GGUF metadata and a fresh hardware snapshot for it.
//! Hardware is probed on every call since VRAM comes and goes.

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::str::FromStr;

use llamactl_hardware::{HardwareProbe, HardwareSnapshot};

use crate::kv_cache::{KvCacheEstimator, KvCacheTypes};
use crate::reader::{read_gguf_metadata_async, GgufMetadata};
use crate::{GgufError, Result};

const MIB: u64 = 1024 * 1024;
const GIB: f64 = 1024.0 * 1024.0 * 1024.0;

/// Kept free on the GPU for the driver and other applications
const VRAM_RESERVE_BYTES: u64 = (0.5 * GIB) as u64;
/// Compute buffers and scratch space of the engine itself
const ENGINE_OVERHEAD_BYTES: u64 = (0.2 * GIB) as u64;
/// Smallest context worth loading a model for
pub const MIN_CONTEXT_LENGTH: u64 = 1024;
/// Used when the model does not declare `{arch}.context_length`
pub const DEFAULT_CONTEXT_LENGTH: u64 = 8192;

const MIN_BATCH: u64 = 64;
const GPU_BATCH_CAP: u64 = 2048;
const HYBRID_BATCH_CAP: u64 = 512;
const CPU_BATCH_CAP: u64 = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MemoryMode {
    High,
    Medium,
    Low,
    /// Ignore GPUs entirely
    Cpu,
}

impl MemoryMode {
    /// Share of VRAM and RAM the plan may use
    pub fn multiplier(self) -> f64 {
        match self {
            Self::High | Self::Cpu => 0.7,
            Self::Medium => 0.5,
            Self::Low => 0.4,
        }
    }
}

impl FromStr for MemoryMode {
    type Err = GgufError;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "high" => Ok(Self::High),
            "medium" => Ok(Self::Medium),
            "low" => Ok(Self::Low),
            "cpu" => Ok(Self::Cpu),
            other => Err(GgufError::InvalidArgument(format!(
                "Invalid memory mode '{}' (expected high, medium, low or cpu)",
                other
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelMode {
    Unsupported,
    #[serde(rename = "CPU")]
    Cpu,
    Hybrid,
    #[serde(rename = "GPU")]
    Gpu,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ModelPlan {
    pub gpu_layers: u64,
    pub max_context_length: u64,
    #[serde(rename = "noOffloadKVCache")]
    pub no_offload_kv_cache: bool,
    pub offload_mmproj: bool,
    pub batch_size: u64,
    pub mode: ModelMode,
}

impl ModelPlan {
    pub fn unsupported() -> Self {
        Self {
            gpu_layers: 0,
            max_context_length: 0,
            no_offload_kv_cache: true,
            offload_mmproj: false,
            batch_size: MIN_BATCH,
            mode: ModelMode::Unsupported,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ModelSupport {
    Red,
    Yellow,
    Green,
}

/// Everything the planner needs to know about the model and the request
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlanInputs {
    pub model_size: u64,
    pub mmproj_size: u64,
    /// Repeating blocks plus the output layer
    pub total_layers: u64,
    pub native_context: u64,
    pub kv_per_token: u64,
    pub requested_context: Option<u64>,
    pub memory_mode: MemoryMode,
}

impl PlanInputs {
    pub fn from_metadata(
        meta: &GgufMetadata,
        model_size: u64,
        mmproj_size: u64,
        requested_context: Option<u64>,
        memory_mode: MemoryMode,
    ) -> Result<Self> {
        let total_layers = meta.require_arch_u64("block_count")? + 1;
        let native_context = meta
            .arch_u64("context_length")
            .filter(|ctx| *ctx > 0)
            .unwrap_or(DEFAULT_CONTEXT_LENGTH);
        let kv_per_token = KvCacheEstimator::default().per_token_size(meta, KvCacheTypes::default())?;

        if model_size == 0 || kv_per_token == 0 {
            return Err(GgufError::InvalidArgument(format!(
                "Invalid model/cache sizes: model {} bytes, kv {} bytes/token",
                model_size, kv_per_token
            )));
        }

        Ok(Self {
            model_size,
            mmproj_size,
            total_layers,
            native_context,
            kv_per_token,
            requested_context,
            memory_mode,
        })
    }

    /// Models with a native window under 1024 tokens are planned at that window
    pub fn min_context(&self) -> u64 {
        MIN_CONTEXT_LENGTH.min(self.native_context)
    }

    /// Requested context capped at the native one, never below [`Self::min_context`]
    pub fn target_context(&self) -> u64 {
        let target = match self.requested_context {
            Some(ctx) if ctx > 0 => ctx.min(self.native_context),
            _ => self.native_context,
        };
        target.max(self.min_context())
    }

    fn layer_size(&self) -> u64 {
        self.model_size / self.total_layers.max(1)
    }
}

/// Largest power of two of tokens that fits in `headroom`, clamped to `[64, cap]`
fn batch_size(headroom: u64, per_token: u64, cap: u64) -> u64 {
    let tokens = headroom / per_token.max(1);
    let pow2 = if tokens == 0 {
        0
    } else {
        1u64 << (63 - tokens.leading_zeros())
    };
    pow2.clamp(MIN_BATCH, cap)
}

/// Decide placement for `inputs` on `hw`.
///
/// Tries, in order: everything on the GPU, the highest GPU layer split that
/// still leaves room for a minimum KV cache, CPU only. Adding VRAM never
/// lowers `gpu_layers` or the mode.
pub fn plan_from_inputs(inputs: &PlanInputs, hw: &HardwareSnapshot) -> ModelPlan {
    let mode = inputs.memory_mode;
    let multiplier = mode.multiplier();

    let usable_vram = if mode == MemoryMode::Cpu {
        0
    } else {
        let free = (hw.total_free_vram_mb() * MIB) as f64;
        (free * multiplier - VRAM_RESERVE_BYTES as f64 - ENGINE_OVERHEAD_BYTES as f64).max(0.0) as u64
    };
    let usable_ram = ((hw.total_ram_mb * MIB) as f64 * multiplier) as u64;

    log::info!(
        "Planning load: model {} B, mmproj {} B, {} layers, {} B/token, usable VRAM {} B, usable RAM {} B",
        inputs.model_size,
        inputs.mmproj_size,
        inputs.total_layers,
        inputs.kv_per_token,
        usable_vram,
        usable_ram
    );

    let plan = plan_gpu(inputs, usable_vram)
        .or_else(|| plan_hybrid(inputs, usable_vram, usable_ram))
        .or_else(|| plan_cpu(inputs, usable_ram))
        .filter(|plan| plan.max_context_length >= inputs.min_context())
        .unwrap_or_else(ModelPlan::unsupported);

    log::info!(
        "Planned model load: mode {:?}, gpu layers {}, max ctx {}, no kv offload {}, offload mmproj {}, batch {}",
        plan.mode,
        plan.gpu_layers,
        plan.max_context_length,
        plan.no_offload_kv_cache,
        plan.offload_mmproj,
        plan.batch_size
    );
    plan
}

fn plan_gpu(inputs: &PlanInputs, vram: u64) -> Option<ModelPlan> {
    let per_token = inputs.kv_per_token;
    let weights = inputs.model_size + inputs.mmproj_size;
    let kv_min = per_token * inputs.min_context();
    if vram == 0 || weights + kv_min > vram {
        return None;
    }

    let left = vram - weights;
    let ctx = inputs.target_context().min(left / per_token);
    Some(ModelPlan {
        gpu_layers: inputs.total_layers,
        max_context_length: ctx,
        no_offload_kv_cache: false,
        offload_mmproj: inputs.mmproj_size > 0,
        batch_size: batch_size(left - ctx * per_token, per_token, GPU_BATCH_CAP),
        mode: ModelMode::Gpu,
    })
}

fn plan_hybrid(inputs: &PlanInputs, vram: u64, ram: u64) -> Option<ModelPlan> {
    if vram == 0 {
        return None;
    }
    let per_token = inputs.kv_per_token;
    let layer_size = inputs.layer_size();
    let min_ctx = inputs.min_context();
    let target = inputs.target_context();

    for gpu_layers in (1..inputs.total_layers).rev() {
        let on_gpu = gpu_layers * layer_size;
        let on_cpu = (inputs.total_layers - gpu_layers) * layer_size + inputs.mmproj_size;
        if on_gpu > vram || on_cpu > ram {
            continue;
        }

        let vram_left = vram - on_gpu;
        let ram_left = ram - on_cpu;

        if vram_left / per_token >= min_ctx {
            let ctx = target.min(vram_left / per_token);
            let vram_after = vram_left - ctx * per_token;
            let offload_mmproj = inputs.mmproj_size > 0 && vram_after >= inputs.mmproj_size;
            let headroom = if offload_mmproj {
                vram_after - inputs.mmproj_size
            } else {
                vram_after
            };
            return Some(ModelPlan {
                gpu_layers,
                max_context_length: ctx,
                no_offload_kv_cache: false,
                offload_mmproj,
                batch_size: batch_size(headroom, per_token, HYBRID_BATCH_CAP),
                mode: ModelMode::Hybrid,
            });
        }

        if ram_left / per_token >= min_ctx {
            let ctx = target.min(ram_left / per_token);
            return Some(ModelPlan {
                gpu_layers,
                max_context_length: ctx,
                no_offload_kv_cache: true,
                offload_mmproj: false,
                batch_size: batch_size(ram_left - ctx * per_token, per_token, HYBRID_BATCH_CAP),
                mode: ModelMode::Hybrid,
            });
        }
    }
    None
}

fn plan_cpu(inputs: &PlanInputs, ram: u64) -> Option<ModelPlan> {
    let per_token = inputs.kv_per_token;
    let weights = inputs.model_size + inputs.mmproj_size;
    if weights > ram {
        return None;
    }
    let ram_left = ram - weights;
    if ram_left / per_token < inputs.min_context() {
        return None;
    }

    let ctx = inputs.target_context().min(ram_left / per_token);
    Some(ModelPlan {
        gpu_layers: 0,
        max_context_length: ctx,
        no_offload_kv_cache: true,
        offload_mmproj: false,
        batch_size: batch_size(ram_left - ctx * per_token, per_token, CPU_BATCH_CAP),
        mode: ModelMode::Cpu,
    })
}

/// Traffic-light view of a plan made in `high` mode
pub fn support_from_plan(inputs: &PlanInputs, plan: &ModelPlan) -> ModelSupport {
    match plan.mode {
        ModelMode::Unsupported => ModelSupport::Red,
        ModelMode::Gpu if plan.max_context_length >= inputs.target_context() => ModelSupport::Green,
        _ => ModelSupport::Yellow,
    }
}

/// File size in bytes
pub async fn get_model_size(path: impl AsRef<Path>) -> Result<u64> {
    let path = path.as_ref();
    match tokio::fs::metadata(path).await {
        Ok(meta) => Ok(meta.len()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            Err(GgufError::FileNotFound(path.display().to_string()))
        }
        Err(e) => Err(GgufError::Io(e)),
    }
}

async fn gather_inputs(
    path: &Path,
    memory_mode: MemoryMode,
    mmproj_path: Option<&Path>,
    requested_context: Option<u64>,
) -> Result<PlanInputs> {
    let model_size = get_model_size(path).await?;
    let mmproj_size = match mmproj_path {
        Some(mmproj) => get_model_size(mmproj).await?,
        None => 0,
    };
    let meta = read_gguf_metadata_async(path).await?;
    PlanInputs::from_metadata(&meta, model_size, mmproj_size, requested_context, memory_mode)
}

/// Plan how to load the model at `path` on the hardware `probe` reports now.
pub async fn plan_model_load(
    probe: &dyn HardwareProbe,
    path: impl AsRef<Path>,
    memory_mode: &str,
    mmproj_path: Option<&Path>,
    requested_context: Option<u64>,
) -> Result<ModelPlan> {
    let memory_mode: MemoryMode = memory_mode.parse()?;
    let inputs = gather_inputs(path.as_ref(), memory_mode, mmproj_path, requested_context).await?;
    let snapshot = probe.snapshot().await?;
    Ok(plan_from_inputs(&inputs, &snapshot))
}

/// RED / YELLOW / GREEN for loading `path` with `ctx_size` tokens
pub async fn is_model_supported(
    probe: &dyn HardwareProbe,
    path: impl AsRef<Path>,
    ctx_size: Option<u64>,
) -> Result<ModelSupport> {
    let inputs = gather_inputs(path.as_ref(), MemoryMode::High, None, ctx_size).await?;
    let snapshot = probe.snapshot().await?;
    let plan = plan_from_inputs(&inputs, &snapshot);
    Ok(support_from_plan(&inputs, &plan))
}
