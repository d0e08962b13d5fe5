//! KV-cache size estimation from GGUF metadata.
//!
//! The bytes-per-token figure depends on the attention layout, so the formula
//! is chosen per architecture through [`KvCacheFormula`]. Standard multi-head
//! / grouped-query attention is the fallback for every architecture; models
//! with compressed latent KV (DeepSeek V2/V3, Kimi) plug in their own.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

use crate::reader::GgufMetadata;
use crate::{GgufError, Result};

/// Quantization of the K or V cache. Sizes are bytes per 32 elements.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheType {
    F32,
    F16,
    Bf16,
    Q8_0,
    Q5_1,
    Q5_0,
    Q4_1,
    Q4_0,
    Iq4Nl,
}

impl CacheType {
    fn bytes_per_32(self) -> u64 {
        match self {
            Self::F32 => 128,
            Self::F16 | Self::Bf16 => 64,
            Self::Q8_0 => 34,
            Self::Q5_1 => 24,
            Self::Q5_0 => 22,
            Self::Q4_1 => 20,
            Self::Q4_0 | Self::Iq4Nl => 18,
        }
    }

    pub fn name(self) -> &'static str {
        match self {
            Self::F32 => "f32",
            Self::F16 => "f16",
            Self::Bf16 => "bf16",
            Self::Q8_0 => "q8_0",
            Self::Q5_1 => "q5_1",
            Self::Q5_0 => "q5_0",
            Self::Q4_1 => "q4_1",
            Self::Q4_0 => "q4_0",
            Self::Iq4Nl => "iq4_nl",
        }
    }
}

impl fmt::Display for CacheType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for CacheType {
    type Err = GgufError;

    fn from_str(s: &str) -> Result<Self> {
        Ok(match s.trim().to_lowercase().as_str() {
            "f32" => Self::F32,
            "f16" => Self::F16,
            "bf16" => Self::Bf16,
            "q8_0" => Self::Q8_0,
            "q5_1" => Self::Q5_1,
            "q5_0" => Self::Q5_0,
            "q4_1" => Self::Q4_1,
            "q4_0" => Self::Q4_0,
            "iq4_nl" => Self::Iq4Nl,
            other => {
                return Err(GgufError::InvalidArgument(format!(
                    "unknown cache type '{}'",
                    other
                )))
            }
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheTypes {
    pub k: CacheType,
    pub v: CacheType,
}

impl Default for KvCacheTypes {
    fn default() -> Self {
        Self {
            k: CacheType::F16,
            v: CacheType::F16,
        }
    }
}

impl KvCacheTypes {
    /// From the `cache_type_k` / `cache_type_v` strings of a run configuration
    pub fn from_config(config: &common::LlamacppConfig) -> Result<Self> {
        Ok(Self {
            k: config.cache_type_k.parse()?,
            v: config.cache_type_v.parse()?,
        })
    }
}

/// Sizes in bytes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct KvCacheEstimate {
    pub size: u64,
    pub per_token_size: u64,
}

/// Per-architecture bytes-per-token formula
pub trait KvCacheFormula: Send + Sync {
    fn name(&self) -> &'static str;

    fn applies_to(&self, arch: &str) -> bool;

    fn per_token_size(&self, meta: &GgufMetadata, types: KvCacheTypes) -> Result<u64>;
}

/// `n_layer * n_head_kv * (key_len * bytes_k + value_len * bytes_v)`
#[derive(Debug, Clone, Copy, Default)]
pub struct StandardAttention;

impl KvCacheFormula for StandardAttention {
    fn name(&self) -> &'static str {
        "standard"
    }

    fn applies_to(&self, _arch: &str) -> bool {
        true
    }

    fn per_token_size(&self, meta: &GgufMetadata, types: KvCacheTypes) -> Result<u64> {
        let n_layer = meta.require_arch_u64("block_count")?;
        let n_head_kv = match meta.arch_u64("attention.head_count_kv") {
            Some(n) => n,
            None => meta.require_arch_u64("attention.head_count")?,
        };

        let key_len = match meta.arch_u64("attention.key_length") {
            Some(len) => len,
            None => {
                let embd = meta.require_arch_u64("embedding_length")?;
                let heads = meta.require_arch_u64("attention.head_count")?;
                if heads == 0 {
                    return Err(GgufError::MissingMetadataField(format!(
                        "{}.attention.head_count",
                        meta.architecture()?
                    )));
                }
                embd / heads
            }
        };
        let value_len = meta.arch_u64("attention.value_length").unwrap_or(key_len);

        let per_head_32 = checked_product(&[key_len, types.k.bytes_per_32()])?
            .checked_add(checked_product(&[value_len, types.v.bytes_per_32()])?)
            .ok_or_else(overflow)?;
        Ok(ceil_div32(checked_product(&[n_layer, n_head_kv, per_head_32])?))
    }
}

/// Multi-latent attention caches one compressed vector per layer:
/// `n_layer * (kv_lora_rank + rope_dim) * bytes_k`
#[derive(Debug, Clone, Copy, Default)]
pub struct MultiLatentAttention;

const MLA_ARCHITECTURES: &[&str] = &["deepseek2", "deepseek3", "kimi"];

impl KvCacheFormula for MultiLatentAttention {
    fn name(&self) -> &'static str {
        "multi-latent"
    }

    fn applies_to(&self, arch: &str) -> bool {
        MLA_ARCHITECTURES.iter().any(|prefix| arch.starts_with(prefix))
    }

    fn per_token_size(&self, meta: &GgufMetadata, types: KvCacheTypes) -> Result<u64> {
        let n_layer = meta.require_arch_u64("block_count")?;
        let rank = meta.require_arch_u64("attention.kv_lora_rank")?;
        let rope_dim = meta.require_arch_u64("rope.dimension_count")?;
        let width = rank.checked_add(rope_dim).ok_or_else(overflow)?;
        Ok(ceil_div32(checked_product(&[n_layer, width, types.k.bytes_per_32()])?))
    }
}

fn overflow() -> GgufError {
    GgufError::InvalidFormat("KV cache dimensions overflow".to_string())
}

/// Header values are untrusted; an overflowing size is a malformed file
fn checked_product(factors: &[u64]) -> Result<u64> {
    factors
        .iter()
        .try_fold(1u64, |acc, f| acc.checked_mul(*f))
        .ok_or_else(overflow)
}

fn ceil_div32(x: u64) -> u64 {
    x.div_ceil(32)
}

/// Ordered set of formulas; the first one that applies wins.
pub struct KvCacheEstimator {
    formulas: Vec<Box<dyn KvCacheFormula>>,
}

impl Default for KvCacheEstimator {
    fn default() -> Self {
        Self {
            formulas: vec![Box::new(MultiLatentAttention), Box::new(StandardAttention)],
        }
    }
}

impl KvCacheEstimator {
    /// Register a formula ahead of the built-in ones
    pub fn with_formula(mut self, formula: Box<dyn KvCacheFormula>) -> Self {
        self.formulas.insert(0, formula);
        self
    }

    pub fn formula_for(&self, arch: &str) -> &dyn KvCacheFormula {
        self.formulas
            .iter()
            .find(|f| f.applies_to(arch))
            .map(|f| f.as_ref())
            .unwrap_or(&StandardAttention)
    }

    pub fn per_token_size(&self, meta: &GgufMetadata, types: KvCacheTypes) -> Result<u64> {
        let arch = meta.architecture()?;
        let formula = self.formula_for(arch);
        log::debug!("KV formula for {}: {}", arch, formula.name());
        formula.per_token_size(meta, types)
    }

    /// `ctx_size` of `None` or `0` means the model's native context length
    pub fn estimate(
        &self,
        meta: &GgufMetadata,
        ctx_size: Option<u64>,
        types: KvCacheTypes,
    ) -> Result<KvCacheEstimate> {
        let per_token_size = self.per_token_size(meta, types)?;
        let ctx = match ctx_size {
            Some(ctx) if ctx > 0 => ctx,
            _ => meta.require_arch_u64("context_length")?,
        };
        Ok(KvCacheEstimate {
            size: per_token_size.saturating_mul(ctx),
            per_token_size,
        })
    }
}

/// KV-cache size with an f16 cache for `ctx_size` tokens (native context when `None`)
pub fn estimate_kv_cache_size(meta: &GgufMetadata, ctx_size: Option<u64>) -> Result<KvCacheEstimate> {
    KvCacheEstimator::default().estimate(meta, ctx_size, KvCacheTypes::default())
}
