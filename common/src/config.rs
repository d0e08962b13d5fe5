//! Run configuration for a single llama.cpp server.
//!
//! User-supplied settings arrive loosely typed (numbers as strings, booleans
//! as `1`/`"true"`, missing keys). [`LlamacppConfig::normalize`] coerces them
//! into a fully-typed record once; nothing downstream re-coerces.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::errors::{ConfigError, Result};

/// Normalized run configuration. Every field has a documented default.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LlamacppConfig {
    pub version_backend: String,
    pub auto_update_engine: bool,
    pub auto_unload: bool,
    pub timeout: i32,
    pub llamacpp_env: String,
    pub fit: String,
    pub fit_target: String,
    pub fit_ctx: String,
    pub memory_util: String,
    pub chat_template: String,
    pub n_gpu_layers: i32,
    pub offload_mmproj: bool,
    pub cpu_moe: bool,
    pub n_cpu_moe: i32,
    pub override_tensor_buffer_t: String,
    pub ctx_size: i32,
    pub threads: i32,
    pub threads_batch: i32,
    pub n_predict: i32,
    pub batch_size: i32,
    pub ubatch_size: i32,
    pub device: String,
    pub split_mode: String,
    pub main_gpu: i32,
    pub flash_attn: String,
    pub cont_batching: bool,
    pub no_mmap: bool,
    pub mlock: bool,
    pub no_kv_offload: bool,
    pub cache_type_k: String,
    pub cache_type_v: String,
    pub defrag_thold: f32,
    pub rope_scaling: String,
    pub rope_scale: f32,
    pub rope_freq_base: f32,
    pub rope_freq_scale: f32,
    pub ctx_shift: bool,
}

impl Default for LlamacppConfig {
    fn default() -> Self {
        Self {
            version_backend: String::new(),
            auto_update_engine: true,
            auto_unload: true,
            timeout: 600,
            llamacpp_env: String::new(),
            fit: String::new(),
            fit_target: String::new(),
            fit_ctx: String::new(),
            memory_util: "high".to_string(),
            chat_template: String::new(),
            n_gpu_layers: 100,
            offload_mmproj: true,
            cpu_moe: false,
            n_cpu_moe: 0,
            override_tensor_buffer_t: String::new(),
            ctx_size: 8192,
            threads: 0,
            threads_batch: 0,
            n_predict: 0,
            batch_size: 2048,
            ubatch_size: 512,
            device: String::new(),
            split_mode: "layer".to_string(),
            main_gpu: 0,
            flash_attn: "auto".to_string(),
            cont_batching: true,
            no_mmap: false,
            mlock: false,
            no_kv_offload: false,
            cache_type_k: "f16".to_string(),
            cache_type_v: "f16".to_string(),
            defrag_thold: 0.1,
            rope_scaling: "none".to_string(),
            rope_scale: 1.0,
            rope_freq_base: 0.0,
            rope_freq_scale: 1.0,
            ctx_shift: false,
        }
    }
}

impl LlamacppConfig {
    /// Coerce a loosely-typed JSON object into a typed config.
    ///
    /// Missing or `null` keys take their default. Numbers accept JSON numbers
    /// and numeric strings, falling back to the default when unparsable.
    /// Booleans are `true` only for `true`, `"true"`, `1` and `"1"`. Strings
    /// fall back to the default when absent, empty or not a string.
    ///
    /// Normalizing the serialized form of a normalized config yields the same
    /// config.
    pub fn normalize(raw: &Value) -> Self {
        let d = Self::default();
        let field = |name: &str| raw.get(name).filter(|v| !v.is_null());

        Self {
            version_backend: coerce_string(field("version_backend"), &d.version_backend),
            auto_update_engine: coerce_bool(field("auto_update_engine"), d.auto_update_engine),
            auto_unload: coerce_bool(field("auto_unload"), d.auto_unload),
            timeout: coerce_i32(field("timeout"), d.timeout),
            llamacpp_env: coerce_string(field("llamacpp_env"), &d.llamacpp_env),
            fit: coerce_string(field("fit"), &d.fit),
            fit_target: coerce_string(field("fit_target"), &d.fit_target),
            fit_ctx: coerce_string(field("fit_ctx"), &d.fit_ctx),
            memory_util: coerce_string(field("memory_util"), &d.memory_util),
            chat_template: coerce_string(field("chat_template"), &d.chat_template),
            n_gpu_layers: coerce_i32(field("n_gpu_layers"), d.n_gpu_layers),
            offload_mmproj: coerce_bool(field("offload_mmproj"), d.offload_mmproj),
            cpu_moe: coerce_bool(field("cpu_moe"), d.cpu_moe),
            n_cpu_moe: coerce_i32(field("n_cpu_moe"), d.n_cpu_moe),
            override_tensor_buffer_t: coerce_string(
                field("override_tensor_buffer_t"),
                &d.override_tensor_buffer_t,
            ),
            ctx_size: coerce_i32(field("ctx_size"), d.ctx_size),
            threads: coerce_i32(field("threads"), d.threads),
            threads_batch: coerce_i32(field("threads_batch"), d.threads_batch),
            n_predict: coerce_i32(field("n_predict"), d.n_predict),
            batch_size: coerce_i32(field("batch_size"), d.batch_size),
            ubatch_size: coerce_i32(field("ubatch_size"), d.ubatch_size),
            device: coerce_string(field("device"), &d.device),
            split_mode: coerce_string(field("split_mode"), &d.split_mode),
            main_gpu: coerce_i32(field("main_gpu"), d.main_gpu),
            flash_attn: coerce_string(field("flash_attn"), &d.flash_attn),
            cont_batching: coerce_bool(field("cont_batching"), d.cont_batching),
            no_mmap: coerce_bool(field("no_mmap"), d.no_mmap),
            mlock: coerce_bool(field("mlock"), d.mlock),
            no_kv_offload: coerce_bool(field("no_kv_offload"), d.no_kv_offload),
            cache_type_k: coerce_string(field("cache_type_k"), &d.cache_type_k),
            cache_type_v: coerce_string(field("cache_type_v"), &d.cache_type_v),
            defrag_thold: coerce_f32(field("defrag_thold"), d.defrag_thold),
            rope_scaling: coerce_string(field("rope_scaling"), &d.rope_scaling),
            rope_scale: coerce_f32(field("rope_scale"), d.rope_scale),
            rope_freq_base: coerce_f32(field("rope_freq_base"), d.rope_freq_base),
            rope_freq_scale: coerce_f32(field("rope_freq_scale"), d.rope_freq_scale),
            ctx_shift: coerce_bool(field("ctx_shift"), d.ctx_shift),
        }
    }

    /// Split `version_backend` (`"<version>/<backend>"`) into its parts.
    pub fn backend_parts(&self) -> Result<(&str, &str)> {
        let mut parts = self.version_backend.split('/');
        match (parts.next(), parts.next(), parts.next()) {
            (Some(version), Some(backend), None)
                if !version.trim().is_empty() && !backend.trim().is_empty() =>
            {
                Ok((version.trim(), backend.trim()))
            }
            _ => Err(ConfigError::InvalidArgument(format!(
                "version_backend must look like '<version>/<backend>', got '{}'",
                self.version_backend
            ))),
        }
    }

    /// Parse `llamacpp_env` (`KEY=VALUE;KEY2=VALUE2`) into pairs.
    ///
    /// Blank segments are ignored. A segment without `=` or with an empty key
    /// is rejected.
    pub fn env_overrides(&self) -> Result<Vec<(String, String)>> {
        let mut pairs = Vec::new();
        for segment in self.llamacpp_env.split(';') {
            let segment = segment.trim();
            if segment.is_empty() {
                continue;
            }
            match segment.split_once('=') {
                Some((key, value)) if !key.trim().is_empty() => {
                    pairs.push((key.trim().to_string(), value.trim().to_string()));
                }
                _ => return Err(ConfigError::InvalidEnv(segment.to_string())),
            }
        }
        Ok(pairs)
    }
}

fn coerce_bool(value: Option<&Value>, default: bool) -> bool {
    match value {
        None => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_i64() == Some(1) || n.as_f64() == Some(1.0),
        Some(Value::String(s)) => s == "true" || s == "1",
        Some(_) => false,
    }
}

fn coerce_i32(value: Option<&Value>, default: i32) -> i32 {
    let parsed = match value {
        Some(Value::Number(n)) => n
            .as_i64()
            .or_else(|| n.as_f64().filter(|f| f.is_finite()).map(|f| f.trunc() as i64)),
        Some(Value::String(s)) => {
            let s = s.trim();
            s.parse::<i64>().ok().or_else(|| {
                s.parse::<f64>()
                    .ok()
                    .filter(|f| f.is_finite())
                    .map(|f| f.trunc() as i64)
            })
        }
        _ => None,
    };
    parsed
        .and_then(|v| i32::try_from(v).ok())
        .unwrap_or(default)
}

fn coerce_f32(value: Option<&Value>, default: f32) -> f32 {
    let parsed = match value {
        Some(Value::Number(n)) => n.as_f64(),
        Some(Value::String(s)) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    parsed
        .map(|v| v as f32)
        .filter(|v| v.is_finite())
        .unwrap_or(default)
}

fn coerce_string(value: Option<&Value>, default: &str) -> String {
    match value {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        _ => default.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_empty_object_gives_defaults() {
        let config = LlamacppConfig::normalize(&json!({}));
        assert_eq!(config, LlamacppConfig::default());
        assert_eq!(config.timeout, 600);
        assert_eq!(config.rope_scale, 1.0);
        assert!(config.cont_batching);
    }

    #[test]
    fn test_non_object_gives_defaults() {
        assert_eq!(LlamacppConfig::normalize(&json!(null)), LlamacppConfig::default());
        assert_eq!(LlamacppConfig::normalize(&json!([1, 2])), LlamacppConfig::default());
    }

    #[test]
    fn test_bool_coercion() {
        let truthy = [json!(true), json!("true"), json!(1), json!("1")];
        for v in truthy {
            let config = LlamacppConfig::normalize(&json!({ "mlock": v }));
            assert!(config.mlock);
        }

        let falsy = [json!(false), json!("yes"), json!(0), json!("TRUE"), json!(2), json!({})];
        for v in falsy {
            let config = LlamacppConfig::normalize(&json!({ "cont_batching": v }));
            assert!(!config.cont_batching);
        }
    }

    #[test]
    fn test_number_coercion() {
        let config = LlamacppConfig::normalize(&json!({
            "ctx_size": "4096",
            "threads": 7.9,
            "batch_size": "not a number",
            "rope_scale": "2.5",
            "defrag_thold": [],
            "n_gpu_layers": 1e12,
        }));
        assert_eq!(config.ctx_size, 4096);
        assert_eq!(config.threads, 7);
        assert_eq!(config.batch_size, 2048);
        assert_eq!(config.rope_scale, 2.5);
        assert_eq!(config.defrag_thold, 0.1);
        assert_eq!(config.n_gpu_layers, 100);
    }

    #[test]
    fn test_string_fallbacks() {
        let config = LlamacppConfig::normalize(&json!({
            "split_mode": "",
            "flash_attn": 3,
            "device": "CUDA0,CUDA1",
        }));
        assert_eq!(config.split_mode, "layer");
        assert_eq!(config.flash_attn, "auto");
        assert_eq!(config.device, "CUDA0,CUDA1");
    }

    #[test]
    fn test_backend_parts() {
        let mut config = LlamacppConfig::default();
        config.version_backend = "b7523/linux-cuda-12-common_cpus-x64".to_string();
        assert_eq!(
            config.backend_parts().unwrap(),
            ("b7523", "linux-cuda-12-common_cpus-x64")
        );

        config.version_backend = "b7523".to_string();
        assert!(config.backend_parts().is_err());
    }

    #[test]
    fn test_env_overrides() {
        let mut config = LlamacppConfig::default();
        config.llamacpp_env = "GGML_VK_VISIBLE_DEVICES=0; CUDA_VISIBLE_DEVICES=1;;".to_string();
        let pairs = config.env_overrides().unwrap();
        assert_eq!(
            pairs,
            vec![
                ("GGML_VK_VISIBLE_DEVICES".to_string(), "0".to_string()),
                ("CUDA_VISIBLE_DEVICES".to_string(), "1".to_string()),
            ]
        );

        config.llamacpp_env = "BROKEN".to_string();
        assert!(matches!(config.env_overrides(), Err(ConfigError::InvalidEnv(_))));
    }
}
