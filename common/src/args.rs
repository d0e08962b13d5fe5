//! Command-line construction for `llama-server`.
//!
//! Flags are only emitted when they differ from the server's own defaults so
//! the command line stays short and readable in logs.

use crate::config::LlamacppConfig;
use crate::errors::Result;

/// Builds the `llama-server` argument vector from a normalized config.
pub struct ArgumentBuilder {
    args: Vec<String>,
    config: LlamacppConfig,
    backend: String,
    is_embedding: bool,
}

impl ArgumentBuilder {
    /// Fails when `version_backend` is not `<version>/<backend>`.
    pub fn new(config: LlamacppConfig, is_embedding: bool) -> Result<Self> {
        let backend = config.backend_parts()?.1.to_string();

        Ok(Self {
            args: Vec::new(),
            config,
            backend,
            is_embedding,
        })
    }

    /// Forks such as `ik_llama.cpp` lag behind upstream flags.
    fn is_ik_fork(&self) -> bool {
        self.backend.starts_with("ik")
    }

    pub fn build(
        mut self,
        model_id: &str,
        model_path: &str,
        port: u16,
        mmproj_path: Option<&str>,
    ) -> Vec<String> {
        if !self.is_ik_fork() {
            self.push("--no-webui");
        }
        self.push("--jinja");
        self.push_pair("-m", model_path);

        self.add_cpu_moe_args();
        self.add_tensor_buffer_override();
        if let Some(path) = mmproj_path.filter(|p| !p.is_empty()) {
            self.push_pair("--mmproj", path);
        }

        self.push_pair("-a", model_id);
        self.push_pair("--port", port.to_string());

        if !self.config.chat_template.is_empty() {
            let template = self.config.chat_template.clone();
            self.push_pair("--chat-template", template);
        }

        self.add_gpu_layers();
        self.add_thread_settings();
        self.add_batch_settings();
        self.add_device_settings();
        self.add_flash_attention();
        self.add_boolean_flags();

        if self.is_embedding {
            self.push("--embedding");
            self.push_pair("--pooling", "mean");
        } else {
            self.add_text_generation_args();
        }

        if !self.is_ik_fork() {
            self.add_fit_settings();
        }

        tracing::debug!("llama-server args: {:?}", self.args);
        self.args
    }

    fn push(&mut self, flag: &str) {
        self.args.push(flag.to_string());
    }

    fn push_pair(&mut self, flag: &str, value: impl Into<String>) {
        self.args.push(flag.to_string());
        self.args.push(value.into());
    }

    fn add_cpu_moe_args(&mut self) {
        if self.config.cpu_moe {
            self.push("--cpu-moe");
        }
        if self.config.n_cpu_moe > 0 {
            let n = self.config.n_cpu_moe.to_string();
            self.push_pair("--n-cpu-moe", n);
        }
    }

    fn add_tensor_buffer_override(&mut self) {
        if !self.config.override_tensor_buffer_t.is_empty() {
            let value = self.config.override_tensor_buffer_t.clone();
            self.push_pair("--override-tensor", value);
        }
    }

    fn add_gpu_layers(&mut self) {
        // 100 is the UI's "all layers"
        let gpu_layers = if self.config.n_gpu_layers >= 0 && self.config.n_gpu_layers != 100 {
            self.config.n_gpu_layers
        } else {
            -1
        };
        self.push_pair("-ngl", gpu_layers.to_string());
    }

    fn add_thread_settings(&mut self) {
        if self.config.threads > 0 {
            let n = self.config.threads.to_string();
            self.push_pair("--threads", n);
        }
        if self.config.threads_batch > 0 {
            let n = self.config.threads_batch.to_string();
            self.push_pair("--threads-batch", n);
        }
    }

    fn add_batch_settings(&mut self) {
        if self.config.batch_size > 0 && self.config.batch_size != 2048 {
            let n = self.config.batch_size.to_string();
            self.push_pair("--batch-size", n);
        }
        if self.config.ubatch_size > 0 && self.config.ubatch_size != 512 {
            let n = self.config.ubatch_size.to_string();
            self.push_pair("--ubatch-size", n);
        }
    }

    fn add_device_settings(&mut self) {
        if !self.config.device.is_empty() {
            let device = self.config.device.clone();
            self.push_pair("--device", device);
        }
        if !self.config.split_mode.is_empty() && self.config.split_mode != "layer" {
            let mode = self.config.split_mode.clone();
            self.push_pair("--split-mode", mode);
        }
        if self.config.main_gpu != 0 {
            let gpu = self.config.main_gpu.to_string();
            self.push_pair("--main-gpu", gpu);
        }
    }

    fn add_flash_attention(&mut self) {
        if self.is_ik_fork() {
            if self.config.flash_attn == "on" {
                self.push("-fa");
            }
        } else if !self.config.flash_attn.is_empty() && self.config.flash_attn != "auto" {
            let value = self.config.flash_attn.clone();
            self.push_pair("--flash-attn", value);
        }
    }

    fn add_boolean_flags(&mut self) {
        if self.config.ctx_shift {
            self.push("--context-shift");
        }
        if self.config.cont_batching {
            self.push("--cont-batching");
        }
        if self.config.no_mmap {
            self.push("--no-mmap");
        }
        if self.config.mlock {
            self.push("--mlock");
        }
        if self.config.no_kv_offload {
            self.push("--no-kv-offload");
        }
    }

    fn add_text_generation_args(&mut self) {
        if self.config.ctx_size > 0 && self.config.ctx_size != 8192 {
            let n = self.config.ctx_size.to_string();
            self.push_pair("--ctx-size", n);
        }
        if self.config.n_predict > 0 {
            let n = self.config.n_predict.to_string();
            self.push_pair("--n-predict", n);
        }
        if !self.config.cache_type_k.is_empty() && self.config.cache_type_k != "f16" {
            let value = self.config.cache_type_k.clone();
            self.push_pair("--cache-type-k", value);
        }

        // Quantized V cache requires flash attention
        let v = self.config.cache_type_v.as_str();
        if self.config.flash_attn == "on" && !v.is_empty() && v != "f16" && v != "f32" {
            let value = v.to_string();
            self.push_pair("--cache-type-v", value);
        }

        if (self.config.defrag_thold - 0.1).abs() > f32::EPSILON {
            let value = self.config.defrag_thold.to_string();
            self.push_pair("--defrag-thold", value);
        }

        self.add_rope_settings();
    }

    fn add_rope_settings(&mut self) {
        if !self.config.rope_scaling.is_empty() && self.config.rope_scaling != "none" {
            let value = self.config.rope_scaling.clone();
            self.push_pair("--rope-scaling", value);
        }
        if (self.config.rope_scale - 1.0).abs() > f32::EPSILON {
            let value = self.config.rope_scale.to_string();
            self.push_pair("--rope-scale", value);
        }
        if self.config.rope_freq_base != 0.0 {
            let value = self.config.rope_freq_base.to_string();
            self.push_pair("--rope-freq-base", value);
        }
        if (self.config.rope_freq_scale - 1.0).abs() > f32::EPSILON {
            let value = self.config.rope_freq_scale.to_string();
            self.push_pair("--rope-freq-scale", value);
        }
    }

    fn add_fit_settings(&mut self) {
        match self.config.fit.as_str() {
            "off" => self.push_pair("--fit", "off"),
            "on" => {
                self.push_pair("--fit", "on");
                if !self.config.fit_ctx.is_empty() && self.config.fit_ctx != "4096" {
                    let value = self.config.fit_ctx.clone();
                    self.push_pair("--fit-ctx", value);
                }
                if !self.config.fit_target.is_empty() && self.config.fit_target != "1024" {
                    let value = self.config.fit_target.clone();
                    self.push_pair("--fit-target", value);
                }
            }
            _ => {}
        }
    }
}
