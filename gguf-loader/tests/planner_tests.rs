//! Load planning against fixed hardware snapshots

mod fixtures;

use fixtures::{gguf_bytes, llama_entries, write_gguf};
use gguf_loader::{
    get_model_size, is_model_supported, parse_gguf_metadata, plan_from_inputs, plan_model_load,
    GgufError, GgufMetadata, MemoryMode, ModelMode, ModelPlan, ModelSupport, PlanInputs,
};
use llamactl_hardware::{GpuMemory, HardwareSnapshot};
use proptest::prelude::*;

const MIB: u64 = 1024 * 1024;
const GIB: u64 = 1024 * MIB;

fn llama_meta() -> GgufMetadata {
    let bytes = gguf_bytes(&llama_entries());
    parse_gguf_metadata(&bytes[..], bytes.len() as u64).unwrap()
}

fn snapshot(free_vram_mb: &[u64], ram_mb: u64) -> HardwareSnapshot {
    HardwareSnapshot {
        gpus: free_vram_mb
            .iter()
            .enumerate()
            .map(|(i, free)| GpuMemory {
                id: format!("CUDA{}", i),
                total_mb: *free,
                free_mb: *free,
            })
            .collect(),
        total_ram_mb: ram_mb,
        available_ram_mb: ram_mb,
    }
}

fn inputs(model_size: u64, ctx: Option<u64>, mode: MemoryMode) -> PlanInputs {
    PlanInputs::from_metadata(&llama_meta(), model_size, 0, ctx, mode).unwrap()
}

#[test]
fn test_inputs_from_metadata() {
    let i = inputs(4 * GIB, None, MemoryMode::High);
    assert_eq!(i.total_layers, 33);
    assert_eq!(i.native_context, 4096);
    assert_eq!(i.kv_per_token, 131_072);
    assert_eq!(i.target_context(), 4096);
}

#[test]
fn test_large_model_small_gpu_goes_hybrid() {
    let plan = plan_from_inputs(
        &inputs(4 * GIB, Some(4096), MemoryMode::High),
        &snapshot(&[2 * 1024], 16 * 1024),
    );
    println!("📋 Plan: {:?}", plan);

    assert_eq!(plan.mode, ModelMode::Hybrid);
    assert_eq!(plan.gpu_layers, 5);
    assert!(plan.no_offload_kv_cache, "KV cache does not fit next to 5 layers");
    assert_eq!(plan.max_context_length, 4096);
    assert_eq!(plan.batch_size, 512);
}

#[test]
fn test_small_model_big_gpu_goes_gpu() {
    let plan = plan_from_inputs(
        &inputs(GIB, None, MemoryMode::High),
        &snapshot(&[24 * 1024], 32 * 1024),
    );
    assert_eq!(plan.mode, ModelMode::Gpu);
    assert_eq!(plan.gpu_layers, 33);
    assert!(!plan.no_offload_kv_cache);
    assert_eq!(plan.max_context_length, 4096);
}

#[test]
fn test_huge_model_no_gpu_is_unsupported() {
    let plan = plan_from_inputs(
        &inputs(40 * GIB, None, MemoryMode::High),
        &snapshot(&[], 8 * 1024),
    );
    assert_eq!(plan, ModelPlan::unsupported());
    assert_eq!(plan.batch_size, 64);
}

#[test]
fn test_vram_sums_across_gpus() {
    let single = plan_from_inputs(&inputs(8 * GIB, None, MemoryMode::High), &snapshot(&[8 * 1024], 32 * 1024));
    let dual = plan_from_inputs(
        &inputs(8 * GIB, None, MemoryMode::High),
        &snapshot(&[8 * 1024, 8 * 1024], 32 * 1024),
    );
    assert!(dual.gpu_layers > single.gpu_layers);
    assert_eq!(dual.mode, ModelMode::Gpu);
}

#[test]
fn test_lower_memory_mode_never_uses_more() {
    let hw = snapshot(&[6 * 1024], 16 * 1024);
    let high = plan_from_inputs(&inputs(5 * GIB, None, MemoryMode::High), &hw);
    let medium = plan_from_inputs(&inputs(5 * GIB, None, MemoryMode::Medium), &hw);
    let low = plan_from_inputs(&inputs(5 * GIB, None, MemoryMode::Low), &hw);
    assert!(high.gpu_layers >= medium.gpu_layers);
    assert!(medium.gpu_layers >= low.gpu_layers);
}

#[tokio::test]
async fn test_plan_model_load_from_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "model.gguf", &llama_entries(), 64 * MIB);
    let probe = snapshot(&[24 * 1024], 32 * 1024);

    let plan = plan_model_load(&probe, &path, "high", None, Some(2048)).await.unwrap();
    assert_eq!(plan.mode, ModelMode::Gpu);
    assert_eq!(plan.max_context_length, 2048);
    assert!(!plan.offload_mmproj);

    let mmproj = write_gguf(dir.path(), "mmproj.gguf", &llama_entries(), 16 * MIB);
    let plan = plan_model_load(&probe, &path, "high", Some(mmproj.as_path()), None).await.unwrap();
    assert!(plan.offload_mmproj);
}

#[tokio::test]
async fn test_plan_model_load_errors() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "model.gguf", &llama_entries(), 64 * MIB);
    let probe = snapshot(&[], 16 * 1024);

    let err = plan_model_load(&probe, &path, "turbo", None, None).await.unwrap_err();
    assert!(matches!(err, GgufError::InvalidArgument(_)));

    let err = plan_model_load(&probe, dir.path().join("missing.gguf"), "high", None, None)
        .await
        .unwrap_err();
    assert!(matches!(err, GgufError::FileNotFound(_)));
}

#[tokio::test]
async fn test_cpu_mode_through_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "model.gguf", &llama_entries(), 64 * MIB);
    let probe = snapshot(&[24 * 1024], 16 * 1024);

    let plan = plan_model_load(&probe, &path, "cpu", None, None).await.unwrap();
    assert_eq!(plan.mode, ModelMode::Cpu);
    assert_eq!(plan.gpu_layers, 0);
}

#[tokio::test]
async fn test_is_model_supported_levels() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "model.gguf", &llama_entries(), 64 * MIB);

    let green = is_model_supported(&snapshot(&[24 * 1024], 32 * 1024), &path, None).await.unwrap();
    assert_eq!(green, ModelSupport::Green);

    let yellow = is_model_supported(&snapshot(&[], 16 * 1024), &path, None).await.unwrap();
    assert_eq!(yellow, ModelSupport::Yellow);

    let red = is_model_supported(&snapshot(&[], 32), &path, None).await.unwrap();
    assert_eq!(red, ModelSupport::Red);
}

#[tokio::test]
async fn test_get_model_size() {
    let dir = tempfile::tempdir().unwrap();
    let path = write_gguf(dir.path(), "model.gguf", &llama_entries(), 3 * MIB);
    assert_eq!(get_model_size(&path).await.unwrap(), 3 * MIB);
    assert!(matches!(
        get_model_size(dir.path().join("gone.gguf")).await,
        Err(GgufError::FileNotFound(_))
    ));
}

proptest! {
    #[test]
    fn more_vram_never_lowers_the_plan(
        model_gib in 1u64..48,
        vram_a in 0u64..48 * 1024,
        vram_extra in 0u64..16 * 1024,
        ram_mb in 1024u64..64 * 1024,
    ) {
        let i = inputs(model_gib * GIB, None, MemoryMode::High);
        let before = plan_from_inputs(&i, &snapshot(&[vram_a], ram_mb));
        let after = plan_from_inputs(&i, &snapshot(&[vram_a + vram_extra], ram_mb));
        prop_assert!(after.gpu_layers >= before.gpu_layers);
        prop_assert!(after.mode >= before.mode);
    }

    #[test]
    fn positive_plans_respect_context_bounds(
        model_mib in 64u64..32 * 1024,
        vram in 0u64..32 * 1024,
        ram_mb in 512u64..64 * 1024,
        requested in proptest::option::of(1u64..200_000),
    ) {
        let i = inputs(model_mib * MIB, requested, MemoryMode::Medium);
        let plan = plan_from_inputs(&i, &snapshot(&[vram], ram_mb));
        if plan.mode != ModelMode::Unsupported {
            prop_assert!(plan.max_context_length >= 1024);
            prop_assert!(plan.max_context_length <= i.target_context());
            prop_assert!(plan.batch_size >= 64 && plan.batch_size <= 2048);
            prop_assert!(plan.gpu_layers <= i.total_layers);
        }
    }
}
