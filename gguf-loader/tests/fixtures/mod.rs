//! Minimal GGUF writer for tests

#![allow(dead_code)]

use std::io::Write;
use std::path::{Path, PathBuf};

pub enum Value<'a> {
    U32(u32),
    U64(u64),
    F32(f32),
    Str(&'a str),
    StrArray(&'a [&'a str]),
}

/// Serialize a version 3 header with the given metadata
pub fn gguf_bytes(entries: &[(&str, Value)]) -> Vec<u8> {
    let mut buf = b"GGUF".to_vec();
    buf.extend_from_slice(&3u32.to_le_bytes());
    buf.extend_from_slice(&0u64.to_le_bytes());
    buf.extend_from_slice(&(entries.len() as u64).to_le_bytes());

    for (key, value) in entries {
        push_str(&mut buf, key);
        match value {
            Value::U32(v) => {
                buf.extend_from_slice(&4u32.to_le_bytes());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::U64(v) => {
                buf.extend_from_slice(&10u32.to_le_bytes());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::F32(v) => {
                buf.extend_from_slice(&6u32.to_le_bytes());
                buf.extend_from_slice(&v.to_le_bytes());
            }
            Value::Str(s) => {
                buf.extend_from_slice(&8u32.to_le_bytes());
                push_str(&mut buf, s);
            }
            Value::StrArray(items) => {
                buf.extend_from_slice(&9u32.to_le_bytes());
                buf.extend_from_slice(&8u32.to_le_bytes());
                buf.extend_from_slice(&(items.len() as u64).to_le_bytes());
                for item in items.iter() {
                    push_str(&mut buf, item);
                }
            }
        }
    }
    buf
}

fn push_str(buf: &mut Vec<u8>, s: &str) {
    buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
    buf.extend_from_slice(s.as_bytes());
}

/// Llama-style metadata: 32 blocks, 8 KV heads of 128, 4096 native context
pub fn llama_entries() -> Vec<(&'static str, Value<'static>)> {
    vec![
        ("general.architecture", Value::Str("llama")),
        ("general.name", Value::Str("test-llama")),
        ("llama.block_count", Value::U32(32)),
        ("llama.context_length", Value::U32(4096)),
        ("llama.embedding_length", Value::U32(4096)),
        ("llama.attention.head_count", Value::U32(32)),
        ("llama.attention.head_count_kv", Value::U32(8)),
        ("llama.attention.key_length", Value::U32(128)),
        ("llama.attention.value_length", Value::U32(128)),
        ("llama.rope.freq_base", Value::F32(500000.0)),
    ]
}

/// Write a GGUF file padded (sparsely) to `total_size` bytes
pub fn write_gguf(dir: &Path, name: &str, entries: &[(&str, Value)], total_size: u64) -> PathBuf {
    let path = dir.join(name);
    let bytes = gguf_bytes(entries);
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(&bytes).unwrap();
    if total_size > bytes.len() as u64 {
        file.set_len(total_size).unwrap();
    }
    path
}
