//! GGUF header reader.
//!
//! Parses the key/value metadata section of a GGUF file sequentially through a
//! buffered reader and flattens every value to a string. Tensor descriptors
//! and tensor data are never read.
//!
//! Layout (all integers little-endian):
//!
//! ```text
//! magic "GGUF" | version u32 | tensor_count | kv_count | kv_count x (key, type u32, value)
//! ```
//!
//! Counts and string lengths are u64 in versions 2 and 3, u32 in version 1.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::File;
use std::io::{self, BufReader, Read};
use std::path::Path;

use crate::{GgufError, Result};

pub const GGUF_MAGIC: [u8; 4] = *b"GGUF";

/// Arrays longer than this are summarized as `[<type>; <len>]`
pub const MAX_RENDERED_ARRAY_LEN: u64 = 64;

/// Arrays of arrays deeper than this are rejected
pub const MAX_ARRAY_NESTING: u32 = 8;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct GgufMetadata {
    pub version: u32,
    pub tensor_count: u64,
    pub metadata: BTreeMap<String, String>,
}

impl GgufMetadata {
    pub fn get(&self, key: &str) -> Option<&str> {
        self.metadata.get(key).map(String::as_str)
    }

    /// `general.architecture`, e.g. `llama`
    pub fn architecture(&self) -> Result<&str> {
        self.get("general.architecture")
            .ok_or_else(|| GgufError::MissingMetadataField("general.architecture".to_string()))
    }

    /// Numeric `{arch}.{field}` or `None` when absent or unparsable
    pub fn arch_u64(&self, field: &str) -> Option<u64> {
        let arch = self.architecture().ok()?;
        self.get(&format!("{}.{}", arch, field))?.trim().parse().ok()
    }

    /// Numeric `{arch}.{field}`, failing with the full key name when absent
    pub fn require_arch_u64(&self, field: &str) -> Result<u64> {
        let arch = self.architecture()?;
        let key = format!("{}.{}", arch, field);
        self.get(&key)
            .and_then(|v| v.trim().parse().ok())
            .ok_or(GgufError::MissingMetadataField(key))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ValueType {
    U8,
    I8,
    U16,
    I16,
    U32,
    I32,
    F32,
    Bool,
    String,
    Array,
    U64,
    I64,
    F64,
}

impl ValueType {
    fn from_u32(raw: u32) -> Result<Self> {
        Ok(match raw {
            0 => Self::U8,
            1 => Self::I8,
            2 => Self::U16,
            3 => Self::I16,
            4 => Self::U32,
            5 => Self::I32,
            6 => Self::F32,
            7 => Self::Bool,
            8 => Self::String,
            9 => Self::Array,
            10 => Self::U64,
            11 => Self::I64,
            12 => Self::F64,
            other => {
                return Err(GgufError::InvalidFormat(format!(
                    "unknown value type {}",
                    other
                )))
            }
        })
    }

    fn name(self) -> &'static str {
        match self {
            Self::U8 => "u8",
            Self::I8 => "i8",
            Self::U16 => "u16",
            Self::I16 => "i16",
            Self::U32 => "u32",
            Self::I32 => "i32",
            Self::F32 => "f32",
            Self::Bool => "bool",
            Self::String => "string",
            Self::Array => "array",
            Self::U64 => "u64",
            Self::I64 => "i64",
            Self::F64 => "f64",
        }
    }

    /// Encoded size for fixed-width types
    fn fixed_size(self) -> Option<u64> {
        match self {
            Self::U8 | Self::I8 | Self::Bool => Some(1),
            Self::U16 | Self::I16 => Some(2),
            Self::U32 | Self::I32 | Self::F32 => Some(4),
            Self::U64 | Self::I64 | Self::F64 => Some(8),
            Self::String | Self::Array => None,
        }
    }
}

struct HeaderReader<R> {
    inner: R,
    remaining: u64,
    version: u32,
}

impl<R: Read> HeaderReader<R> {
    fn take_bytes<const N: usize>(&mut self) -> Result<[u8; N]> {
        self.reserve(N as u64)?;
        let mut buf = [0u8; N];
        self.inner.read_exact(&mut buf).map_err(eof_as_truncated)?;
        Ok(buf)
    }

    fn reserve(&mut self, n: u64) -> Result<()> {
        if n > self.remaining {
            return Err(GgufError::Truncated(format!(
                "need {} bytes, {} left",
                n, self.remaining
            )));
        }
        self.remaining -= n;
        Ok(())
    }

    fn u32(&mut self) -> Result<u32> {
        Ok(u32::from_le_bytes(self.take_bytes()?))
    }

    fn u64(&mut self) -> Result<u64> {
        Ok(u64::from_le_bytes(self.take_bytes()?))
    }

    /// Count or length field, width depends on the format version
    fn count(&mut self) -> Result<u64> {
        if self.version == 1 {
            self.u32().map(u64::from)
        } else {
            self.u64()
        }
    }

    fn count_width(&self) -> u64 {
        if self.version == 1 {
            4
        } else {
            8
        }
    }

    fn string(&mut self) -> Result<String> {
        let len = self.count()?;
        self.reserve(len)?;
        let mut buf = Vec::with_capacity(len as usize);
        (&mut self.inner)
            .take(len)
            .read_to_end(&mut buf)
            .map_err(eof_as_truncated)?;
        if buf.len() as u64 != len {
            return Err(GgufError::Truncated("string runs past end of file".to_string()));
        }
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    fn skip(&mut self, n: u64) -> Result<()> {
        self.reserve(n)?;
        let copied = io::copy(&mut (&mut self.inner).take(n), &mut io::sink())?;
        if copied != n {
            return Err(GgufError::Truncated("skip ran past end of file".to_string()));
        }
        Ok(())
    }

    fn value(&mut self, ty: ValueType, depth: u32) -> Result<String> {
        Ok(match ty {
            ValueType::U8 => u8::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::I8 => i8::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::U16 => u16::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::I16 => i16::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::U32 => self.u32()?.to_string(),
            ValueType::I32 => i32::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::F32 => f32::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::Bool => (self.take_bytes::<1>()?[0] != 0).to_string(),
            ValueType::String => self.string()?,
            ValueType::Array => self.array(depth + 1)?,
            ValueType::U64 => self.u64()?.to_string(),
            ValueType::I64 => i64::from_le_bytes(self.take_bytes()?).to_string(),
            ValueType::F64 => f64::from_le_bytes(self.take_bytes()?).to_string(),
        })
    }

    fn array(&mut self, depth: u32) -> Result<String> {
        check_nesting(depth)?;
        let elem = ValueType::from_u32(self.u32()?)?;
        let len = self.count()?;

        // Cheapest possible encoding per element: fixed width, or a bare length prefix
        let min_elem = elem.fixed_size().unwrap_or(match elem {
            ValueType::Array => 4 + self.count_width(),
            _ => self.count_width(),
        });
        let min_total = len
            .checked_mul(min_elem)
            .ok_or_else(|| GgufError::Truncated(format!("array of {} elements", len)))?;
        if min_total > self.remaining {
            return Err(GgufError::Truncated(format!(
                "array of {} {} elements exceeds file size",
                len,
                elem.name()
            )));
        }

        if len <= MAX_RENDERED_ARRAY_LEN {
            let items = (0..len)
                .map(|_| self.value(elem, depth))
                .collect::<Result<Vec<_>>>()?;
            return Ok(format!("[{}]", items.join(",")));
        }

        match elem.fixed_size() {
            Some(size) => self.skip(len * size)?,
            None => {
                for _ in 0..len {
                    self.skip_value(elem, depth)?;
                }
            }
        }
        Ok(format!("[{}; {}]", elem.name(), len))
    }

    fn skip_value(&mut self, ty: ValueType, depth: u32) -> Result<()> {
        match ty {
            ValueType::String => {
                let len = self.count()?;
                self.skip(len)
            }
            ValueType::Array => {
                check_nesting(depth + 1)?;
                let elem = ValueType::from_u32(self.u32()?)?;
                let len = self.count()?;
                match elem.fixed_size() {
                    Some(size) => {
                        let total = len.checked_mul(size).ok_or_else(|| {
                            GgufError::Truncated(format!("array of {} elements", len))
                        })?;
                        self.skip(total)
                    }
                    None => {
                        for _ in 0..len {
                            self.skip_value(elem, depth + 1)?;
                        }
                        Ok(())
                    }
                }
            }
            fixed => self.skip(fixed.fixed_size().unwrap_or(0)),
        }
    }
}

fn check_nesting(depth: u32) -> Result<()> {
    if depth > MAX_ARRAY_NESTING {
        return Err(GgufError::InvalidFormat(format!(
            "array nesting deeper than {} levels",
            MAX_ARRAY_NESTING
        )));
    }
    Ok(())
}

fn eof_as_truncated(e: io::Error) -> GgufError {
    if e.kind() == io::ErrorKind::UnexpectedEof {
        GgufError::Truncated("unexpected end of file".to_string())
    } else {
        GgufError::Io(e)
    }
}

/// Parse GGUF metadata from `reader`, which holds `len` bytes in total.
pub fn parse_gguf_metadata<R: Read>(reader: R, len: u64) -> Result<GgufMetadata> {
    let mut header = HeaderReader {
        inner: reader,
        remaining: len,
        version: 0,
    };

    let magic: [u8; 4] = header.take_bytes()?;
    if magic != GGUF_MAGIC {
        return Err(GgufError::InvalidFormat(format!(
            "bad magic {:02x?}, expected \"GGUF\"",
            magic
        )));
    }

    let version = header.u32()?;
    if !(1..=3).contains(&version) {
        return Err(GgufError::InvalidFormat(format!(
            "unsupported version {}",
            version
        )));
    }
    header.version = version;

    let tensor_count = header.count()?;
    let kv_count = header.count()?;

    // Each entry needs at least a key length prefix and a type tag
    let min_entry = header.count_width() + 4;
    if kv_count.saturating_mul(min_entry) > header.remaining {
        return Err(GgufError::Truncated(format!(
            "{} metadata entries declared, file too small",
            kv_count
        )));
    }

    let mut metadata = BTreeMap::new();
    for _ in 0..kv_count {
        let key = header.string()?;
        let ty = ValueType::from_u32(header.u32()?)?;
        let value = header.value(ty, 0)?;
        metadata.insert(key, value);
    }

    log::debug!(
        "Parsed GGUF v{}: {} tensors, {} metadata entries",
        version,
        tensor_count,
        metadata.len()
    );

    Ok(GgufMetadata {
        version,
        tensor_count,
        metadata,
    })
}

/// Read the metadata header of the GGUF file at `path`.
pub fn read_gguf_metadata(path: impl AsRef<Path>) -> Result<GgufMetadata> {
    let path = path.as_ref();
    let file = File::open(path).map_err(|e| match e.kind() {
        io::ErrorKind::NotFound => GgufError::FileNotFound(path.display().to_string()),
        _ => GgufError::Io(e),
    })?;
    let len = file.metadata()?.len();
    log::info!("Reading GGUF metadata from {}", path.display());
    parse_gguf_metadata(BufReader::new(file), len)
}

/// [`read_gguf_metadata`] on the blocking pool
pub async fn read_gguf_metadata_async(path: impl AsRef<Path>) -> Result<GgufMetadata> {
    let path = path.as_ref().to_path_buf();
    tokio::task::spawn_blocking(move || read_gguf_metadata(path))
        .await
        .map_err(|e| GgufError::Io(io::Error::other(e)))?
}

#[cfg(test)]
mod tests {
    use super::*;

    fn header(version: u32, tensors: u64, kvs: u64) -> Vec<u8> {
        let mut buf = GGUF_MAGIC.to_vec();
        buf.extend_from_slice(&version.to_le_bytes());
        buf.extend_from_slice(&tensors.to_le_bytes());
        buf.extend_from_slice(&kvs.to_le_bytes());
        buf
    }

    fn push_str(buf: &mut Vec<u8>, s: &str) {
        buf.extend_from_slice(&(s.len() as u64).to_le_bytes());
        buf.extend_from_slice(s.as_bytes());
    }

    fn parse(bytes: &[u8]) -> Result<GgufMetadata> {
        parse_gguf_metadata(bytes, bytes.len() as u64)
    }

    #[test]
    fn test_scalar_values() {
        let mut buf = header(3, 7, 3);
        push_str(&mut buf, "general.architecture");
        buf.extend_from_slice(&8u32.to_le_bytes());
        push_str(&mut buf, "llama");
        push_str(&mut buf, "llama.rope.freq_base");
        buf.extend_from_slice(&6u32.to_le_bytes());
        buf.extend_from_slice(&10000.5f32.to_le_bytes());
        push_str(&mut buf, "general.flag");
        buf.extend_from_slice(&7u32.to_le_bytes());
        buf.push(1);

        let meta = parse(&buf).unwrap();
        assert_eq!(meta.version, 3);
        assert_eq!(meta.tensor_count, 7);
        assert_eq!(meta.get("general.architecture"), Some("llama"));
        assert_eq!(meta.get("llama.rope.freq_base"), Some("10000.5"));
        assert_eq!(meta.get("general.flag"), Some("true"));
    }

    #[test]
    fn test_version_one_uses_u32_counts() {
        let mut buf = GGUF_MAGIC.to_vec();
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&0u32.to_le_bytes());
        buf.extend_from_slice(&1u32.to_le_bytes());
        buf.extend_from_slice(&3u32.to_le_bytes());
        buf.extend_from_slice(b"key");
        buf.extend_from_slice(&5u32.to_le_bytes());
        buf.extend_from_slice(&(-42i32).to_le_bytes());

        let meta = parse(&buf).unwrap();
        assert_eq!(meta.version, 1);
        assert_eq!(meta.get("key"), Some("-42"));
    }

    #[test]
    fn test_short_and_long_arrays() {
        let mut buf = header(3, 0, 2);
        push_str(&mut buf, "short");
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&4u32.to_le_bytes());
        buf.extend_from_slice(&3u64.to_le_bytes());
        for v in [1u32, 2, 3] {
            buf.extend_from_slice(&v.to_le_bytes());
        }
        push_str(&mut buf, "tokenizer.ggml.tokens");
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&8u32.to_le_bytes());
        buf.extend_from_slice(&100u64.to_le_bytes());
        for i in 0..100 {
            push_str(&mut buf, &format!("tok{}", i));
        }

        let meta = parse(&buf).unwrap();
        assert_eq!(meta.get("short"), Some("[1,2,3]"));
        assert_eq!(meta.get("tokenizer.ggml.tokens"), Some("[string; 100]"));
    }

    #[test]
    fn test_bad_magic() {
        let mut buf = header(3, 0, 0);
        buf[0] = b'X';
        assert!(matches!(parse(&buf), Err(GgufError::InvalidFormat(_))));
    }

    #[test]
    fn test_unsupported_version() {
        let buf = header(4, 0, 0);
        assert!(matches!(parse(&buf), Err(GgufError::InvalidFormat(_))));
    }

    #[test]
    fn test_unknown_value_type() {
        let mut buf = header(3, 0, 1);
        push_str(&mut buf, "k");
        buf.extend_from_slice(&99u32.to_le_bytes());
        buf.extend_from_slice(&[0u8; 8]);
        assert!(matches!(parse(&buf), Err(GgufError::InvalidFormat(_))));
    }

    #[test]
    fn test_truncated_cases() {
        // Ends inside the header
        assert!(matches!(parse(&GGUF_MAGIC[..3]), Err(GgufError::Truncated(_))));

        // Absurd kv count
        let buf = header(3, 0, u64::MAX);
        assert!(matches!(parse(&buf), Err(GgufError::Truncated(_))));

        // String length beyond the end
        let mut buf = header(3, 0, 1);
        buf.extend_from_slice(&1_000_000u64.to_le_bytes());
        buf.extend_from_slice(b"abc");
        assert!(matches!(parse(&buf), Err(GgufError::Truncated(_))));

        // Array count beyond the end
        let mut buf = header(3, 0, 1);
        push_str(&mut buf, "a");
        buf.extend_from_slice(&9u32.to_le_bytes());
        buf.extend_from_slice(&10u32.to_le_bytes());
        buf.extend_from_slice(&(1u64 << 40).to_le_bytes());
        assert!(matches!(parse(&buf), Err(GgufError::Truncated(_))));
    }

    #[test]
    fn test_missing_file() {
        let err = read_gguf_metadata("/nonexistent/model.gguf").unwrap_err();
        assert!(matches!(err, GgufError::FileNotFound(_)));
    }

    #[test]
    fn test_require_arch_field() {
        let mut metadata = BTreeMap::new();
        metadata.insert("general.architecture".to_string(), "qwen2".to_string());
        metadata.insert("qwen2.block_count".to_string(), "28".to_string());
        let meta = GgufMetadata {
            version: 3,
            tensor_count: 0,
            metadata,
        };
        assert_eq!(meta.require_arch_u64("block_count").unwrap(), 28);
        match meta.require_arch_u64("context_length") {
            Err(GgufError::MissingMetadataField(key)) => assert_eq!(key, "qwen2.context_length"),
            other => panic!("unexpected {:?}", other),
        }
    }

    /// `levels` arrays of one element each around a single u32
    fn nested_array(buf: &mut Vec<u8>, levels: usize, outer_len: u64) {
        buf.extend_from_slice(&9u32.to_le_bytes());
        for level in 0..levels {
            let is_last = level + 1 == levels;
            let elem_type: u32 = if is_last { 4 } else { 9 };
            buf.extend_from_slice(&elem_type.to_le_bytes());
            let len = if level == 0 { outer_len } else { 1 };
            buf.extend_from_slice(&len.to_le_bytes());
        }
        buf.extend_from_slice(&7u32.to_le_bytes());
    }

    #[test]
    fn test_nested_arrays() {
        let mut buf = header(3, 0, 1);
        push_str(&mut buf, "a");
        nested_array(&mut buf, 3, 1);
        let meta = parse(&buf).unwrap();
        assert_eq!(meta.get("a"), Some("[[[7]]]"));
    }

    #[test]
    fn test_deep_nesting_is_invalid_format() {
        let mut buf = header(3, 0, 1);
        push_str(&mut buf, "a");
        nested_array(&mut buf, 200_000, 1);

        // Run on a small stack: the depth check must fire long before it matters
        let handle = std::thread::Builder::new()
            .stack_size(256 * 1024)
            .spawn(move || parse(&buf).map(|_| ()))
            .unwrap();
        match handle.join().unwrap() {
            Err(GgufError::InvalidFormat(msg)) => assert!(msg.contains("nesting")),
            other => panic!("unexpected {:?}", other),
        }
    }

    #[test]
    fn test_deep_nesting_in_skipped_array() {
        let mut buf = header(3, 0, 1);
        push_str(&mut buf, "a");
        // Long enough to take the skip path
        nested_array(&mut buf, 20, MAX_RENDERED_ARRAY_LEN + 1);
        buf.resize(buf.len() + 4096, 0);
        assert!(matches!(parse(&buf), Err(GgufError::InvalidFormat(_))));
    }
}
