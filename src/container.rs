//! Safetensors container reading and writing
//!
//! Layout: an 8-byte little-endian header length, a JSON header mapping tensor
//! names to `{dtype, shape, data_offsets}` (plus an optional `__metadata__`
//! object), then the raw little-endian tensor bytes.
//!
//! The header is parsed here rather than through `SafeTensors::deserialize`
//! because that parser rejects any `__metadata__` value that is not a string,
//! and adapters with such values still have to load so the metadata accessors
//! can report the mismatch.

use candle_core::{Device, Tensor};
use safetensors::Dtype;
use serde::Deserialize;
use serde_json::{Map, Value};
use std::collections::HashMap;
use std::path::Path;
use tracing::{debug, warn};

use crate::error::{LoraError, Result};
use crate::metadata::Metadata;

const HEADER_LEN_BYTES: usize = 8;
const MAX_HEADER_LEN: usize = 100_000_000;
const METADATA_KEY: &str = "__metadata__";

/// Header entry describing one tensor
#[derive(Debug, Deserialize)]
struct TensorEntry {
    dtype: Dtype,
    shape: Vec<usize>,
    data_offsets: (usize, usize),
}

/// Fully decoded contents of one container file
#[derive(Debug)]
pub struct Container {
    pub metadata: Metadata,
    pub tensors: HashMap<String, Tensor>,
}

/// Read a container from disk
///
/// The file is read in one go and closed before decoding starts.
pub fn read(path: &Path) -> Result<Container> {
    let bytes = std::fs::read(path).map_err(|source| LoraError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    parse(path, &bytes)
}

/// Decode a container held in memory; `path` only labels errors
pub fn parse(path: &Path, bytes: &[u8]) -> Result<Container> {
    if bytes.len() < HEADER_LEN_BYTES {
        return Err(LoraError::invalid(
            path,
            format!("file is {} bytes, shorter than the header length prefix", bytes.len()),
        ));
    }

    let (len_prefix, rest) = bytes.split_at(HEADER_LEN_BYTES);
    let mut len_bytes = [0u8; HEADER_LEN_BYTES];
    len_bytes.copy_from_slice(len_prefix);
    let header_len = usize::try_from(u64::from_le_bytes(len_bytes))
        .map_err(|_| LoraError::invalid(path, "header length does not fit in memory"))?;

    if header_len > MAX_HEADER_LEN {
        return Err(LoraError::invalid(
            path,
            format!("header length {header_len} exceeds {MAX_HEADER_LEN}"),
        ));
    }
    if header_len > rest.len() {
        return Err(LoraError::invalid(
            path,
            format!("header length {header_len} runs past end of file"),
        ));
    }

    let (header, data) = rest.split_at(header_len);
    let mut entries: Map<String, Value> = serde_json::from_slice(header)
        .map_err(|e| LoraError::invalid(path, format!("header is not a JSON object: {e}")))?;

    let metadata = match entries.remove(METADATA_KEY) {
        None | Some(Value::Null) => Metadata::default(),
        Some(Value::Object(map)) => Metadata::from(map),
        Some(_) => {
            return Err(LoraError::invalid(
                path,
                format!("{METADATA_KEY} is not a JSON object"),
            ))
        }
    };

    let mut tensors = HashMap::with_capacity(entries.len());
    for (name, value) in entries {
        let entry: TensorEntry = serde_json::from_value(value)
            .map_err(|e| LoraError::invalid(path, format!("bad header entry for {name}: {e}")))?;
        let tensor = decode_tensor(path, &name, &entry, data)?;
        tensors.insert(name, tensor);
    }

    debug!(
        path = %path.display(),
        metadata_entries = metadata.len(),
        tensors = tensors.len(),
        "Decoded safetensors container"
    );

    Ok(Container { metadata, tensors })
}

/// Write tensors and the string-valued metadata to a new container file
///
/// Returns how many non-string metadata entries were left out.
pub fn write(
    path: &Path,
    tensors: &HashMap<String, Tensor>,
    metadata: &Metadata,
) -> Result<usize> {
    let strings = metadata.string_entries();
    let skipped = metadata.len() - strings.len();
    if skipped > 0 {
        warn!(
            path = %path.display(),
            skipped,
            "Dropping non-string metadata values the container cannot store"
        );
    }

    let info = (!strings.is_empty()).then_some(strings);
    safetensors::serialize_to_file(tensors.iter(), &info, path).map_err(|e| LoraError::Write {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })?;
    Ok(skipped)
}

/// Raw bytes of one tensor, checked against its shape as they are decoded
struct RawTensor<'a> {
    path: &'a Path,
    name: &'a str,
    entry: &'a TensorEntry,
    bytes: &'a [u8],
}

impl RawTensor<'_> {
    fn decode<T, F, const N: usize>(&self, convert: F) -> Result<Vec<T>>
    where
        F: Fn([u8; N]) -> T,
    {
        let expected = self
            .entry
            .shape
            .iter()
            .try_fold(N, |acc, &dim| acc.checked_mul(dim))
            .ok_or_else(|| {
                LoraError::invalid(self.path, format!("shape of {} overflows", self.name))
            })?;

        if self.bytes.len() != expected {
            return Err(LoraError::invalid(
                self.path,
                format!(
                    "{} spans {} bytes but {:?} {:?} needs {expected}",
                    self.name,
                    self.bytes.len(),
                    self.entry.dtype,
                    self.entry.shape
                ),
            ));
        }

        Ok(from_le_chunks(self.bytes, convert))
    }
}

/// Decode one tensor
///
/// Integer and bool dtypes the backend lacks are widened without loss:
/// I8/I16/I32 to I64, U16 to U32, BOOL to U8 (0 or 1).
fn decode_tensor(path: &Path, name: &str, entry: &TensorEntry, data: &[u8]) -> Result<Tensor> {
    let (begin, end) = entry.data_offsets;
    if begin > end || end > data.len() {
        return Err(LoraError::invalid(
            path,
            format!(
                "offsets [{begin}, {end}) of {name} fall outside the {}-byte data section",
                data.len()
            ),
        ));
    }

    let raw = RawTensor {
        path,
        name,
        entry,
        bytes: &data[begin..end],
    };
    let shape = entry.shape.as_slice();
    let device = &Device::Cpu;

    let tensor = match entry.dtype {
        Dtype::F32 => Tensor::from_vec(raw.decode(f32::from_le_bytes)?, shape, device)?,
        Dtype::F64 => Tensor::from_vec(raw.decode(f64::from_le_bytes)?, shape, device)?,
        Dtype::F16 => Tensor::from_vec(raw.decode(half::f16::from_le_bytes)?, shape, device)?,
        Dtype::BF16 => Tensor::from_vec(raw.decode(half::bf16::from_le_bytes)?, shape, device)?,
        Dtype::U8 => Tensor::from_vec(raw.decode(|[b]: [u8; 1]| b)?, shape, device)?,
        Dtype::U32 => Tensor::from_vec(raw.decode(u32::from_le_bytes)?, shape, device)?,
        Dtype::I64 => Tensor::from_vec(raw.decode(i64::from_le_bytes)?, shape, device)?,
        Dtype::BOOL => {
            Tensor::from_vec(raw.decode(|[b]: [u8; 1]| u8::from(b != 0))?, shape, device)?
        }
        Dtype::U16 => {
            let values = raw.decode(|b: [u8; 2]| u32::from(u16::from_le_bytes(b)))?;
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::I8 => {
            let values = raw.decode(|b: [u8; 1]| i64::from(i8::from_le_bytes(b)))?;
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::I16 => {
            let values = raw.decode(|b: [u8; 2]| i64::from(i16::from_le_bytes(b)))?;
            Tensor::from_vec(values, shape, device)?
        }
        Dtype::I32 => {
            let values = raw.decode(|b: [u8; 4]| i64::from(i32::from_le_bytes(b)))?;
            Tensor::from_vec(values, shape, device)?
        }
        other => {
            return Err(LoraError::UnsupportedDtype {
                name: name.to_string(),
                dtype: format!("{other:?}"),
            })
        }
    };

    Ok(tensor)
}

/// Decode little-endian elements without assuming the slice is aligned
fn from_le_chunks<T, F, const N: usize>(raw: &[u8], convert: F) -> Vec<T>
where
    F: Fn([u8; N]) -> T,
{
    raw.chunks_exact(N)
        .map(|chunk| {
            let mut bytes = [0u8; N];
            bytes.copy_from_slice(chunk);
            convert(bytes)
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ErrorKind;
    use candle_core::DType;
    use serde_json::json;

    fn container_bytes(header: Value, data: &[u8]) -> Vec<u8> {
        let mut header = serde_json::to_vec(&header).unwrap();
        while header.len() % 8 != 0 {
            header.push(b' ');
        }
        let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
        bytes.extend_from_slice(&header);
        bytes.extend_from_slice(data);
        bytes
    }

    fn label() -> &'static Path {
        Path::new("test.safetensors")
    }

    #[test]
    fn test_parse_tensors_and_metadata() {
        let data: Vec<u8> = [1.0f32, 2.0, 3.0, 4.0]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = container_bytes(
            json!({
                "__metadata__": {"ss_base_model_version": "zimage", "ss_epoch": 4},
                "w": {"dtype": "F32", "shape": [2, 2], "data_offsets": [0, 16]},
            }),
            &data,
        );

        let container = parse(label(), &bytes).unwrap();
        assert_eq!(container.metadata.len(), 2);
        assert_eq!(
            container.metadata.string("ss_base_model_version").unwrap(),
            Some("zimage")
        );

        let w = &container.tensors["w"];
        assert_eq!(w.dims(), &[2, 2]);
        assert_eq!(w.dtype(), DType::F32);
        assert_eq!(
            w.flatten_all().unwrap().to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0, 4.0]
        );
    }

    #[test]
    fn test_parse_half_precision() {
        let data: Vec<u8> = [half::bf16::from_f32(0.5), half::bf16::from_f32(-2.0)]
            .iter()
            .flat_map(|v| v.to_le_bytes())
            .collect();
        let bytes = container_bytes(
            json!({"b": {"dtype": "BF16", "shape": [2], "data_offsets": [0, 4]}}),
            &data,
        );

        let container = parse(label(), &bytes).unwrap();
        assert!(container.metadata.is_empty());
        let values = container.tensors["b"].to_vec1::<half::bf16>().unwrap();
        assert_eq!(values[0].to_f32(), 0.5);
        assert_eq!(values[1].to_f32(), -2.0);
    }

    #[test]
    fn test_truncated_file_is_io_kind() {
        let err = parse(label(), &[1, 2, 3]).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);

        let mut bytes = 1000u64.to_le_bytes().to_vec();
        bytes.extend_from_slice(b"{}");
        assert_eq!(parse(label(), &bytes).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_offsets_must_match_shape() {
        let bytes = container_bytes(
            json!({"w": {"dtype": "F32", "shape": [4], "data_offsets": [0, 8]}}),
            &[0u8; 8],
        );
        let err = parse(label(), &bytes).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Io);
        assert!(err.to_string().contains("needs 16"));

        let bytes = container_bytes(
            json!({"w": {"dtype": "F32", "shape": [4], "data_offsets": [0, 16]}}),
            &[0u8; 8],
        );
        assert!(parse(label(), &bytes)
            .unwrap_err()
            .to_string()
            .contains("outside"));
    }

    #[test]
    fn test_metadata_must_be_object() {
        let bytes = container_bytes(json!({"__metadata__": "oops"}), &[]);
        assert_eq!(parse(label(), &bytes).unwrap_err().kind(), ErrorKind::Io);
    }

    #[test]
    fn test_null_metadata_is_empty() {
        let bytes = container_bytes(
            json!({
                "__metadata__": null,
                "w": {"dtype": "F32", "shape": [1], "data_offsets": [0, 4]},
            }),
            &1.0f32.to_le_bytes(),
        );
        let container = parse(label(), &bytes).unwrap();
        assert!(container.metadata.is_empty());
        assert_eq!(container.tensors.len(), 1);
    }

    #[test]
    fn test_narrow_integers_and_bools_are_widened() {
        let mut data = Vec::new();
        data.extend_from_slice(&7i32.to_le_bytes());
        data.extend_from_slice(&(-3i32).to_le_bytes());
        data.extend_from_slice(&(-2i16).to_le_bytes());
        data.extend_from_slice(&(-1i8).to_le_bytes());
        data.extend_from_slice(&60_000u16.to_le_bytes());
        data.extend_from_slice(&[0, 2]);
        let bytes = container_bytes(
            json!({
                "step": {"dtype": "I32", "shape": [2], "data_offsets": [0, 8]},
                "short": {"dtype": "I16", "shape": [1], "data_offsets": [8, 10]},
                "byte": {"dtype": "I8", "shape": [1], "data_offsets": [10, 11]},
                "count": {"dtype": "U16", "shape": [1], "data_offsets": [11, 13]},
                "mask": {"dtype": "BOOL", "shape": [2], "data_offsets": [13, 15]},
            }),
            &data,
        );

        let tensors = parse(label(), &bytes).unwrap().tensors;
        assert_eq!(tensors["step"].dtype(), DType::I64);
        assert_eq!(tensors["step"].to_vec1::<i64>().unwrap(), vec![7, -3]);
        assert_eq!(tensors["short"].to_vec1::<i64>().unwrap(), vec![-2]);
        assert_eq!(tensors["byte"].to_vec1::<i64>().unwrap(), vec![-1]);
        assert_eq!(tensors["count"].dtype(), DType::U32);
        assert_eq!(tensors["count"].to_vec1::<u32>().unwrap(), vec![60_000]);
        assert_eq!(tensors["mask"].dtype(), DType::U8);
        assert_eq!(tensors["mask"].to_vec1::<u8>().unwrap(), vec![0, 1]);
    }

    #[test]
    fn test_unsupported_dtype() {
        let bytes = container_bytes(
            json!({"big": {"dtype": "U64", "shape": [1], "data_offsets": [0, 8]}}),
            &[0; 8],
        );
        let err = parse(label(), &bytes).unwrap_err();
        assert!(matches!(err, LoraError::UnsupportedDtype { .. }));
    }

    #[test]
    fn test_write_then_read_keeps_string_metadata() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.safetensors");

        let mut tensors = HashMap::new();
        tensors.insert(
            "w".to_string(),
            Tensor::new(&[1.0f32, 2.0, 3.0], &Device::Cpu).unwrap(),
        );
        let metadata: Metadata = [
            ("modelspec.trigger_phrase", crate::metadata::MetadataValue::from("cat")),
            ("ss_epoch", crate::metadata::MetadataValue::from(json!(3))),
        ]
        .into_iter()
        .collect();

        assert_eq!(write(&path, &tensors, &metadata).unwrap(), 1);
        let container = read(&path).unwrap();

        assert_eq!(container.metadata.len(), 1);
        assert_eq!(
            container.metadata.string("modelspec.trigger_phrase").unwrap(),
            Some("cat")
        );
        assert_eq!(
            container.tensors["w"].to_vec1::<f32>().unwrap(),
            vec![1.0, 2.0, 3.0]
        );
    }
}
