//! Fixture builders for LoRA container files

#![allow(dead_code)]

use candle_core::{DType, Device, Tensor};
use serde_json::{json, Map, Value};
use std::collections::HashMap;
use std::path::{Path, PathBuf};

/// Write a container by hand so metadata values of any JSON type can be stored
pub fn write_raw(path: &Path, metadata: Value, tensors: &[(&str, &str, Vec<usize>, Vec<u8>)]) {
    let mut header = Map::new();
    header.insert("__metadata__".to_string(), metadata);

    let mut data = Vec::new();
    for (name, dtype, shape, bytes) in tensors {
        let begin = data.len();
        data.extend_from_slice(bytes);
        header.insert(
            name.to_string(),
            json!({"dtype": dtype, "shape": shape, "data_offsets": [begin, data.len()]}),
        );
    }

    let mut header = serde_json::to_vec(&Value::Object(header)).unwrap();
    while header.len() % 8 != 0 {
        header.push(b' ');
    }

    let mut bytes = (header.len() as u64).to_le_bytes().to_vec();
    bytes.extend_from_slice(&header);
    bytes.extend_from_slice(&data);
    std::fs::write(path, bytes).unwrap();
}

/// Write a container with the reference safetensors serializer
pub fn write_with_safetensors(path: &Path, metadata: &[(&str, &str)]) {
    let device = Device::Cpu;
    let mut tensors = HashMap::new();
    tensors.insert(
        "lora_unet_layers_0_attention_to_q.lora_down.weight".to_string(),
        Tensor::ones((4, 16), DType::F32, &device).unwrap(),
    );
    tensors.insert(
        "lora_unet_layers_0_attention_to_q.lora_up.weight".to_string(),
        Tensor::zeros((16, 4), DType::F16, &device).unwrap(),
    );
    tensors.insert(
        "lora_unet_layers_0_attention_to_q.alpha".to_string(),
        Tensor::new(4.0f32, &device).unwrap(),
    );

    let metadata: HashMap<String, String> = metadata
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect();
    let bytes = safetensors::serialize(tensors.iter(), &Some(metadata)).unwrap();
    std::fs::write(path, bytes).unwrap();
}

pub fn f32_bytes(values: &[f32]) -> Vec<u8> {
    values.iter().flat_map(|v| v.to_le_bytes()).collect()
}

pub fn fixture_path(dir: &tempfile::TempDir, name: &str) -> PathBuf {
    dir.path().join(name)
}
