//! LoRA (Low-Rank Adaptation) adapter loading and metadata inspection
//!
//! A LoRA file is a safetensors container holding low-rank weight deltas plus
//! free-form training metadata. Besides the weights, callers mostly want to
//! know which word activates the adapter so it can be added to prompts; this
//! module derives that word from the metadata with a best-effort fallback
//! chain: the declared trigger phrase first, then the most frequent training
//! tag.

use candle_core::{DType, Tensor};
use serde_json::Value;
use std::collections::{HashMap, HashSet};
use std::path::Path;
use tracing::{debug, info, warn};

use crate::container;
use crate::error::{LoraError, Result};
use crate::metadata::{Metadata, MetadataValue};

pub const BASE_MODEL_KEY: &str = "ss_base_model_version";
pub const TRIGGER_PHRASE_KEY: &str = "modelspec.trigger_phrase";
pub const TAG_FREQUENCY_KEY: &str = "ss_tag_frequency";

/// Tags longer than this are unlikely to be real trigger words
pub const MAX_TRIGGER_TAG_CHARS: usize = 32;

/// Precision every tensor is converted to by [`LoraModel::to_uniform_precision`]
pub const UNIFORM_DTYPE: DType = DType::BF16;

/// One step of the trigger word fallback chain
type TriggerStep = fn(&LoraModel) -> Option<String>;

/// A loaded LoRA adapter: metadata plus every named tensor
#[derive(Debug)]
pub struct LoraModel {
    metadata: Metadata,
    weights: HashMap<String, Tensor>,
}

/// A low-rank layer found by pairing down/up projection tensors
#[derive(Debug, Clone, PartialEq)]
pub struct LoraLayer {
    /// Base name shared by the pair (e.g. "lora_unet_layers_0_attention_to_q")
    pub name: String,
    /// Dimension of the low-rank decomposition
    pub rank: usize,
    /// Alpha scaling factor (defaults to rank if not specified)
    pub alpha: f32,
}

impl LoraModel {
    /// Load a LoRA adapter from a safetensors file
    ///
    /// The file is read fully and closed before this returns. Any failure to
    /// read or decode the container is returned as an error; no partially
    /// loaded adapter is produced.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        info!(path = %path.display(), "Loading LoRA adapter");

        let container = container::read(path)?;
        let model = Self::new(container.metadata, container.tensors);

        info!(
            path = %path.display(),
            metadata_entries = model.metadata.len(),
            tensors = model.weights.len(),
            "LoRA adapter loaded"
        );

        Ok(model)
    }

    pub fn new(metadata: Metadata, weights: HashMap<String, Tensor>) -> Self {
        Self { metadata, weights }
    }

    pub fn metadata(&self) -> &Metadata {
        &self.metadata
    }

    pub fn weights(&self) -> &HashMap<String, Tensor> {
        &self.weights
    }

    /// Base model this adapter was trained against
    pub fn base_model(&self) -> Result<Option<&str>> {
        self.metadata.string(BASE_MODEL_KEY)
    }

    /// Trigger phrase declared by the trainer
    pub fn trigger_phrase(&self) -> Result<Option<&str>> {
        self.metadata.string(TRIGGER_PHRASE_KEY)
    }

    /// First tag of the first bucket of the training tag frequencies
    ///
    /// The raw value is a JSON string shaped like `{"1_tag": {"tag": 1}}`.
    /// Returns `Ok(None)` only when the key is missing; invalid JSON and empty
    /// buckets are [`LoraError::MalformedMetadata`], a non-string tag is
    /// [`LoraError::TypeMismatch`].
    pub fn frequent_tag(&self) -> Result<Option<String>> {
        let Some(raw) = self.metadata.string(TAG_FREQUENCY_KEY)? else {
            return Ok(None);
        };

        let frequency: Value = serde_json::from_str(raw).map_err(|e| {
            LoraError::malformed(TAG_FREQUENCY_KEY, format!("invalid tag frequency JSON: {e}"))
        })?;

        let Value::Object(buckets) = frequency else {
            return Err(LoraError::malformed(
                TAG_FREQUENCY_KEY,
                "tag frequency is not a JSON object",
            ));
        };
        let (bucket_name, bucket) = buckets
            .into_iter()
            .next()
            .ok_or_else(|| LoraError::malformed(TAG_FREQUENCY_KEY, "no tag bucket"))?;

        let tag = match bucket {
            Value::Object(tags) => tags.into_iter().next().map(|(tag, _)| Value::String(tag)),
            Value::Array(tags) => tags.into_iter().next(),
            _ => {
                return Err(LoraError::malformed(
                    TAG_FREQUENCY_KEY,
                    format!("bucket {bucket_name} is not a tag map"),
                ))
            }
        };

        match tag {
            Some(Value::String(tag)) => Ok(Some(tag)),
            Some(other) => Err(LoraError::TypeMismatch {
                key: TAG_FREQUENCY_KEY.to_string(),
                expected: "string",
                found: MetadataValue::from(other).type_name(),
            }),
            None => Err(LoraError::malformed(
                TAG_FREQUENCY_KEY,
                format!("bucket {bucket_name} has no tag"),
            )),
        }
    }

    /// Best guess of the word that activates this adapter
    ///
    /// Tries the declared trigger phrase, then the most frequent training tag.
    /// Never fails: every problem is logged as a warning and yields `None`.
    pub fn trigger_word(&self) -> Option<String> {
        const STEPS: [TriggerStep; 2] = [LoraModel::declared_phrase, LoraModel::plausible_tag];
        STEPS.iter().find_map(|step| step(self))
    }

    fn declared_phrase(&self) -> Option<String> {
        match self.trigger_phrase() {
            Ok(Some(phrase)) if !phrase.is_empty() => Some(phrase.to_string()),
            Ok(_) => {
                warn!("Trigger phrase not found or empty, trying tag...");
                None
            }
            Err(e) => {
                warn!(error = %e, "Trigger phrase unusable, trying tag...");
                None
            }
        }
    }

    fn plausible_tag(&self) -> Option<String> {
        let tag = match self.frequent_tag() {
            Ok(tag) => tag,
            Err(e) => {
                warn!(error = %e, "Tag frequency unusable");
                return None;
            }
        };

        match tag {
            None => {
                warn!("Tag not found or empty");
                None
            }
            Some(tag) if tag.is_empty() => {
                warn!("Tag not found or empty");
                None
            }
            Some(tag) if tag.chars().count() > MAX_TRIGGER_TAG_CHARS => {
                warn!(
                    tag = %tag,
                    "A long tag (> {MAX_TRIGGER_TAG_CHARS} chars) is unlikely a trigger word"
                );
                None
            }
            Some(tag) => Some(tag),
        }
    }

    /// Copy of every tensor converted to [`UNIFORM_DTYPE`]
    ///
    /// Names and shapes are kept; the adapter's own tensors are untouched.
    pub fn to_uniform_precision(&self) -> Result<HashMap<String, Tensor>> {
        self.to_dtype(UNIFORM_DTYPE)
    }

    /// Copy of every tensor converted to `dtype`
    pub fn to_dtype(&self, dtype: DType) -> Result<HashMap<String, Tensor>> {
        self.weights
            .iter()
            .map(|(name, tensor)| -> Result<(String, Tensor)> {
                let converted = if tensor.dtype() == dtype {
                    tensor.clone()
                } else {
                    tensor.to_dtype(dtype)?
                };
                Ok((name.clone(), converted))
            })
            .collect()
    }

    /// Total number of scalar parameters across all tensors
    pub fn parameter_count(&self) -> usize {
        self.weights.values().map(Tensor::elem_count).sum()
    }

    /// Pair down/up projection tensors into low-rank layers
    ///
    /// Understands kohya (`.lora_down`/`.lora_up` + `.alpha`) and PEFT
    /// (`.lora_A`/`.lora_B`) naming. Sorted by layer name.
    pub fn layers(&self) -> Result<Vec<LoraLayer>> {
        let mut alpha_values: HashMap<String, f32> = HashMap::new();
        let mut down_ranks: HashMap<String, usize> = HashMap::new();
        let mut up_names: HashSet<String> = HashSet::new();

        for (key, tensor) in &self.weights {
            if let Some(base_name) = key.strip_suffix(".alpha") {
                let alpha = tensor
                    .to_dtype(DType::F32)?
                    .flatten_all()?
                    .to_vec1::<f32>()?
                    .first()
                    .copied();
                match alpha {
                    Some(alpha) => {
                        debug!(key = %key, alpha, "Extracted alpha value");
                        alpha_values.insert(base_name.to_string(), alpha);
                    }
                    None => warn!(key = %key, "Empty alpha tensor"),
                }
            } else if is_down_key(key) {
                let rank = tensor.dims().first().copied().unwrap_or(0);
                down_ranks.insert(extract_lora_base_name(key), rank);
            } else if is_up_key(key) {
                up_names.insert(extract_lora_base_name(key));
            }
        }

        let mut layers = Vec::with_capacity(down_ranks.len());
        for (name, rank) in down_ranks {
            if !up_names.remove(&name) {
                warn!(layer = %name, "LoRA down tensor without matching up tensor");
                continue;
            }
            let alpha = alpha_values.get(&name).copied().unwrap_or(rank as f32);
            layers.push(LoraLayer { name, rank, alpha });
        }

        for name in &up_names {
            warn!(layer = %name, "LoRA up tensor without matching down tensor");
        }

        layers.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(layers)
    }
}

fn is_down_key(key: &str) -> bool {
    key.contains(".lora_down.") || key.contains(".lora_A.")
}

fn is_up_key(key: &str) -> bool {
    key.contains(".lora_up.") || key.contains(".lora_B.")
}

/// Extract the base layer name from a LoRA key
/// e.g., "lora_unet_layers_0_attention_to_q.lora_down.weight" -> "lora_unet_layers_0_attention_to_q"
fn extract_lora_base_name(key: &str) -> String {
    let key = key.strip_suffix(".weight").unwrap_or(key);

    [".lora_down", ".lora_up", ".lora_A", ".lora_B"]
        .iter()
        .find_map(|marker| key.rfind(marker).map(|pos| key[..pos].to_string()))
        .unwrap_or_else(|| key.to_string())
}
