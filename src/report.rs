//! Human- and machine-readable summary of a loaded adapter

use serde::Serialize;
use std::collections::BTreeMap;
use std::fmt;
use std::path::{Path, PathBuf};

use crate::lora::LoraModel;

/// Inspection summary of one LoRA adapter
///
/// Accessor errors do not abort the summary; they are collected in
/// `diagnostics` and the affected field is left empty.
#[derive(Debug, Clone, Serialize)]
pub struct LoraSummary {
    pub path: PathBuf,
    pub base_model: Option<String>,
    pub trigger_phrase: Option<String>,
    pub frequent_tag: Option<String>,
    pub trigger_word: Option<String>,
    pub metadata_entries: usize,
    pub tensor_count: usize,
    pub parameter_count: usize,
    /// Tensor count per dtype
    pub dtypes: BTreeMap<String, usize>,
    pub layer_count: usize,
    /// Layer count per rank
    pub ranks: BTreeMap<usize, usize>,
    pub diagnostics: Vec<String>,
}

impl LoraSummary {
    pub fn from_model(path: impl AsRef<Path>, model: &LoraModel) -> Self {
        let mut diagnostics = Vec::new();
        let mut keep = |result: crate::Result<Option<String>>| match result {
            Ok(value) => value,
            Err(e) => {
                diagnostics.push(e.to_string());
                None
            }
        };

        let base_model = keep(model.base_model().map(|v| v.map(str::to_string)));
        let trigger_phrase = keep(model.trigger_phrase().map(|v| v.map(str::to_string)));
        let frequent_tag = keep(model.frequent_tag());

        let mut dtypes = BTreeMap::new();
        for tensor in model.weights().values() {
            *dtypes.entry(format!("{:?}", tensor.dtype())).or_insert(0) += 1;
        }

        let layers = match model.layers() {
            Ok(layers) => layers,
            Err(e) => {
                diagnostics.push(e.to_string());
                Vec::new()
            }
        };
        let mut ranks = BTreeMap::new();
        for layer in &layers {
            *ranks.entry(layer.rank).or_insert(0) += 1;
        }

        Self {
            path: path.as_ref().to_path_buf(),
            base_model,
            trigger_phrase,
            frequent_tag,
            trigger_word: model.trigger_word(),
            metadata_entries: model.metadata().len(),
            tensor_count: model.weights().len(),
            parameter_count: model.parameter_count(),
            dtypes,
            layer_count: layers.len(),
            ranks,
            diagnostics,
        }
    }
}

impl fmt::Display for LoraSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let or_none = |value: &Option<String>| value.clone().unwrap_or_else(|| "-".to_string());

        writeln!(f, "LoRA: {}", self.path.display())?;
        writeln!(f, "  Base model:     {}", or_none(&self.base_model))?;
        writeln!(f, "  Trigger phrase: {}", or_none(&self.trigger_phrase))?;
        writeln!(f, "  Frequent tag:   {}", or_none(&self.frequent_tag))?;
        writeln!(f, "  Trigger word:   {}", or_none(&self.trigger_word))?;
        writeln!(f, "  Metadata:       {} entries", self.metadata_entries)?;
        writeln!(
            f,
            "  Tensors:        {} ({} parameters)",
            self.tensor_count, self.parameter_count
        )?;
        for (dtype, count) in &self.dtypes {
            writeln!(f, "    {dtype}: {count}")?;
        }
        writeln!(f, "  Layers:         {}", self.layer_count)?;
        for (rank, count) in &self.ranks {
            writeln!(f, "    rank {rank}: {count}")?;
        }
        for diagnostic in &self.diagnostics {
            writeln!(f, "  ! {diagnostic}")?;
        }
        Ok(())
    }
}
