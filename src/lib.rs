//! LoRA adapter inspection for text-to-image pipelines
//!
//! Loads LoRA adapters stored as safetensors, reads their training metadata,
//! and works out the trigger word that has to appear in a prompt for the
//! adapter to take effect.
//!
//! ## Features
//!
//! - **Typed metadata**: values of any JSON type are kept, and string fields
//!   are checked by pattern match instead of being coerced
//! - **Trigger word discovery**: declared trigger phrase first, then the most
//!   frequent training tag, never failing the caller
//! - **Precision conversion**: bf16 copy of every tensor for the pipeline
//! - **Generation glue**: resolution, seed and prompt handling for requests
//!
//! ## Usage
//!
//! ```rust,ignore
//! use lora_inspect::generation::{compose_prompt, GenerationRequest};
//! use lora_inspect::lora::LoraModel;
//!
//! fn main() -> anyhow::Result<()> {
//!     let lora = LoraModel::load("path/to/lora.safetensors")?;
//!
//!     // Best effort: None when the metadata has nothing usable
//!     let trigger = lora.trigger_word();
//!     let prompt = compose_prompt("a cat sitting on a windowsill", trigger.as_deref());
//!
//!     let request = GenerationRequest::new(prompt, "1280x720", 42, false, 8, &mut rand::thread_rng());
//!     let weights = lora.to_uniform_precision()?;
//!     println!("{} tensors, {}", weights.len(), serde_json::to_string(&request)?);
//!
//!     Ok(())
//! }
//! ```

pub mod container;
pub mod error;
pub mod generation;
pub mod lora;
pub mod metadata;
pub mod report;

pub use error::{ErrorKind, LoraError, Result};
pub use lora::{LoraLayer, LoraModel};
pub use metadata::{Metadata, MetadataValue};
pub use report::LoraSummary;
