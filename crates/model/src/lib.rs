//! GPT-2 style sequence classifier built on `candle-nn`.
//!
//! [`TransformerWithHead`] runs token ids through a decoder-only backbone,
//! takes the final hidden state of the last non-pad token and projects it to
//! `num_labels` logits. Blocks can be spread over several devices.

pub mod block;
pub mod config;
pub mod errors;
pub mod model;
pub mod persistence;

pub use block::Block;
pub use config::{parse_dtype, ArchitectureConfig};
pub use errors::{Error, Result};
pub use model::{block_device_map, Classifier, LoadOptions, TransformerWithHead};
pub use persistence::{weight_files, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
