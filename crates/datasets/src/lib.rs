//! Dataset registration, formatting and tokenization for weak-to-strong runs.
//!
//! A [`DatasetRegistry`] maps a dataset name to a loader and a formatter.
//! Loading a dataset reads each requested split, caps it at `n_docs`,
//! formats every item into `{txt, hard_label}` with a seeded RNG, derives
//! the one-hot soft label and shuffles with the same seed.

pub mod errors;
pub mod example;
pub mod formatters;
pub mod registry;
pub mod source;
pub mod tokenize;
pub mod weak_labels;

pub use errors::{Error, Result};
pub use example::{soft_label_for, Example, Formatted, RawItem};
pub use registry::{DatasetConfig, DatasetRegistry, Formatter, LoadedSplits, SplitSizes};
pub use source::{JsonlLoader, SplitLoader};
pub use tokenize::{load_tokenizer, tokenize_dataset, TextTokenizer};
pub use tokenizers::Tokenizer;
