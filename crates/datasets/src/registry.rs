use std::collections::BTreeMap;
use std::fmt;
use std::path::Path;
use std::sync::Arc;

use rand::{rngs::StdRng, seq::SliceRandom, SeedableRng};

use crate::errors::{Error, Result};
use crate::example::{Example, Formatted, RawItem};
use crate::formatters;
use crate::source::{JsonlLoader, SplitLoader};

pub type Formatter = Arc<dyn Fn(&RawItem, &mut StdRng) -> Result<Formatted> + Send + Sync>;

/// Loader/formatter pair describing one dataset.
#[derive(Clone)]
pub struct DatasetConfig {
    pub loader: Arc<dyn SplitLoader>,
    pub formatter: Formatter,
}

impl DatasetConfig {
    pub fn new<L, F>(loader: L, formatter: F) -> Self
    where
        L: SplitLoader + 'static,
        F: Fn(&RawItem, &mut StdRng) -> Result<Formatted> + Send + Sync + 'static,
    {
        Self {
            loader: Arc::new(loader),
            formatter: Arc::new(formatter),
        }
    }
}

impl fmt::Debug for DatasetConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DatasetConfig").finish_non_exhaustive()
    }
}

/// Requested splits and their optional item caps, in load order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SplitSizes(Vec<(String, Option<usize>)>);

impl SplitSizes {
    pub fn new() -> Self {
        Self(Vec::new())
    }

    pub fn with(mut self, split: &str, n_docs: Option<usize>) -> Self {
        self.0.push((split.to_string(), n_docs));
        self
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, Option<usize>)> {
        self.0.iter().map(|(split, n)| (split.as_str(), *n))
    }
}

impl Default for SplitSizes {
    fn default() -> Self {
        Self::new().with("train", None).with("test", None)
    }
}

pub type LoadedSplits = BTreeMap<String, Vec<Example>>;

/// Name-keyed collection of datasets, constructed once and passed to call sites.
#[derive(Debug, Default, Clone)]
pub struct DatasetRegistry {
    entries: BTreeMap<String, DatasetConfig>,
}

impl DatasetRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Registry with every built-in dataset, each read from `<data_root>/<dataset dir>`.
    pub fn with_builtin(data_root: impl AsRef<Path>) -> Self {
        let root = data_root.as_ref();
        let mut registry = Self::new();

        registry.register(
            "amazon_polarity",
            DatasetConfig::new(
                JsonlLoader::new(root.join("amazon_polarity")),
                formatters::format_amazon_polarity,
            ),
        );
        registry.register(
            "sciq",
            DatasetConfig::new(JsonlLoader::new(root.join("sciq")), formatters::format_sciq),
        );
        registry.register(
            "anthropic_hh",
            DatasetConfig::new(
                JsonlLoader::new(root.join("Anthropic/hh-rlhf")),
                formatters::format_anthropic_hh,
            ),
        );
        registry.register(
            "cosmos_qa",
            DatasetConfig::new(
                JsonlLoader::new(root.join("cosmos_qa")).with_split_name("test", "validation"),
                formatters::format_cosmos_qa,
            ),
        );
        registry.register(
            "boolq",
            DatasetConfig::new(
                JsonlLoader::new(root.join("boolq")).with_split_name("test", "validation"),
                formatters::format_boolq,
            ),
        );
        registry.register(
            "openbookqa",
            DatasetConfig::new(
                JsonlLoader::new(root.join("allenai/openbookqa/main"))
                    .with_split_name("test", "validation"),
                formatters::format_openbookqa,
            ),
        );
        registry.register(
            "ethics_justice",
            DatasetConfig::new(
                JsonlLoader::new(root.join("hendrycks/ethics/justice")),
                formatters::format_ethics_justice,
            ),
        );
        registry.register(
            "paws_labeled_final",
            DatasetConfig::new(
                JsonlLoader::new(root.join("paws/labeled_final"))
                    .with_split_name("test", "validation"),
                formatters::format_paws,
            ),
        );

        registry
    }

    pub fn register(&mut self, name: &str, config: DatasetConfig) {
        self.entries.insert(name.to_string(), config);
    }

    pub fn contains(&self, name: &str) -> bool {
        self.entries.contains_key(name)
    }

    /// Registered dataset names in sorted order.
    pub fn names(&self) -> Vec<&str> {
        self.entries.keys().map(String::as_str).collect()
    }

    pub fn get(&self, name: &str) -> Result<&DatasetConfig> {
        self.entries
            .get(name)
            .ok_or_else(|| Error::UnknownDataset(name.to_string()))
    }

    /// Loads, formats and shuffles every requested split of `name`.
    ///
    /// Each split gets a fresh RNG seeded with `seed` for formatting and
    /// another one for shuffling, so results depend only on `(name, seed,
    /// split_sizes)`.
    pub fn load(&self, name: &str, seed: u64, split_sizes: &SplitSizes) -> Result<LoadedSplits> {
        let config = self.get(name)?;
        let mut results = BTreeMap::new();

        for (split, n_docs) in split_sizes.iter() {
            let mut items = config.loader.load(split)?;
            if let Some(n_docs) = n_docs {
                if items.len() < n_docs {
                    log::warn!(
                        "{} has less than {} docs in split '{}', using all {}",
                        name,
                        n_docs,
                        split,
                        items.len()
                    );
                } else {
                    items.truncate(n_docs);
                }
            }

            let mut rng = StdRng::seed_from_u64(seed);
            let mut examples = items
                .iter()
                .map(|item| (config.formatter)(item, &mut rng).map(Example::from_formatted))
                .collect::<Result<Vec<_>>>()?;

            let mut shuffle_rng = StdRng::seed_from_u64(seed);
            examples.shuffle(&mut shuffle_rng);

            log::info!(
                "loaded {} split '{}': {} examples",
                name,
                split,
                examples.len()
            );
            results.insert(split.to_string(), examples);
        }

        Ok(results)
    }
}
