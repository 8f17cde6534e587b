use std::collections::HashMap;
use std::fs::File;
use std::io::{BufRead, BufReader};
use std::path::{Path, PathBuf};

use serde_json::Value;

use crate::errors::{Error, Result};
use crate::example::RawItem;

/// Maps a split name to the unshuffled raw items of that split.
pub trait SplitLoader: Send + Sync {
    fn load(&self, split: &str) -> Result<Vec<RawItem>>;
}

impl<F> SplitLoader for F
where
    F: Fn(&str) -> Result<Vec<RawItem>> + Send + Sync,
{
    fn load(&self, split: &str) -> Result<Vec<RawItem>> {
        self(split)
    }
}

/// Reads `<dir>/<split>.jsonl`, one JSON object per line.
///
/// Split aliases let a dataset publish its held-out data under a different
/// name, e.g. `test` served from `validation.jsonl`.
#[derive(Clone, Debug)]
pub struct JsonlLoader {
    dir: PathBuf,
    split_names: HashMap<String, String>,
}

impl JsonlLoader {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            split_names: HashMap::new(),
        }
    }

    pub fn with_split_name(mut self, split: &str, file_stem: &str) -> Self {
        self.split_names
            .insert(split.to_string(), file_stem.to_string());
        self
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn split_path(&self, split: &str) -> PathBuf {
        let stem = self
            .split_names
            .get(split)
            .map(String::as_str)
            .unwrap_or(split);
        self.dir.join(format!("{stem}.jsonl"))
    }
}

impl SplitLoader for JsonlLoader {
    fn load(&self, split: &str) -> Result<Vec<RawItem>> {
        let path = self.split_path(split);
        log::debug!("reading split '{}' from {}", split, path.display());
        read_jsonl_items(&path).map_err(|err| Error::Split {
            split: split.to_string(),
            path: path.display().to_string(),
            reason: err.to_string(),
        })
    }
}

pub fn read_jsonl_items(path: &Path) -> Result<Vec<RawItem>> {
    let reader = BufReader::new(File::open(path)?);
    let mut items = Vec::new();
    for (line_no, line) in reader.lines().enumerate() {
        let line = line?;
        let trimmed = line.trim();
        if trimmed.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(trimmed)? {
            Value::Object(map) => items.push(map),
            other => {
                return Err(Error::Format(format!(
                    "line {} is not a JSON object: {}",
                    line_no + 1,
                    other
                )))
            }
        }
    }
    Ok(items)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn reads_aliased_split_and_skips_blank_lines() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join("validation.jsonl"),
            "{\"a\": 1}\n\n{\"a\": 2}\n",
        )
        .unwrap();

        let loader = JsonlLoader::new(dir.path()).with_split_name("test", "validation");
        let items = loader.load("test").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items[1]["a"], 2);
    }

    #[test]
    fn missing_split_reports_path() {
        let dir = tempfile::tempdir().unwrap();
        let err = JsonlLoader::new(dir.path()).load("train").unwrap_err();
        assert!(matches!(err, Error::Split { ref split, .. } if split == "train"));
    }

    #[test]
    fn rejects_non_object_lines() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("train.jsonl");
        fs::write(&path, "[1, 2]\n").unwrap();
        assert!(matches!(read_jsonl_items(&path), Err(Error::Format(_))));
    }
}
