//! Safetensors persistence for a [`VarMap`](candle_nn::VarMap).
//!
//! Small models are written to a single `model.safetensors`. When a size
//! limit is given and the parameters exceed it, tensors are packed in name
//! order into `model-00001-of-0000N.safetensors` shards and an index file
//! maps every tensor name to its shard.

use std::collections::{BTreeMap, HashMap};
use std::fs;
use std::path::{Path, PathBuf};

use candle_core::{Device, Tensor};
use candle_nn::VarMap;
use serde::{Deserialize, Serialize};

use crate::config::CONFIG_FILE;
use crate::errors::{Error, Result};

pub const WEIGHTS_FILE: &str = "model.safetensors";
pub const WEIGHTS_INDEX_FILE: &str = "model.safetensors.index.json";

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct IndexMetadata {
    pub total_size: usize,
}

/// Contents of `model.safetensors.index.json`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ShardIndex {
    pub metadata: IndexMetadata,
    pub weight_map: BTreeMap<String, String>,
}

impl ShardIndex {
    /// Distinct shard file names in order.
    pub fn shard_files(&self) -> Vec<String> {
        let mut files: Vec<String> = self.weight_map.values().cloned().collect();
        files.sort();
        files.dedup();
        files
    }
}

pub fn has_config(dir: &Path) -> bool {
    dir.join(CONFIG_FILE).is_file()
}

fn tensor_bytes(tensor: &Tensor) -> usize {
    tensor.elem_count() * tensor.dtype().size_in_bytes()
}

fn shard_name(index: usize, total: usize) -> String {
    format!("model-{:05}-of-{:05}.safetensors", index + 1, total)
}

fn is_shard_name(name: &str) -> bool {
    let Some(middle) = name
        .strip_prefix("model-")
        .and_then(|rest| rest.strip_suffix(".safetensors"))
    else {
        return false;
    };
    let Some((index, total)) = middle.split_once("-of-") else {
        return false;
    };
    [index, total]
        .iter()
        .all(|part| part.len() == 5 && part.bytes().all(|b| b.is_ascii_digit()))
}

/// Removes shard files left by an earlier save in `dir`.
fn remove_stale_shards(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let stale = entry.file_name().to_str().is_some_and(is_shard_name);
        if stale && entry.path().is_file() {
            fs::remove_file(entry.path())?;
        }
    }
    Ok(())
}

fn snapshot(varmap: &VarMap) -> BTreeMap<String, Tensor> {
    let data = match varmap.data().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    data.iter()
        .map(|(name, var)| (name.clone(), var.as_tensor().clone()))
        .collect()
}

/// Groups tensors in name order so that no shard exceeds `max_bytes`,
/// except a single tensor that is larger on its own.
fn plan_shards(tensors: &BTreeMap<String, Tensor>, max_bytes: usize) -> Vec<Vec<String>> {
    let mut shards: Vec<Vec<String>> = Vec::new();
    let mut current = Vec::new();
    let mut current_bytes = 0usize;
    for (name, tensor) in tensors {
        let bytes = tensor_bytes(tensor);
        if !current.is_empty() && current_bytes + bytes > max_bytes {
            shards.push(std::mem::take(&mut current));
            current_bytes = 0;
        }
        current.push(name.clone());
        current_bytes += bytes;
    }
    if !current.is_empty() {
        shards.push(current);
    }
    shards
}

fn save_file(tensors: &BTreeMap<String, Tensor>, names: &[String], path: &Path) -> Result<()> {
    let subset: HashMap<String, Tensor> = names
        .iter()
        .filter_map(|name| {
            tensors
                .get(name)
                .map(|tensor| (name.clone(), tensor.to_device(&Device::Cpu)))
        })
        .map(|(name, tensor)| tensor.map(|t| (name, t)))
        .collect::<candle_core::Result<_>>()?;
    candle_core::safetensors::save(&subset, path)?;
    Ok(())
}

/// Writes the parameters in `varmap` to `dir` and returns the weight files written.
pub fn save_weights(varmap: &VarMap, dir: &Path, max_shard_bytes: Option<usize>) -> Result<Vec<PathBuf>> {
    fs::create_dir_all(dir)?;
    remove_stale_shards(dir)?;
    let tensors = snapshot(varmap);
    let total_size: usize = tensors.values().map(tensor_bytes).sum();

    let shard_limit = max_shard_bytes.filter(|limit| total_size > *limit);
    let Some(limit) = shard_limit else {
        let path = dir.join(WEIGHTS_FILE);
        let names: Vec<String> = tensors.keys().cloned().collect();
        save_file(&tensors, &names, &path)?;
        let stale_index = dir.join(WEIGHTS_INDEX_FILE);
        if stale_index.exists() {
            fs::remove_file(stale_index)?;
        }
        log::info!("saved {} tensors to {}", names.len(), path.display());
        return Ok(vec![path]);
    };

    let shards = plan_shards(&tensors, limit);
    let mut index = ShardIndex {
        metadata: IndexMetadata { total_size },
        weight_map: BTreeMap::new(),
    };
    let mut written = Vec::with_capacity(shards.len());
    for (i, names) in shards.iter().enumerate() {
        let file = shard_name(i, shards.len());
        let path = dir.join(&file);
        save_file(&tensors, names, &path)?;
        for name in names {
            index.weight_map.insert(name.clone(), file.clone());
        }
        written.push(path);
    }
    fs::write(dir.join(WEIGHTS_INDEX_FILE), serde_json::to_string_pretty(&index)?)?;
    let single = dir.join(WEIGHTS_FILE);
    if single.exists() {
        fs::remove_file(single)?;
    }
    log::info!(
        "saved {} tensors ({} bytes) in {} shards under {}",
        tensors.len(),
        total_size,
        written.len(),
        dir.display()
    );
    Ok(written)
}

pub fn read_index(dir: &Path) -> Result<ShardIndex> {
    let raw = fs::read_to_string(dir.join(WEIGHTS_INDEX_FILE))?;
    Ok(serde_json::from_str(&raw)?)
}

/// Weight files backing the checkpoint in `dir`, single file first.
pub fn weight_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let single = dir.join(WEIGHTS_FILE);
    if single.is_file() {
        return Ok(vec![single]);
    }
    if dir.join(WEIGHTS_INDEX_FILE).is_file() {
        let index = read_index(dir)?;
        return Ok(index.shard_files().into_iter().map(|f| dir.join(f)).collect());
    }
    Err(Error::checkpoint(format!(
        "no {} or {} in {}",
        WEIGHTS_FILE,
        WEIGHTS_INDEX_FILE,
        dir.display()
    )))
}

/// Reads every tensor of the checkpoint in `dir` onto the CPU.
pub fn read_weights(dir: &Path) -> Result<HashMap<String, Tensor>> {
    let mut tensors = HashMap::new();
    for path in weight_files(dir)? {
        let shard = candle_core::safetensors::load(&path, &Device::Cpu).map_err(|err| {
            Error::checkpoint(format!("failed to read {}: {}", path.display(), err))
        })?;
        tensors.extend(shard);
    }
    Ok(tensors)
}

/// Copies `tensors` into the matching variables, converting device and dtype as needed.
pub fn apply_weights(varmap: &VarMap, tensors: &HashMap<String, Tensor>) -> Result<()> {
    let data = match varmap.data().lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    };
    for (name, var) in data.iter() {
        let tensor = tensors
            .get(name)
            .ok_or_else(|| Error::checkpoint(format!("missing tensor '{name}'")))?;
        if tensor.dims() != var.dims() {
            return Err(Error::checkpoint(format!(
                "shape mismatch for '{}': checkpoint {:?}, model {:?}",
                name,
                tensor.dims(),
                var.dims()
            )));
        }
        let value = tensor.to_dtype(var.dtype())?.to_device(var.device())?;
        var.set(&value)?;
    }
    if tensors.len() > data.len() {
        log::warn!(
            "checkpoint has {} tensors but the model only uses {}",
            tensors.len(),
            data.len()
        );
    }
    Ok(())
}
