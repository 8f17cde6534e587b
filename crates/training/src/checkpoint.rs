use std::{
    fs::{self, File},
    io::{Read, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use hex::encode as hex_encode;
use model::{weight_files, TransformerWithHead};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::{eval::EvalRecord, TrainingError};

pub const MARKER_VERSION: u32 = 1;
/// Written last; its presence means the run under this directory finished.
pub const RESULTS_MARKER: &str = "results.txt";
pub const RESULTS_FILE: &str = "results.json";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileRecord {
    pub filename: String,
    pub sha256: String,
    pub bytes: u64,
}

/// Contents of [`RESULTS_MARKER`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsMarker {
    pub version: u32,
    pub created_unix_timestamp: u64,
    pub weights: Vec<FileRecord>,
    #[serde(with = "nan_as_null")]
    pub avg_acc_test: f64,
    #[serde(with = "nan_as_null")]
    pub avg_acc_inference: f64,
}

/// Contents of [`RESULTS_FILE`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResultsSummary {
    #[serde(with = "nan_as_null")]
    pub avg_acc_test: f64,
    /// NaN when no inference set was evaluated.
    #[serde(with = "nan_as_null")]
    pub avg_acc_inference: f64,
    pub test_results: Vec<EvalRecord>,
    pub inference_results: Vec<EvalRecord>,
}

/// Result of trying to resume from a finished run.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LoadOutcome {
    Loaded,
    NotFound,
    Corrupt(String),
}

impl LoadOutcome {
    pub fn is_loaded(&self) -> bool {
        matches!(self, LoadOutcome::Loaded)
    }
}

/// Restores the weights saved under `save_path` if that run finished and `force_retrain` is off.
pub fn maybe_load_model(
    model: &mut TransformerWithHead,
    save_path: &Path,
    force_retrain: bool,
) -> LoadOutcome {
    log::info!("Save path: {}", save_path.display());
    let marker_path = save_path.join(RESULTS_MARKER);
    if !marker_path.is_file() {
        return LoadOutcome::NotFound;
    }
    if force_retrain {
        log::info!("force_retrain set, ignoring {}", marker_path.display());
        return LoadOutcome::NotFound;
    }
    log::info!("loading from {}", save_path.display());

    let outcome = match verify_marker(save_path, &marker_path) {
        Ok(true) => match model.load_weights(save_path) {
            Ok(()) => LoadOutcome::Loaded,
            Err(err) => LoadOutcome::Corrupt(err.to_string()),
        },
        Ok(false) => LoadOutcome::NotFound,
        Err(err) => LoadOutcome::Corrupt(err.to_string()),
    };
    match &outcome {
        LoadOutcome::Loaded => log::info!("resumed trained weights from {}", save_path.display()),
        LoadOutcome::NotFound => log::warn!("no weights found under {}", save_path.display()),
        LoadOutcome::Corrupt(reason) => log::warn!("error loading model: {reason}"),
    }
    outcome
}

/// `Ok(false)` when the weights are missing, `Err` when they do not match the marker.
fn verify_marker(save_path: &Path, marker_path: &Path) -> Result<bool, TrainingError> {
    let marker: ResultsMarker = read_json(marker_path)?;
    if marker.version != MARKER_VERSION {
        return Err(TrainingError::runtime(format!(
            "unsupported results marker version {} (expected {})",
            marker.version, MARKER_VERSION
        )));
    }
    let Ok(files) = weight_files(save_path) else {
        return Ok(false);
    };
    let mut names: Vec<String> = files.iter().filter_map(|path| file_name(path)).collect();
    names.sort();
    let mut recorded: Vec<String> = marker.weights.iter().map(|r| r.filename.clone()).collect();
    recorded.sort();
    if names != recorded {
        return Err(TrainingError::runtime(format!(
            "weight files {:?} do not match the recorded {:?}",
            names, recorded
        )));
    }
    for record in &marker.weights {
        validate_file(&save_path.join(&record.filename), &record.sha256)?;
    }
    Ok(true)
}

/// Writes [`RESULTS_FILE`] and then the [`RESULTS_MARKER`] covering `weights`.
pub fn save_results(
    save_path: &Path,
    weights: &[PathBuf],
    summary: &ResultsSummary,
) -> Result<(), TrainingError> {
    fs::create_dir_all(save_path)?;
    write_json(&save_path.join(RESULTS_FILE), summary)?;

    let weights = weights
        .iter()
        .map(|path| file_record(path))
        .collect::<Result<Vec<_>, _>>()?;
    let marker = ResultsMarker {
        version: MARKER_VERSION,
        created_unix_timestamp: unix_timestamp(),
        weights,
        avg_acc_test: summary.avg_acc_test,
        avg_acc_inference: summary.avg_acc_inference,
    };
    write_json(&save_path.join(RESULTS_MARKER), &marker)
}

pub fn read_results(save_path: &Path) -> Result<ResultsSummary, TrainingError> {
    read_json(&save_path.join(RESULTS_FILE))
}

fn file_name(path: &Path) -> Option<String> {
    path.file_name()
        .and_then(|name| name.to_str())
        .map(str::to_string)
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn file_record(path: &Path) -> Result<FileRecord, TrainingError> {
    let sha = sha256_file(path)?;
    let bytes = path
        .metadata()
        .map_err(|err| {
            TrainingError::runtime(format!(
                "failed to stat weight file {}: {err}",
                path.display()
            ))
        })?
        .len();
    let filename = file_name(path).ok_or_else(|| {
        TrainingError::runtime(format!(
            "weight file name is not valid UTF-8: {}",
            path.display()
        ))
    })?;
    Ok(FileRecord {
        filename,
        sha256: sha,
        bytes,
    })
}

fn validate_file(path: &Path, expected_sha: &str) -> Result<(), TrainingError> {
    let actual = sha256_file(path)?;
    if actual != expected_sha {
        return Err(TrainingError::runtime(format!(
            "weight file {} failed checksum validation",
            path.display()
        )));
    }
    Ok(())
}

pub fn sha256_file(path: &Path) -> Result<String, TrainingError> {
    let mut file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; 1024 * 1024];
    loop {
        let read = file.read(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to read {}: {err}", path.display()))
        })?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(hex_encode(hasher.finalize()))
}

pub(crate) fn write_json<T: Serialize>(path: &Path, value: &T) -> Result<(), TrainingError> {
    let mut file = File::create(path).map_err(|err| {
        TrainingError::runtime(format!("failed to create {}: {err}", path.display()))
    })?;
    let data = serde_json::to_vec_pretty(value)
        .map_err(|err| TrainingError::runtime(format!("failed to serialize JSON: {err}")))?;
    file.write_all(&data).map_err(|err| {
        TrainingError::runtime(format!("failed to write {}: {err}", path.display()))
    })?;
    file.write_all(b"\n")
        .map_err(|err| TrainingError::runtime(format!("failed to write {}: {err}", path.display())))
}

pub(crate) fn read_json<T: for<'de> Deserialize<'de>>(path: &Path) -> Result<T, TrainingError> {
    let file = File::open(path).map_err(|err| {
        TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
    })?;
    serde_json::from_reader(file).map_err(|err| {
        TrainingError::runtime(format!("failed to parse JSON {}: {err}", path.display()))
    })
}

/// JSON has no NaN; store it as `null`.
mod nan_as_null {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_none()
        } else {
            serializer.serialize_some(value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        Ok(Option::<f64>::deserialize(deserializer)?.unwrap_or(f64::NAN))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn summary() -> ResultsSummary {
        ResultsSummary {
            avg_acc_test: 0.75,
            avg_acc_inference: f64::NAN,
            test_results: Vec::new(),
            inference_results: Vec::new(),
        }
    }

    #[test]
    fn results_round_trip_keeps_nan() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.safetensors");
        fs::write(&weights, b"weights").unwrap();
        save_results(dir.path(), &[weights], &summary()).unwrap();

        let loaded = read_results(dir.path()).unwrap();
        assert_eq!(loaded.avg_acc_test, 0.75);
        assert!(loaded.avg_acc_inference.is_nan());

        let marker: ResultsMarker = read_json(&dir.path().join(RESULTS_MARKER)).unwrap();
        assert_eq!(marker.weights.len(), 1);
        assert_eq!(marker.weights[0].filename, "model.safetensors");
        assert_eq!(marker.weights[0].bytes, 7);
        assert_eq!(marker.weights[0].sha256, sha256_file(&dir.path().join("model.safetensors")).unwrap());
    }

    #[test]
    fn sha_mismatch_is_detected() {
        let dir = tempfile::tempdir().unwrap();
        let weights = dir.path().join("model.safetensors");
        fs::write(&weights, b"weights").unwrap();
        save_results(dir.path(), &[weights.clone()], &summary()).unwrap();
        assert!(verify_marker(dir.path(), &dir.path().join(RESULTS_MARKER)).unwrap());

        fs::write(&weights, b"tampered").unwrap();
        assert!(verify_marker(dir.path(), &dir.path().join(RESULTS_MARKER)).is_err());

        fs::remove_file(&weights).unwrap();
        assert!(!verify_marker(dir.path(), &dir.path().join(RESULTS_MARKER)).unwrap());
    }

    #[test]
    fn sha256_matches_known_digest() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("abc");
        fs::write(&path, b"abc").unwrap();
        assert_eq!(
            sha256_file(&path).unwrap(),
            "ba7816bf8f01cfea414140de5dae2223b00361a396177a9cb410ff61f20015ad"
        );
    }
}
