use std::{
    collections::BTreeMap,
    fs::{self, File, OpenOptions},
    io::{BufWriter, Write},
    path::{Path, PathBuf},
    time::{SystemTime, UNIX_EPOCH},
};

use bytes::BytesMut;
use crc32fast::Hasher as Crc32;
use prost::Message;
use serde::Serialize;
use serde_json::Value;

use crate::TrainingError;

pub const KV_LOG_FILE: &str = "log.jsonl";

pub const METRICS_CSV_HEADER: [&str; 7] = [
    "step",
    "progress",
    "train_loss",
    "train_accuracy",
    "validation_loss",
    "test_loss",
    "lr",
];

/// Key-value experiment logger.
///
/// Values set with [`KvLogger::logkv`] accumulate until [`KvLogger::dumpkvs`]
/// writes them as one JSON object to `log.jsonl`, and numeric values as
/// TensorBoard scalars when enabled. A disabled logger drops every dump.
pub struct KvLogger {
    dir: Option<PathBuf>,
    sink: Option<BufWriter<File>>,
    tensorboard: Option<TensorBoardWriter>,
    pending: BTreeMap<String, Value>,
    dumps: usize,
}

impl std::fmt::Debug for KvLogger {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KvLogger")
            .field("dir", &self.dir)
            .field("tensorboard", &self.tensorboard.is_some())
            .field("dumps", &self.dumps)
            .finish()
    }
}

impl KvLogger {
    pub fn create(dir: &Path, tensorboard: bool) -> Result<Self, TrainingError> {
        fs::create_dir_all(dir).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create log directory {}: {err}",
                dir.display()
            ))
        })?;
        let path = dir.join(KV_LOG_FILE);
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .map_err(|err| {
                TrainingError::runtime(format!("failed to open {}: {err}", path.display()))
            })?;
        let tensorboard = if tensorboard {
            Some(TensorBoardWriter::create(dir, 16)?)
        } else {
            None
        };
        log::info!("logging experiment values to {}", path.display());
        Ok(Self {
            dir: Some(dir.to_path_buf()),
            sink: Some(BufWriter::new(file)),
            tensorboard,
            pending: BTreeMap::new(),
            dumps: 0,
        })
    }

    pub fn disabled() -> Self {
        Self {
            dir: None,
            sink: None,
            tensorboard: None,
            pending: BTreeMap::new(),
            dumps: 0,
        }
    }

    pub fn dir(&self) -> Option<&Path> {
        self.dir.as_deref()
    }

    pub fn logkv(&mut self, key: &str, value: impl Into<Value>) {
        self.pending.insert(key.to_string(), value.into());
    }

    pub fn logkvs<K, V, I>(&mut self, values: I)
    where
        K: Into<String>,
        V: Into<Value>,
        I: IntoIterator<Item = (K, V)>,
    {
        for (key, value) in values {
            self.pending.insert(key.into(), value.into());
        }
    }

    /// Values logged since the last dump.
    pub fn pending(&self) -> &BTreeMap<String, Value> {
        &self.pending
    }

    pub fn dumpkvs(&mut self) -> Result<(), TrainingError> {
        if self.pending.is_empty() {
            return Ok(());
        }
        let values = std::mem::take(&mut self.pending);
        let step = values
            .get("step")
            .and_then(Value::as_i64)
            .unwrap_or(self.dumps as i64);
        self.dumps += 1;

        if let Some(sink) = self.sink.as_mut() {
            serde_json::to_writer(&mut *sink, &values)
                .map_err(|err| TrainingError::runtime(format!("failed to write log entry: {err}")))?;
            sink.write_all(b"\n")?;
            sink.flush()?;
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            for (tag, value) in &values {
                if tag == "step" {
                    continue;
                }
                if let Some(number) = value.as_f64() {
                    writer.write_scalar(tag, step, number)?;
                }
            }
        }
        Ok(())
    }

    pub fn flush(&mut self) -> Result<(), TrainingError> {
        self.dumpkvs()?;
        if let Some(sink) = self.sink.as_mut() {
            sink.flush()?;
        }
        if let Some(writer) = self.tensorboard.as_mut() {
            writer.flush()?;
        }
        Ok(())
    }
}

/// One row of the per-interval metrics file.
#[derive(Debug, Clone, Copy, Serialize)]
pub struct MetricsRow {
    pub step: usize,
    pub progress: f64,
    pub train_loss: f64,
    pub train_accuracy: f64,
    pub validation_loss: Option<f64>,
    pub test_loss: Option<f64>,
    pub lr: f64,
}

/// Append-only CSV of [`MetricsRow`]s; missing losses are written as empty fields.
pub struct MetricsCsv {
    path: PathBuf,
    writer: csv::Writer<File>,
    rows: usize,
}

impl MetricsCsv {
    pub fn create(path: &Path) -> Result<Self, TrainingError> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }
        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_path(path)?;
        writer.write_record(METRICS_CSV_HEADER)?;
        writer.flush()?;
        Ok(Self {
            path: path.to_path_buf(),
            writer,
            rows: 0,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn rows(&self) -> usize {
        self.rows
    }

    pub fn write_row(&mut self, row: &MetricsRow) -> Result<(), TrainingError> {
        self.writer.serialize(row)?;
        self.writer.flush()?;
        self.rows += 1;
        Ok(())
    }
}

struct TensorBoardWriter {
    writer: BufWriter<File>,
    flush_every: usize,
    pending: usize,
}

impl TensorBoardWriter {
    fn create(dir: &Path, flush_every: usize) -> Result<Self, TrainingError> {
        let timestamp = current_unix_timestamp();
        let hostname = hostname();
        let filename = format!("events.out.tfevents.{}.{}", timestamp, hostname);
        let path = dir.join(filename);
        let file = File::create(&path).map_err(|err| {
            TrainingError::runtime(format!(
                "failed to create tensorboard file {}: {err}",
                path.display()
            ))
        })?;
        Ok(Self {
            writer: BufWriter::new(file),
            flush_every: flush_every.max(1),
            pending: 0,
        })
    }

    fn write_scalar(&mut self, tag: &str, step: i64, value: f64) -> Result<(), TrainingError> {
        let event = Event {
            wall_time: current_wall_time(),
            step,
            summary: Some(Summary {
                value: vec![summary::Value {
                    tag: tag.to_string(),
                    simple_value: Some(value as f32),
                }],
            }),
        };
        self.write_event(&event)
    }

    fn write_event(&mut self, event: &Event) -> Result<(), TrainingError> {
        let mut buffer = BytesMut::with_capacity(128);
        event.encode(&mut buffer).map_err(|err| {
            TrainingError::runtime(format!("failed to encode tensorboard event: {err}"))
        })?;

        let data = buffer.freeze();
        let len_bytes = (data.len() as u64).to_le_bytes();
        let len_crc = masked_crc32(&len_bytes).to_le_bytes();
        let data_crc = masked_crc32(data.as_ref()).to_le_bytes();

        self.writer
            .write_all(&len_bytes)
            .and_then(|_| self.writer.write_all(&len_crc))
            .and_then(|_| self.writer.write_all(&data))
            .and_then(|_| self.writer.write_all(&data_crc))
            .map_err(|err| {
                TrainingError::runtime(format!("failed to write tensorboard event: {err}"))
            })?;

        self.pending += 1;
        if self.pending >= self.flush_every {
            self.flush()?;
        }
        Ok(())
    }

    fn flush(&mut self) -> Result<(), TrainingError> {
        self.writer.flush().map_err(|err| {
            TrainingError::runtime(format!("failed to flush tensorboard file: {err}"))
        })?;
        self.pending = 0;
        Ok(())
    }
}

impl Drop for TensorBoardWriter {
    fn drop(&mut self) {
        let _ = self.flush();
    }
}

fn masked_crc32(data: &[u8]) -> u32 {
    let mut hasher = Crc32::new();
    hasher.update(data);
    let crc = hasher.finalize();
    ((crc >> 15) | (crc << 17)).wrapping_add(0xa282_ead8)
}

fn current_unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

fn current_wall_time() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|dur| dur.as_secs_f64())
        .unwrap_or(0.0)
}

fn hostname() -> String {
    std::env::var("HOSTNAME")
        .or_else(|_| std::env::var("COMPUTERNAME"))
        .unwrap_or_else(|_| "localhost".to_string())
}

#[derive(Clone, PartialEq, Message)]
struct Event {
    #[prost(double, tag = "1")]
    wall_time: f64,
    #[prost(int64, tag = "2")]
    step: i64,
    #[prost(message, optional, tag = "5")]
    summary: Option<Summary>,
}

#[derive(Clone, PartialEq, Message)]
struct Summary {
    #[prost(message, repeated, tag = "1")]
    value: Vec<summary::Value>,
}

mod summary {
    use prost::Message;

    #[derive(Clone, PartialEq, Message)]
    pub struct Value {
        #[prost(string, tag = "1")]
        pub tag: String,
        #[prost(float, optional, tag = "2")]
        pub simple_value: Option<f32>,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn dumpkvs_writes_one_json_line_per_dump() {
        let dir = tempfile::tempdir().unwrap();
        let mut logger = KvLogger::create(dir.path(), true).unwrap();
        logger.logkvs([("step", Value::from(0)), ("loss", Value::from(0.5))]);
        logger.dumpkvs().unwrap();
        logger.logkv("step", 1);
        logger.logkv("loss", 0.25);
        logger.dumpkvs().unwrap();
        logger.dumpkvs().unwrap();
        logger.flush().unwrap();

        let contents = fs::read_to_string(dir.path().join(KV_LOG_FILE)).unwrap();
        let lines: Vec<Value> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[1]["loss"], Value::from(0.25));

        let events = fs::read_dir(dir.path())
            .unwrap()
            .filter_map(|entry| entry.ok())
            .filter(|entry| entry.file_name().to_string_lossy().starts_with("events.out"))
            .count();
        assert_eq!(events, 1);
    }

    #[test]
    fn disabled_logger_discards_values() {
        let mut logger = KvLogger::disabled();
        logger.logkv("loss", 1.0);
        assert_eq!(logger.pending().len(), 1);
        logger.dumpkvs().unwrap();
        assert!(logger.pending().is_empty());
        assert!(logger.dir().is_none());
    }

    #[test]
    fn csv_writes_header_and_blank_missing_losses() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.csv");
        let mut csv = MetricsCsv::create(&path).unwrap();
        csv.write_row(&MetricsRow {
            step: 0,
            progress: 0.0,
            train_loss: 0.69,
            train_accuracy: 0.5,
            validation_loss: None,
            test_loss: Some(0.7),
            lr: 1e-3,
        })
        .unwrap();
        assert_eq!(csv.rows(), 1);

        let contents = fs::read_to_string(&path).unwrap();
        let mut lines = contents.lines();
        assert_eq!(
            lines.next().unwrap(),
            "step,progress,train_loss,train_accuracy,validation_loss,test_loss,lr"
        );
        let row: Vec<&str> = lines.next().unwrap().split(',').collect();
        assert_eq!(row.len(), 7);
        assert_eq!(row[0], "0");
        assert_eq!(row[4], "");
        assert_eq!(row[5], "0.7");
    }
}
