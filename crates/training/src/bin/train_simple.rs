use std::{path::PathBuf, str::FromStr};

use clap::Parser;
use serde_json::{Map, Number, Value};
use training::{run_experiment, ExperimentConfig, TrainingError};

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    if let Err(err) = run() {
        log::error!("training failed: {}", err);
        std::process::exit(1);
    }
}

#[derive(Parser, Debug)]
#[command(author, version, about = "Train one strong or weak model and write its weak labels", long_about = None)]
struct Args {
    #[arg(short, long, value_name = "PATH", help = "Path to experiment config file")]
    config: PathBuf,

    #[arg(
        long = "override",
        value_name = "KEY=VALUE",
        help = "Override configuration value using dot-separated paths, e.g. loss_options.aux_coef=0.3"
    )]
    overrides: Vec<OverrideArg>,
}

#[derive(Debug, Clone)]
struct OverrideArg {
    path: String,
    value: String,
}

impl FromStr for OverrideArg {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (path, value) = s
            .split_once('=')
            .ok_or_else(|| "override must be in the form key=value".to_string())?;
        if path.trim().is_empty() {
            return Err("override key must not be empty".into());
        }
        Ok(Self {
            path: path.trim().to_string(),
            value: value.trim().to_string(),
        })
    }
}

fn run() -> Result<(), TrainingError> {
    let args = Args::parse();

    let mut config = ExperimentConfig::load(&args.config)?;
    if !args.overrides.is_empty() {
        config = apply_overrides(config, &args.overrides)?;
        config.validate()?;
    }

    let outcome = run_experiment(&config)?;
    log::info!("finished {}", outcome.config_name);
    if let Some(path) = &outcome.weak_labels_path {
        log::info!("weak labels: {}", path.display());
    }
    log::info!("summary: {}", outcome.summary_path.display());
    Ok(())
}

fn apply_overrides(
    config: ExperimentConfig,
    overrides: &[OverrideArg],
) -> Result<ExperimentConfig, TrainingError> {
    let mut value = serde_json::to_value(config).map_err(|err| {
        TrainingError::runtime(format!("failed to serialize config for overrides: {err}"))
    })?;

    for override_arg in overrides {
        let new_value = parse_override_value(&override_arg.value);
        set_value_at_path(&mut value, &override_arg.path, new_value)?;
    }

    serde_json::from_value(value).map_err(|err| {
        TrainingError::invalid(format!("config is invalid after overrides: {err}"))
    })
}

fn parse_override_value(raw: &str) -> Value {
    let trimmed = raw.trim();
    if trimmed.eq_ignore_ascii_case("true") {
        return Value::Bool(true);
    }
    if trimmed.eq_ignore_ascii_case("false") {
        return Value::Bool(false);
    }
    if trimmed.eq_ignore_ascii_case("null") {
        return Value::Null;
    }
    if let Ok(int_val) = trimmed.parse::<i64>() {
        return Value::Number(Number::from(int_val));
    }
    if let Some(number) = trimmed.parse::<f64>().ok().and_then(Number::from_f64) {
        return Value::Number(number);
    }
    if trimmed.starts_with('[') || trimmed.starts_with('{') {
        if let Ok(json_val) = serde_json::from_str::<Value>(trimmed) {
            return json_val;
        }
    }
    Value::String(trimmed.to_string())
}

#[derive(Debug)]
struct PathSegment {
    key: String,
    index: Option<usize>,
}

fn parse_path(path: &str) -> Result<Vec<PathSegment>, TrainingError> {
    path.split('.')
        .map(|segment| match segment.split_once('[') {
            Some((base, idx_part)) => {
                let index = idx_part.trim_end_matches(']').parse::<usize>().map_err(|err| {
                    TrainingError::invalid(format!(
                        "invalid index in override path '{}': {}",
                        segment, err
                    ))
                })?;
                Ok(PathSegment {
                    key: base.to_string(),
                    index: Some(index),
                })
            }
            None => Ok(PathSegment {
                key: segment.to_string(),
                index: None,
            }),
        })
        .collect()
}

fn set_value_at_path(target: &mut Value, path: &str, new_value: Value) -> Result<(), TrainingError> {
    let segments = parse_path(path)?;
    let Some((last, parents)) = segments.split_last() else {
        return Err(TrainingError::invalid("override path must not be empty"));
    };

    let mut current = target;
    for segment in parents {
        current = child_slot(current, segment)?;
        if current.is_null() {
            *current = Value::Object(Map::new());
        }
    }
    *child_slot(current, last)? = new_value;
    Ok(())
}

/// Slot addressed by `segment` inside `parent`, created as `null` when absent.
fn child_slot<'a>(parent: &'a mut Value, segment: &PathSegment) -> Result<&'a mut Value, TrainingError> {
    if parent.is_null() {
        *parent = Value::Object(Map::new());
    }
    let Value::Object(map) = parent else {
        return Err(TrainingError::invalid(format!(
            "override path segment '{}' points into a non-object value",
            segment.key
        )));
    };
    let entry = map.entry(segment.key.clone()).or_insert(Value::Null);
    let Some(index) = segment.index else {
        return Ok(entry);
    };
    if entry.is_null() {
        *entry = Value::Array(Vec::new());
    }
    let Value::Array(array) = entry else {
        return Err(TrainingError::invalid(format!(
            "override path segment '{}' expects an array value",
            segment.key
        )));
    };
    if array.len() <= index {
        array.resize(index + 1, Value::Null);
    }
    Ok(&mut array[index])
}
