//! Persistence for model-produced labels.
//!
//! A weak model's predictions on held-out data become the training set of
//! the strong model. Unlike formatter output, the soft labels stored here
//! are the weak model's probabilities and need not be one-hot.

use std::fs::File;
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::Path;

use crate::errors::{Error, Result};
use crate::example::Example;

pub fn save_examples(path: impl AsRef<Path>, examples: &[Example]) -> Result<()> {
    let path = path.as_ref();
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    let mut writer = BufWriter::new(File::create(path)?);
    for example in examples {
        serde_json::to_writer(&mut writer, example)?;
        writer.write_all(b"\n")?;
    }
    writer.flush()?;
    log::info!("wrote {} labeled examples to {}", examples.len(), path.display());
    Ok(())
}

pub fn load_examples(path: impl AsRef<Path>) -> Result<Vec<Example>> {
    let path = path.as_ref();
    let reader = BufReader::new(File::open(path)?);
    let mut examples = Vec::new();
    for line in reader.lines() {
        let line = line?;
        if line.trim().is_empty() {
            continue;
        }
        let example: Example = serde_json::from_str(&line)?;
        if example.hard_label > 1 {
            return Err(Error::Format(format!(
                "{}: hard_label must be 0 or 1",
                path.display()
            )));
        }
        examples.push(example);
    }
    Ok(examples)
}

/// Splits a training set into the weak model's half and the half it will label.
pub fn split_halves(mut examples: Vec<Example>) -> (Vec<Example>, Vec<Example>) {
    let second = examples.split_off(examples.len() / 2);
    (examples, second)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn example(txt: &str, soft: [f32; 2]) -> Example {
        Example {
            txt: txt.to_string(),
            hard_label: u8::from(soft[1] > soft[0]),
            soft_label: soft,
            input_ids: vec![1, 2, 3],
        }
    }

    #[test]
    fn saved_weak_labels_reload_unchanged() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested/weak_labels.jsonl");
        let data = vec![example("a", [0.8, 0.2]), example("b", [0.35, 0.65])];
        save_examples(&path, &data).unwrap();
        assert_eq!(load_examples(&path).unwrap(), data);
    }

    #[test]
    fn halves_cover_the_whole_set() {
        let data: Vec<Example> = (0..5)
            .map(|i| example(&i.to_string(), [1.0, 0.0]))
            .collect();
        let (first, second) = split_halves(data);
        assert_eq!(first.len(), 2);
        assert_eq!(second.len(), 3);
        assert_eq!(second[0].txt, "2");
    }
}
