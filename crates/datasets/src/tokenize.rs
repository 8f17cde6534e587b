use std::path::Path;

use tokenizers::Tokenizer;

use crate::errors::{Error, Result};
use crate::example::Example;

/// Anything that can map text to token ids.
pub trait TextTokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>>;
}

impl TextTokenizer for Tokenizer {
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        let encoding = self
            .encode(text, true)
            .map_err(|err| Error::Tokenizer(err.to_string()))?;
        Ok(encoding.get_ids().to_vec())
    }
}

impl<F> TextTokenizer for F
where
    F: Fn(&str) -> Vec<u32>,
{
    fn encode_ids(&self, text: &str) -> Result<Vec<u32>> {
        Ok(self(text))
    }
}

pub fn load_tokenizer(path: impl AsRef<Path>) -> Result<Tokenizer> {
    let path = path.as_ref();
    Tokenizer::from_file(path).map_err(|err| {
        Error::Tokenizer(format!(
            "failed to load tokenizer json {}: {}",
            path.display(),
            err
        ))
    })
}

/// Fills `input_ids` and drops every example whose length reaches `max_ctx`.
pub fn tokenize_dataset<T>(examples: Vec<Example>, tokenizer: &T, max_ctx: usize) -> Result<Vec<Example>>
where
    T: TextTokenizer + ?Sized,
{
    let before = examples.len();
    let mut kept = Vec::with_capacity(before);
    for mut example in examples {
        example.input_ids = tokenizer.encode_ids(&example.txt)?;
        if example.input_ids.len() < max_ctx {
            kept.push(example);
        }
    }
    if kept.len() < before {
        log::debug!(
            "dropped {} of {} examples at max_ctx={}",
            before - kept.len(),
            before,
            max_ctx
        );
    }
    Ok(kept)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::example::{Example, Formatted};

    fn whitespace(text: &str) -> Vec<u32> {
        text.split_whitespace()
            .map(|word| word.len() as u32)
            .collect()
    }

    fn examples(texts: &[&str]) -> Vec<Example> {
        texts
            .iter()
            .map(|txt| {
                Example::from_formatted(Formatted {
                    txt: txt.to_string(),
                    hard_label: 0,
                })
            })
            .collect()
    }

    #[test]
    fn drops_examples_at_or_above_max_ctx() {
        let ds = examples(&["one", "one two", "one two three"]);
        let out = tokenize_dataset(ds, &whitespace, 3).unwrap();
        let lengths: Vec<usize> = out.iter().map(|ex| ex.input_ids.len()).collect();
        assert_eq!(lengths, vec![1, 2]);
        assert_eq!(out[1].input_ids, vec![3, 3]);
    }

    #[test]
    fn zero_context_keeps_nothing() {
        let ds = examples(&["", "a", "a b"]);
        let out = tokenize_dataset(ds, &whitespace, 0).unwrap();
        assert!(out.is_empty());
    }
}
