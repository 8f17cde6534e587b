use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One raw record as produced by a split loader.
pub type RawItem = Map<String, Value>;

/// Formatter output: the text shown to the model and its binary label.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Formatted {
    pub txt: String,
    pub hard_label: u8,
}

/// A formatted (and later tokenized) example.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Example {
    pub txt: String,
    pub hard_label: u8,
    pub soft_label: [f32; 2],
    #[serde(default)]
    pub input_ids: Vec<u32>,
}

impl Example {
    /// Builds an untokenized example whose soft label is derived from the hard label.
    pub fn from_formatted(formatted: Formatted) -> Self {
        let soft_label = soft_label_for(formatted.hard_label);
        Self {
            txt: formatted.txt,
            hard_label: formatted.hard_label,
            soft_label,
            input_ids: Vec::new(),
        }
    }

    /// Index of the larger soft-label entry; ties resolve to class 0.
    pub fn target_class(&self) -> usize {
        if self.soft_label[1] > self.soft_label[0] {
            1
        } else {
            0
        }
    }
}

pub fn soft_label_for(hard_label: u8) -> [f32; 2] {
    let positive = f32::from(hard_label.min(1));
    [1.0 - positive, positive]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn soft_label_matches_hard_label() {
        assert_eq!(soft_label_for(0), [1.0, 0.0]);
        assert_eq!(soft_label_for(1), [0.0, 1.0]);
    }

    #[test]
    fn target_class_follows_soft_label() {
        let mut example = Example::from_formatted(Formatted {
            txt: "x".into(),
            hard_label: 1,
        });
        assert_eq!(example.target_class(), 1);
        example.soft_label = [0.7, 0.3];
        assert_eq!(example.target_class(), 0);
    }
}
