//! Per-dataset labeling policies.
//!
//! Every formatter turns one raw item into `{txt, hard_label}`. Some of them
//! draw from the supplied RNG to decide between a correct and an incorrect
//! completion, so the label distribution is balanced by construction.

use rand::{rngs::StdRng, seq::SliceRandom, Rng};
use serde_json::Value;

use crate::errors::{format_error, Result};
use crate::example::{Formatted, RawItem};

const NONE_OF_THE_ABOVE: &str = "None of the above choices";
const NONE_OF_THE_ABOVE_EXACT: &str = "None of the above choices .";

pub fn format_amazon_polarity(item: &RawItem, _rng: &mut StdRng) -> Result<Formatted> {
    let title = str_field(item, "title")?;
    let content = str_field(item, "content")?;
    Ok(Formatted {
        txt: format!("{title} {content}"),
        hard_label: label_field(item, "label")?,
    })
}

pub fn format_sciq(item: &RawItem, rng: &mut StdRng) -> Result<Formatted> {
    let hard_label = coin_flip(rng);
    let answer = if hard_label == 1 {
        str_field(item, "correct_answer")?
    } else {
        let distractors = [
            str_field(item, "distractor1")?,
            str_field(item, "distractor2")?,
            str_field(item, "distractor3")?,
        ];
        pick(&distractors, rng)?
    };
    Ok(Formatted {
        txt: format!("Q: {} A: {}", str_field(item, "question")?, answer),
        hard_label,
    })
}

pub fn format_anthropic_hh(item: &RawItem, rng: &mut StdRng) -> Result<Formatted> {
    let hard_label = coin_flip(rng);
    let key = if hard_label == 1 { "chosen" } else { "rejected" };
    Ok(Formatted {
        txt: str_field(item, key)?.to_string(),
        hard_label,
    })
}

pub fn format_cosmos_qa(item: &RawItem, rng: &mut StdRng) -> Result<Formatted> {
    let label = integer_field(item, "label")?;
    if !(0..4).contains(&label) {
        return Err(format_error(format!("cosmos_qa label {label} out of range")));
    }
    let true_answer = str_field(item, &format!("answer{label}"))?;

    let hard_label = if true_answer.contains(NONE_OF_THE_ABOVE_EXACT) {
        0
    } else if true_answer.contains(NONE_OF_THE_ABOVE) {
        return Err(format_error(format!(
            "unexpected 'none of the above' answer: {true_answer}"
        )));
    } else {
        coin_flip(rng)
    };

    let answer = if hard_label == 1 {
        true_answer
    } else {
        let mut wrong = Vec::with_capacity(3);
        for idx in 0..4 {
            let candidate = str_field(item, &format!("answer{idx}"))?;
            if candidate != true_answer {
                wrong.push(candidate);
            }
        }
        pick(&wrong, rng)?
    };

    Ok(Formatted {
        txt: format!(
            "Context: {}\nQuestion: {}\nAnswer: {}",
            str_field(item, "context")?,
            str_field(item, "question")?,
            answer
        ),
        hard_label,
    })
}

pub fn format_boolq(item: &RawItem, _rng: &mut StdRng) -> Result<Formatted> {
    Ok(Formatted {
        txt: format!(
            "Passage: {}\nQuestion: {}",
            str_field(item, "passage")?,
            str_field(item, "question")?
        ),
        hard_label: label_field(item, "answer")?,
    })
}

/// Every item is rendered with its correct answer, so the label is constant.
pub fn format_openbookqa(item: &RawItem, _rng: &mut StdRng) -> Result<Formatted> {
    let choices = item
        .get("choices")
        .and_then(Value::as_object)
        .ok_or_else(|| format_error("openbookqa item missing 'choices' object"))?;
    let texts = string_list(choices.get("text"), "choices.text")?;
    let labels = string_list(choices.get("label"), "choices.label")?;
    if texts.len() != labels.len() {
        return Err(format_error("openbookqa choices text/label length mismatch"));
    }

    let answer_key = str_field(item, "answerKey")?;
    let correct_index = labels
        .iter()
        .position(|label| *label == answer_key)
        .ok_or_else(|| format_error(format!("answerKey '{answer_key}' not among choices")))?;

    let formatted_choices = labels
        .iter()
        .zip(texts.iter())
        .map(|(label, text)| format!("{label}: {text}"))
        .collect::<Vec<_>>()
        .join(" ");

    Ok(Formatted {
        txt: format!(
            "Question: {}\nChoices: {}\nCorrect Answer: {}",
            str_field(item, "question_stem")?,
            formatted_choices,
            texts[correct_index]
        ),
        hard_label: 1,
    })
}

pub fn format_ethics_justice(item: &RawItem, _rng: &mut StdRng) -> Result<Formatted> {
    Ok(Formatted {
        txt: str_field(item, "text")?.to_string(),
        hard_label: label_field(item, "label")?,
    })
}

pub fn format_paws(item: &RawItem, _rng: &mut StdRng) -> Result<Formatted> {
    Ok(Formatted {
        txt: format!(
            "Sentence 1: {} Sentence 2: {}",
            str_field(item, "sentence1")?,
            str_field(item, "sentence2")?
        ),
        hard_label: label_field(item, "label")?,
    })
}

fn coin_flip(rng: &mut StdRng) -> u8 {
    u8::from(rng.gen::<f64>() < 0.5)
}

fn pick<'a>(candidates: &[&'a str], rng: &mut StdRng) -> Result<&'a str> {
    candidates
        .choose(rng)
        .copied()
        .ok_or_else(|| format_error("no candidate answers to choose from"))
}

fn str_field<'a>(item: &'a RawItem, key: &str) -> Result<&'a str> {
    item.get(key)
        .and_then(Value::as_str)
        .ok_or_else(|| format_error(format!("missing string field '{key}'")))
}

fn integer_field(item: &RawItem, key: &str) -> Result<i64> {
    match item.get(key) {
        Some(Value::Number(n)) => n
            .as_i64()
            .ok_or_else(|| format_error(format!("field '{key}' is not an integer"))),
        Some(Value::Bool(b)) => Ok(i64::from(*b)),
        _ => Err(format_error(format!("missing integer field '{key}'"))),
    }
}

fn label_field(item: &RawItem, key: &str) -> Result<u8> {
    match integer_field(item, key)? {
        0 => Ok(0),
        1 => Ok(1),
        other => Err(format_error(format!(
            "field '{key}' must be a binary label, got {other}"
        ))),
    }
}

fn string_list<'a>(value: Option<&'a Value>, name: &str) -> Result<Vec<&'a str>> {
    value
        .and_then(Value::as_array)
        .ok_or_else(|| format_error(format!("missing list field '{name}'")))?
        .iter()
        .map(|v| {
            v.as_str()
                .ok_or_else(|| format_error(format!("non-string entry in '{name}'")))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use serde_json::json;

    fn item(value: Value) -> RawItem {
        match value {
            Value::Object(map) => map,
            _ => unreachable!(),
        }
    }

    #[test]
    fn sciq_uses_correct_answer_or_a_distractor() {
        let raw = item(json!({
            "question": "What gas do plants absorb?",
            "correct_answer": "carbon dioxide",
            "distractor1": "helium",
            "distractor2": "neon",
            "distractor3": "argon",
        }));
        let mut rng = StdRng::seed_from_u64(0);
        let mut seen = [0usize; 2];
        for _ in 0..64 {
            let out = format_sciq(&raw, &mut rng).unwrap();
            seen[out.hard_label as usize] += 1;
            let answer = out.txt.split(" A: ").nth(1).unwrap();
            if out.hard_label == 1 {
                assert_eq!(answer, "carbon dioxide");
            } else {
                assert!(["helium", "neon", "argon"].contains(&answer));
            }
        }
        assert!(seen[0] > 0 && seen[1] > 0);
    }

    #[test]
    fn cosmos_qa_none_of_the_above_is_negative() {
        let raw = item(json!({
            "context": "ctx",
            "question": "q",
            "answer0": "None of the above choices .",
            "answer1": "b",
            "answer2": "c",
            "answer3": "d",
            "label": 0,
        }));
        let mut rng = StdRng::seed_from_u64(3);
        for _ in 0..16 {
            let out = format_cosmos_qa(&raw, &mut rng).unwrap();
            assert_eq!(out.hard_label, 0);
            assert!(!out.txt.ends_with("None of the above choices ."));
        }
    }

    #[test]
    fn cosmos_qa_rejects_unexpected_none_variant() {
        let raw = item(json!({
            "context": "ctx",
            "question": "q",
            "answer0": "a",
            "answer1": "None of the above choices",
            "answer2": "c",
            "answer3": "d",
            "label": 1,
        }));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(format_cosmos_qa(&raw, &mut rng).is_err());
    }

    #[test]
    fn openbookqa_renders_choices_and_answer() {
        let raw = item(json!({
            "id": "7-980",
            "question_stem": "The sun is responsible for",
            "choices": {
                "text": ["puppies learning", "plants sprouting"],
                "label": ["A", "B"],
            },
            "answerKey": "B",
        }));
        let mut rng = StdRng::seed_from_u64(0);
        let out = format_openbookqa(&raw, &mut rng).unwrap();
        assert_eq!(out.hard_label, 1);
        assert!(out.txt.contains("Choices: A: puppies learning B: plants sprouting"));
        assert!(out.txt.ends_with("Correct Answer: plants sprouting"));
    }

    #[test]
    fn boolq_accepts_boolean_answers() {
        let raw = item(json!({"passage": "p", "question": "q", "answer": true}));
        let mut rng = StdRng::seed_from_u64(0);
        let out = format_boolq(&raw, &mut rng).unwrap();
        assert_eq!(out.hard_label, 1);
        assert_eq!(out.txt, "Passage: p\nQuestion: q");
    }

    #[test]
    fn non_binary_labels_are_rejected() {
        let raw = item(json!({"text": "t", "label": 2}));
        let mut rng = StdRng::seed_from_u64(0);
        assert!(format_ethics_justice(&raw, &mut rng).is_err());
    }
}
