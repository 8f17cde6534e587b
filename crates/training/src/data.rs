use candle_core::{Device, Tensor};
use datasets::Example;

use crate::TrainingError;

pub const PAD_TOKEN_ID: u32 = 0;

/// A right-padded batch: `(batch, seq)` u32 token ids and `(batch, 2)` f32 soft labels.
#[derive(Debug, Clone)]
pub struct Batch {
    pub input_ids: Tensor,
    pub labels: Tensor,
}

impl Batch {
    pub fn len(&self) -> usize {
        self.input_ids.dims().first().copied().unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Pads every example's `input_ids` with [`PAD_TOKEN_ID`] to the longest one in `examples`.
pub fn pad_collate(examples: &[&Example], device: &Device) -> Result<Batch, TrainingError> {
    if examples.is_empty() {
        return Err(TrainingError::runtime("cannot collate an empty batch"));
    }
    let seq_len = examples
        .iter()
        .map(|example| example.input_ids.len())
        .max()
        .unwrap_or(0)
        .max(1);

    let mut ids = Vec::with_capacity(examples.len() * seq_len);
    let mut labels = Vec::with_capacity(examples.len() * 2);
    for example in examples {
        ids.extend_from_slice(&example.input_ids);
        ids.extend(std::iter::repeat(PAD_TOKEN_ID).take(seq_len - example.input_ids.len()));
        labels.extend_from_slice(&example.soft_label);
    }

    Ok(Batch {
        input_ids: Tensor::from_vec(ids, (examples.len(), seq_len), device)?,
        labels: Tensor::from_vec(labels, (examples.len(), 2), device)?,
    })
}

/// Walks a dataset `epochs` times without materialising the repeated sequence.
///
/// The k-th drawn example is `k mod len`; the cursor is exhausted at `len * epochs`.
#[derive(Debug, Clone)]
pub struct EpochCursor {
    len: usize,
    total: usize,
    position: usize,
}

impl EpochCursor {
    pub fn new(len: usize, epochs: usize) -> Self {
        Self {
            len,
            total: len.saturating_mul(epochs),
            position: 0,
        }
    }

    /// Number of optimizer steps the repeated dataset supports.
    pub fn nsteps(&self, batch_size: usize) -> usize {
        if batch_size == 0 {
            return 0;
        }
        self.total / batch_size
    }

    pub fn position(&self) -> usize {
        self.position
    }

    pub fn remaining(&self) -> usize {
        self.total - self.position
    }

    /// Indices of the next `size` examples, or `None` when fewer than `size` remain.
    ///
    /// A refused draw still consumes what was left, matching a drained iterator.
    pub fn next_minibatch(&mut self, size: usize) -> Option<Vec<usize>> {
        if size == 0 || self.len == 0 {
            return None;
        }
        if self.remaining() < size {
            self.position = self.total;
            return None;
        }
        let indices = (self.position..self.position + size)
            .map(|k| k % self.len)
            .collect();
        self.position += size;
        Some(indices)
    }
}

/// Fixed-order chunks of `examples` of at most `batch_size` items.
pub fn eval_batches(examples: &[Example], batch_size: usize) -> impl Iterator<Item = &[Example]> {
    examples.chunks(batch_size.max(1))
}

#[cfg(test)]
mod tests {
    use super::*;
    use candle_core::DType;

    fn example(ids: &[u32], hard_label: u8) -> Example {
        Example {
            txt: String::new(),
            hard_label,
            soft_label: datasets::soft_label_for(hard_label),
            input_ids: ids.to_vec(),
        }
    }

    #[test]
    fn collate_right_pads_with_zero() {
        let a = example(&[5, 6, 7], 1);
        let b = example(&[8], 0);
        let batch = pad_collate(&[&a, &b], &Device::Cpu).unwrap();
        assert_eq!(batch.len(), 2);
        assert_eq!(batch.input_ids.dtype(), DType::U32);
        assert_eq!(
            batch.input_ids.to_vec2::<u32>().unwrap(),
            vec![vec![5, 6, 7], vec![8, 0, 0]]
        );
        assert_eq!(
            batch.labels.to_vec2::<f32>().unwrap(),
            vec![vec![0.0, 1.0], vec![1.0, 0.0]]
        );
    }

    #[test]
    fn cursor_cycles_by_index() {
        let mut cursor = EpochCursor::new(3, 2);
        assert_eq!(cursor.nsteps(2), 3);
        assert_eq!(cursor.next_minibatch(2), Some(vec![0, 1]));
        assert_eq!(cursor.next_minibatch(2), Some(vec![2, 0]));
        assert_eq!(cursor.next_minibatch(2), Some(vec![1, 2]));
        assert_eq!(cursor.next_minibatch(2), None);
        assert_eq!(cursor.remaining(), 0);
    }

    #[test]
    fn partial_draw_exhausts_cursor() {
        let mut cursor = EpochCursor::new(5, 1);
        assert_eq!(cursor.next_minibatch(4), Some(vec![0, 1, 2, 3]));
        assert_eq!(cursor.next_minibatch(4), None);
        assert_eq!(cursor.next_minibatch(1), None);
    }

    #[test]
    fn eval_batches_keep_order() {
        let examples: Vec<Example> = (0..5).map(|i| example(&[i], 0)).collect();
        let sizes: Vec<usize> = eval_batches(&examples, 2).map(|chunk| chunk.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
    }
}
