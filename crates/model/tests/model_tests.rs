use anyhow::Result;
use candle_core::{DType, Device, Tensor};
use model::{ArchitectureConfig, Classifier, LoadOptions, TransformerWithHead, WEIGHTS_FILE, WEIGHTS_INDEX_FILE};
use tempfile::tempdir;

fn tiny_config() -> ArchitectureConfig {
    ArchitectureConfig {
        vocab_size: 32,
        n_positions: 16,
        n_embd: 8,
        n_layer: 2,
        n_head: 2,
        layer_norm_epsilon: 1e-5,
        dropout: 0.0,
        dtype: "f32".into(),
        num_labels: 2,
        pad_token_id: 0,
    }
}

fn batch() -> Result<Tensor> {
    let ids: Vec<u32> = vec![5, 6, 7, 0, 0, 9, 10, 11, 12, 13];
    Ok(Tensor::from_vec(ids, (2, 5), &Device::Cpu)?)
}

fn logits_vec(model: &TransformerWithHead) -> Result<Vec<f32>> {
    Ok(model.classify(&batch()?)?.flatten_all()?.to_vec1::<f32>()?)
}

#[test]
fn classify_produces_two_logits_per_row() -> Result<()> {
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    let logits = model.classify(&batch()?)?;
    assert_eq!(logits.dims(), &[2, 2]);
    assert_eq!(logits.dtype(), DType::F32);
    Ok(())
}

#[test]
fn right_padding_does_not_change_logits() -> Result<()> {
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    let short = Tensor::from_vec(vec![5u32, 6, 7], (1, 3), &Device::Cpu)?;
    let padded = Tensor::from_vec(vec![5u32, 6, 7, 0, 0, 0], (1, 6), &Device::Cpu)?;
    let a = model.classify(&short)?.flatten_all()?.to_vec1::<f32>()?;
    let b = model.classify(&padded)?.flatten_all()?.to_vec1::<f32>()?;
    for (x, y) in a.iter().zip(b.iter()) {
        assert!((x - y).abs() < 1e-5, "{x} vs {y}");
    }
    Ok(())
}

#[test]
fn linear_probe_only_trains_the_head() -> Result<()> {
    let probe = TransformerWithHead::new(tiny_config(), true, &[Device::Cpu])?;
    let names: Vec<String> = probe.trainable_parameters().into_iter().map(|(n, _)| n).collect();
    assert_eq!(names, vec!["score.weight".to_string()]);

    let full = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    let params = full.trainable_parameters();
    assert!(params.len() > 10);
    assert!(params.windows(2).all(|w| w[0].0 < w[1].0));
    Ok(())
}

#[test]
fn overlong_sequences_are_rejected() -> Result<()> {
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    let ids = Tensor::ones((1, 17), DType::U32, &Device::Cpu)?;
    assert!(model.classify(&ids).is_err());
    Ok(())
}

#[test]
fn single_file_round_trip_restores_logits() -> Result<()> {
    let dir = tempdir()?;
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    let files = model.save_pretrained(dir.path(), None)?;
    assert_eq!(files, vec![dir.path().join(WEIGHTS_FILE)]);

    let path = dir.path().to_string_lossy().to_string();
    let restored = TransformerWithHead::from_pretrained(&path, &LoadOptions::default())?;
    assert_eq!(restored.config(), model.config());
    assert_eq!(logits_vec(&model)?, logits_vec(&restored)?);
    Ok(())
}

#[test]
fn sharded_round_trip_matches_single_file() -> Result<()> {
    let single_dir = tempdir()?;
    let sharded_dir = tempdir()?;
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    model.save_pretrained(single_dir.path(), None)?;
    let shards = model.save_pretrained(sharded_dir.path(), Some(1024))?;
    assert!(shards.len() > 1);
    assert!(sharded_dir.path().join(WEIGHTS_INDEX_FILE).is_file());
    assert!(!sharded_dir.path().join(WEIGHTS_FILE).exists());

    let mut from_single = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    from_single.load_weights(single_dir.path())?;
    let mut from_shards = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    from_shards.load_weights(sharded_dir.path())?;

    assert_eq!(logits_vec(&from_single)?, logits_vec(&from_shards)?);
    assert_eq!(logits_vec(&model)?, logits_vec(&from_shards)?);
    Ok(())
}

#[test]
fn mismatched_checkpoint_fails_to_load() -> Result<()> {
    let dir = tempdir()?;
    let model = TransformerWithHead::new(tiny_config(), false, &[Device::Cpu])?;
    model.save_pretrained(dir.path(), None)?;

    let mut wider = tiny_config();
    wider.n_embd = 16;
    let mut other = TransformerWithHead::new(wider, false, &[Device::Cpu])?;
    assert!(other.load_weights(dir.path()).is_err());
    Ok(())
}

#[test]
fn unknown_names_are_rejected() {
    let err = TransformerWithHead::from_pretrained("not-a-model", &LoadOptions::default());
    assert!(matches!(err, Err(model::Error::UnknownModel(_))));
}
