//! Checkpoint round-trips through safetensors files.

use tangram_core::{DType, Engine, Shape};
use tangram_nn::{Linear, Module};

#[test]
fn save_and_load_roundtrip() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.safetensors");

    let w = engine.tensor(&[1.0, -2.5, 3.25, 0.0], &[2, 2]).unwrap();
    let idx = engine.tensor_i32(&[7, -9], &[2]).unwrap();
    tangram_io::save(
        &path,
        &[("w".to_string(), w.clone()), ("idx".to_string(), idx.clone())],
    )
    .unwrap();

    let loaded = tangram_io::load(&engine, &path).unwrap();
    assert_eq!(loaded.len(), 2);
    let w2 = &loaded["w"];
    assert_eq!(w2.shape(), &Shape::new(vec![2, 2]));
    assert_eq!(w2.dtype(), DType::F32);
    assert_eq!(w2.to_vec_f32().unwrap(), vec![1.0, -2.5, 3.25, 0.0]);
    let idx2 = &loaded["idx"];
    assert_eq!(idx2.dtype(), DType::I32);
    assert_eq!(idx2.to_vec_i32().unwrap(), vec![7, -9]);
}

#[test]
fn mmap_load_matches_plain_load() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("weights.safetensors");

    let t = engine.arange(0.0, 32.0, 1.0).unwrap();
    tangram_io::save(&path, &[("t".to_string(), t.clone())]).unwrap();

    let a = tangram_io::load(&engine, &path).unwrap();
    let b = tangram_io::load_mmap(&engine, &path).unwrap();
    assert_eq!(
        a["t"].to_vec_f32().unwrap(),
        b["t"].to_vec_f32().unwrap()
    );
}

#[test]
fn load_into_restores_layer_weights() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("model.safetensors");

    let layer = Linear::new(&engine, 3, 2, true).unwrap();
    let original = layer.weight().to_vec_f32().unwrap();
    tangram_io::save(&path, &layer.named_parameters("fc")).unwrap();

    // Clobber, then restore.
    layer
        .weight()
        .copy_from_slice_f32(&[0.0; 6])
        .unwrap();
    tangram_io::load_into(&path, &layer.named_parameters("fc")).unwrap();
    assert_eq!(layer.weight().to_vec_f32().unwrap(), original);
}

#[test]
fn load_into_rejects_missing_names() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("partial.safetensors");

    let a = engine.ones(&[2], DType::F32).unwrap();
    tangram_io::save(&path, &[("a".to_string(), a.clone())]).unwrap();

    let b = engine.ones(&[2], DType::F32).unwrap();
    let err = tangram_io::load_into(&path, &[("missing".to_string(), b)]);
    assert!(err.is_err());
}

#[test]
fn load_into_disposes_scratch_on_failure() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("mismatch.safetensors");

    let a = engine.ones(&[2], DType::F32).unwrap();
    tangram_io::save(&path, &[("a".to_string(), a)]).unwrap();

    // Shape mismatch fails the copy; the loaded scratch must still be freed.
    let dst = engine.ones(&[3], DType::F32).unwrap();
    let before = engine.live_tensors();
    let err = tangram_io::load_into(&path, &[("a".to_string(), dst)]);
    assert!(err.is_err());
    assert_eq!(engine.live_tensors(), before);
}

#[test]
fn byte_dtypes_roundtrip_raw() {
    let engine = Engine::new();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("bytes.safetensors");

    let q = engine
        .tensor_bytes(&[0, 127, 128, 255], &[4], DType::U8)
        .unwrap();
    tangram_io::save(&path, &[("q".to_string(), q)]).unwrap();
    let loaded = tangram_io::load(&engine, &path).unwrap();
    assert_eq!(loaded["q"].dtype(), DType::U8);
    assert_eq!(loaded["q"].to_bytes().unwrap(), vec![0, 127, 128, 255]);
}
