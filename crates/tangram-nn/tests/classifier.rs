//! Train a linear classifier end to end: layers, loss, autograd, update.

use tangram_autograd::GradManager;
use tangram_core::Engine;
use tangram_nn::{cross_entropy, Linear, Module};

#[test]
fn linear_classifier_separates_two_classes() {
    let engine = Engine::new();

    // Class 0 clusters around (-1, -1), class 1 around (1, 1).
    let mut points = Vec::new();
    let mut labels = Vec::new();
    for i in 0..8 {
        let jitter = i as f32 * 0.05;
        points.extend_from_slice(&[-1.0 + jitter, -1.0 - jitter]);
        labels.push(0);
        points.extend_from_slice(&[1.0 - jitter, 1.0 + jitter]);
        labels.push(1);
    }
    let x = engine.tensor(&points, &[16, 2]).unwrap();
    let y = engine.tensor_i32(&labels, &[16]).unwrap();

    let model = Linear::new(&engine, 2, 2, true).unwrap();
    let mut gm = GradManager::new();
    let params = model.parameters();
    gm.attach(&params.iter().collect::<Vec<_>>());

    let mut first_loss = 0.0;
    let mut last_loss = 0.0;
    for step in 0..200 {
        let (xc, yc) = (x.clone(), y.clone());
        let model_ref = &model;
        last_loss = gm
            .run(&engine, move || {
                let logits = model_ref.forward(&xc)?;
                cross_entropy(&logits, &yc)
            })
            .unwrap();
        if step == 0 {
            first_loss = last_loss;
        }
        engine
            .scoped(Some("sgd"), || {
                for param in &params {
                    let grad = gm.grad(param).unwrap();
                    param.sub_(&grad.mul_scalar(0.5)?)?;
                }
                Ok(())
            })
            .unwrap();
    }

    assert!(
        last_loss < first_loss * 0.1,
        "loss barely moved: {first_loss} -> {last_loss}"
    );

    let predicted = engine
        .tidy(Some("eval"), || model.forward(&x)?.argmax(Some(1), false))
        .unwrap();
    assert_eq!(predicted.to_vec_i32().unwrap(), labels);
}
