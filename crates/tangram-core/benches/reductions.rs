use criterion::{black_box, criterion_group, criterion_main, Criterion};

use tangram_core::Engine;

fn bench_sum(c: &mut Criterion) {
    let engine = Engine::new();
    let t = engine.rand(&[64, 1024], -1.0, 1.0).unwrap();
    c.bench_function("sum_axis1_64x1024", |bencher| {
        bencher.iter(|| {
            engine
                .tidy(None, || black_box(&t).sum(Some(1), false))
                .unwrap()
        });
    });
}

fn bench_softmax(c: &mut Criterion) {
    let engine = Engine::new();
    let t = engine.rand(&[64, 1024], -1.0, 1.0).unwrap();
    c.bench_function("softmax_64x1024", |bencher| {
        bencher.iter(|| engine.tidy(None, || black_box(&t).softmax(1)).unwrap());
    });
}

fn bench_argmax(c: &mut Criterion) {
    let engine = Engine::new();
    let t = engine.rand(&[64, 1024], -1.0, 1.0).unwrap();
    c.bench_function("argmax_axis1_64x1024", |bencher| {
        bencher.iter(|| {
            engine
                .tidy(None, || black_box(&t).argmax(Some(1), false))
                .unwrap()
        });
    });
}

criterion_group!(benches, bench_sum, bench_softmax, bench_argmax);
criterion_main!(benches);
