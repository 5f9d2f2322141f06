use axonfleet_worker::weights::WeightVector;
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};

fn bench_accumulate(c: &mut Criterion) {
    let mut group = c.benchmark_group("accumulate");

    for width in [16usize, 256, 4096] {
        let batch: Vec<Vec<f32>> = (0..8)
            .map(|i| (0..width).map(|j| ((i * 31 + j * 17) % 97) as f32).collect())
            .collect();

        group.bench_with_input(BenchmarkId::from_parameter(width), &batch, |b, batch| {
            let mut row = WeightVector::uniform(width);
            b.iter(|| {
                let mean = WeightVector::batch_mean(black_box(batch), width).unwrap();
                row.smooth_toward(&mean, 0.03).unwrap();
                row.normalize_l1();
            });
        });
    }

    group.finish();
}

criterion_group!(benches, bench_accumulate);
criterion_main!(benches);
