use std::time::Duration;

use criterion::{black_box, criterion_group, criterion_main, Criterion};
use rand::prelude::*;
use sample_slurper::{
    complex::{as_bytes, ComplexShort},
    hardware::{RadioSession, RxStream},
    sim::{SimRadioConfig, SimulatedRadio},
};

const RATE: usize = 1_000_000;

fn benchmark(c: &mut Criterion) {
    let mut rng = rand::thread_rng();

    // One second of samples
    let samples: Vec<_> = (0..RATE)
        .map(|_| ComplexShort::new(rng.gen(), rng.gen()))
        .collect();

    c.bench_function("sample byte view", |b| {
        b.iter(|| as_bytes(black_box(&samples)).len())
    });

    let mut radio = SimulatedRadio::new(SimRadioConfig::default());
    radio.set_rate(RATE as f64, 0).unwrap();
    let mut stream = radio.open_stream(&[0]).unwrap();
    stream.issue_start_continuous().unwrap();
    let mut chunk = vec![ComplexShort::default(); RATE / 10];

    c.bench_function("simulated chunk pull", |b| {
        b.iter(|| {
            stream
                .pull(black_box(&mut chunk), Duration::from_millis(500))
                .unwrap()
        })
    });
}

criterion_group!(benches, benchmark);
criterion_main!(benches);
