use criterion::{black_box, criterion_group, criterion_main, Criterion, Throughput};

use abtest_core::{
    assignment::{assign_variant, bucket},
    model::{ExperimentId, User, UserId, Variant},
    rules::SegmentRules,
    statistics::{analyze, VariantCounts},
    AttributeValue,
};

fn criterion_benchmark(c: &mut Criterion) {
    let user = UserId::from("subject1");
    let experiment_id = ExperimentId(42);

    {
        let mut group = c.benchmark_group("assignment");
        group.throughput(Throughput::Elements(1));
        let variants = vec![
            Variant::new(1, 42, "control", 34.0),
            Variant::new(2, 42, "blue", 33.0),
            Variant::new(3, 42, "green", 33.0),
        ];
        group.bench_function("bucket", |b| {
            b.iter(|| bucket(black_box(&user), black_box(experiment_id)))
        });
        group.bench_function("assign_variant", |b| {
            b.iter(|| {
                assign_variant(
                    black_box(&user),
                    black_box(experiment_id),
                    black_box(&variants),
                )
            })
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("segment-rules");
        group.throughput(Throughput::Elements(1));
        let subject = User::new("subject1")
            .with_premium(true)
            .with_country_code("US")
            .with_attribute("plan", "enterprise");
        let rules = SegmentRules::new([
            ("is_premium", AttributeValue::from(true)),
            ("country_code", AttributeValue::from("US")),
            ("attributes.plan", AttributeValue::from("enterprise")),
        ])
        .unwrap();
        group.bench_function("matches", |b| {
            b.iter(|| black_box(&rules).matches(black_box(&subject)))
        });
        group.finish();
    }

    {
        let mut group = c.benchmark_group("statistics");
        group.throughput(Throughput::Elements(1));
        let counts = vec![
            VariantCounts::new(1, "control", 300, 1000),
            VariantCounts::new(2, "blue", 371, 1000),
            VariantCounts::new(3, "green", 310, 1000),
        ];
        group.bench_function("analyze", |b| {
            b.iter(|| analyze(black_box(&counts), black_box(0.95), black_box(0.05)))
        });
        group.finish();
    }
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
