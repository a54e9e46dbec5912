use std::sync::Arc;

use arrow::array::{Int32Array, RecordBatch};
use arrow::datatypes::{DataType, Field, Schema, SchemaRef};
use criterion::{black_box, criterion_group, criterion_main, BenchmarkId, Criterion};
use dexjit::{GeneratorConfig, Literal, Node, Projector};

fn schema() -> SchemaRef {
    Arc::new(Schema::new(vec![
        Field::new("a", DataType::Int32, true),
        Field::new("b", DataType::Int32, true),
    ]))
}

/// (a + b) * 3 > a, plus a fallible divide.
fn exprs() -> Vec<(Node, Field)> {
    let sum = Node::call("add", vec![Node::field("a"), Node::field("b")]);
    let scaled = Node::call("multiply", vec![sum, Node::literal(Literal::Int32(3))]);
    vec![
        (
            Node::call("greater_than", vec![scaled, Node::field("a")]),
            Field::new("gt", DataType::Boolean, true),
        ),
        (
            Node::call("divide", vec![Node::field("a"), Node::field("b")]),
            Field::new("q", DataType::Int32, true),
        ),
    ]
}

fn bench_compile(c: &mut Criterion) {
    let mut group = c.benchmark_group("JIT Compile");

    for optimize in [false, true] {
        group.bench_with_input(
            BenchmarkId::new("projector_make", if optimize { "speed" } else { "none" }),
            &optimize,
            |b, &optimize| {
                b.iter(|| {
                    let config = GeneratorConfig::default().with_optimize(optimize);
                    Projector::make(schema(), black_box(exprs()), config).unwrap()
                })
            },
        );
    }

    group.finish();
}

fn bench_execute(c: &mut Criterion) {
    let mut group = c.benchmark_group("JIT Execute");
    let projector = Projector::make(schema(), exprs(), GeneratorConfig::default()).unwrap();

    for num_records in [1000, 10_000, 100_000] {
        let a: Vec<Option<i32>> = (0..num_records)
            .map(|i| (i % 17 != 0).then_some(i))
            .collect();
        let b: Vec<Option<i32>> = (0..num_records)
            .map(|i| (i % 5 != 0).then_some(i % 97 + 1))
            .collect();
        let batch = RecordBatch::try_new(
            schema(),
            vec![Arc::new(Int32Array::from(a)), Arc::new(Int32Array::from(b))],
        )
        .unwrap();

        group.bench_with_input(
            BenchmarkId::new("evaluate", num_records),
            &batch,
            |bench, batch| bench.iter(|| projector.evaluate(black_box(batch)).unwrap()),
        );
    }

    group.finish();
}

criterion_group!(benches, bench_compile, bench_execute);
criterion_main!(benches);
