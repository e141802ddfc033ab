use criterion::{black_box, criterion_group, criterion_main, Criterion};
use coedit_core::{apply, compose, transform, DocumentState, Operation};
use uuid::Uuid;

fn bench_transform_insert_insert(c: &mut Criterion) {
    let a = Operation::insert(10, "hello", Uuid::from_u128(1));
    let b = Operation::insert(10, "world", Uuid::from_u128(2));

    c.bench_function("transform_insert_insert", |bch| {
        bch.iter(|| {
            black_box(transform(black_box(&a), black_box(&b)));
        })
    });
}

fn bench_transform_delete_overlap(c: &mut Criterion) {
    let a = Operation::delete(5, 20, Uuid::from_u128(1));
    let b = Operation::delete(15, 20, Uuid::from_u128(2));

    c.bench_function("transform_delete_overlap", |bch| {
        bch.iter(|| {
            black_box(transform(black_box(&a), black_box(&b)));
        })
    });
}

fn bench_apply_insert_1kb_doc(c: &mut Criterion) {
    let content = "x".repeat(1024);
    let op = Operation::insert(512, "inserted text", Uuid::from_u128(1));

    c.bench_function("apply_insert_1kb_doc", |bch| {
        bch.iter(|| {
            black_box(apply(black_box(&content), black_box(&op)).unwrap());
        })
    });
}

fn bench_compose_typing_run(c: &mut Criterion) {
    let author = Uuid::from_u128(1);
    let a = Operation::insert(100, "hello worl", author);
    let b = Operation::insert(110, "d", author);

    c.bench_function("compose_typing_run", |bch| {
        bch.iter(|| {
            black_box(compose(black_box(&a), black_box(&b)));
        })
    });
}

fn bench_remote_rebase_with_pending(c: &mut Criterion) {
    let local = Uuid::from_u128(1);
    let remote_author = Uuid::from_u128(2);

    c.bench_function("apply_remote_with_4_pending", |bch| {
        bch.iter(|| {
            let mut doc = DocumentState::new();
            doc.begin_loading();
            doc.complete_load("the quick brown fox jumps over the lazy dog", 1);
            for i in 0..4u64 {
                let op = Operation::insert(i * 5, "ab", local)
                    .with_base(doc.version())
                    .with_seq(i + 1);
                doc.apply_local(op).unwrap();
            }
            let remote = Operation::delete(10, 8, remote_author)
                .with_base(1)
                .with_seq(1);
            black_box(doc.apply_remote(black_box(&remote)).unwrap());
        })
    });
}

fn bench_local_edit_throughput(c: &mut Criterion) {
    let author = Uuid::from_u128(1);

    c.bench_function("apply_local_100_edits", |bch| {
        bch.iter(|| {
            let mut doc = DocumentState::new();
            doc.begin_loading();
            doc.complete_load("", 0);
            for i in 0..100u64 {
                let op = Operation::insert(i, "x", author)
                    .with_base(doc.version())
                    .with_seq(i + 1);
                doc.apply_local(op).unwrap();
            }
            black_box(doc.version());
        })
    });
}

criterion_group!(
    benches,
    bench_transform_insert_insert,
    bench_transform_delete_overlap,
    bench_apply_insert_1kb_doc,
    bench_compose_typing_run,
    bench_remote_rebase_with_pending,
    bench_local_edit_throughput,
);
criterion_main!(benches);
