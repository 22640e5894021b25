use criterion::{criterion_group, criterion_main, Criterion};
use skinny_mutex::SkinnyMutex;

fn bench_uncontended_roundtrip(c: &mut Criterion) {
    let mutex = SkinnyMutex::new();
    c.bench_function("uncontended lock/unlock", |b| {
        b.iter(|| {
            mutex.lock().unwrap();
            mutex.unlock().unwrap();
        })
    });
}

fn bench_try_lock_roundtrip(c: &mut Criterion) {
    let mutex = SkinnyMutex::new();
    c.bench_function("uncontended try_lock/unlock", |b| {
        b.iter(|| {
            mutex.try_lock().unwrap();
            mutex.unlock().unwrap();
        })
    });
}

criterion_group!(benches, bench_uncontended_roundtrip, bench_try_lock_roundtrip);
criterion_main!(benches);
