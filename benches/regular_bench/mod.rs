use criterion::Criterion;

mod alloc;
mod monitor;
mod rendezvous;

pub fn bench(c: &mut Criterion) {
    alloc::bench(c);
    monitor::bench(c);
    rendezvous::bench(c);
}
