use criterion::BenchmarkGroup;
use criterion::BenchmarkId;
use criterion::Criterion;
use criterion::criterion_group;
use criterion::criterion_main;
use std::hint::black_box;
use std::sync::Arc;
use std::sync::Barrier;
use std::thread;
use std::thread::JoinHandle;
use std::time::Duration;
use std::time::Instant;
use tokio::runtime::Runtime;
use weft::types::Callable;
use weft::types::ClusterView;
use weft::types::LocalCluster;
use weft::types::NodeId;
use weft::types::Value;

const THREADS: &[usize] = &[2, 4, 8];

fn bench_value_codec(criterion: &mut Criterion) {
  let mut group: BenchmarkGroup<_> = criterion.benchmark_group("value_codec");

  group.bench_function("encode-u64", |bench| {
    bench.iter(|| {
      black_box(Value::encode(&42u64).unwrap());
    })
  });

  let blob: Vec<u8> = vec![7u8; 1024];

  group.bench_function("encode-1k", |bench| {
    bench.iter(|| {
      black_box(Value::encode(&blob).unwrap());
    })
  });

  let encoded: Value = Value::encode(&blob).unwrap();

  group.bench_function("decode-1k", |bench| {
    bench.iter(|| {
      black_box(encoded.decode::<Vec<u8>>().unwrap());
    })
  });

  group.finish();
}

fn bench_future_create(criterion: &mut Criterion) {
  let runtime: Runtime = Runtime::new().unwrap();
  let cluster: LocalCluster = runtime.block_on(LocalCluster::start(1)).unwrap();
  let master: ClusterView = cluster.master();

  let mut group: BenchmarkGroup<_> = criterion.benchmark_group("future_create");

  group.bench_function("single-threaded", |bench| {
    bench.iter(|| {
      black_box(master.future::<u64>(NodeId::new(2)));
    })
  });

  for threads in THREADS {
    let id: BenchmarkId = BenchmarkId::new("multi-threaded", threads);

    group.bench_with_input(id, threads, |bench, &threads| {
      bench.iter_custom(|iters| {
        let barrier: Arc<Barrier> = Arc::new(Barrier::new(threads + 1));
        let mut handles: Vec<JoinHandle<Duration>> = Vec::with_capacity(threads);

        for _ in 0..threads {
          let barrier: Arc<Barrier> = barrier.clone();
          let master: ClusterView = master.clone();

          let handle: JoinHandle<Duration> = thread::spawn(move || {
            barrier.wait();

            let start: Instant = Instant::now();

            for _ in 0..iters {
              black_box(master.future::<u64>(NodeId::new(2)));
            }

            start.elapsed()
          });

          handles.push(handle);
        }

        barrier.wait();

        handles
          .into_iter()
          .map(|handle| handle.join().unwrap())
          .sum()
      })
    });
  }

  group.finish();

  drop(cluster);
  drop(runtime);
}

fn bench_remotecall_fetch(criterion: &mut Criterion) {
  weft::register("bench_identity", |ctx: weft::CallCtx| async move {
    let value: u64 = ctx.args()?;

    Value::encode(&value)
  });

  let runtime: Runtime = Runtime::new().unwrap();
  let cluster: LocalCluster = runtime.block_on(LocalCluster::start(1)).unwrap();
  let master: ClusterView = cluster.master();

  let mut group: BenchmarkGroup<_> = criterion.benchmark_group("rpc");

  group.bench_function("remotecall_fetch-identity", |bench| {
    bench.iter(|| {
      let value: u64 = runtime
        .block_on(master.remotecall_fetch(
          Callable::func("bench_identity"),
          NodeId::new(2),
          &13u64,
        ))
        .unwrap();

      black_box(value);
    })
  });

  group.finish();

  drop(cluster);
  drop(runtime);
}

criterion_group!(
  benches,
  bench_value_codec,
  bench_future_create,
  bench_remotecall_fetch,
);
criterion_main!(benches);
