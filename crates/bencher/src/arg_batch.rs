use std::{
  convert::Infallible,
  time::{Duration, Instant},
};

use arg_batch::batched;
use criterion::{measurement::WallTime, BenchmarkGroup, BenchmarkId};
use futures::future::join_all;
use tokio::runtime::Runtime;

#[batched]
fn echo_round(batch: Vec<u64>) -> Result<usize, Infallible> {
  Ok(batch.len())
}

#[batched]
fn flush_latency(batch: Vec<Instant>) -> Result<Duration, Infallible> {
  let flushed_at = Instant::now();

  Ok(
    batch
      .first()
      .map(|enqueued_at| flushed_at.duration_since(*enqueued_at))
      .unwrap_or_default(),
  )
}

pub fn bench_tasks(rt: &Runtime, bench: &mut BenchmarkGroup<WallTime>) {
  bench.bench_function("flush latency", |bencher| {
    bencher.to_async(rt).iter_custom(|iters| async move {
      let mut total = Duration::from_secs(0);

      for _i in 0..iters {
        if let Ok(latency) = flush_latency_batched(Instant::now()).await {
          total = total.saturating_add(latency);
        }
      }

      total
    });
  });

  bench.bench_function("settle round", |bencher| {
    bencher.to_async(rt).iter_custom(|iters| async move {
      let mut total = Duration::from_secs(0);

      for i in 0..iters {
        let start = Instant::now();
        echo_round_batched(i).await.ok();
        total = total.saturating_add(start.elapsed());
      }

      total
    });
  });
}

pub fn bench_batching(rt: &Runtime, bench: &mut BenchmarkGroup<WallTime>, batch_size: u64) {
  bench.bench_with_input(
    BenchmarkId::new("arg-batch", batch_size),
    &batch_size,
    |b, batch_size| {
      b.to_async(rt)
        .iter(|| join_all((0..*batch_size).map(echo_round_batched)))
    },
  );
}
