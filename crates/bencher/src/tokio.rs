use std::iter;

use criterion::{measurement::WallTime, BenchmarkGroup, BenchmarkId};
use futures::future::join_all;
use tokio::{
  runtime::Runtime,
  spawn,
  sync::{mpsc, oneshot},
};

type Request = (u64, oneshot::Sender<usize>);

// Replies to every request drained in one wakeup with the size of that round
fn make_reactor() -> mpsc::UnboundedSender<Request> {
  let (tx, mut rx) = mpsc::unbounded_channel::<Request>();

  spawn(async move {
    while let Some(request) = rx.recv().await {
      let round: Vec<Request> = iter::once(request)
        .chain(iter::from_fn(|| rx.try_recv().ok()))
        .collect();

      let round_size = round.len();

      for (_, reply) in round {
        reply.send(round_size).ok();
      }
    }
  });

  tx
}

async fn push_round(i: u64) -> usize {
  thread_local! {
    static QUEUE: mpsc::UnboundedSender<Request> = make_reactor();
  }

  let (tx, rx) = oneshot::channel();

  QUEUE.with(|queue_tx| {
    queue_tx.send((i, tx)).ok();
  });

  rx.await.unwrap_or_default()
}

pub fn bench_batching(rt: &Runtime, bench: &mut BenchmarkGroup<WallTime>, batch_size: u64) {
  bench.bench_with_input(
    BenchmarkId::new("tokio::mpsc", batch_size),
    &batch_size,
    |b, batch_size| {
      b.to_async(rt)
        .iter(|| join_all((0..*batch_size).map(push_round)))
    },
  );
}
