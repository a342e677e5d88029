use std::{
  convert::identity,
  error::Error,
  fmt,
  fmt::Debug,
  future::Future,
  marker::PhantomData,
  mem,
  panic::{self, AssertUnwindSafe},
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  time::Duration,
};

use futures::{
  future::{self, BoxFuture},
  FutureExt,
};
use tokio::{
  runtime::Handle,
  time::{sleep_until, Instant},
};
use tracing::{debug, debug_span, trace, warn, Instrument};

use crate::{
  error::{BatchError, ConfigError, Stage},
  handle::{BatchHandle, RoundCell},
};

type FlushFn<A, T> =
  Box<dyn Fn(Vec<A>) -> BoxFuture<'static, Result<T, BatchError>> + Send + Sync + 'static>;

/// Configuration of a [`Batcher`], consumed by [`build`](BatcherBuilder::build) or
/// [`build_sync`](BatcherBuilder::build_sync)
pub struct BatcherBuilder<A, Red> {
  delay: Result<Duration, ConfigError>,
  reducer: Red,
  _args: PhantomData<fn(A)>,
}

impl<A> BatcherBuilder<A, fn(Vec<A>) -> Vec<A>> {
  /// A builder with no delay whose callback receives the collected batch unchanged
  pub fn new() -> Self {
    BatcherBuilder {
      delay: Ok(Duration::ZERO),
      reducer: identity,
      _args: PhantomData,
    }
  }
}

impl<A> Default for BatcherBuilder<A, fn(Vec<A>) -> Vec<A>> {
  fn default() -> Self {
    BatcherBuilder::new()
  }
}

impl<A, Red> BatcherBuilder<A, Red> {
  /// Time to wait after the first call of a round before flushing. Defaults to zero, which flushes
  /// as soon as the runtime yields
  pub fn delay(mut self, delay: Duration) -> Self {
    self.delay = Ok(delay);
    self
  }

  /// Delay in milliseconds; negative values are rejected when building
  pub fn delay_ms(mut self, delay_ms: i64) -> Self {
    self.delay = u64::try_from(delay_ms)
      .map(Duration::from_millis)
      .map_err(|_| ConfigError::NegativeDelay(delay_ms));
    self
  }

  /// Transform each collected batch before it is handed to the callback
  pub fn reducer<R, G>(self, reducer: G) -> BatcherBuilder<A, G>
  where
    G: Fn(Vec<A>) -> R,
  {
    BatcherBuilder {
      delay: self.delay,
      reducer,
      _args: PhantomData,
    }
  }

  /// Build a batcher whose callback resolves asynchronously. The handle of each round resolves to
  /// the output of the future returned by `callback`
  pub fn build<R, T, E, F, Fut>(self, callback: F) -> Result<Batcher<A, T>, ConfigError>
  where
    A: Send + 'static,
    T: Send + 'static,
    Red: Fn(Vec<A>) -> R + Send + Sync + 'static,
    F: Fn(R) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    E: Into<Box<dyn Error + Send + Sync>> + 'static,
  {
    let delay = self.delay?;
    let reducer = self.reducer;

    let flush: FlushFn<A, T> = Box::new(move |batch| {
      let input = match panic::catch_unwind(AssertUnwindSafe(|| reducer(batch))) {
        Ok(input) => input,
        Err(payload) => {
          return future::ready(Err(BatchError::panicked(Stage::Reducer, payload))).boxed();
        }
      };

      match panic::catch_unwind(AssertUnwindSafe(|| callback(input))) {
        Ok(fut) => AssertUnwindSafe(fut)
          .catch_unwind()
          .map(|outcome| match outcome {
            Ok(Ok(value)) => Ok(value),
            Ok(Err(err)) => Err(BatchError::callback(err)),
            Err(payload) => Err(BatchError::panicked(Stage::Callback, payload)),
          })
          .boxed(),
        Err(payload) => future::ready(Err(BatchError::panicked(Stage::Callback, payload))).boxed(),
      }
    });

    Ok(Batcher {
      shared: Arc::new(Shared {
        delay,
        flush,
        state: Mutex::new(State {
          batch: Vec::new(),
          open: false,
          round: 0,
          current: Arc::new(RoundCell::new(0)),
        }),
      }),
    })
  }

  /// Build a batcher around a synchronous callback
  pub fn build_sync<R, T, E, F>(self, callback: F) -> Result<Batcher<A, T>, ConfigError>
  where
    A: Send + 'static,
    T: Send + 'static,
    Red: Fn(Vec<A>) -> R + Send + Sync + 'static,
    F: Fn(R) -> Result<T, E> + Send + Sync + 'static,
    E: Into<Box<dyn Error + Send + Sync>> + Send + 'static,
  {
    self.build(move |input| future::ready(callback(input)))
  }
}

struct State<A, T> {
  batch: Vec<A>,
  open: bool,
  round: u64,
  current: Arc<RoundCell<T>>,
}

impl<A, T> State<A, T> {
  /// Close the open round, handing back its batch and result cell while arming a fresh cell for the
  /// next round
  fn take_round(&mut self) -> (Vec<A>, Arc<RoundCell<T>>) {
    self.round += 1;
    self.open = false;

    let cell = mem::replace(&mut self.current, Arc::new(RoundCell::new(self.round)));

    (mem::take(&mut self.batch), cell)
  }
}

struct Shared<A, T> {
  delay: Duration,
  flush: FlushFn<A, T>,
  state: Mutex<State<A, T>>,
}

impl<A, T> Shared<A, T> {
  // User code never runs under this lock, so the state behind a poisoned lock is still consistent
  fn state(&self) -> MutexGuard<'_, State<A, T>> {
    self.state.lock().unwrap_or_else(PoisonError::into_inner)
  }
}

enum FlushStage<T> {
  Collecting,
  Flushing(Arc<RoundCell<T>>),
  Settled,
}

/// Ownership of the open round's flush. Whichever way the flush task ends, the round is closed and
/// its cell settled; a task dropped before settling settles with [`BatchError::Cancelled`]
struct FlushGuard<A, T> {
  shared: Arc<Shared<A, T>>,
  stage: FlushStage<T>,
}

impl<A, T> FlushGuard<A, T> {
  fn new(shared: Arc<Shared<A, T>>) -> Self {
    FlushGuard {
      shared,
      stage: FlushStage::Collecting,
    }
  }

  async fn run(mut self, deadline: Instant) {
    if !self.shared.delay.is_zero() {
      sleep_until(deadline).await;
    }

    let (round, batch) = {
      let mut state = self.shared.state();
      let round = state.round;
      let (batch, cell) = state.take_round();
      self.stage = FlushStage::Flushing(cell);
      (round, batch)
    };

    let batch_size = batch.len();

    let result = (self.shared.flush)(batch)
      .instrument(debug_span!("batch_flush", round, batch_size))
      .await;

    match &result {
      Ok(_) => debug!(round, batch_size, "flushed batch round"),
      Err(err) => warn!(round, batch_size, %err, "batch round failed"),
    }

    if let FlushStage::Flushing(cell) = mem::replace(&mut self.stage, FlushStage::Settled) {
      cell.settle(result);
    }
  }
}

impl<A, T> Drop for FlushGuard<A, T> {
  fn drop(&mut self) {
    let cell = match mem::replace(&mut self.stage, FlushStage::Settled) {
      FlushStage::Collecting => {
        let (_batch, cell) = self.shared.state().take_round();
        cell
      }
      FlushStage::Flushing(cell) => cell,
      FlushStage::Settled => return,
    };

    warn!(round = cell.round(), "batch round dropped before it flushed");

    cell.settle(Err(BatchError::Cancelled));
  }
}

/// A batched invoker.
///
/// Arguments passed to [`invoke`](Batcher::invoke) are collected until the delay elapses from the
/// first call of a round, at which point the callback is called once with every collected
/// argument tuple in call order. Clones share the same state; separately built batchers never do.
pub struct Batcher<A, T> {
  shared: Arc<Shared<A, T>>,
}

impl<A> Batcher<A, ()> {
  /// Shorthand for [`BatcherBuilder::new`]; the value type is chosen by the callback given to
  /// `build`
  pub fn builder() -> BatcherBuilder<A, fn(Vec<A>) -> Vec<A>> {
    BatcherBuilder::new()
  }
}

impl<A, T> Batcher<A, T>
where
  A: Send + 'static,
  T: Send + 'static,
{
  /// Enqueue `args` into the open round, opening a new round if the batcher is idle, and return the
  /// handle shared by every call of that round.
  ///
  /// Opening a round spawns its flush onto the current tokio runtime. Outside of a runtime the
  /// round is closed on the spot and its handle settles with [`BatchError::NoRuntime`]
  pub fn invoke(&self, args: A) -> BatchHandle<T> {
    let runtime = Handle::try_current();

    let mut state = self.shared.state();

    state.batch.push(args);

    let handle = BatchHandle::new(state.current.clone());

    if state.open {
      trace!(
        round = state.round,
        pending = state.batch.len(),
        "joined open batch round"
      );

      return handle;
    }

    match runtime {
      Ok(runtime) => {
        state.open = true;

        debug!(round = state.round, delay = ?self.shared.delay, "opened batch round");

        let deadline = Instant::now() + self.shared.delay;

        drop(state);

        runtime.spawn(FlushGuard::new(self.shared.clone()).run(deadline));
      }
      Err(_) => {
        let (_batch, cell) = state.take_round();

        drop(state);

        warn!(round = cell.round(), "no tokio runtime to flush batch round");

        cell.settle(Err(BatchError::NoRuntime));
      }
    }

    handle
  }
}

impl<A, T> Batcher<A, T> {
  /// Whether a round is open and awaiting its flush
  pub fn is_collecting(&self) -> bool {
    self.shared.state().open
  }

  /// Number of argument tuples collected by the open round
  pub fn pending(&self) -> usize {
    self.shared.state().batch.len()
  }

  /// Delay between the first call of a round and its flush
  pub fn delay(&self) -> Duration {
    self.shared.delay
  }
}

impl<A, T> Clone for Batcher<A, T> {
  fn clone(&self) -> Self {
    Batcher {
      shared: self.shared.clone(),
    }
  }
}

impl<A, T> Debug for Batcher<A, T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let state = self.shared.state();

    f.debug_struct("Batcher")
      .field("delay", &self.shared.delay)
      .field("round", &state.round)
      .field("open", &state.open)
      .field("pending", &state.batch.len())
      .finish()
  }
}
