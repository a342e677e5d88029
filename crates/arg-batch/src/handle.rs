use std::{
  fmt,
  fmt::Debug,
  future::Future,
  mem,
  pin::Pin,
  sync::{Arc, Mutex, MutexGuard, PoisonError},
  task::{Context, Poll, Waker},
};

use tracing::warn;

use crate::error::BatchError;

enum Slot<T> {
  Armed(Vec<Waker>),
  Settled(Result<T, BatchError>),
}

/// The result slot of a single round. A cell is settled at most once and is never reused; the next
/// round gets a new cell
pub(crate) struct RoundCell<T> {
  round: u64,
  slot: Mutex<Slot<T>>,
}

impl<T> RoundCell<T> {
  pub(crate) fn new(round: u64) -> Self {
    RoundCell {
      round,
      slot: Mutex::new(Slot::Armed(Vec::new())),
    }
  }

  pub(crate) fn round(&self) -> u64 {
    self.round
  }

  // Nothing runs user code while holding this lock, so a poisoned slot is still consistent
  fn slot(&self) -> MutexGuard<'_, Slot<T>> {
    self.slot.lock().unwrap_or_else(PoisonError::into_inner)
  }

  /// Store the outcome of the round and wake every waiting handle
  pub(crate) fn settle(&self, result: Result<T, BatchError>) {
    let wakers = {
      let mut slot = self.slot();

      match &mut *slot {
        Slot::Armed(wakers) => {
          let wakers = mem::take(wakers);
          *slot = Slot::Settled(result);
          wakers
        }
        Slot::Settled(_) => {
          warn!(round = self.round, "ignoring second settlement of round");
          return;
        }
      }
    };

    wakers.into_iter().for_each(Waker::wake);
  }

  fn is_settled(&self) -> bool {
    matches!(&*self.slot(), Slot::Settled(_))
  }
}

impl<T> RoundCell<T>
where
  T: Clone,
{
  fn poll_settled(&self, cx: &mut Context<'_>) -> Poll<Result<T, BatchError>> {
    let mut slot = self.slot();

    match &mut *slot {
      Slot::Settled(result) => Poll::Ready(result.clone()),
      Slot::Armed(wakers) => {
        if !wakers.iter().any(|waker| waker.will_wake(cx.waker())) {
          wakers.push(cx.waker().clone());
        }

        Poll::Pending
      }
    }
  }
}

/// Shared handle to the eventual outcome of the round an invocation joined.
///
/// Every invocation accumulated into the same batch receives a handle to the same round; handles
/// compare equal exactly when they belong to the same round. Awaiting a handle yields a clone of the
/// callback's value, or the [`BatchError`] that ended the round.
pub struct BatchHandle<T> {
  cell: Arc<RoundCell<T>>,
}

impl<T> BatchHandle<T> {
  pub(crate) fn new(cell: Arc<RoundCell<T>>) -> Self {
    BatchHandle { cell }
  }

  /// Whether both handles belong to the same round
  #[inline(always)]
  pub fn ptr_eq(&self, other: &Self) -> bool {
    Arc::ptr_eq(&self.cell, &other.cell)
  }

  /// Sequence number of the round this handle belongs to, counting from 0 per batcher
  pub fn round(&self) -> u64 {
    self.cell.round
  }

  /// Whether the round has flushed, or ended without flushing
  pub fn is_settled(&self) -> bool {
    self.cell.is_settled()
  }
}

impl<T> Clone for BatchHandle<T> {
  fn clone(&self) -> Self {
    BatchHandle {
      cell: self.cell.clone(),
    }
  }
}

impl<T> PartialEq for BatchHandle<T> {
  fn eq(&self, other: &Self) -> bool {
    self.ptr_eq(other)
  }
}

impl<T> Eq for BatchHandle<T> {}

impl<T> Debug for BatchHandle<T> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("BatchHandle")
      .field("round", &self.cell.round)
      .field("settled", &self.is_settled())
      .finish()
  }
}

impl<T> Future for BatchHandle<T>
where
  T: Clone,
{
  type Output = Result<T, BatchError>;

  fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
    self.cell.poll_settled(cx)
  }
}
