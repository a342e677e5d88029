use std::{any::Any, error, fmt, sync::Arc};

use thiserror::Error;

/// Rejected batcher configuration, reported by [`BatcherBuilder::build`](crate::BatcherBuilder::build)
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
  #[error("batch delay must be non-negative, got {0}ms")]
  NegativeDelay(i64),
}

/// Where within a flush a panic occurred
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Stage {
  Reducer,
  Callback,
}

impl fmt::Display for Stage {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      Stage::Reducer => f.write_str("reducer"),
      Stage::Callback => f.write_str("callback"),
    }
  }
}

/// Failure of a batch round, observed by every [`BatchHandle`](crate::BatchHandle) of that round
#[derive(Error, Debug, Clone)]
pub enum BatchError {
  #[error("batch callback failed: {0}")]
  Callback(#[source] Arc<dyn error::Error + Send + Sync>),
  #[error("batch {stage} panicked: {message}")]
  Panicked { stage: Stage, message: String },
  /// The round was opened outside of a tokio runtime, so nothing could flush it
  #[error("no tokio runtime available to flush the batch round")]
  NoRuntime,
  /// The flush task was dropped before settling, e.g. because its runtime shut down
  #[error("batch round was dropped before it flushed")]
  Cancelled,
}

impl BatchError {
  pub(crate) fn callback<E>(err: E) -> Self
  where
    E: Into<Box<dyn error::Error + Send + Sync>>,
  {
    BatchError::Callback(Arc::from(err.into()))
  }

  pub(crate) fn panicked(stage: Stage, payload: Box<dyn Any + Send>) -> Self {
    let message = match payload.downcast::<String>() {
      Ok(message) => *message,
      Err(payload) => match payload.downcast_ref::<&'static str>() {
        Some(message) => (*message).to_owned(),
        None => String::from("non-string panic payload"),
      },
    };

    BatchError::Panicked { stage, message }
  }
}
