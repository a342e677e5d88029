#![cfg_attr(docsrs, feature(doc_cfg))]

#[macro_use(assert_impl_all)]
extern crate static_assertions;
extern crate self as arg_batch;

mod batcher;
mod error;
mod handle;

pub use batcher::{Batcher, BatcherBuilder};
pub use derive_arg_batch::batched;
pub use error::{BatchError, ConfigError, Stage};
pub use handle::BatchHandle;

assert_impl_all!(Batcher<(u64, String), Vec<u8>>: Send, Sync, Clone);
assert_impl_all!(BatchHandle<Vec<u8>>: Send, Sync, Clone, Unpin);
assert_impl_all!(BatchError: Send, Sync, Clone);
