pub mod arg_batch;
pub mod flume;
pub mod tokio;
