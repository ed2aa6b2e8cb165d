//! Delivery side of the pipeline: row buffering, chunking and the
//! retrying HTTP client.

pub mod buffer;
pub mod chunk;
pub mod http;
pub mod retry;
