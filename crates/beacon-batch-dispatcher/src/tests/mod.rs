//! Dispatcher scenarios driven by a scripted transport under paused time.
//!
//! - `harness`: mock transport and payload builders
//! - `batching`: count, timer and byte-ceiling flushes
//! - `retries`: rate limits, server errors and terminal rejections
//! - `exit`: keepalive chunking once the process is exiting
