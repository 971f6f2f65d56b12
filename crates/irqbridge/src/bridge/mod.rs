//! IPC bridge between this process and the emulated core.
//!
//! # Architecture
//!
//! - **wire**: Fixed-layout exit request/response records
//! - **channel**: Named unidirectional message channels (POSIX message queues)
//! - **memory**: In-process channel backend for tests and simulations

pub mod channel;
pub mod memory;
pub mod wire;
