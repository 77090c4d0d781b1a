//! Worker RPC client (spec section 4.1).

pub mod client;
pub mod proto;

pub use client::{CreateOutcome, WorkerRpc};
