//! Generated message/client types for the worker wire protocol.
//!
//! `build.rs` compiles `proto/worker.proto` via `tonic-build`; the
//! generated code lands in `OUT_DIR` and is pulled in here so the rest of
//! the crate can `use crate::rpc::proto::*` like any other module.

#![allow(clippy::all)]

tonic::include_proto!("sandfleet.worker.v1");
