//! Sentinel bridges the database's Advanced Queuing facility to an HTTP
//! control plane: lifecycle events are dequeued under visibility-on-commit,
//! executed by a worker pool against the database, and tenant-scoped status
//! and log queries are served over HTTP behind bearer-token auth.

#[macro_use]
extern crate slog_scope;

pub mod engine;
pub mod error;
pub mod logging;
pub mod queue;
pub mod server;
pub mod web;
