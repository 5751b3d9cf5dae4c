#![deny(clippy::all)]
#![cfg_attr(test, allow(clippy::unwrap_used, clippy::expect_used))]

//! Command-execution daemon: supervises child process groups, streams their
//! output over JSON-RPC and gates every run with a hook pipeline.

mod adapters;
mod app;
mod common;
mod domain;
mod infra;
mod usecases;

pub use app::Application;
