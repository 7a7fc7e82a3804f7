#![allow(clippy::uninlined_format_args)]

pub mod actions;
pub mod admin;
pub mod api;
pub mod app;
pub mod config;
pub mod dispatcher;
pub mod format;
pub mod members;
pub mod model;
pub mod rpc;
pub mod thread;

pub const VERSION: &str = env!("CARGO_PKG_VERSION");

pub use app::{run, RunOptions};
