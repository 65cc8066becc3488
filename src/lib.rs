//! polygate — credential-rotating reverse proxy.
//!
//! One listener fronts many upstream HTTP APIs; each upstream carries a
//! pool of interchangeable credentials, layered sliding-window rate limits,
//! a bounded admission queue with a worker pool, retry/key-rotation around
//! upstream failure, and a declarative JSON body rewriter.

pub mod api;
pub mod config;
pub mod domain;
pub mod engine;
pub mod infra;

#[cfg(any(test, feature = "test-utils"))]
pub mod test_support;

pub use config::{ServerSettings, Snapshot, build_snapshot, load_snapshot};
pub use domain::error::{ConfigError, ProxyError};
pub use engine::{Engine, EngineHandle};
