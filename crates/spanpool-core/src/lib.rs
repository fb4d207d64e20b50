//! Core types for the spanpool session-management client.
//!
//! Provides the error taxonomy, configuration model, wire data model and
//! the [`SpannerRpc`] seam consumed by the pools in the `spanpool` crate.

pub mod config;
pub mod error;
pub mod rpc;
pub mod types;

#[cfg(any(test, feature = "test-util"))]
pub mod testing;

pub use config::{
    CallSettings, ClientPoolConfig, ExhaustedBehavior, PoolOptions, PoolsConfig, RetryPolicy,
    SessionPoolConfig,
};
pub use error::{Error, ErrorCode, Result};
pub use rpc::{ClientFactory, PartialResultStream, SpannerRpc, call_once, call_with_retry};
pub use types::*;
