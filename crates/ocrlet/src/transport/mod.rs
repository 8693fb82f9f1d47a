//! Transport layer for ocrlet.
//!
//! Currently provides HTTP + WebSocket transport via axum. The transport is
//! plumbing over the `JobService` façade; all guarantees live in the core.

pub mod http;

pub use http::{ServerConfig, serve};
