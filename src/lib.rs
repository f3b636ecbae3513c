//! WorldVisa DMS gateway
//!
//! Backend-for-frontend for the document management portal: bearer/cookie
//! sessions, a cached proxy over the DMS backend, and server-sent-event
//! channels for notifications and comments.
//!
//! This lib exposes the gateway pieces; `main.rs` wires them into a server
//! and `bin/cli.rs` is a terminal client.

pub mod auth;
pub mod backend;
// Keyed query cache with staleness/GC windows and mutation invalidation
pub mod cache;
pub mod config;
pub mod error;
pub mod events;
pub mod filter;
pub mod invalidation;
pub mod models;
pub mod relay;
// REST API module: Axum router, proxy handlers and SSE endpoints
pub mod rest;
pub mod sse;
pub mod subscriber;
pub mod telemetry;
