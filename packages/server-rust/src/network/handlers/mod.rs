//! HTTP handler definitions for the `RowSync` server.
//!
//! This module defines `AppState` (the shared state carried through axum
//! extractors) and re-exports all handler functions for convenient access
//! when building the router.

pub mod data;
pub mod health;

pub use data::{
    changes_handler, invoke_handler, metadata_handler, query_handler, refresh_handler,
    CallerPrincipal,
};
pub use health::{health_handler, liveness_handler, readiness_handler};

use std::sync::Arc;
use std::time::Instant;

use super::{NetworkConfig, ShutdownController};
use crate::service::OperationService;

/// Shared application state passed to all axum handlers via `State` extraction.
///
/// Holds `Arc` references to shared resources so cloning is cheap.
#[derive(Clone)]
pub struct AppState {
    /// Entry point of the operation pipeline.
    pub operations: Arc<OperationService>,
    /// Graceful shutdown controller with health state and in-flight tracking.
    pub shutdown: Arc<ShutdownController>,
    /// Network configuration (bind address, CORS, limits).
    pub config: Arc<NetworkConfig>,
    /// Server process start time, used for uptime calculation.
    pub start_time: Instant,
}
