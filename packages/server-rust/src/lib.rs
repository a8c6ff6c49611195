//! `RowSync` Server: change-set synchronization over typed data services,
//! served over HTTP with axum.

pub mod demo;
pub mod network;
pub mod service;
pub mod storage;

pub use network::{NetworkConfig, NetworkModule};
pub use service::{DataService, OperationRouter, OperationService, ServerConfig, ServiceConfig};
