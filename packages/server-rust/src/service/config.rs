use chrono::{FixedOffset, Offset, Utc};

/// Server-level configuration for the operation pipeline.
///
/// Controls operation timeouts and the concurrency limit used for load
/// shedding.
#[derive(Debug, Clone)]
pub struct ServerConfig {
    /// Unique identifier for this server node.
    pub node_id: String,
    /// Default timeout for operations in milliseconds.
    pub default_operation_timeout_ms: u64,
    /// Maximum number of concurrent reads and writes before load shedding.
    /// Metadata requests are not counted.
    pub max_concurrent_operations: u32,
    /// Maximum number of concurrent change sets and invokes. Also bounded by
    /// `max_concurrent_operations`.
    pub max_concurrent_writes: u32,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            node_id: String::new(),
            default_operation_timeout_ms: 30_000,
            max_concurrent_operations: 1000,
            max_concurrent_writes: 100,
        }
    }
}

/// Per data service configuration.
#[derive(Debug, Clone)]
pub struct ServiceConfig {
    /// Page size used for paged collections when neither the request nor the
    /// collection names one.
    pub default_page_size: u32,
    /// Upper bound on rows in one change set.
    pub max_rows_per_batch: usize,
    /// Offset of the server's local time from UTC, in minutes. Used for
    /// fields with server-local date conversion.
    pub server_utc_offset_minutes: i32,
    /// Report the text of unexpected errors to clients.
    pub expose_unexpected_errors: bool,
}

impl ServiceConfig {
    /// Server offset as a chrono offset. Out-of-range values fall back to UTC.
    #[must_use]
    pub fn server_offset(&self) -> FixedOffset {
        FixedOffset::east_opt(self.server_utc_offset_minutes.saturating_mul(60))
            .unwrap_or_else(|| Utc.fix())
    }
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            default_page_size: 100,
            max_rows_per_batch: 10_000,
            server_utc_offset_minutes: 0,
            expose_unexpected_errors: false,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_offset_from_minutes() {
        let config = ServiceConfig {
            server_utc_offset_minutes: 120,
            ..ServiceConfig::default()
        };
        assert_eq!(config.server_offset().local_minus_utc(), 7200);

        let broken = ServiceConfig {
            server_utc_offset_minutes: 100_000,
            ..ServiceConfig::default()
        };
        assert_eq!(broken.server_offset().local_minus_utc(), 0);
    }
}
