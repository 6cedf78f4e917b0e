//! External classification service access.
//!
//! The orchestrator only sees the [`Transport`] and [`StatusSource`] traits;
//! [`HttpTransport`] is the production implementation over `reqwest`.

mod http;
mod wire;

use async_trait::async_trait;
use enricher_shared::{EnricherError, ResultMap, Subject};

pub use http::{HttpOptions, HttpStatusSource, HttpTransport};

/// Why a call to the service produced no usable results.
///
/// Every variant is recoverable: the subject is retried on a later cycle.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    /// Connection, TLS, or timeout failure.
    #[error("network error: {0}")]
    Network(String),

    /// The service answered with a non-success status.
    #[error("service returned HTTP {0}")]
    Status(u16),

    /// The response body did not have the expected shape.
    #[error("malformed response: {0}")]
    Malformed(String),
}

impl From<TransportError> for EnricherError {
    fn from(e: TransportError) -> Self {
        EnricherError::Transport(e.to_string())
    }
}

/// Sends one subject to the classification service.
#[async_trait]
pub trait Transport: Send + Sync {
    /// Classify `subject`, returning result values grouped by category.
    async fn request(&self, subject: &Subject) -> Result<ResultMap, TransportError>;
}

/// Reports the service's authoritative remaining quota.
#[async_trait]
pub trait StatusSource: Send + Sync {
    async fn remaining(&self, budget: &str) -> Result<u64, TransportError>;
}
