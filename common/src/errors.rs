// Error handling for the schedule synchronization pipeline

use thiserror::Error;

/// Calendar retrieval errors for a single candidate endpoint
///
/// These never escape the fetcher: they are folded into a `FetchOutcome`.
#[derive(Error, Debug, Clone, PartialEq)]
pub enum FetchError {
    #[error("Transport failure for {url}: {reason}")]
    Transport { url: String, reason: String },

    #[error("Server responded with status {status} for {url}")]
    RetryableStatus { url: String, status: u16 },

    #[error("Endpoint {url} did not return a calendar document")]
    EndpointMismatch { url: String },

    #[error("Endpoint {url} responded with status {status}")]
    NotFound { url: String, status: u16 },

    #[error("Failed to create HTTP client: {0}")]
    ClientBuild(String),
}

impl FetchError {
    /// Whether another attempt against the same endpoint may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            FetchError::Transport { .. } | FetchError::RetryableStatus { .. }
        )
    }
}

/// Calendar document parsing errors
#[derive(Error, Debug, Clone, PartialEq)]
pub enum ParseError {
    #[error("Line {line}: malformed content line: {content}")]
    MalformedLine { line: usize, content: String },

    #[error("Unterminated component: {0}")]
    UnterminatedComponent(String),

    #[error("Unknown timezone: {0}")]
    UnknownTimezone(String),
}

/// Persistence store errors
#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Store connection failed: {0}")]
    ConnectionFailed(String),

    #[error("Store request failed: {0}")]
    RequestFailed(String),

    #[error("Store rejected write to {table}: {reason}")]
    Rejected { table: String, reason: String },

    #[error("Store response could not be decoded: {0}")]
    InvalidResponse(String),

    #[error("Unknown table: {0}")]
    UnknownTable(String),

    #[error("Query failed: {0}")]
    QueryFailed(String),
}

/// Seed list loading errors
#[derive(Error, Debug)]
pub enum SeedError {
    #[error("Failed to read seed file {path}: {reason}")]
    Io { path: String, reason: String },

    #[error("Invalid seed document: {0}")]
    InvalidJson(String),

    #[error("Seed entry is missing a natural key: {0}")]
    MissingNaturalKey(String),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Fatal pipeline errors
///
/// Everything per-entity or per-chunk is reported through the run summary
/// instead of through this type.
#[derive(Error, Debug)]
pub enum PipelineError {
    #[error("Identity cache could not be seeded from the store: {0}")]
    IdentitySeed(#[source] StoreError),

    #[error("Entity seed list unavailable: {0}")]
    Seeds(#[from] SeedError),

    #[error("Invalid state transition from {from:?} to {to:?}")]
    InvalidTransition {
        from: crate::sync::PipelineState,
        to: crate::sync::PipelineState,
    },

    #[error("Invalid configuration: {0}")]
    Configuration(String),
}

/// Non-fatal issues collected while synchronizing
#[derive(Error, Debug, Clone, PartialEq)]
pub enum SyncIssue {
    #[error("Malformed calendar record in {entity}: {detail}")]
    MalformedRecord { entity: String, detail: String },

    #[error("Write conflict on {table} for key {key}: {reason}")]
    WriteConflict {
        table: String,
        key: String,
        reason: String,
    },

    #[error("Truncated {table}.{column} from {original} to {limit} characters")]
    Truncation {
        table: String,
        column: String,
        original: usize,
        limit: usize,
    },
}

impl From<sqlx::Error> for StoreError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::Database(db_err) => {
                // Constraint violations are row-level rejections, not outages
                match db_err.code().as_deref() {
                    Some(code) if code.starts_with("23") || code.starts_with("22") => {
                        StoreError::Rejected {
                            table: db_err.table().unwrap_or("unknown").to_string(),
                            reason: db_err.message().to_string(),
                        }
                    }
                    _ => StoreError::QueryFailed(db_err.message().to_string()),
                }
            }
            sqlx::Error::PoolTimedOut | sqlx::Error::Io(_) | sqlx::Error::Tls(_) => {
                StoreError::ConnectionFailed(err.to_string())
            }
            _ => StoreError::QueryFailed(err.to_string()),
        }
    }
}

impl From<reqwest::Error> for StoreError {
    fn from(err: reqwest::Error) -> Self {
        if err.is_connect() || err.is_timeout() {
            StoreError::ConnectionFailed(err.to_string())
        } else if err.is_decode() {
            StoreError::InvalidResponse(err.to_string())
        } else {
            StoreError::RequestFailed(err.to_string())
        }
    }
}

impl From<serde_json::Error> for SeedError {
    fn from(err: serde_json::Error) -> Self {
        SeedError::InvalidJson(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fetch_error_retryability() {
        let transport = FetchError::Transport {
            url: "http://x".to_string(),
            reason: "connection reset".to_string(),
        };
        let throttled = FetchError::RetryableStatus {
            url: "http://x".to_string(),
            status: 429,
        };
        let mismatch = FetchError::EndpointMismatch {
            url: "http://x".to_string(),
        };
        let missing = FetchError::NotFound {
            url: "http://x".to_string(),
            status: 404,
        };

        assert!(transport.is_retryable());
        assert!(throttled.is_retryable());
        assert!(!mismatch.is_retryable());
        assert!(!missing.is_retryable());
    }

    #[test]
    fn test_sync_issue_display() {
        let issue = SyncIssue::Truncation {
            table: "class_sessions".to_string(),
            column: "subject".to_string(),
            original: 300,
            limit: 255,
        };
        assert_eq!(
            issue.to_string(),
            "Truncated class_sessions.subject from 300 to 255 characters"
        );
    }

    #[test]
    fn test_pipeline_error_wraps_store_error() {
        let err = PipelineError::IdentitySeed(StoreError::ConnectionFailed("refused".into()));
        assert!(err.to_string().contains("refused"));
    }
}
