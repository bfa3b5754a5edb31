use std::fmt;

use crate::analyzer::RejectReason;
use crate::rewrite::RewriteError;

/// Main error type for the pg_view_dml extension
#[derive(Debug, Clone, PartialEq)]
pub enum ViewDmlError {
    /// The trigger context is missing or has the wrong shape
    Invocation(InvocationError),

    /// The view definition failed the updatability analysis
    NotUpdatable(RejectReason),

    /// Statement generation failed
    Rewrite(RewriteError),

    /// Catalog lookup failed or returned something unusable
    Catalog {
        operation: String,
        detail: String,
    },

    /// SPI query failed
    Spi {
        query: String,
        error: String,
    },

    /// The generated statement failed at execution time
    Execution {
        statement: String,
        error: String,
    },

    /// Serialization/deserialization failed
    Serialization {
        message: String,
    },
}

/// Precondition violations on the trigger invocation itself.
///
/// These are all hard errors: the router must only ever run as an
/// INSTEAD OF row-level trigger on a view.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum InvocationError {
    /// Not called as a trigger, or the trigger context is unreadable
    NotTrigger,
    /// Fired BEFORE or AFTER instead of INSTEAD OF
    NotInsteadOf,
    /// Fired per-statement instead of per-row
    NotPerRow,
    /// Fired for an event the router does not handle (e.g. TRUNCATE)
    UnsupportedEvent { event: String },
}

impl ViewDmlError {
    /// Get the PostgreSQL SQLSTATE code for this error
    pub fn sqlstate(&self) -> &'static str {
        use ViewDmlError::*;
        match self {
            Invocation(_) => "39P01",   // Trigger protocol violated
            NotUpdatable(_) => "55000", // Object not in prerequisite state
            Rewrite(RewriteError::EmptyMapping) => "0A000", // Feature not supported
            Rewrite(_) => "22023",      // Invalid parameter value
            Catalog { .. } => "XX000",
            Spi { .. } => "XX000",
            Execution { .. } => "XX000",
            Serialization { .. } => "XX000",
        }
    }
}

impl fmt::Display for ViewDmlError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use ViewDmlError::*;
        match self {
            Invocation(e) => write!(f, "{}", e),
            NotUpdatable(reason) => write!(f, "{}", reason),
            Rewrite(e) => write!(f, "{}", e),
            Catalog { operation, detail } => {
                write!(f, "catalog operation '{}' failed: {}", operation, detail)
            }
            Spi { query, error } => {
                write!(f, "SPI query failed: {}\nQuery: {}", error,
                       if query.len() > 100 { &query[..100] } else { query })
            }
            Execution { statement, error } => {
                write!(f, "generated statement failed: {}\nStatement: {}", error,
                       if statement.len() > 100 { &statement[..100] } else { statement })
            }
            Serialization { message } => {
                write!(f, "serialization error: {}", message)
            }
        }
    }
}

impl fmt::Display for InvocationError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        use InvocationError::*;
        match self {
            NotTrigger => write!(f, "not called as a row-level trigger"),
            NotInsteadOf => write!(f, "not called in INSTEAD OF mode"),
            NotPerRow => write!(f, "not called FOR EACH ROW"),
            UnsupportedEvent { event } => {
                write!(f, "unsupported trigger event: {}", event)
            }
        }
    }
}

impl std::error::Error for ViewDmlError {}
impl std::error::Error for InvocationError {}

/// Result type for pg_view_dml operations
pub type ViewDmlResult<T> = Result<T, ViewDmlError>;

impl From<InvocationError> for ViewDmlError {
    fn from(e: InvocationError) -> Self {
        ViewDmlError::Invocation(e)
    }
}

impl From<RejectReason> for ViewDmlError {
    fn from(reason: RejectReason) -> Self {
        ViewDmlError::NotUpdatable(reason)
    }
}

impl From<RewriteError> for ViewDmlError {
    fn from(e: RewriteError) -> Self {
        ViewDmlError::Rewrite(e)
    }
}

/// Convert SpiError to ViewDmlError
impl From<pgrx::spi::Error> for ViewDmlError {
    fn from(e: pgrx::spi::Error) -> Self {
        ViewDmlError::Spi {
            query: "Unknown".to_string(),
            error: e.to_string(),
        }
    }
}

/// Convert serde_json::Error to ViewDmlError
impl From<serde_json::Error> for ViewDmlError {
    fn from(e: serde_json::Error) -> Self {
        ViewDmlError::Serialization {
            message: format!("JSON serialization error: {}", e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_not_updatable_message() {
        let err = ViewDmlError::NotUpdatable(RejectReason::HasGroupBy);

        let msg = err.to_string();
        assert!(msg.contains("GROUP BY"));
        assert_eq!(err.sqlstate(), "55000");
    }

    #[test]
    fn test_invocation_messages() {
        let err = ViewDmlError::Invocation(InvocationError::NotInsteadOf);
        assert!(err.to_string().contains("INSTEAD OF"));
        assert_eq!(err.sqlstate(), "39P01");

        let err = ViewDmlError::Invocation(InvocationError::NotPerRow);
        assert!(err.to_string().contains("FOR EACH ROW"));
    }

    #[test]
    fn test_rewrite_sqlstates() {
        assert_eq!(
            ViewDmlError::Rewrite(RewriteError::EmptyMapping).sqlstate(),
            "0A000"
        );
        assert_eq!(
            ViewDmlError::Rewrite(RewriteError::MissingColumnValue { position: 2 }).sqlstate(),
            "22023"
        );
    }

    #[test]
    fn test_long_query_is_truncated() {
        let err = ViewDmlError::Spi {
            query: "x".repeat(500),
            error: "boom".to_string(),
        };
        let msg = err.to_string();
        assert!(msg.len() < 250);
        assert!(msg.contains("boom"));
    }
}
