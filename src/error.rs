use thiserror::Error;

/// Errors surfaced by the attribution backend.
///
/// Validation failures abort a call before any state mutation. A depleted
/// privacy budget is not an error: the affected histogram degrades to zeros
/// and the call still succeeds.
#[derive(Debug, Error)]
pub enum AttributionError {
    /// A site or URL does not parse.
    #[error("invalid site or URL: {0}")]
    InvalidSyntax(String),

    /// A numeric argument is outside its declared interval.
    #[error("argument out of range: {0}")]
    OutOfRange(String),

    /// The aggregation service URL is not in the configured map.
    #[error("unknown aggregation service: {0}")]
    UnknownReference(String),

    /// An internal invariant was violated. Indicates an implementation bug
    /// and is fatal to the call.
    #[error("internal invariant violated: {0}")]
    InvalidState(String),

    /// Attribution measurement is disabled. Never returned by the backend;
    /// disabled calls degrade to empty results instead.
    #[error("attribution measurement is disabled")]
    Disabled,
}
