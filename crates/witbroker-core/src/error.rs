use crate::model::{BeforeState, WorkItemId};
use std::fmt;

/// Machine-readable error codes for agent-friendly decision making.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    EmptyQuery,
    MalformedRequest,
    HandleNotFoundOrExpired,
    SelectorIndexOutOfRange,
    InvalidSelector,
    MutationFailure,
    IrreversibleOperation,
    ForeignIdentifier,
    ConfigParseError,
    InternalUnexpected,
}

impl ErrorCode {
    /// Stable code identifier (`E####`) for machine parsing.
    #[must_use]
    pub const fn code(self) -> &'static str {
        match self {
            Self::EmptyQuery => "E1001",
            Self::MalformedRequest => "E1002",
            Self::HandleNotFoundOrExpired => "E2001",
            Self::SelectorIndexOutOfRange => "E2002",
            Self::InvalidSelector => "E2003",
            Self::MutationFailure => "E3001",
            Self::IrreversibleOperation => "E3002",
            Self::ForeignIdentifier => "E3003",
            Self::ConfigParseError => "E5001",
            Self::InternalUnexpected => "E9001",
        }
    }

    /// Short human-facing summary for logs and protocol output.
    #[must_use]
    pub const fn message(self) -> &'static str {
        match self {
            Self::EmptyQuery => "Query returned no work items",
            Self::MalformedRequest => "Request could not be parsed",
            Self::HandleNotFoundOrExpired => "Query handle not found or expired",
            Self::SelectorIndexOutOfRange => "Selector index out of range",
            Self::InvalidSelector => "Invalid item selector",
            Self::MutationFailure => "Work item mutation failed",
            Self::IrreversibleOperation => "Operation cannot be truly reversed",
            Self::ForeignIdentifier => "Identifier is not part of the query handle",
            Self::ConfigParseError => "Config file parse error",
            Self::InternalUnexpected => "Internal unexpected error",
        }
    }

    /// Optional remediation hint that can be surfaced to operators and agents.
    #[must_use]
    pub const fn hint(self) -> Option<&'static str> {
        match self {
            Self::EmptyQuery => Some("Broaden the query; handles are only issued for non-empty results."),
            Self::MalformedRequest => {
                Some("Send one JSON object per line with an \"op\" field.")
            }
            Self::HandleNotFoundOrExpired => {
                Some("Handles live for one hour. Re-run the query to obtain a fresh handle.")
            }
            Self::SelectorIndexOutOfRange => {
                Some("Indices are zero-based positions in the handle's result order.")
            }
            Self::InvalidSelector => Some(
                "Use \"all\", an array of indices, or an object with states/titleContains/tags/daysInactiveMin/daysInactiveMax.",
            ),
            Self::MutationFailure => None,
            Self::IrreversibleOperation => {
                Some("Comments cannot be deleted remotely; a retraction note was posted instead.")
            }
            Self::ForeignIdentifier => {
                Some("Only identifiers returned by the original query may be recorded.")
            }
            Self::ConfigParseError => Some("Fix syntax in .witbroker/config.toml and retry."),
            Self::InternalUnexpected => Some("Retry once. If persistent, report a bug with logs."),
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.code())
    }
}

/// Whole-call failures. Anything returned as a `BrokerError` aborted the call
/// before any work item was touched, or refers to store state only.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("cannot create a query handle from zero work items")]
    EmptyQuery,

    #[error("query handle {handle} not found or expired")]
    HandleNotFoundOrExpired { handle: String },

    #[error("work item {id} is not part of query handle {handle}")]
    ForeignIdentifier { handle: String, id: WorkItemId },

    #[error("handle store lock poisoned")]
    LockPoisoned,
}

impl BrokerError {
    pub(crate) fn not_found(handle: &str) -> Self {
        Self::HandleNotFoundOrExpired {
            handle: handle.to_string(),
        }
    }

    /// Machine-readable code associated with this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::EmptyQuery => ErrorCode::EmptyQuery,
            Self::HandleNotFoundOrExpired { .. } => ErrorCode::HandleNotFoundOrExpired,
            Self::ForeignIdentifier { .. } => ErrorCode::ForeignIdentifier,
            Self::LockPoisoned => ErrorCode::InternalUnexpected,
        }
    }

    /// Optional remediation hint for operators and agents.
    #[must_use]
    pub const fn hint(&self) -> Option<&'static str> {
        self.code().hint()
    }
}

/// Result type for handle store and ledger operations.
pub type Result<T> = std::result::Result<T, BrokerError>;

/// A single work item mutation that failed against the backend.
///
/// These are always reported per identifier and never abort sibling items
/// unless the caller asked to stop on the first error.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum MutationError {
    #[error("remote call failed: {message}")]
    Remote { message: String },

    #[error("work item {id} does not exist")]
    MissingItem { id: WorkItemId },

    #[error("mutation rejected: {reason}")]
    Rejected { reason: String },

    /// A multi-field write failed midway and the rollback failed too. The
    /// item is changed, so `before` must still reach the ledger.
    #[error("{error}; work item left partially updated")]
    PartiallyApplied { error: String, before: BeforeState },
}

impl MutationError {
    /// Convenience constructor for transport-level failures.
    pub fn remote(message: impl Into<String>) -> Self {
        Self::Remote {
            message: message.into(),
        }
    }

    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        ErrorCode::MutationFailure
    }

    /// Reversal data for an item this failure nevertheless changed.
    #[must_use]
    pub const fn partial_before(&self) -> Option<&BeforeState> {
        match self {
            Self::PartiallyApplied { before, .. } => Some(before),
            _ => None,
        }
    }
}
