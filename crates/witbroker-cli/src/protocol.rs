//! JSON-lines request/response shapes for `wb serve`.
//!
//! One request object per input line, tagged by `"op"`. Every response is a
//! single line: `{"ok": true, ...}` on success, or
//! `{"ok": false, "code", "error", "hint"}` on failure.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use witbroker_core::{BrokerError, ErrorCode, Mutation, Selector, WorkItemId};

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(tag = "op", rename_all = "lowercase", rename_all_fields = "camelCase")]
pub enum Request {
    /// Execute a query against the tracker and issue a handle for the result.
    Query {
        ids: Vec<WorkItemId>,
        #[serde(default)]
        source: String,
    },
    List {
        #[serde(default)]
        include_expired: bool,
        #[serde(default)]
        offset: usize,
        #[serde(default)]
        limit: Option<usize>,
    },
    Info {
        handle: String,
    },
    /// Resolve a selector and preview the result without touching anything.
    Select {
        handle: String,
        #[serde(default)]
        selector: Option<Value>,
        #[serde(default)]
        max_preview: Option<usize>,
    },
    Bulk {
        handle: String,
        #[serde(default)]
        selector: Option<Value>,
        mutation: Mutation,
        #[serde(default)]
        dry_run: Option<bool>,
        #[serde(default)]
        stop_on_error: Option<bool>,
        #[serde(default)]
        max_preview: Option<usize>,
    },
    Undo {
        handle: String,
        #[serde(default)]
        all: bool,
    },
    History {
        handle: String,
    },
    Drop {
        handle: String,
    },
}

impl Request {
    /// Parse one input line.
    ///
    /// # Errors
    ///
    /// [`ErrorReply`] with [`ErrorCode::MalformedRequest`] if the line is not
    /// a valid request.
    pub fn parse(line: &str) -> Result<Self, ErrorReply> {
        serde_json::from_str(line)
            .map_err(|err| ErrorReply::new(ErrorCode::MalformedRequest, err.to_string()))
    }

    /// Short name for logs.
    pub const fn op(&self) -> &'static str {
        match self {
            Self::Query { .. } => "query",
            Self::List { .. } => "list",
            Self::Info { .. } => "info",
            Self::Select { .. } => "select",
            Self::Bulk { .. } => "bulk",
            Self::Undo { .. } => "undo",
            Self::History { .. } => "history",
            Self::Drop { .. } => "drop",
        }
    }
}

/// Decode a selector separately so bad selectors get their own error code.
/// An absent selector means every item.
///
/// # Errors
///
/// [`ErrorReply`] with [`ErrorCode::InvalidSelector`].
pub fn parse_selector(raw: Option<Value>) -> Result<Selector, ErrorReply> {
    match raw {
        None | Some(Value::Null) => Ok(Selector::All),
        Some(value) => serde_json::from_value(value)
            .map_err(|err| ErrorReply::new(ErrorCode::InvalidSelector, err.to_string())),
    }
}

/// Successful response wrapper.
#[derive(Debug, Serialize)]
pub struct OkReply<T: Serialize> {
    ok: bool,
    #[serde(flatten)]
    body: T,
}

impl<T: Serialize> OkReply<T> {
    pub const fn new(body: T) -> Self {
        Self { ok: true, body }
    }
}

/// Failure response.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ErrorReply {
    ok: bool,
    pub code: &'static str,
    pub error: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hint: Option<&'static str>,
}

impl ErrorReply {
    pub fn new(code: ErrorCode, error: impl Into<String>) -> Self {
        Self {
            ok: false,
            code: code.code(),
            error: error.into(),
            hint: code.hint(),
        }
    }
}

impl From<BrokerError> for ErrorReply {
    fn from(err: BrokerError) -> Self {
        Self::new(err.code(), err.to_string())
    }
}
