//! Error model for tao.
//!
//! Every error carries a machine-readable [`ErrorCode`], a human-readable
//! message, and an optional chain of [`Cause`] links. Concurrent failures are
//! merged by appending causes, so one error can report every task that failed
//! without dropping detail:
//!
//! ```text
//! task B failed
//! ==> task C failed
//! ==> task D failed
//! ```

use std::fmt;

use thiserror::Error;

/// Separator rendered between an error and each of its causes.
pub const ERROR_SPLIT: &str = "\n==> ";

/// Result alias used across tao.
pub type TaoResult<T> = Result<T, TaoError>;

/// Kind of failure, independent of the concrete message.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    /// Aggregated or foreign failure.
    Unknown,
    /// Bad caller input: empty name, duplicate registration, missing argument.
    ParamInvalid,
    /// The context was already done at a checkpoint.
    ContextCanceled,
    /// A one-shot operation was invoked more than once.
    DuplicateCall,
    TaskRunTwice,
    TaskCloseTwice,
    TaskClosed,
    TaskRunning,
    /// No configuration exists for the requested key. Callers usually fall
    /// back to defaults.
    ConfigNotFound,
    /// Caller-defined code.
    Other(String),
}

impl ErrorCode {
    pub fn as_str(&self) -> &str {
        match self {
            ErrorCode::Unknown => "Unknown",
            ErrorCode::ParamInvalid => "ParamInvalid",
            ErrorCode::ContextCanceled => "ContextCanceled",
            ErrorCode::DuplicateCall => "DuplicateCall",
            ErrorCode::TaskRunTwice => "TaskRunTwice",
            ErrorCode::TaskCloseTwice => "TaskCloseTwice",
            ErrorCode::TaskClosed => "TaskClosed",
            ErrorCode::TaskRunning => "TaskRunning",
            ErrorCode::ConfigNotFound => "ConfigNotFound",
            ErrorCode::Other(code) => code,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl From<&str> for ErrorCode {
    fn from(code: &str) -> Self {
        match code {
            "Unknown" => ErrorCode::Unknown,
            "ParamInvalid" => ErrorCode::ParamInvalid,
            "ContextCanceled" => ErrorCode::ContextCanceled,
            "DuplicateCall" => ErrorCode::DuplicateCall,
            "TaskRunTwice" => ErrorCode::TaskRunTwice,
            "TaskCloseTwice" => ErrorCode::TaskCloseTwice,
            "TaskClosed" => ErrorCode::TaskClosed,
            "TaskRunning" => ErrorCode::TaskRunning,
            "ConfigNotFound" => ErrorCode::ConfigNotFound,
            other => ErrorCode::Other(other.to_string()),
        }
    }
}

impl From<String> for ErrorCode {
    fn from(code: String) -> Self {
        ErrorCode::from(code.as_str())
    }
}

/// One link of a cause chain.
///
/// `code` is kept when the cause originated from a [`TaoError`], so merged
/// errors stay queryable by kind.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", render_chain(.next))]
pub struct Cause {
    code: Option<ErrorCode>,
    message: String,
    #[source]
    next: Option<Box<Cause>>,
}

impl Cause {
    /// Cause from any displayable error without a tao code.
    pub fn foreign(err: &dyn fmt::Display) -> Self {
        Self {
            code: None,
            message: err.to_string(),
            next: None,
        }
    }

    pub fn code(&self) -> Option<&ErrorCode> {
        self.code.as_ref()
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn next(&self) -> Option<&Cause> {
        self.next.as_deref()
    }

    fn push_tail(&mut self, link: Cause) {
        match self.next {
            Some(ref mut next) => next.push_tail(link),
            None => self.next = Some(Box::new(link)),
        }
    }
}

impl From<&TaoError> for Cause {
    fn from(err: &TaoError) -> Self {
        Self {
            code: Some(err.code.clone()),
            message: err.to_string(),
            next: None,
        }
    }
}

impl From<TaoError> for Cause {
    fn from(err: TaoError) -> Self {
        Cause::from(&err)
    }
}

/// Code + message + cause chain.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("{message}{}", render_chain(.cause))]
pub struct TaoError {
    code: ErrorCode,
    message: String,
    #[source]
    cause: Option<Box<Cause>>,
}

impl TaoError {
    pub fn new(code: impl Into<ErrorCode>, message: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            message: message.into(),
            cause: None,
        }
    }

    /// Fresh `Unknown` error whose first cause is `source`.
    pub fn wrapped(message: impl Into<String>, source: impl Into<Cause>) -> Self {
        let mut err = Self::new(ErrorCode::Unknown, message);
        err.wrap(source);
        err
    }

    /// Start an aggregate from the first observed failure.
    ///
    /// The aggregate's message is the full rendering of `first`, so a parent
    /// pipeline that aggregates a failed child reports the same text as the
    /// child itself.
    pub fn aggregate(first: &TaoError) -> Self {
        Self::new(ErrorCode::Unknown, first.to_string())
    }

    /// Merge `err` into `slot`: the first error becomes the aggregate base,
    /// later ones are appended as causes.
    pub fn merge_into(slot: &mut Option<TaoError>, err: &TaoError) {
        match slot {
            Some(agg) => agg.wrap(err),
            None => *slot = Some(TaoError::aggregate(err)),
        }
    }

    pub fn code(&self) -> &ErrorCode {
        &self.code
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn is(&self, code: &ErrorCode) -> bool {
        &self.code == code
    }

    /// First link of the cause chain.
    pub fn cause(&self) -> Option<&Cause> {
        self.cause.as_deref()
    }

    /// Every cause in merge order.
    pub fn causes(&self) -> impl Iterator<Item = &Cause> {
        std::iter::successors(self.cause(), |c| c.next())
    }

    /// Append `cause` at the tail of the chain.
    pub fn wrap(&mut self, cause: impl Into<Cause>) {
        let link = cause.into();
        match self.cause {
            Some(ref mut head) => head.push_tail(link),
            None => self.cause = Some(Box::new(link)),
        }
    }
}

fn render_chain(next: &Option<Box<Cause>>) -> String {
    match next {
        Some(cause) => format!("{ERROR_SPLIT}{cause}"),
        None => String::new(),
    }
}

impl From<std::io::Error> for TaoError {
    fn from(err: std::io::Error) -> Self {
        TaoError::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<serde_json::Error> for TaoError {
    fn from(err: serde_json::Error) -> Self {
        TaoError::new(ErrorCode::Unknown, err.to_string())
    }
}

impl From<anyhow::Error> for TaoError {
    fn from(err: anyhow::Error) -> Self {
        TaoError::new(ErrorCode::Unknown, format!("{err:#}"))
    }
}
