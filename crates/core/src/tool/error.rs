use std::borrow::Cow;
use std::fmt::{self, Display};

/// The kind of error that occurred.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    /// The input provided to the tool was invalid.
    InvalidInput,
    /// Error occurred while executing the tool.
    ExecutionError,
    /// The tool produced an output that doesn't match its schema.
    InvalidOutput,
    /// The requested tool is not registered.
    NotFound,
    /// The tool failed in a way it didn't declare.
    Unexpected,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ErrorKind::InvalidInput => write!(f, "Invalid input"),
            ErrorKind::ExecutionError => write!(f, "Execution error"),
            ErrorKind::InvalidOutput => write!(f, "Invalid output"),
            ErrorKind::NotFound => write!(f, "Tool not found"),
            ErrorKind::Unexpected => write!(f, "Unexpected error"),
        }
    }
}

/// Describes a tool call error.
///
/// Tools return `Error::execution_error()` for failures they anticipate.
/// Any other [`std::error::Error`] converts into an
/// [`ErrorKind::Unexpected`] error, so `?` works inside tool bodies.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct Error {
    kind: ErrorKind,
    reason: Option<String>,
    recoverable: bool,
}

impl Error {
    #[inline]
    fn new(kind: ErrorKind) -> Self {
        Self {
            kind,
            reason: None,
            recoverable: true,
        }
    }

    /// Creates a new error with the `InvalidInput` kind.
    #[inline]
    pub fn invalid_input() -> Self {
        Self::new(ErrorKind::InvalidInput)
    }

    /// Creates a new error with the `ExecutionError` kind.
    #[inline]
    pub fn execution_error() -> Self {
        Self::new(ErrorKind::ExecutionError)
    }

    /// Creates a new error with the `InvalidOutput` kind.
    #[inline]
    pub fn invalid_output() -> Self {
        Self::new(ErrorKind::InvalidOutput)
    }

    /// Creates a new error with the `NotFound` kind.
    #[inline]
    pub fn not_found() -> Self {
        Self::new(ErrorKind::NotFound)
    }

    /// Creates a new error with the `Unexpected` kind.
    #[inline]
    pub fn unexpected() -> Self {
        Self::new(ErrorKind::Unexpected)
    }

    /// Attaches a reason to the error.
    #[inline]
    pub fn with_reason<S: Into<String>>(self, reason: S) -> Self {
        Self {
            reason: Some(reason.into()),
            ..self
        }
    }

    /// Marks the error as not recoverable, telling the model that retrying
    /// with different input won't help.
    #[inline]
    pub fn unrecoverable(self) -> Self {
        Self {
            recoverable: false,
            ..self
        }
    }

    /// Returns the kind of this error.
    #[inline]
    pub fn kind(&self) -> ErrorKind {
        self.kind
    }

    /// Returns whether the model may retry with different input.
    #[inline]
    pub fn is_recoverable(&self) -> bool {
        self.recoverable
    }

    /// Returns the reason for the error.
    #[inline]
    pub fn reason(&self) -> Cow<'_, str> {
        match self.reason.as_deref() {
            Some(reason) => Cow::Borrowed(reason),
            None => Cow::Owned(format!("{}", self.kind)),
        }
    }
}

impl Display for Error {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.reason())
    }
}

impl<E: std::error::Error + Send + Sync + 'static> From<E> for Error {
    fn from(err: E) -> Self {
        Self::unexpected().with_reason(format!("Unexpected error: {err}"))
    }
}
