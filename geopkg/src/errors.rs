use backtrace::Backtrace;
use parking_lot::RwLock;
use std::error::Error;
use std::fmt::{Debug, Display, Formatter};
use std::sync::Arc;

/// Error kinds for GeoPackage operations.
///
/// The first five kinds describe the outcomes of the background machinery
/// (index building and columnar export); the remaining ones cover the
/// surrounding dataset and layer surface.
#[derive(Debug, PartialEq, Eq, Clone)]
pub enum ErrorKind {
    /// A secondary connection to the store could not be opened
    ConnectionError,
    /// Writing spatial index rows failed
    WriteError,
    /// Translating a row or stepping a cursor failed
    ReadError,
    /// The current scan cannot use the multi-connection prefetch path.
    /// This is a routing decision, not a failure.
    SchemaIncompatible,
    /// The operation was abandoned at the caller's request
    Cancelled,

    /// The operation is not valid in the current state
    InvalidOperation,
    /// Input failed validation
    ValidationError,
    /// Geometry or field data could not be encoded or decoded
    EncodingError,
    /// The requested layer, feature or table does not exist
    NotFound,
    /// File system error
    IOError,
    /// Error reported by the storage engine outside the categories above
    BackendError,
    /// Internal error (usually indicates a bug)
    InternalError,
}

impl Display for ErrorKind {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match self {
            ErrorKind::ConnectionError => write!(f, "Connection error"),
            ErrorKind::WriteError => write!(f, "Write error"),
            ErrorKind::ReadError => write!(f, "Read error"),
            ErrorKind::SchemaIncompatible => write!(f, "Schema incompatible"),
            ErrorKind::Cancelled => write!(f, "Cancelled"),
            ErrorKind::InvalidOperation => write!(f, "Invalid operation"),
            ErrorKind::ValidationError => write!(f, "Validation error"),
            ErrorKind::EncodingError => write!(f, "Encoding error"),
            ErrorKind::NotFound => write!(f, "Not found"),
            ErrorKind::IOError => write!(f, "IO error"),
            ErrorKind::BackendError => write!(f, "Backend error"),
            ErrorKind::InternalError => write!(f, "Internal error"),
        }
    }
}

/// Error type for all fallible operations of this crate.
///
/// `GpkgError` carries a message, an [`ErrorKind`], an optional cause and the
/// backtrace captured where it was created.
///
/// # Examples
///
/// ```rust
/// use geopkg::errors::{ErrorKind, GpkgError};
///
/// let cause = GpkgError::new("disk I/O error", ErrorKind::BackendError);
/// let err = GpkgError::new_with_cause("index batch rejected", ErrorKind::WriteError, cause);
/// assert_eq!(err.kind(), &ErrorKind::WriteError);
/// assert!(err.cause().is_some());
/// ```
#[derive(Clone)]
pub struct GpkgError {
    message: String,
    error_kind: ErrorKind,
    cause: Option<Box<GpkgError>>,
    backtrace: Arc<RwLock<Backtrace>>,
}

impl GpkgError {
    /// Creates a new error with the given message and kind.
    pub fn new(message: &str, error_kind: ErrorKind) -> Self {
        GpkgError {
            message: message.to_string(),
            error_kind,
            cause: None,
            backtrace: Arc::new(RwLock::new(Backtrace::new_unresolved())),
        }
    }

    /// Creates a new error wrapping `cause`.
    pub fn new_with_cause(message: &str, error_kind: ErrorKind, cause: GpkgError) -> Self {
        GpkgError {
            message: message.to_string(),
            error_kind,
            cause: Some(Box::new(cause)),
            backtrace: Arc::new(RwLock::new(Backtrace::new_unresolved())),
        }
    }

    pub fn message(&self) -> &str {
        &self.message
    }

    pub fn kind(&self) -> &ErrorKind {
        &self.error_kind
    }

    pub fn cause(&self) -> Option<&GpkgError> {
        self.cause.as_deref()
    }

    /// Returns true when the error only reports a caller-requested teardown.
    pub fn is_cancelled(&self) -> bool {
        self.error_kind == ErrorKind::Cancelled
    }

    /// Re-labels this error with another kind, keeping the original as cause.
    pub(crate) fn with_kind(self, message: &str, error_kind: ErrorKind) -> Self {
        GpkgError::new_with_cause(message, error_kind, self)
    }
}

impl Display for GpkgError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "{}: {}", self.message, cause),
            None => write!(f, "{}", self.message),
        }
    }
}

impl Debug for GpkgError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        match &self.cause {
            Some(cause) => write!(f, "[{}] {}\nCaused by: {:?}", self.error_kind, self.message, cause),
            None => {
                let mut backtrace = self.backtrace.write();
                backtrace.resolve();
                write!(f, "[{}] {}\n{:?}", self.error_kind, self.message, *backtrace)
            }
        }
    }
}

impl Error for GpkgError {
    fn source(&self) -> Option<&(dyn Error + 'static)> {
        match &self.cause {
            Some(cause) => Some(cause.as_ref()),
            None => None,
        }
    }
}

/// Shorthand for `Result<T, GpkgError>`.
pub type GpkgResult<T> = Result<T, GpkgError>;

impl From<rusqlite::Error> for GpkgError {
    fn from(err: rusqlite::Error) -> Self {
        let error_kind = match &err {
            rusqlite::Error::SqliteFailure(code, _) => match code.code {
                rusqlite::ErrorCode::CannotOpen
                | rusqlite::ErrorCode::NotADatabase
                | rusqlite::ErrorCode::PermissionDenied => ErrorKind::ConnectionError,
                rusqlite::ErrorCode::OperationInterrupted => ErrorKind::Cancelled,
                _ => ErrorKind::BackendError,
            },
            rusqlite::Error::FromSqlConversionFailure(..)
            | rusqlite::Error::InvalidColumnType(..)
            | rusqlite::Error::IntegralValueOutOfRange(..)
            | rusqlite::Error::Utf8Error(..) => ErrorKind::ReadError,
            rusqlite::Error::QueryReturnedNoRows => ErrorKind::NotFound,
            _ => ErrorKind::BackendError,
        };
        GpkgError::new(&format!("SQLite error: {}", err), error_kind)
    }
}

impl From<rusqlite::types::FromSqlError> for GpkgError {
    fn from(err: rusqlite::types::FromSqlError) -> Self {
        GpkgError::new(&format!("Column conversion error: {}", err), ErrorKind::ReadError)
    }
}

impl From<std::io::Error> for GpkgError {
    fn from(err: std::io::Error) -> Self {
        GpkgError::new(&format!("IO error: {}", err), ErrorKind::IOError)
    }
}

impl From<arrow_schema::ArrowError> for GpkgError {
    fn from(err: arrow_schema::ArrowError) -> Self {
        GpkgError::new(&format!("Arrow error: {}", err), ErrorKind::ReadError)
    }
}

impl From<GpkgError> for arrow_schema::ArrowError {
    fn from(err: GpkgError) -> Self {
        arrow_schema::ArrowError::ExternalError(Box::new(err))
    }
}
