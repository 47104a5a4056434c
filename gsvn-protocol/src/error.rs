//! Protocol errors
//!
//! Two families: [`ProtocolError`] ends the connection, [`SvnServerError`] is
//! reported to the client inside a failure envelope and the session goes on.

use gsvn_core::{AccessDenied, LockError, ObjectError, PathError, RepositoryError};
use std::fmt;

/// Stable Subversion error codes reported in failure envelopes
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorCode {
    PathSyntax,
    NoSuchRevision,
    NotFound,
    NotDirectory,
    NotFile,
    NoUser,
    PathAlreadyLocked,
    LockOwnerMismatch,
    NoSuchLock,
    OutOfDate,
    BadDate,
    IllegalUrl,
    NotAuthorized,
    CommandError,
    UnknownCommand,
    MalformedData,
    RepositoryNotFound,
    AuthenticationFailed,
    Io,
}

impl ErrorCode {
    pub fn code(&self) -> u64 {
        match self {
            Self::PathSyntax => 160005,
            Self::NoSuchRevision => 160006,
            Self::NotFound => 160013,
            Self::NotDirectory => 160016,
            Self::NotFile => 160017,
            Self::NoUser => 160034,
            Self::PathAlreadyLocked => 160035,
            Self::LockOwnerMismatch => 160039,
            Self::NoSuchLock => 160040,
            Self::OutOfDate => 160042,
            Self::BadDate => 125003,
            Self::IllegalUrl => 170000,
            Self::NotAuthorized => 170001,
            Self::CommandError => 210000,
            Self::UnknownCommand => 210001,
            Self::MalformedData => 210004,
            Self::RepositoryNotFound => 210005,
            Self::AuthenticationFailed => 215004,
            Self::Io => 200000,
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "E{}", self.code())
    }
}

/// Recoverable command failure
///
/// Serialized as one or more `( code message file line )` entries, the
/// outermost error first.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SvnServerError {
    pub code: ErrorCode,
    pub message: String,
    pub cause: Option<Box<SvnServerError>>,
}

impl SvnServerError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            cause: None,
        }
    }

    /// Wrap `cause` below a new outermost error
    pub fn wrap(code: ErrorCode, message: impl Into<String>, cause: SvnServerError) -> Self {
        Self {
            code,
            message: message.into(),
            cause: Some(Box::new(cause)),
        }
    }

    /// Outermost first
    pub fn chain(&self) -> impl Iterator<Item = &SvnServerError> {
        std::iter::successors(Some(self), |e| e.cause.as_deref())
    }

    /// Whether the failure came from an unreachable store rather than the request
    pub fn is_store_failure(&self) -> bool {
        self.code == ErrorCode::Io
    }
}

impl fmt::Display for SvnServerError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.code, self.message)?;
        if let Some(cause) = &self.cause {
            write!(f, " ({})", cause)?;
        }
        Ok(())
    }
}

impl std::error::Error for SvnServerError {}

impl From<AccessDenied> for SvnServerError {
    fn from(denied: AccessDenied) -> Self {
        Self::new(
            ErrorCode::NotAuthorized,
            format!("Access denied: {} access required on '{}'", denied.required, denied.path),
        )
    }
}

impl From<PathError> for SvnServerError {
    fn from(err: PathError) -> Self {
        Self::new(ErrorCode::PathSyntax, err.to_string())
    }
}

impl From<LockError> for SvnServerError {
    fn from(err: LockError) -> Self {
        let code = match &err {
            LockError::AlreadyLocked { .. } => ErrorCode::PathAlreadyLocked,
            LockError::NoSuchLock(_) => ErrorCode::NoSuchLock,
            LockError::OwnerMismatch { .. } => ErrorCode::LockOwnerMismatch,
            LockError::InvalidPath(_) => ErrorCode::PathSyntax,
        };
        Self::new(code, err.to_string())
    }
}

impl From<RepositoryError> for SvnServerError {
    fn from(err: RepositoryError) -> Self {
        if err.is_unavailable() {
            return Self::wrap(
                ErrorCode::Io,
                "Repository operation failed",
                Self::new(ErrorCode::CommandError, err.to_string()),
            );
        }
        let code = match &err {
            RepositoryError::NotFound { .. } => ErrorCode::NotFound,
            RepositoryError::NoSuchRevision(_) => ErrorCode::NoSuchRevision,
            RepositoryError::NotDirectory(_) => ErrorCode::NotDirectory,
            RepositoryError::NotFile(_) => ErrorCode::NotFile,
            RepositoryError::UnknownBranch(_) => ErrorCode::RepositoryNotFound,
            RepositoryError::Unavailable(_) | RepositoryError::Io(_) => ErrorCode::Io,
        };
        Self::new(code, err.to_string())
    }
}

impl From<ObjectError> for SvnServerError {
    fn from(err: ObjectError) -> Self {
        match err {
            ObjectError::NotFound(_) | ObjectError::SizeMismatch { .. } => {
                Self::new(ErrorCode::NotFound, err.to_string())
            }
            ObjectError::Unavailable(_) => Self::wrap(
                ErrorCode::Io,
                "Large object fetch failed",
                Self::new(ErrorCode::CommandError, err.to_string()),
            ),
        }
    }
}

/// Fatal connection error
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("Malformed network data: {message} (frame so far: {context:?})")]
    Malformed { message: String, context: String },

    #[error("String of {len} bytes exceeds the {max} byte limit")]
    StringTooLong { len: u64, max: usize },

    #[error("Bad arguments for '{command}': {message}")]
    BadArguments { command: String, message: String },

    #[error("Unbalanced list nesting in outgoing data")]
    Unbalanced,

    #[error("Handshake failed: {0}")]
    Handshake(String),

    #[error("Connection closed by peer")]
    Closed,

    #[error("Store unavailable during '{command}', closing connection")]
    StoreUnavailable { command: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl ProtocolError {
    pub fn malformed(message: impl Into<String>) -> Self {
        Self::Malformed {
            message: message.into(),
            context: String::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lock_error_codes() {
        let err: SvnServerError = LockError::AlreadyLocked {
            path: "/a".into(),
            owner: "alice".into(),
        }
        .into();
        assert_eq!(err.code.code(), 160035);
        assert!(err.message.contains("alice"));

        let err: SvnServerError = LockError::NoSuchLock("/a".into()).into();
        assert_eq!(err.code.code(), 160040);
    }

    #[test]
    fn test_store_failure_chain() {
        let err: SvnServerError = RepositoryError::Unavailable("disk gone".into()).into();
        assert!(err.is_store_failure());
        let codes: Vec<u64> = err.chain().map(|e| e.code.code()).collect();
        assert_eq!(codes, vec![200000, 210000]);

        let err: SvnServerError = RepositoryError::NoSuchRevision(7).into();
        assert!(!err.is_store_failure());
        assert_eq!(err.chain().count(), 1);
    }

    #[test]
    fn test_access_denied_names_path_and_level() {
        let err: SvnServerError = AccessDenied {
            user: "bob".into(),
            path: "/secret".into(),
            required: gsvn_core::AccessLevel::Write,
        }
        .into();
        assert_eq!(err.code, ErrorCode::NotAuthorized);
        assert!(err.message.contains("/secret"));
        assert!(err.message.contains("write"));
    }
}
