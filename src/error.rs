//! Error types for the buffer statistics service.

use std::fmt;
use thiserror::Error;

/// Result type alias for service operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors reported by the backing key-value store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// Transaction exceeds the store's per-transaction operation limit.
    #[error("transaction has {ops} operations, the limit is {limit}")]
    TooManyOps { ops: usize, limit: usize },

    /// Watch requested from a revision that is no longer retained.
    #[error("required revision {requested} has been compacted, oldest retained is {compacted}")]
    Compacted { requested: u64, compacted: u64 },

    /// Transient failure, the operation may be retried later.
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// Value could not be encoded or decoded.
    #[error("cannot decode value of \"{key}\": {source}")]
    Decode {
        key: String,
        #[source]
        source: serde_json::Error,
    },

    #[error("cannot encode value: {0}")]
    Encode(#[from] serde_json::Error),
}

/// Main error type for domain operations.
#[derive(Error, Debug)]
pub enum Error {
    /// Resource is absent.
    #[error("{kind} \"{id}\" not found in the {parent}")]
    NotFound {
        kind: &'static str,
        id: String,
        parent: &'static str,
    },

    /// Compare-and-swap lost, the resource already exists.
    #[error("{kind} \"{id}\" already exists in the {parent}")]
    AlreadyExists {
        kind: &'static str,
        id: String,
        parent: &'static str,
    },

    /// Compare-and-swap lost, the entity was already moved by someone else.
    #[error("{kind} \"{key}\" is already in the \"{state}\" state")]
    AlreadyInState {
        kind: &'static str,
        key: String,
        state: String,
    },

    /// Transition not present in the state machine table.
    #[error("unexpected {kind} state transition \"{from}\" -> \"{to}\"")]
    InvalidTransition {
        kind: &'static str,
        from: String,
        to: String,
    },

    /// Quota exceeded.
    #[error("{kind} count limit reached in the {parent}, the maximum is {limit}")]
    CountLimitReached {
        kind: &'static str,
        limit: usize,
        parent: &'static str,
    },

    /// Related store state does not allow the operation, e.g. a stale opened
    /// file/slice pointer or an older slice not closed yet.
    #[error("{0}")]
    Mismatch(String),

    /// Remote file manager failure.
    #[error("file manager error: {0}")]
    FileManager(String),

    #[error("config error: {0}")]
    Config(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Multi(#[from] MultiError),

    /// Context added to an inner error.
    #[error("{context}: {source}")]
    Context {
        context: String,
        #[source]
        source: Box<Error>,
    },
}

impl Error {
    /// Wrap the error with a message, `cannot close slice "x": <inner>`.
    pub fn context(self, context: impl Into<String>) -> Error {
        Error::Context {
            context: context.into(),
            source: Box::new(self),
        }
    }

    /// True for compare-and-swap losses, expected under concurrent operation.
    pub fn is_conflict(&self) -> bool {
        match self {
            Error::AlreadyExists { .. } | Error::AlreadyInState { .. } => true,
            Error::Context { source, .. } => source.is_conflict(),
            _ => false,
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            Error::NotFound { .. } => true,
            Error::Context { source, .. } => source.is_not_found(),
            _ => false,
        }
    }
}

/// Collection of errors from independently applied operations.
///
/// Operations that succeeded are not rolled back.
#[derive(Debug, Default)]
pub struct MultiError {
    errors: Vec<Error>,
}

impl MultiError {
    pub fn new() -> Self {
        MultiError { errors: Vec::new() }
    }

    pub fn push(&mut self, err: impl Into<Error>) {
        self.errors.push(err.into());
    }

    pub fn len(&self) -> usize {
        self.errors.len()
    }

    pub fn is_empty(&self) -> bool {
        self.errors.is_empty()
    }

    pub fn errors(&self) -> &[Error] {
        &self.errors
    }

    /// `Ok(())` when no error was collected, a single error is returned as is.
    pub fn into_result(mut self) -> Result<()> {
        match self.errors.len() {
            0 => Ok(()),
            1 => Err(self.errors.remove(0)),
            _ => Err(Error::Multi(self)),
        }
    }
}

impl fmt::Display for MultiError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} errors occurred:", self.errors.len())?;
        for err in &self.errors {
            write!(f, "\n- {}", err)?;
        }
        Ok(())
    }
}

impl std::error::Error for MultiError {}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_messages() {
        let err = Error::AlreadyInState {
            kind: "slice",
            key: "123/my-receiver".to_string(),
            state: "closing".to_string(),
        };
        assert_eq!(err.to_string(), "slice \"123/my-receiver\" is already in the \"closing\" state");
        assert!(err.is_conflict());

        let err = err.context("cannot close slice");
        assert_eq!(
            err.to_string(),
            "cannot close slice: slice \"123/my-receiver\" is already in the \"closing\" state"
        );
        assert!(err.is_conflict());
    }

    #[test]
    fn test_multi_error() {
        assert!(MultiError::new().into_result().is_ok());

        let mut errs = MultiError::new();
        errs.push(StoreError::Unavailable("node down".to_string()));
        let err = errs.into_result().unwrap_err();
        assert_eq!(err.to_string(), "store unavailable: node down");

        let mut errs = MultiError::new();
        errs.push(StoreError::Unavailable("a".to_string()));
        errs.push(StoreError::Unavailable("b".to_string()));
        assert_eq!(errs.len(), 2);
        let err = errs.into_result().unwrap_err();
        assert_eq!(
            err.to_string(),
            "2 errors occurred:\n- store unavailable: a\n- store unavailable: b"
        );
    }
}
