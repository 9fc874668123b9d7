//! Error types shared by the benchmark engine and the catalog adapters.

use thiserror::Error;

/// A failure of a single catalog request.
///
/// Workers record these on the [`Operation`](crate::Operation) and keep going. Only the
/// connectivity probe in [`BenchmarkJob::prepare`](crate::bench::BenchmarkJob::prepare) turns one
/// into a fatal [`Error`].
#[derive(Debug, Error, Clone, PartialEq)]
pub enum CatalogError {
    /// The request never produced a response (connect/read/timeout failures).
    #[error("transport error: {0}")]
    Transport(String),

    /// The catalog answered, but refused the request.
    #[error("rejected with status {status}: {message}")]
    Rejected { status: u16, message: String },

    /// The context was already done when the request was about to be issued.
    #[error("request cancelled")]
    Cancelled,
}

/// Errors that abort a benchmark before or between its phases.
#[derive(Debug, Error)]
pub enum Error {
    #[error("no tables found: check tree configuration")]
    NoTargets,

    #[error("cannot access table {target}")]
    Connectivity {
        target: String,
        #[source]
        source: CatalogError,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("failed to parse configuration")]
    Parse(#[from] figment::Error),

    #[error("catalog {0} not found in registry")]
    UnknownCatalog(String),

    #[error("benchmark job is {found}, expected {expected}")]
    InvalidState {
        expected: &'static str,
        found: &'static str,
    },

    #[error("cannot spawn thread {name}")]
    Spawn {
        name: String,
        #[source]
        source: std::io::Error,
    },

    #[error("cannot read {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub(crate) fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
