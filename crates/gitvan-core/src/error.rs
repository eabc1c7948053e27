use thiserror::Error;

/// Structured error surface for the whole core. Component crates return
/// these; job bodies keep their own error types and travel as `anyhow`.
#[derive(Debug, Error)]
pub enum Error {
    #[error("git {op} exited with {code:?}: {stderr}")]
    Git {
        op: String,
        code: Option<i32>,
        stderr: String,
    },

    #[error("ref conflict on {reference}")]
    RefConflict { reference: String },

    #[error("{what} not found")]
    NotFound { what: String },

    #[error("corrupt {what}: {detail}")]
    Corruption { what: String, detail: String },

    #[error("{what} timed out after {ms}ms")]
    Timeout { what: String, ms: u64 },

    #[error("cancelled: {what}")]
    Cancelled { what: String },

    #[error("invalid name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("io on {path}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },
}

impl Error {
    pub fn corruption(what: impl Into<String>, detail: impl ToString) -> Self {
        Error::Corruption {
            what: what.into(),
            detail: detail.to_string(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;
