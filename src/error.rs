//! Error types for melting.

use thiserror::Error;

/// Errors raised while configuring, melting or persisting records.
#[derive(Debug, Error)]
pub enum MeltError {
    /// Invalid settings. Always fatal, never routed through recovery.
    #[error("invalid configuration: {0}")]
    Configuration(String),

    /// Input has the wrong shape, e.g. a record that is not an object.
    #[error("invalid record{}: {reason}", fmt_record(.record))]
    Validation { record: Option<usize>, reason: String },

    /// Failure while flattening or identifying a specific node.
    #[error("failed to process '{path}'{}: {reason}", fmt_record(.record))]
    Processing {
        path: String,
        record: Option<usize>,
        reason: String,
    },

    /// Malformed serialized input surfaced by a source.
    #[error("failed to parse input{}: {message}", fmt_line(.line))]
    Parsing { line: Option<usize>, message: String },

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// A sink could not persist rows for a table.
    #[error("failed to write table {table}: {source}")]
    Sink {
        table: String,
        #[source]
        source: std::io::Error,
    },
}

fn fmt_record(record: &Option<usize>) -> String {
    record.map(|r| format!(" (record {r})")).unwrap_or_default()
}

fn fmt_line(line: &Option<usize>) -> String {
    line.map(|l| format!(" at line {l}")).unwrap_or_default()
}

impl MeltError {
    pub fn config(reason: impl Into<String>) -> Self {
        MeltError::Configuration(reason.into())
    }

    pub fn processing(path: &[String], reason: impl Into<String>) -> Self {
        MeltError::Processing {
            path: display_path(path),
            record: None,
            reason: reason.into(),
        }
    }

    /// Attach the ordinal of the record being processed, keeping any existing one.
    pub fn in_record(self, index: usize) -> Self {
        match self {
            MeltError::Processing { path, record, reason } => MeltError::Processing {
                path,
                record: record.or(Some(index)),
                reason,
            },
            MeltError::Validation { record, reason } => MeltError::Validation {
                record: record.or(Some(index)),
                reason,
            },
            other => other,
        }
    }

    /// Whether a recovery policy may absorb this error.
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            MeltError::Validation { .. } | MeltError::Processing { .. } | MeltError::Parsing { .. }
        )
    }

    /// Short machine-readable kind, used in error marker rows.
    pub fn kind(&self) -> &'static str {
        match self {
            MeltError::Configuration(_) => "configuration",
            MeltError::Validation { .. } => "validation",
            MeltError::Processing { .. } => "processing",
            MeltError::Parsing { .. } => "parsing",
            MeltError::Io(_) => "io",
            MeltError::Sink { .. } => "sink",
        }
    }

    /// The structural path the error refers to, if any.
    pub fn path(&self) -> &str {
        match self {
            MeltError::Processing { path, .. } => path,
            _ => "",
        }
    }
}

/// Render a path for humans: `$` for the root, dotted keys otherwise.
pub fn display_path(path: &[String]) -> String {
    if path.is_empty() {
        "$".to_string()
    } else {
        format!("$.{}", path.join("."))
    }
}

pub type Result<T> = std::result::Result<T, MeltError>;
