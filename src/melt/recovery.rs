//! Error recovery policy.
//!
//! Each record and each array element is one recoverable unit. The engine
//! hands the unit's `Result` to [`RecoveryPolicy::resolve`], which turns it
//! into an explicit [`Outcome`] instead of unwinding.

use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{MeltError, Result};
use crate::melt::types::FlatRow;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecoveryMode {
    /// The first failure aborts the record and the call.
    #[default]
    Strict,
    /// The smallest failing unit is dropped.
    Skip,
    /// The smallest failing unit is replaced by an error-marked row.
    Partial,
}

impl FromStr for RecoveryMode {
    type Err = MeltError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "strict" => Ok(RecoveryMode::Strict),
            "skip" => Ok(RecoveryMode::Skip),
            "partial" => Ok(RecoveryMode::Partial),
            other => Err(MeltError::config(format!("unknown recovery mode '{other}'"))),
        }
    }
}

/// What a recovered failure leaves behind.
#[derive(Debug, Clone, PartialEq)]
pub struct ErrorMarker {
    pub kind: &'static str,
    pub path: String,
    pub message: String,
}

impl ErrorMarker {
    pub fn from_error(err: &MeltError) -> Self {
        ErrorMarker {
            kind: err.kind(),
            path: err.path().to_string(),
            message: err.to_string(),
        }
    }
}

/// Result of one unit of work after the policy has seen it.
#[derive(Debug)]
pub enum Outcome<T> {
    Ok(T),
    /// The unit failed and was replaced.
    Recovered(T, ErrorMarker),
    /// The unit failed and was dropped.
    Skipped(ErrorMarker),
    Fatal(MeltError),
}

impl<T> Outcome<T> {
    /// The produced value, if any, or the fatal error.
    pub fn into_result(self) -> Result<Option<T>> {
        match self {
            Outcome::Ok(value) | Outcome::Recovered(value, _) => Ok(Some(value)),
            Outcome::Skipped(_) => Ok(None),
            Outcome::Fatal(err) => Err(err),
        }
    }
}

#[derive(Debug, Clone)]
pub struct RecoveryPolicy {
    mode: RecoveryMode,
    error_field: String,
    error_path_field: String,
    cycle_placeholder: String,
}

impl RecoveryPolicy {
    pub fn new(
        mode: RecoveryMode,
        error_field: impl Into<String>,
        error_path_field: impl Into<String>,
        cycle_placeholder: impl Into<String>,
    ) -> Self {
        RecoveryPolicy {
            mode,
            error_field: error_field.into(),
            error_path_field: error_path_field.into(),
            cycle_placeholder: cycle_placeholder.into(),
        }
    }

    pub fn mode(&self) -> RecoveryMode {
        self.mode
    }

    /// Interpret the result of one unit. `replacement` builds the stand-in
    /// value for partial recovery.
    pub fn resolve<T>(
        &self,
        result: Result<T>,
        replacement: impl FnOnce(&ErrorMarker) -> T,
    ) -> Outcome<T> {
        let err = match result {
            Ok(value) => return Outcome::Ok(value),
            Err(err) => err,
        };
        if !err.is_recoverable() {
            return Outcome::Fatal(err);
        }

        match self.mode {
            RecoveryMode::Strict => Outcome::Fatal(err),
            RecoveryMode::Skip => {
                tracing::warn!(error = %err, "skipping failed unit");
                Outcome::Skipped(ErrorMarker::from_error(&err))
            }
            RecoveryMode::Partial => {
                tracing::warn!(error = %err, "replacing failed unit with error marker");
                let marker = ErrorMarker::from_error(&err);
                let value = replacement(&marker);
                Outcome::Recovered(value, marker)
            }
        }
    }

    /// Value to write in place of a branch that loops back onto the active
    /// path, or an error under strict recovery.
    pub fn on_cycle(&self, path: &[String]) -> Result<Value> {
        match self.mode {
            RecoveryMode::Strict => Err(MeltError::processing(path, "cycle detected")),
            RecoveryMode::Skip | RecoveryMode::Partial => {
                tracing::debug!(path = %path.join("."), "cycle replaced by placeholder");
                Ok(Value::String(self.cycle_placeholder.clone()))
            }
        }
    }

    /// Add the error marker columns to a row.
    pub fn annotate(&self, row: &mut FlatRow, marker: &ErrorMarker) {
        row.insert(self.error_field.clone(), Value::String(marker.message.clone()));
        row.insert(self.error_path_field.clone(), Value::String(marker.path.clone()));
    }

    pub fn is_marker_field(&self, name: &str) -> bool {
        name == self.error_field || name == self.error_path_field
    }
}
