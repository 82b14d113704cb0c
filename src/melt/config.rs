use std::collections::{BTreeMap, BTreeSet};
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::{MeltError, Result};
use crate::melt::identity::{IdDiscovery, IdStrategy};
use crate::melt::naming::NamingConfig;
use crate::melt::recovery::RecoveryMode;

/// How array fields are turned into output.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ArrayMode {
    /// Every array becomes a child table.
    #[default]
    Separate,
    /// Scalar-only arrays are serialized into one field; others become child tables.
    Inline,
    /// Arrays are dropped.
    Skip,
    /// Inline for scalar-only arrays, separate otherwise.
    Smart,
}

impl FromStr for ArrayMode {
    type Err = MeltError;

    fn from_str(s: &str) -> Result<Self> {
        match s.to_ascii_lowercase().as_str() {
            "separate" => Ok(ArrayMode::Separate),
            "inline" => Ok(ArrayMode::Inline),
            "skip" => Ok(ArrayMode::Skip),
            "smart" => Ok(ArrayMode::Smart),
            other => Err(MeltError::config(format!("unknown array mode '{other}'"))),
        }
    }
}

/// Which null/empty scalars are left out of rows.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NullPolicy {
    pub skip_null: bool,
    /// Empty strings and empty inline arrays.
    pub skip_empty: bool,
}

impl Default for NullPolicy {
    fn default() -> Self {
        NullPolicy {
            skip_null: true,
            skip_empty: true,
        }
    }
}

impl NullPolicy {
    pub fn include_all() -> Self {
        NullPolicy {
            skip_null: false,
            skip_empty: false,
        }
    }
}

/// Configuration for the melting process
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MeltConfig {
    /// Separator for field and table names
    pub separator: String,

    pub naming: NamingConfig,

    pub array_mode: ArrayMode,

    pub nulls: NullPolicy,

    /// Identity strategy used for every table without an override
    pub identity: IdStrategy,

    /// Per-table identity strategies, keyed by table name
    pub table_identity: BTreeMap<String, IdStrategy>,

    pub discovery: IdDiscovery,

    pub recovery: RecoveryMode,

    /// Records buffered before a flush when streaming
    pub batch_size: usize,

    /// Maximum container nesting below a record
    pub max_depth: usize,

    /// Column holding each row's identity
    pub id_field: String,

    /// Column holding a child row's owner identity
    pub parent_field: String,

    /// Optional column stamped with the processing time
    pub timestamp_field: Option<String>,

    /// Prefix of the error marker columns written by partial recovery
    pub error_field: String,

    /// Column holding the value of a scalar array element
    pub value_field: String,

    /// Optional column recording an element's position in its array
    pub index_field: Option<String>,

    /// Value written in place of a cyclic branch
    pub cycle_placeholder: String,

    /// Render every non-null scalar as a string
    pub cast_to_string: bool,
}

impl Default for MeltConfig {
    fn default() -> Self {
        MeltConfig {
            separator: String::from("_"),
            naming: NamingConfig::default(),
            array_mode: ArrayMode::Separate,
            nulls: NullPolicy::default(),
            identity: IdStrategy::Random,
            table_identity: BTreeMap::new(),
            discovery: IdDiscovery::default(),
            recovery: RecoveryMode::Strict,
            batch_size: 1000,
            max_depth: 100,
            id_field: String::from("_id"),
            parent_field: String::from("_parent_id"),
            timestamp_field: None,
            error_field: String::from("_error"),
            value_field: String::from("value"),
            index_field: None,
            cycle_placeholder: String::from("<cycle>"),
            cast_to_string: false,
        }
    }
}

impl MeltConfig {
    /// Small batches and a small name cache.
    pub fn memory_optimized() -> Self {
        let mut config = MeltConfig::default();
        config.batch_size = 100;
        config.naming.cache_size = 256;
        config
    }

    /// Large batches and a large name cache.
    pub fn performance_optimized() -> Self {
        let mut config = MeltConfig::default();
        config.batch_size = 10_000;
        config.naming.cache_size = 16_384;
        config
    }

    /// Stable, string-typed columns for CSV output.
    pub fn csv_optimized() -> Self {
        let mut config = MeltConfig::default();
        config.cast_to_string = true;
        config.nulls = NullPolicy::include_all();
        config.array_mode = ArrayMode::Smart;
        config
    }

    /// Identity strategy for a table, honoring overrides.
    pub fn identity_for(&self, table: &str) -> &IdStrategy {
        self.table_identity.get(table).unwrap_or(&self.identity)
    }

    /// Column used for the path of an error marker.
    pub fn error_path_field(&self) -> String {
        format!("{}{}path", self.error_field, self.separator)
    }

    /// Every column the engine writes itself.
    pub fn metadata_fields(&self) -> Vec<String> {
        let mut fields = vec![
            self.id_field.clone(),
            self.parent_field.clone(),
            self.error_field.clone(),
            self.error_path_field(),
        ];
        if let Some(ts) = &self.timestamp_field {
            fields.push(ts.clone());
        }
        fields
    }

    pub fn validate(&self) -> Result<()> {
        if self.separator.is_empty() {
            return Err(MeltError::config("separator must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(MeltError::config("batch_size must be positive"));
        }
        if self.max_depth == 0 {
            return Err(MeltError::config("max_depth must be positive"));
        }
        if self.naming.deeply_nested_threshold < 2 {
            return Err(MeltError::config("deeply_nested_threshold must be at least 2"));
        }
        if self.value_field.is_empty() {
            return Err(MeltError::config("value_field must not be empty"));
        }

        let mut seen = BTreeSet::new();
        for field in self.metadata_fields() {
            if field.is_empty() {
                return Err(MeltError::config("metadata field names must not be empty"));
            }
            if !seen.insert(field.clone()) {
                return Err(MeltError::config(format!("duplicate metadata field name '{field}'")));
            }
        }
        if let Some(index) = &self.index_field {
            if index.is_empty() || seen.contains(index) {
                return Err(MeltError::config(format!("invalid index field name '{index}'")));
            }
        }

        self.identity.validate()?;
        for strategy in self.table_identity.values() {
            strategy.validate()?;
        }
        Ok(())
    }
}
