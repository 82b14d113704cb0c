//! # Kiln - Nested Record Flattening
//!
//! Turns streams of nested, schema-less records into relational tables: one
//! main table per entity plus child tables for arrays, linked by generated or
//! natural identifiers.
//!
//! ## Modules
//!
//! - **melt**: Flatten records into tables, with streaming sources and sinks
//! - **error**: The error type shared by every stage
//!
//! ## Quick Start
//!
//! ```rust
//! use kiln::melt::{IdStrategy, JsonMelter, MeltConfig};
//! use serde_json::json;
//!
//! # fn main() -> anyhow::Result<()> {
//! let data = json!({
//!     "id": 1,
//!     "name": "Alice",
//!     "posts": [
//!         {"id": 10, "title": "First Post"},
//!         {"id": 11, "title": "Second Post"}
//!     ]
//! });
//!
//! let config = MeltConfig {
//!     identity: IdStrategy::Hash,
//!     ..MeltConfig::default()
//! };
//! let melter = JsonMelter::new(config)?;
//! let tables = melter.process(data, "user")?;
//!
//! // tables.main = one "user" row (_id, id, name)
//! // tables.children["user_posts"] = two rows linked through _parent_id
//! assert_eq!(tables.main.len(), 1);
//! assert_eq!(tables.table("user_posts").map(|t| t.len()), Some(2));
//! # Ok(())
//! # }
//! ```

use anyhow::{Context, Result};
use std::io::BufRead;

pub mod error;
pub mod melt;

// Re-export commonly used types for convenience
pub use error::MeltError;
pub use melt::{
    JsonLinesSink, JsonMelter, MeltConfig, MemorySink, Sink, SingleStreamSink, Source,
    StreamSummary, Table, TableSet,
};

/// Main entry point: melt an NDJSON stream into `sink`, then close it
pub fn melt_json<R: BufRead, K: Sink + ?Sized>(
    reader: R,
    sink: &mut K,
    config: MeltConfig,
    entity_name: &str,
) -> Result<StreamSummary> {
    let batch_size = config.batch_size;
    let melter = JsonMelter::new(config).context("Invalid melt configuration")?;
    let source = melt::JsonLinesSource::new(reader);

    let summary = melter
        .stream(source, entity_name, sink, batch_size, |done, _| {
            tracing::debug!(records = done, "batch written")
        })
        .with_context(|| format!("Failed to melt records into '{entity_name}'"))?;
    sink.close().context("Failed to close sink")?;

    Ok(summary)
}
