//! Record melting - flatten nested records into relational tables
//!
//! A record becomes one row in its main table. Nested objects merge into that
//! row under separator-joined column names, while arrays of objects become
//! child tables whose rows link back to their owner through a parent id.
//!
//! ## Streaming
//!
//! For inputs larger than memory, pull records from a [`Source`] and let
//! [`JsonMelter::stream`] flush them to a [`Sink`] in fixed-size batches.

pub mod config;
pub mod extractor;
pub mod identity;
pub mod naming;
pub mod node;
pub mod recovery;
pub mod source;
pub mod stream;
pub mod types;
pub mod writer;

pub use config::{ArrayMode, MeltConfig, NullPolicy};
pub use extractor::JsonMelter;
pub use identity::{EntityId, IdDiscovery, IdStrategy};
pub use naming::{CollisionPolicy, Collisions, NameResolver, NamingConfig};
pub use node::{Document, Node, NodeId};
pub use recovery::{ErrorMarker, Outcome, RecoveryMode, RecoveryPolicy};
pub use source::{read_records, JsonLinesSource};
pub use stream::{IterSource, Sink, Source, StreamSummary, VecSource};
pub use types::{FlatRow, Table, TableSet};
pub use writer::{JsonLinesSink, MemorySink, SingleStreamSink};
