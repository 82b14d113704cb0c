use serde_json::Value;

use crate::error::{MeltError, Result};
use crate::melt::config::{ArrayMode, MeltConfig};
use crate::melt::identity::{hashed_id, positional_id, random_id, EntityId, IdStrategy};
use crate::melt::naming::{Collisions, NameResolver};
use crate::melt::node::{Document, Node, NodeId};
use crate::melt::recovery::{Outcome, RecoveryPolicy};
use crate::melt::types::{ChildTables, FlatRow, TableSet};

/// Traversal state for one record
struct Walk<'a> {
    doc: &'a Document,
    entity: &'a str,
    record: usize,
    /// Containers on the current recursion path
    active: Vec<NodeId>,
    timestamp: Option<&'a Value>,
    collisions: &'a mut Collisions,
}

/// The core melter that extracts relational tables from nested records
pub struct JsonMelter {
    config: MeltConfig,
    names: NameResolver,
    policy: RecoveryPolicy,
}

impl JsonMelter {
    pub fn new(config: MeltConfig) -> Result<Self> {
        config.validate()?;
        let names = NameResolver::new(config.naming.clone(), config.separator.clone())?;
        let policy = RecoveryPolicy::new(
            config.recovery,
            config.error_field.clone(),
            config.error_path_field(),
            config.cycle_placeholder.clone(),
        );
        Ok(JsonMelter {
            config,
            names,
            policy,
        })
    }

    pub fn config(&self) -> &MeltConfig {
        &self.config
    }

    pub fn names(&self) -> &NameResolver {
        &self.names
    }

    pub fn main_table_name(&self, entity_name: &str) -> String {
        self.names.table_name(entity_name, &[])
    }

    /// Melt a single record into a fresh table set
    pub fn process(&self, record: impl Into<Document>, entity_name: &str) -> Result<TableSet> {
        self.process_batch(std::iter::once(record), entity_name)
    }

    /// Melt an in-memory list of records into one table set.
    ///
    /// Under strict recovery the first failure aborts the whole call.
    pub fn process_batch<I, R>(&self, records: I, entity_name: &str) -> Result<TableSet>
    where
        I: IntoIterator<Item = R>,
        R: Into<Document>,
    {
        let mut tables = TableSet::new(self.main_table_name(entity_name));
        let timestamp = self.timestamp();
        let mut collisions = Collisions::new();
        for (index, record) in records.into_iter().enumerate() {
            let doc = record.into();
            let outcome =
                self.process_record(&doc, entity_name, index, timestamp.as_ref(), &mut collisions);
            Self::collect(outcome, &mut tables)?;
        }
        Ok(tables)
    }

    /// Add a record's outcome to `tables`. Returns whether a row was added.
    pub(crate) fn collect(
        outcome: Outcome<(FlatRow, ChildTables)>,
        tables: &mut TableSet,
    ) -> Result<bool> {
        match outcome.into_result()? {
            Some((row, children)) => {
                tables.push_main(row);
                tables.extend_children(children);
                Ok(true)
            }
            None => Ok(false),
        }
    }

    pub(crate) fn timestamp(&self) -> Option<Value> {
        self.config
            .timestamp_field
            .as_ref()
            .map(|_| Value::String(chrono::Utc::now().to_rfc3339()))
    }

    /// Melt one record through the recovery policy.
    pub(crate) fn process_record(
        &self,
        doc: &Document,
        entity_name: &str,
        index: usize,
        timestamp: Option<&Value>,
        collisions: &mut Collisions,
    ) -> Outcome<(FlatRow, ChildTables)> {
        let result = self
            .melt_record(doc, entity_name, index, timestamp, collisions)
            .map_err(|e| e.in_record(index));
        self.recover_record(result, entity_name, index, timestamp)
    }

    /// Route a record-level result (including source failures) through the policy.
    pub(crate) fn recover_record(
        &self,
        result: Result<(FlatRow, ChildTables)>,
        entity_name: &str,
        index: usize,
        timestamp: Option<&Value>,
    ) -> Outcome<(FlatRow, ChildTables)> {
        let table = self.main_table_name(entity_name);
        self.policy.resolve(result, |marker| {
            let mut row = self.error_row(&table, None, index, None, &marker.message, timestamp);
            self.policy.annotate(&mut row, marker);
            (row, ChildTables::new())
        })
    }

    fn melt_record(
        &self,
        doc: &Document,
        entity_name: &str,
        index: usize,
        timestamp: Option<&Value>,
        collisions: &mut Collisions,
    ) -> Result<(FlatRow, ChildTables)> {
        let root = doc.root();
        if !matches!(doc.node(root), Node::Map(_)) {
            return Err(MeltError::Validation {
                record: Some(index),
                reason: format!("expected an object, found {}", doc.node(root).type_name()),
            });
        }

        let mut walk = Walk {
            doc,
            entity: entity_name,
            record: index,
            active: Vec::new(),
            timestamp,
            collisions,
        };
        let table = self.main_table_name(entity_name);
        let mut table_path = Vec::new();
        let id = self.identify(doc, root, &table, &table_path)?;
        let mut row = self.start_row(&id, None, None, timestamp);
        let mut children = ChildTables::new();

        self.flatten(
            &mut walk,
            root,
            &mut Vec::new(),
            &mut table_path,
            &mut row,
            &id,
            &mut children,
        )?;
        Ok((row, children))
    }

    /// Natural id if discovery finds one, otherwise the table's strategy.
    fn identify(
        &self,
        doc: &Document,
        node: NodeId,
        table: &str,
        path: &[String],
    ) -> Result<EntityId> {
        let discovery = &self.config.discovery;
        if let Some(found) = discovery.discover(doc, node, table) {
            if !discovery.force_synthetic {
                return Ok(found.id);
            }
        }
        self.config.identity_for(table).generate(doc, node, path)
    }

    /// A row holding only the engine's metadata columns
    fn start_row(
        &self,
        id: &EntityId,
        parent: Option<&EntityId>,
        index: Option<usize>,
        timestamp: Option<&Value>,
    ) -> FlatRow {
        let mut row = FlatRow::new();
        row.insert(self.config.id_field.clone(), self.cast(id.value().clone()));
        if let Some(parent) = parent {
            row.insert(self.config.parent_field.clone(), self.cast(parent.value().clone()));
        }
        if let (Some(field), Some(index)) = (&self.config.index_field, index) {
            row.insert(field.clone(), self.cast(Value::from(index)));
        }
        if let (Some(field), Some(ts)) = (&self.config.timestamp_field, timestamp) {
            row.insert(field.clone(), ts.clone());
        }
        row
    }

    /// Stand-in row for a unit that failed under partial recovery.
    fn error_row(
        &self,
        table: &str,
        owner: Option<&EntityId>,
        record: usize,
        index: Option<usize>,
        message: &str,
        timestamp: Option<&Value>,
    ) -> FlatRow {
        let id = match self.config.identity_for(table) {
            IdStrategy::Random => random_id(),
            _ => hashed_id(&format!(
                "{table}\u{1f}{record}\u{1f}{index:?}\u{1f}{}\u{1f}{message}",
                owner.map(|o| o.value().to_string()).unwrap_or_default()
            )),
        };
        self.start_row(&id, owner, index, timestamp)
    }

    #[allow(clippy::too_many_arguments)]
    fn flatten(
        &self,
        walk: &mut Walk<'_>,
        node: NodeId,
        field_path: &mut Vec<String>,
        table_path: &mut Vec<String>,
        row: &mut FlatRow,
        owner: &EntityId,
        children: &mut ChildTables,
    ) -> Result<()> {
        let doc = walk.doc;
        match doc.node(node) {
            Node::Map(entries) => {
                if !self.enter(walk, node, field_path, table_path, row)? {
                    return Ok(());
                }
                for (key, child) in entries {
                    field_path.push(key.clone());
                    table_path.push(key.clone());
                    self.flatten(walk, *child, field_path, table_path, row, owner, children)?;
                    field_path.pop();
                    table_path.pop();
                }
                walk.active.pop();
                Ok(())
            }
            Node::List(items) => {
                if !self.enter(walk, node, field_path, table_path, row)? {
                    return Ok(());
                }
                self.flatten_list(walk, items, field_path, table_path, row, owner, children)?;
                walk.active.pop();
                Ok(())
            }
            scalar => {
                self.write_scalar(row, field_path, scalar);
                Ok(())
            }
        }
    }

    /// Push a container onto the active path. Returns false when the
    /// container closes a cycle and a placeholder was written instead.
    fn enter(
        &self,
        walk: &mut Walk<'_>,
        node: NodeId,
        field_path: &[String],
        table_path: &[String],
        row: &mut FlatRow,
    ) -> Result<bool> {
        if walk.active.contains(&node) {
            let placeholder = self.policy.on_cycle(table_path)?;
            self.put(row, field_path, placeholder);
            return Ok(false);
        }
        if walk.active.len() >= self.config.max_depth {
            return Err(MeltError::processing(
                table_path,
                format!("maximum depth {} exceeded", self.config.max_depth),
            ));
        }
        walk.active.push(node);
        Ok(true)
    }

    #[allow(clippy::too_many_arguments)]
    fn flatten_list(
        &self,
        walk: &mut Walk<'_>,
        items: &[NodeId],
        field_path: &[String],
        table_path: &mut Vec<String>,
        row: &mut FlatRow,
        owner: &EntityId,
        children: &mut ChildTables,
    ) -> Result<()> {
        let doc = walk.doc;
        let scalars_only = items.iter().all(|item| doc.node(*item).is_scalar());
        let inline = match self.config.array_mode {
            ArrayMode::Skip => return Ok(()),
            ArrayMode::Separate => false,
            ArrayMode::Inline => scalars_only,
            ArrayMode::Smart => scalars_only && !items.is_empty(),
        };

        if inline {
            self.write_inline(row, field_path, doc, items);
            Ok(())
        } else {
            self.extract_elements(walk, items, table_path, owner, children)
        }
    }

    /// Each element becomes a row of the child table for `table_path`.
    fn extract_elements(
        &self,
        walk: &mut Walk<'_>,
        items: &[NodeId],
        table_path: &mut Vec<String>,
        owner: &EntityId,
        children: &mut ChildTables,
    ) -> Result<()> {
        let table = self
            .names
            .checked_table_name(walk.entity, table_path, walk.collisions)?;

        for (index, item) in items.iter().enumerate() {
            let depth = walk.active.len();
            let path_len = table_path.len();
            let result = self.melt_element(walk, *item, index, &table, table_path, owner);
            walk.active.truncate(depth);
            table_path.truncate(path_len);

            let outcome = self.policy.resolve(result, |marker| {
                let mut row = self.error_row(
                    &table,
                    Some(owner),
                    walk.record,
                    Some(index),
                    &marker.message,
                    walk.timestamp,
                );
                self.policy.annotate(&mut row, marker);
                (row, ChildTables::new())
            });

            match outcome {
                Outcome::Ok((row, nested)) | Outcome::Recovered((row, nested), _) => {
                    children.entry(table.clone()).or_default().push(row);
                    for (name, rows) in nested {
                        children.entry(name).or_default().extend(rows);
                    }
                }
                Outcome::Skipped(_) => {}
                Outcome::Fatal(err) => return Err(err),
            }
        }
        Ok(())
    }

    /// One array element: identity first, then its subtree.
    fn melt_element(
        &self,
        walk: &mut Walk<'_>,
        item: NodeId,
        index: usize,
        table: &str,
        table_path: &mut Vec<String>,
        owner: &EntityId,
    ) -> Result<(FlatRow, ChildTables)> {
        let doc = walk.doc;
        let id = match doc.node(item) {
            Node::Map(_) => self.identify(doc, item, table, table_path)?,
            _ => positional_id(self.config.identity_for(table), doc, item, owner, index),
        };
        let mut row = self.start_row(&id, Some(owner), Some(index), walk.timestamp);
        let mut nested = ChildTables::new();
        let mut field_path = Vec::new();

        match doc.node(item) {
            Node::Map(_) => {
                self.flatten(walk, item, &mut field_path, table_path, &mut row, &id, &mut nested)?;
            }
            Node::List(_) => {
                // A list directly inside a list is addressed by the value column.
                field_path.push(self.config.value_field.clone());
                table_path.push(self.config.value_field.clone());
                self.flatten(walk, item, &mut field_path, table_path, &mut row, &id, &mut nested)?;
            }
            scalar => self.write_scalar(&mut row, &field_path, scalar),
        }
        Ok((row, nested))
    }

    fn write_scalar(&self, row: &mut FlatRow, field_path: &[String], node: &Node) {
        let nulls = &self.config.nulls;
        let empty = node.is_blank() && !node.is_null();
        if (nulls.skip_null && node.is_null()) || (nulls.skip_empty && empty) {
            return;
        }
        let Some(value) = node.to_scalar_value() else {
            return;
        };
        let value = self.cast(value);
        self.put(row, field_path, value);
    }

    /// Serialize a scalar-only array into one JSON string column.
    fn write_inline(
        &self,
        row: &mut FlatRow,
        field_path: &[String],
        doc: &Document,
        items: &[NodeId],
    ) {
        if items.is_empty() && self.config.nulls.skip_empty {
            return;
        }
        let values: Vec<Value> = items
            .iter()
            .filter_map(|item| doc.node(*item).to_scalar_value())
            .collect();
        self.put(row, field_path, Value::String(Value::Array(values).to_string()));
    }

    fn column_for(&self, field_path: &[String]) -> String {
        if field_path.is_empty() {
            self.config.value_field.clone()
        } else {
            self.names.field_name(field_path)
        }
    }

    /// Insert a data column. Metadata columns already on the row win.
    ///
    /// When an abbreviated name is already taken by another path, the value
    /// moves to the unabbreviated name, then to a numbered variant of it.
    fn put(&self, row: &mut FlatRow, field_path: &[String], value: Value) {
        let column = self.column_for(field_path);
        let Some(existing) = row.get(&column) else {
            row.insert(column, value);
            return;
        };
        if self.is_metadata(&column) {
            if existing != &value {
                tracing::debug!(column = %column, "data field shadowed by metadata field");
            }
            return;
        }

        let full = if field_path.is_empty() {
            column.clone()
        } else {
            self.names.full_field_name(field_path)
        };
        let mut candidate = full.clone();
        let mut n = 2;
        while row.contains_key(&candidate) || self.is_metadata(&candidate) {
            candidate = format!("{full}{}{n}", self.config.separator);
            n += 1;
        }
        tracing::warn!(
            column = %column,
            path = %field_path.join("."),
            renamed = %candidate,
            "field name already used by another path"
        );
        row.insert(candidate, value);
    }

    fn is_metadata(&self, column: &str) -> bool {
        let config = &self.config;
        column == config.id_field
            || column == config.parent_field
            || config.timestamp_field.as_deref() == Some(column)
            || config.index_field.as_deref() == Some(column)
            || self.policy.is_marker_field(column)
    }

    fn cast(&self, value: Value) -> Value {
        if !self.config.cast_to_string {
            return value;
        }
        match value {
            Value::Null | Value::String(_) => value,
            other => Value::String(other.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::melt::config::NullPolicy;
    use crate::melt::identity::IdDiscovery;
    use crate::melt::recovery::RecoveryMode;
    use crate::melt::types::Table;
    use serde_json::json;

    fn natural_config() -> MeltConfig {
        MeltConfig {
            identity: IdStrategy::Natural {
                field: "id".to_string(),
            },
            id_field: "id".to_string(),
            parent_field: "parent_id".to_string(),
            ..MeltConfig::default()
        }
    }

    fn hash_config() -> MeltConfig {
        MeltConfig {
            identity: IdStrategy::Hash,
            ..MeltConfig::default()
        }
    }

    fn melter(config: MeltConfig) -> JsonMelter {
        JsonMelter::new(config).unwrap()
    }

    fn cyclic_record() -> Document {
        let mut doc = Document::from(json!({"name": "a"}));
        let root = doc.root();
        doc.insert_entry(root, "self", root);
        doc
    }

    /// Every child row's parent link resolves to exactly one row of some table.
    fn assert_referential_integrity(tables: &TableSet, id_field: &str, parent_field: &str) {
        for child in tables.children.values() {
            for row in &child.rows {
                let parent = row.get(parent_field).expect("child row without parent link");
                let owners: usize = tables
                    .tables()
                    .filter(|t| t.name != child.name)
                    .map(|t| t.rows.iter().filter(|r| r.get(id_field) == Some(parent)).count())
                    .sum();
                assert_eq!(owners, 1, "parent {parent} of {} not unique", child.name);
            }
        }
    }

    #[test]
    fn test_simple_object() {
        let input = json!({
            "id": 1,
            "name": "Alice"
        });

        let tables = melter(MeltConfig::default()).process(input, "root").unwrap();

        assert_eq!(tables.main.name, "root");
        assert_eq!(tables.main.len(), 1);
        assert!(tables.children.is_empty());
        let row = &tables.main.rows[0];
        assert_eq!(row.get("name").unwrap(), "Alice");
        assert_eq!(row.get("id").unwrap(), 1);
        assert!(row.get("_id").unwrap().is_string());
        assert!(!row.contains_key("_parent_id"));
    }

    #[test]
    fn test_nested_array_with_natural_ids() {
        let input = json!({"id": 1, "items": [{"id": 9, "v": "a"}, {"id": 10, "v": "b"}]});

        let tables = melter(natural_config()).process(input, "root").unwrap();

        assert_eq!(tables.main.rows, vec![serde_json::from_value(json!({"id": 1})).unwrap()]);
        let items = tables.table("root_items").unwrap();
        assert_eq!(items.len(), 2);
        assert_eq!(items.rows[0].get("parent_id").unwrap(), 1);
        assert_eq!(items.rows[0].get("id").unwrap(), 9);
        assert_eq!(items.rows[0].get("v").unwrap(), "a");
        assert_eq!(items.rows[1].get("parent_id").unwrap(), 1);
        assert_eq!(items.rows[1].get("id").unwrap(), 10);
        assert_eq!(items.rows[1].get("v").unwrap(), "b");
    }

    #[test]
    fn test_nested_objects_merge_into_row() {
        let input = json!({"user": {"name": "Bob", "address": {"city": "Oslo"}}});

        let tables = melter(hash_config()).process(input, "root").unwrap();

        let row = &tables.main.rows[0];
        assert_eq!(row.get("user_name").unwrap(), "Bob");
        assert_eq!(row.get("user_addr_city").unwrap(), "Oslo");
        assert!(tables.children.is_empty());
    }

    #[test]
    fn test_deep_arrays_link_to_their_element() {
        let input = json!({
            "orders": [
                {"sku": "A", "lines": [{"qty": 1}, {"qty": 2}]},
                {"sku": "B", "lines": [{"qty": 3}]}
            ]
        });

        let tables = melter(hash_config()).process(input, "shop").unwrap();

        let orders = tables.table("shop_orders").unwrap();
        let lines = tables.table("shop_orders_lines").unwrap();
        assert_eq!(orders.len(), 2);
        assert_eq!(lines.len(), 3);
        assert_eq!(lines.rows[2].get("_parent_id"), orders.rows[1].get("_id"));
        assert_eq!(orders.rows[0].get("_parent_id"), tables.main.rows[0].get("_id"));
        assert_referential_integrity(&tables, "_id", "_parent_id");
    }

    #[test]
    fn test_array_inside_object_uses_full_path() {
        let input = json!({"meta": {"tags": [{"k": "x"}]}});
        let tables = melter(hash_config()).process(input, "root").unwrap();
        assert!(tables.table("root_meta_tags").is_some());
    }

    #[test]
    fn test_scalar_array_modes() {
        let input = json!({"tags": ["rust", "json"], "points": [{"x": 1}]});

        let separate = melter(hash_config()).process(input.clone(), "root").unwrap();
        let tags = separate.table("root_tags").unwrap();
        assert_eq!(tags.len(), 2);
        assert_eq!(tags.rows[0].get("value").unwrap(), "rust");
        assert_ne!(tags.rows[0].get("_id"), tags.rows[1].get("_id"));

        for mode in [ArrayMode::Inline, ArrayMode::Smart] {
            let config = MeltConfig {
                array_mode: mode,
                ..hash_config()
            };
            let tables = melter(config).process(input.clone(), "root").unwrap();
            assert_eq!(tables.main.rows[0].get("tags").unwrap(), r#"["rust","json"]"#);
            assert!(tables.table("root_tags").is_none());
            assert_eq!(tables.table("root_points").unwrap().len(), 1);
        }

        let config = MeltConfig {
            array_mode: ArrayMode::Skip,
            ..hash_config()
        };
        let skipped = melter(config).process(input, "root").unwrap();
        assert!(skipped.children.is_empty());
        assert!(!skipped.main.rows[0].contains_key("tags"));
    }

    #[test]
    fn test_empty_arrays() {
        let input = json!({"tags": []});
        let inline = MeltConfig {
            array_mode: ArrayMode::Inline,
            nulls: NullPolicy::include_all(),
            ..hash_config()
        };
        let tables = melter(inline).process(input.clone(), "root").unwrap();
        assert_eq!(tables.main.rows[0].get("tags").unwrap(), "[]");

        let smart = MeltConfig {
            array_mode: ArrayMode::Smart,
            nulls: NullPolicy::include_all(),
            ..hash_config()
        };
        let tables = melter(smart).process(input, "root").unwrap();
        assert!(!tables.main.rows[0].contains_key("tags"));
        assert!(tables.children.is_empty());
    }

    #[test]
    fn test_list_of_lists() {
        let input = json!({"matrix": [[1, 2], [3]]});
        let tables = melter(hash_config()).process(input, "root").unwrap();

        let rows = tables.table("root_matrix").unwrap();
        let cells = tables.table("root_matrix_value").unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(cells.len(), 3);
        assert_eq!(cells.rows[2].get("_parent_id"), rows.rows[1].get("_id"));
        assert_eq!(cells.rows[2].get("value").unwrap(), 3);
    }

    #[test]
    fn test_null_policy() {
        let input = json!({"a": 1, "b": null, "c": ""});

        let skip = melter(hash_config()).process(input.clone(), "root").unwrap();
        let row = &skip.main.rows[0];
        assert_eq!(row.get("a").unwrap(), 1);
        assert!(!row.contains_key("b"));
        assert!(!row.contains_key("c"));

        let config = MeltConfig {
            nulls: NullPolicy::include_all(),
            ..hash_config()
        };
        let keep = melter(config).process(input, "root").unwrap();
        let row = &keep.main.rows[0];
        assert_eq!(row.get("a").unwrap(), 1);
        assert_eq!(row.get("b"), Some(&Value::Null));
        assert_eq!(row.get("c").unwrap(), "");
    }

    #[test]
    fn test_hash_ids_are_deterministic() {
        let a = json!({"x": 1, "items": [{"k": "v"}]});
        let b = json!({"items": [{"k": "v"}], "x": 1});
        let m = melter(hash_config());
        let ta = m.process(a, "root").unwrap();
        let tb = m.process(b, "root").unwrap();
        assert_eq!(ta.main.rows[0].get("_id"), tb.main.rows[0].get("_id"));
        assert_eq!(ta.table("root_items"), tb.table("root_items"));
    }

    #[test]
    fn test_random_ids_differ_between_calls() {
        let m = melter(MeltConfig::default());
        let a = m.process(json!({"id": "x"}), "root").unwrap();
        let b = m.process(json!({"id": "x"}), "root").unwrap();
        assert_ne!(a.main.rows[0].get("_id"), b.main.rows[0].get("_id"));
        assert_ne!(a.main.rows[0].get("_id").unwrap(), "x");
    }

    #[test]
    fn test_discovery_and_force_synthetic() {
        let input = json!({"SKU": "S-1", "name": "n"});
        let mut config = MeltConfig {
            discovery: IdDiscovery {
                enabled: true,
                ..IdDiscovery::default()
            },
            ..MeltConfig::default()
        };
        let tables = melter(config.clone()).process(input.clone(), "root").unwrap();
        assert_eq!(tables.main.rows[0].get("_id").unwrap(), "S-1");
        assert_eq!(tables.main.rows[0].get("SKU").unwrap(), "S-1");

        config.discovery.force_synthetic = true;
        let tables = melter(config).process(input, "root").unwrap();
        assert_ne!(tables.main.rows[0].get("_id").unwrap(), "S-1");
        assert_eq!(tables.main.rows[0].get("SKU").unwrap(), "S-1");
    }

    #[test]
    fn test_natural_missing_is_processing_error_under_strict() {
        let err = melter(natural_config())
            .process(json!({"items": [{"id": 1}]}), "root")
            .unwrap_err();
        assert!(matches!(err, MeltError::Processing { record: Some(0), .. }));
    }

    #[test]
    fn test_skip_drops_failing_element_only() {
        let config = MeltConfig {
            recovery: RecoveryMode::Skip,
            ..natural_config()
        };
        let input = json!({"id": 1, "items": [
            {"id": 2, "sub": [{"id": 3}]},
            {"v": "no id", "sub": [{"id": 4}]}
        ]});
        let tables = melter(config).process(input, "root").unwrap();

        assert_eq!(tables.main.len(), 1);
        let items = tables.table("root_items").unwrap();
        assert_eq!(items.len(), 1);
        assert_eq!(items.rows[0].get("id").unwrap(), 2);
        // The failed element's subtree is discarded with it.
        let sub = tables.table("root_items_sub").unwrap();
        assert_eq!(sub.len(), 1);
        assert_eq!(sub.rows[0].get("id").unwrap(), 3);
    }

    #[test]
    fn test_skip_drops_record_when_top_fails() {
        let config = MeltConfig {
            recovery: RecoveryMode::Skip,
            ..natural_config()
        };
        let records = vec![
            json!({"id": 1, "items": [{"id": 5}]}),
            json!({"name": "no id", "items": [{"id": 6}]}),
            json!({"id": 3}),
        ];
        let tables = melter(config).process_batch(records, "root").unwrap();
        assert_eq!(tables.main.len(), 2);
        assert_eq!(tables.table("root_items").unwrap().len(), 1);
    }

    #[test]
    fn test_partial_replaces_failing_units_with_markers() {
        let config = MeltConfig {
            recovery: RecoveryMode::Partial,
            ..natural_config()
        };
        let records = vec![
            json!({"id": 1, "items": [{"id": 2}, {"v": "no id"}]}),
            json!([1, 2, 3]),
        ];
        let tables = melter(config).process_batch(records, "root").unwrap();

        assert_eq!(tables.main.len(), 2);
        let bad_record = &tables.main.rows[1];
        assert!(bad_record.get("_error").unwrap().as_str().unwrap().contains("expected an object"));
        assert!(bad_record.contains_key("id"));

        let items = tables.table("root_items").unwrap();
        assert_eq!(items.len(), 2);
        let marked = &items.rows[1];
        assert_eq!(marked.get("parent_id").unwrap(), 1);
        assert_eq!(marked.get("_error_path").unwrap(), "$.items");
        assert!(!marked.contains_key("v"));
    }

    #[test]
    fn test_validation_error_for_non_object_record() {
        let err = melter(MeltConfig::default()).process(json!("text"), "root").unwrap_err();
        assert!(matches!(err, MeltError::Validation { record: Some(0), .. }));
    }

    #[test]
    fn test_cycle_strict_fails() {
        let err = melter(hash_config()).process(cyclic_record(), "root").unwrap_err();
        assert!(err.to_string().contains("cycle detected"));
    }

    #[test]
    fn test_cycle_skip_and_partial_write_placeholder() {
        for mode in [RecoveryMode::Skip, RecoveryMode::Partial] {
            let config = MeltConfig {
                recovery: mode,
                ..hash_config()
            };
            let tables = melter(config).process(cyclic_record(), "root").unwrap();
            let row = &tables.main.rows[0];
            assert_eq!(row.get("name").unwrap(), "a");
            assert_eq!(row.get("self").unwrap(), "<cycle>");
        }
    }

    #[test]
    fn test_cycle_through_array() {
        let mut doc = Document::from(json!({"name": "a", "children": []}));
        let root = doc.root();
        let list = doc.get(root, "children").unwrap();
        doc.push_item(list, root);

        let config = MeltConfig {
            recovery: RecoveryMode::Skip,
            ..hash_config()
        };
        let tables = melter(config).process(doc, "root").unwrap();
        let children = tables.table("root_children").unwrap();
        assert_eq!(children.len(), 1);
        assert_eq!(children.rows[0].get("value").unwrap(), "<cycle>");
    }

    #[test]
    fn test_depth_guard() {
        let input = json!({"a": {"b": {"c": {"d": 1}}}});
        let config = MeltConfig {
            max_depth: 3,
            ..hash_config()
        };
        let err = melter(config).process(input.clone(), "root").unwrap_err();
        assert!(err.to_string().contains("maximum depth 3 exceeded"));

        let config = MeltConfig {
            max_depth: 4,
            ..hash_config()
        };
        let tables = melter(config).process(input, "root").unwrap();
        assert_eq!(tables.main.rows[0].get("a_b_c_d").unwrap(), 1);
    }

    #[test]
    fn test_depth_guard_inside_element_is_recoverable() {
        let input = json!({"items": [{"ok": 1}, {"deep": {"deeper": {"x": 1}}}]});
        let config = MeltConfig {
            max_depth: 4,
            recovery: RecoveryMode::Skip,
            ..hash_config()
        };
        let tables = melter(config).process(input, "root").unwrap();
        assert_eq!(tables.main.len(), 1);
        assert_eq!(tables.table("root_items").unwrap().len(), 1);
    }

    #[test]
    fn test_metadata_columns() {
        let config = MeltConfig {
            index_field: Some("_idx".to_string()),
            timestamp_field: Some("_ts".to_string()),
            cast_to_string: true,
            ..hash_config()
        };
        let input = json!({"n": 5, "flag": true, "tags": ["a", "b"]});
        let tables = melter(config).process(input, "root").unwrap();

        let main = &tables.main.rows[0];
        assert_eq!(main.get("n").unwrap(), "5");
        assert_eq!(main.get("flag").unwrap(), "true");
        assert!(main.get("_ts").unwrap().is_string());
        assert!(!main.contains_key("_idx"));

        let tags = tables.table("root_tags").unwrap();
        assert_eq!(tags.rows[1].get("_idx").unwrap(), "1");
        assert_eq!(tags.rows[1].get("_ts"), main.get("_ts"));
    }

    #[test]
    fn test_data_field_does_not_override_metadata() {
        let input = json!({"_parent_id": "spoof", "items": [{"_parent_id": "spoof"}]});
        let config = MeltConfig {
            naming: crate::melt::naming::NamingConfig {
                sanitize: false,
                ..Default::default()
            },
            ..hash_config()
        };
        let tables = melter(config).process(input, "root").unwrap();
        let item = &tables.table("root_items").unwrap().rows[0];
        assert_eq!(item.get("_parent_id"), tables.main.rows[0].get("_id"));
        // Main rows have no parent link of their own, so the data value stays.
        assert_eq!(tables.main.rows[0].get("_parent_id").unwrap(), "spoof");
    }

    #[test]
    fn test_abbreviation_clash_keeps_both_values() {
        let input = json!({"user": {"shipping": {"city": "A"}, "shipment": {"city": "B"}}});
        let tables = melter(hash_config()).process(input, "root").unwrap();

        let row = &tables.main.rows[0];
        assert_eq!(row.get("user_ship_city").unwrap(), "A");
        assert_eq!(row.get("user_shipment_city").unwrap(), "B");
    }

    #[test]
    fn test_repeated_clash_gets_numbered_column() {
        // "a b" and "a_b" sanitize to the same full name
        let input = json!({"x": {"a b": 1, "a_b": 2, "a-b": 3}});
        let tables = melter(hash_config()).process(input, "root").unwrap();

        let row = &tables.main.rows[0];
        assert_eq!(row.get("x_a_b").unwrap(), 1);
        assert_eq!(row.get("x_a_b_2").unwrap(), 2);
        assert_eq!(row.get("x_a-b").unwrap(), 3);
    }

    #[test]
    fn test_reused_melter_matches_fresh_one() {
        let config = MeltConfig {
            naming: crate::melt::naming::NamingConfig {
                on_collision: crate::melt::naming::CollisionPolicy::Error,
                ..Default::default()
            },
            ..hash_config()
        };
        let earlier = json!({"a": {"x": {"y": {"z": [{"v": 1}]}}}});
        let record = json!({"a": {"q": {"r": {"z": [{"v": 1}]}}}});

        let reused = melter(config.clone());
        reused.process(earlier.clone(), "root").unwrap();
        let fresh = melter(config).process(record.clone(), "root").unwrap();
        assert_eq!(reused.process(record, "root").unwrap(), fresh);

        // Within one call the second path still collides.
        let err = reused
            .process_batch(vec![earlier, json!({"a": {"q": {"r": {"z": [{"v": 1}]}}}})], "root")
            .unwrap_err();
        assert!(err.to_string().contains("already produced by path 'a.x.y.z'"));
    }

    #[test]
    fn test_leaf_scalars_are_preserved() {
        let input = json!({
            "a": 1,
            "b": {"c": "x", "d": [true, false]},
            "e": [{"f": 2.5, "g": [{"h": "deep"}]}]
        });
        let config = MeltConfig {
            naming: crate::melt::naming::NamingConfig {
                abbreviate: false,
                ..Default::default()
            },
            ..hash_config()
        };
        let tables = melter(config).process(input, "root").unwrap();

        let data_values: Vec<Value> = tables
            .tables()
            .flat_map(|t: &Table| t.rows.iter())
            .flat_map(|r| r.iter().filter(|(k, _)| !k.starts_with('_')).map(|(_, v)| v.clone()))
            .collect();
        assert_eq!(data_values.len(), 6);
        let expected_values = [
            json!(1),
            json!("x"),
            json!(true),
            json!(false),
            json!(2.5),
            json!("deep"),
        ];
        for expected in expected_values {
            assert!(data_values.contains(&expected), "missing {expected}");
        }
    }

    #[test]
    fn test_invalid_config_is_rejected() {
        let config = MeltConfig {
            max_depth: 0,
            ..MeltConfig::default()
        };
        assert!(matches!(JsonMelter::new(config), Err(MeltError::Configuration(_))));
    }
}
