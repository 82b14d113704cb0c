use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// One output row: ordered column name -> scalar value
pub type FlatRow = Map<String, Value>;

/// Child rows produced under one record or element, keyed by table name
pub type ChildTables = BTreeMap<String, Vec<FlatRow>>;

/// A named sequence of rows. Rows may have differing columns.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Table {
    pub name: String,
    pub rows: Vec<FlatRow>,
}

impl Table {
    pub fn new(name: impl Into<String>) -> Self {
        Table {
            name: name.into(),
            rows: Vec::new(),
        }
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Union of all columns, in order of first appearance.
    pub fn columns(&self) -> Vec<String> {
        let mut seen = Map::new();
        for row in &self.rows {
            for key in row.keys() {
                if !seen.contains_key(key) {
                    seen.insert(key.clone(), Value::Null);
                }
            }
        }
        seen.into_iter().map(|(k, _)| k).collect()
    }

    /// Rows with every column of the table, absent ones as null.
    pub fn null_filled_rows(&self) -> Vec<FlatRow> {
        let columns = self.columns();
        self.rows
            .iter()
            .map(|row| {
                columns
                    .iter()
                    .map(|c| (c.clone(), row.get(c).cloned().unwrap_or(Value::Null)))
                    .collect()
            })
            .collect()
    }
}

/// One main table plus the child tables extracted from array fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct TableSet {
    pub main: Table,
    pub children: BTreeMap<String, Table>,
}

impl TableSet {
    pub fn new(main_table: impl Into<String>) -> Self {
        TableSet {
            main: Table::new(main_table),
            children: BTreeMap::new(),
        }
    }

    pub fn main_name(&self) -> &str {
        &self.main.name
    }

    /// Look up the main table or a child table by name.
    pub fn table(&self, name: &str) -> Option<&Table> {
        if name == self.main.name {
            Some(&self.main)
        } else {
            self.children.get(name)
        }
    }

    /// Main table first, then child tables by name.
    pub fn tables(&self) -> impl Iterator<Item = &Table> {
        std::iter::once(&self.main).chain(self.children.values())
    }

    pub fn row_count(&self) -> usize {
        self.tables().map(Table::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.row_count() == 0
    }

    pub fn push_main(&mut self, row: FlatRow) {
        self.main.rows.push(row);
    }

    /// Append child rows, creating tables as needed.
    pub fn extend_children(&mut self, children: ChildTables) {
        for (name, rows) in children {
            self.children
                .entry(name.clone())
                .or_insert_with(|| Table::new(name))
                .rows
                .extend(rows);
        }
    }

    /// Union-merge another set into this one, table by table.
    pub fn merge(&mut self, other: TableSet) {
        self.main.rows.extend(other.main.rows);
        for (name, table) in other.children {
            self.children
                .entry(name)
                .or_insert_with(|| Table::new(table.name.clone()))
                .rows
                .extend(table.rows);
        }
    }

    /// Move all rows out, leaving empty tables with the same main name.
    pub fn take(&mut self) -> TableSet {
        let empty = TableSet::new(self.main.name.clone());
        std::mem::replace(self, empty)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn row(value: Value) -> FlatRow {
        serde_json::from_value(value).unwrap()
    }

    #[test]
    fn test_columns_and_null_fill() {
        let mut table = Table::new("root");
        table.rows.push(row(json!({"_id": "1", "a": 1})));
        table.rows.push(row(json!({"_id": "2", "b": true})));

        assert_eq!(table.columns(), vec!["_id", "a", "b"]);
        let filled = table.null_filled_rows();
        assert_eq!(filled[0].get("b"), Some(&Value::Null));
        assert_eq!(filled[1].get("a"), Some(&Value::Null));
        assert_eq!(filled[1].keys().collect::<Vec<_>>(), vec!["_id", "a", "b"]);
    }

    #[test]
    fn test_merge_unions_by_table_name() {
        let mut a = TableSet::new("root");
        a.push_main(row(json!({"_id": "1"})));
        let mut children = ChildTables::new();
        children.insert("root_items".into(), vec![row(json!({"v": 1}))]);
        a.extend_children(children);

        let mut b = TableSet::new("root");
        b.push_main(row(json!({"_id": "2"})));
        let mut children = ChildTables::new();
        children.insert("root_items".into(), vec![row(json!({"v": 2}))]);
        children.insert("root_tags".into(), vec![row(json!({"value": "x"}))]);
        b.extend_children(children);

        a.merge(b);
        assert_eq!(a.main.len(), 2);
        assert_eq!(a.table("root_items").unwrap().len(), 2);
        assert_eq!(a.table("root_tags").unwrap().name, "root_tags");
        assert_eq!(a.row_count(), 5);
        let names: Vec<&str> = a.tables().map(|t| t.name.as_str()).collect();
        assert_eq!(names, vec!["root", "root_items", "root_tags"]);
    }

    #[test]
    fn test_take_leaves_empty_set() {
        let mut set = TableSet::new("root");
        set.push_main(row(json!({"_id": "1"})));
        let taken = set.take();
        assert_eq!(taken.row_count(), 1);
        assert!(set.is_empty());
        assert_eq!(set.main_name(), "root");
    }
}
