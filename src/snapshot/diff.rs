//! Schema Diff Engine
//!
//! Compares a baseline snapshot with the freshly restored one. Tables are
//! identified by (namespace, name); output follows snapshot order so the
//! same inputs always produce the same messages.

use crate::introspection::{Column, SchemaSnapshot, Table};
use std::collections::{HashMap, HashSet};

/// Type of schema change detected
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Removed,
    Modified,
}

/// A column-level change on a table present in both snapshots
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ColumnChange {
    pub change_type: ChangeType,
    /// `schema.table.column`
    pub object_path: String,
    pub description: String,
}

/// Complete diff between baseline and current
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SchemaDiff {
    /// Baseline tables absent from the current snapshot
    pub missing_tables: Vec<String>,
    /// Current tables absent from the baseline
    pub new_tables: Vec<String>,
    pub column_changes: Vec<ColumnChange>,
}

impl SchemaDiff {
    pub fn is_empty(&self) -> bool {
        self.missing_tables.is_empty() && self.new_tables.is_empty() && self.column_changes.is_empty()
    }

    /// Column changes that lose data or break readers (removals and type/nullability edits)
    pub fn breaking_column_changes(&self) -> impl Iterator<Item = &ColumnChange> {
        self.column_changes
            .iter()
            .filter(|c| c.change_type != ChangeType::Added)
    }
}

/// The diff engine that compares schema snapshots
pub struct DiffEngine;

impl DiffEngine {
    /// Compare two schema snapshots and return all differences
    pub fn diff(baseline: &SchemaSnapshot, current: &SchemaSnapshot) -> SchemaDiff {
        let current_map: HashMap<(&str, &str), &Table> = current
            .tables
            .iter()
            .map(|t| ((t.schema.as_str(), t.name.as_str()), t))
            .collect();
        let baseline_keys: HashSet<(&str, &str)> = baseline
            .tables
            .iter()
            .map(|t| (t.schema.as_str(), t.name.as_str()))
            .collect();

        let mut diff = SchemaDiff::default();

        for table in &baseline.tables {
            match current_map.get(&(table.schema.as_str(), table.name.as_str())) {
                Some(now) => Self::diff_columns(table, now, &mut diff.column_changes),
                None => diff.missing_tables.push(table.qualified_name()),
            }
        }

        diff.new_tables = current
            .tables
            .iter()
            .filter(|t| !baseline_keys.contains(&(t.schema.as_str(), t.name.as_str())))
            .map(Table::qualified_name)
            .collect();

        diff
    }

    fn diff_columns(before: &Table, after: &Table, changes: &mut Vec<ColumnChange>) {
        let table_path = before.qualified_name();
        let after_cols: HashMap<&str, &Column> =
            after.columns.iter().map(|c| (c.name.as_str(), c)).collect();
        let before_names: HashSet<&str> = before.columns.iter().map(|c| c.name.as_str()).collect();

        for col in &before.columns {
            let path = format!("{}.{}", table_path, col.name);
            match after_cols.get(col.name.as_str()) {
                None => changes.push(ColumnChange {
                    change_type: ChangeType::Removed,
                    object_path: path,
                    description: format!("column dropped (type: {})", col.data_type),
                }),
                Some(now) if now.data_type != col.data_type || now.nullable != col.nullable => {
                    changes.push(ColumnChange {
                        change_type: ChangeType::Modified,
                        object_path: path,
                        description: format!(
                            "type: {} -> {}, nullable: {} -> {}",
                            col.data_type, now.data_type, col.nullable, now.nullable
                        ),
                    })
                }
                Some(_) => {}
            }
        }

        for col in &after.columns {
            if !before_names.contains(col.name.as_str()) {
                changes.push(ColumnChange {
                    change_type: ChangeType::Added,
                    object_path: format!("{}.{}", table_path, col.name),
                    description: format!("column added (type: {}, nullable: {})", col.data_type, col.nullable),
                });
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn col(name: &str, ty: &str, nullable: bool) -> Column {
        Column {
            name: name.into(),
            data_type: ty.into(),
            nullable,
        }
    }

    #[test]
    fn test_identical_snapshots_have_no_diff() {
        let s = SchemaSnapshot::new(vec![Table::new("public", "users", vec![col("id", "integer", false)])]);
        assert!(DiffEngine::diff(&s, &s).is_empty());
    }

    #[test]
    fn test_tables_compared_by_namespace_and_name() {
        let baseline = SchemaSnapshot::new(vec![
            Table::new("public", "events", vec![]),
            Table::new("audit", "log", vec![]),
        ]);
        let current = SchemaSnapshot::new(vec![
            Table::new("audit", "events", vec![]),
            Table::new("audit", "log", vec![]),
        ]);

        let diff = DiffEngine::diff(&baseline, &current);

        assert_eq!(diff.missing_tables, vec!["public.events"]);
        assert_eq!(diff.new_tables, vec!["audit.events"]);
    }

    #[test]
    fn test_column_changes_detected() {
        let baseline = SchemaSnapshot::new(vec![Table::new(
            "public",
            "users",
            vec![
                col("id", "integer", false),
                col("email", "text", true),
                col("legacy", "text", true),
            ],
        )]);
        let current = SchemaSnapshot::new(vec![Table::new(
            "public",
            "users",
            vec![
                col("id", "bigint", false),
                col("email", "text", true),
                col("created_at", "timestamp", false),
            ],
        )]);

        let diff = DiffEngine::diff(&baseline, &current);
        let kinds: Vec<_> = diff
            .column_changes
            .iter()
            .map(|c| (c.change_type, c.object_path.as_str()))
            .collect();

        assert_eq!(
            kinds,
            vec![
                (ChangeType::Modified, "public.users.id"),
                (ChangeType::Removed, "public.users.legacy"),
                (ChangeType::Added, "public.users.created_at"),
            ]
        );
        assert_eq!(diff.breaking_column_changes().count(), 2);
    }
}
