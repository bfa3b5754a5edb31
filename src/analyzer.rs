//! View Updatability Analysis
//!
//! Decides whether a view definition is simple enough that row-level DML
//! against the view can be translated into statements against its single
//! base table. A view qualifies when it is a bare projection: one plain
//! table in FROM, every output column a distinct plain column reference,
//! and none of DISTINCT / GROUP BY / HAVING / set operations / LIMIT /
//! OFFSET.
//!
//! The checks run in a fixed order so the same view always reports the
//! same reason. `analyze` is pure: it never touches the catalog and never
//! mutates its input.

use std::collections::HashSet;

use pgrx::pg_sys;
use serde::Serialize;

use crate::tree::{FromItem, OutputExpr, QueryTree, TableReference};

/// Why a view is not updatable.
///
/// Deterministic properties of the view definition; retrying the analysis
/// yields the same reason, so callers must not retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum RejectReason {
    HasDistinct,
    HasGroupBy,
    HasHaving,
    HasSetOperation,
    MultipleOrNonPlainFromItems,
    NonTableFromItem,
    HasLimitOrOffset,
    NonColumnOutputExpression { position: u32 },
    UnknownRangeReference { position: u32 },
    ZeroAttributeReference { position: u32 },
    DuplicateAttributeReference { attribute: i16 },
}

impl std::fmt::Display for RejectReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        use RejectReason::*;
        match self {
            HasDistinct => write!(f, "not updatable because of DISTINCT"),
            HasGroupBy => write!(f, "not updatable because of GROUP BY"),
            HasHaving => write!(f, "not updatable because of HAVING"),
            HasSetOperation => write!(f, "not updatable because of set operation"),
            MultipleOrNonPlainFromItems => {
                write!(f, "not updatable because the FROM clause is not a single plain table")
            }
            NonTableFromItem => write!(f, "not updatable because of non-table FROM item"),
            HasLimitOrOffset => write!(f, "not updatable because of LIMIT or OFFSET"),
            NonColumnOutputExpression { position } => {
                write!(f, "not updatable because column {} is not a plain column reference", position)
            }
            UnknownRangeReference { position } => {
                write!(f, "column {} references an unknown range table entry", position)
            }
            ZeroAttributeReference { position } => {
                write!(f, "column {} is a whole-row reference", position)
            }
            DuplicateAttributeReference { attribute } => {
                write!(f, "not updatable because base column {} is referenced multiple times", attribute)
            }
        }
    }
}

/// An accepted view: the base relation it projects and where that relation
/// sits in the definition's table-reference list.
#[derive(Debug, Clone, PartialEq)]
pub struct AnalyzedView {
    pub base_relation: pg_sys::Oid,
    /// Qualified, quoted base relation name, as stored in the tree.
    pub relation_name: String,
    pub table_ref: usize,
}

/// Accept a view definition as updatable or reject it with the first
/// violated condition.
pub fn analyze(tree: &QueryTree) -> Result<AnalyzedView, RejectReason> {
    if tree.distinct {
        return Err(RejectReason::HasDistinct);
    }
    if tree.group_by {
        return Err(RejectReason::HasGroupBy);
    }
    if tree.having {
        return Err(RejectReason::HasHaving);
    }
    if tree.set_operation {
        return Err(RejectReason::HasSetOperation);
    }

    if tree.from_items.len() != 1 {
        return Err(RejectReason::MultipleOrNonPlainFromItems);
    }
    let table_ref = match tree.from_items[0] {
        FromItem::TableRef(index) => index,
        FromItem::Other(_) => return Err(RejectReason::MultipleOrNonPlainFromItems),
    };
    let (base_relation, relation_name) = match tree.table_references.get(table_ref) {
        Some(TableReference::Relation { oid, name }) => (*oid, name.clone()),
        _ => return Err(RejectReason::NonTableFromItem),
    };

    if tree.limit || tree.offset {
        return Err(RejectReason::HasLimitOrOffset);
    }

    let mut seen = HashSet::new();
    for column in &tree.output_columns {
        match column.expr {
            OutputExpr::ColumnRef { table_ref: referenced, attribute } => {
                if referenced != table_ref {
                    return Err(RejectReason::UnknownRangeReference { position: column.position });
                }
                if attribute == 0 {
                    return Err(RejectReason::ZeroAttributeReference { position: column.position });
                }
                if !seen.insert(attribute) {
                    return Err(RejectReason::DuplicateAttributeReference { attribute });
                }
            }
            OutputExpr::Other(_) => {
                return Err(RejectReason::NonColumnOutputExpression { position: column.position });
            }
        }
    }

    Ok(AnalyzedView {
        base_relation,
        relation_name,
        table_ref,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tree::OutputColumn;

    fn base_table() -> TableReference {
        TableReference::Relation {
            oid: pg_sys::Oid::INVALID,
            name: "t".to_string(),
        }
    }

    fn column(position: u32, attribute: i16) -> OutputColumn {
        OutputColumn {
            position,
            expr: OutputExpr::ColumnRef { table_ref: 0, attribute },
        }
    }

    /// A projection of base attributes 1 and 2 — the simplest accepted view.
    fn simple_tree() -> QueryTree {
        QueryTree {
            from_items: vec![FromItem::TableRef(0)],
            table_references: vec![base_table()],
            output_columns: vec![column(1, 1), column(2, 2)],
            ..QueryTree::default()
        }
    }

    #[test]
    fn test_accepts_simple_projection() {
        let view = analyze(&simple_tree()).unwrap();
        assert_eq!(view.table_ref, 0);
        assert_eq!(view.relation_name, "t");
    }

    #[test]
    fn test_accepts_reordered_columns() {
        let mut tree = simple_tree();
        tree.output_columns = vec![column(1, 2), column(2, 1)];
        assert!(analyze(&tree).is_ok());
    }

    #[test]
    fn test_accepts_zero_output_columns() {
        // Structurally fine; the rewriter refuses it later.
        let mut tree = simple_tree();
        tree.output_columns.clear();
        assert!(analyze(&tree).is_ok());
    }

    #[test]
    fn test_rejects_distinct() {
        let mut tree = simple_tree();
        tree.distinct = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasDistinct));
    }

    #[test]
    fn test_rejects_group_by() {
        let mut tree = simple_tree();
        tree.group_by = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasGroupBy));
    }

    #[test]
    fn test_rejects_having() {
        let mut tree = simple_tree();
        tree.having = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasHaving));
    }

    #[test]
    fn test_rejects_set_operation() {
        let mut tree = simple_tree();
        tree.set_operation = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasSetOperation));
    }

    #[test]
    fn test_rejects_empty_from_list() {
        let mut tree = simple_tree();
        tree.from_items.clear();
        assert_eq!(analyze(&tree), Err(RejectReason::MultipleOrNonPlainFromItems));
    }

    #[test]
    fn test_rejects_two_from_items() {
        let mut tree = simple_tree();
        tree.from_items = vec![FromItem::TableRef(0), FromItem::TableRef(0)];
        assert_eq!(analyze(&tree), Err(RejectReason::MultipleOrNonPlainFromItems));
    }

    #[test]
    fn test_rejects_join_from_item() {
        let mut tree = simple_tree();
        tree.from_items = vec![FromItem::Other("join")];
        assert_eq!(analyze(&tree), Err(RejectReason::MultipleOrNonPlainFromItems));
    }

    #[test]
    fn test_rejects_view_as_from_item() {
        let mut tree = simple_tree();
        tree.table_references = vec![TableReference::Other("view")];
        assert_eq!(analyze(&tree), Err(RejectReason::NonTableFromItem));
    }

    #[test]
    fn test_rejects_dangling_table_reference() {
        let mut tree = simple_tree();
        tree.from_items = vec![FromItem::TableRef(7)];
        assert_eq!(analyze(&tree), Err(RejectReason::NonTableFromItem));
    }

    #[test]
    fn test_rejects_limit_and_offset() {
        let mut tree = simple_tree();
        tree.limit = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasLimitOrOffset));

        let mut tree = simple_tree();
        tree.offset = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasLimitOrOffset));
    }

    #[test]
    fn test_rejects_expression_column() {
        let mut tree = simple_tree();
        tree.output_columns[1] = OutputColumn {
            position: 2,
            expr: OutputExpr::Other("operator expression".to_string()),
        };
        assert_eq!(
            analyze(&tree),
            Err(RejectReason::NonColumnOutputExpression { position: 2 })
        );
    }

    #[test]
    fn test_rejects_reference_to_other_range_entry() {
        let mut tree = simple_tree();
        tree.output_columns[0] = OutputColumn {
            position: 1,
            expr: OutputExpr::ColumnRef { table_ref: 3, attribute: 1 },
        };
        assert_eq!(
            analyze(&tree),
            Err(RejectReason::UnknownRangeReference { position: 1 })
        );
    }

    #[test]
    fn test_rejects_whole_row_reference() {
        let mut tree = simple_tree();
        tree.output_columns[0] = column(1, 0);
        assert_eq!(
            analyze(&tree),
            Err(RejectReason::ZeroAttributeReference { position: 1 })
        );
    }

    #[test]
    fn test_rejects_duplicate_base_column() {
        // Same base attribute exposed twice under different view columns.
        let mut tree = simple_tree();
        tree.output_columns = vec![column(1, 1), column(2, 1)];
        assert_eq!(
            analyze(&tree),
            Err(RejectReason::DuplicateAttributeReference { attribute: 1 })
        );
    }

    #[test]
    fn test_first_violation_wins() {
        // DISTINCT is checked before GROUP BY, and both before the FROM list.
        let mut tree = simple_tree();
        tree.distinct = true;
        tree.group_by = true;
        tree.from_items.clear();
        assert_eq!(analyze(&tree), Err(RejectReason::HasDistinct));

        let mut tree = simple_tree();
        tree.group_by = true;
        tree.limit = true;
        assert_eq!(analyze(&tree), Err(RejectReason::HasGroupBy));

        // The FROM list is resolved before LIMIT/OFFSET is looked at.
        let mut tree = simple_tree();
        tree.limit = true;
        tree.table_references = vec![TableReference::Other("subquery")];
        assert_eq!(analyze(&tree), Err(RejectReason::NonTableFromItem));
    }

    #[test]
    fn test_analysis_is_idempotent() {
        let tree = simple_tree();
        assert_eq!(analyze(&tree), analyze(&tree));

        let mut rejected = simple_tree();
        rejected.group_by = true;
        assert_eq!(analyze(&rejected), analyze(&rejected));
    }
}
