//! Column Mapping
//!
//! Once a view is accepted, each of its output positions corresponds to
//! exactly one base-table attribute. The mapping records that
//! correspondence, in output order, together with the attribute's declared
//! name and type so the rewriter can generate column lists and typed
//! parameters without touching the catalog again.

use pgrx::pg_sys;

use crate::analyzer::AnalyzedView;
use crate::error::{ViewDmlError, ViewDmlResult};
use crate::tree::{OutputExpr, QueryTree};

/// Attribute-namespace lookup for a base relation.
///
/// Backed by `pg_attribute` in production; tests supply a fixture.
pub trait AttributeResolver {
    fn resolve_attribute(
        &self,
        relation: pg_sys::Oid,
        attribute: i16,
    ) -> ViewDmlResult<ResolvedAttribute>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedAttribute {
    pub name: String,
    pub type_oid: pg_sys::Oid,
}

/// One view output position resolved to its base attribute.
#[derive(Debug, Clone, PartialEq)]
pub struct MappedColumn {
    /// 1-based position in the view's own column order.
    pub output_position: u32,
    /// Base attribute name, unquoted.
    pub name: String,
    pub type_oid: pg_sys::Oid,
}

/// Ordered view-position → base-attribute correspondence.
#[derive(Debug, Clone, PartialEq)]
pub struct ColumnMapping {
    columns: Vec<MappedColumn>,
}

impl ColumnMapping {
    pub fn new(columns: Vec<MappedColumn>) -> Self {
        Self { columns }
    }

    pub fn iter(&self) -> std::slice::Iter<'_, MappedColumn> {
        self.columns.iter()
    }

    pub fn len(&self) -> usize {
        self.columns.len()
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty()
    }
}

/// Resolve every output column of an accepted view to its base attribute.
///
/// Walks the output columns in result-position order. Cannot fail for a
/// tree the analyzer accepted, as long as the base relation's attribute
/// catalog still matches the analyzed definition.
pub fn build_mapping(
    view: &AnalyzedView,
    tree: &QueryTree,
    resolver: &dyn AttributeResolver,
) -> ViewDmlResult<ColumnMapping> {
    let mut columns = Vec::with_capacity(tree.output_columns.len());

    for output in &tree.output_columns {
        let attribute = match output.expr {
            OutputExpr::ColumnRef { attribute, .. } => attribute,
            OutputExpr::Other(_) => {
                return Err(ViewDmlError::Catalog {
                    operation: "build column mapping".to_string(),
                    detail: format!(
                        "output column {} is not a column reference after analysis",
                        output.position
                    ),
                });
            }
        };
        let resolved = resolver.resolve_attribute(view.base_relation, attribute)?;
        columns.push(MappedColumn {
            output_position: output.position,
            name: resolved.name,
            type_oid: resolved.type_oid,
        });
    }

    Ok(ColumnMapping::new(columns))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::analyzer::analyze;
    use crate::tree::{FromItem, OutputColumn, TableReference};
    use pgrx::prelude::*;

    /// Fixture namespace: attribute n is ("basecoln", some builtin type).
    struct FixtureResolver;

    impl AttributeResolver for FixtureResolver {
        fn resolve_attribute(
            &self,
            _relation: pg_sys::Oid,
            attribute: i16,
        ) -> ViewDmlResult<ResolvedAttribute> {
            let type_oid = match attribute {
                1 => PgOid::BuiltIn(PgBuiltInOids::INT4OID).value(),
                2 => PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value(),
                3 => PgOid::BuiltIn(PgBuiltInOids::BOOLOID).value(),
                _ => {
                    return Err(ViewDmlError::Catalog {
                        operation: "resolve attribute".to_string(),
                        detail: format!("attribute {} does not exist", attribute),
                    })
                }
            };
            Ok(ResolvedAttribute {
                name: format!("basecol{}", attribute),
                type_oid,
            })
        }
    }

    fn tree_with_columns(columns: Vec<OutputColumn>) -> QueryTree {
        QueryTree {
            from_items: vec![FromItem::TableRef(0)],
            table_references: vec![TableReference::Relation {
                oid: pg_sys::Oid::INVALID,
                name: "t".to_string(),
            }],
            output_columns: columns,
            ..QueryTree::default()
        }
    }

    fn column(position: u32, attribute: i16) -> OutputColumn {
        OutputColumn {
            position,
            expr: OutputExpr::ColumnRef { table_ref: 0, attribute },
        }
    }

    #[test]
    fn test_mapping_uses_base_names_in_output_order() {
        // The view's own column names never enter the mapping: only the
        // positions and the base attribute names they resolve to.
        let tree = tree_with_columns(vec![column(1, 1), column(2, 2)]);
        let view = analyze(&tree).unwrap();

        let mapping = build_mapping(&view, &tree, &FixtureResolver).unwrap();

        let entries: Vec<(u32, &str)> = mapping
            .iter()
            .map(|c| (c.output_position, c.name.as_str()))
            .collect();
        assert_eq!(entries, vec![(1, "basecol1"), (2, "basecol2")]);
        assert_eq!(
            mapping.iter().map(|c| c.type_oid).collect::<Vec<_>>(),
            vec![
                PgOid::BuiltIn(PgBuiltInOids::INT4OID).value(),
                PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value(),
            ]
        );
    }

    #[test]
    fn test_mapping_preserves_projection_order() {
        // Base attributes exposed out of storage order keep the view's order.
        let tree = tree_with_columns(vec![column(1, 3), column(2, 1)]);
        let view = analyze(&tree).unwrap();

        let mapping = build_mapping(&view, &tree, &FixtureResolver).unwrap();

        let names: Vec<&str> = mapping.iter().map(|c| c.name.as_str()).collect();
        assert_eq!(names, vec!["basecol3", "basecol1"]);
    }

    #[test]
    fn test_empty_view_yields_empty_mapping() {
        let tree = tree_with_columns(vec![]);
        let view = analyze(&tree).unwrap();

        let mapping = build_mapping(&view, &tree, &FixtureResolver).unwrap();
        assert!(mapping.is_empty());
    }

    #[test]
    fn test_resolver_failure_propagates() {
        let tree = tree_with_columns(vec![column(1, 9)]);
        let view = analyze(&tree).unwrap();

        let err = build_mapping(&view, &tree, &FixtureResolver).unwrap_err();
        match err {
            ViewDmlError::Catalog { detail, .. } => assert!(detail.contains("9")),
            other => panic!("unexpected error: {:?}", other),
        }
    }
}
