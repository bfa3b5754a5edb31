//! View Definition Parsing
//!
//! Turns the SQL text stored for a view (`pg_get_viewdef`) into the
//! `QueryTree` the analyzer works on. The walk uses the server's own
//! `raw_parser`, so the extension never second-guesses PostgreSQL's SQL
//! grammar; it only classifies the nodes it finds:
//!
//! - clause flags straight off the `SelectStmt`
//! - FROM items: `RangeVar` entries are resolved through the catalog,
//!   joins/subqueries/functions are tagged as non-plain
//! - target entries: plain column references are resolved to base
//!   attribute numbers, `*`/`t.*` become whole-row references
//!   (attribute 0), everything else is tagged with a short description
//!
//! Must be called within a PostgreSQL backend.

use std::ffi::{CStr, CString};

use pgrx::{is_a, pg_sys, PgList};

use crate::catalog::{self, AttributeInfo};
use crate::error::{ViewDmlError, ViewDmlResult};
use crate::tree::{FromItem, OutputColumn, OutputExpr, QueryTree, TableReference};

/// Parse a stored view definition into a `QueryTree`.
pub fn parse_view_definition(sql: &str) -> ViewDmlResult<QueryTree> {
    let c_query = CString::new(sql).map_err(|_| parse_error("definition contains null bytes"))?;

    // SAFETY: raw_parser is safe within a PostgreSQL backend with a valid
    // memory context.
    let raw_list = unsafe {
        pg_sys::raw_parser(c_query.as_ptr(), pg_sys::RawParseMode::RAW_PARSE_DEFAULT)
    };
    if raw_list.is_null() {
        return Err(parse_error("raw_parser returned NULL"));
    }

    let list = unsafe { PgList::<pg_sys::RawStmt>::from_pg(raw_list) };
    let raw_stmt = list.head().ok_or_else(|| parse_error("definition is empty"))?;

    let node = unsafe { (*raw_stmt).stmt };
    if !unsafe { is_a(node, pg_sys::NodeTag::T_SelectStmt) } {
        return Err(parse_error("definition is not a SELECT"));
    }

    let select = unsafe { &*(node as *const pg_sys::SelectStmt) };
    unsafe { build_query_tree(select) }
}

fn parse_error(detail: &str) -> ViewDmlError {
    ViewDmlError::Catalog {
        operation: "parse view definition".to_string(),
        detail: detail.to_string(),
    }
}

/// # Safety
/// Caller must ensure `select` points to a valid `SelectStmt`.
unsafe fn build_query_tree(select: &pg_sys::SelectStmt) -> ViewDmlResult<QueryTree> {
    let mut tree = QueryTree {
        distinct: !select.distinctClause.is_null(),
        group_by: !select.groupClause.is_null(),
        having: !select.havingClause.is_null(),
        set_operation: select.op != pg_sys::SetOperation::SETOP_NONE,
        limit: !select.limitCount.is_null(),
        offset: !select.limitOffset.is_null(),
        ..QueryTree::default()
    };

    // alias (or bare relation name) → table-reference index
    let mut aliases: Vec<(String, usize)> = Vec::new();

    let from_clause = unsafe { PgList::<pg_sys::Node>::from_pg(select.fromClause) };
    for node in from_clause.iter_ptr() {
        let item = unsafe { from_item(node, &mut tree.table_references, &mut aliases)? };
        tree.from_items.push(item);
    }

    unsafe { walk_target_list(select.targetList, &mut tree, &aliases)? };
    Ok(tree)
}

/// # Safety
/// Caller must ensure `node` points to a valid parse tree node.
unsafe fn from_item(
    node: *mut pg_sys::Node,
    references: &mut Vec<TableReference>,
    aliases: &mut Vec<(String, usize)>,
) -> ViewDmlResult<FromItem> {
    if node.is_null() {
        return Ok(FromItem::Other("empty"));
    }

    if unsafe { is_a(node, pg_sys::NodeTag::T_RangeVar) } {
        let rv = unsafe { &*(node as *const pg_sys::RangeVar) };
        if rv.relname.is_null() {
            return Ok(FromItem::Other("unnamed relation"));
        }
        let relname = unsafe { cstr_text(rv.relname) };
        let schema = if rv.schemaname.is_null() {
            None
        } else {
            Some(unsafe { cstr_text(rv.schemaname) })
        };

        let info = catalog::lookup_relation(schema.as_deref(), &relname)?.ok_or_else(|| {
            ViewDmlError::Catalog {
                operation: "resolve FROM item".to_string(),
                detail: format!("relation \"{}\" does not exist", relname),
            }
        })?;

        let index = references.len();
        references.push(match info.kind {
            catalog::RelationKind::Table => TableReference::Relation {
                oid: info.oid,
                name: info.name,
            },
            other => TableReference::Other(other.describe()),
        });

        let alias = if rv.alias.is_null() {
            relname
        } else {
            let alias = unsafe { &*rv.alias };
            if alias.aliasname.is_null() {
                relname
            } else {
                unsafe { cstr_text(alias.aliasname) }
            }
        };
        aliases.push((alias, index));

        Ok(FromItem::TableRef(index))
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_JoinExpr) } {
        Ok(FromItem::Other("join"))
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_RangeSubselect) } {
        Ok(FromItem::Other("subquery"))
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_RangeFunction) } {
        Ok(FromItem::Other("function"))
    } else {
        Ok(FromItem::Other("other"))
    }
}

/// # Safety
/// Caller must ensure `target_list` is a valid (possibly NIL) node list.
unsafe fn walk_target_list(
    target_list: *mut pg_sys::List,
    tree: &mut QueryTree,
    aliases: &[(String, usize)],
) -> ViewDmlResult<()> {
    // Attribute namespace of the first plain relation, fetched once.
    let base = tree
        .table_references
        .iter()
        .enumerate()
        .find_map(|(index, reference)| match reference {
            TableReference::Relation { oid, .. } => Some((index, *oid)),
            TableReference::Other(_) => None,
        });
    let base_attributes = match base {
        Some((_, oid)) => Some(catalog::relation_attributes(oid)?),
        None => None,
    };

    let targets = unsafe { PgList::<pg_sys::Node>::from_pg(target_list) };
    for (i, node) in targets.iter_ptr().enumerate() {
        let position = i as u32 + 1;
        let expr = if node.is_null() || !unsafe { is_a(node, pg_sys::NodeTag::T_ResTarget) } {
            OutputExpr::Other("unrecognized target entry".to_string())
        } else {
            let target = unsafe { &*(node as *const pg_sys::ResTarget) };
            unsafe {
                output_expr(
                    target.val,
                    &tree.table_references,
                    base.map(|(index, _)| index),
                    base_attributes.as_deref(),
                    aliases,
                )?
            }
        };
        tree.output_columns.push(OutputColumn { position, expr });
    }
    Ok(())
}

/// # Safety
/// Caller must ensure `node` points to a valid parse tree node.
unsafe fn output_expr(
    node: *mut pg_sys::Node,
    references: &[TableReference],
    base_index: Option<usize>,
    base_attributes: Option<&[AttributeInfo]>,
    aliases: &[(String, usize)],
) -> ViewDmlResult<OutputExpr> {
    if node.is_null() {
        return Ok(OutputExpr::Other("empty expression".to_string()));
    }
    if !unsafe { is_a(node, pg_sys::NodeTag::T_ColumnRef) } {
        return Ok(OutputExpr::Other(unsafe { describe_node(node) }.to_string()));
    }

    let column_ref = unsafe { &*(node as *const pg_sys::ColumnRef) };
    let fields = unsafe { PgList::<pg_sys::Node>::from_pg(column_ref.fields) };
    if fields.is_empty() {
        return Ok(OutputExpr::Other("empty column reference".to_string()));
    }

    // Qualifier, when present, is the field before the column name.
    let table_ref = if fields.len() >= 2 {
        let qualifier = fields
            .get_ptr(fields.len() - 2)
            .and_then(|field| unsafe { node_text(field) });
        let Some(qualifier) = qualifier else {
            return Ok(OutputExpr::Other("qualified column reference".to_string()));
        };
        match aliases.iter().find(|(name, _)| *name == qualifier) {
            Some((_, index)) => *index,
            None => {
                return Ok(OutputExpr::Other(format!(
                    "reference to unknown relation \"{}\"",
                    qualifier
                )))
            }
        }
    } else {
        match base_index {
            Some(index) => index,
            None => return Ok(OutputExpr::Other("column reference".to_string())),
        }
    };

    let Some(last) = fields.get_ptr(fields.len() - 1) else {
        return Ok(OutputExpr::Other("empty column reference".to_string()));
    };
    if unsafe { is_a(last, pg_sys::NodeTag::T_A_Star) } {
        // Whole-row reference; attribute 0 by convention.
        return Ok(OutputExpr::ColumnRef { table_ref, attribute: 0 });
    }
    let Some(column_name) = (unsafe { node_text(last) }) else {
        return Ok(OutputExpr::Other("column reference".to_string()));
    };

    match references.get(table_ref) {
        Some(TableReference::Relation { oid, .. }) => {
            let attribute = if base_index == Some(table_ref) {
                base_attributes.and_then(|attributes| {
                    attributes
                        .iter()
                        .find(|a| a.name == column_name)
                        .map(|a| a.number)
                })
            } else {
                catalog::attribute_number(*oid, &column_name)?
            };
            match attribute {
                Some(attribute) => Ok(OutputExpr::ColumnRef { table_ref, attribute }),
                None => Ok(OutputExpr::Other(format!(
                    "unknown column \"{}\"",
                    column_name
                ))),
            }
        }
        // The reference points at something without an attribute namespace;
        // the from-item checks reject the view before this matters.
        _ => Ok(OutputExpr::ColumnRef { table_ref, attribute: 0 }),
    }
}

/// # Safety
/// Caller must ensure `node` points to a valid parse tree node.
unsafe fn node_text(node: *mut pg_sys::Node) -> Option<String> {
    if node.is_null() || !unsafe { is_a(node, pg_sys::NodeTag::T_String) } {
        return None;
    }
    let string = unsafe { &*(node as *const pg_sys::String) };
    if string.sval.is_null() {
        return None;
    }
    Some(unsafe { cstr_text(string.sval) })
}

/// # Safety
/// Caller must ensure `node` points to a valid parse tree node.
unsafe fn describe_node(node: *mut pg_sys::Node) -> &'static str {
    if unsafe { is_a(node, pg_sys::NodeTag::T_FuncCall) } {
        "function call"
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_A_Expr) } {
        "operator expression"
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_A_Const) } {
        "constant"
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_TypeCast) } {
        "type cast"
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_CaseExpr) } {
        "CASE expression"
    } else if unsafe { is_a(node, pg_sys::NodeTag::T_SubLink) } {
        "subquery expression"
    } else {
        "expression"
    }
}

/// # Safety
/// Caller must ensure `ptr` is a valid NUL-terminated string.
unsafe fn cstr_text(ptr: *const std::os::raw::c_char) -> String {
    unsafe { CStr::from_ptr(ptr) }.to_string_lossy().into_owned()
}
