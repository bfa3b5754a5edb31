//! Catalog access for the view definition provider and the rewriter.
//!
//! Everything here goes through SPI against the system catalogs:
//! definition text from `pg_get_viewdef`, relation identity/kind from
//! `pg_class`, attribute names and types from `pg_attribute`. Relation
//! names are rendered with `::regclass::text`, which quotes and
//! schema-prefixes exactly when the search path requires it.

use pgrx::datum::DatumWithOid;
use pgrx::prelude::*;

use crate::error::{ViewDmlError, ViewDmlResult};
use crate::mapping::{AttributeResolver, ResolvedAttribute};
use crate::parser;
use crate::rewrite::quote_identifier;
use crate::tree::QueryTree;

/// What a FROM-clause name resolved to.
#[derive(Debug, Clone, PartialEq)]
pub struct RelationInfo {
    pub oid: pg_sys::Oid,
    pub kind: RelationKind,
    /// Display name from `::regclass::text`, ready to embed in SQL.
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelationKind {
    /// Plain or partitioned table — has storage, accepts DML.
    Table,
    View,
    MaterializedView,
    ForeignTable,
    Other,
}

impl RelationKind {
    fn from_relkind(relkind: &str) -> Self {
        match relkind {
            "r" | "p" => RelationKind::Table,
            "v" => RelationKind::View,
            "m" => RelationKind::MaterializedView,
            "f" => RelationKind::ForeignTable,
            _ => RelationKind::Other,
        }
    }

    pub fn describe(self) -> &'static str {
        match self {
            RelationKind::Table => "table",
            RelationKind::View => "view",
            RelationKind::MaterializedView => "materialized view",
            RelationKind::ForeignTable => "foreign table",
            RelationKind::Other => "relation without storage",
        }
    }
}

/// One live attribute of a relation, in attribute-number order.
#[derive(Debug, Clone, PartialEq)]
pub struct AttributeInfo {
    pub name: String,
    pub number: i16,
    pub type_oid: pg_sys::Oid,
}

/// Fetch a view's stored definition and parse it into a `QueryTree`.
///
/// This is the definition-provider entry point the dispatcher calls.
pub fn view_query_tree(view: pg_sys::Oid) -> ViewDmlResult<QueryTree> {
    match relation_kind(view)? {
        Some(RelationKind::View) => {}
        Some(kind) => {
            return Err(ViewDmlError::Catalog {
                operation: "load view definition".to_string(),
                detail: format!(
                    "relation {} is a {}, not a view",
                    view.as_u32(),
                    kind.describe()
                ),
            })
        }
        None => {
            return Err(ViewDmlError::Catalog {
                operation: "load view definition".to_string(),
                detail: format!("relation {} does not exist", view.as_u32()),
            })
        }
    }
    let definition = view_definition(view)?;
    parser::parse_view_definition(&definition)
}

/// Definition text of a view from `pg_get_viewdef`.
pub fn view_definition(view: pg_sys::Oid) -> ViewDmlResult<String> {
    let query = "SELECT pg_catalog.pg_get_viewdef($1)";
    let args = [unsafe { DatumWithOid::new(view, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value()) }];

    Spi::get_one_with_args::<String>(query, &args)
        .map_err(|e| ViewDmlError::Spi { query: query.to_string(), error: e.to_string() })?
        .ok_or_else(|| ViewDmlError::Catalog {
            operation: "pg_get_viewdef".to_string(),
            detail: format!("no definition stored for view {}", view.as_u32()),
        })
}

/// Search-path-aware display name for a relation.
pub fn relation_name(relation: pg_sys::Oid) -> ViewDmlResult<String> {
    let query = "SELECT $1::pg_catalog.regclass::text";
    let args = [unsafe {
        DatumWithOid::new(relation, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value())
    }];

    Spi::get_one_with_args::<String>(query, &args)
        .map_err(|e| ViewDmlError::Spi { query: query.to_string(), error: e.to_string() })?
        .ok_or_else(|| ViewDmlError::Catalog {
            operation: "regclass".to_string(),
            detail: format!("no pg_class entry for oid {}", relation.as_u32()),
        })
}

/// Relation kind by oid; `None` when the oid does not exist.
pub fn relation_kind(relation: pg_sys::Oid) -> ViewDmlResult<Option<RelationKind>> {
    let query = "SELECT relkind::text FROM pg_catalog.pg_class WHERE oid = $1";
    let args = [unsafe {
        DatumWithOid::new(relation, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value())
    }];

    let relkind = Spi::get_one_with_args::<String>(query, &args)
        .map_err(|e| ViewDmlError::Spi { query: query.to_string(), error: e.to_string() })?;
    Ok(relkind.as_deref().map(RelationKind::from_relkind))
}

/// Resolve a (possibly schema-qualified) FROM-clause name to a relation,
/// honoring the caller's search path. `None` when nothing matches.
pub fn lookup_relation(schema: Option<&str>, name: &str) -> ViewDmlResult<Option<RelationInfo>> {
    let qualified = match schema {
        Some(schema) => format!("{}.{}", quote_identifier(schema), quote_identifier(name)),
        None => quote_identifier(name),
    };
    let query = "SELECT c.oid AS reloid, c.relkind::text AS relkind, \
                 c.oid::pg_catalog.regclass::text AS relname \
                 FROM pg_catalog.pg_class c \
                 WHERE c.oid = pg_catalog.to_regclass($1)";

    Spi::connect(|client| {
        let args = vec![unsafe {
            DatumWithOid::new(qualified.as_str(), PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value())
        }];
        let mut rows = client.select(query, None, &args)?;

        let Some(row) = rows.next() else {
            return Ok(None);
        };
        let oid = row["reloid"]
            .value::<pg_sys::Oid>()?
            .ok_or(pgrx::spi::Error::InvalidPosition)?;
        let relkind = row["relkind"]
            .value::<String>()?
            .ok_or(pgrx::spi::Error::InvalidPosition)?;
        let relname = row["relname"]
            .value::<String>()?
            .ok_or(pgrx::spi::Error::InvalidPosition)?;

        Ok(Some(RelationInfo {
            oid,
            kind: RelationKind::from_relkind(&relkind),
            name: relname,
        }))
    })
    .map_err(|e: pgrx::spi::Error| ViewDmlError::Spi {
        query: query.to_string(),
        error: e.to_string(),
    })
}

/// Every live attribute of a relation, in attribute-number order.
pub fn relation_attributes(relation: pg_sys::Oid) -> ViewDmlResult<Vec<AttributeInfo>> {
    let query = "SELECT a.attname::text AS attname, a.attnum, a.atttypid \
                 FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = $1 AND a.attnum > 0 AND NOT a.attisdropped \
                 ORDER BY a.attnum";

    Spi::connect(|client| {
        let args = vec![unsafe {
            DatumWithOid::new(relation, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value())
        }];
        let rows = client.select(query, None, &args)?;

        let mut attributes = Vec::new();
        for row in rows {
            let name = row["attname"]
                .value::<String>()?
                .ok_or(pgrx::spi::Error::InvalidPosition)?;
            let number = row["attnum"]
                .value::<i16>()?
                .ok_or(pgrx::spi::Error::InvalidPosition)?;
            let type_oid = row["atttypid"]
                .value::<pg_sys::Oid>()?
                .ok_or(pgrx::spi::Error::InvalidPosition)?;
            attributes.push(AttributeInfo { name, number, type_oid });
        }
        Ok(attributes)
    })
    .map_err(|e: pgrx::spi::Error| ViewDmlError::Spi {
        query: query.to_string(),
        error: e.to_string(),
    })
}

/// Attribute number of a named column; `None` when the column is absent.
pub fn attribute_number(relation: pg_sys::Oid, name: &str) -> ViewDmlResult<Option<i16>> {
    let query = "SELECT a.attnum FROM pg_catalog.pg_attribute a \
                 WHERE a.attrelid = $1 AND a.attname::text = $2 \
                 AND a.attnum > 0 AND NOT a.attisdropped";
    let args = [
        unsafe { DatumWithOid::new(relation, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value()) },
        unsafe { DatumWithOid::new(name, PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value()) },
    ];

    Spi::get_one_with_args::<i16>(query, &args)
        .map_err(|e| ViewDmlError::Spi { query: query.to_string(), error: e.to_string() })
}

/// `pg_attribute`-backed resolver used by the mapping builder.
pub struct PgAttributeResolver;

impl AttributeResolver for PgAttributeResolver {
    fn resolve_attribute(
        &self,
        relation: pg_sys::Oid,
        attribute: i16,
    ) -> ViewDmlResult<ResolvedAttribute> {
        let query = "SELECT a.attname::text AS attname, a.atttypid \
                     FROM pg_catalog.pg_attribute a \
                     WHERE a.attrelid = $1 AND a.attnum = $2 AND NOT a.attisdropped";

        let resolved = Spi::connect(|client| {
            let args = vec![
                unsafe {
                    DatumWithOid::new(relation, PgOid::BuiltIn(PgBuiltInOids::OIDOID).value())
                },
                unsafe {
                    DatumWithOid::new(attribute, PgOid::BuiltIn(PgBuiltInOids::INT2OID).value())
                },
            ];
            let mut rows = client.select(query, None, &args)?;

            let Some(row) = rows.next() else {
                return Ok(None);
            };
            let name = row["attname"]
                .value::<String>()?
                .ok_or(pgrx::spi::Error::InvalidPosition)?;
            let type_oid = row["atttypid"]
                .value::<pg_sys::Oid>()?
                .ok_or(pgrx::spi::Error::InvalidPosition)?;
            Ok(Some(ResolvedAttribute { name, type_oid }))
        })
        .map_err(|e: pgrx::spi::Error| ViewDmlError::Spi {
            query: query.to_string(),
            error: e.to_string(),
        })?;

        resolved.ok_or_else(|| ViewDmlError::Catalog {
            operation: "resolve attribute".to_string(),
            detail: format!(
                "attribute {} of relation {} does not exist",
                attribute,
                relation.as_u32()
            ),
        })
    }
}
