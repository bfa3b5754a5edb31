//! Statement Rewriter
//!
//! Turns a row-level event against an accepted view into one parameterized
//! statement against the base table. The generated text carries `$1..$n`
//! placeholders; the parameter types come from the column mapping and the
//! parameter values from the event's row images, all three in the same
//! order.
//!
//! DELETE and UPDATE match the affected base row with a full-row,
//! NULL-safe predicate (`IS NOT DISTINCT FROM`) built from the old row
//! image. If several base rows carry identical values for every projected
//! column, the statement touches all of them, the same way a hand-written
//! full-row predicate would.
//!
//! The rewriter is generic over the parameter value type: the trigger glue
//! binds raw datums, the unit tests bind plain Rust values.

use pgrx::pg_sys;

use crate::analyzer::AnalyzedView;
use crate::mapping::{ColumnMapping, MappedColumn};

/// Row-level modification kinds routed through the view.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventKind {
    Insert,
    Update,
    Delete,
}

/// One row of view-level values, keyed by the view's own 1-based,
/// contiguous column numbering. `None` is SQL NULL.
#[derive(Debug, Clone, PartialEq)]
pub struct RowImage<V> {
    slots: Vec<Option<V>>,
}

impl<V> RowImage<V> {
    pub fn new(slots: Vec<Option<V>>) -> Self {
        Self { slots }
    }

    pub fn len(&self) -> usize {
        self.slots.len()
    }

    pub fn is_empty(&self) -> bool {
        self.slots.is_empty()
    }

    /// Slot at a 1-based view column position.
    pub fn get(&self, position: u32) -> Option<&Option<V>> {
        let index = position.checked_sub(1)? as usize;
        self.slots.get(index)
    }
}

/// Input to the rewriter: the event and the row image(s) it carries.
#[derive(Debug, Clone, PartialEq)]
pub struct RewriteRequest<V> {
    pub event: EventKind,
    /// Present for Insert and Update.
    pub new: Option<RowImage<V>>,
    /// Present for Delete and Update.
    pub old: Option<RowImage<V>>,
}

/// A ready-to-prepare statement: text plus ordered parameter types and
/// values matching the `$1..$n` placeholders.
#[derive(Debug, Clone, PartialEq)]
pub struct GeneratedStatement<V> {
    pub text: String,
    pub param_types: Vec<pg_sys::Oid>,
    pub param_values: Vec<Option<V>>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RewriteError {
    /// The view exposes zero columns; there is nothing to write.
    EmptyMapping,
    /// The event did not carry the row image its kind requires.
    MissingRowImage { event: EventKind },
    /// The row image has no slot for a mapped view position.
    MissingColumnValue { position: u32 },
}

impl std::fmt::Display for RewriteError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RewriteError::EmptyMapping => {
                write!(f, "view exposes no columns, nothing to rewrite")
            }
            RewriteError::MissingRowImage { event } => {
                write!(f, "row image missing for {:?} event", event)
            }
            RewriteError::MissingColumnValue { position } => {
                write!(f, "row image has no value for view column {}", position)
            }
        }
    }
}

impl std::error::Error for RewriteError {}

/// Build the base-table statement for one row-level event.
pub fn rewrite<V: Clone>(
    view: &AnalyzedView,
    mapping: &ColumnMapping,
    request: &RewriteRequest<V>,
) -> Result<GeneratedStatement<V>, RewriteError> {
    if mapping.is_empty() {
        return Err(RewriteError::EmptyMapping);
    }
    match request.event {
        EventKind::Insert => rewrite_insert(view, mapping, require_image(request, Image::New)?),
        EventKind::Delete => rewrite_delete(view, mapping, require_image(request, Image::Old)?),
        EventKind::Update => rewrite_update(
            view,
            mapping,
            require_image(request, Image::New)?,
            require_image(request, Image::Old)?,
        ),
    }
}

enum Image {
    New,
    Old,
}

fn require_image<'a, V>(
    request: &'a RewriteRequest<V>,
    which: Image,
) -> Result<&'a RowImage<V>, RewriteError> {
    let image = match which {
        Image::New => request.new.as_ref(),
        Image::Old => request.old.as_ref(),
    };
    image.ok_or(RewriteError::MissingRowImage { event: request.event })
}

fn value_at<V: Clone>(
    image: &RowImage<V>,
    column: &MappedColumn,
) -> Result<Option<V>, RewriteError> {
    image
        .get(column.output_position)
        .cloned()
        .ok_or(RewriteError::MissingColumnValue { position: column.output_position })
}

fn rewrite_insert<V: Clone>(
    view: &AnalyzedView,
    mapping: &ColumnMapping,
    new: &RowImage<V>,
) -> Result<GeneratedStatement<V>, RewriteError> {
    let mut columns = String::new();
    let mut placeholders = String::new();
    let mut param_types = Vec::with_capacity(mapping.len());
    let mut param_values = Vec::with_capacity(mapping.len());

    for (i, column) in mapping.iter().enumerate() {
        if i > 0 {
            columns.push_str(", ");
            placeholders.push_str(", ");
        }
        columns.push_str(&quote_identifier(&column.name));
        placeholders.push_str(&format!("${}", i + 1));
        param_types.push(column.type_oid);
        param_values.push(value_at(new, column)?);
    }

    Ok(GeneratedStatement {
        text: format!(
            "INSERT INTO {} ({}) VALUES ({})",
            view.relation_name, columns, placeholders
        ),
        param_types,
        param_values,
    })
}

fn rewrite_delete<V: Clone>(
    view: &AnalyzedView,
    mapping: &ColumnMapping,
    old: &RowImage<V>,
) -> Result<GeneratedStatement<V>, RewriteError> {
    let mut param_types = Vec::with_capacity(mapping.len());
    let mut param_values = Vec::with_capacity(mapping.len());
    let predicate = row_predicate(mapping, old, 1, &mut param_types, &mut param_values)?;

    Ok(GeneratedStatement {
        text: format!("DELETE FROM {} WHERE {}", view.relation_name, predicate),
        param_types,
        param_values,
    })
}

fn rewrite_update<V: Clone>(
    view: &AnalyzedView,
    mapping: &ColumnMapping,
    new: &RowImage<V>,
    old: &RowImage<V>,
) -> Result<GeneratedStatement<V>, RewriteError> {
    let mut assignments = String::new();
    let mut param_types = Vec::with_capacity(mapping.len() * 2);
    let mut param_values = Vec::with_capacity(mapping.len() * 2);

    for (i, column) in mapping.iter().enumerate() {
        if i > 0 {
            assignments.push_str(", ");
        }
        assignments.push_str(&format!("{} = ${}", quote_identifier(&column.name), i + 1));
        param_types.push(column.type_oid);
        param_values.push(value_at(new, column)?);
    }

    let predicate = row_predicate(
        mapping,
        old,
        mapping.len() + 1,
        &mut param_types,
        &mut param_values,
    )?;

    Ok(GeneratedStatement {
        text: format!(
            "UPDATE {} SET {} WHERE {}",
            view.relation_name, assignments, predicate
        ),
        param_types,
        param_values,
    })
}

/// NULL-safe full-row match over every mapped column, with placeholders
/// numbered from `first_placeholder`.
fn row_predicate<V: Clone>(
    mapping: &ColumnMapping,
    old: &RowImage<V>,
    first_placeholder: usize,
    param_types: &mut Vec<pg_sys::Oid>,
    param_values: &mut Vec<Option<V>>,
) -> Result<String, RewriteError> {
    let mut predicate = String::new();
    for (i, column) in mapping.iter().enumerate() {
        if i > 0 {
            predicate.push_str(" AND ");
        }
        predicate.push_str(&format!(
            "{} IS NOT DISTINCT FROM ${}",
            quote_identifier(&column.name),
            first_placeholder + i
        ));
        param_types.push(column.type_oid);
        param_values.push(value_at(old, column)?);
    }
    Ok(predicate)
}

/// Quote an identifier for embedding in generated SQL.
pub fn quote_identifier(name: &str) -> String {
    format!("\"{}\"", name.replace('"', "\"\""))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapping::MappedColumn;
    use pgrx::prelude::*;

    fn int4() -> pg_sys::Oid {
        PgOid::BuiltIn(PgBuiltInOids::INT4OID).value()
    }

    fn text() -> pg_sys::Oid {
        PgOid::BuiltIn(PgBuiltInOids::TEXTOID).value()
    }

    fn view() -> AnalyzedView {
        AnalyzedView {
            base_relation: pg_sys::Oid::INVALID,
            relation_name: "t".to_string(),
            table_ref: 0,
        }
    }

    fn xy_mapping() -> ColumnMapping {
        ColumnMapping::new(vec![
            MappedColumn { output_position: 1, name: "x".to_string(), type_oid: int4() },
            MappedColumn { output_position: 2, name: "y".to_string(), type_oid: text() },
        ])
    }

    fn insert_request(slots: Vec<Option<i32>>) -> RewriteRequest<i32> {
        RewriteRequest {
            event: EventKind::Insert,
            new: Some(RowImage::new(slots)),
            old: None,
        }
    }

    #[test]
    fn test_insert_statement_shape() {
        let stmt = rewrite(&view(), &xy_mapping(), &insert_request(vec![Some(5), Some(7)]))
            .unwrap();

        assert_eq!(stmt.text, r#"INSERT INTO t ("x", "y") VALUES ($1, $2)"#);
        assert_eq!(stmt.param_types, vec![int4(), text()]);
        assert_eq!(stmt.param_values, vec![Some(5), Some(7)]);
    }

    #[test]
    fn test_insert_null_slot_stays_null() {
        let stmt = rewrite(&view(), &xy_mapping(), &insert_request(vec![Some(5), None]))
            .unwrap();

        assert_eq!(stmt.param_values, vec![Some(5), None]);
        // The type is still carried for the NULL parameter.
        assert_eq!(stmt.param_types.len(), 2);
    }

    #[test]
    fn test_insert_missing_slot_fails() {
        let err = rewrite(&view(), &xy_mapping(), &insert_request(vec![Some(5)])).unwrap_err();
        assert_eq!(err, RewriteError::MissingColumnValue { position: 2 });
    }

    #[test]
    fn test_insert_requires_new_image() {
        let request = RewriteRequest::<i32> {
            event: EventKind::Insert,
            new: None,
            old: Some(RowImage::new(vec![Some(1), Some(2)])),
        };
        let err = rewrite(&view(), &xy_mapping(), &request).unwrap_err();
        assert_eq!(err, RewriteError::MissingRowImage { event: EventKind::Insert });
    }

    #[test]
    fn test_empty_mapping_is_rejected() {
        let err = rewrite(&view(), &ColumnMapping::new(vec![]), &insert_request(vec![]))
            .unwrap_err();
        assert_eq!(err, RewriteError::EmptyMapping);
    }

    #[test]
    fn test_delete_full_row_predicate() {
        let request = RewriteRequest {
            event: EventKind::Delete,
            new: None,
            old: Some(RowImage::new(vec![Some(5), Some(7)])),
        };

        let stmt = rewrite(&view(), &xy_mapping(), &request).unwrap();

        assert_eq!(
            stmt.text,
            r#"DELETE FROM t WHERE "x" IS NOT DISTINCT FROM $1 AND "y" IS NOT DISTINCT FROM $2"#
        );
        assert_eq!(stmt.param_types, vec![int4(), text()]);
        assert_eq!(stmt.param_values, vec![Some(5), Some(7)]);
    }

    #[test]
    fn test_delete_matches_null_slots() {
        // NULLs in the old image must still match their base row.
        let request = RewriteRequest {
            event: EventKind::Delete,
            new: None,
            old: Some(RowImage::new(vec![Some(5), None])),
        };

        let stmt = rewrite(&view(), &xy_mapping(), &request).unwrap();
        assert!(stmt.text.contains("IS NOT DISTINCT FROM"));
        assert_eq!(stmt.param_values, vec![Some(5), None]);
    }

    #[test]
    fn test_update_sets_then_matches() {
        let request = RewriteRequest {
            event: EventKind::Update,
            new: Some(RowImage::new(vec![Some(6), Some(8)])),
            old: Some(RowImage::new(vec![Some(5), Some(7)])),
        };

        let stmt = rewrite(&view(), &xy_mapping(), &request).unwrap();

        assert_eq!(
            stmt.text,
            r#"UPDATE t SET "x" = $1, "y" = $2 WHERE "x" IS NOT DISTINCT FROM $3 AND "y" IS NOT DISTINCT FROM $4"#
        );
        // New-image params first, then the old-image predicate params.
        assert_eq!(stmt.param_values, vec![Some(6), Some(8), Some(5), Some(7)]);
        assert_eq!(stmt.param_types, vec![int4(), text(), int4(), text()]);
    }

    #[test]
    fn test_update_requires_both_images() {
        let request = RewriteRequest::<i32> {
            event: EventKind::Update,
            new: Some(RowImage::new(vec![Some(6), Some(8)])),
            old: None,
        };
        let err = rewrite(&view(), &xy_mapping(), &request).unwrap_err();
        assert_eq!(err, RewriteError::MissingRowImage { event: EventKind::Update });
    }

    #[test]
    fn test_quote_identifier() {
        assert_eq!(quote_identifier("test_table"), "\"test_table\"");
        assert_eq!(quote_identifier("test-table"), "\"test-table\"");
        // Embedded quotes are doubled.
        assert_eq!(quote_identifier("a\"b"), "\"a\"\"b\"");
    }
}
