use pgrx::pg_sys;

/// A view definition reduced to the parts that matter for updatability.
///
/// Built by the definition provider (`catalog` + `parser`) from the stored
/// view query. Clause flags record presence only: any of them disqualifies
/// the view, so nothing more than presence needs to survive the walk.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct QueryTree {
    pub distinct: bool,
    pub group_by: bool,
    pub having: bool,
    pub set_operation: bool,
    pub limit: bool,
    pub offset: bool,
    /// FROM-clause entries, in syntactic order.
    pub from_items: Vec<FromItem>,
    /// Referenced relations, indexed by `FromItem::TableRef`.
    pub table_references: Vec<TableReference>,
    /// Output columns in result-position order (positions are 1-based).
    pub output_columns: Vec<OutputColumn>,
}

/// One FROM-clause entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FromItem {
    /// Direct reference into `table_references`.
    TableRef(usize),
    /// Join, subquery, function call... — never updatable.
    Other(&'static str),
}

/// One entry in the table-reference list.
#[derive(Debug, Clone, PartialEq)]
pub enum TableReference {
    /// A plain base relation.
    Relation {
        oid: pg_sys::Oid,
        /// Qualified, quoted name, ready to embed in generated SQL.
        name: String,
    },
    /// Anything without its own storage: view, foreign table, ...
    Other(&'static str),
}

/// One output column of the view.
#[derive(Debug, Clone, PartialEq)]
pub struct OutputColumn {
    /// 1-based result position, matching the view's column order.
    pub position: u32,
    pub expr: OutputExpr,
}

/// The expression behind an output column.
#[derive(Debug, Clone, PartialEq)]
pub enum OutputExpr {
    /// A plain column reference into `table_references`. `attribute` is the
    /// base relation's attribute number; 0 encodes a whole-row reference.
    ColumnRef { table_ref: usize, attribute: i16 },
    /// Anything else, with a short description for diagnostics.
    Other(String),
}
