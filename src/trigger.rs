//! Row-Event Dispatcher
//!
//! The INSTEAD OF trigger entry point that makes simple views writable:
//!
//! 1. Validate the invocation context (INSTEAD OF, FOR EACH ROW)
//! 2. Load the view's `QueryTree` and run the updatability analysis,
//!    or reuse the session-cached plan
//! 3. Capture the row image(s) the event carries
//! 4. Rewrite to one parameterized statement against the base table
//! 5. Execute it via SPI with typed parameters
//! 6. Return the row image the caller expects (new for INSERT/UPDATE,
//!    old for DELETE)
//!
//! Every row is handled synchronously inside the firing statement; any
//! failure raises and aborts the enclosing transaction.

use pgrx::datum::DatumWithOid;
use pgrx::prelude::*;
use pgrx::spi;
use pgrx::trigger_support::{PgTriggerLevel, PgTriggerOperation, PgTriggerWhen};
use pgrx::{AnyElement, FromDatum};
use std::num::NonZeroUsize;

use crate::cache::{self, CachedView, SessionCache};
use crate::catalog;
use crate::error::{InvocationError, ViewDmlError, ViewDmlResult};
use crate::mapping;
use crate::rewrite::{self, EventKind, GeneratedStatement, RewriteRequest, RowImage};

/// A datum captured from a trigger tuple, with the type it was stored as.
/// Valid for the duration of the trigger call that produced it.
#[derive(Debug, Clone, Copy)]
pub struct CapturedValue {
    datum: pg_sys::Datum,
    type_oid: pg_sys::Oid,
}

/// Router for row-level DML issued against a view.
/// Attached by `pg_view_dml_attach` as an INSTEAD OF trigger.
#[pg_trigger]
fn view_dml_trigger<'a>(
    trigger: &'a PgTrigger<'a>,
) -> Result<Option<PgHeapTuple<'a, AllocatedByPostgres>>, spi::Error> {
    let event = match validate_context(trigger) {
        Ok(event) => event,
        Err(e) => error!("pg_view_dml: {}", e),
    };

    if let Err(e) = cache::with_session_cache(|cache| dispatch_row_event(trigger, event, cache)) {
        error!("pg_view_dml: {}", e);
    }

    // The caller sees the image it handed us, so the requested change
    // appears to have happened on the view itself.
    match event {
        EventKind::Insert | EventKind::Update => Ok(trigger.new()),
        EventKind::Delete => Ok(trigger.old()),
    }
}

/// Check the trigger fired the only way the router supports.
fn validate_context(trigger: &PgTrigger<'_>) -> ViewDmlResult<EventKind> {
    match trigger
        .when()
        .map_err(|_| InvocationError::NotTrigger)?
    {
        PgTriggerWhen::InsteadOf => {}
        _ => return Err(InvocationError::NotInsteadOf.into()),
    }
    match trigger.level() {
        PgTriggerLevel::Row => {}
        _ => return Err(InvocationError::NotPerRow.into()),
    }
    match trigger.op().map_err(|_| InvocationError::NotTrigger)? {
        PgTriggerOperation::Insert => Ok(EventKind::Insert),
        PgTriggerOperation::Update => Ok(EventKind::Update),
        PgTriggerOperation::Delete => Ok(EventKind::Delete),
        other => Err(InvocationError::UnsupportedEvent {
            event: format!("{:?}", other),
        }
        .into()),
    }
}

/// Analyze (or reuse), rewrite, and execute one row-level event.
fn dispatch_row_event(
    trigger: &PgTrigger<'_>,
    event: EventKind,
    cache: &mut SessionCache,
) -> ViewDmlResult<()> {
    let view = trigger
        .relation()
        .map_err(|_| InvocationError::NotTrigger)?;
    let column_count = view.tuple_desc().len();

    let plan = cache.get_or_try_insert(view.oid(), || {
        let tree = catalog::view_query_tree(view.oid())?;
        let analyzed = crate::analyzer::analyze(&tree)?;
        let mapping = mapping::build_mapping(&analyzed, &tree, &catalog::PgAttributeResolver)?;
        Ok(CachedView { analyzed, mapping })
    })?;

    let new = match trigger.new() {
        Some(tuple) => Some(capture_row_image(&tuple, column_count)?),
        None => None,
    };
    let old = match trigger.old() {
        Some(tuple) => Some(capture_row_image(&tuple, column_count)?),
        None => None,
    };

    let request = RewriteRequest { event, new, old };
    let statement = rewrite::rewrite(&plan.analyzed, &plan.mapping, &request)?;

    pgrx::log!("pg_view_dml: {}", statement.text);
    execute_statement(&statement)
}

/// Read every view column of a trigger tuple, keeping raw datums and
/// their type oids.
fn capture_row_image(
    tuple: &PgHeapTuple<'_, AllocatedByPostgres>,
    column_count: usize,
) -> ViewDmlResult<RowImage<CapturedValue>> {
    let mut slots = Vec::with_capacity(column_count);
    for i in 1..=column_count {
        let Some(attno) = NonZeroUsize::new(i) else {
            continue;
        };
        let value = tuple
            .get_by_index::<AnyElement>(attno)
            .map_err(|e| ViewDmlError::Catalog {
                operation: "read trigger tuple".to_string(),
                detail: e.to_string(),
            })?;
        slots.push(value.map(|element| CapturedValue {
            datum: element.datum(),
            type_oid: element.oid(),
        }));
    }
    Ok(RowImage::new(slots))
}

/// Run the generated statement with its typed parameters.
fn execute_statement(statement: &GeneratedStatement<CapturedValue>) -> ViewDmlResult<()> {
    let mut args = Vec::with_capacity(statement.param_values.len());
    for (&value, type_oid) in statement.param_values.iter().zip(&statement.param_types) {
        // SAFETY: each datum was captured from the firing tuple within
        // this trigger call and carries the type oid it was stored under.
        let element = value.and_then(|captured| unsafe {
            AnyElement::from_polymorphic_datum(captured.datum, false, captured.type_oid)
        });
        args.push(unsafe { DatumWithOid::new(element, *type_oid) });
    }

    Spi::run_with_args(&statement.text, &args).map_err(|e| ViewDmlError::Execution {
        statement: statement.text.clone(),
        error: e.to_string(),
    })
}
