//! Session Plan Cache
//!
//! Within one statement (and one session) a view's definition cannot
//! change, so the analysis verdict and column mapping are computed once
//! per view and reused for every subsequent row. The cache is backend
//! local: each session owns its own instance, written once per view and
//! read thereafter, so no cross-session coordination exists.
//!
//! There is no automatic invalidation on schema changes;
//! `pg_view_dml_cache_clear()` is the explicit reset.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

use once_cell::sync::Lazy;
use pgrx::pg_sys;

use crate::analyzer::AnalyzedView;
use crate::error::ViewDmlResult;
use crate::mapping::ColumnMapping;

/// Everything the dispatcher needs to rewrite rows for one view.
#[derive(Debug, Clone, PartialEq)]
pub struct CachedView {
    pub analyzed: AnalyzedView,
    pub mapping: ColumnMapping,
}

/// Per-session cache of accepted view plans, keyed by view oid.
#[derive(Debug, Default)]
pub struct SessionCache {
    entries: HashMap<pg_sys::Oid, Arc<CachedView>>,
}

impl SessionCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn clear(&mut self) {
        self.entries.clear();
    }

    /// Return the cached plan for a view, building and storing it on first
    /// use. A failed build caches nothing, so the error recurs on retry.
    pub fn get_or_try_insert(
        &mut self,
        view: pg_sys::Oid,
        build: impl FnOnce() -> ViewDmlResult<CachedView>,
    ) -> ViewDmlResult<Arc<CachedView>> {
        if let Some(cached) = self.entries.get(&view) {
            return Ok(Arc::clone(cached));
        }
        let built = Arc::new(build()?);
        self.entries.insert(view, Arc::clone(&built));
        Ok(built)
    }
}

/// Run `f` against this backend's cache instance.
///
/// The instance lives for the backend's lifetime; callers receive it by
/// reference so the cache's ownership stays here, not inside the
/// dispatcher.
pub fn with_session_cache<T>(f: impl FnOnce(&mut SessionCache) -> T) -> T {
    static CACHE: Lazy<Mutex<SessionCache>> = Lazy::new(|| Mutex::new(SessionCache::new()));

    // A backend is single-threaded; a poisoned lock only means an earlier
    // aborted transaction, and the entries are still structurally valid.
    let mut guard = CACHE.lock().unwrap_or_else(PoisonError::into_inner);
    f(&mut guard)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ViewDmlError;

    fn plan(name: &str) -> CachedView {
        CachedView {
            analyzed: AnalyzedView {
                base_relation: pg_sys::Oid::INVALID,
                relation_name: name.to_string(),
                table_ref: 0,
            },
            mapping: ColumnMapping::new(vec![]),
        }
    }

    #[test]
    fn test_written_once_then_read() {
        let mut cache = SessionCache::new();
        let oid = pg_sys::Oid::INVALID;

        let first = cache.get_or_try_insert(oid, || Ok(plan("t"))).unwrap();
        // The second closure must never run.
        let second = cache
            .get_or_try_insert(oid, || panic!("cache entry rebuilt"))
            .unwrap();

        assert_eq!(first, second);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_failed_build_is_not_cached() {
        let mut cache = SessionCache::new();
        let oid = pg_sys::Oid::INVALID;

        let err = cache.get_or_try_insert(oid, || {
            Err(ViewDmlError::Catalog {
                operation: "lookup".to_string(),
                detail: "gone".to_string(),
            })
        });
        assert!(err.is_err());
        assert!(cache.is_empty());

        // A later successful build still lands.
        assert!(cache.get_or_try_insert(oid, || Ok(plan("t"))).is_ok());
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn test_clear_empties_the_cache() {
        let mut cache = SessionCache::new();
        cache
            .get_or_try_insert(pg_sys::Oid::INVALID, || Ok(plan("t")))
            .unwrap();

        cache.clear();
        assert!(cache.is_empty());
    }
}
