use pgrx::prelude::*;
use pgrx::JsonB;

pub mod analyzer;
mod cache;
mod catalog;
pub mod error;
pub mod mapping;
mod parser;
pub mod rewrite;
pub mod tree;
mod trigger;

pub use error::{ViewDmlError, ViewDmlResult};

pg_module_magic!();

/// Get the version of the pg_view_dml extension
#[pg_extern]
fn pg_view_dml_version() -> &'static str {
    "0.1.0-beta.1"
}

/// Report whether a view is simple enough to accept DML through pg_view_dml
#[pg_extern]
fn pg_view_dml_is_updatable(view: pg_sys::Oid) -> bool {
    match catalog::view_query_tree(view) {
        Ok(tree) => analyzer::analyze(&tree).is_ok(),
        Err(e) => error!("pg_view_dml: {}", e),
    }
}

/// Analyze a view and return the verdict, the reject reason if any, and
/// the column mapping as JSONB
#[pg_extern]
fn pg_view_dml_explain(view: pg_sys::Oid) -> JsonB {
    match explain(view) {
        Ok(value) => JsonB(value),
        Err(e) => error!("pg_view_dml: {}", e),
    }
}

fn explain(view: pg_sys::Oid) -> ViewDmlResult<serde_json::Value> {
    let tree = catalog::view_query_tree(view)?;
    match analyzer::analyze(&tree) {
        Ok(analyzed) => {
            let mapping =
                mapping::build_mapping(&analyzed, &tree, &catalog::PgAttributeResolver)?;
            let columns: Vec<serde_json::Value> = mapping
                .iter()
                .map(|column| {
                    serde_json::json!({
                        "position": column.output_position,
                        "column": column.name,
                        "type_oid": column.type_oid.as_u32(),
                    })
                })
                .collect();
            Ok(serde_json::json!({
                "updatable": true,
                "base_relation": analyzed.relation_name,
                "columns": columns,
            }))
        }
        Err(reason) => Ok(serde_json::json!({
            "updatable": false,
            "reason": serde_json::to_value(reason)?,
            "detail": reason.to_string(),
        })),
    }
}

/// Install the INSTEAD OF router trigger on a view.
/// Fails with the analyzer's reason when the view is not updatable.
#[pg_extern]
fn pg_view_dml_attach(view: pg_sys::Oid) {
    if let Err(e) = attach(view) {
        error!("pg_view_dml: {}", e);
    }
}

fn attach(view: pg_sys::Oid) -> ViewDmlResult<()> {
    let tree = catalog::view_query_tree(view)?;
    analyzer::analyze(&tree)?;

    let view_name = catalog::relation_name(view)?;
    let trigger_sql = format!(
        "CREATE TRIGGER pg_view_dml_router \
         INSTEAD OF INSERT OR UPDATE OR DELETE ON {} \
         FOR EACH ROW \
         EXECUTE FUNCTION view_dml_trigger()",
        view_name
    );

    Spi::run(&trigger_sql).map_err(|e| ViewDmlError::Catalog {
        operation: "create router trigger".to_string(),
        detail: e.to_string(),
    })
}

/// Drop every cached view plan for this session.
/// The escape hatch after DDL on a base table mid-session.
#[pg_extern]
fn pg_view_dml_cache_clear() {
    cache::with_session_cache(|cache| cache.clear());
}

#[cfg(any(test, feature = "pg_test"))]
#[pg_schema]
mod tests {
    use pgrx::prelude::*;
    use pgrx::JsonB;

    fn setup_people() {
        Spi::run("CREATE TABLE people (id int PRIMARY KEY, name text, age int)").unwrap();
        Spi::run("CREATE VIEW people_v AS SELECT id, name FROM people").unwrap();
        Spi::run("SELECT pg_view_dml_attach('people_v'::regclass)").unwrap();
    }

    #[pg_test]
    fn test_version_function() {
        let version = crate::pg_view_dml_version();
        assert!(version.starts_with("0.1.0"));
    }

    #[pg_test]
    fn test_version_callable_from_sql() {
        let result = Spi::get_one::<String>("SELECT pg_view_dml_version()");
        assert!(result.is_ok());
        let version = result.unwrap();
        assert!(version.is_some());
        assert!(version.unwrap().starts_with("0.1.0"));
    }

    #[pg_test]
    fn test_insert_through_view() {
        setup_people();

        Spi::run("INSERT INTO people_v VALUES (1, 'ada')").unwrap();

        // The row landed in the base table; the unprojected column is NULL.
        let count = Spi::get_one::<i64>(
            "SELECT count(*) FROM people WHERE id = 1 AND name = 'ada' AND age IS NULL",
        );
        assert_eq!(count, Ok(Some(1)));
    }

    #[pg_test]
    fn test_insert_null_through_view() {
        setup_people();

        Spi::run("INSERT INTO people_v VALUES (2, NULL)").unwrap();

        let count =
            Spi::get_one::<i64>("SELECT count(*) FROM people WHERE id = 2 AND name IS NULL");
        assert_eq!(count, Ok(Some(1)));
    }

    #[pg_test]
    fn test_multi_row_insert_through_view() {
        setup_people();

        Spi::run("INSERT INTO people_v VALUES (1, 'ada'), (2, 'alan'), (3, 'grace')").unwrap();

        let count = Spi::get_one::<i64>("SELECT count(*) FROM people");
        assert_eq!(count, Ok(Some(3)));
    }

    #[pg_test]
    fn test_delete_through_view() {
        setup_people();
        Spi::run("INSERT INTO people VALUES (1, 'ada', 36), (2, 'alan', 41)").unwrap();

        Spi::run("DELETE FROM people_v WHERE id = 1").unwrap();

        let remaining = Spi::get_one::<i64>("SELECT count(*) FROM people");
        assert_eq!(remaining, Ok(Some(1)));
        let kept = Spi::get_one::<i64>("SELECT count(*) FROM people WHERE id = 2");
        assert_eq!(kept, Ok(Some(1)));
    }

    #[pg_test]
    fn test_delete_matches_null_columns() {
        setup_people();
        Spi::run("INSERT INTO people VALUES (1, NULL, 36)").unwrap();

        Spi::run("DELETE FROM people_v WHERE id = 1").unwrap();

        let remaining = Spi::get_one::<i64>("SELECT count(*) FROM people");
        assert_eq!(remaining, Ok(Some(0)));
    }

    #[pg_test]
    fn test_update_through_view() {
        setup_people();
        Spi::run("INSERT INTO people VALUES (1, 'ada', 36)").unwrap();

        Spi::run("UPDATE people_v SET name = 'lovelace' WHERE id = 1").unwrap();

        // The projected column changed; the unprojected one is untouched.
        let count = Spi::get_one::<i64>(
            "SELECT count(*) FROM people WHERE id = 1 AND name = 'lovelace' AND age = 36",
        );
        assert_eq!(count, Ok(Some(1)));
    }

    #[pg_test]
    fn test_is_updatable_simple_view() {
        Spi::run("CREATE TABLE t (x int, y text)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x, y FROM t").unwrap();

        let updatable =
            Spi::get_one::<bool>("SELECT pg_view_dml_is_updatable('v'::regclass)");
        assert_eq!(updatable, Ok(Some(true)));
    }

    #[pg_test]
    fn test_view_column_aliases_are_irrelevant() {
        Spi::run("CREATE TABLE t (x int, y text)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT y AS second, x AS first FROM t").unwrap();

        let updatable =
            Spi::get_one::<bool>("SELECT pg_view_dml_is_updatable('v'::regclass)");
        assert_eq!(updatable, Ok(Some(true)));

        // The mapping reports base column names, in the view's order.
        let explain = Spi::get_one::<JsonB>("SELECT pg_view_dml_explain('v'::regclass)")
            .unwrap()
            .unwrap();
        let columns = explain.0["columns"].as_array().unwrap().clone();
        assert_eq!(columns[0]["column"], "y");
        assert_eq!(columns[1]["column"], "x");
    }

    #[pg_test]
    fn test_group_by_view_is_rejected() {
        Spi::run("CREATE TABLE t (x int, y text)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x FROM t GROUP BY x").unwrap();

        let updatable =
            Spi::get_one::<bool>("SELECT pg_view_dml_is_updatable('v'::regclass)");
        assert_eq!(updatable, Ok(Some(false)));

        let explain = Spi::get_one::<JsonB>("SELECT pg_view_dml_explain('v'::regclass)")
            .unwrap()
            .unwrap();
        assert_eq!(explain.0["updatable"], false);
        assert!(explain.0["detail"]
            .as_str()
            .unwrap()
            .contains("GROUP BY"));
    }

    #[pg_test]
    fn test_join_view_is_rejected() {
        Spi::run("CREATE TABLE a (x int)").unwrap();
        Spi::run("CREATE TABLE b (y int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT a.x, b.y FROM a JOIN b ON a.x = b.y").unwrap();

        let updatable =
            Spi::get_one::<bool>("SELECT pg_view_dml_is_updatable('v'::regclass)");
        assert_eq!(updatable, Ok(Some(false)));
    }

    #[pg_test]
    fn test_distinct_view_is_rejected() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT DISTINCT x FROM t").unwrap();

        let explain = Spi::get_one::<JsonB>("SELECT pg_view_dml_explain('v'::regclass)")
            .unwrap()
            .unwrap();
        assert_eq!(explain.0["updatable"], false);
        assert!(explain.0["detail"].as_str().unwrap().contains("DISTINCT"));
    }

    #[pg_test]
    fn test_expression_column_is_rejected() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x + 1 AS x2 FROM t").unwrap();

        let explain = Spi::get_one::<JsonB>("SELECT pg_view_dml_explain('v'::regclass)")
            .unwrap()
            .unwrap();
        assert_eq!(explain.0["updatable"], false);
        assert!(explain.0["detail"]
            .as_str()
            .unwrap()
            .contains("not a plain column reference"));
    }

    #[pg_test]
    fn test_duplicate_column_view_is_rejected() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x, x AS x_again FROM t").unwrap();

        let explain = Spi::get_one::<JsonB>("SELECT pg_view_dml_explain('v'::regclass)")
            .unwrap()
            .unwrap();
        assert_eq!(explain.0["updatable"], false);
        assert!(explain.0["detail"]
            .as_str()
            .unwrap()
            .contains("referenced multiple times"));
    }

    #[pg_test]
    fn test_limit_view_is_rejected() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x FROM t LIMIT 10").unwrap();

        let updatable =
            Spi::get_one::<bool>("SELECT pg_view_dml_is_updatable('v'::regclass)");
        assert_eq!(updatable, Ok(Some(false)));
    }

    #[pg_test]
    #[should_panic(expected = "not updatable")]
    fn test_attach_rejects_group_by_view() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("CREATE VIEW v AS SELECT x FROM t GROUP BY x").unwrap();
        Spi::run("SELECT pg_view_dml_attach('v'::regclass)").unwrap();
    }

    #[pg_test]
    #[should_panic(expected = "not a view")]
    fn test_attach_rejects_plain_table() {
        Spi::run("CREATE TABLE t (x int)").unwrap();
        Spi::run("SELECT pg_view_dml_attach('t'::regclass)").unwrap();
    }

    #[pg_test]
    fn test_cache_clear_is_callable() {
        setup_people();
        Spi::run("INSERT INTO people_v VALUES (1, 'ada')").unwrap();

        Spi::run("SELECT pg_view_dml_cache_clear()").unwrap();

        // Next row re-analyzes and still works.
        Spi::run("INSERT INTO people_v VALUES (2, 'alan')").unwrap();
        let count = Spi::get_one::<i64>("SELECT count(*) FROM people");
        assert_eq!(count, Ok(Some(2)));
    }
}

#[cfg(test)]
pub mod pg_test {
    pub fn setup(_options: Vec<&str>) {
        // noop
    }

    #[must_use]
    pub fn postgresql_conf_options() -> Vec<&'static str> {
        vec![]
    }
}
