use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use rusqlite::{Connection, OptionalExtension};

use crate::error::{Error, Result};
use crate::index_cache::{IndexChanges, IndexStateCache};
use crate::sql::quote_ident;

pub const SPATIAL_COLUMNS_TABLE: &str = "SPATIAL_COLUMNS";

const INSERT_SUFFIX: &str = "_SPATIAL_INS";
const UPDATE_SUFFIX: &str = "_SPATIAL_UPD";
const DELETE_SUFFIX: &str = "_SPATIAL_DEL";
const RTREE_SUFFIX: &str = "_RTREE";

/// The insert/update/delete maintenance trigger names for `table`.
pub fn trigger_names(table: &str) -> [String; 3] {
    [
        format!("{}{}", table, INSERT_SUFFIX),
        format!("{}{}", table, UPDATE_SUFFIX),
        format!("{}{}", table, DELETE_SUFFIX),
    ]
}

/// The R*Tree support table for `table`.
pub fn rtree_table(table: &str) -> String {
    format!("{}{}", table, RTREE_SUFFIX)
}

/// Outcome of [`SpatialIndexCoordinator::build_index`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IndexBuild {
    /// The in-memory cache already knew the full trigger triple
    CacheHit,
    /// The catalog had the full triple; the cache was refreshed from it
    CatalogHit,
    /// The index was built from scratch
    Built,
}

fn index_error(context: &str, table: &str, err: Error) -> Error {
    Error::SpatialIndex(format!("{} {}: {}", context, table, err))
}

fn run(conn: &Connection, sql: &str) -> Result<()> {
    conn.execute_batch(sql).map_err(|e| Error::sql(sql, e))
}

/// Keeps spatial support structures consistent with table lifecycle.
///
/// The index state cache is consulted first and the engine catalog second,
/// so the common already-indexed case costs one in-memory lookup while a
/// cold cache after restart still avoids duplicate builds.
pub struct SpatialIndexCoordinator {
    cache: Arc<IndexStateCache>,
    builds: AtomicU64,
}

impl SpatialIndexCoordinator {
    pub fn new(cache: Arc<IndexStateCache>) -> Self {
        Self {
            cache,
            builds: AtomicU64::new(0),
        }
    }

    pub fn cache(&self) -> &Arc<IndexStateCache> {
        &self.cache
    }

    /// Number of full index builds performed so far
    pub fn builds(&self) -> u64 {
        self.builds.load(Ordering::Relaxed)
    }

    fn ensure_metadata(conn: &Connection) -> Result<()> {
        run(
            conn,
            &format!(
                "CREATE TABLE IF NOT EXISTS {}(TABLE_NAME TEXT PRIMARY KEY, COLUMN_NAME TEXT NOT NULL)",
                SPATIAL_COLUMNS_TABLE
            ),
        )
    }

    /// The geometry column indexed on `table`, if any.
    pub fn spatial_column(&self, conn: &Connection, table: &str) -> Result<Option<String>> {
        if !crate::sql::table_exists(conn, SPATIAL_COLUMNS_TABLE)? {
            return Ok(None);
        }
        let sql = format!(
            "SELECT COLUMN_NAME FROM {} WHERE TABLE_NAME = ?1",
            SPATIAL_COLUMNS_TABLE
        );
        conn.query_row(&sql, [table], |row| row.get(0))
            .optional()
            .map_err(|e| Error::sql(sql, e))
    }

    /// Registers `column` as the indexed geometry column of `table` and
    /// creates its (empty) support table. Maintenance triggers are left to
    /// [`build_index`](Self::build_index).
    ///
    /// Returns false when the table already indexes a different column.
    pub fn spatialize(&self, conn: &Connection, table: &str, column: &str) -> Result<bool> {
        let attach = || -> Result<bool> {
            Self::ensure_metadata(conn)?;
            match self.spatial_column(conn, table)? {
                Some(existing) if existing != column => {
                    tracing::debug!(
                        table,
                        column,
                        indexed = %existing,
                        "Table already has a spatial column"
                    );
                    return Ok(false);
                }
                Some(_) => {}
                None => {
                    let sql = format!(
                        "INSERT INTO {}(TABLE_NAME, COLUMN_NAME) VALUES (?1, ?2)",
                        SPATIAL_COLUMNS_TABLE
                    );
                    conn.execute(&sql, [table, column])
                        .map_err(|e| Error::sql(sql, e))?;
                }
            }
            run(conn, &create_rtree_sql(table))?;
            Ok(true)
        };
        attach().map_err(|e| index_error("spatialize", table, e))
    }

    /// Makes sure the full trigger triple exists for `table`, building the
    /// index from the current rows only when neither the cache nor the
    /// catalog shows it complete.
    ///
    /// Inside a transaction the names are staged in `changes` and reach the
    /// cache only when the caller completes them after commit. Nothing is
    /// cached for a table whose index drop is in flight.
    pub fn build_index(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
        changes: &mut IndexChanges,
    ) -> Result<IndexBuild> {
        let names = trigger_names(table);
        if self.cache.contains_all(&names) {
            return Ok(IndexBuild::CacheHit);
        }

        let present = self
            .catalog_triggers(conn, table)
            .map_err(|e| index_error("read catalog for", table, e))?;
        if names.iter().all(|name| present.contains(name)) {
            self.record(conn, table, &names, changes);
            tracing::debug!(table, "Spatial index found in catalog");
            return Ok(IndexBuild::CatalogHit);
        }

        // A partial triple counts as absent.
        self.cache.remove_all(&names);
        match self.spatial_column(conn, table) {
            Ok(Some(indexed)) if indexed == column => {}
            Ok(_) => {
                return Err(Error::SpatialIndex(format!(
                    "{}.{} is not spatialized",
                    table, column
                )))
            }
            Err(e) => return Err(index_error("read metadata for", table, e)),
        }

        self.rebuild(conn, table, column)
            .map_err(|e| index_error("build index on", table, e))?;
        self.builds.fetch_add(1, Ordering::Relaxed);
        self.record(conn, table, &names, changes);
        tracing::info!(table, column, "Built spatial index");
        Ok(IndexBuild::Built)
    }

    /// Publishes `names` straight away in autocommit mode, otherwise stages
    /// them until the enclosing transaction commits.
    fn record(
        &self,
        conn: &Connection,
        table: &str,
        names: &[String; 3],
        changes: &mut IndexChanges,
    ) {
        if !conn.is_autocommit() {
            changes.built(table, names.to_vec());
        } else if !self.cache.publish(table, names) {
            tracing::debug!(table, "Index drop in flight, not caching");
        }
    }

    /// Settles the index changes of a finished transaction.
    pub fn complete(&self, changes: IndexChanges, committed: bool) {
        if !changes.is_empty() {
            self.cache.complete(changes, committed);
        }
    }

    /// Detaches the index from `table`. The table is tombstoned and its
    /// trigger names leave the cache before anything is dropped; inside a
    /// transaction the tombstone stays until `changes` is completed.
    pub fn despatialize(
        &self,
        conn: &Connection,
        table: &str,
        changes: &mut IndexChanges,
    ) -> Result<()> {
        let names = trigger_names(table);
        self.cache.begin_drop(table, &names);
        let in_transaction = !conn.is_autocommit();
        if in_transaction {
            changes.dropped(table, names.to_vec());
        }

        let detach = || -> Result<()> {
            for name in &names {
                run(conn, &format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
            }
            run(
                conn,
                &format!("DROP TABLE IF EXISTS {}", quote_ident(&rtree_table(table))),
            )?;
            if crate::sql::table_exists(conn, SPATIAL_COLUMNS_TABLE)? {
                let sql = format!("DELETE FROM {} WHERE TABLE_NAME = ?1", SPATIAL_COLUMNS_TABLE);
                conn.execute(&sql, [table]).map_err(|e| Error::sql(sql, e))?;
            }
            Ok(())
        };
        let result = detach().map_err(|e| index_error("despatialize", table, e));
        if !in_transaction {
            self.cache.end_drop(table, &names);
        }
        result?;
        tracing::debug!(table, "Despatialized table");
        Ok(())
    }

    /// Drops every maintenance trigger and support table in the database.
    pub fn drop_all(&self, conn: &Connection, changes: &mut IndexChanges) -> Result<()> {
        self.cache.begin_drop_all();
        let in_transaction = !conn.is_autocommit();
        if in_transaction {
            changes.dropped_all();
        }

        let drop = || -> Result<usize> {
            let triggers = catalog_names(
                conn,
                "SELECT name FROM sqlite_master WHERE type = 'trigger' AND name LIKE '%\\_SPATIAL\\_%' ESCAPE '\\'",
            )?;
            for name in &triggers {
                run(conn, &format!("DROP TRIGGER IF EXISTS {}", quote_ident(name)))?;
            }
            let tables = catalog_names(
                conn,
                "SELECT name FROM sqlite_master WHERE type = 'table' AND name LIKE '%\\_RTREE' ESCAPE '\\' AND sql LIKE 'CREATE VIRTUAL TABLE%'",
            )?;
            for name in &tables {
                run(conn, &format!("DROP TABLE IF EXISTS {}", quote_ident(name)))?;
            }
            if crate::sql::table_exists(conn, SPATIAL_COLUMNS_TABLE)? {
                run(conn, &format!("DELETE FROM {}", SPATIAL_COLUMNS_TABLE))?;
            }
            Ok(tables.len())
        };
        let result = drop().map_err(|e| Error::SpatialIndex(format!("drop all: {}", e)));
        if !in_transaction {
            self.cache.end_drop_all();
        }
        let dropped = result?;
        tracing::info!(tables = dropped, "Dropped all spatial indexes");
        Ok(())
    }

    fn catalog_triggers(&self, conn: &Connection, table: &str) -> Result<Vec<String>> {
        let sql = "SELECT name FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1";
        let mut stmt = conn.prepare(sql).map_err(|e| Error::sql(sql, e))?;
        let names = stmt
            .query_map([table], |row| row.get::<_, String>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::sql(sql, e))?;
        Ok(names
            .into_iter()
            .filter(|name| name.contains("_SPATIAL_"))
            .collect())
    }

    fn rebuild(&self, conn: &Connection, table: &str, column: &str) -> Result<()> {
        run(conn, "SAVEPOINT spatial_index_build")?;
        match run(conn, &rebuild_sql(table, column)) {
            Ok(()) => run(conn, "RELEASE spatial_index_build"),
            Err(e) => {
                if let Err(rollback) =
                    run(conn, "ROLLBACK TO spatial_index_build; RELEASE spatial_index_build")
                {
                    tracing::warn!(table, error = %rollback, "Failed to roll back index build");
                }
                Err(e)
            }
        }
    }
}

fn catalog_names(conn: &Connection, sql: &str) -> Result<Vec<String>> {
    let mut stmt = conn.prepare(sql).map_err(|e| Error::sql(sql, e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| Error::sql(sql, e))?;
    Ok(names)
}

fn create_rtree_sql(table: &str) -> String {
    format!(
        "CREATE VIRTUAL TABLE IF NOT EXISTS {} USING rtree(id, min_x, max_x, min_y, max_y)",
        quote_ident(&rtree_table(table))
    )
}

fn envelope_exprs(column: &str) -> String {
    format!(
        "ST_MinX({c}), ST_MaxX({c}), ST_MinY({c}), ST_MaxY({c})",
        c = column
    )
}

/// Full rebuild: drop any partial triple, refill the support table from the
/// current rows, then create all three triggers.
fn rebuild_sql(table: &str, column: &str) -> String {
    let [ins, upd, del] = trigger_names(table);
    let t = quote_ident(table);
    let rtree = quote_ident(&rtree_table(table));
    let col = quote_ident(column);
    let new_col = format!("NEW.{}", col);
    format!(
        "DROP TRIGGER IF EXISTS {ins};
         DROP TRIGGER IF EXISTS {upd};
         DROP TRIGGER IF EXISTS {del};
         {create};
         DELETE FROM {rtree};
         INSERT INTO {rtree}(id, min_x, max_x, min_y, max_y)
             SELECT rowid, {env} FROM {t} WHERE ST_MinX({col}) IS NOT NULL;
         CREATE TRIGGER {ins} AFTER INSERT ON {t} WHEN ST_MinX({new_col}) IS NOT NULL BEGIN
             INSERT INTO {rtree}(id, min_x, max_x, min_y, max_y) VALUES (NEW.rowid, {new_env});
         END;
         CREATE TRIGGER {upd} AFTER UPDATE OF {col} ON {t} BEGIN
             DELETE FROM {rtree} WHERE id = OLD.rowid;
             INSERT INTO {rtree}(id, min_x, max_x, min_y, max_y)
                 SELECT NEW.rowid, {new_env} WHERE ST_MinX({new_col}) IS NOT NULL;
         END;
         CREATE TRIGGER {del} AFTER DELETE ON {t} BEGIN
             DELETE FROM {rtree} WHERE id = OLD.rowid;
         END;",
        ins = quote_ident(&ins),
        upd = quote_ident(&upd),
        del = quote_ident(&del),
        create = create_rtree_sql(table),
        rtree = rtree,
        env = envelope_exprs(&col),
        new_env = envelope_exprs(&new_col),
        t = t,
        col = col,
        new_col = new_col,
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::spatial::functions::test_connection;

    fn setup() -> (Connection, SpatialIndexCoordinator) {
        let conn = test_connection();
        conn.execute_batch(
            "CREATE TABLE DATA_1(RECORD_ID INTEGER PRIMARY KEY, shape TEXT, name TEXT);
             INSERT INTO DATA_1(shape, name) VALUES ('POINT(1 1)', 'a'), (NULL, 'b'), ('POINT(5 5)', 'c');",
        )
        .unwrap();
        (conn, SpatialIndexCoordinator::new(Arc::new(IndexStateCache::new())))
    }

    fn build(
        coordinator: &SpatialIndexCoordinator,
        conn: &Connection,
        table: &str,
        column: &str,
    ) -> Result<IndexBuild> {
        coordinator.build_index(conn, table, column, &mut IndexChanges::default())
    }

    fn rtree_count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(
            &format!("SELECT COUNT(*) FROM {}", quote_ident(&rtree_table(table))),
            [],
            |row| row.get(0),
        )
        .unwrap()
    }

    fn trigger_count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(
            "SELECT COUNT(*) FROM sqlite_master WHERE type = 'trigger' AND tbl_name = ?1",
            [table],
            |row| row.get(0),
        )
        .unwrap()
    }

    #[test]
    fn test_build_index_is_idempotent() {
        let (conn, coordinator) = setup();
        assert!(coordinator.spatialize(&conn, "DATA_1", "shape").unwrap());

        assert_eq!(
            build(&coordinator, &conn, "DATA_1", "shape").unwrap(),
            IndexBuild::Built
        );
        assert_eq!(
            build(&coordinator, &conn, "DATA_1", "shape").unwrap(),
            IndexBuild::CacheHit
        );
        assert_eq!(coordinator.builds(), 1);
        assert_eq!(rtree_count(&conn, "DATA_1"), 2);
        assert_eq!(trigger_count(&conn, "DATA_1"), 3);
    }

    #[test]
    fn test_cold_cache_uses_catalog() {
        let (conn, coordinator) = setup();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        build(&coordinator, &conn, "DATA_1", "shape").unwrap();

        coordinator.cache().clear();
        assert_eq!(
            build(&coordinator, &conn, "DATA_1", "shape").unwrap(),
            IndexBuild::CatalogHit
        );
        assert_eq!(coordinator.builds(), 1);
        assert!(coordinator.cache().contains_all(&trigger_names("DATA_1")));
    }

    #[test]
    fn test_partial_triple_is_rebuilt() {
        let (conn, coordinator) = setup();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        build(&coordinator, &conn, "DATA_1", "shape").unwrap();

        conn.execute_batch("DROP TRIGGER \"DATA_1_SPATIAL_UPD\"").unwrap();
        coordinator.cache().clear();

        assert_eq!(
            build(&coordinator, &conn, "DATA_1", "shape").unwrap(),
            IndexBuild::Built
        );
        assert_eq!(trigger_count(&conn, "DATA_1"), 3);
        assert_eq!(coordinator.builds(), 2);
    }

    #[test]
    fn test_triggers_maintain_index() {
        let (conn, coordinator) = setup();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        build(&coordinator, &conn, "DATA_1", "shape").unwrap();

        conn.execute_batch("INSERT INTO DATA_1(shape) VALUES ('POINT(9 9)')")
            .unwrap();
        assert_eq!(rtree_count(&conn, "DATA_1"), 3);

        conn.execute_batch("UPDATE DATA_1 SET shape = NULL WHERE name = 'a'")
            .unwrap();
        assert_eq!(rtree_count(&conn, "DATA_1"), 2);

        conn.execute_batch("UPDATE DATA_1 SET shape = 'POINT(2 2)' WHERE name = 'b'")
            .unwrap();
        assert_eq!(rtree_count(&conn, "DATA_1"), 3);

        conn.execute_batch("DELETE FROM DATA_1 WHERE name = 'c'").unwrap();
        assert_eq!(rtree_count(&conn, "DATA_1"), 2);
    }

    #[test]
    fn test_one_indexed_column_per_table() {
        let (conn, coordinator) = setup();
        assert!(coordinator.spatialize(&conn, "DATA_1", "shape").unwrap());
        assert!(!coordinator.spatialize(&conn, "DATA_1", "name").unwrap());
        assert!(build(&coordinator, &conn, "DATA_1", "name").is_err());
        assert_eq!(
            coordinator.spatial_column(&conn, "DATA_1").unwrap().as_deref(),
            Some("shape")
        );
    }

    #[test]
    fn test_despatialize_clears_cache_before_drop() {
        let (conn, coordinator) = setup();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        build(&coordinator, &conn, "DATA_1", "shape").unwrap();

        conn.execute_batch("PRAGMA query_only = ON").unwrap();
        let result = coordinator.despatialize(&conn, "DATA_1", &mut IndexChanges::default());
        assert!(matches!(result, Err(Error::SpatialIndex(_))));
        assert!(coordinator.cache().is_empty());
        assert_eq!(trigger_count(&conn, "DATA_1"), 3);

        conn.execute_batch("PRAGMA query_only = OFF").unwrap();
        coordinator.despatialize(&conn, "DATA_1", &mut IndexChanges::default()).unwrap();
        assert_eq!(trigger_count(&conn, "DATA_1"), 0);
        assert!(!crate::sql::table_exists(&conn, "DATA_1_RTREE").unwrap());
        assert_eq!(coordinator.spatial_column(&conn, "DATA_1").unwrap(), None);
    }

    #[test]
    fn test_build_in_transaction_waits_for_commit() {
        let (conn, coordinator) = setup();

        let mut changes = IndexChanges::default();
        conn.execute_batch("BEGIN").unwrap();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        assert_eq!(
            coordinator.build_index(&conn, "DATA_1", "shape", &mut changes).unwrap(),
            IndexBuild::Built
        );
        assert!(coordinator.cache().is_empty());
        conn.execute_batch("ROLLBACK").unwrap();
        coordinator.complete(changes, false);
        assert!(coordinator.cache().is_empty());
        assert_eq!(trigger_count(&conn, "DATA_1"), 0);

        let mut changes = IndexChanges::default();
        conn.execute_batch("BEGIN").unwrap();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        assert_eq!(
            coordinator.build_index(&conn, "DATA_1", "shape", &mut changes).unwrap(),
            IndexBuild::Built
        );
        conn.execute_batch("COMMIT").unwrap();
        coordinator.complete(changes, true);
        assert!(coordinator.cache().contains_all(&trigger_names("DATA_1")));
        assert_eq!(trigger_count(&conn, "DATA_1"), 3);
        assert_eq!(rtree_count(&conn, "DATA_1"), 2);
    }

    fn file_connection(path: &std::path::Path) -> Connection {
        let conn = Connection::open(path).unwrap();
        conn.busy_timeout(std::time::Duration::from_secs(5)).unwrap();
        conn.query_row("PRAGMA journal_mode = WAL", [], |row| row.get::<_, String>(0))
            .unwrap();
        crate::spatial::functions::register(&conn).unwrap();
        conn
    }

    fn shared_setup(dir: &tempfile::TempDir) -> (Connection, Connection, SpatialIndexCoordinator) {
        let path = dir.path().join("cache.db");
        let writer = file_connection(&path);
        writer
            .execute_batch(
                "CREATE TABLE DATA_1(RECORD_ID INTEGER PRIMARY KEY, shape TEXT);
                 INSERT INTO DATA_1(shape) VALUES ('POINT(1 1)');",
            )
            .unwrap();
        let coordinator = SpatialIndexCoordinator::new(Arc::new(IndexStateCache::new()));
        coordinator.spatialize(&writer, "DATA_1", "shape").unwrap();
        build(&coordinator, &writer, "DATA_1", "shape").unwrap();
        (writer, file_connection(&path), coordinator)
    }

    #[test]
    fn test_build_during_uncommitted_drop_is_not_cached() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader, coordinator) = shared_setup(&dir);

        let mut changes = IndexChanges::default();
        writer.execute_batch("BEGIN").unwrap();
        coordinator.despatialize(&writer, "DATA_1", &mut changes).unwrap();

        // The reader still sees the committed triggers.
        assert_eq!(trigger_count(&reader, "DATA_1"), 3);
        assert_eq!(
            build(&coordinator, &reader, "DATA_1", "shape").unwrap(),
            IndexBuild::CatalogHit
        );
        assert!(coordinator.cache().is_empty());

        writer.execute_batch("DROP TABLE DATA_1; COMMIT").unwrap();
        coordinator.complete(changes, true);

        assert!(!coordinator.cache().is_dropping("DATA_1"));
        assert!(coordinator.cache().is_empty());
        assert_eq!(trigger_count(&reader, "DATA_1"), 0);
        assert!(build(&coordinator, &reader, "DATA_1", "shape").is_err());
        assert!(coordinator.cache().is_empty());
    }

    #[test]
    fn test_rolled_back_drop_lifts_tombstone() {
        let dir = tempfile::tempdir().unwrap();
        let (writer, reader, coordinator) = shared_setup(&dir);

        let mut changes = IndexChanges::default();
        writer.execute_batch("BEGIN").unwrap();
        coordinator.despatialize(&writer, "DATA_1", &mut changes).unwrap();
        build(&coordinator, &reader, "DATA_1", "shape").unwrap();
        assert!(coordinator.cache().is_empty());
        writer.execute_batch("ROLLBACK").unwrap();
        coordinator.complete(changes, false);

        assert_eq!(
            build(&coordinator, &reader, "DATA_1", "shape").unwrap(),
            IndexBuild::CatalogHit
        );
        assert!(coordinator.cache().contains_all(&trigger_names("DATA_1")));
        assert_eq!(coordinator.builds(), 1);
    }

    #[test]
    fn test_drop_all() {
        let (conn, coordinator) = setup();
        conn.execute_batch("CREATE TABLE DATA_2(RECORD_ID INTEGER PRIMARY KEY, area TEXT)")
            .unwrap();
        coordinator.spatialize(&conn, "DATA_1", "shape").unwrap();
        build(&coordinator, &conn, "DATA_1", "shape").unwrap();
        coordinator.spatialize(&conn, "DATA_2", "area").unwrap();
        build(&coordinator, &conn, "DATA_2", "area").unwrap();

        coordinator.drop_all(&conn, &mut IndexChanges::default()).unwrap();
        assert!(coordinator.cache().is_empty());
        assert_eq!(trigger_count(&conn, "DATA_1"), 0);
        assert_eq!(trigger_count(&conn, "DATA_2"), 0);
        assert!(!crate::sql::table_exists(&conn, "DATA_1_RTREE").unwrap());
        assert!(!crate::sql::table_exists(&conn, "DATA_2_RTREE").unwrap());
    }
}
