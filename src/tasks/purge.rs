use std::sync::Arc;

use rusqlite::{params_from_iter, Connection};

use super::{transact, Task, TaskHooks};
use crate::error::{Error, Result};
use crate::model::{GroupId, PropertyDescriptor};
use crate::sql::{self, quote_ident, DATA_PREFIX, INTERVAL_PREFIX};

fn placeholders(n: usize) -> String {
    vec!["?"; n].join(", ")
}

/// Removes groups, their data tables and their interval values.
pub struct PurgeGroupsTask {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
    group_ids: Vec<GroupId>,
}

impl PurgeGroupsTask {
    pub(super) fn new(
        hooks: Arc<dyn TaskHooks>,
        intervals: Arc<Vec<PropertyDescriptor>>,
        group_ids: Vec<GroupId>,
    ) -> Self {
        Self {
            hooks,
            intervals,
            group_ids,
        }
    }
}

impl Task for PurgeGroupsTask {
    type Output = usize;

    fn name(&self) -> &'static str {
        "purge-groups"
    }

    fn run(&self, conn: &mut Connection) -> Result<usize> {
        if self.group_ids.is_empty() {
            return Ok(0);
        }

        transact(conn, self.hooks.as_ref(), |tx, changes| {
            for group_id in &self.group_ids {
                let table = sql::data_table(*group_id);
                if !sql::table_exists(tx, &table)? {
                    continue;
                }
                self.hooks.dropping_table(tx, &table, changes)?;
                sql::execute(tx, &format!("DROP TABLE {}", quote_ident(&table)))?;
            }

            let marks = placeholders(self.group_ids.len());
            for descriptor in self.intervals.iter() {
                let table = sql::interval_table(&descriptor.name);
                if !sql::table_exists(tx, &table)? {
                    continue;
                }
                let sql = format!("DELETE FROM {} WHERE GROUP_ID IN ({})", quote_ident(&table), marks);
                tx.execute(&sql, params_from_iter(&self.group_ids))
                    .map_err(|e| Error::sql(&sql, e))?;
            }

            let sql = format!("DELETE FROM GROUPS WHERE GROUP_ID IN ({})", marks);
            let purged = tx
                .execute(&sql, params_from_iter(&self.group_ids))
                .map_err(|e| Error::sql(&sql, e))?;
            tracing::debug!(requested = self.group_ids.len(), purged, "Purged groups");
            Ok(purged)
        })
    }
}

/// Removes every group and data table. Interval tables are dropped too and
/// are recreated by the next schema init.
pub struct DeleteAllTask {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
}

impl DeleteAllTask {
    pub(super) fn new(hooks: Arc<dyn TaskHooks>, intervals: Arc<Vec<PropertyDescriptor>>) -> Self {
        Self { hooks, intervals }
    }
}

fn owned_tables(conn: &Connection, intervals: &[PropertyDescriptor]) -> Result<Vec<String>> {
    let sql = "SELECT name FROM sqlite_master WHERE type = 'table' AND sql NOT LIKE 'CREATE VIRTUAL TABLE%'";
    let mut stmt = conn.prepare(sql).map_err(|e| Error::sql(sql, e))?;
    let names = stmt
        .query_map([], |row| row.get::<_, String>(0))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| Error::sql(sql, e))?;

    Ok(names
        .into_iter()
        .filter(|name| {
            let data = name
                .strip_prefix(DATA_PREFIX)
                .map(|id| id.parse::<GroupId>().is_ok())
                .unwrap_or(false);
            let interval = name.starts_with(INTERVAL_PREFIX)
                && (intervals
                    .iter()
                    .any(|d| sql::interval_table(&d.name) == *name)
                    || !name.contains("_RTREE"));
            data || interval
        })
        .collect())
}

impl Task for DeleteAllTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "delete-all"
    }

    fn run(&self, conn: &mut Connection) -> Result<()> {
        transact(conn, self.hooks.as_ref(), |tx, changes| {
            self.hooks.deleting_all(tx, changes)?;

            let tables = owned_tables(tx, &self.intervals)?;
            for table in &tables {
                sql::execute(tx, &format!("DROP TABLE IF EXISTS {}", quote_ident(table)))?;
            }
            if sql::table_exists(tx, sql::GROUPS_TABLE)? {
                sql::execute(tx, "DELETE FROM GROUPS")?;
            }
            tracing::info!(tables = tables.len(), "Deleted all groups");
            Ok(())
        })
    }
}
