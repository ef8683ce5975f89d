use std::sync::Arc;

use rusqlite::Connection;

use super::{transact, Task, TaskHooks};
use crate::error::{Error, Result};
use crate::index_cache::IndexChanges;
use crate::model::{GroupId, PropertyDescriptor};
use crate::sql::{self, quote_ident, GROUPS_TABLE, GROUP_ID};

/// Creates the group table and one table per interval property.
pub struct InitSchemaTask {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
}

impl InitSchemaTask {
    pub(super) fn new(hooks: Arc<dyn TaskHooks>, intervals: Arc<Vec<PropertyDescriptor>>) -> Self {
        Self { hooks, intervals }
    }
}

impl Task for InitSchemaTask {
    type Output = ();

    fn name(&self) -> &'static str {
        "init-schema"
    }

    fn run(&self, conn: &mut Connection) -> Result<()> {
        for descriptor in self.intervals.iter() {
            descriptor.validate()?;
        }

        transact(conn, self.hooks.as_ref(), |tx, changes| {
            sql::execute_batch(
                tx,
                &format!(
                    "CREATE TABLE IF NOT EXISTS {groups}(
                        {id} INTEGER PRIMARY KEY AUTOINCREMENT,
                        SOURCE TEXT,
                        FAMILY TEXT,
                        CATEGORY TEXT,
                        EXPIRATION_TIME INTEGER,
                        CREATION_TIME INTEGER NOT NULL,
                        CRITICAL INTEGER NOT NULL DEFAULT 0,
                        EXPIRED INTEGER NOT NULL DEFAULT 0
                    );
                    CREATE INDEX IF NOT EXISTS GROUPS_CATEGORY_IDX ON {groups}(SOURCE, FAMILY, CATEGORY);",
                    groups = quote_ident(GROUPS_TABLE),
                    id = quote_ident(GROUP_ID),
                ),
            )?;

            for descriptor in self.intervals.iter() {
                let table = sql::interval_table(&descriptor.name);
                let existed = sql::table_exists(tx, &table)?;
                let value_columns = sql::interval_columns(descriptor.ty)
                    .iter()
                    .map(|c| format!("{} {}", quote_ident(c), descriptor.ty.sql_type()))
                    .collect::<Vec<_>>()
                    .join(", ");
                sql::execute_batch(
                    tx,
                    &format!(
                        "CREATE TABLE IF NOT EXISTS {}({} INTEGER PRIMARY KEY, {})",
                        quote_ident(&table),
                        quote_ident(GROUP_ID),
                        value_columns
                    ),
                )?;
                self.hooks.index_interval_table(tx, &table, descriptor, changes)?;
                if !existed {
                    tracing::debug!(table = %table, ty = ?descriptor.ty, "Created interval table");
                }
            }

            self.hooks.schema_created(tx)
        })
    }
}

/// Adds the properties missing from `table`, calling the column hook for each.
/// Returns the names of the added properties.
pub(super) fn add_missing_columns(
    conn: &Connection,
    hooks: &dyn TaskHooks,
    table: &str,
    properties: &[PropertyDescriptor],
    changes: &mut IndexChanges,
) -> Result<Vec<String>> {
    let existing = sql::table_columns(conn, table)?;
    let mut added = Vec::new();
    for descriptor in properties {
        let columns = descriptor.columns();
        if columns.iter().all(|c| existing.contains(c)) {
            continue;
        }
        for column in columns.iter().filter(|c| !existing.contains(c)) {
            sql::execute(
                conn,
                &format!(
                    "ALTER TABLE {} ADD COLUMN {} {}",
                    quote_ident(table),
                    quote_ident(column),
                    descriptor.ty.sql_type()
                ),
            )?;
        }
        hooks.column_added(conn, table, descriptor, changes)?;
        added.push(descriptor.name.clone());
    }
    Ok(added)
}

/// `CREATE TABLE` statement for a group's data table.
pub(super) fn create_data_table_sql(table: &str, properties: &[PropertyDescriptor]) -> String {
    let mut columns = vec![format!("{} INTEGER PRIMARY KEY", quote_ident(sql::RECORD_ID))];
    for descriptor in properties {
        let ty = descriptor.ty.sql_type();
        for column in descriptor.columns() {
            columns.push(format!("{} {}", quote_ident(&column), ty));
        }
    }
    format!("CREATE TABLE {}({})", quote_ident(table), columns.join(", "))
}

/// Adds new property columns to an existing group's data table.
pub struct EnsureColumnsTask {
    hooks: Arc<dyn TaskHooks>,
    group_id: GroupId,
    properties: Vec<PropertyDescriptor>,
}

impl EnsureColumnsTask {
    pub(super) fn new(
        hooks: Arc<dyn TaskHooks>,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
    ) -> Self {
        Self {
            hooks,
            group_id,
            properties,
        }
    }
}

impl Task for EnsureColumnsTask {
    type Output = Vec<String>;

    fn name(&self) -> &'static str {
        "ensure-columns"
    }

    fn run(&self, conn: &mut Connection) -> Result<Vec<String>> {
        for descriptor in &self.properties {
            descriptor.validate()?;
        }
        let table = sql::data_table(self.group_id);
        transact(conn, self.hooks.as_ref(), |tx, changes| {
            if !sql::table_exists(tx, &table)? {
                return Err(Error::InvalidOperation(format!(
                    "group {} has no data table",
                    self.group_id
                )));
            }
            let added =
                add_missing_columns(tx, self.hooks.as_ref(), &table, &self.properties, changes)?;
            if !added.is_empty() {
                tracing::debug!(group_id = self.group_id, added = ?added, "Added columns");
            }
            Ok(added)
        })
    }
}
