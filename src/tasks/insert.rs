use std::sync::Arc;

use rusqlite::{params, params_from_iter, Connection, OptionalExtension};

use super::schema::{add_missing_columns, create_data_table_sql};
use super::{transact, Task, TaskHooks};
use crate::error::{Error, Result};
use crate::model::{now_millis, DataModelCategory, Deposit, GroupId, PropertyDescriptor};
use crate::sql::{self, quote_ident};

/// Stores a deposit, reusing the live group of the same category when there
/// is one.
pub struct InsertTask {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
    deposit: Deposit,
}

impl InsertTask {
    pub(super) fn new(
        hooks: Arc<dyn TaskHooks>,
        intervals: Arc<Vec<PropertyDescriptor>>,
        deposit: Deposit,
    ) -> Self {
        Self {
            hooks,
            intervals,
            deposit,
        }
    }

    fn validate(&self) -> Result<()> {
        self.deposit.validate()?;
        for (name, value) in &self.deposit.interval_values {
            let descriptor = self
                .intervals
                .iter()
                .find(|d| &d.name == name)
                .ok_or_else(|| {
                    Error::InvalidOperation(format!("{} is not a group interval property", name))
                })?;
            if !value.fits(descriptor.ty) {
                return Err(Error::InvalidOperation(format!(
                    "interval value for {} is not a {:?}",
                    name, descriptor.ty
                )));
            }
        }
        Ok(())
    }
}

fn live_group(conn: &Connection, category: &DataModelCategory) -> Result<Option<GroupId>> {
    let sql = "SELECT GROUP_ID FROM GROUPS \
               WHERE SOURCE IS ?1 AND FAMILY IS ?2 AND CATEGORY IS ?3 AND EXPIRED = 0 \
               AND (EXPIRATION_TIME IS NULL OR EXPIRATION_TIME > ?4) \
               ORDER BY GROUP_ID DESC LIMIT 1";
    conn.query_row(
        sql,
        params![category.source, category.family, category.category, now_millis()],
        |row| row.get(0),
    )
    .optional()
    .map_err(|e| Error::sql(sql, e))
}

fn create_group(conn: &Connection, deposit: &Deposit) -> Result<GroupId> {
    let sql = "INSERT INTO GROUPS(SOURCE, FAMILY, CATEGORY, EXPIRATION_TIME, CREATION_TIME, CRITICAL, EXPIRED) \
               VALUES (?1, ?2, ?3, ?4, ?5, ?6, 0)";
    conn.execute(
        sql,
        params![
            deposit.category.source,
            deposit.category.family,
            deposit.category.category,
            deposit.expiration,
            now_millis(),
            deposit.critical
        ],
    )
    .map_err(|e| Error::sql(sql, e))?;
    Ok(conn.last_insert_rowid())
}

fn populate(conn: &Connection, table: &str, deposit: &Deposit) -> Result<usize> {
    if deposit.records.is_empty() {
        return Ok(0);
    }
    let columns: Vec<String> = deposit
        .properties
        .iter()
        .flat_map(|d| d.columns())
        .collect();
    let placeholders = vec!["?"; columns.len()].join(", ");
    let sql = format!(
        "INSERT INTO {}({}) VALUES ({})",
        quote_ident(table),
        columns
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", "),
        placeholders
    );
    let mut stmt = conn.prepare_cached(&sql).map_err(|e| Error::sql(&sql, e))?;
    for record in &deposit.records {
        let mut values = Vec::with_capacity(columns.len());
        for (value, descriptor) in record.iter().zip(&deposit.properties) {
            values.extend(value.to_sql(descriptor.ty)?);
        }
        stmt.execute(params_from_iter(values))
            .map_err(|e| Error::sql(&sql, e))?;
    }
    Ok(deposit.records.len())
}

fn write_interval_values(
    conn: &Connection,
    intervals: &[PropertyDescriptor],
    group_id: GroupId,
    deposit: &Deposit,
) -> Result<()> {
    for (name, value) in &deposit.interval_values {
        let Some(descriptor) = intervals.iter().find(|d| &d.name == name) else {
            continue;
        };
        let columns = sql::interval_columns(descriptor.ty);
        let quoted: Vec<String> = columns.iter().map(|c| quote_ident(c)).collect();
        let updates = quoted
            .iter()
            .map(|c| format!("{c} = excluded.{c}"))
            .collect::<Vec<_>>()
            .join(", ");
        // Upsert so an existing row is updated in place and update triggers fire.
        let sql = format!(
            "INSERT INTO {}(GROUP_ID, {}) VALUES (?{}) ON CONFLICT(GROUP_ID) DO UPDATE SET {}",
            quote_ident(&sql::interval_table(name)),
            quoted.join(", "),
            ", ?".repeat(columns.len()),
            updates
        );
        let mut values = vec![rusqlite::types::Value::Integer(group_id)];
        values.extend(value.to_sql(descriptor.ty)?);
        conn.execute(&sql, params_from_iter(values))
            .map_err(|e| Error::sql(&sql, e))?;
    }
    Ok(())
}

impl Task for InsertTask {
    type Output = GroupId;

    fn name(&self) -> &'static str {
        "insert"
    }

    fn run(&self, conn: &mut Connection) -> Result<GroupId> {
        self.validate()?;
        let deposit = &self.deposit;

        transact(conn, self.hooks.as_ref(), |tx, changes| {
            let (group_id, table) = match live_group(tx, &deposit.category)? {
                Some(group_id) => {
                    let table = sql::data_table(group_id);
                    if sql::table_exists(tx, &table)? {
                        add_missing_columns(
                            tx,
                            self.hooks.as_ref(),
                            &table,
                            &deposit.properties,
                            changes,
                        )?;
                    } else {
                        sql::execute(tx, &create_data_table_sql(&table, &deposit.properties))?;
                        self.hooks.data_table_created(tx, &table, &deposit.properties)?;
                    }
                    let sql = "UPDATE GROUPS SET EXPIRATION_TIME = ?1, CRITICAL = ?2 WHERE GROUP_ID = ?3";
                    tx.execute(sql, params![deposit.expiration, deposit.critical, group_id])
                        .map_err(|e| Error::sql(sql, e))?;
                    (group_id, table)
                }
                None => {
                    let group_id = create_group(tx, deposit)?;
                    let table = sql::data_table(group_id);
                    sql::execute(tx, &create_data_table_sql(&table, &deposit.properties))?;
                    self.hooks.data_table_created(tx, &table, &deposit.properties)?;
                    (group_id, table)
                }
            };

            let rows = populate(tx, &table, deposit)?;
            self.hooks
                .data_table_populated(tx, &table, &deposit.properties, changes)?;
            write_interval_values(tx, &self.intervals, group_id, deposit)?;

            tracing::debug!(group_id, rows, "Stored deposit");
            Ok(group_id)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{PropertyType, PropertyValue};
    use crate::spatial::coordinator::{rtree_table, trigger_names};
    use crate::spatial::parse_wkt;
    use crate::tasks::test_support::{generic_setup, spatial_setup};

    fn properties() -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::new("name", PropertyType::Text),
            PropertyDescriptor::new("shape", PropertyType::Geometry),
        ]
    }

    fn geometry(wkt: &str) -> PropertyValue {
        PropertyValue::Geometry(parse_wkt(wkt).unwrap())
    }

    fn count(conn: &Connection, table: &str) -> i64 {
        conn.query_row(&format!("SELECT COUNT(*) FROM {}", quote_ident(table)), [], |row| {
            row.get(0)
        })
        .unwrap()
    }

    #[test]
    fn test_insert_builds_index_after_population() {
        let (mut conn, factory, coordinator) = spatial_setup();
        factory.init_schema().run(&mut conn).unwrap();
        let builds_before = coordinator.builds();

        let deposit = Deposit::new(DataModelCategory::new("radar", "weather", "storm"), properties())
            .record(vec![PropertyValue::Text("a".into()), geometry("POINT(1 1)")])
            .record(vec![PropertyValue::Text("b".into()), PropertyValue::Null])
            .record(vec![PropertyValue::Text("c".into()), geometry("LINESTRING(0 0, 2 2)")]);
        let group_id = factory.insert(deposit).run(&mut conn).unwrap();

        let table = sql::data_table(group_id);
        assert_eq!(count(&conn, &table), 3);
        assert_eq!(count(&conn, &rtree_table(&table)), 2);
        assert!(coordinator.cache().contains_all(&trigger_names(&table)));
        assert_eq!(coordinator.builds(), builds_before + 1);
    }

    #[test]
    fn test_deposit_reuses_live_group() {
        let (mut conn, factory, coordinator) = spatial_setup();
        factory.init_schema().run(&mut conn).unwrap();
        let category = DataModelCategory::new("radar", "weather", "storm");

        let first = factory
            .insert(
                Deposit::new(category.clone(), properties())
                    .record(vec![PropertyValue::Text("a".into()), geometry("POINT(1 1)")]),
            )
            .run(&mut conn)
            .unwrap();
        let builds = coordinator.builds();

        let mut more = properties();
        more.push(PropertyDescriptor::new("depth", PropertyType::Real));
        let second = factory
            .insert(Deposit::new(category, more).record(vec![
                PropertyValue::Text("b".into()),
                geometry("POINT(3 3)"),
                PropertyValue::Real(2.0),
            ]))
            .run(&mut conn)
            .unwrap();

        assert_eq!(first, second);
        let table = sql::data_table(first);
        assert_eq!(count(&conn, &table), 2);
        assert_eq!(count(&conn, &rtree_table(&table)), 2);
        assert_eq!(coordinator.builds(), builds);

        let other = factory
            .insert(Deposit::new(DataModelCategory::new("radar", "weather", "hail"), properties()))
            .run(&mut conn)
            .unwrap();
        assert_ne!(other, first);
    }

    #[test]
    fn test_expired_group_is_not_reused() {
        let (mut conn, factory) = generic_setup();
        factory.init_schema().run(&mut conn).unwrap();
        let category = DataModelCategory::new("s", "f", "c");

        let first = factory
            .insert(Deposit::new(category.clone(), properties()).expiration(now_millis() - 1000))
            .run(&mut conn)
            .unwrap();
        let second = factory
            .insert(Deposit::new(category, properties()))
            .run(&mut conn)
            .unwrap();
        assert!(second > first);
    }

    #[test]
    fn test_interval_values_are_upserted() {
        let (mut conn, factory) = generic_setup();
        factory.init_schema().run(&mut conn).unwrap();
        let category = DataModelCategory::new("s", "f", "c");

        let group_id = factory
            .insert(
                Deposit::new(category.clone(), properties())
                    .interval_value("depth", PropertyValue::Real(1.0))
                    .interval_value("valid", PropertyValue::TimeSpan { start: 10, end: 20 }),
            )
            .run(&mut conn)
            .unwrap();
        factory
            .insert(Deposit::new(category, properties()).interval_value("depth", PropertyValue::Real(4.0)))
            .run(&mut conn)
            .unwrap();

        let depth: f64 = conn
            .query_row("SELECT VALUE FROM INTERVAL_depth WHERE GROUP_ID = ?1", [group_id], |row| {
                row.get(0)
            })
            .unwrap();
        assert_eq!(depth, 4.0);
        let span: (i64, i64) = conn
            .query_row(
                "SELECT VALUE_START, VALUE_END FROM INTERVAL_valid WHERE GROUP_ID = ?1",
                [group_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )
            .unwrap();
        assert_eq!(span, (10, 20));
    }

    #[test]
    fn test_rejects_unknown_interval_property() {
        let (mut conn, factory) = generic_setup();
        factory.init_schema().run(&mut conn).unwrap();
        let result = factory
            .insert(
                Deposit::new(DataModelCategory::any(), properties())
                    .interval_value("missing", PropertyValue::Integer(1)),
            )
            .run(&mut conn);
        assert!(matches!(result, Err(Error::InvalidOperation(_))));
        assert_eq!(count(&conn, "GROUPS"), 0);
    }
}
