use std::sync::Arc;

use rusqlite::types::Value;
use rusqlite::{params_from_iter, Connection, OptionalExtension};

use super::{Task, TaskHooks};
use crate::error::{Error, Result};
use crate::model::{
    now_millis, GroupId, GroupQuery, GroupValues, PropertyDescriptor, PropertyMatcher,
    PropertyValue, Record,
};
use crate::predicate::QueryShape;
use crate::sql::{self, quote_ident};

/// Live group ids matching a category and group-level matchers.
pub struct RetrieveGroupIdsTask {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
    query: GroupQuery,
}

impl RetrieveGroupIdsTask {
    pub(super) fn new(
        hooks: Arc<dyn TaskHooks>,
        intervals: Arc<Vec<PropertyDescriptor>>,
        query: GroupQuery,
    ) -> Self {
        Self {
            hooks,
            intervals,
            query,
        }
    }

    fn interval_value(
        &self,
        conn: &Connection,
        group_id: GroupId,
        property: &str,
    ) -> Result<PropertyValue> {
        let Some(descriptor) = self.intervals.iter().find(|d| d.name == property) else {
            return Ok(PropertyValue::Null);
        };
        let columns = sql::interval_columns(descriptor.ty)
            .iter()
            .map(|c| quote_ident(c))
            .collect::<Vec<_>>()
            .join(", ");
        let sql = format!(
            "SELECT {} FROM {} WHERE GROUP_ID = ?1",
            columns,
            quote_ident(&sql::interval_table(property))
        );
        let value = conn
            .query_row(&sql, [group_id], |row| PropertyValue::read(row, 0, descriptor.ty))
            .optional()
            .map_err(|e| Error::sql(&sql, e))?;
        Ok(value.unwrap_or(PropertyValue::Null))
    }
}

impl Task for RetrieveGroupIdsTask {
    type Output = Vec<GroupId>;

    fn name(&self) -> &'static str {
        "retrieve-group-ids"
    }

    fn run(&self, conn: &mut Connection) -> Result<Vec<GroupId>> {
        let category = &self.query.category;
        let shape = if category.is_any() {
            QueryShape::Intersect
        } else {
            QueryShape::Join
        };
        let compiled = self
            .hooks
            .compiler()
            .compile_group(&self.query.matchers, &self.intervals, shape)?;

        let mut params: Vec<Value> = vec![Value::Integer(now_millis())];
        let mut conditions = vec![
            "\"GROUPS\".\"EXPIRED\" = 0".to_string(),
            "(\"GROUPS\".\"EXPIRATION_TIME\" IS NULL OR \"GROUPS\".\"EXPIRATION_TIME\" > ?1)".to_string(),
        ];
        for (column, value) in [
            ("SOURCE", &category.source),
            ("FAMILY", &category.family),
            ("CATEGORY", &category.category),
        ] {
            if let Some(value) = value {
                params.push(Value::Text(value.clone()));
                conditions.push(format!("\"GROUPS\".{} = ?{}", quote_ident(column), params.len()));
            }
        }

        let joins = match shape {
            QueryShape::Join => compiled.fragments.join(" "),
            QueryShape::Intersect => {
                if !compiled.fragments.is_empty() {
                    conditions.push(format!(
                        "\"GROUPS\".\"GROUP_ID\" IN ({})",
                        compiled.fragments.join(" INTERSECT ")
                    ));
                }
                String::new()
            }
        };

        let sql = format!(
            "SELECT DISTINCT \"GROUPS\".\"GROUP_ID\" FROM \"main\".\"GROUPS\" {} WHERE {} ORDER BY \"GROUPS\".\"GROUP_ID\"",
            joins,
            conditions.join(" AND ")
        );
        let mut stmt = conn.prepare(&sql).map_err(|e| Error::sql(&sql, e))?;
        let ids = stmt
            .query_map(params_from_iter(params), |row| row.get::<_, GroupId>(0))
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::sql(&sql, e))?;
        drop(stmt);

        // Whatever the compiler could not put into SQL is checked here.
        if compiled.deferred.is_empty() {
            return Ok(ids);
        }

        let mut kept = Vec::with_capacity(ids.len());
        'groups: for group_id in ids {
            for matcher in &compiled.deferred {
                let value = self.interval_value(conn, group_id, matcher.property())?;
                if !matcher.accepts(&value) {
                    continue 'groups;
                }
            }
            kept.push(group_id);
        }
        Ok(kept)
    }
}

/// Records of one group, restricted to the requested properties and
/// filtered by record-level matchers.
pub struct RetrieveValuesTask {
    hooks: Arc<dyn TaskHooks>,
    group_id: GroupId,
    properties: Vec<PropertyDescriptor>,
    matchers: Vec<PropertyMatcher>,
}

impl RetrieveValuesTask {
    pub(super) fn new(
        hooks: Arc<dyn TaskHooks>,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
        matchers: Vec<PropertyMatcher>,
    ) -> Self {
        Self {
            hooks,
            group_id,
            properties,
            matchers,
        }
    }
}

impl Task for RetrieveValuesTask {
    /// `None` when the group has no data table
    type Output = Option<GroupValues>;

    fn name(&self) -> &'static str {
        "retrieve-values"
    }

    fn run(&self, conn: &mut Connection) -> Result<Option<GroupValues>> {
        for descriptor in &self.properties {
            descriptor.validate()?;
        }
        let table = sql::data_table(self.group_id);
        if !sql::table_exists(conn, &table)? {
            return Ok(None);
        }

        let present = sql::table_columns(conn, &table)?;
        let indexed = self.hooks.indexed_column(conn, &table)?;
        let compiled = self.hooks.compiler().compile_records(
            &table,
            "T",
            &self.properties,
            &present,
            indexed.as_deref(),
            &self.matchers,
        )?;

        let mut select = vec![format!("\"T\".{}", quote_ident(sql::RECORD_ID))];
        for descriptor in &self.properties {
            for column in descriptor.columns() {
                if present.contains(&column) {
                    select.push(format!("\"T\".{}", quote_ident(&column)));
                } else {
                    select.push("NULL".to_string());
                }
            }
        }
        let mut sql = format!(
            "SELECT {} FROM \"main\".{} AS \"T\"",
            select.join(", "),
            quote_ident(&table)
        );
        if !compiled.fragments.is_empty() {
            sql.push_str(" WHERE ");
            sql.push_str(&compiled.fragments.join(" AND "));
        }
        sql.push_str(" ORDER BY \"T\".\"RECORD_ID\"");

        let mut stmt = conn.prepare(&sql).map_err(|e| Error::sql(&sql, e))?;
        let records = stmt
            .query_map([], |row| {
                let id: i64 = row.get(0)?;
                let mut values = Vec::with_capacity(self.properties.len());
                let mut idx = 1;
                for descriptor in &self.properties {
                    values.push(PropertyValue::read(row, idx, descriptor.ty)?);
                    idx += descriptor.columns().len();
                }
                Ok(Record { id, values })
            })
            .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
            .map_err(|e| Error::sql(&sql, e))?;

        let post: Vec<(usize, &PropertyMatcher)> = compiled
            .deferred
            .iter()
            .filter_map(|m| {
                self.properties
                    .iter()
                    .position(|d| d.name == m.property())
                    .map(|idx| (idx, m))
            })
            .collect();
        let records = records
            .into_iter()
            .filter(|record| post.iter().all(|(idx, m)| m.accepts(&record.values[*idx])))
            .collect();

        Ok(Some(GroupValues {
            group_id: self.group_id,
            records,
        }))
    }
}
