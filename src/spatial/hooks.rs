use std::sync::Arc;

use rusqlite::Connection;

use super::coordinator::SpatialIndexCoordinator;
use crate::error::Result;
use crate::index_cache::IndexChanges;
use crate::model::PropertyDescriptor;
use crate::predicate::PredicateCompiler;
use crate::tasks::{self, TaskHooks};

/// Task hooks that keep spatial indexes in step with table lifecycle and
/// compile geometry matchers to SQL.
pub struct SpatialHooks {
    coordinator: Arc<SpatialIndexCoordinator>,
}

impl SpatialHooks {
    pub fn new(coordinator: Arc<SpatialIndexCoordinator>) -> Self {
        Self { coordinator }
    }

    fn attach(
        &self,
        conn: &Connection,
        table: &str,
        column: &str,
        changes: &mut IndexChanges,
    ) -> Result<()> {
        if self.coordinator.spatialize(conn, table, column)? {
            self.coordinator.build_index(conn, table, column, changes)?;
        }
        Ok(())
    }
}

impl TaskHooks for SpatialHooks {
    fn compiler(&self) -> PredicateCompiler {
        PredicateCompiler::spatial()
    }

    fn index_interval_table(
        &self,
        conn: &Connection,
        table: &str,
        descriptor: &PropertyDescriptor,
        changes: &mut IndexChanges,
    ) -> Result<()> {
        if descriptor.ty.is_geometry() {
            self.attach(conn, table, "VALUE", changes)
        } else {
            tasks::create_value_index(conn, table, descriptor)
        }
    }

    fn data_table_created(
        &self,
        conn: &Connection,
        table: &str,
        properties: &[PropertyDescriptor],
    ) -> Result<()> {
        if let Some(geometry) = properties.iter().find(|d| d.ty.is_geometry()) {
            self.coordinator.spatialize(conn, table, &geometry.name)?;
        }
        Ok(())
    }

    fn data_table_populated(
        &self,
        conn: &Connection,
        table: &str,
        _properties: &[PropertyDescriptor],
        changes: &mut IndexChanges,
    ) -> Result<()> {
        if let Some(column) = self.coordinator.spatial_column(conn, table)? {
            self.coordinator.build_index(conn, table, &column, changes)?;
        }
        Ok(())
    }

    fn column_added(
        &self,
        conn: &Connection,
        table: &str,
        descriptor: &PropertyDescriptor,
        changes: &mut IndexChanges,
    ) -> Result<()> {
        if descriptor.ty.is_geometry() {
            self.attach(conn, table, &descriptor.name, changes)?;
        }
        Ok(())
    }

    fn dropping_table(
        &self,
        conn: &Connection,
        table: &str,
        changes: &mut IndexChanges,
    ) -> Result<()> {
        self.coordinator.despatialize(conn, table, changes)
    }

    fn deleting_all(&self, conn: &Connection, changes: &mut IndexChanges) -> Result<()> {
        self.coordinator.drop_all(conn, changes)
    }

    fn complete(&self, changes: IndexChanges, committed: bool) {
        self.coordinator.complete(changes, committed);
    }

    fn indexed_column(&self, conn: &Connection, table: &str) -> Result<Option<String>> {
        self.coordinator.spatial_column(conn, table)
    }
}
