//! Lifecycle tasks run against a pooled connection.
//!
//! Each task implements the plain relational behaviour and calls out to a
//! [`TaskHooks`] strategy at the points where spatial bookkeeping belongs.
//! [`NoHooks`] gives the plain behaviour; `SpatialHooks` layers index
//! maintenance on top.

mod insert;
mod purge;
mod retrieve;
mod schema;

use std::sync::Arc;

use rusqlite::{Connection, Transaction};

use crate::error::Result;
use crate::index_cache::IndexChanges;
use crate::model::{Deposit, GroupId, GroupQuery, PropertyDescriptor, PropertyMatcher};
use crate::predicate::PredicateCompiler;
use crate::spatial::{SpatialHooks, SpatialIndexCoordinator};
use crate::sql::{self, quote_ident};

pub use insert::InsertTask;
pub use purge::{DeleteAllTask, PurgeGroupsTask};
pub use retrieve::{RetrieveGroupIdsTask, RetrieveValuesTask};
pub use schema::{EnsureColumnsTask, InitSchemaTask};

/// A unit of work against the cache database
pub trait Task {
    type Output;

    fn name(&self) -> &'static str;

    fn run(&self, conn: &mut Connection) -> Result<Self::Output>;
}

/// Extension points around the relational lifecycle.
///
/// Every method defaults to the plain behaviour, so an implementation only
/// overrides what it adds. Hooks that run inside a task's transaction stage
/// their in-memory effects in `changes`; the task hands them to
/// [`complete`](TaskHooks::complete) once the transaction is over.
pub trait TaskHooks: Send + Sync {
    fn compiler(&self) -> PredicateCompiler {
        PredicateCompiler::generic()
    }

    /// Called once the group table and interval tables exist.
    fn schema_created(&self, _conn: &Connection) -> Result<()> {
        Ok(())
    }

    /// Indexes a freshly created interval table.
    fn index_interval_table(
        &self,
        conn: &Connection,
        table: &str,
        descriptor: &PropertyDescriptor,
        _changes: &mut IndexChanges,
    ) -> Result<()> {
        create_value_index(conn, table, descriptor)
    }

    fn data_table_created(
        &self,
        _conn: &Connection,
        _table: &str,
        _properties: &[PropertyDescriptor],
    ) -> Result<()> {
        Ok(())
    }

    fn data_table_populated(
        &self,
        _conn: &Connection,
        _table: &str,
        _properties: &[PropertyDescriptor],
        _changes: &mut IndexChanges,
    ) -> Result<()> {
        Ok(())
    }

    fn column_added(
        &self,
        _conn: &Connection,
        _table: &str,
        _descriptor: &PropertyDescriptor,
        _changes: &mut IndexChanges,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before a group's data table is dropped.
    fn dropping_table(
        &self,
        _conn: &Connection,
        _table: &str,
        _changes: &mut IndexChanges,
    ) -> Result<()> {
        Ok(())
    }

    /// Called before every group and data table is removed.
    fn deleting_all(&self, _conn: &Connection, _changes: &mut IndexChanges) -> Result<()> {
        Ok(())
    }

    /// Called after the transaction that staged `changes` has committed or
    /// rolled back.
    fn complete(&self, _changes: IndexChanges, _committed: bool) {}

    /// The R*Tree-indexed geometry column of `table`.
    fn indexed_column(&self, _conn: &Connection, _table: &str) -> Result<Option<String>> {
        Ok(None)
    }
}

/// Plain relational behaviour
pub struct NoHooks;

impl TaskHooks for NoHooks {}

/// Runs `work` in one transaction and settles the index changes it staged
/// against the outcome.
fn transact<T, F>(conn: &mut Connection, hooks: &dyn TaskHooks, work: F) -> Result<T>
where
    F: FnOnce(&Transaction<'_>, &mut IndexChanges) -> Result<T>,
{
    let mut changes = IndexChanges::default();
    let result = sql::with_transaction(conn, |tx| work(tx, &mut changes));
    hooks.complete(changes, result.is_ok());
    result
}

/// B-tree index on the value columns of an interval table.
pub(crate) fn create_value_index(
    conn: &Connection,
    table: &str,
    descriptor: &PropertyDescriptor,
) -> Result<()> {
    let columns = sql::interval_columns(descriptor.ty)
        .iter()
        .map(|c| quote_ident(c))
        .collect::<Vec<_>>()
        .join(", ");
    sql::execute_batch(
        conn,
        &format!(
            "CREATE INDEX IF NOT EXISTS {} ON {}({})",
            quote_ident(&format!("{}_VALUE_IDX", table)),
            quote_ident(table),
            columns
        ),
    )
}

/// Produces lifecycle tasks bound to one hooks strategy and one set of
/// group-level interval properties.
#[derive(Clone)]
pub struct TaskFactory {
    hooks: Arc<dyn TaskHooks>,
    intervals: Arc<Vec<PropertyDescriptor>>,
}

impl TaskFactory {
    pub fn new(hooks: Arc<dyn TaskHooks>, intervals: Vec<PropertyDescriptor>) -> Self {
        Self {
            hooks,
            intervals: Arc::new(intervals),
        }
    }

    pub fn generic(intervals: Vec<PropertyDescriptor>) -> Self {
        Self::new(Arc::new(NoHooks), intervals)
    }

    pub fn spatial(
        coordinator: Arc<SpatialIndexCoordinator>,
        intervals: Vec<PropertyDescriptor>,
    ) -> Self {
        Self::new(Arc::new(SpatialHooks::new(coordinator)), intervals)
    }

    pub fn intervals(&self) -> &[PropertyDescriptor] {
        &self.intervals
    }

    pub fn init_schema(&self) -> InitSchemaTask {
        InitSchemaTask::new(self.hooks.clone(), self.intervals.clone())
    }

    pub fn insert(&self, deposit: Deposit) -> InsertTask {
        InsertTask::new(self.hooks.clone(), self.intervals.clone(), deposit)
    }

    pub fn ensure_columns(
        &self,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
    ) -> EnsureColumnsTask {
        EnsureColumnsTask::new(self.hooks.clone(), group_id, properties)
    }

    pub fn purge_groups(&self, group_ids: Vec<GroupId>) -> PurgeGroupsTask {
        PurgeGroupsTask::new(self.hooks.clone(), self.intervals.clone(), group_ids)
    }

    pub fn delete_all(&self) -> DeleteAllTask {
        DeleteAllTask::new(self.hooks.clone(), self.intervals.clone())
    }

    pub fn retrieve_group_ids(&self, query: GroupQuery) -> RetrieveGroupIdsTask {
        RetrieveGroupIdsTask::new(self.hooks.clone(), self.intervals.clone(), query)
    }

    pub fn retrieve_values(
        &self,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
        matchers: Vec<PropertyMatcher>,
    ) -> RetrieveValuesTask {
        RetrieveValuesTask::new(self.hooks.clone(), group_id, properties, matchers)
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use rusqlite::Connection;

    use super::TaskFactory;
    use crate::index_cache::IndexStateCache;
    use crate::model::{PropertyDescriptor, PropertyType};
    use crate::spatial::{functions::test_connection, SpatialIndexCoordinator};

    pub fn intervals() -> Vec<PropertyDescriptor> {
        vec![
            PropertyDescriptor::new("depth", PropertyType::Real),
            PropertyDescriptor::new("valid", PropertyType::TimeSpan),
            PropertyDescriptor::new("extent", PropertyType::Geometry),
        ]
    }

    pub fn spatial_setup() -> (Connection, TaskFactory, Arc<SpatialIndexCoordinator>) {
        let coordinator = Arc::new(SpatialIndexCoordinator::new(Arc::new(IndexStateCache::new())));
        let factory = TaskFactory::spatial(coordinator.clone(), intervals());
        (test_connection(), factory, coordinator)
    }

    pub fn generic_setup() -> (Connection, TaskFactory) {
        (test_connection(), TaskFactory::generic(intervals()))
    }
}
