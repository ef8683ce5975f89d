use std::sync::Arc;

use parking_lot::Mutex;
use rusqlite::params;

use crate::config::CacheConfig;
use crate::error::{Error, Result};
use crate::index_cache::IndexStateCache;
use crate::model::{
    now_millis, Deposit, GroupId, GroupQuery, GroupValues, PropertyDescriptor, PropertyMatcher,
};
use crate::pool::PoolSupervisor;
use crate::scheduler::{Scheduler, TaskId};
use crate::spatial::SpatialIndexCoordinator;
use crate::tasks::{Task, TaskFactory};
use crate::trim::{SizeTrimmer, TrimOutcome, TrimTask};

const EXPIRED_GROUPS: &str = "SELECT GROUP_ID FROM GROUPS \
     WHERE EXPIRED = 1 OR (EXPIRATION_TIME IS NOT NULL AND EXPIRATION_TIME <= ?1) \
     ORDER BY GROUP_ID";

/// Disk-backed feature cache.
///
/// Owns the connection pool, the spatial index bookkeeping and the size
/// trimmer. A positive size limit schedules trimming on the Tokio runtime
/// current at [`FeatureCache::open`].
pub struct FeatureCache {
    supervisor: Arc<PoolSupervisor>,
    coordinator: Arc<SpatialIndexCoordinator>,
    factory: TaskFactory,
    trimmer: Arc<SizeTrimmer>,
    scheduler: Scheduler,
    trim_job: Mutex<Option<TaskId>>,
}

impl FeatureCache {
    pub fn open(config: CacheConfig) -> Result<Self> {
        let limit = config.size_limit_bytes;
        let supervisor = Arc::new(PoolSupervisor::open(config)?);
        let coordinator = Arc::new(SpatialIndexCoordinator::new(Arc::new(IndexStateCache::new())));
        let factory = TaskFactory::spatial(
            coordinator.clone(),
            supervisor.config().interval_properties.clone(),
        );

        {
            let coordinator = coordinator.clone();
            let factory = factory.clone();
            supervisor.set_initializer(move |conn| {
                coordinator.cache().clear();
                factory.init_schema().run(conn)
            });
        }

        let trimmer = Arc::new(SizeTrimmer::new(supervisor.clone(), factory.clone(), limit));
        let cache = Self {
            supervisor,
            coordinator,
            factory,
            trimmer,
            scheduler: Scheduler::new(),
            trim_job: Mutex::new(None),
        };

        cache.run(cache.factory.init_schema())?;
        cache.set_size_limit_bytes(limit)?;
        tracing::info!(
            path = %cache.supervisor.path().display(),
            size_limit_bytes = limit,
            "Feature cache open"
        );
        Ok(cache)
    }

    fn run<T: Task>(&self, task: T) -> Result<T::Output> {
        let mut conn = self.supervisor.get_connection()?;
        tracing::trace!(task = task.name(), "Running task");
        task.run(&mut conn)
    }

    /// Stores a batch of records, creating or extending a group. Returns the
    /// group the records landed in.
    pub fn deposit(&self, deposit: Deposit) -> Result<GroupId> {
        self.run(self.factory.insert(deposit))
    }

    /// Adds the properties missing from a group's data table; returns the
    /// names of the columns added.
    pub fn ensure_columns(
        &self,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
    ) -> Result<Vec<String>> {
        self.run(self.factory.ensure_columns(group_id, properties))
    }

    pub fn query_group_ids(&self, query: GroupQuery) -> Result<Vec<GroupId>> {
        self.run(self.factory.retrieve_group_ids(query))
    }

    /// Records of one group, `None` when the group holds no data.
    pub fn query_values(
        &self,
        group_id: GroupId,
        properties: Vec<PropertyDescriptor>,
        matchers: Vec<PropertyMatcher>,
    ) -> Result<Option<GroupValues>> {
        self.run(self.factory.retrieve_values(group_id, properties, matchers))
    }

    pub fn purge_groups(&self, group_ids: Vec<GroupId>) -> Result<usize> {
        self.run(self.factory.purge_groups(group_ids))
    }

    /// Purges groups flagged expired or past their expiration time.
    pub fn purge_expired(&self) -> Result<usize> {
        let mut conn = self.supervisor.get_connection()?;
        let ids = {
            let mut stmt = conn
                .prepare(EXPIRED_GROUPS)
                .map_err(|e| Error::sql(EXPIRED_GROUPS, e))?;
            let rows = stmt
                .query_map(params![now_millis()], |row| row.get::<_, GroupId>(0))
                .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>());
            rows.map_err(|e| Error::sql(EXPIRED_GROUPS, e))?
        };
        if ids.is_empty() {
            return Ok(0);
        }
        let purged = self.factory.purge_groups(ids).run(&mut conn)?;
        tracing::debug!(purged, "Purged expired groups");
        Ok(purged)
    }

    /// Drops every group and starts over with an empty schema. Group ids
    /// keep increasing across a clear.
    pub fn clear(&self) -> Result<()> {
        let mut conn = self.supervisor.get_connection()?;
        self.factory.delete_all().run(&mut conn)?;
        self.factory.init_schema().run(&mut conn)?;
        tracing::info!("Cleared feature cache");
        Ok(())
    }

    /// Sets the on-disk ceiling. `<= 0` stops scheduled trimming; a positive
    /// value starts it if it is not running.
    pub fn set_size_limit_bytes(&self, limit: i64) -> Result<()> {
        self.trimmer.set_limit(limit);

        let mut job = self.trim_job.lock();
        if limit <= 0 {
            if let Some(id) = job.take() {
                self.scheduler.cancel(id);
                tracing::debug!("Detached trim job");
            }
        } else if job.is_none() {
            let interval = self.supervisor.config().trim_interval;
            let task = Arc::new(TrimTask::new(self.trimmer.clone(), interval));
            *job = Some(self.scheduler.register(task)?);
            tracing::debug!(interval = ?interval, "Attached trim job");
        }
        Ok(())
    }

    pub fn size_limit_bytes(&self) -> i64 {
        self.trimmer.limit()
    }

    pub fn is_trim_scheduled(&self) -> bool {
        self.trim_job.lock().is_some()
    }

    /// One trim attempt on the calling thread.
    pub fn trim_now(&self) -> TrimOutcome {
        self.trimmer.run_once()
    }

    pub fn on_disk_size(&self) -> Result<i64> {
        self.supervisor.on_disk_size()
    }

    /// Purges `group_ids` and reclaims their space with every other
    /// connection held off. Returns the number of groups removed.
    pub fn compact(&self, group_ids: Vec<GroupId>) -> Result<usize> {
        let purge = self.factory.purge_groups(group_ids);
        let mut purged = 0;
        self.supervisor.compact(|conn| {
            purged = purge.run(conn)?;
            Ok(())
        })?;
        Ok(purged)
    }

    pub fn set_max_connections(&self, max: u32) {
        self.supervisor.set_max_connections(max);
    }

    pub fn config(&self) -> &CacheConfig {
        self.supervisor.config()
    }

    /// Index bookkeeping, shared with every spatial task
    pub fn index_state(&self) -> &IndexStateCache {
        self.coordinator.cache()
    }

    /// Stops background work and closes the database.
    pub async fn shutdown(self) -> Result<()> {
        if let Some(id) = self.trim_job.lock().take() {
            self.scheduler.cancel(id);
        }
        self.scheduler.shutdown().await?;
        tracing::info!(path = %self.supervisor.path().display(), "Feature cache closed");
        Ok(())
    }
}
