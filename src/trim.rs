use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use rusqlite::params_from_iter;

use crate::error::{Error, Result};
use crate::model::GroupId;
use crate::pool::{database_size, PoolSupervisor};
use crate::scheduler::{BackgroundTask, Context};
use crate::sql;
use crate::tasks::{Task, TaskFactory};

/// Victims in eviction order: soonest expiration first, groups that never
/// expire last, newer groups before older ones on ties.
const VICTIM_QUERY: &str = "SELECT GROUP_ID FROM GROUPS WHERE CRITICAL = 0 \
     ORDER BY EXPIRATION_TIME IS NULL, EXPIRATION_TIME ASC, CREATION_TIME DESC, GROUP_ID DESC";

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TrimOutcome {
    /// Another trim held the lock; nothing was done
    Busy,
    /// The size limit is `<= 0`
    Disabled,
    UnderLimit { size: i64 },
    /// Over the limit, but fewer than two non-critical groups exist
    NothingToEvict { size: i64 },
    /// Victims were expired and compacted away
    Trimmed { victims: Vec<GroupId> },
    /// A database error ended the attempt; it was logged
    Failed,
}

enum Expired {
    UnderLimit(i64),
    NothingToEvict(i64),
    Victims(Vec<GroupId>),
}

/// Evicts the oldest non-critical groups when the database outgrows its
/// size limit.
pub struct SizeTrimmer {
    supervisor: Arc<PoolSupervisor>,
    factory: TaskFactory,
    limit: AtomicI64,
    grace: Duration,
    running: Mutex<()>,
}

impl SizeTrimmer {
    pub fn new(supervisor: Arc<PoolSupervisor>, factory: TaskFactory, limit: i64) -> Self {
        let grace = supervisor.config().trim_grace_period;
        Self {
            supervisor,
            factory,
            limit: AtomicI64::new(limit),
            grace,
            running: Mutex::new(()),
        }
    }

    pub fn limit(&self) -> i64 {
        self.limit.load(Ordering::SeqCst)
    }

    pub fn set_limit(&self, limit: i64) {
        self.limit.store(limit, Ordering::SeqCst);
    }

    /// One trim attempt. Never blocks on another attempt and never returns an
    /// error: failures are logged and reported as [`TrimOutcome::Failed`].
    pub fn run_once(&self) -> TrimOutcome {
        let Some(_running) = self.running.try_lock() else {
            tracing::debug!("Trim already in progress, skipping");
            return TrimOutcome::Busy;
        };

        let limit = self.limit();
        if limit <= 0 {
            return TrimOutcome::Disabled;
        }

        let victims = match self.expire_victims(limit) {
            Ok(Expired::Victims(victims)) => victims,
            Ok(Expired::UnderLimit(size)) => return TrimOutcome::UnderLimit { size },
            Ok(Expired::NothingToEvict(size)) => return TrimOutcome::NothingToEvict { size },
            Err(e) => {
                tracing::warn!(error = %e, "Trim failed");
                return TrimOutcome::Failed;
            }
        };
        let purge = self.factory.purge_groups(victims.clone());
        if let Err(e) = self.supervisor.compact(|conn| purge.run(conn).map(|_| ())) {
            let err = Error::Trim(format!("compaction after expiring {} groups: {}", victims.len(), e));
            tracing::warn!(error = %err, "Trim failed");
            return TrimOutcome::Failed;
        }

        tracing::info!(victims = victims.len(), limit, "Trimmed cache");
        TrimOutcome::Trimmed { victims }
    }

    /// Measures the database and, when it exceeds `limit`, marks the first
    /// half of the victim ordering expired and waits out the grace period.
    fn expire_victims(&self, limit: i64) -> Result<Expired> {
        let victims = {
            let mut conn = self
                .supervisor
                .get_connection()
                .map_err(|e| Error::Trim(e.to_string()))?;
            let size = database_size(&conn).map_err(|e| Error::Trim(e.to_string()))?;
            if size <= limit {
                return Ok(Expired::UnderLimit(size));
            }

            let candidates = select_candidates(&conn)?;
            let victims: Vec<GroupId> = candidates[..candidates.len() / 2].to_vec();
            if victims.is_empty() {
                tracing::debug!(size, limit, "Over limit but nothing to evict");
                return Ok(Expired::NothingToEvict(size));
            }

            sql::with_transaction(&mut conn, |tx| {
                let statement = format!(
                    "UPDATE GROUPS SET EXPIRED = 1 WHERE GROUP_ID IN ({})",
                    vec!["?"; victims.len()].join(", ")
                );
                tx.execute(&statement, params_from_iter(&victims))
                    .map_err(|e| Error::sql(&statement, e))?;
                Ok(())
            })
            .map_err(|e| Error::Trim(e.to_string()))?;

            tracing::debug!(size, limit, victims = victims.len(), "Expired trim victims");
            victims
        };

        // Readers already holding the expired groups get to finish.
        if !self.grace.is_zero() {
            std::thread::sleep(self.grace);
        }
        Ok(Expired::Victims(victims))
    }
}

fn select_candidates(conn: &rusqlite::Connection) -> Result<Vec<GroupId>> {
    let mut stmt = conn
        .prepare(VICTIM_QUERY)
        .map_err(|e| Error::Trim(Error::sql(VICTIM_QUERY, e).to_string()))?;
    let ids = stmt
        .query_map([], |row| row.get::<_, GroupId>(0))
        .and_then(|rows| rows.collect::<rusqlite::Result<Vec<_>>>())
        .map_err(|e| Error::Trim(Error::sql(VICTIM_QUERY, e).to_string()))?;
    Ok(ids)
}

/// Scheduled wrapper running [`SizeTrimmer::run_once`] off the async runtime.
pub struct TrimTask {
    trimmer: Arc<SizeTrimmer>,
    interval: Duration,
}

impl TrimTask {
    pub fn new(trimmer: Arc<SizeTrimmer>, interval: Duration) -> Self {
        Self { trimmer, interval }
    }
}

#[async_trait::async_trait]
impl BackgroundTask for TrimTask {
    fn name(&self) -> &'static str {
        "size-trim"
    }

    fn interval(&self) -> Duration {
        self.interval
    }

    async fn execute(&self, ctx: Context) -> Result<()> {
        let trimmer = self.trimmer.clone();
        match tokio::task::spawn_blocking(move || trimmer.run_once()).await {
            Ok(outcome) => {
                tracing::trace!(run_id = ctx.run_id, outcome = ?outcome, "Trim tick");
            }
            Err(e) => {
                tracing::error!(run_id = ctx.run_id, error = %e, "Trim tick panicked");
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CacheConfig;
    use crate::index_cache::IndexStateCache;
    use crate::model::{now_millis, DataModelCategory, Deposit, PropertyDescriptor, PropertyType, PropertyValue};
    use crate::spatial::SpatialIndexCoordinator;
    use std::time::Instant;

    struct Fixture {
        _dir: tempfile::TempDir,
        supervisor: Arc<PoolSupervisor>,
        factory: TaskFactory,
    }

    fn fixture() -> Fixture {
        let dir = tempfile::tempdir().unwrap();
        let config = CacheConfig::new(dir.path().join("cache.db"))
            .max_connections(2)
            .trim_grace_period(Duration::ZERO)
            .connection_timeout(Duration::from_secs(5));
        let supervisor = Arc::new(PoolSupervisor::open(config).unwrap());
        let coordinator = Arc::new(SpatialIndexCoordinator::new(Arc::new(IndexStateCache::new())));
        let factory = TaskFactory::spatial(coordinator, Vec::new());
        {
            let mut conn = supervisor.get_connection().unwrap();
            factory.init_schema().run(&mut conn).unwrap();
        }
        Fixture {
            _dir: dir,
            supervisor,
            factory,
        }
    }

    impl Fixture {
        fn group(&self, name: &str, expiration: Option<i64>, created: i64, critical: bool) -> GroupId {
            let mut deposit = Deposit::new(
                DataModelCategory::new("s", "f", name),
                vec![PropertyDescriptor::new("shape", PropertyType::Geometry)],
            )
            .critical(critical)
            .record(vec![PropertyValue::Geometry(
                crate::spatial::parse_wkt("POINT(1 1)").unwrap(),
            )]);
            if let Some(expiration) = expiration {
                deposit = deposit.expiration(expiration);
            }
            let mut conn = self.supervisor.get_connection().unwrap();
            let id = self.factory.insert(deposit).run(&mut conn).unwrap();
            conn.execute("UPDATE GROUPS SET CREATION_TIME = ?1 WHERE GROUP_ID = ?2", [created, id])
                .unwrap();
            id
        }

        fn remaining(&self) -> Vec<GroupId> {
            let conn = self.supervisor.get_connection().unwrap();
            let mut stmt = conn.prepare("SELECT GROUP_ID FROM GROUPS ORDER BY GROUP_ID").unwrap();
            let ids = stmt
                .query_map([], |row| row.get(0))
                .unwrap()
                .collect::<rusqlite::Result<Vec<_>>>()
                .unwrap();
            ids
        }

        fn candidates(&self) -> Vec<GroupId> {
            let conn = self.supervisor.get_connection().unwrap();
            select_candidates(&conn).unwrap()
        }
    }

    #[test]
    fn test_victim_ordering() {
        let f = fixture();
        let now = now_millis();
        let never_old = f.group("a", None, now - 5000, false);
        let late = f.group("b", Some(now + 7_200_000), now - 4000, false);
        let soon = f.group("c", Some(now + 3_600_000), now - 3000, false);
        let never_new = f.group("d", None, now - 1000, false);
        let soon_newer = f.group("e", Some(now + 3_600_000), now - 2000, false);
        let _critical = f.group("f", Some(now + 1000), now, true);

        assert_eq!(
            f.candidates(),
            vec![soon_newer, soon, late, never_new, never_old]
        );
    }

    #[test]
    fn test_trim_evicts_first_half() {
        let f = fixture();
        let now = now_millis();
        let t1 = f.group("a", Some(now + 1_000_000), now - 3000, false);
        let t2 = f.group("b", Some(now + 2_000_000), now - 2000, false);
        let never = f.group("c", None, now - 1000, false);
        let critical = f.group("d", Some(now + 10), now, true);

        let trimmer = SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), 1);
        assert_eq!(trimmer.run_once(), TrimOutcome::Trimmed { victims: vec![t1] });
        assert_eq!(f.remaining(), vec![t2, never, critical]);
        assert!(!crate::sql::table_exists(
            &f.supervisor.get_connection().unwrap(),
            &crate::sql::data_table(t1)
        )
        .unwrap());
        assert_eq!(f.supervisor.pool_max_size(), 2);
    }

    #[test]
    fn test_under_limit_and_disabled() {
        let f = fixture();
        f.group("a", None, now_millis(), false);

        let trimmer = SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), i64::MAX);
        assert!(matches!(trimmer.run_once(), TrimOutcome::UnderLimit { .. }));

        trimmer.set_limit(0);
        assert_eq!(trimmer.run_once(), TrimOutcome::Disabled);
        assert_eq!(f.remaining().len(), 1);
    }

    #[test]
    fn test_single_candidate_is_nothing_to_evict() {
        let f = fixture();
        let now = now_millis();
        let lone = f.group("a", Some(now + 1_000_000), now, false);
        let critical = f.group("b", Some(now + 1_000_000), now, true);

        let trimmer = SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), 1);
        assert!(matches!(
            trimmer.run_once(),
            TrimOutcome::NothingToEvict { size } if size > 1
        ));
        assert_eq!(f.remaining(), vec![lone, critical]);
    }

    #[test]
    fn test_busy_trimmer_skips_tick() {
        let f = fixture();
        let now = now_millis();
        f.group("a", Some(now + 1000), now, false);
        f.group("b", Some(now + 2000), now, false);

        let trimmer = SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), 1);
        let held = trimmer.running.lock();
        let start = Instant::now();
        assert_eq!(trimmer.run_once(), TrimOutcome::Busy);
        assert!(start.elapsed() < Duration::from_millis(100));
        drop(held);

        assert_eq!(f.remaining().len(), 2);
        let expired: i64 = f
            .supervisor
            .get_connection()
            .unwrap()
            .query_row("SELECT COUNT(*) FROM GROUPS WHERE EXPIRED = 1", [], |row| row.get(0))
            .unwrap();
        assert_eq!(expired, 0);
    }

    #[test]
    fn test_failure_is_swallowed() {
        let f = fixture();
        f.supervisor
            .get_connection()
            .unwrap()
            .execute_batch("DROP TABLE GROUPS")
            .unwrap();
        let trimmer = SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), 1);
        assert_eq!(trimmer.run_once(), TrimOutcome::Failed);
        assert_eq!(trimmer.run_once(), TrimOutcome::Failed);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn test_trim_task_never_errors() {
        let f = fixture();
        let trimmer = Arc::new(SizeTrimmer::new(f.supervisor.clone(), f.factory.clone(), 1));
        let task = TrimTask::new(trimmer, Duration::from_millis(10));
        let (_tx, rx) = tokio::sync::broadcast::channel(1);
        let ctx = Context {
            task_name: task.name(),
            run_id: 1,
            shutdown: rx,
        };
        assert!(task.execute(ctx).await.is_ok());
    }
}
