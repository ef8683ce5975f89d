//! Embedded, disk-backed cache for geospatial feature data.
//!
//! Records are stored in groups, one SQLite table per group, with R*Tree
//! indexes kept up to date by triggers on every geometry column that is
//! queried spatially. A size trimmer evicts the oldest non-critical groups
//! when the file outgrows its limit.

pub mod cache;
pub mod config;
pub mod encoding;
pub mod error;
pub mod flock;
pub mod index_cache;
pub mod model;
pub mod pool;
pub mod predicate;
pub mod scheduler;
pub mod spatial;
pub mod sql;
pub mod tasks;
pub mod trim;

pub use cache::FeatureCache;
pub use config::CacheConfig;
pub use error::{Error, Result};
pub use index_cache::{IndexChanges, IndexStateCache};
pub use model::{
    DataModelCategory, Deposit, GroupId, GroupQuery, GroupValues, PropertyDescriptor,
    PropertyMatcher, PropertyType, PropertyValue, Record,
};
pub use pool::PoolSupervisor;
pub use spatial::{SpatialIndexCoordinator, SpatialOperator};
pub use trim::{SizeTrimmer, TrimOutcome};
