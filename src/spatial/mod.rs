//! Geometry support: SQL functions, operator mapping, index coordination and
//! the spatial task hooks.

pub mod coordinator;
pub mod functions;
mod hooks;
mod operator;

pub use coordinator::{IndexBuild, SpatialIndexCoordinator};
pub use functions::{envelope, parse_wkt, register, to_wkt};
pub use hooks::SpatialHooks;
pub use operator::{EnginePredicate, SpatialOperator, INTERIOR_INTERSECTS_PATTERN};
