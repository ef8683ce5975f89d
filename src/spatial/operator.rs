use geo::{Geometry, Relate};

/// DE-9IM pattern for "interiors intersect", i.e. intersection without
/// counting a shared boundary as a hit.
pub const INTERIOR_INTERSECTS_PATTERN: &str = "T********";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SpatialOperator {
    Intersects,
    /// Intersects, excluding geometries that only touch at the boundary
    IntersectsNoTouch,
    Contains,
    Within,
    Touches,
    Overlaps,
    Crosses,
    Disjoint,
    Equals,
    Covers,
    CoveredBy,
}

/// How an operator is expressed to the engine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnginePredicate {
    /// A named two-argument SQL function
    Named(&'static str),
    /// `ST_Relate(a, b, pattern)` with a raw intersection-matrix pattern
    Pattern(&'static str),
}

impl SpatialOperator {
    pub const ALL: [SpatialOperator; 11] = [
        SpatialOperator::Intersects,
        SpatialOperator::IntersectsNoTouch,
        SpatialOperator::Contains,
        SpatialOperator::Within,
        SpatialOperator::Touches,
        SpatialOperator::Overlaps,
        SpatialOperator::Crosses,
        SpatialOperator::Disjoint,
        SpatialOperator::Equals,
        SpatialOperator::Covers,
        SpatialOperator::CoveredBy,
    ];

    /// Explicit operator-to-engine mapping. Every operator is listed by name;
    /// nothing relies on declaration order.
    pub fn engine_predicate(self) -> EnginePredicate {
        match self {
            SpatialOperator::Intersects => EnginePredicate::Named("ST_Intersects"),
            SpatialOperator::IntersectsNoTouch => {
                EnginePredicate::Pattern(INTERIOR_INTERSECTS_PATTERN)
            }
            SpatialOperator::Contains => EnginePredicate::Named("ST_Contains"),
            SpatialOperator::Within => EnginePredicate::Named("ST_Within"),
            SpatialOperator::Touches => EnginePredicate::Named("ST_Touches"),
            SpatialOperator::Overlaps => EnginePredicate::Named("ST_Overlaps"),
            SpatialOperator::Crosses => EnginePredicate::Named("ST_Crosses"),
            SpatialOperator::Disjoint => EnginePredicate::Named("ST_Disjoint"),
            SpatialOperator::Equals => EnginePredicate::Named("ST_Equals"),
            SpatialOperator::Covers => EnginePredicate::Named("ST_Covers"),
            SpatialOperator::CoveredBy => EnginePredicate::Named("ST_CoveredBy"),
        }
    }

    /// Whether candidates can be narrowed by envelope overlap first. A
    /// disjoint geometry need not share any envelope with the operand.
    pub fn uses_envelope_filter(self) -> bool {
        !matches!(self, SpatialOperator::Disjoint)
    }

    /// Evaluates `lhs <op> rhs`.
    pub fn evaluate(self, lhs: &Geometry<f64>, rhs: &Geometry<f64>) -> bool {
        let matrix = lhs.relate(rhs);
        match self {
            SpatialOperator::Intersects => matrix.is_intersects(),
            SpatialOperator::IntersectsNoTouch => matrix
                .matches(INTERIOR_INTERSECTS_PATTERN)
                .unwrap_or(false),
            SpatialOperator::Contains => matrix.is_contains(),
            SpatialOperator::Within => matrix.is_within(),
            SpatialOperator::Touches => matrix.is_touches(),
            SpatialOperator::Overlaps => matrix.is_overlaps(),
            SpatialOperator::Crosses => matrix.is_crosses(),
            SpatialOperator::Disjoint => matrix.is_disjoint(),
            SpatialOperator::Equals => matrix.is_equal_topo(),
            SpatialOperator::Covers => matrix.is_covers(),
            SpatialOperator::CoveredBy => matrix.is_coveredby(),
        }
    }
}
