//! Turns property matchers into SQL fragments.
//!
//! Group-level matchers run against the interval tables in one of two shapes.
//! When the query already joins `GROUPS` (it filters on category) each matcher
//! becomes an `INNER JOIN` keyed on the group id. Otherwise each becomes a
//! `SELECT` of group ids and the results are intersected. Record-level
//! matchers become plain `WHERE` conditions on a data table.
//!
//! Geometry matchers compile to calls into the spatial SQL functions, narrowed
//! by the R*Tree support table where the column is indexed. A compiler built
//! with [`PredicateCompiler::generic`] never emits geometry SQL and defers
//! those matchers to in-process evaluation instead.

use geo::Geometry;

use crate::error::{Error, Result};
use crate::model::{PropertyDescriptor, PropertyMatcher};
use crate::spatial::{self, coordinator::rtree_table, EnginePredicate, SpatialOperator};
use crate::sql::{self, quote_ident, quote_literal, GROUPS_TABLE, GROUP_ID};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryShape {
    /// The query already joins the group table
    Join,
    /// Standalone id sets intersected with each other
    Intersect,
}

#[derive(Debug, Default)]
pub struct CompiledPredicates {
    /// Join clauses, id subqueries or `WHERE` conditions, depending on what
    /// was compiled
    pub fragments: Vec<String>,
    /// Matchers with no SQL form, to be evaluated in process
    pub deferred: Vec<PropertyMatcher>,
}

#[derive(Debug, Clone)]
pub struct PredicateCompiler {
    schema: String,
    spatial: bool,
}

impl PredicateCompiler {
    pub fn generic() -> Self {
        Self {
            schema: "main".to_string(),
            spatial: false,
        }
    }

    pub fn spatial() -> Self {
        Self {
            schema: "main".to_string(),
            spatial: true,
        }
    }

    pub fn with_schema(mut self, schema: impl Into<String>) -> Self {
        self.schema = schema.into();
        self
    }

    pub fn is_spatial(&self) -> bool {
        self.spatial
    }

    fn qualified(&self, table: &str) -> String {
        format!("{}.{}", quote_ident(&self.schema), quote_ident(table))
    }

    /// Compiles group-level matchers against the configured interval tables.
    pub fn compile_group(
        &self,
        matchers: &[PropertyMatcher],
        intervals: &[PropertyDescriptor],
        shape: QueryShape,
    ) -> Result<CompiledPredicates> {
        let mut compiled = CompiledPredicates::default();
        let groups_key = format!("{}.{}", quote_ident(GROUPS_TABLE), quote_ident(GROUP_ID));

        for (idx, matcher) in matchers.iter().enumerate() {
            let descriptor = intervals
                .iter()
                .find(|d| d.name == matcher.property())
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "{} is not a group interval property",
                        matcher.property()
                    ))
                })?;
            let table = sql::interval_table(&descriptor.name);
            let alias = format!("M{}", idx);

            let fragment = match matcher {
                PropertyMatcher::Geometry { operator, operand, .. } => {
                    if !self.spatial || !descriptor.ty.is_geometry() {
                        compiled.deferred.push(matcher.clone());
                        continue;
                    }
                    let subquery = self.spatial_query(&table, "VALUE", *operator, operand);
                    match shape {
                        QueryShape::Join => format!(
                            "INNER JOIN ({}) AS {a} ON {a}.\"id\" = {}",
                            subquery,
                            groups_key,
                            a = quote_ident(&alias)
                        ),
                        QueryShape::Intersect => format!("SELECT \"id\" FROM ({})", subquery),
                    }
                }
                _ => {
                    let columns = sql::interval_columns(descriptor.ty);
                    let condition = match sql::matcher_condition(&alias, &columns, matcher) {
                        Some(condition) => condition,
                        None => {
                            compiled.deferred.push(matcher.clone());
                            continue;
                        }
                    };
                    match shape {
                        QueryShape::Join => format!(
                            "INNER JOIN {} AS {a} ON {a}.{} = {} AND {}",
                            self.qualified(&table),
                            quote_ident(GROUP_ID),
                            groups_key,
                            condition,
                            a = quote_ident(&alias)
                        ),
                        QueryShape::Intersect => format!(
                            "SELECT {a}.{} FROM {} AS {a} WHERE {}",
                            quote_ident(GROUP_ID),
                            self.qualified(&table),
                            condition,
                            a = quote_ident(&alias)
                        ),
                    }
                }
            };
            compiled.fragments.push(fragment);
        }
        Ok(compiled)
    }

    /// Compiles record-level matchers into `WHERE` conditions on `table`,
    /// aliased as `alias`. `present` lists the columns the table actually
    /// has; matchers on missing columns are deferred. `indexed` is the
    /// table's R*Tree-indexed geometry column, if any.
    pub fn compile_records(
        &self,
        table: &str,
        alias: &str,
        properties: &[PropertyDescriptor],
        present: &[String],
        indexed: Option<&str>,
        matchers: &[PropertyMatcher],
    ) -> Result<CompiledPredicates> {
        let mut compiled = CompiledPredicates::default();

        for matcher in matchers {
            let descriptor = properties
                .iter()
                .find(|d| d.name == matcher.property())
                .ok_or_else(|| {
                    Error::InvalidOperation(format!(
                        "matcher on {} which was not requested",
                        matcher.property()
                    ))
                })?;
            let columns = descriptor.columns();
            if !columns.iter().all(|c| present.contains(c)) {
                compiled.deferred.push(matcher.clone());
                continue;
            }

            let condition = match matcher {
                PropertyMatcher::Geometry { operator, operand, .. }
                    if self.spatial && descriptor.ty.is_geometry() =>
                {
                    if indexed == Some(descriptor.name.as_str()) {
                        Some(format!(
                            "{}.{} IN ({})",
                            quote_ident(alias),
                            quote_ident(sql::RECORD_ID),
                            self.spatial_query(table, &descriptor.name, *operator, operand)
                        ))
                    } else {
                        let column = format!("{}.{}", quote_ident(alias), quote_ident(&descriptor.name));
                        Some(predicate_expression(&column, *operator, operand))
                    }
                }
                PropertyMatcher::Geometry { .. } => None,
                _ => sql::matcher_condition(alias, &columns, matcher),
            };
            match condition {
                Some(condition) => compiled.fragments.push(condition),
                None => compiled.deferred.push(matcher.clone()),
            }
        }
        Ok(compiled)
    }

    /// Row ids of `table` whose `column` satisfies `<column> <operator>
    /// <operand>`, as a subquery selecting `"id"`. Candidates come from the
    /// R*Tree support table, narrowed by envelope when the operator allows.
    pub fn spatial_query(
        &self,
        table: &str,
        column: &str,
        operator: SpatialOperator,
        operand: &Geometry<f64>,
    ) -> String {
        let column_expr = format!("\"S\".{}", quote_ident(column));
        let mut conditions = Vec::new();
        if operator.uses_envelope_filter() {
            match spatial::envelope(operand) {
                Some(rect) => conditions.push(format!(
                    "\"R\".\"max_x\" >= {:?} AND \"R\".\"min_x\" <= {:?} AND \"R\".\"max_y\" >= {:?} AND \"R\".\"min_y\" <= {:?}",
                    rect.min().x,
                    rect.max().x,
                    rect.min().y,
                    rect.max().y
                )),
                None => conditions.push("0".to_string()),
            }
        }
        conditions.push(predicate_expression(&column_expr, operator, operand));

        format!(
            "SELECT \"R\".\"id\" AS \"id\" FROM {} AS \"R\" JOIN {} AS \"S\" ON \"S\".\"rowid\" = \"R\".\"id\" WHERE {}",
            self.qualified(&rtree_table(table)),
            self.qualified(table),
            conditions.join(" AND ")
        )
    }
}

/// `<column> <operator> <operand>` as a call into the spatial SQL functions.
pub fn predicate_expression(column: &str, operator: SpatialOperator, operand: &Geometry<f64>) -> String {
    let operand = format!("ST_GeomFromText({})", quote_literal(&spatial::to_wkt(operand)));
    match operator.engine_predicate() {
        EnginePredicate::Named(name) => format!("{}({}, {})", name, column, operand),
        EnginePredicate::Pattern(pattern) => {
            format!("ST_Relate({}, {}, {})", column, operand, quote_literal(pattern))
        }
    }
}
