//! Groups, properties and matchers exchanged with callers.

use std::time::{SystemTime, UNIX_EPOCH};

use geo::Geometry;
use rusqlite::types::{Type, Value};
use rusqlite::Row;
use serde::{de::DeserializeOwned, Serialize};

use crate::encoding;
use crate::error::{Error, Result};
use crate::spatial::{self, SpatialOperator};

/// Identifier of a group. Never reused once purged.
pub type GroupId = i64;

/// Milliseconds since the Unix epoch
pub fn now_millis() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as i64)
        .unwrap_or(0)
}

/// The data-model category a group belongs to. In a query, `None` matches any value.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct DataModelCategory {
    pub source: Option<String>,
    pub family: Option<String>,
    pub category: Option<String>,
}

impl DataModelCategory {
    pub fn new(
        source: impl Into<String>,
        family: impl Into<String>,
        category: impl Into<String>,
    ) -> Self {
        Self {
            source: Some(source.into()),
            family: Some(family.into()),
            category: Some(category.into()),
        }
    }

    /// A category that matches everything
    pub fn any() -> Self {
        Self::default()
    }

    pub fn is_any(&self) -> bool {
        self.source.is_none() && self.family.is_none() && self.category.is_none()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PropertyType {
    Integer,
    Real,
    Text,
    Boolean,
    Blob,
    /// A serde value stored as bincode bytes
    Object,
    /// A `[start, end]` pair of epoch milliseconds
    TimeSpan,
    /// Stored as WKT, eligible for a spatial index
    Geometry,
}

impl PropertyType {
    /// Column type used for each physical column of this property
    pub fn sql_type(&self) -> &'static str {
        match self {
            PropertyType::Integer | PropertyType::Boolean | PropertyType::TimeSpan => "INTEGER",
            PropertyType::Real => "REAL",
            PropertyType::Text | PropertyType::Geometry => "TEXT",
            PropertyType::Blob | PropertyType::Object => "BLOB",
        }
    }

    pub fn is_geometry(&self) -> bool {
        matches!(self, PropertyType::Geometry)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyDescriptor {
    pub name: String,
    pub ty: PropertyType,
}

impl PropertyDescriptor {
    pub fn new(name: impl Into<String>, ty: PropertyType) -> Self {
        Self {
            name: name.into(),
            ty,
        }
    }

    /// Physical column names of this property in a data table
    pub fn columns(&self) -> Vec<String> {
        match self.ty {
            PropertyType::TimeSpan => vec![format!("{}_START", self.name), format!("{}_END", self.name)],
            _ => vec![self.name.clone()],
        }
    }

    /// Checks the name is usable as part of an identifier.
    pub fn validate(&self) -> Result<()> {
        let valid = !self.name.is_empty()
            && self
                .name
                .chars()
                .all(|c| c.is_ascii_alphanumeric() || c == '_');
        if valid {
            Ok(())
        } else {
            Err(Error::InvalidOperation(format!(
                "invalid property name {:?}",
                self.name
            )))
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    Null,
    Integer(i64),
    Real(f64),
    Text(String),
    Boolean(bool),
    Blob(Vec<u8>),
    Object(Vec<u8>),
    TimeSpan { start: i64, end: i64 },
    Geometry(Geometry<f64>),
}

impl PropertyValue {
    /// Serializes a complex value for an `Object` property.
    pub fn object<T: Serialize>(value: &T) -> Result<Self> {
        Ok(PropertyValue::Object(encoding::encode_object(value)?))
    }

    /// Deserializes an `Object` value. Returns `None` for other variants.
    pub fn decode_object<T: DeserializeOwned>(&self) -> Result<Option<T>> {
        match self {
            PropertyValue::Object(bytes) => encoding::decode_object(bytes).map(Some),
            _ => Ok(None),
        }
    }

    pub fn is_null(&self) -> bool {
        matches!(self, PropertyValue::Null)
    }

    /// Whether this value may be stored in a column of the given type
    pub fn fits(&self, ty: PropertyType) -> bool {
        matches!(
            (self, ty),
            (PropertyValue::Null, _)
                | (PropertyValue::Integer(_), PropertyType::Integer)
                | (PropertyValue::Integer(_), PropertyType::Real)
                | (PropertyValue::Real(_), PropertyType::Real)
                | (PropertyValue::Text(_), PropertyType::Text)
                | (PropertyValue::Boolean(_), PropertyType::Boolean)
                | (PropertyValue::Blob(_), PropertyType::Blob)
                | (PropertyValue::Object(_), PropertyType::Object)
                | (PropertyValue::TimeSpan { .. }, PropertyType::TimeSpan)
                | (PropertyValue::Geometry(_), PropertyType::Geometry)
        )
    }

    pub fn as_f64(&self) -> Option<f64> {
        match self {
            PropertyValue::Integer(v) => Some(*v as f64),
            PropertyValue::Real(v) => Some(*v),
            _ => None,
        }
    }

    /// Values bound to the physical columns of a property of type `ty`.
    pub(crate) fn to_sql(&self, ty: PropertyType) -> Result<Vec<Value>> {
        if !self.fits(ty) {
            return Err(Error::Encode(
                "property value",
                format!("{:?} does not fit a {:?} column", self, ty),
            ));
        }
        let values = match self {
            PropertyValue::Null if ty == PropertyType::TimeSpan => vec![Value::Null, Value::Null],
            PropertyValue::Null => vec![Value::Null],
            PropertyValue::Integer(v) if ty == PropertyType::Real => vec![Value::Real(*v as f64)],
            PropertyValue::Integer(v) => vec![Value::Integer(*v)],
            PropertyValue::Real(v) => vec![Value::Real(*v)],
            PropertyValue::Text(v) => vec![Value::Text(v.clone())],
            PropertyValue::Boolean(v) => vec![Value::Integer(*v as i64)],
            PropertyValue::Blob(v) | PropertyValue::Object(v) => vec![Value::Blob(v.clone())],
            PropertyValue::TimeSpan { start, end } => {
                vec![Value::Integer(*start), Value::Integer(*end)]
            }
            PropertyValue::Geometry(g) => vec![Value::Text(spatial::to_wkt(g))],
        };
        Ok(values)
    }

    /// Reads a property of type `ty` whose first column is at `idx`.
    pub(crate) fn read(row: &Row<'_>, idx: usize, ty: PropertyType) -> rusqlite::Result<Self> {
        let value = match ty {
            PropertyType::Integer => row.get::<_, Option<i64>>(idx)?.map(PropertyValue::Integer),
            PropertyType::Real => row.get::<_, Option<f64>>(idx)?.map(PropertyValue::Real),
            PropertyType::Text => row.get::<_, Option<String>>(idx)?.map(PropertyValue::Text),
            PropertyType::Boolean => row
                .get::<_, Option<i64>>(idx)?
                .map(|v| PropertyValue::Boolean(v != 0)),
            PropertyType::Blob => row.get::<_, Option<Vec<u8>>>(idx)?.map(PropertyValue::Blob),
            PropertyType::Object => row.get::<_, Option<Vec<u8>>>(idx)?.map(PropertyValue::Object),
            PropertyType::TimeSpan => {
                let start = row.get::<_, Option<i64>>(idx)?;
                let end = row.get::<_, Option<i64>>(idx + 1)?;
                start
                    .zip(end)
                    .map(|(start, end)| PropertyValue::TimeSpan { start, end })
            }
            PropertyType::Geometry => match row.get::<_, Option<String>>(idx)? {
                Some(text) => Some(PropertyValue::Geometry(spatial::parse_wkt(&text).map_err(
                    |e| rusqlite::Error::FromSqlConversionFailure(idx, Type::Text, Box::new(e)),
                )?)),
                None => None,
            },
        };
        Ok(value.unwrap_or(PropertyValue::Null))
    }
}

/// A predicate over one property, evaluated in SQL where possible.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyMatcher {
    Equals {
        property: String,
        value: PropertyValue,
    },
    /// Inclusive numeric range
    Range { property: String, min: f64, max: f64 },
    /// Overlap with the inclusive span `[start, end]`
    TimeOverlap {
        property: String,
        start: i64,
        end: i64,
    },
    Geometry {
        property: String,
        operator: SpatialOperator,
        operand: Geometry<f64>,
    },
}

impl PropertyMatcher {
    pub fn property(&self) -> &str {
        match self {
            PropertyMatcher::Equals { property, .. }
            | PropertyMatcher::Range { property, .. }
            | PropertyMatcher::TimeOverlap { property, .. }
            | PropertyMatcher::Geometry { property, .. } => property,
        }
    }

    /// In-process evaluation, used when a predicate was not pushed into SQL.
    pub fn accepts(&self, value: &PropertyValue) -> bool {
        match (self, value) {
            (PropertyMatcher::Equals { value: expected, .. }, actual) => expected == actual,
            (PropertyMatcher::Range { min, max, .. }, actual) => actual
                .as_f64()
                .map(|v| v >= *min && v <= *max)
                .unwrap_or(false),
            (
                PropertyMatcher::TimeOverlap { start, end, .. },
                PropertyValue::TimeSpan {
                    start: value_start,
                    end: value_end,
                },
            ) => value_start <= end && value_end >= start,
            (PropertyMatcher::TimeOverlap { start, end, .. }, PropertyValue::Integer(t)) => {
                t >= start && t <= end
            }
            (
                PropertyMatcher::Geometry {
                    operator, operand, ..
                },
                PropertyValue::Geometry(geometry),
            ) => operator.evaluate(geometry, operand),
            _ => false,
        }
    }
}

/// A batch of records to store under one category.
#[derive(Debug, Clone)]
pub struct Deposit {
    pub category: DataModelCategory,
    pub expiration: Option<i64>,
    pub critical: bool,
    pub interval_values: Vec<(String, PropertyValue)>,
    pub properties: Vec<PropertyDescriptor>,
    pub records: Vec<Vec<PropertyValue>>,
}

impl Deposit {
    pub fn new(category: DataModelCategory, properties: Vec<PropertyDescriptor>) -> Self {
        Self {
            category,
            expiration: None,
            critical: false,
            interval_values: Vec::new(),
            properties,
            records: Vec::new(),
        }
    }

    /// Expiration time in epoch milliseconds
    pub fn expiration(mut self, expiration: i64) -> Self {
        self.expiration = Some(expiration);
        self
    }

    /// Critical groups are never trimmed
    pub fn critical(mut self, critical: bool) -> Self {
        self.critical = critical;
        self
    }

    pub fn interval_value(mut self, name: impl Into<String>, value: PropertyValue) -> Self {
        self.interval_values.push((name.into(), value));
        self
    }

    pub fn record(mut self, values: Vec<PropertyValue>) -> Self {
        self.records.push(values);
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        for descriptor in &self.properties {
            descriptor.validate()?;
        }
        for (idx, record) in self.records.iter().enumerate() {
            if record.len() != self.properties.len() {
                return Err(Error::InvalidOperation(format!(
                    "record {} has {} values for {} properties",
                    idx,
                    record.len(),
                    self.properties.len()
                )));
            }
            for (value, descriptor) in record.iter().zip(&self.properties) {
                if !value.fits(descriptor.ty) {
                    return Err(Error::InvalidOperation(format!(
                        "record {} value for {} is not a {:?}",
                        idx, descriptor.name, descriptor.ty
                    )));
                }
            }
        }
        Ok(())
    }
}

/// Selects live groups by category and group-level interval values.
#[derive(Debug, Clone, Default)]
pub struct GroupQuery {
    pub category: DataModelCategory,
    pub matchers: Vec<PropertyMatcher>,
}

impl GroupQuery {
    pub fn new(category: DataModelCategory) -> Self {
        Self {
            category,
            matchers: Vec::new(),
        }
    }

    pub fn matcher(mut self, matcher: PropertyMatcher) -> Self {
        self.matchers.push(matcher);
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Record {
    pub id: i64,
    pub values: Vec<PropertyValue>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GroupValues {
    pub group_id: GroupId,
    pub records: Vec<Record>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use geo::{point, polygon};
    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Style {
        color: String,
        width: u32,
    }

    #[test]
    fn test_time_span_columns() {
        let d = PropertyDescriptor::new("valid", PropertyType::TimeSpan);
        assert_eq!(d.columns(), vec!["valid_START", "valid_END"]);
        let d = PropertyDescriptor::new("name", PropertyType::Text);
        assert_eq!(d.columns(), vec!["name"]);
    }

    #[test]
    fn test_invalid_property_name() {
        assert!(PropertyDescriptor::new("bad\"name", PropertyType::Text)
            .validate()
            .is_err());
        assert!(PropertyDescriptor::new("", PropertyType::Text).validate().is_err());
        assert!(PropertyDescriptor::new("ok_1", PropertyType::Text).validate().is_ok());
    }

    #[test]
    fn test_object_value() {
        let style = Style {
            color: "red".into(),
            width: 3,
        };
        let value = PropertyValue::object(&style).unwrap();
        assert!(value.fits(PropertyType::Object));
        assert_eq!(value.decode_object::<Style>().unwrap(), Some(style));
        assert_eq!(PropertyValue::Integer(1).decode_object::<Style>().unwrap(), None);
    }

    #[test]
    fn test_to_sql_rejects_mismatched_type() {
        assert!(PropertyValue::Text("x".into())
            .to_sql(PropertyType::Integer)
            .is_err());
        let span = PropertyValue::TimeSpan { start: 1, end: 2 };
        assert_eq!(span.to_sql(PropertyType::TimeSpan).unwrap().len(), 2);
        assert_eq!(
            PropertyValue::Null.to_sql(PropertyType::TimeSpan).unwrap().len(),
            2
        );
    }

    #[test]
    fn test_matcher_accepts() {
        let range = PropertyMatcher::Range {
            property: "depth".into(),
            min: 1.0,
            max: 5.0,
        };
        assert!(range.accepts(&PropertyValue::Integer(3)));
        assert!(!range.accepts(&PropertyValue::Real(5.5)));
        assert!(!range.accepts(&PropertyValue::Null));

        let overlap = PropertyMatcher::TimeOverlap {
            property: "valid".into(),
            start: 100,
            end: 200,
        };
        assert!(overlap.accepts(&PropertyValue::TimeSpan { start: 50, end: 100 }));
        assert!(!overlap.accepts(&PropertyValue::TimeSpan { start: 201, end: 300 }));

        let inside = PropertyMatcher::Geometry {
            property: "footprint".into(),
            operator: SpatialOperator::Intersects,
            operand: Geometry::Polygon(polygon![
                (x: 0.0, y: 0.0),
                (x: 10.0, y: 0.0),
                (x: 10.0, y: 10.0),
                (x: 0.0, y: 10.0),
            ]),
        };
        assert!(inside.accepts(&PropertyValue::Geometry(Geometry::Point(point!(x: 5.0, y: 5.0)))));
        assert!(!inside.accepts(&PropertyValue::Geometry(Geometry::Point(point!(x: 50.0, y: 5.0)))));
    }

    #[test]
    fn test_deposit_validation() {
        let props = vec![
            PropertyDescriptor::new("name", PropertyType::Text),
            PropertyDescriptor::new("depth", PropertyType::Real),
        ];
        let ok = Deposit::new(DataModelCategory::new("src", "fam", "cat"), props.clone())
            .record(vec![PropertyValue::Text("a".into()), PropertyValue::Integer(2)]);
        assert!(ok.validate().is_ok());

        let short = Deposit::new(DataModelCategory::any(), props.clone())
            .record(vec![PropertyValue::Text("a".into())]);
        assert!(short.validate().is_err());

        let wrong = Deposit::new(DataModelCategory::any(), props)
            .record(vec![PropertyValue::Integer(1), PropertyValue::Real(2.0)]);
        assert!(wrong.validate().is_err());
    }
}
