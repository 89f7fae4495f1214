// THEORY:
// The vector feature model. A `Feature` is a geometry plus a bag of typed
// attribute `Field`s; a layer declares its attributes up front as
// `FieldDefinition`s (name, type and, for strings, a maximum width). This is the
// shape detections take on their way to disk.

use crate::core_modules::geometry::{Point2, Polygon};
use chrono::{NaiveDate, NaiveTime};
use std::collections::BTreeMap;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FieldType {
    #[default]
    Unknown,
    Integer,
    Real,
    String,
    Date,
    Time,
}

impl fmt::Display for FieldType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            FieldType::Unknown => "unknown",
            FieldType::Integer => "integer",
            FieldType::Real => "real",
            FieldType::String => "string",
            FieldType::Date => "date",
            FieldType::Time => "time",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum GeometryType {
    #[default]
    Unknown,
    Point,
    Polygon,
}

impl fmt::Display for GeometryType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            GeometryType::Unknown => "unknown",
            GeometryType::Point => "point",
            GeometryType::Polygon => "polygon",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldValue {
    Null,
    Integer(i64),
    Real(f64),
    String(String),
    Date(NaiveDate),
    Time(NaiveTime),
}

/// A typed attribute value.
#[derive(Debug, Clone, PartialEq)]
pub struct Field {
    pub field_type: FieldType,
    pub value: FieldValue,
}

impl Field {
    pub fn integer(value: i64) -> Self {
        Self { field_type: FieldType::Integer, value: FieldValue::Integer(value) }
    }

    pub fn real(value: f64) -> Self {
        Self { field_type: FieldType::Real, value: FieldValue::Real(value) }
    }

    pub fn string(value: impl Into<String>) -> Self {
        Self { field_type: FieldType::String, value: FieldValue::String(value.into()) }
    }

    pub fn date(value: NaiveDate) -> Self {
        Self { field_type: FieldType::Date, value: FieldValue::Date(value) }
    }

    pub fn time(value: NaiveTime) -> Self {
        Self { field_type: FieldType::Time, value: FieldValue::Time(value) }
    }

    /// A missing value of the given type.
    pub fn null(field_type: FieldType) -> Self {
        Self { field_type, value: FieldValue::Null }
    }
}

pub type Fields = BTreeMap<String, Field>;

/// Declares one attribute of a layer. `width` limits string values, 0 means unlimited.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldDefinition {
    pub field_type: FieldType,
    pub name: String,
    pub width: usize,
}

impl FieldDefinition {
    pub fn new(field_type: FieldType, name: impl Into<String>) -> Self {
        Self { field_type, name: name.into(), width: 0 }
    }

    pub fn with_width(field_type: FieldType, name: impl Into<String>, width: usize) -> Self {
        Self { field_type, name: name.into(), width }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Geometry {
    Point(Point2),
    Polygon(Polygon),
}

impl Geometry {
    pub fn geometry_type(&self) -> GeometryType {
        match self {
            Geometry::Point(_) => GeometryType::Point,
            Geometry::Polygon(_) => GeometryType::Polygon,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Feature {
    pub geometry: Geometry,
    pub fields: Fields,
}

impl Feature {
    pub fn new(geometry: Geometry, fields: Fields) -> Self {
        Self { geometry, fields }
    }

    pub fn geometry_type(&self) -> GeometryType {
        self.geometry.geometry_type()
    }
}
