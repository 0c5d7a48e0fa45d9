//! Semantic data types and literal values.

use std::fmt;

use serde::{Deserialize, Serialize};

/// The declared type of a concept.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DataType {
    String,
    Integer,
    BigInt,
    Float,
    Numeric { precision: u8, scale: u8 },
    Bool,
    Date,
    Datetime,
    Timestamp,
    List(Box<DataType>),
    Struct(Vec<(String, DataType)>),
    Map {
        key: Box<DataType>,
        value: Box<DataType>,
    },
    #[default]
    Unknown,
}

impl DataType {
    pub fn list(inner: DataType) -> Self {
        DataType::List(Box::new(inner))
    }

    pub fn is_numeric(&self) -> bool {
        matches!(
            self,
            DataType::Integer | DataType::BigInt | DataType::Float | DataType::Numeric { .. }
        )
    }

    /// The element type of a list, used when unnesting.
    pub fn element_type(&self) -> DataType {
        match self {
            DataType::List(inner) => (**inner).clone(),
            other => other.clone(),
        }
    }

    /// Whether two types can be compared without an explicit cast.
    pub fn is_comparable_with(&self, other: &DataType) -> bool {
        if self == other || *self == DataType::Unknown || *other == DataType::Unknown {
            return true;
        }
        if self.is_numeric() && other.is_numeric() {
            return true;
        }
        matches!(
            (self, other),
            (
                DataType::Date | DataType::Datetime | DataType::Timestamp | DataType::String,
                DataType::Date | DataType::Datetime | DataType::Timestamp | DataType::String
            )
        ) || matches!((self, other), (DataType::List(inner), o) | (o, DataType::List(inner)) if inner.is_comparable_with(o))
    }
}

impl fmt::Display for DataType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DataType::String => write!(f, "string"),
            DataType::Integer => write!(f, "int"),
            DataType::BigInt => write!(f, "bigint"),
            DataType::Float => write!(f, "float"),
            DataType::Numeric { precision, scale } => write!(f, "numeric({},{})", precision, scale),
            DataType::Bool => write!(f, "bool"),
            DataType::Date => write!(f, "date"),
            DataType::Datetime => write!(f, "datetime"),
            DataType::Timestamp => write!(f, "timestamp"),
            DataType::List(inner) => write!(f, "list<{}>", inner),
            DataType::Struct(fields) => {
                write!(f, "struct<")?;
                for (i, (name, dt)) in fields.iter().enumerate() {
                    if i > 0 {
                        write!(f, ",")?;
                    }
                    write!(f, "{}:{}", name, dt)?;
                }
                write!(f, ">")
            }
            DataType::Map { key, value } => write!(f, "map<{},{}>", key, value),
            DataType::Unknown => write!(f, "unknown"),
        }
    }
}

/// A literal value appearing in an expression.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Literal {
    Null,
    Bool(bool),
    Int(i64),
    Float(f64),
    String(String),
}

impl Literal {
    pub fn datatype(&self) -> DataType {
        match self {
            Literal::Null => DataType::Unknown,
            Literal::Bool(_) => DataType::Bool,
            Literal::Int(_) => DataType::Integer,
            Literal::Float(_) => DataType::Float,
            Literal::String(_) => DataType::String,
        }
    }
}

impl fmt::Display for Literal {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Literal::Null => write!(f, "null"),
            Literal::Bool(b) => write!(f, "{}", b),
            Literal::Int(i) => write!(f, "{}", i),
            Literal::Float(v) => write!(f, "{}", v),
            Literal::String(s) => write!(f, "'{}'", s),
        }
    }
}

impl From<i64> for Literal {
    fn from(v: i64) -> Self {
        Literal::Int(v)
    }
}

impl From<i32> for Literal {
    fn from(v: i32) -> Self {
        Literal::Int(v as i64)
    }
}

impl From<f64> for Literal {
    fn from(v: f64) -> Self {
        Literal::Float(v)
    }
}

impl From<bool> for Literal {
    fn from(v: bool) -> Self {
        Literal::Bool(v)
    }
}

impl From<&str> for Literal {
    fn from(v: &str) -> Self {
        Literal::String(v.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_comparable_types() {
        assert!(DataType::Integer.is_comparable_with(&DataType::Float));
        assert!(DataType::Date.is_comparable_with(&DataType::String));
        assert!(!DataType::Bool.is_comparable_with(&DataType::Integer));
        assert!(DataType::list(DataType::Integer).is_comparable_with(&DataType::BigInt));
    }

    #[test]
    fn test_display() {
        assert_eq!(DataType::Numeric { precision: 12, scale: 2 }.to_string(), "numeric(12,2)");
        assert_eq!(DataType::list(DataType::String).to_string(), "list<string>");
        assert_eq!(Literal::from("a").to_string(), "'a'");
    }
}
