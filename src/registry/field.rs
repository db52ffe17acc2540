//! Column descriptors and their bind/scan adapters.
//!
//! [`FieldKind`] is the tagged variant every layer dispatches on. `bind`
//! turns a live value into exactly what the relational store will hold,
//! `scan` turns a stored value back into the live form an application
//! reads. Both are pure.

use std::sync::Arc;

use chrono::{NaiveDate, NaiveDateTime, Timelike};
use thiserror::Error;

use super::enums::Enum;
use crate::storage::ColumnType;
use crate::value::Value;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum BindError {
    #[error("column '{column}' does not accept {found} values")]
    WrongType { column: String, found: &'static str },
    #[error("column '{column}' is not nullable")]
    NotNullable { column: String },
    #[error("value {value} out of range for {bits}-bit column '{column}'")]
    OutOfRange { column: String, value: String, bits: u8 },
    #[error("value '{value}' is not part of enum '{code}' (column '{column}')")]
    InvalidEnumValue { column: String, code: String, value: String },
    #[error("value for column '{column}' exceeds {max} characters")]
    TooLong { column: String, max: usize },
    #[error("unknown column '{column}' in entity {entity}")]
    UnknownColumn { entity: String, column: String },
    #[error("invalid JSON in column '{column}': {reason}")]
    InvalidJson { column: String, reason: String },
}

#[derive(Debug, Clone, PartialEq)]
pub enum FieldKind {
    Id,
    Uint { bits: u8, nullable: bool },
    Int { bits: u8, nullable: bool },
    Reference { entity: String },
    Bool { nullable: bool },
    FakeDelete,
    Float { precision: i32, nullable: bool },
    Time { with_time: bool, nullable: bool },
    String { max_length: usize, required: bool },
    Enum { values: Arc<Enum>, required: bool },
    Set { values: Arc<Enum> },
    Bytes,
    Json,
}

impl FieldKind {
    /// Position of the kind's block in the column layout.
    #[must_use]
    pub fn layout_rank(&self) -> u8 {
        match self {
            FieldKind::Id | FieldKind::Uint { nullable: false, .. } => 0,
            FieldKind::Reference { .. } => 1,
            FieldKind::Int { nullable: false, .. } => 2,
            FieldKind::Bool { nullable: false } => 3,
            FieldKind::Float { nullable: false, .. } => 4,
            FieldKind::Time { with_time: true, nullable: false } => 5,
            FieldKind::Time { with_time: false, nullable: false } => 6,
            FieldKind::FakeDelete => 7,
            FieldKind::String { .. } => 8,
            FieldKind::Uint { nullable: true, .. } => 9,
            FieldKind::Int { nullable: true, .. } => 10,
            FieldKind::Enum { .. } => 11,
            FieldKind::Bytes => 12,
            FieldKind::Set { .. } => 13,
            FieldKind::Bool { nullable: true } => 14,
            FieldKind::Float { nullable: true, .. } => 15,
            FieldKind::Time { with_time: true, nullable: true } => 16,
            FieldKind::Time { with_time: false, nullable: true } => 17,
            FieldKind::Json => 18,
        }
    }

    #[must_use]
    pub fn column_type(&self) -> ColumnType {
        match self {
            FieldKind::Id | FieldKind::Uint { .. } | FieldKind::Reference { .. } => ColumnType::UnsignedInt,
            FieldKind::Int { .. } => ColumnType::SignedInt,
            FieldKind::Bool { .. } | FieldKind::FakeDelete => ColumnType::Bool,
            FieldKind::Float { .. } => ColumnType::Float,
            FieldKind::Time { with_time: true, .. } => ColumnType::DateTime,
            FieldKind::Time { with_time: false, .. } => ColumnType::Date,
            FieldKind::String { .. } | FieldKind::Enum { .. } | FieldKind::Set { .. } | FieldKind::Json => {
                ColumnType::Text
            }
            FieldKind::Bytes => ColumnType::Bytes,
        }
    }

    /// Stable short name used in the layout fingerprint.
    #[must_use]
    pub fn signature(&self) -> String {
        match self {
            FieldKind::Id => "id".into(),
            FieldKind::Uint { bits, nullable } => format!("u{bits}{}", if *nullable { "?" } else { "" }),
            FieldKind::Int { bits, nullable } => format!("i{bits}{}", if *nullable { "?" } else { "" }),
            FieldKind::Reference { entity } => format!("ref({entity})"),
            FieldKind::Bool { nullable } => format!("bool{}", if *nullable { "?" } else { "" }),
            FieldKind::FakeDelete => "fake_delete".into(),
            FieldKind::Float { precision, nullable } => {
                format!("f{precision}{}", if *nullable { "?" } else { "" })
            }
            FieldKind::Time { with_time, nullable } => format!(
                "{}{}",
                if *with_time { "datetime" } else { "date" },
                if *nullable { "?" } else { "" }
            ),
            FieldKind::String { max_length, .. } => format!("varchar({max_length})"),
            FieldKind::Enum { values, .. } => format!("enum({})", values.values().join(",")),
            FieldKind::Set { values } => format!("set({})", values.values().join(",")),
            FieldKind::Bytes => "blob".into(),
            FieldKind::Json => "json".into(),
        }
    }
}

/// `0001-01-01 00:00:00`, the zero value of a non-nullable time column.
fn zero_time() -> NaiveDateTime {
    NaiveDate::from_ymd_opt(1, 1, 1)
        .and_then(|d| d.and_hms_opt(0, 0, 0))
        .unwrap_or_default()
}

fn round_float(value: f64, precision: i32) -> f64 {
    let factor = 10f64.powi(precision);
    (value * factor).round() / factor
}

#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: String,
    pub kind: FieldKind,
}

impl Column {
    #[must_use]
    pub fn new(name: &str, kind: FieldKind) -> Self {
        Self {
            name: name.to_string(),
            kind,
        }
    }

    /// Live value of a freshly constructed entity.
    #[must_use]
    pub fn default_value(&self) -> Value {
        match &self.kind {
            FieldKind::Id => Value::Uint(0),
            FieldKind::Uint { nullable: false, .. } => Value::Uint(0),
            FieldKind::Int { nullable: false, .. } => Value::Int(0),
            FieldKind::Bool { nullable: false } | FieldKind::FakeDelete => Value::Bool(false),
            FieldKind::Float { nullable: false, .. } => Value::Float(0.0),
            FieldKind::Time { with_time: true, nullable: false } => Value::Time(zero_time()),
            FieldKind::Time { with_time: false, nullable: false } => Value::Date(zero_time().date()),
            FieldKind::String { .. } => Value::String(String::new()),
            FieldKind::Enum { values, required: true } => Value::String(values.default_value().to_string()),
            FieldKind::Enum { required: false, .. } => Value::String(String::new()),
            FieldKind::Set { .. } => Value::Set(Vec::new()),
            FieldKind::Json => Value::Json(serde_json::Value::Null),
            _ => Value::Null,
        }
    }

    fn wrong_type(&self, value: &Value) -> BindError {
        BindError::WrongType {
            column: self.name.clone(),
            found: value.kind(),
        }
    }

    fn not_nullable(&self) -> BindError {
        BindError::NotNullable {
            column: self.name.clone(),
        }
    }

    fn bind_unsigned(&self, value: &Value, bits: u8, nullable: bool) -> Result<Value, BindError> {
        let v = match value {
            Value::Null if nullable => return Ok(Value::Null),
            Value::Null => return Err(self.not_nullable()),
            Value::Uint(v) => *v,
            Value::Int(v) => u64::try_from(*v).map_err(|_| BindError::OutOfRange {
                column: self.name.clone(),
                value: v.to_string(),
                bits,
            })?,
            other => return Err(self.wrong_type(other)),
        };
        if bits < 64 && v >= (1u64 << bits) {
            return Err(BindError::OutOfRange {
                column: self.name.clone(),
                value: v.to_string(),
                bits,
            });
        }
        Ok(Value::Uint(v))
    }

    fn bind_signed(&self, value: &Value, bits: u8, nullable: bool) -> Result<Value, BindError> {
        let out_of_range = |v: String| BindError::OutOfRange {
            column: self.name.clone(),
            value: v,
            bits,
        };
        let v = match value {
            Value::Null if nullable => return Ok(Value::Null),
            Value::Null => return Err(self.not_nullable()),
            Value::Int(v) => *v,
            Value::Uint(v) => i64::try_from(*v).map_err(|_| out_of_range(v.to_string()))?,
            other => return Err(self.wrong_type(other)),
        };
        if bits < 64 {
            let max = (1i64 << (bits - 1)) - 1;
            let min = -(1i64 << (bits - 1));
            if v > max || v < min {
                return Err(out_of_range(v.to_string()));
            }
        }
        Ok(Value::Int(v))
    }

    fn bind_set(&self, values: &Enum, members: &[String]) -> Result<Value, BindError> {
        let mut indexed = Vec::with_capacity(members.len());
        for member in members {
            let idx = values.index(member).ok_or_else(|| BindError::InvalidEnumValue {
                column: self.name.clone(),
                code: values.code().to_string(),
                value: member.clone(),
            })?;
            indexed.push(idx);
        }
        indexed.sort_unstable();
        indexed.dedup();
        if indexed.is_empty() {
            return Ok(Value::Null);
        }
        Ok(Value::String(
            indexed
                .into_iter()
                .map(|i| values.values()[i].as_str())
                .collect::<Vec<_>>()
                .join(","),
        ))
    }

    /// Convert a live value into its stored representation.
    pub fn bind(&self, value: &Value) -> Result<Value, BindError> {
        match &self.kind {
            FieldKind::Id => self.bind_unsigned(value, 64, false),
            FieldKind::Uint { bits, nullable } => self.bind_unsigned(value, *bits, *nullable),
            FieldKind::Int { bits, nullable } => self.bind_signed(value, *bits, *nullable),
            FieldKind::Reference { .. } => match value {
                Value::Null | Value::Uint(0) => Ok(Value::Null),
                other => self.bind_unsigned(other, 64, true),
            },
            FieldKind::Bool { nullable } => match value {
                Value::Null if *nullable => Ok(Value::Null),
                Value::Null => Err(self.not_nullable()),
                Value::Bool(b) => Ok(Value::Bool(*b)),
                other => Err(self.wrong_type(other)),
            },
            FieldKind::FakeDelete => match value {
                Value::Bool(b) => Ok(Value::Bool(*b)),
                Value::Null => Ok(Value::Bool(false)),
                other => Err(self.wrong_type(other)),
            },
            FieldKind::Float { precision, nullable } => {
                let v = match value {
                    Value::Null if *nullable => return Ok(Value::Null),
                    Value::Null => return Err(self.not_nullable()),
                    Value::Float(v) => *v,
                    Value::Int(v) => *v as f64,
                    Value::Uint(v) => *v as f64,
                    other => return Err(self.wrong_type(other)),
                };
                Ok(Value::Float(round_float(v, *precision)))
            }
            FieldKind::Time { with_time, nullable } => {
                let time = match value {
                    Value::Null if *nullable => return Ok(Value::Null),
                    Value::Null => return Err(self.not_nullable()),
                    Value::Time(t) => *t,
                    Value::Date(d) => d.and_hms_opt(0, 0, 0).unwrap_or_default(),
                    other => return Err(self.wrong_type(other)),
                };
                if *with_time {
                    Ok(Value::Time(time.with_nanosecond(0).unwrap_or(time)))
                } else {
                    Ok(Value::Date(time.date()))
                }
            }
            FieldKind::String { max_length, required } => match value {
                Value::Null if *required => Ok(Value::String(String::new())),
                Value::Null => Ok(Value::Null),
                Value::String(s) if s.is_empty() && !*required => Ok(Value::Null),
                Value::String(s) => {
                    if s.chars().count() > *max_length {
                        return Err(BindError::TooLong {
                            column: self.name.clone(),
                            max: *max_length,
                        });
                    }
                    Ok(Value::String(s.clone()))
                }
                other => Err(self.wrong_type(other)),
            },
            FieldKind::Enum { values, required } => match value {
                Value::Null | Value::String(_) if value.as_str().map_or(true, str::is_empty) => {
                    if *required {
                        Ok(Value::String(values.default_value().to_string()))
                    } else {
                        Ok(Value::Null)
                    }
                }
                Value::String(s) if values.has(s) => Ok(Value::String(s.clone())),
                Value::String(s) => Err(BindError::InvalidEnumValue {
                    column: self.name.clone(),
                    code: values.code().to_string(),
                    value: s.clone(),
                }),
                other => Err(self.wrong_type(other)),
            },
            FieldKind::Set { values } => match value {
                Value::Null => Ok(Value::Null),
                Value::Set(members) => self.bind_set(values, members),
                Value::String(s) => {
                    let members: Vec<String> = s
                        .split(',')
                        .filter(|m| !m.is_empty())
                        .map(str::to_string)
                        .collect();
                    self.bind_set(values, &members)
                }
                other => Err(self.wrong_type(other)),
            },
            FieldKind::Bytes => match value {
                Value::Null => Ok(Value::Null),
                Value::Bytes(b) => Ok(Value::Bytes(b.clone())),
                other => Err(self.wrong_type(other)),
            },
            FieldKind::Json => match value {
                Value::Null | Value::Json(serde_json::Value::Null) => Ok(Value::Null),
                Value::Json(v) => Ok(Value::String(v.to_string())),
                Value::Set(items) => {
                    if items.is_empty() {
                        Ok(Value::Null)
                    } else {
                        Ok(Value::String(serde_json::Value::from(items.clone()).to_string()))
                    }
                }
                other => Err(self.wrong_type(other)),
            },
        }
    }

    /// Convert a stored value back into the live form.
    pub fn scan(&self, stored: &Value) -> Result<Value, BindError> {
        Ok(match (&self.kind, stored) {
            (FieldKind::String { .. } | FieldKind::Enum { .. }, Value::Null) => Value::String(String::new()),
            (FieldKind::Set { .. }, Value::Null) => Value::Set(Vec::new()),
            (FieldKind::Set { .. }, Value::String(s)) => {
                Value::Set(s.split(',').filter(|m| !m.is_empty()).map(str::to_string).collect())
            }
            (FieldKind::Json, Value::Null) => Value::Json(serde_json::Value::Null),
            (FieldKind::Json, Value::String(s)) => {
                Value::Json(serde_json::from_str(s).map_err(|e| BindError::InvalidJson {
                    column: self.name.clone(),
                    reason: e.to_string(),
                })?)
            }
            (FieldKind::FakeDelete, Value::Null) => Value::Bool(false),
            (FieldKind::Int { .. }, Value::Uint(v)) => Value::Int(*v as i64),
            (FieldKind::Uint { .. } | FieldKind::Id | FieldKind::Reference { .. }, Value::Int(v)) => {
                Value::Uint(*v as u64)
            }
            (_, other) => other.clone(),
        })
    }
}
