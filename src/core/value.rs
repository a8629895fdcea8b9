//! Row values and their typing rules.
//!
//! A row is an ordered `Vec<Value>`; columns are addressed positionally and
//! channels carry a `name -> position` side map. Numeric operations lift
//! operand pairs along the promotion chain int -> long -> double; comparisons
//! follow SQL three-valued logic with respect to nulls.

use chrono::{NaiveDate, NaiveDateTime};

use crate::error::{BadValue, PipeError, PipeResult};

pub type Row = Vec<Value>;

#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    Null,
    Text(String),
    Int(i32),
    Uint(u32),
    Long(i64),
    Ulong(u64),
    Double(f64),
    Date(NaiveDate),
    DateTime(NaiveDateTime),
    TextList(Vec<String>),
}

/// Operand pair after numeric promotion.
enum NumPair {
    Long(i64, i64),
    Ulong(u64, u64),
    Double(f64, f64),
}

impl Value {
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    pub fn from_opt_text(v: Option<String>) -> Value {
        match v {
            Some(s) => Value::Text(s),
            None => Value::Null,
        }
    }

    /// The canonical text form used by device writers, hashing and concat.
    /// Null renders as the empty string.
    pub fn render(&self) -> String {
        match self {
            Value::Null => String::new(),
            Value::Text(s) => s.clone(),
            Value::Int(v) => v.to_string(),
            Value::Uint(v) => v.to_string(),
            Value::Long(v) => v.to_string(),
            Value::Ulong(v) => v.to_string(),
            Value::Double(v) => v.to_string(),
            Value::Date(v) => v.format("%Y-%m-%d").to_string(),
            Value::DateTime(v) => v.format("%Y-%m-%d %H:%M:%S").to_string(),
            Value::TextList(vs) => vs.join(","),
        }
    }

    /// Text view without allocation when the value already is text.
    pub fn as_text(&self) -> Option<&str> {
        match self {
            Value::Text(s) => Some(s),
            _ => None,
        }
    }

    /// Cast a raw string to the value kind named by an rdf type
    /// (`text`, `int`, `uint`, `long`, `ulong`, `double`, `date`,
    /// `datetime`). Unknown types are a configuration error.
    pub fn cast(raw: &str, rdf_type: &str) -> PipeResult<Value> {
        if raw.is_empty() {
            return Ok(Value::Null);
        }
        match rdf_type {
            "" | "text" | "string" => Ok(Value::Text(raw.to_string())),
            "int" | "integer" => raw
                .parse::<i32>()
                .map(Value::Int)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to int: {e}"))),
            "uint" => raw
                .parse::<u32>()
                .map(Value::Uint)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to uint: {e}"))),
            "long" => raw
                .parse::<i64>()
                .map(Value::Long)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to long: {e}"))),
            "ulong" => raw
                .parse::<u64>()
                .map(Value::Ulong)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to ulong: {e}"))),
            "double" => raw
                .parse::<f64>()
                .map(Value::Double)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to double: {e}"))),
            "date" => parse_date(raw)
                .map(Value::Date)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to date: {e}"))),
            "datetime" => parse_datetime(raw)
                .map(Value::DateTime)
                .map_err(|e| PipeError::config(format!("cannot cast '{raw}' to datetime: {e}"))),
            other => Err(PipeError::config(format!("unknown rdf type '{other}'"))),
        }
    }

    fn as_num_pair(&self, rhs: &Value) -> Option<NumPair> {
        use Value::*;
        let pair = match (self, rhs) {
            (Double(a), b) => NumPair::Double(*a, b.to_f64()?),
            (a, Double(b)) => NumPair::Double(a.to_f64()?, *b),
            (Ulong(a), Ulong(b)) => NumPair::Ulong(*a, *b),
            (Ulong(a), Uint(b)) => NumPair::Ulong(*a, *b as u64),
            (Uint(a), Ulong(b)) => NumPair::Ulong(*a as u64, *b),
            (a, b) => NumPair::Long(a.to_i64()?, b.to_i64()?),
        };
        Some(pair)
    }

    fn to_i64(&self) -> Option<i64> {
        match self {
            Value::Int(v) => Some(*v as i64),
            Value::Uint(v) => Some(*v as i64),
            Value::Long(v) => Some(*v),
            Value::Ulong(v) => i64::try_from(*v).ok(),
            _ => None,
        }
    }

    fn to_f64(&self) -> Option<f64> {
        match self {
            Value::Int(v) => Some(*v as f64),
            Value::Uint(v) => Some(*v as f64),
            Value::Long(v) => Some(*v as f64),
            Value::Ulong(v) => Some(*v as f64),
            Value::Double(v) => Some(*v),
            _ => None,
        }
    }

    /// Arithmetic; null operands propagate to null, non-numeric operands are
    /// a row-local error.
    pub fn arith(&self, op: ArithOp, rhs: &Value) -> Result<Value, BadValue> {
        if self.is_null() || rhs.is_null() {
            return Ok(Value::Null);
        }
        let pair = self
            .as_num_pair(rhs)
            .ok_or_else(|| BadValue::new(format!("non-numeric operand for {op:?}")))?;
        let out = match pair {
            NumPair::Long(a, b) => match op {
                ArithOp::Add => Value::Long(a.wrapping_add(b)),
                ArithOp::Sub => Value::Long(a.wrapping_sub(b)),
                ArithOp::Mul => Value::Long(a.wrapping_mul(b)),
                ArithOp::Div => {
                    if b == 0 {
                        return Err(BadValue::new("division by zero"));
                    }
                    Value::Long(a / b)
                }
            },
            NumPair::Ulong(a, b) => match op {
                ArithOp::Add => Value::Ulong(a.wrapping_add(b)),
                ArithOp::Sub => Value::Ulong(a.wrapping_sub(b)),
                ArithOp::Mul => Value::Ulong(a.wrapping_mul(b)),
                ArithOp::Div => {
                    if b == 0 {
                        return Err(BadValue::new("division by zero"));
                    }
                    Value::Ulong(a / b)
                }
            },
            NumPair::Double(a, b) => match op {
                ArithOp::Add => Value::Double(a + b),
                ArithOp::Sub => Value::Double(a - b),
                ArithOp::Mul => Value::Double(a * b),
                ArithOp::Div => Value::Double(a / b),
            },
        };
        Ok(out)
    }

    /// Three-valued comparison: None when either side is null (SQL unknown).
    pub fn compare(&self, rhs: &Value) -> Option<std::cmp::Ordering> {
        use std::cmp::Ordering;
        if self.is_null() || rhs.is_null() {
            return None;
        }
        if let Some(pair) = self.as_num_pair(rhs) {
            return match pair {
                NumPair::Long(a, b) => Some(a.cmp(&b)),
                NumPair::Ulong(a, b) => Some(a.cmp(&b)),
                NumPair::Double(a, b) => a.partial_cmp(&b),
            };
        }
        match (self, rhs) {
            (Value::Text(a), Value::Text(b)) => Some(a.cmp(b)),
            (Value::Date(a), Value::Date(b)) => Some(a.cmp(b)),
            (Value::DateTime(a), Value::DateTime(b)) => Some(a.cmp(b)),
            // mixed kinds compare through their text rendering
            _ => Some(self.render().cmp(&rhs.render())),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ArithOp {
    Add,
    Sub,
    Mul,
    Div,
}

const DATE_FORMATS: &[&str] = &["%Y-%m-%d", "%Y/%m/%d", "%m/%d/%Y", "%m-%d-%Y", "%Y%m%d"];

const DATETIME_FORMATS: &[&str] = &[
    "%Y-%m-%d %H:%M:%S",
    "%Y-%m-%dT%H:%M:%S",
    "%Y-%m-%d %H:%M:%S%.f",
    "%Y-%m-%dT%H:%M:%S%.f",
];

/// Parse a date trying the accepted formats in order.
pub fn parse_date(raw: &str) -> Result<NaiveDate, BadValue> {
    let raw = raw.trim();
    for fmt in DATE_FORMATS {
        if let Ok(d) = NaiveDate::parse_from_str(raw, fmt) {
            return Ok(d);
        }
    }
    // a datetime string also carries a valid date
    if let Ok(dt) = parse_datetime(raw) {
        return Ok(dt.date());
    }
    Err(BadValue::new(format!("invalid date '{raw}'")))
}

pub fn parse_datetime(raw: &str) -> Result<NaiveDateTime, BadValue> {
    let raw = raw.trim();
    for fmt in DATETIME_FORMATS {
        if let Ok(d) = NaiveDateTime::parse_from_str(raw, fmt) {
            return Ok(d);
        }
    }
    Err(BadValue::new(format!("invalid datetime '{raw}'")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cast_follows_rdf_type() {
        assert_eq!(Value::cast("12", "int").unwrap(), Value::Int(12));
        assert_eq!(Value::cast("", "int").unwrap(), Value::Null);
        assert_eq!(
            Value::cast("x", "text").unwrap(),
            Value::Text("x".to_string())
        );
        assert!(Value::cast("abc", "double").is_err());
        assert!(Value::cast("1", "no_such_type").is_err());
    }

    #[test]
    fn arithmetic_promotes_int_to_long_to_double() {
        let v = Value::Int(2).arith(ArithOp::Add, &Value::Long(3)).unwrap();
        assert_eq!(v, Value::Long(5));
        let v = Value::Int(2)
            .arith(ArithOp::Mul, &Value::Double(1.5))
            .unwrap();
        assert_eq!(v, Value::Double(3.0));
    }

    #[test]
    fn arithmetic_with_null_is_null() {
        let v = Value::Null.arith(ArithOp::Add, &Value::Int(1)).unwrap();
        assert_eq!(v, Value::Null);
    }

    #[test]
    fn comparison_with_null_is_unknown() {
        assert!(Value::Null.compare(&Value::Int(1)).is_none());
        assert_eq!(
            Value::Int(1).compare(&Value::Long(1)),
            Some(std::cmp::Ordering::Equal)
        );
    }

    #[test]
    fn date_parsing_accepts_common_layouts() {
        assert!(parse_date("2024-02-29").is_ok());
        assert!(parse_date("02/29/2024").is_ok());
        assert!(parse_date("20240229").is_ok());
        assert!(parse_date("not a date").is_err());
    }
}
