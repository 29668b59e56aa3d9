//! Dynamic values passed to queries and returned from result sets
use chrono::{DateTime, Datelike, NaiveDate, Timelike, Utc};

use crate::constants::type_;
use crate::dsn::TimeLocation;
use crate::framing::PacketBuf;

/// A single query argument or result cell.
///
/// Result rows decode integers into [Value::Int], floats into
/// [Value::Double] and everything else into [Value::Bytes], except
/// date/time columns which become [Value::Time] when `parseTime` is set.
/// An unsigned BIGINT above `i64::MAX` is surfaced as its decimal string.
#[derive(Debug, Clone, PartialEq)]
pub enum Value {
    /// SQL NULL
    Null,
    /// Any integer
    Int(i64),
    /// Any float
    Double(f64),
    /// Boolean, rendered as 1 / 0
    Bool(bool),
    /// Raw bytes; interpolated with a `_binary` prefix
    Bytes(Vec<u8>),
    /// Text
    Text(String),
    /// A point in time; the all-zero timestamp is [Value::zero_time]
    Time(DateTime<Utc>),
}

impl Value {
    /// True for SQL NULL
    pub fn is_null(&self) -> bool {
        matches!(self, Value::Null)
    }

    /// The representation of MySQL's all-zero `0000-00-00 00:00:00`
    pub fn zero_time() -> DateTime<Utc> {
        NaiveDate::from_ymd_opt(0, 1, 1)
            .unwrap()
            .and_hms_opt(0, 0, 0)
            .unwrap()
            .and_utc()
    }

    /// Field type byte for the execute packet's type pairs
    pub(crate) fn binary_type(&self) -> u8 {
        match self {
            Value::Null => type_::NULL,
            Value::Int(_) => type_::LONG_LONG,
            Value::Double(_) => type_::DOUBLE,
            Value::Bool(_) => type_::TINY,
            Value::Bytes(_) | Value::Text(_) | Value::Time(_) => type_::STRING,
        }
    }

    /// The blob view of values eligible for COM_STMT_SEND_LONG_DATA
    pub(crate) fn as_blob(&self) -> Option<&[u8]> {
        match self {
            Value::Bytes(v) => Some(v),
            Value::Text(v) => Some(v.as_bytes()),
            _ => None,
        }
    }

    /// Append the binary-protocol encoding of a non-NULL value.
    ///
    /// Values already shipped via send-long-data must not be passed here.
    pub(crate) fn write_binary(&self, buf: &mut PacketBuf, loc: &TimeLocation) {
        match self {
            Value::Null => {}
            Value::Int(v) => buf.put_i64(*v),
            Value::Double(v) => buf.put_f64(*v),
            Value::Bool(v) => buf.put_u8(*v as u8),
            Value::Bytes(v) => {
                buf.put_lenenc(v.len() as u64);
                buf.put_slice(v);
            }
            Value::Text(v) => {
                buf.put_lenenc(v.len() as u64);
                buf.put_slice(v.as_bytes());
            }
            Value::Time(t) => {
                let s = format_time_arg(*t, loc);
                buf.put_lenenc(s.len() as u64);
                buf.put_slice(s.as_bytes());
            }
        }
    }
}

/// Render a timestamp argument the way the server expects it as a string,
/// localized and with a trailing-zero-trimmed fraction
fn format_time_arg(t: DateTime<Utc>, loc: &TimeLocation) -> String {
    if t == Value::zero_time() {
        return "0000-00-00".to_string();
    }
    let n = loc.naive_from_utc(t);
    let mut s = format!(
        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
        n.year(),
        n.month(),
        n.day(),
        n.hour(),
        n.minute(),
        n.second()
    );
    let micro = n.and_utc().timestamp_subsec_micros();
    if micro != 0 {
        s.push_str(format!(".{micro:06}").trim_end_matches('0'));
    }
    s
}

impl From<i64> for Value {
    fn from(v: i64) -> Self {
        Value::Int(v)
    }
}

impl From<i32> for Value {
    fn from(v: i32) -> Self {
        Value::Int(v.into())
    }
}

impl From<u32> for Value {
    fn from(v: u32) -> Self {
        Value::Int(v.into())
    }
}

impl From<f64> for Value {
    fn from(v: f64) -> Self {
        Value::Double(v)
    }
}

impl From<bool> for Value {
    fn from(v: bool) -> Self {
        Value::Bool(v)
    }
}

impl From<&str> for Value {
    fn from(v: &str) -> Self {
        Value::Text(v.to_string())
    }
}

impl From<String> for Value {
    fn from(v: String) -> Self {
        Value::Text(v)
    }
}

impl From<&[u8]> for Value {
    fn from(v: &[u8]) -> Self {
        Value::Bytes(v.to_vec())
    }
}

impl From<Vec<u8>> for Value {
    fn from(v: Vec<u8>) -> Self {
        Value::Bytes(v)
    }
}

impl From<DateTime<Utc>> for Value {
    fn from(v: DateTime<Utc>) -> Self {
        Value::Time(v)
    }
}

impl<T: Into<Value>> From<Option<T>> for Value {
    fn from(v: Option<T>) -> Self {
        match v {
            Some(v) => v.into(),
            None => Value::Null,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn time_arg_formatting() {
        let t = NaiveDate::from_ymd_opt(2015, 2, 8)
            .unwrap()
            .and_hms_micro_opt(17, 25, 42, 807015)
            .unwrap()
            .and_utc();
        assert_eq!(
            format_time_arg(t, &TimeLocation::Utc),
            "2015-02-08 17:25:42.807015"
        );

        let whole = NaiveDate::from_ymd_opt(2015, 2, 8)
            .unwrap()
            .and_hms_opt(17, 25, 42)
            .unwrap()
            .and_utc();
        assert_eq!(format_time_arg(whole, &TimeLocation::Utc), "2015-02-08 17:25:42");

        assert_eq!(format_time_arg(Value::zero_time(), &TimeLocation::Utc), "0000-00-00");
    }

    #[test]
    fn trailing_fraction_zeros_are_trimmed() {
        let t = NaiveDate::from_ymd_opt(2020, 1, 1)
            .unwrap()
            .and_hms_micro_opt(0, 0, 0, 500000)
            .unwrap()
            .and_utc();
        assert_eq!(format_time_arg(t, &TimeLocation::Utc), "2020-01-01 00:00:00.5");
    }
}
