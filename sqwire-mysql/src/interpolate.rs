//! Client-side interpolation of `?` placeholders into SQL text
//!
//! The escape mode tracks the NO_BACKSLASH_ESCAPES status bit of the most
//! recent OK packet, so interpolation is only meaningful between
//! commands. A fresh connection uses backslash mode, the server default.
use chrono::{Datelike, Timelike};

use crate::dsn::TimeLocation;
use crate::error::{ErrorKind, Result};
use crate::value::Value;

/// Substitute one argument per `?` and escape everything that needs it.
///
/// The result is raw SQL bytes; blob arguments keep the output from being
/// valid utf-8. Fails with PacketTooLarge before issuing anything when the
/// accumulated query plus frame header would exceed the negotiated cap.
pub(crate) fn interpolate_params(
    query: &str,
    args: &[Value],
    no_backslash_escapes: bool,
    max_allowed: usize,
    loc: &TimeLocation,
) -> Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(query.len() + 32 * args.len());
    let bytes = query.as_bytes();
    let mut args_iter = args.iter();
    let mut i = 0;
    while i < bytes.len() {
        let Some(q) = bytes[i..].iter().position(|b| *b == b'?') else {
            buf.extend_from_slice(&bytes[i..]);
            break;
        };
        buf.extend_from_slice(&bytes[i..i + q]);
        i += q + 1;

        let Some(arg) = args_iter.next() else {
            return Err(ErrorKind::InterpolationFailed.into());
        };
        match arg {
            Value::Null => buf.extend_from_slice(b"NULL"),
            Value::Int(v) => buf.extend_from_slice(v.to_string().as_bytes()),
            Value::Double(v) => {
                if !v.is_finite() {
                    return Err(ErrorKind::UnsafeInterpolate.into());
                }
                buf.extend_from_slice(v.to_string().as_bytes());
            }
            Value::Bool(v) => buf.push(if *v { b'1' } else { b'0' }),
            Value::Time(t) => {
                if *t == Value::zero_time() {
                    buf.extend_from_slice(b"'0000-00-00'");
                } else {
                    // Round under a microsecond before formatting.
                    let n = loc.naive_from_utc(*t + chrono::Duration::nanoseconds(500));
                    buf.push(b'\'');
                    let mut s = format!(
                        "{:04}-{:02}-{:02} {:02}:{:02}:{:02}",
                        n.year(),
                        n.month(),
                        n.day(),
                        n.hour(),
                        n.minute(),
                        n.second()
                    );
                    let micro = n.nanosecond() / 1000;
                    if micro != 0 {
                        s.push_str(&format!(".{micro:06}"));
                    }
                    buf.extend_from_slice(s.as_bytes());
                    buf.push(b'\'');
                }
            }
            Value::Bytes(v) => {
                buf.extend_from_slice(b"_binary'");
                if no_backslash_escapes {
                    escape_bytes_quotes(&mut buf, v);
                } else {
                    escape_bytes_backslash(&mut buf, v);
                }
                buf.push(b'\'');
            }
            Value::Text(v) => {
                buf.push(b'\'');
                if no_backslash_escapes {
                    escape_bytes_quotes(&mut buf, v.as_bytes());
                } else {
                    escape_bytes_backslash(&mut buf, v.as_bytes());
                }
                buf.push(b'\'');
            }
        }

        if buf.len() + 4 > max_allowed {
            return Err(ErrorKind::PacketTooLarge.into());
        }
    }
    if args_iter.next().is_some() {
        return Err(ErrorKind::InterpolationFailed.into());
    }
    Ok(buf)
}

/// Backslash mode: the server interprets \-sequences inside strings
pub(crate) fn escape_bytes_backslash(buf: &mut Vec<u8>, v: &[u8]) {
    for &c in v {
        match c {
            0x00 => buf.extend_from_slice(b"\\0"),
            b'\n' => buf.extend_from_slice(b"\\n"),
            b'\r' => buf.extend_from_slice(b"\\r"),
            0x1A => buf.extend_from_slice(b"\\Z"),
            b'\'' => buf.extend_from_slice(b"\\'"),
            b'"' => buf.extend_from_slice(b"\\\""),
            b'\\' => buf.extend_from_slice(b"\\\\"),
            c => buf.push(c),
        }
    }
}

/// Quote-doubling mode, active under NO_BACKSLASH_ESCAPES
pub(crate) fn escape_bytes_quotes(buf: &mut Vec<u8>, v: &[u8]) {
    for &c in v {
        if c == b'\'' {
            buf.extend_from_slice(b"''");
        } else {
            buf.push(c);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::NaiveDate;

    fn interp(query: &str, args: &[Value]) -> Result<Vec<u8>> {
        interpolate_params(query, args, false, 1 << 24, &TimeLocation::Utc)
    }

    /// Naive reverse of the escape routines, for round-trip checks
    fn unescape(v: &[u8], backslash: bool) -> Vec<u8> {
        let mut out = Vec::new();
        let mut i = 0;
        while i < v.len() {
            if backslash && v[i] == b'\\' {
                out.push(match v[i + 1] {
                    b'0' => 0x00,
                    b'n' => b'\n',
                    b'r' => b'\r',
                    b'Z' => 0x1A,
                    c => c,
                });
                i += 2;
            } else if !backslash && v[i] == b'\'' {
                assert_eq!(v[i + 1], b'\'');
                out.push(b'\'');
                i += 2;
            } else {
                out.push(v[i]);
                i += 1;
            }
        }
        out
    }

    #[test]
    fn escape_round_trips() {
        let input: Vec<u8> = (0u8..=255).collect();

        let mut escaped = Vec::new();
        escape_bytes_backslash(&mut escaped, &input);
        assert_eq!(unescape(&escaped, true), input);
        // No raw quote characters survive outside escape sequences.
        let mut i = 0;
        while i < escaped.len() {
            if escaped[i] == b'\\' {
                i += 2;
                continue;
            }
            assert_ne!(escaped[i], b'\'');
            i += 1;
        }

        let mut escaped = Vec::new();
        escape_bytes_quotes(&mut escaped, &input);
        assert_eq!(unescape(&escaped, false), input);
    }

    #[test]
    fn basic_substitution() {
        let out = interp(
            "SELECT * FROM t WHERE a = ? AND b = ?",
            &[Value::Int(42), Value::Text("x".into())],
        )
        .unwrap();
        assert_eq!(out, b"SELECT * FROM t WHERE a = 42 AND b = 'x'");
    }

    #[test]
    fn argument_count_must_match() {
        let err = interp("SELECT ?", &[]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InterpolationFailed));

        let err = interp("SELECT 1", &[Value::Int(1)]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::InterpolationFailed));
    }

    #[test]
    fn non_finite_floats_are_refused() {
        let err = interp("SELECT ?", &[Value::Double(f64::NAN)]).unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::UnsafeInterpolate));
    }

    #[test]
    fn oversized_query_is_refused() {
        let err = interpolate_params(
            "SELECT ?",
            &[Value::Bytes(vec![b'x'; 128])],
            false,
            64,
            &TimeLocation::Utc,
        )
        .unwrap_err();
        assert!(matches!(err.kind(), ErrorKind::PacketTooLarge));
    }

    #[test]
    fn interpolates_all_supported_types() {
        let t = NaiveDate::from_ymd_opt(2015, 2, 8)
            .unwrap()
            .and_hms_micro_opt(17, 25, 42, 807015)
            .unwrap()
            .and_utc();
        let out = interp(
            "SELECT ?, ?, ?, ?, ?, ?, ?",
            &[
                Value::Int(42424242),
                Value::Double(3.14159265358979),
                Value::Bool(false),
                Value::Time(t),
                Value::Bytes(b"bytes containing ' \" \x07 \x00".to_vec()),
                Value::Text("string containing ' \" \x07 \x00".into()),
                Value::Null,
            ],
        )
        .unwrap();
        let mut expected = b"SELECT 42424242, 3.14159265358979, 0, ".to_vec();
        expected.extend_from_slice(b"'2015-02-08 17:25:42.807015', ");
        expected.extend_from_slice(b"_binary'bytes containing \\' \\\" \x07 \\0', ");
        expected.extend_from_slice(b"'string containing \\' \\\" \x07 \\0', NULL");
        assert_eq!(String::from_utf8_lossy(&out), String::from_utf8_lossy(&expected));

        // Three quoted strings at top level (timestamp, blob, text), with
        // all quote pairs closed.
        let naked_quotes = out
            .iter()
            .enumerate()
            .filter(|(i, b)| **b == b'\'' && (*i == 0 || out[i - 1] != b'\\'))
            .count();
        assert_eq!(naked_quotes, 6);
    }

    #[test]
    fn quote_doubling_mode() {
        let out = interpolate_params(
            "SELECT ?",
            &[Value::Text("it's".into())],
            true,
            1 << 24,
            &TimeLocation::Utc,
        )
        .unwrap();
        assert_eq!(out, b"SELECT 'it''s'");
    }
}
