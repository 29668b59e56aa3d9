//! Decoding of result set cells into values
use chrono::{DateTime, NaiveDate, NaiveDateTime, Utc};

use crate::constants::{column_flag, type_};
use crate::dsn::TimeLocation;
use crate::error::{ErrorKind, Result};
use crate::packet_parser::PacketParser;
use crate::rows::Column;
use crate::value::Value;

/// Per-connection settings the decoders consult
pub(crate) struct DecodeCtx<'a> {
    pub(crate) parse_time: bool,
    pub(crate) loc: &'a TimeLocation,
}

fn is_date_like(field_type: u8) -> bool {
    matches!(
        field_type,
        type_::TIMESTAMP | type_::DATETIME | type_::DATE | type_::NEW_DATE
    )
}

/// Decode a text-protocol row: one length-encoded string per column
pub(crate) fn decode_text_row(
    data: &[u8],
    columns: &[Column],
    ctx: &DecodeCtx,
    dest: &mut [Value],
) -> Result<()> {
    let mut p = PacketParser::new(data);
    for (i, c) in columns.iter().enumerate() {
        dest[i] = match p.get_nullable_lenenc_bytes()? {
            None => Value::Null,
            Some(v) if ctx.parse_time && is_date_like(c.field_type) => {
                Value::Time(parse_date_time(v, ctx.loc)?)
            }
            Some(v) => Value::Bytes(v.to_vec()),
        };
    }
    Ok(())
}

/// Decode a binary-protocol row.
///
/// `data` starts at the first value (the indicator byte and NULL bitmap
/// have been stripped); `null_mask` is the bitmap with its 2-bit offset.
pub(crate) fn decode_binary_row(
    data: &[u8],
    null_mask: &[u8],
    columns: &[Column],
    ctx: &DecodeCtx,
    dest: &mut [Value],
) -> Result<()> {
    let mut p = PacketParser::new(data);
    for (i, c) in columns.iter().enumerate() {
        if (null_mask[(i + 2) >> 3] >> ((i + 2) & 7)) & 1 == 1 {
            dest[i] = Value::Null;
            continue;
        }
        dest[i] = decode_binary_value(&mut p, c, ctx)?;
    }
    Ok(())
}

fn decode_binary_value(p: &mut PacketParser<'_>, c: &Column, ctx: &DecodeCtx) -> Result<Value> {
    let unsigned = c.flags & column_flag::UNSIGNED != 0;
    match c.field_type {
        type_::NULL => Ok(Value::Null),

        type_::TINY => {
            let v = p.get_u8()?;
            Ok(Value::Int(if unsigned { v.into() } else { (v as i8).into() }))
        }
        type_::SHORT | type_::YEAR => {
            let v = p.get_u16()?;
            Ok(Value::Int(if unsigned { v.into() } else { (v as i16).into() }))
        }
        type_::INT24 | type_::LONG => {
            let v = p.get_u32()?;
            Ok(Value::Int(if unsigned { v.into() } else { (v as i32).into() }))
        }
        type_::LONG_LONG => {
            let v = p.get_u64()?;
            if unsigned {
                if v > i64::MAX as u64 {
                    // No signed representation; hand back the decimal form.
                    Ok(Value::Bytes(v.to_string().into_bytes()))
                } else {
                    Ok(Value::Int(v as i64))
                }
            } else {
                Ok(Value::Int(v as i64))
            }
        }

        type_::FLOAT => Ok(Value::Double(p.get_f32()?.into())),
        type_::DOUBLE => Ok(Value::Double(p.get_f64()?)),

        type_::DECIMAL
        | type_::NEW_DECIMAL
        | type_::VAR_CHAR
        | type_::BIT
        | type_::ENUM
        | type_::SET
        | type_::TINY_BLOB
        | type_::MEDIUM_BLOB
        | type_::LONG_BLOB
        | type_::BLOB
        | type_::VAR_STRING
        | type_::STRING
        | type_::JSON
        | type_::GEOMETRY => Ok(match p.get_nullable_lenenc_bytes()? {
            Some(v) => Value::Bytes(v.to_vec()),
            None => Value::Null,
        }),

        type_::TIME => {
            let Some(len) = p.get_nullable_lenenc()? else {
                return Ok(Value::Null);
            };
            let src = p.get_bytes(len as usize)?;
            Ok(Value::Bytes(format_binary_time(src, c.decimals)?))
        }

        type_::DATE | type_::NEW_DATE | type_::TIMESTAMP | type_::DATETIME => {
            let Some(len) = p.get_nullable_lenenc()? else {
                return Ok(Value::Null);
            };
            let src = p.get_bytes(len as usize)?;
            if ctx.parse_time {
                Ok(Value::Time(parse_binary_date_time(src, ctx.loc)?))
            } else if c.field_type == type_::DATE || c.field_type == type_::NEW_DATE {
                Ok(Value::Bytes(format_binary_date(src)?))
            } else {
                Ok(Value::Bytes(format_binary_datetime(src, c.decimals)?))
            }
        }

        _ => Err(ErrorKind::MalformedPacket.into()),
    }
}

/// Fraction width for a column's declared decimal count.
///
/// 0x1F means "unspecified" and renders without a fraction; anything
/// outside 0..=6 is a protocol violation.
fn fraction_width(decimals: u8) -> Result<usize> {
    match decimals {
        0x00 | 0x1F => Ok(0),
        1..=6 => Ok(decimals as usize),
        _ => Err(ErrorKind::MalformedPacket.into()),
    }
}

fn push_fraction(s: &mut String, micro: u32, width: usize) {
    if width > 0 {
        s.push('.');
        let digits = format!("{micro:06}");
        s.push_str(&digits[..width]);
    }
}

/// Binary DATE: LEI length 0/4(/7/11), year + month + day
fn format_binary_date(src: &[u8]) -> Result<Vec<u8>> {
    if src.is_empty() {
        return Ok(b"0000-00-00".to_vec());
    }
    let mut p = PacketParser::new(src);
    match src.len() {
        4 | 7 | 11 => {
            let year = p.get_u16()?;
            let month = p.get_u8()?;
            let day = p.get_u8()?;
            Ok(format!("{year:04}-{month:02}-{day:02}").into_bytes())
        }
        _ => Err(ErrorKind::MalformedPacket.into()),
    }
}

/// Binary TIMESTAMP / DATETIME: LEI length 0/4/7/11
fn format_binary_datetime(src: &[u8], decimals: u8) -> Result<Vec<u8>> {
    let width = fraction_width(decimals)?;
    let mut s = String::with_capacity(20 + width);
    let mut p = PacketParser::new(src);
    match src.len() {
        0 => s.push_str("0000-00-00 00:00:00"),
        4 | 7 | 11 => {
            let year = p.get_u16()?;
            let month = p.get_u8()?;
            let day = p.get_u8()?;
            s.push_str(&format!("{year:04}-{month:02}-{day:02}"));
            let (hour, min, sec) = if src.len() > 4 {
                (p.get_u8()?, p.get_u8()?, p.get_u8()?)
            } else {
                (0, 0, 0)
            };
            s.push_str(&format!(" {hour:02}:{min:02}:{sec:02}"));
        }
        _ => return Err(ErrorKind::MalformedPacket.into()),
    }
    let micro = if src.len() == 11 {
        PacketParser::new(&src[7..]).get_u32()?
    } else {
        0
    };
    push_fraction(&mut s, micro, width);
    Ok(s.into_bytes())
}

/// Binary TIME: LEI length 0/8/12, sign + days + h/m/s [+ micro]
fn format_binary_time(src: &[u8], decimals: u8) -> Result<Vec<u8>> {
    let width = fraction_width(decimals)?;
    let mut s = String::with_capacity(10 + width);
    match src.len() {
        0 => s.push_str("00:00:00"),
        8 | 12 => {
            let mut p = PacketParser::new(src);
            if p.get_u8()? == 1 {
                s.push('-');
            }
            let days = p.get_u32()?;
            let hours = u64::from(days) * 24 + u64::from(p.get_u8()?);
            let min = p.get_u8()?;
            let sec = p.get_u8()?;
            s.push_str(&format!("{hours:02}:{min:02}:{sec:02}"));
            let micro = if src.len() == 12 { p.get_u32()? } else { 0 };
            push_fraction(&mut s, micro, width);
        }
        _ => return Err(ErrorKind::MalformedPacket.into()),
    }
    Ok(s.into_bytes())
}

/// Parse a binary DATE/DATETIME/TIMESTAMP payload into a timestamp
fn parse_binary_date_time(src: &[u8], loc: &TimeLocation) -> Result<DateTime<Utc>> {
    if src.is_empty() {
        return Ok(Value::zero_time());
    }
    let mut p = PacketParser::new(src);
    let (year, month, day) = match src.len() {
        4 | 7 | 11 => (p.get_u16()?, p.get_u8()?, p.get_u8()?),
        _ => return Err(ErrorKind::MalformedPacket.into()),
    };
    let date = NaiveDate::from_ymd_opt(year.into(), month.into(), day.into())
        .ok_or(ErrorKind::MalformedPacket)?;
    let time = if src.len() > 4 {
        let hour = p.get_u8()?;
        let min = p.get_u8()?;
        let sec = p.get_u8()?;
        let micro = if src.len() == 11 { p.get_u32()? } else { 0 };
        date.and_hms_micro_opt(hour.into(), min.into(), sec.into(), micro)
            .ok_or(ErrorKind::MalformedPacket)?
    } else {
        date.and_hms_opt(0, 0, 0).unwrap()
    };
    Ok(loc.utc_from_naive(time))
}

/// Parse a text-protocol date/time cell in the configured location.
///
/// Accepts `YYYY-MM-DD` and `YYYY-MM-DD HH:MM:SS[.fraction]`; the all-zero
/// date yields the zero timestamp.
pub(crate) fn parse_date_time(raw: &[u8], loc: &TimeLocation) -> Result<DateTime<Utc>> {
    let text = std::str::from_utf8(raw).map_err(|_| ErrorKind::MalformedPacket)?;
    if text.starts_with("0000-00-00") {
        return Ok(Value::zero_time());
    }
    let naive = if text.len() == 10 {
        NaiveDate::parse_from_str(text, "%Y-%m-%d")
            .map_err(|_| ErrorKind::MalformedPacket)?
            .and_hms_opt(0, 0, 0)
            .unwrap()
    } else {
        NaiveDateTime::parse_from_str(text, "%Y-%m-%d %H:%M:%S%.f")
            .map_err(|_| ErrorKind::MalformedPacket)?
    };
    Ok(loc.utc_from_naive(naive))
}
